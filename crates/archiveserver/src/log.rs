// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Setup for `tracing` logging

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::Layer,
    prelude::*,
};

/// Log our own events at `debug` (with `--log`) or `info`, and dependencies' at `warn`.
///
/// `RUST_LOG` overrides this entirely when set.
pub fn init_log(verbose: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directives(verbose))?,
    };

    let layer = Layer::new().with_target(false).with_ansi(false);
    tracing_subscriber::registry()
        .with(layer.with_writer(std::io::stderr).with_filter(filter))
        .try_init()?;

    info!("Logging initialized (verbose: {verbose})");
    Ok(())
}

fn default_directives(verbose: bool) -> String {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    format!("{},archiveserver={level}", LevelFilter::WARN)
}
