// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = archiveserver::Opts::parse().into_config()?;
    archiveserver::log::init_log(config.log)?;
    archiveserver::run_server(config).await
}
