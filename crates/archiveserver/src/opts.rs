// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{crate_version, Args, Parser};
use serde::Deserialize;

use crate::producer::ArchiverCommand;

const KIB: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(kib) => kib,
    None => unreachable!(),
};

const DEFAULT_CHUNK_KB_SIZE: NonZeroUsize = match NonZeroUsize::new(500) {
    Some(size) => size,
    None => unreachable!(),
};

#[derive(Debug, Parser)]
#[clap(
    name = "archiveserver",
    about = "Streams photo directories to browsers as ZIP archives",
    version = crate_version!()
)]
pub struct Opts {
    #[arg(
        long,
        env = "ARCHIVESERVER_CFG_PATH",
        help = "The path to a server config TOML, used instead of the other options",
        exclusive = true
    )]
    pub cfg_path: Option<PathBuf>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Clone, Debug, Args, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[clap(
        long,
        help = "Enable debug logging",
        env = "ARCHIVESERVER_LOG",
        default_value_t = false
    )]
    #[serde(default)]
    pub log: bool,

    #[clap(
        long,
        help = "Delay between sending archive chunks, in seconds",
        value_parser = parse_delay,
        default_value_t = Config::default_delay(),
        env = "ARCHIVESERVER_DELAY"
    )]
    #[serde(default = "Config::default_delay")]
    pub delay: f64,

    #[clap(
        long,
        alias = "photos_dir",
        help = "Directory holding one subdirectory of photos per archive",
        default_value_os_t = Config::default_photos_dir(),
        env = "ARCHIVESERVER_PHOTOS_DIR"
    )]
    #[serde(default = "Config::default_photos_dir")]
    pub photos_dir: PathBuf,

    #[clap(
        long,
        help = "Size of the chunks the archive is sent in, in KiB",
        default_value_t = Config::default_chunk_kb_size(),
        env = "ARCHIVESERVER_CHUNK_KB_SIZE"
    )]
    #[serde(default = "Config::default_chunk_kb_size")]
    pub chunk_kb_size: NonZeroUsize,

    #[clap(
        short,
        long,
        help = "Port to listen on (all IPv4 addresses)",
        default_value_t = Config::default_port(),
        env = "ARCHIVESERVER_PORT"
    )]
    #[serde(default = "Config::default_port")]
    pub port: u16,

    #[clap(
        long,
        help = "Maximum simultaneous connections before the server responds with 503s",
        default_value_t = Config::default_max_connections(),
        env = "ARCHIVESERVER_MAX_CONNECTIONS"
    )]
    #[serde(default = "Config::default_max_connections")]
    pub max_connections: usize,

    #[clap(
        long,
        help = "HTML page served at /",
        default_value_os_t = Config::default_index_page(),
        env = "ARCHIVESERVER_INDEX_PAGE"
    )]
    #[serde(default = "Config::default_index_page")]
    pub index_page: PathBuf,

    #[clap(
        long,
        help = "zip-compatible archiver program, invoked as `<archiver> -r - .`",
        default_value_t = Config::default_archiver(),
        env = "ARCHIVESERVER_ARCHIVER"
    )]
    #[serde(default = "Config::default_archiver")]
    pub archiver: String,
}

impl Config {
    pub fn default_delay() -> f64 {
        0.1
    }

    pub fn default_photos_dir() -> PathBuf {
        "./test_photos".into()
    }

    pub fn default_chunk_kb_size() -> NonZeroUsize {
        DEFAULT_CHUNK_KB_SIZE
    }

    pub fn default_port() -> u16 {
        8080
    }

    pub fn default_max_connections() -> usize {
        1024
    }

    pub fn default_index_page() -> PathBuf {
        "index.html".into()
    }

    pub fn default_archiver() -> String {
        "zip".into()
    }

    /// Check constraints that the types alone can't express.
    pub fn validate(&self) -> anyhow::Result<()> {
        Duration::try_from_secs_f64(self.delay)
            .map_err(|_| anyhow::anyhow!("{} is not a valid delay in seconds", self.delay))?;
        self.chunk_kb_size
            .get()
            .checked_mul(1024)
            .context("chunk_kb_size is too large")?;
        anyhow::ensure!(self.max_connections > 0, "max_connections must be positive");
        Ok(())
    }

    pub fn pacing_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.delay).unwrap_or_default()
    }

    pub fn chunk_size(&self) -> NonZeroUsize {
        self.chunk_kb_size.saturating_mul(KIB)
    }

    pub fn archiver_command(&self) -> ArchiverCommand {
        ArchiverCommand::zip(&self.archiver)
    }

    pub fn listen_address(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// Resolve relative paths against `base` (the config file's directory).
    fn relative_to(mut self, base: &Path) -> Self {
        self.photos_dir = base.join(self.photos_dir);
        self.index_page = base.join(self.index_page);
        self
    }
}

impl Opts {
    /// Produce the validated [`Config`], reading `--cfg-path` if it was given.
    pub fn into_config(self) -> anyhow::Result<Config> {
        let config = match self.cfg_path {
            Some(cfg_path) => read_config_file(&cfg_path)?,
            None => self.config,
        };
        config.validate()?;
        Ok(config)
    }
}

fn read_config_file(cfg_path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(cfg_path)
        .with_context(|| format!("reading config file {}", cfg_path.display()))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("parsing config file {}", cfg_path.display()))?;
    let base = cfg_path.parent().unwrap_or(Path::new(""));
    Ok(config.relative_to(base))
}

fn parse_delay(s: &str) -> Result<f64, String> {
    let delay: f64 = s.parse().map_err(|e| format!("{e}"))?;
    match Duration::try_from_secs_f64(delay) {
        Ok(_) => Ok(delay),
        Err(_) => Err(format!("{delay} is not a valid delay in seconds")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::error::ErrorKind;

    #[test]
    fn defaults_match_documented_behavior() {
        let config = Opts::try_parse_from(["archiveserver"])
            .unwrap()
            .into_config()
            .unwrap();
        assert!(!config.log);
        assert!((config.pacing_delay().as_secs_f64() - 0.1).abs() < 1e-9);
        assert_eq!(config.photos_dir, PathBuf::from("./test_photos"));
        assert_eq!(config.chunk_size().get(), 500 * 1024);
        assert_eq!(config.archiver_command(), ArchiverCommand::default());
    }

    #[test]
    fn flags_override_defaults() {
        let opts = Opts::try_parse_from([
            "archiveserver",
            "--log",
            "--delay",
            "0",
            "--photos_dir",
            "/srv/photos",
            "--chunk-kb-size",
            "64",
        ])
        .unwrap();
        let config = opts.into_config().unwrap();
        assert!(config.log);
        assert_eq!(config.pacing_delay(), Duration::ZERO);
        assert_eq!(config.photos_dir, PathBuf::from("/srv/photos"));
        assert_eq!(config.chunk_size().get(), 64 * 1024);
    }

    #[test]
    fn oversized_chunks_saturate_and_fail_validation() {
        let mut config = Opts::try_parse_from(["archiveserver"])
            .unwrap()
            .into_config()
            .unwrap();
        config.chunk_kb_size = NonZeroUsize::MAX;
        assert_eq!(config.chunk_size(), NonZeroUsize::MAX);
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        for args in [
            ["archiveserver", "--delay=-1"],
            ["archiveserver", "--delay=NaN"],
            ["archiveserver", "--chunk-kb-size=0"],
        ] {
            let err = Opts::try_parse_from(args).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValueValidation, "{args:?}");
        }
    }

    #[test]
    fn cfg_path_excludes_other_options() {
        let err = Opts::try_parse_from(["archiveserver", "--cfg-path", "a.toml", "--log"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn config_file_paths_are_relative_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("archiveserver.toml");
        std::fs::write(&cfg_path, "delay = 0.5\nphotos_dir = \"photos\"\nport = 9000\n").unwrap();

        let cfg_arg = format!("--cfg-path={}", cfg_path.display());
        let opts = Opts::try_parse_from(["archiveserver", &cfg_arg]).unwrap();
        let config = opts.into_config().unwrap();
        assert_eq!(config.pacing_delay(), Duration::from_millis(500));
        assert_eq!(config.photos_dir, dir.path().join("photos"));
        assert_eq!(config.index_page, dir.path().join("index.html"));
        assert_eq!(config.listen_address().port(), 9000);
        assert_eq!(config.chunk_kb_size, Config::default_chunk_kb_size());
    }

    #[test]
    fn config_file_values_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("bad.toml");

        std::fs::write(&cfg_path, "delay = -0.5\n").unwrap();
        assert!(read_config_file(&cfg_path).unwrap().validate().is_err());

        std::fs::write(&cfg_path, "photo_dir = \"typo\"\n").unwrap();
        assert!(read_config_file(&cfg_path).is_err());
    }
}
