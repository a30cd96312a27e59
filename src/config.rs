use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, ensure};
use serde::Deserialize;
use spdlog::prelude::*;

pub trait Validator {
    fn validate(&self) -> anyhow::Result<()>;
}

/// Runtime configuration. Every field has a default so running without a
/// config file is the common case.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding the content-addressed blob cache for large HTTP
    /// bodies (`blob/` and `lhar/` live under it).
    pub blob_cache: PathBuf,
    /// Fail hard on schema deviations and unknown endpoints instead of
    /// logging and skipping.
    pub strict: bool,
    /// Whether like alignment tolerates non-contiguous anchor matches.
    pub allow_retcon: bool,
    /// Capture URLs to skip during ingestion.
    pub ignore_urls: HashSet<String>,
    /// Optional file with one ignored URL per line; merged into
    /// `ignore_urls`.
    pub ignore_file: PathBuf,
    /// Input list consulted when no inputs are given on the command line.
    pub input_list: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            blob_cache: PathBuf::from("harstore"),
            strict: cfg!(debug_assertions),
            allow_retcon: true,
            ignore_urls: HashSet::new(),
            ignore_file: PathBuf::from("ignore.txt"),
            input_list: PathBuf::from("exports.txt"),
        }
    }
}

impl Config {
    pub fn from_str(input: impl AsRef<str>) -> anyhow::Result<Self> {
        let config = toml::from_str::<Self>(input.as_ref())
            .map_err(|err| anyhow!("failed to parse config: {err}"))?;
        config
            .validate()
            .map_err(|err| anyhow!("invalid configuration: {err}"))?;
        Ok(config)
    }

    /// Reads the given file, or defaults when none is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let input = std::fs::read_to_string(path)
                    .map_err(|err| anyhow!("failed to read config file: {err}"))?;
                Self::from_str(input)
            }
            None => Ok(Config::default()),
        }
    }

    /// The configured ignore set plus the contents of the ignore file, which
    /// may not exist.
    pub fn ignored_urls(&self) -> HashSet<String> {
        let mut urls = self.ignore_urls.clone();
        match std::fs::read_to_string(&self.ignore_file) {
            Ok(text) => {
                urls.extend(
                    text.lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(str::to_owned),
                );
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "failed to read ignore file {}: {err}",
                self.ignore_file.display()
            ),
        }
        urls
    }
}

impl Validator for Config {
    fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            !self.blob_cache.as_os_str().is_empty(),
            "blob_cache must not be empty"
        );
        Ok(())
    }
}
