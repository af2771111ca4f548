//! Load daemon config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

use toku_core::Options;

/// Daemon configuration. File: ~/.config/toku/config.toml or
/// /etc/toku/config.toml. Env overrides: TOKU_PROFILE, TOKU_PASSPHRASE,
/// TOKU_NAME.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where the save-data envelope is persisted across runs.
    #[serde(default = "default_profile")]
    pub profile: PathBuf,
    /// When set, the profile is stored passphrase-encrypted.
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Display name applied to a fresh profile.
    #[serde(default = "default_name")]
    pub name: String,
    /// Status message applied to a fresh profile.
    #[serde(default = "default_status_message")]
    pub status_message: String,
    /// Engine construction options.
    #[serde(default)]
    pub options: Options,
}

fn default_profile() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".local/share/toku/profile.tok")
}

fn default_name() -> String {
    "toku".to_string()
}

fn default_status_message() -> String {
    String::new()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            passphrase: None,
            name: default_name(),
            status_message: default_status_message(),
            options: Options::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("TOKU_PROFILE") {
        if !s.is_empty() {
            c.profile = PathBuf::from(s);
        }
    }
    if let Ok(s) = std::env::var("TOKU_PASSPHRASE") {
        if !s.is_empty() {
            c.passphrase = Some(s);
        }
    }
    if let Ok(s) = std::env::var("TOKU_NAME") {
        if !s.is_empty() {
            c.name = s;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/toku/config.toml"));
    }
    out.push(PathBuf::from("/etc/toku/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
