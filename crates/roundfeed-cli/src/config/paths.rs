//! Config file location.

use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

/// Application directory under the user config root.
const APP_DIR: &str = "roundfeed";
/// Config file name.
const CONFIG_FILE: &str = "config.toml";

/// Resolves the config file path.
///
/// - `{dir}/config.toml` when `--dir` is given.
/// - `$XDG_CONFIG_HOME/roundfeed/config.toml` when that variable holds an
///   absolute path.
/// - `$HOME/.config/roundfeed/config.toml` otherwise.
///
/// # Errors
///
/// Returns an error if neither `--dir`, `XDG_CONFIG_HOME` nor `HOME` yields a
/// location.
pub fn resolve_config_path(dir: Option<&PathBuf>) -> Result<PathBuf> {
    locate(
        dir.map(PathBuf::as_path),
        env::var_os("XDG_CONFIG_HOME").as_deref(),
        env::var_os("HOME").as_deref(),
    )
}

fn locate(dir: Option<&Path>, xdg: Option<&OsStr>, home: Option<&OsStr>) -> Result<PathBuf> {
    if let Some(dir) = dir {
        return Ok(dir.join(CONFIG_FILE));
    }

    // Relative XDG paths are invalid per the base directory rules and ignored.
    if let Some(root) = xdg.map(PathBuf::from).filter(|p| p.is_absolute()) {
        return Ok(root.join(APP_DIR).join(CONFIG_FILE));
    }

    match home.filter(|h| !h.is_empty()) {
        Some(home) => Ok(PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join(CONFIG_FILE)),
        None => bail!("cannot locate config: pass --dir or set XDG_CONFIG_HOME or HOME"),
    }
}
