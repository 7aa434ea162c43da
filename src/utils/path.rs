use crate::config::app_name;
use std::env::var_os;
use std::path::PathBuf;

fn home_path() -> Option<String> {
    var_os("HOME").map(|home| home.to_string_lossy().to_string())
}

/// `$HOME/.config/<app>/config.json`, or `None` when no home is known.
pub fn default_config_path() -> Option<PathBuf> {
    home_path().map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join(app_name())
            .join("config.json")
    })
}
