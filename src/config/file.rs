//! Configuration file discovery

use std::path::{Path, PathBuf};

/// Configuration file locations after `--config` and `PVE_CTL_CONFIG`
const CONFIG_LOCATIONS: &[&str] = &["./pve-ctl.yaml", "./pve-ctl.yml", "~/.pve-ctl.yaml"];

/// Find a configuration file.
///
/// An explicit path wins; otherwise the local candidates are tried, then
/// `<config dir>/pve-ctl/config.yaml`.
pub fn find_config(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_path(path));
    }

    CONFIG_LOCATIONS
        .iter()
        .map(|location| expand_path(location))
        .chain(dirs::config_dir().map(|d| d.join("pve-ctl").join("config.yaml")))
        .find(|path| path.exists())
}

/// Expand ~ to home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Check if file is YAML based on extension
pub(super) fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}
