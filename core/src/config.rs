use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use models::{AppConfig, RemoteConfig};

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Locate the configuration file: explicit flag, then beside the
/// executable, then the system config directory, then the home dotfile.
pub fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    candidate_paths().into_iter().find(|p| p.exists())
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = exe_dir() {
        candidates.push(dir.join(CONFIG_FILE_NAME));
    }
    candidates.push(system_config_dir().join(CONFIG_FILE_NAME));
    if let Some(home) = home_dir() {
        candidates.push(home.join(".sift.toml"));
    }
    candidates
}

/// Parse the configuration document. A missing file is not an error: the
/// agent idles until remotes are added.
pub fn load(explicit: Option<&Path>) -> Result<(AppConfig, Option<PathBuf>)> {
    match find_config_file(explicit) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            let cfg: AppConfig = toml::from_str(&raw)
                .with_context(|| format!("failed to parse config {}", path.display()))?;
            Ok((cfg, Some(path)))
        }
        None => Ok((AppConfig::default(), None)),
    }
}

/// Write the remotes list back into the config document, preserving any
/// unrelated keys the file already carries. Creates the file (and its
/// directory) when it does not exist yet.
pub fn save_remotes(path: &Path, remotes: &[RemoteConfig]) -> Result<()> {
    let mut doc: toml::Value = if path.exists() {
        toml::from_str(
            &std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?,
        )
        .with_context(|| format!("failed to parse config {}", path.display()))?
    } else {
        toml::Value::Table(toml::map::Map::new())
    };

    let table = doc
        .as_table_mut()
        .context("config root is not a TOML table")?;
    table.insert(
        "remotes".to_string(),
        toml::Value::try_from(remotes).context("failed to serialize remotes")?,
    );

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let updated = toml::to_string_pretty(&doc)?;
    std::fs::write(path, updated)
        .with_context(|| format!("failed to write config {}", path.display()))?;
    Ok(())
}

/// Where a new config file goes when none exists yet.
pub fn default_config_path() -> PathBuf {
    exe_dir()
        .map(|d| d.join(CONFIG_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
}

/// State-file location: explicit config value, else beside the executable
/// in local mode, else the OS data directory. Ensures the directory exists.
pub fn resolve_db_path(cfg: &AppConfig, local: bool) -> Result<PathBuf> {
    let path = if let Some(p) = &cfg.db_path {
        p.clone()
    } else if local {
        exe_dir().unwrap_or_else(|| PathBuf::from(".")).join("state.db")
    } else {
        data_dir().join("state.db")
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    Ok(path)
}

pub fn resolve_log_path(cfg: &AppConfig, local: bool) -> PathBuf {
    if let Some(p) = &cfg.log_path {
        return p.clone();
    }
    if local {
        exe_dir().unwrap_or_else(|| PathBuf::from(".")).join("agent.log")
    } else {
        data_dir().join("agent.log")
    }
}

fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(windows)]
    let var = "USERPROFILE";
    #[cfg(not(windows))]
    let var = "HOME";
    std::env::var_os(var).map(PathBuf::from)
}

fn system_config_dir() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(std::env::var_os("ProgramData").unwrap_or_else(|| "C:\\ProgramData".into()))
            .join("Sift")
    } else {
        PathBuf::from("/etc/sift-agent")
    }
}

fn data_dir() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(std::env::var_os("ProgramData").unwrap_or_else(|| "C:\\ProgramData".into()))
            .join("Sift")
    } else {
        PathBuf::from("/var/lib/sift-agent")
    }
}

#[cfg(test)]
mod tests {
    use super::{load, save_remotes};
    use models::RemoteConfig;
    use std::path::PathBuf;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sift-config-{}-{}", std::process::id(), name))
    }

    fn remote(name: &str) -> RemoteConfig {
        RemoteConfig {
            name: name.to_string(),
            path: PathBuf::from("/srv/scans"),
            endpoint: "https://api.example.com".to_string(),
            key: "sk_live".to_string(),
            stability_threshold: 3,
            check_interval: "5s".to_string(),
            stability_timeout: "30m".to_string(),
            concurrency_limit: 5,
            polling_interval: "1m".to_string(),
            settling_delay: "5s".to_string(),
            disable_fsnotify: false,
        }
    }

    #[test]
    fn save_and_load_round_trips_remotes() {
        let path = scratch_path("roundtrip.toml");
        let _ = std::fs::remove_file(&path);

        save_remotes(&path, &[remote("scans"), remote("invoices")]).unwrap();

        let (cfg, found) = load(Some(&path)).unwrap();
        assert_eq!(found.as_deref(), Some(path.as_path()));
        assert_eq!(cfg.remotes.len(), 2);
        assert_eq!(cfg.remotes[0].name, "scans");
        assert_eq!(cfg.remotes[0].check_interval, "5s");
        assert_eq!(cfg.remotes[1].name, "invoices");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn save_preserves_unrelated_top_level_keys() {
        let path = scratch_path("preserve.toml");
        std::fs::write(&path, "db_path = \"/var/lib/sift-agent/state.db\"\n").unwrap();

        save_remotes(&path, &[remote("scans")]).unwrap();

        let (cfg, _) = load(Some(&path)).unwrap();
        assert_eq!(
            cfg.db_path,
            Some(PathBuf::from("/var/lib/sift-agent/state.db"))
        );
        assert_eq!(cfg.remotes.len(), 1);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_explicit_file_is_an_error_only_when_unreadable() {
        let path = scratch_path("missing.toml");
        let _ = std::fs::remove_file(&path);
        // An explicit path that does not exist is passed through to the
        // reader and surfaces as an error.
        assert!(load(Some(&path)).is_err());
    }
}
