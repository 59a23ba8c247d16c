use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Parsed configuration document: optional state/log overrides plus the
/// list of watched remotes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
}

/// One watched directory paired with one upload endpoint and credential.
///
/// Tuning fields are stored exactly as written in the configuration file;
/// the accessor methods apply the documented defaults so a zero, missing,
/// or unparseable value never stops the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub name: String,
    pub path: PathBuf,
    pub endpoint: String,
    pub key: String,
    /// Consecutive stability checks that must pass before upload.
    #[serde(default)]
    pub stability_threshold: u32,
    /// Time between stability checks, e.g. "5s".
    #[serde(default)]
    pub check_interval: String,
    /// Maximum time to wait for a file to stop changing, e.g. "30m".
    #[serde(default)]
    pub stability_timeout: String,
    /// Maximum simultaneous uploads for this remote.
    #[serde(default)]
    pub concurrency_limit: u32,
    /// Frequency of the backup directory scan, e.g. "1m".
    #[serde(default)]
    pub polling_interval: String,
    /// Quiet period after the last observed change, e.g. "5s".
    #[serde(default)]
    pub settling_delay: String,
    /// Disable real-time filesystem events and rely purely on polling.
    #[serde(default)]
    pub disable_fsnotify: bool,
}

impl RemoteConfig {
    pub fn stability_threshold(&self) -> usize {
        if self.stability_threshold == 0 {
            2
        } else {
            self.stability_threshold as usize
        }
    }

    pub fn check_interval(&self) -> Duration {
        parse_duration_or(&self.check_interval, Duration::from_secs(5))
    }

    pub fn stability_timeout(&self) -> Duration {
        parse_duration_or(&self.stability_timeout, Duration::from_secs(30 * 60))
    }

    pub fn concurrency_limit(&self) -> usize {
        if self.concurrency_limit == 0 {
            5
        } else {
            self.concurrency_limit as usize
        }
    }

    pub fn polling_interval(&self) -> Duration {
        parse_duration_or(&self.polling_interval, Duration::from_secs(60))
    }

    pub fn settling_delay(&self) -> Duration {
        parse_duration_or(&self.settling_delay, Duration::from_secs(5))
    }
}

fn parse_duration_or(raw: &str, default: Duration) -> Duration {
    match humantime::parse_duration(raw.trim()) {
        Ok(d) if !d.is_zero() => d,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::RemoteConfig;
    use std::path::PathBuf;
    use std::time::Duration;

    fn remote() -> RemoteConfig {
        RemoteConfig {
            name: "scans".to_string(),
            path: PathBuf::from("/watch"),
            endpoint: "https://api.example.com".to_string(),
            key: "sk_test".to_string(),
            stability_threshold: 0,
            check_interval: String::new(),
            stability_timeout: String::new(),
            concurrency_limit: 0,
            polling_interval: String::new(),
            settling_delay: String::new(),
            disable_fsnotify: false,
        }
    }

    #[test]
    fn empty_tuning_fields_fall_back_to_defaults() {
        let r = remote();
        assert_eq!(r.stability_threshold(), 2);
        assert_eq!(r.check_interval(), Duration::from_secs(5));
        assert_eq!(r.stability_timeout(), Duration::from_secs(1800));
        assert_eq!(r.concurrency_limit(), 5);
        assert_eq!(r.polling_interval(), Duration::from_secs(60));
        assert_eq!(r.settling_delay(), Duration::from_secs(5));
    }

    #[test]
    fn configured_values_win_over_defaults() {
        let mut r = remote();
        r.stability_threshold = 4;
        r.check_interval = "250ms".to_string();
        r.stability_timeout = "2h".to_string();
        r.concurrency_limit = 1;
        r.polling_interval = "10s".to_string();
        r.settling_delay = "1s".to_string();

        assert_eq!(r.stability_threshold(), 4);
        assert_eq!(r.check_interval(), Duration::from_millis(250));
        assert_eq!(r.stability_timeout(), Duration::from_secs(7200));
        assert_eq!(r.concurrency_limit(), 1);
        assert_eq!(r.polling_interval(), Duration::from_secs(10));
        assert_eq!(r.settling_delay(), Duration::from_secs(1));
    }

    #[test]
    fn unparseable_and_zero_durations_are_recovered() {
        let mut r = remote();
        r.check_interval = "soon".to_string();
        r.settling_delay = "0s".to_string();
        assert_eq!(r.check_interval(), Duration::from_secs(5));
        assert_eq!(r.settling_delay(), Duration::from_secs(5));
    }
}
