use anyhow::{Context, Result};
use attendance_core::cooldown::{
    DEFAULT_ATTENDANCE_COOLDOWN_SECS, DEFAULT_NOTIFICATION_COOLDOWN_SECS,
};
use attendance_core::presence::DEFAULT_PRESENCE_EXPIRY_SECS;
use attendance_core::{CooldownPolicy, PipelineSettings, DEFAULT_MATCH_THRESHOLD};
use chrono::TimeDelta;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Daemon configuration: optional TOML file, then `ATTENDANCE_*` environment overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance below which a face matches an identity.
    pub match_threshold: f32,
    pub attendance_cooldown_secs: u64,
    pub notification_cooldown_secs: u64,
    /// Absence after which a present identity is announced as departed.
    pub presence_expiry_secs: u64,
    /// Age after which the identity snapshot is reloaded from the database.
    pub cache_staleness_secs: u64,
    pub reload_attempts: u32,
    pub emit_attempts: u32,
    /// Required length of every face encoding.
    pub encoding_dim: usize,
    /// Start an attendance session as soon as the daemon is up.
    pub autostart_session: bool,
}

/// On-disk form; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    match_threshold: Option<f32>,
    attendance_cooldown_secs: Option<u64>,
    notification_cooldown_secs: Option<u64>,
    presence_expiry_secs: Option<u64>,
    cache_staleness_secs: Option<u64>,
    reload_attempts: Option<u32>,
    emit_attempts: Option<u32>,
    encoding_dim: Option<usize>,
    autostart_session: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("attendance.db"),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            attendance_cooldown_secs: DEFAULT_ATTENDANCE_COOLDOWN_SECS as u64,
            notification_cooldown_secs: DEFAULT_NOTIFICATION_COOLDOWN_SECS as u64,
            presence_expiry_secs: DEFAULT_PRESENCE_EXPIRY_SECS as u64,
            cache_staleness_secs: attendance_core::cache::DEFAULT_STALENESS_SECS as u64,
            reload_attempts: 3,
            emit_attempts: 2,
            encoding_dim: 128,
            autostart_session: false,
        }
    }
}

impl Config {
    /// Load `$ATTENDANCE_CONFIG` (if set) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("ATTENDANCE_CONFIG") {
            config = Self::from_file(Path::new(&path))?;
        }
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(text)?;
        let d = Self::default();
        Ok(Self {
            db_path: file.db_path.unwrap_or(d.db_path),
            match_threshold: file.match_threshold.unwrap_or(d.match_threshold),
            attendance_cooldown_secs: file
                .attendance_cooldown_secs
                .unwrap_or(d.attendance_cooldown_secs),
            notification_cooldown_secs: file
                .notification_cooldown_secs
                .unwrap_or(d.notification_cooldown_secs),
            presence_expiry_secs: file.presence_expiry_secs.unwrap_or(d.presence_expiry_secs),
            cache_staleness_secs: file.cache_staleness_secs.unwrap_or(d.cache_staleness_secs),
            reload_attempts: file.reload_attempts.unwrap_or(d.reload_attempts),
            emit_attempts: file.emit_attempts.unwrap_or(d.emit_attempts),
            encoding_dim: file.encoding_dim.unwrap_or(d.encoding_dim),
            autostart_session: file.autostart_session.unwrap_or(d.autostart_session),
        })
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("ATTENDANCE_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        self.match_threshold = env_parse("ATTENDANCE_MATCH_THRESHOLD", self.match_threshold);
        self.attendance_cooldown_secs =
            env_parse("ATTENDANCE_ATTENDANCE_COOLDOWN_SECS", self.attendance_cooldown_secs);
        self.notification_cooldown_secs =
            env_parse("ATTENDANCE_NOTIFICATION_COOLDOWN_SECS", self.notification_cooldown_secs);
        self.presence_expiry_secs =
            env_parse("ATTENDANCE_PRESENCE_EXPIRY_SECS", self.presence_expiry_secs);
        self.cache_staleness_secs =
            env_parse("ATTENDANCE_CACHE_STALENESS_SECS", self.cache_staleness_secs);
        self.reload_attempts = env_parse("ATTENDANCE_RELOAD_ATTEMPTS", self.reload_attempts);
        self.emit_attempts = env_parse("ATTENDANCE_EMIT_ATTEMPTS", self.emit_attempts);
        self.encoding_dim = env_parse("ATTENDANCE_ENCODING_DIM", self.encoding_dim);
        self.autostart_session = std::env::var("ATTENDANCE_AUTOSTART")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(self.autostart_session);
    }

    pub fn cooldown_policy(&self) -> CooldownPolicy {
        CooldownPolicy {
            attendance: secs(self.attendance_cooldown_secs),
            notification: secs(self.notification_cooldown_secs),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            match_threshold: self.match_threshold,
            presence_expiry: secs(self.presence_expiry_secs),
            emit_attempts: self.emit_attempts,
        }
    }

    pub fn cache_staleness(&self) -> TimeDelta {
        secs(self.cache_staleness_secs)
    }
}

fn secs(value: u64) -> TimeDelta {
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("attendance")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.match_threshold, 0.6);
        assert_eq!(c.attendance_cooldown_secs, 60);
        assert_eq!(c.notification_cooldown_secs, 300);
        assert_eq!(c.presence_expiry_secs, 30);
        assert_eq!(c.cache_staleness_secs, 300);
        assert_eq!(c.encoding_dim, 128);
        assert!(c.db_path.ends_with("attendance/attendance.db"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let text = "match_threshold = 0.5\nnotification_cooldown_secs = 600\n";
        let c = Config::from_toml(text).unwrap();
        assert_eq!(c.match_threshold, 0.5);
        assert_eq!(c.notification_cooldown_secs, 600);
        assert_eq!(c.attendance_cooldown_secs, 60);
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        assert!(Config::from_toml("camera = \"/dev/video0\"\n").is_err());
    }

    #[test]
    fn test_derived_settings() {
        let text = "attendance_cooldown_secs = 10\npresence_expiry_secs = 5\n";
        let c = Config::from_toml(text).unwrap();
        assert_eq!(c.cooldown_policy().attendance, TimeDelta::seconds(10));
        assert_eq!(c.cooldown_policy().notification, TimeDelta::seconds(300));
        assert_eq!(c.pipeline_settings().presence_expiry, TimeDelta::seconds(5));
    }
}
