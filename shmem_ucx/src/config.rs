//! Transport configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TransportError};
use crate::fabric::ThreadMode;

pub const ENV_PROGRESS_INTERVAL: &str = "SHMEM_PROGRESS_INTERVAL";
pub const ENV_THREAD_LEVEL: &str = "SHMEM_THREAD_LEVEL";
pub const ENV_REMOTE_VIRTUAL_ADDRESSING: &str = "SHMEM_REMOTE_VIRTUAL_ADDRESSING";
pub const ENV_PROGRESS_CPU: &str = "SHMEM_PROGRESS_CPU";

/// Thread-safety level requested by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadLevel {
    #[default]
    Single,
    /// Only the main thread issues operations.
    Funneled,
    /// Any thread, one at a time.
    Serialized,
    Multiple,
}

impl FromStr for ThreadLevel {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(ThreadLevel::Single),
            "funneled" => Ok(ThreadLevel::Funneled),
            "serialized" => Ok(ThreadLevel::Serialized),
            "multiple" => Ok(ThreadLevel::Multiple),
            other => Err(TransportError::Config(format!(
                "unknown thread level `{other}`"
            ))),
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Requested thread-safety level.
    /// Default: Single
    pub thread_level: ThreadLevel,
    /// Sleep between background progress steps. Zero disables the
    /// progress thread.
    /// Default: 0
    pub progress_interval: Duration,
    /// Use remote virtual addressing when the fabric supports it.
    /// Default: true
    pub remote_virtual_addressing: bool,
    /// CPU to pin the progress thread to.
    /// Default: None
    pub progress_cpu: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self {
            thread_level: ThreadLevel::default(),
            progress_interval: Duration::ZERO,
            remote_virtual_addressing: true,
            progress_cpu: None,
        }
    }

    pub fn with_thread_level(mut self, thread_level: ThreadLevel) -> Self {
        self.thread_level = thread_level;
        self
    }

    pub fn with_progress_interval(mut self, progress_interval: Duration) -> Self {
        self.progress_interval = progress_interval;
        self
    }

    pub fn with_remote_virtual_addressing(mut self, enable: bool) -> Self {
        self.remote_virtual_addressing = enable;
        self
    }

    pub fn with_progress_cpu(mut self, cpu: usize) -> Self {
        self.progress_cpu = Some(cpu);
        self
    }

    /// Defaults overridden by `SHMEM_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `SHMEM_*` keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::new();

        if let Some(v) = lookup(ENV_PROGRESS_INTERVAL) {
            let us: u64 = parse(ENV_PROGRESS_INTERVAL, &v)?;
            config.progress_interval = Duration::from_micros(us);
        }
        if let Some(v) = lookup(ENV_THREAD_LEVEL) {
            config.thread_level = v.trim().parse()?;
        }
        if let Some(v) = lookup(ENV_REMOTE_VIRTUAL_ADDRESSING) {
            config.remote_virtual_addressing = parse_bool(ENV_REMOTE_VIRTUAL_ADDRESSING, &v)?;
        }
        if let Some(v) = lookup(ENV_PROGRESS_CPU) {
            config.progress_cpu = Some(parse(ENV_PROGRESS_CPU, &v)?);
        }

        Ok(config)
    }

    /// Worker thread mode for this configuration. A progress thread touches
    /// the worker concurrently with the application, so it forces `Multi`.
    pub fn thread_mode(&self) -> ThreadMode {
        if !self.progress_interval.is_zero() {
            return ThreadMode::Multi;
        }
        match self.thread_level {
            ThreadLevel::Single => ThreadMode::Single,
            ThreadLevel::Funneled | ThreadLevel::Serialized => ThreadMode::Serialized,
            ThreadLevel::Multiple => ThreadMode::Multi,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| TransportError::Config(format!("{key}: cannot parse `{value}`")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(TransportError::Config(format!(
            "{key}: expected a boolean, got `{value}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let config = TransportConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.thread_level, ThreadLevel::Single);
        assert!(config.progress_interval.is_zero());
        assert!(config.remote_virtual_addressing);
        assert_eq!(config.thread_mode(), ThreadMode::Single);
    }

    #[test]
    fn default_matches_new() {
        let config = TransportConfig::default();
        assert!(config.remote_virtual_addressing);
        assert_eq!(config.thread_level, ThreadLevel::Single);
        assert!(config.progress_interval.is_zero());
        assert_eq!(config.progress_cpu, None);
    }

    #[test]
    fn env_overrides() {
        let config = TransportConfig::from_lookup(lookup(&[
            ("SHMEM_PROGRESS_INTERVAL", "250"),
            ("SHMEM_THREAD_LEVEL", "Serialized"),
            ("SHMEM_REMOTE_VIRTUAL_ADDRESSING", "no"),
            ("SHMEM_PROGRESS_CPU", "3"),
        ]))
        .unwrap();
        assert_eq!(config.progress_interval, Duration::from_micros(250));
        assert_eq!(config.thread_level, ThreadLevel::Serialized);
        assert!(!config.remote_virtual_addressing);
        assert_eq!(config.progress_cpu, Some(3));
    }

    #[test]
    fn malformed_values_are_rejected() {
        for pairs in [
            [("SHMEM_PROGRESS_INTERVAL", "-1")],
            [("SHMEM_THREAD_LEVEL", "threaded")],
            [("SHMEM_REMOTE_VIRTUAL_ADDRESSING", "maybe")],
        ] {
            let err = TransportConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(matches!(err, TransportError::Config(_)), "{err}");
        }
    }

    #[test]
    fn thread_mode_mapping() {
        let mode = |level| TransportConfig::new().with_thread_level(level).thread_mode();
        assert_eq!(mode(ThreadLevel::Single), ThreadMode::Single);
        assert_eq!(mode(ThreadLevel::Funneled), ThreadMode::Serialized);
        assert_eq!(mode(ThreadLevel::Serialized), ThreadMode::Serialized);
        assert_eq!(mode(ThreadLevel::Multiple), ThreadMode::Multi);
    }

    #[test]
    fn progress_thread_forces_multi() {
        let config = TransportConfig::new()
            .with_thread_level(ThreadLevel::Single)
            .with_progress_interval(Duration::from_micros(1));
        assert_eq!(config.thread_mode(), ThreadMode::Multi);
    }
}
