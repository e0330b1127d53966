use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::mux::PumpSettings;
use crate::policy::MarkerPolicies;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "AGENT_MUX_CONFIG";

/// Limits and timings consumed by the orchestrator.
///
/// Every field has a default, so a config file only needs the keys it
/// changes. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MuxConfig {
    /// Most sessions allowed in Starting/Running/Idle/AwaitingInput at once
    pub max_sessions: usize,
    /// Quiet interval before a running session is considered idle
    pub idle_timeout_ms: u64,
    /// How long a graceful terminate waits after closing input before killing
    pub grace_period_ms: u64,
    /// How long shutdown waits for sessions before killing the stragglers
    pub shutdown_timeout_ms: u64,
    /// Lines of output kept per session
    pub buffer_capacity: usize,
    /// Pending input messages per session before senders see backpressure
    pub input_queue: usize,
    /// How long `send_input` waits for room in a full queue
    pub input_timeout_ms: u64,
    /// How long a pump keeps draining pipes after its process exited
    pub drain_timeout_ms: u64,
    /// Tool kind -> regex matching that tool's "needs input" prompt
    pub markers: HashMap<String, String>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_sessions: 8,
            idle_timeout_ms: 3_000,
            grace_period_ms: 5_000,
            shutdown_timeout_ms: 10_000,
            buffer_capacity: 5_000,
            input_queue: 64,
            input_timeout_ms: 250,
            drain_timeout_ms: 500,
            markers: HashMap::new(),
        }
    }
}

impl MuxConfig {
    /// `$AGENT_MUX_CONFIG`, else `<config dir>/agent-mux/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Some(PathBuf::from(path)),
            None => dirs::config_dir().map(|dir| dir.join("agent-mux").join("config.json")),
        }
    }

    /// Load from the default location, falling back to defaults if there is no file.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| CoreError::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_sessions", self.max_sessions as u64),
            ("buffer_capacity", self.buffer_capacity as u64),
            ("input_queue", self.input_queue as u64),
            ("idle_timeout_ms", self.idle_timeout_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(CoreError::InvalidConfig(format!("{name} must be greater than zero")));
        }
        self.marker_policies().map(|_| ())
    }

    /// Compile the configured markers.
    pub fn marker_policies(&self) -> Result<MarkerPolicies> {
        MarkerPolicies::from_patterns(
            self.markers
                .iter()
                .map(|(kind, pattern)| (kind.as_str(), pattern.as_str())),
        )
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn input_timeout(&self) -> Duration {
        Duration::from_millis(self.input_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn pump_settings(&self) -> PumpSettings {
        PumpSettings {
            idle_timeout: self.idle_timeout(),
            input_queue: self.input_queue,
            drain_timeout: self.drain_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ToolKind;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MuxConfig::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, MuxConfig::default());
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_sessions": 2, "idle_timeout_ms": 750, "markers": {{"codex": "codex> $"}}}}"#
        )
        .unwrap();

        let config = MuxConfig::load_from(file.path()).unwrap();
        assert_eq!(config.max_sessions, 2);
        assert_eq!(config.idle_timeout(), Duration::from_millis(750));
        assert_eq!(config.buffer_capacity, 5_000);

        let markers = config.marker_policies().unwrap();
        assert!(markers.for_kind(&ToolKind::Codex).matches("codex> "));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_session": 2}}"#).unwrap();
        let err = MuxConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        let config = MuxConfig {
            max_sessions: 0,
            ..MuxConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_sessions"));
    }

    #[test]
    fn test_bad_marker_is_rejected() {
        let mut config = MuxConfig::default();
        config.markers.insert("claude".into(), "([".into());
        assert!(matches!(config.validate(), Err(CoreError::InvalidConfig(_))));
    }
}
