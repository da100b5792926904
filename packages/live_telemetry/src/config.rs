use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / livetail.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   livetail.toml:   [logs]
//                    poll_interval_ms = 500
//
//   env var:         LIVETAIL_LOGS__POLL_INTERVAL_MS=500   (double underscore = nesting)
//
//   (single underscore stays within field names: LIVETAIL_SERVER__BASE_URL)

pub const CONFIG_FILE_NAME: &str = "livetail.toml";
pub const ENV_PREFIX: &str = "LIVETAIL_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub events: EventsFileConfig,
    #[serde(default)]
    pub logs: LogsFileConfig,
    #[serde(default)]
    pub execution: ExecutionFileConfig,
}

/// Where the backend lives (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default = "default_events_path")]
    pub events_path: String,
    /// `{subject}` is replaced by the run id.
    #[serde(default = "default_log_path_template")]
    pub log_path_template: String,
    /// `{subject}` is replaced by the execution id.
    #[serde(default = "default_execution_path_template")]
    pub execution_path_template: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_path: default_ws_path(),
            events_path: default_events_path(),
            log_path_template: default_log_path_template(),
            execution_path_template: default_execution_path_template(),
        }
    }
}

/// Channel connection knobs (lives under `[connection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    /// 0 = retry forever
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_secs: default_reconnect_max_secs(),
            max_reconnect_attempts: 0,
        }
    }
}

/// Push feed knobs (lives under `[events]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventsFileConfig {
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
}

impl Default for EventsFileConfig {
    fn default() -> Self {
        Self {
            retry_ms: default_retry_ms(),
        }
    }
}

/// Log tail knobs (lives under `[logs]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogsFileConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_buffer_chars")]
    pub max_buffer_chars: usize,
}

impl Default for LogsFileConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_buffer_chars: default_max_buffer_chars(),
        }
    }
}

/// Execution stream knobs (lives under `[execution]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionFileConfig {
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

impl Default for ExecutionFileConfig {
    fn default() -> Self {
        Self {
            max_log_entries: default_max_log_entries(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_ws_path() -> String {
    "/ws".to_string()
}
fn default_events_path() -> String {
    "/api/events/stream".to_string()
}
fn default_log_path_template() -> String {
    "/api/runs/{subject}/logs".to_string()
}
fn default_execution_path_template() -> String {
    "/api/executions/{subject}/stream".to_string()
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_reconnect_base_ms() -> u64 {
    1000
}
fn default_reconnect_max_secs() -> u64 {
    30
}
fn default_retry_ms() -> u64 {
    3000
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_max_buffer_chars() -> usize {
    200_000
}
fn default_max_log_entries() -> usize {
    5_000
}

/// Build a figment that layers: defaults → livetail.toml → LIVETAIL_* env vars.
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join(CONFIG_FILE_NAME)))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

// =============================================================================
// Runtime views (derived from FileConfig, handed to the components)
// =============================================================================

/// Resolved backend URLs.
#[derive(Clone, Debug)]
pub struct Endpoints {
    base_url: String,
    ws_path: String,
    events_path: String,
    log_path_template: String,
    execution_path_template: String,
}

impl Endpoints {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            base_url: fc.base_url.trim_end_matches('/').to_string(),
            ws_path: fc.ws_path.clone(),
            events_path: fc.events_path.clone(),
            log_path_template: fc.log_path_template.clone(),
            execution_path_template: fc.execution_path_template.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Channel endpoint, with the scheme switched to ws/wss.
    pub fn ws_url(&self) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{base}{}", self.ws_path)
    }

    pub fn events_url(&self) -> String {
        format!("{}{}", self.base_url, self.events_path)
    }

    pub fn log_url(&self, subject: &str) -> String {
        format!(
            "{}{}",
            self.base_url,
            self.log_path_template.replace("{subject}", subject)
        )
    }

    pub fn execution_url(&self, subject: &str) -> String {
        format!(
            "{}{}",
            self.base_url,
            self.execution_path_template.replace("{subject}", subject)
        )
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl ConnectionSettings {
    pub fn from_file(fc: &ConnectionFileConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(fc.heartbeat_secs.max(1)),
            reconnect_base: Duration::from_millis(fc.reconnect_base_ms.max(1)),
            reconnect_max: Duration::from_secs(fc.reconnect_max_secs.max(1)),
            max_reconnect_attempts: if fc.max_reconnect_attempts == 0 {
                None
            } else {
                Some(fc.max_reconnect_attempts)
            },
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_file(&ConnectionFileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct PushSettings {
    /// Delay before reopening a failed feed, unless the server sent `retry:`.
    pub retry_delay: Duration,
}

impl PushSettings {
    pub fn from_file(fc: &EventsFileConfig) -> Self {
        Self {
            retry_delay: Duration::from_millis(fc.retry_ms),
        }
    }
}

impl Default for PushSettings {
    fn default() -> Self {
        Self::from_file(&EventsFileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct TailSettings {
    pub poll_interval: Duration,
    pub max_buffer_chars: usize,
}

impl TailSettings {
    pub fn from_file(fc: &LogsFileConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(fc.poll_interval_ms.max(1)),
            max_buffer_chars: fc.max_buffer_chars,
        }
    }
}

impl Default for TailSettings {
    fn default() -> Self {
        Self::from_file(&LogsFileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionSettings {
    pub max_log_entries: usize,
}

impl ExecutionSettings {
    pub fn from_file(fc: &ExecutionFileConfig) -> Self {
        Self {
            max_log_entries: fc.max_log_entries,
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self::from_file(&ExecutionFileConfig::default())
    }
}

/// Every runtime view, resolved once at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    pub endpoints: Endpoints,
    pub connection: ConnectionSettings,
    pub push: PushSettings,
    pub tail: TailSettings,
    pub execution: ExecutionSettings,
}

impl Settings {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            endpoints: Endpoints::from_file(&fc.server),
            connection: ConnectionSettings::from_file(&fc.connection),
            push: PushSettings::from_file(&fc.events),
            tail: TailSettings::from_file(&fc.logs),
            execution: ExecutionSettings::from_file(&fc.execution),
        }
    }

    pub fn load(config_dir: &Path) -> Result<Self, figment::Error> {
        let fc: FileConfig = load_config(config_dir).extract()?;
        Ok(Self::from_file(&fc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_logs_file_config_defaults() {
        let d = LogsFileConfig::default();
        assert_eq!(d.poll_interval_ms, 1000);
        assert_eq!(d.max_buffer_chars, 200_000);
    }

    #[test]
    fn test_connection_settings_defaults() {
        let s = ConnectionSettings::default();
        assert_eq!(s.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(s.reconnect_base, Duration::from_secs(1));
        assert_eq!(s.reconnect_max, Duration::from_secs(30));
        assert!(s.max_reconnect_attempts.is_none());
    }

    #[test]
    fn test_max_reconnect_attempts_nonzero_is_bounded() {
        let s = ConnectionSettings::from_file(&ConnectionFileConfig {
            max_reconnect_attempts: 5,
            ..Default::default()
        });
        assert_eq!(s.max_reconnect_attempts, Some(5));
    }

    #[test]
    fn test_push_settings_defaults() {
        assert_eq!(PushSettings::default().retry_delay, Duration::from_secs(3));
    }

    // ── Endpoints ───────────────────────────────────────────────────────

    #[test]
    fn test_endpoint_urls() {
        let e = Endpoints::from_file(&ServerFileConfig {
            base_url: "https://ops.example.com/".into(),
            ..Default::default()
        });
        assert_eq!(e.base_url(), "https://ops.example.com");
        assert_eq!(e.ws_url(), "wss://ops.example.com/ws");
        assert_eq!(e.events_url(), "https://ops.example.com/api/events/stream");
        assert_eq!(
            e.log_url("run-42"),
            "https://ops.example.com/api/runs/run-42/logs"
        );
        assert_eq!(
            e.execution_url("exec-7"),
            "https://ops.example.com/api/executions/exec-7/stream"
        );
    }

    #[test]
    fn test_plain_http_maps_to_ws() {
        let e = Endpoints::from_file(&ServerFileConfig::default());
        assert_eq!(e.ws_url(), "ws://127.0.0.1:8000/ws");
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.base_url, "http://127.0.0.1:8000");
        assert_eq!(fc.logs.max_buffer_chars, 200_000);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            "[server]\nbase_url = \"http://10.0.0.2:9000\"\n\n[logs]\npoll_interval_ms = 250\n",
        )
        .unwrap();
        let settings = Settings::load(tmp.path()).unwrap();
        assert_eq!(settings.endpoints.base_url(), "http://10.0.0.2:9000");
        assert_eq!(settings.tail.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.tail.max_buffer_chars, 200_000);
    }

    #[test]
    fn test_load_config_env_overrides_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(CONFIG_FILE_NAME, "[connection]\nheartbeat_secs = 10\n")?;
            jail.set_env("LIVETAIL_CONNECTION__HEARTBEAT_SECS", "5");
            let fc: FileConfig = load_config(jail.directory()).extract()?;
            assert_eq!(fc.connection.heartbeat_secs, 5);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            "[logs]\npoll_interval_ms = \"soon\"\n",
        )
        .unwrap();
        assert!(Settings::load(tmp.path()).is_err());
    }
}
