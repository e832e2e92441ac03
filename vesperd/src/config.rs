use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/vesper/vesper.toml";
const ENV_CONFIG_PATH: &str = "VESPER_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub inspection: InspectionConfig,
    #[serde(default)]
    pub rawbuf: RawBufConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub schemes: SchemesConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `VESPER_CONFIG` environment variable. If the file is missing or fails
    /// to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(PathBuf::from(path))
    }

    pub fn load_from(path: PathBuf) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Capacity of the decoded-signal queue feeding the inspection worker.
    #[serde(default = "default_signal_queue_size")]
    pub signal_queue_size: usize,
    #[serde(default = "default_payload_queue_size")]
    pub payload_queue_size: usize,
    #[serde(default = "default_fetch_queue_size")]
    pub fetch_queue_size: usize,
    /// Queues notify their consumer only every N pushed elements.
    #[serde(default = "default_queue_notify_every")]
    pub queue_notify_every: usize,
    /// Upper bound on how long a worker sleeps with nothing scheduled.
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            signal_queue_size: default_signal_queue_size(),
            payload_queue_size: default_payload_queue_size(),
            fetch_queue_size: default_fetch_queue_size(),
            queue_notify_every: default_queue_notify_every(),
            idle_wait_ms: default_idle_wait_ms(),
        }
    }
}

fn default_signal_queue_size() -> usize {
    1000
}
fn default_payload_queue_size() -> usize {
    100
}
fn default_fetch_queue_size() -> usize {
    100
}
fn default_queue_notify_every() -> usize {
    1
}
fn default_idle_wait_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct InspectionConfig {
    /// Only include samples newer than the condition's last published
    /// timestamp in follow-up payloads.
    #[serde(default = "default_send_once_per_condition")]
    pub send_once_per_condition: bool,
    /// Minimum interval between two emissions of the same fetch request id.
    #[serde(default = "default_min_fetch_trigger_ms")]
    pub min_fetch_trigger_ms: u64,
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            send_once_per_condition: default_send_once_per_condition(),
            min_fetch_trigger_ms: default_min_fetch_trigger_ms(),
        }
    }
}

fn default_send_once_per_condition() -> bool {
    true
}
fn default_min_fetch_trigger_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawBufConfig {
    #[serde(default = "default_raw_max_bytes_per_sample")]
    pub max_bytes_per_sample: usize,
    #[serde(default = "default_raw_max_samples_per_signal")]
    pub max_samples_per_signal: usize,
    #[serde(default = "default_raw_max_bytes_per_signal")]
    pub max_bytes_per_signal: usize,
    #[serde(default = "default_raw_max_total_bytes")]
    pub max_total_bytes: usize,
}

impl Default for RawBufConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_sample: default_raw_max_bytes_per_sample(),
            max_samples_per_signal: default_raw_max_samples_per_signal(),
            max_bytes_per_signal: default_raw_max_bytes_per_signal(),
            max_total_bytes: default_raw_max_total_bytes(),
        }
    }
}

fn default_raw_max_bytes_per_sample() -> usize {
    1024
}
fn default_raw_max_samples_per_signal() -> usize {
    20
}
fn default_raw_max_bytes_per_signal() -> usize {
    64 * 1024
}
fn default_raw_max_total_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    /// Directory holding persisted state (state template metadata).
    #[serde(default = "default_persistence_dir")]
    pub dir: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            dir: default_persistence_dir(),
        }
    }
}

fn default_persistence_dir() -> String {
    "/var/lib/vesper".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// File receiving one JSON line per emitted payload.
    #[serde(default = "default_payload_file")]
    pub payload_file: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            payload_file: default_payload_file(),
        }
    }
}

fn default_payload_file() -> String {
    "/var/log/vesper/payloads.ndjson".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SchemesConfig {
    /// Optional JSON file with pre-parsed collection schemes to install at
    /// startup (inspection matrix, fetch matrix, state templates).
    #[serde(default)]
    pub file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[runtime]
signal_queue_size = 1000
payload_queue_size = 100
[inspection]
send_once_per_condition = true
min_fetch_trigger_ms = 1000
[persistence]
dir = "/var/lib/vesper"
[output]
payload_file = "/var/log/vesper/payloads.ndjson"
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.runtime.signal_queue_size, 1000);
        assert_eq!(cfg.runtime.fetch_queue_size, 100);
        assert_eq!(cfg.runtime.idle_wait_ms, 1000);
        assert!(cfg.inspection.send_once_per_condition);
        assert_eq!(cfg.inspection.min_fetch_trigger_ms, 1000);
        assert_eq!(cfg.rawbuf.max_bytes_per_sample, 1024);
        assert_eq!(cfg.rawbuf.max_total_bytes, 1024 * 1024);
        assert_eq!(cfg.persistence.dir, "/var/lib/vesper");
        assert_eq!(cfg.output.payload_file, "/var/log/vesper/payloads.ndjson");
        assert!(cfg.schemes.file.is_none());
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not valid toml [[[").unwrap();
        let cfg = Config::load_from(file.path().to_path_buf());
        assert_eq!(cfg.runtime.signal_queue_size, 1000);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[runtime]\nsignal_queue_size = 7").unwrap();
        let cfg = Config::load_from(file.path().to_path_buf());
        assert_eq!(cfg.runtime.signal_queue_size, 7);
        assert_eq!(cfg.runtime.payload_queue_size, 100);
        assert!(cfg.inspection.send_once_per_condition);
    }
}
