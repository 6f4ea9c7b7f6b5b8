/// TOML configuration. Every section deserializes with field defaults so
/// a partial file (or none at all) still yields a runnable config.
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scanner: ScannerSection,
    #[serde(default)]
    pub transcription: TranscriptionSection,
    #[serde(default)]
    pub geocoder: GeocoderSection,
    #[serde(default)]
    pub alerts: AlertsSection,
    #[serde(default)]
    pub hospital: HospitalSection,
    #[serde(default)]
    pub linker: LinkerSection,
    #[serde(default)]
    pub live_hub: LiveHubSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub postprocess: PostprocessSection,
    /// Misheard-phrase overrides merged over the built-in dictionary.
    #[serde(default)]
    pub corrections: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerSection {
    /// Path to the scanner-bridge binary the supervisor owns.
    #[serde(default)]
    pub binary_path: Option<PathBuf>,
    #[serde(default = "default_bridge_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub systems: Vec<String>,
    #[serde(default)]
    pub talkgroups: Vec<String>,
}

impl Default for ScannerSection {
    fn default() -> Self {
        Self {
            binary_path: None,
            listen_port: default_bridge_port(),
            systems: Vec::new(),
            talkgroups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionSection {
    #[serde(default = "default_transcription_provider")]
    pub provider: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_transcription_timeout")]
    pub timeout_seconds: u64,
}

impl Default for TranscriptionSection {
    fn default() -> Self {
        Self {
            provider: default_transcription_provider(),
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
            timeout_seconds: default_transcription_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeocoderSection {
    /// Primary provider URL template; `{query}` is replaced with the
    /// URL-encoded address.
    #[serde(default = "default_geocoder_primary")]
    pub primary: String,
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default = "default_geocode_ttl")]
    pub cache_ttl_seconds: i64,
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl_seconds: i64,
    /// Appended to bare street addresses before lookup.
    #[serde(default)]
    pub default_suffix: Option<String>,
}

impl Default for GeocoderSection {
    fn default() -> Self {
        Self {
            primary: default_geocoder_primary(),
            fallback: None,
            cache_ttl_seconds: default_geocode_ttl(),
            negative_ttl_seconds: default_negative_ttl(),
            default_suffix: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsSection {
    #[serde(default = "default_scan_interval")]
    pub scan_interval_seconds: u64,
}

impl Default for AlertsSection {
    fn default() -> Self {
        Self {
            scan_interval_seconds: default_scan_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HospitalSection {
    pub talkgroups: Vec<String>,
    #[serde(default = "default_hospital_window")]
    pub window_seconds: i64,
    #[serde(default = "default_close_idle")]
    pub close_idle_seconds: i64,
    /// Talkgroup → hospital display name.
    #[serde(default)]
    pub names: BTreeMap<String, String>,
}

impl Default for HospitalSection {
    fn default() -> Self {
        Self {
            talkgroups: Vec::new(),
            window_seconds: default_hospital_window(),
            close_idle_seconds: default_close_idle(),
            names: BTreeMap::new(),
        }
    }
}

impl HospitalSection {
    pub fn is_hospital_talkgroup(&self, talkgroup: &str) -> bool {
        self.talkgroups.iter().any(|t| t == talkgroup)
    }

    pub fn hospital_name(&self, talkgroup: &str) -> String {
        self.names.get(talkgroup).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkerSection {
    #[serde(default = "default_link_window")]
    pub window_seconds: i64,
}

impl Default for LinkerSection {
    fn default() -> Self {
        Self {
            window_seconds: default_link_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveHubSection {
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u64,
    #[serde(default = "default_session_queue")]
    pub queue_capacity: usize,
}

impl Default for LiveHubSection {
    fn default() -> Self {
        Self {
            heartbeat_seconds: default_heartbeat(),
            queue_capacity: default_session_queue(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    /// Holds the sqlite database, audio blobs, and the PID marker.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageSection {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("dispatch.db")
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.data_dir.join("audio")
    }

    pub fn pid_marker(&self) -> PathBuf {
        self.data_dir.join("scanner.pid")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostprocessSection {
    #[serde(default = "default_true")]
    pub reject_call_type_addresses: bool,
}

impl Default for PostprocessSection {
    fn default() -> Self {
        Self {
            reject_call_type_addresses: true,
        }
    }
}

fn default_bridge_port() -> u16 {
    dispatch_protocol::DEFAULT_BRIDGE_PORT
}
fn default_transcription_provider() -> String {
    "http://127.0.0.1:9090/transcribe".to_string()
}
fn default_concurrency() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_transcription_timeout() -> u64 {
    60
}
fn default_geocoder_primary() -> String {
    "https://nominatim.openstreetmap.org/search?format=json&limit=1&q={query}".to_string()
}
fn default_geocode_ttl() -> i64 {
    86_400
}
fn default_negative_ttl() -> i64 {
    3_600
}
fn default_scan_interval() -> u64 {
    30
}
fn default_hospital_window() -> i64 {
    dispatch_protocol::CONVERSATION_WINDOW_SECS
}
fn default_close_idle() -> i64 {
    dispatch_protocol::CONVERSATION_IDLE_CLOSE_SECS
}
fn default_link_window() -> i64 {
    dispatch_protocol::LINK_WINDOW_SECS
}
fn default_heartbeat() -> u64 {
    dispatch_protocol::HEARTBEAT_INTERVAL_SECS
}
fn default_session_queue() -> usize {
    256
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_true() -> bool {
    true
}
