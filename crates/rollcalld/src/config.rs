use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration, loaded from `ROLLCALL_*` environment variables with
/// an optional TOML file underneath (env wins on conflict).
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Identity of the person this kiosk verifies (badge id, student id).
    pub subject_id: String,
    /// Stable identity of this capture device.
    pub device_id: String,
    /// Path to the SQLite outbox journal.
    pub db_path: PathBuf,
    /// Base URL of the remote attendance store. Absent → offline mode, the
    /// outbox accumulates Pending entries until a store is configured.
    pub store_url: Option<String>,
    /// Bearer token for the remote store.
    pub store_token: Option<String>,
    /// Shared HMAC key for session token signatures.
    pub signing_key: String,
    /// Minimum gap between frame-path code scans.
    pub scan_interval_ms: u64,
    /// Liveness confidence floor for a qualifying frame.
    pub presence_confidence_threshold: f32,
    /// K — qualifying frames required for stable presence.
    pub presence_stable_required: usize,
    /// N — ring size the quorum is counted over.
    pub presence_window: usize,
    /// W — correlation window between token and presence.
    pub correlation_window_ms: u64,
    pub outbox_max_attempts: u32,
    pub outbox_backoff_base_ms: u64,
    pub outbox_backoff_cap_ms: u64,
    pub outbox_poll_interval_ms: u64,
    /// How long committed outbox entries are kept before gc.
    pub outbox_retention_ms: u64,
}

/// Optional file layer, pointed at by `ROLLCALL_CONFIG`. Every field is
/// optional; anything absent falls through to env or defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    subject_id: Option<String>,
    device_id: Option<String>,
    db_path: Option<PathBuf>,
    store_url: Option<String>,
    store_token: Option<String>,
    signing_key: Option<String>,
    scan_interval_ms: Option<u64>,
    presence_confidence_threshold: Option<f32>,
    presence_stable_required: Option<usize>,
    presence_window: Option<usize>,
    correlation_window_ms: Option<u64>,
    outbox_max_attempts: Option<u32>,
    outbox_backoff_base_ms: Option<u64>,
    outbox_backoff_cap_ms: Option<u64>,
    outbox_poll_interval_ms: Option<u64>,
    outbox_retention_ms: Option<u64>,
}

impl FileConfig {
    fn load() -> Self {
        let Ok(path) = std::env::var("ROLLCALL_CONFIG") else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(cfg) => {
                    tracing::info!(path, "config file loaded");
                    cfg
                }
                Err(e) => {
                    tracing::warn!(path, error = %e, "config file invalid; ignoring");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(path, error = %e, "config file unreadable; ignoring");
                Self::default()
            }
        }
    }
}

impl Config {
    /// Load configuration: env vars over the optional file over defaults.
    pub fn load() -> Self {
        let file = FileConfig::load();

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .ok()
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("outbox.db"));

        Self {
            camera_device: env_string("ROLLCALL_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            subject_id: env_string("ROLLCALL_SUBJECT_ID")
                .or(file.subject_id)
                .unwrap_or_else(|| "unknown".to_string()),
            device_id: env_string("ROLLCALL_DEVICE_ID")
                .or(file.device_id)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            db_path,
            store_url: env_string("ROLLCALL_STORE_URL").or(file.store_url),
            store_token: env_string("ROLLCALL_STORE_TOKEN").or(file.store_token),
            signing_key: env_string("ROLLCALL_SIGNING_KEY")
                .or(file.signing_key)
                .unwrap_or_default(),
            scan_interval_ms: env_u64("ROLLCALL_SCAN_INTERVAL_MS")
                .or(file.scan_interval_ms)
                .unwrap_or(250),
            presence_confidence_threshold: env_f32("ROLLCALL_PRESENCE_THRESHOLD")
                .or(file.presence_confidence_threshold)
                .unwrap_or(0.85),
            presence_stable_required: env_usize("ROLLCALL_PRESENCE_STABLE_REQUIRED")
                .or(file.presence_stable_required)
                .unwrap_or(3),
            presence_window: env_usize("ROLLCALL_PRESENCE_WINDOW")
                .or(file.presence_window)
                .unwrap_or(5),
            correlation_window_ms: env_u64("ROLLCALL_CORRELATION_WINDOW_MS")
                .or(file.correlation_window_ms)
                .unwrap_or(5_000),
            outbox_max_attempts: env_u32("ROLLCALL_OUTBOX_MAX_ATTEMPTS")
                .or(file.outbox_max_attempts)
                .unwrap_or(8),
            outbox_backoff_base_ms: env_u64("ROLLCALL_OUTBOX_BACKOFF_BASE_MS")
                .or(file.outbox_backoff_base_ms)
                .unwrap_or(500),
            outbox_backoff_cap_ms: env_u64("ROLLCALL_OUTBOX_BACKOFF_CAP_MS")
                .or(file.outbox_backoff_cap_ms)
                .unwrap_or(60_000),
            outbox_poll_interval_ms: env_u64("ROLLCALL_OUTBOX_POLL_INTERVAL_MS")
                .or(file.outbox_poll_interval_ms)
                .unwrap_or(5_000),
            outbox_retention_ms: env_u64("ROLLCALL_OUTBOX_RETENTION_MS")
                .or(file.outbox_retention_ms)
                .unwrap_or(7 * 24 * 3_600 * 1_000),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_f32(key: &str) -> Option<f32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
