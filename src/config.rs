use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::envelope;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_ACCEPT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_LOOP_DELAY_MS: u64 = 100;
const DEFAULT_PATCH_SIZE: usize = 1024;
const DEFAULT_STORAGE_ROOT: &str = "./data_station";
const DEFAULT_INCOMING_SUFFIX: &str = "temp";
const DEFAULT_RECORD_SUFFIX: &str = "Record";
const DEFAULT_IMAGE_TYPES: &[&str] = &["FL", "YL"];
const DEFAULT_VIDEO_TYPES: &[&str] = &["SL"];
const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];
const DEFAULT_VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mkv", "wmv", "webm"];
const DEFAULT_IMAGE_POLL_SECS: u64 = 5;
const DEFAULT_VIDEO_POLL_SECS: u64 = 5;
const DEFAULT_IMAGE_OFFLINE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_VIDEO_OFFLINE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_IMAGE_CYCLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_VIDEO_CYCLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_REPORT_DIR: &str = "report";
const DEFAULT_REPORT_PREFIX: &str = "report_";
const DEFAULT_REPORT_SUFFIX: &str = ".csv";
// The key every probe ships with; deployments override it.
const DEFAULT_SHARED_KEY: &str = "MySuperSecretKey32BytesLongPassw";

#[derive(Debug, Deserialize, Default)]
struct StationConfigFile {
    server: Option<ServerSection>,
    storage: Option<StorageSection>,
    image: Option<MediaSection>,
    video: Option<MediaSection>,
    report: Option<ReportSection>,
    crypto: Option<CryptoSection>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerSection {
    listen_addr: Option<String>,
    accept_timeout_ms: Option<u64>,
    loop_delay_ms: Option<u64>,
    patch_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageSection {
    root: Option<PathBuf>,
    incoming_suffix: Option<String>,
    record_suffix: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MediaSection {
    types: Option<Vec<String>>,
    extensions: Option<Vec<String>>,
    poll_secs: Option<u64>,
    offline_timeout_secs: Option<u64>,
    cycle_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ReportSection {
    dir_name: Option<String>,
    file_prefix: Option<String>,
    file_suffix: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CryptoSection {
    shared_key: Option<String>,
}

/// Per-media-class settings.
#[derive(Debug, Clone)]
pub struct MediaSettings {
    /// Device types this class serves, e.g. `["FL", "YL"]`.
    pub types: Vec<String>,
    /// Payload file extensions this class drains.
    pub extensions: Vec<String>,
    /// Pipeline wakeup safety-net interval.
    pub poll: Duration,
    /// Seconds since last sighting after which a device counts as offline.
    pub offline_timeout_secs: u64,
    /// Bound on waiting for a complete reporting round.
    pub cycle_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub dir_name: String,
    pub file_prefix: String,
    pub file_suffix: String,
}

/// Station configuration: file values, then environment overrides, then
/// validation. Invalid configuration is fatal at startup.
#[derive(Debug, Clone)]
pub struct StationConfig {
    pub listen_addr: String,
    pub accept_timeout: Duration,
    pub loop_delay: Duration,
    pub patch_size: usize,
    pub storage_root: PathBuf,
    pub incoming_suffix: String,
    pub record_suffix: String,
    pub image: MediaSettings,
    pub video: MediaSettings,
    pub report: ReportSettings,
    shared_key: String,
}

impl StationConfig {
    /// Load from the file named by `STATION_CONFIG` (when set), apply
    /// `STATION_*` environment overrides, validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("STATION_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults with no file and no environment. Used by tests and the
    /// sender simulator.
    pub fn defaults() -> Self {
        Self::from_file(StationConfigFile::default())
    }

    fn from_file(file: StationConfigFile) -> Self {
        let server = file.server.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let image = file.image.unwrap_or_default();
        let video = file.video.unwrap_or_default();
        let report = file.report.unwrap_or_default();
        let crypto = file.crypto.unwrap_or_default();

        Self {
            listen_addr: server
                .listen_addr
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            accept_timeout: Duration::from_millis(
                server.accept_timeout_ms.unwrap_or(DEFAULT_ACCEPT_TIMEOUT_MS),
            ),
            loop_delay: Duration::from_millis(server.loop_delay_ms.unwrap_or(DEFAULT_LOOP_DELAY_MS)),
            patch_size: server.patch_size.unwrap_or(DEFAULT_PATCH_SIZE),
            storage_root: storage
                .root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT)),
            incoming_suffix: storage
                .incoming_suffix
                .unwrap_or_else(|| DEFAULT_INCOMING_SUFFIX.to_string()),
            record_suffix: storage
                .record_suffix
                .unwrap_or_else(|| DEFAULT_RECORD_SUFFIX.to_string()),
            image: media_settings(
                image,
                DEFAULT_IMAGE_TYPES,
                DEFAULT_IMAGE_EXTENSIONS,
                DEFAULT_IMAGE_POLL_SECS,
                DEFAULT_IMAGE_OFFLINE_TIMEOUT_SECS,
                DEFAULT_IMAGE_CYCLE_TIMEOUT_SECS,
            ),
            video: media_settings(
                video,
                DEFAULT_VIDEO_TYPES,
                DEFAULT_VIDEO_EXTENSIONS,
                DEFAULT_VIDEO_POLL_SECS,
                DEFAULT_VIDEO_OFFLINE_TIMEOUT_SECS,
                DEFAULT_VIDEO_CYCLE_TIMEOUT_SECS,
            ),
            report: ReportSettings {
                dir_name: report
                    .dir_name
                    .unwrap_or_else(|| DEFAULT_REPORT_DIR.to_string()),
                file_prefix: report
                    .file_prefix
                    .unwrap_or_else(|| DEFAULT_REPORT_PREFIX.to_string()),
                file_suffix: report
                    .file_suffix
                    .unwrap_or_else(|| DEFAULT_REPORT_SUFFIX.to_string()),
            },
            shared_key: crypto
                .shared_key
                .unwrap_or_else(|| DEFAULT_SHARED_KEY.to_string()),
        }
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("STATION_LISTEN_ADDR") {
            if !addr.trim().is_empty() {
                self.listen_addr = addr;
            }
        }
        if let Ok(root) = std::env::var("STATION_STORAGE_ROOT") {
            if !root.trim().is_empty() {
                self.storage_root = PathBuf::from(root);
            }
        }
        if let Ok(key) = std::env::var("STATION_SHARED_KEY") {
            if !key.trim().is_empty() {
                self.shared_key = key;
            }
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.patch_size == 0 {
            return Err(anyhow!("server.patch_size must be greater than zero"));
        }
        if self.image.types.is_empty() || self.video.types.is_empty() {
            return Err(anyhow!("each media class needs at least one device type"));
        }
        for settings in [&mut self.image, &mut self.video] {
            for type_code in &mut settings.types {
                *type_code = type_code.to_uppercase();
            }
            for ext in &mut settings.extensions {
                *ext = ext.to_lowercase();
            }
            if settings.poll.is_zero() {
                return Err(anyhow!("media poll interval must be greater than zero"));
            }
        }
        // Fail now, not on the first frame.
        envelope::key_from_config(&self.shared_key)?;
        Ok(())
    }

    /// The parsed 32-byte shared key.
    pub fn key(&self) -> Result<[u8; envelope::KEY_LEN]> {
        envelope::key_from_config(&self.shared_key)
    }

    /// Settings for one media class.
    pub fn media(&self, class: crate::context::MediaClass) -> &MediaSettings {
        match class {
            crate::context::MediaClass::Image => &self.image,
            crate::context::MediaClass::Video => &self.video,
        }
    }

    /// Absolute report directory.
    pub fn report_dir(&self) -> PathBuf {
        self.storage_root.join(&self.report.dir_name)
    }
}

fn media_settings(
    section: MediaSection,
    default_types: &[&str],
    default_extensions: &[&str],
    default_poll_secs: u64,
    default_offline_secs: u64,
    default_cycle_secs: u64,
) -> MediaSettings {
    MediaSettings {
        types: section
            .types
            .unwrap_or_else(|| default_types.iter().map(|t| t.to_string()).collect()),
        extensions: section
            .extensions
            .unwrap_or_else(|| default_extensions.iter().map(|e| e.to_string()).collect()),
        poll: Duration::from_secs(section.poll_secs.unwrap_or(default_poll_secs)),
        offline_timeout_secs: section.offline_timeout_secs.unwrap_or(default_offline_secs),
        cycle_timeout_secs: section.cycle_timeout_secs.unwrap_or(default_cycle_secs),
    }
}

fn read_config_file(path: &Path) -> Result<StationConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let mut cfg = StationConfig::defaults();
        cfg.validate().expect("defaults validate");
        assert_eq!(cfg.listen_addr, "0.0.0.0:8000");
        assert_eq!(cfg.image.types, vec!["FL", "YL"]);
        assert_eq!(cfg.video.types, vec!["SL"]);
        assert_eq!(cfg.image.offline_timeout_secs, 120);
        cfg.key().expect("default key parses");
    }

    #[test]
    fn file_values_override_defaults() {
        let raw = r#"
            [server]
            listen_addr = "127.0.0.1:9100"
            patch_size = 4096

            [storage]
            root = "/var/lib/station"
            incoming_suffix = "incoming"

            [image]
            types = ["fl"]
            poll_secs = 2
            offline_timeout_secs = 60

            [crypto]
            shared_key = "0000000000000000000000000000000000000000000000000000000000000000"
        "#;
        let file: StationConfigFile = toml::from_str(raw).expect("parse");
        let mut cfg = StationConfig::from_file(file);
        cfg.validate().expect("validate");

        assert_eq!(cfg.listen_addr, "127.0.0.1:9100");
        assert_eq!(cfg.patch_size, 4096);
        assert_eq!(cfg.storage_root, PathBuf::from("/var/lib/station"));
        assert_eq!(cfg.incoming_suffix, "incoming");
        assert_eq!(cfg.image.types, vec!["FL"], "types are uppercased");
        assert_eq!(cfg.image.poll, Duration::from_secs(2));
        assert_eq!(cfg.image.offline_timeout_secs, 60);
        assert_eq!(cfg.key().expect("key"), [0u8; 32]);
        assert_eq!(cfg.video.types, vec!["SL"], "untouched sections keep defaults");
    }

    #[test]
    fn bad_values_fail_validation() {
        let file: StationConfigFile = toml::from_str("[server]\npatch_size = 0\n").expect("parse");
        assert!(StationConfig::from_file(file).validate().is_err());

        let file: StationConfigFile =
            toml::from_str("[crypto]\nshared_key = \"short\"\n").expect("parse");
        assert!(StationConfig::from_file(file).validate().is_err());
    }
}
