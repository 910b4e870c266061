use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::detect::{DetectionFilter, ObjectClass};
use crate::rules::{LoiteringRule, RuleConfig};
use crate::supervisor::Backoff;
use crate::tracker::TrackerSettings;
use crate::zone::Geometry;
use crate::{invalid, ValidationError};

const DEFAULT_DB_PATH: &str = "sentinelsight.db";
const DEFAULT_QUEUE_CAPACITY: usize = crate::frame::DEFAULT_QUEUE_CAPACITY;
const DEFAULT_TARGET_FPS: u32 = 15;
const DEFAULT_STALE_FRAME_SECS: u64 = 10;
const DEFAULT_FRAME_WIDTH: u32 = 640;
const DEFAULT_FRAME_HEIGHT: u32 = 480;
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_DEDUP_WINDOW_SECS: u64 = 5;
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 5;
const DEFAULT_MQTT_BROKER: &str = "127.0.0.1:1883";
const DEFAULT_MQTT_TOPIC_PREFIX: &str = "sentinelsight";
const DEFAULT_MQTT_CLIENT_ID: &str = "sentineld";

// -------------------- File layout --------------------

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SentinelConfigFile {
    db_path: Option<String>,
    ingest: Option<IngestConfigFile>,
    backoff: Option<BackoffConfigFile>,
    inference: Option<InferenceConfigFile>,
    tracker: Option<TrackerConfigFile>,
    rules: Option<RulesConfigFile>,
    metrics: Option<MetricsConfigFile>,
    mqtt: Option<MqttConfigFile>,
    cameras: Option<Vec<SeedCamera>>,
}

#[derive(Debug, Deserialize, Default)]
struct IngestConfigFile {
    queue_capacity: Option<usize>,
    target_fps: Option<u32>,
    stale_frame_secs: Option<u64>,
    frame_width: Option<u32>,
    frame_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct BackoffConfigFile {
    base_ms: Option<u64>,
    cap_ms: Option<u64>,
    jitter: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    classes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    max_distance_px: Option<f32>,
    gap_tolerance_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RulesConfigFile {
    dedup_window_secs: Option<u64>,
    intrusion_enabled: Option<bool>,
    loitering_enabled: Option<bool>,
    loitering_threshold_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MetricsConfigFile {
    interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    enabled: Option<bool>,
    broker_addr: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

/// Camera registered at startup unless one with the same address exists.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SeedCamera {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub location_tag: Option<String>,
    #[serde(default)]
    pub zones: Vec<SeedZone>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SeedZone {
    pub name: String,
    pub geometry: Geometry,
    /// Falls back to the `rules` section defaults when absent.
    #[serde(default)]
    pub rules: Option<RuleConfig>,
}

// -------------------- Resolved configuration --------------------

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub db_path: String,
    pub ingest: IngestConfig,
    pub backoff: Backoff,
    pub inference: InferenceConfig,
    pub tracker: TrackerSettings,
    pub rules: RulesConfig,
    pub metrics_interval: Duration,
    pub mqtt: MqttConfig,
    pub cameras: Vec<SeedCamera>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub queue_capacity: usize,
    pub target_fps: u32,
    pub stale_frame_secs: u64,
    pub frame_width: u32,
    pub frame_height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub confidence_threshold: f32,
    pub classes: Vec<ObjectClass>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR.to_string(),
            model_path: None,
            confidence_threshold: 0.5,
            classes: vec![ObjectClass::Person, ObjectClass::Vehicle],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RulesConfig {
    pub dedup_window: Duration,
    pub intrusion_enabled: bool,
    pub loitering_enabled: bool,
    pub loitering_threshold_secs: u64,
}

impl RulesConfig {
    /// Rule set applied to seed zones that do not carry their own.
    pub fn default_zone_rules(&self) -> RuleConfig {
        RuleConfig {
            intrusion: self.intrusion_enabled,
            loitering: self.loitering_enabled.then_some(LoiteringRule {
                threshold_secs: self.loitering_threshold_secs,
            }),
            ..RuleConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_addr: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SentinelConfig {
    /// Load from the file named by `SENTINEL_CONFIG` (if any), then apply
    /// environment overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTINEL_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentinelConfigFile) -> Result<Self> {
        let ingest = file.ingest.unwrap_or_default();
        let backoff = file.backoff.unwrap_or_default();
        let inference = file.inference.unwrap_or_default();
        let tracker = file.tracker.unwrap_or_default();
        let rules = file.rules.unwrap_or_default();
        let mqtt = file.mqtt.unwrap_or_default();
        let defaults = InferenceConfig::default();

        let classes = match inference.classes {
            Some(names) => names
                .iter()
                .map(|name| {
                    name.parse::<ObjectClass>()
                        .map_err(|_| ValidationError::new("inference.classes", format!("unknown class '{name}'")))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?,
            None => defaults.classes,
        };

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            ingest: IngestConfig {
                queue_capacity: ingest.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
                target_fps: ingest.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                stale_frame_secs: ingest.stale_frame_secs.unwrap_or(DEFAULT_STALE_FRAME_SECS),
                frame_width: ingest.frame_width.unwrap_or(DEFAULT_FRAME_WIDTH),
                frame_height: ingest.frame_height.unwrap_or(DEFAULT_FRAME_HEIGHT),
            },
            backoff: Backoff {
                base_ms: backoff.base_ms.unwrap_or(Backoff::default().base_ms),
                cap_ms: backoff.cap_ms.unwrap_or(Backoff::default().cap_ms),
                jitter: backoff.jitter.unwrap_or(Backoff::default().jitter),
            },
            inference: InferenceConfig {
                backend: inference.backend.unwrap_or(defaults.backend),
                model_path: inference.model_path,
                confidence_threshold: inference
                    .confidence_threshold
                    .unwrap_or(defaults.confidence_threshold),
                classes,
            },
            tracker: TrackerSettings {
                max_distance_px: tracker
                    .max_distance_px
                    .unwrap_or(TrackerSettings::default().max_distance_px),
                gap_tolerance_ms: tracker
                    .gap_tolerance_ms
                    .unwrap_or(TrackerSettings::default().gap_tolerance_ms),
            },
            rules: RulesConfig {
                dedup_window: Duration::from_secs(
                    rules.dedup_window_secs.unwrap_or(DEFAULT_DEDUP_WINDOW_SECS),
                ),
                intrusion_enabled: rules.intrusion_enabled.unwrap_or(true),
                loitering_enabled: rules.loitering_enabled.unwrap_or(true),
                loitering_threshold_secs: rules
                    .loitering_threshold_secs
                    .unwrap_or(crate::rules::DEFAULT_LOITERING_THRESHOLD_SECS),
            },
            metrics_interval: Duration::from_secs(
                file.metrics
                    .and_then(|metrics| metrics.interval_secs)
                    .unwrap_or(DEFAULT_METRICS_INTERVAL_SECS),
            ),
            mqtt: MqttConfig {
                enabled: mqtt.enabled.unwrap_or(false),
                broker_addr: mqtt
                    .broker_addr
                    .unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
                topic_prefix: mqtt
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_MQTT_TOPIC_PREFIX.to_string()),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                username: mqtt.username,
                password: mqtt.password,
            },
            cameras: file.cameras.unwrap_or_default(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SENTINEL_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(capacity) = std::env::var("SENTINEL_QUEUE_CAPACITY") {
            self.ingest.queue_capacity = capacity
                .trim()
                .parse()
                .map_err(|_| anyhow!("SENTINEL_QUEUE_CAPACITY must be a positive integer"))?;
        }
        if let Ok(fps) = std::env::var("SENTINEL_TARGET_FPS") {
            self.ingest.target_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("SENTINEL_TARGET_FPS must be a positive integer"))?;
        }
        if let Ok(window) = std::env::var("SENTINEL_DEDUP_WINDOW_SECS") {
            let seconds: u64 = window.trim().parse().map_err(|_| {
                anyhow!("SENTINEL_DEDUP_WINDOW_SECS must be an integer number of seconds")
            })?;
            self.rules.dedup_window = Duration::from_secs(seconds);
        }
        if let Ok(broker) = std::env::var("SENTINEL_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                self.mqtt.broker_addr = broker.trim().to_string();
            }
        }
        if let Ok(enabled) = std::env::var("SENTINEL_MQTT_ENABLED") {
            self.mqtt.enabled = parse_bool(&enabled)
                .ok_or_else(|| anyhow!("SENTINEL_MQTT_ENABLED must be true or false"))?;
        }
        if let Ok(detector) = std::env::var("SENTINEL_DETECTOR") {
            if !detector.trim().is_empty() {
                self.inference.backend = detector.trim().to_lowercase();
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return invalid("db_path", "must not be empty");
        }
        if self.ingest.queue_capacity == 0 {
            return invalid("ingest.queue_capacity", "must be at least 1");
        }
        if self.ingest.target_fps == 0 {
            return invalid("ingest.target_fps", "must be at least 1");
        }
        if self.ingest.stale_frame_secs == 0 {
            return invalid("ingest.stale_frame_secs", "must be greater than zero");
        }
        if self.ingest.frame_width == 0 || self.ingest.frame_height == 0 {
            return invalid("ingest.frame_width", "frame size must be non-zero");
        }
        validate_backoff(&self.backoff)?;
        validate_filter(self.inference.confidence_threshold, &self.inference.classes)?;
        validate_tracker(&self.tracker)?;
        if self.rules.dedup_window.is_zero() {
            return invalid("rules.dedup_window_secs", "must be greater than zero");
        }
        if self.rules.loitering_threshold_secs == 0 {
            return invalid("rules.loitering_threshold_secs", "must be greater than zero");
        }
        if self.metrics_interval.is_zero() {
            return invalid("metrics.interval_secs", "must be greater than zero");
        }
        if self.mqtt.enabled {
            let (host, port) = self.mqtt.broker()?;
            if host.is_empty() || port == 0 {
                return invalid("mqtt.broker_addr", "expected host:port");
            }
            if self.mqtt.topic_prefix.trim().is_empty() {
                return invalid("mqtt.topic_prefix", "must not be empty");
            }
        }
        for camera in &self.cameras {
            crate::ingest::validate_stream_url(&camera.url)?;
            for zone in &camera.zones {
                zone.geometry.validate()?;
                if let Some(rules) = &zone.rules {
                    rules.validate()?;
                }
            }
        }
        Ok(())
    }

    /// Pipeline parameters, as the first settings version.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            version: 1,
            queue_capacity: self.ingest.queue_capacity,
            target_fps: self.ingest.target_fps,
            stale_frame_secs: self.ingest.stale_frame_secs,
            backoff: self.backoff,
            filter: DetectionFilter {
                confidence_threshold: self.inference.confidence_threshold,
                classes: self.inference.classes.clone(),
            },
            tracker: self.tracker,
            dedup_window_ms: self.rules.dedup_window.as_millis() as u64,
        }
    }
}

impl MqttConfig {
    /// `mqtts://` and `ssl://` prefixes select TLS.
    pub fn use_tls(&self) -> bool {
        matches!(self.scheme(), Some("mqtts" | "ssl"))
    }

    fn scheme(&self) -> Option<&str> {
        self.broker_addr.split_once("://").map(|(scheme, _)| scheme)
    }

    /// Split `broker_addr` into host and port, ignoring any scheme prefix.
    pub fn broker(&self) -> Result<(String, u16)> {
        let addr = match self.broker_addr.split_once("://") {
            Some((scheme, rest)) => match scheme {
                "mqtt" | "tcp" | "mqtts" | "ssl" => rest,
                other => return invalid("mqtt.broker_addr", format!("unsupported scheme '{other}'")),
            },
            None => self.broker_addr.as_str(),
        };
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ValidationError::new("mqtt.broker_addr", "expected host:port"))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ValidationError::new("mqtt.broker_addr", format!("invalid port '{port}'")))?;
        Ok((host.to_string(), port))
    }
}

// -------------------- Pipeline settings --------------------

/// Immutable, versioned snapshot of the parameters workers read at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub version: u64,
    /// Applies to cameras registered after the snapshot is installed.
    pub queue_capacity: usize,
    /// Default sampling rate for newly registered cameras.
    pub target_fps: u32,
    pub stale_frame_secs: u64,
    pub backoff: Backoff,
    pub filter: DetectionFilter,
    pub tracker: TrackerSettings,
    pub dedup_window_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            version: 1,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            target_fps: DEFAULT_TARGET_FPS,
            stale_frame_secs: DEFAULT_STALE_FRAME_SECS,
            backoff: Backoff::default(),
            filter: DetectionFilter::default(),
            tracker: TrackerSettings::default(),
            dedup_window_ms: DEFAULT_DEDUP_WINDOW_SECS * 1_000,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return invalid("queue_capacity", "must be at least 1");
        }
        if self.target_fps == 0 {
            return invalid("target_fps", "must be at least 1");
        }
        if self.stale_frame_secs == 0 {
            return invalid("stale_frame_secs", "must be greater than zero");
        }
        if self.dedup_window_ms == 0 {
            return invalid("dedup_window", "must be greater than zero");
        }
        validate_backoff(&self.backoff)?;
        validate_filter(self.filter.confidence_threshold, &self.filter.classes)?;
        validate_tracker(&self.tracker)
    }
}

/// Holder of the current settings snapshot. Readers clone the `Arc`;
/// `replace` swaps in a new version atomically.
#[derive(Debug)]
pub struct SettingsHandle {
    current: RwLock<Arc<PipelineSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            current: RwLock::new(Arc::new(settings)),
        }
    }

    pub fn current(&self) -> Arc<PipelineSettings> {
        self.current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Validate and install `settings` as the next version. Returns the new version.
    pub fn replace(&self, mut settings: PipelineSettings) -> Result<u64> {
        settings.validate()?;
        let mut current = self.current.write().unwrap_or_else(|p| p.into_inner());
        settings.version = current.version + 1;
        let version = settings.version;
        *current = Arc::new(settings);
        Ok(version)
    }
}

// -------------------- Helpers --------------------

fn validate_backoff(backoff: &Backoff) -> Result<()> {
    if backoff.base_ms == 0 {
        return invalid("backoff.base_ms", "must be greater than zero");
    }
    if backoff.base_ms > backoff.cap_ms {
        return invalid("backoff.cap_ms", "must not be smaller than backoff.base_ms");
    }
    if !(0.0..1.0).contains(&backoff.jitter) {
        return invalid("backoff.jitter", "must be in [0, 1)");
    }
    Ok(())
}

fn validate_filter(threshold: f32, classes: &[ObjectClass]) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return invalid("inference.confidence_threshold", "must be in [0, 1]");
    }
    if classes.is_empty() {
        return invalid("inference.classes", "must name at least one class");
    }
    Ok(())
}

fn validate_tracker(tracker: &TrackerSettings) -> Result<()> {
    if !(tracker.max_distance_px.is_finite() && tracker.max_distance_px > 0.0) {
        return invalid("tracker.max_distance_px", "must be a positive number");
    }
    if tracker.gap_tolerance_ms == 0 {
        return invalid("tracker.gap_tolerance_ms", "must be greater than zero");
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<SentinelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
