use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use sentinelsight::config::SentinelConfig;
use sentinelsight::{Geometry, ObjectClass, ValidationError};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SENTINEL_CONFIG",
        "SENTINEL_DB_PATH",
        "SENTINEL_QUEUE_CAPACITY",
        "SENTINEL_TARGET_FPS",
        "SENTINEL_DEDUP_WINDOW_SECS",
        "SENTINEL_MQTT_BROKER",
        "SENTINEL_MQTT_ENABLED",
        "SENTINEL_DETECTOR",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "sentinel_prod.db",
        "ingest": { "queue_capacity": 5, "target_fps": 12, "stale_frame_secs": 20 },
        "backoff": { "base_ms": 500, "cap_ms": 8000, "jitter": 0.1 },
        "inference": { "confidence_threshold": 0.6, "classes": ["person"] },
        "tracker": { "max_distance_px": 120.0 },
        "rules": { "dedup_window_secs": 8, "loitering_threshold_secs": 45 },
        "metrics": { "interval_secs": 2 },
        "mqtt": { "topic_prefix": "site-a" },
        "cameras": [
            {
                "name": "Front door",
                "url": "rtsp://10.0.0.20/stream1",
                "location_tag": "entrance",
                "zones": [
                    {
                        "name": "porch",
                        "geometry": { "kind": "rectangle", "points": [[0, 0], [320, 240]] }
                    }
                ]
            }
        ]
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("SENTINEL_CONFIG", file.path());
    std::env::set_var("SENTINEL_TARGET_FPS", "8");
    std::env::set_var("SENTINEL_DEDUP_WINDOW_SECS", "3");
    std::env::set_var("SENTINEL_MQTT_ENABLED", "yes");
    std::env::set_var("SENTINEL_MQTT_BROKER", "broker.lan:1883");

    let cfg = SentinelConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "sentinel_prod.db");
    assert_eq!(cfg.ingest.queue_capacity, 5);
    assert_eq!(cfg.ingest.target_fps, 8);
    assert_eq!(cfg.ingest.stale_frame_secs, 20);
    assert_eq!(cfg.backoff.base_ms, 500);
    assert_eq!(cfg.backoff.cap_ms, 8_000);
    assert_eq!(cfg.inference.classes, vec![ObjectClass::Person]);
    assert_eq!(cfg.tracker.max_distance_px, 120.0);
    assert_eq!(cfg.rules.dedup_window, Duration::from_secs(3));
    assert_eq!(cfg.rules.loitering_threshold_secs, 45);
    assert_eq!(cfg.metrics_interval, Duration::from_secs(2));
    assert!(cfg.mqtt.enabled);
    assert_eq!(cfg.mqtt.broker_addr, "broker.lan:1883");
    assert_eq!(cfg.mqtt.topic_prefix, "site-a");

    assert_eq!(cfg.cameras.len(), 1);
    let seed = &cfg.cameras[0];
    assert_eq!(seed.location_tag.as_deref(), Some("entrance"));
    assert!(matches!(seed.zones[0].geometry, Geometry::Rectangle(_)));
    assert!(seed.zones[0].rules.is_none());

    let settings = cfg.pipeline_settings();
    assert_eq!(settings.version, 1);
    assert_eq!(settings.dedup_window_ms, 3_000);
    assert_eq!(settings.filter.confidence_threshold, 0.6);

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
db_path = "sentinel.toml.db"

[inference]
backend = "stub"
classes = ["person", "vehicle", "animal"]

[[cameras]]
name = "Yard"
url = "stub://yard"

[[cameras.zones]]
name = "shed"
geometry = { kind = "polygon", points = [[10.0, 10.0], [90.0, 10.0], [50.0, 80.0]] }
rules = { intrusion = false, loitering = { threshold_secs = 10 } }
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = SentinelConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(cfg.db_path, "sentinel.toml.db");
    assert_eq!(cfg.inference.classes.len(), 3);
    let zone = &cfg.cameras[0].zones[0];
    assert_eq!(zone.geometry.points().len(), 3);
    let rules = zone.rules.clone().expect("zone rules");
    assert!(!rules.intrusion);
    assert_eq!(rules.loitering.map(|l| l.threshold_secs), Some(10));

    clear_env();
}

#[test]
fn rejects_invalid_values_with_field_names() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cases = [
        (r#"{ "ingest": { "queue_capacity": 0 } }"#, "ingest.queue_capacity"),
        (r#"{ "backoff": { "base_ms": 5000, "cap_ms": 1000 } }"#, "backoff.cap_ms"),
        (r#"{ "inference": { "confidence_threshold": 1.5 } }"#, "inference.confidence_threshold"),
        (r#"{ "inference": { "classes": ["dragon"] } }"#, "inference.classes"),
        (r#"{ "rules": { "loitering_threshold_secs": 0 } }"#, "rules.loitering_threshold_secs"),
        (
            r#"{ "cameras": [ { "name": "x", "url": "ftp://nope/stream" } ] }"#,
            "stream_url",
        ),
        (
            r#"{ "cameras": [ { "name": "x", "url": "stub://x", "zones": [
                { "name": "line", "geometry": { "kind": "polygon", "points": [[0, 0], [5, 5]] } }
            ] } ] }"#,
            "zone.points",
        ),
    ];

    for (json, field) in cases {
        let mut file = NamedTempFile::new().expect("temp config");
        std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
        let err = SentinelConfig::load_from(Some(file.path())).unwrap_err();
        let validation = err
            .downcast_ref::<ValidationError>()
            .unwrap_or_else(|| panic!("expected validation error for {field}, got {err:#}"));
        assert_eq!(validation.field, field, "{json}");
    }

    clear_env();
}

#[test]
fn unknown_top_level_keys_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{ "retention_days": 7 }"#).expect("write config");
    assert!(SentinelConfig::load_from(Some(file.path())).is_err());

    clear_env();
}

#[test]
fn bad_env_override_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SENTINEL_QUEUE_CAPACITY", "lots");
    assert!(SentinelConfig::load_from(None).is_err());

    clear_env();
}
