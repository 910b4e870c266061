//! sentineld - SentinelSight camera ingestion and rule engine daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by SENTINEL_CONFIG, then SENTINEL_* overrides)
//! 2. Opens the SQLite store and resumes every persisted camera
//! 3. Registers seed cameras and zones from the config (and a synthetic demo camera with --demo)
//! 4. Publishes accepted events and camera status over MQTT when enabled
//! 5. Logs engine health until Ctrl-C, then shuts every worker down

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use sentinelsight::config::SeedCamera;
use sentinelsight::engine::EngineOptions;
use sentinelsight::{
    Camera, DetectorRegistry, Engine, Geometry, MqttNotifier, Notifier, Point, SentinelConfig,
    SqliteStore, StreamSourceFactory,
};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);
const DEMO_STREAM_URL: &str = "stub://demo";

#[derive(Parser, Debug)]
#[command(author, version, about = "SentinelSight camera ingestion and rule engine")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "SENTINEL_CONFIG")]
    config: Option<PathBuf>,

    /// Register a synthetic camera with a full-frame zone.
    #[arg(long)]
    demo: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = SentinelConfig::load_from(args.config.as_deref())?;
    let store = Arc::new(SqliteStore::open(&cfg.db_path)?);

    let mut detectors = DetectorRegistry::builtin(&cfg.inference);
    detectors.set_default(&cfg.inference.backend)?;

    let notifier: Option<Arc<dyn Notifier>> = if cfg.mqtt.enabled {
        match MqttNotifier::connect(&cfg.mqtt) {
            Ok(notifier) => Some(Arc::new(notifier)),
            Err(e) => {
                log::warn!("MQTT disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let engine = Engine::new(
        store,
        Arc::new(StreamSourceFactory::new(
            cfg.ingest.frame_width,
            cfg.ingest.frame_height,
        )),
        &detectors,
        notifier,
        EngineOptions {
            settings: cfg.pipeline_settings(),
            metrics_interval: cfg.metrics_interval,
            topic_prefix: cfg.mqtt.topic_prefix.clone(),
            ..EngineOptions::default()
        },
    )?;
    engine.start()?;

    for seed in &cfg.cameras {
        if let Err(e) = apply_seed(&engine, &cfg, seed) {
            log::warn!("seed camera '{}' skipped: {:#}", seed.name, e);
        }
    }
    if args.demo {
        register_demo(&engine, &cfg)?;
    }

    log::info!("sentineld running. writing to {}", cfg.db_path);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("install Ctrl-C handler")?;

    loop {
        match rx.recv_timeout(HEALTH_LOG_INTERVAL) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let health = engine.health();
                let metrics = engine.metrics_snapshot();
                log::info!(
                    "health={} cameras={}/{} online cpu={:.1}% rss={:.1}MiB sink_dropped={}",
                    health.status,
                    health.cameras_online,
                    health.cameras_total,
                    metrics.system.cpu_percent,
                    metrics.system.memory_mb,
                    health.sink_dropped
                );
                for camera in &metrics.cameras {
                    log::debug!(
                        "camera {} state={} fps={:.1} queue={}/{} dropped={} infer={:.1}ms",
                        camera.camera_id,
                        camera.state,
                        camera.fps,
                        camera.queue_depth,
                        camera.queue_capacity,
                        camera.dropped_frames,
                        camera.avg_inference_ms
                    );
                }
            }
            _ => break,
        }
    }

    log::info!("shutdown signal received, stopping cameras...");
    engine.shutdown();
    Ok(())
}

/// Register the seed camera unless its stream address is already known, then
/// upsert its zones by name.
fn apply_seed(engine: &Engine, cfg: &SentinelConfig, seed: &SeedCamera) -> Result<()> {
    let camera = find_or_register(engine, &seed.name, &seed.url, seed.location_tag.as_deref())?;
    for zone in &seed.zones {
        let rules = zone
            .rules
            .clone()
            .unwrap_or_else(|| cfg.rules.default_zone_rules());
        engine
            .upsert_zone(camera.id, &zone.name, zone.geometry.clone(), rules)
            .with_context(|| format!("zone '{}'", zone.name))?;
    }
    Ok(())
}

fn register_demo(engine: &Engine, cfg: &SentinelConfig) -> Result<()> {
    let camera = find_or_register(engine, "demo", DEMO_STREAM_URL, Some("synthetic"))?;
    let full_frame = Geometry::rectangle(
        Point::new(0.0, 0.0),
        Point::new(cfg.ingest.frame_width as f32, cfg.ingest.frame_height as f32),
    );
    let zone = engine.upsert_zone(
        camera.id,
        "full frame",
        full_frame,
        cfg.rules.default_zone_rules(),
    )?;
    log::info!("demo camera {} with zone {} ready", camera.id, zone.id);
    Ok(())
}

fn find_or_register(
    engine: &Engine,
    name: &str,
    url: &str,
    location_tag: Option<&str>,
) -> Result<Camera> {
    if let Some(existing) = engine
        .list_cameras()
        .into_iter()
        .find(|c| c.stream_url == url)
    {
        return Ok(existing);
    }
    engine.register_camera(name, url, location_tag)
}
