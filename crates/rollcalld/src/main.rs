use anyhow::{Context, Result};
use rollcall_core::token::{HmacVerifier, TokenDecoder};
use rollcall_core::{MonotonicClock, PresencePolicy};
use rollcall_hw::{CameraSource, FrameSource, QualityPolicy, ReplaySource};
use rollcall_store::{run_replay, AttendanceStore, HttpStore, Outbox, ReplayPolicy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::AttendanceService;
use engine::{Engine, EngineConfig, NullScorer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load();
    tracing::info!(
        device_id = %config.device_id,
        subject = %config.subject_id,
        db = %config.db_path.display(),
        "rollcalld starting"
    );

    if config.signing_key.is_empty() {
        tracing::warn!("ROLLCALL_SIGNING_KEY is empty; every scanned token will fail verification");
    }

    let outbox = Arc::new(Outbox::open(&config.db_path).context("failed to open outbox journal")?);

    // Camera is optional: without one the daemon still accepts scans over the
    // bus, and tokens time out as NoPresence.
    let source: Box<dyn FrameSource> =
        match CameraSource::open(&config.camera_device, QualityPolicy::default()) {
            Ok(camera) => {
                tracing::info!(device = %config.camera_device, "camera opened");
                Box::new(camera)
            }
            Err(e) => {
                tracing::warn!(
                    device = %config.camera_device,
                    error = %e,
                    "camera unavailable; running without a frame source"
                );
                Box::new(ReplaySource::empty())
            }
        };

    let decoder = TokenDecoder::new(Box::new(HmacVerifier::new(config.signing_key.as_bytes())));
    let engine = Engine::new(
        EngineConfig {
            subject_id: config.subject_id.clone(),
            correlation_window_ms: config.correlation_window_ms,
            scan_interval_ms: config.scan_interval_ms,
            presence: PresencePolicy {
                confidence_threshold: config.presence_confidence_threshold,
                stable_required: config.presence_stable_required,
                window: config.presence_window,
            },
        },
        decoder,
        Box::new(NullScorer),
        None,
        outbox.clone(),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let handle = engine::spawn_engine(engine, source, MonotonicClock::new(), shutdown.clone());

    // Replay thread only makes sense with a store to deliver to; offline
    // devices accumulate Pending entries until one is configured.
    let replay_thread = match &config.store_url {
        Some(url) => {
            let store: Arc<dyn AttendanceStore> =
                Arc::new(HttpStore::new(url, config.store_token.clone())?);
            let policy = ReplayPolicy {
                max_attempts: config.outbox_max_attempts,
                backoff_base_ms: config.outbox_backoff_base_ms,
                backoff_cap_ms: config.outbox_backoff_cap_ms,
            };
            let outbox = outbox.clone();
            let shutdown = shutdown.clone();
            let poll = config.outbox_poll_interval_ms;
            let retention = config.outbox_retention_ms;
            tracing::info!(url, "store replay enabled");
            Some(
                std::thread::Builder::new()
                    .name("rollcall-replay".into())
                    .spawn(move || run_replay(outbox, store, policy, poll, retention, shutdown))
                    .context("failed to spawn replay thread")?,
            )
        }
        None => {
            tracing::warn!("no store configured; outbox entries will stay pending");
            None
        }
    };

    let service = AttendanceService::new(handle.clone(), outbox.clone());
    let _conn = zbus::connection::Builder::system()
        .context("failed to connect to system bus")?
        .name("org.rollcall.Attendance1")?
        .serve_at("/org/rollcall/Attendance1", service)?
        .build()
        .await
        .context("failed to register on system bus")?;
    tracing::info!("org.rollcall.Attendance1 registered");

    // Log the result stream until signaled.
    let mut results = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(result) = results.recv().await {
            tracing::info!(
                session = %result.session_id,
                outcome = %result.outcome,
                verified_at_ms = result.verified_at_ms,
                "verification result"
            );
        }
    });

    tracing::info!("rollcalld ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    shutdown.store(true, Ordering::Relaxed);
    if let Some(thread) = replay_thread {
        let _ = thread.join();
    }

    Ok(())
}
