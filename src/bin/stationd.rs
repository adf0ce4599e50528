//! stationd - field trap ingestion daemon
//!
//! This daemon:
//! 1. Loads the station configuration (file, then environment)
//! 2. Seeds the device registries from on-disk history
//! 3. Accepts encrypted uploads on the ingestion socket
//! 4. Drains uploads through the per-class detection pipelines
//! 5. Maintains the rolling CSV report ledger
//!
//! SIGINT/SIGTERM request a cooperative stop; every role joins cleanly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use trapnet::context::lock_unpoisoned;
use trapnet::{
    build_runtime, DetectorRegistry, IngestServer, Liveness, MediaClass, Processor, StationConfig,
};

const OBSERVER_WAIT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = StationConfig::load()?;
    log::info!(
        "station starting: listen={} storage={}",
        cfg.listen_addr,
        cfg.storage_root.display()
    );

    let ctx = build_runtime(&cfg)?;
    let detectors = Arc::new(DetectorRegistry::stub());

    let image_pipeline = Processor::new(
        cfg.clone(),
        MediaClass::Image,
        ctx.clone(),
        detectors.clone(),
    )?
    .spawn();
    let video_pipeline =
        Processor::new(cfg.clone(), MediaClass::Video, ctx.clone(), detectors)?.spawn();
    let server = IngestServer::new(cfg.clone(), ctx.clone())?.spawn()?;
    if let Some(addr) = server.addr {
        log::info!("ingest listening on {}", addr);
    }

    let stop_ctx = ctx.clone();
    ctrlc::set_handler(move || {
        log::info!("stop requested");
        stop_ctx.request_stop();
    })?;

    // Passive observer loop: wake on processing-done (or the timeout
    // safety net) and report device liveness, the way a chart layer would.
    while !ctx.should_stop() {
        let fired = ctx.processing_done.wait_timeout(OBSERVER_WAIT);
        if ctx.should_stop() {
            break;
        }
        if fired {
            let now = trapnet::storage::now_s()?;
            for (label, media) in [("image", &ctx.image), ("video", &ctx.video)] {
                let snapshot = lock_unpoisoned(&media.registry).snapshot(now);
                if snapshot.is_empty() {
                    continue;
                }
                let active = snapshot
                    .iter()
                    .filter(|row| row.liveness == Liveness::Active)
                    .count();
                log::info!(
                    "{} devices: {} known, {} active",
                    label,
                    snapshot.len(),
                    active
                );
            }
        }
    }

    server.stop()?;
    image_pipeline.stop()?;
    video_pipeline.stop()?;
    log::info!("station stopped");
    Ok(())
}
