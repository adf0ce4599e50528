//! Field trap ingestion station.
//!
//! Probes in the field upload encrypted captures over a private TCP
//! protocol; the station authenticates and decrypts each payload, tracks
//! which devices exist and when they were last seen, runs detection on
//! every upload and keeps a rolling CSV ledger of per-device counts.
//!
//! # Module Structure
//!
//! - `wire`: the fixed-layout upload frame codec
//! - `envelope`: AES-256-GCM payload encryption under a pre-shared key
//! - `uid`: typed device identifier parsing
//! - `storage`: filesystem layout and stored-file naming
//! - `report`: the CSV report ledger with retry and fail-over
//! - `registry`: known devices, liveness and cycle tracking
//! - `context`: the explicitly-passed shared runtime state
//! - `server`: the ingestion accept loop
//! - `pipeline`: the per-media-class drain loop
//! - `sender`: the probe-side sending protocol
//! - `detect`: the detection collaborator seam
//!
//! Long-lived roles (server, pipelines, senders) are plain thread loops
//! taking the shared [`RuntimeContext`] and stopping cooperatively.

use std::sync::Arc;

use anyhow::Result;

pub mod config;
pub mod context;
pub mod detect;
pub mod envelope;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod sender;
pub mod server;
pub mod storage;
pub mod uid;
pub mod wire;

pub use config::StationConfig;
pub use context::{MediaClass, MediaRuntime, ProcessingDone, RuntimeContext};
pub use detect::{analyze_file, Analysis, Detector, DetectorRegistry, StubDetector};
pub use pipeline::{Processor, ProcessorHandle};
pub use registry::{classify, DeviceRegistry, DeviceStatus, Liveness};
pub use report::{ReportEntry, ReportStore};
pub use sender::{SenderClient, SenderConfig};
pub use server::{IngestServer, ServerHandle};
pub use uid::DeviceUid;
pub use wire::{decode_frame, encode_frame, Frame};

/// Build the shared runtime for a configuration: per-class registries
/// seeded from on-disk history, and the report store pointed at the
/// configured window directory.
pub fn build_runtime(cfg: &StationConfig) -> Result<Arc<RuntimeContext>> {
    let now = storage::now_s()?;
    let image = MediaRuntime::new(
        MediaClass::Image,
        cfg.image.offline_timeout_secs,
        cfg.image.cycle_timeout_secs,
        now,
    );
    let video = MediaRuntime::new(
        MediaClass::Video,
        cfg.video.offline_timeout_secs,
        cfg.video.cycle_timeout_secs,
        now,
    );

    for (media, settings) in [(&image, &cfg.image), (&video, &cfg.video)] {
        let record_dirs: Vec<_> = settings
            .types
            .iter()
            .map(|t| storage::record_dir(&cfg.storage_root, t, &cfg.record_suffix))
            .collect();
        let mut registry = context::lock_unpoisoned(&media.registry);
        registry.bootstrap_from_history(&record_dirs)?;
    }

    let report = ReportStore::new(
        cfg.report_dir(),
        &cfg.report.file_prefix,
        &cfg.report.file_suffix,
    );
    Ok(Arc::new(RuntimeContext::new(image, video, report)))
}
