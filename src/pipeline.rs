//! Processing pipeline.
//!
//! One processor per media class drains that class's incoming directories:
//! parse the filename, run detection, upsert the report ledger, archive
//! the file (annotated copy preferred) and delete the temp file. The
//! processor idles on its class's condition variable, with the poll
//! interval as a safety net against missed notifications, and drains any
//! leftovers from a previous run once at startup.
//!
//! Malformed filenames are discarded with a warning and removed; they are
//! never retried and never mis-filed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};

use crate::config::StationConfig;
use crate::context::{lock_unpoisoned, MediaClass, RuntimeContext};
use crate::detect::{self, DetectorRegistry};
use crate::storage;

pub struct Processor {
    cfg: StationConfig,
    class: MediaClass,
    ctx: Arc<RuntimeContext>,
    detectors: Arc<DetectorRegistry>,
}

/// Running processor handle. `stop` requests a runtime-wide stop and
/// joins the drain loop.
pub struct ProcessorHandle {
    ctx: Arc<RuntimeContext>,
    join: Option<JoinHandle<()>>,
}

impl ProcessorHandle {
    pub fn stop(mut self) -> Result<()> {
        self.ctx.request_stop();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("processor thread panicked"))?;
        }
        Ok(())
    }
}

impl Processor {
    /// Build a processor and pre-create its incoming and record
    /// directories.
    pub fn new(
        cfg: StationConfig,
        class: MediaClass,
        ctx: Arc<RuntimeContext>,
        detectors: Arc<DetectorRegistry>,
    ) -> Result<Self> {
        for type_code in &cfg.media(class).types {
            storage::ensure_dir(&storage::incoming_dir(
                &cfg.storage_root,
                type_code,
                &cfg.incoming_suffix,
            ))?;
            storage::ensure_dir(&storage::record_dir(
                &cfg.storage_root,
                type_code,
                &cfg.record_suffix,
            ))?;
        }
        Ok(Self {
            cfg,
            class,
            ctx,
            detectors,
        })
    }

    /// Start the drain loop on its own thread.
    pub fn spawn(self) -> ProcessorHandle {
        let ctx = self.ctx.clone();
        let join = std::thread::spawn(move || {
            self.run();
        });
        ProcessorHandle {
            ctx,
            join: Some(join),
        }
    }

    fn run(&self) {
        // Crash/restart recovery: whatever the previous run left behind is
        // drained exactly once before entering the wait loop.
        match self.has_pending() {
            Ok(true) => {
                log::info!(
                    "{} pipeline draining files left over from a previous run",
                    self.class.label()
                );
                if let Err(err) = self.drain() {
                    log::error!("{} leftover drain failed: {:#}", self.class.label(), err);
                }
            }
            Ok(false) => {}
            Err(err) => log::error!("{} pipeline startup scan failed: {:#}", self.class.label(), err),
        }

        let media = self.ctx.media(self.class);
        let poll = self.cfg.media(self.class).poll;
        while !self.ctx.should_stop() {
            match self.has_pending() {
                Ok(true) => {}
                Ok(false) => {
                    media.wait_for_wakeup(poll);
                    if self.ctx.should_stop() {
                        break;
                    }
                    // Woken (or timed out); re-check before draining.
                    match self.has_pending() {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(err) => {
                            log::error!("{} pending scan failed: {:#}", self.class.label(), err);
                            continue;
                        }
                    }
                }
                Err(err) => {
                    log::error!("{} pending scan failed: {:#}", self.class.label(), err);
                    media.wait_for_wakeup(poll);
                    continue;
                }
            }

            if let Err(err) = self.drain() {
                log::error!("{} drain failed: {:#}", self.class.label(), err);
            }
        }
        log::info!("{} pipeline stopped", self.class.label());
    }

    /// All pending files across this class's types, sorted for
    /// deterministic processing order.
    pub fn pending_files(&self) -> Result<Vec<PathBuf>> {
        let settings = self.cfg.media(self.class);
        let extensions: Vec<&str> = settings.extensions.iter().map(String::as_str).collect();
        let mut files = Vec::new();
        for type_code in &settings.types {
            let dir =
                storage::incoming_dir(&self.cfg.storage_root, type_code, &self.cfg.incoming_suffix);
            files.extend(storage::files_with_extensions(&dir, &extensions)?);
        }
        files.sort();
        Ok(files)
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(!self.pending_files()?.is_empty())
    }

    /// Process every currently pending file in one pass.
    ///
    /// Returns the number of files processed. Per-file failures are logged
    /// and skip to the next file; the drain itself only fails when the
    /// report window cannot be opened at all.
    pub fn drain(&self) -> Result<usize> {
        let files = self.pending_files()?;
        if files.is_empty() {
            log::warn!("{} drain found nothing pending", self.class.label());
            return Ok(0);
        }

        {
            let mut report = lock_unpoisoned(&self.ctx.report);
            report.open_window()?;
        }

        let mut processed = 0usize;
        for file in &files {
            match self.process_file(file) {
                Ok(()) => processed += 1,
                Err(err) => log::error!("processing {} failed: {:#}", file.display(), err),
            }
            self.ctx.processing_done.set();
        }

        // Cycle bookkeeping resets only after a full pass.
        let now = storage::now_s()?;
        let media = self.ctx.media(self.class);
        lock_unpoisoned(&media.registry).clear_cycle(now);
        media.drain_arrivals();
        self.ctx.processing_done.set();
        Ok(processed)
    }

    /// Immediate path for one freshly saved file: analyze, upsert the
    /// shared ledger, archive, delete. Used by integrations that cannot
    /// wait for the batch drain.
    pub fn process_single(&self, path: &Path) -> Result<()> {
        {
            let mut report = lock_unpoisoned(&self.ctx.report);
            report.open_window()?;
        }
        self.process_file(path)?;
        self.ctx.processing_done.set();
        Ok(())
    }

    fn process_file(&self, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("unreadable file name {}", path.display()))?
            .to_string();

        let meta = match storage::parse_filename(&name) {
            Ok(meta) => meta,
            Err(err) => {
                log::warn!("discarding off-convention file {}: {:#}", name, err);
                std::fs::remove_file(path)
                    .with_context(|| format!("removing {}", path.display()))?;
                return Ok(());
            }
        };

        let device_code = meta.device_code();
        let analysis = detect::analyze_file(&self.detectors, path, &device_code);
        log::info!(
            "analyzed {} -> {} ({})",
            device_code,
            analysis.count,
            analysis.tag
        );

        {
            let mut report = lock_unpoisoned(&self.ctx.report);
            report.upsert(&meta.date, &meta.time, &device_code, analysis.count)?;
        }

        self.archive(path, &name, &meta.type_code, analysis.annotated.as_deref())
    }

    /// Move the file into the record directory, preferring an annotated
    /// version when detection produced one.
    fn archive(
        &self,
        path: &Path,
        name: &str,
        type_code: &str,
        annotated: Option<&[u8]>,
    ) -> Result<()> {
        let record =
            storage::record_dir(&self.cfg.storage_root, type_code, &self.cfg.record_suffix);
        storage::ensure_dir(&record)?;
        let target = record.join(name);

        let stored = match annotated {
            Some(bytes) => std::fs::write(&target, bytes)
                .with_context(|| format!("writing annotated copy {}", target.display())),
            None => std::fs::copy(path, &target)
                .map(|_| ())
                .with_context(|| format!("copying {} to {}", path.display(), target.display())),
        };

        match stored {
            Ok(()) => std::fs::remove_file(path)
                .with_context(|| format!("removing temp file {}", path.display())),
            Err(err) => {
                log::warn!("archive copy failed ({:#}), falling back to move", err);
                std::fs::rename(path, &target).with_context(|| {
                    format!("moving {} to {}", path.display(), target.display())
                })
            }
        }
    }
}
