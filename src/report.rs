//! CSV report ledger.
//!
//! Counts are persisted as one CSV file per reporting window, keyed by
//! device id: header row, then at most one row per device. An upsert for
//! a device already present overwrites its row in place; the whole file is
//! rewritten on every update. "The current file" is whichever file in the
//! report directory has the newest modification time.
//!
//! The primary file can be held open by an external reader (spreadsheet,
//! sync agent). File operations therefore run under a bounded retry, reads
//! fall back to a snapshot copy, and a write that keeps failing fails over
//! to a freshly named sibling file rather than dropping data.
//!
//! A [`ReportStore`] is not internally synchronized; concurrent producers
//! must share one store behind a mutex and hold it across `upsert`.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use rand::Rng;

use crate::storage;

/// Report column header. One row per device follows.
pub const HEADER: &str = "date,time,device_id,count";

const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const FAILOVER_ATTEMPTS: u32 = 3;

/// One ledger row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportEntry {
    /// Compact date, `YYYYMMDD`.
    pub date: String,
    /// Time of day, `HH:MM:SS`.
    pub time: String,
    /// Device code, e.g. `FL_000007`.
    pub device_id: String,
    pub count: u64,
}

/// CSV-backed keyed table of latest per-device counts for one window.
pub struct ReportStore {
    dir: PathBuf,
    prefix: String,
    suffix: String,
    current: PathBuf,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl ReportStore {
    /// Create a store rooted at `dir` with the window filename scheme
    /// `{prefix}{YYYY_MM_DD_HH_MM_SS}{suffix}`.
    pub fn new(dir: impl Into<PathBuf>, prefix: &str, suffix: &str) -> Self {
        let dir = dir.into();
        let current = dir.join(window_filename(prefix, suffix, None));
        Self {
            dir,
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            current,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the transient-failure retry policy.
    pub fn set_retry(&mut self, attempts: u32, delay: Duration) {
        self.retry_attempts = attempts.max(1);
        self.retry_delay = delay;
    }

    /// Path of the file upserts currently target.
    pub fn current_file(&self) -> &Path {
        &self.current
    }

    /// Point the store at the newest file in its directory, creating a
    /// fresh window file when the directory is empty.
    pub fn open_window(&mut self) -> Result<()> {
        match storage::latest_file(&self.dir)? {
            Some(path) => {
                self.current = path;
                Ok(())
            }
            None => self.create(),
        }
    }

    /// Create the current file with its header row.
    pub fn create(&mut self) -> Result<()> {
        storage::ensure_dir(&self.dir)?;
        let path = self.current.clone();
        self.with_retry("create", &path, |target| {
            std::fs::write(target, format!("{}\n", HEADER))
                .with_context(|| format!("creating report file {}", target.display()))
        })
    }

    /// Load the whole table, keyed by device id.
    ///
    /// A missing file is an empty mapping. A file locked by another writer
    /// is read through a best-effort snapshot copy; when no snapshot can be
    /// made either, the error surfaces to the caller.
    pub fn read_all(&mut self) -> Result<BTreeMap<String, ReportEntry>> {
        let path = self.current.clone();
        self.with_retry("read", &path, |target| read_entries(target))
    }

    /// Insert or overwrite the row for `device_id`, then rewrite the file.
    ///
    /// Last write wins; the table never grows a duplicate row for a device.
    /// When rewriting the primary path keeps failing, the data moves to a
    /// freshly named sibling file which becomes the new current file.
    pub fn upsert(&mut self, date: &str, time: &str, device_id: &str, count: u64) -> Result<()> {
        let mut entries = self.read_all()?;
        entries.insert(
            device_id.to_string(),
            ReportEntry {
                date: date.to_string(),
                time: time.to_string(),
                device_id: device_id.to_string(),
                count,
            },
        );
        self.write_all(&entries)
    }

    /// Rewrite the whole file: header, then one row per device in
    /// deterministic (device id) order.
    fn write_all(&mut self, entries: &BTreeMap<String, ReportEntry>) -> Result<()> {
        let mut body = String::with_capacity(64 + entries.len() * 32);
        body.push_str(HEADER);
        body.push('\n');
        for entry in entries.values() {
            body.push_str(&format!(
                "{},{},{},{}\n",
                entry.date, entry.time, entry.device_id, entry.count
            ));
        }

        let primary = self.current.clone();
        let dir = self.dir.clone();
        let prefix = self.prefix.clone();
        let suffix = self.suffix.clone();
        let written = self.with_retry("write", &primary.clone(), move |primary| {
            let mut target = primary.to_path_buf();
            let mut last_err = None;
            for attempt in 0..FAILOVER_ATTEMPTS {
                match std::fs::write(&target, body.as_bytes()) {
                    Ok(()) => return Ok(target),
                    Err(err) if is_contention(&err) && attempt + 1 < FAILOVER_ATTEMPTS => {
                        // Primary is held by someone else; take a new file
                        // rather than lose the rows.
                        last_err = Some(err);
                        target = dir.join(window_filename(&prefix, &suffix, Some(failover_tag())));
                        log::warn!(
                            "report file busy, retargeting write to {}",
                            target.display()
                        );
                    }
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("writing report file {}", target.display()))
                    }
                }
            }
            Err(anyhow!(
                "report write failed after {} fail-over attempts: {:?}",
                FAILOVER_ATTEMPTS,
                last_err
            ))
        })?;

        if written != self.current {
            log::warn!(
                "report window moved from {} to {}",
                self.current.display(),
                written.display()
            );
            self.current = written;
        }
        Ok(())
    }

    /// Run a file operation with the bounded transient-failure retry.
    fn with_retry<T>(
        &mut self,
        what: &str,
        path: &Path,
        mut op: impl FnMut(&Path) -> Result<T>,
    ) -> Result<T> {
        let attempts = self.retry_attempts;
        let mut last = None;
        for attempt in 1..=attempts {
            match op(path) {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt < attempts => {
                    log::warn!(
                        "report {} on {} busy (attempt {}/{}), retrying",
                        what,
                        path.display(),
                        attempt,
                        attempts
                    );
                    std::thread::sleep(self.retry_delay);
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| anyhow!("report {} on {} failed", what, path.display())))
    }
}

fn window_filename(prefix: &str, suffix: &str, failover: Option<String>) -> String {
    let stamp = Local::now().format("%Y_%m_%d_%H_%M_%S");
    match failover {
        Some(tag) => format!("{}{}_{}{}", prefix, stamp, tag, suffix),
        None => format!("{}{}{}", prefix, stamp, suffix),
    }
}

fn failover_tag() -> String {
    format!("{:03}", rand::thread_rng().gen_range(100..1000))
}

fn read_entries(path: &Path) -> Result<BTreeMap<String, ReportEntry>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) if is_contention(&err) => {
            // Locked by another writer; read a snapshot copy instead.
            match read_via_snapshot(path)? {
                Some(raw) => raw,
                None => {
                    return Err(err).with_context(|| {
                        format!("report file {} locked and unsnapshotable", path.display())
                    })
                }
            }
        }
        Err(err) => {
            return Err(err).with_context(|| format!("reading report file {}", path.display()))
        }
    };
    Ok(parse_rows(&raw))
}

fn read_via_snapshot(path: &Path) -> Result<Option<String>> {
    let snapshot = path.with_extension("snapshot_read.csv");
    if std::fs::copy(path, &snapshot).is_err() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&snapshot)
        .with_context(|| format!("reading report snapshot {}", snapshot.display()))?;
    let _ = std::fs::remove_file(&snapshot);
    Ok(Some(raw))
}

fn parse_rows(raw: &str) -> BTreeMap<String, ReportEntry> {
    let mut entries = BTreeMap::new();
    for line in raw.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(',');
        let (Some(date), Some(time), Some(device_id), Some(count)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            log::warn!("skipping malformed report row '{}'", line);
            continue;
        };
        let Ok(count) = count.trim().parse::<u64>() else {
            log::warn!("skipping report row with bad count '{}'", line);
            continue;
        };
        entries.insert(
            device_id.to_string(),
            ReportEntry {
                date: date.to_string(),
                time: time.to_string(),
                device_id: device_id.to_string(),
                count,
            },
        );
    }
    entries
}

fn is_contention(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::PermissionDenied | ErrorKind::WouldBlock
    )
}

fn is_transient(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .map(is_contention)
        .unwrap_or(false)
}
