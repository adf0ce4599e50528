//! Device registry and cycle tracking for one media class.
//!
//! The registry is the in-memory truth about which devices exist, when
//! each was last seen and which reported during the current cycle. It is
//! owned by the runtime context behind a mutex; nothing here synchronizes.
//!
//! Devices enter the registry two ways: a live upload, or the startup
//! history scan which seeds `-BOOT` placeholder UIDs from archived file
//! names. The first live sighting of the real UID absorbs its placeholder
//! so one physical device never shows up twice.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Result;

use crate::storage;
use crate::uid::DeviceUid;

/// Liveness of a device as a pure function of its last-seen time.
///
/// The boundary is exclusive: a device seen exactly `offline_timeout`
/// seconds ago is still active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Active,
    Offline,
}

pub fn classify(last_seen: u64, now: u64, offline_timeout: u64) -> Liveness {
    if now.saturating_sub(last_seen) > offline_timeout {
        Liveness::Offline
    } else {
        Liveness::Active
    }
}

/// A registry snapshot row for chart/report consumers.
#[derive(Clone, Debug)]
pub struct DeviceStatus {
    pub uid: String,
    pub last_seen: u64,
    pub liveness: Liveness,
}

/// Known devices, last-seen times and per-cycle arrivals for one media
/// class (image or video).
pub struct DeviceRegistry {
    offline_timeout: u64,
    cycle_timeout: u64,
    known: HashSet<String>,
    last_seen: HashMap<String, u64>,
    active: HashSet<String>,
    cycle_received: HashSet<String>,
    cycle_start: u64,
}

impl DeviceRegistry {
    pub fn new(offline_timeout: u64, cycle_timeout: u64, now: u64) -> Self {
        Self {
            offline_timeout,
            cycle_timeout,
            known: HashSet::new(),
            last_seen: HashMap::new(),
            active: HashSet::new(),
            cycle_received: HashSet::new(),
            cycle_start: now,
        }
    }

    /// Record a sighting: register the UID when unseen, then update its
    /// last-seen time and mark it active.
    pub fn register_or_touch(&mut self, uid: &str, now: u64) {
        if self.known.insert(uid.to_string()) {
            log::info!(
                "new device registered: {} (known devices now {})",
                uid,
                self.known.len()
            );
        }
        self.last_seen.insert(uid.to_string(), now);
        self.active.insert(uid.to_string());
    }

    /// Absorb the BOOT placeholder of a freshly sighted production UID.
    ///
    /// When `AA{TYPE}-{NNNNNN}-BOOT` is known for the same type and
    /// number, the later of the two last-seen timestamps migrates onto the
    /// real UID and the placeholder disappears from every set. Returns
    /// true when a merge happened.
    pub fn merge_boot_placeholder(&mut self, real: &DeviceUid) -> bool {
        if !real.is_production() {
            return false;
        }
        let boot_uid = real.boot_counterpart();
        if !self.known.contains(&boot_uid) {
            return false;
        }

        let real_uid = real.to_string();
        let boot_last = self.last_seen.get(&boot_uid).copied().unwrap_or(0);
        let real_last = self.last_seen.get(&real_uid).copied().unwrap_or(0);
        if boot_last > real_last {
            self.last_seen.insert(real_uid.clone(), boot_last);
        }

        self.known.remove(&boot_uid);
        self.last_seen.remove(&boot_uid);
        self.active.remove(&boot_uid);
        self.cycle_received.remove(&boot_uid);
        log::info!("merged boot placeholder {} into {}", boot_uid, real_uid);
        true
    }

    /// Seed the registry from archived file names so a restart does not
    /// make recently-active devices look freshly offline.
    ///
    /// Scans each record directory non-recursively for files following the
    /// stored-file naming convention and keeps the newest timestamp per
    /// device under a synthetic BOOT UID. Returns the number of devices
    /// seeded or refreshed.
    pub fn bootstrap_from_history(&mut self, record_dirs: &[impl AsRef<Path>]) -> Result<usize> {
        let mut seeded = 0usize;
        for dir in record_dirs {
            let dir = dir.as_ref();
            if !dir.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let meta = match storage::parse_filename(name) {
                    Ok(meta) => meta,
                    Err(_) => continue,
                };

                let uid = DeviceUid::boot(&meta.type_code, &meta.number).to_string();
                let prev = self.last_seen.get(&uid).copied().unwrap_or(0);
                if meta.epoch_s > prev {
                    self.last_seen.insert(uid.clone(), meta.epoch_s);
                }
                if self.known.insert(uid) {
                    seeded += 1;
                }
            }
        }
        if seeded > 0 {
            log::info!("bootstrapped {} device(s) from history", seeded);
        }
        Ok(seeded)
    }

    /// Note an arrival for the current cycle. The cycle start time resets
    /// when the received set goes from empty to non-empty.
    pub fn note_cycle_arrival(&mut self, uid: &str, now: u64) {
        let was_empty = self.cycle_received.is_empty();
        self.cycle_received.insert(uid.to_string());
        if was_empty {
            self.cycle_start = now;
        }
    }

    /// True when every known device has reported this cycle.
    pub fn cycle_complete(&self) -> bool {
        !self.known.is_empty() && self.cycle_received == self.known
    }

    /// True when a partially-received cycle has outlived its timeout and a
    /// consumer should process the partial batch rather than keep waiting.
    pub fn cycle_expired(&self, now: u64) -> bool {
        !self.cycle_received.is_empty() && now.saturating_sub(self.cycle_start) > self.cycle_timeout
    }

    /// Clear cycle state after a successful drain.
    pub fn clear_cycle(&mut self, now: u64) {
        self.cycle_received.clear();
        self.cycle_start = now;
    }

    pub fn cycle_start(&self) -> u64 {
        self.cycle_start
    }

    pub fn is_known(&self, uid: &str) -> bool {
        self.known.contains(uid)
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    pub fn last_seen(&self, uid: &str) -> Option<u64> {
        self.last_seen.get(uid).copied()
    }

    /// Liveness rows for every known device, computed against `now`.
    pub fn snapshot(&self, now: u64) -> Vec<DeviceStatus> {
        let mut rows: Vec<DeviceStatus> = self
            .known
            .iter()
            .map(|uid| {
                let last_seen = self.last_seen.get(uid).copied().unwrap_or(0);
                DeviceStatus {
                    uid: uid.clone(),
                    last_seen,
                    liveness: classify(last_seen, now, self.offline_timeout),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.uid.cmp(&b.uid));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_registers_then_touches() {
        let mut reg = DeviceRegistry::new(120, 300, 0);
        reg.register_or_touch("AAFL-000007-CAFAF", 100);
        assert!(reg.is_known("AAFL-000007-CAFAF"));
        assert_eq!(reg.last_seen("AAFL-000007-CAFAF"), Some(100));

        reg.register_or_touch("AAFL-000007-CAFAF", 150);
        assert_eq!(reg.known_count(), 1);
        assert_eq!(reg.last_seen("AAFL-000007-CAFAF"), Some(150));
    }

    #[test]
    fn merge_removes_placeholder_and_keeps_later_timestamp() {
        let mut reg = DeviceRegistry::new(120, 300, 0);
        reg.register_or_touch("AAFL-000007-BOOT", 1000);

        let real = DeviceUid::parse("AAFL-000007-CAFAF").expect("uid");
        reg.register_or_touch(&real.to_string(), 2000);
        assert!(reg.merge_boot_placeholder(&real));

        assert!(!reg.is_known("AAFL-000007-BOOT"));
        assert!(reg.is_known("AAFL-000007-CAFAF"));
        assert_eq!(reg.last_seen("AAFL-000007-CAFAF"), Some(2000));
        assert_eq!(reg.known_count(), 1);
    }

    #[test]
    fn merge_migrates_newer_placeholder_timestamp() {
        let mut reg = DeviceRegistry::new(120, 300, 0);
        reg.register_or_touch("AAYL-000021-BOOT", 5000);

        let real = DeviceUid::parse("AAYL-000021-CAFAF").expect("uid");
        reg.register_or_touch(&real.to_string(), 4000);
        assert!(reg.merge_boot_placeholder(&real));
        assert_eq!(reg.last_seen("AAYL-000021-CAFAF"), Some(5000));
    }

    #[test]
    fn merge_ignores_non_production_and_unknown_placeholders() {
        let mut reg = DeviceRegistry::new(120, 300, 0);
        let boot = DeviceUid::parse("AAFL-000001-BOOT").expect("uid");
        assert!(!reg.merge_boot_placeholder(&boot));

        let real = DeviceUid::parse("AAFL-000002-CAFAF").expect("uid");
        reg.register_or_touch(&real.to_string(), 10);
        assert!(!reg.merge_boot_placeholder(&real));
        assert_eq!(reg.known_count(), 1);
    }

    #[test]
    fn offline_boundary_is_exclusive() {
        assert_eq!(classify(0, 119, 120), Liveness::Active);
        assert_eq!(classify(0, 120, 120), Liveness::Active);
        assert_eq!(classify(0, 121, 120), Liveness::Offline);
    }

    #[test]
    fn cycle_tracks_completeness_and_start_reset() {
        let mut reg = DeviceRegistry::new(120, 300, 0);
        reg.register_or_touch("AAFL-000001-CAFAF", 10);
        reg.register_or_touch("AAFL-000002-CAFAF", 10);
        assert!(!reg.cycle_complete());

        reg.note_cycle_arrival("AAFL-000001-CAFAF", 40);
        assert_eq!(reg.cycle_start(), 40);
        reg.note_cycle_arrival("AAFL-000002-CAFAF", 55);
        assert_eq!(reg.cycle_start(), 40, "start only resets on empty set");
        assert!(reg.cycle_complete());

        reg.clear_cycle(60);
        assert!(!reg.cycle_complete());
        assert_eq!(reg.cycle_start(), 60);
    }

    #[test]
    fn cycle_expiry_requires_a_partial_round() {
        let mut reg = DeviceRegistry::new(120, 300, 0);
        assert!(!reg.cycle_expired(10_000), "empty cycle never expires");

        reg.register_or_touch("AAFL-000001-CAFAF", 10);
        reg.note_cycle_arrival("AAFL-000001-CAFAF", 100);
        assert!(!reg.cycle_expired(400));
        assert!(reg.cycle_expired(401));
    }

    #[test]
    fn bootstrap_seeds_boot_uids_with_newest_timestamp() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("FL_000007_2025-03-01_10-00-00.png"), "x").expect("write");
        std::fs::write(dir.path().join("FL_000007_2025-03-02_10-00-00.png"), "x").expect("write");
        std::fs::write(dir.path().join("YL_000021_2025-03-02_11-00-00.png"), "x").expect("write");
        std::fs::write(dir.path().join("not-a-record.txt"), "x").expect("write");

        let mut reg = DeviceRegistry::new(120, 300, 0);
        let seeded = reg
            .bootstrap_from_history(&[dir.path()])
            .expect("bootstrap");
        assert_eq!(seeded, 2);
        assert!(reg.is_known("AAFL-000007-BOOT"));
        assert!(reg.is_known("AAYL-000021-BOOT"));

        let older = storage::parse_filename("FL_000007_2025-03-01_10-00-00.png")
            .expect("meta")
            .epoch_s;
        let newer = storage::parse_filename("FL_000007_2025-03-02_10-00-00.png")
            .expect("meta")
            .epoch_s;
        assert!(newer > older);
        assert_eq!(reg.last_seen("AAFL-000007-BOOT"), Some(newer));
    }

    #[test]
    fn snapshot_is_sorted_and_classified() {
        let mut reg = DeviceRegistry::new(120, 300, 0);
        reg.register_or_touch("AAYL-000021-CAFAF", 100);
        reg.register_or_touch("AAFL-000007-CAFAF", 479);
        let rows = reg.snapshot(600);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].uid, "AAFL-000007-CAFAF");
        assert_eq!(rows[0].liveness, Liveness::Offline);
        assert_eq!(rows[1].liveness, Liveness::Offline);

        reg.register_or_touch("AAYL-000021-CAFAF", 500);
        let rows = reg.snapshot(600);
        assert_eq!(rows[1].liveness, Liveness::Active);
    }
}
