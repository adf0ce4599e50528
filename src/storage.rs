//! Filesystem layout and stored-file naming.
//!
//! Everything the station persists lives under one storage root:
//!
//! - `{root}/{TYPE}_{incoming_suffix}/` — freshly received uploads
//! - `{root}/{TYPE}_{record_suffix}/` — archived (possibly annotated) files
//! - `{root}/{report_dir}/` — the CSV report ledger
//!
//! Stored files are named `{TYPE}_{NNNNNN}_{YYYY-MM-DD}_{HH-MM-SS}.{ext}`.
//! The name is the only metadata a file carries, so building and parsing
//! it lives here and nowhere else.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};

/// Metadata recovered from a stored-file name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileMeta {
    /// Device type code, e.g. `FL`.
    pub type_code: String,
    /// Zero-padded device number, e.g. `000007`.
    pub number: String,
    /// Report date column, compact `YYYYMMDD`.
    pub date: String,
    /// Report time column, `HH:MM:SS`.
    pub time: String,
    /// Capture time as local epoch seconds.
    pub epoch_s: u64,
}

impl FileMeta {
    /// Device code used in report rows, e.g. `FL_000007`.
    pub fn device_code(&self) -> String {
        format!("{}_{}", self.type_code, self.number)
    }
}

/// Directory for freshly received files of one device type.
pub fn incoming_dir(root: &Path, type_code: &str, incoming_suffix: &str) -> PathBuf {
    root.join(format!("{}_{}", type_code, incoming_suffix))
}

/// Directory for archived files of one device type.
pub fn record_dir(root: &Path, type_code: &str, record_suffix: &str) -> PathBuf {
    root.join(format!("{}_{}", type_code, record_suffix))
}

/// Create a directory and its parents.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("creating directory {}", path.display()))
}

/// Build a stored-file name for a capture instant.
pub fn build_filename(
    type_code: &str,
    number: &str,
    when: DateTime<Local>,
    extension: &str,
) -> String {
    format!(
        "{}_{}_{}.{}",
        type_code,
        number,
        when.format("%Y-%m-%d_%H-%M-%S"),
        extension
    )
}

/// Parse a stored-file name back into its metadata.
///
/// Expects `{TYPE}_{NNNNNN}_{YYYY-MM-DD}_{HH-MM-SS}.{ext}`; anything else
/// is an error the caller turns into a discard-with-warning.
pub fn parse_filename(name: &str) -> Result<FileMeta> {
    let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 4 {
        return Err(anyhow!(
            "filename '{}' does not follow the naming convention",
            name
        ));
    }

    let type_code = parts[0].to_uppercase();
    let number = parts[1].to_string();
    let date_part = parts[2];
    let time_part = parts[3];

    let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .with_context(|| format!("filename '{}' has an invalid date part", name))?;
    let time = NaiveTime::parse_from_str(&time_part.replace('-', ":"), "%H:%M:%S")
        .with_context(|| format!("filename '{}' has an invalid time part", name))?;
    let naive = NaiveDateTime::new(date, time);
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| anyhow!("filename '{}' names a nonexistent local time", name))?;
    let epoch_s = u64::try_from(local.timestamp()).unwrap_or(0);

    Ok(FileMeta {
        type_code,
        number,
        date: date_part.replace('-', ""),
        time: time_part.replace('-', ":"),
        epoch_s,
    })
}

/// The file with the newest modification time in a directory.
///
/// Creates the directory when missing; an empty directory yields `None`.
pub fn latest_file(dir: &Path) -> Result<Option<PathBuf>> {
    ensure_dir(dir)?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("listing directory {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let replace = match &newest {
            Some((when, _)) => modified > *when,
            None => true,
        };
        if replace {
            newest = Some((modified, entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// Files directly inside `dir` whose extension is in `extensions`, sorted
/// by name for deterministic drain order. Non-recursive.
pub fn files_with_extensions(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    ensure_dir(dir)?;
    let mut files = Vec::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("listing directory {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_lowercase();
                extensions.iter().any(|want| *want == ext)
            })
            .unwrap_or(false);
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Current wall-clock epoch seconds.
pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}
