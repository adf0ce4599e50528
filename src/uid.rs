//! Device identifier parsing.
//!
//! Every probe identifies itself with a UID of the form
//! `AA{TYPE}-{NNNNNN}-{SUFFIX}` (e.g. `AAFL-000007-CAFAF`). The leading
//! two characters are a fixed vendor tag, `TYPE` selects the detection
//! model, `NNNNNN` is the zero-padded device number and the suffix marks
//! provenance. This module is the only place a UID string is decomposed;
//! everything else works with the typed [`DeviceUid`].

use std::fmt;
use std::sync::OnceLock;

use anyhow::{anyhow, Result};

/// Fixed vendor tag prefixed to every UID on the wire.
pub const VENDOR_TAG: &str = "AA";

/// Suffix assigned to production devices by the manufacturer.
pub const PRODUCTION_SUFFIX: &str = "CAFAF";

/// Suffix of placeholder UIDs synthesized from on-disk history at startup.
pub const BOOT_SUFFIX: &str = "BOOT";

/// A parsed device identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceUid {
    /// Vendor tag, first two characters of the first segment.
    pub tag: String,
    /// Device type code (`FL`, `YL`, `SL`, ...), selects the model.
    pub type_code: String,
    /// Zero-padded device number, e.g. `000007`.
    pub number: String,
    /// Provenance suffix, e.g. `CAFAF` or `BOOT`.
    pub suffix: String,
}

fn uid_pattern() -> &'static regex::Regex {
    // Compile once for hot paths.
    static UID_RE: OnceLock<regex::Regex> = OnceLock::new();
    UID_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Z]{2}[A-Z]{1,6}-[0-9]{6}-[A-Z0-9]{1,12}$").unwrap()
    })
}

impl DeviceUid {
    /// Parse a UID string into its typed parts.
    ///
    /// The first segment carries the vendor tag in its first two characters
    /// and the type code in the rest; the second segment is the device
    /// number; the third is the suffix.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if !uid_pattern().is_match(raw) {
            return Err(anyhow!("malformed device uid '{}'", raw));
        }
        let mut parts = raw.split('-');
        let head = parts.next().unwrap_or_default();
        let number = parts.next().unwrap_or_default();
        let suffix = parts.next().unwrap_or_default();

        Ok(Self {
            tag: head[..2].to_string(),
            type_code: head[2..].to_string(),
            number: number.to_string(),
            suffix: suffix.to_string(),
        })
    }

    /// Build the BOOT placeholder UID for a type code and device number.
    pub fn boot(type_code: &str, number: &str) -> Self {
        Self {
            tag: VENDOR_TAG.to_string(),
            type_code: type_code.to_uppercase(),
            number: number.to_string(),
            suffix: BOOT_SUFFIX.to_string(),
        }
    }

    /// True when this UID is a startup placeholder.
    pub fn is_boot(&self) -> bool {
        self.suffix == BOOT_SUFFIX
    }

    /// True when this UID carries the manufacturer production suffix.
    pub fn is_production(&self) -> bool {
        self.suffix == PRODUCTION_SUFFIX
    }

    /// The BOOT placeholder string for the same logical device.
    pub fn boot_counterpart(&self) -> String {
        format!("{}{}-{}-{}", self.tag, self.type_code, self.number, BOOT_SUFFIX)
    }

    /// Device code used in filenames and report rows, e.g. `FL_000007`.
    pub fn device_code(&self) -> String {
        format!("{}_{}", self.type_code, self.number)
    }
}

impl fmt::Display for DeviceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}-{}-{}",
            self.tag, self.type_code, self.number, self.suffix
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_production_uid() {
        let uid = DeviceUid::parse("AAFL-000007-CAFAF").expect("parse");
        assert_eq!(uid.tag, "AA");
        assert_eq!(uid.type_code, "FL");
        assert_eq!(uid.number, "000007");
        assert_eq!(uid.suffix, "CAFAF");
        assert!(uid.is_production());
        assert!(!uid.is_boot());
        assert_eq!(uid.device_code(), "FL_000007");
        assert_eq!(uid.to_string(), "AAFL-000007-CAFAF");
    }

    #[test]
    fn boot_counterpart_swaps_only_the_suffix() {
        let uid = DeviceUid::parse("AAYL-000021-CAFAF").expect("parse");
        assert_eq!(uid.boot_counterpart(), "AAYL-000021-BOOT");
    }

    #[test]
    fn boot_constructor_round_trips() {
        let uid = DeviceUid::boot("sl", "000003");
        assert_eq!(uid.to_string(), "AASL-000003-BOOT");
        assert!(uid.is_boot());
        let reparsed = DeviceUid::parse(&uid.to_string()).expect("parse");
        assert_eq!(reparsed, uid);
    }

    #[test]
    fn rejects_malformed_uids() {
        for raw in [
            "",
            "AAFL",
            "AAFL-07-CAFAF",
            "AAFL-000007",
            "aafl-000007-cafaf",
            "AAFL-000007-",
            "A-000007-CAFAF",
            "AAFL_000007_CAFAF",
        ] {
            assert!(DeviceUid::parse(raw).is_err(), "accepted '{}'", raw);
        }
    }
}
