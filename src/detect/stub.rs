use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::Detector;
use crate::detect::result::BoxDetection;

/// Stub backend for tests and model-less deployments.
///
/// Derives a deterministic set of boxes from a digest of the payload, so
/// the same bytes always yield the same count. Empty payloads (e.g. from
/// a failed authentication) yield zero detections.
pub struct StubDetector;

impl StubDetector {
    pub fn new() -> Self {
        Self
    }

    /// The count this backend will report for a payload. Exposed so tests
    /// can predict pipeline output without re-deriving the scheme.
    pub fn expected_count(payload: &[u8]) -> u64 {
        if payload.is_empty() {
            return 0;
        }
        let digest = Sha256::digest(payload);
        u64::from(digest[0] % 4) + 1
    }
}

impl Default for StubDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, payload: &[u8]) -> Result<Vec<BoxDetection>> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let digest = Sha256::digest(payload);
        let count = Self::expected_count(payload) as usize;
        let boxes = (0..count)
            .map(|i| {
                let seed = digest[i + 1] as f32 / 255.0;
                BoxDetection {
                    class_id: u32::from(digest[i + 8] % 2),
                    score: 0.5 + seed / 2.0,
                    x: seed * 0.8,
                    y: (1.0 - seed) * 0.8,
                    w: 0.1,
                    h: 0.1,
                }
            })
            .collect();
        Ok(boxes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_is_deterministic() {
        let mut det = StubDetector::new();
        let a = det.detect(b"payload bytes").expect("detect");
        let b = det.detect(b"payload bytes").expect("detect");
        assert_eq!(a.len(), b.len());
        assert_eq!(a.len() as u64, StubDetector::expected_count(b"payload bytes"));
        assert!((1..=4).contains(&a.len()));
    }

    #[test]
    fn empty_payload_yields_no_detections() {
        let mut det = StubDetector::new();
        assert!(det.detect(b"").expect("detect").is_empty());
        assert_eq!(StubDetector::expected_count(b""), 0);
    }
}
