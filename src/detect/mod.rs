//! Detection collaborator seam.
//!
//! The station treats the object-detection model as a black box behind
//! the [`Detector`] trait: payload bytes in, scored boxes out. This module
//! owns the per-type model table, the memoizing registry and the one entry
//! point the pipelines call, [`analyze_file`].
//!
//! Detection failures are never fatal to the pipeline: an unknown device
//! type, an unreadable file or a backend error all degrade to a zero count
//! with the failure logged.

mod backend;
mod registry;
mod result;
mod stub;

use std::path::Path;

pub use backend::Detector;
pub use registry::DetectorRegistry;
pub use result::{Analysis, BoxDetection};
pub use stub::StubDetector;

use crate::context::lock_unpoisoned;

/// Static configuration for one device type's model.
#[derive(Clone, Copy, Debug)]
pub struct ModelConfig {
    /// Device type code the model serves.
    pub type_code: &'static str,
    /// Tag written next to counts in logs and reports.
    pub tag: &'static str,
    /// Model file name under the models directory.
    pub model_file: &'static str,
    pub class_names: &'static [&'static str],
    pub input_size: u32,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
}

const MODEL_CONFIGS: &[ModelConfig] = &[
    ModelConfig {
        type_code: "FL",
        tag: "roach",
        model_file: "roach.onnx",
        class_names: &["fly", "roach"],
        input_size: 640,
        conf_threshold: 0.31,
        iou_threshold: 0.3,
    },
    ModelConfig {
        type_code: "YL",
        tag: "fly",
        model_file: "fly.onnx",
        class_names: &["fly", "roach"],
        input_size: 640,
        conf_threshold: 0.31,
        iou_threshold: 0.3,
    },
    ModelConfig {
        type_code: "SL",
        tag: "mouse",
        model_file: "mouse.onnx",
        class_names: &["mouse"],
        input_size: 640,
        conf_threshold: 0.31,
        iou_threshold: 0.3,
    },
];

/// Model configuration for a device type, if one exists.
pub fn model_for(type_code: &str) -> Option<&'static ModelConfig> {
    let type_key = type_code.to_uppercase();
    MODEL_CONFIGS
        .iter()
        .find(|config| config.type_code == type_key)
}

fn type_from_device_code(device_code: &str) -> Option<String> {
    let head = device_code.split('_').next()?;
    if head.is_empty() {
        return None;
    }
    Some(head.to_uppercase())
}

/// Run detection for one stored file.
///
/// Resolves the device type from the `TYPE_NNNNNN` device code, loads (or
/// reuses) that type's detector and returns the count, model tag and an
/// optional annotated payload. Every failure path returns a usable
/// zero-count [`Analysis`] instead of an error.
pub fn analyze_file(registry: &DetectorRegistry, path: &Path, device_code: &str) -> Analysis {
    let Some(type_code) = type_from_device_code(device_code) else {
        log::warn!("cannot resolve device type from '{}', skipping", device_code);
        return Analysis::empty("unknown");
    };
    let Some(config) = model_for(&type_code) else {
        log::warn!(
            "no model configured for type '{}', skipping {}",
            type_code,
            path.display()
        );
        return Analysis::empty("unknown");
    };

    let detector = match registry.get(&type_code) {
        Ok(detector) => detector,
        Err(err) => {
            log::error!("loading detector for type {} failed: {:#}", type_code, err);
            return Analysis::empty(config.tag);
        }
    };

    let payload = match std::fs::read(path) {
        Ok(payload) => payload,
        Err(err) => {
            log::error!("reading {} for detection failed: {}", path.display(), err);
            return Analysis::empty(config.tag);
        }
    };

    let mut guard = lock_unpoisoned(&detector);
    match guard.detect(&payload) {
        Ok(detections) => {
            let annotated = guard.annotate(&payload, &detections);
            Analysis {
                count: detections.len() as u64,
                tag: config.tag.to_string(),
                annotated,
            }
        }
        Err(err) => {
            log::error!("detection failed for {}: {:#}", path.display(), err);
            Analysis::empty(config.tag)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_table_covers_known_types() {
        assert_eq!(model_for("FL").expect("FL").tag, "roach");
        assert_eq!(model_for("yl").expect("YL").tag, "fly");
        assert_eq!(model_for("SL").expect("SL").tag, "mouse");
        assert!(model_for("ZZ").is_none());
    }

    #[test]
    fn unknown_type_degrades_to_zero_count() {
        let registry = DetectorRegistry::stub();
        let analysis = analyze_file(&registry, Path::new("/nonexistent"), "ZZ_000001");
        assert_eq!(analysis.count, 0);
        assert_eq!(analysis.tag, "unknown");
    }

    #[test]
    fn unreadable_file_degrades_to_zero_count_with_tag() {
        let registry = DetectorRegistry::stub();
        let analysis = analyze_file(&registry, Path::new("/nonexistent.png"), "FL_000001");
        assert_eq!(analysis.count, 0);
        assert_eq!(analysis.tag, "roach");
    }

    #[test]
    fn stub_detection_counts_payload_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("FL_000001_2025-03-09_10-00-00.png");
        std::fs::write(&path, b"fake image bytes").expect("write");

        let registry = DetectorRegistry::stub();
        let analysis = analyze_file(&registry, &path, "FL_000001");
        assert_eq!(analysis.count, StubDetector::expected_count(b"fake image bytes"));
        assert_eq!(analysis.tag, "roach");
        assert!(analysis.annotated.is_none());
    }
}
