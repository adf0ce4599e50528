use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::context::lock_unpoisoned;
use crate::detect::backend::Detector;
use crate::detect::ModelConfig;

type SharedDetector = Arc<Mutex<Box<dyn Detector>>>;
type DetectorFactory = dyn Fn(&ModelConfig) -> Result<Box<dyn Detector>> + Send + Sync;

/// Lazy, thread-safe cache of per-type detector instances.
///
/// Model loading is expensive, so a detector is built on first use for a
/// type and reused afterwards. Each instance sits behind its own mutex,
/// which keeps detection for different device types concurrent while a
/// single model never runs reentrantly.
pub struct DetectorRegistry {
    detectors: Mutex<HashMap<String, SharedDetector>>,
    factory: Box<DetectorFactory>,
}

impl DetectorRegistry {
    /// Registry producing detectors through `factory`.
    pub fn new(factory: impl Fn(&ModelConfig) -> Result<Box<dyn Detector>> + Send + Sync + 'static) -> Self {
        Self {
            detectors: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    /// Registry backed by the deterministic stub detector.
    pub fn stub() -> Self {
        Self::new(|_| Ok(Box::new(crate::detect::StubDetector::new())))
    }

    /// Detector for a device type, building and caching it on first use.
    pub fn get(&self, type_code: &str) -> Result<SharedDetector> {
        let type_key = type_code.to_uppercase();
        let config = crate::detect::model_for(&type_key)
            .ok_or_else(|| anyhow!("no model configured for device type '{}'", type_code))?;

        let mut detectors = lock_unpoisoned(&self.detectors);
        if let Some(existing) = detectors.get(&type_key) {
            return Ok(existing.clone());
        }

        let mut built = (self.factory)(config)?;
        built.warm_up()?;
        log::info!("loaded {} detector for type {}", built.name(), type_key);
        let shared: SharedDetector = Arc::new(Mutex::new(built));
        detectors.insert(type_key, shared.clone());
        Ok(shared)
    }

    /// Types with an already-loaded detector.
    pub fn loaded(&self) -> Vec<String> {
        lock_unpoisoned(&self.detectors).keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn detector_is_built_once_per_type() {
        static BUILDS: AtomicUsize = AtomicUsize::new(0);
        let registry = DetectorRegistry::new(|_| {
            BUILDS.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(crate::detect::StubDetector::new()))
        });

        let first = registry.get("FL").expect("get");
        let second = registry.get("fl").expect("get");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(BUILDS.load(Ordering::SeqCst), 1);

        registry.get("YL").expect("get");
        assert_eq!(BUILDS.load(Ordering::SeqCst), 2);
        assert_eq!(registry.loaded().len(), 2);
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = DetectorRegistry::stub();
        assert!(registry.get("ZZ").is_err());
    }
}
