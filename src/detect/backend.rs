use anyhow::Result;

use crate::detect::result::BoxDetection;

/// Detector backend trait.
///
/// The real model is an external collaborator consumed as a black box:
/// payload bytes in, a list of scored boxes out. Implementations must be
/// safe to drive from one thread at a time; the registry wraps each
/// instance in a mutex so different device types can run concurrently.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one decoded payload.
    fn detect(&mut self, payload: &[u8]) -> Result<Vec<BoxDetection>>;

    /// Render an annotated copy of the payload, when the backend can.
    ///
    /// Returning `None` makes the pipeline archive the original instead.
    fn annotate(&self, _payload: &[u8], _detections: &[BoxDetection]) -> Option<Vec<u8>> {
        None
    }

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
