//! Application state
//!
//! The single process-lifetime context built in `main` and handed to
//! every component. Replaces the package-level globals of earlier
//! revisions so reinitialisation on config change is explicit and tests
//! can build isolated instances.

use crate::bus::BusClient;
use crate::detector::DetectorClient;
use crate::image_pipeline::ImageCache;
use crate::model::SharedModel;
use crate::settings::Settings;
use crate::status_store::StatusStore;
use std::sync::Arc;

/// Shared components, cloned into tasks and the inspection router.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub bus: Arc<BusClient>,
    pub model: SharedModel,
    pub status: Arc<StatusStore>,
    pub cache: Arc<ImageCache>,
    pub detector: Arc<DetectorClient>,
}
