//! Image pipeline - Rate-Limited Snapshot Inference
//!
//! ## Flow
//!
//! ```text
//! image_channel -> [per-topic rate limit] -> POST inference -> cache
//!                                          -> verdict -> results_channel
//! ```
//!
//! The rate-limiter map lives on the single consumer task and is checked
//! before the outbound call is spawned; if this consumer is ever
//! parallelised the check must become atomic or per-topic-locked.

use crate::detector::{person_verdict, Detection, DetectorClient};
use crate::router::IngestItem;
use crate::settings::Settings;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Per-topic minimum interval between processed snapshots. Items arriving
/// inside the window are discarded; the slot is consumed as soon as an
/// item passes, even if its inference later fails.
#[derive(Debug, Default)]
pub struct RateLimiter {
    last_processed: HashMap<String, i64>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff `topic` may be processed at `now`; consumes the slot.
    pub fn allow(&mut self, topic: &str, now: i64, frequency: i64) -> bool {
        let last = self.last_processed.get(topic).copied().unwrap_or(0);
        if now - last < frequency {
            return false;
        }
        self.last_processed.insert(topic.to_string(), now);
        true
    }
}

/// Most recent snapshot + inference result per picture topic.
#[derive(Debug, Clone)]
pub struct CachedSnapshot {
    pub image: Bytes,
    pub detection: Detection,
}

/// Cache written by the pipeline, read by the inspection surface.
#[derive(Default)]
pub struct ImageCache {
    inner: RwLock<HashMap<String, CachedSnapshot>>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, topic: &str, image: Bytes, detection: Detection) {
        self.inner
            .write()
            .await
            .insert(topic.to_string(), CachedSnapshot { image, detection });
    }

    pub async fn get(&self, topic: &str) -> Option<CachedSnapshot> {
        self.inner.read().await.get(topic).cloned()
    }

    /// Detection results for a set of topics, missing entries defaulted.
    pub async fn detections_for(&self, topics: &[String]) -> HashMap<String, Detection> {
        let inner = self.inner.read().await;
        topics
            .iter()
            .map(|t| {
                let detection = inner
                    .get(t)
                    .map(|c| c.detection.clone())
                    .unwrap_or_default();
                (t.clone(), detection)
            })
            .collect()
    }
}

pub fn spawn_image_pipeline(
    mut image_rx: mpsc::Receiver<IngestItem>,
    results_tx: mpsc::Sender<IngestItem>,
    detector: Arc<DetectorClient>,
    cache: Arc<ImageCache>,
    settings: Arc<Settings>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut limiter = RateLimiter::new();
        while let Some(item) = image_rx.recv().await {
            let now = chrono::Utc::now().timestamp();
            let frequency = settings.get_i64("frequency");
            if !limiter.allow(&item.topic, now, frequency) {
                tracing::debug!(topic = %item.topic, "skipping image");
                continue;
            }
            tracing::debug!(topic = %item.topic, "processing image");

            let detector = detector.clone();
            let cache = cache.clone();
            let results_tx = results_tx.clone();
            let min_confidence = settings.get_f64("min_confidence");
            tokio::spawn(async move {
                process_snapshot(item, detector, cache, results_tx, min_confidence).await;
            });
        }
    })
}

async fn process_snapshot(
    mut item: IngestItem,
    detector: Arc<DetectorClient>,
    cache: Arc<ImageCache>,
    results_tx: mpsc::Sender<IngestItem>,
    min_confidence: f64,
) {
    let detection = match detector.detect(item.payload.clone()).await {
        Ok(detection) => detection,
        Err(e) => {
            tracing::warn!(topic = %item.topic, error = %e, "error reading result from detection service");
            return;
        }
    };

    // the cache keeps the freshest snapshot regardless of the verdict
    cache
        .insert(&item.topic, item.payload.clone(), detection.clone())
        .await;

    let verdict = person_verdict(&detection.predictions, min_confidence);
    tracing::debug!(topic = %item.topic, verdict = ?verdict, "image analysed");
    item.verdict = Some(verdict);
    if results_tx.send(item).await.is_err() {
        tracing::error!("results channel closed");
    }
}
