//! Detector client - Person-Detection Service Adapter
//!
//! ## Responsibilities
//!
//! - Send snapshots to the inference service as multipart/form-data
//! - Parse the prediction response
//! - Decide the camera-side verdict from the predictions
//!
//! The `success` field of the response is informational only: a 2xx
//! status plus a parseable body is trusted, nothing else.

use crate::error::{Error, Result};
use crate::model::Verdict;
use crate::settings::Settings;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One labelled bounding box from the inference service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
    #[serde(default)]
    pub x_min: i32,
    #[serde(default)]
    pub y_min: i32,
    #[serde(default)]
    pub x_max: i32,
    #[serde(default)]
    pub y_max: i32,
}

/// Full inference response. `timestamp` is stamped with the local clock
/// when the response is received.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Detection {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub predictions: Vec<Prediction>,
}

pub struct DetectorClient {
    http: reqwest::Client,
    settings: Arc<Settings>,
}

impl DetectorClient {
    pub fn new(http: reqwest::Client, settings: Arc<Settings>) -> Self {
        Self { http, settings }
    }

    /// POST a snapshot to `detection_url`. Any build, transport, status,
    /// or decode failure maps to an error the caller logs and drops; there
    /// are no retries.
    pub async fn detect(&self, image: Bytes) -> Result<Detection> {
        let url = self.settings.get_string("detection_url");
        let form = Form::new()
            .part(
                "image",
                Part::bytes(image.to_vec()).file_name("snap.jpeg"),
            )
            .text("min_confidence", "0.5");

        let resp = self.http.post(&url).multipart(form).send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Internal(format!(
                "non-2xx code received: {}",
                status.as_u16()
            )));
        }

        let body = resp.bytes().await?;
        if body.is_empty() {
            return Err(Error::Internal("empty response body".to_string()));
        }

        let mut detection: Detection = serde_json::from_slice(&body)?;
        detection.timestamp = chrono::Utc::now().timestamp();
        Ok(detection)
    }
}

/// The verdict rule: occupied iff some prediction is a person and the
/// highest person confidence clears the threshold.
pub fn person_verdict(predictions: &[Prediction], min_confidence: f64) -> Verdict {
    let confidence = predictions
        .iter()
        .filter(|p| p.label == "person")
        .map(|p| p.confidence)
        .fold(None::<f32>, |acc, c| Some(acc.map_or(c, |a| a.max(c))));
    match confidence {
        Some(c) if f64::from(c) >= min_confidence => Verdict::Occupied,
        _ => Verdict::Unoccupied,
    }
}
