//! Camera pull worker pool
//!
//! Periodically fetches JPEG snapshots from HTTP-reachable cameras and
//! republishes them onto the bus, where they re-enter the pipeline as
//! ordinary picture messages.
//!
//! TODO: config changes are not picked up without a restart; the pool is
//! sized and wired once at startup.

use crate::bus::BusClient;
use crate::settings::Settings;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One camera to poll: fetch `snap_url`, publish the body on `topic`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CameraTarget {
    #[serde(alias = "url")]
    pub snap_url: String,
    pub topic: String,
}

/// The `cam_forwarder` config section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CamForwarderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub frequency: i64,
    #[serde(default)]
    pub workers: i64,
    #[serde(default)]
    pub cameras: Vec<CameraTarget>,
}

/// Read config, spawn the worker pool and the ticker.
pub fn start(settings: &Settings, http: reqwest::Client, bus: Arc<BusClient>) {
    let config: CamForwarderConfig = settings.unmarshal_key("cam_forwarder").unwrap_or_else(|e| {
        tracing::error!(error = %e, "error loading cam_forwarder config");
        CamForwarderConfig::default()
    });

    if !config.enabled || config.workers < 1 || config.frequency < 1 {
        tracing::info!("cam forwarder disabled");
        return;
    }

    tracing::info!(
        workers = config.workers,
        frequency = config.frequency,
        cameras = config.cameras.len(),
        "starting cam forwarder"
    );

    let (queue_tx, queue_rx) = mpsc::channel::<CameraTarget>(config.workers as usize * 4);
    let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));

    for _ in 0..config.workers {
        let queue_rx = queue_rx.clone();
        let http = http.clone();
        let bus = bus.clone();
        tokio::spawn(async move {
            loop {
                let job = queue_rx.lock().await.recv().await;
                let Some(job) = job else {
                    return;
                };
                process_job(&http, &bus, &job).await;
            }
        });
    }

    let cameras = config.cameras;
    let frequency = config.frequency;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(frequency as u64));
        ticker.tick().await; // the first tick fires immediately, skip it
        loop {
            ticker.tick().await;
            for camera in &cameras {
                // a full queue blocks the ticker: deliberate backpressure
                if queue_tx.send(camera.clone()).await.is_err() {
                    tracing::error!("cam forwarder queue closed");
                    return;
                }
            }
        }
    });
}

async fn process_job(http: &reqwest::Client, bus: &BusClient, job: &CameraTarget) {
    let resp = match http
        .get(&job.snap_url)
        .header(reqwest::header::ACCEPT, "*/*")
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(url = %job.snap_url, error = %e, "unable to get pic");
            return;
        }
    };

    if !resp.status().is_success() {
        tracing::warn!(
            url = %job.snap_url,
            status = resp.status().as_u16(),
            "non-2xx code received from camera"
        );
        return;
    }

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if content_type != "image/jpeg" {
        tracing::warn!(url = %job.snap_url, content_type = %content_type, "invalid image mimetype");
        return;
    }

    let body = match resp.bytes().await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(url = %job.snap_url, error = %e, "error reading image data");
            return;
        }
    };

    if let Err(e) = bus.publish(&job.topic, body.to_vec()).await {
        tracing::warn!(topic = %job.topic, error = %e, "error republishing snapshot");
    }
}
