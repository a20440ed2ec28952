//! Ingest router
//!
//! Classifies every inbound bus message against the current model and
//! forwards it onto one of the bounded stage channels. A full stage
//! channel blocks the router (and, through the feed channel, the bus
//! event loop): backpressure is deliberate, dropping snapshots silently
//! would hide overload.

use crate::bus::BusMessage;
use crate::model::{SharedModel, TopicKind, Verdict};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of each stage channel.
pub const STAGE_CAPACITY: usize = 10;

/// An item flowing through the pipeline stages.
#[derive(Debug, Clone)]
pub struct IngestItem {
    pub topic: String,
    pub payload: Bytes,
    pub room: String,
    pub kind: TopicKind,
    /// Set by the image pipeline or the motion normaliser; never by the
    /// router.
    pub verdict: Option<Verdict>,
}

/// Sender side of the stage channels.
#[derive(Clone)]
pub struct StageSenders {
    pub image: mpsc::Sender<IngestItem>,
    pub motion: mpsc::Sender<IngestItem>,
    pub door: mpsc::Sender<IngestItem>,
    pub results: mpsc::Sender<IngestItem>,
}

/// Receiver side of the stage channels, consumed by the pipeline tasks.
pub struct StageReceivers {
    pub image: mpsc::Receiver<IngestItem>,
    pub motion: mpsc::Receiver<IngestItem>,
    pub door: mpsc::Receiver<IngestItem>,
    pub results: mpsc::Receiver<IngestItem>,
}

pub fn stage_channels() -> (StageSenders, StageReceivers) {
    let (image_tx, image_rx) = mpsc::channel(STAGE_CAPACITY);
    let (motion_tx, motion_rx) = mpsc::channel(STAGE_CAPACITY);
    let (door_tx, door_rx) = mpsc::channel(STAGE_CAPACITY);
    let (results_tx, results_rx) = mpsc::channel(STAGE_CAPACITY);
    (
        StageSenders {
            image: image_tx,
            motion: motion_tx,
            door: door_tx,
            results: results_tx,
        },
        StageReceivers {
            image: image_rx,
            motion: motion_rx,
            door: door_rx,
            results: results_rx,
        },
    )
}

pub fn spawn_router(
    mut feed: mpsc::Receiver<BusMessage>,
    model: SharedModel,
    stages: StageSenders,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = feed.recv().await {
            tracing::info!(topic = %msg.topic, "message received");
            let model = model.snapshot().await;
            let Some(kind) = model.find_topic_kind(&msg.topic) else {
                tracing::debug!(
                    topic = %msg.topic,
                    "topic not found in model, fix subscription or add to model"
                );
                continue;
            };
            let room = model.find_room(&msg.topic).unwrap_or_default().to_string();
            let item = IngestItem {
                topic: msg.topic,
                payload: msg.payload,
                room,
                kind,
                verdict: None,
            };
            let sent = match kind {
                TopicKind::Pic => {
                    tracing::debug!(queued = STAGE_CAPACITY - stages.image.capacity(), "image message received");
                    stages.image.send(item).await
                }
                TopicKind::Motion => {
                    tracing::debug!(queued = STAGE_CAPACITY - stages.motion.capacity(), "motion message received");
                    stages.motion.send(item).await
                }
                TopicKind::Door => {
                    tracing::debug!(queued = STAGE_CAPACITY - stages.door.capacity(), "door message received");
                    stages.door.send(item).await
                }
                TopicKind::Occupancy => {
                    // reserved: inbound occupancy echoes are not acted upon
                    tracing::debug!(topic = %item.topic, "occupancy message received, ignoring");
                    Ok(())
                }
            };
            if sent.is_err() {
                tracing::error!("stage channel closed, router exiting");
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, Room};

    async fn route_one(topic: &str) -> (StageReceivers, JoinHandle<()>) {
        let shared = SharedModel::new();
        let model = Model {
            rooms: vec![Room {
                name: "kitchen".to_string(),
                occupancy_topic: "hab/kitchen/occupancy".to_string(),
                motion_topics: vec!["kitchen/motion".to_string()],
                picture_topics: vec!["cam/kitchen".to_string()],
                door_topics: vec!["kitchen/door".to_string()],
                occupancy_period: 60,
            }],
            ..Model::default()
        };
        shared.replace(model).await;

        let (feed_tx, feed_rx) = mpsc::channel(4);
        let (senders, receivers) = stage_channels();
        let handle = spawn_router(feed_rx, shared, senders);
        feed_tx
            .send(BusMessage {
                topic: topic.to_string(),
                payload: Bytes::from_static(b"x"),
            })
            .await
            .unwrap();
        drop(feed_tx);
        (receivers, handle)
    }

    #[tokio::test]
    async fn pictures_land_on_the_image_channel() {
        let (mut rx, handle) = route_one("cam/kitchen").await;
        handle.await.unwrap();
        let item = rx.image.recv().await.unwrap();
        assert_eq!(item.room, "kitchen");
        assert_eq!(item.kind, TopicKind::Pic);
        assert!(item.verdict.is_none());
        assert!(rx.motion.try_recv().is_err());
    }

    #[tokio::test]
    async fn motion_and_door_land_on_their_channels() {
        let (mut rx, handle) = route_one("kitchen/motion").await;
        handle.await.unwrap();
        assert_eq!(rx.motion.recv().await.unwrap().kind, TopicKind::Motion);

        let (mut rx, handle) = route_one("kitchen/door").await;
        handle.await.unwrap();
        assert_eq!(rx.door.recv().await.unwrap().kind, TopicKind::Door);
    }

    #[tokio::test]
    async fn unknown_and_occupancy_topics_are_dropped() {
        let (mut rx, handle) = route_one("nowhere/at/all").await;
        handle.await.unwrap();
        assert!(rx.image.try_recv().is_err());
        assert!(rx.motion.try_recv().is_err());
        assert!(rx.door.try_recv().is_err());

        let (mut rx, handle) = route_one("hab/kitchen/occupancy").await;
        handle.await.unwrap();
        assert!(rx.results.try_recv().is_err());
    }
}
