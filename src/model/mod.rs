//! Topic model - Room Table and Topic Routing
//!
//! ## Responsibilities
//!
//! - Map subscribed topics to (room, sensor kind)
//! - Resolve per-room occupancy topics and inactivity periods
//! - Enumerate the topics the bus must subscribe to
//! - Rebuild from the `model.rooms` config section on config change

use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Classification of a subscribed topic (source side of an ingest item).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Pic,
    Motion,
    Occupancy,
    Door,
}

/// Normalised sensor observation (set by the image pipeline or the
/// motion normaliser, consumed by the occupancy state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Occupied,
    Unoccupied,
    MotionStart,
    MotionStop,
    DoorOpen,
    DoorClosed,
}

/// A single room definition from the `model.rooms` config section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Room {
    pub name: String,
    #[serde(default)]
    pub occupancy_topic: String,
    #[serde(default)]
    pub motion_topics: Vec<String>,
    #[serde(default, alias = "pic_topics")]
    pub picture_topics: Vec<String>,
    #[serde(default)]
    pub door_topics: Vec<String>,
    /// Per-room inactivity timeout in seconds; <= 0 inherits the global
    /// default.
    #[serde(default)]
    pub occupancy_period: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ModelSection {
    #[serde(default)]
    rooms: Vec<Room>,
}

/// Immutable snapshot of the room table for one config epoch.
#[derive(Debug, Clone, Default)]
pub struct Model {
    pub rooms: Vec<Room>,
    pub default_period: i64,
}

impl Model {
    /// Build a model from the current configuration.
    pub fn from_settings(settings: &Settings) -> Self {
        let section: ModelSection = settings.unmarshal_key("model").unwrap_or_else(|e| {
            tracing::error!(error = %e, "error unmarshaling model");
            ModelSection::default()
        });
        Self {
            rooms: section.rooms,
            default_period: settings.get_i64("occupancy_period_default"),
        }
    }

    /// Find the room a topic belongs to. First match in table order wins.
    pub fn find_room(&self, topic: &str) -> Option<&str> {
        for room in &self.rooms {
            if room.occupancy_topic == topic
                || room.motion_topics.iter().any(|t| t == topic)
                || room.picture_topics.iter().any(|t| t == topic)
                || room.door_topics.iter().any(|t| t == topic)
            {
                return Some(&room.name);
            }
        }
        None
    }

    /// Classify a topic. First match in table order wins.
    pub fn find_topic_kind(&self, topic: &str) -> Option<TopicKind> {
        for room in &self.rooms {
            if room.occupancy_topic == topic {
                return Some(TopicKind::Occupancy);
            }
            if room.motion_topics.iter().any(|t| t == topic) {
                return Some(TopicKind::Motion);
            }
            if room.picture_topics.iter().any(|t| t == topic) {
                return Some(TopicKind::Pic);
            }
            if room.door_topics.iter().any(|t| t == topic) {
                return Some(TopicKind::Door);
            }
        }
        None
    }

    /// The topic a room's verdict is published on; None when unset
    /// (publishing is skipped for such rooms).
    pub fn find_occupancy_topic(&self, room: &str) -> Option<&str> {
        self.rooms
            .iter()
            .find(|r| r.name == room)
            .map(|r| r.occupancy_topic.as_str())
            .filter(|t| !t.is_empty())
    }

    /// Inactivity timeout for a room, falling back to the global default
    /// when the room has none of its own.
    pub fn occupancy_period(&self, room: &str) -> i64 {
        self.rooms
            .iter()
            .find(|r| r.name == room)
            .map(|r| r.occupancy_period)
            .filter(|p| *p > 0)
            .unwrap_or(self.default_period)
    }

    /// Flat list of motion + picture + door topics across all rooms: the
    /// set the bus subscribes to.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics = Vec::new();
        for room in &self.rooms {
            topics.extend(room.motion_topics.iter().cloned());
            topics.extend(room.picture_topics.iter().cloned());
            topics.extend(room.door_topics.iter().cloned());
        }
        topics
    }

    /// Room names in the current model.
    pub fn room_names(&self) -> Vec<String> {
        self.rooms.iter().map(|r| r.name.clone()).collect()
    }
}

/// Atomically swappable model snapshot. Readers clone an `Arc<Model>` and
/// never observe a half-rebuilt table.
#[derive(Clone, Default)]
pub struct SharedModel {
    inner: Arc<RwLock<Arc<Model>>>,
}

impl SharedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Arc<Model> {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, model: Model) {
        *self.inner.write().await = Arc::new(model);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_model() -> Model {
        Model {
            rooms: vec![
                Room {
                    name: "kitchen".to_string(),
                    occupancy_topic: "hab/kitchen/occupancy".to_string(),
                    motion_topics: vec!["kitchen/motion".to_string()],
                    picture_topics: vec!["cam/kitchen".to_string()],
                    door_topics: vec!["kitchen/door".to_string()],
                    occupancy_period: 120,
                },
                Room {
                    name: "hall".to_string(),
                    occupancy_topic: String::new(),
                    motion_topics: vec!["hall/motion".to_string()],
                    picture_topics: vec![],
                    door_topics: vec![],
                    occupancy_period: 0,
                },
            ],
            default_period: 150,
        }
    }

    #[test]
    fn finds_room_and_kind_for_each_topic_class() {
        let model = test_model();
        assert_eq!(model.find_room("cam/kitchen"), Some("kitchen"));
        assert_eq!(model.find_room("kitchen/motion"), Some("kitchen"));
        assert_eq!(model.find_room("kitchen/door"), Some("kitchen"));
        assert_eq!(model.find_room("hab/kitchen/occupancy"), Some("kitchen"));
        assert_eq!(model.find_room("unknown/topic"), None);

        assert_eq!(model.find_topic_kind("cam/kitchen"), Some(TopicKind::Pic));
        assert_eq!(
            model.find_topic_kind("kitchen/motion"),
            Some(TopicKind::Motion)
        );
        assert_eq!(model.find_topic_kind("kitchen/door"), Some(TopicKind::Door));
        assert_eq!(
            model.find_topic_kind("hab/kitchen/occupancy"),
            Some(TopicKind::Occupancy)
        );
        assert_eq!(model.find_topic_kind("unknown/topic"), None);
    }

    #[test]
    fn occupancy_topic_empty_means_skip() {
        let model = test_model();
        assert_eq!(
            model.find_occupancy_topic("kitchen"),
            Some("hab/kitchen/occupancy")
        );
        assert_eq!(model.find_occupancy_topic("hall"), None);
        assert_eq!(model.find_occupancy_topic("nope"), None);
    }

    #[test]
    fn occupancy_period_falls_back_to_default() {
        let model = test_model();
        assert_eq!(model.occupancy_period("kitchen"), 120);
        assert_eq!(model.occupancy_period("hall"), 150);
        assert_eq!(model.occupancy_period("nope"), 150);
    }

    #[test]
    fn subscribed_topics_cover_motion_picture_door() {
        let model = test_model();
        let topics = model.subscribed_topics();
        assert_eq!(topics.len(), 4);
        assert!(topics.contains(&"kitchen/motion".to_string()));
        assert!(topics.contains(&"cam/kitchen".to_string()));
        assert!(topics.contains(&"kitchen/door".to_string()));
        assert!(topics.contains(&"hall/motion".to_string()));
        // occupancy topics are published, never subscribed
        assert!(!topics.contains(&"hab/kitchen/occupancy".to_string()));
    }

    #[test]
    fn duplicate_topic_resolves_to_first_room() {
        let mut model = test_model();
        model.rooms.push(Room {
            name: "annex".to_string(),
            motion_topics: vec!["kitchen/motion".to_string()],
            ..Room::default()
        });
        assert_eq!(model.find_room("kitchen/motion"), Some("kitchen"));
    }
}
