//! Home Assistant discovery advertiser
//!
//! Publishes a binary-sensor discovery record for every room that has an
//! occupancy topic, so each verdict shows up as an occupancy entity with
//! availability tied to the controller's liveness topic. Runs every five
//! minutes and again on every bus reconnect via a connect hook.

use crate::bus::{BusClient, LIVENESS_TOPIC};
use crate::model::{Room, SharedModel};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const DISCOVERY_PREFIX: &str = "homeassistant/binary_sensor";
const ADVERTISE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize)]
pub struct AdvertisementAvailability {
    pub topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSpec {
    pub name: String,
    #[serde(rename = "ids")]
    pub identifiers: Vec<String>,
}

/// Home Assistant MQTT discovery record for one room's occupancy sensor.
#[derive(Debug, Clone, Serialize)]
pub struct Advertisement {
    pub availability: Vec<AdvertisementAvailability>,
    pub device: DeviceSpec,
    #[serde(rename = "uniq_id")]
    pub unique_id: String,
    pub name: String,
    pub state_topic: String,
    pub payload_on: String,
    pub payload_off: String,
    pub device_class: String,
    pub platform: String,
    pub qos: i32,
}

impl Advertisement {
    pub fn for_room(name: &str, state_topic: &str) -> Self {
        Self {
            availability: vec![AdvertisementAvailability {
                topic: LIVENESS_TOPIC.to_string(),
                payload_available: "online".to_string(),
                payload_not_available: "offline".to_string(),
            }],
            device: DeviceSpec {
                name: "occupancy_controller".to_string(),
                identifiers: vec!["occupancy_controller".to_string()],
            },
            unique_id: format!("occupancy_sensor-{}", name),
            name: name.to_string(),
            state_topic: state_topic.to_string(),
            payload_on: "true".to_string(),
            payload_off: "false".to_string(),
            device_class: "occupancy".to_string(),
            platform: "binary_sensor".to_string(),
            qos: 0,
        }
    }

    pub fn config_topic(room: &str) -> String {
        format!("{}/{}/occupancy/config", DISCOVERY_PREFIX, room)
    }
}

/// Publish a discovery record for every advertisable room.
pub async fn advertise(rooms: &[Room], bus: &BusClient) {
    for room in rooms {
        if room.occupancy_topic.is_empty() {
            continue;
        }
        let record = Advertisement::for_room(&room.name, &room.occupancy_topic);
        let payload = match serde_json::to_vec(&record) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(room = %room.name, error = %e, "error marshalling advertisement");
                continue;
            }
        };
        if let Err(e) = bus.publish(&Advertisement::config_topic(&room.name), payload).await {
            tracing::error!(room = %room.name, error = %e, "error publishing advertisement");
        }
    }
}

/// Re-advertise every five minutes.
pub fn spawn_advertiser(model: SharedModel, bus: Arc<BusClient>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ADVERTISE_INTERVAL);
        ticker.tick().await; // the connect hook covers the initial advertisement
        loop {
            ticker.tick().await;
            tracing::debug!("advertising discovery records");
            let model = model.snapshot().await;
            advertise(&model.rooms, &bus).await;
        }
    })
}
