//! Occupancy state machine
//!
//! ## Fusion rule
//!
//! Occupancy-on comes from either motion or a camera sighting. Occupancy
//! only turns off once a camera reports nobody AND the inactivity window
//! since the last occupied observation has expired AND motion is off.
//! Motion is sticky: while the motion flag holds, a stale camera
//! "unoccupied" cannot flip the verdict. There is no internal timer; an
//! off verdict is only ever published when a snapshot arrives to prove
//! the absence.
//!
//! Every ingest item produces exactly one published verdict, unchanged
//! values included (idempotent on the bus at QoS 0). The publish is
//! awaited on this task, which is the designed backpressure point against
//! a slow broker.

use crate::bus::BusClient;
use crate::model::{SharedModel, Verdict};
use crate::router::IngestItem;
use crate::status_store::{RoomStatus, StatusStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One state transition. Pure so the verdict sequence is a function of
/// the event sequence and the clock readings alone.
pub fn apply_event(
    mut status: RoomStatus,
    verdict: Verdict,
    now: i64,
    period: i64,
) -> (RoomStatus, bool) {
    // default: the camera side holds its previous certainty
    let mut cam_opinion = true;
    match verdict {
        Verdict::Occupied => {
            status.mark_occupied(now);
        }
        Verdict::Unoccupied => {
            if now - status.last_occupied_at > period {
                status.mark_unoccupied();
                cam_opinion = false;
            }
        }
        Verdict::MotionStart | Verdict::DoorClosed => {
            status.mark_occupied(now);
            status.set_motion(true, now);
        }
        Verdict::MotionStop | Verdict::DoorOpen => {
            status.set_motion(false, now);
        }
    }
    let occupied = cam_opinion || status.motion_on;
    (status, occupied)
}

pub fn spawn_state_machine(
    mut results_rx: mpsc::Receiver<IngestItem>,
    model: SharedModel,
    store: Arc<StatusStore>,
    bus: Arc<BusClient>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = results_rx.recv().await {
            let Some(verdict) = item.verdict else {
                tracing::debug!(topic = %item.topic, "result item without verdict, dropping");
                continue;
            };
            let now = chrono::Utc::now().timestamp();
            let model = model.snapshot().await;
            let period = model.occupancy_period(&item.room);

            let status = store.snapshot(&item.room).await;
            let (next, occupied) = apply_event(status, verdict, now, period);
            if verdict == Verdict::Unoccupied && !next.occupied {
                tracing::debug!(room = %item.room, "occupancy period expired");
            }
            store.put(&item.room, next).await;

            // no store lock is held across the publish
            let Some(topic) = model.find_occupancy_topic(&item.room) else {
                continue;
            };
            let message = if occupied { "true" } else { "false" };
            if let Err(e) = bus.publish(topic, message).await {
                tracing::warn!(room = %item.room, error = %e, "error publishing verdict");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: i64 = 60;

    /// Drive a sequence of (verdict, at) events against a virtual clock
    /// and collect the published verdict strings.
    fn run(events: &[(Verdict, i64)]) -> (RoomStatus, Vec<&'static str>) {
        let mut status = RoomStatus::default();
        let mut published = Vec::new();
        for (verdict, at) in events {
            let (next, occupied) = apply_event(status, *verdict, *at, PERIOD);
            status = next;
            published.push(if occupied { "true" } else { "false" });
        }
        (status, published)
    }

    #[test]
    fn camera_sighting_occupies() {
        // scenario: a person on camera flips the room occupied
        let (status, published) = run(&[(Verdict::Occupied, 100)]);
        assert_eq!(published, vec!["true"]);
        assert!(status.occupied);
        assert_eq!(status.last_occupied_at, 100);
    }

    #[test]
    fn camera_clears_only_after_window() {
        let (status, published) = run(&[
            (Verdict::Occupied, 100),
            // still inside the window: absence is ignored
            (Verdict::Unoccupied, 130),
            // window expired: absence clears the room
            (Verdict::Unoccupied, 161),
        ]);
        assert_eq!(published, vec!["true", "true", "false"]);
        assert!(!status.occupied);
        assert!(!status.motion_on);
    }

    #[test]
    fn motion_extends_and_then_holds_occupancy() {
        let (status, published) = run(&[
            (Verdict::Occupied, 100),
            (Verdict::MotionStart, 130),
            // window since motion (T+30) has expired, but motion is still
            // on: the verdict stays true
            (Verdict::Unoccupied, 220),
            (Verdict::MotionStop, 221),
            (Verdict::Unoccupied, 230),
        ]);
        assert_eq!(published, vec!["true", "true", "true", "true", "false"]);
        assert!(!status.occupied);
        assert!(!status.motion_on);
    }

    #[test]
    fn door_contact_is_sticky_occupancy() {
        let (status, published) = run(&[
            (Verdict::MotionStart, 100), // "CLOSED"
            (Verdict::MotionStop, 110),  // "OPEN"
        ]);
        // absent camera input the verdict stays true after motion stops
        assert_eq!(published, vec!["true", "true"]);
        assert!(status.occupied);
        assert!(!status.motion_on);

        let (status, published) = run(&[
            (Verdict::MotionStart, 100),
            (Verdict::MotionStop, 110),
            (Verdict::Unoccupied, 161), // past the window since T=100
        ]);
        assert_eq!(published, vec!["true", "true", "false"]);
        assert!(!status.occupied);
    }

    #[test]
    fn double_occupied_is_idempotent_on_state() {
        let (first, _) = run(&[(Verdict::Occupied, 100)]);
        let (second, published) = run(&[(Verdict::Occupied, 100), (Verdict::Occupied, 100)]);
        assert_eq!(published, vec!["true", "true"]);
        assert_eq!(first, second);
    }

    #[test]
    fn verdict_sequence_is_deterministic() {
        let events = [
            (Verdict::Occupied, 10),
            (Verdict::MotionStart, 20),
            (Verdict::Unoccupied, 95),
            (Verdict::MotionStop, 96),
            (Verdict::Unoccupied, 200),
        ];
        let (status_a, published_a) = run(&events);
        let (status_b, published_b) = run(&events);
        assert_eq!(status_a, status_b);
        assert_eq!(published_a, published_b);
    }

    #[test]
    fn unoccupied_never_rewinds_the_timestamp() {
        let (status, _) = run(&[(Verdict::Occupied, 100), (Verdict::Unoccupied, 161)]);
        assert_eq!(status.last_occupied_at, 100);
    }
}
