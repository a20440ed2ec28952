//! Motion/door normaliser
//!
//! Decodes raw motion and door-contact payloads into motion verdicts and
//! forwards them to the occupancy state machine. Door topics flow through
//! the same normaliser so the door channel always has a consumer.

use crate::model::Verdict;
use crate::router::IngestItem;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Decode a motion/door payload.
///
/// Integers: 0 stops motion, anything else starts it. Strings: `OFF` and
/// `OPEN` stop, `ON` and `CLOSED` start. A closed contact on a door-frame
/// sensor signals presence, which is why `OPEN` maps to stop. Unknown
/// payloads yield nothing and the item is dropped.
pub fn normalize_payload(payload: &[u8]) -> Option<Verdict> {
    let text = std::str::from_utf8(payload).ok()?;
    if let Ok(n) = text.parse::<i64>() {
        return Some(if n == 0 {
            Verdict::MotionStop
        } else {
            Verdict::MotionStart
        });
    }
    match text {
        "OFF" | "OPEN" => Some(Verdict::MotionStop),
        "ON" | "CLOSED" => Some(Verdict::MotionStart),
        _ => None,
    }
}

pub fn spawn_normalizer(
    mut motion_rx: mpsc::Receiver<IngestItem>,
    mut door_rx: mpsc::Receiver<IngestItem>,
    results_tx: mpsc::Sender<IngestItem>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut item = tokio::select! {
                Some(item) = motion_rx.recv() => item,
                Some(item) = door_rx.recv() => item,
                else => return,
            };
            match normalize_payload(&item.payload) {
                Some(verdict) => {
                    tracing::debug!(room = %item.room, verdict = ?verdict, "motion event");
                    item.verdict = Some(verdict);
                    if results_tx.send(item).await.is_err() {
                        tracing::error!("results channel closed");
                        return;
                    }
                }
                None => {
                    tracing::debug!(
                        room = %item.room,
                        payload = %String::from_utf8_lossy(&item.payload),
                        "unknown motion payload"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TopicKind;
    use bytes::Bytes;

    #[test]
    fn integer_payloads() {
        assert_eq!(normalize_payload(b"0"), Some(Verdict::MotionStop));
        assert_eq!(normalize_payload(b"1"), Some(Verdict::MotionStart));
        assert_eq!(normalize_payload(b"7"), Some(Verdict::MotionStart));
        assert_eq!(normalize_payload(b"-3"), Some(Verdict::MotionStart));
    }

    #[test]
    fn string_payloads() {
        assert_eq!(normalize_payload(b"ON"), Some(Verdict::MotionStart));
        assert_eq!(normalize_payload(b"OFF"), Some(Verdict::MotionStop));
        // door contacts: closed means someone is inside
        assert_eq!(normalize_payload(b"CLOSED"), Some(Verdict::MotionStart));
        assert_eq!(normalize_payload(b"OPEN"), Some(Verdict::MotionStop));
    }

    #[test]
    fn unknown_payloads_are_dropped() {
        assert_eq!(normalize_payload(b"whatever"), None);
        assert_eq!(normalize_payload(b"on"), None);
        assert_eq!(normalize_payload(b""), None);
        assert_eq!(normalize_payload(&[0xff, 0xfe]), None);
    }

    fn item(kind: TopicKind, payload: &'static [u8]) -> IngestItem {
        IngestItem {
            topic: "t".to_string(),
            payload: Bytes::from_static(payload),
            room: "kitchen".to_string(),
            kind,
            verdict: None,
        }
    }

    #[tokio::test]
    async fn forwards_annotated_items_from_both_channels() {
        let (motion_tx, motion_rx) = mpsc::channel(4);
        let (door_tx, door_rx) = mpsc::channel(4);
        let (results_tx, mut results_rx) = mpsc::channel(4);
        let handle = spawn_normalizer(motion_rx, door_rx, results_tx);

        motion_tx.send(item(TopicKind::Motion, b"ON")).await.unwrap();
        let out = results_rx.recv().await.unwrap();
        assert_eq!(out.verdict, Some(Verdict::MotionStart));

        door_tx.send(item(TopicKind::Door, b"OPEN")).await.unwrap();
        let out = results_rx.recv().await.unwrap();
        assert_eq!(out.verdict, Some(Verdict::MotionStop));

        // unknown payloads produce no downstream item
        motion_tx
            .send(item(TopicKind::Motion, b"whatever"))
            .await
            .unwrap();
        motion_tx.send(item(TopicKind::Motion, b"0")).await.unwrap();
        let out = results_rx.recv().await.unwrap();
        assert_eq!(out.verdict, Some(Verdict::MotionStop));

        handle.abort();
    }
}
