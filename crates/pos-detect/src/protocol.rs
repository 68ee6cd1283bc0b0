use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Status code the detector reports on a batch that carries results.
pub const STATUS_SUCCESS: i64 = 200;

/// One observed product in a detection batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: String,
    pub quantity: u32,
}

/// A decoded detector message that carried results. Represents "what is
/// currently visible to the detector", not a running sum.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionBatch {
    pub detections: Vec<Detection>,
    pub average_fps: f64,
}

#[derive(Serialize)]
struct FramePayload<'a> {
    frame: &'a str,
}

#[derive(Deserialize)]
struct DetectorMessage {
    #[serde(default)]
    status: Option<i64>,
    #[serde(default)]
    data: Option<Vec<Detection>>,
    #[serde(rename = "averageFPS", default)]
    average_fps: Option<f64>,
}

/// Builds the outbound text frame for one encoded JPEG still.
pub fn encode_frame_message(jpeg: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(jpeg);
    serde_json::to_string(&FramePayload { frame: &encoded })
        .unwrap_or_else(|_| String::from("{\"frame\":\"\"}"))
}

/// Decodes one inbound detector message. Anything that is not a success
/// message with result data (heartbeats, malformed payloads, error
/// statuses) comes back as `None` and must be treated as a no-op.
pub fn decode_batch(text: &str) -> Option<DetectionBatch> {
    let message: DetectorMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            trace!("dropping malformed detector message: {err}");
            return None;
        }
    };

    if message.status != Some(STATUS_SUCCESS) {
        return None;
    }
    let detections = message.data?;

    Some(DetectionBatch {
        detections,
        average_fps: message.average_fps.unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_success_batch() {
        let text = r#"{"status":200,"data":[{"id":"p1","quantity":2}],"averageFPS":8.5}"#;
        let batch = decode_batch(text).expect("batch");
        assert_eq!(batch.detections.len(), 1);
        assert_eq!(batch.detections[0].id, "p1");
        assert_eq!(batch.detections[0].quantity, 2);
        assert!((batch.average_fps - 8.5).abs() < f64::EPSILON);
    }

    #[test]
    fn non_success_status_is_a_heartbeat() {
        assert!(decode_batch(r#"{"status":500,"data":[]}"#).is_none());
        assert!(decode_batch(r#"{"status":200}"#).is_none());
        assert!(decode_batch(r#"{"status":200,"data":null}"#).is_none());
    }

    #[test]
    fn malformed_payload_is_dropped_silently() {
        assert!(decode_batch("not json").is_none());
        assert!(decode_batch(r#"{"status":"ok"}"#).is_none());
        assert!(decode_batch("").is_none());
    }

    #[test]
    fn missing_fps_defaults_to_zero() {
        let batch = decode_batch(r#"{"status":200,"data":[{"id":"a","quantity":1}]}"#).unwrap();
        assert_eq!(batch.average_fps, 0.0);
    }

    #[test]
    fn frame_message_wraps_base64_jpeg() {
        let message = encode_frame_message(&[0xFF, 0xD8, 0xFF]);
        let value: serde_json::Value = serde_json::from_str(&message).unwrap();
        let frame = value["frame"].as_str().unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(frame)
            .unwrap();
        assert_eq!(decoded, vec![0xFF, 0xD8, 0xFF]);
    }
}
