//! Queue payloads exchanged between the services.
//!
//! Every payload is a tagged struct with a flattened `extra` map so that
//! consumers tolerate (and forward) fields they do not know about. Frame
//! pixels never travel on the broker: envelopes carry an object-store key
//! instead, and only [`SavedAction`] embeds an (annotated, re-encoded)
//! image.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Action, BBox, Branch, ClientName, Reason};

/// Description of a frame waiting in object storage, without its pixels.
///
/// Produced by the gateway, fanned out by the dispatcher to both branch
/// queues of one pipeline, and consumed once per branch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameEnvelope {
    /// The canonical client name the frame belongs to.
    pub client_name: ClientName,
    /// Wall-clock stamp taken when the client frame arrived (`%H-%M-%S`).
    pub send_time: String,
    /// Object-store key holding the JPEG bytes. Unique per frame.
    pub object_key: String,
    /// Bucket the key lives in.
    pub bucket: String,
    /// Content type of the stored bytes.
    pub content_type: String,
    /// Which storage backend produced the key.
    pub storage_provider: String,
    /// Size of the stored frame in bytes.
    pub frame_size_bytes: u64,
    /// Forward-compatibility escape hatch; unknown fields collect here and
    /// are forwarded verbatim by every stage.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Result of the face branch for a single frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaceVerdict {
    /// The originating envelope, forwarded verbatim.
    #[serde(flatten)]
    pub envelope: FrameEnvelope,
    /// Bounding box of the strongest detected face, if any.
    #[serde(default)]
    pub face_bbox: Option<BBox>,
    /// Whether the face matched the client's reference embedding.
    #[serde(default)]
    pub check_client: Option<bool>,
    /// Whether the face was classified as a spoof.
    #[serde(default)]
    pub check_spoof: Option<bool>,
    /// Raw metric value from the identity comparison.
    #[serde(default)]
    pub recognition_metric_value: Option<f32>,
    /// Threshold the metric was compared against.
    #[serde(default)]
    pub recognition_threshold: Option<f32>,
    /// True iff a face was detected at all.
    #[serde(default)]
    pub detection_success: bool,
    /// Set when the branch failed; the fuser still receives the verdict.
    #[serde(default)]
    pub processing_error: Option<String>,
}

/// Result of the phone branch for a single frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhoneVerdict {
    /// The originating envelope, forwarded verbatim.
    #[serde(flatten)]
    pub envelope: FrameEnvelope,
    /// Bounding box of the detected phone, if any.
    #[serde(default)]
    pub phone_bbox: Option<BBox>,
    /// Confidence of the phone detection.
    #[serde(default)]
    pub phone_confidence: Option<f32>,
    /// Set when the branch failed; the fuser still receives the verdict.
    #[serde(default)]
    pub processing_error: Option<String>,
}

/// The enforcement message delivered to a client over its WebSocket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMessage {
    /// What the client must do.
    pub action: Action,
    /// Why.
    pub reason: Reason,
    /// Which client the action addresses.
    pub client_name: ClientName,
    /// `send_time` of the originating frame.
    pub send_time: String,
    /// Wall-clock stamp taken when the action was derived.
    pub finish_time: String,
}

/// Audit record for a non-trivial action, including the annotated snapshot.
///
/// Serialized as CBOR on the `saved_actions` queue because it embeds JPEG
/// bytes; the deterministic `action_object_key` makes redelivery idempotent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedAction {
    /// Which client the action addresses.
    pub client_name: ClientName,
    /// The derived action.
    pub action: Action,
    /// The derived reason.
    pub reason: Reason,
    /// The branch that produced the verdict.
    pub branch: Branch,
    /// Annotated JPEG bytes (bbox drawn), if the frame could be hydrated.
    #[serde(default, with = "serde_bytes")]
    pub annotated_jpeg: Option<Vec<u8>>,
    /// Deterministic key the snapshot should be written to.
    pub action_object_key: Option<String>,
    /// Bucket the snapshot should be written to.
    pub action_bucket: Option<String>,
    /// Object key of the originating frame, for traceability.
    pub source_object_key: String,
    /// Bucket of the originating frame.
    pub source_bucket: String,
    /// Content type of the originating frame.
    pub source_content_type: String,
    /// Storage backend of the originating frame.
    pub storage_provider: String,
    /// Raw metric value from the identity comparison, when available.
    #[serde(default)]
    pub recognition_metric_value: Option<f32>,
    /// Threshold the metric was compared against, when available.
    #[serde(default)]
    pub recognition_threshold: Option<f32>,
    /// `send_time` of the originating frame.
    pub send_time: String,
    /// Wall-clock stamp taken when the action was derived.
    pub finish_time: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> FrameEnvelope {
        FrameEnvelope {
            client_name: ClientName::parse("obama").unwrap(),
            send_time: "10-30-00".to_owned(),
            object_key: "frames/obama/20250101T000000000000Z-abc.jpg".to_owned(),
            bucket: "face-frames".to_owned(),
            content_type: "image/jpeg".to_owned(),
            storage_provider: "s3".to_owned(),
            frame_size_bytes: 1024,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn unknown_fields_are_kept_and_forwarded() {
        let mut json = serde_json::to_value(envelope()).unwrap();
        json.as_object_mut()
            .unwrap()
            .insert("client_ip".to_owned(), "10.0.0.7".into());
        let parsed: FrameEnvelope = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(parsed.extra["client_ip"], "10.0.0.7");
        assert_eq!(serde_json::to_value(&parsed).unwrap(), json);
    }

    #[test]
    fn verdict_flattens_envelope_fields() {
        let verdict = FaceVerdict {
            envelope: envelope(),
            face_bbox: Some(BBox::from([1, 2, 3, 4])),
            check_client: Some(true),
            check_spoof: Some(false),
            recognition_metric_value: Some(0.71),
            recognition_threshold: Some(0.25),
            detection_success: true,
            processing_error: None,
        };
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["client_name"], "obama");
        assert_eq!(json["face_bbox"], serde_json::json!([1, 2, 3, 4]));
        let parsed: FaceVerdict = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, verdict);
    }

    #[test]
    fn saved_action_survives_cbor() {
        let saved = SavedAction {
            client_name: ClientName::parse("obama").unwrap(),
            action: Action::LockScreen,
            reason: Reason::WrongUser,
            branch: Branch::Face,
            annotated_jpeg: Some(vec![0xff, 0xd8, 0xff, 0xd9]),
            action_object_key: Some(
                "actions/Lock_screen/obama/20250101T000000000000Z__Lock_screen__Wrong_user.jpg"
                    .to_owned(),
            ),
            action_bucket: Some("face-frames".to_owned()),
            source_object_key: envelope().object_key,
            source_bucket: "face-frames".to_owned(),
            source_content_type: "image/jpeg".to_owned(),
            storage_provider: "s3".to_owned(),
            recognition_metric_value: Some(0.11),
            recognition_threshold: Some(0.25),
            send_time: "10-30-00".to_owned(),
            finish_time: "10-30-01".to_owned(),
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&saved, &mut buf).unwrap();
        let parsed: SavedAction = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(parsed, saved);
    }
}
