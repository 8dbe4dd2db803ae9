//! Mesh envelopes: the closed set of messages peers exchange.
//!
//! Every frame on a peer channel or the bootstrap relay is one JSON object:
//!
//! ```text
//! {"type": "<kind>", "from_peer_id": "...", "to_peer_id": "...", ...fields}
//! ```
//!
//! `to_peer_id` is only present on addressed frames (negotiation traffic
//! and anything that may be relayed). Decoding goes through a single
//! tagged enum, so an unknown `type` is rejected at the boundary instead of
//! reaching a handler.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, TransportError};
use crate::types::*;

/// Every message kind understood by the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshMessage {
    // ── Room state ───────────────────────────────────────────────
    StatusUpdate {
        status: WorkerStatus,
        #[serde(default)]
        current_job_id: Option<String>,
    },
    StateBroadcast {
        version: u64,
        /// Opaque CRDT update, interpreted only by the room registry.
        #[serde(with = "hex::serde")]
        snapshot: Vec<u8>,
    },
    StateRequest,
    PeerJoined {
        peer_id: PeerId,
        metadata: WorkerMetadata,
    },
    PeerLeft {
        peer_id: PeerId,
    },

    // ── Liveness ─────────────────────────────────────────────────
    Heartbeat {
        sequence: u64,
    },
    HeartbeatResponse {
        sequence: u64,
    },
    AdminVerify {
        request_id: String,
    },
    AdminVerifyAck {
        request_id: String,
    },

    // ── Discovery ────────────────────────────────────────────────
    QueryWorkers {
        #[serde(default)]
        filters: WorkerFilters,
    },
    WorkerList {
        workers: Vec<WorkerRecord>,
        total_count: usize,
    },

    // ── Connection negotiation ───────────────────────────────────
    MeshOffer {
        sdp: String,
        #[serde(default)]
        peer_class: PeerClass,
    },
    MeshAnswer {
        sdp: String,
    },
    MeshIceCandidate {
        candidate: String,
    },
    MeshPeerList {
        peers: Vec<PeerId>,
    },

    // ── Job negotiation ──────────────────────────────────────────
    JobRequest {
        job_id: String,
        job_type: JobType,
        #[serde(default)]
        config: serde_json::Value,
        #[serde(default)]
        requirements: JobRequirements,
    },
    JobResponse {
        job_id: String,
        accepted: bool,
        #[serde(default)]
        reason: Option<RejectReason>,
        #[serde(default)]
        estimated_duration_secs: Option<u64>,
    },
    JobAssignment {
        job_id: String,
    },
    JobCancel {
        job_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    JobCancelled {
        job_id: String,
    },
}

impl MeshMessage {
    /// Wire tag of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            MeshMessage::StatusUpdate { .. } => "status_update",
            MeshMessage::StateBroadcast { .. } => "state_broadcast",
            MeshMessage::StateRequest => "state_request",
            MeshMessage::PeerJoined { .. } => "peer_joined",
            MeshMessage::PeerLeft { .. } => "peer_left",
            MeshMessage::Heartbeat { .. } => "heartbeat",
            MeshMessage::HeartbeatResponse { .. } => "heartbeat_response",
            MeshMessage::AdminVerify { .. } => "admin_verify",
            MeshMessage::AdminVerifyAck { .. } => "admin_verify_ack",
            MeshMessage::QueryWorkers { .. } => "query_workers",
            MeshMessage::WorkerList { .. } => "worker_list",
            MeshMessage::MeshOffer { .. } => "mesh_offer",
            MeshMessage::MeshAnswer { .. } => "mesh_answer",
            MeshMessage::MeshIceCandidate { .. } => "mesh_ice_candidate",
            MeshMessage::MeshPeerList { .. } => "mesh_peer_list",
            MeshMessage::JobRequest { .. } => "job_request",
            MeshMessage::JobResponse { .. } => "job_response",
            MeshMessage::JobAssignment { .. } => "job_assignment",
            MeshMessage::JobCancel { .. } => "job_cancel",
            MeshMessage::JobCancelled { .. } => "job_cancelled",
        }
    }
}

/// Addressing wrapper around a [`MeshMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from_peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_peer_id: Option<PeerId>,
    #[serde(flatten)]
    pub message: MeshMessage,
}

impl Envelope {
    pub fn new(from: &str, to: Option<&str>, message: MeshMessage) -> Self {
        Self {
            from_peer_id: from.to_string(),
            to_peer_id: to.map(str::to_string),
            message,
        }
    }

    /// Encode as a single JSON frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode one frame. Unknown `type` tags and missing fields are errors.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Whether this frame is addressed to someone other than `local`.
    pub fn is_for_other(&self, local: &str) -> bool {
        matches!(self.to_peer_id.as_deref(), Some(to) if to != local)
    }
}

/// Capability to send a message to a peer by id.
///
/// Implementations must not block: sending enqueues onto a channel.
pub trait MessageSink: Send + Sync {
    /// Peer id that outgoing envelopes are stamped with.
    fn local_peer_id(&self) -> &str;

    /// Send `message` to `peer_id`, directly or through a relay.
    fn send_to(&self, peer_id: &str, message: MeshMessage) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_flat_snake_case_tags() {
        let env = Envelope::new(
            "w1",
            Some("w2"),
            MeshMessage::MeshIceCandidate {
                candidate: "c0".to_string(),
            },
        );
        let json: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "mesh_ice_candidate");
        assert_eq!(json["from_peer_id"], "w1");
        assert_eq!(json["to_peer_id"], "w2");
        assert_eq!(json["candidate"], "c0");
    }

    #[test]
    fn unaddressed_envelope_omits_destination() {
        let env = Envelope::new("w1", None, MeshMessage::Heartbeat { sequence: 7 });
        let frame = env.encode().unwrap();
        assert!(!frame.contains("to_peer_id"));
        assert_eq!(Envelope::decode(&frame).unwrap(), env);
    }

    #[test]
    fn snapshot_travels_as_hex() {
        let env = Envelope::new(
            "admin",
            None,
            MeshMessage::StateBroadcast {
                version: 3,
                snapshot: vec![0xde, 0xad, 0x01],
            },
        );
        let frame = env.encode().unwrap();
        assert!(frame.contains("\"snapshot\":\"dead01\""));
        match Envelope::decode(&frame).unwrap().message {
            MeshMessage::StateBroadcast { version, snapshot } => {
                assert_eq!(version, 3);
                assert_eq!(snapshot, vec![0xde, 0xad, 0x01]);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let frame = r#"{"type":"self_destruct","from_peer_id":"w1"}"#;
        assert!(matches!(
            Envelope::decode(frame),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn missing_sender_is_rejected() {
        let frame = r#"{"type":"heartbeat","sequence":1}"#;
        assert!(Envelope::decode(frame).is_err());
    }

    #[test]
    fn job_request_defaults_optional_fields() {
        let frame = r#"{"type":"job_request","from_peer_id":"c1","job_id":"j1","job_type":"inference"}"#;
        match Envelope::decode(frame).unwrap().message {
            MeshMessage::JobRequest {
                job_id,
                job_type,
                config,
                requirements,
            } => {
                assert_eq!(job_id, "j1");
                assert_eq!(job_type, JobType::Inference);
                assert!(config.is_null());
                assert_eq!(requirements, JobRequirements::default());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn state_request_has_no_fields() {
        let frame = r#"{"type":"state_request","from_peer_id":"w3","to_peer_id":"w2"}"#;
        let env = Envelope::decode(frame).unwrap();
        assert_eq!(env.message, MeshMessage::StateRequest);
        assert!(env.is_for_other("w1"));
        assert!(!env.is_for_other("w2"));
    }

    #[test]
    fn kind_matches_wire_tag() {
        let msg = MeshMessage::AdminVerifyAck {
            request_id: "r".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], msg.kind());
    }
}
