#![deny(missing_docs)]
//! Core type definitions for the vigil security pipeline.
//!
//! This crate groups together the strongly-typed values and message
//! structures exchanged between the gateway, dispatcher, pipeline workers,
//! decision fuser and server manager. It provides:
//!
//! * Thin wrappers around primitive values such as client names and pipeline
//!   ids, with consistent serialization and display implementations.
//! * The enforcement vocabulary ([`Action`] and [`Reason`] codes) shared with
//!   end-user clients.
//! * The queue payloads that travel through the broker (see [`messages`]).
//! * The queue/exchange namespace and the WebSocket close codes (see
//!   [`queues`] and [`ws_close_codes`]).
//!
//! Use these types to pass, store, and (de)serialize identifiers and
//! payloads in a type-safe way throughout the services.

use std::fmt;

use serde::{Deserialize, Serialize};

mod action;
pub mod messages;
pub mod queues;

pub use action::{Action, Reason};

/// Identity of a connected client.
///
/// Client names are case-insensitive on the wire; construction lowercases
/// and trims so that lookups across services agree on one canonical form.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientName(String);

impl ClientName {
    /// Canonicalizes the raw `user_name` sent by a client.
    ///
    /// Returns `None` if nothing remains after trimming.
    pub fn parse(raw: &str) -> Option<Self> {
        let canonical = raw.trim().to_lowercase();
        if canonical.is_empty() {
            None
        } else {
            Some(Self(canonical))
        }
    }

    /// Returns the canonical name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name as used in object-store keys (spaces become underscores).
    pub fn as_key_segment(&self) -> String {
        self.0.replace(' ', "_")
    }
}

impl fmt::Display for ClientName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The id of a pipeline worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(u32);

impl PipelineId {
    /// Creates a new `PipelineId` by wrapping a `u32`.
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Converts the pipeline id to a `u32`.
    pub fn into_inner(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_string())
    }
}

/// The two processing branches a frame is routed through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    /// Face detection, identity verification and spoof check.
    Face,
    /// Phone detection.
    Phone,
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Branch::Face => f.write_str("face"),
            Branch::Phone => f.write_str("phone"),
        }
    }
}

/// An axis-aligned bounding box, serialized as `[x1, y1, x2, y2]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BBox {
    /// Left edge.
    pub x1: i32,
    /// Top edge.
    pub y1: i32,
    /// Right edge.
    pub x2: i32,
    /// Bottom edge.
    pub y2: i32,
}

impl From<[i32; 4]> for BBox {
    fn from([x1, y1, x2, y2]: [i32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BBox> for [i32; 4] {
    fn from(value: BBox) -> Self {
        [value.x1, value.y1, value.x2, value.y2]
    }
}

impl BBox {
    /// Width of the box. Zero if degenerate.
    pub fn width(&self) -> u32 {
        (self.x2 - self.x1).max(0) as u32
    }

    /// Height of the box. Zero if degenerate.
    pub fn height(&self) -> u32 {
        (self.y2 - self.y1).max(0) as u32
    }
}

/// Formats a wall-clock instant the way clients expect `send_time` and
/// `finish_time` to look (`%H-%M-%S`, local time).
pub fn wall_clock_stamp(now: chrono::DateTime<chrono::Local>) -> String {
    now.format("%H-%M-%S").to_string()
}

/// A compact UTC timestamp used inside object-store keys.
pub fn object_key_stamp(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%Y%m%dT%H%M%S%6fZ").to_string()
}

/// WebSocket close codes used by the gateway.
pub mod ws_close_codes {
    /// A frame was denied by the rate limiter; the session is over.
    pub const RATE_LIMITED: u16 = 4003;
    /// Policy violation (blocked client).
    pub const POLICY: u16 = 1008;
    /// The gateway could not persist the frame to object storage.
    pub const STORAGE_FAILURE: u16 = 1011;
    /// Reserved for client-side connectivity errors; never sent by the
    /// server, but recognised when a peer closes with it.
    pub const CONNECTIVITY: u16 = 4000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_name_is_canonical() {
        assert_eq!(ClientName::parse("  Obama ").unwrap().as_str(), "obama");
        assert_eq!(ClientName::parse(" \t "), None);
        assert_eq!(
            ClientName::parse("Ada Lovelace").unwrap().as_key_segment(),
            "ada_lovelace"
        );
    }

    #[test]
    fn bbox_round_trips_as_array() {
        let bbox = BBox::from([10, 20, 110, 220]);
        let json = serde_json::to_string(&bbox).unwrap();
        assert_eq!(json, "[10,20,110,220]");
        assert_eq!(serde_json::from_str::<BBox>(&json).unwrap(), bbox);
        assert_eq!(bbox.width(), 100);
        assert_eq!(bbox.height(), 200);
    }
}
