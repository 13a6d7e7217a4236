// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Data model and wire schema for the Ordo ordered tuplespace.
//!
//! Tuples and templates are the storage/matching primitives; [`Message`] is
//! the unit exchanged with the sequencer. Framing lives in [`wire`].

mod blob;
mod template;
mod tuple;
pub mod wire;

pub use blob::{BlobError, BlobType, Transaction};
pub use template::{FieldPattern, Refinement, Template};
pub use tuple::{Float, Tuple, Value};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default Unix socket path for the sequencer.
///
/// Prefers a per-user runtime dir (XDG_RUNTIME_DIR) and falls back to `/tmp`
/// when unavailable.
pub fn default_socket_path() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    base.join("ordo-sequencer.sock")
}

/// Global sequence number assigned by the sequencer.
pub type Tick = u64;

/// Identifier a client chooses for itself; echoed back in reflections.
pub type ClientId = u64;

/// Routing label attached to data messages.
pub type Tag = String;

/// Canonical envelope carried as the payload of a framed packet.
///
/// * `op` – operation name.
/// * `ts` – tick current when the sender emitted the frame (authoritative
///   only when the sender is the sequencer; clients send 0).
/// * `payload` – operation specific body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpEnvelope<P> {
    /// Operation name ("greeting", "control", "data", "reflect").
    pub op: String,
    /// Logical timestamp.
    pub ts: Tick,
    /// Operation-specific body.
    pub payload: P,
}

/// Static configuration sent once per connection, right after accept.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Greeting {
    /// Encoding of data-message blobs.
    pub blob: BlobType,
    /// Global tick at the moment the connection was registered.
    pub tick: Tick,
}

/// Subscription control operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOp {
    /// Receive every data message.
    SubscribeAll,
    /// Receive data messages carrying any of these tags.
    Subscribe(Vec<Tag>),
    /// Stop receiving untargeted traffic.
    UnsubscribeAll,
    /// Stop receiving these tags.
    Unsubscribe(Vec<Tag>),
    /// Operation name this build does not know; never acknowledged.
    Unrecognized(String),
}

/// Wire shape of [`ControlOp`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlPayload {
    /// Operation name.
    pub op: String,
    /// Tags for the tagged variants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<Tag>>,
}

impl ControlOp {
    /// Canonical op string.
    pub fn name(&self) -> &str {
        match self {
            ControlOp::SubscribeAll => "subscribe_all",
            ControlOp::Subscribe(_) => "subscribe",
            ControlOp::UnsubscribeAll => "unsubscribe_all",
            ControlOp::Unsubscribe(_) => "unsubscribe",
            ControlOp::Unrecognized(op) => op,
        }
    }

    /// Lower into the wire payload.
    pub fn to_payload(&self) -> ControlPayload {
        let tags = match self {
            ControlOp::Subscribe(tags) | ControlOp::Unsubscribe(tags) => Some(tags.clone()),
            _ => None,
        };
        ControlPayload {
            op: self.name().to_owned(),
            tags,
        }
    }

    /// Lift from the wire payload. Unknown names and tagged ops without tags
    /// become [`ControlOp::Unrecognized`].
    pub fn from_payload(p: ControlPayload) -> Self {
        match (p.op.as_str(), p.tags) {
            ("subscribe_all", _) => ControlOp::SubscribeAll,
            ("unsubscribe_all", _) => ControlOp::UnsubscribeAll,
            ("subscribe", Some(tags)) => ControlOp::Subscribe(tags),
            ("unsubscribe", Some(tags)) => ControlOp::Unsubscribe(tags),
            _ => ControlOp::Unrecognized(p.op),
        }
    }
}

/// The sequenced unit. The transaction travels in `blob`; the sequencer
/// stamps `global_tick` and otherwise treats the message as opaque.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataMessage {
    /// Originating client.
    pub client_id: ClientId,
    /// Client-local sequence number.
    pub local_tick: Tick,
    /// Assigned by the sequencer; 0 until stamped.
    pub global_tick: Tick,
    /// Client-local bookkeeping; cleared by the sequencer before fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<u64>,
    /// Routing tags; empty means broadcast to all-subscribers.
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Ask the sequencer to echo a [`ReflectAck`] back to the sender.
    #[serde(default)]
    pub reflect: bool,
    /// Encoded [`Transaction`] (see [`Greeting::blob`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<Vec<u8>>,
}

impl DataMessage {
    /// Build a message carrying `txn` encoded with `blob`.
    pub fn with_transaction(
        client_id: ClientId,
        local_tick: Tick,
        blob: BlobType,
        txn: &Transaction,
    ) -> Result<Self, BlobError> {
        Ok(Self {
            client_id,
            local_tick,
            blob: Some(blob.encode(txn)?),
            ..Self::default()
        })
    }

    /// Decode the carried transaction.
    pub fn transaction(&self, blob: BlobType) -> Result<Transaction, BlobError> {
        let bytes = self.blob.as_deref().ok_or(BlobError::Missing)?;
        blob.decode(bytes)
    }
}

/// Reduced message echoed to the originator of a reflected data message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReflectAck {
    /// Originating client.
    pub client_id: ClientId,
    /// Client-local sequence number of the reflected message.
    pub local_tick: Tick,
    /// Tick the sequencer assigned to it.
    pub global_tick: Tick,
}

/// Wire message kinds carried inside OpEnvelope payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Sequencer greeting (op = "greeting").
    Greeting(Greeting),
    /// Subscription request or its acknowledgement (op = "control").
    Control(ControlOp),
    /// Sequenced data (op = "data").
    Data(DataMessage),
    /// Reduced echo for a reflected data message (op = "reflect").
    Reflect(ReflectAck),
}

impl Message {
    /// Canonical op string for this message variant.
    pub fn op_name(&self) -> &'static str {
        match self {
            Message::Greeting(_) => "greeting",
            Message::Control(_) => "control",
            Message::Data(_) => "data",
            Message::Reflect(_) => "reflect",
        }
    }
}
