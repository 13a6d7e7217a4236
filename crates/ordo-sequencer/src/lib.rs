// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Ordo sequencer: the single ordering authority of the tuplespace.
//!
//! Clients send unordered data messages; the sequencer stamps each with the
//! next global tick and forwards it to every connection whose subscriptions
//! match. [`Sequencer`] is the transport-free core; [`SequencerService`]
//! runs it over Unix sockets.

mod sequencer;
mod service;

pub use sequencer::{ConnId, Outbox, Sequencer, SequencerConfig};
pub use service::{SequencerService, ServiceError, ServiceHandle};
