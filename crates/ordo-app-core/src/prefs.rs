// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Preference records persisted through the config port.

use ordo_proto::{default_socket_path, BlobType, Tick};
use serde::{Deserialize, Serialize};

/// Config key for [`SequencerPrefs`].
pub const SEQUENCER_PREFS_KEY: &str = "sequencer";
/// Config key for [`TickState`].
pub const TICK_STATE_KEY: &str = "tick_state";

/// Saved settings for the sequencer process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerPrefs {
    /// Unix socket the sequencer listens on.
    pub socket_path: String,
    /// Blob encoding advertised in greetings.
    #[serde(default)]
    pub blob: BlobType,
}

impl Default for SequencerPrefs {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path().display().to_string(),
            blob: BlobType::default(),
        }
    }
}

/// Last global tick handed out, saved on shutdown so a restarted sequencer
/// resumes the sequence instead of reusing ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickState {
    /// Last assigned tick.
    pub tick: Tick,
}
