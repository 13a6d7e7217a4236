// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared application services for Ordo processes (config port, prefs).
//! Keeps the sequencer binary and embedding clients storage-agnostic.

pub mod config;
pub mod prefs;
