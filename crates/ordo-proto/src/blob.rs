// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Blob encodings for transaction payloads.
//!
//! The sequencer never looks inside a blob; it only advertises which encoding
//! the space uses in its greeting so every participant decodes the same way.

use crate::Tuple;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Encoding used for data-message blobs, fixed for the lifetime of a sequencer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobType {
    /// CBOR (compact, the default).
    #[default]
    Cbor,
    /// JSON (human-readable, handy for debugging).
    Json,
}

/// Failure to encode or decode a blob.
#[derive(Debug, Error)]
pub enum BlobError {
    /// CBOR encode/decode failure.
    #[error("cbor blob: {0}")]
    Cbor(String),
    /// JSON encode/decode failure.
    #[error("json blob: {0}")]
    Json(#[from] serde_json::Error),
    /// Data message arrived without a blob.
    #[error("data message carries no blob")]
    Missing,
}

impl BlobType {
    /// Serialize `value` with this encoding.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, BlobError> {
        match self {
            BlobType::Cbor => {
                let mut out = Vec::new();
                ciborium::ser::into_writer(value, &mut out)
                    .map_err(|e| BlobError::Cbor(e.to_string()))?;
                Ok(out)
            }
            BlobType::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Deserialize a value previously produced by [`BlobType::encode`].
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, BlobError> {
        match self {
            BlobType::Cbor => {
                ciborium::de::from_reader(bytes).map_err(|e| BlobError::Cbor(e.to_string()))
            }
            BlobType::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }

    /// Stable identifier used in greetings and config files.
    pub fn as_str(self) -> &'static str {
        match self {
            BlobType::Cbor => "cbor",
            BlobType::Json => "json",
        }
    }
}

impl fmt::Display for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cbor" => Ok(BlobType::Cbor),
            "json" => Ok(BlobType::Json),
            other => Err(format!("unknown blob type {other:?} (expected cbor or json)")),
        }
    }
}

/// One atomic mutation of the space: deletions are applied before insertions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Tuples to remove, one instance each.
    #[serde(default)]
    pub deletes: Vec<Tuple>,
    /// Tuples to add.
    #[serde(default)]
    pub inserts: Vec<Tuple>,
}

impl Transaction {
    /// Pure write of `tuples`.
    pub fn write(tuples: impl IntoIterator<Item = Tuple>) -> Self {
        Self {
            deletes: Vec::new(),
            inserts: tuples.into_iter().collect(),
        }
    }

    /// True when the transaction neither deletes nor inserts.
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty()
    }
}
