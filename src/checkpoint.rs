//! Opaque rollback checkpoints.
//!
//! A checkpoint captures the destination table, the owning file's content
//! hash, and the write high-water mark recorded before that file's first
//! row landed. Undoing the file is then a range delete: every row carrying
//! the file's source marker above the high-water mark. Tokens are encoded
//! (bincode, hex-rendered) so callers treat them as opaque strings;
//! checkpoints are append-only and only ever superseded by a later batch's
//! checkpoint for the same file.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

const CHECKPOINT_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub version: u8,
    pub table: String,
    pub source_hash: String,
    /// Highest row id present before the file's first write. Rows above
    /// this mark with the matching source hash belong to the file.
    pub high_water_row_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointToken(String);

impl CheckpointToken {
    pub fn encode(table: &str, source_hash: &str, high_water_row_id: i64) -> Result<Self> {
        let payload = CheckpointPayload {
            version: CHECKPOINT_VERSION,
            table: table.to_string(),
            source_hash: source_hash.to_string(),
            high_water_row_id,
        };
        let bytes = bincode::serde::encode_to_vec(&payload, bincode::config::standard())
            .map_err(|err| PipelineError::InvalidCheckpoint {
                reason: format!("Failed to encode payload: {err}"),
            })?;
        Ok(CheckpointToken(hex::encode(bytes)))
    }

    pub fn decode(&self) -> Result<CheckpointPayload> {
        let bytes = hex::decode(&self.0).map_err(|err| PipelineError::InvalidCheckpoint {
            reason: format!("Token is not valid hex: {err}"),
        })?;
        let (payload, _): (CheckpointPayload, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).map_err(
                |err| PipelineError::InvalidCheckpoint {
                    reason: format!("Failed to decode payload: {err}"),
                },
            )?;
        if payload.version != CHECKPOINT_VERSION {
            return Err(PipelineError::InvalidCheckpoint {
                reason: format!(
                    "Unsupported checkpoint version {} (expected {CHECKPOINT_VERSION})",
                    payload.version
                ),
            });
        }
        Ok(payload)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CheckpointToken {
    fn from(raw: String) -> Self {
        CheckpointToken(raw)
    }
}
