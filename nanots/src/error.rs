// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// NanoTS database error
#[derive(Debug, Error)]
pub enum Error {
    /// A payload cannot fit into a single block, even an empty one. The
    /// caller must shrink the payload or re-allocate the container with a
    /// larger block size.
    #[error("payload of {payload_len} bytes exceeds the per-block maximum of {max_payload} bytes")]
    RowSizeTooBig {
        payload_len: usize,
        max_payload: u64,
    },
    /// A write violates the per-stream timestamp ordering. Caller bug; the
    /// offending write is rejected and no state is mutated.
    #[error("non-monotonic timestamp {timestamp} on stream {stream} (tail is at {last_timestamp})")]
    NonMonotonicTimestamp {
        stream: String,
        timestamp: i64,
        last_timestamp: i64,
    },
    /// No free block is available and auto-reclaim is disabled.
    #[error("container is full and auto-reclaim is disabled")]
    OutOfSpace,
    /// A block failed its magic or checksum validation. Reads skip past the
    /// block and keep going; the report carries the block id.
    #[error("corrupt block {block_id}: {reason}")]
    CorruptBlock { block_id: u64, reason: String },
    /// The requested stream or entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn corrupt(block_id: u64, reason: impl Into<String>) -> Self {
        Self::CorruptBlock {
            block_id,
            reason: reason.into(),
        }
    }

    pub(crate) fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
