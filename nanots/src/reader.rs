// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Range reads and metadata queries.
//!
//! A reader is independent of any writer on the same container: it locates
//! candidate blocks through a catalog snapshot and loads each block image
//! on demand. Sealed blocks are checksum-verified; the live open tail is
//! scanned linearly, bounded by the frame count its on-disk header
//! announces, which the writer only publishes after the covered frames are
//! written. A corrupt block is skipped and reported while the rest of the
//! read proceeds.

use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::block::{read_frame, scan_frames};
use crate::catalog::{BlockRow, Catalog, Segment};
use crate::container::{self, Container};
use crate::format::{BlockHeader, BlockState};
use crate::{Error, Frame, Result};

/// The result of [`Reader::read_detailed`]: the frames that could be read,
/// plus a report per block that could not.
#[derive(Debug)]
pub struct ReadOutcome {
    pub frames: Vec<Frame>,
    /// One [`Error::CorruptBlock`] per skipped block.
    pub corrupt: Vec<Error>,
}

/// Read-only query handle over a container.
pub struct Reader {
    container: Container,
    catalog: Catalog,
    path: PathBuf,
}

impl Reader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let container = Container::open_ro(&path)?;
        let catalog = Catalog::open_shared(&container::sidecar_path(&path, ".idx"))?;
        Ok(Self {
            container,
            catalog,
            path,
        })
    }

    /// All frames of `stream` with `timestamp ∈ [lo, hi]`, in timestamp
    /// order. Corrupt blocks are logged and skipped.
    pub fn read(&self, stream: &str, lo: i64, hi: i64) -> Result<Vec<Frame>> {
        let outcome = self.read_detailed(stream, lo, hi)?;
        for error in &outcome.corrupt {
            warn!("read of stream {stream} skipped a block: {error}");
        }
        Ok(outcome.frames)
    }

    /// As [`Reader::read`], but returns the per-block corruption reports
    /// instead of logging them.
    pub fn read_detailed(&self, stream: &str, lo: i64, hi: i64) -> Result<ReadOutcome> {
        let rows = self.catalog.range_scan(stream, lo, hi)?;
        let mut outcome = ReadOutcome {
            frames: Vec::new(),
            corrupt: Vec::new(),
        };
        for row in rows {
            match self.collect_block_frames(&row, lo, hi, &mut outcome.frames) {
                Ok(()) => {}
                Err(error @ Error::CorruptBlock { .. }) => outcome.corrupt.push(error),
                Err(error) => return Err(error),
            }
        }
        Ok(outcome)
    }

    /// Names of streams with data in `[lo, hi]`, live open tails included.
    pub fn query_stream_tags(&self, lo: i64, hi: i64) -> Result<Vec<String>> {
        self.catalog.list_stream_tags(lo, hi)
    }

    /// Runs of sequence-consecutive blocks of `stream` intersecting
    /// `[lo, hi]`, one segment per run, in time order.
    pub fn query_contiguous_segments(&self, stream: &str, lo: i64, hi: i64) -> Result<Vec<Segment>> {
        self.catalog.contiguous_segments(stream, lo, hi)
    }

    /// The metadata string recorded when the stream was first created.
    pub fn stream_metadata(&self, stream: &str) -> Result<Option<String>> {
        let row = self
            .catalog
            .stream(stream)?
            .ok_or_else(|| Error::NotFound(format!("stream {stream}")))?;
        Ok(row.metadata)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn collect_block_frames(
        &self,
        row: &BlockRow,
        lo: i64,
        hi: i64,
        frames: &mut Vec<Frame>,
    ) -> Result<()> {
        let buf = self.container.read_block(row.block_id)?;
        let header = match row.state {
            BlockState::Sealed => {
                let header = BlockHeader::decode_verified(&buf, row.block_id)?;
                if header.state != BlockState::Sealed
                    || header.sequence != row.sequence
                    || header.stream_tag != row.stream_tag
                {
                    // A valid header under a different identity: the block
                    // was reclaimed and reused after our catalog snapshot.
                    debug!("block {} was reclaimed mid-read, skipping", row.block_id);
                    return Ok(());
                }
                header
            }
            BlockState::Open => {
                // The open tail is re-published concurrently; a block that
                // does not (yet) carry this row's identity simply has no
                // visible frames.
                match BlockHeader::decode(&buf, row.block_id) {
                    Ok(header)
                        if header.sequence == row.sequence
                            && header.state != BlockState::Free =>
                    {
                        header
                    }
                    _ => {
                        debug!("tail block {} not yet visible, skipping", row.block_id);
                        return Ok(());
                    }
                }
            }
            BlockState::Free => {
                return Err(Error::corrupt(row.block_id, "catalog row for a free block"))
            }
        };

        for meta in scan_frames(&buf, &header, row.block_id)? {
            if meta.timestamp > hi {
                break;
            }
            if meta.timestamp >= lo {
                frames.push(read_frame(&buf, &meta, header.sequence));
            }
        }
        Ok(())
    }
}
