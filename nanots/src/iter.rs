// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Lazy, restartable cursor over one stream.
//!
//! The iterator positions with `find`, walks with `next`, and crosses
//! block boundaries by asking the catalog for the next sequence past the
//! current block, which skips reclaim and session gaps and picks up
//! blocks sealed after the cursor was created. Within a sealed block,
//! positioning binary-searches the frame directory; the open tail is
//! scanned linearly.

use std::path::Path;

use log::warn;

use crate::block::{find_first_at_or_after, read_frame, scan_frames, FrameMeta};
use crate::catalog::{BlockRow, Catalog};
use crate::container::{self, Container};
use crate::format::{BlockHeader, BlockState};
use crate::{Error, Frame, Result};

/// Cursor over the frames of one stream, in timestamp order.
pub struct StreamIterator {
    container: Container,
    catalog: Catalog,
    stream: String,
    cursor: Option<Cursor>,
}

struct Cursor {
    sequence: u64,
    buf: Vec<u8>,
    frames: Vec<FrameMeta>,
    index: usize,
}

impl StreamIterator {
    pub fn open(path: impl AsRef<Path>, stream: &str) -> Result<Self> {
        let path = path.as_ref();
        let container = Container::open_ro(path)?;
        let catalog = Catalog::open_shared(&container::sidecar_path(path, ".idx"))?;
        Ok(Self {
            container,
            catalog,
            stream: stream.to_string(),
            cursor: None,
        })
    }

    /// Positions the cursor on the first frame with `timestamp ≥ ts`.
    /// With no such frame the cursor becomes invalid; that is not an
    /// error.
    pub fn find(&mut self, ts: i64) -> Result<()> {
        self.cursor = None;
        let rows = self.catalog.stream_blocks(&self.stream)?;
        // Rows are sequence-ordered, which by the sealing invariant is
        // also start_ts order: begin at the last block starting at or
        // before `ts`.
        let first_candidate = rows.partition_point(|row| row.start_ts <= ts).saturating_sub(1);
        for row in &rows[first_candidate..] {
            let loaded = match self.load(row) {
                Ok(loaded) => loaded,
                Err(error) => {
                    warn!("iterator over {} skipped block {}: {error}", self.stream, row.block_id);
                    continue;
                }
            };
            let Some((header, buf, frames)) = loaded else {
                continue;
            };
            let index = match header.state {
                BlockState::Sealed => find_first_at_or_after(&buf, &header, ts, row.block_id)?,
                _ => frames
                    .iter()
                    .position(|meta| meta.timestamp >= ts)
                    .map(|i| i as u32),
            };
            if let Some(index) = index {
                self.cursor = Some(Cursor {
                    sequence: row.sequence,
                    buf,
                    frames,
                    index: index as usize,
                });
                return Ok(());
            }
        }
        Ok(())
    }

    /// Repositions to the first frame of the stream's first block.
    pub fn reset(&mut self) -> Result<()> {
        self.cursor = None;
        let rows = self.catalog.stream_blocks(&self.stream)?;
        for row in &rows {
            match self.load(row) {
                Ok(Some((_, buf, frames))) if !frames.is_empty() => {
                    self.cursor = Some(Cursor {
                        sequence: row.sequence,
                        buf,
                        frames,
                        index: 0,
                    });
                    return Ok(());
                }
                Ok(_) => {}
                Err(error) => {
                    warn!("iterator over {} skipped block {}: {error}", self.stream, row.block_id);
                }
            }
        }
        Ok(())
    }

    /// Advances one frame, following the stream to its next block when the
    /// current one is exhausted. Past the last frame the cursor becomes
    /// invalid; `next` on an invalid cursor is a no-op.
    pub fn next(&mut self) -> Result<()> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(());
        };
        if cursor.index + 1 < cursor.frames.len() {
            cursor.index += 1;
            return Ok(());
        }

        let mut sequence = cursor.sequence;
        self.cursor = None;
        loop {
            let Some(row) = self.catalog.next_stream_block(&self.stream, sequence)? else {
                return Ok(());
            };
            match self.load(&row) {
                Ok(Some((_, buf, frames))) if !frames.is_empty() => {
                    self.cursor = Some(Cursor {
                        sequence: row.sequence,
                        buf,
                        frames,
                        index: 0,
                    });
                    return Ok(());
                }
                // An empty open tail: the stream ends here for now.
                Ok(Some(_)) | Ok(None) => return Ok(()),
                Err(error) => {
                    warn!("iterator over {} skipped block {}: {error}", self.stream, row.block_id);
                    sequence = row.sequence;
                }
            }
        }
    }

    /// True iff the cursor is positioned on a frame.
    pub fn valid(&self) -> bool {
        self.cursor.is_some()
    }

    /// The frame under the cursor, or `None` when invalid.
    pub fn current_frame(&self) -> Option<Frame> {
        let cursor = self.cursor.as_ref()?;
        let meta = cursor.frames.get(cursor.index)?;
        Some(read_frame(&cursor.buf, meta, cursor.sequence))
    }

    /// Loads one block image and its frame metas. `Ok(None)` means the
    /// block is a tail that is not visible yet (nothing published under
    /// this row's identity).
    #[allow(clippy::type_complexity)]
    fn load(&self, row: &BlockRow) -> Result<Option<(BlockHeader, Vec<u8>, Vec<FrameMeta>)>> {
        let buf = self.container.read_block(row.block_id)?;
        let header = match row.state {
            BlockState::Sealed => {
                let header = BlockHeader::decode_verified(&buf, row.block_id)?;
                if header.state != BlockState::Sealed
                    || header.sequence != row.sequence
                    || header.stream_tag != row.stream_tag
                {
                    // Reclaimed and reused since the catalog was queried.
                    return Ok(None);
                }
                header
            }
            BlockState::Open => match BlockHeader::decode(&buf, row.block_id) {
                Ok(header)
                    if header.sequence == row.sequence && header.state != BlockState::Free =>
                {
                    header
                }
                _ => return Ok(None),
            },
            BlockState::Free => {
                return Err(Error::corrupt(row.block_id, "catalog row for a free block"))
            }
        };
        let frames = scan_frames(&buf, &header, row.block_id)?;
        Ok(Some((header, buf, frames)))
    }
}
