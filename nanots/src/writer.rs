// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The per-stream append path.
//!
//! One writer per container; a writer may hold several live contexts, one
//! open tail block each. Appends go into an in-memory tail image and are
//! published to the container periodically (frames first, header last), so
//! concurrent readers only ever see whole frames. Sealing flushes the block
//! and then commits its immutable catalog row, in that order; recovery on
//! the next open frees any sealed block whose row never landed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use human_repr::HumanCount;
use log::{debug, info, warn};

use crate::block::{scan_frames, BlockBuf, BlockFull};
use crate::catalog::{BlockRow, Catalog};
use crate::container::{self, Container};
use crate::format::{max_payload, BlockHeader, BlockState, FLAG_FLUSH_AFTER, NO_BLOCK};
use crate::{Error, Result};

/// Tuning knobs for a [`Writer`].
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// When the container is full, recycle the sealed block holding the
    /// oldest data instead of failing with `OutOfSpace`.
    pub auto_reclaim: bool,
    /// Publish the open tail to the container every this many frames. A
    /// frame with [`FLAG_FLUSH_AFTER`] publishes immediately regardless.
    pub flush_interval: u32,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            auto_reclaim: false,
            flush_interval: 64,
        }
    }
}

/// Per-stream write handle. Holds the open tail block, if any; closing the
/// context seals it.
pub struct WriteContext {
    stream_name: String,
    stream_tag: u64,
    next_sequence: u64,
    /// Newest timestamp accepted on this stream; the monotonic floor.
    last_ts: Option<i64>,
    tail: Option<BlockBuf>,
    frames_since_flush: u32,
}

impl WriteContext {
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }
}

/// Append handle over one container. Single-threaded per handle; writer
/// handles serialize at the container lock.
pub struct Writer {
    container: Container,
    catalog: Catalog,
    options: WriterOptions,
    /// Streams with a live context; at most one open tail per stream.
    active_streams: HashSet<String>,
    path: PathBuf,
}

impl Writer {
    pub fn open(path: impl AsRef<Path>, options: WriterOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut container = Container::open_rw(&path)?;
        let catalog = Catalog::open_rw(&container::sidecar_path(&path, ".idx"))?;
        recover(&mut container, &catalog)?;
        Ok(Self {
            container,
            catalog,
            options,
            active_streams: HashSet::new(),
            path,
        })
    }

    /// Resolves (or creates) the stream and returns a write context for
    /// it. No block is allocated until the first write.
    pub fn create_context(
        &mut self,
        stream_name: &str,
        metadata: Option<&str>,
    ) -> Result<WriteContext> {
        if self.active_streams.contains(stream_name) {
            return Err(Error::other(format!(
                "stream {stream_name} already has a live write context"
            )));
        }
        let stream = self.catalog.upsert_stream(stream_name, metadata)?;
        let last_ts = self.catalog.last_end_ts(stream_name)?;

        // A fresh context on a stream with history starts a new recording
        // session: the sequence gap it leaves splits contiguous segments
        // at the session boundary.
        let mut next_sequence = stream.next_sequence;
        if next_sequence > 0 {
            next_sequence += 1;
            self.catalog.set_next_sequence(stream_name, next_sequence)?;
        }

        self.active_streams.insert(stream_name.to_string());
        Ok(WriteContext {
            stream_name: stream_name.to_string(),
            stream_tag: stream.stream_id as u64,
            next_sequence,
            last_ts,
            tail: None,
            frames_since_flush: 0,
        })
    }

    /// Appends one frame to the context's stream.
    ///
    /// Fails without mutating any state when the payload cannot fit in a
    /// block or the timestamp runs backwards; `ts == last_ts` is allowed
    /// (non-decreasing order).
    pub fn write(
        &mut self,
        ctx: &mut WriteContext,
        payload: &[u8],
        timestamp_ms: i64,
        flags: u32,
    ) -> Result<()> {
        let max = max_payload(self.container.block_size());
        if payload.len() as u64 > max {
            return Err(Error::RowSizeTooBig {
                payload_len: payload.len(),
                max_payload: max,
            });
        }
        if let Some(last_ts) = ctx.last_ts {
            if timestamp_ms < last_ts {
                return Err(Error::NonMonotonicTimestamp {
                    stream: ctx.stream_name.clone(),
                    timestamp: timestamp_ms,
                    last_timestamp: last_ts,
                });
            }
        }

        if ctx.tail.is_none() {
            self.open_tail(ctx, timestamp_ms)?;
        }
        let tail = ctx.tail.as_mut().expect("tail was just ensured");
        if let Err(BlockFull) = tail.append(timestamp_ms, flags, payload) {
            // Roll: seal the full tail, open a fresh block, retry once.
            self.seal_tail(ctx)?;
            self.open_tail(ctx, timestamp_ms)?;
            let tail = ctx.tail.as_mut().expect("tail was just opened");
            if let Err(BlockFull) = tail.append(timestamp_ms, flags, payload) {
                return Err(Error::RowSizeTooBig {
                    payload_len: payload.len(),
                    max_payload: max,
                });
            }
        }

        ctx.last_ts = Some(timestamp_ms);
        ctx.frames_since_flush += 1;
        if flags & FLAG_FLUSH_AFTER != 0 {
            self.flush_context(ctx)?;
        } else if ctx.frames_since_flush >= self.options.flush_interval {
            self.publish_tail(ctx, false)?;
        }
        Ok(())
    }

    /// Publishes the context's tail to the container and syncs it to disk.
    pub fn flush_context(&mut self, ctx: &mut WriteContext) -> Result<()> {
        self.publish_tail(ctx, true)
    }

    /// Syncs all container bytes published so far.
    pub fn flush(&mut self) -> Result<()> {
        self.container.sync()
    }

    /// Seals the open tail (if any) and consumes the context.
    pub fn close_context(&mut self, mut ctx: WriteContext) -> Result<()> {
        self.active_streams.remove(&ctx.stream_name);
        self.seal_tail(&mut ctx)
    }

    /// Persists the free-list hint and syncs the container. Contexts seal
    /// their tails in `close_context`; a context dropped without closing
    /// loses only its unpublished frames, and recovery seals the published
    /// prefix on the next open.
    pub fn close(mut self) -> Result<()> {
        self.container.persist_free_head()?;
        self.container.sync()
    }

    fn open_tail(&mut self, ctx: &mut WriteContext, first_ts: i64) -> Result<()> {
        let id = self.alloc_block()?;

        // Stream links are re-read from the catalog rather than cached:
        // auto-reclaim may have retired the previous tail of any stream in
        // the meantime.
        let stream = self
            .catalog
            .stream(&ctx.stream_name)?
            .ok_or_else(|| Error::NotFound(format!("stream {}", ctx.stream_name)))?;
        let prev_block = stream.tail_block.unwrap_or(NO_BLOCK);

        let sequence = ctx.next_sequence;
        ctx.next_sequence += 1;
        self.catalog
            .set_next_sequence(&ctx.stream_name, ctx.next_sequence)?;

        if prev_block != NO_BLOCK {
            self.link_next(prev_block, id)?;
        }

        let block = BlockBuf::new_open(
            id,
            self.container.block_size(),
            sequence,
            ctx.stream_tag,
            first_ts,
            prev_block,
        );
        self.container.publish_block(id, block.bytes())?;
        self.catalog.insert_open_block(&row_from_header(
            id,
            &ctx.stream_name,
            block.header(),
        ))?;
        self.catalog.set_stream_links(
            &ctx.stream_name,
            stream.head_block.or(Some(id)),
            Some(id),
        )?;

        debug!(
            "stream {} opened tail block {id} (sequence {sequence})",
            ctx.stream_name
        );
        ctx.tail = Some(block);
        ctx.frames_since_flush = 0;
        Ok(())
    }

    fn alloc_block(&mut self) -> Result<u64> {
        if let Some(id) = self.container.alloc_lowest() {
            return Ok(id);
        }
        if !self.options.auto_reclaim {
            return Err(Error::OutOfSpace);
        }
        self.reclaim_oldest()?;
        self.container.alloc_lowest().ok_or(Error::OutOfSpace)
    }

    /// Recycles the sealed block with the smallest `(stream_name,
    /// sequence)` in the container: the oldest data overall.
    fn reclaim_oldest(&mut self) -> Result<()> {
        let victim = self
            .catalog
            .oldest_sealed_block()?
            .ok_or(Error::OutOfSpace)?;

        // Unlink from the stream chain. The victim is its stream's oldest
        // sealed block, so only the successor's back link needs clearing.
        let next_block = BlockHeader::decode(
            &self.container.read_header_bytes(victim.block_id)?,
            victim.block_id,
        )
        .map(|h| h.next_block)
        .unwrap_or(NO_BLOCK);
        if next_block != NO_BLOCK {
            if let Ok(mut header) = BlockHeader::decode(
                &self.container.read_header_bytes(next_block)?,
                next_block,
            ) {
                // The writer owns open images in memory; only rewrite
                // sealed successors.
                if header.state == BlockState::Sealed {
                    header.prev_block = NO_BLOCK;
                    let mut bytes = self.container.read_header_bytes(next_block)?;
                    header.encode_into(&mut bytes);
                    self.container.write_header_bytes(next_block, &bytes)?;
                }
            }
        }

        let stream = self.catalog.stream(&victim.stream_name)?;
        if let Some(stream) = stream {
            let head = if stream.head_block == Some(victim.block_id) {
                (next_block != NO_BLOCK).then_some(next_block)
            } else {
                stream.head_block
            };
            let tail = if stream.tail_block == Some(victim.block_id) {
                None
            } else {
                stream.tail_block
            };
            self.catalog
                .set_stream_links(&victim.stream_name, head, tail)?;
        }

        self.catalog.delete_block_on_reclaim(victim.block_id)?;
        self.container.release(victim.block_id)?;
        info!(
            "reclaimed block {} (stream {}, sequence {}, {} frames)",
            victim.block_id, victim.stream_name, victim.sequence, victim.frame_count
        );
        Ok(())
    }

    fn publish_tail(&mut self, ctx: &mut WriteContext, durable: bool) -> Result<()> {
        let Some(block) = ctx.tail.as_ref() else {
            return Ok(());
        };
        self.container.publish_block(block.id(), block.bytes())?;
        if durable {
            self.container.sync()?;
        }
        let header = block.header();
        self.catalog.refresh_open_block(
            block.id(),
            header.last_ts,
            header.frame_count,
            header.bytes_used,
        )?;
        ctx.frames_since_flush = 0;
        Ok(())
    }

    fn seal_tail(&mut self, ctx: &mut WriteContext) -> Result<()> {
        let Some(mut block) = ctx.tail.take() else {
            return Ok(());
        };
        block.seal();
        // Block bytes reach the disk before the sealed catalog row; a
        // crash in between leaves an orphan for recovery to free.
        self.container.publish_block(block.id(), block.bytes())?;
        self.container.sync()?;
        self.catalog
            .upsert_block_on_seal(&row_from_header(block.id(), &ctx.stream_name, block.header()))?;
        debug!(
            "stream {} sealed block {} ({} frames, {})",
            ctx.stream_name,
            block.id(),
            block.header().frame_count,
            (block.header().bytes_used as u64).human_count_bytes(),
        );
        ctx.frames_since_flush = 0;
        Ok(())
    }

    /// Rewrites a sealed predecessor's forward link when a new tail is
    /// chained behind it.
    fn link_next(&mut self, prev_block: u64, next_block: u64) -> Result<()> {
        let mut bytes = self.container.read_header_bytes(prev_block)?;
        let mut header = BlockHeader::decode(&bytes, prev_block)?;
        header.next_block = next_block;
        header.encode_into(&mut bytes);
        self.container.write_header_bytes(prev_block, &bytes)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn row_from_header(block_id: u64, stream_name: &str, header: &BlockHeader) -> BlockRow {
    BlockRow {
        block_id,
        stream_name: stream_name.to_string(),
        stream_tag: header.stream_tag,
        sequence: header.sequence,
        start_ts: header.first_ts,
        end_ts: header.last_ts,
        state: header.state,
        frame_count: header.frame_count,
        bytes_used: header.bytes_used,
    }
}

/// Reconciles the container and the catalog after an unclean shutdown.
///
/// Disk is the source of truth for block bytes, the catalog for
/// referencing: a sealed block without a row was never committed and is
/// freed; an open block with a row is sealed from its on-disk header
/// (salvaging the flushed prefix); an open block without a row, or with no
/// usable frames, is freed; rows pointing at free blocks are dropped.
fn recover(container: &mut Container, catalog: &Catalog) -> Result<()> {
    let live = container.rebuild_free_set()?;
    let rows: HashMap<u64, BlockRow> = catalog
        .all_blocks()?
        .into_iter()
        .map(|row| (row.block_id, row))
        .collect();

    let mut disk_live = HashSet::new();
    for (id, header) in live {
        match (header.state, rows.get(&id)) {
            (BlockState::Sealed, Some(row)) => {
                if row.state != BlockState::Sealed {
                    // Sealed on disk before the crash, but the final row
                    // never committed: re-derive it from the header. A
                    // torn header means the seal never completed either
                    // way, so the block goes back to the free set.
                    match BlockHeader::decode_verified(&container.read_block(id)?, id) {
                        Ok(header) => {
                            catalog.upsert_block_on_seal(&row_from_header(
                                id,
                                &row.stream_name,
                                &header,
                            ))?;
                            disk_live.insert(id);
                        }
                        Err(error) => {
                            warn!("freeing block {id} with torn seal: {error}");
                            catalog.delete_block_on_reclaim(id)?;
                            container.release(id)?;
                        }
                    }
                } else {
                    disk_live.insert(id);
                }
            }
            (BlockState::Sealed, None) => {
                warn!("freeing orphan sealed block {id} (no catalog row)");
                container.release(id)?;
            }
            (BlockState::Open, Some(row)) => {
                let buf = container.read_block(id)?;
                let mut header = BlockHeader::decode(&buf, id)?;
                if header.frame_count == 0 || scan_frames(&buf, &header, id).is_err() {
                    warn!("freeing interrupted tail block {id} (no usable frames)");
                    catalog.delete_block_on_reclaim(id)?;
                    container.release(id)?;
                } else {
                    info!(
                        "sealing interrupted tail block {id} with {} salvaged frames",
                        header.frame_count
                    );
                    header.state = BlockState::Sealed;
                    let mut image = buf;
                    header.encode_into(&mut image);
                    container.publish_block(id, &image)?;
                    catalog.upsert_block_on_seal(&row_from_header(id, &row.stream_name, &header))?;
                    disk_live.insert(id);
                }
            }
            (BlockState::Open, None) => {
                warn!("freeing unreferenced open block {id}");
                container.release(id)?;
            }
            (BlockState::Free, _) => unreachable!("free blocks are not reported live"),
        }
    }

    for id in rows.keys() {
        if !disk_live.contains(id) {
            debug!("dropping stale catalog row for block {id}");
            catalog.delete_block_on_reclaim(*id)?;
        }
    }

    // Re-derive stream links and sequence floors from the surviving rows.
    for name in catalog.stream_names()? {
        let blocks = catalog.stream_blocks(&name)?;
        let stream = catalog
            .stream(&name)?
            .ok_or_else(|| Error::NotFound(format!("stream {name}")))?;
        match (blocks.first(), blocks.last()) {
            (Some(first), Some(last)) => {
                catalog.set_stream_links(&name, Some(first.block_id), Some(last.block_id))?;
                if last.sequence + 1 > stream.next_sequence {
                    catalog.set_next_sequence(&name, last.sequence + 1)?;
                }
            }
            _ => catalog.set_stream_links(&name, None, None)?,
        }
    }

    container.persist_free_head()?;
    container.sync()
}
