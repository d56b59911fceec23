// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The durable catalog, a small SQLite database beside the container
//! (`<container>.idx`).
//!
//! It answers the one question readers need before touching any block:
//! which blocks of this stream intersect `[lo, hi]`, in sequence order. One
//! row per allocated block; sealed rows are immutable, the open tail's row
//! is refreshed on every tail flush so live data is queryable.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use crate::format::BlockState;
use crate::{Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS blocks (
    block_id    INTEGER PRIMARY KEY,
    stream_name TEXT NOT NULL,
    stream_tag  INTEGER NOT NULL,
    sequence    INTEGER NOT NULL,
    start_ts    INTEGER NOT NULL,
    end_ts      INTEGER NOT NULL,
    state       INTEGER NOT NULL,
    frame_count INTEGER NOT NULL,
    bytes_used  INTEGER NOT NULL,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS blocks_by_stream_start ON blocks (stream_name, start_ts);
CREATE TABLE IF NOT EXISTS streams (
    stream_id     INTEGER PRIMARY KEY,
    stream_name   TEXT NOT NULL UNIQUE,
    metadata      TEXT,
    head_block    INTEGER,
    tail_block    INTEGER,
    next_sequence INTEGER NOT NULL DEFAULT 0
);
";

/// One catalog row, mirroring the owning block's header.
#[derive(Debug, Clone)]
pub(crate) struct BlockRow {
    pub block_id: u64,
    pub stream_name: String,
    pub stream_tag: u64,
    pub sequence: u64,
    pub start_ts: i64,
    pub end_ts: i64,
    pub state: BlockState,
    pub frame_count: u32,
    pub bytes_used: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct StreamRow {
    pub stream_id: i64,
    pub metadata: Option<String>,
    pub head_block: Option<u64>,
    pub tail_block: Option<u64>,
    pub next_sequence: u64,
}

/// A maximal run of sequence-consecutive blocks, as returned by
/// [`crate::Reader::query_contiguous_segments`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub segment_id: u64,
    pub start_ts: i64,
    pub end_ts: i64,
}

pub(crate) struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    /// Creates the catalog schema (used by `allocate_file` so that readers
    /// opened before the first write find a catalog).
    pub fn create(path: &Path) -> Result<()> {
        let conn = Connection::open(path)?;
        init(&conn)?;
        Ok(())
    }

    /// Opens the catalog for the writer, creating the schema if a legacy
    /// container lacks the sidecar.
    pub fn open_rw(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an existing catalog for queries. A missing catalog is fatal:
    /// without it no block can be located.
    pub fn open_shared(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "catalog {} does not exist",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Resolves a stream row, creating it on first use. Metadata is
    /// recorded at creation and immutable afterwards.
    pub fn upsert_stream(&self, name: &str, metadata: Option<&str>) -> Result<StreamRow> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO streams (stream_name, metadata) VALUES (?1, ?2)
             ON CONFLICT(stream_name) DO NOTHING",
            params![name, metadata],
        )?;
        drop(conn);
        self.stream(name)?
            .ok_or_else(|| Error::other(format!("stream {name} vanished during upsert")))
    }

    pub fn stream(&self, name: &str) -> Result<Option<StreamRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT stream_id, metadata, head_block, tail_block, next_sequence
                 FROM streams WHERE stream_name = ?1",
                params![name],
                |row| {
                    Ok(StreamRow {
                        stream_id: row.get(0)?,
                        metadata: row.get(1)?,
                        head_block: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
                        tail_block: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
                        next_sequence: row.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn set_stream_links(
        &self,
        name: &str,
        head_block: Option<u64>,
        tail_block: Option<u64>,
    ) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE streams SET head_block = ?2, tail_block = ?3 WHERE stream_name = ?1",
            params![name, head_block.map(|v| v as i64), tail_block.map(|v| v as i64)],
        )?;
        Ok(())
    }

    pub fn set_next_sequence(&self, name: &str, next_sequence: u64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE streams SET next_sequence = ?2 WHERE stream_name = ?1",
            params![name, next_sequence as i64],
        )?;
        Ok(())
    }

    /// Inserts (or re-inserts) the open tail's row.
    pub fn insert_open_block(&self, row: &BlockRow) -> Result<()> {
        self.put_block(row)
    }

    /// Refreshes the open tail's row after a tail flush, widening the
    /// visible time range.
    pub fn refresh_open_block(
        &self,
        block_id: u64,
        end_ts: i64,
        frame_count: u32,
        bytes_used: u32,
    ) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE blocks SET end_ts = ?2, frame_count = ?3, bytes_used = ?4
             WHERE block_id = ?1",
            params![block_id as i64, end_ts, frame_count, bytes_used],
        )?;
        Ok(())
    }

    /// Commits the final, immutable row of a sealed block. Runs after the
    /// block's bytes hit the disk; recovery frees any sealed block whose
    /// row never made it.
    pub fn upsert_block_on_seal(&self, row: &BlockRow) -> Result<()> {
        self.put_block(row)
    }

    fn put_block(&self, row: &BlockRow) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO blocks
             (block_id, stream_name, stream_tag, sequence, start_ts, end_ts,
              state, frame_count, bytes_used, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                row.block_id as i64,
                row.stream_name,
                row.stream_tag as i64,
                row.sequence as i64,
                row.start_ts,
                row.end_ts,
                row.state as u32,
                row.frame_count,
                row.bytes_used,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_block_on_reclaim(&self, block_id: u64) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM blocks WHERE block_id = ?1",
            params![block_id as i64],
        )?;
        Ok(())
    }

    /// Blocks of `stream` whose `[start_ts, end_ts]` intersects `[lo, hi]`,
    /// in sequence order.
    pub fn range_scan(&self, stream: &str, lo: i64, hi: i64) -> Result<Vec<BlockRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT block_id, stream_name, stream_tag, sequence, start_ts, end_ts,
                    state, frame_count, bytes_used
             FROM blocks
             WHERE stream_name = ?1 AND end_ts >= ?2 AND start_ts <= ?3
             ORDER BY sequence",
        )?;
        let rows = stmt
            .query_map(params![stream, lo, hi], block_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Names of all streams with data intersecting `[lo, hi]`. An open
    /// tail still grows forward, so it counts whenever its `start_ts` is
    /// at or before `hi`, even if no frame has reached `lo` yet.
    pub fn list_stream_tags(&self, lo: i64, hi: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT stream_name FROM blocks
             WHERE (end_ts >= ?1 OR state = ?3) AND start_ts <= ?2
             ORDER BY stream_name",
        )?;
        let names = stmt
            .query_map(params![lo, hi, BlockState::Open as u32], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Groups the matching blocks of `stream` into runs of consecutive
    /// sequences; each run becomes one segment spanning the run's time
    /// range.
    pub fn contiguous_segments(&self, stream: &str, lo: i64, hi: i64) -> Result<Vec<Segment>> {
        let rows = self.range_scan(stream, lo, hi)?;
        let mut segments: Vec<Segment> = Vec::new();
        let mut last_sequence = 0u64;
        for row in rows {
            match segments.last_mut() {
                Some(segment) if row.sequence == last_sequence + 1 => {
                    segment.end_ts = segment.end_ts.max(row.end_ts);
                }
                _ => segments.push(Segment {
                    segment_id: segments.len() as u64,
                    start_ts: row.start_ts,
                    end_ts: row.end_ts,
                }),
            }
            last_sequence = row.sequence;
        }
        Ok(segments)
    }

    /// The reclaim victim: the sealed block with the smallest
    /// `(stream_name, sequence)` in the whole container.
    pub fn oldest_sealed_block(&self) -> Result<Option<BlockRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT block_id, stream_name, stream_tag, sequence, start_ts, end_ts,
                        state, frame_count, bytes_used
                 FROM blocks WHERE state = ?1
                 ORDER BY stream_name, sequence LIMIT 1",
                params![BlockState::Sealed as u32],
                block_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// The stream's next block past `after_sequence`, skipping any
    /// sequence gaps left by reclaim or session boundaries.
    pub fn next_stream_block(&self, stream: &str, after_sequence: u64) -> Result<Option<BlockRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT block_id, stream_name, stream_tag, sequence, start_ts, end_ts,
                        state, frame_count, bytes_used
                 FROM blocks WHERE stream_name = ?1 AND sequence > ?2
                 ORDER BY sequence LIMIT 1",
                params![stream, after_sequence as i64],
                block_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All blocks of a stream, in sequence order.
    pub fn stream_blocks(&self, stream: &str) -> Result<Vec<BlockRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT block_id, stream_name, stream_tag, sequence, start_ts, end_ts,
                    state, frame_count, bytes_used
             FROM blocks WHERE stream_name = ?1 ORDER BY sequence",
        )?;
        let rows = stmt
            .query_map(params![stream], block_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Every block row in the catalog (recovery pass).
    pub fn all_blocks(&self) -> Result<Vec<BlockRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT block_id, stream_name, stream_tag, sequence, start_ts, end_ts,
                    state, frame_count, bytes_used
             FROM blocks ORDER BY block_id",
        )?;
        let rows = stmt
            .query_map([], block_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn stream_names(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT stream_name FROM streams ORDER BY stream_name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Timestamp of the newest frame recorded for this stream, across
    /// sealed blocks and the open tail row.
    pub fn last_end_ts(&self, stream: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let ts = conn.query_row(
            "SELECT MAX(end_ts) FROM blocks WHERE stream_name = ?1",
            params![stream],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(ts)
    }
}

fn init(conn: &Connection) -> Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    // WAL keeps catalog readers from blocking the writer's seal commits.
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

fn block_from_row(row: &Row<'_>) -> rusqlite::Result<BlockRow> {
    let state_raw: i64 = row.get(6)?;
    let state = BlockState::from_u32(state_raw as u32).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Integer,
            format!("invalid block state {state_raw}").into(),
        )
    })?;
    Ok(BlockRow {
        block_id: row.get::<_, i64>(0)? as u64,
        stream_name: row.get(1)?,
        stream_tag: row.get::<_, i64>(2)? as u64,
        sequence: row.get::<_, i64>(3)? as u64,
        start_ts: row.get(4)?,
        end_ts: row.get(5)?,
        state,
        frame_count: row.get(7)?,
        bytes_used: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.idx");
        Catalog::create(&path).unwrap();
        (dir, Catalog::open_rw(&path).unwrap())
    }

    fn sealed_row(block_id: u64, stream: &str, sequence: u64, start_ts: i64, end_ts: i64) -> BlockRow {
        BlockRow {
            block_id,
            stream_name: stream.to_string(),
            stream_tag: 1,
            sequence,
            start_ts,
            end_ts,
            state: BlockState::Sealed,
            frame_count: 10,
            bytes_used: 4096,
        }
    }

    #[test]
    fn range_scan_intersects_and_orders_by_sequence() {
        let (_dir, catalog) = catalog();
        catalog.upsert_block_on_seal(&sealed_row(3, "s", 0, 0, 99)).unwrap();
        catalog.upsert_block_on_seal(&sealed_row(1, "s", 1, 100, 199)).unwrap();
        catalog.upsert_block_on_seal(&sealed_row(2, "s", 2, 200, 299)).unwrap();
        catalog.upsert_block_on_seal(&sealed_row(4, "other", 0, 0, 500)).unwrap();

        let hits = catalog.range_scan("s", 150, 250).unwrap();
        let ids: Vec<u64> = hits.iter().map(|r| r.block_id).collect();
        assert_eq!(ids, vec![1, 2]);

        // boundary touch counts as intersection
        let hits = catalog.range_scan("s", 99, 99).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].block_id, 3);

        assert!(catalog.range_scan("s", 300, 400).unwrap().is_empty());
    }

    #[test]
    fn stream_tags_are_distinct_and_sorted() {
        let (_dir, catalog) = catalog();
        catalog.upsert_block_on_seal(&sealed_row(0, "b", 0, 0, 10)).unwrap();
        catalog.upsert_block_on_seal(&sealed_row(1, "a", 0, 5, 15)).unwrap();
        catalog.upsert_block_on_seal(&sealed_row(2, "a", 1, 16, 20)).unwrap();
        assert_eq!(catalog.list_stream_tags(0, 100).unwrap(), vec!["a", "b"]);
        assert_eq!(catalog.list_stream_tags(50, 100).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn live_tails_count_toward_future_ranges() {
        let (_dir, catalog) = catalog();
        let mut open = sealed_row(0, "live", 0, 100, 110);
        open.state = BlockState::Open;
        catalog.insert_open_block(&open).unwrap();

        // the tail grows forward, so a range past its current end still
        // names the stream; a range entirely before its start does not
        assert_eq!(catalog.list_stream_tags(200, 300).unwrap(), vec!["live"]);
        assert!(catalog.list_stream_tags(0, 50).unwrap().is_empty());
    }

    #[test]
    fn segments_split_on_sequence_gaps() {
        let (_dir, catalog) = catalog();
        catalog.upsert_block_on_seal(&sealed_row(0, "s", 0, 0, 10)).unwrap();
        catalog.upsert_block_on_seal(&sealed_row(1, "s", 1, 11, 20)).unwrap();
        // sequence 2 reclaimed
        catalog.upsert_block_on_seal(&sealed_row(3, "s", 3, 50, 60)).unwrap();

        let segments = catalog.contiguous_segments("s", 0, 100).unwrap();
        assert_eq!(
            segments,
            vec![
                Segment {
                    segment_id: 0,
                    start_ts: 0,
                    end_ts: 20
                },
                Segment {
                    segment_id: 1,
                    start_ts: 50,
                    end_ts: 60
                },
            ]
        );
    }

    #[test]
    fn oldest_sealed_is_global_stream_then_sequence_minimum() {
        let (_dir, catalog) = catalog();
        catalog.upsert_block_on_seal(&sealed_row(0, "zebra", 0, 0, 10)).unwrap();
        catalog.upsert_block_on_seal(&sealed_row(1, "ant", 5, 500, 510)).unwrap();
        catalog.upsert_block_on_seal(&sealed_row(2, "ant", 6, 511, 520)).unwrap();

        let victim = catalog.oldest_sealed_block().unwrap().unwrap();
        assert_eq!(victim.block_id, 1);
        assert_eq!(victim.stream_name, "ant");
        assert_eq!(victim.sequence, 5);
    }

    #[test]
    fn open_row_refresh_widens_the_visible_range() {
        let (_dir, catalog) = catalog();
        let mut row = sealed_row(0, "s", 0, 100, 100);
        row.state = BlockState::Open;
        row.frame_count = 0;
        catalog.insert_open_block(&row).unwrap();

        assert!(catalog.range_scan("s", 150, 300).unwrap().is_empty());
        catalog.refresh_open_block(0, 200, 12, 640).unwrap();
        let hits = catalog.range_scan("s", 150, 300).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].frame_count, 12);
        assert_eq!(hits[0].state, BlockState::Open);
    }

    #[test]
    fn stream_rows_track_links_and_sequence() {
        let (_dir, catalog) = catalog();
        let created = catalog.upsert_stream("s", Some("meta")).unwrap();
        assert_eq!(created.next_sequence, 0);
        assert!(created.head_block.is_none());

        // a second upsert keeps the original metadata
        let again = catalog.upsert_stream("s", Some("changed")).unwrap();
        assert_eq!(again.stream_id, created.stream_id);
        assert_eq!(again.metadata.as_deref(), Some("meta"));

        catalog.set_stream_links("s", Some(4), Some(9)).unwrap();
        catalog.set_next_sequence("s", 3).unwrap();
        let row = catalog.stream("s").unwrap().unwrap();
        assert_eq!(row.head_block, Some(4));
        assert_eq!(row.tail_block, Some(9));
        assert_eq!(row.next_sequence, 3);
    }
}
