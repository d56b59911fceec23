// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! # Container layout
//!
//! A container is one pre-allocated file: a 64-byte [`FileHeader`] followed
//! by `block_count` fixed-size blocks. Geometry is frozen when the file is
//! allocated, so a block id maps to a file offset with one multiplication.
//!
//! ```text
//! │◄─64─►│◄────block_size────►│◄────block_size────►│ ...
//! ├──────┬────────────────────┬────────────────────┤
//! │header│      block 0       │      block 1       │ ...
//! └──────┴────────────────────┴────────────────────┘
//! ```
//!
//! # Block layout
//!
//! Frames grow forward from the 128-byte [`BlockHeader`]; the frame
//! directory grows backward from the end of the block. The directory entry
//! for frame `i` is a `u32` frame offset stored at `block_size − (i+1)·4`,
//! which gives sealed blocks O(log n) timestamp search.
//!
//! ```text
//! │◄─128─►│                                        block_size ►│
//! ├───────┬──────────────────────┬───────────┬─────────────────┤
//! │header │ frame 0 ∥ frame 1 …  │ free      │ … dir 1 ∥ dir 0 │
//! └───────┴──────────────────────┴───────────┴─────────────────┘
//!         frames grow ►                        ◄ directory grows
//! ```
//!
//! # Frame layout
//!
//! ```text
//! ├────i64────┬───u32───┬───u32───┬──────────────┤
//! │ timestamp │  flags  │ length  │ payload      │
//! └───────────┴─────────┴─────────┴──────────────┘
//! ```
//!
//! All integers are little-endian. Payloads are opaque bytes.

use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use xxhash_rust::xxh3::xxh3_64;

use crate::{Error, Result};

/// `"NANT"`
pub const FILE_MAGIC: u32 = 0x4E41_4E54;
pub const FILE_VERSION: u32 = 1;
pub const FILE_HEADER_SIZE: u64 = 64;

/// `"BLK1"`
pub const BLOCK_MAGIC: u32 = 0x424C_4B31;
pub const BLOCK_HEADER_SIZE: u64 = 128;
pub const FRAME_HEADER_SIZE: u64 = 16;
pub const DIR_ENTRY_SIZE: u64 = 4;

/// Sentinel for "no block" in `free_head` and the per-stream chain links.
pub const NO_BLOCK: u64 = u64::MAX;

/// Smallest permitted block size. Must leave room for one frame with a
/// non-empty payload next to the header and one directory entry.
pub const MIN_BLOCK_SIZE: u64 = 256;

/// Bit 0 of a frame's `flags`: flush the tail block after this write.
pub const FLAG_FLUSH_AFTER: u32 = 1;

const CHECKSUM_OFFSET: usize = (BLOCK_HEADER_SIZE - 8) as usize;

/// Largest payload a single frame can carry in a container with the given
/// block size: one frame plus its directory entry must fit next to the
/// block header.
pub fn max_payload(block_size: u64) -> u64 {
    block_size - BLOCK_HEADER_SIZE - FRAME_HEADER_SIZE - DIR_ENTRY_SIZE
}

/// Block lifecycle state, as stored in the block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockState {
    Free = 0,
    Open = 1,
    Sealed = 2,
}

impl BlockState {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Open),
            2 => Some(Self::Sealed),
            _ => None,
        }
    }
}

/// The fixed header at offset 0 of the container file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub block_size: u64,
    pub block_count: u64,
    /// Lowest free block id, or [`NO_BLOCK`]. A hint only: the writer
    /// rebuilds the authoritative free set from block headers on open.
    pub free_head: u64,
}

impl FileHeader {
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE as usize] {
        let mut buf = [0u8; FILE_HEADER_SIZE as usize];
        let mut w = Cursor::new(&mut buf[..]);
        w.write_u32::<LittleEndian>(FILE_MAGIC).unwrap();
        w.write_u32::<LittleEndian>(FILE_VERSION).unwrap();
        w.write_u64::<LittleEndian>(self.block_size).unwrap();
        w.write_u64::<LittleEndian>(self.block_count).unwrap();
        w.write_u64::<LittleEndian>(self.free_head).unwrap();
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_HEADER_SIZE as usize {
            return Err(Error::other("container file header is truncated"));
        }
        let mut r = Cursor::new(buf);
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != FILE_MAGIC {
            return Err(Error::other(format!(
                "bad container magic {magic:#010x}, not a nanots container"
            )));
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != FILE_VERSION {
            return Err(Error::other(format!(
                "unsupported container version {version}"
            )));
        }
        Ok(Self {
            block_size: r.read_u64::<LittleEndian>()?,
            block_count: r.read_u64::<LittleEndian>()?,
            free_head: r.read_u64::<LittleEndian>()?,
        })
    }
}

/// The fixed header at offset 0 of every allocated block. Self-describing:
/// recovery can reconstruct liveness and stream chains from headers alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub state: BlockState,
    /// Monotonic per-stream block ordinal.
    pub sequence: u64,
    /// Integer identity of the owning stream, copied into every block for
    /// quick filtering without a catalog round-trip.
    pub stream_tag: u64,
    pub first_ts: i64,
    pub last_ts: i64,
    pub prev_block: u64,
    pub next_block: u64,
    pub frame_count: u32,
    /// Offset of the free-space start within the block. Starts at
    /// [`BLOCK_HEADER_SIZE`]; frames are written at this offset.
    pub bytes_used: u32,
    /// Offset of the lowest directory entry, i.e. `block_size −
    /// frame_count·4`.
    pub dir_offset: u32,
}

impl BlockHeader {
    pub fn new_open(sequence: u64, stream_tag: u64, first_ts: i64, prev_block: u64, block_size: u64) -> Self {
        Self {
            state: BlockState::Open,
            sequence,
            stream_tag,
            first_ts,
            last_ts: first_ts,
            prev_block,
            next_block: NO_BLOCK,
            frame_count: 0,
            bytes_used: BLOCK_HEADER_SIZE as u32,
            dir_offset: block_size as u32,
        }
    }

    /// Serializes the header into `buf[..128]`, checksumming the first 120
    /// bytes into the final 8.
    pub fn encode_into(&self, buf: &mut [u8]) {
        let header = &mut buf[..BLOCK_HEADER_SIZE as usize];
        header.fill(0);
        let mut w = Cursor::new(&mut header[..]);
        w.write_u32::<LittleEndian>(BLOCK_MAGIC).unwrap();
        w.write_u32::<LittleEndian>(self.state as u32).unwrap();
        w.write_u64::<LittleEndian>(self.sequence).unwrap();
        w.write_u64::<LittleEndian>(self.stream_tag).unwrap();
        w.write_i64::<LittleEndian>(self.first_ts).unwrap();
        w.write_i64::<LittleEndian>(self.last_ts).unwrap();
        w.write_u64::<LittleEndian>(self.prev_block).unwrap();
        w.write_u64::<LittleEndian>(self.next_block).unwrap();
        w.write_u32::<LittleEndian>(self.frame_count).unwrap();
        w.write_u32::<LittleEndian>(self.bytes_used).unwrap();
        w.write_u32::<LittleEndian>(self.dir_offset).unwrap();
        let checksum = xxh3_64(&header[..CHECKSUM_OFFSET]);
        header[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Decodes a header, validating the magic but not the checksum. Used
    /// for open blocks, which a concurrent writer may be re-publishing.
    pub fn decode(buf: &[u8], block_id: u64) -> Result<Self> {
        if buf.len() < BLOCK_HEADER_SIZE as usize {
            return Err(Error::corrupt(block_id, "block header is truncated"));
        }
        let mut r = Cursor::new(buf);
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != BLOCK_MAGIC {
            return Err(Error::corrupt(
                block_id,
                format!("bad block magic {magic:#010x}"),
            ));
        }
        let state_raw = r.read_u32::<LittleEndian>()?;
        let state = BlockState::from_u32(state_raw)
            .ok_or_else(|| Error::corrupt(block_id, format!("bad block state {state_raw}")))?;
        Ok(Self {
            state,
            sequence: r.read_u64::<LittleEndian>()?,
            stream_tag: r.read_u64::<LittleEndian>()?,
            first_ts: r.read_i64::<LittleEndian>()?,
            last_ts: r.read_i64::<LittleEndian>()?,
            prev_block: r.read_u64::<LittleEndian>()?,
            next_block: r.read_u64::<LittleEndian>()?,
            frame_count: r.read_u32::<LittleEndian>()?,
            bytes_used: r.read_u32::<LittleEndian>()?,
            dir_offset: r.read_u32::<LittleEndian>()?,
        })
    }

    /// Decodes a header, validating magic and checksum. Required for sealed
    /// blocks before their directory is trusted.
    pub fn decode_verified(buf: &[u8], block_id: u64) -> Result<Self> {
        let header = Self::decode(buf, block_id)?;
        let stored = u64::from_le_bytes(
            buf[CHECKSUM_OFFSET..BLOCK_HEADER_SIZE as usize]
                .try_into()
                .expect("checksum slice is 8 bytes"),
        );
        let computed = xxh3_64(&buf[..CHECKSUM_OFFSET]);
        if stored != computed {
            return Err(Error::corrupt(
                block_id,
                format!("header checksum mismatch (stored {stored:#018x}, computed {computed:#018x})"),
            ));
        }
        Ok(header)
    }

    /// True if the raw header bytes describe a live (open or sealed) block.
    /// Zeroed or foreign bytes read as free.
    pub fn is_live(buf: &[u8]) -> bool {
        buf.len() >= 8
            && u32::from_le_bytes(buf[..4].try_into().unwrap()) == BLOCK_MAGIC
            && matches!(
                BlockState::from_u32(u32::from_le_bytes(buf[4..8].try_into().unwrap())),
                Some(BlockState::Open | BlockState::Sealed)
            )
    }
}

/// The fixed prefix of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub timestamp: i64,
    pub flags: u32,
    pub len: u32,
}

impl FrameHeader {
    pub fn encode_into(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_i64::<LittleEndian>(self.timestamp)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        w.write_u32::<LittleEndian>(self.len)?;
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> std::io::Result<Self> {
        let mut r = Cursor::new(buf);
        Ok(Self {
            timestamp: r.read_i64::<LittleEndian>()?,
            flags: r.read_u32::<LittleEndian>()?,
            len: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// One stored record, as returned by readers and iterators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub timestamp: i64,
    pub flags: u32,
    pub payload: Vec<u8>,
    /// Sequence of the block the frame was read from.
    pub block_sequence: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn file_header_round_trip() {
        let header = FileHeader {
            block_size: 4096,
            block_count: 1000,
            free_head: 17,
        };
        let decoded = FileHeader::decode(&header.encode()).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn file_header_rejects_foreign_magic() {
        let mut buf = FileHeader {
            block_size: 4096,
            block_count: 1,
            free_head: NO_BLOCK,
        }
        .encode();
        buf[0] ^= 0xFF;
        assert!(FileHeader::decode(&buf).is_err());
    }

    #[quickcheck]
    fn block_header_round_trip(
        sequence: u64,
        stream_tag: u64,
        first_ts: i64,
        last_ts: i64,
        frame_count: u32,
    ) -> bool {
        let header = BlockHeader {
            state: BlockState::Sealed,
            sequence,
            stream_tag,
            first_ts,
            last_ts,
            prev_block: NO_BLOCK,
            next_block: 3,
            frame_count,
            bytes_used: 4096,
            dir_offset: 8192,
        };
        let mut buf = vec![0u8; BLOCK_HEADER_SIZE as usize];
        header.encode_into(&mut buf);
        BlockHeader::decode_verified(&buf, 0).unwrap() == header
    }

    #[test]
    fn block_header_checksum_detects_corruption() {
        let header = BlockHeader::new_open(1, 2, 1000, NO_BLOCK, 4096);
        let mut buf = vec![0u8; BLOCK_HEADER_SIZE as usize];
        header.encode_into(&mut buf);
        buf[16] ^= 0x01; // flip a bit inside first_ts
        assert!(BlockHeader::decode(&buf, 9).is_ok());
        match BlockHeader::decode_verified(&buf, 9) {
            Err(Error::CorruptBlock { block_id: 9, .. }) => {}
            other => panic!("expected CorruptBlock, got {other:?}"),
        }
    }

    #[quickcheck]
    fn frame_header_round_trip(timestamp: i64, flags: u32, len: u32) -> bool {
        let header = FrameHeader {
            timestamp,
            flags,
            len,
        };
        let mut buf = Vec::new();
        header.encode_into(&mut buf).unwrap();
        buf.len() == FRAME_HEADER_SIZE as usize && FrameHeader::decode(&buf).unwrap() == header
    }

    #[test]
    fn zeroed_header_reads_as_free() {
        assert!(!BlockHeader::is_live(&[0u8; BLOCK_HEADER_SIZE as usize]));
        let mut buf = vec![0u8; BLOCK_HEADER_SIZE as usize];
        BlockHeader::new_open(0, 0, 0, NO_BLOCK, 4096).encode_into(&mut buf);
        assert!(BlockHeader::is_live(&buf));
    }
}
