// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory block images.
//!
//! The writer packs frames into a [`BlockBuf`] and publishes it to the
//! container in two steps (frame bytes first, header last) so that a
//! concurrent reader never observes a frame the header does not yet cover.
//! Readers work on plain byte buffers via the scan helpers below.

use crate::format::{
    BlockHeader, BlockState, FrameHeader, BLOCK_HEADER_SIZE, DIR_ENTRY_SIZE, FRAME_HEADER_SIZE,
};
use crate::{Error, Frame, Result};

/// Signal that a frame does not fit into the current tail block. Internal:
/// the writer reacts by rolling to a fresh block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockFull;

/// A mutable `block_size`-byte image of one open block.
pub(crate) struct BlockBuf {
    id: u64,
    header: BlockHeader,
    buf: Vec<u8>,
}

impl BlockBuf {
    pub fn new_open(
        id: u64,
        block_size: u64,
        sequence: u64,
        stream_tag: u64,
        first_ts: i64,
        prev_block: u64,
    ) -> Self {
        let header = BlockHeader::new_open(sequence, stream_tag, first_ts, prev_block, block_size);
        let mut buf = vec![0u8; block_size as usize];
        header.encode_into(&mut buf);
        Self { id, header, buf }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Appends one frame and its directory entry, or reports [`BlockFull`].
    ///
    /// Timestamp ordering is the writer's responsibility; the block only
    /// packs bytes. The directory stays sorted because appends arrive in
    /// non-decreasing timestamp order.
    pub fn append(
        &mut self,
        timestamp: i64,
        flags: u32,
        payload: &[u8],
    ) -> std::result::Result<(), BlockFull> {
        let needed = FRAME_HEADER_SIZE + payload.len() as u64;
        let used = self.header.bytes_used as u64;
        let dir_after = (self.header.frame_count as u64 + 1) * DIR_ENTRY_SIZE;
        if used + needed + dir_after > self.buf.len() as u64 {
            return Err(BlockFull);
        }

        let offset = self.header.bytes_used as usize;
        let frame_header = FrameHeader {
            timestamp,
            flags,
            len: payload.len() as u32,
        };
        frame_header
            .encode_into(&mut self.buf[offset..offset + FRAME_HEADER_SIZE as usize])
            .expect("frame header fits, capacity was checked");
        let body = offset + FRAME_HEADER_SIZE as usize;
        self.buf[body..body + payload.len()].copy_from_slice(payload);

        let dir_at = self.buf.len() - (self.header.frame_count as usize + 1) * DIR_ENTRY_SIZE as usize;
        self.buf[dir_at..dir_at + DIR_ENTRY_SIZE as usize]
            .copy_from_slice(&(offset as u32).to_le_bytes());

        if self.header.frame_count == 0 {
            self.header.first_ts = timestamp;
        }
        self.header.last_ts = timestamp;
        self.header.frame_count += 1;
        self.header.bytes_used = (offset as u64 + needed) as u32;
        self.header.dir_offset = dir_at as u32;
        self.header.encode_into(&mut self.buf);
        Ok(())
    }

    /// Marks the block sealed and re-encodes the header. The directory is
    /// already in `(timestamp, insertion order)` order, so no sorting pass
    /// is needed.
    pub fn seal(&mut self) {
        self.header.state = BlockState::Sealed;
        self.header.encode_into(&mut self.buf);
    }

    pub fn set_next_block(&mut self, next: u64) {
        self.header.next_block = next;
        self.header.encode_into(&mut self.buf);
    }
}

/// Location and prefix of one frame inside a block image.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameMeta {
    pub offset: u32,
    pub timestamp: i64,
    pub flags: u32,
    pub len: u32,
}

fn check_geometry(buf: &[u8], header: &BlockHeader, block_id: u64) -> Result<()> {
    let block_size = buf.len() as u64;
    let dir_bytes = header.frame_count as u64 * DIR_ENTRY_SIZE;
    let used = header.bytes_used as u64;
    if used < BLOCK_HEADER_SIZE
        || used > block_size
        || dir_bytes > block_size
        || header.dir_offset as u64 != block_size - dir_bytes
        || used > header.dir_offset as u64
    {
        return Err(Error::corrupt(
            block_id,
            format!(
                "inconsistent geometry: bytes_used={} dir_offset={} frame_count={}",
                header.bytes_used, header.dir_offset, header.frame_count
            ),
        ));
    }
    Ok(())
}

fn frame_meta_at_offset(buf: &[u8], header: &BlockHeader, offset: u32, block_id: u64) -> Result<FrameMeta> {
    let start = offset as u64;
    if start < BLOCK_HEADER_SIZE || start + FRAME_HEADER_SIZE > header.bytes_used as u64 {
        return Err(Error::corrupt(
            block_id,
            format!("frame offset {offset} out of bounds"),
        ));
    }
    let frame_header = FrameHeader::decode(&buf[offset as usize..])
        .map_err(|e| Error::corrupt(block_id, e.to_string()))?;
    if start + FRAME_HEADER_SIZE + frame_header.len as u64 > header.bytes_used as u64 {
        return Err(Error::corrupt(
            block_id,
            format!("frame at {offset} overruns bytes_used"),
        ));
    }
    Ok(FrameMeta {
        offset,
        timestamp: frame_header.timestamp,
        flags: frame_header.flags,
        len: frame_header.len,
    })
}

/// Walks the packed frames front to back, without touching the directory.
/// This is the only scan readers may use on an open block.
pub(crate) fn scan_frames(buf: &[u8], header: &BlockHeader, block_id: u64) -> Result<Vec<FrameMeta>> {
    check_geometry(buf, header, block_id)?;
    let mut frames = Vec::with_capacity(header.frame_count as usize);
    let mut offset = BLOCK_HEADER_SIZE as u32;
    for _ in 0..header.frame_count {
        let meta = frame_meta_at_offset(buf, header, offset, block_id)?;
        offset = (meta.offset as u64 + FRAME_HEADER_SIZE + meta.len as u64) as u32;
        frames.push(meta);
    }
    Ok(frames)
}

/// Reads directory entry `i` (frame `i`'s offset). Entry `i` lives at
/// `block_size − (i+1)·4`.
fn directory_entry(buf: &[u8], i: u32) -> u32 {
    let at = buf.len() - (i as usize + 1) * DIR_ENTRY_SIZE as usize;
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

/// Frame `i` of a sealed block, located through the directory.
pub(crate) fn frame_meta_at(buf: &[u8], header: &BlockHeader, i: u32, block_id: u64) -> Result<FrameMeta> {
    check_geometry(buf, header, block_id)?;
    frame_meta_at_offset(buf, header, directory_entry(buf, i), block_id)
}

/// Index of the first frame with `timestamp ≥ ts` in a sealed block, by
/// binary search over the directory. `None` if every frame is older.
pub(crate) fn find_first_at_or_after(
    buf: &[u8],
    header: &BlockHeader,
    ts: i64,
    block_id: u64,
) -> Result<Option<u32>> {
    check_geometry(buf, header, block_id)?;
    let mut lo = 0u32;
    let mut hi = header.frame_count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let meta = frame_meta_at_offset(buf, header, directory_entry(buf, mid), block_id)?;
        if meta.timestamp < ts {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok((lo < header.frame_count).then_some(lo))
}

/// Materializes a frame from its meta entry.
pub(crate) fn read_frame(buf: &[u8], meta: &FrameMeta, block_sequence: u64) -> Frame {
    let body = meta.offset as usize + FRAME_HEADER_SIZE as usize;
    Frame {
        timestamp: meta.timestamp,
        flags: meta.flags,
        payload: buf[body..body + meta.len as usize].to_vec(),
        block_sequence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{max_payload, NO_BLOCK};

    fn filled_block(block_size: u64, payload: &[u8]) -> (BlockBuf, usize) {
        let mut block = BlockBuf::new_open(0, block_size, 0, 1, 0, NO_BLOCK);
        let mut n = 0;
        while block.append(1000 + n as i64, 0, payload).is_ok() {
            n += 1;
        }
        (block, n)
    }

    #[test]
    fn append_until_full_then_scan() {
        let (block, n) = filled_block(4096, b"0123456789abcdef");
        assert!(n > 0);
        assert_eq!(block.header().frame_count as usize, n);

        let frames = scan_frames(block.bytes(), block.header(), 0).unwrap();
        assert_eq!(frames.len(), n);
        for (i, meta) in frames.iter().enumerate() {
            assert_eq!(meta.timestamp, 1000 + i as i64);
            assert_eq!(meta.len, 16);
        }
        assert_eq!(block.header().first_ts, 1000);
        assert_eq!(block.header().last_ts, 1000 + n as i64 - 1);
    }

    #[test]
    fn directory_matches_linear_scan() {
        let (mut block, n) = filled_block(4096, b"payload");
        block.seal();
        let buf = block.bytes();
        let header = BlockHeader::decode_verified(buf, 0).unwrap();
        let linear = scan_frames(buf, &header, 0).unwrap();
        for i in 0..n as u32 {
            let via_dir = frame_meta_at(buf, &header, i, 0).unwrap();
            assert_eq!(via_dir.offset, linear[i as usize].offset);
        }
    }

    #[test]
    fn binary_search_finds_first_at_or_after() {
        let mut block = BlockBuf::new_open(0, 4096, 0, 1, 0, NO_BLOCK);
        for i in 0..20 {
            block.append(1000 + i * 10, 0, b"x").unwrap();
        }
        block.seal();
        let buf = block.bytes();
        let header = block.header();

        // exact hit, between frames, before the block, past the end
        assert_eq!(find_first_at_or_after(buf, header, 1050, 0).unwrap(), Some(5));
        assert_eq!(find_first_at_or_after(buf, header, 1051, 0).unwrap(), Some(6));
        assert_eq!(find_first_at_or_after(buf, header, 0, 0).unwrap(), Some(0));
        assert_eq!(find_first_at_or_after(buf, header, 2000, 0).unwrap(), None);
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let mut block = BlockBuf::new_open(0, 4096, 0, 1, 0, NO_BLOCK);
        block.append(1000, 0, b"a").unwrap();
        block.append(1000, 0, b"b").unwrap();
        block.append(1000, 0, b"c").unwrap();
        block.seal();
        let first = find_first_at_or_after(block.bytes(), block.header(), 1000, 0)
            .unwrap()
            .unwrap();
        assert_eq!(first, 0);
        let meta = frame_meta_at(block.bytes(), block.header(), 0, 0).unwrap();
        assert_eq!(read_frame(block.bytes(), &meta, 0).payload, b"a");
    }

    #[test]
    fn empty_payload_round_trips() {
        let mut block = BlockBuf::new_open(0, 4096, 0, 1, 0, NO_BLOCK);
        block.append(5, 7, b"").unwrap();
        let frames = scan_frames(block.bytes(), block.header(), 0).unwrap();
        assert_eq!(frames.len(), 1);
        let frame = read_frame(block.bytes(), &frames[0], 0);
        assert!(frame.payload.is_empty());
        assert_eq!(frame.flags, 7);
    }

    #[test]
    fn max_payload_exactly_fits_empty_block() {
        let block_size = 1024u64;
        let mut block = BlockBuf::new_open(0, block_size, 0, 1, 0, NO_BLOCK);
        let payload = vec![0xAB; max_payload(block_size) as usize];
        block.append(1, 0, &payload).unwrap();
        assert!(matches!(block.append(2, 0, b""), Err(BlockFull)));
    }

    #[test]
    fn truncated_geometry_is_reported_corrupt() {
        let (mut block, _) = filled_block(1024, b"abc");
        block.seal();
        let mut header = *block.header();
        header.bytes_used = 64; // below the header size
        assert!(scan_frames(block.bytes(), &header, 3).is_err());
    }
}
