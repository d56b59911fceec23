// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The container file and its free-block allocator.
//!
//! One writer per container, any number of readers. Writers serialize on an
//! exclusive advisory lock over the `<container>.lock` sidecar; readers hold
//! a shared lock on the container file itself, so they coexist with the
//! writer and with each other.
//!
//! The authoritative free set is rebuilt on writer open by scanning every
//! block header (blocks are self-describing). `FileHeader::free_head` is
//! persisted as a hint only, refreshed on flush and close.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use human_repr::HumanCount;
use log::{debug, info};
use positioned_io::{ReadAt, WriteAt};

use crate::format::{
    BlockHeader, FileHeader, BLOCK_HEADER_SIZE, FILE_HEADER_SIZE, MIN_BLOCK_SIZE, NO_BLOCK,
};
use crate::{Error, Result};

/// Appends `suffix` to the full file name, e.g. `db.nanots` →
/// `db.nanots.idx`.
pub(crate) fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Creates a new, zeroed container at `path`. Fails if the file exists or
/// the geometry is unusable.
pub(crate) fn allocate(path: &Path, block_size: u64, block_count: u64) -> Result<()> {
    if block_size < MIN_BLOCK_SIZE {
        return Err(Error::other(format!(
            "block size {block_size} is below the minimum of {MIN_BLOCK_SIZE}"
        )));
    }
    if block_count == 0 {
        return Err(Error::other("container needs at least one block"));
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    let total = FILE_HEADER_SIZE + block_size * block_count;
    file.set_len(total)?;

    let header = FileHeader {
        block_size,
        block_count,
        free_head: 0,
    };
    file.write_all_at(0, &header.encode())?;
    file.sync_all()?;

    info!(
        "allocated container {} ({} blocks of {}, {} total)",
        path.display(),
        block_count,
        block_size.human_count_bytes(),
        total.human_count_bytes(),
    );
    Ok(())
}

/// An open container file. Writers get the allocator; readers only load
/// blocks.
pub(crate) struct Container {
    file: File,
    header: FileHeader,
    /// Free block ids, lowest first. Empty for read-only handles.
    free: BTreeSet<u64>,
    /// Held for the lifetime of a writer; dropping releases the advisory
    /// lock.
    _write_lock: Option<File>,
}

impl Container {
    pub fn open_rw(path: &Path) -> Result<Self> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(sidecar_path(path, ".lock"))?;
        lock_file.try_lock_exclusive().map_err(|e| {
            Error::other(format!(
                "container {} is locked by another writer: {e}",
                path.display()
            ))
        })?;

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let header = read_file_header(&file)?;
        Ok(Self {
            file,
            header,
            free: BTreeSet::new(),
            _write_lock: Some(lock_file),
        })
    }

    pub fn open_ro(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        file.lock_shared()?;
        let header = read_file_header(&file)?;
        Ok(Self {
            file,
            header,
            free: BTreeSet::new(),
            _write_lock: None,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.header.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.header.block_count
    }

    fn block_offset(&self, id: u64) -> Result<u64> {
        if id >= self.header.block_count {
            return Err(Error::corrupt(id, "block id out of range"));
        }
        Ok(FILE_HEADER_SIZE + id * self.header.block_size)
    }

    pub fn read_block(&self, id: u64) -> Result<Vec<u8>> {
        let offset = self.block_offset(id)?;
        let mut buf = vec![0u8; self.header.block_size as usize];
        self.file.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn read_header_bytes(&self, id: u64) -> Result<[u8; BLOCK_HEADER_SIZE as usize]> {
        let offset = self.block_offset(id)?;
        let mut buf = [0u8; BLOCK_HEADER_SIZE as usize];
        self.file.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Publishes a block image: frame and directory bytes first, the header
    /// that announces them last. A concurrent reader therefore never sees a
    /// frame count covering unwritten bytes.
    pub fn publish_block(&mut self, id: u64, image: &[u8]) -> Result<()> {
        let offset = self.block_offset(id)?;
        debug_assert_eq!(image.len() as u64, self.header.block_size);
        self.file
            .write_all_at(offset + BLOCK_HEADER_SIZE, &image[BLOCK_HEADER_SIZE as usize..])?;
        self.file.write_all_at(offset, &image[..BLOCK_HEADER_SIZE as usize])?;
        Ok(())
    }

    /// Rewrites just the 128-byte header of a block (chain relinking).
    pub fn write_header_bytes(&mut self, id: u64, header: &[u8]) -> Result<()> {
        let offset = self.block_offset(id)?;
        debug_assert_eq!(header.len() as u64, BLOCK_HEADER_SIZE);
        self.file.write_all_at(offset, header)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Scans every block header, rebuilding the free set and returning the
    /// live (open or sealed) headers for recovery.
    pub fn rebuild_free_set(&mut self) -> Result<Vec<(u64, BlockHeader)>> {
        self.free.clear();
        let mut live = Vec::new();
        for id in 0..self.header.block_count {
            let buf = self.read_header_bytes(id)?;
            if BlockHeader::is_live(&buf) {
                live.push((id, BlockHeader::decode(&buf, id)?));
            } else {
                self.free.insert(id);
            }
        }
        debug!(
            "container scan: {} live blocks, {} free",
            live.len(),
            self.free.len()
        );
        Ok(live)
    }

    /// Lowest free block id, if any. Deterministic reuse keeps containers
    /// compact and testable.
    pub fn alloc_lowest(&mut self) -> Option<u64> {
        self.free.pop_first()
    }

    pub fn free_block_count(&self) -> usize {
        self.free.len()
    }

    /// Releases a block: zeroes its on-disk header (magic and state) and
    /// returns the id to the free set. Payload bytes are left in place.
    pub fn release(&mut self, id: u64) -> Result<()> {
        let zeroed = [0u8; BLOCK_HEADER_SIZE as usize];
        self.write_header_bytes(id, &zeroed)?;
        self.free.insert(id);
        Ok(())
    }

    /// Persists the free-list hint in the file header.
    pub fn persist_free_head(&mut self) -> Result<()> {
        self.header.free_head = self.free.first().copied().unwrap_or(NO_BLOCK);
        let encoded = self.header.encode();
        self.file.write_all_at(0, &encoded)?;
        Ok(())
    }
}

fn read_file_header(file: &File) -> Result<FileHeader> {
    let mut buf = [0u8; FILE_HEADER_SIZE as usize];
    file.read_exact_at(0, &mut buf)?;
    FileHeader::decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BlockState;

    fn scratch(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn allocate_sizes_and_zeroes_the_file() {
        let (_dir, path) = scratch("t.nanots");
        allocate(&path, 512, 8).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, FILE_HEADER_SIZE + 512 * 8);

        let mut container = Container::open_rw(&path).unwrap();
        let live = container.rebuild_free_set().unwrap();
        assert!(live.is_empty());
        assert_eq!(container.free_block_count(), 8);
    }

    #[test]
    fn allocate_refuses_existing_file_and_bad_geometry() {
        let (_dir, path) = scratch("t.nanots");
        allocate(&path, 512, 8).unwrap();
        assert!(allocate(&path, 512, 8).is_err());

        let (_dir2, path2) = scratch("small.nanots");
        assert!(allocate(&path2, MIN_BLOCK_SIZE - 1, 8).is_err());
        assert!(allocate(&path2, 512, 0).is_err());
    }

    #[test]
    fn second_writer_is_locked_out() {
        let (_dir, path) = scratch("t.nanots");
        allocate(&path, 512, 8).unwrap();
        let first = Container::open_rw(&path).unwrap();
        assert!(Container::open_rw(&path).is_err());
        drop(first);
        Container::open_rw(&path).unwrap();
    }

    #[test]
    fn readers_coexist_with_a_writer() {
        let (_dir, path) = scratch("t.nanots");
        allocate(&path, 512, 8).unwrap();
        let _writer = Container::open_rw(&path).unwrap();
        let _reader_a = Container::open_ro(&path).unwrap();
        let _reader_b = Container::open_ro(&path).unwrap();
    }

    #[test]
    fn allocation_is_lowest_id_first_and_release_returns_it() {
        let (_dir, path) = scratch("t.nanots");
        allocate(&path, 512, 4).unwrap();
        let mut container = Container::open_rw(&path).unwrap();
        container.rebuild_free_set().unwrap();

        assert_eq!(container.alloc_lowest(), Some(0));
        assert_eq!(container.alloc_lowest(), Some(1));
        container.release(0).unwrap();
        assert_eq!(container.alloc_lowest(), Some(0));
        assert_eq!(container.alloc_lowest(), Some(2));
        assert_eq!(container.alloc_lowest(), Some(3));
        assert_eq!(container.alloc_lowest(), None);
    }

    #[test]
    fn published_blocks_survive_a_rescan() {
        let (_dir, path) = scratch("t.nanots");
        allocate(&path, 512, 4).unwrap();
        let mut container = Container::open_rw(&path).unwrap();
        container.rebuild_free_set().unwrap();
        let id = container.alloc_lowest().unwrap();

        let mut block = crate::block::BlockBuf::new_open(id, 512, 0, 7, 100, NO_BLOCK);
        block.append(100, 0, b"hello").unwrap();
        block.seal();
        container.publish_block(id, block.bytes()).unwrap();

        let live = container.rebuild_free_set().unwrap();
        assert_eq!(live.len(), 1);
        let (live_id, header) = &live[0];
        assert_eq!(*live_id, id);
        assert_eq!(header.state, BlockState::Sealed);
        assert_eq!(header.stream_tag, 7);
        assert_eq!(container.free_block_count(), 3);
    }
}
