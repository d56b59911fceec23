// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! NanoTS is an embedded time-series storage engine for append-heavy,
//! timestamp-keyed record streams (telemetry, market data, sensor feeds).
//!
//! All data lives in one pre-allocated container file divided into
//! fixed-size blocks, with a small SQLite catalog beside it
//! (`<container>.idx`) mapping `(stream, time range)` to blocks. Appends
//! are strictly timestamp-ordered per stream; one writer and any number of
//! readers may work on the same container concurrently, across threads or
//! processes.
//!
//! ```no_run
//! use nanots::{allocate_file, Reader, Writer, WriterOptions};
//!
//! # fn main() -> nanots::Result<()> {
//! allocate_file("metrics.nanots", 4096, 1000)?;
//!
//! let mut writer = Writer::open("metrics.nanots", WriterOptions::default())?;
//! let mut ctx = writer.create_context("sensor_data", Some("temperature probe"))?;
//! writer.write(&mut ctx, b"temp:21.5", 1_700_000_000_000, 0)?;
//! writer.close_context(ctx)?;
//!
//! let reader = Reader::open("metrics.nanots")?;
//! let frames = reader.read("sensor_data", i64::MIN, i64::MAX)?;
//! assert_eq!(frames[0].payload, b"temp:21.5");
//! # Ok(())
//! # }
//! ```

mod block;
mod catalog;
mod container;
mod error;
mod format;
mod iter;
mod reader;
mod writer;

use std::path::Path;

pub use catalog::Segment;
pub use error::{Error, Result};
pub use format::{max_payload, Frame, FLAG_FLUSH_AFTER, MIN_BLOCK_SIZE};
pub use iter::StreamIterator;
pub use reader::{ReadOutcome, Reader};
pub use writer::{WriteContext, Writer, WriterOptions};

/// Creates a new, zeroed container of `block_count` blocks of `block_size`
/// bytes at `path`, together with its empty catalog sidecar. Fails if the
/// container already exists or the geometry is unusable.
pub fn allocate_file(path: impl AsRef<Path>, block_size: u64, block_count: u64) -> Result<()> {
    let path = path.as_ref();
    container::allocate(path, block_size, block_count)?;
    catalog::Catalog::create(&container::sidecar_path(path, ".idx"))
}
