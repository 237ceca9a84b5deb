//! Byte-stream data sources.
//!
//! Every backend presents the same cursor-style contract. Local backends block on the calling thread; remote backends may
//! return short or empty reads while data is still arriving, which callers treat as "no data yet" rather than as an error.
//! Sources are driven from scheduler worker threads, so every backend must be `Send`.

mod block_cache;
mod cloud;
mod file;
mod null;
mod pool;
mod registry;

pub use block_cache::BlockCache;
pub use cloud::{CloudDataSource, MemoryObjectStore, ObjectStore};
pub use file::FileDataSource;
pub use null::NullDataSource;
pub use pool::{PooledSource, SourceOpener, SourcePool};
pub use registry::{split_url, SourceFactory, SourceRegistry};

use crate::Status;

use std::io;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    Read,
    ReadWrite,
    /// Creates the target, truncating anything already there.
    Create,
}

impl OpenMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// Where a source's bytes physically live.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SourceForm {
    Local,
    Remote,
}

pub trait DataSource: Send {
    fn open(&mut self, url: &str, mode: OpenMode) -> Result<(), Status>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn form(&self) -> SourceForm;

    /// Reads up to `buf.len()` bytes at the cursor and advances it. `Ok(0)` means end of data for a local source, and possibly
    /// "nothing arrived yet" for a remote one.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status>;

    fn write(&mut self, buf: &[u8]) -> Result<usize, Status>;

    fn move_to(&mut self, position: u64) -> Result<(), Status>;

    fn size(&self) -> Result<u64, Status>;

    fn read_at(&mut self, position: u64, buf: &mut [u8]) -> Result<usize, Status> {
        self.move_to(position)?;
        self.read(buf)
    }

    /// Fills `buf` from `position`, accepting short reads along the way.
    ///
    /// A read that makes no progress ends the attempt with a retryable [`Status::Io`].
    fn read_exact_at(&mut self, position: u64, buf: &mut [u8]) -> Result<(), Status> {
        self.move_to(position)?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(match self.form() {
                    SourceForm::Remote => Status::io(
                        io::ErrorKind::WouldBlock,
                        format!("no data yet at byte {}", position + filled as u64),
                    ),
                    SourceForm::Local => Status::io(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "read {} of {} bytes at offset {}",
                            filled,
                            buf.len(),
                            position
                        ),
                    ),
                });
            }
            filled += n;
        }
        Ok(())
    }
}
