use super::{split_url, BlockCache, DataSource, OpenMode, SourceForm};
use crate::config::CloudConfig;
use crate::Status;

use parking_lot::RwLock;
use pointstream_core::SmallKeyHashMap;
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A remote blob store.
pub trait ObjectStore: Send + Sync {
    fn object_size(&self, name: &str) -> Result<u64, Status>;

    /// Returns up to `range.end - range.start` bytes starting at `range.start`. A shorter (or empty) response is partial, not
    /// an error.
    fn get_range(&self, name: &str, range: Range<u64>) -> Result<Vec<u8>, Status>;

    fn put(&self, name: &str, bytes: Vec<u8>) -> Result<(), Status>;
}

/// An in-process [`ObjectStore`] that can simulate partial responses and transient failures.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<SmallKeyHashMap<String, Arc<Vec<u8>>>>,
    /// `0` means unlimited.
    max_response_bytes: AtomicUsize,
    transient_failures: AtomicU32,
    range_requests: AtomicU64,
}

impl MemoryObjectStore {
    pub fn insert(&self, name: &str, bytes: Vec<u8>) {
        self.objects.write().insert(name.to_owned(), Arc::new(bytes));
    }

    pub fn remove(&self, name: &str) -> bool {
        self.objects.write().remove(name).is_some()
    }

    pub fn set_max_response_bytes(&self, max: usize) {
        self.max_response_bytes.store(max, Ordering::Relaxed);
    }

    /// Makes the next `count` range requests fail with a timeout.
    pub fn fail_next(&self, count: u32) {
        self.transient_failures.store(count, Ordering::Relaxed);
    }

    pub fn range_requests(&self) -> u64 {
        self.range_requests.load(Ordering::Relaxed)
    }

    fn object(&self, name: &str) -> Result<Arc<Vec<u8>>, Status> {
        self.objects
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Status::io(io::ErrorKind::NotFound, format!("no object {:?}", name)))
    }
}

impl ObjectStore for MemoryObjectStore {
    fn object_size(&self, name: &str) -> Result<u64, Status> {
        Ok(self.object(name)?.len() as u64)
    }

    fn get_range(&self, name: &str, range: Range<u64>) -> Result<Vec<u8>, Status> {
        self.range_requests.fetch_add(1, Ordering::Relaxed);
        let inject = self
            .transient_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if inject {
            return Err(Status::io(io::ErrorKind::TimedOut, "simulated timeout"));
        }

        let object = self.object(name)?;
        let len = object.len() as u64;
        let start = range.start.min(len) as usize;
        let mut end = range.end.min(len) as usize;
        let max = self.max_response_bytes.load(Ordering::Relaxed);
        if max > 0 {
            end = end.min(start + max);
        }
        Ok(object[start..end].to_vec())
    }

    fn put(&self, name: &str, bytes: Vec<u8>) -> Result<(), Status> {
        self.insert(name, bytes);
        Ok(())
    }
}

/// A [`DataSource`] over one object of an [`ObjectStore`], addressed as `cloud://<object>`.
///
/// Reads go through a one-block buffer. A block is assembled from as many partial responses as the store hands back, and
/// transient failures are retried up to [`CloudConfig::max_attempts`] times per block. Objects opened with
/// [`OpenMode::Create`] are written append-only and uploaded on [`close`](DataSource::close).
pub struct CloudDataSource {
    store: Arc<dyn ObjectStore>,
    config: CloudConfig,
    block_cache: Option<BlockCache>,

    object: Option<String>,
    mode: OpenMode,
    size: u64,
    position: u64,
    block: Option<(u64, Vec<u8>)>,
    upload: Vec<u8>,
}

impl CloudDataSource {
    pub fn new(store: Arc<dyn ObjectStore>, config: CloudConfig, block_cache: Option<BlockCache>) -> Self {
        Self {
            store,
            config,
            block_cache,
            object: None,
            mode: OpenMode::Read,
            size: 0,
            position: 0,
            block: None,
            upload: Vec::new(),
        }
    }

    fn object(&self) -> Result<&str, Status> {
        self.object.as_deref().ok_or(Status::NotOpen)
    }

    fn with_retries<T>(&self, what: &str, mut f: impl FnMut() -> Result<T, Status>) -> Result<T, Status> {
        let mut attempt = 1;
        loop {
            match f() {
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    log::debug!("Transient failure on {} (attempt {}): {}", what, attempt, e);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn fetch_block(&self, index: u64) -> Result<Vec<u8>, Status> {
        let name = self.object()?;
        let block_size = self.config.block_size.max(1);
        let start = index * block_size;
        let end = (start + block_size).min(self.size);
        let want = (end - start) as usize;

        if let Some(cache) = &self.block_cache {
            if let Some(bytes) = cache.get(name, index)? {
                if bytes.len() == want {
                    return Ok(bytes.to_vec());
                }
            }
        }

        let mut data = Vec::with_capacity(want);
        let mut stalls = 0;
        while data.len() < want {
            let from = start + data.len() as u64;
            let chunk = self.with_retries(name, || self.store.get_range(name, from..end))?;
            if chunk.is_empty() {
                stalls += 1;
                if stalls >= self.config.max_attempts {
                    return Err(Status::io(
                        io::ErrorKind::WouldBlock,
                        format!("no data yet for block {} of {:?}", index, name),
                    ));
                }
                log::debug!("Empty response for block {} of {:?}", index, name);
                continue;
            }
            let take = chunk.len().min(want - data.len());
            data.extend_from_slice(&chunk[..take]);
        }

        if let Some(cache) = &self.block_cache {
            if let Err(e) = cache.insert(name, index, &data) {
                log::warn!("Failed to persist block {} of {:?}: {}", index, name, e);
            }
        }
        Ok(data)
    }
}

impl DataSource for CloudDataSource {
    fn open(&mut self, url: &str, mode: OpenMode) -> Result<(), Status> {
        let (_, name) = split_url(url)?;
        self.close();
        self.size = match mode {
            OpenMode::Read => self.with_retries(name, || self.store.object_size(name))?,
            OpenMode::Create => 0,
            OpenMode::ReadWrite => {
                return Err(Status::Unsupported("cloud objects cannot be modified in place"))
            }
        };
        self.object = Some(name.to_owned());
        self.mode = mode;
        Ok(())
    }

    fn close(&mut self) {
        if let (Some(name), OpenMode::Create) = (self.object.take(), self.mode) {
            let bytes = std::mem::take(&mut self.upload);
            if let Err(e) = self.store.put(&name, bytes) {
                log::warn!("Upload of {:?} failed: {}", name, e);
            }
            if let Some(cache) = &self.block_cache {
                if let Err(e) = cache.invalidate(&name) {
                    log::warn!("Failed to invalidate cached blocks of {:?}: {}", name, e);
                }
            }
        }
        self.size = 0;
        self.position = 0;
        self.block = None;
    }

    fn is_open(&self) -> bool {
        self.object.is_some()
    }

    fn form(&self) -> SourceForm {
        SourceForm::Remote
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status> {
        self.object()?;
        if self.mode == OpenMode::Create {
            return Err(Status::Unsupported("cloud uploads are write-only until closed"));
        }
        if self.position >= self.size || buf.is_empty() {
            return Ok(0);
        }

        let block_size = self.config.block_size.max(1);
        let index = self.position / block_size;
        if !matches!(&self.block, Some((i, _)) if *i == index) {
            let data = self.fetch_block(index)?;
            self.block = Some((index, data));
        }
        let data = match &self.block {
            Some((_, data)) => data,
            None => return Ok(0),
        };

        let offset = (self.position - index * block_size) as usize;
        let n = buf.len().min(data.len().saturating_sub(offset));
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Status> {
        self.object()?;
        if self.mode != OpenMode::Create {
            return Err(Status::Unsupported("cloud object opened read-only"));
        }
        if self.position != self.upload.len() as u64 {
            return Err(Status::Unsupported("cloud uploads are append-only"));
        }
        self.upload.extend_from_slice(buf);
        self.position += buf.len() as u64;
        self.size = self.upload.len() as u64;
        Ok(buf.len())
    }

    fn move_to(&mut self, position: u64) -> Result<(), Status> {
        self.object()?;
        self.position = position;
        Ok(())
    }

    fn size(&self) -> Result<u64, Status> {
        self.object()?;
        Ok(self.size)
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
