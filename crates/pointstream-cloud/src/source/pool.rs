use super::{DataSource, NullDataSource, OpenMode, SourceFactory};
use crate::Status;

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Opens fresh sources over one URL.
#[derive(Clone)]
pub struct SourceOpener {
    url: String,
    mode: OpenMode,
    factory: SourceFactory,
}

impl SourceOpener {
    pub fn new(url: &str, mode: OpenMode, factory: SourceFactory) -> Self {
        Self {
            url: url.to_owned(),
            mode,
            factory,
        }
    }

    pub fn from_fn(
        url: &str,
        mode: OpenMode,
        factory: impl Fn() -> Box<dyn DataSource> + Send + Sync + 'static,
    ) -> Self {
        Self::new(url, mode, Arc::new(factory))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn open(&self) -> Result<Box<dyn DataSource>, Status> {
        let mut source = (self.factory)();
        source.open(&self.url, self.mode)?;
        log::debug!("Opened {:?} data source at {}", source.form(), self.url);
        Ok(source)
    }
}

/// Hands out one open source per concurrent reader.
///
/// A source carries a cursor, so two readers can never share one. Checked out sources return to the pool when dropped,
/// up to `max_idle`; the pool opens another whenever none is idle.
pub struct SourcePool {
    opener: SourceOpener,
    idle: Mutex<Vec<Box<dyn DataSource>>>,
    max_idle: usize,
}

impl SourcePool {
    pub fn new(opener: SourceOpener, max_idle: usize) -> Self {
        Self {
            opener,
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Adds an already open source, such as the one the container index was read through.
    pub fn with_source(self, source: Box<dyn DataSource>) -> Self {
        self.idle.lock().push(source);
        self
    }

    pub fn url(&self) -> &str {
        self.opener.url()
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn checkout(&self) -> Result<PooledSource<'_>, Status> {
        let reused = self.idle.lock().pop();
        let source = match reused {
            Some(source) => source,
            None => self.opener.open()?,
        };
        Ok(PooledSource {
            pool: self,
            source,
            keep: true,
        })
    }

    fn check_in(&self, mut source: Box<dyn DataSource>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(source);
        } else {
            drop(idle);
            source.close();
        }
    }
}

/// A source checked out of a [`SourcePool`]. Goes back to the pool on drop unless [`discard`](Self::discard)ed.
pub struct PooledSource<'a> {
    pool: &'a SourcePool,
    source: Box<dyn DataSource>,
    keep: bool,
}

impl PooledSource<'_> {
    /// Closes the source instead of returning it, e.g. after an I/O error left its connection in doubt.
    pub fn discard(mut self) {
        self.keep = false;
    }
}

impl Deref for PooledSource<'_> {
    type Target = dyn DataSource;

    fn deref(&self) -> &Self::Target {
        &*self.source
    }
}

impl DerefMut for PooledSource<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.source
    }
}

impl Drop for PooledSource<'_> {
    fn drop(&mut self) {
        let mut source = std::mem::replace(&mut self.source, Box::new(NullDataSource::default()));
        if self.keep {
            self.pool.check_in(source);
        } else {
            source.close();
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
