use crate::Status;

use sled::{IVec, Tree};

/// Persists blocks fetched by a [`CloudDataSource`](super::CloudDataSource) so later sessions can skip the remote read.
///
/// Keys are the object name, a zero byte, and the big-endian block index.
#[derive(Clone)]
pub struct BlockCache {
    tree: Tree,
}

impl BlockCache {
    pub fn open(db: &sled::Db, cache_name: &str) -> Result<Self, Status> {
        let tree = db.open_tree(format!("{}-blocks", cache_name))?;
        Ok(Self { tree })
    }

    fn key(object: &str, block: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(object.len() + 9);
        key.extend_from_slice(object.as_bytes());
        key.push(0);
        key.extend_from_slice(&block.to_be_bytes());
        key
    }

    pub fn get(&self, object: &str, block: u64) -> Result<Option<IVec>, Status> {
        Ok(self.tree.get(Self::key(object, block))?)
    }

    pub fn insert(&self, object: &str, block: u64, bytes: &[u8]) -> Result<(), Status> {
        self.tree.insert(Self::key(object, block), bytes)?;
        Ok(())
    }

    /// Forgets every block of `object`, e.g. after it was rewritten.
    pub fn invalidate(&self, object: &str) -> Result<usize, Status> {
        let mut prefix = object.as_bytes().to_vec();
        prefix.push(0);
        let mut removed = 0;
        for entry in self.tree.scan_prefix(prefix) {
            let (key, _) = entry?;
            self.tree.remove(key)?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
