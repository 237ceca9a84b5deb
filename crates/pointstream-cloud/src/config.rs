use crate::codec::{CodecKind, OctreeCompressor};
use crate::{Status, VoxelKey};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct CacheConfig {
    /// Resident payload bytes above which the cache starts reclaiming.
    pub ceiling_bytes: u64,
    /// Reclamation stops once resident bytes are at or below `ceiling_bytes * low_water_ratio`.
    pub low_water_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ceiling_bytes: 256 << 20,
            low_water_ratio: 1.0,
        }
    }
}

impl CacheConfig {
    pub fn low_water_bytes(&self) -> u64 {
        (self.ceiling_bytes as f64 * self.low_water_ratio) as u64
    }

    pub fn validate(&self) -> Result<(), Status> {
        if self.ceiling_bytes == 0 {
            return Err(Status::Config("cache ceiling must be positive".into()));
        }
        if !(self.low_water_ratio > 0.0 && self.low_water_ratio <= 1.0) {
            return Err(Status::Config(format!(
                "low water ratio {} is not in (0, 1]",
                self.low_water_ratio
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SchedulerConfig {
    pub worker_threads: usize,
    /// The maximum number of fetches reading or decoding at once.
    pub max_in_flight: usize,
    /// Attempts per (voxel, LOD) before an I/O failure is surfaced to the density policy.
    pub max_fetch_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_in_flight: 64,
            max_fetch_attempts: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), Status> {
        if self.worker_threads == 0 || self.max_in_flight == 0 || self.max_fetch_attempts == 0 {
            return Err(Status::Config(
                "worker threads, in-flight limit and fetch attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CodecConfig {
    pub kind: CodecKind,
    pub quantization_bits: u8,
    pub octree_leaf_threshold: u32,
    pub octree_max_depth: u8,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            kind: CodecKind::Octree,
            quantization_bits: 16,
            octree_leaf_threshold: 8,
            octree_max_depth: 16,
        }
    }
}

impl CodecConfig {
    pub fn octree_compressor(&self) -> OctreeCompressor {
        OctreeCompressor {
            leaf_threshold: self.octree_leaf_threshold,
            max_depth: self.octree_max_depth,
        }
    }
}

/// Controls how [`ContainerBuilder`](crate::ContainerBuilder) partitions a point set.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BuildConfig {
    pub num_lods: u8,
    /// A voxel holding more points than this is split into octants.
    pub leaf_capacity: usize,
    pub max_depth: u8,
    pub codec: CodecConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            num_lods: 8,
            leaf_capacity: 4096,
            max_depth: 10,
            codec: CodecConfig::default(),
        }
    }
}

impl BuildConfig {
    pub fn validate(&self) -> Result<(), Status> {
        if self.num_lods == 0 || self.num_lods > 32 {
            return Err(Status::Config(format!(
                "{} LODs is outside 1..=32",
                self.num_lods
            )));
        }
        if self.leaf_capacity == 0 {
            return Err(Status::Config("leaf capacity must be positive".into()));
        }
        if self.max_depth > VoxelKey::MAX_DEPTH {
            return Err(Status::Config(format!(
                "max depth {} exceeds {}",
                self.max_depth,
                VoxelKey::MAX_DEPTH
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CloudConfig {
    /// Remote reads are aligned to blocks of this many bytes.
    pub block_size: u64,
    /// Attempts per block before a transient failure becomes an I/O error.
    pub max_attempts: u32,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            block_size: 64 << 10,
            max_attempts: 4,
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
