//! The pointstream data model: a point cloud partitioned into an octree of voxels, streamed on demand at the level of detail
//! each client needs.
//!
//! # Voxels
//!
//! A [`VoxelTree`] holds one [`VoxelNode`] per octree cell. Nodes are addressed by process-local [`NodeId`] handles; the
//! persisted [`Container`] addresses the same cells by [`VoxelKey`]. Only leaf voxels carry points, and each leaf stores one
//! independently decodable blob per [`Lod`].
//!
//! # Streaming
//!
//! Clients record what they need in the [`QueryStateRegistry`], as chosen by a [`DensityPolicy`]. The [`StreamScheduler`]
//! fetches missing levels through a [`DataSource`](source::DataSource) on a worker pool and hands decoded [`Payload`]s to the
//! [`EvictionCache`], which keeps resident memory under its ceiling without dropping anything a client still needs.

pub mod codec;
pub mod config;
pub mod container;
pub mod source;

mod cache;
mod density;
mod key;
mod lod;
mod octree;
mod payload;
mod query_state;
mod scheduler;
mod status;

pub use cache::*;
pub use container::{Container, ContainerBuilder, ContainerSummary, PointSet};
pub use density::*;
pub use key::*;
pub use lod::*;
pub use octree::*;
pub use payload::*;
pub use query_state::*;
pub use scheduler::*;
pub use source::{CloudDataSource, DataSource, FileDataSource, NullDataSource, SourcePool, SourceRegistry};
pub use status::*;

pub use pointstream_core as core;

/// Handle to a node in a [`VoxelTree`].
pub type NodeId = pointstream_core::arena::ArenaId;
