//! A streaming engine for point clouds too large to hold in memory.
//!
//! An [`Engine`] opens a point cloud container through any registered data source, and serves any number of clients. Each
//! client queries an area with its own [`DensityPolicy`](pointstream_cloud::DensityPolicy); the engine records what the
//! client needs, fetches missing levels of detail in the background, and keeps resident memory bounded.
//!
//! The data model lives in [`pointstream_cloud`], re-exported as [`cloud`].

mod config;
mod engine;

pub use config::Config;
pub use engine::*;

pub use pointstream_cloud as cloud;
