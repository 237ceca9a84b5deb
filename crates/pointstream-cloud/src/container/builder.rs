use super::{BlobRange, ContainerHeader, ContainerIndex, VoxelRecord, HEADER_LEN, VERSION};
use crate::codec::{Codec, PointBlock, QPoint, Quantizer};
use crate::config::BuildConfig;
use crate::key::morton_encode;
use crate::{DataSource, Lod, Status, VoxelKey};

use pointstream_core::geometry::Aabb;
use pointstream_core::glam::DVec3;
use std::io;

/// Raw input points with optional per-point channels.
#[derive(Clone, Debug, Default)]
pub struct PointSet {
    pub positions: Vec<DVec3>,
    pub rgb: Option<Vec<[u8; 3]>>,
    pub intensity: Option<Vec<u16>>,
}

impl PointSet {
    pub fn new(positions: Vec<DVec3>) -> Self {
        Self {
            positions,
            rgb: None,
            intensity: None,
        }
    }

    pub fn with_rgb(mut self, rgb: Vec<[u8; 3]>) -> Self {
        self.rgb = Some(rgb);
        self
    }

    pub fn with_intensity(mut self, intensity: Vec<u16>) -> Self {
        self.intensity = Some(intensity);
        self
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ContainerSummary {
    pub total_points: u64,
    pub voxels: usize,
    pub leaf_voxels: usize,
    pub bytes: u64,
}

/// Writes a [`PointSet`] as a container.
///
/// The point set is split into octants until a voxel holds at most `leaf_capacity` points or reaches `max_depth`. Each leaf's
/// points are put in LOD order (Morton order, then visited in bit-reversed index order), so every prefix is a spatially
/// uniform subsample and LOD `l` is simply the first [`Lod::point_count`] points.
pub struct ContainerBuilder {
    config: BuildConfig,
    codec: Codec,
}

impl ContainerBuilder {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            codec: Codec::new(config.codec),
        }
    }

    pub fn build(&self, points: &PointSet) -> Result<(Vec<u8>, ContainerSummary), Status> {
        self.config.validate()?;
        let n = points.len();
        if points.rgb.as_ref().map_or(false, |c| c.len() != n)
            || points.intensity.as_ref().map_or(false, |c| c.len() != n)
        {
            return Err(Status::Config(
                "point channels must have one entry per point".into(),
            ));
        }
        let bounds = root_bounds(&points.positions)
            .ok_or_else(|| Status::Config("cannot build a container from no points".into()))?;

        let mut out = vec![0; HEADER_LEN as usize];
        let mut voxels = Vec::new();
        let all = (0..n).collect();
        self.build_voxel(points, &bounds, VoxelKey::ROOT, all, &mut out, &mut voxels)?;
        voxels.sort_by_key(|r| r.key);

        let summary = ContainerSummary {
            total_points: n as u64,
            voxels: voxels.len(),
            leaf_voxels: voxels.iter().filter(|r| r.is_leaf()).count(),
            bytes: 0,
        };
        let index = ContainerIndex {
            bounds_min: bounds.min.to_array(),
            bounds_max: bounds.max.to_array(),
            num_lods: self.config.num_lods,
            quantization_bits: self.config.codec.quantization_bits,
            codec_tag: ContainerIndex::codec_tag_of(self.config.codec.kind),
            total_points: n as u64,
            voxels,
        };
        let index_bytes = index.serialize()?;
        let header = ContainerHeader {
            version: VERSION,
            index_offset: out.len() as u64,
            index_len: index_bytes.len() as u64,
        };
        out.extend_from_slice(&index_bytes);
        out[..HEADER_LEN as usize].copy_from_slice(&header.to_bytes());

        log::info!(
            "Built container: {} points in {} voxels ({} leaves), {} bytes",
            summary.total_points,
            summary.voxels,
            summary.leaf_voxels,
            out.len()
        );
        let bytes = out.len() as u64;
        Ok((out, ContainerSummary { bytes, ..summary }))
    }

    /// Builds the container and writes it from the start of `sink`.
    pub fn write(&self, points: &PointSet, sink: &mut dyn DataSource) -> Result<ContainerSummary, Status> {
        let (bytes, summary) = self.build(points)?;
        sink.move_to(0)?;
        let mut written = 0;
        while written < bytes.len() {
            let n = sink.write(&bytes[written..])?;
            if n == 0 {
                return Err(Status::io(
                    io::ErrorKind::WriteZero,
                    format!("sink accepted {} of {} bytes", written, bytes.len()),
                ));
            }
            written += n;
        }
        Ok(summary)
    }

    fn build_voxel(
        &self,
        points: &PointSet,
        root_bounds: &Aabb,
        key: VoxelKey,
        indices: Vec<usize>,
        out: &mut Vec<u8>,
        voxels: &mut Vec<VoxelRecord>,
    ) -> Result<(), Status> {
        let bounds = key.bounds_in(root_bounds);
        let point_count = indices.len() as u64;

        if indices.len() <= self.config.leaf_capacity || key.depth >= self.config.max_depth {
            let blobs = self.encode_leaf(points, &bounds, &indices, out)?;
            voxels.push(VoxelRecord {
                key,
                point_count,
                child_mask: 0,
                blobs,
            });
            return Ok(());
        }

        let mut octants: [Vec<usize>; 8] = Default::default();
        for i in indices {
            octants[bounds.octant_of(points.positions[i]) as usize].push(i);
        }
        let mut child_mask = 0;
        for (octant, child_indices) in octants.into_iter().enumerate() {
            if child_indices.is_empty() {
                continue;
            }
            child_mask |= 1 << octant;
            let child_key = key.child(octant as u8);
            self.build_voxel(points, root_bounds, child_key, child_indices, out, voxels)?;
        }
        voxels.push(VoxelRecord {
            key,
            point_count,
            child_mask,
            blobs: Vec::new(),
        });
        Ok(())
    }

    fn encode_leaf(
        &self,
        points: &PointSet,
        bounds: &Aabb,
        indices: &[usize],
        out: &mut Vec<u8>,
    ) -> Result<Vec<BlobRange>, Status> {
        let quantizer = Quantizer::new(bounds, self.config.codec.quantization_bits);
        let mut block = PointBlock::new(
            quantizer.bits(),
            indices
                .iter()
                .map(|&i| quantizer.quantize(points.positions[i]))
                .collect(),
        );
        block.rgb = points
            .rgb
            .as_ref()
            .map(|c| indices.iter().map(|&i| c[i]).collect());
        block.intensity = points
            .intensity
            .as_ref()
            .map(|c| indices.iter().map(|&i| c[i]).collect());

        let order = lod_order(&block.positions, quantizer.bits());
        let mut blobs = Vec::with_capacity(self.config.num_lods as usize);
        for lod in Lod::levels(self.config.num_lods) {
            let count = lod.point_count(indices.len() as u64, self.config.num_lods) as usize;
            let subset = block.select(order[..count].iter().copied());
            let bytes = self.codec.encode(&subset)?;
            let len = u32::try_from(bytes.len())
                .map_err(|_| Status::Config("a single blob cannot exceed 4 GiB".into()))?;
            blobs.push(BlobRange {
                offset: out.len() as u64,
                len,
            });
            out.extend_from_slice(&bytes);
        }
        Ok(blobs)
    }
}

fn root_bounds(positions: &[DVec3]) -> Option<Aabb> {
    let bounds = Aabb::bounding(positions.iter().copied())?;
    let edge = bounds.size().max_element();
    let edge = if edge > 0.0 { edge } else { 1.0 };
    Some(Aabb::from_min_and_size(bounds.min, DVec3::splat(edge)))
}

/// Orders points so that every prefix is spread evenly over the voxel.
fn lod_order(positions: &[QPoint], bits: u8) -> Vec<usize> {
    let n = positions.len();
    let shift = bits.saturating_sub(21);
    let mut by_morton: Vec<usize> = (0..n).collect();
    by_morton.sort_by_key(|&i| {
        let q = positions[i];
        (morton_encode(q[0] >> shift, q[1] >> shift, q[2] >> shift), i)
    });

    let span = n.next_power_of_two();
    let levels = span.trailing_zeros();
    let mut order = Vec::with_capacity(n);
    for k in 0..span {
        let r = if levels == 0 {
            0
        } else {
            k.reverse_bits() >> (usize::BITS - levels)
        };
        if r < n {
            order.push(by_morton[r]);
        }
    }
    order
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
