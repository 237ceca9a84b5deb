use crate::codec::CodecKind;
use crate::{Lod, Status, VoxelKey};

use pointstream_core::geometry::Aabb;
use pointstream_core::glam::DVec3;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::ser::Serializer;
use rkyv::{AlignedVec, Archive, Deserialize, Infallible, Serialize};
use std::io;

/// Where one encoded blob lives in the container.
#[derive(Archive, Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[archive_attr(derive(bytecheck::CheckBytes, Debug))]
pub struct BlobRange {
    pub offset: u64,
    pub len: u32,
}

impl BlobRange {
    /// One past the last byte, or `None` if a damaged index put the range past `u64::MAX`.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(u64::from(self.len))
    }
}

#[derive(Archive, Clone, Debug, Deserialize, PartialEq, Serialize)]
#[archive_attr(derive(bytecheck::CheckBytes, Debug))]
pub struct VoxelRecord {
    pub key: VoxelKey,
    /// Points in this voxel and all of its descendants.
    pub point_count: u64,
    /// Bit `i` is set when octant `i` has a record.
    pub child_mask: u8,
    /// One blob per LOD, coarsest first. Only leaf voxels hold points.
    pub blobs: Vec<BlobRange>,
}

impl VoxelRecord {
    pub fn is_leaf(&self) -> bool {
        !self.blobs.is_empty()
    }

    pub fn has_child(&self, octant: u8) -> bool {
        self.child_mask & (1 << octant) != 0
    }

    pub fn blob(&self, lod: Lod) -> Option<BlobRange> {
        self.blobs.get(lod.0 as usize).copied()
    }
}

#[derive(Archive, Clone, Debug, Deserialize, PartialEq, Serialize)]
#[archive_attr(derive(bytecheck::CheckBytes, Debug))]
pub struct ContainerIndex {
    pub bounds_min: [f64; 3],
    pub bounds_max: [f64; 3],
    pub num_lods: u8,
    pub quantization_bits: u8,
    /// [`CodecKind`] the blobs were written with, for diagnostics only. Blobs describe themselves.
    pub codec_tag: u8,
    pub total_points: u64,
    /// Sorted by key.
    pub voxels: Vec<VoxelRecord>,
}

impl ContainerIndex {
    pub fn bounds(&self) -> Aabb {
        Aabb::new(DVec3::from(self.bounds_min), DVec3::from(self.bounds_max))
    }

    pub fn codec_kind(&self) -> Option<CodecKind> {
        match self.codec_tag {
            0 => Some(CodecKind::Delta),
            1 => Some(CodecKind::Octree),
            _ => None,
        }
    }

    pub fn codec_tag_of(kind: CodecKind) -> u8 {
        match kind {
            CodecKind::Delta => 0,
            CodecKind::Octree => 1,
        }
    }

    pub fn serialize(&self) -> Result<AlignedVec, Status> {
        let mut serializer = AllocSerializer::<4096>::default();
        serializer
            .serialize_value(self)
            .map_err(|e| Status::io(io::ErrorKind::Other, format!("{:?}", e)))?;
        Ok(serializer.into_serializer().into_inner())
    }

    /// Validates `bytes` as an archived index before deserializing it.
    pub fn deserialize_checked(bytes: &[u8]) -> Result<Self, Status> {
        let mut aligned = AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        let archived = rkyv::check_archived_root::<Self>(&aligned)
            .map_err(|e| Status::corrupt(format!("invalid container index: {:?}", e)))?;
        Ok(archived
            .deserialize(&mut Infallible)
            .unwrap_or_else(|never| match never {}))
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
