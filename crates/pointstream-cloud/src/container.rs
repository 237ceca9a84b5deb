//! The persisted voxel container.
//!
//! ```text
//! +--------+---------------------------------+-------------------+
//! | header | LZ4-framed codec blobs          | rkyv voxel index  |
//! +--------+---------------------------------+-------------------+
//! ```
//!
//! The header is [`HEADER_LEN`] little-endian bytes: the `PTSV` magic, a `u16` version, a reserved `u16`, and the offset and
//! length of the index as `u64`s. Each leaf voxel has one independently decodable blob per LOD, so any `(voxel, LOD)` can be
//! read with a single ranged read.

mod builder;
mod index;

pub use builder::{ContainerBuilder, ContainerSummary, PointSet};
pub use index::{BlobRange, ContainerIndex, VoxelRecord};

use crate::codec::{Codec, Quantizer};
use crate::config::CodecConfig;
use crate::{DataSource, Lod, Payload, Status, VoxelKey};

use pointstream_core::geometry::Aabb;
use pointstream_core::SmallKeyHashMap;

pub const MAGIC: [u8; 4] = *b"PTSV";
pub const VERSION: u16 = 1;
pub const HEADER_LEN: u64 = 24;

/// Header fields that follow the magic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ContainerHeader {
    pub version: u16,
    pub index_offset: u64,
    pub index_len: u64,
}

impl ContainerHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN as usize] {
        let mut bytes = [0; HEADER_LEN as usize];
        bytes[0..4].copy_from_slice(&MAGIC);
        bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.index_offset.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.index_len.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HEADER_LEN as usize]) -> Result<Self, Status> {
        if bytes[0..4] != MAGIC {
            return Err(Status::corrupt("not a point container (bad magic)"));
        }
        let u64_at = |at: usize| {
            let mut b = [0; 8];
            b.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(Status::corrupt(format!(
                "unsupported container version {}",
                version
            )));
        }
        Ok(Self {
            version,
            index_offset: u64_at(8),
            index_len: u64_at(16),
        })
    }
}

/// An opened container: its validated index plus the means to fetch and decode blobs.
#[derive(Debug)]
pub struct Container {
    index: ContainerIndex,
    bounds: Aabb,
    records: SmallKeyHashMap<VoxelKey, usize>,
    codec: Codec,
}

impl Container {
    /// Reads and validates the header and index. Blobs are not touched.
    pub fn read(source: &mut dyn DataSource) -> Result<Self, Status> {
        let size = source.size()?;
        if size < HEADER_LEN {
            return Err(Status::corrupt(format!(
                "{} bytes is too short for a container header",
                size
            )));
        }
        let mut header_bytes = [0; HEADER_LEN as usize];
        source.read_exact_at(0, &mut header_bytes)?;
        let header = ContainerHeader::from_bytes(&header_bytes)?;
        let index_end = header.index_offset.checked_add(header.index_len);
        if header.index_offset < HEADER_LEN || index_end.map_or(true, |end| end > size) {
            return Err(Status::corrupt("container index lies outside the file"));
        }

        let mut index_bytes = vec![0; header.index_len as usize];
        source.read_exact_at(header.index_offset, &mut index_bytes)?;
        let index = ContainerIndex::deserialize_checked(&index_bytes)?;
        Self::from_index(index, header.index_offset)
    }

    fn from_index(index: ContainerIndex, blobs_end: u64) -> Result<Self, Status> {
        if index.num_lods == 0 {
            return Err(Status::corrupt("container has no LODs"));
        }
        let mut records = SmallKeyHashMap::default();
        for (i, record) in index.voxels.iter().enumerate() {
            if record.is_leaf() && record.blobs.len() != index.num_lods as usize {
                return Err(Status::corrupt(format!(
                    "voxel {:?} has {} blobs for {} LODs",
                    record.key,
                    record.blobs.len(),
                    index.num_lods
                )));
            }
            if record
                .blobs
                .iter()
                .any(|b| b.offset < HEADER_LEN || b.end().map_or(true, |end| end > blobs_end))
            {
                return Err(Status::corrupt(format!(
                    "voxel {:?} has a blob outside the blob section",
                    record.key
                )));
            }
            records.insert(record.key, i);
        }
        if !records.contains_key(&VoxelKey::ROOT) {
            return Err(Status::corrupt("container has no root voxel"));
        }

        let codec = Codec::new(CodecConfig {
            quantization_bits: index.quantization_bits,
            ..Default::default()
        });
        Ok(Self {
            bounds: index.bounds(),
            index,
            records,
            codec,
        })
    }

    pub fn index(&self) -> &ContainerIndex {
        &self.index
    }

    /// The cubic root bounds.
    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    pub fn num_lods(&self) -> u8 {
        self.index.num_lods
    }

    pub fn finest_lod(&self) -> Lod {
        Lod::finest(self.index.num_lods)
    }

    pub fn total_points(&self) -> u64 {
        self.index.total_points
    }

    pub fn record(&self, key: VoxelKey) -> Option<&VoxelRecord> {
        self.records.get(&key).map(|&i| &self.index.voxels[i])
    }

    pub fn blob_range(&self, key: VoxelKey, lod: Lod) -> Result<BlobRange, Status> {
        self.record(key)
            .and_then(|r| r.blob(lod))
            .ok_or(Status::MissingBlob { key, lod })
    }

    /// The number of points a payload for `(key, lod)` holds.
    pub fn point_count(&self, key: VoxelKey, lod: Lod) -> u64 {
        self.record(key)
            .map_or(0, |r| lod.point_count(r.point_count, self.index.num_lods))
    }

    pub fn quantizer(&self, key: VoxelKey) -> Quantizer {
        Quantizer::new(&key.bounds_in(&self.bounds), self.index.quantization_bits)
    }

    pub fn read_blob(&self, source: &mut dyn DataSource, key: VoxelKey, lod: Lod) -> Result<Vec<u8>, Status> {
        let range = self.blob_range(key, lod)?;
        let mut bytes = vec![0; range.len as usize];
        source.read_exact_at(range.offset, &mut bytes)?;
        Ok(bytes)
    }

    /// Decodes a blob read for `(key, lod)`, checking that it holds the expected number of points.
    pub fn decode_payload(&self, key: VoxelKey, lod: Lod, bytes: &[u8]) -> Result<Payload, Status> {
        let block = self.codec.decode(bytes)?;
        let expected = self.point_count(key, lod);
        if block.len() as u64 != expected {
            return Err(Status::corrupt(format!(
                "blob for {:?} at {:?} holds {} points, expected {}",
                key,
                lod,
                block.len(),
                expected
            )));
        }
        if block.bits != self.index.quantization_bits {
            return Err(Status::corrupt(format!(
                "blob for {:?} is quantized to {} bits, expected {}",
                key, block.bits, self.index.quantization_bits
            )));
        }
        Ok(Payload::new(lod, self.quantizer(key), block))
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
