use pointstream_core::geometry::Aabb;
use pointstream_core::glam::DVec3;

use std::cmp::Ordering;
use std::fmt;

/// The persistent identity of one octree cell: its depth and integer coordinates at that depth.
///
/// Unlike a [`NodeId`](crate::NodeId), a key is stable across processes, which is what the container index is addressed by.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq, rkyv::Archive, rkyv::Deserialize, rkyv::Serialize)]
#[archive_attr(derive(bytecheck::CheckBytes, Debug))]
pub struct VoxelKey {
    pub depth: u8,
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl VoxelKey {
    /// Morton codes pack 21 bits per axis into a `u64`.
    pub const MAX_DEPTH: u8 = 21;

    pub const ROOT: Self = Self {
        depth: 0,
        x: 0,
        y: 0,
        z: 0,
    };

    pub const fn new(depth: u8, x: u32, y: u32, z: u32) -> Self {
        Self { depth, x, y, z }
    }

    /// Key of child `octant` (bit 0 = x, bit 1 = y, bit 2 = z).
    pub fn child(&self, octant: u8) -> Self {
        Self {
            depth: self.depth + 1,
            x: (self.x << 1) | (octant & 1) as u32,
            y: (self.y << 1) | ((octant >> 1) & 1) as u32,
            z: (self.z << 1) | ((octant >> 2) & 1) as u32,
        }
    }

    pub fn parent(&self) -> Option<Self> {
        (self.depth > 0).then(|| Self {
            depth: self.depth - 1,
            x: self.x >> 1,
            y: self.y >> 1,
            z: self.z >> 1,
        })
    }

    /// Which octant of its parent this key occupies.
    pub fn octant(&self) -> u8 {
        (self.x & 1) as u8 | ((self.y & 1) as u8) << 1 | ((self.z & 1) as u8) << 2
    }

    pub fn morton(&self) -> u64 {
        morton_encode(self.x, self.y, self.z)
    }

    /// The world-space bounds of this cell inside a cubic `root` box.
    pub fn bounds_in(&self, root: &Aabb) -> Aabb {
        let cells = (1u64 << self.depth) as f64;
        let cell_size = root.size() / cells;
        let min = root.min + cell_size * DVec3::new(self.x as f64, self.y as f64, self.z as f64);
        Aabb::from_min_and_size(min, cell_size)
    }
}

/// Interleaves the low 21 bits of each coordinate, x in the lowest bit.
pub fn morton_encode(x: u32, y: u32, z: u32) -> u64 {
    spread_bits(x) | spread_bits(y) << 1 | spread_bits(z) << 2
}

/// Spreads the low 21 bits of `v` so there are two zero bits between each.
fn spread_bits(v: u32) -> u64 {
    let mut x = (v as u64) & 0x1f_ffff;
    x = (x | x << 32) & 0x001f_0000_0000_ffff;
    x = (x | x << 16) & 0x001f_0000_ff00_00ff;
    x = (x | x << 8) & 0x100f_00f0_0f00_f00f;
    x = (x | x << 4) & 0x10c3_0c30_c30c_30c3;
    x = (x | x << 2) & 0x1249_2492_4924_9249;
    x
}

impl Ord for VoxelKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.depth, self.morton()).cmp(&(other.depth, other.morton()))
    }
}

impl PartialOrd for VoxelKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for VoxelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.depth, self.x, self.y, self.z)
    }
}

impl From<&ArchivedVoxelKey> for VoxelKey {
    fn from(archived: &ArchivedVoxelKey) -> Self {
        Self::new(archived.depth, archived.x, archived.y, archived.z)
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
