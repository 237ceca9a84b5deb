use super::quantize::QPoint;
use super::varint::{write_varint, ByteReader};
use crate::Status;

/// Recursively partitions quantized points by octant.
///
/// Interior cells store eight child point counts. Once a cell holds fewer than `leaf_threshold` points (or `max_depth` is
/// reached, or the cell is one unit wide) its points are written as offsets from the cell origin, which need only
/// `size_log2` bits per axis.
///
/// Encoding reorders points. [`OctreeCompressor::compress`] returns the permutation so that other channels can follow it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OctreeCompressor {
    pub leaf_threshold: u32,
    pub max_depth: u8,
}

impl OctreeCompressor {
    /// Encodes `points`, all of which must lie in the cube at `origin` with side `2^size_log2`.
    ///
    /// Returns the index of every input point in encoded order.
    pub fn compress(
        &self,
        points: &[QPoint],
        size_log2: u8,
        origin: QPoint,
        depth: u8,
        out: &mut Vec<u8>,
    ) -> Vec<u32> {
        let mut indices: Vec<u32> = (0..points.len() as u32).collect();
        let mut order = Vec::with_capacity(points.len());
        self.encode_cell(points, &mut indices, origin, size_log2, depth, out, &mut order);
        order
    }

    fn is_leaf(&self, count: usize, size_log2: u8, depth: u8) -> bool {
        count < self.leaf_threshold as usize || depth >= self.max_depth || size_log2 == 0
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_cell(
        &self,
        points: &[QPoint],
        indices: &mut [u32],
        origin: QPoint,
        size_log2: u8,
        depth: u8,
        out: &mut Vec<u8>,
        order: &mut Vec<u32>,
    ) {
        if indices.is_empty() {
            return;
        }
        if self.is_leaf(indices.len(), size_log2, depth) {
            for &i in indices.iter() {
                let p = points[i as usize];
                for axis in 0..3 {
                    write_varint(out, (p[axis] - origin[axis]) as u64);
                }
                order.push(i);
            }
            return;
        }

        let half = size_log2 - 1;
        indices.sort_by_key(|&i| octant_of(points[i as usize], origin, half));
        let mut counts = [0usize; 8];
        for &i in indices.iter() {
            counts[octant_of(points[i as usize], origin, half) as usize] += 1;
        }
        for &c in &counts {
            write_varint(out, c as u64);
        }

        let mut start = 0;
        for (octant, &count) in counts.iter().enumerate() {
            let child_origin = child_origin(origin, octant as u8, half);
            self.encode_cell(
                points,
                &mut indices[start..start + count],
                child_origin,
                half,
                depth + 1,
                out,
                order,
            );
            start += count;
        }
    }

    /// The exact inverse of [`compress`](Self::compress): yields the points in encoded order.
    pub fn decompress(
        &self,
        reader: &mut ByteReader,
        count: usize,
        size_log2: u8,
        origin: QPoint,
        depth: u8,
    ) -> Result<Vec<QPoint>, Status> {
        let mut points = Vec::with_capacity(count);
        self.decode_cell(reader, count, origin, size_log2, depth, &mut points)?;
        Ok(points)
    }

    fn decode_cell(
        &self,
        reader: &mut ByteReader,
        count: usize,
        origin: QPoint,
        size_log2: u8,
        depth: u8,
        points: &mut Vec<QPoint>,
    ) -> Result<(), Status> {
        if count == 0 {
            return Ok(());
        }
        if self.is_leaf(count, size_log2, depth) {
            let side = 1u64 << size_log2;
            for _ in 0..count {
                let mut q = [0u32; 3];
                for axis in 0..3 {
                    let offset = reader.varint()?;
                    if offset >= side {
                        return Err(Status::corrupt("octree leaf offset outside its cell"));
                    }
                    q[axis] = origin[axis] + offset as u32;
                }
                points.push(q);
            }
            return Ok(());
        }

        let mut counts = [0usize; 8];
        let mut total = 0u64;
        for c in counts.iter_mut() {
            let v = reader.varint()?;
            total = total.saturating_add(v);
            *c = v as usize;
        }
        if total != count as u64 {
            return Err(Status::corrupt(format!(
                "octree cell claims {} points but its children hold {}",
                count, total
            )));
        }

        let half = size_log2 - 1;
        for (octant, &c) in counts.iter().enumerate() {
            let child_origin = child_origin(origin, octant as u8, half);
            self.decode_cell(reader, c, child_origin, half, depth + 1, points)?;
        }
        Ok(())
    }
}

fn octant_of(p: QPoint, origin: QPoint, half: u8) -> u8 {
    let bit = |axis: usize| (((p[axis] - origin[axis]) >> half) & 1) as u8;
    bit(0) | bit(1) << 1 | bit(2) << 2
}

fn child_origin(origin: QPoint, octant: u8, half: u8) -> QPoint {
    let offset = |axis: u8| ((octant >> axis) & 1) as u32 * (1u32 << half);
    [
        origin[0] + offset(0),
        origin[1] + offset(1),
        origin[2] + offset(2),
    ]
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
