use super::quantize::QPoint;
use super::varint::{write_varint, zigzag, ByteReader};
use crate::Status;

/// Encodes each point as the signed difference from its predecessor, starting from the origin.
///
/// Points inside one voxel are spatially coherent, so most deltas fit in one or two varint bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeltaEncoder;

impl DeltaEncoder {
    pub fn compress(&self, points: &[QPoint], out: &mut Vec<u8>) {
        let mut prev = [0i64; 3];
        for p in points {
            for axis in 0..3 {
                let v = p[axis] as i64;
                write_varint(out, zigzag(v - prev[axis]));
                prev[axis] = v;
            }
        }
    }

    /// Reads `count` points, rejecting any coordinate outside `0..2^bits`.
    pub fn decompress(
        &self,
        reader: &mut ByteReader,
        count: usize,
        bits: u8,
    ) -> Result<Vec<QPoint>, Status> {
        let limit = 1i64 << bits;
        let mut points = Vec::with_capacity(count);
        let mut prev = [0i64; 3];
        for _ in 0..count {
            let mut q = [0u32; 3];
            for axis in 0..3 {
                let v = prev[axis]
                    .checked_add(reader.signed_varint()?)
                    .filter(|v| (0..limit).contains(v))
                    .ok_or_else(|| Status::corrupt("delta leaves quantization range"))?;
                prev[axis] = v;
                q[axis] = v as u32;
            }
            points.push(q);
        }
        Ok(points)
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn coherent_points_encode_small() {
        let points: Vec<QPoint> = (0..100u32).map(|i| [1000 + i, 2000 - i, 3000]).collect();
        let mut out = Vec::new();
        DeltaEncoder.compress(&points, &mut out);
        // The first point pays for its absolute position, every later one costs a byte per axis.
        assert!(out.len() < 6 + 99 * 3 + 3);

        let mut reader = ByteReader::new(&out);
        let decoded = DeltaEncoder.decompress(&mut reader, points.len(), 12).unwrap();
        reader.finish().unwrap();
        assert_eq!(decoded, points);
    }

    #[test]
    fn out_of_range_delta_is_corrupt() {
        let mut out = Vec::new();
        DeltaEncoder.compress(&[[300, 0, 0]], &mut out);
        let mut reader = ByteReader::new(&out);
        assert!(matches!(
            DeltaEncoder.decompress(&mut reader, 1, 8),
            Err(Status::CorruptPayload(_))
        ));
    }
}
