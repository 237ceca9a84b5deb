use crate::codec::{PointBlock, QPoint, Quantizer};
use crate::Lod;

use pointstream_core::glam::DVec3;

/// The decompressed points of one voxel at one resident LOD.
///
/// Payloads are shared as `Arc<Payload>`: the [`EvictionCache`](crate::EvictionCache) owns the accounting, and nodes and
/// renderers only hold references.
#[derive(Debug)]
pub struct Payload {
    lod: Lod,
    quantizer: Quantizer,
    points: PointBlock,
}

impl Payload {
    pub fn new(lod: Lod, quantizer: Quantizer, points: PointBlock) -> Self {
        Self {
            lod,
            quantizer,
            points,
        }
    }

    pub fn lod(&self) -> Lod {
        self.lod
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &PointBlock {
        &self.points
    }

    pub fn quantizer(&self) -> &Quantizer {
        &self.quantizer
    }

    pub fn quantized_positions(&self) -> &[QPoint] {
        &self.points.positions
    }

    pub fn positions(&self) -> impl Iterator<Item = DVec3> + '_ {
        self.points
            .positions
            .iter()
            .map(move |&q| self.quantizer.dequantize(q))
    }

    /// The same points at a coarser `lod`, or `None` if `lod` is not coarser.
    ///
    /// Every level is a prefix of the finer ones, so this only truncates.
    pub fn coarsened(&self, lod: Lod) -> Option<Self> {
        if lod >= self.lod {
            return None;
        }
        let halvings = u32::from(self.lod.0 - lod.0).min(63);
        let n = self.len() as u64;
        let keep = ((n + (1u64 << halvings) - 1) >> halvings).max(1).min(n) as usize;
        Some(Self::new(lod, self.quantizer, self.points.select(0..keep)))
    }

    /// The number of bytes this payload is charged against the cache ceiling.
    pub fn byte_size(&self) -> u64 {
        (std::mem::size_of::<Self>() + self.points.heap_bytes()) as u64
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

    use pointstream_core::geometry::Aabb;

    fn payload(lod: u8, points: u32) -> Payload {
        let bounds = Aabb::from_min_and_size(DVec3::ZERO, DVec3::ONE);
        let mut block = PointBlock::new(16, (0..points).map(|i| [i, 0, 0]).collect());
        block.intensity = Some((0..points).map(|i| i as u16).collect());
        Payload::new(Lod(lod), Quantizer::new(&bounds, 16), block)
    }

    #[test]
    fn coarsening_keeps_the_prefix_a_coarser_read_would_return() {
        let full = 1000;
        let fine = payload(3, full);

        for lod in 0..3 {
            let coarse = fine.coarsened(Lod(lod)).unwrap();
            let expected = Lod(lod).point_count(u64::from(full), 4) as usize;
            assert_eq!(coarse.lod(), Lod(lod));
            assert_eq!(coarse.len(), expected);
            assert_eq!(coarse.quantized_positions(), &fine.quantized_positions()[..expected]);
            assert_eq!(
                coarse.points().intensity.as_deref(),
                Some(&fine.points().intensity.as_ref().unwrap()[..expected])
            );
            assert!(coarse.byte_size() < fine.byte_size());
        }

        // Truncating a level that was itself truncated lands on the same count.
        let mid = fine.coarsened(Lod(2)).unwrap();
        assert_eq!(mid.coarsened(Lod(0)).unwrap().len(), fine.coarsened(Lod(0)).unwrap().len());
    }

    #[test]
    fn coarsening_to_the_same_or_finer_lod_is_refused() {
        let p = payload(2, 10);
        assert!(p.coarsened(Lod(2)).is_none());
        assert!(p.coarsened(Lod(3)).is_none());
        assert_eq!(payload(5, 3).coarsened(Lod(0)).unwrap().len(), 1);
    }
}
