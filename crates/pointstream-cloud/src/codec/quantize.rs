use pointstream_core::geometry::Aabb;
use pointstream_core::glam::DVec3;

/// A point quantized to unsigned fixed point inside its voxel's bounds.
pub type QPoint = [u32; 3];

/// Maps world positions to `bits`-wide integers spanning a voxel's bounds.
///
/// Quantization is lossy, but `dequantize(quantize(p))` lands within half a step of `p`, and re-quantizing a dequantized point
/// is exact.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quantizer {
    origin: DVec3,
    size: DVec3,
    bits: u8,
}

impl Quantizer {
    pub const MIN_BITS: u8 = 1;
    pub const MAX_BITS: u8 = 31;

    pub fn new(bounds: &Aabb, bits: u8) -> Self {
        Self {
            origin: bounds.min,
            size: bounds.size(),
            bits: bits.clamp(Self::MIN_BITS, Self::MAX_BITS),
        }
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn max_value(&self) -> u32 {
        (1u32 << self.bits) - 1
    }

    /// The width of one quantization step along each axis.
    pub fn step(&self) -> DVec3 {
        self.size / self.max_value() as f64
    }

    pub fn quantize(&self, p: DVec3) -> QPoint {
        let max = self.max_value() as f64;
        let q = |v: f64, o: f64, s: f64| -> u32 {
            if s <= 0.0 {
                return 0;
            }
            let t = ((v - o) / s).clamp(0.0, 1.0);
            (t * max).round() as u32
        };
        [
            q(p.x, self.origin.x, self.size.x),
            q(p.y, self.origin.y, self.size.y),
            q(p.z, self.origin.z, self.size.z),
        ]
    }

    pub fn dequantize(&self, q: QPoint) -> DVec3 {
        let max = self.max_value() as f64;
        self.origin + self.size * DVec3::new(q[0] as f64, q[1] as f64, q[2] as f64) / max
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
