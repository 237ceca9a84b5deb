//! Point payload encoding.
//!
//! A blob is an LZ4 frame around a small header, the quantized positions (delta or octree coded), and the optional color and
//! intensity channels in the same point order as the decoded positions.

mod delta;
mod octree;
mod quantize;
mod varint;

pub use delta::DeltaEncoder;
pub use octree::OctreeCompressor;
pub use quantize::{QPoint, Quantizer};
pub use varint::ByteReader;

use crate::config::CodecConfig;
use crate::Status;

use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use varint::{write_varint, zigzag};

/// Decoded bodies larger than this are rejected before they are fully inflated.
const MAX_BODY_BYTES: u64 = 1 << 30;

const FLAG_RGB: u8 = 1;
const FLAG_INTENSITY: u8 = 1 << 1;

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum CodecKind {
    Delta,
    Octree,
}

impl CodecKind {
    fn tag(self) -> u8 {
        match self {
            Self::Delta => 0,
            Self::Octree => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, Status> {
        match tag {
            0 => Ok(Self::Delta),
            1 => Ok(Self::Octree),
            other => Err(Status::corrupt(format!("unknown codec tag {}", other))),
        }
    }
}

/// Quantized points with their optional per-point channels.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PointBlock {
    /// Width of every coordinate in `positions`.
    pub bits: u8,
    pub positions: Vec<QPoint>,
    pub rgb: Option<Vec<[u8; 3]>>,
    pub intensity: Option<Vec<u16>>,
}

impl PointBlock {
    pub fn new(bits: u8, positions: Vec<QPoint>) -> Self {
        Self {
            bits,
            positions,
            rgb: None,
            intensity: None,
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Bytes of point data held in memory.
    pub fn heap_bytes(&self) -> usize {
        self.positions.len() * std::mem::size_of::<QPoint>()
            + self.rgb.as_ref().map_or(0, |c| c.len() * 3)
            + self.intensity.as_ref().map_or(0, |c| c.len() * 2)
    }

    /// Keeps only the points at `indices`, in that order.
    pub fn select(&self, indices: impl Iterator<Item = usize> + Clone) -> Self {
        Self {
            bits: self.bits,
            positions: indices.clone().map(|i| self.positions[i]).collect(),
            rgb: self
                .rgb
                .as_ref()
                .map(|c| indices.clone().map(|i| c[i]).collect()),
            intensity: self
                .intensity
                .as_ref()
                .map(|c| indices.map(|i| c[i]).collect()),
        }
    }

    fn validate(&self) -> Result<(), Status> {
        let n = self.positions.len();
        if let Some(rgb) = &self.rgb {
            if rgb.len() != n {
                return Err(Status::corrupt(format!(
                    "rgb channel has {} entries for {} points",
                    rgb.len(),
                    n
                )));
            }
        }
        if let Some(intensity) = &self.intensity {
            if intensity.len() != n {
                return Err(Status::corrupt(format!(
                    "intensity channel has {} entries for {} points",
                    intensity.len(),
                    n
                )));
            }
        }
        if !(Quantizer::MIN_BITS..=Quantizer::MAX_BITS).contains(&self.bits) {
            return Err(Status::corrupt(format!("unsupported bit width {}", self.bits)));
        }
        let limit = 1u32 << self.bits;
        if self.positions.iter().flatten().any(|&v| v >= limit) {
            return Err(Status::corrupt(format!(
                "position exceeds {} quantization bits",
                self.bits
            )));
        }
        Ok(())
    }
}

/// Encodes and decodes [`PointBlock`]s.
#[derive(Clone, Copy, Debug)]
pub struct Codec {
    config: CodecConfig,
}

impl Codec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn encode(&self, block: &PointBlock) -> Result<Vec<u8>, Status> {
        block.validate()?;

        let mut body = Vec::with_capacity(16 + block.len() * 4);
        body.push(self.config.kind.tag());
        body.push(block.bits);
        let mut flags = 0;
        if block.rgb.is_some() {
            flags |= FLAG_RGB;
        }
        if block.intensity.is_some() {
            flags |= FLAG_INTENSITY;
        }
        body.push(flags);
        write_varint(&mut body, block.len() as u64);

        let permuted;
        let block = match self.config.kind {
            CodecKind::Delta => {
                DeltaEncoder.compress(&block.positions, &mut body);
                block
            }
            CodecKind::Octree => {
                let coder = self.config.octree_compressor();
                write_varint(&mut body, coder.leaf_threshold as u64);
                body.push(coder.max_depth);
                let order = coder.compress(&block.positions, block.bits, [0; 3], 0, &mut body);
                permuted = block.select(order.iter().map(|&i| i as usize));
                &permuted
            }
        };

        if let Some(rgb) = &block.rgb {
            body.extend_from_slice(bytemuck::cast_slice::<[u8; 3], u8>(rgb));
        }
        if let Some(intensity) = &block.intensity {
            let mut prev = 0i64;
            for &v in intensity {
                write_varint(&mut body, zigzag(v as i64 - prev));
                prev = v as i64;
            }
        }

        let mut encoder = FrameEncoder::new(Vec::with_capacity(body.len() / 2));
        encoder.write_all(&body)?;
        encoder
            .finish()
            .map_err(|e| Status::io(io::ErrorKind::Other, e.to_string()))
    }

    /// Blobs are self-describing, so any codec configuration can decode any blob.
    pub fn decode(&self, bytes: &[u8]) -> Result<PointBlock, Status> {
        let mut body = Vec::new();
        FrameDecoder::new(bytes)
            .take(MAX_BODY_BYTES)
            .read_to_end(&mut body)
            .map_err(|e| Status::corrupt(format!("bad LZ4 frame: {}", e)))?;

        let mut reader = ByteReader::new(&body);
        let kind = CodecKind::from_tag(reader.u8()?)?;
        let bits = reader.u8()?;
        if !(Quantizer::MIN_BITS..=Quantizer::MAX_BITS).contains(&bits) {
            return Err(Status::corrupt(format!("unsupported bit width {}", bits)));
        }
        let flags = reader.u8()?;
        let count = usize::try_from(reader.varint()?)
            .map_err(|_| Status::corrupt("point count overflows usize"))?;
        // Every point costs at least one byte per axis.
        if count.checked_mul(3).map_or(true, |n| n > reader.remaining()) {
            return Err(Status::corrupt(format!(
                "{} points cannot fit in {} bytes",
                count,
                reader.remaining()
            )));
        }

        let positions = match kind {
            CodecKind::Delta => DeltaEncoder.decompress(&mut reader, count, bits)?,
            CodecKind::Octree => {
                let leaf_threshold = u32::try_from(reader.varint()?)
                    .map_err(|_| Status::corrupt("octree leaf threshold overflows"))?;
                let max_depth = reader.u8()?;
                let coder = OctreeCompressor {
                    leaf_threshold,
                    max_depth,
                };
                coder.decompress(&mut reader, count, bits, [0; 3], 0)?
            }
        };

        let rgb = if flags & FLAG_RGB != 0 {
            let raw = reader.take(count * 3)?;
            let colors: &[[u8; 3]] = bytemuck::try_cast_slice(raw)
                .map_err(|e| Status::corrupt(format!("bad rgb channel: {}", e)))?;
            Some(colors.to_vec())
        } else {
            None
        };

        let intensity = if flags & FLAG_INTENSITY != 0 {
            let mut values = Vec::with_capacity(count);
            let mut prev = 0i64;
            for _ in 0..count {
                let v = prev
                    .checked_add(reader.signed_varint()?)
                    .and_then(|v| u16::try_from(v).ok())
                    .ok_or_else(|| Status::corrupt("intensity out of range"))?;
                values.push(v);
                prev = v as i64;
            }
            Some(values)
        } else {
            None
        };

        reader.finish()?;

        Ok(PointBlock {
            bits,
            positions,
            rgb,
            intensity,
        })
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
    use pointstream_core::glam::DVec3;

    fn sample_block(n: usize) -> PointBlock {
        let bounds = Aabb::from_min_and_size(DVec3::new(100.0, -50.0, 3.0), DVec3::splat(8.0));
        let quantizer = Quantizer::new(&bounds, 14);
        let positions = (0..n)
            .map(|i| {
                let t = i as f64 / n as f64;
                let p = bounds.min
                    + DVec3::new(
                        (t * 37.0).fract() * 8.0,
                        (t * 11.0).fract() * 8.0,
                        t * 8.0,
                    );
                quantizer.quantize(p)
            })
            .collect();
        let mut block = PointBlock::new(quantizer.bits(), positions);
        block.rgb = Some((0..n).map(|i| [i as u8, (i / 3) as u8, 200]).collect());
        block.intensity = Some((0..n).map(|i| (i * 97 % 4000) as u16).collect());
        block
    }

    fn codec(kind: CodecKind) -> Codec {
        Codec::new(CodecConfig {
            kind,
            ..Default::default()
        })
    }

    fn point_tuples(block: &PointBlock) -> Vec<(QPoint, [u8; 3], u16)> {
        let rgb = block.rgb.as_ref().unwrap();
        let intensity = block.intensity.as_ref().unwrap();
        let mut tuples: Vec<_> = (0..block.len())
            .map(|i| (block.positions[i], rgb[i], intensity[i]))
            .collect();
        tuples.sort_unstable();
        tuples
    }

    #[test]
    fn delta_round_trip_is_exact() {
        let block = sample_block(1000);
        let codec = codec(CodecKind::Delta);
        let bytes = codec.encode(&block).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), block);
    }

    #[test]
    fn octree_round_trip_keeps_channels_with_their_points() {
        let block = sample_block(1000);
        let codec = codec(CodecKind::Octree);
        let bytes = codec.encode(&block).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.bits, block.bits);
        assert_eq!(point_tuples(&decoded), point_tuples(&block));
    }

    #[test]
    fn blobs_are_self_describing() {
        let block = sample_block(64);
        let bytes = codec(CodecKind::Octree).encode(&block).unwrap();
        let decoded = codec(CodecKind::Delta).decode(&bytes).unwrap();
        assert_eq!(point_tuples(&decoded), point_tuples(&block));
    }

    #[test]
    fn empty_block_round_trips() {
        let block = PointBlock::new(16, Vec::new());
        for kind in [CodecKind::Delta, CodecKind::Octree] {
            let codec = codec(kind);
            assert_eq!(codec.decode(&codec.encode(&block).unwrap()).unwrap(), block);
        }
    }

    #[test]
    fn malformed_blocks_are_rejected_on_encode() {
        let mut block = sample_block(10);
        block.rgb.as_mut().unwrap().pop();
        assert!(codec(CodecKind::Delta).encode(&block).is_err());

        let block = PointBlock::new(4, vec![[16, 0, 0]]);
        assert!(codec(CodecKind::Delta).encode(&block).is_err());
    }

    #[test]
    fn corrupt_input_fails_without_panicking() {
        let codec = codec(CodecKind::Octree);
        let bytes = codec.encode(&sample_block(300)).unwrap();

        assert!(matches!(codec.decode(&[]), Err(Status::CorruptPayload(_))));
        assert!(matches!(
            codec.decode(b"definitely not lz4"),
            Err(Status::CorruptPayload(_))
        ));
        for cut in 0..bytes.len() - 4 {
            assert!(
                matches!(codec.decode(&bytes[..cut]), Err(Status::CorruptPayload(_))),
                "prefix of {} bytes decoded",
                cut
            );
        }

        // A well-formed frame around a body that lies about its point count.
        let mut body = vec![CodecKind::Delta.tag(), 16, 0];
        write_varint(&mut body, 1_000_000);
        body.extend_from_slice(&[0; 12]);
        let mut encoder = FrameEncoder::new(Vec::new());
        encoder.write_all(&body).unwrap();
        let lying = encoder.finish().unwrap();
        assert!(matches!(codec.decode(&lying), Err(Status::CorruptPayload(_))));
    }

    /// xorshift64*, so failures reproduce from the seed.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 >> 12;
            self.0 ^= self.0 << 25;
            self.0 ^= self.0 >> 27;
            self.0.wrapping_mul(0x2545_f491_4f6c_dd1d)
        }

        fn below(&mut self, n: u64) -> u64 {
            self.next() % n
        }
    }

    fn random_block(rng: &mut Rng, bits: u8, rgb: bool, intensity: bool) -> PointBlock {
        let max = (1u64 << bits) - 1;
        let n = rng.below(400) as usize;
        let mut positions: Vec<QPoint> = (0..n)
            .map(|_| {
                // Bias towards the extremes of the quantized range.
                let mut coord = || match rng.below(8) {
                    0 => 0,
                    1 => max as u32,
                    2 => (max - rng.below(4).min(max)) as u32,
                    _ => rng.below(max + 1) as u32,
                };
                [coord(), coord(), coord()]
            })
            .collect();
        if n > 1 {
            positions[0] = [0; 3];
            positions[n - 1] = [max as u32; 3];
        }
        let mut block = PointBlock::new(bits, positions);
        if rgb {
            block.rgb = Some((0..n).map(|_| [rng.next() as u8, rng.next() as u8, rng.next() as u8]).collect());
        }
        if intensity {
            block.intensity = Some(
                (0..n)
                    .map(|_| match rng.below(4) {
                        0 => 0,
                        1 => u16::MAX,
                        _ => rng.next() as u16,
                    })
                    .collect(),
            );
        }
        block
    }

    fn sorted_points(block: &PointBlock) -> Vec<(QPoint, Option<[u8; 3]>, Option<u16>)> {
        let mut points: Vec<_> = (0..block.len())
            .map(|i| {
                (
                    block.positions[i],
                    block.rgb.as_ref().map(|c| c[i]),
                    block.intensity.as_ref().map(|c| c[i]),
                )
            })
            .collect();
        points.sort_unstable();
        points
    }

    #[test]
    fn seeded_random_blocks_round_trip() {
        let mut rng = Rng(0x9e37_79b9_7f4a_7c15);
        let octree = Codec::new(CodecConfig {
            kind: CodecKind::Octree,
            octree_leaf_threshold: 3,
            octree_max_depth: 8,
            ..Default::default()
        });
        for round in 0..200 {
            let bits = match round % 6 {
                0 => Quantizer::MIN_BITS,
                1 => 2,
                2 => 8,
                3 => 16,
                4 => 21,
                _ => Quantizer::MAX_BITS,
            };
            let block = random_block(&mut rng, bits, round % 2 == 0, round % 3 != 0);

            let delta = codec(CodecKind::Delta);
            let decoded = delta.decode(&delta.encode(&block).unwrap()).unwrap();
            assert_eq!(decoded, block, "delta, round {} at {} bits", round, bits);

            for coder in [codec(CodecKind::Octree), octree] {
                let decoded = coder.decode(&coder.encode(&block).unwrap()).unwrap();
                assert_eq!(decoded.bits, bits);
                assert_eq!(
                    sorted_points(&decoded),
                    sorted_points(&block),
                    "octree, round {} at {} bits",
                    round,
                    bits
                );
            }
        }
    }
}
