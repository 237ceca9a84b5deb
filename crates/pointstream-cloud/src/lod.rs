use serde::{Deserialize, Serialize};

/// A level of detail for one voxel.
///
/// Level `num_lods - 1` is full density and every level below it halves the point count. Points within a voxel are stored in
/// an order where any prefix is a spatially uniform subsample, so level `l` is simply the first
/// [`Lod::point_count`] points of the full set.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Lod(pub u8);

impl Lod {
    pub const COARSEST: Self = Self(0);

    pub const fn finest(num_lods: u8) -> Self {
        Self(num_lods.saturating_sub(1))
    }

    pub fn levels(num_lods: u8) -> impl Iterator<Item = Self> {
        (0..num_lods).map(Self)
    }

    pub fn is_valid(self, num_lods: u8) -> bool {
        self.0 < num_lods
    }

    fn halvings(self, num_lods: u8) -> u32 {
        Self::finest(num_lods).0.saturating_sub(self.0) as u32
    }

    /// The fraction of the full point count that is resident at this level.
    pub fn amount(self, num_lods: u8) -> f32 {
        0.5f32.powi(self.halvings(num_lods) as i32)
    }

    /// Maps a density amount in `(0, 1]` to the coarsest level that covers it. Amounts `<= 0` (and NaN) mean "not needed".
    pub fn from_amount(amount: f32, num_lods: u8) -> Option<Self> {
        if !(amount > 0.0) || num_lods == 0 {
            return None;
        }
        let halvings = (-amount.min(1.0).log2()).floor() as i64;
        let level = (Self::finest(num_lods).0 as i64 - halvings).max(0);
        Some(Self(level as u8))
    }

    /// How many of `full_count` points are resident at this level. Never zero for a non-empty voxel.
    pub fn point_count(self, full_count: u64, num_lods: u8) -> u64 {
        if full_count == 0 {
            return 0;
        }
        let halvings = self.halvings(num_lods).min(63);
        let divisor = 1u64 << halvings;
        ((full_count + divisor - 1) / divisor).max(1)
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
    fn amount_maps_to_covering_level() {
        assert_eq!(Lod::from_amount(1.0, 8), Some(Lod(7)));
        assert_eq!(Lod::from_amount(2.0, 8), Some(Lod(7)));
        assert_eq!(Lod::from_amount(0.5, 8), Some(Lod(6)));
        assert_eq!(Lod::from_amount(0.3, 8), Some(Lod(6)));
        assert_eq!(Lod::from_amount(0.25, 8), Some(Lod(5)));
        assert_eq!(Lod::from_amount(1e-9, 8), Some(Lod(0)));
        assert_eq!(Lod::from_amount(0.0, 8), None);
        assert_eq!(Lod::from_amount(f32::NAN, 8), None);

        for lod in Lod::levels(8) {
            assert_eq!(Lod::from_amount(lod.amount(8), 8), Some(lod));
        }
    }

    #[test]
    fn point_counts_halve_per_level() {
        assert_eq!(Lod(7).point_count(1000, 8), 1000);
        assert_eq!(Lod(6).point_count(1000, 8), 500);
        assert_eq!(Lod(5).point_count(1000, 8), 250);
        assert_eq!(Lod(0).point_count(1000, 8), 8);
        assert_eq!(Lod(0).point_count(3, 8), 1);
        assert_eq!(Lod(0).point_count(0, 8), 0);
    }
}
