//! Density policies turn a client's view of the cloud into a desired level of detail per voxel.
//!
//! For every query the engine calls [`DensityPolicy::begin_query`] once, then `pre_query`, `lod_amount` and `post_query`
//! for each leaf voxel intersecting the query area, then `end_query`. An amount in `(0, 1]` is the fraction of the voxel's
//! full point count the client wants; `<= 0` means the voxel is not needed.

use crate::{ClientId, Lod, NodeId, VoxelKey};

use pointstream_core::geometry::Aabb;
use pointstream_core::glam::DVec3;
use pointstream_core::SmallKeyHashMap;

/// What a policy sees of a query as a whole.
#[derive(Clone, Copy, Debug)]
pub struct QueryView {
    pub client: ClientId,
    pub area: Aabb,
    /// Engine iteration the query runs in.
    pub iteration: u64,
    /// Full-density points over all leaf voxels intersecting `area`.
    pub candidate_points: u64,
    pub num_lods: u8,
}

/// What a policy sees of one voxel.
#[derive(Clone, Copy, Debug)]
pub struct VoxelView {
    pub node: NodeId,
    pub key: VoxelKey,
    pub bounds: Aabb,
    pub full_point_count: u64,
    pub num_lods: u8,
    pub resident_lod: Option<Lod>,
    pub last_touched: u64,
    pub iteration: u64,
}

impl VoxelView {
    /// Iterations since the voxel was last touched.
    pub fn age(&self) -> u64 {
        self.iteration.saturating_sub(self.last_touched)
    }
}

pub trait DensityPolicy: Send {
    fn begin_query(&mut self, _query: &QueryView) {}

    fn pre_query(&mut self, _voxel: &VoxelView) {}

    fn lod_amount(&mut self, voxel: &VoxelView) -> f32;

    /// Called with the amount `lod_amount` returned for `voxel`.
    fn post_query(&mut self, _voxel: &VoxelView, _amount: f32) {}

    fn end_query(&mut self, _query: &QueryView) {}

    /// A fetch this policy asked for failed for good. The previous payload, if any, stays resident.
    fn lod_unavailable(&mut self, _key: VoxelKey, _lod: Lod) {}
}

/// Every voxel at `coeff` of full density.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FullDetail {
    pub coeff: f32,
}

impl Default for FullDetail {
    fn default() -> Self {
        Self { coeff: 1.0 }
    }
}

impl DensityPolicy for FullDetail {
    fn lod_amount(&mut self, _voxel: &VoxelView) -> f32 {
        self.coeff
    }
}

/// Density that halves every `half_life` iterations a voxel goes untouched.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecencyProportional {
    pub coeff: f32,
    pub half_life: f32,
}

impl Default for RecencyProportional {
    fn default() -> Self {
        Self {
            coeff: 1.0,
            half_life: 8.0,
        }
    }
}

impl DensityPolicy for RecencyProportional {
    fn lod_amount(&mut self, voxel: &VoxelView) -> f32 {
        let half_life = self.half_life.max(f32::EPSILON);
        self.coeff * 0.5f32.powf(voxel.age() as f32 / half_life)
    }
}

/// Keeps each voxel at the amount last resolved for it, so the view stops refining.
///
/// Voxels seen for the first time keep whatever is resident, or the coarsest level if nothing is.
#[derive(Clone, Debug, Default)]
pub struct Current {
    resolved: SmallKeyHashMap<VoxelKey, f32>,
}

impl Current {
    pub fn resolved_amount(&self, key: VoxelKey) -> Option<f32> {
        self.resolved.get(&key).copied()
    }
}

impl DensityPolicy for Current {
    fn lod_amount(&mut self, voxel: &VoxelView) -> f32 {
        if let Some(&amount) = self.resolved.get(&voxel.key) {
            return amount;
        }
        voxel
            .resident_lod
            .unwrap_or(Lod::COARSEST)
            .amount(voxel.num_lods)
    }

    fn post_query(&mut self, voxel: &VoxelView, amount: f32) {
        self.resolved.insert(voxel.key, amount);
    }

    fn lod_unavailable(&mut self, key: VoxelKey, _lod: Lod) {
        self.resolved.remove(&key);
    }
}

/// Spreads a point budget uniformly over the query.
///
/// The amount is rounded down to a whole level so the query holds at most `max_points`, plus at most one point per voxel
/// where a level rounds up, and never less than the coarsest level.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointLimit {
    pub max_points: u64,
    amount: f32,
}

impl PointLimit {
    pub fn new(max_points: u64) -> Self {
        Self {
            max_points,
            amount: 1.0,
        }
    }
}

impl DensityPolicy for PointLimit {
    fn begin_query(&mut self, query: &QueryView) {
        self.amount = if query.candidate_points <= self.max_points {
            1.0
        } else {
            let ratio = self.max_points as f64 / query.candidate_points as f64;
            // Smallest positive amount still maps to the coarsest level, even for a zero budget.
            (2f64.powf(ratio.log2().floor()) as f32).max(f32::MIN_POSITIVE)
        };
    }

    fn lod_amount(&mut self, _voxel: &VoxelView) -> f32 {
        self.amount
    }
}

/// About one point per `spacing`-sized cube, however dense the scan is locally.
///
/// Voxels holding more points than such cubes fit in their bounds are thinned to roughly that many. Sparser voxels keep
/// every point, and no voxel drops below the coarsest level.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpatialUniform {
    pub spacing: f64,
}

impl SpatialUniform {
    pub fn new(spacing: f64) -> Self {
        Self { spacing }
    }
}

impl DensityPolicy for SpatialUniform {
    fn lod_amount(&mut self, voxel: &VoxelView) -> f32 {
        if voxel.full_point_count == 0 {
            return 1.0;
        }
        let size = voxel.bounds.size();
        let cells = size.x * size.y * size.z / self.spacing.max(f64::MIN_POSITIVE).powi(3);
        let amount = (cells / voxel.full_point_count as f64).min(1.0) as f32;
        if amount.is_nan() {
            return 1.0;
        }
        amount.max(f32::MIN_POSITIVE)
    }
}

/// Detail falling off with distance from an observer.
///
/// A voxel gets full density while its bounding sphere's radius, divided by the distance from the observer to the closest
/// point of that sphere, is at least `1 / detail`. Beyond that the amount drops in proportion to distance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewDistance {
    pub observer: DVec3,
    pub detail: f64,
}

impl ViewDistance {
    pub fn new(observer: DVec3, detail: f64) -> Self {
        Self { observer, detail }
    }

    fn closest_distance(&self, bounds: &Aabb) -> f64 {
        let sphere = bounds.bounding_sphere();
        self.observer.distance(sphere.center) - sphere.radius
    }
}

impl DensityPolicy for ViewDistance {
    fn lod_amount(&mut self, voxel: &VoxelView) -> f32 {
        let distance = self.closest_distance(&voxel.bounds);
        if distance <= 0.0 {
            return 1.0;
        }
        let radius = voxel.bounds.radius();
        (self.detail * radius / distance).min(1.0) as f32
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

    use approx::assert_relative_eq;
    use pointstream_core::arena::ArenaId;

    fn voxel(min: DVec3, size: f64) -> VoxelView {
        VoxelView {
            node: ArenaId::from_raw(1).unwrap(),
            key: VoxelKey::ROOT,
            bounds: Aabb::from_min_and_size(min, DVec3::splat(size)),
            full_point_count: 1000,
            num_lods: 8,
            resident_lod: None,
            last_touched: 0,
            iteration: 0,
        }
    }

    fn query(candidate_points: u64) -> QueryView {
        QueryView {
            client: ClientId(1),
            area: Aabb::from_min_and_size(DVec3::ZERO, DVec3::ONE),
            iteration: 0,
            candidate_points,
            num_lods: 8,
        }
    }

    #[test]
    fn full_detail_scales_by_coefficient() {
        let v = voxel(DVec3::ZERO, 1.0);
        assert_eq!(FullDetail::default().lod_amount(&v), 1.0);
        assert_eq!(FullDetail { coeff: 0.25 }.lod_amount(&v), 0.25);
    }

    #[test]
    fn recency_halves_per_half_life() {
        let mut policy = RecencyProportional {
            coeff: 1.0,
            half_life: 4.0,
        };
        let mut v = voxel(DVec3::ZERO, 1.0);
        v.iteration = 10;
        v.last_touched = 10;
        assert_relative_eq!(policy.lod_amount(&v), 1.0);
        v.last_touched = 6;
        assert_relative_eq!(policy.lod_amount(&v), 0.5);
        v.last_touched = 2;
        assert_relative_eq!(policy.lod_amount(&v), 0.25);
    }

    #[test]
    fn current_reuses_last_resolved_amount() {
        let mut policy = Current::default();
        let mut v = voxel(DVec3::ZERO, 1.0);
        assert_relative_eq!(policy.lod_amount(&v), Lod::COARSEST.amount(8));

        v.resident_lod = Some(Lod(5));
        assert_relative_eq!(policy.lod_amount(&v), 0.25);

        policy.post_query(&v, 0.5);
        v.resident_lod = Some(Lod(7));
        assert_relative_eq!(policy.lod_amount(&v), 0.5);
        assert_eq!(policy.resolved_amount(v.key), Some(0.5));

        policy.lod_unavailable(v.key, Lod(6));
        assert_relative_eq!(policy.lod_amount(&v), 1.0);
    }

    #[test]
    fn point_limit_rounds_down_to_a_level() {
        let mut policy = PointLimit::new(1000);
        let v = voxel(DVec3::ZERO, 1.0);

        policy.begin_query(&query(800));
        assert_eq!(policy.lod_amount(&v), 1.0);

        policy.begin_query(&query(3000));
        assert_relative_eq!(policy.lod_amount(&v), 0.25);
        let lod = Lod::from_amount(policy.lod_amount(&v), 8).unwrap();
        assert!(lod.point_count(3000, 8) <= 1000);

        policy.begin_query(&query(u64::MAX));
        let amount = policy.lod_amount(&v);
        assert!(amount > 0.0);
        assert_eq!(Lod::from_amount(amount, 8), Some(Lod::COARSEST));
    }

    #[test]
    fn point_limit_of_zero_keeps_the_coarsest_level() {
        let mut policy = PointLimit::new(0);
        policy.begin_query(&query(5000));
        let amount = policy.lod_amount(&voxel(DVec3::ZERO, 1.0));
        assert!(amount > 0.0);
        assert_eq!(Lod::from_amount(amount, 8), Some(Lod::COARSEST));
    }

    #[test]
    fn spatial_uniform_thins_dense_voxels_to_the_spacing() {
        // 1000 points in a unit cube.
        let v = voxel(DVec3::ZERO, 1.0);

        let mut fine = SpatialUniform::new(0.1);
        assert_relative_eq!(fine.lod_amount(&v), 1.0, epsilon = 1e-4);
        assert_eq!(SpatialUniform::new(0.05).lod_amount(&v), 1.0);

        let mut quarter = SpatialUniform::new(0.25);
        assert_relative_eq!(quarter.lod_amount(&v), 0.064);
        let lod = Lod::from_amount(quarter.lod_amount(&v), 8).unwrap();
        assert_eq!(lod, Lod(4));
        assert!(lod.point_count(1000, 8) >= 64);

        // Twice the size holds eight times the cells.
        let big = voxel(DVec3::ZERO, 2.0);
        assert_relative_eq!(SpatialUniform::new(0.5).lod_amount(&big), 0.064);

        let coarse = SpatialUniform::new(10.0).lod_amount(&v);
        assert!(coarse > 0.0);
        assert_eq!(Lod::from_amount(coarse, 8), Some(Lod::COARSEST));

        let mut flat = v;
        flat.bounds = Aabb::new(DVec3::ZERO, DVec3::new(1.0, 1.0, 0.0));
        assert_eq!(Lod::from_amount(quarter.lod_amount(&flat), 8), Some(Lod::COARSEST));
    }

    #[test]
    fn view_distance_falls_off() {
        let mut policy = ViewDistance::new(DVec3::ZERO, 2.0);
        let near = voxel(DVec3::splat(-0.5), 1.0);
        assert_eq!(policy.lod_amount(&near), 1.0);

        let v = voxel(DVec3::new(100.0, 0.0, 0.0), 1.0);
        let far = voxel(DVec3::new(1000.0, 0.0, 0.0), 1.0);
        let a = policy.lod_amount(&v);
        let b = policy.lod_amount(&far);
        assert!(a > 0.0 && a < 1.0);
        assert!(b > 0.0 && b < a);
        assert_eq!(Lod::from_amount(a, 8), Some(Lod(2)));
    }
}
