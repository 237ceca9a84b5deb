use crate::glam::DVec3;

use serde::{Deserialize, Serialize};

/// An axis-aligned box in world coordinates. `max` is inclusive.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    pub fn from_min_and_size(min: DVec3, size: DVec3) -> Self {
        Self {
            min,
            max: min + size,
        }
    }

    /// The smallest box containing every point in `points`, or `None` if there are no points.
    pub fn bounding(points: impl IntoIterator<Item = DVec3>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        Some(points.fold(Self::new(first, first), |b, p| {
            Self::new(b.min.min(p), b.max.max(p))
        }))
    }

    /// Grows the box into a cube with the same minimum, using the longest edge.
    pub fn cubed(&self) -> Self {
        Self::from_min_and_size(self.min, DVec3::splat(self.size().max_element()))
    }

    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    /// Radius of the bounding sphere.
    pub fn radius(&self) -> f64 {
        self.size().length() * 0.5
    }

    pub fn bounding_sphere(&self) -> Sphere {
        Sphere::new(self.center(), self.radius())
    }

    /// Bounds of child `octant` (bit 0 = x, bit 1 = y, bit 2 = z).
    pub fn octant(&self, octant: u8) -> Self {
        let center = self.center();
        let pick = |bit: u8, lo: f64, mid: f64| if octant & bit == 0 { lo } else { mid };
        let min = DVec3::new(
            pick(1, self.min.x, center.x),
            pick(2, self.min.y, center.y),
            pick(4, self.min.z, center.z),
        );
        let max = DVec3::new(
            pick(1, center.x, self.max.x),
            pick(2, center.y, self.max.y),
            pick(4, center.z, self.max.z),
        );
        Self { min, max }
    }

    /// The octant of this box that `p` falls into. Points on the center plane go to the upper octant.
    pub fn octant_of(&self, p: DVec3) -> u8 {
        let c = self.center();
        (p.x >= c.x) as u8 | ((p.y >= c.y) as u8) << 1 | ((p.z >= c.z) as u8) << 2
    }

    pub fn contains_point(&self, p: DVec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    pub fn contains(&self, other: &Self) -> bool {
        self.contains_point(other.min) && self.contains_point(other.max)
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
    }

    pub fn distance_to_point(&self, p: DVec3) -> f64 {
        let clamped = p.clamp(self.min, self.max);
        clamped.distance(p)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Sphere {
    pub center: DVec3,
    pub radius: f64,
}

impl Sphere {
    pub fn new(center: DVec3, radius: f64) -> Self {
        Self { center, radius }
    }

    pub fn contains(&self, other: &Self) -> bool {
        let dist = self.center.distance(other.center);
        dist + other.radius < self.radius
    }

    pub fn intersects(&self, other: &Self) -> bool {
        let dist = self.center.distance(other.center);
        dist - other.radius < self.radius
    }

    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        aabb.distance_to_point(self.center) <= self.radius
    }

    pub fn aabb(&self) -> Aabb {
        Aabb::new(
            self.center - DVec3::splat(self.radius),
            self.center + DVec3::splat(self.radius),
        )
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
