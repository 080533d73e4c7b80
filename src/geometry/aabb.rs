use std::ops::Sub;

use super::{FloatType, WorldBox, WorldPoint, WorldVector, BVH_FAR};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb<Point> {
    pub min: Point,
    pub max: Point,
}

impl<Point> Aabb<Point> {
    pub fn new(min: Point, max: Point) -> Aabb<Point> {
        Aabb { min, max }
    }

    pub fn map<Point2, F: FnMut(&Point) -> Point2>(&self, mut f: F) -> Aabb<Point2> {
        Aabb {
            min: f(&self.min),
            max: f(&self.max),
        }
    }

    pub fn zip_map<Point2, Point3, F: FnMut(&Point, &Point2) -> Point3>(
        &self,
        rhs: &Aabb<Point2>,
        mut f: F,
    ) -> Aabb<Point3> {
        Aabb {
            min: f(&self.min, &rhs.min),
            max: f(&self.max, &rhs.max),
        }
    }
}

impl<Point: Sub + Copy> Aabb<Point> {
    pub fn size(&self) -> Point::Output {
        self.max - self.min
    }
}

impl<Point> From<(Point, Point)> for Aabb<Point> {
    fn from(value: (Point, Point)) -> Self {
        let (min, max) = value;
        Aabb { min, max }
    }
}

impl WorldBox {
    /// The inverted box: growing it by any point yields that point's box.
    pub const EMPTY: WorldBox = WorldBox {
        min: WorldPoint::new(BVH_FAR, BVH_FAR, BVH_FAR),
        max: WorldPoint::new(-BVH_FAR, -BVH_FAR, -BVH_FAR),
    };

    pub fn from_points(points: impl IntoIterator<Item = WorldPoint>) -> WorldBox {
        let mut aabb = WorldBox::EMPTY;
        for p in points {
            aabb.grow(&p);
        }
        aabb
    }

    pub fn grow(&mut self, p: &WorldPoint) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    pub fn grow_aabb(&mut self, other: &WorldBox) {
        self.min = self.min.inf(&other.min);
        self.max = self.max.sup(&other.max);
    }

    pub fn union(&self, other: &WorldBox) -> WorldBox {
        WorldBox {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }

    pub fn intersection(&self, other: &WorldBox) -> WorldBox {
        WorldBox {
            min: self.min.sup(&other.min),
            max: self.max.inf(&other.max),
        }
    }

    /// Half of the surface area: `xy + yz + zx` of the extent. All SAH
    /// arithmetic in this crate is consistently in half-area units.
    pub fn half_area(&self) -> FloatType {
        let e = self.size();
        e.x * e.y + e.y * e.z + e.z * e.x
    }

    pub fn center(&self) -> WorldPoint {
        nalgebra::center(&self.min, &self.max)
    }

    pub fn longest_axis(&self) -> usize {
        let e = self.size();
        let mut axis = 0;
        if e.y > e.x && e.y > e.z {
            axis = 1;
        }
        if e.z > e.x && e.z > e.y {
            axis = 2;
        }
        axis
    }

    /// A box is valid once it has grown past its inverted initial state.
    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    pub fn contains(&self, p: &WorldPoint) -> bool {
        p.x >= self.min.x
            && p.y >= self.min.y
            && p.z >= self.min.z
            && p.x <= self.max.x
            && p.y <= self.max.y
            && p.z <= self.max.z
    }

    /// True when `other` lies entirely inside this box, with `tolerance`
    /// slack per component.
    pub fn encloses(&self, other: &WorldBox, tolerance: FloatType) -> bool {
        self.min.x <= other.min.x + tolerance
            && self.min.y <= other.min.y + tolerance
            && self.min.z <= other.min.z + tolerance
            && self.max.x >= other.max.x - tolerance
            && self.max.y >= other.max.y - tolerance
            && self.max.z >= other.max.z - tolerance
    }

    /// Corner `i` of the box, with bit 0/1/2 of `i` selecting max over min
    /// on x/y/z.
    pub fn corner(&self, i: usize) -> WorldPoint {
        WorldPoint::new(
            if i & 1 != 0 { self.max.x } else { self.min.x },
            if i & 2 != 0 { self.max.y } else { self.min.y },
            if i & 4 != 0 { self.max.z } else { self.min.z },
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert2::assert;

    #[test]
    fn grow_from_empty() {
        let mut aabb = WorldBox::EMPTY;
        assert!(!aabb.is_valid());
        aabb.grow(&WorldPoint::new(1.0, 2.0, 3.0));
        aabb.grow(&WorldPoint::new(-1.0, 0.0, 5.0));
        assert!(aabb.is_valid());
        assert!(aabb.min == WorldPoint::new(-1.0, 0.0, 3.0));
        assert!(aabb.max == WorldPoint::new(1.0, 2.0, 5.0));
    }

    #[test]
    fn half_area_unit_cube() {
        let aabb = WorldBox::new(WorldPoint::origin(), WorldPoint::new(1.0, 1.0, 1.0));
        assert!(aabb.half_area() == 3.0);
    }

    #[test]
    fn longest_axis_picks_largest_extent() {
        let aabb = WorldBox::new(WorldPoint::origin(), WorldPoint::new(1.0, 3.0, 2.0));
        assert!(aabb.longest_axis() == 1);
        let aabb = WorldBox::new(WorldPoint::origin(), WorldPoint::new(1.0, 3.0, 4.0));
        assert!(aabb.longest_axis() == 2);
    }

    #[test]
    fn corners_cover_all_eight() {
        let aabb = WorldBox::new(WorldPoint::origin(), WorldPoint::new(1.0, 1.0, 1.0));
        let mut sum = WorldVector::zeros();
        for i in 0..8 {
            sum += aabb.corner(i).coords;
        }
        // every axis contributes 4x min and 4x max
        assert!(sum == WorldVector::new(4.0, 4.0, 4.0));
    }

    #[test]
    fn encloses_with_tolerance() {
        let outer = WorldBox::new(WorldPoint::origin(), WorldPoint::new(2.0, 2.0, 2.0));
        let inner = WorldBox::new(
            WorldPoint::new(0.5, 0.5, 0.5),
            WorldPoint::new(1.5, 1.5, 1.5),
        );
        assert!(outer.encloses(&inner, 0.0));
        assert!(!inner.encloses(&outer, 0.0));
        assert!(inner.encloses(&outer, 1.0));
    }
}
