use simba::simd::SimdValue;

use crate::util::simba::{fast_max, fast_min, SimbaWorkarounds as _};

use super::{FloatType, Ray, SimdF32x8, WorldBox8, WorldPoint, BVH_FAR};

/// Scalar ray/AABB slab test. Returns the entry distance, or [`BVH_FAR`]
/// when the box is missed, lies behind the ray, or starts beyond `max_t`.
pub fn slab_test(
    ray: &Ray,
    aabb_min: &WorldPoint,
    aabb_max: &WorldPoint,
    max_t: FloatType,
) -> FloatType {
    let tx1 = (aabb_min.x - ray.origin.x) * ray.inv_direction.x;
    let tx2 = (aabb_max.x - ray.origin.x) * ray.inv_direction.x;
    let mut tmin = tx1.min(tx2);
    let mut tmax = tx1.max(tx2);
    let ty1 = (aabb_min.y - ray.origin.y) * ray.inv_direction.y;
    let ty2 = (aabb_max.y - ray.origin.y) * ray.inv_direction.y;
    tmin = tmin.max(ty1.min(ty2));
    tmax = tmax.min(ty1.max(ty2));
    let tz1 = (aabb_min.z - ray.origin.z) * ray.inv_direction.z;
    let tz2 = (aabb_max.z - ray.origin.z) * ray.inv_direction.z;
    tmin = tmin.max(tz1.min(tz2));
    tmax = tmax.min(tz1.max(tz2));
    if tmax >= tmin && tmin < max_t && tmax >= 0.0 {
        tmin
    } else {
        BVH_FAR
    }
}

pub trait RayIntersectionExt {
    type DistanceType;
    /// Calculate first and last ray intersection with the box.
    fn intersect(&self, ray: &Ray) -> (Self::DistanceType, Self::DistanceType);
}

impl RayIntersectionExt for WorldBox8 {
    type DistanceType = SimdF32x8;

    /// Calculates ray intersection with the box pack.
    /// Returns minimum and maximum distance along the ray; the box is hit
    /// where min <= max.
    fn intersect(&self, ray: &Ray) -> (SimdF32x8, SimdF32x8) {
        let ray_origin = ray.origin.map(|x| SimdF32x8::splat(x));
        let ray_inv_direction = ray.inv_direction.map(|x| SimdF32x8::splat(x));

        // The multiplication is NaN if the ray starts on the slab bounding
        // plane and is parallel to it. Blend those lanes to +-infinity so
        // the slab interval becomes unbounded on that axis.
        let to_box_min = (self.min - ray_origin)
            .component_mul(&ray_inv_direction)
            .map(|x| SimdF32x8::neg_infinity().select(x.is_nan(), x));
        let to_box_max = (self.max - ray_origin)
            .component_mul(&ray_inv_direction)
            .map(|x| SimdF32x8::infinity().select(x.is_nan(), x));

        let componentwise_min_t = to_box_min.zip_map(&to_box_max, fast_min);
        let componentwise_max_t = to_box_min.zip_map(&to_box_max, fast_max);


        let min_t = fast_max(
            componentwise_min_t.x,
            fast_max(componentwise_min_t.y, componentwise_min_t.z),
        );
        let max_t = fast_min(
            componentwise_max_t.x,
            fast_min(componentwise_max_t.y, componentwise_max_t.z),
        );

        (min_t, max_t)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert2::assert;
    use test_case::test_case;

    use crate::geometry::{WorldBox, WorldVector};

    fn unit_box() -> (WorldPoint, WorldPoint) {
        (WorldPoint::new(0.0, 0.0, 0.0), WorldPoint::new(1.0, 1.0, 1.0))
    }

    #[test]
    fn hit_straight_on() {
        let (bmin, bmax) = unit_box();
        let ray = Ray::new(
            WorldPoint::new(0.5, 0.5, -2.0),
            WorldVector::new(0.0, 0.0, 1.0),
        );
        assert!(slab_test(&ray, &bmin, &bmax, BVH_FAR) == 2.0);
    }

    #[test]
    fn miss_returns_far() {
        let (bmin, bmax) = unit_box();
        let ray = Ray::new(
            WorldPoint::new(10.0, 10.0, 10.0),
            WorldVector::new(1.0, 0.0, 0.0),
        );
        assert!(slab_test(&ray, &bmin, &bmax, BVH_FAR) == BVH_FAR);
    }

    #[test]
    fn behind_ray_returns_far() {
        let (bmin, bmax) = unit_box();
        let ray = Ray::new(
            WorldPoint::new(0.5, 0.5, 5.0),
            WorldVector::new(0.0, 0.0, 1.0),
        );
        assert!(slab_test(&ray, &bmin, &bmax, BVH_FAR) == BVH_FAR);
    }

    #[test]
    fn origin_inside_reports_negative_entry() {
        let (bmin, bmax) = unit_box();
        let ray = Ray::new(
            WorldPoint::new(0.5, 0.5, 0.5),
            WorldVector::new(0.0, 0.0, 1.0),
        );
        let t = slab_test(&ray, &bmin, &bmax, BVH_FAR);
        assert!(t < 0.0);
    }

    #[test]
    fn beyond_max_t_is_culled() {
        let (bmin, bmax) = unit_box();
        let ray = Ray::new(
            WorldPoint::new(0.5, 0.5, -2.0),
            WorldVector::new(0.0, 0.0, 1.0),
        );
        assert!(slab_test(&ray, &bmin, &bmax, 1.5) == BVH_FAR);
    }

    // Rays parallel to an axis that start outside the corresponding slab
    // must miss, regardless of the other axes.
    #[test_case(-1.0,  0.5,  0.5,   0.0, 1.0, 0.0 ; "low_x_parallel")]
    #[test_case( 2.0,  0.5,  0.5,   0.0, 1.0, 0.0 ; "high_x_parallel")]
    #[test_case( 0.5, -1.0,  0.5,   1.0, 0.0, 0.0 ; "low_y_parallel")]
    #[test_case( 0.5,  2.0,  0.5,   1.0, 0.0, 0.0 ; "high_y_parallel")]
    #[test_case( 0.5,  0.5, -1.0,   1.0, 0.0, 0.0 ; "low_z_parallel")]
    #[test_case( 0.5,  0.5,  2.0,   1.0, 0.0, 0.0 ; "high_z_parallel")]
    fn parallel_outside_misses(px: f32, py: f32, pz: f32, dx: f32, dy: f32, dz: f32) {
        let (bmin, bmax) = unit_box();
        let ray = Ray::new(WorldPoint::new(px, py, pz), WorldVector::new(dx, dy, dz));
        assert!(slab_test(&ray, &bmin, &bmax, BVH_FAR) == BVH_FAR);
    }

    #[test]
    fn simd_lanes_match_scalar() {
        use simba::simd::SimdValue;

        let boxes = [
            WorldBox::new(WorldPoint::new(0.0, 0.0, 0.0), WorldPoint::new(1.0, 1.0, 1.0)),
            WorldBox::new(WorldPoint::new(2.0, 0.0, 0.0), WorldPoint::new(3.0, 1.0, 1.0)),
            WorldBox::new(WorldPoint::new(0.0, 5.0, 0.0), WorldPoint::new(1.0, 6.0, 1.0)),
            WorldBox::new(WorldPoint::new(-3.0, -3.0, -3.0), WorldPoint::new(-2.0, -2.0, -2.0)),
        ];
        let ray = Ray::new(
            WorldPoint::new(0.5, 0.5, -2.0),
            WorldVector::new(0.1, 0.0, 1.0),
        );

        let mut min = [[BVH_FAR; 8]; 3];
        let mut max = [[-BVH_FAR; 8]; 3];
        for (i, b) in boxes.iter().enumerate() {
            for a in 0..3 {
                min[a][i] = b.min[a];
                max[a][i] = b.max[a];
            }
        }
        let pack = WorldBox8 {
            min: nalgebra::Point3::new(min[0].into(), min[1].into(), min[2].into()),
            max: nalgebra::Point3::new(max[0].into(), max[1].into(), max[2].into()),
        };

        let (tmin, tmax) = pack.intersect(&ray);
        for (i, b) in boxes.iter().enumerate() {
            let scalar = slab_test(&ray, &b.min, &b.max, BVH_FAR);
            let lane_hit = tmax.extract(i) >= tmin.extract(i) && tmax.extract(i) >= 0.0;
            if scalar == BVH_FAR {
                assert!(!lane_hit, "box {i} should miss");
            } else {
                assert!(lane_hit, "box {i} should hit");
                assert!((tmin.extract(i) - scalar).abs() < 1e-6);
            }
        }
    }
}
