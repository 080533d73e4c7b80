use arrayvec::ArrayVec;
use assert2::debug_assert;

use crate::geometry::{
    intersect_triangle, slab_test, triangle_occludes, Ray, VertexSlice, BVH_FAR,
};

use super::{Bvh, NodeIdx, TRAVERSAL_STACK_DEPTH};

impl Bvh {
    /// Closest-hit traversal: ordered depth-first descent with a near/far
    /// stack. On return `ray.hit` holds the nearest intersection, or is
    /// untouched if nothing was hit. Returns the number of traversal steps
    /// taken (a diagnostic; proportional to the cost of the query).
    pub fn intersect(&self, ray: &mut Ray, verts: VertexSlice) -> u32 {
        self.intersect_custom(ray, |ray, prim| {
            let tri = verts.triangle(prim);
            intersect_triangle(ray, &tri[0], &tri[1], &tri[2], prim);
        })
    }

    /// Closest-hit traversal with a caller-supplied primitive test, for
    /// trees built over AABBs. The callback must shorten `ray.hit.t` when
    /// it finds a closer hit, exactly like the triangle test does.
    pub fn intersect_custom(&self, ray: &mut Ray, mut hit_prim: impl FnMut(&mut Ray, u32)) -> u32 {
        let mut stack: ArrayVec<NodeIdx, TRAVERSAL_STACK_DEPTH> = ArrayVec::new();
        let mut node = self.root();
        let mut steps = 0;
        loop {
            steps += 1;
            if node.is_leaf() {
                for i in 0..node.tri_count {
                    let prim = self.prim_idx[(node.left_first + i) as usize];
                    hit_prim(ray, prim);
                }
                match stack.pop() {
                    Some(idx) => node = &self.nodes[idx],
                    None => break,
                }
                continue;
            }
            let mut near = node.left_child();
            let mut far = near + 1;
            let mut dist_near = {
                let n = &self.nodes[near];
                slab_test(ray, &n.aabb_min, &n.aabb_max, ray.hit.t)
            };
            let mut dist_far = {
                let n = &self.nodes[far];
                slab_test(ray, &n.aabb_min, &n.aabb_max, ray.hit.t)
            };
            if dist_near > dist_far {
                std::mem::swap(&mut dist_near, &mut dist_far);
                std::mem::swap(&mut near, &mut far);
            }
            if dist_near == BVH_FAR {
                // missed both children
                match stack.pop() {
                    Some(idx) => node = &self.nodes[idx],
                    None => break,
                }
            } else {
                node = &self.nodes[near];
                if dist_far != BVH_FAR {
                    debug_assert!(!stack.is_full(), "traversal stack overflow");
                    stack.push(far);
                }
            }
        }
        steps
    }

    /// Any-hit query: true as soon as one primitive blocks the ray closer
    /// than `ray.hit.t`. Descent order does not matter for correctness, so
    /// the near/far ordering is kept only to find the blocker early.
    pub fn is_occluded(&self, ray: &Ray, verts: VertexSlice) -> bool {
        self.occluded_custom(ray, |ray, prim| {
            let tri = verts.triangle(prim);
            triangle_occludes(ray, &tri[0], &tri[1], &tri[2])
        })
    }

    /// Any-hit with a caller-supplied predicate, for trees built over
    /// AABBs.
    pub fn occluded_custom(&self, ray: &Ray, mut blocks: impl FnMut(&Ray, u32) -> bool) -> bool {
        let mut stack: ArrayVec<NodeIdx, TRAVERSAL_STACK_DEPTH> = ArrayVec::new();
        let mut node = self.root();
        loop {
            if node.is_leaf() {
                for i in 0..node.tri_count {
                    let prim = self.prim_idx[(node.left_first + i) as usize];
                    if blocks(ray, prim) {
                        return true;
                    }
                }
                match stack.pop() {
                    Some(idx) => node = &self.nodes[idx],
                    None => break,
                }
                continue;
            }
            let mut near = node.left_child();
            let mut far = near + 1;
            let mut dist_near = {
                let n = &self.nodes[near];
                slab_test(ray, &n.aabb_min, &n.aabb_max, ray.hit.t)
            };
            let mut dist_far = {
                let n = &self.nodes[far];
                slab_test(ray, &n.aabb_min, &n.aabb_max, ray.hit.t)
            };
            if dist_near > dist_far {
                std::mem::swap(&mut dist_near, &mut dist_far);
                std::mem::swap(&mut near, &mut far);
            }
            if dist_near == BVH_FAR {
                match stack.pop() {
                    Some(idx) => node = &self.nodes[idx],
                    None => break,
                }
            } else {
                node = &self.nodes[near];
                if dist_far != BVH_FAR {
                    debug_assert!(!stack.is_full(), "traversal stack overflow");
                    stack.push(far);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert2::assert;

    use crate::bvh::test_geometry::{cube, one_triangle, triangle_grid, two_planes};
    use crate::geometry::{WorldPoint, WorldVector};

    #[test]
    fn single_triangle_hit() {
        let verts = one_triangle();
        let bvh = Bvh::from_verts(&verts[..]);
        let mut ray = Ray::new(
            WorldPoint::new(0.25, 0.25, -1.0),
            WorldVector::new(0.0, 0.0, 1.0),
        );
        bvh.intersect(&mut ray, VertexSlice::from(&verts[..]));
        assert!(ray.hit.t == 1.0);
        assert!((ray.hit.u - 0.25).abs() < 1e-6);
        assert!((ray.hit.v - 0.25).abs() < 1e-6);
        assert!(ray.hit.prim == 0);
    }

    #[test]
    fn two_planes_reports_front_hit() {
        let verts = two_planes();
        let bvh = Bvh::from_verts(&verts[..]);
        let mut ray = Ray::new(
            WorldPoint::new(0.25, 0.25, -1.0),
            WorldVector::new(0.0, 0.0, 1.0),
        );
        bvh.intersect(&mut ray, VertexSlice::from(&verts[..]));
        assert!(ray.hit.t == 1.0);
        assert!(ray.hit.prim == 0);
    }

    #[test]
    fn axis_aligned_miss_leaves_ray_unchanged() {
        let verts = cube(-0.5, 0.5);
        let bvh = Bvh::from_verts(&verts[..]);
        let mut ray = Ray::new(
            WorldPoint::new(10.0, 10.0, 10.0),
            WorldVector::new(1.0, 0.0, 0.0),
        );
        bvh.intersect(&mut ray, VertexSlice::from(&verts[..]));
        assert!(ray.hit.t == BVH_FAR);
        assert!(ray.hit.prim == u32::MAX);
    }

    #[test]
    fn closest_hit_matches_brute_force() {
        let verts = triangle_grid(6);
        let slice = VertexSlice::from(&verts[..]);
        let bvh = Bvh::from_verts(&verts[..]);
        for i in 0..32 {
            // a fan of diagonal rays across the grid
            let f = i as f32 / 32.0;
            let origin = WorldPoint::new(6.0 * f, 0.5, -1.0);
            let direction = WorldVector::new(0.2 - 0.4 * f, 0.3, 1.0);

            let mut bvh_ray = Ray::new(origin, direction);
            bvh.intersect(&mut bvh_ray, slice);

            let mut brute_ray = Ray::new(origin, direction);
            for prim in 0..slice.tri_count() as u32 {
                let tri = slice.triangle(prim);
                intersect_triangle(&mut brute_ray, &tri[0], &tri[1], &tri[2], prim);
            }

            assert!(bvh_ray.hit.t == brute_ray.hit.t);
            assert!(bvh_ray.hit.prim == brute_ray.hit.prim);
        }
    }

    #[test]
    fn occlusion_agrees_with_intersection() {
        let verts = triangle_grid(5);
        let slice = VertexSlice::from(&verts[..]);
        let bvh = Bvh::from_verts(&verts[..]);
        for i in 0..25 {
            let origin = WorldPoint::new(
                (i % 5) as f32 + 0.3,
                (i / 5) as f32 + 0.3,
                -1.0,
            );
            let direction = WorldVector::new(0.0, 0.1, 1.0);
            let mut ray = Ray::new(origin, direction);
            bvh.intersect(&mut ray, slice);
            let occluded = bvh.is_occluded(&Ray::new(origin, direction), slice);
            assert!(occluded == (ray.hit.t < BVH_FAR));
        }
    }

    #[test]
    fn shadow_ray_with_epsilon_does_not_self_intersect() {
        let verts = one_triangle();
        let slice = VertexSlice::from(&verts[..]);
        let bvh = Bvh::from_verts(&verts[..]);

        // primary hit on the triangle
        let mut primary = Ray::new(
            WorldPoint::new(0.25, 0.25, -1.0),
            WorldVector::new(0.0, 0.0, 1.0),
        );
        bvh.intersect(&mut primary, slice);
        let hit_point = primary.point_at(primary.hit.t);

        // shadow ray toward a light above the surface
        let light = WorldPoint::new(0.25, 0.25, -3.0);
        let to_light = (light - hit_point).normalize();
        let eps = 1e-4;
        let shadow = Ray::with_max_t(
            hit_point + to_light * eps,
            to_light,
            (light - hit_point).norm() - 2.0 * eps,
        );
        assert!(!bvh.is_occluded(&shadow, slice));
    }

    #[test]
    fn cube_is_hit_from_every_side() {
        let verts = cube(-1.0, 1.0);
        let slice = VertexSlice::from(&verts[..]);
        let bvh = Bvh::from_verts(&verts[..]);
        let directions = [
            WorldVector::new(1.0, 0.0, 0.0),
            WorldVector::new(-1.0, 0.0, 0.0),
            WorldVector::new(0.0, 1.0, 0.0),
            WorldVector::new(0.0, -1.0, 0.0),
            WorldVector::new(0.0, 0.0, 1.0),
            WorldVector::new(0.0, 0.0, -1.0),
        ];
        for d in directions {
            let mut ray = Ray::new(WorldPoint::from(-d * 5.0), d);
            bvh.intersect(&mut ray, slice);
            assert!((ray.hit.t - 4.0).abs() < 1e-5, "direction {d:?}");
        }
    }

    #[test]
    fn custom_intersection_over_aabbs() {
        let boxes = [
            crate::geometry::WorldBox::new(
                WorldPoint::new(0.0, 0.0, 0.0),
                WorldPoint::new(1.0, 1.0, 1.0),
            ),
            crate::geometry::WorldBox::new(
                WorldPoint::new(0.0, 0.0, 4.0),
                WorldPoint::new(1.0, 1.0, 5.0),
            ),
        ];
        let mut bvh = Bvh::new();
        bvh.build_over_aabbs(boxes.len(), |i| boxes[i as usize]);

        let mut ray = Ray::new(
            WorldPoint::new(0.5, 0.5, -1.0),
            WorldVector::new(0.0, 0.0, 1.0),
        );
        bvh.intersect_custom(&mut ray, |ray, prim| {
            let b = &boxes[prim as usize];
            let t = slab_test(ray, &b.min, &b.max, ray.hit.t);
            if t < ray.hit.t && t >= 0.0 {
                ray.hit.t = t;
                ray.hit.prim = prim;
            }
        });
        assert!(ray.hit.t == 1.0);
        assert!(ray.hit.prim == 0);
    }
}
