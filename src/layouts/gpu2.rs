//! 64-byte 2-wide layout storing both children's bounds inside the parent,
//! as used by Aila and Laine for GPU traversal: one fetch tests a ray
//! against both child boxes.

use std::borrow::Cow;

use arrayvec::ArrayVec;
use assert2::debug_assert;

use crate::bvh::{Bvh, NodeIdx, TRAVERSAL_STACK_DEPTH};
use crate::geometry::{intersect_triangle, Ray, VertexSlice, WorldPoint, BVH_FAR};

use super::SourceBvh;

#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[repr(C)]
pub struct GpuNode {
    pub lmin: [f32; 3],
    pub left: u32,
    pub lmax: [f32; 3],
    pub right: u32,
    pub rmin: [f32; 3],
    pub tri_count: u32,
    pub rmax: [f32; 3],
    pub first_tri: u32,
}

impl GpuNode {
    pub fn is_leaf(&self) -> bool {
        self.tri_count > 0
    }
}

pub struct GpuBvh<'a> {
    pub nodes: Vec<GpuNode>,
    source: SourceBvh<'a>,
}

impl GpuBvh<'_> {
    /// Builds a fresh canonical tree and converts it; the result owns its
    /// source.
    pub fn build<'v>(verts: impl Into<VertexSlice<'v>>) -> GpuBvh<'static> {
        let mut bvh = Bvh::new();
        bvh.build(verts);
        GpuBvh::convert(Cow::Owned(bvh))
    }

    /// Converts a borrowed tree; the source must outlive the result.
    pub fn from_bvh(bvh: &Bvh) -> GpuBvh<'_> {
        GpuBvh::convert(Cow::Borrowed(bvh))
    }

    fn convert(source: SourceBvh<'_>) -> GpuBvh<'_> {
        let mut nodes: Vec<GpuNode> = Vec::with_capacity(source.nodes().len());
        // (index of the converted node whose `right` is pending, source
        // index of that right child)
        let mut stack: Vec<(usize, NodeIdx)> = Vec::new();
        let mut node_idx = NodeIdx::from_usize(0);
        loop {
            let orig = source.node(node_idx);
            let idx = nodes.len();
            nodes.push(GpuNode::default());
            if orig.is_leaf() {
                nodes[idx].tri_count = orig.tri_count;
                nodes[idx].first_tri = orig.left_first;
                match stack.pop() {
                    Some((pending, src_right)) => {
                        nodes[pending].right = nodes.len() as u32;
                        node_idx = src_right;
                    }
                    None => break,
                }
            } else {
                let left = source.node(orig.left_child());
                let right = source.node(orig.left_child() + 1);
                nodes[idx].lmin = left.aabb_min.coords.into();
                nodes[idx].lmax = left.aabb_max.coords.into();
                nodes[idx].rmin = right.aabb_min.coords.into();
                nodes[idx].rmax = right.aabb_max.coords.into();
                nodes[idx].left = nodes.len() as u32;
                stack.push((idx, orig.left_child() + 1));
                node_idx = orig.left_child();
            }
        }
        GpuBvh { nodes, source }
    }

    pub fn source(&self) -> &Bvh {
        &self.source
    }

    /// Closest-hit traversal; equivalent to traversing the source tree.
    pub fn intersect(&self, ray: &mut Ray, verts: VertexSlice) -> u32 {
        let prim_idx = self.source.prim_indices();
        let mut stack: ArrayVec<u32, TRAVERSAL_STACK_DEPTH> = ArrayVec::new();
        let mut node = &self.nodes[0];
        let mut steps = 0;
        loop {
            steps += 1;
            if node.is_leaf() {
                for i in 0..node.tri_count {
                    let prim = prim_idx[(node.first_tri + i) as usize];
                    let tri = verts.triangle(prim);
                    intersect_triangle(ray, &tri[0], &tri[1], &tri[2], prim);
                }
                match stack.pop() {
                    Some(idx) => node = &self.nodes[idx as usize],
                    None => break,
                }
                continue;
            }
            // both child boxes live in this node: two slab tests, no fetch
            let lmin = WorldPoint::from(node.lmin);
            let lmax = WorldPoint::from(node.lmax);
            let rmin = WorldPoint::from(node.rmin);
            let rmax = WorldPoint::from(node.rmax);
            let mut dist1 = crate::geometry::slab_test(ray, &lmin, &lmax, ray.hit.t);
            let mut dist2 = crate::geometry::slab_test(ray, &rmin, &rmax, ray.hit.t);
            let mut near = node.left;
            let mut far = node.right;
            if dist1 > dist2 {
                std::mem::swap(&mut dist1, &mut dist2);
                std::mem::swap(&mut near, &mut far);
            }
            if dist1 == BVH_FAR {
                match stack.pop() {
                    Some(idx) => node = &self.nodes[idx as usize],
                    None => break,
                }
            } else {
                node = &self.nodes[near as usize];
                if dist2 != BVH_FAR {
                    debug_assert!(!stack.is_full(), "traversal stack overflow");
                    stack.push(far);
                }
            }
        }
        steps
    }

    /// Any-hit via the closest-hit kernel; this layout has no dedicated
    /// occlusion path.
    pub fn is_occluded(&self, ray: &Ray, verts: VertexSlice) -> bool {
        let mut shadow = *ray;
        self.intersect(&mut shadow, verts);
        shadow.hit.t < ray.hit.t
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert2::assert;

    use crate::bvh::test_geometry::{triangle_grid, two_planes};
    use crate::geometry::WorldVector;

    #[test]
    fn node_is_64_bytes() {
        assert!(std::mem::size_of::<GpuNode>() == 64);
    }

    #[test]
    fn matches_canonical_traversal() {
        let verts = triangle_grid(9);
        let slice = VertexSlice::from(&verts[..]);
        let bvh = Bvh::from_verts(&verts[..]);
        let gpu = GpuBvh::from_bvh(&bvh);

        for i in 0..81 {
            let origin = WorldPoint::new((i % 9) as f32 + 0.25, (i / 9) as f32 + 0.25, -1.0);
            let direction = WorldVector::new(0.03, -0.02, 1.0);
            let mut a = Ray::new(origin, direction);
            let mut b = a;
            bvh.intersect(&mut a, slice);
            gpu.intersect(&mut b, slice);
            assert!(a.hit.t == b.hit.t);
            assert!(a.hit.prim == b.hit.prim);
        }
    }

    #[test]
    fn owning_conversion_traverses() {
        let verts = two_planes();
        let slice = VertexSlice::from(&verts[..]);
        let gpu = GpuBvh::build(&verts[..]);
        let mut ray = Ray::new(
            WorldPoint::new(0.25, 0.25, -1.0),
            WorldVector::new(0.0, 0.0, 1.0),
        );
        gpu.intersect(&mut ray, slice);
        assert!(ray.hit.t == 1.0);
        assert!(ray.hit.prim == 0);
    }

    #[test]
    fn occlusion_fallback_matches() {
        let verts = triangle_grid(5);
        let slice = VertexSlice::from(&verts[..]);
        let bvh = Bvh::from_verts(&verts[..]);
        let gpu = GpuBvh::from_bvh(&bvh);
        for i in 0..25 {
            let origin = WorldPoint::new((i % 5) as f32 + 0.3, (i / 5) as f32 + 0.3, -1.0);
            let ray = Ray::new(origin, WorldVector::new(0.0, 0.0, 1.0));
            assert!(gpu.is_occluded(&ray, slice) == bvh.is_occluded(&ray, slice));
        }
    }
}
