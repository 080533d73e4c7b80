//! 64-byte 2-wide layout with the children's bounds interleaved per axis:
//! `xxxx = (lmin.x, lmax.x, rmin.x, rmax.x)` and likewise for y and z, so
//! one 4-lane multiply per axis covers both children's slabs.

use std::borrow::Cow;

use arrayvec::ArrayVec;
use assert2::debug_assert;
use wide::f32x4;

use crate::bvh::{Bvh, NodeIdx, TRAVERSAL_STACK_DEPTH};
use crate::geometry::{intersect_triangle, triangle_occludes, Ray, VertexSlice, BVH_FAR};

use super::SourceBvh;

#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[repr(C)]
pub struct SoaNode {
    pub xxxx: [f32; 4],
    pub yyyy: [f32; 4],
    pub zzzz: [f32; 4],
    pub left: u32,
    pub right: u32,
    pub tri_count: u32,
    pub first_tri: u32,
}

impl SoaNode {
    pub fn is_leaf(&self) -> bool {
        self.tri_count > 0
    }
}

pub struct SoaBvh<'a> {
    pub nodes: Vec<SoaNode>,
    source: SourceBvh<'a>,
}

/// Swap lanes pairwise: `(a, b, c, d)` to `(b, a, d, c)`. Pairs the min
/// and max slab distances of each child for the branch-free ordering.
fn swap_pairs(v: f32x4) -> f32x4 {
    let a = v.to_array();
    f32x4::from([a[1], a[0], a[3], a[2]])
}

impl SoaBvh<'_> {
    pub fn build<'v>(verts: impl Into<VertexSlice<'v>>) -> SoaBvh<'static> {
        let mut bvh = Bvh::new();
        bvh.build(verts);
        SoaBvh::convert(Cow::Owned(bvh))
    }

    pub fn from_bvh(bvh: &Bvh) -> SoaBvh<'_> {
        SoaBvh::convert(Cow::Borrowed(bvh))
    }

    fn convert(source: SourceBvh<'_>) -> SoaBvh<'_> {
        let mut nodes: Vec<SoaNode> = Vec::with_capacity(source.nodes().len());
        let mut stack: Vec<(usize, NodeIdx)> = Vec::new();
        let mut node_idx = NodeIdx::from_usize(0);
        loop {
            let orig = source.node(node_idx);
            let idx = nodes.len();
            nodes.push(SoaNode::default());
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
                nodes[idx].xxxx = [
                    left.aabb_min.x,
                    left.aabb_max.x,
                    right.aabb_min.x,
                    right.aabb_max.x,
                ];
                nodes[idx].yyyy = [
                    left.aabb_min.y,
                    left.aabb_max.y,
                    right.aabb_min.y,
                    right.aabb_max.y,
                ];
                nodes[idx].zzzz = [
                    left.aabb_min.z,
                    left.aabb_max.z,
                    right.aabb_min.z,
                    right.aabb_max.z,
                ];
                nodes[idx].left = nodes.len() as u32;
                stack.push((idx, orig.left_child() + 1));
                node_idx = orig.left_child();
            }
        }
        SoaBvh { nodes, source }
    }

    pub fn source(&self) -> &Bvh {
        &self.source
    }

    /// Slab distances `(near, far)` of the left (lane 0) and right (lane 2)
    /// child of an interior node.
    fn child_distances(node: &SoaNode, ray: &Ray) -> (f32, f32, f32, f32) {
        let tx = (f32x4::from(node.xxxx) - f32x4::splat(ray.origin.x))
            * f32x4::splat(ray.inv_direction.x);
        let ty = (f32x4::from(node.yyyy) - f32x4::splat(ray.origin.y))
            * f32x4::splat(ray.inv_direction.y);
        let tz = (f32x4::from(node.zzzz) - f32x4::splat(ray.origin.z))
            * f32x4::splat(ray.inv_direction.z);
        // lanes (min, max) per child collapse into per-child intervals
        let tx_lo = tx.fast_min(swap_pairs(tx));
        let tx_hi = tx.fast_max(swap_pairs(tx));
        let ty_lo = ty.fast_min(swap_pairs(ty));
        let ty_hi = ty.fast_max(swap_pairs(ty));
        let tz_lo = tz.fast_min(swap_pairs(tz));
        let tz_hi = tz.fast_max(swap_pairs(tz));
        let tmin = tx_lo.fast_max(ty_lo).fast_max(tz_lo).to_array();
        let tmax = tx_hi.fast_min(ty_hi).fast_min(tz_hi).to_array();
        (tmin[0], tmax[0], tmin[2], tmax[2])
    }

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
            let (lmin, lmax, rmin, rmax) = SoaBvh::child_distances(node, ray);
            let mut dist1 = if lmax >= lmin && lmin < ray.hit.t && lmax >= 0.0 {
                lmin
            } else {
                BVH_FAR
            };
            let mut dist2 = if rmax >= rmin && rmin < ray.hit.t && rmax >= 0.0 {
                rmin
            } else {
                BVH_FAR
            };
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

    pub fn is_occluded(&self, ray: &Ray, verts: VertexSlice) -> bool {
        let prim_idx = self.source.prim_indices();
        let mut stack: ArrayVec<u32, TRAVERSAL_STACK_DEPTH> = ArrayVec::new();
        let mut node = &self.nodes[0];
        loop {
            if node.is_leaf() {
                for i in 0..node.tri_count {
                    let prim = prim_idx[(node.first_tri + i) as usize];
                    let tri = verts.triangle(prim);
                    if triangle_occludes(ray, &tri[0], &tri[1], &tri[2]) {
                        return true;
                    }
                }
                match stack.pop() {
                    Some(idx) => node = &self.nodes[idx as usize],
                    None => break,
                }
                continue;
            }
            let (lmin, lmax, rmin, rmax) = SoaBvh::child_distances(node, ray);
            let left_hit = lmax >= lmin && lmin < ray.hit.t && lmax >= 0.0;
            let right_hit = rmax >= rmin && rmin < ray.hit.t && rmax >= 0.0;
            match (left_hit, right_hit) {
                (true, true) => {
                    debug_assert!(!stack.is_full(), "traversal stack overflow");
                    stack.push(node.right);
                    node = &self.nodes[node.left as usize];
                }
                (true, false) => node = &self.nodes[node.left as usize],
                (false, true) => node = &self.nodes[node.right as usize],
                (false, false) => match stack.pop() {
                    Some(idx) => node = &self.nodes[idx as usize],
                    None => break,
                },
            }
        }
        false
    }
}
