//! 4- and 8-way intermediate trees, built from the canonical tree by
//! greedy child adoption: the interior child with the largest surface area
//! is repeatedly replaced by its own children until the node arity is
//! filled. Wide nodes cut traversal depth and are the input format for
//! the compressed GPU layouts.

use std::borrow::Cow;

use assert2::assert;
use simba::simd::SimdValue as _;

use crate::bvh::Bvh;
use crate::geometry::{
    intersect_triangle, slab_test, Ray, RayIntersectionExt as _, VertexSlice, WorldBox,
    WorldBox8, WorldPoint, BVH_FAR,
};

use super::SourceBvh;

#[derive(Copy, Clone, Debug)]
pub struct WideNode<const K: usize> {
    pub aabb_min: WorldPoint,
    pub first_tri: u32,
    pub aabb_max: WorldPoint,
    pub tri_count: u32,
    /// Child node indices; `0` marks an empty slot (the root is never a
    /// child).
    pub child: [u32; K],
    pub child_count: u32,
}

impl<const K: usize> Default for WideNode<K> {
    fn default() -> Self {
        WideNode {
            aabb_min: WorldPoint::origin(),
            first_tri: 0,
            aabb_max: WorldPoint::origin(),
            tri_count: 0,
            child: [0; K],
            child_count: 0,
        }
    }
}

impl<const K: usize> WideNode<K> {
    pub fn is_leaf(&self) -> bool {
        self.tri_count > 0
    }

    pub fn aabb(&self) -> WorldBox {
        WorldBox::new(self.aabb_min, self.aabb_max)
    }
}

/// K-wide tree sharing the source tree's index array. Node indices match
/// the source node pool, so collapsed nodes leave holes.
pub struct WideBvh<'a, const K: usize> {
    pub nodes: Vec<WideNode<K>>,
    pub(crate) source: SourceBvh<'a>,
}

pub type Bvh4<'a> = WideBvh<'a, 4>;
pub type Bvh8<'a> = WideBvh<'a, 8>;

impl<const K: usize> WideBvh<'_, K> {
    pub fn build<'v>(verts: impl Into<VertexSlice<'v>>) -> WideBvh<'static, K> {
        let mut bvh = Bvh::new();
        bvh.build(verts);
        WideBvh::convert(Cow::Owned(bvh))
    }

    pub fn from_bvh(bvh: &Bvh) -> WideBvh<'_, K> {
        WideBvh::convert(Cow::Borrowed(bvh))
    }

    fn convert(source: SourceBvh<'_>) -> WideBvh<'_, K> {
        assert!(K >= 4, "adoption needs room for at least four children");
        // start as a 1:1 copy of the 2-wide topology
        let mut nodes: Vec<WideNode<K>> = vec![WideNode::default(); source.nodes().len()];
        for (i, orig) in source.nodes().iter().enumerate() {
            if i == 1 {
                continue; // reserved pad
            }
            let node = &mut nodes[i];
            node.aabb_min = orig.aabb_min;
            node.aabb_max = orig.aabb_max;
            if orig.is_leaf() {
                node.tri_count = orig.tri_count;
                node.first_tri = orig.left_first;
            } else {
                node.child[0] = orig.left_first;
                node.child[1] = orig.left_first + 1;
                node.child_count = 2;
            }
        }
        // collapse: adopt grandchildren through the largest interior child
        let mut stack = vec![0usize];
        while let Some(node_idx) = stack.pop() {
            loop {
                let node = &nodes[node_idx];
                if node.child_count as usize >= K {
                    break;
                }
                let mut best_child = None;
                let mut best_area = 0.0;
                for i in 0..node.child_count as usize {
                    let child = &nodes[node.child[i] as usize];
                    if !child.is_leaf()
                        && node.child_count as usize - 1 + child.child_count as usize <= K
                    {
                        let area = child.aabb().half_area();
                        if area > best_area {
                            best_child = Some(i);
                            best_area = area;
                        }
                    }
                }
                let Some(best) = best_child else { break };
                let child = nodes[nodes[node_idx].child[best] as usize];
                let node = &mut nodes[node_idx];
                node.child[best] = child.child[0];
                for i in 1..child.child_count as usize {
                    let slot = node.child_count as usize;
                    node.child[slot] = child.child[i];
                    node.child_count += 1;
                }
            }
            for i in 0..nodes[node_idx].child_count as usize {
                let child_idx = nodes[node_idx].child[i] as usize;
                if !nodes[child_idx].is_leaf() {
                    stack.push(child_idx);
                }
            }
        }
        WideBvh { nodes, source }
    }

    pub fn source(&self) -> &Bvh {
        &self.source
    }

    /// Closest-hit traversal: children are tested individually and pushed
    /// unordered; correctness comes from testing against the shrinking
    /// `ray.hit.t`.
    pub fn intersect(&self, ray: &mut Ray, verts: VertexSlice) -> u32 {
        let prim_idx = self.source.prim_indices();
        let mut stack: Vec<u32> = Vec::with_capacity(64);
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
            } else {
                for i in 0..node.child_count as usize {
                    let child = &self.nodes[node.child[i] as usize];
                    let dist = slab_test(ray, &child.aabb_min, &child.aabb_max, ray.hit.t);
                    if dist < BVH_FAR {
                        stack.push(node.child[i]);
                    }
                }
            }
            match stack.pop() {
                Some(idx) => node = &self.nodes[idx as usize],
                None => break,
            }
        }
        steps
    }

    /// CWBVH leaves hold at most `max_prims` primitives; leaves above that
    /// are split in place into up to K sub-leaves, recursing in the rare
    /// case one round is not enough.
    pub(crate) fn split_wide_leaf(&mut self, node_idx: usize, max_prims: u32) {
        let flip = self.source.frag_min_flipped;
        let node = self.nodes[node_idx];
        if node.tri_count <= max_prims {
            return; // also covers interior nodes
        }
        // move all primitives into a first child, then share right
        let first_child_idx = self.nodes.len();
        self.nodes.push(WideNode {
            aabb_min: node.aabb_min,
            aabb_max: node.aabb_max,
            first_tri: node.first_tri,
            tri_count: node.tri_count,
            ..WideNode::default()
        });
        self.nodes[node_idx].child[0] = first_child_idx as u32;
        let mut next_child = 1usize;
        while self.nodes[first_child_idx].tri_count > max_prims && next_child < K {
            let idx = self.nodes.len();
            self.nodes[first_child_idx].tri_count -= max_prims;
            let first_tri =
                self.nodes[first_child_idx].first_tri + self.nodes[first_child_idx].tri_count;
            self.nodes.push(WideNode {
                aabb_min: node.aabb_min,
                aabb_max: node.aabb_max,
                first_tri,
                tri_count: max_prims,
                ..WideNode::default()
            });
            self.nodes[node_idx].child[next_child] = idx as u32;
            next_child += 1;
        }
        self.nodes[node_idx].child_count = next_child as u32;
        self.nodes[node_idx].tri_count = 0;
        // tighten the sub-leaf bounds where the fragments allow it
        if self.source.refittable {
            for i in 0..next_child {
                let child_idx = self.nodes[node_idx].child[i] as usize;
                let child = self.nodes[child_idx];
                let mut aabb = WorldBox::EMPTY;
                for j in 0..child.tri_count {
                    let fi = self.source.prim_indices()[(child.first_tri + j) as usize];
                    aabb.grow_aabb(&self.source.fragments()[fi as usize].bounds(flip));
                }
                self.nodes[child_idx].aabb_min = aabb.min;
                self.nodes[child_idx].aabb_max = aabb.max;
            }
        }
        // should be rare: only when tri_count > K * max_prims
        if self.nodes[first_child_idx].tri_count > max_prims {
            self.split_wide_leaf(first_child_idx, max_prims);
        }
    }
}

impl Bvh8<'_> {
    /// Closest-hit traversal testing all eight children at once with an
    /// 8-lane slab test.
    pub fn intersect_simd(&self, ray: &mut Ray, verts: VertexSlice) -> u32 {
        let prim_idx = self.source.prim_indices();
        let mut stack: Vec<u32> = Vec::with_capacity(64);
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
            } else {
                // gather the children's bounds into one 8-lane box; empty
                // slots keep an inverted box and never pass the slab test
                let mut min = [[BVH_FAR; 8]; 3];
                let mut max = [[-BVH_FAR; 8]; 3];
                for i in 0..node.child_count as usize {
                    let child = &self.nodes[node.child[i] as usize];
                    for a in 0..3 {
                        min[a][i] = child.aabb_min[a];
                        max[a][i] = child.aabb_max[a];
                    }
                }
                let pack = WorldBox8 {
                    min: nalgebra::Point3::new(
                        min[0].into(),
                        min[1].into(),
                        min[2].into(),
                    ),
                    max: nalgebra::Point3::new(
                        max[0].into(),
                        max[1].into(),
                        max[2].into(),
                    ),
                };
                let (tmin, tmax) = pack.intersect(ray);
                for i in 0..node.child_count as usize {
                    let (lo, hi) = (tmin.extract(i), tmax.extract(i));
                    if hi >= lo && lo < ray.hit.t && hi >= 0.0 {
                        stack.push(node.child[i]);
                    }
                }
            }
            match stack.pop() {
                Some(idx) => node = &self.nodes[idx as usize],
                None => break,
            }
        }
        steps
    }
}
