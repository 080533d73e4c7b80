//! 128-byte 4-wide nodes for CPU traversal, after "Faster Incoherent Ray
//! Traversal Using 8-Wide AVX Instructions", Áfra, 2013. All four child
//! slabs are tested with 4-lane arithmetic; triangles are stored by value
//! in the Baldwin–Weber transformed form, reordered depth-first next to
//! their leaves.

use arrayvec::ArrayVec;
use assert2::debug_assert;
use wide::{f32x4, CmpGe as _, CmpLt as _};

use crate::geometry::{PrecomputedTriangle, Ray, VertexSlice, BVH_FAR};

use super::wide::Bvh4;
use super::Block;

/// Slab sentinel for empty child slots: an inverted box that no ray can
/// enter.
const EMPTY_MIN: f32 = 1e30;
const EMPTY_MAX: f32 = 1.00001e30;

const STACK_DEPTH: usize = 256;

#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct Bvh4CpuNode {
    pub xmin4: [f32; 4],
    pub ymin4: [f32; 4],
    pub zmin4: [f32; 4],
    pub xmax4: [f32; 4],
    pub ymax4: [f32; 4],
    pub zmax4: [f32; 4],
    /// Per lane: interior, index of the child node; leaf, offset of the
    /// first triangle block.
    pub child_first: [u32; 4],
    pub tri_count: [u32; 4],
}

impl Default for Bvh4CpuNode {
    fn default() -> Self {
        Bvh4CpuNode {
            xmin4: [EMPTY_MIN; 4],
            ymin4: [EMPTY_MIN; 4],
            zmin4: [EMPTY_MIN; 4],
            xmax4: [EMPTY_MAX; 4],
            ymax4: [EMPTY_MAX; 4],
            zmax4: [EMPTY_MAX; 4],
            child_first: [0; 4],
            tri_count: [0; 4],
        }
    }
}

/// Self-contained 4-wide CPU tree: nodes plus transformed triangles, four
/// 16-byte blocks per triangle. Traversal needs no other data.
pub struct Bvh4Cpu {
    pub nodes: Vec<Bvh4CpuNode>,
    pub tris: Vec<Block>,
}

impl Bvh4Cpu {
    pub fn build<'v>(verts: impl Into<VertexSlice<'v>>) -> Bvh4Cpu {
        let verts = verts.into();
        let wide = Bvh4::build(verts);
        Bvh4Cpu::from_bvh4(&wide, verts)
    }

    pub fn from_bvh4(source: &Bvh4, verts: VertexSlice) -> Bvh4Cpu {
        let mut nodes: Vec<Bvh4CpuNode> = Vec::with_capacity(source.nodes.len());
        // (dst node, lane) pairs whose child index is pending, plus the
        // source index of that child
        let mut stack: Vec<(usize, usize, usize)> = Vec::new();
        let mut src_idx = 0usize;
        if source.nodes[0].is_leaf() {
            // degenerate single-leaf tree: wrap it in one node
            let root = &source.nodes[0];
            let mut node = Bvh4CpuNode::default();
            node.xmin4[0] = root.aabb_min.x;
            node.ymin4[0] = root.aabb_min.y;
            node.zmin4[0] = root.aabb_min.z;
            node.xmax4[0] = root.aabb_max.x;
            node.ymax4[0] = root.aabb_max.y;
            node.zmax4[0] = root.aabb_max.z;
            node.child_first[0] = root.first_tri;
            node.tri_count[0] = root.tri_count;
            nodes.push(node);
        } else {
            loop {
                let orig = &source.nodes[src_idx];
                let idx = nodes.len();
                nodes.push(Bvh4CpuNode::default());
                let mut lane = 0;
                for i in 0..orig.child_count as usize {
                    let child = &source.nodes[orig.child[i] as usize];
                    nodes[idx].xmin4[lane] = child.aabb_min.x;
                    nodes[idx].ymin4[lane] = child.aabb_min.y;
                    nodes[idx].zmin4[lane] = child.aabb_min.z;
                    nodes[idx].xmax4[lane] = child.aabb_max.x;
                    nodes[idx].ymax4[lane] = child.aabb_max.y;
                    nodes[idx].zmax4[lane] = child.aabb_max.z;
                    if child.is_leaf() {
                        nodes[idx].child_first[lane] = child.first_tri;
                        nodes[idx].tri_count[lane] = child.tri_count;
                    } else {
                        stack.push((idx, lane, orig.child[i] as usize));
                    }
                    lane += 1;
                }
                match stack.pop() {
                    Some((pending, pending_lane, src)) => {
                        nodes[pending].child_first[pending_lane] = nodes.len() as u32;
                        src_idx = src;
                    }
                    None => break,
                }
            }
        }

        // second pass: pull the triangles in by value, depth-first, and
        // retarget leaf lanes at their block offsets
        let prim_idx = source.source().prim_indices();
        let mut tris: Vec<Block> = Vec::with_capacity(prim_idx.len() * 4);
        let mut walk: Vec<usize> = vec![0];
        while let Some(node_idx) = walk.pop() {
            for lane in 0..4 {
                let (first, count) = {
                    let node = &nodes[node_idx];
                    (node.child_first[lane], node.tri_count[lane])
                };
                if count + first == 0 {
                    continue; // empty slot
                }
                if count == 0 {
                    walk.push(first as usize);
                    continue;
                }
                nodes[node_idx].child_first[lane] = tris.len() as u32;
                for j in 0..count {
                    let prim = prim_idx[(first + j) as usize];
                    let tri = verts.triangle(prim);
                    let pre = PrecomputedTriangle::new(&tri[0], &tri[1], &tri[2], prim);
                    for row in pre.rows {
                        tris.push(row);
                    }
                }
            }
        }
        Bvh4Cpu { nodes, tris }
    }

    fn tri_at(&self, block: u32, j: u32) -> PrecomputedTriangle {
        let base = (block + j * 4) as usize;
        PrecomputedTriangle {
            rows: [
                self.tris[base],
                self.tris[base + 1],
                self.tris[base + 2],
                self.tris[base + 3],
            ],
        }
    }

    /// Per-node hit mask and entry distances for all four child slabs.
    fn slab_test4(node: &Bvh4CpuNode, ray: &Ray) -> (u32, [f32; 4]) {
        let ox = f32x4::splat(ray.origin.x);
        let oy = f32x4::splat(ray.origin.y);
        let oz = f32x4::splat(ray.origin.z);
        let rdx = f32x4::splat(ray.inv_direction.x);
        let rdy = f32x4::splat(ray.inv_direction.y);
        let rdz = f32x4::splat(ray.inv_direction.z);
        let tx1 = (f32x4::from(node.xmin4) - ox) * rdx;
        let tx2 = (f32x4::from(node.xmax4) - ox) * rdx;
        let ty1 = (f32x4::from(node.ymin4) - oy) * rdy;
        let ty2 = (f32x4::from(node.ymax4) - oy) * rdy;
        let tz1 = (f32x4::from(node.zmin4) - oz) * rdz;
        let tz2 = (f32x4::from(node.zmax4) - oz) * rdz;
        let tmin = tx1
            .fast_min(tx2)
            .fast_max(ty1.fast_min(ty2))
            .fast_max(tz1.fast_min(tz2));
        let tmax = tx1
            .fast_max(tx2)
            .fast_min(ty1.fast_max(ty2))
            .fast_min(tz1.fast_max(tz2));
        let hit = tmax.cmp_ge(tmin) & tmin.cmp_lt(f32x4::splat(ray.hit.t)) & tmax.cmp_ge(f32x4::ZERO);
        (hit.move_mask() as u32, tmin.to_array())
    }

    /// Packs each lane index into the low two mantissa bits of its entry
    /// distance, so one float sort network orders the lanes front to back.
    fn lane_packed_distances(hit_bits: u32, tmin: &[f32; 4]) -> [f32; 4] {
        std::array::from_fn(|lane| {
            let d = if hit_bits & (1 << lane) != 0 {
                tmin[lane]
            } else {
                BVH_FAR
            };
            f32::from_bits((d.to_bits() & !3) | lane as u32)
        })
    }

    /// Five-comparison network sorting four floats into descending order.
    fn sort4_descending(d: &mut [f32; 4]) {
        if d[0] < d[2] {
            d.swap(0, 2);
        }
        if d[1] < d[3] {
            d.swap(1, 3);
        }
        if d[0] < d[1] {
            d.swap(0, 1);
        }
        if d[2] < d[3] {
            d.swap(2, 3);
        }
        if d[1] < d[2] {
            d.swap(1, 2);
        }
    }

    /// Closest-hit traversal. Hit-count specific paths: one hit continues
    /// directly, two hits order by comparison, three or four hits sort the
    /// lane-packed distances.
    pub fn intersect(&self, ray: &mut Ray) -> u32 {
        let mut stack: ArrayVec<u32, STACK_DEPTH> = ArrayVec::new();
        let mut node_idx = 0u32;
        let mut steps = 0;
        loop {
            steps += 1;
            let node = &self.nodes[node_idx as usize];
            let (hit_bits, tmin) = Bvh4Cpu::slab_test4(node, ray);
            let hits = hit_bits.count_ones();
            match hits {
                0 => match stack.pop() {
                    Some(idx) => node_idx = idx,
                    None => break,
                },
                1 => {
                    let lane = hit_bits.trailing_zeros() as usize;
                    if node.tri_count[lane] == 0 {
                        node_idx = node.child_first[lane];
                    } else {
                        for j in 0..node.tri_count[lane] {
                            self.tri_at(node.child_first[lane], j).intersect(ray);
                        }
                        match stack.pop() {
                            Some(idx) => node_idx = idx,
                            None => break,
                        }
                    }
                }
                2 => {
                    let lane0 = hit_bits.trailing_zeros() as usize;
                    let lane1 = (hit_bits & (hit_bits - 1)).trailing_zeros() as usize;
                    let (near, far) = if tmin[lane1] < tmin[lane0] {
                        (lane1, lane0)
                    } else {
                        (lane0, lane1)
                    };
                    let mut next = 0u32;
                    if node.tri_count[near] == 0 {
                        next = node.child_first[near];
                    } else {
                        for j in 0..node.tri_count[near] {
                            self.tri_at(node.child_first[near], j).intersect(ray);
                        }
                    }
                    if node.tri_count[far] == 0 {
                        if next != 0 {
                            debug_assert!(!stack.is_full(), "traversal stack overflow");
                            stack.push(next);
                        }
                        next = node.child_first[far];
                    } else {
                        for j in 0..node.tri_count[far] {
                            self.tri_at(node.child_first[far], j).intersect(ray);
                        }
                    }
                    if next != 0 {
                        node_idx = next;
                    } else {
                        match stack.pop() {
                            Some(idx) => node_idx = idx,
                            None => break,
                        }
                    }
                }
                _ => {
                    let mut d = Bvh4Cpu::lane_packed_distances(hit_bits, &tmin);
                    Bvh4Cpu::sort4_descending(&mut d);
                    // with three hits, entry 0 is the missing lane
                    let start = if hits == 3 { 1 } else { 0 };
                    let mut next = 0u32;
                    for entry in &d[start..] {
                        let lane = (entry.to_bits() & 3) as usize;
                        if node.tri_count[lane] + node.child_first[lane] == 0 {
                            continue; // empty lane; cannot be hit
                        }
                        if node.tri_count[lane] == 0 {
                            if next != 0 {
                                debug_assert!(!stack.is_full(), "traversal stack overflow");
                                stack.push(next);
                            }
                            next = node.child_first[lane];
                            continue;
                        }
                        for j in 0..node.tri_count[lane] {
                            self.tri_at(node.child_first[lane], j).intersect(ray);
                        }
                    }
                    if next != 0 {
                        node_idx = next;
                    } else {
                        match stack.pop() {
                            Some(idx) => node_idx = idx,
                            None => break,
                        }
                    }
                }
            }
        }
        steps
    }

    /// Any-hit query; visits hit lanes in slab order without sorting.
    pub fn is_occluded(&self, ray: &Ray) -> bool {
        let mut stack: ArrayVec<u32, STACK_DEPTH> = ArrayVec::new();
        let mut node_idx = 0u32;
        loop {
            let node = &self.nodes[node_idx as usize];
            let (hit_bits, _) = Bvh4Cpu::slab_test4(node, ray);
            for lane in crate::util::bit_iter(hit_bits as u64) {
                if node.tri_count[lane] == 0 {
                    debug_assert!(!stack.is_full(), "traversal stack overflow");
                    stack.push(node.child_first[lane]);
                } else {
                    for j in 0..node.tri_count[lane] {
                        if self.tri_at(node.child_first[lane], j).occludes(ray) {
                            return true;
                        }
                    }
                }
            }
            match stack.pop() {
                Some(idx) => node_idx = idx,
                None => break,
            }
        }
        false
    }
}
