use arrayvec::ArrayVec;
use assert2::debug_assert;

use crate::geometry::{FloatType, VertexSlice, WorldBox, WorldVector, BVH_FAR};

use super::{Bvh, BvhNode, Fragment, NodeIdx, BINS, BUILD_STACK_DEPTH, C_INT, C_TRAV};

/// Result of the binned plane search shared by the SAH builders.
pub(crate) struct ObjectSplit {
    pub cost: FloatType,
    pub axis: usize,
    pub pos: usize,
    pub left_box: WorldBox,
    pub right_box: WorldBox,
}

impl Bvh {
    /// Binned surface-area-heuristic build over a triangle soup. The
    /// reference builder: no SIMD, no spatial splits, decent trees.
    pub fn build<'a>(&mut self, verts: impl Into<VertexSlice<'a>>) {
        let verts = verts.into();
        let prim_count = verts.tri_count();
        self.prepare_build(prim_count, 0);
        let mut root_aabb = WorldBox::EMPTY;
        self.fragments.reserve(prim_count);
        for i in 0..prim_count {
            let frag = Fragment::from_triangle(&verts, i as u32);
            root_aabb.grow(&frag.bmin);
            root_aabb.grow(&frag.bmax);
            self.fragments.push(frag);
        }
        self.push_root(root_aabb, prim_count as u32);
        self.subdivide_binned();
    }

    /// Binned SAH build over caller-supplied bounds: `bounds_of(i)` is the
    /// AABB of primitive `i`. Leaves reference the primitive indices; what a
    /// primitive *is* stays with the caller (custom shapes, instances, ...).
    pub fn build_over_aabbs(&mut self, count: usize, mut bounds_of: impl FnMut(u32) -> WorldBox) {
        self.prepare_build(count, 0);
        let mut root_aabb = WorldBox::EMPTY;
        self.fragments.reserve(count);
        for i in 0..count as u32 {
            let aabb = bounds_of(i);
            root_aabb.grow_aabb(&aabb);
            self.fragments.push(Fragment::from_aabb(&aabb, i));
        }
        self.push_root(root_aabb, count as u32);
        self.subdivide_binned();
        self.over_aabbs = true;
    }

    /// Iterative top-down subdivision over the fragment array. Fragment
    /// mins must not be sign-flipped here.
    fn subdivide_binned(&mut self) {
        let min_dim = self.root().aabb().size() * 1e-7;
        let mut task: ArrayVec<NodeIdx, BUILD_STACK_DEPTH> = ArrayVec::new();
        let mut node_idx = NodeIdx::from_usize(0);
        loop {
            loop {
                let node = self.nodes[node_idx];
                let split = self.find_object_split(&node, &min_dim);
                let no_split_cost = node.tri_count as FloatType * C_INT;
                if split.cost >= no_split_cost {
                    break; // not splitting is better
                }
                let mid = self.partition_by_bin(&node, split.axis, split.pos);
                let left_count = mid - node.left_first as usize;
                let right_count = node.tri_count as usize - left_count;
                if left_count == 0 || right_count == 0 {
                    break; // numerical edge: binning and partition disagree
                }
                let left_idx = NodeIdx::from_usize(self.nodes.len());
                self.nodes.push(BvhNode::new_leaf(
                    split.left_box,
                    node.left_first,
                    left_count as u32,
                ));
                self.nodes.push(BvhNode::new_leaf(
                    split.right_box,
                    mid as u32,
                    right_count as u32,
                ));
                self.nodes[node_idx].left_first = left_idx.raw();
                self.nodes[node_idx].tri_count = 0;
                task.push(left_idx + 1);
                node_idx = left_idx;
            }
            match task.pop() {
                Some(idx) => node_idx = idx,
                None => break,
            }
        }
    }

    /// Bins fragment centroids on all three axes at once and sweeps the
    /// bin boundaries for the cheapest SAH plane. Ties resolve to the
    /// lowest axis, then the lowest plane.
    pub(crate) fn find_object_split(&self, node: &BvhNode, min_dim: &WorldVector) -> ObjectSplit {
        let mut bins = [[WorldBox::EMPTY; BINS]; 3];
        let mut counts = [[0u32; BINS]; 3];
        let extent = node.aabb().size();
        let rpd = extent.map(|e| BINS as FloatType / e);
        for i in 0..node.tri_count as usize {
            let fi = self.prim_idx[node.left_first as usize + i] as usize;
            let frag = &self.fragments[fi];
            for a in 0..3 {
                let bin = bin_of(frag.centroid_on(a), node.aabb_min[a], rpd[a]);
                bins[a][bin].grow(&frag.bmin);
                bins[a][bin].grow(&frag.bmax);
                counts[a][bin] += 1;
            }
        }
        let mut best = ObjectSplit {
            cost: BVH_FAR,
            axis: 0,
            pos: 0,
            left_box: WorldBox::EMPTY,
            right_box: WorldBox::EMPTY,
        };
        let r_sav = 1.0 / node.half_area();
        for a in 0..3 {
            if extent[a] <= min_dim[a] {
                continue; // degenerate axis
            }
            // prefix/suffix sweep over the bin bounds
            let mut l_box = [WorldBox::EMPTY; BINS - 1];
            let mut r_box = [WorldBox::EMPTY; BINS - 1];
            let mut area_n_l = [BVH_FAR; BINS - 1];
            let mut area_n_r = [BVH_FAR; BINS - 1];
            let mut l_acc = WorldBox::EMPTY;
            let mut r_acc = WorldBox::EMPTY;
            let mut l_n = 0;
            let mut r_n = 0;
            for i in 0..BINS - 1 {
                l_acc.grow_aabb(&bins[a][i]);
                r_acc.grow_aabb(&bins[a][BINS - 1 - i]);
                l_box[i] = l_acc;
                r_box[BINS - 2 - i] = r_acc;
                l_n += counts[a][i];
                r_n += counts[a][BINS - 1 - i];
                area_n_l[i] = if l_n == 0 {
                    BVH_FAR
                } else {
                    l_acc.half_area() * l_n as FloatType
                };
                area_n_r[BINS - 2 - i] = if r_n == 0 {
                    BVH_FAR
                } else {
                    r_acc.half_area() * r_n as FloatType
                };
            }
            for i in 0..BINS - 1 {
                let cost = C_TRAV + C_INT * r_sav * (area_n_l[i] + area_n_r[i]);
                if cost < best.cost {
                    best = ObjectSplit {
                        cost,
                        axis: a,
                        pos: i,
                        left_box: l_box[i],
                        right_box: r_box[i],
                    };
                }
            }
        }
        best
    }

    /// Classic two-pointer in-place partition of the node's index range:
    /// centroids binned at or below `pos` move left. Returns the index of
    /// the first right-side entry.
    pub(crate) fn partition_by_bin(&mut self, node: &BvhNode, axis: usize, pos: usize) -> usize {
        let extent = node.aabb_max[axis] - node.aabb_min[axis];
        let rpd = BINS as FloatType / extent;
        let n_min = node.aabb_min[axis];
        let mut src = node.left_first as usize;
        let mut j = src + node.tri_count as usize;
        for _ in 0..node.tri_count {
            let fi = self.prim_idx[src] as usize;
            let bin = bin_of(self.fragments[fi].centroid_on(axis), n_min, rpd);
            if bin <= pos {
                src += 1;
            } else {
                j -= 1;
                self.prim_idx.swap(src, j);
            }
        }
        debug_assert!(j == src);
        src
    }
}

/// Bin index of a centroid coordinate, clamped so FP drift at the node
/// boundary cannot escape the bin range.
pub(crate) fn bin_of(centroid: FloatType, node_min: FloatType, rpd: FloatType) -> usize {
    let bin = ((centroid - node_min) * rpd) as i32;
    bin.clamp(0, BINS as i32 - 1) as usize
}
