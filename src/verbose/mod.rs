//! Parent-pointer tree representation. The canonical layout keeps sibling
//! pairs implicit and has no way up the tree; reorganizing operations
//! (insertion-based optimization, leaf merging) need explicit `left`,
//! `right` and `parent` links, so they run on this form and convert back.

mod optimize;

use assert2::assert;

use crate::bvh::{Bvh, BvhNode, Fragment, NodeIdx};
use crate::geometry::{FloatType, WorldBox, WorldPoint};

pub(crate) const ROOT_SENTINEL: u32 = u32::MAX;

#[derive(Copy, Clone, Debug)]
pub struct VerboseNode {
    pub aabb_min: WorldPoint,
    pub aabb_max: WorldPoint,
    pub left: u32,
    pub right: u32,
    pub parent: u32,
    pub first_tri: u32,
    pub tri_count: u32,
}

impl Default for VerboseNode {
    fn default() -> Self {
        VerboseNode {
            aabb_min: WorldPoint::origin(),
            aabb_max: WorldPoint::origin(),
            left: 0,
            right: 0,
            parent: 0,
            first_tri: 0,
            tri_count: 0,
        }
    }
}

impl VerboseNode {
    pub fn is_leaf(&self) -> bool {
        self.tri_count > 0
    }

    pub fn aabb(&self) -> WorldBox {
        WorldBox::new(self.aabb_min, self.aabb_max)
    }

    pub fn half_area(&self) -> FloatType {
        self.aabb().half_area()
    }
}

/// A [`Bvh`] unpacked into parent-pointer nodes, together with copies of
/// the index and fragment arrays so it can be reorganized independently of
/// its source.
#[derive(Clone, Debug)]
pub struct VerboseBvh {
    pub(crate) nodes: Vec<VerboseNode>,
    pub(crate) prim_idx: Vec<u32>,
    pub(crate) fragments: Vec<Fragment>,
    pub(crate) tri_count: u32,
    pub refittable: bool,
    pub frag_min_flipped: bool,
    pub may_have_holes: bool,
    pub over_aabbs: bool,
}

impl VerboseBvh {
    pub fn from_bvh(source: &Bvh) -> VerboseBvh {
        assert!(!source.nodes().is_empty(), "converting an unbuilt tree");
        let mut nodes = vec![VerboseNode::default(); source.nodes().len()];
        let mut stack: Vec<(NodeIdx, u32)> = Vec::new();
        let mut node_idx = NodeIdx::from_usize(0);
        let mut parent = ROOT_SENTINEL;
        loop {
            let orig = source.node(node_idx);
            let node = &mut nodes[node_idx.raw() as usize];
            node.aabb_min = orig.aabb_min;
            node.aabb_max = orig.aabb_max;
            node.tri_count = orig.tri_count;
            node.parent = parent;
            if orig.is_leaf() {
                node.first_tri = orig.left_first;
                match stack.pop() {
                    Some((idx, p)) => {
                        node_idx = idx;
                        parent = p;
                    }
                    None => break,
                }
            } else {
                node.left = orig.left_first;
                node.right = orig.left_first + 1;
                stack.push((orig.left_child() + 1, node_idx.raw()));
                parent = node_idx.raw();
                node_idx = orig.left_child();
            }
        }
        VerboseBvh {
            nodes,
            prim_idx: source.prim_indices().to_vec(),
            fragments: source.fragments().to_vec(),
            tri_count: source.prim_count_input(),
            refittable: source.refittable,
            frag_min_flipped: source.frag_min_flipped,
            may_have_holes: source.may_have_holes,
            over_aabbs: source.over_aabbs,
        }
    }

    /// Packs back into the canonical layout, renumbering nodes into the
    /// `2k, 2k+1` sibling scheme. Unused nodes do not survive the
    /// renumbering.
    pub fn to_bvh(&self) -> Bvh {
        // one pad node beyond the live count, and room for trees that were
        // compacted (no pad in the source pool)
        let mut nodes: Vec<BvhNode> = vec![BvhNode::default(); self.nodes.len() + 2];
        let mut src_idx = 0u32;
        let mut dst_idx = 0usize;
        let mut next_dst = 2usize;
        let mut stack: Vec<(u32, usize)> = Vec::new();
        loop {
            let orig = &self.nodes[src_idx as usize];
            nodes[dst_idx].aabb_min = orig.aabb_min;
            nodes[dst_idx].aabb_max = orig.aabb_max;
            if orig.is_leaf() {
                nodes[dst_idx].tri_count = orig.tri_count;
                nodes[dst_idx].left_first = orig.first_tri;
                match stack.pop() {
                    Some((s, d)) => {
                        src_idx = s;
                        dst_idx = d;
                    }
                    None => break,
                }
            } else {
                nodes[dst_idx].left_first = next_dst as u32;
                nodes[dst_idx].tri_count = 0;
                let (left_dst, right_dst) = (next_dst, next_dst + 1);
                next_dst += 2;
                stack.push((orig.right, right_dst));
                src_idx = orig.left;
                dst_idx = left_dst;
            }
        }
        nodes.truncate(next_dst.max(2));
        Bvh::from_parts(
            nodes,
            self.prim_idx.clone(),
            self.fragments.clone(),
            self.tri_count,
            self.refittable,
            self.frag_min_flipped,
            self.over_aabbs,
        )
    }

    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![0u32];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx as usize];
            count += 1;
            if !node.is_leaf() {
                stack.push(node.left);
                stack.push(node.right);
            }
        }
        count
    }

    /// SAH cost of the tree, normalized by the root area.
    pub fn sah_cost(&self) -> FloatType {
        fn cost(nodes: &[VerboseNode], idx: u32) -> FloatType {
            let node = &nodes[idx as usize];
            if node.is_leaf() {
                return crate::bvh::C_INT * node.half_area() * node.tri_count as FloatType;
            }
            crate::bvh::C_TRAV * node.half_area()
                + cost(nodes, node.left)
                + cost(nodes, node.right)
        }
        cost(&self.nodes, 0) / self.nodes[0].half_area()
    }

    /// Drops unused nodes by renumbering the live tree into a fresh pool.
    /// Mostly useful after [`VerboseBvh::merge_leafs`], which orphans the
    /// collapsed subtrees.
    pub fn compact(&mut self) {
        let mut nodes: Vec<VerboseNode> = Vec::with_capacity(self.nodes.len());
        nodes.push(self.nodes[0]);
        nodes[0].parent = ROOT_SENTINEL;
        // (old index, new index) of nodes whose children are pending
        let mut stack: Vec<(u32, u32)> = Vec::new();
        if !self.nodes[0].is_leaf() {
            stack.push((0, 0));
        }
        while let Some((old_idx, new_idx)) = stack.pop() {
            let old = self.nodes[old_idx as usize];
            let left_new = nodes.len() as u32;
            nodes.push(self.nodes[old.left as usize]);
            nodes.push(self.nodes[old.right as usize]);
            nodes[left_new as usize].parent = new_idx;
            nodes[left_new as usize + 1].parent = new_idx;
            nodes[new_idx as usize].left = left_new;
            nodes[new_idx as usize].right = left_new + 1;
            if !self.nodes[old.left as usize].is_leaf() {
                stack.push((old.left, left_new));
            }
            if !self.nodes[old.right as usize].is_leaf() {
                stack.push((old.right, left_new + 1));
            }
        }
        self.nodes = nodes;
        self.may_have_holes = false;
    }

    /// Recomputes the bounds of `node_idx` and every ancestor, walking the
    /// parent links to the root.
    pub(crate) fn refit_up(&mut self, mut node_idx: u32) {
        while node_idx != ROOT_SENTINEL {
            let node = self.nodes[node_idx as usize];
            let aabb = self.nodes[node.left as usize]
                .aabb()
                .union(&self.nodes[node.right as usize].aabb());
            let node = &mut self.nodes[node_idx as usize];
            node.aabb_min = aabb.min;
            node.aabb_max = aabb.max;
            node_idx = node.parent;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert2::assert;

    use crate::bvh::test_geometry::triangle_grid;
    use crate::geometry::{Ray, VertexSlice, WorldPoint, WorldVector};

    #[test]
    fn round_trip_preserves_traversal() {
        let verts = triangle_grid(7);
        let slice = VertexSlice::from(&verts[..]);
        let bvh = Bvh::from_verts(&verts[..]);
        let back = VerboseBvh::from_bvh(&bvh).to_bvh();

        for i in 0..49 {
            let origin = WorldPoint::new((i % 7) as f32 + 0.3, (i / 7) as f32 + 0.3, -1.0);
            let mut a = Ray::new(origin, WorldVector::new(0.0, 0.0, 1.0));
            let mut b = a;
            bvh.intersect(&mut a, slice);
            back.intersect(&mut b, slice);
            assert!(a.hit.t == b.hit.t);
            assert!(a.hit.prim == b.hit.prim);
        }
    }

    #[test]
    fn parent_links_are_consistent() {
        let verts = triangle_grid(6);
        let bvh = Bvh::from_verts(&verts[..]);
        let verbose = VerboseBvh::from_bvh(&bvh);
        let mut stack = vec![0u32];
        while let Some(idx) = stack.pop() {
            let node = &verbose.nodes[idx as usize];
            if !node.is_leaf() {
                assert!(verbose.nodes[node.left as usize].parent == idx);
                assert!(verbose.nodes[node.right as usize].parent == idx);
                stack.push(node.left);
                stack.push(node.right);
            }
        }
        assert!(verbose.nodes[0].parent == ROOT_SENTINEL);
    }

    #[test]
    fn refit_up_restores_ancestor_bounds() {
        let verts = triangle_grid(5);
        let bvh = Bvh::from_verts(&verts[..]);
        let mut verbose = VerboseBvh::from_bvh(&bvh);

        // find some leaf and grow it
        let leaf = (0..verbose.nodes.len() as u32)
            .find(|&i| verbose.nodes[i as usize].is_leaf())
            .unwrap();
        verbose.nodes[leaf as usize].aabb_max.z += 5.0;
        let parent = verbose.nodes[leaf as usize].parent;
        verbose.refit_up(parent);
        assert!(verbose.nodes[0].aabb_max.z >= 5.0);
    }

    #[test]
    fn node_counts_match() {
        let verts = triangle_grid(8);
        let bvh = Bvh::from_verts(&verts[..]);
        let verbose = VerboseBvh::from_bvh(&bvh);
        assert!(verbose.node_count() == bvh.node_count());
    }

    #[test]
    fn compact_drops_orphaned_nodes() {
        let verts = triangle_grid(8);
        let bvh = Bvh::from_verts(&verts[..]);
        let mut verbose = VerboseBvh::from_bvh(&bvh);
        verbose.split_leafs(1);
        verbose.optimize(100);
        verbose.merge_leafs();
        let live = verbose.node_count();
        assert!(verbose.nodes.len() > live);
        verbose.compact();
        assert!(verbose.nodes.len() == live);
        assert!(!verbose.may_have_holes);

        let slice = VertexSlice::from(&verts[..]);
        let compacted = verbose.to_bvh();
        let reference = Bvh::from_verts(&verts[..]);
        for i in 0..64 {
            let origin = WorldPoint::new((i % 8) as f32 + 0.3, (i / 8) as f32 + 0.3, -1.0);
            let mut a = Ray::new(origin, WorldVector::new(0.0, 0.0, 1.0));
            let mut b = a;
            compacted.intersect(&mut a, slice);
            reference.intersect(&mut b, slice);
            assert!(a.hit.t == b.hit.t);
            assert!(a.hit.prim == b.hit.prim);
        }
    }
}
