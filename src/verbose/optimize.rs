//! Insertion-based tree optimization, after "Fast Insertion-Based
//! Optimization of Bounding Volume Hierarchies", Bittner et al. Each
//! iteration removes a random interior node and reinserts its two subtrees
//! at the globally cheapest positions found by branch-and-bound search.

use arrayvec::ArrayVec;
use assert2::debug_assert;

use crate::bvh::{Bvh, C_INT, C_TRAV};
use crate::geometry::{FloatType, WorldBox, BVH_FAR};

use super::{VerboseBvh, VerboseNode};

/// Capacity of the reinsertion search's task pool.
const SEARCH_POOL: usize = 512;

/// Deterministic xorshift32; optimization runs are reproducible.
const OPTIMIZE_SEED: u32 = 0x12345678;

impl VerboseBvh {
    /// Runs `iterations` random removal/reinsertion steps. SAH cost is
    /// non-increasing in expectation; ~1M iterations approach convergence
    /// on typical scenes. Follow up with [`VerboseBvh::merge_leafs`] to
    /// collapse the single-primitive leaves the process tends to create.
    pub fn optimize(&mut self, iterations: u32) {
        if self.nodes.len() <= 3 {
            return; // nothing to reorganize below one interior node
        }
        let mut seed = OPTIMIZE_SEED;
        for _ in 0..iterations {
            // pick a random interior node that is neither a child nor a
            // grandchild of the root; tiny trees have no such node
            let mut nid = 0;
            for _attempt in 0..64 {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                let candidate = 2 + seed as usize % (self.nodes.len() - 2);
                let node = &self.nodes[candidate];
                if node.parent == 0 || node.is_leaf() {
                    continue;
                }
                if self.nodes[node.parent as usize].parent == 0 {
                    continue;
                }
                nid = candidate;
                break;
            }
            if nid == 0 {
                return;
            }
            // splice the node and its parent out of the tree: the
            // sibling moves up to the grandparent
            let node = self.nodes[nid];
            let pid = node.parent;
            let parent = self.nodes[pid as usize];
            let x1 = parent.parent;
            let x2 = if parent.left == nid as u32 {
                parent.right
            } else {
                parent.left
            };
            if self.nodes[x1 as usize].left == pid {
                self.nodes[x1 as usize].left = x2;
            } else {
                self.nodes[x1 as usize].right = x2;
            }
            self.nodes[x2 as usize].parent = x1;
            let (left, right) = (node.left, node.right);
            self.refit_up(x1);
            // the two freed nodes become the new interior nodes of the
            // reinsertions
            self.reinsert_node(left, pid, x1);
            self.reinsert_node(right, nid as u32, x1);
        }
    }

    /// Finds the cheapest node to pair `lid` with, by best-first search
    /// over "induced cost so far plus direct cost". Branches whose
    /// optimistic bound already exceeds the best found are pruned.
    fn find_best_position(&self, lid: u32) -> u32 {
        let l_aabb = self.nodes[lid as usize].aabb();
        let sa_l = l_aabb.half_area();
        let epsilon = 1e-10f32;
        let mut task_node: ArrayVec<u32, SEARCH_POOL> = ArrayVec::new();
        let mut task_ci: ArrayVec<FloatType, SEARCH_POOL> = ArrayVec::new();
        let mut task_inv_ci: ArrayVec<FloatType, SEARCH_POOL> = ArrayVec::new();
        task_node.push(0); // root
        task_ci.push(0.0);
        task_inv_ci.push(1.0 / epsilon);
        let mut best_cost = BVH_FAR;
        let mut best_node = 0u32;
        while !task_node.is_empty() {
            // pop the task with the smallest induced cost
            let mut best_task = 0;
            let mut max_inv_ci = 0.0;
            for (j, &inv) in task_inv_ci.iter().enumerate() {
                if inv > max_inv_ci {
                    max_inv_ci = inv;
                    best_task = j;
                }
            }
            let xid = task_node.swap_remove(best_task);
            let ci_lx = task_ci.swap_remove(best_task);
            task_inv_ci.swap_remove(best_task);

            if ci_lx + sa_l >= best_cost {
                break; // even a zero direct cost cannot beat the best
            }
            let x = &self.nodes[xid as usize];
            let cd_lx = l_aabb.union(&x.aabb()).half_area();
            let c_lx = ci_lx + cd_lx;
            if c_lx < best_cost {
                best_cost = c_lx;
                best_node = xid;
            }
            let ci = c_lx - x.half_area();
            if ci + sa_l < best_cost && !x.is_leaf() {
                if task_node.remaining_capacity() >= 2 {
                    task_node.push(x.left);
                    task_ci.push(ci);
                    task_inv_ci.push(1.0 / (ci + epsilon));
                    task_node.push(x.right);
                    task_ci.push(ci);
                    task_inv_ci.push(1.0 / (ci + epsilon));
                } else {
                    debug_assert!(false, "reinsertion search pool exhausted");
                }
            }
        }
        best_node
    }

    /// Attaches the subtree `lid` next to the best position found, reusing
    /// `nid` as the fresh interior node. Falls back to the splice origin
    /// when the search lands on the root or one of its children.
    fn reinsert_node(&mut self, lid: u32, nid: u32, origin: u32) {
        let mut best = self.find_best_position(lid);
        if best == 0 || self.nodes[best as usize].parent == 0 {
            best = origin;
        }
        let x1 = self.nodes[best as usize].parent;
        let aabb = self.nodes[best as usize]
            .aabb()
            .union(&self.nodes[lid as usize].aabb());
        {
            let n = &mut self.nodes[nid as usize];
            n.left = best;
            n.right = lid;
            n.aabb_min = aabb.min;
            n.aabb_max = aabb.max;
            n.tri_count = 0;
            n.parent = x1;
        }
        if self.nodes[x1 as usize].left == best {
            self.nodes[x1 as usize].left = nid;
        } else {
            self.nodes[x1 as usize].right = nid;
        }
        self.nodes[best as usize].parent = nid;
        self.nodes[lid as usize].parent = nid;
        self.refit_up(nid);
    }

    /// Splits leaves with more than `max_prims` primitives into chains of
    /// smaller leaves. Optimization moves whole leaves; finer leaves give
    /// it more freedom, at the price of a larger tree.
    pub fn split_leafs(&mut self, max_prims: u32) {
        let flip = self.frag_min_flipped;
        let mut stack: Vec<u32> = Vec::new();
        let mut node_idx = 0u32;
        loop {
            let node = self.nodes[node_idx as usize];
            if !node.is_leaf() {
                stack.push(node.right);
                node_idx = node.left;
                continue;
            }
            if node.tri_count > max_prims {
                let first_idx = self.nodes.len() as u32;
                let second_idx = first_idx + 1;
                let half = node.tri_count / 2;
                let mut first = VerboseNode {
                    first_tri: node.first_tri,
                    tri_count: half,
                    parent: node_idx,
                    ..VerboseNode::default()
                };
                let mut second = VerboseNode {
                    first_tri: node.first_tri + half,
                    tri_count: node.tri_count - half,
                    parent: node_idx,
                    ..VerboseNode::default()
                };
                for child in [&mut first, &mut second] {
                    if !self.refittable {
                        // clipped fragments cannot reproduce exact bounds;
                        // inherit the parent box instead
                        child.aabb_min = node.aabb_min;
                        child.aabb_max = node.aabb_max;
                        continue;
                    }
                    let mut aabb = WorldBox::EMPTY;
                    for i in 0..child.tri_count {
                        let fi = self.prim_idx[(child.first_tri + i) as usize] as usize;
                        aabb.grow_aabb(&self.fragments[fi].bounds(flip));
                    }
                    child.aabb_min = aabb.min;
                    child.aabb_max = aabb.max;
                }
                let recurse_first = first.tri_count > max_prims.max(1);
                let recurse_second = second.tri_count > max_prims.max(1);
                self.nodes.push(first);
                self.nodes.push(second);
                let node = &mut self.nodes[node_idx as usize];
                node.left = first_idx;
                node.right = second_idx;
                node.tri_count = 0;
                if recurse_first {
                    stack.push(first_idx);
                }
                if recurse_second {
                    stack.push(second_idx);
                }
            }
            match stack.pop() {
                Some(idx) => node_idx = idx,
                None => break,
            }
        }
    }

    /// Collapses subtrees where the SAH prefers a single fat leaf over the
    /// current split. Rebuilds the primitive index array; the node pool
    /// keeps unused entries until the next conversion.
    pub fn merge_leafs(&mut self) {
        let mut subtree_count = vec![0u32; self.nodes.len()];
        self.count_subtree_tris(0, &mut subtree_count);
        let mut new_idx: Vec<u32> = Vec::with_capacity(self.prim_idx.len());
        let mut stack: Vec<u32> = Vec::new();
        let mut node_idx = 0u32;
        loop {
            let node = self.nodes[node_idx as usize];
            if node.is_leaf() {
                let start = new_idx.len() as u32;
                self.merge_subtree(node_idx, &mut new_idx);
                self.nodes[node_idx as usize].first_tri = start;
                match stack.pop() {
                    Some(idx) => node_idx = idx,
                    None => break,
                }
                continue;
            }
            let left_count = subtree_count[node.left as usize];
            let right_count = subtree_count[node.right as usize];
            let merged_count = left_count + right_count;
            let unsplit_cost = node.half_area() * merged_count as FloatType * C_INT;
            let keep_split_cost = C_TRAV
                + C_INT
                    * (self.nodes[node.left as usize].half_area() * left_count as FloatType
                        + self.nodes[node.right as usize].half_area() * right_count as FloatType);
            if unsplit_cost <= keep_split_cost {
                let start = new_idx.len() as u32;
                self.merge_subtree(node_idx, &mut new_idx);
                let node = &mut self.nodes[node_idx as usize];
                node.first_tri = start;
                node.tri_count = merged_count;
                node.left = 0;
                node.right = 0;
                match stack.pop() {
                    Some(idx) => node_idx = idx,
                    None => break,
                }
            } else {
                stack.push(node.right);
                node_idx = node.left;
            }
        }
        self.prim_idx = new_idx;
        self.may_have_holes = true;
    }

    fn count_subtree_tris(&self, node_idx: u32, counters: &mut [u32]) -> u32 {
        let node = &self.nodes[node_idx as usize];
        let count = if node.is_leaf() {
            node.tri_count
        } else {
            self.count_subtree_tris(node.left, counters)
                + self.count_subtree_tris(node.right, counters)
        };
        counters[node_idx as usize] = count;
        count
    }

    fn merge_subtree(&self, node_idx: u32, new_idx: &mut Vec<u32>) {
        let node = &self.nodes[node_idx as usize];
        if node.is_leaf() {
            let first = node.first_tri as usize;
            new_idx.extend_from_slice(&self.prim_idx[first..first + node.tri_count as usize]);
        } else {
            self.merge_subtree(node.left, new_idx);
            self.merge_subtree(node.right, new_idx);
        }
    }
}

impl Bvh {
    /// Convenience wrapper: unpack to the verbose form, optimize, collapse
    /// the resulting one-primitive leaves and pack back.
    pub fn optimize(&mut self, iterations: u32) {
        let mut verbose = VerboseBvh::from_bvh(self);
        verbose.optimize(iterations);
        verbose.merge_leafs();
        *self = verbose.to_bvh();
    }
}
