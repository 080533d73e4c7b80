use crate::util::Stats;

use super::{Bvh, NodeIdx};

impl Bvh {
    pub fn print_tree(&self) {
        self.print_recursive(0, NodeIdx::from_usize(0));
    }

    pub fn print_statistics(&self) {
        let depth = self.depth_statistics_recursive(NodeIdx::from_usize(0));
        let leaf = self.leaf_fill_statistics();
        println!("Nodes: {} ({} in pool)", self.node_count(), self.nodes.len());
        println!("Depth: {} - {}; avg {:.1}", depth.min, depth.max, depth.avg);
        println!("Leaf fill: {}", leaf);
        println!("SAH cost: {:.2}", self.sah_cost(NodeIdx::from_usize(0)));
    }

    fn depth_statistics_recursive(&self, node_idx: NodeIdx) -> Stats {
        let node = &self.nodes[node_idx];
        if node.is_leaf() {
            return Stats::new_single(1);
        }
        let left = self.depth_statistics_recursive(node.left_child());
        let right = self.depth_statistics_recursive(node.left_child() + 1);
        let mut ret = left.merge(&right);
        ret.min += 1;
        ret.max += 1;
        ret.avg += 1.0;
        ret
    }

    fn leaf_fill_statistics(&self) -> Stats {
        let mut stats = Stats::default();
        let mut stack = vec![NodeIdx::from_usize(0)];
        while let Some(node_idx) = stack.pop() {
            let node = &self.nodes[node_idx];
            if node.is_leaf() {
                stats.add_sample(node.tri_count as usize);
            } else {
                stack.push(node.left_child());
                stack.push(node.left_child() + 1);
            }
        }
        stats
    }

    fn print_recursive(&self, indent: usize, node_idx: NodeIdx) {
        let node = &self.nodes[node_idx];
        println!(
            "{}- {}{}: {:?}-{:?}",
            "  ".repeat(indent),
            if node.is_leaf() { "L" } else { "I" },
            node_idx.raw(),
            node.aabb_min,
            node.aabb_max,
        );
        if node.is_leaf() {
            let prims: Vec<u32> = (0..node.tri_count)
                .map(|i| self.prim_idx[(node.left_first + i) as usize])
                .collect();
            println!("{}prims: {:?}", "  ".repeat(indent + 1), prims);
        } else {
            self.print_recursive(indent + 1, node.left_child());
            self.print_recursive(indent + 1, node.left_child() + 1);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert2::assert;

    use crate::bvh::test_geometry::triangle_grid;

    #[test]
    fn depth_statistics_of_single_leaf() {
        let verts = crate::bvh::test_geometry::one_triangle();
        let bvh = Bvh::from_verts(&verts[..]);
        let depth = bvh.depth_statistics_recursive(NodeIdx::from_usize(0));
        assert!(depth.min == 1);
        assert!(depth.max == 1);
    }

    #[test]
    fn leaf_fill_counts_every_primitive() {
        let verts = triangle_grid(8);
        let bvh = Bvh::from_verts(&verts[..]);
        let mut total = 0;
        let mut stack = vec![NodeIdx::from_usize(0)];
        while let Some(idx) = stack.pop() {
            let node = &bvh.nodes[idx];
            if node.is_leaf() {
                total += node.tri_count as usize;
            } else {
                stack.push(node.left_child());
                stack.push(node.left_child() + 1);
            }
        }
        assert!(total == 64);
    }
}
