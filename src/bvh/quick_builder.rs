use arrayvec::ArrayVec;

use crate::geometry::{VertexSlice, WorldBox};

use super::{Bvh, BvhNode, Fragment, NodeIdx, BUILD_STACK_DEPTH};

impl Bvh {
    /// Midpoint-split build: no SAH evaluation, low tree quality, very low
    /// build time. Use when build time dominates tracing time.
    pub fn build_quick<'a>(&mut self, verts: impl Into<VertexSlice<'a>>) {
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

        let mut task: ArrayVec<NodeIdx, BUILD_STACK_DEPTH> = ArrayVec::new();
        let mut node_idx = NodeIdx::from_usize(0);
        loop {
            loop {
                let node = self.nodes[node_idx];
                // partition against the midpoint of the longest axis,
                // accumulating child bounds on the fly
                let axis = node.aabb().longest_axis();
                let split_pos = (node.aabb_min[axis] + node.aabb_max[axis]) * 0.5;
                let mut left_box = WorldBox::EMPTY;
                let mut right_box = WorldBox::EMPTY;
                let mut src = node.left_first as usize;
                let mut j = src + node.tri_count as usize;
                for _ in 0..node.tri_count {
                    let frag = self.fragments[self.prim_idx[src] as usize];
                    if frag.centroid_on(axis) < split_pos {
                        left_box.grow(&frag.bmin);
                        left_box.grow(&frag.bmax);
                        src += 1;
                    } else {
                        right_box.grow(&frag.bmin);
                        right_box.grow(&frag.bmax);
                        j -= 1;
                        self.prim_idx.swap(src, j);
                    }
                }
                let left_count = src - node.left_first as usize;
                let right_count = node.tri_count as usize - left_count;
                if left_count == 0 || right_count == 0 {
                    break; // split did not separate anything
                }
                let left_idx = NodeIdx::from_usize(self.nodes.len());
                self.nodes.push(BvhNode::new_leaf(
                    left_box,
                    node.left_first,
                    left_count as u32,
                ));
                self.nodes.push(BvhNode::new_leaf(
                    right_box,
                    src as u32,
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
}

#[cfg(test)]
mod test {
    use super::*;

    use assert2::assert;

    use crate::bvh::test_geometry::triangle_grid;
    use crate::geometry::{Ray, VertexSlice, WorldPoint, WorldVector};

    #[test]
    fn quick_build_is_valid() {
        let verts = triangle_grid(12);
        let mut bvh = Bvh::new();
        bvh.build_quick(&verts[..]);
        assert!(bvh.refittable);
        assert!(bvh
            .validate_with_verts(VertexSlice::from(&verts[..]))
            .is_ok());
    }

    #[test]
    fn quick_and_sah_builds_agree_on_hits() {
        let verts = triangle_grid(8);
        let mut quick = Bvh::new();
        quick.build_quick(&verts[..]);
        let sah = Bvh::from_verts(&verts[..]);

        let slice = VertexSlice::from(&verts[..]);
        for x in 0..8 {
            for y in 0..8 {
                let origin = WorldPoint::new(x as f32 + 0.2, y as f32 + 0.2, -1.0);
                let mut ray_a = Ray::new(origin, WorldVector::new(0.0, 0.0, 1.0));
                let mut ray_b = ray_a;
                quick.intersect(&mut ray_a, slice);
                sah.intersect(&mut ray_b, slice);
                assert!(ray_a.hit.t == ray_b.hit.t);
                assert!(ray_a.hit.prim == ray_b.hit.prim);
            }
        }
    }
}
