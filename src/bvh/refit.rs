use assert2::assert;

use crate::geometry::{VertexSlice, WorldBox};

use super::{Bvh, NodeIdx};

impl Bvh {
    /// Recomputes all node bounds bottom-up from the current vertex
    /// positions, without re-splitting. For meshes whose topology is stable
    /// (skinning, wind). Repeated refits degrade tree quality; rebuild when
    /// tracing slows down.
    pub fn refit(&mut self, verts: VertexSlice) {
        assert!(
            self.refittable,
            "refitting a spatial-split tree would lose clipped geometry"
        );
        assert!(!self.may_have_holes, "refitting a tree with unused nodes");
        assert!(!self.over_aabbs, "triangle refit of an AABB tree");
        for i in (0..self.nodes.len()).rev() {
            if i == 1 {
                continue; // reserved pad
            }
            let node = self.nodes[NodeIdx::from_usize(i)];
            let aabb = if node.is_leaf() {
                let mut aabb = WorldBox::EMPTY;
                for j in 0..node.tri_count {
                    let prim = self.prim_idx[(node.left_first + j) as usize];
                    let vert = prim as usize * 3;
                    aabb.grow(&verts.position(vert));
                    aabb.grow(&verts.position(vert + 1));
                    aabb.grow(&verts.position(vert + 2));
                }
                aabb
            } else {
                let left = &self.nodes[node.left_child()];
                let right = &self.nodes[node.left_child() + 1];
                left.aabb().union(&right.aabb())
            };
            let node = &mut self.nodes[NodeIdx::from_usize(i)];
            node.aabb_min = aabb.min;
            node.aabb_max = aabb.max;
        }
    }

    /// Bottom-up refit from the fragment array, for trees built over
    /// AABBs. Update the fragments through [`Bvh::fragments_mut`] first.
    pub fn refit_from_fragments(&mut self) {
        assert!(
            self.refittable,
            "refitting a spatial-split tree would lose clipped geometry"
        );
        assert!(!self.may_have_holes, "refitting a tree with unused nodes");
        for i in (0..self.nodes.len()).rev() {
            if i == 1 {
                continue;
            }
            let node = self.nodes[NodeIdx::from_usize(i)];
            let aabb = if node.is_leaf() {
                let mut aabb = WorldBox::EMPTY;
                for j in 0..node.tri_count {
                    let prim = self.prim_idx[(node.left_first + j) as usize];
                    let bounds = self.fragments[prim as usize].bounds(self.frag_min_flipped);
                    aabb.grow_aabb(&bounds);
                }
                aabb
            } else {
                let left = &self.nodes[node.left_child()];
                let right = &self.nodes[node.left_child() + 1];
                left.aabb().union(&right.aabb())
            };
            let node = &mut self.nodes[NodeIdx::from_usize(i)];
            node.aabb_min = aabb.min;
            node.aabb_max = aabb.max;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert2::assert;

    use crate::bvh::test_geometry::triangle_grid;
    use crate::geometry::{Ray, WorldPoint, WorldVector};

    #[test]
    fn refit_without_motion_is_identity() {
        let verts = triangle_grid(7);
        let slice = VertexSlice::from(&verts[..]);
        let mut bvh = Bvh::from_verts(&verts[..]);
        let before = bvh.nodes().to_vec();
        bvh.refit(slice);
        assert!(bvh.nodes() == &before[..]);
    }

    #[test]
    fn refit_follows_moved_vertices() {
        let mut verts = triangle_grid(4);
        let mut bvh = Bvh::from_verts(&verts[..]);

        // push every vertex up by one unit
        for v in &mut verts {
            v[2] += 1.0;
        }
        bvh.refit(VertexSlice::from(&verts[..]));
        assert!(bvh.bounds().min.z == 1.0);
        assert!(bvh
            .validate_with_verts(VertexSlice::from(&verts[..]))
            .is_ok());

        // a ray aimed at the old position now hits one unit further
        let mut ray = Ray::new(
            WorldPoint::new(0.3, 0.3, -1.0),
            WorldVector::new(0.0, 0.0, 1.0),
        );
        bvh.intersect(&mut ray, VertexSlice::from(&verts[..]));
        assert!(ray.hit.t == 2.0);
    }

    #[test]
    #[should_panic]
    fn refitting_spatial_split_tree_is_fatal() {
        let verts = triangle_grid(4);
        let mut bvh = Bvh::new();
        bvh.build_hq(&verts[..]);
        bvh.refit(VertexSlice::from(&verts[..]));
    }

    #[test]
    fn refit_works_on_simd_built_trees() {
        let mut verts = triangle_grid(5);
        let mut bvh = Bvh::new();
        bvh.build_simd(&verts[..]);
        for v in &mut verts {
            v[0] -= 2.0;
        }
        bvh.refit(VertexSlice::from(&verts[..]));
        assert!(bvh.bounds().min.x == -2.0);
        assert!(bvh
            .validate_with_verts(VertexSlice::from(&verts[..]))
            .is_ok());
    }

    #[test]
    fn fragment_refit_tracks_new_bounds() {
        let boxes = [
            WorldBox::new(WorldPoint::new(0.0, 0.0, 0.0), WorldPoint::new(1.0, 1.0, 1.0)),
            WorldBox::new(WorldPoint::new(3.0, 0.0, 0.0), WorldPoint::new(4.0, 1.0, 1.0)),
        ];
        let mut bvh = Bvh::new();
        bvh.build_over_aabbs(boxes.len(), |i| boxes[i as usize]);

        bvh.fragments_mut()[1].bmax = WorldPoint::new(9.0, 1.0, 1.0);
        bvh.refit_from_fragments();
        assert!(bvh.bounds().max.x == 9.0);
    }
}
