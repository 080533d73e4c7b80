use thiserror::Error;

use crate::geometry::{VertexSlice, WorldBox, EPSILON};

use super::{Bvh, NodeIdx};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("tree has no nodes")]
    Empty,

    #[error("node {node} does not enclose its children")]
    ChildEscapesNode { node: u32 },

    #[error("leaf {node} does not enclose primitive {prim}")]
    PrimitiveEscapesLeaf { node: u32, prim: u32 },

    #[error("leaf {node} references primitive slot {slot} outside the index array")]
    IndexOutOfRange { node: u32, slot: usize },

    #[error("primitive {prim} is referenced by no leaf")]
    UnreferencedPrimitive { prim: u32 },
}

impl Bvh {
    /// Structural checks: every interior node encloses its children, no
    /// leaf is empty (guaranteed by `tri_count > 0` being the leaf marker),
    /// all primitive references are in range, and every input primitive is
    /// referenced at least once.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_impl(None)
    }

    /// [`Bvh::validate`] plus the leaf-encloses-triangle check against the
    /// actual vertex data.
    pub fn validate_with_verts(&self, verts: VertexSlice) -> Result<(), ValidationError> {
        self.validate_impl(Some(verts))
    }

    fn validate_impl(&self, verts: Option<VertexSlice>) -> Result<(), ValidationError> {
        if self.nodes.is_empty() {
            return Err(ValidationError::Empty);
        }
        let mut referenced = vec![false; self.tri_count as usize];
        let mut stack = vec![NodeIdx::from_usize(0)];
        while let Some(node_idx) = stack.pop() {
            let node = &self.nodes[node_idx];
            if node.is_leaf() {
                for i in 0..node.tri_count {
                    let slot = (node.left_first + i) as usize;
                    if slot >= self.prim_idx.len() {
                        return Err(ValidationError::IndexOutOfRange {
                            node: node_idx.raw(),
                            slot,
                        });
                    }
                    let prim = self.prim_idx[slot];
                    referenced[prim as usize] = true;
                    let prim_bounds = match verts {
                        Some(verts) => verts.triangle(prim).aabb(),
                        None if !self.over_aabbs && self.refittable => {
                            // object-split tree: the fragment is the
                            // primitive's exact box
                            self.fragments[prim as usize].bounds(self.frag_min_flipped)
                        }
                        None => continue, // nothing to compare against
                    };
                    // spatial splits clip primitives across leaves; then a
                    // leaf legitimately holds only part of the box
                    if self.refittable
                        && !node.aabb().encloses(&prim_bounds, EPSILON)
                    {
                        return Err(ValidationError::PrimitiveEscapesLeaf {
                            node: node_idx.raw(),
                            prim,
                        });
                    }
                }
            } else {
                let left = &self.nodes[node.left_child()];
                let right = &self.nodes[node.left_child() + 1];
                let children: WorldBox = left.aabb().union(&right.aabb());
                if !node.aabb().encloses(&children, EPSILON) {
                    return Err(ValidationError::ChildEscapesNode {
                        node: node_idx.raw(),
                    });
                }
                stack.push(node.left_child());
                stack.push(node.left_child() + 1);
            }
        }
        if let Some(prim) = referenced.iter().position(|r| !r) {
            return Err(ValidationError::UnreferencedPrimitive { prim: prim as u32 });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert2::{assert, let_assert};

    use crate::bvh::test_geometry::triangle_grid;
    use crate::geometry::WorldPoint;

    #[test]
    fn fresh_build_validates() {
        let verts = triangle_grid(10);
        let bvh = Bvh::from_verts(&verts[..]);
        assert!(bvh.validate_with_verts(VertexSlice::from(&verts[..])).is_ok());
    }

    #[test]
    fn corrupted_interior_bounds_are_detected() {
        let verts = triangle_grid(6);
        let mut bvh = Bvh::from_verts(&verts[..]);
        let root = NodeIdx::from_usize(0);
        bvh.nodes[root].aabb_max = WorldPoint::new(0.1, 0.1, 0.1);
        let_assert!(Err(ValidationError::ChildEscapesNode { node: 0 }) = bvh.validate());
    }

    #[test]
    fn empty_tree_is_reported() {
        let bvh = Bvh::new();
        let_assert!(Err(ValidationError::Empty) = bvh.validate());
    }
}
