mod binned_builder;
mod packet;
mod printing;
mod quick_builder;
mod refit;
mod simd_builder;
mod spatial_builder;
mod traversal;
mod validation;

use index_vec::IndexVec;

use crate::geometry::{FloatType, VertexSlice, WorldBox, WorldPoint, BVH_FAR};

pub use packet::RayPacket;
pub use validation::ValidationError;

/// Number of bins per axis evaluated by the SAH builders.
pub(crate) const BINS: usize = 8;
/// SAH cost of one traversal step.
pub(crate) const C_TRAV: FloatType = 1.0;
/// SAH cost of one primitive intersection.
pub(crate) const C_INT: FloatType = 1.0;
/// Depth of the in-core stack used by the iterative builders.
pub(crate) const BUILD_STACK_DEPTH: usize = 256;
/// Depth of the traversal stacks. Exceeding this is a bug in the build.
pub(crate) const TRAVERSAL_STACK_DEPTH: usize = 64;

// Index into a canonical node pool.
index_vec::define_index_type! {
    pub struct NodeIdx = u32;
    IMPL_RAW_CONVERSIONS = true;
}

/// Canonical 32-byte node. When aligned to a cache line boundary, a sibling
/// pair fits in one line; siblings always live at indices `2k` and `2k+1`.
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(C)]
pub struct BvhNode {
    pub aabb_min: WorldPoint,
    /// Interior: index of the left child (right child is `left_first + 1`).
    /// Leaf: offset of the first primitive index.
    pub left_first: u32,
    pub aabb_max: WorldPoint,
    /// Zero marks an interior node. There are no empty leaves.
    pub tri_count: u32,
}

impl BvhNode {
    pub fn is_leaf(&self) -> bool {
        self.tri_count > 0
    }

    pub fn aabb(&self) -> WorldBox {
        WorldBox::new(self.aabb_min, self.aabb_max)
    }

    pub fn half_area(&self) -> FloatType {
        self.aabb().half_area()
    }

    pub(crate) fn left_child(&self) -> NodeIdx {
        NodeIdx::from_raw(self.left_first)
    }

    pub(crate) fn new_leaf(aabb: WorldBox, first: u32, count: u32) -> BvhNode {
        BvhNode {
            aabb_min: aabb.min,
            left_first: first,
            aabb_max: aabb.max,
            tri_count: count,
        }
    }
}

impl Default for BvhNode {
    fn default() -> Self {
        BvhNode {
            aabb_min: WorldPoint::origin(),
            left_first: 0,
            aabb_max: WorldPoint::origin(),
            tri_count: 0,
        }
    }
}

/// Bounds of one input primitive, plus the primitive's index. Spatial
/// splits clip these boxes, producing extra fragments that remember where
/// they came from.
#[derive(Copy, Clone, Debug)]
pub struct Fragment {
    pub bmin: WorldPoint,
    pub bmax: WorldPoint,
    pub prim: u32,
    pub clipped: bool,
}

impl Fragment {
    pub(crate) fn from_triangle(verts: &VertexSlice, prim: u32) -> Fragment {
        let tri = verts.triangle(prim);
        let aabb = tri.aabb();
        Fragment {
            bmin: aabb.min,
            bmax: aabb.max,
            prim,
            clipped: false,
        }
    }

    pub(crate) fn from_aabb(aabb: &WorldBox, prim: u32) -> Fragment {
        Fragment {
            bmin: aabb.min,
            bmax: aabb.max,
            prim,
            clipped: false,
        }
    }

    /// Bounds with the 8-lane builder's sign flip undone.
    pub(crate) fn bounds(&self, min_flipped: bool) -> WorldBox {
        if min_flipped {
            WorldBox::new(WorldPoint::from(-self.bmin.coords), self.bmax)
        } else {
            WorldBox::new(self.bmin, self.bmax)
        }
    }

    pub(crate) fn centroid_on(&self, axis: usize) -> FloatType {
        (self.bmin[axis] + self.bmax[axis]) * 0.5
    }
}

/// Canonical 2-wide bounding volume hierarchy over a triangle soup or an
/// AABB soup. The node pool, primitive index array and fragment array are
/// allocated on the first build and reused by later builds. Geometry itself
/// is never copied; traversal and refit take the vertex data as a
/// parameter.
#[derive(Clone, Debug, Default)]
pub struct Bvh {
    pub(crate) nodes: IndexVec<NodeIdx, BvhNode>,
    /// Per-leaf ranges index this array; entries are primitive indices.
    pub(crate) prim_idx: Vec<u32>,
    pub(crate) fragments: Vec<Fragment>,
    /// Number of input primitives of the last build.
    pub(crate) tri_count: u32,
    /// False once spatial splits clipped any fragment; refits would produce
    /// bounds that no longer enclose the clipped-away geometry.
    pub refittable: bool,
    /// The 8-lane builder stores `-bmin` in fragments.
    pub frag_min_flipped: bool,
    /// Leaf merging leaves unused nodes in the pool.
    pub may_have_holes: bool,
    /// Built over caller-supplied AABBs instead of triangles (e.g. a TLAS).
    pub over_aabbs: bool,
}

impl Bvh {
    pub fn new() -> Bvh {
        Bvh::default()
    }

    /// Builds with the binned SAH builder; see [`Bvh::build`].
    pub fn from_verts<'a>(verts: impl Into<VertexSlice<'a>>) -> Bvh {
        let mut bvh = Bvh::new();
        bvh.build(verts.into());
        bvh
    }

    pub fn node(&self, idx: NodeIdx) -> &BvhNode {
        &self.nodes[idx]
    }

    pub fn root(&self) -> &BvhNode {
        &self.nodes[NodeIdx::from_usize(0)]
    }

    pub fn nodes(&self) -> &[BvhNode] {
        self.nodes.as_raw_slice()
    }

    pub fn prim_indices(&self) -> &[u32] {
        &self.prim_idx
    }

    /// Number of primitives the tree was built over.
    pub fn prim_count_input(&self) -> u32 {
        self.tri_count
    }

    /// Number of primitive index slots; exceeds the primitive count after a
    /// spatial-split build.
    pub fn idx_count(&self) -> usize {
        self.prim_idx.len()
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn fragments_mut(&mut self) -> &mut [Fragment] {
        &mut self.fragments
    }

    pub fn node_count(&self) -> usize {
        // Walks the tree: the pad node and any holes are not counted.
        let mut count = 0;
        let mut stack = Vec::new();
        let mut node_idx = NodeIdx::from_usize(0);
        loop {
            let node = &self.nodes[node_idx];
            count += 1;
            if node.is_leaf() {
                match stack.pop() {
                    Some(idx) => node_idx = idx,
                    None => break,
                }
            } else {
                node_idx = node.left_child();
                stack.push(node.left_child() + 1);
            }
        }
        count
    }

    /// Number of primitives (fragments) referenced below `node_idx`.
    pub fn prim_count(&self, node_idx: NodeIdx) -> usize {
        let node = &self.nodes[node_idx];
        if node.is_leaf() {
            node.tri_count as usize
        } else {
            self.prim_count(node.left_child()) + self.prim_count(node.left_child() + 1)
        }
    }

    /// SAH cost of the subtree; at the root the cost is normalized by the
    /// root area. Lower is better.
    pub fn sah_cost(&self, node_idx: NodeIdx) -> FloatType {
        let node = &self.nodes[node_idx];
        if node.is_leaf() {
            return C_INT * node.half_area() * node.tri_count as FloatType;
        }
        let cost = C_TRAV * node.half_area()
            + self.sah_cost(node.left_child())
            + self.sah_cost(node.left_child() + 1);
        if node_idx.raw() == 0 {
            cost / node.half_area()
        } else {
            cost
        }
    }

    /// Removes unused nodes, renumbering children into the canonical
    /// `2k, 2k+1` sibling scheme.
    pub fn compact(&mut self) {
        assert2::assert!(!self.nodes.is_empty(), "compacting an empty tree");
        let mut tmp: IndexVec<NodeIdx, BvhNode> = IndexVec::with_capacity(self.nodes.len());
        tmp.push(self.nodes[NodeIdx::from_usize(0)]);
        tmp.push(self.nodes[NodeIdx::from_usize(1)]);
        if self.root().is_leaf() {
            self.nodes.truncate(2);
            self.may_have_holes = false;
            return;
        }
        let mut stack = Vec::new();
        let mut node_idx = NodeIdx::from_usize(0);
        loop {
            let node = tmp[node_idx];
            let left = self.nodes[node.left_child()];
            let right = self.nodes[node.left_child() + 1];
            let new_left = NodeIdx::from_usize(tmp.len());
            tmp.push(left);
            tmp.push(right);
            tmp[node_idx].left_first = new_left.raw();
            if !left.is_leaf() {
                stack.push(new_left);
            }
            if !right.is_leaf() {
                stack.push(new_left + 1);
            }
            match stack.pop() {
                Some(idx) => node_idx = idx,
                None => break,
            }
        }
        self.nodes = tmp;
        self.may_have_holes = false;
    }

    /// Shared preamble of every builder: checks preconditions and resets
    /// the pools.
    pub(crate) fn prepare_build(&mut self, prim_count: usize, idx_slack: usize) {
        assert2::assert!(prim_count > 0, "building a BVH over zero primitives");
        self.nodes.clear();
        self.nodes.reserve(prim_count * 2);
        self.prim_idx.clear();
        self.prim_idx.extend(0..(prim_count + idx_slack) as u32);
        self.fragments.clear();
        self.tri_count = prim_count as u32;
        self.refittable = true;
        self.frag_min_flipped = false;
        self.may_have_holes = false;
        self.over_aabbs = false;
    }

    /// Pushes the root and the reserved pad node so that the first sibling
    /// pair starts at index 2, cache-line aligned against the root.
    pub(crate) fn push_root(&mut self, aabb: WorldBox, tri_count: u32) {
        self.nodes.push(BvhNode::new_leaf(aabb, 0, tri_count));
        self.nodes.push(BvhNode::default());
    }

    /// Assembles a tree from raw parts; used by the verbose-form
    /// conversion. The node vec must already be in canonical layout.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        nodes: Vec<BvhNode>,
        prim_idx: Vec<u32>,
        fragments: Vec<Fragment>,
        tri_count: u32,
        refittable: bool,
        frag_min_flipped: bool,
        over_aabbs: bool,
    ) -> Bvh {
        Bvh {
            nodes: nodes.into_iter().collect(),
            prim_idx,
            fragments,
            tri_count,
            refittable,
            frag_min_flipped,
            may_have_holes: false,
            over_aabbs,
        }
    }

    /// Root AABB; the hull of everything that was built over.
    pub fn bounds(&self) -> WorldBox {
        if self.nodes.is_empty() {
            WorldBox::new(
                WorldPoint::new(BVH_FAR, BVH_FAR, BVH_FAR),
                WorldPoint::new(-BVH_FAR, -BVH_FAR, -BVH_FAR),
            )
        } else {
            self.root().aabb()
        }
    }
}

#[cfg(test)]
pub(crate) mod test_geometry {
    use super::*;

    /// A single unit triangle in the z = 0 plane.
    pub fn one_triangle() -> Vec<[f32; 4]> {
        vec![
            [0.0, 0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
        ]
    }

    /// Two parallel triangles, one at z = 0 and one at z = 2, both
    /// covering the unit square around the origin.
    pub fn two_planes() -> Vec<[f32; 4]> {
        vec![
            [-1.0, -1.0, 0.0, 0.0],
            [3.0, -1.0, 0.0, 0.0],
            [-1.0, 3.0, 0.0, 0.0],
            [-1.0, -1.0, 2.0, 0.0],
            [3.0, -1.0, 2.0, 0.0],
            [-1.0, 3.0, 2.0, 0.0],
        ]
    }

    /// An `n x n` grid of small triangles in the z = 0 plane, unit cell
    /// size, spanning `[0, n]` on x and y.
    pub fn triangle_grid(n: usize) -> Vec<[f32; 4]> {
        let mut verts = Vec::with_capacity(n * n * 3);
        for y in 0..n {
            for x in 0..n {
                let (fx, fy) = (x as f32, y as f32);
                verts.push([fx, fy, 0.0, 0.0]);
                verts.push([fx + 0.9, fy, 0.0, 0.0]);
                verts.push([fx, fy + 0.9, 0.0, 0.0]);
            }
        }
        verts
    }

    /// A cube made of 12 triangles spanning `[lo, hi]` on every axis.
    pub fn cube(lo: f32, hi: f32) -> Vec<[f32; 4]> {
        let p = |x: f32, y: f32, z: f32| [x, y, z, 0.0];
        let mut verts = Vec::new();
        let quads: [[[f32; 3]; 4]; 6] = [
            // -z and +z
            [[lo, lo, lo], [hi, lo, lo], [hi, hi, lo], [lo, hi, lo]],
            [[lo, lo, hi], [hi, lo, hi], [hi, hi, hi], [lo, hi, hi]],
            // -y and +y
            [[lo, lo, lo], [hi, lo, lo], [hi, lo, hi], [lo, lo, hi]],
            [[lo, hi, lo], [hi, hi, lo], [hi, hi, hi], [lo, hi, hi]],
            // -x and +x
            [[lo, lo, lo], [lo, hi, lo], [lo, hi, hi], [lo, lo, hi]],
            [[hi, lo, lo], [hi, hi, lo], [hi, hi, hi], [hi, lo, hi]],
        ];
        for q in quads {
            verts.push(p(q[0][0], q[0][1], q[0][2]));
            verts.push(p(q[1][0], q[1][1], q[1][2]));
            verts.push(p(q[2][0], q[2][1], q[2][2]));
            verts.push(p(q[0][0], q[0][1], q[0][2]));
            verts.push(p(q[2][0], q[2][1], q[2][2]));
            verts.push(p(q[3][0], q[3][1], q[3][2]));
        }
        verts
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert2::assert;

    #[test]
    fn node_is_32_bytes() {
        assert!(std::mem::size_of::<BvhNode>() == 32);
    }

    #[test]
    fn leaf_flag_is_tri_count() {
        let mut node = BvhNode::default();
        assert!(!node.is_leaf());
        node.tri_count = 1;
        assert!(node.is_leaf());
    }

    #[test]
    fn fragment_flip_round_trips() {
        let frag = Fragment {
            bmin: WorldPoint::new(-1.0, -2.0, -3.0),
            bmax: WorldPoint::new(4.0, 5.0, 6.0),
            prim: 0,
            clipped: false,
        };
        let unflipped = frag.bounds(false);
        let flipped_frag = Fragment {
            bmin: WorldPoint::from(-frag.bmin.coords),
            ..frag
        };
        assert!(flipped_frag.bounds(true) == unflipped);
    }
}
