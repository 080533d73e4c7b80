//! Coherent traversal for bundles of 256 rays sharing an origin. The
//! bundle is culled against four frustum planes built from its corner
//! rays; per node, an active `[first, last]` ray interval shrinks as outer
//! rays start missing, so inner rays skip most of the slab tests.
//!
//! Based on "Large Ray Packets for Real-time Whitted Ray Tracing",
//! Overbeck et al., 2008, with sorted traversal and reduced stack traffic.

use arrayvec::ArrayVec;
use assert2::{assert, debug_assert};

use crate::geometry::{Ray, VertexSlice, WorldPoint, WorldVector, BVH_FAR, TRI_EPSILON};

use super::{Bvh, BvhNode, NodeIdx, TRAVERSAL_STACK_DEPTH};

pub const PACKET_SIZE: usize = 256;

/// 256 rays with a common origin, traced together. By default the packet
/// is assumed to be a 16x16 block in scanline order, making rays 0, 51,
/// 204 and 255 the corners; other layouts can pass their own corner
/// indices.
pub struct RayPacket<'a> {
    rays: &'a mut [Ray; PACKET_SIZE],
    corners: [usize; 4],
}

impl<'a> RayPacket<'a> {
    /// Top-left, top-right, bottom-left, bottom-right rays of the default
    /// 16x16 scanline layout.
    pub const DEFAULT_CORNERS: [usize; 4] = [0, 51, 204, 255];

    pub fn new(rays: &'a mut [Ray; PACKET_SIZE]) -> RayPacket<'a> {
        RayPacket::with_corners(rays, RayPacket::DEFAULT_CORNERS)
    }

    /// `corners` name the rays spanning the bundle: top-left, top-right,
    /// bottom-left, bottom-right.
    pub fn with_corners(rays: &'a mut [Ray; PACKET_SIZE], corners: [usize; 4]) -> RayPacket<'a> {
        assert!(corners.iter().all(|&c| c < PACKET_SIZE));
        RayPacket { rays, corners }
    }
}

/// One outward-facing bounding plane of the packet frustum, with the AABB
/// corner selectors for its signed-vertex test.
struct FrustumPlane {
    normal: WorldVector,
    d: f32,
    corner: usize,
}

impl FrustumPlane {
    /// Plane through `origin`, `edge_a` and `edge_b`, oriented so that
    /// `inside` ends up on the non-culled side regardless of the corner
    /// winding of the packet.
    fn new(
        origin: &WorldPoint,
        edge_a: &WorldPoint,
        edge_b: &WorldPoint,
        inside: &WorldPoint,
    ) -> FrustumPlane {
        let mut normal = (edge_a - origin).cross(&(edge_a - edge_b)).normalize();
        let mut d = origin.coords.dot(&normal);
        if inside.coords.dot(&normal) > d {
            normal = -normal;
            d = -d;
        }
        // index bits select the box corner minimizing dot(corner, normal)
        let corner = (if normal.x < 0.0 { 1 } else { 0 })
            | (if normal.y < 0.0 { 2 } else { 0 })
            | (if normal.z < 0.0 { 4 } else { 0 });
        FrustumPlane { normal, d, corner }
    }

    /// True when the whole box lies outside this plane.
    fn culls(&self, node: &BvhNode) -> bool {
        let p = node.aabb().corner(self.corner);
        p.coords.dot(&self.normal) > self.d
    }
}

impl Bvh {
    /// Traces all 256 rays of the packet, front to back, with conservative
    /// frustum culling. Per-ray results are identical to tracing each ray
    /// with [`Bvh::intersect`].
    pub fn intersect_packet(&self, packet: RayPacket, verts: VertexSlice) {
        let rays = packet.rays;
        let origin = rays[0].origin;
        debug_assert!(
            rays.iter().all(|r| r.origin == origin),
            "packet rays must share their origin"
        );

        // the four bounding planes, normals pointing outwards
        let tl = rays[packet.corners[0]].point_at(1.0);
        let tr = rays[packet.corners[1]].point_at(1.0);
        let bl = rays[packet.corners[2]].point_at(1.0);
        let br = rays[packet.corners[3]].point_at(1.0);
        let center = WorldPoint::from(
            (tl.coords + tr.coords + bl.coords + br.coords) / 4.0,
        );
        let planes = [
            FrustumPlane::new(&origin, &tl, &bl, &center), // left
            FrustumPlane::new(&origin, &br, &tr, &center), // right
            FrustumPlane::new(&origin, &tr, &tl, &center), // top
            FrustumPlane::new(&origin, &bl, &br, &center), // bottom
        ];

        // stack entries pack the active interval as first << 8 | last
        let mut stack: ArrayVec<(NodeIdx, u32), TRAVERSAL_STACK_DEPTH> = ArrayVec::new();
        let mut node_idx = NodeIdx::from_usize(0);
        let mut first = 0usize;
        let mut last = PACKET_SIZE - 1;
        loop {
            let node = &self.nodes[node_idx];
            if node.is_leaf() {
                for i in 0..node.tri_count {
                    let prim = self.prim_idx[(node.left_first + i) as usize];
                    let tri = verts.triangle(prim);
                    let edge1 = tri[1] - tri[0];
                    let edge2 = tri[2] - tri[0];
                    let s = origin - tri[0];
                    for ray in rays[first..=last].iter_mut() {
                        let h = ray.direction.cross(&edge2);
                        let det = edge1.dot(&h);
                        if det.abs() < TRI_EPSILON {
                            continue;
                        }
                        let f = 1.0 / det;
                        let u = f * s.dot(&h);
                        if !(0.0..=1.0).contains(&u) {
                            continue;
                        }
                        let q = s.cross(&edge1);
                        let v = f * ray.direction.dot(&q);
                        if v < 0.0 || u + v > 1.0 {
                            continue;
                        }
                        let t = f * edge2.dot(&q);
                        if t <= 0.0 || t >= ray.hit.t {
                            continue;
                        }
                        ray.hit.t = t;
                        ray.hit.u = u;
                        ray.hit.v = v;
                        ray.hit.prim = prim;
                    }
                }
                match stack.pop() {
                    Some((idx, interval)) => {
                        node_idx = idx;
                        first = (interval >> 8) as usize;
                        last = (interval & 255) as usize;
                    }
                    None => break,
                }
                continue;
            }

            let left_idx = node.left_child();
            let right_idx = left_idx + 1;
            let left = self.visit_child(&self.nodes[left_idx], rays, &planes, first, last);
            let right = self.visit_child(&self.nodes[right_idx], rays, &planes, first, last);
            match (left, right) {
                (Some(l), Some(r)) => {
                    // both children hit: near first, far deferred
                    let (near_idx, near, far_idx, far) = if l.dist < r.dist {
                        (left_idx, l, right_idx, r)
                    } else {
                        (right_idx, r, left_idx, l)
                    };
                    debug_assert!(!stack.is_full(), "packet traversal stack overflow");
                    stack.push((far_idx, (far.first << 8 | far.last) as u32));
                    node_idx = near_idx;
                    first = near.first;
                    last = near.last;
                }
                (Some(l), None) => {
                    node_idx = left_idx;
                    first = l.first;
                    last = l.last;
                }
                (None, Some(r)) => {
                    node_idx = right_idx;
                    first = r.first;
                    last = r.last;
                }
                (None, None) => match stack.pop() {
                    Some((idx, interval)) => {
                        node_idx = idx;
                        first = (interval >> 8) as usize;
                        last = (interval & 255) as usize;
                    }
                    None => break,
                },
            }
        }
    }

    /// Decides whether the packet visits `child`, tightening the active
    /// interval: early-in if the first active ray hits, early-out if the
    /// node is outside a frustum plane, otherwise scan from both ends.
    fn visit_child(
        &self,
        child: &BvhNode,
        rays: &[Ray; PACKET_SIZE],
        planes: &[FrustumPlane; 4],
        first: usize,
        last: usize,
    ) -> Option<ActiveInterval> {
        let slab = |ray: &Ray| -> Option<f32> {
            let t1 = (child.aabb_min - ray.origin).component_mul(&ray.inv_direction);
            let t2 = (child.aabb_max - ray.origin).component_mul(&ray.inv_direction);
            let tmin = t1.inf(&t2).max();
            let tmax = t1.sup(&t2).min();
            (tmax >= tmin && tmin < ray.hit.t && tmax >= 0.0).then_some(tmin)
        };

        // 1. early in: first active ray hits, whole packet visits
        if let Some(dist) = slab(&rays[first]) {
            return Some(ActiveInterval { first, last, dist });
        }
        // 2. early out: fully outside one of the frustum planes
        if planes.iter().any(|p| p.culls(child)) {
            return None;
        }
        // 3. tighten the interval from both ends
        let mut first = first;
        let mut last = last;
        let mut dist = BVH_FAR;
        while first <= last {
            if let Some(d) = slab(&rays[first]) {
                dist = d;
                break;
            }
            first += 1;
        }
        while last > first {
            if slab(&rays[last]).is_some() {
                break;
            }
            last -= 1;
        }
        (first <= last && dist < BVH_FAR).then_some(ActiveInterval { first, last, dist })
    }
}

struct ActiveInterval {
    first: usize,
    last: usize,
    dist: f32,
}
