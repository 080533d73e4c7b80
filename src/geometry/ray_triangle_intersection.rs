use super::{FloatType, Ray, WorldPoint, WorldVector, TRI_EPSILON};

/// Möller–Trumbore ray/triangle test. On a hit closer than the current
/// `ray.hit.t`, shortens the ray and records `(t, u, v, prim)`; returns
/// whether that happened.
pub fn intersect_triangle(
    ray: &mut Ray,
    v0: &WorldPoint,
    v1: &WorldPoint,
    v2: &WorldPoint,
    prim: u32,
) -> bool {
    let edge1 = v1 - v0;
    let edge2 = v2 - v0;
    let h = ray.direction.cross(&edge2);
    let det = edge1.dot(&h);
    if det.abs() < TRI_EPSILON {
        return false; // ray parallel to triangle
    }
    let f = 1.0 / det;
    let s = ray.origin - v0;
    let u = f * s.dot(&h);
    if !(0.0..=1.0).contains(&u) {
        return false;
    }
    let q = s.cross(&edge1);
    let v = f * ray.direction.dot(&q);
    if v < 0.0 || u + v > 1.0 {
        return false;
    }
    let t = f * edge2.dot(&q);
    if t > 0.0 && t < ray.hit.t {
        ray.hit.t = t;
        ray.hit.u = u;
        ray.hit.v = v;
        ray.hit.prim = prim;
        true
    } else {
        false
    }
}

/// Möller–Trumbore predicate form: does the triangle block the ray before
/// its current `hit.t`? Does not modify the ray.
pub fn triangle_occludes(ray: &Ray, v0: &WorldPoint, v1: &WorldPoint, v2: &WorldPoint) -> bool {
    let edge1 = v1 - v0;
    let edge2 = v2 - v0;
    let h = ray.direction.cross(&edge2);
    let det = edge1.dot(&h);
    if det.abs() < TRI_EPSILON {
        return false;
    }
    let f = 1.0 / det;
    let s = ray.origin - v0;
    let u = f * s.dot(&h);
    if !(0.0..=1.0).contains(&u) {
        return false;
    }
    let q = s.cross(&edge1);
    let v = f * ray.direction.dot(&q);
    if v < 0.0 || u + v > 1.0 {
        return false;
    }
    let t = f * edge2.dot(&q);
    t > 0.0 && t < ray.hit.t
}

/// Triangle in the coordinate-transform form of Baldwin & Weber: a 4x3
/// affine map whose application reduces the intersection test to two dot
/// products and a ratio. Stored as four rows of four floats; the last row
/// is `(0, 0, 0, prim-index-bits)` so a block drops straight into GPU
/// buffers.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct PrecomputedTriangle {
    pub rows: [[FloatType; 4]; 4],
}

impl PrecomputedTriangle {
    pub fn new(v0: &WorldPoint, v1: &WorldPoint, v2: &WorldPoint, prim: u32) -> Self {
        let e1 = v1 - v0;
        let e2 = v2 - v0;
        let n = e1.cross(&e2);
        let d = v0.coords.dot(&n);
        let mut t = [[0.0f32; 4]; 4];
        if n.x.abs() > n.y.abs() && n.x.abs() > n.z.abs() {
            let x1 = v1.y * v0.z - v1.z * v0.y;
            let x2 = v2.y * v0.z - v2.z * v0.y;
            let rn = 1.0 / n.x;
            t[0] = [0.0, e2.z * rn, -e2.y * rn, x2 * rn];
            t[1] = [0.0, -e1.z * rn, e1.y * rn, -x1 * rn];
            t[2] = [1.0, n.y * rn, n.z * rn, -d * rn];
        } else if n.y.abs() > n.z.abs() {
            let x1 = v1.z * v0.x - v1.x * v0.z;
            let x2 = v2.z * v0.x - v2.x * v0.z;
            let rn = 1.0 / n.y;
            t[0] = [-e2.z * rn, 0.0, e2.x * rn, x2 * rn];
            t[1] = [e1.z * rn, 0.0, -e1.x * rn, -x1 * rn];
            t[2] = [n.x * rn, 1.0, n.z * rn, -d * rn];
        } else if n.z.abs() > 0.0 {
            let x1 = v1.x * v0.y - v1.y * v0.x;
            let x2 = v2.x * v0.y - v2.y * v0.x;
            let rn = 1.0 / n.z;
            t[0] = [e2.y * rn, -e2.x * rn, 0.0, x2 * rn];
            t[1] = [-e1.y * rn, e1.x * rn, 0.0, -x1 * rn];
            t[2] = [n.x * rn, n.y * rn, 1.0, -d * rn];
        }
        // degenerate triangles leave an all-zero transform, which never
        // produces a finite intersection distance
        t[3] = [0.0, 0.0, 0.0, f32::from_bits(prim)];
        PrecomputedTriangle { rows: t }
    }

    pub fn prim(&self) -> u32 {
        self.rows[3][3].to_bits()
    }

    /// Closest-hit test; shortens the ray on success.
    pub fn intersect(&self, ray: &mut Ray) -> bool {
        let t2 = &self.rows[2];
        let trans_s =
            t2[0] * ray.origin.x + t2[1] * ray.origin.y + t2[2] * ray.origin.z + t2[3];
        let trans_d = t2[0] * ray.direction.x + t2[1] * ray.direction.y + t2[2] * ray.direction.z;
        let t = -trans_s / trans_d;
        if t <= 0.0 || t >= ray.hit.t {
            return false;
        }
        let w = ray.point_at(t);
        let t0 = &self.rows[0];
        let t1 = &self.rows[1];
        let u = t0[0] * w.x + t0[1] * w.y + t0[2] * w.z + t0[3];
        let v = t1[0] * w.x + t1[1] * w.y + t1[2] * w.z + t1[3];
        if u >= 0.0 && v >= 0.0 && u + v < 1.0 {
            ray.hit.t = t;
            ray.hit.u = u;
            ray.hit.v = v;
            ray.hit.prim = self.prim();
            true
        } else {
            false
        }
    }

    /// Occlusion test; does not modify the ray.
    pub fn occludes(&self, ray: &Ray) -> bool {
        let t2 = &self.rows[2];
        let trans_s =
            t2[0] * ray.origin.x + t2[1] * ray.origin.y + t2[2] * ray.origin.z + t2[3];
        let trans_d = t2[0] * ray.direction.x + t2[1] * ray.direction.y + t2[2] * ray.direction.z;
        let t = -trans_s / trans_d;
        if t <= 0.0 || t >= ray.hit.t {
            return false;
        }
        let w = ray.point_at(t);
        let t0 = &self.rows[0];
        let t1 = &self.rows[1];
        let u = t0[0] * w.x + t0[1] * w.y + t0[2] * w.z + t0[3];
        let v = t1[0] * w.x + t1[1] * w.y + t1[2] * w.z + t1[3];
        u >= 0.0 && v >= 0.0 && u + v < 1.0
    }
}
