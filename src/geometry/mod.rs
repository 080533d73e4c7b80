mod aabb;
mod ray_box_intersection;
mod ray_triangle_intersection;
mod triangle;

use nalgebra::{Point3, Vector3, Vector4};

pub use aabb::Aabb;
pub use ray_box_intersection::{slab_test, RayIntersectionExt};
pub use ray_triangle_intersection::{intersect_triangle, triangle_occludes, PrecomputedTriangle};
pub use triangle::Triangle;

pub type FloatType = f32;
pub type SimdF32x8 = simba::simd::WideF32x8;

/// Distance value treated as "infinitely far" by the traversal kernels.
/// Kept finite so arithmetic on it (subtraction, scaling) stays well-behaved.
pub const BVH_FAR: FloatType = 1e30;

/// Error tolerance for general-purpose comparisons. This is not machine
/// epsilon ([`f32::EPSILON`]).
pub const EPSILON: FloatType = 1e-6;

/// Rejection threshold for the ray/triangle determinant.
pub const TRI_EPSILON: FloatType = 1e-7;

pub type WorldPoint = Point3<FloatType>;
pub type WorldVector = Vector3<FloatType>;
pub type WorldBox = Aabb<WorldPoint>;

pub type WorldPoint8 = Point3<SimdF32x8>;
pub type WorldBox8 = Aabb<WorldPoint8>;

/// Input vertex: x, y, z position plus one lane of user payload
/// (a packed color, a material id, ...). The payload lane is carried along
/// untouched by every builder.
pub type Vec4 = Vector4<FloatType>;

/// Triangle vertex input for the builders: a flat f32 buffer with a
/// configurable stride, so callers with interleaved vertex formats don't
/// have to repack. Vertex `i` starts at `data[i * stride]` and is read as
/// four consecutive floats.
#[derive(Copy, Clone, Debug)]
pub struct VertexSlice<'a> {
    data: &'a [f32],
    stride: usize,
}

impl<'a> VertexSlice<'a> {
    /// `stride` is in floats and must be at least 4 (16 bytes).
    pub fn new(data: &'a [f32], stride: usize) -> VertexSlice<'a> {
        assert!(stride >= 4, "vertex stride must be at least 4 floats");
        VertexSlice { data, stride }
    }

    /// Number of vertices in the slice.
    pub fn len(&self) -> usize {
        if self.data.len() < 4 {
            0
        } else {
            (self.data.len() - 4) / self.stride + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of triangles (three vertices each).
    pub fn tri_count(&self) -> usize {
        self.len() / 3
    }

    pub fn vertex(&self, i: usize) -> Vec4 {
        let at = i * self.stride;
        Vec4::new(
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        )
    }

    pub fn position(&self, i: usize) -> WorldPoint {
        let at = i * self.stride;
        WorldPoint::new(self.data[at], self.data[at + 1], self.data[at + 2])
    }

    /// The three corners of triangle `prim`.
    pub fn triangle(&self, prim: u32) -> Triangle<WorldPoint> {
        let v = prim as usize * 3;
        Triangle::new(self.position(v), self.position(v + 1), self.position(v + 2))
    }
}

impl<'a> From<&'a [[f32; 4]]> for VertexSlice<'a> {
    fn from(value: &'a [[f32; 4]]) -> VertexSlice<'a> {
        VertexSlice::new(value.as_flattened(), 4)
    }
}

/// Intersection result. Sized to fit four 32-bit values so it can be stored
/// in GPU-side buffers unchanged.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Hit {
    /// Distance along the ray.
    pub t: FloatType,
    /// Barycentric u of the intersection.
    pub u: FloatType,
    /// Barycentric v of the intersection.
    pub v: FloatType,
    /// Primitive index. For two-level traversal the instance index is packed
    /// into the high bits.
    pub prim: u32,
}

impl Hit {
    pub fn none() -> Hit {
        Hit {
            t: BVH_FAR,
            u: 0.0,
            v: 0.0,
            prim: u32::MAX,
        }
    }
}

/// Ray through the scene. The direction is used as given; it is *not*
/// renormalized, so reported hit distances stay consistent when a ray is
/// transformed into instance-local space.
#[derive(Copy, Clone, Debug)]
pub struct Ray {
    pub origin: WorldPoint,
    pub direction: WorldVector,
    /// Componentwise safe reciprocal of the direction. Components with
    /// magnitude below 1e-12 map to an infinity carrying the same sign.
    pub inv_direction: WorldVector,
    pub hit: Hit,
}

impl Ray {
    pub fn new(origin: WorldPoint, direction: WorldVector) -> Ray {
        Ray::with_max_t(origin, direction, BVH_FAR)
    }

    /// A ray that only reports hits closer than `max_t`.
    pub fn with_max_t(origin: WorldPoint, direction: WorldVector, max_t: FloatType) -> Ray {
        Ray {
            origin,
            direction,
            inv_direction: direction.map(safe_rcp),
            hit: Hit {
                t: max_t,
                ..Hit::none()
            },
        }
    }

    pub fn point_at(&self, distance: FloatType) -> WorldPoint {
        self.origin + self.direction * distance
    }
}

fn safe_rcp(x: FloatType) -> FloatType {
    if x.abs() < 1e-12 {
        FloatType::INFINITY.copysign(x)
    } else {
        1.0 / x
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert2::assert;

    #[test]
    fn safe_rcp_signs() {
        assert!(safe_rcp(2.0) == 0.5);
        assert!(safe_rcp(0.0) == f32::INFINITY);
        assert!(safe_rcp(-0.0) == f32::NEG_INFINITY);
        assert!(safe_rcp(1e-13) == f32::INFINITY);
        assert!(safe_rcp(-1e-13) == f32::NEG_INFINITY);
    }

    #[test]
    fn vertex_slice_strided() {
        // Two vertices with two floats of padding between them.
        let data = [
            1.0, 2.0, 3.0, 0.5, 9.0, 9.0, //
            4.0, 5.0, 6.0, 0.25, 9.0, 9.0,
        ];
        let slice = VertexSlice::new(&data, 6);
        assert!(slice.len() == 2);
        assert!(slice.vertex(0) == Vec4::new(1.0, 2.0, 3.0, 0.5));
        assert!(slice.vertex(1) == Vec4::new(4.0, 5.0, 6.0, 0.25));
        assert!(slice.position(1) == WorldPoint::new(4.0, 5.0, 6.0));
    }

    #[test]
    fn vertex_slice_from_arrays() {
        let data = [[0.0, 0.0, 0.0, 0.0], [1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]];
        let slice = VertexSlice::from(&data[..]);
        assert!(slice.len() == 3);
        assert!(slice.tri_count() == 1);
        let tri = slice.triangle(0);
        assert!(tri[1] == WorldPoint::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn ray_carries_max_t() {
        let ray = Ray::with_max_t(
            WorldPoint::origin(),
            WorldVector::new(0.0, 0.0, 1.0),
            25.0,
        );
        assert!(ray.hit.t == 25.0);
        assert!(ray.hit.prim == u32::MAX);
    }
}
