//! Two-level acceleration: a top-level tree built over the world-space
//! bounds of transformed instances of bottom-level trees. A scene composes
//! any number of meshes, each possibly instanced many times with its own
//! transform, without rebuilding the per-mesh trees.

use assert2::assert;
use nalgebra::Matrix4;

use crate::bvh::Bvh;
use crate::geometry::{FloatType, Hit, Ray, VertexSlice, WorldBox, WorldPoint, WorldVector};

/// Bottom-level tree plus the vertex data it was built over.
#[derive(Copy, Clone)]
pub struct Blas<'a> {
    pub bvh: &'a Bvh,
    pub verts: VertexSlice<'a>,
}

/// One placement of a bottom-level tree in the scene.
#[derive(Clone, Debug)]
pub struct BlasInstance {
    /// Index into the caller's BLAS list.
    pub blas: u32,
    /// Row-major object-to-world transform.
    pub transform: Matrix4<FloatType>,
    /// World-space bounds of the transformed BLAS root; kept current by
    /// [`BlasInstance::update`].
    pub world_bounds: WorldBox,
    inv_transform: Matrix4<FloatType>,
}

impl BlasInstance {
    pub fn new(blas: u32, transform: Matrix4<FloatType>) -> BlasInstance {
        BlasInstance {
            blas,
            transform,
            world_bounds: WorldBox::EMPTY,
            inv_transform: Matrix4::identity(),
        }
    }

    /// Transforms the eight corners of the BLAS root bounds and takes
    /// their hull. Must be called after changing the transform and before
    /// rebuilding the top-level tree.
    pub fn update(&mut self, blas_root_bounds: &WorldBox) {
        self.inv_transform = self
            .transform
            .try_inverse()
            .expect("instance transform must be invertible");
        let mut bounds = WorldBox::EMPTY;
        for i in 0..8 {
            bounds.grow(&self.transform_point(&blas_root_bounds.corner(i)));
        }
        self.world_bounds = bounds;
    }

    pub fn transform_point(&self, p: &WorldPoint) -> WorldPoint {
        self.transform.transform_point(p)
    }

    fn inverse_transform_point(&self, p: &WorldPoint) -> WorldPoint {
        self.inv_transform.transform_point(p)
    }

    /// Rotation/scale part only; no translation. The result is
    /// deliberately not normalized so hit distances keep their meaning
    /// across the transform.
    fn inverse_transform_vector(&self, v: &WorldVector) -> WorldVector {
        self.inv_transform.transform_vector(v)
    }
}

/// Top-level tree over instance bounds. The hit `prim` field packs the
/// instance index into its high bits; `inst_bits` configures the split.
pub struct Tlas {
    bvh: Bvh,
    instances: Vec<BlasInstance>,
    inst_bits: u32,
}

impl Default for Tlas {
    fn default() -> Self {
        Tlas {
            bvh: Bvh::new(),
            instances: Vec::new(),
            inst_bits: 8,
        }
    }
}

impl Tlas {
    pub fn new() -> Tlas {
        Tlas::default()
    }

    /// Number of high bits of the hit `prim` field used for the instance
    /// index; the rest holds the primitive index inside the instance.
    pub fn with_inst_bits(inst_bits: u32) -> Tlas {
        assert!(inst_bits >= 1 && inst_bits <= 16);
        Tlas {
            inst_bits,
            ..Tlas::default()
        }
    }

    /// Updates every instance's world bounds against its BLAS and builds
    /// the top-level tree over them.
    pub fn build(&mut self, mut instances: Vec<BlasInstance>, blases: &[Blas]) {
        assert!(!instances.is_empty(), "building a TLAS over zero instances");
        assert!(
            (instances.len() as u64) <= 1u64 << self.inst_bits,
            "instance count exceeds the configured index bits"
        );
        for inst in &mut instances {
            let blas = &blases[inst.blas as usize];
            inst.update(&blas.bvh.bounds());
        }
        let bounds: Vec<WorldBox> = instances.iter().map(|i| i.world_bounds).collect();
        self.bvh
            .build_over_aabbs(bounds.len(), |i| bounds[i as usize]);
        self.instances = instances;
    }

    pub fn instances(&self) -> &[BlasInstance] {
        &self.instances
    }

    pub fn bvh(&self) -> &Bvh {
        &self.bvh
    }

    /// Splits a packed hit `prim` field back into (instance, primitive).
    pub fn unpack_hit(&self, prim: u32) -> (u32, u32) {
        (prim >> (32 - self.inst_bits), prim & self.prim_mask())
    }

    fn prim_mask(&self) -> u32 {
        (1u32 << (32 - self.inst_bits)) - 1
    }

    /// Closest-hit through both levels. At each top-level leaf the ray is
    /// transformed into the instance's local space (direction length
    /// preserved) and the bottom-level tree is traversed; the winning hit
    /// carries the packed instance and primitive index.
    pub fn intersect(&self, ray: &mut Ray, blases: &[Blas]) -> u32 {
        let inst_shift = 32 - self.inst_bits;
        let prim_mask = self.prim_mask();
        let mut blas_steps = 0;
        let tlas_steps = self.bvh.intersect_custom(ray, |ray, inst_idx| {
            let inst = &self.instances[inst_idx as usize];
            let blas = &blases[inst.blas as usize];
            let mut local = Ray::with_max_t(
                inst.inverse_transform_point(&ray.origin),
                inst.inverse_transform_vector(&ray.direction),
                ray.hit.t,
            );
            blas_steps += blas.bvh.intersect(&mut local, blas.verts);
            if local.hit.t < ray.hit.t {
                ray.hit = Hit {
                    prim: (inst_idx << inst_shift) | (local.hit.prim & prim_mask),
                    ..local.hit
                };
            }
        });
        tlas_steps + blas_steps
    }

    /// Any-hit through both levels.
    pub fn is_occluded(&self, ray: &Ray, blases: &[Blas]) -> bool {
        self.bvh.occluded_custom(ray, |ray, inst_idx| {
            let inst = &self.instances[inst_idx as usize];
            let blas = &blases[inst.blas as usize];
            let local = Ray::with_max_t(
                inst.inverse_transform_point(&ray.origin),
                inst.inverse_transform_vector(&ray.direction),
                ray.hit.t,
            );
            blas.bvh.is_occluded(&local, blas.verts)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert2::assert;
    use nalgebra::Matrix4;

    use crate::bvh::test_geometry::{one_triangle, triangle_grid};
    use crate::geometry::BVH_FAR;

    fn translation(x: f32, y: f32, z: f32) -> Matrix4<f32> {
        Matrix4::new_translation(&WorldVector::new(x, y, z))
    }

    #[test]
    fn instance_bounds_follow_transform() {
        let verts = one_triangle();
        let bvh = Bvh::from_verts(&verts[..]);
        let mut inst = BlasInstance::new(0, translation(5.0, 0.0, 0.0));
        inst.update(&bvh.bounds());
        assert!(inst.world_bounds.min == WorldPoint::new(5.0, 0.0, 0.0));
        assert!(inst.world_bounds.max == WorldPoint::new(6.0, 1.0, 0.0));
    }

    #[test]
    fn translated_instance_is_hit() {
        let verts = one_triangle();
        let bvh = Bvh::from_verts(&verts[..]);
        let slice = VertexSlice::from(&verts[..]);
        let blases = [Blas {
            bvh: &bvh,
            verts: slice,
        }];

        let mut tlas = Tlas::new();
        tlas.build(vec![BlasInstance::new(0, translation(5.0, 0.0, 0.0))], &blases);

        let mut ray = Ray::new(
            WorldPoint::new(5.25, 0.25, -1.0),
            WorldVector::new(0.0, 0.0, 1.0),
        );
        tlas.intersect(&mut ray, &blases);
        assert!(ray.hit.t == 1.0);
        let (inst, prim) = tlas.unpack_hit(ray.hit.prim);
        assert!(inst == 0);
        assert!(prim == 0);
    }

    #[test]
    fn nearest_of_two_instances_wins() {
        let verts = one_triangle();
        let bvh = Bvh::from_verts(&verts[..]);
        let slice = VertexSlice::from(&verts[..]);
        let blases = [Blas {
            bvh: &bvh,
            verts: slice,
        }];

        let mut tlas = Tlas::new();
        tlas.build(
            vec![
                BlasInstance::new(0, translation(0.0, 0.0, 3.0)),
                BlasInstance::new(0, translation(0.0, 0.0, 1.0)),
            ],
            &blases,
        );

        let mut ray = Ray::new(
            WorldPoint::new(0.25, 0.25, 0.0),
            WorldVector::new(0.0, 0.0, 1.0),
        );
        tlas.intersect(&mut ray, &blases);
        assert!(ray.hit.t == 1.0);
        let (inst, _) = tlas.unpack_hit(ray.hit.prim);
        assert!(inst == 1);
    }

    #[test]
    fn rotated_instance_preserves_distance() {
        let verts = one_triangle();
        let bvh = Bvh::from_verts(&verts[..]);
        let slice = VertexSlice::from(&verts[..]);
        let blases = [Blas {
            bvh: &bvh,
            verts: slice,
        }];

        // rotate the triangle 90 degrees around y, then hit it from the
        // side it now faces
        let rotation =
            Matrix4::from_axis_angle(&WorldVector::y_axis(), std::f32::consts::FRAC_PI_2);
        let mut tlas = Tlas::new();
        tlas.build(vec![BlasInstance::new(0, rotation)], &blases);

        // the rotated triangle spans z in [-1, 0] at x = 0
        let mut ray = Ray::new(
            WorldPoint::new(-2.0, 0.25, -0.25),
            WorldVector::new(1.0, 0.0, 0.0),
        );
        tlas.intersect(&mut ray, &blases);
        assert!((ray.hit.t - 2.0).abs() < 1e-5);
    }

    #[test]
    fn occlusion_through_instances() {
        let verts = triangle_grid(4);
        let bvh = Bvh::from_verts(&verts[..]);
        let slice = VertexSlice::from(&verts[..]);
        let blases = [Blas {
            bvh: &bvh,
            verts: slice,
        }];

        let mut tlas = Tlas::new();
        tlas.build(vec![BlasInstance::new(0, translation(0.0, 0.0, 2.0))], &blases);

        let blocked = Ray::new(
            WorldPoint::new(0.3, 0.3, 0.0),
            WorldVector::new(0.0, 0.0, 1.0),
        );
        assert!(tlas.is_occluded(&blocked, &blases));

        let free = Ray::new(
            WorldPoint::new(0.3, 0.3, 0.0),
            WorldVector::new(0.0, 0.0, -1.0),
        );
        assert!(!tlas.is_occluded(&free, &blases));
    }

    #[test]
    fn miss_keeps_ray_unchanged() {
        let verts = one_triangle();
        let bvh = Bvh::from_verts(&verts[..]);
        let slice = VertexSlice::from(&verts[..]);
        let blases = [Blas {
            bvh: &bvh,
            verts: slice,
        }];
        let mut tlas = Tlas::new();
        tlas.build(vec![BlasInstance::new(0, translation(5.0, 0.0, 0.0))], &blases);

        let mut ray = Ray::new(
            WorldPoint::new(0.0, 0.0, -1.0),
            WorldVector::new(0.0, 0.0, 1.0),
        );
        tlas.intersect(&mut ray, &blases);
        assert!(ray.hit.t == BVH_FAR);
    }
}
