//! Alternative node layouts, each produced by a lossless conversion from
//! the canonical 2-wide tree and traversed by its own kernel. A converted
//! tree either owns its source or borrows it; a borrowed source cannot be
//! rebuilt or dropped while the converted form is alive.

mod bvh4_cpu;
mod bvh4_gpu;
mod cwbvh;
mod gpu2;
mod soa;
mod wide;

use std::borrow::Cow;

use crate::bvh::Bvh;

pub use bvh4_cpu::{Bvh4Cpu, Bvh4CpuNode};
pub use bvh4_gpu::Bvh4Gpu;
pub use cwbvh::{CwBvh, CwBvhTriangles};
pub use gpu2::{GpuBvh, GpuNode};
pub use soa::{SoaBvh, SoaNode};
pub use wide::{Bvh4, Bvh8, WideBvh, WideNode};

pub(crate) type SourceBvh<'a> = Cow<'a, Bvh>;

/// Blocks of 16 bytes, the unit in which the GPU-oriented layouts address
/// their buffers.
pub type Block = [f32; 4];

pub(crate) fn f32_from_bytes(b: [u8; 4]) -> f32 {
    f32::from_bits(u32::from_le_bytes(b))
}

pub(crate) fn bytes_from_f32(f: f32) -> [u8; 4] {
    f.to_bits().to_le_bytes()
}

#[cfg(test)]
mod test {
    use super::*;

    use assert2::assert;
    use test_strategy::proptest;

    use crate::bvh::test_geometry::triangle_grid;
    use crate::geometry::{Ray, VertexSlice, WorldPoint, WorldVector};

    /// Every layout must agree with the canonical traversal on the same
    /// ray, within the tolerance of its triangle test formulation.
    #[proptest]
    fn all_layouts_agree(
        #[strategy(0.0f32..8.0)] ox: f32,
        #[strategy(0.0f32..8.0)] oy: f32,
        #[strategy(-0.2f32..0.2)] dx: f32,
        #[strategy(-0.2f32..0.2)] dy: f32,
    ) {
        let verts = triangle_grid(8);
        let slice = VertexSlice::from(&verts[..]);
        let bvh = Bvh::from_verts(&verts[..]);

        let origin = WorldPoint::new(ox, oy, -2.0);
        let direction = WorldVector::new(dx, dy, 1.0);
        let mut reference = Ray::new(origin, direction);
        bvh.intersect(&mut reference, slice);

        let mut rays = [Ray::new(origin, direction); 6];
        GpuBvh::from_bvh(&bvh).intersect(&mut rays[0], slice);
        SoaBvh::from_bvh(&bvh).intersect(&mut rays[1], slice);
        Bvh4::from_bvh(&bvh).intersect(&mut rays[2], slice);
        Bvh8::from_bvh(&bvh).intersect(&mut rays[3], slice);
        let mut wide8 = Bvh8::from_bvh(&bvh);
        CwBvh::from_bvh8(&mut wide8, slice, CwBvhTriangles::Vertices).intersect(&mut rays[4]);
        Bvh4Gpu::from_bvh4(&Bvh4::from_bvh(&bvh), slice).intersect(&mut rays[5]);

        for (i, ray) in rays.iter().enumerate() {
            assert!(ray.hit.t == reference.hit.t, "layout {i} distance");
            assert!(ray.hit.prim == reference.hit.prim, "layout {i} prim");
        }

        // the transformed-triangle layout rounds differently
        let mut bw_ray = Ray::new(origin, direction);
        Bvh4Cpu::build(&verts[..]).intersect(&mut bw_ray);
        if reference.hit.t < crate::geometry::BVH_FAR {
            assert!((bw_ray.hit.t - reference.hit.t).abs() < 1e-4 * reference.hit.t.max(1.0));
        } else {
            assert!(bw_ray.hit.t == reference.hit.t);
        }
    }
}
