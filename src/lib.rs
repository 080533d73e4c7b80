//! Bounding volume hierarchies over triangle soups and AABB soups:
//! binned-SAH, spatial-split and midpoint builders for a canonical 2-wide
//! tree; refitting and insertion-based optimization; conversions into
//! SIMD- and GPU-friendly node layouts; single-ray, shadow-ray and
//! 256-ray-packet traversal; and a two-level structure for instanced
//! scenes.

pub mod bvh;
pub mod geometry;
pub mod layouts;
pub mod tlas;
pub mod verbose;
mod util;

pub use bvh::{Bvh, BvhNode, Fragment, NodeIdx, RayPacket, ValidationError};
pub use geometry::{Hit, Ray, VertexSlice};
pub use layouts::{Bvh4, Bvh4Cpu, Bvh4Gpu, Bvh8, CwBvh, CwBvhTriangles, GpuBvh, SoaBvh};
pub use tlas::{Blas, BlasInstance, Tlas};
pub use verbose::VerboseBvh;
