use criterion::{black_box, criterion_group, criterion_main, Criterion};
use minibvh::{
    geometry::{Ray, VertexSlice, WorldPoint, WorldVector},
    Bvh, Bvh4Cpu, CwBvh, CwBvhTriangles, SoaBvh,
};

/// Procedural test scene: a bumpy sphere shell of `rings * segments * 2`
/// triangles, so bench results don't depend on asset files.
fn sphere_shell(rings: usize, segments: usize) -> Vec<[f32; 4]> {
    let mut verts = Vec::with_capacity(rings * segments * 6);
    let position = |ring: usize, seg: usize| -> [f32; 4] {
        let theta = ring as f32 / rings as f32 * std::f32::consts::PI;
        let phi = seg as f32 / segments as f32 * std::f32::consts::TAU;
        let bump = 1.0 + 0.05 * ((ring * 7 + seg * 3) % 13) as f32 / 13.0;
        [
            bump * theta.sin() * phi.cos(),
            bump * theta.sin() * phi.sin(),
            bump * theta.cos(),
            0.0,
        ]
    };
    for ring in 0..rings {
        for seg in 0..segments {
            let a = position(ring, seg);
            let b = position(ring + 1, seg);
            let c = position(ring, (seg + 1) % segments);
            let d = position(ring + 1, (seg + 1) % segments);
            verts.extend([a, b, c]);
            verts.extend([c, b, d]);
        }
    }
    verts
}

fn camera_rays(n: usize) -> Vec<Ray> {
    let origin = WorldPoint::new(0.0, 0.0, 3.0);
    (0..n * n)
        .map(|i| {
            let x = (i % n) as f32 / n as f32 - 0.5;
            let y = (i / n) as f32 / n as f32 - 0.5;
            Ray::new(origin, WorldVector::new(x, y, -1.0))
        })
        .collect()
}

fn criterion_benchmark(c: &mut Criterion) {
    let verts = sphere_shell(64, 128);
    let slice = VertexSlice::from(&verts[..]);
    let rays = camera_rays(256);

    c.bench_function("build_binned", |b| {
        b.iter(|| {
            let mut bvh = Bvh::new();
            bvh.build(black_box(slice));
            bvh
        })
    });

    c.bench_function("build_simd", |b| {
        b.iter(|| {
            let mut bvh = Bvh::new();
            bvh.build_simd(black_box(slice));
            bvh
        })
    });

    c.bench_function("build_hq", |b| {
        b.iter(|| {
            let mut bvh = Bvh::new();
            bvh.build_hq(black_box(slice));
            bvh
        })
    });

    let bvh = Bvh::from_verts(&verts[..]);
    c.bench_function("trace_canonical", |b| {
        b.iter(|| {
            let mut hits = 0u32;
            for ray in &rays {
                let mut ray = *ray;
                bvh.intersect(&mut ray, slice);
                hits += (ray.hit.prim != u32::MAX) as u32;
            }
            hits
        })
    });

    let soa = SoaBvh::from_bvh(&bvh);
    c.bench_function("trace_soa", |b| {
        b.iter(|| {
            let mut hits = 0u32;
            for ray in &rays {
                let mut ray = *ray;
                soa.intersect(&mut ray, slice);
                hits += (ray.hit.prim != u32::MAX) as u32;
            }
            hits
        })
    });

    let cpu4 = Bvh4Cpu::build(&verts[..]);
    c.bench_function("trace_bvh4_cpu", |b| {
        b.iter(|| {
            let mut hits = 0u32;
            for ray in &rays {
                let mut ray = *ray;
                cpu4.intersect(&mut ray);
                hits += (ray.hit.prim != u32::MAX) as u32;
            }
            hits
        })
    });

    let cw = CwBvh::build(&verts[..], CwBvhTriangles::Vertices);
    c.bench_function("trace_cwbvh", |b| {
        b.iter(|| {
            let mut hits = 0u32;
            for ray in &rays {
                let mut ray = *ray;
                cw.intersect(&mut ray);
                hits += (ray.hit.prim != u32::MAX) as u32;
            }
            hits
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
