use std::sync::Arc;

use bevy::prelude::{Transform, Vec3};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tiled_navigator::{
    build_tile_sync, conversion::CollisionShape, recast_mesh::RecastMesh,
    recast_mesh_manager::TileCachedRecastMeshManager, AgentBounds, AreaType, NavigatorSettings,
    ObjectId, TileBuildParameters, TilePosition,
};

fn settings() -> NavigatorSettings {
    NavigatorSettings::from_world_bounds(12.5, -100.0)
        .with_cell_size(0.25, 0.1)
        .with_tile_size(100)
        .with_border_size(8)
        .with_traversible_slope((40.0_f32 - 0.1).to_radians())
        .with_min_region_area(100)
}

fn recast_mesh(shapes: &[(Transform, CollisionShape)]) -> Arc<RecastMesh> {
    let manager = TileCachedRecastMeshManager::new(settings());
    for (index, (transform, shape)) in shapes.iter().enumerate() {
        manager.add_object(
            ObjectId(index as u64),
            shape,
            *transform,
            AreaType::Ground,
            None,
        );
    }

    manager
        .recast_mesh(TilePosition::ZERO)
        .expect("Shapes overlap the tile")
}

fn criterion_benchmark(c: &mut Criterion) {
    let parameters = TileBuildParameters::new(&AgentBounds::new(0.25, 1.0), &settings());

    let single = recast_mesh(&[(
        Transform::from_xyz(10.0, 0.0, 10.0),
        CollisionShape::cuboid(Vec3::new(10.0, 0.2, 10.0)),
    )]);
    let many = recast_mesh(&[
        (
            Transform::from_xyz(10.0, 0.0, 10.0),
            CollisionShape::cuboid(Vec3::new(10.0, 0.2, 10.0)),
        ),
        (
            Transform::from_xyz(15.0, 1.0, 10.0),
            CollisionShape::cuboid(Vec3::new(1.0, 1.0, 1.0)),
        ),
        (
            Transform::from_xyz(5.0, 1.0, 12.0),
            CollisionShape::cuboid(Vec3::new(4.0, 1.0, 1.0)),
        ),
        (
            Transform::from_xyz(7.5, 2.0, 12.0),
            CollisionShape::cuboid(Vec3::new(1.0, 2.0, 1.0)),
        ),
        (
            Transform::from_xyz(7.5, 2.0, 8.0),
            CollisionShape::cylinder(2.0, 1.0),
        ),
    ]);

    c.bench_function("Generate Single Primitive Geometry", |b| {
        b.iter(|| {
            black_box(build_tile_sync(
                TilePosition::ZERO,
                &single,
                &[],
                &parameters,
            ))
        })
    });
    c.bench_function("Generate Many Primitive Geometry", |b| {
        b.iter(|| {
            black_box(build_tile_sync(
                TilePosition::ZERO,
                &many,
                &[],
                &parameters,
            ))
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
