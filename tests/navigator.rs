use std::collections::HashMap;
use std::fs;
use std::num::NonZeroU16;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bevy::prelude::{IVec2, Transform, Vec3};
use tiled_navigator::{
    async_updater::{LoadingListener, WaitConditionType, WaitStatus},
    conversion::CollisionShape,
    nav_mesh_db::{FileNavMeshDb, MemoryNavMeshDb, NavMeshDb},
    query::{find_path, raycast, FindPathError},
    recast_mesh::HeightfieldShape,
    tiles::{NavMesh, PreparedNavMeshData, TileRevision},
    AgentBounds, AreaType, NavMeshManager, NavigatorSettings, ObjectId, TilePosition,
};

const FLOOR: ObjectId = ObjectId(1);
const WALL: ObjectId = ObjectId(2);
const WALL_RIGHT: ObjectId = ObjectId(3);

const SMALL_AGENT: AgentBounds = AgentBounds::new(0.3, 0.9);
const LARGE_AGENT: AgentBounds = AgentBounds::new(1.5, 0.9);

fn settings() -> NavigatorSettings {
    // Tiles are 8 world units wide.
    NavigatorSettings::from_world_bounds(1000.0, -10.0)
        .with_cell_size(0.25, 0.1)
        .with_tile_size(32)
        .with_border_size(8)
        .with_min_region_area(0)
        .with_max_tiles_number(49)
}

fn manager(db: Option<Box<dyn NavMeshDb>>) -> NavMeshManager {
    NavMeshManager::new(settings(), db).expect("Valid settings")
}

fn floor() -> (CollisionShape, Transform) {
    // Top at y = 0, spanning -12..12 on X & Z.
    (
        CollisionShape::cuboid(Vec3::new(12.0, 0.1, 12.0)),
        Transform::from_xyz(0.0, -0.1, 0.0),
    )
}

fn full_wall() -> (CollisionShape, Transform) {
    // Along X at z = 0, two units high.
    (
        CollisionShape::cuboid(Vec3::new(12.0, 1.0, 0.25)),
        Transform::from_xyz(0.0, 1.0, 0.0),
    )
}

fn add(manager: &NavMeshManager, id: ObjectId, (shape, transform): (CollisionShape, Transform)) {
    assert!(manager.add_object(id, &shape, transform, AreaType::Ground, None));
}

fn build(manager: &NavMeshManager) {
    manager.update(Vec3::ZERO, None);
    assert_eq!(
        manager.wait(WaitConditionType::AllJobsDone, None),
        WaitStatus::Done
    );
}

fn nav_mesh(manager: &NavMeshManager, agent: AgentBounds) -> Arc<NavMesh> {
    manager
        .get_nav_mesh(agent)
        .expect("Agent was added")
        .nav_mesh()
}

fn tile_data(nav_mesh: &NavMesh) -> Vec<(TilePosition, PreparedNavMeshData)> {
    let mut tiles: Vec<_> = nav_mesh
        .tiles()
        .iter()
        .map(|(position, tile)| (*position, tile.data().as_ref().clone()))
        .collect();
    tiles.sort_by_key(|(position, _)| (position.x, position.y));

    tiles
}

// Off the tile edge at x = 0.
const SOUTH: Vec3 = Vec3::new(2.0, 0.0, -6.0);
const NORTH: Vec3 = Vec3::new(2.0, 0.0, 6.0);

#[test]
fn floor_is_walkable_across_tiles() {
    let manager = manager(None);
    add(&manager, FLOOR, floor());
    assert!(manager.add_agent(SMALL_AGENT));
    build(&manager);

    let nav_mesh = nav_mesh(&manager, SMALL_AGENT);
    // -12..12 touches tiles -2..=1 on both axes.
    assert_eq!(nav_mesh.tiles().len(), 16);

    let path = find_path(
        &nav_mesh,
        Vec3::new(-10.0, 0.0, -10.0),
        Vec3::new(10.0, 0.0, 10.0),
        1.0,
    )
    .expect("Floor is connected");
    assert!(path.polygons.len() > 1);

    let hit = raycast(&nav_mesh, SOUTH, NORTH, 1.0).expect("Start is on the floor");
    assert_eq!(hit.hit_t, None);

    let stats = manager.get_stats();
    assert_eq!(stats.agents, 1);
    assert_eq!(stats.nav_mesh_tiles, 16);
    assert!(stats.updater.built >= 16);
    assert_eq!(stats.updater.jobs, 0);
}

#[test]
fn wall_blocks_and_removing_it_reconnects() {
    let manager = manager(None);
    add(&manager, FLOOR, floor());
    add(&manager, WALL, full_wall());
    manager.add_agent(SMALL_AGENT);
    build(&manager);

    let blocked = nav_mesh(&manager, SMALL_AGENT);
    let hit = raycast(&blocked, SOUTH, NORTH, 1.0).expect("Start is on the floor");
    let hit_t = hit.hit_t.expect("Wall is in the way");
    assert!(hit_t < 0.5);
    assert_eq!(
        find_path(&blocked, SOUTH, NORTH, 1.0),
        Err(FindPathError::NoPath)
    );

    let revision_before = manager
        .get_nav_mesh(SMALL_AGENT)
        .and_then(|item| item.tile_revision(TilePosition::new(0, 0)))
        .expect("Tile was published");

    assert!(manager.remove_object(WALL, None));
    build(&manager);

    let open = nav_mesh(&manager, SMALL_AGENT);
    assert!(find_path(&open, SOUTH, NORTH, 1.0).is_ok());
    assert_eq!(
        raycast(&open, SOUTH, NORTH, 1.0)
            .expect("Start is on the floor")
            .hit_t,
        None
    );

    let revision_after = manager
        .get_nav_mesh(SMALL_AGENT)
        .and_then(|item| item.tile_revision(TilePosition::new(0, 0)))
        .expect("Tile was published");
    assert!(revision_after > revision_before);

    // The snapshot taken earlier still shows the wall.
    assert!(raycast(&blocked, SOUTH, NORTH, 1.0)
        .expect("Start is on the floor")
        .hit_t
        .is_some());
}

#[test]
fn small_plane_yields_a_single_tile() {
    // Tiles are 16 world units wide, the plane & its border stay within tile (0, 0).
    let manager = NavMeshManager::new(settings().with_tile_size(64), None).expect("Valid settings");
    add(
        &manager,
        FLOOR,
        (
            CollisionShape::cuboid(Vec3::new(5.5, 0.1, 5.5)),
            Transform::from_xyz(8.0, -0.1, 8.0),
        ),
    );
    manager.add_agent(SMALL_AGENT);
    build(&manager);

    let south = Vec3::new(8.0, 0.0, 4.0);
    let north = Vec3::new(8.0, 0.0, 12.0);

    let open = nav_mesh(&manager, SMALL_AGENT);
    assert_eq!(open.tiles().len(), 1);
    assert!(open.tile(TilePosition::new(0, 0)).is_some());
    assert!(find_path(&open, south, north, 1.0).is_ok());
    assert_eq!(manager.get_stats().nav_mesh_tiles, 1);

    // Bisected along X.
    add(
        &manager,
        WALL,
        (
            CollisionShape::cuboid(Vec3::new(5.5, 1.0, 0.25)),
            Transform::from_xyz(8.0, 1.0, 8.0),
        ),
    );
    build(&manager);

    let bisected = nav_mesh(&manager, SMALL_AGENT);
    assert_eq!(bisected.tiles().len(), 1);
    assert_eq!(
        find_path(&bisected, south, north, 1.0),
        Err(FindPathError::NoPath)
    );
    assert!(raycast(&bisected, south, north, 1.0)
        .expect("Start is on the plane")
        .hit_t
        .is_some());
}

#[test]
fn moving_an_obstacle_updates_the_nav_mesh() {
    let manager = manager(None);
    add(&manager, FLOOR, floor());
    add(&manager, WALL, full_wall());
    manager.add_agent(SMALL_AGENT);
    build(&manager);
    assert_eq!(
        find_path(&nav_mesh(&manager, SMALL_AGENT), SOUTH, NORTH, 1.0),
        Err(FindPathError::NoPath)
    );
    let revision_before = manager
        .get_nav_mesh(SMALL_AGENT)
        .and_then(|item| item.tile_revision(TilePosition::new(0, 0)))
        .expect("Tile was published");

    // South of both points.
    assert!(manager.update_object(
        WALL,
        Transform::from_xyz(0.0, 1.0, -10.0),
        AreaType::Ground,
        None,
    ));
    build(&manager);

    let moved = nav_mesh(&manager, SMALL_AGENT);
    assert!(find_path(&moved, SOUTH, NORTH, 1.0).is_ok());
    assert!(moved
        .tile_revision(TilePosition::new(0, 0))
        .is_some_and(|revision| revision > revision_before));

    // And back.
    assert!(manager.update_object(WALL, full_wall().1, AreaType::Ground, None));
    build(&manager);
    assert_eq!(
        find_path(&nav_mesh(&manager, SMALL_AGENT), SOUTH, NORTH, 1.0),
        Err(FindPathError::NoPath)
    );
}

#[test]
fn heightfields_are_walkable_and_water_covers_them() {
    let manager = manager(None);
    // Spans 0..16 on X & Z, tiles 0..=1.
    assert!(manager.add_heightfield(
        IVec2::new(0, 0),
        16,
        HeightfieldShape::Flat { height: 0.0 },
        None,
    ));
    manager.add_agent(SMALL_AGENT);
    build(&manager);

    let start = Vec3::new(2.0, 0.0, 2.0);
    let end = Vec3::new(14.0, 0.0, 14.0);

    let terrain = nav_mesh(&manager, SMALL_AGENT);
    let path = find_path(&terrain, start, end, 1.0).expect("Terrain is walkable");
    assert!(path.polygons.len() > 1);
    let tile = terrain
        .tile(TilePosition::new(0, 0))
        .expect("Tile was published");
    assert!(tile
        .polygons()
        .iter()
        .all(|polygon| polygon.area == AreaType::Ground));

    // A unit of water leaves no room to stand on the terrain, only the water surface is left.
    assert!(manager.add_water(IVec2::new(0, 0), 16, 1.0, None));
    build(&manager);

    let flooded = nav_mesh(&manager, SMALL_AGENT);
    let tile = flooded
        .tile(TilePosition::new(0, 0))
        .expect("Tile was published");
    assert!(!tile.polygons().is_empty());
    assert!(tile
        .polygons()
        .iter()
        .all(|polygon| polygon.area == AreaType::Water && polygon.floor_min > 0.5));
    assert_eq!(
        find_path(&flooded, start, end, 0.5),
        Err(FindPathError::StartPolygonNotFound)
    );

    assert!(manager.remove_water(IVec2::new(0, 0), None));
    build(&manager);
    assert!(find_path(&nav_mesh(&manager, SMALL_AGENT), start, end, 1.0).is_ok());
}

#[test]
fn published_revisions_never_go_backwards() {
    let threads = NonZeroU16::new(4).expect("Non-zero");
    let manager = NavMeshManager::new(settings().with_async_nav_mesh_updater_threads(threads), None)
        .expect("Valid settings");
    add(&manager, FLOOR, floor());
    add(&manager, WALL, full_wall());
    manager.add_agent(SMALL_AGENT);
    manager.add_agent(LARGE_AGENT);
    manager.update(Vec3::ZERO, None);
    let items = manager.get_nav_meshes();

    const STEPS: i32 = 60;
    let wall_at = |step: i32| Transform::from_xyz(0.0, 1.0, (step % 11) as f32 - 5.0);

    let done = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let watcher = scope.spawn(|| {
            let mut seen: HashMap<(AgentBounds, TilePosition), TileRevision> = HashMap::new();
            while !done.load(Ordering::Acquire) {
                for (agent, item) in &items {
                    let nav_mesh = item.nav_mesh();
                    for x in -3..3 {
                        for y in -3..3 {
                            let tile = TilePosition::new(x, y);
                            let Some(revision) = nav_mesh.tile_revision(tile) else {
                                continue;
                            };
                            if let Some(previous) = seen.insert((*agent, tile), revision) {
                                assert!(previous <= revision, "{tile} went from {previous:?} to {revision:?}");
                            }
                        }
                    }
                }
            }
        });

        for step in 0..STEPS {
            manager.update_object(WALL, wall_at(step), AreaType::Ground, None);
            if step % 7 == 0 {
                manager.add_off_mesh_connection(
                    ObjectId(20),
                    Vec3::new(-4.0, 0.0, -8.0),
                    Vec3::new(4.0, 0.0, 8.0),
                    AreaType::Door,
                );
            } else if step % 7 == 3 {
                manager.remove_off_mesh_connections(ObjectId(20));
            }
            manager.update(Vec3::ZERO, None);
        }
        manager.remove_off_mesh_connections(ObjectId(20));
        manager.update(Vec3::ZERO, None);

        let status = manager.wait(WaitConditionType::AllJobsDone, None);
        done.store(true, Ordering::Release);
        watcher.join().expect("Revisions only move forward");
        assert_eq!(status, WaitStatus::Done);
    });

    // Whatever happened in between, the result matches building the final state once.
    let fresh = NavMeshManager::new(settings(), None).expect("Valid settings");
    add(&fresh, FLOOR, floor());
    add(&fresh, WALL, (full_wall().0, wall_at(STEPS - 1)));
    fresh.add_agent(SMALL_AGENT);
    fresh.add_agent(LARGE_AGENT);
    build(&fresh);

    for agent in [SMALL_AGENT, LARGE_AGENT] {
        assert_eq!(
            tile_data(&nav_mesh(&manager, agent)),
            tile_data(&nav_mesh(&fresh, agent))
        );
    }
}

#[test]
fn narrow_gap_only_fits_small_agents() {
    let manager = manager(None);
    add(&manager, FLOOR, floor());
    // Gap between x = -1 & x = 1.
    add(
        &manager,
        WALL,
        (
            CollisionShape::cuboid(Vec3::new(5.5, 1.0, 0.25)),
            Transform::from_xyz(-6.5, 1.0, 0.0),
        ),
    );
    add(
        &manager,
        WALL_RIGHT,
        (
            CollisionShape::cuboid(Vec3::new(5.5, 1.0, 0.25)),
            Transform::from_xyz(6.5, 1.0, 0.0),
        ),
    );
    manager.add_agent(SMALL_AGENT);
    manager.add_agent(LARGE_AGENT);
    build(&manager);

    assert!(find_path(&nav_mesh(&manager, SMALL_AGENT), SOUTH, NORTH, 1.0).is_ok());
    assert_eq!(
        find_path(&nav_mesh(&manager, LARGE_AGENT), SOUTH, NORTH, 1.0),
        Err(FindPathError::NoPath)
    );
    assert_eq!(manager.get_nav_meshes().len(), 2);
}

#[test]
fn result_does_not_depend_on_insertion_order() {
    let first = manager(None);
    add(&first, FLOOR, floor());
    add(&first, WALL, full_wall());
    first.add_agent(SMALL_AGENT);
    build(&first);

    let second = manager(None);
    second.add_agent(SMALL_AGENT);
    {
        let mut guard = second.begin_update();
        let (shape, transform) = full_wall();
        second.add_object(WALL, &shape, transform, AreaType::Ground, Some(&mut guard));
        let (shape, transform) = floor();
        second.add_object(FLOOR, &shape, transform, AreaType::Ground, Some(&mut guard));
        guard.commit();
    }
    build(&second);

    assert_eq!(
        tile_data(&nav_mesh(&first, SMALL_AGENT)),
        tile_data(&nav_mesh(&second, SMALL_AGENT))
    );
}

#[test]
fn unknown_objects_and_agents_change_nothing() {
    let manager = manager(None);
    add(&manager, FLOOR, floor());
    manager.add_agent(SMALL_AGENT);
    build(&manager);
    let before = manager.get_stats();

    assert!(!manager.remove_object(ObjectId(404), None));
    assert!(!manager.reset(LARGE_AGENT));
    build(&manager);

    let after = manager.get_stats();
    assert_eq!(after.recast_mesh_revision, before.recast_mesh_revision);
    assert_eq!(after.updater.pushed, before.updater.pushed);
    assert_eq!(after.nav_mesh_tiles, before.nav_mesh_tiles);
}

#[test]
fn reset_rebuilds_from_scratch() {
    let manager = manager(None);
    add(&manager, FLOOR, floor());
    manager.add_agent(SMALL_AGENT);
    build(&manager);
    let before = tile_data(&nav_mesh(&manager, SMALL_AGENT));

    assert!(manager.reset(SMALL_AGENT));
    assert_eq!(
        manager.wait(WaitConditionType::AllJobsDone, None),
        WaitStatus::Done
    );

    assert_eq!(tile_data(&nav_mesh(&manager, SMALL_AGENT)), before);
    assert!(manager.get_stats().updater.cache_hits > 0);
}

#[test]
fn off_mesh_connection_links_separate_floors() {
    let manager = manager(None);
    add(
        &manager,
        FLOOR,
        (
            CollisionShape::cuboid(Vec3::new(3.0, 0.1, 3.0)),
            Transform::from_xyz(-6.0, -0.1, 0.0),
        ),
    );
    add(
        &manager,
        ObjectId(4),
        (
            CollisionShape::cuboid(Vec3::new(3.0, 0.1, 3.0)),
            Transform::from_xyz(6.0, -0.1, 0.0),
        ),
    );
    manager.add_agent(SMALL_AGENT);
    build(&manager);

    let west = Vec3::new(-6.0, 0.0, 0.0);
    let east = Vec3::new(6.0, 0.0, 0.0);
    assert_eq!(
        find_path(&nav_mesh(&manager, SMALL_AGENT), west, east, 1.0),
        Err(FindPathError::NoPath)
    );

    manager.add_off_mesh_connection(
        ObjectId(10),
        Vec3::new(-5.0, 0.0, 0.0),
        Vec3::new(5.0, 0.0, 0.0),
        AreaType::Door,
    );
    build(&manager);
    let path = find_path(&nav_mesh(&manager, SMALL_AGENT), west, east, 1.0)
        .expect("Linked by the connection");
    assert!(path.waypoints.contains(&Vec3::new(5.0, 0.0, 0.0)));

    manager.remove_off_mesh_connections(ObjectId(10));
    build(&manager);
    assert_eq!(
        find_path(&nav_mesh(&manager, SMALL_AGENT), west, east, 1.0),
        Err(FindPathError::NoPath)
    );
}

#[test]
fn database_records_are_reused() {
    let db = Arc::new(MemoryNavMeshDb::new());

    let expected = {
        let manager = manager(Some(Box::new(db.clone())));
        add(&manager, FLOOR, floor());
        manager.add_agent(SMALL_AGENT);
        build(&manager);

        tile_data(&nav_mesh(&manager, SMALL_AGENT))
    };
    // Writes are flushed once the manager is gone.
    assert_eq!(db.len(), expected.len());

    let manager = manager(Some(Box::new(db.clone())));
    add(&manager, FLOOR, floor());
    manager.add_agent(SMALL_AGENT);
    build(&manager);

    assert_eq!(tile_data(&nav_mesh(&manager, SMALL_AGENT)), expected);
    let stats = manager.get_stats();
    assert_eq!(stats.updater.built, 0);
    assert_eq!(stats.updater.db_hits, expected.len() as u64);
}

#[test]
fn corrupt_database_records_are_rebuilt() {
    let directory = tempfile::tempdir().expect("Temporary directory");

    let expected = {
        let db = FileNavMeshDb::open(directory.path()).expect("Database opens");
        let manager = manager(Some(Box::new(db)));
        add(&manager, FLOOR, floor());
        manager.add_agent(SMALL_AGENT);
        build(&manager);

        tile_data(&nav_mesh(&manager, SMALL_AGENT))
    };

    let mut records = 0;
    for entry in fs::read_dir(directory.path()).expect("Database directory") {
        let path = entry.expect("Directory entry").path();
        fs::write(&path, b"definitely not a nav-mesh").expect("Overwrite record");
        records += 1;
    }
    assert_eq!(records, expected.len());

    let db = FileNavMeshDb::open(directory.path()).expect("Database opens");
    let manager = manager(Some(Box::new(db)));
    add(&manager, FLOOR, floor());
    manager.add_agent(SMALL_AGENT);
    build(&manager);

    assert_eq!(tile_data(&nav_mesh(&manager, SMALL_AGENT)), expected);
    let stats = manager.get_stats();
    assert_eq!(stats.updater.db_hits, 0);
    assert_eq!(stats.updater.built, expected.len() as u64);
    let db_stats = stats.updater.db.expect("Database is in use");
    assert_eq!(db_stats.read_failures, expected.len() as u64);
}

#[derive(Default)]
struct Progress {
    range: AtomicUsize,
    calls: AtomicUsize,
}

impl LoadingListener for Progress {
    fn set_progress_range(&self, range: usize) {
        self.range.store(range, Ordering::Relaxed);
    }

    fn set_progress(&self, _value: usize) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn waiting_for_required_tiles() {
    let manager = manager(None);
    let progress = Progress::default();

    // Nothing queued.
    assert_eq!(
        manager.wait(WaitConditionType::RequiredTilesPresent, Some(&progress)),
        WaitStatus::Done
    );

    add(&manager, FLOOR, floor());
    manager.add_agent(SMALL_AGENT);
    manager.update(Vec3::ZERO, None);
    assert_eq!(
        manager.wait(WaitConditionType::RequiredTilesPresent, Some(&progress)),
        WaitStatus::Done
    );

    let nav_mesh = nav_mesh(&manager, SMALL_AGENT);
    assert!(nav_mesh.tile(TilePosition::new(0, 0)).is_some());
    assert!(nav_mesh.tile(TilePosition::new(-1, -1)).is_some());
}

#[test]
fn switching_worldspace_starts_over() {
    let manager = manager(None);
    {
        let mut guard = manager.begin_update();
        manager.set_worldspace("Morrowind", &mut guard);
    }
    add(&manager, FLOOR, floor());
    manager.add_agent(SMALL_AGENT);
    build(&manager);
    assert!(!nav_mesh(&manager, SMALL_AGENT).tiles().is_empty());

    {
        let mut guard = manager.begin_update();
        manager.set_worldspace("Solstheim", &mut guard);
    }
    build(&manager);
    assert!(nav_mesh(&manager, SMALL_AGENT).tiles().is_empty());
    assert!(manager.get_recast_mesh_tiles().is_empty());

    add(&manager, FLOOR, floor());
    build(&manager);
    assert_eq!(nav_mesh(&manager, SMALL_AGENT).tiles().len(), 16);
    assert_eq!(manager.get_stats().worldspace, "Solstheim");
}
