//! Queries against an immutable [`NavMesh`] snapshot.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use bevy::prelude::{Vec2, Vec3};
use smallvec::SmallVec;
use thiserror::Error;

use crate::{
    tiles::{Link, NavMesh, PreparedPolygon},
    TilePosition,
};

/// Identifies a polygon within a nav-mesh snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PolygonRef {
    pub tile: TilePosition,
    pub polygon: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FindPathError {
    #[error("No polygon found near the start position")]
    StartPolygonNotFound,
    #[error("No polygon found near the end position")]
    EndPolygonNotFound,
    #[error("No path between start & end")]
    NoPath,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NavMeshPath {
    pub polygons: Vec<PolygonRef>,
    /// Starts at the start position on the nav-mesh & ends at the end position on the nav-mesh.
    pub waypoints: Vec<Vec3>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    /// Fraction along the segment where it left the nav-mesh. ``None`` if the end was reached.
    pub hit_t: Option<f32>,
    /// Polygons visited.
    pub polygons: Vec<PolygonRef>,
}

fn get_polygon(nav_mesh: &NavMesh, polygon_ref: PolygonRef) -> Option<&PreparedPolygon> {
    nav_mesh
        .tile(polygon_ref.tile)?
        .polygons()
        .get(usize::from(polygon_ref.polygon))
}

/// Polygons reachable by walking across an edge.
fn walkable_neighbours(nav_mesh: &NavMesh, polygon_ref: PolygonRef) -> SmallVec<[PolygonRef; 8]> {
    let Some(tile) = nav_mesh.tile(polygon_ref.tile) else {
        return SmallVec::new();
    };

    tile.links(polygon_ref.polygon)
        .iter()
        .map(|link| match *link {
            Link::Internal { neighbour_polygon } => PolygonRef {
                tile: polygon_ref.tile,
                polygon: neighbour_polygon,
            },
            Link::External {
                direction,
                neighbour_polygon,
            } => PolygonRef {
                tile: direction.offset(polygon_ref.tile),
                polygon: neighbour_polygon,
            },
        })
        .collect()
}

/// Off-mesh links leaving the polygon as ``(start, end, polygon at the end)``.
fn off_mesh_neighbours(
    nav_mesh: &NavMesh,
    polygon_ref: PolygonRef,
) -> SmallVec<[(Vec3, Vec3, PolygonRef); 2]> {
    let Some(tile) = nav_mesh.tile(polygon_ref.tile) else {
        return SmallVec::new();
    };

    tile.data()
        .off_mesh_links
        .iter()
        .filter(|link| link.polygon == polygon_ref.polygon)
        .filter_map(|link| {
            let end = Vec3::from_array(link.end);
            let end_tile = (Vec2::new(end.x, end.z) / nav_mesh.tile_size())
                .floor()
                .as_ivec2();

            // The way back is stored in the tile of the other end, which knows the polygon there.
            let back = nav_mesh
                .tile(end_tile)?
                .data()
                .off_mesh_links
                .iter()
                .find(|back| back.start == link.end && back.end == link.start)?;

            Some((
                Vec3::from_array(link.start),
                end,
                PolygonRef {
                    tile: end_tile,
                    polygon: back.polygon,
                },
            ))
        })
        .collect()
}

/// Finds the polygon closest to ``position`` within ``search_radius``.
///
/// Returns the polygon & the closest point on it.
pub fn find_nearest_polygon(
    nav_mesh: &NavMesh,
    position: Vec3,
    search_radius: f32,
) -> Option<(PolygonRef, Vec3)> {
    let tile_size = nav_mesh.tile_size();
    if tile_size <= 0.0 {
        return None;
    }

    let xz = Vec2::new(position.x, position.z);
    let min_tile = ((xz - search_radius) / tile_size).floor().as_ivec2();
    let max_tile = ((xz + search_radius) / tile_size).floor().as_ivec2();

    let mut best: Option<(PolygonRef, Vec3, f32)> = None;
    for y in min_tile.y..=max_tile.y {
        for x in min_tile.x..=max_tile.x {
            let tile_position = TilePosition::new(x, y);
            let Some(tile) = nav_mesh.tile(tile_position) else {
                continue;
            };

            for (index, polygon) in tile.polygons().iter().enumerate() {
                let distance = polygon.distance_to(position);
                if distance > search_radius || best.is_some_and(|(_, _, best)| best <= distance) {
                    continue;
                }

                let closest = Vec3::new(
                    position.x.clamp(polygon.min[0], polygon.max[0]),
                    position.y.clamp(polygon.floor_min, polygon.floor_max),
                    position.z.clamp(polygon.min[1], polygon.max[1]),
                );
                best = Some((
                    PolygonRef {
                        tile: tile_position,
                        polygon: index as u16,
                    },
                    closest,
                    distance,
                ));
            }
        }
    }

    best.map(|(polygon, closest, _)| (polygon, closest))
}

/// Middle of the edge shared by two neighbouring polygons.
fn edge_midpoint(from: &PreparedPolygon, to: &PreparedPolygon, height: f32) -> Vec3 {
    let min = Vec2::from_array(from.min).max(Vec2::from_array(to.min));
    let max = Vec2::from_array(from.max).min(Vec2::from_array(to.max));
    let middle = (min + max) * 0.5;

    Vec3::new(
        middle.x,
        height.clamp(to.floor_min, to.floor_max),
        middle.y,
    )
}

#[derive(Clone, Copy)]
enum Step {
    Walk,
    OffMesh { start: Vec3, end: Vec3 },
}

struct SearchNode {
    cost: f32,
    /// Where the search entered the polygon.
    position: Vec3,
    parent: Option<(PolygonRef, Step)>,
}

struct HeapNode {
    total_cost: f32,
    cost: f32,
    polygon: PolygonRef,
}

impl PartialEq for HeapNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapNode {}

impl PartialOrd for HeapNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapNode {
    // Lowest total cost first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.total_cost.total_cmp(&self.total_cost)
    }
}

/// A* over the polygons of the nav-mesh, including off-mesh links.
///
/// ``search_radius`` is how far from the nav-mesh ``start`` & ``end`` may be.
pub fn find_path(
    nav_mesh: &NavMesh,
    start: Vec3,
    end: Vec3,
    search_radius: f32,
) -> Result<NavMeshPath, FindPathError> {
    let (start_ref, start_position) = find_nearest_polygon(nav_mesh, start, search_radius)
        .ok_or(FindPathError::StartPolygonNotFound)?;
    let (end_ref, end_position) = find_nearest_polygon(nav_mesh, end, search_radius)
        .ok_or(FindPathError::EndPolygonNotFound)?;

    if start_ref == end_ref {
        return Ok(NavMeshPath {
            polygons: vec![start_ref],
            waypoints: vec![start_position, end_position],
        });
    }

    let mut nodes: HashMap<PolygonRef, SearchNode> = HashMap::new();
    let mut open_list = BinaryHeap::new();

    nodes.insert(
        start_ref,
        SearchNode {
            cost: 0.0,
            position: start_position,
            parent: None,
        },
    );
    open_list.push(HeapNode {
        total_cost: start_position.distance(end_position),
        cost: 0.0,
        polygon: start_ref,
    });

    let mut found = false;
    while let Some(HeapNode {
        cost, polygon: current, ..
    }) = open_list.pop()
    {
        let Some(node) = nodes.get(&current) else {
            continue;
        };
        // Outdated entry, a cheaper way here was found after it was pushed.
        if cost > node.cost {
            continue;
        }
        if current == end_ref {
            found = true;
            break;
        }
        let position = node.position;

        let Some(current_polygon) = get_polygon(nav_mesh, current) else {
            continue;
        };

        let mut candidates: SmallVec<[(PolygonRef, Vec3, Step); 8]> = SmallVec::new();
        for neighbour in walkable_neighbours(nav_mesh, current) {
            let Some(neighbour_polygon) = get_polygon(nav_mesh, neighbour) else {
                continue;
            };
            let entry = if neighbour == end_ref {
                end_position
            } else {
                edge_midpoint(current_polygon, neighbour_polygon, position.y)
            };
            candidates.push((neighbour, entry, Step::Walk));
        }
        for (link_start, link_end, neighbour) in off_mesh_neighbours(nav_mesh, current) {
            candidates.push((
                neighbour,
                link_end,
                Step::OffMesh {
                    start: link_start,
                    end: link_end,
                },
            ));
        }

        for (neighbour, entry, step) in candidates {
            let step_cost = match step {
                Step::Walk => position.distance(entry),
                Step::OffMesh { start, end } => position.distance(start) + start.distance(end),
            };
            let neighbour_cost = cost + step_cost;

            if nodes
                .get(&neighbour)
                .is_some_and(|existing| existing.cost <= neighbour_cost)
            {
                continue;
            }

            nodes.insert(
                neighbour,
                SearchNode {
                    cost: neighbour_cost,
                    position: entry,
                    parent: Some((current, step)),
                },
            );
            open_list.push(HeapNode {
                total_cost: neighbour_cost + entry.distance(end_position),
                cost: neighbour_cost,
                polygon: neighbour,
            });
        }
    }

    if !found {
        return Err(FindPathError::NoPath);
    }

    // Walk back from the end.
    let mut polygons = vec![end_ref];
    let mut steps = Vec::new();
    let mut current = end_ref;
    while let Some((parent, step)) = nodes.get(&current).and_then(|node| node.parent) {
        let position = nodes[&current].position;
        steps.push((step, position));
        polygons.push(parent);
        current = parent;
    }
    polygons.reverse();
    steps.reverse();

    let mut waypoints = vec![start_position];
    for (step, position) in steps {
        match step {
            Step::Walk => waypoints.push(position),
            Step::OffMesh { start, end } => {
                waypoints.push(start);
                waypoints.push(end);
            }
        }
    }
    if waypoints.last() != Some(&end_position) {
        waypoints.push(end_position);
    }

    Ok(NavMeshPath {
        polygons,
        waypoints,
    })
}

/// Walks the nav-mesh along the straight line from ``start`` to ``end`` on the XZ-plane.
///
/// Stops where the line leaves the walkable area, eg. at a wall.
pub fn raycast(
    nav_mesh: &NavMesh,
    start: Vec3,
    end: Vec3,
    search_radius: f32,
) -> Result<RaycastHit, FindPathError> {
    const EPSILON: f32 = 1e-3;

    let (mut current, _) = find_nearest_polygon(nav_mesh, start, search_radius)
        .ok_or(FindPathError::StartPolygonNotFound)?;

    let origin = Vec2::new(start.x, start.z);
    let delta = Vec2::new(end.x, end.z) - origin;
    let mut polygons = vec![current];
    if delta.length_squared() <= f32::EPSILON {
        return Ok(RaycastHit {
            hit_t: None,
            polygons,
        });
    }
    let step_beyond = EPSILON / delta.length();

    // Every iteration moves into a new polygon, a path can't visit more than all of them.
    for _ in 0..=nav_mesh.polygon_count() {
        let Some(polygon) = get_polygon(nav_mesh, current) else {
            break;
        };

        // Parameter where the segment leaves the rectangle.
        let mut t_exit = f32::INFINITY;
        for axis in 0..2 {
            if delta[axis] > 0.0 {
                t_exit = t_exit.min((polygon.max[axis] - origin[axis]) / delta[axis]);
            } else if delta[axis] < 0.0 {
                t_exit = t_exit.min((polygon.min[axis] - origin[axis]) / delta[axis]);
            }
        }
        if t_exit >= 1.0 {
            return Ok(RaycastHit {
                hit_t: None,
                polygons,
            });
        }

        let beyond = origin + delta * (t_exit + step_beyond).min(1.0);
        let next = walkable_neighbours(nav_mesh, current)
            .into_iter()
            .filter(|neighbour| !polygons.contains(neighbour))
            .find(|neighbour| {
                get_polygon(nav_mesh, *neighbour)
                    .is_some_and(|polygon| polygon.contains_xz(beyond, EPSILON * 0.1))
            });

        match next {
            Some(next) => {
                polygons.push(next);
                current = next;
            }
            None => {
                return Ok(RaycastHit {
                    hit_t: Some(t_exit.max(0.0)),
                    polygons,
                });
            }
        }
    }

    Ok(RaycastHit {
        hit_t: Some(0.0),
        polygons,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        mesher::EdgeConnectionDirection,
        tiles::{NavMeshCacheItem, Portal, PreparedNavMeshData, PreparedOffMeshLink, TileRevision},
        AgentBounds, AreaType,
    };

    use super::*;

    fn full_tile_polygon(tile: TilePosition, portals: Vec<Portal>) -> PreparedPolygon {
        let min = tile.as_vec2() * 16.0;
        PreparedPolygon {
            min: min.to_array(),
            max: (min + 16.0).to_array(),
            floor_min: 0.0,
            floor_max: 0.0,
            area: AreaType::Ground,
            neighbours: Vec::new(),
            portals,
        }
    }

    fn publish(item: &NavMeshCacheItem, tile: TilePosition, data: PreparedNavMeshData) {
        item.update_tile(
            tile,
            TileRevision {
                geometry: 1,
                connections: 0,
            },
            Some(Arc::new(data)),
        );
    }

    /// Tiles (0, 0) & (1, 0) fully walkable & stitched along x = 16.
    fn two_tiles() -> Arc<NavMesh> {
        let item = NavMeshCacheItem::new(AgentBounds::new(0.3, 0.9), 0, NavMesh::new(16.0, 0.5));
        for (tile, direction) in [
            (TilePosition::new(0, 0), EdgeConnectionDirection::XPositive),
            (TilePosition::new(1, 0), EdgeConnectionDirection::XNegative),
        ] {
            publish(
                &item,
                tile,
                PreparedNavMeshData {
                    tile: tile.to_array(),
                    polygons: vec![full_tile_polygon(
                        tile,
                        vec![Portal {
                            direction,
                            start: 0.0,
                            end: 16.0,
                        }],
                    )],
                    off_mesh_links: Vec::new(),
                },
            );
        }

        item.nav_mesh()
    }

    #[test]
    fn path_across_stitched_tiles() {
        let nav_mesh = two_tiles();

        let path = find_path(
            &nav_mesh,
            Vec3::new(4.0, 0.5, 8.0),
            Vec3::new(28.0, 0.5, 8.0),
            1.0,
        )
        .expect("Tiles are connected");

        assert_eq!(
            path.polygons,
            vec![
                PolygonRef {
                    tile: TilePosition::new(0, 0),
                    polygon: 0
                },
                PolygonRef {
                    tile: TilePosition::new(1, 0),
                    polygon: 0
                },
            ]
        );
        assert_eq!(path.waypoints.first(), Some(&Vec3::new(4.0, 0.0, 8.0)));
        assert_eq!(path.waypoints.last(), Some(&Vec3::new(28.0, 0.0, 8.0)));

        let hit = raycast(
            &nav_mesh,
            Vec3::new(4.0, 0.0, 8.0),
            Vec3::new(28.0, 0.0, 12.0),
            1.0,
        )
        .expect("Start is on the nav-mesh");
        assert_eq!(hit.hit_t, None);
        assert_eq!(hit.polygons.len(), 2);
    }

    #[test]
    fn raycast_stops_at_the_nav_mesh_edge() {
        let nav_mesh = two_tiles();

        let hit = raycast(
            &nav_mesh,
            Vec3::new(8.0, 0.0, 8.0),
            Vec3::new(8.0, 0.0, 24.0),
            1.0,
        )
        .expect("Start is on the nav-mesh");

        let hit_t = hit.hit_t.expect("Leaves the nav-mesh at z = 16");
        assert!((hit_t - 0.5).abs() < 1e-4);
    }

    #[test]
    fn points_away_from_the_nav_mesh_are_not_found() {
        let nav_mesh = two_tiles();

        assert_eq!(
            find_path(
                &nav_mesh,
                Vec3::new(4.0, 0.0, 40.0),
                Vec3::new(4.0, 0.0, 8.0),
                1.0
            ),
            Err(FindPathError::StartPolygonNotFound)
        );
        assert_eq!(
            find_path(
                &nav_mesh,
                Vec3::new(4.0, 0.0, 8.0),
                Vec3::new(4.0, 10.0, 8.0),
                1.0
            ),
            Err(FindPathError::EndPolygonNotFound)
        );
    }

    #[test]
    fn off_mesh_links_connect_separate_areas() {
        let item = NavMeshCacheItem::new(AgentBounds::new(0.3, 0.9), 0, NavMesh::new(16.0, 0.5));
        let near = TilePosition::new(0, 0);
        let far = TilePosition::new(3, 0);
        let door = [8.0, 0.0, 8.0];
        let exit = [56.0, 0.0, 8.0];

        for (tile, start, end) in [(near, door, exit), (far, exit, door)] {
            publish(
                &item,
                tile,
                PreparedNavMeshData {
                    tile: tile.to_array(),
                    polygons: vec![full_tile_polygon(tile, Vec::new())],
                    off_mesh_links: vec![PreparedOffMeshLink {
                        polygon: 0,
                        start,
                        end,
                        area: AreaType::Door,
                    }],
                },
            );
        }
        let nav_mesh = item.nav_mesh();

        let path = find_path(
            &nav_mesh,
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(60.0, 0.0, 2.0),
            1.0,
        )
        .expect("Connected through the door");

        assert_eq!(path.polygons.len(), 2);
        assert_eq!(
            path.waypoints,
            vec![
                Vec3::new(2.0, 0.0, 2.0),
                Vec3::from_array(door),
                Vec3::from_array(exit),
                Vec3::new(60.0, 0.0, 2.0),
            ]
        );

        // Nothing walkable links the two.
        let hit = raycast(
            &nav_mesh,
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(60.0, 0.0, 2.0),
            1.0,
        )
        .expect("Start is on the nav-mesh");
        assert!(hit.hit_t.is_some());
    }
}
