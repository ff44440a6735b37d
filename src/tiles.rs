use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bevy::prelude::{Vec2, Vec3};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    mesher::{EdgeConnection, EdgeConnectionDirection, PolyMesh},
    off_mesh_connections::OffMeshConnection,
    AgentBounds, AreaType, TileBuildError, TileBuildParameters, TilePosition,
};

/// Revision a tile was built from. Ordered by geometry first, then connections.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileRevision {
    /// Recast mesh revision of the tile.
    pub geometry: u64,
    /// Revision of the last off-mesh connection change touching the tile.
    pub connections: u64,
}

/// Portal on the edge of a polygon where it continues into the neighbouring tile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Portal {
    pub direction: EdgeConnectionDirection,
    /// World position along the tile edge.
    pub start: f32,
    pub end: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedPolygon {
    /// World space bounds on the XZ-plane.
    pub min: [f32; 2],
    pub max: [f32; 2],
    /// Height range of the walkable surface.
    pub floor_min: f32,
    pub floor_max: f32,
    pub area: AreaType,
    /// Polygons in the same tile sharing an edge with this one.
    pub neighbours: Vec<u16>,
    pub portals: Vec<Portal>,
}

impl PreparedPolygon {
    #[inline]
    pub fn center(&self) -> Vec3 {
        Vec3::new(
            (self.min[0] + self.max[0]) * 0.5,
            (self.floor_min + self.floor_max) * 0.5,
            (self.min[1] + self.max[1]) * 0.5,
        )
    }

    /// Returns true if the point lies within the polygon on the XZ-plane, ``tolerance`` expands the polygon.
    #[inline]
    pub fn contains_xz(&self, point: Vec2, tolerance: f32) -> bool {
        point.x >= self.min[0] - tolerance
            && point.x <= self.max[0] + tolerance
            && point.y >= self.min[1] - tolerance
            && point.y <= self.max[1] + tolerance
    }

    /// Distance from ``point`` to the polygon. Vertical distance is measured to the floor range.
    pub fn distance_to(&self, point: Vec3) -> f32 {
        let clamped = Vec3::new(
            point.x.clamp(self.min[0], self.max[0]),
            point.y.clamp(self.floor_min, self.floor_max),
            point.z.clamp(self.min[1], self.max[1]),
        );

        clamped.distance(point)
    }
}

/// Off-mesh connection resolved to the polygon of the end point within the tile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreparedOffMeshLink {
    pub polygon: u16,
    /// End point within this tile.
    pub start: [f32; 3],
    /// Where the connection leads.
    pub end: [f32; 3],
    pub area: AreaType,
}

/// Generated nav-mesh data of a single tile. This is what gets cached & persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedNavMeshData {
    pub tile: [i32; 2],
    pub polygons: Vec<PreparedPolygon>,
    pub off_mesh_links: Vec<PreparedOffMeshLink>,
}

impl PreparedNavMeshData {
    /// Rough amount of heap memory used, for cache accounting.
    pub fn approximate_size(&self) -> usize {
        let polygons: usize = self
            .polygons
            .iter()
            .map(|polygon| {
                std::mem::size_of::<PreparedPolygon>()
                    + polygon.neighbours.len() * std::mem::size_of::<u16>()
                    + polygon.portals.len() * std::mem::size_of::<Portal>()
            })
            .sum();

        std::mem::size_of::<Self>()
            + polygons
            + self.off_mesh_links.len() * std::mem::size_of::<PreparedOffMeshLink>()
    }
}

pub(crate) fn create_prepared_nav_mesh_data(
    poly_mesh: &PolyMesh,
    tile: TilePosition,
    off_mesh_connections: &[OffMeshConnection],
    parameters: &TileBuildParameters,
) -> Result<Option<PreparedNavMeshData>, TileBuildError> {
    if poly_mesh.polygons.is_empty() {
        return Ok(None);
    }
    if poly_mesh.polygons.len() > usize::from(u16::MAX) {
        return Err(TileBuildError::TooManyPolygons(poly_mesh.polygons.len()));
    }

    let cell_size = parameters.cell_size;
    let tile_origin = tile.as_vec2() * cell_size * f32::from(parameters.tile_size);
    let floor_height =
        |floor: u16| parameters.world_bottom_bound + f32::from(floor) * parameters.cell_height;

    let polygons: Vec<PreparedPolygon> = poly_mesh
        .polygons
        .iter()
        .zip(poly_mesh.edges.iter())
        .map(|(polygon, edges)| {
            let min = tile_origin + polygon.min.as_vec2() * cell_size;
            let max = tile_origin + polygon.max.as_vec2() * cell_size;

            let mut neighbours = Vec::new();
            let mut portals = Vec::new();
            for edge in edges {
                match *edge {
                    EdgeConnection::Internal { polygon, .. } => {
                        let polygon = polygon as u16;
                        if !neighbours.contains(&polygon) {
                            neighbours.push(polygon);
                        }
                    }
                    EdgeConnection::External {
                        direction,
                        start,
                        end,
                    } => {
                        let edge_origin = if direction.is_x_facing() {
                            tile_origin.y
                        } else {
                            tile_origin.x
                        };
                        portals.push(Portal {
                            direction,
                            start: edge_origin + f32::from(start) * cell_size,
                            end: edge_origin + f32::from(end) * cell_size,
                        });
                    }
                }
            }

            PreparedPolygon {
                min: min.to_array(),
                max: max.to_array(),
                floor_min: floor_height(polygon.floor_min),
                floor_max: floor_height(polygon.floor_max),
                area: polygon.area,
                neighbours,
                portals,
            }
        })
        .collect();

    // Erosion pulls polygons back from walls, end points near walls need some slack.
    let tolerance = f32::from(parameters.walkable_radius + 1) * cell_size;
    let max_vertical_distance = f32::from(parameters.walkable_height) * parameters.cell_height;
    let tile_max = tile_origin + cell_size * f32::from(parameters.tile_size);

    let mut off_mesh_links = Vec::new();
    for connection in off_mesh_connections {
        for (from, to) in [
            (connection.start, connection.end),
            (connection.end, connection.start),
        ] {
            let from_vec = Vec3::from_array(from);
            let from_xz = Vec2::new(from_vec.x, from_vec.z);
            if from_xz.cmplt(tile_origin).any() || from_xz.cmpge(tile_max).any() {
                continue;
            }

            let nearest = polygons
                .iter()
                .enumerate()
                .filter(|(_, polygon)| polygon.contains_xz(from_xz, tolerance))
                .map(|(index, polygon)| (index, polygon.distance_to(from_vec)))
                .filter(|(_, distance)| *distance <= max_vertical_distance + tolerance)
                .min_by(|(_, a), (_, b)| a.total_cmp(b));

            if let Some((polygon, _)) = nearest {
                off_mesh_links.push(PreparedOffMeshLink {
                    polygon: polygon as u16,
                    start: from,
                    end: to,
                    area: connection.area,
                });
            }
        }
    }

    Ok(Some(PreparedNavMeshData {
        tile: tile.to_array(),
        polygons,
        off_mesh_links,
    }))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    Internal {
        neighbour_polygon: u16,
    },
    External {
        direction: EdgeConnectionDirection, // Knowing the direction of the other tile is enough to figure out the tile from our tile.
        neighbour_polygon: u16,
    },
}

/*
*   Polygons make up a form of graph, linking to other polygons (which could be on another tile)
*/
#[derive(Clone, Debug)]
pub struct NavMeshTile {
    position: TilePosition,
    revision: TileRevision,
    salt: u32,
    data: Arc<PreparedNavMeshData>,
    links: Vec<SmallVec<[Link; 8]>>,
}

impl NavMeshTile {
    fn new(
        position: TilePosition,
        revision: TileRevision,
        salt: u32,
        data: Arc<PreparedNavMeshData>,
    ) -> Self {
        // Pre build internal links.
        let links = data
            .polygons
            .iter()
            .map(|polygon| {
                polygon
                    .neighbours
                    .iter()
                    .map(|neighbour_polygon| Link::Internal {
                        neighbour_polygon: *neighbour_polygon,
                    })
                    .collect()
            })
            .collect();

        Self {
            position,
            revision,
            salt,
            data,
            links,
        }
    }

    pub fn position(&self) -> TilePosition {
        self.position
    }

    pub fn revision(&self) -> TileRevision {
        self.revision
    }

    /// Incremented every time the tile at this position is replaced.
    pub fn salt(&self) -> u32 {
        self.salt
    }

    pub fn data(&self) -> &Arc<PreparedNavMeshData> {
        &self.data
    }

    pub fn polygons(&self) -> &[PreparedPolygon] {
        &self.data.polygons
    }

    pub fn links(&self, polygon: u16) -> &[Link] {
        self.links
            .get(usize::from(polygon))
            .map(|links| links.as_slice())
            .unwrap_or_default()
    }
}

/// Immutable snapshot of an agent's nav-mesh.
#[derive(Clone, Debug, Default)]
pub struct NavMesh {
    tiles: HashMap<TilePosition, Arc<NavMeshTile>>,
    /// Published revision of every tile, including tiles without any walkable area.
    revisions: HashMap<TilePosition, TileRevision>,
    tile_size: f32,
    walkable_climb: f32,
}

impl NavMesh {
    pub fn new(tile_size: f32, walkable_climb: f32) -> Self {
        Self {
            tile_size,
            walkable_climb,
            ..Default::default()
        }
    }

    pub fn tiles(&self) -> &HashMap<TilePosition, Arc<NavMeshTile>> {
        &self.tiles
    }

    pub fn tile(&self, position: TilePosition) -> Option<&Arc<NavMeshTile>> {
        self.tiles.get(&position)
    }

    pub fn tile_revision(&self, position: TilePosition) -> Option<TileRevision> {
        self.revisions.get(&position).copied()
    }

    /// Length of a tile's side in world units.
    pub fn tile_size(&self) -> f32 {
        self.tile_size
    }

    pub fn polygon_count(&self) -> usize {
        self.tiles.values().map(|tile| tile.polygons().len()).sum()
    }

    fn add_tile(
        &mut self,
        position: TilePosition,
        revision: TileRevision,
        data: Arc<PreparedNavMeshData>,
    ) {
        // Get an incremented salt.
        let salt = self
            .tiles
            .get(&position)
            .map(|old_tile| old_tile.salt.wrapping_add(1))
            .unwrap_or(0);
        let mut tile = NavMeshTile::new(position, revision, salt, data);

        // Connect neighbours.
        for direction in EdgeConnectionDirection::ALL {
            let neighbour_position = direction.offset(position);
            let Some(neighbour) = self.tiles.get(&neighbour_position) else {
                continue;
            };

            connect_external_links(&mut tile, neighbour, direction, self.walkable_climb);

            let mut neighbour = NavMeshTile::clone(neighbour);
            remove_external_links(&mut neighbour, direction.opposite());
            connect_external_links(
                &mut neighbour,
                &tile,
                direction.opposite(),
                self.walkable_climb,
            );
            self.tiles.insert(neighbour_position, Arc::new(neighbour));
        }

        self.tiles.insert(position, Arc::new(tile));
    }

    fn remove_tile(&mut self, position: TilePosition) -> bool {
        if self.tiles.remove(&position).is_none() {
            return false;
        }

        for direction in EdgeConnectionDirection::ALL {
            let neighbour_position = direction.offset(position);
            let Some(neighbour) = self.tiles.get(&neighbour_position) else {
                continue;
            };

            let mut neighbour = NavMeshTile::clone(neighbour);
            remove_external_links(&mut neighbour, direction.opposite());
            self.tiles.insert(neighbour_position, Arc::new(neighbour));
        }

        true
    }
}

fn remove_external_links(tile: &mut NavMeshTile, towards: EdgeConnectionDirection) {
    for links in tile.links.iter_mut() {
        links.retain(|link| {
            !matches!(link, Link::External { direction, .. } if *direction == towards)
        });
    }
}

/// Links every portal of ``tile`` facing ``direction`` to the overlapping portals of ``neighbour``.
fn connect_external_links(
    tile: &mut NavMeshTile,
    neighbour: &NavMeshTile,
    direction: EdgeConnectionDirection,
    walkable_climb: f32,
) {
    let opposite = direction.opposite();

    for (poly_index, polygon) in tile.data.polygons.iter().enumerate() {
        for portal in polygon.portals.iter().filter(|portal| portal.direction == direction) {
            for (other_index, other) in neighbour.data.polygons.iter().enumerate() {
                // Floors must be within climbing distance.
                if polygon.floor_min - walkable_climb > other.floor_max
                    || other.floor_min - walkable_climb > polygon.floor_max
                {
                    continue;
                }

                let overlaps = other
                    .portals
                    .iter()
                    .filter(|other_portal| other_portal.direction == opposite)
                    .any(|other_portal| {
                        portal.end.min(other_portal.end) - portal.start.max(other_portal.start)
                            > 1e-3
                    });
                if !overlaps {
                    continue;
                }

                let link = Link::External {
                    direction,
                    neighbour_polygon: other_index as u16,
                };
                let links = &mut tile.links[poly_index];
                if !links.contains(&link) {
                    links.push(link);
                }
            }
        }
    }
}

/// Result of publishing a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateNavMeshStatus {
    /// A newer or equal revision is already published.
    Ignored,
    Added,
    Replaced,
    Removed,
    /// Tile had & still has nothing walkable, only the revision moved forward.
    Unchanged,
}

/// The current nav-mesh of one agent size.
///
/// Readers take an [`Arc<NavMesh>`] snapshot which never changes. Publishing a tile swaps in a new snapshot.
pub struct NavMeshCacheItem {
    agent_bounds: AgentBounds,
    generation: u64,
    nav_mesh: RwLock<Arc<NavMesh>>,
    nav_mesh_revision: AtomicU64,
    detached: AtomicBool,
}

pub type SharedNavMeshCacheItem = Arc<NavMeshCacheItem>;

impl NavMeshCacheItem {
    pub fn new(agent_bounds: AgentBounds, generation: u64, nav_mesh: NavMesh) -> Self {
        Self {
            agent_bounds,
            generation,
            nav_mesh: RwLock::new(Arc::new(nav_mesh)),
            nav_mesh_revision: AtomicU64::new(0),
            detached: AtomicBool::new(false),
        }
    }

    pub fn agent_bounds(&self) -> AgentBounds {
        self.agent_bounds
    }

    /// Distinguishes cache items created for the same agent, eg. after a reset.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bumped every time a tile is published.
    pub fn nav_mesh_revision(&self) -> u64 {
        self.nav_mesh_revision.load(Ordering::Acquire)
    }

    /// Returns the current snapshot of the nav-mesh.
    pub fn nav_mesh(&self) -> Arc<NavMesh> {
        self.nav_mesh
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tile_revision(&self, tile: TilePosition) -> Option<TileRevision> {
        self.nav_mesh().tile_revision(tile)
    }

    /// Returns true once the item was replaced. Nothing will be published to it anymore.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    /// Publishes tile data built from ``revision``. ``None`` means nothing in the tile is walkable.
    ///
    /// Never replaces a tile with one built from an older revision.
    pub fn update_tile(
        &self,
        tile: TilePosition,
        revision: TileRevision,
        data: Option<Arc<PreparedNavMeshData>>,
    ) -> UpdateNavMeshStatus {
        let mut current = self
            .nav_mesh
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if current
            .tile_revision(tile)
            .is_some_and(|published| published >= revision)
        {
            return UpdateNavMeshStatus::Ignored;
        }

        let mut nav_mesh = NavMesh::clone(&current);
        let status = match data {
            Some(data) => {
                let status = if nav_mesh.tiles.contains_key(&tile) {
                    UpdateNavMeshStatus::Replaced
                } else {
                    UpdateNavMeshStatus::Added
                };
                nav_mesh.add_tile(tile, revision, data);

                status
            }
            None => {
                if nav_mesh.remove_tile(tile) {
                    UpdateNavMeshStatus::Removed
                } else {
                    UpdateNavMeshStatus::Unchanged
                }
            }
        };
        nav_mesh.revisions.insert(tile, revision);

        *current = Arc::new(nav_mesh);
        self.nav_mesh_revision.fetch_add(1, Ordering::AcqRel);

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polygon(min: [f32; 2], max: [f32; 2], portals: Vec<Portal>) -> PreparedPolygon {
        PreparedPolygon {
            min,
            max,
            floor_min: 0.0,
            floor_max: 0.0,
            area: AreaType::Ground,
            neighbours: Vec::new(),
            portals,
        }
    }

    fn tile_data(tile: TilePosition, portals: Vec<Portal>) -> Arc<PreparedNavMeshData> {
        let min = tile.as_vec2() * 16.0;
        Arc::new(PreparedNavMeshData {
            tile: tile.to_array(),
            polygons: vec![polygon(min.to_array(), (min + 16.0).to_array(), portals)],
            off_mesh_links: Vec::new(),
        })
    }

    fn revision(geometry: u64) -> TileRevision {
        TileRevision {
            geometry,
            connections: 0,
        }
    }

    #[test]
    fn neighbouring_tiles_are_stitched() {
        let item = NavMeshCacheItem::new(AgentBounds::new(0.3, 0.9), 0, NavMesh::new(16.0, 0.5));

        let left = TilePosition::new(0, 0);
        let right = TilePosition::new(1, 0);
        item.update_tile(
            left,
            revision(1),
            Some(tile_data(
                left,
                vec![Portal {
                    direction: EdgeConnectionDirection::XPositive,
                    start: 2.0,
                    end: 6.0,
                }],
            )),
        );
        let before = item.nav_mesh();

        assert_eq!(
            item.update_tile(
                right,
                revision(1),
                Some(tile_data(
                    right,
                    vec![Portal {
                        direction: EdgeConnectionDirection::XNegative,
                        start: 4.0,
                        end: 10.0,
                    }],
                )),
            ),
            UpdateNavMeshStatus::Added
        );

        let nav_mesh = item.nav_mesh();
        let left_tile = nav_mesh.tile(left).expect("Left tile is published");
        assert_eq!(
            left_tile.links(0),
            &[Link::External {
                direction: EdgeConnectionDirection::XPositive,
                neighbour_polygon: 0,
            }]
        );
        // The neighbour was replaced in the new snapshot, the old snapshot is untouched.
        assert!(before.tile(left).expect("Published").links(0).is_empty());

        // Removing the right tile unlinks the left one.
        item.update_tile(right, revision(2), None);
        let nav_mesh = item.nav_mesh();
        assert!(nav_mesh.tile(right).is_none());
        assert!(nav_mesh.tile(left).expect("Published").links(0).is_empty());
        assert_eq!(nav_mesh.tile_revision(right), Some(revision(2)));
    }

    #[test]
    fn older_revisions_are_never_published() {
        let item = NavMeshCacheItem::new(AgentBounds::new(0.3, 0.9), 0, NavMesh::new(16.0, 0.5));
        let tile = TilePosition::new(2, -3);

        assert_eq!(
            item.update_tile(tile, revision(5), Some(tile_data(tile, Vec::new()))),
            UpdateNavMeshStatus::Added
        );
        assert_eq!(
            item.update_tile(tile, revision(3), None),
            UpdateNavMeshStatus::Ignored
        );
        assert_eq!(
            item.update_tile(tile, revision(5), None),
            UpdateNavMeshStatus::Ignored
        );
        assert!(item.nav_mesh().tile(tile).is_some());

        let newer_connections = TileRevision {
            geometry: 5,
            connections: 1,
        };
        assert_eq!(
            item.update_tile(tile, newer_connections, Some(tile_data(tile, Vec::new()))),
            UpdateNavMeshStatus::Replaced
        );
        assert_eq!(item.nav_mesh().tile(tile).expect("Published").salt(), 1);
        assert_eq!(item.nav_mesh_revision(), 2);
    }
}
