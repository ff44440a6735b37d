use bevy::prelude::UVec2;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{heightfields::OpenTile, AreaType, TileBuildParameters, TilePosition};

/// Axis-aligned rectangle of cells sharing an area type and lying within climbing distance of each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PolyRect {
    /// In cells relative to the tile origin, border excluded.
    pub(crate) min: UVec2,
    /// Exclusive.
    pub(crate) max: UVec2,
    pub(crate) floor_min: u16,
    pub(crate) floor_max: u16,
    pub(crate) area: AreaType,
}

#[derive(Default)]
pub(crate) struct PolyMesh {
    pub(crate) polygons: Vec<PolyRect>,
    pub(crate) edges: Vec<SmallVec<[EdgeConnection; 8]>>, // For each polygon the polygons (or tile edges) it connects to.
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeConnectionDirection {
    XNegative,
    ZPositive,
    XPositive,
    ZNegative,
}

impl EdgeConnectionDirection {
    pub const ALL: [EdgeConnectionDirection; 4] = [
        EdgeConnectionDirection::XNegative,
        EdgeConnectionDirection::ZPositive,
        EdgeConnectionDirection::XPositive,
        EdgeConnectionDirection::ZNegative,
    ];

    pub fn offset(&self, coordinate: TilePosition) -> TilePosition {
        match self {
            EdgeConnectionDirection::XNegative => coordinate - TilePosition::X,
            EdgeConnectionDirection::ZPositive => coordinate + TilePosition::Y,
            EdgeConnectionDirection::XPositive => coordinate + TilePosition::X,
            EdgeConnectionDirection::ZNegative => coordinate - TilePosition::Y,
        }
    }

    pub fn opposite(&self) -> EdgeConnectionDirection {
        match self {
            EdgeConnectionDirection::XNegative => EdgeConnectionDirection::XPositive,
            EdgeConnectionDirection::ZPositive => EdgeConnectionDirection::ZNegative,
            EdgeConnectionDirection::XPositive => EdgeConnectionDirection::XNegative,
            EdgeConnectionDirection::ZNegative => EdgeConnectionDirection::ZPositive,
        }
    }

    /// Returns true if the edge facing this direction runs along the Z-axis.
    #[inline]
    pub fn is_x_facing(&self) -> bool {
        matches!(
            self,
            EdgeConnectionDirection::XNegative | EdgeConnectionDirection::XPositive
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EdgeConnection {
    Internal {
        direction: EdgeConnectionDirection,
        polygon: u32,
    },
    /// Portal on the tile edge. ``start..end`` are the cells along the edge.
    External {
        direction: EdgeConnectionDirection,
        start: u16,
        end: u16,
    },
}

const NO_POLYGON: u32 = u32::MAX;

/// Covers the walkable interior of the tile with rectangles.
///
/// Rectangles are grown greedily along X first, then Z. Every cell of a rectangle is linked to its neighbours in the
/// open heightfield so rectangles never bridge gaps or walls.
pub(crate) fn build_poly_mesh(open_tile: &OpenTile, parameters: &TileBuildParameters) -> PolyMesh {
    let side = open_tile.side;
    let border = usize::from(parameters.border_size);
    let tile_size = usize::from(parameters.tile_size);
    let climb = parameters.walkable_climb;

    let mut owners = vec![NO_POLYGON; open_tile.spans.len()];
    let mut poly_mesh = PolyMesh::default();

    let mut row = Vec::with_capacity(tile_size);
    let mut rows: Vec<Vec<(usize, usize)>> = Vec::new();

    for z in 0..tile_size {
        for x in 0..tile_size {
            let cell = (z + border) * side + x + border;

            for seed in open_tile.cell_spans(cell) {
                let seed_span = open_tile.spans[seed];
                if owners[seed] != NO_POLYGON || !seed_span.area.is_walkable() {
                    continue;
                }

                let accepts = |owners: &[u32], span_index: usize| {
                    let span = &open_tile.spans[span_index];

                    owners[span_index] == NO_POLYGON
                        && span.area == seed_span.area
                        && span.min.abs_diff(seed_span.min) <= climb
                };

                // Grow along X.
                row.clear();
                row.push((cell, seed));
                while x + row.len() < tile_size {
                    let (last_cell, last_span) = row[row.len() - 1];
                    let Some((next_cell, next_span)) =
                        open_tile.neighbour_span(last_cell, &open_tile.spans[last_span], 2)
                    else {
                        break;
                    };
                    if !accepts(&owners, next_span) {
                        break;
                    }
                    row.push((next_cell, next_span));
                }
                let width = row.len();

                // Grow along Z, one full row at a time.
                rows.clear();
                rows.push(row.clone());
                while z + rows.len() < tile_size {
                    let previous_row = &rows[rows.len() - 1];
                    let mut next_row: Vec<(usize, usize)> = Vec::with_capacity(width);

                    for (cell_index, span_index) in previous_row.iter() {
                        let Some(above) =
                            open_tile.neighbour_span(*cell_index, &open_tile.spans[*span_index], 1)
                        else {
                            break;
                        };
                        if !accepts(&owners, above.1) {
                            break;
                        }
                        // Must also be connected to the previous cell of the new row.
                        if let Some((previous_cell, previous_span)) = next_row.last() {
                            if open_tile.neighbour_span(
                                *previous_cell,
                                &open_tile.spans[*previous_span],
                                2,
                            ) != Some(above)
                            {
                                break;
                            }
                        }
                        next_row.push(above);
                    }

                    if next_row.len() != width {
                        break;
                    }
                    rows.push(next_row);
                }

                let polygon = poly_mesh.polygons.len() as u32;
                let mut floor_min = u16::MAX;
                let mut floor_max = 0;
                for (_, span_index) in rows.iter().flatten() {
                    owners[*span_index] = polygon;
                    let floor = open_tile.spans[*span_index].min;
                    floor_min = floor_min.min(floor);
                    floor_max = floor_max.max(floor);
                }

                poly_mesh.polygons.push(PolyRect {
                    min: UVec2::new(x as u32, z as u32),
                    max: UVec2::new((x + width) as u32, (z + rows.len()) as u32),
                    floor_min,
                    floor_max,
                    area: seed_span.area,
                });
            }
        }
    }

    build_mesh_adjacency(open_tile, &owners, parameters, &mut poly_mesh);

    poly_mesh
}

fn build_mesh_adjacency(
    open_tile: &OpenTile,
    owners: &[u32],
    parameters: &TileBuildParameters,
    poly_mesh: &mut PolyMesh,
) {
    let side = open_tile.side;
    let border = usize::from(parameters.border_size);
    let tile_size = usize::from(parameters.tile_size);

    poly_mesh.edges.clear();
    poly_mesh
        .edges
        .resize(poly_mesh.polygons.len(), SmallVec::new());
    // Cells along the edge of each polygon that continue into the tile border.
    let mut portal_cells: Vec<[SmallVec<[u16; 8]>; 4]> =
        vec![Default::default(); poly_mesh.polygons.len()];

    for z in 0..tile_size {
        for x in 0..tile_size {
            let cell = (z + border) * side + x + border;

            for span_index in open_tile.cell_spans(cell) {
                let polygon = owners[span_index];
                if polygon == NO_POLYGON {
                    continue;
                }
                let span = open_tile.spans[span_index];

                for (dir, direction) in EdgeConnectionDirection::ALL.into_iter().enumerate() {
                    let Some((_, other)) = open_tile.neighbour_span(cell, &span, dir) else {
                        continue;
                    };

                    let leaves_tile = match direction {
                        EdgeConnectionDirection::XNegative => x == 0,
                        EdgeConnectionDirection::ZPositive => z == tile_size - 1,
                        EdgeConnectionDirection::XPositive => x == tile_size - 1,
                        EdgeConnectionDirection::ZNegative => z == 0,
                    };
                    if leaves_tile {
                        if open_tile.spans[other].area.is_walkable() {
                            let along = if direction.is_x_facing() { z } else { x };
                            portal_cells[polygon as usize][dir].push(along as u16);
                        }
                        continue;
                    }

                    let other_polygon = owners[other];
                    if other_polygon == NO_POLYGON || other_polygon == polygon {
                        continue;
                    }

                    let edges = &mut poly_mesh.edges[polygon as usize];
                    let connection = EdgeConnection::Internal {
                        direction,
                        polygon: other_polygon,
                    };
                    if !edges.contains(&connection) {
                        edges.push(connection);
                    }
                }
            }
        }
    }

    // Fold portal cells into contiguous segments.
    for (polygon, cells) in portal_cells.iter().enumerate() {
        for (dir, positions) in cells.iter().enumerate() {
            let direction = EdgeConnectionDirection::ALL[dir];
            let mut iter = positions.iter().copied();
            let Some(first) = iter.next() else {
                continue;
            };

            let (mut start, mut end) = (first, first + 1);
            for position in iter {
                if position == end {
                    end += 1;
                    continue;
                }
                poly_mesh.edges[polygon].push(EdgeConnection::External {
                    direction,
                    start,
                    end,
                });
                (start, end) = (position, position + 1);
            }
            poly_mesh.edges[polygon].push(EdgeConnection::External {
                direction,
                start,
                end,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        heightfields::{build_heightfield_tile, build_open_heightfield_tile, erode_walkable_area},
        recast_mesh::RecastMesh,
        AgentBounds, NavigatorSettings,
    };
    use bevy::prelude::Vec2;

    use super::*;

    fn parameters() -> TileBuildParameters {
        let settings = NavigatorSettings::from_world_bounds(1000.0, -10.0)
            .with_cell_size(0.25, 0.1)
            .with_tile_size(16)
            .with_border_size(4)
            .with_min_region_area(0);

        TileBuildParameters::new(&AgentBounds::new(0.25, 0.9), &settings)
    }

    fn build(mesh: &RecastMesh, parameters: &TileBuildParameters) -> PolyMesh {
        let voxelized =
            build_heightfield_tile(TilePosition::ZERO, mesh, parameters).expect("Valid mesh");
        let mut open_tile = build_open_heightfield_tile(&voxelized, parameters);
        erode_walkable_area(&mut open_tile, parameters);

        build_poly_mesh(&open_tile, parameters)
    }

    #[test]
    fn flat_floor_is_a_single_rectangle() {
        let parameters = parameters();
        let mut mesh = RecastMesh::default();
        // Covers the tile & its border completely.
        mesh.push_rectangle(Vec2::splat(-5.0), Vec2::splat(10.0), 0.0, AreaType::Ground);

        let poly_mesh = build(&mesh, &parameters);

        assert_eq!(poly_mesh.polygons.len(), 1);
        let polygon = poly_mesh.polygons[0];
        assert_eq!(polygon.min, UVec2::ZERO);
        assert_eq!(polygon.max, UVec2::splat(16));

        // Every side continues into the neighbouring tiles.
        let portals = poly_mesh.edges[0]
            .iter()
            .filter(|edge| matches!(edge, EdgeConnection::External { start: 0, end: 16, .. }))
            .count();
        assert_eq!(portals, 4);
    }

    #[test]
    fn wall_splits_floor() {
        let parameters = parameters();
        let mut mesh = RecastMesh::default();
        mesh.push_rectangle(Vec2::splat(-5.0), Vec2::splat(10.0), 0.0, AreaType::Ground);
        // Raised strip across the whole tile along X. Too high to climb, too low to walk under.
        mesh.push_rectangle(
            Vec2::new(-5.0, 1.75),
            Vec2::new(10.0, 2.25),
            1.0,
            AreaType::Ground,
        );

        let poly_mesh = build(&mesh, &parameters);

        // Nothing links the areas on either side of the strip.
        let south: Vec<usize> = (0..poly_mesh.polygons.len())
            .filter(|polygon| poly_mesh.polygons[*polygon].max.y <= 7)
            .collect();
        assert!(!south.is_empty());
        for polygon in south {
            for edge in &poly_mesh.edges[polygon] {
                if let EdgeConnection::Internal { polygon: other, .. } = edge {
                    assert!(poly_mesh.polygons[*other as usize].max.y <= 7);
                }
            }
        }
    }
}
