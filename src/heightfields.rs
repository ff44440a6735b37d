use bevy::prelude::Vec3;
use smallvec::SmallVec;

use crate::{
    get_neighbour_index, recast_mesh::RecastMesh, AreaType, TileBuildError, TileBuildParameters,
    TilePosition,
};

#[derive(Default, Clone, Copy, Debug)]
struct HeightSpan {
    min: u16,
    max: u16,
    area: AreaType,
}

#[derive(Default, Clone)]
struct VoxelCell {
    spans: SmallVec<[HeightSpan; 2]>, // Bottom to top.
}

pub(crate) struct VoxelizedTile {
    side: usize,
    cells: Vec<VoxelCell>, // len = side^2. Laid out X to Z
}

/// Walkable space on top of a solid span.
#[derive(Default, Clone, Copy, Debug)]
pub(crate) struct OpenSpan {
    pub(crate) min: u16,
    /// ``None`` if nothing is above.
    pub(crate) max: Option<u16>,
    /// Index of the connected span within the neighbouring cell.
    pub(crate) neighbours: [Option<u16>; 4],
    pub(crate) area: AreaType,
}

#[derive(Default, Clone, Copy, Debug)]
pub(crate) struct OpenCell {
    pub(crate) index: u32,
    pub(crate) count: u16,
}

/// Open heightfield of a tile including its border. Spans are stored flat, cells index into them.
pub(crate) struct OpenTile {
    pub(crate) side: usize,
    pub(crate) cells: Vec<OpenCell>,
    pub(crate) spans: Vec<OpenSpan>,
    pub(crate) distances: Vec<u16>,
}

impl OpenTile {
    /// Returns the index of the span connected to ``span`` in direction ``dir``.
    #[inline]
    pub(crate) fn neighbour_span(&self, cell_index: usize, span: &OpenSpan, dir: usize) -> Option<(usize, usize)> {
        let local = span.neighbours[dir]?;
        let other_cell = get_neighbour_index(self.side, cell_index, dir);

        Some((
            other_cell,
            self.cells[other_cell].index as usize + usize::from(local),
        ))
    }

    #[inline]
    pub(crate) fn cell_spans(&self, cell_index: usize) -> std::ops::Range<usize> {
        let cell = self.cells[cell_index];
        let first = cell.index as usize;

        first..first + usize::from(cell.count)
    }
}

pub(crate) fn build_heightfield_tile(
    tile: TilePosition,
    recast_mesh: &RecastMesh,
    parameters: &TileBuildParameters,
) -> Result<VoxelizedTile, TileBuildError> {
    let side = parameters.get_tile_side_with_border();
    let mut voxel_tile = VoxelizedTile {
        side,
        cells: vec![VoxelCell::default(); side * side],
    };

    let vertex_count = recast_mesh.vertices.len();
    if let Some(index) = recast_mesh
        .indices
        .iter()
        .flatten()
        .find(|index| **index as usize >= vertex_count)
    {
        return Err(TileBuildError::InvalidIndex {
            index: *index,
            count: vertex_count,
        });
    }

    let origin = parameters.get_tile_origin_with_border(tile);
    let offset = Vec3::new(origin.x, 0.0, origin.y);
    let walkable_threshold = parameters.max_traversable_slope_radians.cos();

    for (triangle, area) in recast_mesh.indices.iter().zip(recast_mesh.areas.iter()) {
        let [a, b, c] = triangle.map(|index| Vec3::from_array(recast_mesh.vertices[index as usize]) - offset);

        let normal = (b - a).cross(c - a);
        let length = normal.length();
        if length <= f32::EPSILON {
            continue;
        }
        // Triangles are double sided, winding doesn't matter.
        let area = if (normal.y / length).abs() >= walkable_threshold {
            *area
        } else {
            AreaType::Null
        };

        rasterize_triangle(&mut voxel_tile, [a, b, c], area, parameters);
    }

    filter_low_hanging_obstacles(&mut voxel_tile, parameters);

    Ok(voxel_tile)
}

fn rasterize_triangle(
    voxel_tile: &mut VoxelizedTile,
    triangle: [Vec3; 3],
    area: AreaType,
    parameters: &TileBuildParameters,
) {
    let side = voxel_tile.side as i32;
    let cell_size = parameters.cell_size;
    let inverse_cell_size = 1.0 / cell_size;

    let min_bound = triangle[0].min(triangle[1]).min(triangle[2]);
    let max_bound = triangle[0].max(triangle[1]).max(triangle[2]);

    // Check if triangle is completely outside the tile.
    let tile_extent = side as f32 * cell_size;
    if max_bound.x < 0.0 || max_bound.z < 0.0 || min_bound.x > tile_extent || min_bound.z > tile_extent {
        return;
    }

    let z_min = ((min_bound.z * inverse_cell_size) as i32).clamp(0, side - 1);
    let z_max = ((max_bound.z * inverse_cell_size) as i32).clamp(0, side - 1);

    let mut vertices = [Vec3::ZERO; 7];
    vertices[..3].copy_from_slice(&triangle);

    // --> X
    // Z
    // |
    // V
    // X is column. Z is row.
    for z in z_min..=z_max {
        let row_clip_min = z as f32 * cell_size;
        let row_clip_max = row_clip_min + cell_size;

        // Clip polygon to the row.
        let (_, _, row_min_clip_vert_count, row_min_clip_verts) =
            divide_polygon(&vertices, 3, row_clip_min, 2);
        let (row_vert_count, row_verts, _, _) =
            divide_polygon(&row_min_clip_verts, row_min_clip_vert_count, row_clip_max, 2);
        if row_vert_count < 3 {
            continue;
        }

        // Calculate the column footprint of the row.
        let mut column_min_vert_x = row_verts[0].x;
        let mut column_max_vert_x = row_verts[0].x;
        for vertex in row_verts.iter().take(row_vert_count).skip(1) {
            column_min_vert_x = column_min_vert_x.min(vertex.x);
            column_max_vert_x = column_max_vert_x.max(vertex.x);
        }
        if column_max_vert_x < 0.0 || column_min_vert_x > tile_extent {
            continue;
        }
        let column_min = ((column_min_vert_x * inverse_cell_size) as i32).clamp(0, side - 1);
        let column_max = ((column_max_vert_x * inverse_cell_size) as i32).clamp(0, side - 1);

        for x in column_min..=column_max {
            let column_clip_min = x as f32 * cell_size;
            let column_clip_max = column_clip_min + cell_size;

            // Clip polygon to column.
            let (_, _, column_min_clip_vert_count, column_min_clip_verts) =
                divide_polygon(&row_verts, row_vert_count, column_clip_min, 0);
            let (column_vert_count, column_verts, _, _) = divide_polygon(
                &column_min_clip_verts,
                column_min_clip_vert_count,
                column_clip_max,
                0,
            );
            if column_vert_count < 3 {
                continue;
            }

            let mut square_min_height = column_verts[0].y;
            let mut square_max_height = column_verts[0].y;
            for vertex in column_verts.iter().take(column_vert_count).skip(1) {
                square_min_height = square_min_height.min(vertex.y);
                square_max_height = square_max_height.max(vertex.y);
            }
            square_min_height -= parameters.world_bottom_bound;
            square_max_height -= parameters.world_bottom_bound;

            if square_max_height < 0.0 {
                continue;
            }
            square_min_height = square_min_height.max(0.0);

            let min_height = (square_min_height / parameters.cell_height)
                .floor()
                .min(f32::from(u16::MAX - 1)) as u16;
            let max_height = ((square_max_height / parameters.cell_height).ceil() as u16)
                .max(min_height + 1);

            let index = (x + z * side) as usize;
            add_span(
                &mut voxel_tile.cells[index],
                HeightSpan {
                    min: min_height,
                    max: max_height,
                    area,
                },
                parameters.walkable_climb,
            );
        }
    }
}

fn add_span(cell: &mut VoxelCell, mut new_span: HeightSpan, flag_merge_threshold: u16) {
    let mut i = 0;
    while i < cell.spans.len() {
        let existing_span = cell.spans[i];
        if existing_span.min > new_span.max {
            // i is beyond the new span. We can insert!
            break;
        } else if existing_span.max < new_span.min {
            // i is before the new span. Continue until we hit one that isn't.
            i += 1;
            continue;
        }

        // An overlap!
        new_span.min = new_span.min.min(existing_span.min);
        new_span.max = new_span.max.max(existing_span.max);

        // Surfaces at roughly the same height keep the most important area.
        if new_span.max.abs_diff(existing_span.max) <= flag_merge_threshold {
            new_span.area = new_span.area.max(existing_span.area);
        }
        cell.spans.remove(i);
    }
    cell.spans.insert(i, new_span);
}

/// Obstacles low enough to be stepped over inherit the area of the walkable span below them.
fn filter_low_hanging_obstacles(voxel_tile: &mut VoxelizedTile, parameters: &TileBuildParameters) {
    for cell in voxel_tile.cells.iter_mut() {
        let mut previous: Option<HeightSpan> = None;
        for span in cell.spans.iter_mut() {
            let original = *span;
            if let Some(previous) = previous {
                if previous.area.is_walkable()
                    && !span.area.is_walkable()
                    && span.max.abs_diff(previous.max) <= parameters.walkable_climb
                {
                    span.area = previous.area;
                }
            }
            previous = Some(original);
        }
    }
}

/*
*   This function takes in a polygon (of max 7 vertices), an line on which to divide it, and an axis.
*   It then returns the left polygon's vertex count, the left polygon's vertices,
*   the right polygon's vertex count, and the right polygon's vertices.
*/
fn divide_polygon(
    vertices: &[Vec3; 7],
    vertex_count_in: usize,
    clip_line: f32,
    axis: usize,
) -> (usize, [Vec3; 7], usize, [Vec3; 7]) {
    let mut polygon_a = [Vec3::ZERO; 7];
    let mut polygon_b = [Vec3::ZERO; 7];

    let mut delta_from_line = [0.0; 7];
    // This loop determines which side of the line the vertex is on.
    for i in 0..vertex_count_in {
        delta_from_line[i] = clip_line - vertices[i][axis];
    }

    let mut verts_a = 0;
    let mut verts_b = 0;

    for i in 0..vertex_count_in {
        let j = (vertex_count_in - 1 + i) % vertex_count_in; // j is i-1 wrapped.

        let in_a = delta_from_line[j] >= 0.0;
        let in_b = delta_from_line[i] >= 0.0;

        // Check if both vertices are on the same side of the line.
        if in_a != in_b {
            // We slide the vertex along to the edge.
            let slide = delta_from_line[j] / (delta_from_line[j] - delta_from_line[i]);

            polygon_a[verts_a] = vertices[j] + (vertices[i] - vertices[j]) * slide;
            polygon_b[verts_b] = polygon_a[verts_a];
            verts_a += 1;
            verts_b += 1;

            if delta_from_line[i] > 0.0 {
                polygon_a[verts_a] = vertices[i];
                verts_a += 1;
            } else if delta_from_line[i] < 0.0 {
                polygon_b[verts_b] = vertices[i];
                verts_b += 1;
            }
        } else {
            if delta_from_line[i] >= 0.0 {
                polygon_a[verts_a] = vertices[i];
                verts_a += 1;

                if delta_from_line[i] != 0.0 {
                    continue;
                }
            }
            polygon_b[verts_b] = vertices[i];
            verts_b += 1;
        }
    }

    (verts_a, polygon_a, verts_b, polygon_b)
}

pub(crate) fn build_open_heightfield_tile(
    voxel_tile: &VoxelizedTile,
    parameters: &TileBuildParameters,
) -> OpenTile {
    let side = voxel_tile.side;
    let mut open_tile = OpenTile {
        side,
        cells: vec![OpenCell::default(); side * side],
        spans: Vec::new(),
        distances: Vec::new(),
    };

    // First we create open spaces.
    for (i, cell) in voxel_tile.cells.iter().enumerate() {
        open_tile.cells[i].index = open_tile.spans.len() as u32;

        let mut iter = cell.spans.iter().peekable();
        while let Some(span) = iter.next() {
            let max = iter.peek().map(|next_span| next_span.min);
            // Not enough room to stand.
            let area = match max {
                Some(max) if max - span.max < parameters.walkable_height => AreaType::Null,
                _ => span.area,
            };

            open_tile.spans.push(OpenSpan {
                min: span.max,
                max,
                area,
                ..Default::default()
            });
        }
        open_tile.cells[i].count = cell.spans.len() as u16;
    }

    // Then we link neighbouring ones.
    for i in 0..open_tile.cells.len() {
        let row = i / side;
        let column = i % side;

        for span_index in open_tile.cell_spans(i) {
            let span = open_tile.spans[span_index];

            for dir in 0..4 {
                let contained = match dir {
                    0 => column > 0,
                    1 => row < side - 1,
                    2 => column < side - 1,
                    _ => row > 0,
                };
                if !contained {
                    continue;
                }

                let other_cell = get_neighbour_index(side, i, dir);
                let connection = open_tile
                    .cell_spans(other_cell)
                    .position(|other_index| {
                        let other = &open_tile.spans[other_index];

                        let bottom = span.min.max(other.min);
                        let top = match (span.max, other.max) {
                            (Some(a), Some(b)) => a.min(b),
                            (Some(a), None) | (None, Some(a)) => a,
                            (None, None) => u16::MAX,
                        };

                        top.saturating_sub(bottom) >= parameters.walkable_height
                            && span.min.abs_diff(other.min) <= parameters.walkable_climb
                    })
                    .map(|local| local as u16);

                open_tile.spans[span_index].neighbours[dir] = connection;
            }
        }
    }

    open_tile.distances = vec![u16::MAX; open_tile.spans.len()];

    open_tile
}

/// Marks everything closer than the agent radius to an obstacle or ledge as unwalkable.
pub(crate) fn erode_walkable_area(open_tile: &mut OpenTile, parameters: &TileBuildParameters) {
    let side = open_tile.side;

    for i in 0..open_tile.cells.len() {
        for span_index in open_tile.cell_spans(i) {
            let span = open_tile.spans[span_index];
            if !span.area.is_walkable() {
                open_tile.distances[span_index] = 0;
                continue;
            }

            let neighbours = (0..4)
                .filter_map(|dir| open_tile.neighbour_span(i, &span, dir))
                .filter(|(_, other)| open_tile.spans[*other].area.is_walkable())
                .count();
            open_tile.distances[span_index] = if neighbours == 4 { u16::MAX } else { 0 };
        }
    }

    // Pass 1. (-1, 0), (-1, -1), (0, -1), (1, -1)
    for i in 0..side * side {
        for span_index in open_tile.cell_spans(i) {
            let span = open_tile.spans[span_index];
            let mut distance = open_tile.distances[span_index];

            if let Some((other_cell, other_index)) = open_tile.neighbour_span(i, &span, 0) {
                distance = distance.min(open_tile.distances[other_index].saturating_add(2));

                let other_span = open_tile.spans[other_index];
                if let Some((_, diagonal)) = open_tile.neighbour_span(other_cell, &other_span, 3) {
                    distance = distance.min(open_tile.distances[diagonal].saturating_add(3));
                }
            }
            if let Some((other_cell, other_index)) = open_tile.neighbour_span(i, &span, 3) {
                distance = distance.min(open_tile.distances[other_index].saturating_add(2));

                let other_span = open_tile.spans[other_index];
                if let Some((_, diagonal)) = open_tile.neighbour_span(other_cell, &other_span, 2) {
                    distance = distance.min(open_tile.distances[diagonal].saturating_add(3));
                }
            }

            open_tile.distances[span_index] = distance;
        }
    }

    // Pass 2. (1, 0), (1, 1), (0, 1), (-1, 1)
    for i in (0..side * side).rev() {
        for span_index in open_tile.cell_spans(i) {
            let span = open_tile.spans[span_index];
            let mut distance = open_tile.distances[span_index];

            if let Some((other_cell, other_index)) = open_tile.neighbour_span(i, &span, 2) {
                distance = distance.min(open_tile.distances[other_index].saturating_add(2));

                let other_span = open_tile.spans[other_index];
                if let Some((_, diagonal)) = open_tile.neighbour_span(other_cell, &other_span, 1) {
                    distance = distance.min(open_tile.distances[diagonal].saturating_add(3));
                }
            }
            if let Some((other_cell, other_index)) = open_tile.neighbour_span(i, &span, 1) {
                distance = distance.min(open_tile.distances[other_index].saturating_add(2));

                let other_span = open_tile.spans[other_index];
                if let Some((_, diagonal)) = open_tile.neighbour_span(other_cell, &other_span, 0) {
                    distance = distance.min(open_tile.distances[diagonal].saturating_add(3));
                }
            }

            open_tile.distances[span_index] = distance;
        }
    }

    let threshold = parameters.walkable_radius * 2;
    for (span, distance) in open_tile.spans.iter_mut().zip(open_tile.distances.iter()) {
        if *distance < threshold {
            span.area = AreaType::Null;
        }
    }
}

/// Removes walkable islands smaller than ``min_region_area`` cells that don't reach into the tile border.
///
/// Islands reaching into the border may continue in the neighbouring tile so they are always kept.
pub(crate) fn filter_small_islands(open_tile: &mut OpenTile, parameters: &TileBuildParameters) {
    if parameters.min_region_area == 0 {
        return;
    }

    let side = open_tile.side;
    let border = usize::from(parameters.border_size);
    let in_border = |cell: usize| {
        let (row, column) = (cell / side, cell % side);

        row < border || column < border || row >= side - border || column >= side - border
    };

    // Cell of each span, needed when walking links.
    let mut span_cells = vec![0; open_tile.spans.len()];
    for i in 0..open_tile.cells.len() {
        for span_index in open_tile.cell_spans(i) {
            span_cells[span_index] = i;
        }
    }

    let mut visited = vec![false; open_tile.spans.len()];
    let mut stack = Vec::new();
    let mut island = Vec::new();
    for start in 0..open_tile.spans.len() {
        if visited[start] || !open_tile.spans[start].area.is_walkable() {
            continue;
        }

        island.clear();
        stack.push(start);
        visited[start] = true;
        let mut touches_border = false;

        while let Some(span_index) = stack.pop() {
            island.push(span_index);
            let cell = span_cells[span_index];
            touches_border |= in_border(cell);

            let span = open_tile.spans[span_index];
            for dir in 0..4 {
                let Some((_, other)) = open_tile.neighbour_span(cell, &span, dir) else {
                    continue;
                };
                if visited[other] || !open_tile.spans[other].area.is_walkable() {
                    continue;
                }

                visited[other] = true;
                stack.push(other);
            }
        }

        if !touches_border && island.len() < parameters.min_region_area as usize {
            for span_index in &island {
                open_tile.spans[*span_index].area = AreaType::Null;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{AgentBounds, NavigatorSettings};

    use super::*;

    fn parameters() -> TileBuildParameters {
        let settings = NavigatorSettings::from_world_bounds(1000.0, -10.0)
            .with_cell_size(0.25, 0.1)
            .with_tile_size(16)
            .with_border_size(4)
            .with_max_climb(0.55)
            .with_min_region_area(0);

        TileBuildParameters::new(&AgentBounds::new(0.25, 0.9), &settings)
    }

    fn quad(mesh: &mut RecastMesh, min: [f32; 2], max: [f32; 2], height: f32) {
        mesh.push_rectangle(min.into(), max.into(), height, AreaType::Ground);
    }

    #[test]
    fn test_clip_polygon() {
        let mut vertices = [Vec3::ZERO; 7];
        vertices[0] = Vec3::new(0.0, 0.0, 0.0);
        vertices[1] = Vec3::new(7.5, 0.0, 0.0);
        vertices[2] = Vec3::new(7.5, 0.0, 7.5);

        let (_, _, verts_b, polygon_b) = divide_polygon(&vertices, 3, 2.5, 0);
        assert_eq!(verts_b, 4);
        assert!(polygon_b[..verts_b].iter().all(|vertex| vertex.x >= 2.5));

        let (verts_c, polygon_c, _, _) = divide_polygon(&polygon_b, verts_b, 5.0, 0);
        assert_eq!(verts_c, 4);
        assert!(polygon_c[..verts_c]
            .iter()
            .all(|vertex| (2.5..=5.0).contains(&vertex.x)));
    }

    #[test]
    fn overlapping_spans_merge() {
        let mut cell = VoxelCell::default();
        add_span(&mut cell, HeightSpan { min: 0, max: 10, area: AreaType::Ground }, 2);
        add_span(&mut cell, HeightSpan { min: 20, max: 30, area: AreaType::Ground }, 2);
        // Bridges both, top is non-walkable & well above the lower top.
        add_span(&mut cell, HeightSpan { min: 5, max: 25, area: AreaType::Null }, 2);

        assert_eq!(cell.spans.len(), 1);
        assert_eq!(cell.spans[0].min, 0);
        assert_eq!(cell.spans[0].max, 30);
        // Merged top is within the threshold of the existing walkable top.
        assert_eq!(cell.spans[0].area, AreaType::Ground);

        let mut cell = VoxelCell::default();
        add_span(&mut cell, HeightSpan { min: 0, max: 10, area: AreaType::Ground }, 2);
        add_span(&mut cell, HeightSpan { min: 5, max: 11, area: AreaType::Water }, 2);
        assert_eq!(cell.spans[0].area, AreaType::Ground);
    }

    #[test]
    fn flat_floor_is_fully_connected() {
        let parameters = parameters();
        let side = parameters.get_tile_side_with_border();
        let mut mesh = RecastMesh::default();
        quad(&mut mesh, [-10.0, -10.0], [10.0, 10.0], 0.0);

        let voxelized = build_heightfield_tile(TilePosition::ZERO, &mesh, &parameters)
            .expect("Valid mesh");
        assert!(voxelized.cells.iter().all(|cell| cell.spans.len() == 1));

        let open_tile = build_open_heightfield_tile(&voxelized, &parameters);
        assert_eq!(open_tile.spans.len(), side * side);

        // Interior span has all four neighbours.
        let center = side / 2 * side + side / 2;
        let span = open_tile.spans[open_tile.cells[center].index as usize];
        assert!(span.neighbours.iter().all(Option::is_some));
        assert_eq!(span.area, AreaType::Ground);
    }

    #[test]
    fn erosion_pulls_back_from_edges() {
        let parameters = parameters();
        assert_eq!(parameters.walkable_radius, 1);

        let side = parameters.get_tile_side_with_border();
        let mut mesh = RecastMesh::default();
        // 2 world units wide, 8 cells.
        quad(&mut mesh, [0.0, 0.0], [2.0, 2.0], 0.0);

        let voxelized = build_heightfield_tile(TilePosition::ZERO, &mesh, &parameters)
            .expect("Valid mesh");
        let mut open_tile = build_open_heightfield_tile(&voxelized, &parameters);
        erode_walkable_area(&mut open_tile, &parameters);

        // Tile origin with border is at -1.0, so the quad starts at cell 4.
        let edge = 4 * side + 4;
        let inner = 5 * side + 5;
        let edge_span = open_tile.spans[open_tile.cells[edge].index as usize];
        let inner_span = open_tile.spans[open_tile.cells[inner].index as usize];
        assert_eq!(edge_span.area, AreaType::Null);
        assert_eq!(inner_span.area, AreaType::Ground);
    }

    #[test]
    fn invalid_index_is_an_error() {
        let mesh = RecastMesh {
            vertices: vec![[0.0; 3]; 3],
            indices: vec![[0, 1, 3]],
            areas: vec![AreaType::Ground],
        };

        assert_eq!(
            build_heightfield_tile(TilePosition::ZERO, &mesh, &parameters()).err(),
            Some(TileBuildError::InvalidIndex { index: 3, count: 3 })
        );
    }

    #[test]
    fn small_islands_are_removed() {
        let settings = NavigatorSettings::from_world_bounds(1000.0, -10.0)
            .with_cell_size(0.25, 0.1)
            .with_tile_size(16)
            .with_border_size(4)
            .with_min_region_area(16);
        let parameters = TileBuildParameters::new(&AgentBounds::new(0.1, 0.9), &settings);

        let mut mesh = RecastMesh::default();
        // A 3x3 cell table top well above the floor, fully inside the tile.
        quad(&mut mesh, [1.5, 1.5], [2.25, 2.25], 3.0);
        // Floor reaching into the border.
        quad(&mut mesh, [-1.0, -1.0], [1.0, 5.0], 0.0);

        let voxelized = build_heightfield_tile(TilePosition::ZERO, &mesh, &parameters)
            .expect("Valid mesh");
        let mut open_tile = build_open_heightfield_tile(&voxelized, &parameters);
        filter_small_islands(&mut open_tile, &parameters);

        let side = open_tile.side;
        let table = 11 * side + 11;
        let floor = 8 * side + 5;
        assert_eq!(
            open_tile.spans[open_tile.cells[table].index as usize].area,
            AreaType::Null
        );
        assert_eq!(
            open_tile.spans[open_tile.cells[floor].index as usize].area,
            AreaType::Ground
        );
    }
}
