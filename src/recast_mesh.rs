use bevy::prelude::{IVec2, Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::AreaType;

/// Merged input geometry of one tile (including its border).
///
/// Every triangle carries the area type of the shape it came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecastMesh {
    pub vertices: Vec<[f32; 3]>,
    pub indices: Vec<[u32; 3]>,
    pub areas: Vec<AreaType>,
}

impl RecastMesh {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    /// Returns the minimum & maximum bound of the mesh.
    pub fn bounds(&self) -> Option<(Vec3, Vec3)> {
        let mut vertices = self.vertices.iter().map(|vertex| Vec3::from_array(*vertex));
        let first = vertices.next()?;

        Some(vertices.fold((first, first), |(min, max), vertex| {
            (min.min(vertex), max.max(vertex))
        }))
    }

    /// Appends all triangles overlapping the rectangle ``min..max`` on the XZ-plane.
    pub(crate) fn push_triangles(
        &mut self,
        vertices: &[Vec3],
        indices: &[[u32; 3]],
        area: AreaType,
        min: Vec2,
        max: Vec2,
    ) {
        let mut remap = vec![u32::MAX; vertices.len()];

        for triangle in indices {
            let [a, b, c] = triangle.map(|index| vertices[index as usize]);
            let triangle_min = a.min(b).min(c);
            let triangle_max = a.max(b).max(c);
            if triangle_max.x < min.x
                || triangle_max.z < min.y
                || triangle_min.x > max.x
                || triangle_min.z > max.y
            {
                continue;
            }

            let triangle = triangle.map(|index| {
                let remapped = &mut remap[index as usize];
                if *remapped == u32::MAX {
                    *remapped = self.vertices.len() as u32;
                    self.vertices.push(vertices[index as usize].to_array());
                }
                *remapped
            });

            self.indices.push(triangle);
            self.areas.push(area);
        }
    }

    /// Appends a horizontal rectangle at ``height`` as two triangles, facing up.
    pub(crate) fn push_rectangle(&mut self, min: Vec2, max: Vec2, height: f32, area: AreaType) {
        let first = self.vertices.len() as u32;
        self.vertices.extend([
            [min.x, height, min.y],
            [min.x, height, max.y],
            [max.x, height, max.y],
            [max.x, height, min.y],
        ]);
        self.indices
            .extend([[first, first + 1, first + 2], [first, first + 2, first + 3]]);
        self.areas.extend([area, area]);
    }
}

/// Water plane covering a whole cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Water {
    pub cell_position: IVec2,
    pub cell_size: i32,
    pub level: f32,
}

impl Water {
    pub fn is_valid(&self) -> bool {
        self.cell_size > 0 && self.level.is_finite()
    }

    pub fn bounds(&self) -> (Vec3, Vec3) {
        let (min, max) = cell_bounds(self.cell_position, self.cell_size);

        (
            Vec3::new(min.x, self.level, min.y),
            Vec3::new(max.x, self.level, max.y),
        )
    }

    pub(crate) fn append_to(&self, mesh: &mut RecastMesh, min: Vec2, max: Vec2) {
        let (cell_min, cell_max) = cell_bounds(self.cell_position, self.cell_size);
        let clipped_min = cell_min.max(min);
        let clipped_max = cell_max.min(max);
        if clipped_min.x >= clipped_max.x || clipped_min.y >= clipped_max.y {
            return;
        }

        mesh.push_rectangle(clipped_min, clipped_max, self.level, AreaType::Water);
    }
}

/// Terrain of a single cell.
#[derive(Debug, Clone, PartialEq)]
pub enum HeightfieldShape {
    /// Whole cell at one height.
    Flat { height: f32 },
    /// ``size * size`` height samples laid out X to Z, evenly spaced over the cell.
    Surface {
        heights: Vec<f32>,
        size: usize,
        min_height: f32,
        max_height: f32,
    },
}

/// Terrain heightfield of a cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Heightfield {
    pub cell_position: IVec2,
    pub cell_size: i32,
    pub shape: HeightfieldShape,
}

impl Heightfield {
    pub fn is_valid(&self) -> bool {
        if self.cell_size <= 0 {
            return false;
        }

        match &self.shape {
            HeightfieldShape::Flat { height } => height.is_finite(),
            HeightfieldShape::Surface {
                heights,
                size,
                min_height,
                max_height,
            } => {
                *size >= 2
                    && heights.len() == size * size
                    && heights.iter().all(|height| height.is_finite())
                    && min_height <= max_height
            }
        }
    }

    pub fn bounds(&self) -> (Vec3, Vec3) {
        let (min, max) = cell_bounds(self.cell_position, self.cell_size);
        let (min_height, max_height) = match &self.shape {
            HeightfieldShape::Flat { height } => (*height, *height),
            HeightfieldShape::Surface {
                min_height,
                max_height,
                ..
            } => (*min_height, *max_height),
        };

        (
            Vec3::new(min.x, min_height, min.y),
            Vec3::new(max.x, max_height, max.y),
        )
    }

    /// Appends the part of the terrain overlapping the rectangle ``min..max`` on the XZ-plane.
    pub(crate) fn append_to(&self, mesh: &mut RecastMesh, min: Vec2, max: Vec2) {
        let (cell_min, cell_max) = cell_bounds(self.cell_position, self.cell_size);

        match &self.shape {
            HeightfieldShape::Flat { height } => {
                let clipped_min = cell_min.max(min);
                let clipped_max = cell_max.min(max);
                if clipped_min.x >= clipped_max.x || clipped_min.y >= clipped_max.y {
                    return;
                }

                mesh.push_rectangle(clipped_min, clipped_max, *height, AreaType::Ground);
            }
            HeightfieldShape::Surface { heights, size, .. } => {
                let quads = size - 1;
                let step = self.cell_size as f32 / quads as f32;

                // Range of quads overlapping the rectangle.
                let first = ((min - cell_min) / step).floor().max(Vec2::ZERO);
                let last = ((max - cell_min) / step)
                    .ceil()
                    .min(Vec2::splat(quads as f32));
                if first.x >= last.x || first.y >= last.y {
                    return;
                }
                let (first_x, first_z) = (first.x as usize, first.y as usize);
                let (last_x, last_z) = (last.x as usize, last.y as usize);

                let row_length = last_x - first_x + 1;
                let first_vertex = mesh.vertices.len() as u32;
                for z in first_z..=last_z {
                    for x in first_x..=last_x {
                        mesh.vertices.push([
                            cell_min.x + x as f32 * step,
                            heights[z * size + x],
                            cell_min.y + z as f32 * step,
                        ]);
                    }
                }

                for z in 0..(last_z - first_z) {
                    for x in 0..(last_x - first_x) {
                        let a = first_vertex + (z * row_length + x) as u32;
                        let b = a + 1;
                        let c = a + row_length as u32;
                        let d = c + 1;

                        mesh.indices.extend([[a, c, d], [a, d, b]]);
                        mesh.areas.extend([AreaType::Ground, AreaType::Ground]);
                    }
                }
            }
        }
    }
}

/// Bounds of a cell on the XZ-plane. Computed in 64 bits, any ``i32`` cell coordinate & size is representable.
fn cell_bounds(cell_position: IVec2, cell_size: i32) -> (Vec2, Vec2) {
    let size = i64::from(cell_size);
    let min_x = i64::from(cell_position.x) * size;
    let min_z = i64::from(cell_position.y) * size;

    (
        Vec2::new(min_x as f32, min_z as f32),
        Vec2::new((min_x + size) as f32, (min_z + size) as f32),
    )
}
