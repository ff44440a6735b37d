use bevy::prelude::{Transform, Vec3};
use parry3d::{
    math::Real,
    na::Point3,
    shape::{Ball, Capsule, Cone, Cuboid, Cylinder},
};

/// Collision shape of an object, in the object's local space.
#[derive(Debug, Clone)]
pub enum CollisionShape {
    Cuboid(Cuboid),
    Ball(Ball),
    Capsule(Capsule),
    Cylinder(Cylinder),
    Cone(Cone),
    TriMesh {
        vertices: Box<[Vec3]>,
        indices: Box<[[u32; 3]]>,
    },
    /// Child shapes with their transform relative to the parent.
    Compound(Vec<(Transform, CollisionShape)>),
}

// Structural equality, equivalent to `#[derive(PartialEq)]`; written by hand
// because parry3d's `Capsule` doesn't implement `PartialEq`.
impl PartialEq for CollisionShape {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Cuboid(a), Self::Cuboid(b)) => a == b,
            (Self::Ball(a), Self::Ball(b)) => a == b,
            (Self::Capsule(a), Self::Capsule(b)) => a.segment == b.segment && a.radius == b.radius,
            (Self::Cylinder(a), Self::Cylinder(b)) => a == b,
            (Self::Cone(a), Self::Cone(b)) => a == b,
            (
                Self::TriMesh {
                    vertices: av,
                    indices: ai,
                },
                Self::TriMesh {
                    vertices: bv,
                    indices: bi,
                },
            ) => av == bv && ai == bi,
            (Self::Compound(a), Self::Compound(b)) => a == b,
            _ => false,
        }
    }
}

impl CollisionShape {
    pub fn cuboid(half_extents: Vec3) -> Self {
        Self::Cuboid(Cuboid::new(half_extents.into()))
    }

    pub fn ball(radius: f32) -> Self {
        Self::Ball(Ball::new(radius))
    }

    /// Capsule aligned with the Y-axis.
    pub fn capsule(half_height: f32, radius: f32) -> Self {
        Self::Capsule(Capsule::new_y(half_height, radius))
    }

    pub fn cylinder(half_height: f32, radius: f32) -> Self {
        Self::Cylinder(Cylinder::new(half_height, radius))
    }

    pub fn cone(half_height: f32, radius: f32) -> Self {
        Self::Cone(Cone::new(half_height, radius))
    }

    pub fn trimesh(vertices: impl Into<Box<[Vec3]>>, indices: impl Into<Box<[[u32; 3]]>>) -> Self {
        Self::TriMesh {
            vertices: vertices.into(),
            indices: indices.into(),
        }
    }
}

/// World-space triangles of a shape & their bounds.
#[derive(Debug, Clone, Default)]
pub struct ShapeTriangles {
    pub vertices: Vec<Vec3>,
    pub indices: Vec<[u32; 3]>,
    pub min: Vec3,
    pub max: Vec3,
}

const SUBDIVISIONS: u32 = 5;

/// Converts a shape into world-space triangles.
///
/// Returns ``None`` if the shape has no triangles or any vertex ends up non-finite.
pub fn convert_shape(shape: &CollisionShape, transform: &Transform) -> Option<ShapeTriangles> {
    let mut triangles = ShapeTriangles::default();
    append_shape(shape, transform, &mut triangles);

    if triangles.indices.is_empty() {
        return None;
    }

    let mut min = Vec3::splat(f32::INFINITY);
    let mut max = Vec3::splat(f32::NEG_INFINITY);
    for vertex in &triangles.vertices {
        if !vertex.is_finite() {
            return None;
        }
        min = min.min(*vertex);
        max = max.max(*vertex);
    }
    triangles.min = min;
    triangles.max = max;

    Some(triangles)
}

fn append_shape(shape: &CollisionShape, transform: &Transform, out: &mut ShapeTriangles) {
    let (vertices, indices) = match shape {
        CollisionShape::Cuboid(cuboid) => cuboid.to_trimesh(),
        CollisionShape::Ball(ball) => ball.to_trimesh(SUBDIVISIONS, SUBDIVISIONS),
        CollisionShape::Capsule(capsule) => capsule.to_trimesh(SUBDIVISIONS, SUBDIVISIONS),
        CollisionShape::Cylinder(cylinder) => cylinder.to_trimesh(SUBDIVISIONS),
        CollisionShape::Cone(cone) => cone.to_trimesh(SUBDIVISIONS),
        CollisionShape::TriMesh { vertices, indices } => {
            append_triangles(vertices.iter().copied(), indices, transform, out);
            return;
        }
        CollisionShape::Compound(children) => {
            for (local, child) in children {
                append_shape(child, &transform.mul_transform(*local), out);
            }
            return;
        }
    };

    append_triangles(
        vertices.iter().map(point_to_vec3),
        &indices,
        transform,
        out,
    );
}

fn append_triangles(
    vertices: impl Iterator<Item = Vec3>,
    indices: &[[u32; 3]],
    transform: &Transform,
    out: &mut ShapeTriangles,
) {
    let first_vertex = out.vertices.len();
    out.vertices
        .extend(vertices.map(|vertex| transform.transform_point(vertex)));
    let vertex_count = (out.vertices.len() - first_vertex) as u32;

    // Skip triangles pointing outside of their own mesh.
    out.indices.extend(
        indices
            .iter()
            .filter(|triangle| triangle.iter().all(|index| *index < vertex_count))
            .map(|triangle| triangle.map(|index| index + first_vertex as u32)),
    );
}

#[inline]
fn point_to_vec3(point: &Point3<Real>) -> Vec3 {
    Vec3::new(point.x, point.y, point.z)
}
