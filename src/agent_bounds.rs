use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use bevy::prelude::{warn, Vec2};
use serde::{Deserialize, Serialize};

use crate::{NavigatorSettings, TilePosition};

/// Size of a navigation agent. Every distinct size gets its own nav-mesh.
///
/// Compared, ordered and hashed by the bit patterns of its fields so it can be used as a map key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentBounds {
    pub radius: f32,
    pub half_height: f32,
}

impl AgentBounds {
    pub const fn new(radius: f32, half_height: f32) -> Self {
        Self {
            radius,
            half_height,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.radius.is_finite()
            && self.half_height.is_finite()
            && self.radius > 0.0
            && self.half_height > 0.0
    }
}

impl PartialEq for AgentBounds {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AgentBounds {}

impl PartialOrd for AgentBounds {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AgentBounds {
    fn cmp(&self, other: &Self) -> Ordering {
        self.radius
            .total_cmp(&other.radius)
            .then_with(|| self.half_height.total_cmp(&other.half_height))
    }
}

impl Hash for AgentBounds {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.radius.to_bits().hash(state);
        self.half_height.to_bits().hash(state);
    }
}

/// Everything tile generation needs to know about the settings & the agent, in voxel units.
///
/// Serialized as part of the tile input hash, so anything that changes tile output must live in here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TileBuildParameters {
    pub cell_size: f32,
    pub cell_height: f32,
    pub tile_size: u16,
    pub border_size: u16,
    pub world_bottom_bound: f32,
    pub max_traversable_slope_radians: f32,
    /// Minimum open height for an area to be considered walkable in cell_height(s).
    pub walkable_height: u16,
    /// Distance in cells the nav-mesh is pulled back from walls.
    pub walkable_radius: u16,
    /// Maximum height difference between neighbouring cells that is still traversable in cell_height(s).
    pub walkable_climb: u16,
    pub min_region_area: u32,
}

impl TileBuildParameters {
    /// Agents that don't [fit](NavigatorSettings::fits_agent) are eroded by the border size only, which lets them
    /// through gaps narrower than they are. [`crate::NavMeshManager::add_agent`] refuses those.
    pub fn new(agent_bounds: &AgentBounds, settings: &NavigatorSettings) -> Self {
        let mut walkable_radius = (agent_bounds.radius / settings.cell_size).ceil() as u16;
        if walkable_radius > settings.border_size {
            warn!(
                "Agent radius {} needs {} border cells but tiles only have {}, the nav-mesh will be too permissive.",
                agent_bounds.radius, walkable_radius, settings.border_size
            );
            walkable_radius = settings.border_size;
        }

        Self {
            cell_size: settings.cell_size,
            cell_height: settings.cell_height,
            tile_size: settings.tile_size,
            border_size: settings.border_size,
            world_bottom_bound: settings.world_bottom_bound,
            max_traversable_slope_radians: settings.max_traversable_slope_radians,
            walkable_height: (agent_bounds.half_height * 2.0 / settings.cell_height).ceil() as u16,
            walkable_radius,
            walkable_climb: (settings.max_climb / settings.cell_height).floor() as u16,
            min_region_area: settings.min_region_area,
        }
    }

    #[inline]
    pub fn get_tile_side_with_border(&self) -> usize {
        usize::from(self.tile_size) + usize::from(self.border_size) * 2
    }

    /// Returns the origin of a tile on the XZ-plane including the border area.
    #[inline]
    pub fn get_tile_origin_with_border(&self, tile: TilePosition) -> Vec2 {
        tile.as_vec2() * self.cell_size * f32::from(self.tile_size)
            - f32::from(self.border_size) * self.cell_size
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashSet};

    use super::*;

    #[test]
    fn ordering_and_hashing_agree() {
        let small = AgentBounds::new(0.3, 0.9);
        let tall = AgentBounds::new(0.3, 1.2);
        let large = AgentBounds::new(1.0, 0.9);

        let ordered: Vec<_> = [large, tall, small, small]
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        assert_eq!(ordered, vec![small, tall, large]);

        let hashed: HashSet<_> = [small, tall, large, AgentBounds::new(0.3, 0.9)]
            .into_iter()
            .collect();
        assert_eq!(hashed.len(), 3);
    }

    #[test]
    fn parameters_from_agent() {
        let settings = NavigatorSettings::default()
            .with_cell_size(0.25, 0.1)
            .with_border_size(4)
            .with_max_climb(0.55);

        let parameters = TileBuildParameters::new(&AgentBounds::new(0.3, 0.9), &settings);
        assert_eq!(parameters.walkable_radius, 2);
        assert_eq!(parameters.walkable_height, 18);
        assert_eq!(parameters.walkable_climb, 5);

        let too_wide = AgentBounds::new(5.0, 0.9);
        assert!(!settings.fits_agent(&too_wide));
        assert_eq!(TileBuildParameters::new(&too_wide, &settings).walkable_radius, 4);
    }
}
