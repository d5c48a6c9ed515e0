//! Structure placement validation and construction progress.
//!
//! Placement is all-or-nothing: a request either passes every check and is
//! applied by the caller, or it is rejected with no state touched.
//!
//! All calculations use integer cells and fixed-point world units.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{Catalog, StructureIndex};
use crate::components::{EntityId, Footprint, GridCoord, Structure};
use crate::economy::EconomyLedger;
use crate::math::{fixed_serde, Fixed, Rect, Vec2Fixed};

// ============================================================================
// Occupancy Grid
// ============================================================================

/// Grid tracking which structure covers each cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyGrid {
    /// Grid width in cells.
    width: u32,
    /// Grid height in cells.
    height: u32,
    /// Owning structure per cell, row-major.
    cells: Vec<Option<EntityId>>,
    /// Size of each cell in world units.
    #[serde(with = "fixed_serde")]
    cell_size: Fixed,
}

impl OccupancyGrid {
    /// Create an empty grid.
    #[must_use]
    pub fn new(width: u32, height: u32, cell_size: Fixed) -> Self {
        let cell_count = (width as usize) * (height as usize);
        Self {
            width,
            height,
            cells: vec![None; cell_count],
            cell_size,
        }
    }

    /// Grid width in cells.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Grid height in cells.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Cell size in world units.
    #[must_use]
    pub const fn cell_size(&self) -> Fixed {
        self.cell_size
    }

    #[inline]
    fn index(&self, coord: GridCoord) -> Option<usize> {
        self.in_bounds(coord)
            .then(|| (coord.y as usize) * (self.width as usize) + (coord.x as usize))
    }

    /// Check if a cell lies inside the grid.
    #[must_use]
    pub fn in_bounds(&self, coord: GridCoord) -> bool {
        coord.x >= 0
            && coord.y >= 0
            && (coord.x as u32) < self.width
            && (coord.y as u32) < self.height
    }

    /// Structure covering a cell, if any.
    #[must_use]
    pub fn occupant(&self, coord: GridCoord) -> Option<EntityId> {
        self.index(coord).and_then(|i| self.cells[i])
    }

    /// Check if a cell is inside the grid and uncovered.
    #[must_use]
    pub fn is_free(&self, coord: GridCoord) -> bool {
        self.index(coord).is_some_and(|i| self.cells[i].is_none())
    }

    /// Mark every cell of a footprint as covered by `entity`.
    ///
    /// Returns `false` and changes nothing if any cell is out of bounds or
    /// already covered.
    pub fn claim(&mut self, origin: GridCoord, footprint: Footprint, entity: EntityId) -> bool {
        if !footprint.cells(origin).all(|c| self.is_free(c)) {
            return false;
        }
        for cell in footprint.cells(origin) {
            if let Some(i) = self.index(cell) {
                self.cells[i] = Some(entity);
            }
        }
        true
    }

    /// Clear the cells of a footprint that are covered by `entity`.
    pub fn release(&mut self, origin: GridCoord, footprint: Footprint, entity: EntityId) {
        for cell in footprint.cells(origin) {
            if let Some(i) = self.index(cell) {
                if self.cells[i] == Some(entity) {
                    self.cells[i] = None;
                }
            }
        }
    }

    /// Number of covered cells.
    #[must_use]
    pub fn occupied_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    /// Cell containing a world position. May lie outside the grid.
    #[must_use]
    pub fn world_to_grid(&self, pos: Vec2Fixed) -> GridCoord {
        GridCoord::new(
            pos.x.saturating_div(self.cell_size).floor().saturating_to_num::<i32>(),
            pos.y.saturating_div(self.cell_size).floor().saturating_to_num::<i32>(),
        )
    }

    /// World-space rectangle covered by the whole grid.
    #[must_use]
    pub fn world_rect(&self) -> Rect {
        Rect::from_corners(
            Vec2Fixed::ZERO,
            Vec2Fixed::new(
                Fixed::from_num(self.width).saturating_mul(self.cell_size),
                Fixed::from_num(self.height).saturating_mul(self.cell_size),
            ),
        )
    }

    /// World-space rectangle covered by a footprint.
    #[must_use]
    pub fn footprint_rect(&self, origin: GridCoord, footprint: Footprint) -> Rect {
        let min = Vec2Fixed::new(
            Fixed::from_num(origin.x) * self.cell_size,
            Fixed::from_num(origin.y) * self.cell_size,
        );
        let max = Vec2Fixed::new(
            Fixed::from_num(origin.x + footprint.width as i32) * self.cell_size,
            Fixed::from_num(origin.y + footprint.height as i32) * self.cell_size,
        );
        Rect::from_corners(min, max)
    }
}

// ============================================================================
// Placement Validation
// ============================================================================

/// Structure placement requested by a `Build` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Catalog entry to build.
    pub structure: StructureIndex,
    /// Lower-left cell of the footprint.
    pub grid_position: GridCoord,
}

/// Reason a build request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum BuildRejection {
    /// The connection cannot pay for the structure.
    #[error("insufficient resources")]
    InsufficientResources,
    /// A covered cell holds a structure or a unit.
    #[error("cell occupied")]
    CellOccupied,
    /// The builder is too far from the site.
    #[error("builder out of range")]
    OutOfRange,
    /// Part of the footprint lies outside the map.
    #[error("site out of bounds")]
    OutOfBounds,
    /// The catalog has no such structure.
    #[error("unknown structure")]
    UnknownStructure,
}

/// A build waiting for its builder to get in range.
///
/// Kept per connection on the server and never replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBuildRequest {
    /// Catalog entry to build.
    pub structure: StructureIndex,
    /// Lower-left cell of the footprint.
    pub grid_position: GridCoord,
    /// World-space center of the site.
    pub site_center: Vec2Fixed,
    /// Distance from the site's nearest point the builder must reach.
    #[serde(with = "fixed_serde")]
    pub required_range: Fixed,
    /// Cells covered.
    pub footprint: Footprint,
    /// Unit walking to the site.
    pub builder: EntityId,
}

impl PendingBuildRequest {
    /// The request this pending build re-validates.
    #[must_use]
    pub const fn request(&self) -> BuildRequest {
        BuildRequest {
            structure: self.structure,
            grid_position: self.grid_position,
        }
    }
}

/// A resolved site: catalog data plus its world-space extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildSite {
    /// Catalog entry to build.
    pub structure: StructureIndex,
    /// Lower-left cell.
    pub origin: GridCoord,
    /// Cells covered.
    pub footprint: Footprint,
    /// World-space extent of the footprint.
    pub rect: Rect,
    /// Resource cost.
    pub cost: u32,
    /// Builder range requirement.
    pub required_range: Fixed,
}

impl BuildSite {
    /// Look up the footprint and check it fits on the map.
    pub fn resolve(
        grid: &OccupancyGrid,
        catalog: &Catalog,
        request: BuildRequest,
    ) -> Result<Self, BuildRejection> {
        let def = catalog
            .structure(request.structure)
            .ok_or(BuildRejection::UnknownStructure)?;
        let origin = request.grid_position;
        if !def.footprint.cells(origin).all(|c| grid.in_bounds(c)) {
            return Err(BuildRejection::OutOfBounds);
        }
        Ok(Self {
            structure: request.structure,
            origin,
            footprint: def.footprint,
            rect: grid.footprint_rect(origin, def.footprint),
            cost: def.cost,
            required_range: def.required_range,
        })
    }

    /// Check if `point` is within range of the nearest point of the site.
    #[must_use]
    pub fn in_range(&self, point: Vec2Fixed) -> bool {
        let nearest = self.rect.nearest_point(point);
        nearest.distance_squared(point) <= self.required_range * self.required_range
    }

    /// Pending request for `builder` to walk here first.
    #[must_use]
    pub fn pending(&self, builder: EntityId) -> PendingBuildRequest {
        PendingBuildRequest {
            structure: self.structure,
            grid_position: self.origin,
            site_center: self.rect.center(),
            required_range: self.required_range,
            footprint: self.footprint,
            builder,
        }
    }
}

/// Unit that would carry out a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Builder {
    /// Builder entity.
    pub entity: EntityId,
    /// Its current position.
    pub position: Vec2Fixed,
}

/// Validate a build request without mutating anything.
///
/// Checks run in order: catalog and bounds, covered cells, resources,
/// builder range. `units` lists live unit positions that exclude placement
/// on their cell; the builder itself never blocks its own site. Without a
/// builder the range check is skipped.
pub fn validate_build(
    grid: &OccupancyGrid,
    catalog: &Catalog,
    request: BuildRequest,
    ledger: &EconomyLedger,
    units: &[(EntityId, Vec2Fixed)],
    builder: Option<Builder>,
) -> Result<BuildSite, BuildRejection> {
    let site = BuildSite::resolve(grid, catalog, request)?;

    if site.footprint.cells(site.origin).any(|c| !grid.is_free(c)) {
        return Err(BuildRejection::CellOccupied);
    }
    let builder_id = builder.map(|b| b.entity);
    let blocked_by_unit = units.iter().any(|(id, pos)| {
        Some(*id) != builder_id && {
            let cell = grid.world_to_grid(*pos);
            site.footprint.cells(site.origin).any(|c| c == cell)
        }
    });
    if blocked_by_unit {
        return Err(BuildRejection::CellOccupied);
    }

    if !ledger.can_afford(site.cost, 0) {
        return Err(BuildRejection::InsufficientResources);
    }

    if let Some(builder) = builder {
        if !site.in_range(builder.position) {
            return Err(BuildRejection::OutOfRange);
        }
    }

    Ok(site)
}

// ============================================================================
// Construction Progress
// ============================================================================

/// Advance every unfinished structure by `rate` points.
///
/// Returns the structures that completed this tick, in input order.
pub fn construction_system<'a>(
    structures: impl Iterator<Item = (EntityId, &'a mut Structure)>,
    rate: u32,
) -> Vec<EntityId> {
    structures
        .filter_map(|(id, structure)| structure.tick_construction(rate).then_some(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::test_catalog;

    const BARRACKS: StructureIndex = StructureIndex(0);

    fn grid() -> OccupancyGrid {
        OccupancyGrid::new(16, 16, Fixed::from_num(1))
    }

    fn request(x: i32, y: i32) -> BuildRequest {
        BuildRequest {
            structure: BARRACKS,
            grid_position: GridCoord::new(x, y),
        }
    }

    fn pos(x: f32, y: f32) -> Vec2Fixed {
        Vec2Fixed::new(Fixed::from_num(x), Fixed::from_num(y))
    }

    #[test]
    fn test_claim_and_release() {
        let mut grid = grid();
        assert!(grid.claim(GridCoord::new(4, 4), Footprint::new(2, 2), 7));
        assert_eq!(grid.occupant(GridCoord::new(5, 5)), Some(7));
        assert_eq!(grid.occupied_count(), 4);

        // Overlap is refused without partial writes
        assert!(!grid.claim(GridCoord::new(5, 5), Footprint::new(2, 2), 8));
        assert_eq!(grid.occupant(GridCoord::new(6, 6)), None);

        grid.release(GridCoord::new(4, 4), Footprint::new(2, 2), 7);
        assert_eq!(grid.occupied_count(), 0);
    }

    #[test]
    fn test_world_rect_and_far_positions() {
        let grid = OccupancyGrid::new(16, 8, Fixed::from_num(2));
        let world = grid.world_rect();
        assert_eq!(world.max, pos(32.0, 16.0));
        assert_eq!(
            grid.world_to_grid(Vec2Fixed::new(Fixed::MAX, Fixed::MIN)),
            GridCoord::new(i32::MAX / 2, i32::MIN / 2)
        );
    }

    #[test]
    fn test_insufficient_resources_rejected() {
        let grid = grid();
        let ledger = EconomyLedger::new(40, 10);
        let result = validate_build(&grid, &test_catalog(), request(4, 4), &ledger, &[], None);
        assert_eq!(result, Err(BuildRejection::InsufficientResources));
    }

    #[test]
    fn test_cell_occupied_by_structure() {
        let mut grid = grid();
        grid.claim(GridCoord::new(5, 5), Footprint::new(1, 1), 3);
        let ledger = EconomyLedger::new(100, 10);
        let result = validate_build(&grid, &test_catalog(), request(4, 4), &ledger, &[], None);
        assert_eq!(result, Err(BuildRejection::CellOccupied));
    }

    #[test]
    fn test_cell_occupied_by_unit_except_builder() {
        let grid = grid();
        let ledger = EconomyLedger::new(100, 10);
        let units = [(1, pos(4.5, 4.5))];

        let blocked = validate_build(&grid, &test_catalog(), request(4, 4), &ledger, &units, None);
        assert_eq!(blocked, Err(BuildRejection::CellOccupied));

        let builder = Builder {
            entity: 1,
            position: pos(4.5, 4.5),
        };
        let allowed = validate_build(
            &grid,
            &test_catalog(),
            request(4, 4),
            &ledger,
            &units,
            Some(builder),
        );
        assert!(allowed.is_ok());
    }

    #[test]
    fn test_out_of_bounds_and_unknown() {
        let grid = grid();
        let ledger = EconomyLedger::new(100, 10);
        let catalog = test_catalog();
        assert_eq!(
            validate_build(&grid, &catalog, request(15, 0), &ledger, &[], None),
            Err(BuildRejection::OutOfBounds)
        );
        assert_eq!(
            validate_build(&grid, &catalog, request(-1, 0), &ledger, &[], None),
            Err(BuildRejection::OutOfBounds)
        );
        assert_eq!(
            validate_build(&grid, &catalog, request(i32::MAX, i32::MIN), &ledger, &[], None),
            Err(BuildRejection::OutOfBounds)
        );
        let unknown = BuildRequest {
            structure: StructureIndex(42),
            grid_position: GridCoord::new(0, 0),
        };
        assert_eq!(
            validate_build(&grid, &catalog, unknown, &ledger, &[], None),
            Err(BuildRejection::UnknownStructure)
        );
    }

    #[test]
    fn test_range_uses_nearest_point_of_site() {
        let grid = grid();
        let ledger = EconomyLedger::new(100, 10);
        let catalog = test_catalog();

        // Site covers [4,6]x[4,6]; required range 2.
        let near = Builder {
            entity: 1,
            position: pos(8.0, 5.0),
        };
        assert!(validate_build(&grid, &catalog, request(4, 4), &ledger, &[], Some(near)).is_ok());

        let far = Builder {
            entity: 1,
            position: pos(8.5, 5.0),
        };
        assert_eq!(
            validate_build(&grid, &catalog, request(4, 4), &ledger, &[], Some(far)),
            Err(BuildRejection::OutOfRange)
        );
    }

    #[test]
    fn test_pending_request_carries_site() {
        let grid = grid();
        let site = BuildSite::resolve(&grid, &test_catalog(), request(4, 4)).unwrap();
        let pending = site.pending(9);
        assert_eq!(pending.site_center, pos(5.0, 5.0));
        assert_eq!(pending.footprint, Footprint::new(2, 2));
        assert_eq!(pending.builder, 9);
        assert_eq!(pending.request(), request(4, 4));
    }

    #[test]
    fn test_construction_system_reports_completion() {
        let mut structure = Structure {
            kind: BARRACKS,
            origin: GridCoord::new(0, 0),
            footprint: Footprint::new(2, 2),
            build_progress: 0,
            build_total: 2,
            range_radius: Fixed::from_num(2),
            rally_point: None,
        };
        assert!(construction_system(std::iter::once((1, &mut structure)), 1).is_empty());
        assert_eq!(
            construction_system(std::iter::once((1, &mut structure)), 1),
            vec![1]
        );
        assert!(construction_system(std::iter::once((1, &mut structure)), 1).is_empty());
    }
}
