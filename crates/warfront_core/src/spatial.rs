//! Uniform-grid spatial index over live units.
//!
//! The index is a derived snapshot: it is rebuilt from scratch once per tick
//! before any query and is read-only for the rest of the tick. It is never
//! the source of truth for a unit's position.

use std::collections::HashMap;

use crate::components::{EntityId, TeamId};
use crate::math::{Fixed, Rect, Vec2Fixed};

/// Position snapshot of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialEntry {
    /// Unit id.
    pub id: EntityId,
    /// Unit team.
    pub team: TeamId,
    /// Position when the index was built.
    pub position: Vec2Fixed,
}

/// Bucketed unit positions.
#[derive(Debug, Clone, Default)]
pub struct SpatialIndex {
    bucket_size: Fixed,
    /// Entries sorted by id.
    entries: Vec<SpatialEntry>,
    /// Bucket coordinate to indices into `entries`, each list in id order.
    buckets: HashMap<(i32, i32), Vec<usize>>,
}

impl SpatialIndex {
    /// Create an empty index with square buckets of `bucket_size`.
    #[must_use]
    pub fn new(bucket_size: Fixed) -> Self {
        Self {
            bucket_size,
            entries: Vec::new(),
            buckets: HashMap::new(),
        }
    }

    /// Replace the snapshot with `entries`.
    pub fn rebuild(&mut self, entries: impl IntoIterator<Item = SpatialEntry>) {
        self.entries.clear();
        self.entries.extend(entries);
        self.entries.sort_unstable_by_key(|e| e.id);
        self.buckets.clear();

        for (i, entry) in self.entries.iter().enumerate() {
            let key = self.bucket_of(entry.position);
            self.buckets.entry(key).or_default().push(i);
        }
    }

    /// Number of indexed units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the index holds no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot position of a unit.
    #[must_use]
    pub fn position(&self, id: EntityId) -> Option<Vec2Fixed> {
        self.entries
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|i| self.entries[i].position)
    }

    fn bucket_of(&self, point: Vec2Fixed) -> (i32, i32) {
        if self.bucket_size <= Fixed::ZERO {
            return (0, 0);
        }
        (
            (point.x / self.bucket_size)
                .floor()
                .saturating_to_num::<i32>(),
            (point.y / self.bucket_size)
                .floor()
                .saturating_to_num::<i32>(),
        )
    }

    /// Entries whose bucket overlaps `rect`, visiting every entry at most once.
    fn candidates(&self, rect: Rect) -> Vec<&SpatialEntry> {
        let (min_x, min_y) = self.bucket_of(rect.min);
        let (max_x, max_y) = self.bucket_of(rect.max);
        let span = (i64::from(max_x) - i64::from(min_x) + 1)
            .saturating_mul(i64::from(max_y) - i64::from(min_y) + 1);

        // A huge rectangle would visit mostly empty buckets.
        if span > self.buckets.len() as i64 {
            return self.entries.iter().collect();
        }

        let mut found = Vec::new();
        for bx in min_x..=max_x {
            for by in min_y..=max_y {
                if let Some(bucket) = self.buckets.get(&(bx, by)) {
                    found.extend(bucket.iter().map(|&i| &self.entries[i]));
                }
            }
        }
        found
    }

    /// Nearest unit not on `team` within `max_radius` of `point`.
    ///
    /// Equidistant candidates resolve to the lowest entity id.
    #[must_use]
    pub fn nearest_enemy(
        &self,
        point: Vec2Fixed,
        team: TeamId,
        max_radius: Fixed,
    ) -> Option<EntityId> {
        if max_radius < Fixed::ZERO {
            return None;
        }
        let radius_sq = max_radius.saturating_mul(max_radius);
        let area = Rect::centered(point, Vec2Fixed::new(max_radius, max_radius));

        self.candidates(area)
            .into_iter()
            .filter(|e| e.team != team)
            .map(|e| (e.position.distance_squared(point), e.id))
            .filter(|(dist_sq, _)| *dist_sq <= radius_sq)
            .min()
            .map(|(_, id)| id)
    }

    /// All units inside `rect` (edges included), sorted by id.
    #[must_use]
    pub fn query_rect(&self, rect: Rect) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .candidates(rect)
            .into_iter()
            .filter(|e| rect.contains(e.position))
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(x: i32, y: i32) -> Vec2Fixed {
        Vec2Fixed::new(Fixed::from_num(x), Fixed::from_num(y))
    }

    fn entry(id: EntityId, team: u8, x: i32, y: i32) -> SpatialEntry {
        SpatialEntry {
            id,
            team: TeamId(team),
            position: pos(x, y),
        }
    }

    fn index(entries: Vec<SpatialEntry>) -> SpatialIndex {
        let mut index = SpatialIndex::new(Fixed::from_num(4));
        index.rebuild(entries);
        index
    }

    #[test]
    fn test_nearest_enemy_ignores_own_team() {
        let index = index(vec![entry(1, 0, 1, 0), entry(2, 1, 5, 0)]);
        assert_eq!(
            index.nearest_enemy(pos(0, 0), TeamId(0), Fixed::from_num(10)),
            Some(2)
        );
    }

    #[test]
    fn test_nearest_enemy_respects_radius() {
        let index = index(vec![entry(2, 1, 5, 0)]);
        assert_eq!(
            index.nearest_enemy(pos(0, 0), TeamId(0), Fixed::from_num(4)),
            None
        );
        assert_eq!(
            index.nearest_enemy(pos(0, 0), TeamId(0), Fixed::from_num(5)),
            Some(2)
        );
    }

    #[test]
    fn test_equidistant_tie_breaks_by_lowest_id() {
        // Inserted out of order, on opposite sides of the query point and
        // in different buckets.
        let index = index(vec![entry(9, 1, -3, 0), entry(4, 1, 3, 0), entry(6, 1, 0, 3)]);
        assert_eq!(
            index.nearest_enemy(pos(0, 0), TeamId(0), Fixed::from_num(10)),
            Some(4)
        );
    }

    #[test]
    fn test_empty_index_returns_no_match() {
        let index = SpatialIndex::new(Fixed::from_num(4));
        assert!(index.is_empty());
        assert_eq!(
            index.nearest_enemy(pos(0, 0), TeamId(0), Fixed::from_num(100)),
            None
        );
        assert!(index
            .query_rect(Rect::from_corners(pos(-5, -5), pos(5, 5)))
            .is_empty());
    }

    #[test]
    fn test_query_rect_sorted_and_inclusive() {
        let index = index(vec![
            entry(7, 0, 10, 10),
            entry(3, 1, 0, 0),
            entry(5, 0, 2, 2),
            entry(1, 1, 20, 20),
        ]);
        let ids = index.query_rect(Rect::from_corners(pos(0, 0), pos(10, 10)));
        assert_eq!(ids, vec![3, 5, 7]);
    }

    #[test]
    fn test_query_rect_huge_extent_falls_back_to_scan() {
        let index = index(vec![entry(2, 0, -1000, 5), entry(1, 0, 1000, 5)]);
        let ids = index.query_rect(Rect::from_corners(pos(-5000, -5000), pos(5000, 5000)));
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_rebuild_replaces_snapshot() {
        let mut index = index(vec![entry(1, 0, 0, 0)]);
        assert_eq!(index.position(1), Some(pos(0, 0)));
        index.rebuild(vec![entry(2, 0, 8, 8)]);
        assert_eq!(index.position(1), None);
        assert_eq!(index.position(2), Some(pos(8, 8)));
        assert_eq!(index.len(), 1);
    }
}
