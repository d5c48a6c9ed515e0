//! Production queues for completed structures.
//!
//! Each queue advances at most one entry per tick: the front entry is the
//! only one with `active == true`. Time is counted in whole milliseconds so
//! a duration is reached exactly after an integer number of ticks.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{Catalog, UnitIndex};
use crate::components::Structure;
use crate::economy::{EconomyLedger, LedgerError};
use crate::math::{Fixed, Rect, Vec2Fixed};

/// One unit waiting to be produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionQueueEntry {
    /// Unit being produced.
    pub unit: UnitIndex,
    /// Accumulated production time in milliseconds.
    pub progress_ms: u32,
    /// Production time needed in milliseconds.
    pub duration_ms: u32,
    /// Whether this entry is the one currently advancing.
    pub active: bool,
}

impl ProductionQueueEntry {
    /// Create an inactive entry with no progress.
    #[must_use]
    pub const fn new(unit: UnitIndex, duration_ms: u32) -> Self {
        Self {
            unit,
            progress_ms: 0,
            duration_ms,
            active: false,
        }
    }

    /// Check if enough time has accumulated.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.progress_ms >= self.duration_ms
    }
}

/// Errors that can occur when queueing production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ProductionError {
    /// The production queue is full.
    #[error("production queue is full")]
    QueueFull,
    /// Cannot afford the unit cost.
    #[error("insufficient resources")]
    InsufficientResources,
    /// The structure cannot produce this unit.
    #[error("structure cannot produce this unit")]
    CannotProduceUnit,
    /// The structure is still under construction.
    #[error("structure is not yet complete")]
    StructureNotComplete,
    /// The structure belongs to another team.
    #[error("structure is owned by another team")]
    NotOwner,
    /// The entity is not a producing structure.
    #[error("entity is not a production structure")]
    UnknownStructure,
}

/// FIFO queue of units for one structure.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProductionQueue {
    entries: VecDeque<ProductionQueueEntry>,
    max_queue_size: usize,
}

impl ProductionQueue {
    /// Create an empty queue holding at most `max_queue_size` entries.
    #[must_use]
    pub fn with_max_size(max_queue_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_queue_size,
        }
    }

    /// Check if the queue is full.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_queue_size
    }

    /// Check if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Queued entries, front first.
    pub fn entries(&self) -> impl Iterator<Item = &ProductionQueueEntry> {
        self.entries.iter()
    }

    /// The entry currently advancing.
    #[must_use]
    pub fn active(&self) -> Option<&ProductionQueueEntry> {
        self.entries.iter().find(|e| e.active)
    }

    /// Number of entries flagged active. Never more than one.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.active).count()
    }

    /// Append an entry, activating it if nothing else is active.
    pub fn enqueue(&mut self, unit: UnitIndex, duration_ms: u32) -> Result<(), ProductionError> {
        if self.is_full() {
            return Err(ProductionError::QueueFull);
        }
        self.entries
            .push_back(ProductionQueueEntry::new(unit, duration_ms));
        self.activate_front();
        Ok(())
    }

    /// Remove the entry at `index`.
    pub fn cancel(&mut self, index: usize) -> Option<ProductionQueueEntry> {
        let entry = self.entries.remove(index)?;
        self.activate_front();
        Some(entry)
    }

    /// Add `delta_ms` to the active entry, capped at its duration.
    ///
    /// Returns `true` if the active entry is ready to complete.
    pub fn advance(&mut self, delta_ms: u32) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.active) else {
            return false;
        };
        entry.progress_ms = entry
            .progress_ms
            .saturating_add(delta_ms)
            .min(entry.duration_ms);
        entry.is_ready()
    }

    /// Pop the ready active entry and activate the next one.
    pub fn complete(&mut self) -> Option<ProductionQueueEntry> {
        if !self
            .entries
            .front()
            .is_some_and(|e| e.active && e.is_ready())
        {
            return None;
        }
        let done = self.entries.pop_front();
        self.activate_front();
        done
    }

    fn activate_front(&mut self) {
        if self.entries.iter().any(|e| e.active) {
            return;
        }
        if let Some(front) = self.entries.front_mut() {
            front.active = true;
        }
    }
}

/// Validate and queue a unit, debiting its cost from the ledger.
///
/// Population is only charged when the unit completes.
pub fn queue_production(
    queue: &mut ProductionQueue,
    structure: &Structure,
    unit: UnitIndex,
    catalog: &Catalog,
    ledger: &mut EconomyLedger,
) -> Result<(), ProductionError> {
    if !structure.is_complete() {
        return Err(ProductionError::StructureNotComplete);
    }
    let structure_def = catalog
        .structure(structure.kind)
        .ok_or(ProductionError::UnknownStructure)?;
    if !structure_def.can_produce(unit) {
        return Err(ProductionError::CannotProduceUnit);
    }
    let unit_def = catalog
        .unit(unit)
        .ok_or(ProductionError::CannotProduceUnit)?;
    if queue.is_full() {
        return Err(ProductionError::QueueFull);
    }

    ledger
        .try_debit(unit_def.cost, 0)
        .map_err(|_| ProductionError::InsufficientResources)?;
    queue.enqueue(unit, unit_def.build_time_ms)
}

/// Cancel the entry at `index`, refunding the unspent share of its cost.
///
/// Returns the removed entry and the refund.
pub fn cancel_production(
    queue: &mut ProductionQueue,
    index: usize,
    catalog: &Catalog,
    ledger: &mut EconomyLedger,
) -> Option<(ProductionQueueEntry, u32)> {
    let entry = queue.cancel(index)?;
    let cost = catalog.unit(entry.unit).map_or(0, |def| def.cost);
    let remaining = entry.duration_ms.saturating_sub(entry.progress_ms);
    let refund = if entry.duration_ms == 0 {
        cost
    } else {
        (u64::from(cost) * u64::from(remaining) / u64::from(entry.duration_ms)) as u32
    };
    ledger.credit(refund, 0);
    Some((entry, refund))
}

/// What happened to a queue during one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductionStep {
    /// Nothing ready.
    Idle,
    /// A unit finished; the caller spawns it.
    Completed(UnitIndex),
    /// A unit is ready but the population cap blocks it.
    Withheld {
        /// Unit waiting for headroom.
        unit: UnitIndex,
        /// Whether this is the first tick it was ready.
        newly_ready: bool,
        /// Ledger refusal.
        reason: LedgerError,
    },
}

/// Advance one queue by `delta_ms`, charging population on completion.
///
/// When the population cap blocks completion the entry keeps its progress
/// and stays active, so it completes on the first tick with headroom.
pub fn advance_production(
    queue: &mut ProductionQueue,
    delta_ms: u32,
    catalog: &Catalog,
    ledger: &mut EconomyLedger,
) -> ProductionStep {
    let was_ready = queue.active().is_some_and(ProductionQueueEntry::is_ready);
    if !queue.advance(delta_ms) {
        return ProductionStep::Idle;
    }
    let Some(unit) = queue.active().map(|e| e.unit) else {
        return ProductionStep::Idle;
    };
    let population = catalog.unit(unit).map_or(0, |def| def.population);

    match ledger.try_debit(0, population as i32) {
        Ok(()) => {
            queue.complete();
            ProductionStep::Completed(unit)
        }
        Err(reason) => ProductionStep::Withheld {
            unit,
            newly_ready: !was_ready,
            reason,
        },
    }
}

/// Where a unit produced by `structure` appears.
///
/// The rally point if set, otherwise just below the footprint at its
/// horizontal center.
#[must_use]
pub fn spawn_point(structure: &Structure, footprint_rect: Rect, cell_size: Fixed) -> Vec2Fixed {
    structure.rally_point.unwrap_or_else(|| {
        let center = footprint_rect.center();
        Vec2Fixed::new(center.x, footprint_rect.min.y - cell_size / Fixed::from_num(2))
    })
}
