//! Core simulation loop.
//!
//! The simulation runs at a fixed tick rate and owns every entity,
//! connection and derived structure. Each tick runs its systems in a
//! fixed order so identical inputs always produce identical state.
//!
//! # Determinism
//!
//! - No floating-point math (uses fixed-point via [`Fixed`])
//! - No randomness
//! - Consistent iteration order (sorted entity and connection ids)
//! - Parallel work only computes intents; results are applied in id order
//!
//! # Example
//!
//! ```
//! use warfront_core::prelude::*;
//!
//! let mut sim = Simulation::new(SimConfig::default(), Catalog::standard().unwrap());
//! let player = sim.add_connection(TeamId(0)).unwrap();
//!
//! let soldier = sim.catalog().unit_index("Soldier").unwrap();
//! let unit = sim.spawn_unit(TeamId(0), soldier, Vec2Fixed::ZERO).unwrap();
//!
//! let select = CommandMessage::new(player, 0, CommandKind::PrimaryClick).targeting(unit);
//! sim.submit_command(select).unwrap();
//!
//! let mut events = Vec::new();
//! sim.tick(&mut events);
//! assert_eq!(sim.get_tick(), 1);
//! assert!(sim.get_entity(unit).unwrap().selected);
//! ```

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, StructureIndex, UnitIndex};
use crate::combat::{resolve_damage, Casualty, DamageEvent};
use crate::command::{CommandChannel, CommandKind, CommandMessage, CommandRejection};
use crate::components::{
    CombatStats, Connection, ConnectionId, Entity, EntityId, GridCoord, Movement, Structure,
    TeamId, Velocity, ViewExtent,
};
use crate::config::SimConfig;
use crate::construction::{
    construction_system, validate_build, BuildRejection, BuildRequest, BuildSite, Builder,
    OccupancyGrid,
};
use crate::economy::EconomyLedger;
use crate::error::{GameError, Result};
use crate::events::{EventSink, SimEvent};
use crate::math::{Fixed, Rect, Vec2Fixed};
use crate::production::{
    advance_production, cancel_production, queue_production, spawn_point, ProductionError,
    ProductionQueue, ProductionStep,
};
use crate::spatial::{SpatialEntry, SpatialIndex};
use crate::targeting::{in_attack_range, targeting_system, MoveGoal, Pursuit, PursuitInput, PursuitState};

/// Half extent of a new connection's view until the client reports one.
pub const DEFAULT_VIEW_HALF_EXTENT: i32 = 32;

/// Storage for all entities in the simulation.
///
/// Uses a `HashMap` for O(1) entity lookup by ID, with deterministic
/// iteration via sorted keys when processing systems.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityStorage {
    /// Map of entity ID to entity data.
    entities: HashMap<EntityId, Entity>,
    /// Next entity ID to assign.
    next_id: EntityId,
}

impl EntityStorage {
    /// Create empty entity storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entities: HashMap::new(),
            next_id: 1,
        }
    }

    /// Insert a new entity and return its ID.
    pub fn insert(&mut self, mut entity: Entity) -> EntityId {
        let id = self.next_id;
        self.next_id += 1;
        entity.id = id;
        self.entities.insert(id, entity);
        id
    }

    /// Remove an entity by ID.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        self.entities.remove(&id)
    }

    /// Get an entity by ID.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// Get a mutable reference to an entity by ID.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    /// Check if an entity exists.
    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Get the number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if storage is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Get sorted entity IDs for deterministic iteration.
    #[must_use]
    pub fn sorted_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<_> = self.entities.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Iterate over all entities (not in deterministic order).
    pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &Entity)> {
        self.entities.iter()
    }

    /// Mutable references to every entity, sorted by id.
    fn sorted_mut(&mut self) -> Vec<&mut Entity> {
        let mut refs: Vec<&mut Entity> = self.entities.values_mut().collect();
        refs.sort_unstable_by_key(|e| e.id);
        refs
    }
}

/// The authoritative game simulation.
///
/// # System Execution Order
///
/// Each tick, systems run in this order:
/// 1. **Commands** - drain this tick's commands and apply intents
/// 2. **Spatial Index** - rebuild from live unit positions
/// 3. **Targeting** - acquire, pursue and lose targets (parallel)
/// 4. **Movement** - step units toward their movement target
/// 5. **Attacks** - in-range units buffer damage on their targets
/// 6. **Combat Resolver** - apply buffered damage, remove the dead
/// 7. **Construction** - pending builds, construction progress
/// 8. **Production** - advance queues and spawn finished units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Simulation {
    /// Current simulation tick.
    tick: u64,
    /// Tuning parameters.
    config: SimConfig,
    /// Unit and structure definitions.
    catalog: Catalog,
    /// All entities in the simulation.
    entities: EntityStorage,
    /// Connected players, keyed by id.
    connections: BTreeMap<ConnectionId, Connection>,
    /// Next connection id to assign.
    next_connection: ConnectionId,
    /// Buffered commands.
    commands: CommandChannel,
    /// Structure cell occupancy.
    occupancy: OccupancyGrid,
    /// Unit positions as of the start of the current tick.
    #[serde(skip)]
    index: SpatialIndex,
}

impl Simulation {
    /// Create an empty world.
    #[must_use]
    pub fn new(config: SimConfig, catalog: Catalog) -> Self {
        Self {
            tick: 0,
            commands: CommandChannel::new(config.command_max_lead),
            occupancy: OccupancyGrid::new(config.map_width, config.map_height, config.cell_size),
            index: SpatialIndex::new(config.spatial_bucket_size),
            config,
            catalog,
            entities: EntityStorage::new(),
            connections: BTreeMap::new(),
            next_connection: 1,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Get the current tick number.
    #[must_use]
    pub const fn get_tick(&self) -> u64 {
        self.tick
    }

    /// Simulation parameters.
    #[must_use]
    pub const fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Unit and structure catalog.
    #[must_use]
    pub const fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Get a reference to the entity storage.
    #[must_use]
    pub const fn entities(&self) -> &EntityStorage {
        &self.entities
    }

    /// Get an entity by ID.
    #[must_use]
    pub fn get_entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Get a connection by ID.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// All connections in id order.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Connection controlling `team`.
    #[must_use]
    pub fn connection_for_team(&self, team: TeamId) -> Option<ConnectionId> {
        self.connections
            .values()
            .find(|c| c.team == team)
            .map(|c| c.id)
    }

    /// Structure occupancy grid.
    #[must_use]
    pub const fn occupancy(&self) -> &OccupancyGrid {
        &self.occupancy
    }

    /// Spatial index built at the start of the last tick.
    #[must_use]
    pub const fn spatial_index(&self) -> &SpatialIndex {
        &self.index
    }

    /// Buffered command channel.
    #[must_use]
    pub const fn commands(&self) -> &CommandChannel {
        &self.commands
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Register a player controlling `team`.
    ///
    /// # Errors
    ///
    /// Fails if another connection already controls `team`.
    pub fn add_connection(&mut self, team: TeamId) -> Result<ConnectionId> {
        if self.connection_for_team(team).is_some() {
            return Err(GameError::InvalidState(format!(
                "team {} already has a connection",
                team.0
            )));
        }
        let id = self.next_connection;
        self.next_connection += 1;
        let half = Fixed::from_num(DEFAULT_VIEW_HALF_EXTENT);
        self.connections.insert(
            id,
            Connection {
                id,
                team,
                view: ViewExtent {
                    center: Vec2Fixed::ZERO,
                    half_extent: Vec2Fixed::new(half, half),
                },
                ledger: EconomyLedger::new(
                    self.config.starting_resources,
                    self.config.population_cap,
                ),
                pending_build: None,
                kills: 0,
                losses: 0,
            },
        );
        self.commands.register(id);
        tracing::info!(connection = id, team = team.0, "connection added");
        Ok(id)
    }

    /// Remove a player. Buffered commands and any pending build are
    /// discarded; owned entities stay in the world.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Option<Connection> {
        let discarded = self.commands.disconnect(id);
        let removed = self.connections.remove(&id);
        if removed.is_some() {
            tracing::info!(connection = id, discarded, "connection removed");
        }
        removed
    }

    /// Update the ground rectangle a connection sees.
    ///
    /// # Errors
    ///
    /// Fails for unknown connections.
    pub fn set_view_extent(
        &mut self,
        id: ConnectionId,
        center: Vec2Fixed,
        half_extent: Vec2Fixed,
    ) -> Result<()> {
        let world = self.occupancy.world_rect();
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(GameError::UnknownConnection(id))?;
        let span = world.max;
        connection.view = ViewExtent {
            center: world.nearest_point(center),
            half_extent: Vec2Fixed::new(
                half_extent.x.saturating_abs().min(span.x),
                half_extent.y.saturating_abs().min(span.y),
            ),
        };
        Ok(())
    }

    /// Buffer a command for its tick.
    ///
    /// # Errors
    ///
    /// Returns the channel's rejection; rejected commands have no effect.
    pub fn submit_command(&mut self, message: CommandMessage) -> std::result::Result<(), CommandRejection> {
        let result = self.commands.submit(message);
        if let Err(reason) = &result {
            tracing::debug!(%reason, "command rejected");
        }
        result
    }

    // ========================================================================
    // Spawning
    // ========================================================================

    fn unit_entity(&self, team: TeamId, unit: UnitIndex, position: Vec2Fixed) -> Result<Entity> {
        let def = self
            .catalog
            .unit(unit)
            .ok_or(GameError::UnknownCatalogIndex(unit.0))?;
        let mut entity = Entity::new(0, team, position, def.health);
        entity.unit_kind = Some(unit);
        entity.movement = Some(Movement {
            speed: def.speed,
            target: None,
        });
        entity.pursuit = Some(Pursuit::new(def.acquisition_radius));
        if def.is_armed() {
            entity.combat = Some(CombatStats::new(
                def.damage,
                def.attack_range,
                def.attack_cooldown,
            ));
        }
        Ok(entity)
    }

    /// Spawn a unit, charging its population to the team's connection.
    ///
    /// # Errors
    ///
    /// Fails for unknown catalog entries or when the population cap is hit.
    pub fn spawn_unit(&mut self, team: TeamId, unit: UnitIndex, position: Vec2Fixed) -> Result<EntityId> {
        let entity = self.unit_entity(team, unit, position)?;
        let population = self.catalog.unit(unit).map_or(0, |def| def.population);
        if let Some(connection) = self.connections.values_mut().find(|c| c.team == team) {
            connection.ledger.try_debit(0, population as i32)?;
        }
        let id = self.entities.insert(entity);
        tracing::info!(entity = id, team = team.0, unit = unit.0, "unit spawned");
        Ok(id)
    }

    /// Place a structure directly, bypassing cost and builder checks.
    ///
    /// # Errors
    ///
    /// Fails if the site is unknown, out of bounds or occupied.
    pub fn spawn_structure(
        &mut self,
        team: TeamId,
        structure: StructureIndex,
        origin: GridCoord,
        complete: bool,
    ) -> Result<EntityId> {
        let site = BuildSite::resolve(
            &self.occupancy,
            &self.catalog,
            BuildRequest {
                structure,
                grid_position: origin,
            },
        )?;
        if site.footprint.cells(origin).any(|c| !self.occupancy.is_free(c)) {
            return Err(BuildRejection::CellOccupied.into());
        }
        Ok(self.place_structure(team, &site, complete))
    }

    fn place_structure(&mut self, team: TeamId, site: &BuildSite, complete: bool) -> EntityId {
        let (health, build_total, produces) = self
            .catalog
            .structure(site.structure)
            .map_or((1, 0, false), |def| {
                (def.health, def.build_points, !def.produces.is_empty())
            });
        let mut entity = Entity::new(0, team, site.rect.center(), health);
        entity.structure = Some(Structure {
            kind: site.structure,
            origin: site.origin,
            footprint: site.footprint,
            build_progress: if complete { build_total } else { 0 },
            build_total,
            range_radius: site.required_range,
            rally_point: None,
        });
        if complete && produces {
            entity.production_queue = Some(ProductionQueue::with_max_size(
                self.config.production_queue_limit,
            ));
        }
        let id = self.entities.insert(entity);
        self.occupancy.claim(site.origin, site.footprint, id);
        tracing::info!(entity = id, team = team.0, structure = site.structure.0, "structure placed");
        id
    }

    // ========================================================================
    // Direct intents
    // ========================================================================

    /// Queue a unit at a structure owned by `connection`.
    ///
    /// # Errors
    ///
    /// Returns the production rejection; nothing is charged on failure.
    pub fn enqueue_production(
        &mut self,
        connection: ConnectionId,
        structure: EntityId,
        unit: UnitIndex,
    ) -> std::result::Result<(), ProductionError> {
        let owner = self
            .connections
            .get_mut(&connection)
            .ok_or(ProductionError::NotOwner)?;
        let entity = self
            .entities
            .get_mut(structure)
            .ok_or(ProductionError::UnknownStructure)?;
        if entity.team != owner.team {
            return Err(ProductionError::NotOwner);
        }
        let Some(building) = entity.structure.as_ref() else {
            return Err(ProductionError::UnknownStructure);
        };
        if !building.is_complete() {
            return Err(ProductionError::StructureNotComplete);
        }
        let queue = entity
            .production_queue
            .as_mut()
            .ok_or(ProductionError::CannotProduceUnit)?;
        queue_production(queue, building, unit, &self.catalog, &mut owner.ledger)
    }

    /// Cancel a queued unit, returning the refund.
    ///
    /// # Errors
    ///
    /// Fails if the structure is not owned by `connection` or has no entry
    /// at `index`.
    pub fn cancel_production(
        &mut self,
        connection: ConnectionId,
        structure: EntityId,
        index: usize,
    ) -> Result<u32> {
        let owner = self
            .connections
            .get_mut(&connection)
            .ok_or(GameError::UnknownConnection(connection))?;
        let entity = self
            .entities
            .get_mut(structure)
            .filter(|e| e.team == owner.team)
            .ok_or(GameError::EntityNotFound(structure))?;
        let queue = entity
            .production_queue
            .as_mut()
            .ok_or(ProductionError::UnknownStructure)?;
        cancel_production(queue, index, &self.catalog, &mut owner.ledger)
            .map(|(_, refund)| refund)
            .ok_or_else(|| GameError::InvalidState(format!("no queue entry at {index}")))
    }

    /// Set where units produced by `structure` appear.
    ///
    /// # Errors
    ///
    /// Fails if the entity is missing or not a structure.
    pub fn set_rally_point(&mut self, structure: EntityId, point: Vec2Fixed) -> Result<()> {
        let building = self
            .entities
            .get_mut(structure)
            .and_then(|e| e.structure.as_mut())
            .ok_or(GameError::EntityNotFound(structure))?;
        building.rally_point = Some(self.occupancy.world_rect().nearest_point(point));
        Ok(())
    }

    /// Buffer damage against `target` for the current tick.
    ///
    /// # Errors
    ///
    /// Fails if the target does not exist.
    pub fn queue_damage(&mut self, target: EntityId, amount: u32, source: Option<TeamId>) -> Result<()> {
        let entity = self
            .entities
            .get_mut(target)
            .ok_or(GameError::EntityNotFound(target))?;
        entity.damage.push(DamageEvent { amount, source });
        Ok(())
    }

    /// Buffer damage against every entity not on `source` within `radius`
    /// of `center`. Returns the number of entities hit.
    pub fn apply_area_damage(
        &mut self,
        center: Vec2Fixed,
        radius: Fixed,
        amount: u32,
        source: Option<TeamId>,
    ) -> usize {
        let radius_sq = radius.saturating_mul(radius);
        let mut hit = 0;
        for entity in self.entities.sorted_mut() {
            if Some(entity.team) != source
                && entity.position.value.distance_squared(center) <= radius_sq
            {
                entity.damage.push(DamageEvent { amount, source });
                hit += 1;
            }
        }
        hit
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Advance the simulation by one tick.
    ///
    /// Events produced during the tick are published to `sink`.
    pub fn tick(&mut self, sink: &mut impl EventSink) {
        // 1. Commands for exactly this tick
        let commands = self.commands.drain_tick(self.tick);
        for command in commands {
            self.apply_command(command, sink);
        }

        // 2. Spatial index
        self.rebuild_index();

        // 3-5. Intents
        self.run_targeting_system();
        self.run_movement_system();
        self.run_attack_system();

        // 6. Combat resolver, sync point
        self.run_combat_resolver(sink);

        // 7. Construction
        self.run_pending_builds(sink);
        self.run_construction_system(sink);

        // 8. Production
        self.run_production_system(sink);

        // 9. Index again so replication sees end-of-tick positions
        self.rebuild_index();

        self.tick += 1;

        #[cfg(feature = "debug-validation")]
        self.validate();

        #[cfg(debug_assertions)]
        {
            let hash = self.state_hash();
            tracing::debug!(tick = self.tick, state_hash = hash, "Simulation state hash");
        }
    }

    /// Log every broken world invariant.
    #[cfg(feature = "debug-validation")]
    fn validate(&self) {
        let mut claimed = std::collections::BTreeSet::new();
        for entity in self.entities.sorted_ids().into_iter().filter_map(|id| self.entities.get(id)) {
            if entity.health.current == 0 || entity.health.current > entity.health.max {
                tracing::error!(tick = self.tick, entity = entity.id, health = ?entity.health, "health out of bounds");
            }
            if let Some(structure) = &entity.structure {
                for cell in structure.footprint.cells(structure.origin) {
                    if !claimed.insert((cell.x, cell.y)) || self.occupancy.occupant(cell) != Some(entity.id) {
                        tracing::error!(tick = self.tick, entity = entity.id, ?cell, "occupancy mismatch");
                    }
                }
            }
            if entity.production_queue.as_ref().is_some_and(|q| q.active_count() > 1) {
                tracing::error!(tick = self.tick, entity = entity.id, "several active queue entries");
            }
        }
        for connection in self.connections.values() {
            if connection.ledger.population > connection.ledger.population_max {
                tracing::error!(tick = self.tick, connection = connection.id, "population over cap");
            }
        }
    }

    fn rebuild_index(&mut self) {
        let entries = self.entities.iter().filter(|(_, e)| e.is_unit()).map(|(id, e)| SpatialEntry {
            id: *id,
            team: e.team,
            position: e.position.value,
        });
        self.index.rebuild(entries);
    }

    // ------------------------------------------------------------------------
    // Command application
    // ------------------------------------------------------------------------

    fn drop_command(&self, command: &CommandMessage, why: &str, sink: &mut impl EventSink) {
        tracing::debug!(
            connection = command.connection,
            tick = command.tick,
            kind = ?command.kind,
            target = ?command.target_entity,
            why,
            "command dropped"
        );
        sink.publish(SimEvent::CommandDropped {
            connection: command.connection,
            kind: command.kind,
        });
    }

    fn selected_ids(&self, team: TeamId) -> Vec<EntityId> {
        let mut ids: Vec<_> = self
            .entities
            .iter()
            .filter(|(_, e)| e.team == team && e.selected)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn apply_command(&mut self, command: CommandMessage, sink: &mut impl EventSink) {
        let Some(team) = self.connections.get(&command.connection).map(|c| c.team) else {
            self.drop_command(&command, "connection gone", sink);
            return;
        };

        // Resolve the target reference once; stale references drop the command.
        let target = match command.target_entity {
            Some(id) => match self.entities.get(id) {
                Some(entity) => Some((id, entity.team, entity.position.value)),
                None => {
                    self.drop_command(&command, "target does not exist", sink);
                    return;
                }
            },
            None => None,
        };

        match command.kind {
            CommandKind::None => {}
            CommandKind::PrimaryClick => match target {
                Some((id, owner, _)) if owner == team => self.select_only(team, Some(id)),
                Some(_) => self.drop_command(&command, "cannot select enemy", sink),
                None => self.select_only(team, None),
            },
            CommandKind::SecondaryClick => match target {
                Some((id, owner, position)) if owner != team => {
                    self.order_attack(team, command.connection, id, position);
                }
                Some((_, _, position)) => self.order_move(team, command.connection, position),
                None => self.order_move(team, command.connection, command.target_point.ground()),
            },
            CommandKind::Attack => match target {
                Some((id, owner, position)) if owner != team => {
                    self.order_attack(team, command.connection, id, position);
                }
                Some(_) => self.drop_command(&command, "attack on friendly entity", sink),
                None => self.drop_command(&command, "attack without target", sink),
            },
            CommandKind::Stop => self.order_stop(team, command.connection, false),
            CommandKind::Hold => self.order_stop(team, command.connection, true),
            CommandKind::Build => {
                if let Some(request) = command.build {
                    self.request_build(command.connection, team, request, sink);
                }
            }
            CommandKind::Produce => {
                if let (Some((structure, _, _)), Some(unit)) = (target, command.produce) {
                    if let Err(reason) =
                        self.enqueue_production(command.connection, structure, unit)
                    {
                        tracing::debug!(connection = command.connection, %reason, "production rejected");
                        sink.publish(SimEvent::ProductionRejected {
                            connection: command.connection,
                            reason,
                        });
                    }
                }
            }
        }
    }

    fn select_only(&mut self, team: TeamId, id: Option<EntityId>) {
        for entity in self.entities.sorted_mut() {
            if entity.team == team {
                entity.selected = Some(entity.id) == id;
            }
        }
    }

    /// Drop the connection's pending build if its builder was given a new order.
    fn cancel_pending_for(&mut self, connection: ConnectionId, units: &[EntityId]) {
        if let Some(conn) = self.connections.get_mut(&connection) {
            if conn
                .pending_build
                .is_some_and(|p| units.contains(&p.builder))
            {
                tracing::debug!(connection, "pending build cancelled by new order");
                conn.pending_build = None;
            }
        }
    }

    fn order_move(&mut self, team: TeamId, connection: ConnectionId, point: Vec2Fixed) {
        let point = self.occupancy.world_rect().nearest_point(point);
        let selected = self.selected_ids(team);
        self.cancel_pending_for(connection, &selected);
        for id in selected {
            let Some(entity) = self.entities.get_mut(id) else {
                continue;
            };
            if let Some(structure) = entity.structure.as_mut() {
                structure.rally_point = Some(point);
                continue;
            }
            if let Some(movement) = entity.movement.as_mut() {
                movement.target = Some(point);
                entity.holding = false;
                if let Some(pursuit) = entity.pursuit.as_mut() {
                    pursuit.disengage();
                }
            }
        }
    }

    fn order_attack(
        &mut self,
        team: TeamId,
        connection: ConnectionId,
        target: EntityId,
        position: Vec2Fixed,
    ) {
        let selected = self.selected_ids(team);
        self.cancel_pending_for(connection, &selected);
        for id in selected {
            let Some(entity) = self.entities.get_mut(id) else {
                continue;
            };
            if entity.combat.is_some() {
                if let Some(pursuit) = entity.pursuit.as_mut() {
                    pursuit.engage(target, position);
                }
                entity.holding = false;
            } else if let Some(movement) = entity.movement.as_mut() {
                movement.target = Some(position);
            }
        }
    }

    fn order_stop(&mut self, team: TeamId, connection: ConnectionId, hold: bool) {
        let selected = self.selected_ids(team);
        self.cancel_pending_for(connection, &selected);
        for id in selected {
            let Some(entity) = self.entities.get_mut(id) else {
                continue;
            };
            if !entity.is_unit() {
                continue;
            }
            if let Some(movement) = entity.movement.as_mut() {
                movement.target = None;
            }
            if let Some(pursuit) = entity.pursuit.as_mut() {
                pursuit.disengage();
            }
            entity.velocity = Velocity::ZERO;
            entity.holding = hold;
        }
    }

    fn live_unit_positions(&self) -> Vec<(EntityId, Vec2Fixed)> {
        if !self.config.unit_exclusion {
            return Vec::new();
        }
        let mut units: Vec<_> = self
            .entities
            .iter()
            .filter(|(_, e)| e.is_unit())
            .map(|(id, e)| (*id, e.position.value))
            .collect();
        units.sort_unstable_by_key(|(id, _)| *id);
        units
    }

    fn builder_for(&self, team: TeamId) -> Option<Builder> {
        self.selected_ids(team).into_iter().find_map(|id| {
            let entity = self.entities.get(id)?;
            let def = self.catalog.unit(entity.unit_kind?)?;
            def.can_build.then_some(Builder {
                entity: id,
                position: entity.position.value,
            })
        })
    }

    fn request_build(
        &mut self,
        connection: ConnectionId,
        team: TeamId,
        request: BuildRequest,
        sink: &mut impl EventSink,
    ) {
        let builder = self.builder_for(team);
        let units = self.live_unit_positions();
        let Some(conn) = self.connections.get_mut(&connection) else {
            return;
        };
        // A new request replaces any earlier pending one.
        conn.pending_build = None;

        match validate_build(
            &self.occupancy,
            &self.catalog,
            request,
            &conn.ledger,
            &units,
            builder,
        ) {
            Ok(site) => {
                self.commit_build(connection, team, &site, sink);
            }
            Err(BuildRejection::OutOfRange) => {
                let (Some(builder), Ok(site)) = (
                    builder,
                    BuildSite::resolve(&self.occupancy, &self.catalog, request),
                ) else {
                    return;
                };
                conn.pending_build = Some(site.pending(builder.entity));
                self.move_builder(builder.entity, site.rect.center());
                tracing::debug!(connection, builder = builder.entity, "build pending");
                sink.publish(SimEvent::BuildPending {
                    connection,
                    builder: builder.entity,
                });
            }
            Err(reason) => {
                tracing::debug!(connection, %reason, "build rejected");
                sink.publish(SimEvent::BuildRejected { connection, reason });
            }
        }
    }

    fn commit_build(
        &mut self,
        connection: ConnectionId,
        team: TeamId,
        site: &BuildSite,
        sink: &mut impl EventSink,
    ) {
        let Some(conn) = self.connections.get_mut(&connection) else {
            return;
        };
        if let Err(err) = conn.ledger.try_debit(site.cost, 0) {
            // Validated against the same ledger this tick.
            tracing::warn!(connection, %err, "build debit failed after validation");
            sink.publish(SimEvent::BuildRejected {
                connection,
                reason: BuildRejection::InsufficientResources,
            });
            return;
        }
        let entity = self.place_structure(team, site, false);
        sink.publish(SimEvent::StructurePlaced {
            entity,
            team,
            structure: site.structure,
            origin: site.origin,
        });
    }

    fn move_builder(&mut self, builder: EntityId, point: Vec2Fixed) {
        if let Some(entity) = self.entities.get_mut(builder) {
            if let Some(movement) = entity.movement.as_mut() {
                movement.target = Some(point);
            }
            if let Some(pursuit) = entity.pursuit.as_mut() {
                pursuit.disengage();
            }
            entity.holding = false;
        }
    }

    // ------------------------------------------------------------------------
    // Systems
    // ------------------------------------------------------------------------

    fn structure_positions(&self) -> BTreeMap<EntityId, Vec2Fixed> {
        self.entities
            .iter()
            .filter(|(_, e)| e.structure.is_some())
            .map(|(id, e)| (*id, e.position.value))
            .collect()
    }

    fn run_targeting_system(&mut self) {
        let mut inputs: Vec<PursuitInput> = self
            .entities
            .iter()
            .filter_map(|(id, e)| {
                let pursuit = e.pursuit?;
                let movement = e.movement?;
                Some(PursuitInput {
                    id: *id,
                    team: e.team,
                    position: e.position.value,
                    pursuit,
                    attack_range: e.combat.map(|c| c.range),
                    holding: e.holding,
                    has_move_order: movement.target.is_some()
                        && pursuit.state == PursuitState::Idle,
                })
            })
            .collect();
        inputs.sort_unstable_by_key(|i| i.id);

        let structures = self.structure_positions();
        let decisions = targeting_system(
            &inputs,
            &self.index,
            &structures,
            self.config.lose_target_distance,
        );

        for decision in decisions {
            let Some(entity) = self.entities.get_mut(decision.id) else {
                continue;
            };
            entity.pursuit = Some(decision.pursuit);
            if let Some(movement) = entity.movement.as_mut() {
                match decision.goal {
                    MoveGoal::Keep => {}
                    MoveGoal::Set(point) => movement.target = Some(point),
                    MoveGoal::Clear => movement.target = None,
                }
            }
        }
    }

    fn run_movement_system(&mut self) {
        for entity in self.entities.sorted_mut() {
            let Some(movement) = entity.movement.as_mut() else {
                continue;
            };
            let Some(target) = movement.target else {
                entity.velocity = Velocity::ZERO;
                continue;
            };
            let position = entity.position.value;
            let offset = target - position;
            let step = if offset.dot(offset) <= movement.speed.saturating_mul(movement.speed) {
                movement.target = None;
                offset
            } else {
                offset.normalize().scale(movement.speed)
            };
            entity.velocity.value = step;
            entity.position.value = position + step;
        }
    }

    fn run_attack_system(&mut self) {
        for entity in self.entities.sorted_mut() {
            if let Some(combat) = entity.combat.as_mut() {
                combat.tick_cooldown();
            }
        }

        let mut hits: Vec<(EntityId, DamageEvent)> = Vec::new();
        let ids = self.entities.sorted_ids();

        for &id in &ids {
            let Some(attacker) = self.entities.get(id) else {
                continue;
            };
            let (Some(combat), Some(pursuit)) = (attacker.combat, attacker.pursuit) else {
                continue;
            };
            if !combat.can_attack() || pursuit.state != PursuitState::Pursuing {
                continue;
            }
            let Some(target) = pursuit.target_entity().and_then(|t| self.entities.get(t)) else {
                continue;
            };
            if target.team != attacker.team
                && in_attack_range(attacker.position.value, target.position.value, combat.range)
            {
                hits.push((
                    target.id,
                    DamageEvent {
                        amount: combat.damage,
                        source: Some(attacker.team),
                    },
                ));
                if let Some(stats) = self.entities.get_mut(id).and_then(|e| e.combat.as_mut()) {
                    stats.reset_cooldown();
                }
            }
        }

        for (target, event) in hits {
            if let Some(entity) = self.entities.get_mut(target) {
                entity.damage.push(event);
            }
        }
    }

    fn run_combat_resolver(&mut self, sink: &mut impl EventSink) {
        let casualties = resolve_damage(self.entities.sorted_mut().into_iter());
        for casualty in casualties {
            self.destroy(casualty, sink);
        }
    }

    /// Update ledgers for a casualty, then remove it.
    fn destroy(&mut self, casualty: Casualty, sink: &mut impl EventSink) {
        let population = casualty
            .unit_kind
            .and_then(|kind| self.catalog.unit(kind))
            .map_or(0, |def| def.population);

        for connection in self.connections.values_mut() {
            if connection.team == casualty.team {
                connection.ledger.credit(0, -(population as i32));
                connection.losses += 1;
            } else if Some(connection.team) == casualty.killed_by {
                connection.kills += 1;
            }
        }

        if let Some(entity) = self.entities.remove(casualty.entity) {
            if let Some(structure) = entity.structure {
                self.occupancy
                    .release(structure.origin, structure.footprint, entity.id);
            }
        }
        tracing::info!(
            entity = casualty.entity,
            team = casualty.team.0,
            killed_by = ?casualty.killed_by,
            "entity destroyed"
        );
        sink.publish(SimEvent::EntityDestroyed {
            entity: casualty.entity,
            team: casualty.team,
            killed_by: casualty.killed_by,
        });
    }

    fn run_pending_builds(&mut self, sink: &mut impl EventSink) {
        let pending: Vec<_> = self
            .connections
            .values()
            .filter_map(|c| c.pending_build.map(|p| (c.id, c.team, p)))
            .collect();
        if pending.is_empty() {
            return;
        }
        let units = self.live_unit_positions();

        for (connection, team, request) in pending {
            let Some(builder) = self.entities.get(request.builder).map(|e| Builder {
                entity: e.id,
                position: e.position.value,
            }) else {
                tracing::debug!(connection, "pending build dropped: builder gone");
                self.clear_pending(connection);
                continue;
            };
            let Some(conn) = self.connections.get(&connection) else {
                continue;
            };
            match validate_build(
                &self.occupancy,
                &self.catalog,
                request.request(),
                &conn.ledger,
                &units,
                Some(builder),
            ) {
                Ok(site) => {
                    self.clear_pending(connection);
                    if let Some(movement) = self
                        .entities
                        .get_mut(builder.entity)
                        .and_then(|e| e.movement.as_mut())
                    {
                        movement.target = None;
                    }
                    self.commit_build(connection, team, &site, sink);
                }
                Err(BuildRejection::OutOfRange) => {
                    self.move_builder(builder.entity, request.site_center);
                }
                Err(reason) => {
                    tracing::debug!(connection, %reason, "pending build dropped");
                    self.clear_pending(connection);
                }
            }
        }
    }

    fn clear_pending(&mut self, connection: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.pending_build = None;
        }
    }

    fn run_construction_system(&mut self, sink: &mut impl EventSink) {
        let rate = self.config.construction_rate;
        let completed = construction_system(
            self.entities
                .sorted_mut()
                .into_iter()
                .filter_map(|e| {
                    let id = e.id;
                    e.structure.as_mut().map(move |s| (id, s))
                }),
            rate,
        );

        for id in completed {
            let Some(entity) = self.entities.get_mut(id) else {
                continue;
            };
            let produces = entity
                .structure
                .as_ref()
                .and_then(|s| self.catalog.structure(s.kind))
                .is_some_and(|def| !def.produces.is_empty());
            if produces && entity.production_queue.is_none() {
                entity.production_queue = Some(ProductionQueue::with_max_size(
                    self.config.production_queue_limit,
                ));
            }
            tracing::info!(entity = id, "structure completed");
            sink.publish(SimEvent::StructureCompleted { entity: id });
        }
    }

    fn run_production_system(&mut self, sink: &mut impl EventSink) {
        let delta_ms = self.config.tick_duration_ms();
        let cell_size = self.config.cell_size;
        let mut spawns: Vec<(TeamId, UnitIndex, Vec2Fixed)> = Vec::new();

        for entity in self.entities.sorted_mut() {
            let (Some(structure), Some(queue)) =
                (entity.structure.as_ref(), entity.production_queue.as_mut())
            else {
                continue;
            };
            if !structure.is_complete() {
                continue;
            }
            let Some(connection) = self
                .connections
                .values_mut()
                .find(|c| c.team == entity.team)
            else {
                continue;
            };

            match advance_production(queue, delta_ms, &self.catalog, &mut connection.ledger) {
                ProductionStep::Idle => {}
                ProductionStep::Completed(unit) => {
                    let rect = self.occupancy.footprint_rect(structure.origin, structure.footprint);
                    spawns.push((entity.team, unit, spawn_point(structure, rect, cell_size)));
                }
                ProductionStep::Withheld {
                    unit,
                    newly_ready,
                    reason,
                } => {
                    if newly_ready {
                        tracing::debug!(structure = entity.id, %reason, "production withheld");
                        sink.publish(SimEvent::ProductionWithheld {
                            structure: entity.id,
                            unit,
                            reason,
                        });
                    }
                }
            }
        }

        for (team, unit, position) in spawns {
            match self.unit_entity(team, unit, position) {
                Ok(entity) => {
                    let id = self.entities.insert(entity);
                    tracing::info!(entity = id, team = team.0, unit = unit.0, "unit produced");
                    sink.publish(SimEvent::UnitSpawned {
                        entity: id,
                        team,
                        unit,
                    });
                }
                Err(err) => tracing::warn!(%err, "produced unit has no catalog entry"),
            }
        }
    }

    // ========================================================================
    // Determinism support
    // ========================================================================

    /// Calculate a hash of the current simulation state.
    ///
    /// Two simulations with identical state produce identical hashes.
    #[must_use]
    pub fn state_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();

        self.tick.hash(&mut hasher);

        let ids = self.entities.sorted_ids();
        ids.len().hash(&mut hasher);

        for id in ids {
            let Some(entity) = self.entities.get(id) else {
                continue;
            };
            id.hash(&mut hasher);
            entity.team.hash(&mut hasher);
            entity.position.value.hash(&mut hasher);
            entity.velocity.value.hash(&mut hasher);
            entity.health.hash(&mut hasher);
            entity.unit_kind.hash(&mut hasher);
            entity.selected.hash(&mut hasher);
            entity.holding.hash(&mut hasher);

            if let Some(movement) = entity.movement {
                movement.speed.hash(&mut hasher);
                movement.target.hash(&mut hasher);
            }
            if let Some(pursuit) = entity.pursuit {
                pursuit.state.hash(&mut hasher);
                pursuit.target_entity().hash(&mut hasher);
                pursuit.target.map(|t| t.last_known).hash(&mut hasher);
            }
            if let Some(combat) = entity.combat {
                combat.cooldown_remaining.hash(&mut hasher);
            }
            if let Some(structure) = entity.structure.as_ref() {
                structure.kind.hash(&mut hasher);
                structure.origin.hash(&mut hasher);
                structure.build_progress.hash(&mut hasher);
                structure.rally_point.hash(&mut hasher);
            }
            if let Some(queue) = entity.production_queue.as_ref() {
                for entry in queue.entries() {
                    entry.unit.hash(&mut hasher);
                    entry.progress_ms.hash(&mut hasher);
                    entry.active.hash(&mut hasher);
                }
            }
        }

        for connection in self.connections.values() {
            connection.id.hash(&mut hasher);
            connection.team.hash(&mut hasher);
            connection.ledger.resources.hash(&mut hasher);
            connection.ledger.population.hash(&mut hasher);
            connection.kills.hash(&mut hasher);
            connection.losses.hash(&mut hasher);
            connection
                .pending_build
                .map(|p| (p.structure, p.grid_position, p.builder))
                .hash(&mut hasher);
        }

        hasher.finish()
    }

    /// Serialize the simulation state for save games or replay checkpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize simulation state from bytes.
    ///
    /// The spatial index is not stored; it is rebuilt from entity positions.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut sim: Self = bincode::deserialize(data)?;
        sim.index = SpatialIndex::new(sim.config.spatial_bucket_size);
        sim.rebuild_index();
        Ok(sim)
    }

    /// Live entities on `team`, sorted by id.
    #[must_use]
    pub fn team_entities(&self, team: TeamId) -> Vec<EntityId> {
        let mut ids: Vec<_> = self
            .entities
            .iter()
            .filter(|(_, e)| e.team == team)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// World-space extent of a structure's footprint.
    #[must_use]
    pub fn structure_rect(&self, id: EntityId) -> Option<Rect> {
        let structure = self.entities.get(id)?.structure.as_ref()?;
        Some(
            self.occupancy
                .footprint_rect(structure.origin, structure.footprint),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::test_catalog;
    use crate::math::Vec3Fixed;

    const SOLDIER: UnitIndex = UnitIndex(0);
    const WORKER: UnitIndex = UnitIndex(1);
    const BARRACKS: StructureIndex = StructureIndex(0);
    const WALL: StructureIndex = StructureIndex(1);

    fn pos(x: i32, y: i32) -> Vec2Fixed {
        Vec2Fixed::new(Fixed::from_num(x), Fixed::from_num(y))
    }

    fn point(x: i32, y: i32) -> Vec3Fixed {
        Vec3Fixed::new(Fixed::from_num(x), Fixed::ZERO, Fixed::from_num(y))
    }

    fn sim() -> Simulation {
        Simulation::new(SimConfig::default(), test_catalog())
    }

    fn run(sim: &mut Simulation) -> Vec<SimEvent> {
        let mut events = Vec::new();
        sim.tick(&mut events);
        events
    }

    fn select(sim: &mut Simulation, connection: ConnectionId, unit: EntityId) {
        let tick = sim.get_tick();
        sim.submit_command(CommandMessage::new(connection, tick, CommandKind::PrimaryClick).targeting(unit))
            .unwrap();
        run(sim);
    }

    #[test]
    fn test_tick_increments() {
        let mut sim = sim();
        assert_eq!(sim.get_tick(), 0);
        run(&mut sim);
        run(&mut sim);
        assert_eq!(sim.get_tick(), 2);
    }

    #[test]
    fn test_one_connection_per_team() {
        let mut sim = sim();
        sim.add_connection(TeamId(0)).unwrap();
        assert!(sim.add_connection(TeamId(0)).is_err());
    }

    #[test]
    fn test_spawn_unit_charges_population() {
        let mut sim = sim();
        let conn = sim.add_connection(TeamId(0)).unwrap();
        sim.spawn_unit(TeamId(0), SOLDIER, pos(0, 0)).unwrap();
        assert_eq!(sim.connection(conn).unwrap().ledger.population, 1);
        assert!(matches!(
            sim.spawn_unit(TeamId(0), UnitIndex(99), pos(0, 0)),
            Err(GameError::UnknownCatalogIndex(99))
        ));
    }

    #[test]
    fn test_move_command_moves_selected_unit() {
        let mut sim = sim();
        let conn = sim.add_connection(TeamId(0)).unwrap();
        let unit = sim.spawn_unit(TeamId(0), SOLDIER, pos(0, 0)).unwrap();
        select(&mut sim, conn, unit);

        let tick = sim.get_tick();
        sim.submit_command(CommandMessage::new(conn, tick, CommandKind::SecondaryClick).at(point(3, 0)))
            .unwrap();
        for _ in 0..5 {
            run(&mut sim);
        }
        let entity = sim.get_entity(unit).unwrap();
        assert_eq!(entity.position.value, pos(3, 0));
        assert!(entity.movement.unwrap().target.is_none());
    }

    #[test]
    fn test_far_move_target_clamped_to_map() {
        let mut sim = sim();
        let conn = sim.add_connection(TeamId(0)).unwrap();
        let unit = sim.spawn_unit(TeamId(0), SOLDIER, pos(0, 0)).unwrap();
        select(&mut sim, conn, unit);

        let tick = sim.get_tick();
        sim.submit_command(
            CommandMessage::new(conn, tick, CommandKind::SecondaryClick).at(point(100_000, 0)),
        )
        .unwrap();
        run(&mut sim);
        let target = sim.get_entity(unit).unwrap().movement.unwrap().target;
        assert_eq!(target, Some(pos(128, 0)));

        let tick = sim.get_tick();
        sim.submit_command(CommandMessage::new(conn, tick, CommandKind::SecondaryClick).at(
            Vec3Fixed::new(Fixed::MAX, Fixed::ZERO, Fixed::MIN),
        ))
        .unwrap();
        for _ in 0..10 {
            run(&mut sim);
        }
        let entity = sim.get_entity(unit).unwrap();
        assert_eq!(entity.movement.unwrap().target, Some(pos(128, 0)));
        assert!(sim.occupancy().world_rect().contains(entity.position.value));
    }

    #[test]
    fn test_extreme_view_extent_clamped() {
        let mut sim = sim();
        let conn = sim.add_connection(TeamId(0)).unwrap();
        sim.spawn_unit(TeamId(1), SOLDIER, pos(5, 5)).unwrap();

        sim.set_view_extent(conn, pos(1, 1), Vec2Fixed::new(Fixed::MAX, Fixed::MIN))
            .unwrap();
        assert_eq!(sim.connection(conn).unwrap().view.half_extent, pos(128, 128));

        sim.set_view_extent(conn, Vec2Fixed::new(Fixed::MIN, Fixed::MAX), pos(4, 4))
            .unwrap();
        assert_eq!(sim.connection(conn).unwrap().view.center, pos(0, 128));

        sim.set_view_extent(conn, pos(1, 1), Vec2Fixed::new(Fixed::MAX, Fixed::MAX))
            .unwrap();
        run(&mut sim);
        let snapshot = crate::replication::Replicator::default()
            .encode(&sim, conn)
            .unwrap();
        assert_eq!(snapshot.entity_ids().len(), 1);
    }

    #[test]
    fn test_attack_on_friendly_dropped() {
        let mut sim = sim();
        let conn = sim.add_connection(TeamId(0)).unwrap();
        let a = sim.spawn_unit(TeamId(0), SOLDIER, pos(0, 0)).unwrap();
        let b = sim.spawn_unit(TeamId(0), SOLDIER, pos(1, 0)).unwrap();
        select(&mut sim, conn, a);

        let tick = sim.get_tick();
        sim.submit_command(CommandMessage::new(conn, tick, CommandKind::Attack).targeting(b))
            .unwrap();
        let events = run(&mut sim);
        assert!(events.contains(&SimEvent::CommandDropped {
            connection: conn,
            kind: CommandKind::Attack
        }));
        assert_eq!(
            sim.get_entity(a).unwrap().pursuit.unwrap().state,
            PursuitState::Idle
        );
    }

    #[test]
    fn test_command_with_missing_target_dropped() {
        let mut sim = sim();
        let conn = sim.add_connection(TeamId(0)).unwrap();
        sim.submit_command(CommandMessage::new(conn, 0, CommandKind::Attack).targeting(404))
            .unwrap();
        let events = run(&mut sim);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SimEvent::CommandDropped { .. }));
    }

    #[test]
    fn test_units_acquire_and_kill_enemy() {
        let mut sim = sim();
        let red = sim.add_connection(TeamId(0)).unwrap();
        let blue = sim.add_connection(TeamId(1)).unwrap();
        sim.spawn_unit(TeamId(0), SOLDIER, pos(0, 0)).unwrap();
        let victim = sim.spawn_unit(TeamId(1), WORKER, pos(5, 0)).unwrap();

        let mut destroyed = None;
        for _ in 0..100 {
            for event in run(&mut sim) {
                if let SimEvent::EntityDestroyed { entity, .. } = event {
                    destroyed = Some(entity);
                }
            }
        }
        assert_eq!(destroyed, Some(victim));
        assert!(sim.get_entity(victim).is_none());
        assert_eq!(sim.connection(red).unwrap().kills, 1);
        assert_eq!(sim.connection(blue).unwrap().losses, 1);
        assert_eq!(sim.connection(blue).unwrap().ledger.population, 0);
    }

    #[test]
    fn test_buffered_damage_kills_once() {
        let mut sim = sim();
        let blue = sim.add_connection(TeamId(1)).unwrap();
        let target = sim.spawn_unit(TeamId(1), SOLDIER, pos(50, 50)).unwrap();
        sim.queue_damage(target, 30, Some(TeamId(0))).unwrap();
        sim.queue_damage(target, 90, Some(TeamId(0))).unwrap();

        let events = run(&mut sim);
        let deaths = events
            .iter()
            .filter(|e| matches!(e, SimEvent::EntityDestroyed { .. }))
            .count();
        assert_eq!(deaths, 1);
        assert!(sim.get_entity(target).is_none());
        assert_eq!(sim.connection(blue).unwrap().ledger.population, 0);
        assert_eq!(sim.connection(blue).unwrap().losses, 1);
    }

    #[test]
    fn test_area_damage_spares_source_team() {
        let mut sim = sim();
        let own = sim.spawn_unit(TeamId(0), SOLDIER, pos(0, 0)).unwrap();
        let enemy = sim.spawn_unit(TeamId(1), SOLDIER, pos(1, 0)).unwrap();
        let far = sim.spawn_unit(TeamId(1), SOLDIER, pos(10, 0)).unwrap();
        assert_eq!(
            sim.apply_area_damage(pos(0, 0), Fixed::from_num(3), 40, Some(TeamId(0))),
            1
        );
        assert!(sim.get_entity(own).unwrap().damage.is_empty());
        assert_eq!(sim.get_entity(enemy).unwrap().damage.total(), 40);
        assert!(sim.get_entity(far).unwrap().damage.is_empty());
    }

    #[test]
    fn test_build_without_builder_places_immediately() {
        let mut sim = sim();
        let conn = sim.add_connection(TeamId(0)).unwrap();
        let request = BuildRequest {
            structure: WALL,
            grid_position: GridCoord::new(4, 4),
        };
        sim.submit_command(CommandMessage::new(conn, 0, CommandKind::Build).with_build(request))
            .unwrap();
        let events = run(&mut sim);
        assert!(events
            .iter()
            .any(|e| matches!(e, SimEvent::StructurePlaced { .. })));
        assert_eq!(sim.connection(conn).unwrap().ledger.resources, 490);
        assert_eq!(sim.occupancy().occupied_count(), 1);
    }

    #[test]
    fn test_second_build_on_same_cells_rejected_in_same_tick() {
        let mut sim = sim();
        let conn = sim.add_connection(TeamId(0)).unwrap();
        let request = BuildRequest {
            structure: BARRACKS,
            grid_position: GridCoord::new(4, 4),
        };
        for _ in 0..2 {
            sim.submit_command(
                CommandMessage::new(conn, 0, CommandKind::Build)
                    .with_build(request)
                    .at(point(1, 1)),
            )
            .ok();
        }
        // Identical messages are deduplicated; send a shifted one instead.
        let overlapping = BuildRequest {
            structure: BARRACKS,
            grid_position: GridCoord::new(5, 5),
        };
        sim.submit_command(CommandMessage::new(conn, 0, CommandKind::Build).with_build(overlapping))
            .unwrap();

        let events = run(&mut sim);
        assert!(events.contains(&SimEvent::BuildRejected {
            connection: conn,
            reason: BuildRejection::CellOccupied
        }));
        assert_eq!(sim.connection(conn).unwrap().ledger.resources, 450);
    }

    #[test]
    fn test_pending_build_placed_when_builder_arrives() {
        let mut sim = sim();
        let conn = sim.add_connection(TeamId(0)).unwrap();
        let worker = sim.spawn_unit(TeamId(0), WORKER, pos(20, 5)).unwrap();
        select(&mut sim, conn, worker);

        let request = BuildRequest {
            structure: BARRACKS,
            grid_position: GridCoord::new(4, 4),
        };
        let tick = sim.get_tick();
        sim.submit_command(CommandMessage::new(conn, tick, CommandKind::Build).with_build(request))
            .unwrap();
        let events = run(&mut sim);
        assert!(events.contains(&SimEvent::BuildPending {
            connection: conn,
            builder: worker
        }));
        assert!(sim.connection(conn).unwrap().pending_build.is_some());
        assert_eq!(sim.connection(conn).unwrap().ledger.resources, 500);

        let mut placed = false;
        for _ in 0..30 {
            placed |= run(&mut sim)
                .iter()
                .any(|e| matches!(e, SimEvent::StructurePlaced { .. }));
        }
        assert!(placed);
        assert!(sim.connection(conn).unwrap().pending_build.is_none());
        assert_eq!(sim.connection(conn).unwrap().ledger.resources, 450);
    }

    #[test]
    fn test_pending_build_dropped_when_site_taken() {
        let mut sim = sim();
        let conn = sim.add_connection(TeamId(0)).unwrap();
        let worker = sim.spawn_unit(TeamId(0), WORKER, pos(40, 5)).unwrap();
        select(&mut sim, conn, worker);

        let request = BuildRequest {
            structure: BARRACKS,
            grid_position: GridCoord::new(4, 4),
        };
        let tick = sim.get_tick();
        sim.submit_command(CommandMessage::new(conn, tick, CommandKind::Build).with_build(request))
            .unwrap();
        run(&mut sim);
        sim.spawn_structure(TeamId(1), WALL, GridCoord::new(5, 5), true)
            .unwrap();
        let events = run(&mut sim);
        assert!(sim.connection(conn).unwrap().pending_build.is_none());
        assert!(!events
            .iter()
            .any(|e| matches!(e, SimEvent::BuildRejected { .. })));
    }

    #[test]
    fn test_construction_completes_and_hosts_queue() {
        let mut sim = sim();
        sim.add_connection(TeamId(0)).unwrap();
        let id = sim
            .spawn_structure(TeamId(0), BARRACKS, GridCoord::new(0, 0), false)
            .unwrap();
        assert!(sim.get_entity(id).unwrap().production_queue.is_none());
        let mut completed = false;
        for _ in 0..4 {
            completed |= run(&mut sim).contains(&SimEvent::StructureCompleted { entity: id });
        }
        assert!(completed);
        assert!(sim.get_entity(id).unwrap().production_queue.is_some());
    }

    #[test]
    fn test_produce_command_spawns_unit_at_rally_point() {
        let mut sim = sim();
        let conn = sim.add_connection(TeamId(0)).unwrap();
        let barracks = sim
            .spawn_structure(TeamId(0), BARRACKS, GridCoord::new(0, 0), true)
            .unwrap();
        sim.set_rally_point(barracks, pos(10, 10)).unwrap();
        sim.submit_command(
            CommandMessage::new(conn, 0, CommandKind::Produce)
                .targeting(barracks)
                .with_produce(WORKER),
        )
        .unwrap();

        let mut spawned = None;
        for _ in 0..120 {
            for event in run(&mut sim) {
                if let SimEvent::UnitSpawned { entity, .. } = event {
                    spawned = Some(entity);
                }
            }
        }
        let unit = sim.get_entity(spawned.unwrap()).unwrap();
        assert_eq!(unit.position.value, pos(10, 10));
        assert_eq!(sim.connection(conn).unwrap().ledger.resources, 475);
        assert_eq!(sim.connection(conn).unwrap().ledger.population, 1);
    }

    #[test]
    fn test_enqueue_on_enemy_structure_rejected() {
        let mut sim = sim();
        let conn = sim.add_connection(TeamId(0)).unwrap();
        let barracks = sim
            .spawn_structure(TeamId(1), BARRACKS, GridCoord::new(0, 0), true)
            .unwrap();
        assert_eq!(
            sim.enqueue_production(conn, barracks, SOLDIER),
            Err(ProductionError::NotOwner)
        );
    }

    #[test]
    fn test_destroyed_structure_releases_cells() {
        let mut sim = sim();
        let wall = sim
            .spawn_structure(TeamId(1), WALL, GridCoord::new(2, 2), true)
            .unwrap();
        assert_eq!(sim.occupancy().occupied_count(), 1);
        sim.queue_damage(wall, 500, None).unwrap();
        run(&mut sim);
        assert_eq!(sim.occupancy().occupied_count(), 0);
    }

    #[test]
    fn test_disconnect_keeps_entities() {
        let mut sim = sim();
        let conn = sim.add_connection(TeamId(0)).unwrap();
        let unit = sim.spawn_unit(TeamId(0), SOLDIER, pos(0, 0)).unwrap();
        sim.submit_command(CommandMessage::new(conn, 3, CommandKind::Stop))
            .unwrap();
        assert!(sim.remove_connection(conn).is_some());
        assert_eq!(sim.commands().pending_len(), 0);
        run(&mut sim);
        assert!(sim.get_entity(unit).is_some());
    }

    #[test]
    fn test_deterministic_hash() {
        let build = || {
            let mut sim = sim();
            sim.add_connection(TeamId(0)).unwrap();
            sim.add_connection(TeamId(1)).unwrap();
            sim.spawn_unit(TeamId(0), SOLDIER, pos(0, 0)).unwrap();
            sim.spawn_unit(TeamId(1), SOLDIER, pos(6, 0)).unwrap();
            sim.spawn_unit(TeamId(1), SOLDIER, pos(-6, 0)).unwrap();
            sim
        };
        let mut sim1 = build();
        let mut sim2 = build();
        for _ in 0..50 {
            run(&mut sim1);
            run(&mut sim2);
            assert_eq!(sim1.state_hash(), sim2.state_hash());
        }
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut sim = sim();
        sim.add_connection(TeamId(0)).unwrap();
        sim.spawn_unit(TeamId(0), SOLDIER, pos(42, 24)).unwrap();
        run(&mut sim);

        let bytes = sim.serialize().unwrap();
        let restored = Simulation::deserialize(&bytes).unwrap();

        assert_eq!(sim.get_tick(), restored.get_tick());
        assert_eq!(sim.state_hash(), restored.state_hash());
        assert_eq!(restored.spatial_index().len(), 1);
    }
}
