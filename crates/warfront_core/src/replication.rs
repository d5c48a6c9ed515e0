//! Replication and relevancy filtering.
//!
//! Each connection sees the entities inside its view rectangle plus
//! everything it owns. Networked fields of relevant entities are quantized
//! through a [`CodecTable`] and packed into a [`Snapshot`]. Quantization is
//! lossy and one-way: snapshots go from server to client only.
//!
//! Every snapshot is self-contained. A client that lost track of state can
//! be repaired by simply waiting for the next one.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::components::{ConnectionId, Entity, EntityId};
use crate::error::{GameError, Result};
use crate::math::Fixed;
use crate::simulation::Simulation;
use crate::targeting::PursuitState;

/// Networked component groups, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ComponentId {
    /// Ground position.
    Transform,
    /// Velocity of the last movement step.
    Velocity,
    /// Current and maximum health.
    Health,
    /// Owning team.
    Team,
    /// Structure kind and construction progress.
    Structure,
    /// Pursuit state and target.
    Pursuit,
}

/// Individual networked fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldId {
    /// Position x.
    PositionX,
    /// Position y (ground depth).
    PositionY,
    /// Velocity x.
    VelocityX,
    /// Velocity y.
    VelocityY,
    /// Current health.
    HealthCurrent,
    /// Maximum health.
    HealthMax,
    /// Team id.
    Team,
    /// Structure catalog index.
    StructureKind,
    /// Construction points so far.
    BuildProgress,
    /// Construction points needed.
    BuildTotal,
    /// Pursuit state discriminant.
    PursuitState,
    /// Pursued entity, or -1.
    PursuitTarget,
    /// Server-side last known target x.
    PursuitLastKnownX,
    /// Server-side last known target y.
    PursuitLastKnownY,
}

/// Unquantized field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    /// Integer field.
    Int(i64),
    /// Fixed-point field.
    Fixed(Fixed),
}

/// How a field is put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantization {
    /// Server-only; never sent.
    Omit,
    /// Integer sent as is.
    Int,
    /// Fixed-point sent as its exact raw bits.
    FixedBits,
    /// Fixed-point rounded to `1 / scale` precision.
    Scaled {
        /// Steps per world unit.
        scale: i32,
    },
}

impl Quantization {
    /// Quantize a value, or `None` for omitted fields.
    #[must_use]
    pub fn encode(self, value: FieldValue) -> Option<i64> {
        match (self, value) {
            (Self::Omit, _) => None,
            (Self::Int | Self::FixedBits | Self::Scaled { .. }, FieldValue::Int(v)) => Some(v),
            (Self::Int | Self::FixedBits, FieldValue::Fixed(v)) => Some(v.to_bits()),
            (Self::Scaled { scale }, FieldValue::Fixed(v)) => Some(
                v.saturating_mul(Fixed::from_num(scale))
                    .saturating_round()
                    .saturating_to_num::<i64>(),
            ),
        }
    }

    /// Reverse [`Quantization::encode`], up to the precision lost.
    #[must_use]
    pub fn decode(self, quantized: i64) -> Option<FieldValue> {
        match self {
            Self::Omit => None,
            Self::Int => Some(FieldValue::Int(quantized)),
            Self::FixedBits => Some(FieldValue::Fixed(Fixed::from_bits(quantized))),
            Self::Scaled { scale } => Some(FieldValue::Fixed(
                Fixed::saturating_from_num(quantized) / Fixed::from_num(scale.max(1)),
            )),
        }
    }
}

/// One field's codec entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldCodec {
    /// Field this entry covers.
    pub field: FieldId,
    /// Wire scheme.
    pub scheme: Quantization,
}

/// Field layout and quantization scheme of every networked component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecTable {
    components: BTreeMap<ComponentId, Vec<FieldCodec>>,
}

impl CodecTable {
    /// Position and velocity at 1/100 unit, health raw, server-only pursuit
    /// data omitted.
    #[must_use]
    pub fn standard() -> Self {
        let hundredths = Quantization::Scaled { scale: 100 };
        let codec = |field, scheme| FieldCodec { field, scheme };
        let mut components = BTreeMap::new();
        components.insert(
            ComponentId::Transform,
            vec![
                codec(FieldId::PositionX, hundredths),
                codec(FieldId::PositionY, hundredths),
            ],
        );
        components.insert(
            ComponentId::Velocity,
            vec![
                codec(FieldId::VelocityX, hundredths),
                codec(FieldId::VelocityY, hundredths),
            ],
        );
        components.insert(
            ComponentId::Health,
            vec![
                codec(FieldId::HealthCurrent, Quantization::Int),
                codec(FieldId::HealthMax, Quantization::Int),
            ],
        );
        components.insert(
            ComponentId::Team,
            vec![codec(FieldId::Team, Quantization::Int)],
        );
        components.insert(
            ComponentId::Structure,
            vec![
                codec(FieldId::StructureKind, Quantization::Int),
                codec(FieldId::BuildProgress, Quantization::Int),
                codec(FieldId::BuildTotal, Quantization::Int),
            ],
        );
        components.insert(
            ComponentId::Pursuit,
            vec![
                codec(FieldId::PursuitState, Quantization::Int),
                codec(FieldId::PursuitTarget, Quantization::Int),
                codec(FieldId::PursuitLastKnownX, Quantization::Omit),
                codec(FieldId::PursuitLastKnownY, Quantization::Omit),
            ],
        );
        Self { components }
    }

    /// Field layout of a component.
    #[must_use]
    pub fn fields(&self, component: ComponentId) -> &[FieldCodec] {
        self.components
            .get(&component)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Quantize `values`, given in layout order. Omitted fields are dropped.
    #[must_use]
    pub fn encode(&self, component: ComponentId, values: &[FieldValue]) -> Vec<i64> {
        self.fields(component)
            .iter()
            .zip(values)
            .filter_map(|(codec, value)| codec.scheme.encode(*value))
            .collect()
    }

    /// Decode wire fields back into `(field, value)` pairs.
    ///
    /// Fails if the field count does not match the layout.
    pub fn decode(
        &self,
        component: ComponentId,
        fields: &[i64],
    ) -> Result<Vec<(FieldId, FieldValue)>> {
        let sent: Vec<&FieldCodec> = self
            .fields(component)
            .iter()
            .filter(|codec| codec.scheme != Quantization::Omit)
            .collect();
        if sent.len() != fields.len() {
            return Err(GameError::Serialization(format!(
                "{component:?} expects {} fields, got {}",
                sent.len(),
                fields.len()
            )));
        }
        Ok(sent
            .into_iter()
            .zip(fields)
            .filter_map(|(codec, q)| codec.scheme.decode(*q).map(|v| (codec.field, v)))
            .collect())
    }
}

impl Default for CodecTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// One component of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Entity the component belongs to.
    pub entity_id: EntityId,
    /// Component group.
    pub component_id: ComponentId,
    /// Quantized fields in layout order.
    pub fields: Vec<i64>,
}

/// Economy summary for the receiving connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EconomySnapshot {
    /// Spendable resources.
    pub resources: u32,
    /// Population in use.
    pub population: u32,
    /// Population cap.
    pub population_max: u32,
}

/// Everything one connection needs to know after a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Tick the snapshot was taken after.
    pub tick: u64,
    /// Receiving connection.
    pub connection: ConnectionId,
    /// Component entries ordered by entity id, then component id.
    pub entries: Vec<SnapshotEntry>,
    /// Entities relevant in the previous snapshot but not this one.
    pub removed: Vec<EntityId>,
    /// Receiving connection's economy.
    pub economy: EconomySnapshot,
}

impl Snapshot {
    /// Encode for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Distinct entity ids present, in order.
    #[must_use]
    pub fn entity_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entries.iter().map(|e| e.entity_id).collect();
        ids.dedup();
        ids
    }

    /// Entries belonging to one entity.
    pub fn entity(&self, id: EntityId) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.iter().filter(move |e| e.entity_id == id)
    }
}

/// Builds snapshots and remembers what each connection last saw.
#[derive(Debug, Clone, Default)]
pub struct Replicator {
    codec: CodecTable,
    previous: HashMap<ConnectionId, BTreeSet<EntityId>>,
}

impl Replicator {
    /// Create a replicator with a codec table.
    #[must_use]
    pub fn new(codec: CodecTable) -> Self {
        Self {
            codec,
            previous: HashMap::new(),
        }
    }

    /// Codec in use.
    #[must_use]
    pub const fn codec(&self) -> &CodecTable {
        &self.codec
    }

    /// Drop state kept for a departed connection.
    pub fn forget(&mut self, connection: ConnectionId) {
        self.previous.remove(&connection);
    }

    /// Forget what a connection has seen, so the next snapshot carries no
    /// removals relative to possibly corrupted client state.
    pub fn request_full_resend(&mut self, connection: ConnectionId) {
        tracing::debug!(connection, "full snapshot requested");
        self.previous.remove(&connection);
    }

    /// Entities `connection` should see this tick.
    ///
    /// Units are looked up in the spatial index, which the tick rebuilds
    /// after movement and production. Structures are not indexed and are
    /// tested directly.
    pub fn relevant_entities(sim: &Simulation, connection: ConnectionId) -> Result<BTreeSet<EntityId>> {
        let conn = sim
            .connection(connection)
            .ok_or(GameError::UnknownConnection(connection))?;
        let rect = conn.view.rect();

        let mut relevant: BTreeSet<EntityId> = sim
            .spatial_index()
            .query_rect(rect)
            .into_iter()
            .filter(|id| sim.get_entity(*id).is_some())
            .collect();
        relevant.extend(sim.entities().iter().filter_map(|(id, e)| {
            let visible = e.team == conn.team
                || (e.structure.is_some() && rect.contains(e.position.value));
            visible.then_some(*id)
        }));
        Ok(relevant)
    }

    /// Build the snapshot for `connection` from the current world.
    pub fn encode(&mut self, sim: &Simulation, connection: ConnectionId) -> Result<Snapshot> {
        let relevant = Self::relevant_entities(sim, connection)?;
        let ledger = sim
            .connection(connection)
            .map(|c| c.ledger)
            .unwrap_or_default();

        let mut entries = Vec::new();
        for id in &relevant {
            if let Some(entity) = sim.get_entity(*id) {
                self.encode_entity(entity, &mut entries);
            }
        }

        let removed = self
            .previous
            .get(&connection)
            .map(|before| before.difference(&relevant).copied().collect())
            .unwrap_or_default();
        self.previous.insert(connection, relevant);

        Ok(Snapshot {
            tick: sim.get_tick(),
            connection,
            entries,
            removed,
            economy: EconomySnapshot {
                resources: ledger.resources,
                population: ledger.population,
                population_max: ledger.population_max,
            },
        })
    }

    fn encode_entity(&self, entity: &Entity, out: &mut Vec<SnapshotEntry>) {
        let mut push = |component_id, values: &[FieldValue]| {
            out.push(SnapshotEntry {
                entity_id: entity.id,
                component_id,
                fields: self.codec.encode(component_id, values),
            });
        };

        let position = entity.position.value;
        push(
            ComponentId::Transform,
            &[FieldValue::Fixed(position.x), FieldValue::Fixed(position.y)],
        );
        if entity.movement.is_some() {
            let velocity = entity.velocity.value;
            push(
                ComponentId::Velocity,
                &[FieldValue::Fixed(velocity.x), FieldValue::Fixed(velocity.y)],
            );
        }
        push(
            ComponentId::Health,
            &[
                FieldValue::Int(i64::from(entity.health.current)),
                FieldValue::Int(i64::from(entity.health.max)),
            ],
        );
        push(ComponentId::Team, &[FieldValue::Int(i64::from(entity.team.0))]);
        if let Some(structure) = entity.structure.as_ref() {
            push(
                ComponentId::Structure,
                &[
                    FieldValue::Int(i64::from(structure.kind.0)),
                    FieldValue::Int(i64::from(structure.build_progress)),
                    FieldValue::Int(i64::from(structure.build_total)),
                ],
            );
        }
        if let Some(pursuit) = entity.pursuit {
            let state = match pursuit.state {
                PursuitState::Idle => 0,
                PursuitState::Pursuing => 1,
                PursuitState::Lost => 2,
            };
            let target = pursuit
                .target_entity()
                .map_or(-1, |id| i64::try_from(id).unwrap_or(i64::MAX));
            let last_known = pursuit.target.map(|t| t.last_known).unwrap_or_default();
            push(
                ComponentId::Pursuit,
                &[
                    FieldValue::Int(state),
                    FieldValue::Int(target),
                    FieldValue::Fixed(last_known.x),
                    FieldValue::Fixed(last_known.y),
                ],
            );
        }
    }
}
