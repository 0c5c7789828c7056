//! Area-effect targeting and the sequential target queue.
//!
//! A shaped effect first computes the set of caught units, sorted in
//! reading order (row, then column, then id) so the sequence is stable no
//! matter how the unit map was built or serialized. A non-empty set parks
//! a [`PendingAoe`] descriptor and runs one full combat exchange per
//! target through the pending-roll engine; the close-out emits a single
//! summary event.

use crate::actions::GameEvent;
use crate::combat::{self, CombatContext, CombatOrigin};
use crate::game::GameState;
use crate::grid::{Board, CellCoord, Direction, Metric};
use crate::unit::{AbilityId, UnitId, UnitState};
use serde::{Deserialize, Serialize};

/// The footprint of an area ability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AoeShape {
    /// Every cell within `radius` of `center` under `metric`
    Burst {
        center: CellCoord,
        radius: u32,
        metric: Metric,
    },
    /// A straight line of `length` cells leaving the caster
    Line { direction: Direction, length: u32 },
}

/// An area effect part-way through its target queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAoe {
    /// Casting unit; it attacks each queued target in turn
    pub caster: UnitId,
    /// Ability that produced the effect
    pub ability: AbilityId,
    /// Footprint the effect was cast with
    pub shape: AoeShape,
    /// Affected units in reading order
    pub queue: Vec<UnitId>,
    /// Index of the target currently being fought
    pub current: usize,
    /// Stealthed units the blast spotted for the caster's owner
    pub revealed: Vec<UnitId>,
    /// Damage actually dealt, per unit
    pub damaged: Vec<(UnitId, u32)>,
}

/// The board cells a shape covers, given the caster's position
pub(crate) fn shape_cells(board: &Board, origin: &CellCoord, shape: &AoeShape) -> Vec<CellCoord> {
    match shape {
        AoeShape::Burst {
            center,
            radius,
            metric,
        } => board.cells_within(center, *radius, *metric),
        AoeShape::Line { direction, length } => board.ray(origin, *direction, *length),
    }
}

/// Deployed units standing on the covered cells, excluding the caster,
/// filtered to enemies unless friendly fire is on and to units the extra
/// predicate accepts, in reading order.
pub(crate) fn affected_units<F>(
    state: &GameState,
    caster: UnitId,
    cells: &[CellCoord],
    friendly_fire: bool,
    filter: F,
) -> Vec<UnitId>
where
    F: Fn(&UnitState) -> bool,
{
    let Some(caster_unit) = state.units.get(&caster) else {
        return Vec::new();
    };
    let caster_owner = caster_unit.owner;

    let mut affected: Vec<(CellCoord, UnitId)> = state
        .units
        .values()
        .filter(|u| u.id != caster && u.is_deployed())
        .filter(|u| friendly_fire || u.owner != caster_owner)
        .filter(|&u| filter(u))
        .filter_map(|u| {
            u.position
                .filter(|p| cells.contains(p))
                .map(|p| (p, u.id))
        })
        .collect();
    affected.sort();
    affected.into_iter().map(|(_, id)| id).collect()
}

/// Start resolving an area effect. An empty target set resolves
/// immediately with a summary event and no continuation.
pub(crate) fn begin(
    state: &mut GameState,
    caster: UnitId,
    ability: AbilityId,
    shape: AoeShape,
    affected: Vec<UnitId>,
    revealed: Vec<UnitId>,
    events: &mut Vec<GameEvent>,
) {
    if affected.is_empty() {
        events.push(GameEvent::AoeResolved {
            caster,
            ability,
            affected,
            revealed,
            damaged: Vec::new(),
        });
        return;
    }
    state.pending_aoe = Some(PendingAoe {
        caster,
        ability,
        shape,
        queue: affected,
        current: 0,
        revealed,
        damaged: Vec::new(),
    });
    start_current_target(state, events);
}

/// The current target's combat closed; move to the next queue slot.
pub(crate) fn advance(state: &mut GameState, events: &mut Vec<GameEvent>) {
    if let Some(pending_aoe) = state.pending_aoe.as_mut() {
        pending_aoe.current += 1;
    }
    start_current_target(state, events);
}

/// Open combat against the first still-standing queued target at or after
/// `current`, or close the effect out if none remain (or the caster fell
/// to a counter mid-queue).
fn start_current_target(state: &mut GameState, events: &mut Vec<GameEvent>) {
    loop {
        let Some(pending_aoe) = state.pending_aoe.as_ref() else {
            return;
        };
        let caster = pending_aoe.caster;
        let caster_standing = state
            .units
            .get(&caster)
            .map(|u| u.is_deployed())
            .unwrap_or(false);
        if !caster_standing || pending_aoe.current >= pending_aoe.queue.len() {
            close_out(state, events);
            return;
        }

        let target = pending_aoe.queue[pending_aoe.current];
        let target_standing = state
            .units
            .get(&target)
            .map(|u| u.is_deployed())
            .unwrap_or(false);
        if target_standing {
            let ctx = CombatContext {
                attacker: caster,
                defender: target,
                bonus_damage: 0,
                tie_rounds: 0,
                origin: CombatOrigin::Area,
            };
            combat::begin_attack(state, ctx, events);
            return;
        }

        // Target died earlier in the chain; skip its slot
        if let Some(pending_aoe) = state.pending_aoe.as_mut() {
            pending_aoe.current += 1;
        }
    }
}

/// Emit the summary event and drop the descriptor. No-op when no area
/// effect is in progress.
pub(crate) fn close_out(state: &mut GameState, events: &mut Vec<GameEvent>) {
    if let Some(pending_aoe) = state.pending_aoe.take() {
        events.push(GameEvent::AoeResolved {
            caster: pending_aoe.caster,
            ability: pending_aoe.ability,
            affected: pending_aoe.queue,
            revealed: pending_aoe.revealed,
            damaged: pending_aoe.damaged,
        });
    }
}
