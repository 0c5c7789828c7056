//! The attacker-vs-defender combat state machine.
//!
//! One exchange runs: attacker roll -> (optional guard choice) -> defender
//! roll -> compare. Equal sums enter a tie-break loop where only the fresh
//! dice count. The loser takes the winner's damage plus the winner's
//! stacked bonus.
//!
//! Every stage suspends through the pending-roll engine, so each resume
//! function here receives the stored context and the externally supplied
//! input, finishes its step, and either parks the next stage or finalizes
//! the exchange and hands control to [`continue_chain`], which drives any
//! pending area effect or deferred-attack queue.

use crate::actions::GameEvent;
use crate::aoe;
use crate::game::{GamePhase, GameState};
use crate::pending::{self, DefenseChoice, RollKind};
use crate::unit::{AbilityId, SlotCosts, UnitId};
use serde::{Deserialize, Serialize};

/// What every combat stage threads forward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatContext {
    pub attacker: UnitId,
    pub defender: UnitId,
    /// Bonus stacked onto the attacker's damage if the attacker wins
    pub bonus_damage: u32,
    /// Completed tie-break rounds so far
    pub tie_rounds: u32,
    /// Where this exchange came from, for chain bookkeeping
    pub origin: CombatOrigin,
}

/// How an exchange was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombatOrigin {
    /// A plain attack intent
    Direct,
    /// Popped from the deferred-attack queue
    Queued(QueueKind),
    /// One target of an in-progress area effect
    Area,
}

/// Why an attack sits in the deferred queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueKind {
    /// An ordinary attack deferred behind the current exchange
    Normal,
    /// Earned by charging past the defender
    PathStrike,
    /// Triggered on allies by an area ability
    AoeTriggered,
}

/// A deferred attack, validated again when its turn comes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAttack {
    pub attacker: UnitId,
    pub defender: UnitId,
    pub kind: QueueKind,
    /// Skip the range check when starting
    pub ignore_range: bool,
    /// Skip the stealth-knowledge check when starting
    pub ignore_stealth: bool,
    /// Bonus damage carried into the exchange
    pub bonus_damage: u32,
    /// Ability that granted the bonus, if any
    pub bonus_source: Option<AbilityId>,
    /// Whether starting spends the attacker's attack slot
    pub consumes_slots: bool,
}

/// Open an exchange by asking the attacker's owner for dice.
pub(crate) fn begin_attack(
    state: &mut GameState,
    ctx: CombatContext,
    events: &mut Vec<GameEvent>,
) {
    let Some(attacker) = state.units.get(&ctx.attacker) else {
        return;
    };
    let awaiting = attacker.owner;
    let actor = ctx.attacker;
    pending::request_roll(
        state,
        awaiting,
        actor,
        RollKind::AttackerRoll { combat: ctx },
        events,
    );
}

/// The attacker's dice arrived. Offer the defender a guard if its class
/// and charge pool allow one, otherwise ask for defense dice.
pub(crate) fn resume_attacker_roll(
    state: &mut GameState,
    ctx: CombatContext,
    dice: (u8, u8),
    events: &mut Vec<GameEvent>,
) {
    if !combatants_standing(state, &ctx) {
        continue_chain(state, events);
        return;
    }
    let Some(defender) = state.units.get(&ctx.defender) else {
        continue_chain(state, events);
        return;
    };
    let awaiting = defender.owner;
    let actor = ctx.attacker;
    let kind = if defender.usable_guard().is_some() {
        RollKind::DefenseChoice {
            combat: ctx,
            attacker_dice: dice,
        }
    } else {
        RollKind::DefenderRoll {
            combat: ctx,
            attacker_dice: dice,
        }
    };
    pending::request_roll(state, awaiting, actor, kind, events);
}

/// The defender's owner picked guard-or-roll.
pub(crate) fn resume_defense_choice(
    state: &mut GameState,
    ctx: CombatContext,
    attacker_dice: (u8, u8),
    choice: DefenseChoice,
    events: &mut Vec<GameEvent>,
) {
    if !combatants_standing(state, &ctx) {
        continue_chain(state, events);
        return;
    }

    if choice == DefenseChoice::Guard {
        let guard = state
            .units
            .get(&ctx.defender)
            .and_then(|d| d.usable_guard())
            .map(|a| (a.id.clone(), a.charge_cost));
        if let Some((guard_id, cost)) = guard {
            if let Some(defender) = state.units.get_mut(&ctx.defender) {
                defender.spend_charges(&guard_id, cost);
            }
            events.push(GameEvent::AttackResolved {
                attacker: ctx.attacker,
                defender: ctx.defender,
                attacker_dice,
                defender_dice: None,
                guarded: true,
                tie_rounds: ctx.tie_rounds,
                damage: 0,
                struck: None,
                remaining_hp: None,
            });
            continue_chain(state, events);
            return;
        }
        // Guard evaporated between stages; fall through to a normal roll.
    }

    let Some(defender) = state.units.get(&ctx.defender) else {
        continue_chain(state, events);
        return;
    };
    let awaiting = defender.owner;
    let actor = ctx.attacker;
    pending::request_roll(
        state,
        awaiting,
        actor,
        RollKind::DefenderRoll {
            combat: ctx,
            attacker_dice,
        },
        events,
    );
}

/// The defender's dice arrived: compare, or enter the tie-break loop.
pub(crate) fn resume_defender_roll(
    state: &mut GameState,
    mut ctx: CombatContext,
    attacker_dice: (u8, u8),
    defender_dice: (u8, u8),
    events: &mut Vec<GameEvent>,
) {
    if !combatants_standing(state, &ctx) {
        continue_chain(state, events);
        return;
    }
    if sum(attacker_dice) == sum(defender_dice) {
        ctx.tie_rounds += 1;
        request_tiebreak(state, ctx, events);
        return;
    }
    decide(state, ctx, attacker_dice, defender_dice, events);
}

/// The attacker's tie-break dice arrived; now the defender rolls.
pub(crate) fn resume_tiebreak_attacker(
    state: &mut GameState,
    ctx: CombatContext,
    dice: (u8, u8),
    events: &mut Vec<GameEvent>,
) {
    if !combatants_standing(state, &ctx) {
        continue_chain(state, events);
        return;
    }
    let Some(defender) = state.units.get(&ctx.defender) else {
        continue_chain(state, events);
        return;
    };
    let awaiting = defender.owner;
    let actor = ctx.attacker;
    pending::request_roll(
        state,
        awaiting,
        actor,
        RollKind::TieBreakDefender {
            combat: ctx,
            attacker_tiebreak: dice,
        },
        events,
    );
}

/// Both tie-break dice are in: only they count for this comparison.
pub(crate) fn resume_tiebreak_defender(
    state: &mut GameState,
    mut ctx: CombatContext,
    attacker_tiebreak: (u8, u8),
    defender_dice: (u8, u8),
    events: &mut Vec<GameEvent>,
) {
    if !combatants_standing(state, &ctx) {
        continue_chain(state, events);
        return;
    }
    if sum(attacker_tiebreak) == sum(defender_dice) {
        ctx.tie_rounds += 1;
        request_tiebreak(state, ctx, events);
        return;
    }
    decide(state, ctx, attacker_tiebreak, defender_dice, events);
}

fn request_tiebreak(state: &mut GameState, ctx: CombatContext, events: &mut Vec<GameEvent>) {
    let Some(attacker) = state.units.get(&ctx.attacker) else {
        continue_chain(state, events);
        return;
    };
    let awaiting = attacker.owner;
    let actor = ctx.attacker;
    pending::request_roll(
        state,
        awaiting,
        actor,
        RollKind::TieBreakAttacker { combat: ctx },
        events,
    );
}

/// Unequal sums: the higher side wins, the loser takes damage.
fn decide(
    state: &mut GameState,
    ctx: CombatContext,
    attacker_dice: (u8, u8),
    defender_dice: (u8, u8),
    events: &mut Vec<GameEvent>,
) {
    let attacker_wins = sum(attacker_dice) > sum(defender_dice);
    let (winner_id, loser_id) = if attacker_wins {
        (ctx.attacker, ctx.defender)
    } else {
        (ctx.defender, ctx.attacker)
    };

    let Some(winner) = state.units.get(&winner_id) else {
        continue_chain(state, events);
        return;
    };
    let damage = winner.damage + if attacker_wins { ctx.bonus_damage } else { 0 };

    let Some(loser) = state.units.get_mut(&loser_id) else {
        continue_chain(state, events);
        return;
    };
    let died = loser.apply_damage(damage);
    let remaining_hp = loser.hp;

    events.push(GameEvent::AttackResolved {
        attacker: ctx.attacker,
        defender: ctx.defender,
        attacker_dice,
        defender_dice: Some(defender_dice),
        guarded: false,
        tie_rounds: ctx.tie_rounds,
        damage,
        struck: Some(loser_id),
        remaining_hp: Some(remaining_hp),
    });

    // An area effect tallies damage dealt to its queued target
    if ctx.origin == CombatOrigin::Area && loser_id == ctx.defender {
        if let Some(pending_aoe) = state.pending_aoe.as_mut() {
            pending_aoe.damaged.push((loser_id, damage));
        }
    }

    if died {
        state.mark_dead(loser_id, events);
    }

    continue_chain(state, events);
}

/// After a finalized (or skipped) exchange: advance a pending area effect,
/// then start the next deferred attack, if any.
pub(crate) fn continue_chain(state: &mut GameState, events: &mut Vec<GameEvent>) {
    if !matches!(state.phase, GamePhase::Battle) {
        state.combat_queue.clear();
        state.pending_aoe = None;
        return;
    }
    if state.pending_aoe.is_some() {
        aoe::advance(state, events);
        if state.pending_roll.is_some() {
            return;
        }
    }
    if state.pending_roll.is_none() {
        start_next_queued(state, events);
    }
}

/// Pop deferred attacks until one passes its start-time checks, then open
/// it. Entries whose combatants died or drifted out of legality are
/// dropped silently.
pub(crate) fn start_next_queued(state: &mut GameState, events: &mut Vec<GameEvent>) {
    while !state.combat_queue.is_empty() {
        let entry = state.combat_queue.remove(0);
        if !queued_entry_ready(state, &entry) {
            continue;
        }
        let Some(attacker) = state.units.get_mut(&entry.attacker) else {
            continue;
        };
        if entry.consumes_slots {
            if !attacker.economy.can_spend(SlotCosts::ATTACK) {
                continue;
            }
            attacker.economy = attacker.economy.spend(SlotCosts::ATTACK);
        }
        // Opening the exchange is this unit's attack; its stacked bonuses
        // ride along and are used up, just as on a direct attack
        let bonus_damage = entry.bonus_damage + attacker.take_damage_bonus();
        let ctx = CombatContext {
            attacker: entry.attacker,
            defender: entry.defender,
            bonus_damage,
            tie_rounds: 0,
            origin: CombatOrigin::Queued(entry.kind),
        };
        begin_attack(state, ctx, events);
        return;
    }
}

fn queued_entry_ready(state: &GameState, entry: &QueuedAttack) -> bool {
    let (Some(attacker), Some(defender)) = (
        state.units.get(&entry.attacker),
        state.units.get(&entry.defender),
    ) else {
        return false;
    };
    if !attacker.is_deployed() || !defender.is_deployed() {
        return false;
    }
    if !entry.ignore_range {
        let (Some(from), Some(to)) = (attacker.position, defender.position) else {
            return false;
        };
        let dist = from.chebyshev(&to);
        if dist == 0 || dist > attacker.attack_range {
            return false;
        }
    }
    if !entry.ignore_stealth && !state.knows_about(attacker.owner, entry.defender) {
        return false;
    }
    true
}

fn combatants_standing(state: &GameState, ctx: &CombatContext) -> bool {
    let attacker_up = state
        .units
        .get(&ctx.attacker)
        .map(|u| u.is_deployed())
        .unwrap_or(false);
    let defender_up = state
        .units
        .get(&ctx.defender)
        .map(|u| u.is_deployed())
        .unwrap_or(false);
    attacker_up && defender_up
}

fn sum(dice: (u8, u8)) -> u8 {
    dice.0 + dice.1
}
