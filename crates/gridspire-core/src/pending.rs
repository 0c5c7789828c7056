//! The pending-roll continuation engine.
//!
//! A multi-step action (an attack, an area effect) cannot finish until a
//! player supplies a die roll or a choice. Instead of blocking, the engine
//! parks the whole resumable context in [`PendingRoll`] inside the game
//! state and returns. A later `resolvePendingRoll` intent looks up the
//! stored kind and hands the context plus the supplied input to that
//! kind's resume function, which either finalizes the action or parks the
//! next stage.
//!
//! The context is plain serialized data, never a closure: a suspended game
//! survives snapshotting and process restarts. At most one roll is ever
//! pending; the dispatcher rejects every other intent while one exists.

use crate::actions::GameEvent;
use crate::combat::{self, CombatContext};
use crate::game::{GameState, RuleError};
use crate::unit::{PlayerId, UnitId};
use serde::{Deserialize, Serialize};

/// The suspended stage of an in-progress action.
///
/// Each variant carries exactly what its resume step needs; nothing is
/// recomputed from scratch after a suspension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RollKind {
    /// Waiting for the attacker's dice
    AttackerRoll { combat: CombatContext },
    /// Waiting for the defender's owner to guard or roll
    DefenseChoice {
        combat: CombatContext,
        attacker_dice: (u8, u8),
    },
    /// Waiting for the defender's dice
    DefenderRoll {
        combat: CombatContext,
        attacker_dice: (u8, u8),
    },
    /// Sums were equal; waiting for the attacker's tie-break dice
    TieBreakAttacker { combat: CombatContext },
    /// Waiting for the defender's tie-break dice
    TieBreakDefender {
        combat: CombatContext,
        attacker_tiebreak: (u8, u8),
    },
}

impl RollKind {
    /// The stage tag reported in roll-requested events
    pub fn tag(&self) -> RollKindTag {
        match self {
            RollKind::AttackerRoll { .. } => RollKindTag::AttackerRoll,
            RollKind::DefenseChoice { .. } => RollKindTag::DefenseChoice,
            RollKind::DefenderRoll { .. } => RollKindTag::DefenderRoll,
            RollKind::TieBreakAttacker { .. } => RollKindTag::TieBreakAttacker,
            RollKind::TieBreakDefender { .. } => RollKindTag::TieBreakDefender,
        }
    }
}

/// Context-free stage discriminant for events and prompts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollKindTag {
    AttackerRoll,
    DefenseChoice,
    DefenderRoll,
    TieBreakAttacker,
    TieBreakDefender,
}

/// The single suspended operation, stored in the game state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRoll {
    /// Which stage is suspended, with its context
    pub kind: RollKind,
    /// The player expected to supply the next input
    pub awaiting: PlayerId,
    /// The unit whose action started this chain
    pub actor: UnitId,
}

/// The externally supplied input that resumes a pending roll
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RollInput {
    /// A pair of dice, each 1-6
    Dice { values: (u8, u8) },
    /// Answer to a defense-choice stage
    Defense { choice: DefenseChoice },
}

/// The defender's options when a guard is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefenseChoice {
    /// Spend a guard charge; the attack is turned away without a roll
    Guard,
    /// Decline the guard and roll defense dice
    Roll,
}

/// Park a new pending roll and announce it.
///
/// Requesting a roll while one is outstanding is a bug in a resolver, not
/// a user error; it cannot happen through the dispatcher.
pub(crate) fn request_roll(
    state: &mut GameState,
    awaiting: PlayerId,
    actor: UnitId,
    kind: RollKind,
    events: &mut Vec<GameEvent>,
) {
    debug_assert!(
        state.pending_roll.is_none(),
        "roll requested while one is already pending"
    );
    events.push(GameEvent::RollRequested {
        kind: kind.tag(),
        player: awaiting,
        unit: actor,
    });
    state.pending_roll = Some(PendingRoll {
        kind,
        awaiting,
        actor,
    });
}

/// Resume the suspended stage with the supplied input.
///
/// Dispatches on the stored kind; the stage function is a pure function of
/// the state, the stored context, and the input. It either finalizes the
/// chain or parks the next stage.
pub(crate) fn resolve(
    state: &mut GameState,
    player: PlayerId,
    input: RollInput,
    events: &mut Vec<GameEvent>,
) -> Result<(), RuleError> {
    let pending = state.pending_roll.take().ok_or(RuleError::NoRollPending)?;
    if pending.awaiting != player {
        return Err(RuleError::NotYourRoll);
    }

    match (pending.kind, input) {
        (RollKind::AttackerRoll { combat }, RollInput::Dice { values }) => {
            check_dice(values)?;
            combat::resume_attacker_roll(state, combat, values, events);
            Ok(())
        }
        (
            RollKind::DefenseChoice {
                combat,
                attacker_dice,
            },
            RollInput::Defense { choice },
        ) => {
            combat::resume_defense_choice(state, combat, attacker_dice, choice, events);
            Ok(())
        }
        (
            RollKind::DefenderRoll {
                combat,
                attacker_dice,
            },
            RollInput::Dice { values },
        ) => {
            check_dice(values)?;
            combat::resume_defender_roll(state, combat, attacker_dice, values, events);
            Ok(())
        }
        (RollKind::TieBreakAttacker { combat }, RollInput::Dice { values }) => {
            check_dice(values)?;
            combat::resume_tiebreak_attacker(state, combat, values, events);
            Ok(())
        }
        (
            RollKind::TieBreakDefender {
                combat,
                attacker_tiebreak,
            },
            RollInput::Dice { values },
        ) => {
            check_dice(values)?;
            combat::resume_tiebreak_defender(state, combat, attacker_tiebreak, values, events);
            Ok(())
        }
        _ => Err(RuleError::WrongRollInput),
    }
}

fn check_dice(values: (u8, u8)) -> Result<(), RuleError> {
    if (1..=6).contains(&values.0) && (1..=6).contains(&values.1) {
        Ok(())
    } else {
        Err(RuleError::InvalidDice)
    }
}
