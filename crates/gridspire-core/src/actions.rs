//! Player intents and the events they produce.
//!
//! The `Action` enum is the complete inbound vocabulary of the engine and
//! the `GameEvent` enum the complete outbound one. Events are the only
//! channel through which outside layers observe effects; the serialized
//! action tags are wire-stable.

use crate::grid::{CellCoord, Direction};
use crate::pending::{RollInput, RollKindTag};
use crate::unit::{AbilityId, PlayerId, UnitId};
use serde::{Deserialize, Serialize};

/// All intents a player can submit.
///
/// Tags and payload shape are consumed by the transport layer; variant
/// names serialize in camelCase and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Action {
    // ==================== Placement Phase ====================
    /// Deploy one of your units into your deployment zone
    PlaceUnit { unit: UnitId, at: CellCoord },

    // ==================== Battle Phase ====================
    /// Activate a unit for this turn, resetting its turn slots
    UnitStartTurn { unit: UnitId },
    /// Move the active unit to a destination cell
    Move { unit: UnitId, to: CellCoord },
    /// Ask for the active unit's legal destinations (no state change)
    RequestMoveOptions { unit: UnitId },
    /// Open an attack against a target unit
    Attack { unit: UnitId, target: UnitId },
    /// Activate an ability at a target
    UseAbility {
        unit: UnitId,
        ability: AbilityId,
        target: AbilityTarget,
    },
    /// Enter stealth
    EnterStealth { unit: UnitId },
    /// Scan for stealthed enemies near the unit
    SearchStealth { unit: UnitId },
    /// End your turn
    EndTurn,

    // ==================== Continuation ====================
    /// Supply the die roll or choice the engine is waiting on
    ResolvePendingRoll { input: RollInput },
}

/// Target payload of a [`UseAbility`](Action::UseAbility) intent. Which
/// variant is legal depends on the ability kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AbilityTarget {
    /// A board cell (blast center)
    Cell(CellCoord),
    /// A single unit
    Unit(UnitId),
    /// A compass direction (lines and charges)
    Direction(Direction),
    /// Self-targeted or untargeted
    None,
}

/// Events emitted by accepted actions, in resolution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GameEvent {
    // ==================== Lifecycle ====================
    /// The placement phase opened
    PlacementStarted,
    /// All units placed; the battle begins
    BattleStarted { first_player: PlayerId },
    /// A new round began (every player has had a turn)
    RoundStarted { round: u32 },
    /// A unit was activated for its owner's turn
    UnitActivated { unit: UnitId, player: PlayerId },
    /// Turn passed to the next player
    TurnEnded {
        player: PlayerId,
        next_player: PlayerId,
    },
    /// The battle is over
    BattleEnded { winner: Option<PlayerId> },

    // ==================== Board ====================
    /// A unit was deployed
    UnitPlaced {
        unit: UnitId,
        player: PlayerId,
        at: CellCoord,
    },
    /// A unit moved
    UnitMoved {
        unit: UnitId,
        from: CellCoord,
        to: CellCoord,
    },
    /// Legal destinations for a unit, in reading order
    MoveOptionsGenerated {
        unit: UnitId,
        options: Vec<CellCoord>,
    },

    // ==================== Combat ====================
    /// The engine is waiting for an external roll or choice
    RollRequested {
        kind: RollKindTag,
        player: PlayerId,
        unit: UnitId,
    },
    /// One attacker-vs-defender exchange finished.
    ///
    /// `attacker_dice`/`defender_dice` are the deciding pair (the final
    /// tie-break dice when `tie_rounds > 0`). `struck` is the loser, or
    /// `None` when the defender guarded.
    AttackResolved {
        attacker: UnitId,
        defender: UnitId,
        attacker_dice: (u8, u8),
        defender_dice: Option<(u8, u8)>,
        guarded: bool,
        tie_rounds: u32,
        damage: u32,
        struck: Option<UnitId>,
        remaining_hp: Option<i32>,
    },
    /// A unit's hit points reached zero
    UnitDied { unit: UnitId },

    // ==================== Stealth ====================
    /// A unit vanished into stealth
    StealthEntered { unit: UnitId },
    /// A unit's stealth broke; everyone sees it again
    StealthRevealed { unit: UnitId },
    /// A search finished; `spotted` lists newly known enemies
    StealthSearchResolved { unit: UnitId, spotted: Vec<UnitId> },

    // ==================== Abilities ====================
    /// An ability was activated
    AbilityUsed {
        unit: UnitId,
        ability: AbilityId,
        target: AbilityTarget,
    },
    /// An area effect finished resolving every queued target
    AoeResolved {
        caster: UnitId,
        ability: AbilityId,
        affected: Vec<UnitId>,
        revealed: Vec<UnitId>,
        damaged: Vec<(UnitId, u32)>,
    },
}
