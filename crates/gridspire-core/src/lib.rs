//! Gridspire - a turn-based grid hero tactics engine
//!
//! This crate provides the deterministic action-resolution core for
//! Gridspire, including:
//! - Grid geometry for the rectangular battle board
//! - Unit state with per-turn action slots and ability charge pools
//! - A dice-comparison combat resolver with tie-breaks and guards
//! - Area-effect targeting with reading-order sequential resolution
//! - The pending-roll continuation engine that suspends multi-step
//!   actions awaiting externally supplied dice or choices
//!
//! # Architecture
//!
//! The engine is a single-threaded, message-in/state-out state machine.
//! Every operation takes a [`GameState`], validates the intent, and
//! returns a fresh state plus an ordered event list; suspended work lives
//! entirely in serializable pending descriptors, so a game survives
//! snapshotting mid-action. Transport, persistence, rendering, and hero
//! catalogs sit outside this crate and drive it through
//! [`GameState::apply_action`].
//!
//! # Modules
//!
//! - [`grid`]: cells, directions, metrics, and the board
//! - [`unit`]: units, turn economy, abilities, active effects
//! - [`actions`]: the wire action and event vocabulary
//! - [`pending`]: the pending-roll continuation engine
//! - [`combat`]: the attacker-vs-defender state machine
//! - [`aoe`]: area-effect shapes and the sequential target queue
//! - [`game`]: the aggregate state and action dispatcher

pub mod actions;
pub mod aoe;
pub mod combat;
pub mod game;
pub mod grid;
pub mod pending;
pub mod unit;

// Re-export commonly used types
pub use actions::{AbilityTarget, Action, GameEvent};
pub use aoe::{AoeShape, PendingAoe};
pub use combat::{CombatContext, CombatOrigin, QueueKind, QueuedAttack};
pub use game::{GamePhase, GameState, RuleError, SEARCH_RADIUS, STEALTH_DURATION};
pub use grid::{Board, CellCoord, Direction, Metric};
pub use pending::{DefenseChoice, PendingRoll, RollInput, RollKind, RollKindTag};
pub use unit::{
    AbilityDef, AbilityId, AbilityKind, ActiveEffect, HeroClass, PlayerId, SlotCosts,
    StealthState, TurnEconomy, UnitId, UnitSpec, UnitState,
};
