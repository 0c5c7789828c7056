//! Core game state machine.
//!
//! This module contains the `GameState` aggregate and the action
//! dispatcher. Every public operation takes the state, validates the
//! intent, and returns a fresh state plus the events the transition
//! produced; nothing is ever mutated through an alias. Illegal intents are
//! silently rejected: the caller gets back an unchanged state and no
//! events, so the engine is safe to drive with stale or replayed
//! messages. The precise rejection reason is available through the
//! read-only [`GameState::check_action`] query.

use crate::actions::{AbilityTarget, Action, GameEvent};
use crate::aoe::{self, AoeShape, PendingAoe};
use crate::combat::{self, CombatContext, CombatOrigin, QueueKind, QueuedAttack};
use crate::grid::{Board, CellCoord, Metric};
use crate::pending::{self, DefenseChoice, PendingRoll, RollInput, RollKind};
use crate::unit::{
    AbilityId, AbilityKind, ActiveEffect, PlayerId, SlotCosts, StealthState, UnitId, UnitSpec,
    UnitState,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Turns a unit stays hidden after entering stealth
pub const STEALTH_DURATION: u32 = 3;

/// Chebyshev radius scanned by a stealth search
pub const SEARCH_RADIUS: u32 = 2;

/// Game phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GamePhase {
    /// Players assembling; armies exist but the board is empty
    Lobby,
    /// Units being deployed into their zones
    Placement,
    /// The fight proper
    Battle,
    /// One side (or nobody) is left standing
    Ended { winner: Option<PlayerId> },
}

/// Why an intent was rejected. Only surfaced through [`GameState::check_action`];
/// the mutating path stays silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RuleError {
    #[error("Not your turn")]
    NotYourTurn,

    #[error("Invalid action for current phase")]
    WrongPhase,

    #[error("No such unit")]
    NoSuchUnit,

    #[error("Unit belongs to another player")]
    UnitNotYours,

    #[error("Unit is dead")]
    UnitDead,

    #[error("Unit is not on the board")]
    UnitNotPlaced,

    #[error("Unit is already placed")]
    UnitAlreadyPlaced,

    #[error("Unit is not the active unit")]
    UnitNotActive,

    #[error("A unit was already activated this turn")]
    UnitAlreadyActivated,

    #[error("A roll is pending")]
    RollPending,

    #[error("No roll is pending")]
    NoRollPending,

    #[error("Another player must supply this roll")]
    NotYourRoll,

    #[error("Wrong input for the pending roll")]
    WrongRollInput,

    #[error("Dice values must be between 1 and 6")]
    InvalidDice,

    #[error("That turn slot is already spent")]
    SlotAlreadySpent,

    #[error("Not enough ability charges")]
    InsufficientCharges,

    #[error("Out of range")]
    OutOfRange,

    #[error("Cell is outside the board")]
    OffBoard,

    #[error("Cell is occupied")]
    CellOccupied,

    #[error("Outside your deployment zone")]
    OutsideDeploymentZone,

    #[error("Target is not visible")]
    TargetNotVisible,

    #[error("Invalid target")]
    InvalidTarget,

    #[error("Already stealthed")]
    AlreadyStealthed,

    #[error("Unknown ability")]
    UnknownAbility,

    #[error("That ability cannot be activated directly")]
    NotActivatable,
}

/// The complete game state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    /// The battle board
    pub board: Board,
    /// Every unit ever created, keyed by id; dead units stay here
    pub units: BTreeMap<UnitId, UnitState>,
    /// Current game phase
    pub phase: GamePhase,
    /// Player whose turn it is
    pub current_player: PlayerId,
    /// Number of players (2-4)
    pub player_count: u8,
    /// Turn number (starts at 1 when the battle begins)
    pub turn_number: u32,
    /// Round number; bumps when the turn order wraps
    pub round: u32,
    /// The unit activated this turn, if any
    pub active_unit: Option<UnitId>,
    /// The single suspended operation, if any
    pub pending_roll: Option<PendingRoll>,
    /// Deferred attacks waiting behind the current exchange
    pub combat_queue: Vec<QueuedAttack>,
    /// An area effect part-way through its target queue
    pub pending_aoe: Option<PendingAoe>,
    /// Stealthed enemy units each player currently knows about
    pub knowledge: BTreeMap<PlayerId, BTreeSet<UnitId>>,
    /// Last seen positions of units that slipped out of knowledge
    pub shadows: BTreeMap<UnitId, CellCoord>,
    /// Player who opens each round
    first_player: PlayerId,
    /// Random seed recorded at creation (for reproducing the seating draw)
    rng_seed: u64,
}

impl GameState {
    /// Create a new game in the lobby phase from catalog-supplied armies.
    /// Unit ids are assigned in army order starting from 1.
    pub fn new(rows: i32, cols: i32, armies: Vec<Vec<UnitSpec>>) -> Self {
        let player_count = armies.len() as u8;
        assert!(
            (2..=4).contains(&player_count),
            "Must have 2-4 players"
        );

        let mut units = BTreeMap::new();
        let mut next_id: UnitId = 1;
        for (owner, specs) in armies.into_iter().enumerate() {
            assert!(!specs.is_empty(), "Every player needs at least one unit");
            for spec in specs {
                units.insert(next_id, UnitState::new(next_id, owner as PlayerId, spec));
                next_id += 1;
            }
        }

        let mut rng = rand::thread_rng();
        let rng_seed: u64 = rng.gen();
        let first_player = rng.gen_range(0..player_count);

        let knowledge = (0..player_count).map(|p| (p, BTreeSet::new())).collect();

        Self {
            board: Board::new(rows, cols),
            units,
            phase: GamePhase::Lobby,
            current_player: first_player,
            player_count,
            turn_number: 0,
            round: 0,
            active_unit: None,
            pending_roll: None,
            combat_queue: Vec::new(),
            pending_aoe: None,
            knowledge,
            shadows: BTreeMap::new(),
            first_player,
            rng_seed,
        }
    }

    /// Open the placement phase. Called by the room layer once every
    /// player is ready; not part of the wire vocabulary.
    pub fn begin_placement(&self) -> (GameState, Vec<GameEvent>) {
        if !matches!(self.phase, GamePhase::Lobby) {
            return (self.clone(), Vec::new());
        }
        let mut next = self.clone();
        next.phase = GamePhase::Placement;
        next.current_player = next.first_player;
        (next, vec![GameEvent::PlacementStarted])
    }

    /// Get a unit by id
    pub fn unit(&self, id: UnitId) -> Option<&UnitState> {
        self.units.get(&id)
    }

    /// The deployed unit standing on a cell, if any
    pub fn unit_at(&self, cell: &CellCoord) -> Option<&UnitState> {
        self.units
            .values()
            .find(|u| u.is_deployed() && u.position == Some(*cell))
    }

    /// Living units a player still has
    pub fn alive_count(&self, player: PlayerId) -> usize {
        self.units
            .values()
            .filter(|u| u.owner == player && u.alive)
            .count()
    }

    /// Whether the game has ended
    pub fn is_finished(&self) -> bool {
        matches!(self.phase, GamePhase::Ended { .. })
    }

    /// The winner, if the game has ended with one
    pub fn winner(&self) -> Option<PlayerId> {
        match self.phase {
            GamePhase::Ended { winner } => winner,
            _ => None,
        }
    }

    /// The seed recorded when the game was created
    pub fn rng_seed(&self) -> u64 {
        self.rng_seed
    }

    /// Whether `player` can see `unit` well enough to target it.
    /// Own units and unhidden units are always known; stealthed enemies
    /// only after being spotted.
    pub fn knows_about(&self, player: PlayerId, unit: UnitId) -> bool {
        let Some(u) = self.units.get(&unit) else {
            return false;
        };
        if u.owner == player || !u.stealth.active {
            return true;
        }
        self.knowledge
            .get(&player)
            .map(|known| known.contains(&unit))
            .unwrap_or(false)
    }

    // ==================== Dispatcher ====================

    /// Apply an intent. Returns the next state and the events the
    /// transition produced. Illegal intents return the state unchanged
    /// with no events.
    pub fn apply_action(&self, player: PlayerId, action: Action) -> (GameState, Vec<GameEvent>) {
        match self.try_apply(player, action) {
            Ok(next) => next,
            Err(_) => (self.clone(), Vec::new()),
        }
    }

    /// Validate an intent without applying it, surfacing the exact
    /// rejection reason. `Ok(())` means `apply_action` would accept it.
    pub fn check_action(&self, player: PlayerId, action: &Action) -> Result<(), RuleError> {
        self.try_apply(player, action.clone()).map(|_| ())
    }

    fn try_apply(
        &self,
        player: PlayerId,
        action: Action,
    ) -> Result<(GameState, Vec<GameEvent>), RuleError> {
        // Re-entrancy guard: while a roll is pending, resolving it is the
        // only thing the engine will do
        if self.pending_roll.is_some() && !matches!(action, Action::ResolvePendingRoll { .. }) {
            return Err(RuleError::RollPending);
        }

        let mut next = self.clone();
        let mut events = Vec::new();

        match action {
            Action::PlaceUnit { unit, at } => {
                next.handle_place_unit(player, unit, at, &mut events)?
            }
            Action::UnitStartTurn { unit } => {
                next.handle_unit_start_turn(player, unit, &mut events)?
            }
            Action::Move { unit, to } => next.handle_move(player, unit, to, &mut events)?,
            Action::RequestMoveOptions { unit } => {
                next.handle_move_options(player, unit, &mut events)?
            }
            Action::Attack { unit, target } => {
                next.handle_attack(player, unit, target, &mut events)?
            }
            Action::UseAbility {
                unit,
                ability,
                target,
            } => next.handle_use_ability(player, unit, ability, target, &mut events)?,
            Action::EnterStealth { unit } => {
                next.handle_enter_stealth(player, unit, &mut events)?
            }
            Action::SearchStealth { unit } => {
                next.handle_search_stealth(player, unit, &mut events)?
            }
            Action::EndTurn => next.handle_end_turn(player, &mut events)?,
            Action::ResolvePendingRoll { input } => {
                pending::resolve(&mut next, player, input, &mut events)?
            }
        }

        Ok((next, events))
    }

    /// Shared validation for battle-phase intents
    fn battle_actor_checks(
        &self,
        player: PlayerId,
        unit: UnitId,
        require_active: bool,
    ) -> Result<(), RuleError> {
        if !matches!(self.phase, GamePhase::Battle) {
            return Err(RuleError::WrongPhase);
        }
        if player != self.current_player {
            return Err(RuleError::NotYourTurn);
        }
        let u = self.units.get(&unit).ok_or(RuleError::NoSuchUnit)?;
        if u.owner != player {
            return Err(RuleError::UnitNotYours);
        }
        if !u.alive {
            return Err(RuleError::UnitDead);
        }
        if u.position.is_none() {
            return Err(RuleError::UnitNotPlaced);
        }
        if require_active && self.active_unit != Some(unit) {
            return Err(RuleError::UnitNotActive);
        }
        Ok(())
    }

    // ==================== Placement ====================

    fn handle_place_unit(
        &mut self,
        player: PlayerId,
        unit: UnitId,
        at: CellCoord,
        events: &mut Vec<GameEvent>,
    ) -> Result<(), RuleError> {
        if !matches!(self.phase, GamePhase::Placement) {
            return Err(RuleError::WrongPhase);
        }
        if player != self.current_player {
            return Err(RuleError::NotYourTurn);
        }
        let u = self.units.get(&unit).ok_or(RuleError::NoSuchUnit)?;
        if u.owner != player {
            return Err(RuleError::UnitNotYours);
        }
        if u.position.is_some() {
            return Err(RuleError::UnitAlreadyPlaced);
        }
        if !self.board.contains(&at) {
            return Err(RuleError::OffBoard);
        }
        if !self.board.in_deployment_zone(player, &at) {
            return Err(RuleError::OutsideDeploymentZone);
        }
        if self.unit_at(&at).is_some() {
            return Err(RuleError::CellOccupied);
        }

        if let Some(u) = self.units.get_mut(&unit) {
            u.position = Some(at);
        }
        events.push(GameEvent::UnitPlaced { unit, player, at });

        self.advance_placement(events);
        Ok(())
    }

    /// Hand placement to the next player with units in reserve, or start
    /// the battle once every unit stands on the board.
    fn advance_placement(&mut self, events: &mut Vec<GameEvent>) {
        let unplaced = |state: &GameState, p: PlayerId| {
            state
                .units
                .values()
                .any(|u| u.owner == p && u.position.is_none())
        };

        if (0..self.player_count).all(|p| !unplaced(self, p)) {
            self.phase = GamePhase::Battle;
            self.current_player = self.first_player;
            self.turn_number = 1;
            self.round = 1;
            events.push(GameEvent::BattleStarted {
                first_player: self.first_player,
            });
            events.push(GameEvent::RoundStarted { round: 1 });
            return;
        }

        let mut candidate = (self.current_player + 1) % self.player_count;
        for _ in 0..self.player_count {
            if unplaced(self, candidate) {
                break;
            }
            candidate = (candidate + 1) % self.player_count;
        }
        self.current_player = candidate;
    }

    // ==================== Turn management ====================

    fn handle_unit_start_turn(
        &mut self,
        player: PlayerId,
        unit: UnitId,
        events: &mut Vec<GameEvent>,
    ) -> Result<(), RuleError> {
        self.battle_actor_checks(player, unit, false)?;
        if self.active_unit.is_some() {
            return Err(RuleError::UnitAlreadyActivated);
        }

        self.active_unit = Some(unit);

        let mut stealth_expired = false;
        if let Some(u) = self.units.get_mut(&unit) {
            u.economy = u.economy.reset();
            if u.stealth.active {
                u.stealth.rounds_left = u.stealth.rounds_left.saturating_sub(1);
                stealth_expired = u.stealth.rounds_left == 0;
            }
        }
        events.push(GameEvent::UnitActivated { unit, player });
        if stealth_expired {
            self.reveal_to_all(unit, events);
        }
        Ok(())
    }

    fn handle_end_turn(
        &mut self,
        player: PlayerId,
        events: &mut Vec<GameEvent>,
    ) -> Result<(), RuleError> {
        if !matches!(self.phase, GamePhase::Battle) {
            return Err(RuleError::WrongPhase);
        }
        if player != self.current_player {
            return Err(RuleError::NotYourTurn);
        }

        self.active_unit = None;

        // Skip players with nothing left alive
        let mut next_player = (player + 1) % self.player_count;
        for _ in 0..self.player_count {
            if self.alive_count(next_player) > 0 {
                break;
            }
            next_player = (next_player + 1) % self.player_count;
        }
        self.current_player = next_player;
        self.turn_number += 1;

        events.push(GameEvent::TurnEnded {
            player,
            next_player,
        });

        if next_player == self.first_player {
            self.round += 1;
            events.push(GameEvent::RoundStarted { round: self.round });
        }
        Ok(())
    }

    // ==================== Movement ====================

    fn handle_move(
        &mut self,
        player: PlayerId,
        unit: UnitId,
        to: CellCoord,
        events: &mut Vec<GameEvent>,
    ) -> Result<(), RuleError> {
        self.battle_actor_checks(player, unit, true)?;
        let u = self.units.get(&unit).ok_or(RuleError::NoSuchUnit)?;
        let from = u.position.ok_or(RuleError::UnitNotPlaced)?;

        if !self.board.contains(&to) {
            return Err(RuleError::OffBoard);
        }
        let dist = from.chebyshev(&to);
        if dist == 0 || dist > u.move_range {
            return Err(RuleError::OutOfRange);
        }
        if self.unit_at(&to).is_some() {
            return Err(RuleError::CellOccupied);
        }
        let use_slot = u.economy.can_spend(SlotCosts::MOVEMENT);
        if !use_slot && !u.has_decree_move() {
            return Err(RuleError::SlotAlreadySpent);
        }

        if let Some(u) = self.units.get_mut(&unit) {
            if use_slot {
                u.economy = u.economy.spend(SlotCosts::MOVEMENT);
            } else {
                u.take_decree_move();
            }
            u.position = Some(to);
        }
        events.push(GameEvent::UnitMoved { unit, from, to });
        Ok(())
    }

    fn handle_move_options(
        &mut self,
        player: PlayerId,
        unit: UnitId,
        events: &mut Vec<GameEvent>,
    ) -> Result<(), RuleError> {
        self.battle_actor_checks(player, unit, true)?;
        let options = self.legal_moves(unit);
        events.push(GameEvent::MoveOptionsGenerated { unit, options });
        Ok(())
    }

    /// Cells the unit could move to, ignoring whether its movement slot is
    /// still available. Reading order.
    pub fn legal_moves(&self, unit: UnitId) -> Vec<CellCoord> {
        let Some(u) = self.units.get(&unit) else {
            return Vec::new();
        };
        if !u.is_deployed() {
            return Vec::new();
        }
        let Some(from) = u.position else {
            return Vec::new();
        };
        self.board
            .cells_within(&from, u.move_range, Metric::Chebyshev)
            .into_iter()
            .filter(|cell| *cell != from && self.unit_at(cell).is_none())
            .collect()
    }

    // ==================== Combat entry ====================

    fn handle_attack(
        &mut self,
        player: PlayerId,
        unit: UnitId,
        target: UnitId,
        events: &mut Vec<GameEvent>,
    ) -> Result<(), RuleError> {
        self.battle_actor_checks(player, unit, true)?;
        let attacker = self.units.get(&unit).ok_or(RuleError::NoSuchUnit)?;
        let from = attacker.position.ok_or(RuleError::UnitNotPlaced)?;
        let range = attacker.attack_range;
        if !attacker.economy.can_spend(SlotCosts::ATTACK) {
            return Err(RuleError::SlotAlreadySpent);
        }

        let defender = self.units.get(&target).ok_or(RuleError::NoSuchUnit)?;
        if defender.owner == player {
            return Err(RuleError::InvalidTarget);
        }
        if !defender.alive {
            return Err(RuleError::UnitDead);
        }
        let to = defender.position.ok_or(RuleError::UnitNotPlaced)?;
        if !self.knows_about(player, target) {
            return Err(RuleError::TargetNotVisible);
        }
        let dist = from.chebyshev(&to);
        if dist == 0 || dist > range {
            return Err(RuleError::OutOfRange);
        }

        let mut bonus = 0;
        let mut was_stealthed = false;
        if let Some(attacker) = self.units.get_mut(&unit) {
            attacker.economy = attacker.economy.spend(SlotCosts::ATTACK);
            bonus = attacker.take_damage_bonus();
            was_stealthed = attacker.stealth.active;
        }
        if was_stealthed {
            // Opening an attack breaks stealth before dice are thrown
            self.reveal_to_all(unit, events);
        }

        let ctx = CombatContext {
            attacker: unit,
            defender: target,
            bonus_damage: bonus,
            tie_rounds: 0,
            origin: CombatOrigin::Direct,
        };
        combat::begin_attack(self, ctx, events);
        Ok(())
    }

    /// Enemies the unit could attack right now, in reading order
    pub fn legal_targets(&self, unit: UnitId) -> Vec<UnitId> {
        let Some(u) = self.units.get(&unit) else {
            return Vec::new();
        };
        let Some(from) = u.position else {
            return Vec::new();
        };
        let mut targets: Vec<(CellCoord, UnitId)> = self
            .units
            .values()
            .filter(|e| e.owner != u.owner && e.is_deployed())
            .filter(|e| self.knows_about(u.owner, e.id))
            .filter_map(|e| e.position.map(|p| (p, e.id)))
            .filter(|(p, _)| {
                let d = from.chebyshev(p);
                d >= 1 && d <= u.attack_range
            })
            .collect();
        targets.sort();
        targets.into_iter().map(|(_, id)| id).collect()
    }

    // ==================== Stealth ====================

    fn handle_enter_stealth(
        &mut self,
        player: PlayerId,
        unit: UnitId,
        events: &mut Vec<GameEvent>,
    ) -> Result<(), RuleError> {
        self.battle_actor_checks(player, unit, true)?;
        let u = self.units.get(&unit).ok_or(RuleError::NoSuchUnit)?;
        if u.stealth.active {
            return Err(RuleError::AlreadyStealthed);
        }
        if !u.economy.can_spend(SlotCosts::STEALTH) {
            return Err(RuleError::SlotAlreadySpent);
        }
        let position = u.position.ok_or(RuleError::UnitNotPlaced)?;

        if let Some(u) = self.units.get_mut(&unit) {
            u.economy = u.economy.spend(SlotCosts::STEALTH);
            u.stealth = StealthState {
                active: true,
                rounds_left: STEALTH_DURATION,
            };
        }
        // Everyone keeps only the position the unit vanished at
        self.shadows.insert(unit, position);
        for known in self.knowledge.values_mut() {
            known.remove(&unit);
        }
        events.push(GameEvent::StealthEntered { unit });
        Ok(())
    }

    fn handle_search_stealth(
        &mut self,
        player: PlayerId,
        unit: UnitId,
        events: &mut Vec<GameEvent>,
    ) -> Result<(), RuleError> {
        self.battle_actor_checks(player, unit, true)?;
        let u = self.units.get(&unit).ok_or(RuleError::NoSuchUnit)?;
        let from = u.position.ok_or(RuleError::UnitNotPlaced)?;
        if !u.economy.can_spend(SlotCosts::ACTION) {
            return Err(RuleError::SlotAlreadySpent);
        }

        if let Some(u) = self.units.get_mut(&unit) {
            u.economy = u.economy.spend(SlotCosts::ACTION);
        }

        let mut found: Vec<(CellCoord, UnitId)> = self
            .units
            .values()
            .filter(|e| e.owner != player && e.is_deployed() && e.stealth.active)
            .filter(|e| !self.knows_about(player, e.id))
            .filter_map(|e| e.position.map(|p| (p, e.id)))
            .filter(|(p, _)| from.chebyshev(p) <= SEARCH_RADIUS)
            .collect();
        found.sort();
        let spotted: Vec<UnitId> = found.into_iter().map(|(_, id)| id).collect();

        if let Some(known) = self.knowledge.get_mut(&player) {
            known.extend(spotted.iter().copied());
        }
        events.push(GameEvent::StealthSearchResolved { unit, spotted });
        Ok(())
    }

    /// Break a unit's stealth for everyone: the shadow disappears and the
    /// unit can be targeted normally again.
    pub(crate) fn reveal_to_all(&mut self, unit: UnitId, events: &mut Vec<GameEvent>) {
        let Some(u) = self.units.get_mut(&unit) else {
            return;
        };
        if !u.stealth.active {
            return;
        }
        u.stealth = StealthState::default();
        self.shadows.remove(&unit);
        for known in self.knowledge.values_mut() {
            known.remove(&unit);
        }
        events.push(GameEvent::StealthRevealed { unit });
    }

    // ==================== Abilities ====================

    fn handle_use_ability(
        &mut self,
        player: PlayerId,
        unit: UnitId,
        ability_id: AbilityId,
        target: AbilityTarget,
        events: &mut Vec<GameEvent>,
    ) -> Result<(), RuleError> {
        self.battle_actor_checks(player, unit, true)?;
        let caster = self.units.get(&unit).ok_or(RuleError::NoSuchUnit)?;
        let caster_pos = caster.position.ok_or(RuleError::UnitNotPlaced)?;
        let cast_range = caster.attack_range;
        let ability = caster
            .ability(&ability_id)
            .ok_or(RuleError::UnknownAbility)?
            .clone();

        if matches!(ability.kind, AbilityKind::Guard) {
            return Err(RuleError::NotActivatable);
        }
        if !caster.can_spend_charges(&ability_id, ability.charge_cost) {
            return Err(RuleError::InsufficientCharges);
        }
        if !caster.economy.can_spend(SlotCosts::ACTION) {
            return Err(RuleError::SlotAlreadySpent);
        }

        match ability.kind {
            AbilityKind::AreaBlast {
                radius,
                metric,
                friendly_fire,
                reveals,
            } => {
                let AbilityTarget::Cell(center) = target else {
                    return Err(RuleError::InvalidTarget);
                };
                if !self.board.contains(&center) {
                    return Err(RuleError::OffBoard);
                }
                if caster_pos.chebyshev(&center) > cast_range {
                    return Err(RuleError::OutOfRange);
                }

                self.commit_ability(unit, &ability_id, ability.charge_cost, target, events);
                let shape = AoeShape::Burst {
                    center,
                    radius,
                    metric,
                };
                self.launch_aoe(unit, ability_id, shape, friendly_fire, reveals, events);
            }

            AbilityKind::LineSurge { length } => {
                let AbilityTarget::Direction(direction) = target else {
                    return Err(RuleError::InvalidTarget);
                };

                self.commit_ability(unit, &ability_id, ability.charge_cost, target, events);
                let shape = AoeShape::Line { direction, length };
                self.launch_aoe(unit, ability_id, shape, false, true, events);
            }

            AbilityKind::PathStrike { length } => {
                let AbilityTarget::Direction(direction) = target else {
                    return Err(RuleError::InvalidTarget);
                };
                // Charge along the free prefix of the ray
                let mut path = Vec::new();
                for cell in self.board.ray(&caster_pos, direction, length) {
                    if self.unit_at(&cell).is_some() {
                        break;
                    }
                    path.push(cell);
                }
                let Some(&destination) = path.last() else {
                    return Err(RuleError::InvalidTarget);
                };

                self.commit_ability(unit, &ability_id, ability.charge_cost, target, events);

                if let Some(u) = self.units.get_mut(&unit) {
                    u.position = Some(destination);
                }
                events.push(GameEvent::UnitMoved {
                    unit,
                    from: caster_pos,
                    to: destination,
                });

                // Every enemy brushed by the path owes the charger a fight
                let mut brushed: Vec<(CellCoord, UnitId)> = self
                    .units
                    .values()
                    .filter(|e| e.owner != player && e.is_deployed())
                    .filter_map(|e| e.position.map(|p| (p, e.id)))
                    .filter(|(p, _)| path.iter().any(|cell| cell.chebyshev(p) == 1))
                    .collect();
                brushed.sort();
                for (_, enemy) in brushed {
                    self.combat_queue.push(QueuedAttack {
                        attacker: unit,
                        defender: enemy,
                        kind: QueueKind::PathStrike,
                        ignore_range: true,
                        ignore_stealth: true,
                        bonus_damage: 0,
                        bonus_source: None,
                        consumes_slots: false,
                    });
                }
                combat::start_next_queued(self, events);
            }

            AbilityKind::Onslaught { radius } => {
                let AbilityTarget::Unit(target_id) = target else {
                    return Err(RuleError::InvalidTarget);
                };
                let enemy = self.units.get(&target_id).ok_or(RuleError::NoSuchUnit)?;
                if enemy.owner == player {
                    return Err(RuleError::InvalidTarget);
                }
                if !enemy.alive {
                    return Err(RuleError::UnitDead);
                }
                let enemy_pos = enemy.position.ok_or(RuleError::UnitNotPlaced)?;
                if !self.knows_about(player, target_id) {
                    return Err(RuleError::TargetNotVisible);
                }

                self.commit_ability(unit, &ability_id, ability.charge_cost, target, events);

                let mut allies: Vec<(CellCoord, UnitId)> = self
                    .units
                    .values()
                    .filter(|a| a.owner == player && a.is_deployed())
                    .filter_map(|a| a.position.map(|p| (p, a.id)))
                    .filter(|(p, _)| p.chebyshev(&enemy_pos) <= radius)
                    .collect();
                allies.sort();
                for (_, ally) in allies {
                    self.combat_queue.push(QueuedAttack {
                        attacker: ally,
                        defender: target_id,
                        kind: QueueKind::AoeTriggered,
                        ignore_range: true,
                        ignore_stealth: true,
                        bonus_damage: 0,
                        bonus_source: None,
                        consumes_slots: false,
                    });
                }
                combat::start_next_queued(self, events);
            }

            AbilityKind::Decree => {
                let AbilityTarget::Unit(target_id) = target else {
                    return Err(RuleError::InvalidTarget);
                };
                self.check_ally_target(player, target_id)?;

                self.commit_ability(unit, &ability_id, ability.charge_cost, target, events);
                if let Some(ally) = self.units.get_mut(&target_id) {
                    ally.effects.push(ActiveEffect::DecreeMove);
                }
            }

            AbilityKind::Empower { bonus } => {
                let AbilityTarget::Unit(target_id) = target else {
                    return Err(RuleError::InvalidTarget);
                };
                self.check_ally_target(player, target_id)?;

                self.commit_ability(unit, &ability_id, ability.charge_cost, target, events);
                if let Some(ally) = self.units.get_mut(&target_id) {
                    ally.effects.push(ActiveEffect::DamageBonus {
                        amount: bonus,
                        source: ability_id,
                    });
                }
            }

            AbilityKind::Guard => return Err(RuleError::NotActivatable),
        }
        Ok(())
    }

    fn check_ally_target(&self, player: PlayerId, target: UnitId) -> Result<(), RuleError> {
        let ally = self.units.get(&target).ok_or(RuleError::NoSuchUnit)?;
        if ally.owner != player {
            return Err(RuleError::InvalidTarget);
        }
        if !ally.alive {
            return Err(RuleError::UnitDead);
        }
        if ally.position.is_none() {
            return Err(RuleError::UnitNotPlaced);
        }
        Ok(())
    }

    /// Spend the action slot and charges, announce the activation, and
    /// break the caster's stealth (casting is visible).
    fn commit_ability(
        &mut self,
        unit: UnitId,
        ability_id: &str,
        charge_cost: u32,
        target: AbilityTarget,
        events: &mut Vec<GameEvent>,
    ) {
        let mut was_stealthed = false;
        if let Some(u) = self.units.get_mut(&unit) {
            u.economy = u.economy.spend(SlotCosts::ACTION);
            u.spend_charges(ability_id, charge_cost);
            was_stealthed = u.stealth.active;
        }
        events.push(GameEvent::AbilityUsed {
            unit,
            ability: ability_id.to_string(),
            target,
        });
        if was_stealthed {
            self.reveal_to_all(unit, events);
        }
    }

    /// Compute the footprint, spot what the blast exposes, and hand the
    /// ordered target queue to the area resolver.
    fn launch_aoe(
        &mut self,
        caster: UnitId,
        ability_id: AbilityId,
        shape: AoeShape,
        friendly_fire: bool,
        reveals: bool,
        events: &mut Vec<GameEvent>,
    ) {
        let (origin, caster_owner) = match self.units.get(&caster) {
            Some(u) => match u.position {
                Some(p) => (p, u.owner),
                None => return,
            },
            None => return,
        };
        let cells = aoe::shape_cells(&self.board, &origin, &shape);
        let affected = aoe::affected_units(self, caster, &cells, friendly_fire, |_| true);

        // A revealing blast spots hidden units for the caster's owner, the
        // way a search does; the units stay stealthed to the other players.
        let mut revealed = Vec::new();
        if reveals {
            for &id in &affected {
                let hidden = self
                    .units
                    .get(&id)
                    .map(|u| u.stealth.active)
                    .unwrap_or(false);
                if hidden && !self.knows_about(caster_owner, id) {
                    if let Some(known) = self.knowledge.get_mut(&caster_owner) {
                        known.insert(id);
                    }
                    revealed.push(id);
                }
            }
        }

        aoe::begin(self, caster, ability_id, shape, affected, revealed, events);
    }

    // ==================== Death and victory ====================

    /// Take a dead unit off the board and out of every player's knowledge,
    /// then see whether the battle is over.
    pub(crate) fn mark_dead(&mut self, unit: UnitId, events: &mut Vec<GameEvent>) {
        if let Some(u) = self.units.get_mut(&unit) {
            u.position = None;
            u.stealth = StealthState::default();
        }
        self.shadows.remove(&unit);
        for known in self.knowledge.values_mut() {
            known.remove(&unit);
        }
        events.push(GameEvent::UnitDied { unit });
        self.check_victory(events);
    }

    fn check_victory(&mut self, events: &mut Vec<GameEvent>) {
        let standing: Vec<PlayerId> = (0..self.player_count)
            .filter(|&p| self.alive_count(p) > 0)
            .collect();

        if standing.len() <= 1 {
            let winner = standing.first().copied();
            self.phase = GamePhase::Ended { winner };
            self.combat_queue.clear();
            // An area effect cut short by the ending still reports what it did
            aoe::close_out(self, events);
            events.push(GameEvent::BattleEnded { winner });
        } else if !standing.contains(&self.first_player) {
            // The round marker must stay on a living player
            let mut candidate = self.first_player;
            for _ in 0..self.player_count {
                candidate = (candidate + 1) % self.player_count;
                if standing.contains(&candidate) {
                    break;
                }
            }
            self.first_player = candidate;
        }
    }

    // ==================== Legality enumeration ====================

    /// All currently valid actions for a player.
    ///
    /// Dice inputs cannot be enumerated; a pending dice stage contributes a
    /// single placeholder `resolvePendingRoll` entry to signal validity.
    pub fn valid_actions(&self, player: PlayerId) -> Vec<Action> {
        let mut actions = Vec::new();

        if let Some(pending) = &self.pending_roll {
            if pending.awaiting != player {
                return actions;
            }
            match &pending.kind {
                RollKind::DefenseChoice { .. } => {
                    actions.push(Action::ResolvePendingRoll {
                        input: RollInput::Defense {
                            choice: DefenseChoice::Guard,
                        },
                    });
                    actions.push(Action::ResolvePendingRoll {
                        input: RollInput::Defense {
                            choice: DefenseChoice::Roll,
                        },
                    });
                }
                _ => {
                    actions.push(Action::ResolvePendingRoll {
                        input: RollInput::Dice { values: (1, 1) },
                    });
                }
            }
            return actions;
        }

        match &self.phase {
            GamePhase::Lobby | GamePhase::Ended { .. } => {}

            GamePhase::Placement => {
                if player != self.current_player {
                    return actions;
                }
                let free_zone_cells: Vec<CellCoord> = self
                    .board
                    .deployment_zone(player)
                    .into_iter()
                    .filter(|cell| self.unit_at(cell).is_none())
                    .collect();
                for u in self.units.values() {
                    if u.owner == player && u.position.is_none() {
                        for &at in &free_zone_cells {
                            actions.push(Action::PlaceUnit { unit: u.id, at });
                        }
                    }
                }
            }

            GamePhase::Battle => {
                if player != self.current_player {
                    return actions;
                }
                actions.push(Action::EndTurn);

                match self.active_unit {
                    None => {
                        for u in self.units.values() {
                            if u.owner == player && u.is_deployed() {
                                actions.push(Action::UnitStartTurn { unit: u.id });
                            }
                        }
                    }
                    Some(unit) => {
                        let Some(u) = self.units.get(&unit) else {
                            return actions;
                        };
                        // A unit that fell to a counter on its own turn has
                        // nothing left but ending the turn
                        if !u.is_deployed() {
                            return actions;
                        }

                        if u.economy.can_spend(SlotCosts::MOVEMENT) || u.has_decree_move() {
                            for to in self.legal_moves(unit) {
                                actions.push(Action::Move { unit, to });
                            }
                        }
                        actions.push(Action::RequestMoveOptions { unit });

                        if u.economy.can_spend(SlotCosts::ATTACK) {
                            for target in self.legal_targets(unit) {
                                actions.push(Action::Attack { unit, target });
                            }
                        }

                        if u.economy.can_spend(SlotCosts::STEALTH) && !u.stealth.active {
                            actions.push(Action::EnterStealth { unit });
                        }
                        if u.economy.can_spend(SlotCosts::ACTION) {
                            actions.push(Action::SearchStealth { unit });
                            self.enumerate_abilities(player, u, &mut actions);
                        }
                    }
                }
            }
        }

        actions
    }

    fn enumerate_abilities(&self, player: PlayerId, u: &UnitState, actions: &mut Vec<Action>) {
        let Some(pos) = u.position else {
            return;
        };
        for ability in &u.abilities {
            if !u.can_spend_charges(&ability.id, ability.charge_cost) {
                continue;
            }
            match &ability.kind {
                AbilityKind::AreaBlast { .. } => {
                    for at in self.board.cells_within(&pos, u.attack_range, Metric::Chebyshev) {
                        actions.push(Action::UseAbility {
                            unit: u.id,
                            ability: ability.id.clone(),
                            target: AbilityTarget::Cell(at),
                        });
                    }
                }
                AbilityKind::LineSurge { .. } | AbilityKind::PathStrike { .. } => {
                    for direction in crate::grid::Direction::ALL {
                        actions.push(Action::UseAbility {
                            unit: u.id,
                            ability: ability.id.clone(),
                            target: AbilityTarget::Direction(direction),
                        });
                    }
                }
                AbilityKind::Onslaught { .. } => {
                    for e in self.units.values() {
                        if e.owner != player && e.is_deployed() && self.knows_about(player, e.id) {
                            actions.push(Action::UseAbility {
                                unit: u.id,
                                ability: ability.id.clone(),
                                target: AbilityTarget::Unit(e.id),
                            });
                        }
                    }
                }
                AbilityKind::Decree | AbilityKind::Empower { .. } => {
                    for a in self.units.values() {
                        if a.owner == player && a.is_deployed() {
                            actions.push(Action::UseAbility {
                                unit: u.id,
                                ability: ability.id.clone(),
                                target: AbilityTarget::Unit(a.id),
                            });
                        }
                    }
                }
                AbilityKind::Guard => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::RollKindTag;
    use crate::unit::{AbilityDef, HeroClass, TurnEconomy};
    use pretty_assertions::assert_eq;

    fn vanguard() -> UnitSpec {
        UnitSpec {
            class: HeroClass::Vanguard,
            max_hp: 10,
            damage: 3,
            move_range: 2,
            attack_range: 2,
            abilities: Vec::new(),
        }
    }

    fn guard_ability() -> AbilityDef {
        AbilityDef {
            id: "guard".to_string(),
            kind: AbilityKind::Guard,
            charge_cost: 1,
            initial_charges: 2,
        }
    }

    fn blast_ability(radius: u32) -> AbilityDef {
        AbilityDef {
            id: "blast".to_string(),
            kind: AbilityKind::AreaBlast {
                radius,
                metric: Metric::Chebyshev,
                friendly_fire: false,
                reveals: true,
            },
            charge_cost: 1,
            initial_charges: 2,
        }
    }

    /// Battle-ready 2v2: units 1, 2 belong to player 0, units 3, 4 to
    /// player 1; unit 1 and unit 3 stand next to each other mid-board.
    fn battle_2v2() -> GameState {
        let mut game = GameState::new(
            8,
            8,
            vec![vec![vanguard(), vanguard()], vec![vanguard(), vanguard()]],
        );
        game.phase = GamePhase::Battle;
        game.current_player = 0;
        game.first_player = 0;
        game.turn_number = 1;
        game.round = 1;
        game.units.get_mut(&1).unwrap().position = Some(CellCoord::new(3, 3));
        game.units.get_mut(&2).unwrap().position = Some(CellCoord::new(0, 0));
        game.units.get_mut(&3).unwrap().position = Some(CellCoord::new(3, 4));
        game.units.get_mut(&4).unwrap().position = Some(CellCoord::new(7, 7));
        game
    }

    fn activate(game: &GameState, player: PlayerId, unit: UnitId) -> GameState {
        let (next, events) = game.apply_action(player, Action::UnitStartTurn { unit });
        assert!(
            events
                .iter()
                .any(|e| matches!(e, GameEvent::UnitActivated { .. })),
            "activation should be accepted"
        );
        next
    }

    fn roll(game: &GameState, player: PlayerId, dice: (u8, u8)) -> (GameState, Vec<GameEvent>) {
        game.apply_action(
            player,
            Action::ResolvePendingRoll {
                input: RollInput::Dice { values: dice },
            },
        )
    }

    #[test]
    fn test_new_game_starts_in_lobby() {
        let game = GameState::new(8, 8, vec![vec![vanguard()], vec![vanguard()]]);
        assert!(matches!(game.phase, GamePhase::Lobby));
        assert_eq!(game.units.len(), 2);
        assert_eq!(game.unit(1).unwrap().owner, 0);
        assert_eq!(game.unit(2).unwrap().owner, 1);
        assert!(game.unit(1).unwrap().position.is_none());
    }

    #[test]
    fn test_placement_runs_through_to_battle() {
        let game = GameState::new(8, 8, vec![vec![vanguard()], vec![vanguard()]]);
        let (mut game, events) = game.begin_placement();
        assert_eq!(events, vec![GameEvent::PlacementStarted]);
        assert!(matches!(game.phase, GamePhase::Placement));

        for _ in 0..2 {
            let player = game.current_player;
            let action = game
                .valid_actions(player)
                .into_iter()
                .next()
                .expect("placement action available");
            let (next, events) = game.apply_action(player, action);
            assert!(events
                .iter()
                .any(|e| matches!(e, GameEvent::UnitPlaced { .. })));
            game = next;
        }

        assert!(matches!(game.phase, GamePhase::Battle));
        assert_eq!(game.turn_number, 1);
        assert_eq!(game.round, 1);
    }

    #[test]
    fn test_placement_outside_zone_rejected() {
        let game = GameState::new(8, 8, vec![vec![vanguard()], vec![vanguard()]]);
        let (game, _) = game.begin_placement();
        let player = game.current_player;
        let unit = if player == 0 { 1 } else { 2 };
        // Mid-board is nobody's deployment zone
        let action = Action::PlaceUnit {
            unit,
            at: CellCoord::new(4, 4),
        };
        assert_eq!(
            game.check_action(player, &action),
            Err(RuleError::OutsideDeploymentZone)
        );
        let (next, events) = game.apply_action(player, action);
        assert_eq!(next, game);
        assert!(events.is_empty());
    }

    #[test]
    fn test_simple_kill_resolves_and_emits_death_after_attack() {
        let mut game = battle_2v2();
        game.units.get_mut(&3).unwrap().hp = 2;
        let game = activate(&game, 0, 1);

        let (game, events) = game.apply_action(0, Action::Attack { unit: 1, target: 3 });
        assert_eq!(
            events,
            vec![GameEvent::RollRequested {
                kind: RollKindTag::AttackerRoll,
                player: 0,
                unit: 1,
            }]
        );
        assert!(game.pending_roll.is_some());
        assert!(game.unit(1).unwrap().economy.attack, "attack slot spent");

        let (game, events) = roll(&game, 0, (3, 2));
        assert_eq!(
            events,
            vec![GameEvent::RollRequested {
                kind: RollKindTag::DefenderRoll,
                player: 1,
                unit: 1,
            }]
        );

        let (game, events) = roll(&game, 1, (1, 1));
        assert_eq!(
            events,
            vec![
                GameEvent::AttackResolved {
                    attacker: 1,
                    defender: 3,
                    attacker_dice: (3, 2),
                    defender_dice: Some((1, 1)),
                    guarded: false,
                    tie_rounds: 0,
                    damage: 3,
                    struck: Some(3),
                    remaining_hp: Some(0),
                },
                GameEvent::UnitDied { unit: 3 },
            ]
        );
        assert!(game.pending_roll.is_none());
        let dead = game.unit(3).unwrap();
        assert_eq!(dead.hp, 0);
        assert!(!dead.alive);
        assert!(dead.position.is_none());
        // Player 1 still has unit 4, so the battle goes on
        assert!(matches!(game.phase, GamePhase::Battle));
    }

    #[test]
    fn test_defender_win_counters_with_its_own_damage() {
        let mut game = battle_2v2();
        game.units.get_mut(&3).unwrap().damage = 4;
        let game = activate(&game, 0, 1);

        let (game, _) = game.apply_action(0, Action::Attack { unit: 1, target: 3 });
        let (game, _) = roll(&game, 0, (1, 2));
        let (game, events) = roll(&game, 1, (6, 6));

        assert_eq!(
            events,
            vec![GameEvent::AttackResolved {
                attacker: 1,
                defender: 3,
                attacker_dice: (1, 2),
                defender_dice: Some((6, 6)),
                guarded: false,
                tie_rounds: 0,
                damage: 4,
                struck: Some(1),
                remaining_hp: Some(6),
            }]
        );
        assert_eq!(game.unit(1).unwrap().hp, 6);
        assert_eq!(game.unit(3).unwrap().hp, 10, "defender untouched");
    }

    #[test]
    fn test_tie_then_tiebreak_resolution() {
        let game = battle_2v2();
        let game = activate(&game, 0, 1);

        let (game, _) = game.apply_action(0, Action::Attack { unit: 1, target: 3 });
        let (game, _) = roll(&game, 0, (2, 2));
        let (game, events) = roll(&game, 1, (3, 1));
        assert_eq!(
            events,
            vec![GameEvent::RollRequested {
                kind: RollKindTag::TieBreakAttacker,
                player: 0,
                unit: 1,
            }],
            "equal sums must not resolve"
        );

        let (game, events) = roll(&game, 0, (2, 1));
        assert_eq!(
            events,
            vec![GameEvent::RollRequested {
                kind: RollKindTag::TieBreakDefender,
                player: 1,
                unit: 1,
            }]
        );

        let (game, events) = roll(&game, 1, (1, 1));
        assert_eq!(
            events,
            vec![GameEvent::AttackResolved {
                attacker: 1,
                defender: 3,
                attacker_dice: (2, 1),
                defender_dice: Some((1, 1)),
                guarded: false,
                tie_rounds: 1,
                damage: 3,
                struck: Some(3),
                remaining_hp: Some(7),
            }]
        );
        assert!(game.pending_roll.is_none());
    }

    #[test]
    fn test_repeated_ties_loop_until_unequal() {
        let game = battle_2v2();
        let game = activate(&game, 0, 1);

        let (game, _) = game.apply_action(0, Action::Attack { unit: 1, target: 3 });
        let (game, _) = roll(&game, 0, (2, 2));
        let (game, _) = roll(&game, 1, (1, 3));
        // First tie-break also ties
        let (game, _) = roll(&game, 0, (3, 3));
        let (game, events) = roll(&game, 1, (4, 2));
        assert_eq!(
            events,
            vec![GameEvent::RollRequested {
                kind: RollKindTag::TieBreakAttacker,
                player: 0,
                unit: 1,
            }]
        );
        // Second tie-break resolves
        let (game, _) = roll(&game, 0, (5, 1));
        let (_, events) = roll(&game, 1, (1, 1));
        assert!(matches!(
            events[0],
            GameEvent::AttackResolved {
                tie_rounds: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_berserker_guard_choice_branches() {
        let mut base = battle_2v2();
        {
            let defender = base.units.get_mut(&3).unwrap();
            defender.class = HeroClass::Berserker;
            defender.abilities.push(guard_ability());
            defender.charges.insert("guard".to_string(), 2);
        }
        let base = activate(&base, 0, 1);
        let (base, _) = base.apply_action(0, Action::Attack { unit: 1, target: 3 });
        let (base, events) = roll(&base, 0, (3, 2));
        assert_eq!(
            events,
            vec![GameEvent::RollRequested {
                kind: RollKindTag::DefenseChoice,
                player: 1,
                unit: 1,
            }],
            "eligible defender is offered the guard"
        );

        // Branch 1: guard turns the attack away for a charge
        let (guarded, events) = base.apply_action(
            1,
            Action::ResolvePendingRoll {
                input: RollInput::Defense {
                    choice: DefenseChoice::Guard,
                },
            },
        );
        assert_eq!(
            events,
            vec![GameEvent::AttackResolved {
                attacker: 1,
                defender: 3,
                attacker_dice: (3, 2),
                defender_dice: None,
                guarded: true,
                tie_rounds: 0,
                damage: 0,
                struck: None,
                remaining_hp: None,
            }]
        );
        assert_eq!(guarded.unit(3).unwrap().charges_of("guard"), 1);
        assert_eq!(guarded.unit(3).unwrap().hp, 10);
        assert!(guarded.pending_roll.is_none());

        // Branch 2: declining the guard falls back to a defense roll
        let (rolled, events) = base.apply_action(
            1,
            Action::ResolvePendingRoll {
                input: RollInput::Defense {
                    choice: DefenseChoice::Roll,
                },
            },
        );
        assert_eq!(
            events,
            vec![GameEvent::RollRequested {
                kind: RollKindTag::DefenderRoll,
                player: 1,
                unit: 1,
            }]
        );
        assert_eq!(rolled.unit(3).unwrap().charges_of("guard"), 2);
    }

    #[test]
    fn test_illegal_move_rejected_identically_both_times() {
        let game = battle_2v2();
        let game = activate(&game, 0, 1);
        let (game, _) = game.apply_action(
            0,
            Action::Move {
                unit: 1,
                to: CellCoord::new(4, 3),
            },
        );

        // Movement slot is now spent
        let retry = Action::Move {
            unit: 1,
            to: CellCoord::new(5, 3),
        };
        assert_eq!(
            game.check_action(0, &retry),
            Err(RuleError::SlotAlreadySpent)
        );
        let (first, events_first) = game.apply_action(0, retry.clone());
        let (second, events_second) = game.apply_action(0, retry);
        assert_eq!(first, game);
        assert_eq!(second, game);
        assert!(events_first.is_empty());
        assert!(events_second.is_empty());
    }

    #[test]
    fn test_decree_move_bypasses_spent_slot() {
        let game = battle_2v2();
        let game = activate(&game, 0, 1);
        let (mut game, _) = game.apply_action(
            0,
            Action::Move {
                unit: 1,
                to: CellCoord::new(4, 3),
            },
        );
        game.units
            .get_mut(&1)
            .unwrap()
            .effects
            .push(ActiveEffect::DecreeMove);

        let (game, events) = game.apply_action(
            0,
            Action::Move {
                unit: 1,
                to: CellCoord::new(5, 3),
            },
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, GameEvent::UnitMoved { .. })));
        assert_eq!(game.unit(1).unwrap().position, Some(CellCoord::new(5, 3)));
        assert!(!game.unit(1).unwrap().has_decree_move(), "effect consumed");
    }

    #[test]
    fn test_empower_rides_exactly_one_attack() {
        let mut game = battle_2v2();
        {
            let support = game.units.get_mut(&2).unwrap();
            support.abilities.push(AbilityDef {
                id: "empower".to_string(),
                kind: AbilityKind::Empower { bonus: 2 },
                charge_cost: 1,
                initial_charges: 1,
            });
            support.charges.insert("empower".to_string(), 1);
        }
        let game = activate(&game, 0, 2);
        let (game, events) = game.apply_action(
            0,
            Action::UseAbility {
                unit: 2,
                ability: "empower".to_string(),
                target: AbilityTarget::Unit(1),
            },
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, GameEvent::AbilityUsed { .. })));
        assert_eq!(game.unit(2).unwrap().charges_of("empower"), 0);

        let (game, _) = game.apply_action(0, Action::EndTurn);
        let (game, _) = game.apply_action(1, Action::EndTurn);
        let game = activate(&game, 0, 1);
        let (game, _) = game.apply_action(0, Action::Attack { unit: 1, target: 3 });
        let (game, _) = roll(&game, 0, (6, 6));
        let (game, events) = roll(&game, 1, (1, 1));
        assert_eq!(
            events,
            vec![GameEvent::AttackResolved {
                attacker: 1,
                defender: 3,
                attacker_dice: (6, 6),
                defender_dice: Some((1, 1)),
                guarded: false,
                tie_rounds: 0,
                damage: 5,
                struck: Some(3),
                remaining_hp: Some(5),
            }],
            "base damage 3 plus the stacked 2"
        );
        assert!(game.unit(1).unwrap().effects.is_empty());

        // The next attack is back to base damage
        let (game, _) = game.apply_action(0, Action::EndTurn);
        let (game, _) = game.apply_action(1, Action::EndTurn);
        let game = activate(&game, 0, 1);
        let (game, _) = game.apply_action(0, Action::Attack { unit: 1, target: 3 });
        let (game, _) = roll(&game, 0, (6, 6));
        let (game, events) = roll(&game, 1, (1, 1));
        assert!(matches!(
            events[0],
            GameEvent::AttackResolved { damage: 3, .. }
        ));
        assert_eq!(game.unit(3).unwrap().hp, 2);
    }

    #[test]
    fn test_everything_rejected_while_roll_pending() {
        let game = battle_2v2();
        let game = activate(&game, 0, 1);
        let (game, _) = game.apply_action(0, Action::Attack { unit: 1, target: 3 });
        assert!(game.pending_roll.is_some());

        let blocked = Action::Move {
            unit: 1,
            to: CellCoord::new(4, 3),
        };
        assert_eq!(game.check_action(0, &blocked), Err(RuleError::RollPending));
        let (next, events) = game.apply_action(0, blocked);
        assert_eq!(next, game);
        assert!(events.is_empty());

        assert_eq!(game.check_action(0, &Action::EndTurn), Err(RuleError::RollPending));
    }

    #[test]
    fn test_wrong_player_cannot_supply_the_roll() {
        let game = battle_2v2();
        let game = activate(&game, 0, 1);
        let (game, _) = game.apply_action(0, Action::Attack { unit: 1, target: 3 });

        // Attacker roll awaits player 0; player 1 jumping in changes nothing
        let (next, events) = roll(&game, 1, (3, 3));
        assert_eq!(next, game);
        assert!(events.is_empty());
    }

    #[test]
    fn test_resolve_without_pending_roll_rejected() {
        let game = battle_2v2();
        assert_eq!(
            game.check_action(
                0,
                &Action::ResolvePendingRoll {
                    input: RollInput::Dice { values: (1, 1) },
                }
            ),
            Err(RuleError::NoRollPending)
        );
    }

    #[test]
    fn test_zero_target_aoe_resolves_immediately() {
        let mut game = battle_2v2();
        game.units.get_mut(&1).unwrap().abilities.push(blast_ability(1));
        game.units
            .get_mut(&1)
            .unwrap()
            .charges
            .insert("blast".to_string(), 2);
        let game = activate(&game, 0, 1);

        // Centered up and away from every unit
        let (game, events) = game.apply_action(
            0,
            Action::UseAbility {
                unit: 1,
                ability: "blast".to_string(),
                target: AbilityTarget::Cell(CellCoord::new(1, 3)),
            },
        );
        assert_eq!(
            events,
            vec![
                GameEvent::AbilityUsed {
                    unit: 1,
                    ability: "blast".to_string(),
                    target: AbilityTarget::Cell(CellCoord::new(1, 3)),
                },
                GameEvent::AoeResolved {
                    caster: 1,
                    ability: "blast".to_string(),
                    affected: Vec::new(),
                    revealed: Vec::new(),
                    damaged: Vec::new(),
                },
            ]
        );
        assert!(game.pending_roll.is_none());
        assert!(game.pending_aoe.is_none());
        assert_eq!(game.unit(1).unwrap().charges_of("blast"), 1);
    }

    #[test]
    fn test_aoe_queue_follows_reading_order_not_insertion_order() {
        let mut game = battle_2v2();
        {
            let caster = game.units.get_mut(&1).unwrap();
            caster.attack_range = 5;
            caster.abilities.push(blast_ability(2));
            caster.charges.insert("blast".to_string(), 2);
        }
        // Lower id sits at the later reading-order position
        game.units.get_mut(&3).unwrap().position = Some(CellCoord::new(2, 5));
        game.units.get_mut(&4).unwrap().position = Some(CellCoord::new(1, 6));
        let game = activate(&game, 0, 1);

        let (game, _) = game.apply_action(
            0,
            Action::UseAbility {
                unit: 1,
                ability: "blast".to_string(),
                target: AbilityTarget::Cell(CellCoord::new(2, 6)),
            },
        );
        let aoe = game.pending_aoe.as_ref().expect("area effect pending");
        assert_eq!(aoe.queue, vec![4, 3], "row 1 resolves before row 2");

        match &game.pending_roll.as_ref().unwrap().kind {
            RollKind::AttackerRoll { combat } => assert_eq!(combat.defender, 4),
            other => panic!("expected attacker roll, got {:?}", other),
        }

        // Walk both exchanges; caster wins each
        let (game, _) = roll(&game, 0, (6, 6));
        let (game, _) = roll(&game, 1, (1, 1));
        let (game, _) = roll(&game, 0, (6, 6));
        let (game, events) = roll(&game, 1, (1, 1));

        let summary = events
            .iter()
            .find(|e| matches!(e, GameEvent::AoeResolved { .. }))
            .expect("close-out event");
        assert_eq!(
            summary,
            &GameEvent::AoeResolved {
                caster: 1,
                ability: "blast".to_string(),
                affected: vec![4, 3],
                revealed: Vec::new(),
                damaged: vec![(4, 3), (3, 3)],
            }
        );
        assert!(game.pending_aoe.is_none());
    }

    #[test]
    fn test_suspended_state_survives_serialization() {
        let game = battle_2v2();
        let game = activate(&game, 0, 1);
        let (game, _) = game.apply_action(0, Action::Attack { unit: 1, target: 3 });
        let (game, _) = roll(&game, 0, (4, 2));

        let json = serde_json::to_string(&game).unwrap();
        let restored: GameState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, game);

        let (from_live, events_live) = roll(&game, 1, (1, 2));
        let (from_restored, events_restored) = roll(&restored, 1, (1, 2));
        assert_eq!(from_restored, from_live);
        assert_eq!(events_restored, events_live);
    }

    #[test]
    fn test_unit_start_turn_resets_economy_once() {
        let game = battle_2v2();
        let game = activate(&game, 0, 1);
        let (game, _) = game.apply_action(
            0,
            Action::Move {
                unit: 1,
                to: CellCoord::new(4, 3),
            },
        );
        assert!(game.unit(1).unwrap().economy.movement);

        // Second activation this turn is rejected
        assert_eq!(
            game.check_action(0, &Action::UnitStartTurn { unit: 2 }),
            Err(RuleError::UnitAlreadyActivated)
        );

        // Next time around, the slots come back
        let (game, _) = game.apply_action(0, Action::EndTurn);
        let (game, _) = game.apply_action(1, Action::EndTurn);
        let game = activate(&game, 0, 1);
        assert_eq!(game.unit(1).unwrap().economy, TurnEconomy::new());
    }

    #[test]
    fn test_end_turn_advances_player_and_round() {
        let game = battle_2v2();
        let (game, events) = game.apply_action(0, Action::EndTurn);
        assert_eq!(game.current_player, 1);
        assert_eq!(game.turn_number, 2);
        assert_eq!(
            events,
            vec![GameEvent::TurnEnded {
                player: 0,
                next_player: 1,
            }]
        );

        let (game, events) = game.apply_action(1, Action::EndTurn);
        assert_eq!(game.current_player, 0);
        assert_eq!(game.round, 2, "wrapping to the first player bumps the round");
        assert!(events.contains(&GameEvent::RoundStarted { round: 2 }));
    }

    #[test]
    fn test_stealth_entry_hides_and_search_spots() {
        let game = battle_2v2();
        let game = activate(&game, 0, 1);
        let (game, events) = game.apply_action(0, Action::EnterStealth { unit: 1 });
        assert_eq!(events, vec![GameEvent::StealthEntered { unit: 1 }]);
        assert!(game.unit(1).unwrap().stealth.active);
        assert_eq!(game.shadows.get(&1), Some(&CellCoord::new(3, 3)));
        assert!(!game.knows_about(1, 1), "enemy lost track of the unit");
        assert!(game.knows_about(0, 1), "the owner always knows");

        // The hidden unit cannot be attacked...
        let (game, _) = game.apply_action(0, Action::EndTurn);
        let game = activate(&game, 1, 3);
        assert_eq!(
            game.check_action(1, &Action::Attack { unit: 3, target: 1 }),
            Err(RuleError::TargetNotVisible)
        );

        // ...until a search two cells away spots it
        let (game, events) = game.apply_action(1, Action::SearchStealth { unit: 3 });
        assert_eq!(
            events,
            vec![GameEvent::StealthSearchResolved {
                unit: 3,
                spotted: vec![1],
            }]
        );
        assert!(game.knows_about(1, 1));
        assert!(
            game.unit(1).unwrap().stealth.active,
            "spotting does not break the stealth itself"
        );
        assert!(game
            .check_action(1, &Action::Attack { unit: 3, target: 1 })
            .is_ok());
    }

    #[test]
    fn test_attacking_from_stealth_reveals() {
        let game = battle_2v2();
        let game = activate(&game, 0, 1);
        let (game, _) = game.apply_action(0, Action::EnterStealth { unit: 1 });
        let (game, events) = game.apply_action(0, Action::Attack { unit: 1, target: 3 });
        assert_eq!(
            events[0],
            GameEvent::StealthRevealed { unit: 1 },
            "stealth breaks before the dice go out"
        );
        assert!(!game.unit(1).unwrap().stealth.active);
        assert!(game.shadows.get(&1).is_none());
    }

    #[test]
    fn test_stealth_expires_at_turn_start() {
        let game = battle_2v2();
        let game = activate(&game, 0, 1);
        let (mut game, _) = game.apply_action(0, Action::EnterStealth { unit: 1 });
        game.units.get_mut(&1).unwrap().stealth.rounds_left = 1;
        let (game, _) = game.apply_action(0, Action::EndTurn);
        let (game, _) = game.apply_action(1, Action::EndTurn);

        let (game, events) = game.apply_action(0, Action::UnitStartTurn { unit: 1 });
        assert!(events.contains(&GameEvent::StealthRevealed { unit: 1 }));
        assert!(!game.unit(1).unwrap().stealth.active);
    }

    #[test]
    fn test_charge_overspend_rejected_by_dispatcher() {
        let mut game = battle_2v2();
        {
            let caster = game.units.get_mut(&1).unwrap();
            caster.abilities.push(blast_ability(1));
            caster.charges.insert("blast".to_string(), 0);
        }
        let game = activate(&game, 0, 1);
        let action = Action::UseAbility {
            unit: 1,
            ability: "blast".to_string(),
            target: AbilityTarget::Cell(CellCoord::new(3, 3)),
        };
        assert_eq!(
            game.check_action(0, &action),
            Err(RuleError::InsufficientCharges)
        );
        let (next, events) = game.apply_action(0, action);
        assert_eq!(next, game);
        assert!(events.is_empty());
    }

    #[test]
    fn test_victory_ends_battle() {
        let mut game = battle_2v2();
        // Player 1 is down to a single wounded unit
        game.units.get_mut(&4).unwrap().alive = false;
        game.units.get_mut(&4).unwrap().position = None;
        game.units.get_mut(&4).unwrap().hp = 0;
        game.units.get_mut(&3).unwrap().hp = 1;
        let game = activate(&game, 0, 1);

        let (game, _) = game.apply_action(0, Action::Attack { unit: 1, target: 3 });
        let (game, _) = roll(&game, 0, (6, 5));
        let (game, events) = roll(&game, 1, (1, 1));

        assert!(events.contains(&GameEvent::UnitDied { unit: 3 }));
        assert!(events.contains(&GameEvent::BattleEnded { winner: Some(0) }));
        assert!(game.is_finished());
        assert_eq!(game.winner(), Some(0));
        assert!(game.valid_actions(0).is_empty());
        assert!(game.valid_actions(1).is_empty());
    }

    #[test]
    fn test_move_options_reported_without_state_change() {
        let game = battle_2v2();
        let game = activate(&game, 0, 1);
        let (next, events) = game.apply_action(0, Action::RequestMoveOptions { unit: 1 });
        assert_eq!(next, game);
        match &events[0] {
            GameEvent::MoveOptionsGenerated { unit, options } => {
                assert_eq!(*unit, 1);
                assert!(options.contains(&CellCoord::new(2, 2)));
                assert!(!options.contains(&CellCoord::new(3, 4)), "occupied cell");
                assert!(!options.contains(&CellCoord::new(3, 3)), "own cell");
                // Reading order
                let mut sorted = options.clone();
                sorted.sort();
                assert_eq!(&sorted, options);
            }
            other => panic!("expected move options, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_actions_offers_both_defense_choices() {
        let mut game = battle_2v2();
        {
            let defender = game.units.get_mut(&3).unwrap();
            defender.class = HeroClass::Berserker;
            defender.abilities.push(guard_ability());
            defender.charges.insert("guard".to_string(), 1);
        }
        let game = activate(&game, 0, 1);
        let (game, _) = game.apply_action(0, Action::Attack { unit: 1, target: 3 });
        let (game, _) = roll(&game, 0, (3, 3));

        assert!(game.valid_actions(0).is_empty(), "attacker just waits");
        let options = game.valid_actions(1);
        assert_eq!(
            options,
            vec![
                Action::ResolvePendingRoll {
                    input: RollInput::Defense {
                        choice: DefenseChoice::Guard,
                    },
                },
                Action::ResolvePendingRoll {
                    input: RollInput::Defense {
                        choice: DefenseChoice::Roll,
                    },
                },
            ]
        );
    }
}
