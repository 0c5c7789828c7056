//! Unit state, turn economy, and ability definitions.
//!
//! This module contains:
//! - `UnitState`: a single hero on the board
//! - `TurnEconomy` and `SlotCosts`: the four per-turn action slots
//! - `AbilityDef` / `AbilityKind`: ability parameters supplied by the
//!   content catalog at army setup
//! - `ActiveEffect`: one-shot rule exceptions granted by abilities
//!
//! Units are never removed from the game once created; death clears the
//! `alive` flag and leaves the record in place for board queries.

use crate::grid::{CellCoord, Metric};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Player identifier (0-3)
pub type PlayerId = u8;

/// Unit identifier, unique within a game
pub type UnitId = u32;

/// Ability identifier as supplied by the content catalog
pub type AbilityId = String;

/// Hero class. Stat lines come from the catalog via [`UnitSpec`]; the
/// engine only attaches rules to the classes named here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeroClass {
    /// Front-line fighter
    Vanguard,
    /// May substitute a charge-fueled guard for a defense roll
    Berserker,
    /// Long attack range
    Ranger,
    /// Support caster
    Herald,
    /// Stealth specialist
    Shade,
}

/// A subset of the four turn slots, used as a spend request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCosts {
    pub movement: bool,
    pub attack: bool,
    pub action: bool,
    pub stealth: bool,
}

impl SlotCosts {
    /// No slots
    pub const NONE: SlotCosts = SlotCosts {
        movement: false,
        attack: false,
        action: false,
        stealth: false,
    };

    /// The movement slot
    pub const MOVEMENT: SlotCosts = SlotCosts {
        movement: true,
        attack: false,
        action: false,
        stealth: false,
    };

    /// The attack slot
    pub const ATTACK: SlotCosts = SlotCosts {
        movement: false,
        attack: true,
        action: false,
        stealth: false,
    };

    /// The action slot
    pub const ACTION: SlotCosts = SlotCosts {
        movement: false,
        attack: false,
        action: true,
        stealth: false,
    };

    /// The stealth slot
    pub const STEALTH: SlotCosts = SlotCosts {
        movement: false,
        attack: false,
        action: false,
        stealth: true,
    };

    /// Whether this request asks for no slots at all
    pub fn is_empty(&self) -> bool {
        !(self.movement || self.attack || self.action || self.stealth)
    }
}

/// Which of a unit's four turn slots have been spent this turn.
///
/// Flags only go false -> true during a turn; [`TurnEconomy::reset`] clears
/// all four and is called exactly once when the unit's turn starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnEconomy {
    pub movement: bool,
    pub attack: bool,
    pub action: bool,
    pub stealth: bool,
}

impl TurnEconomy {
    /// A fresh record with no slots spent
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether every requested slot is still unspent
    pub fn can_spend(&self, costs: SlotCosts) -> bool {
        !((costs.movement && self.movement)
            || (costs.attack && self.attack)
            || (costs.action && self.action)
            || (costs.stealth && self.stealth))
    }

    /// A new record with the requested slots marked spent.
    ///
    /// Identity when `costs` is empty. Callers must check [`can_spend`]
    /// first; spending does not validate.
    ///
    /// [`can_spend`]: TurnEconomy::can_spend
    pub fn spend(&self, costs: SlotCosts) -> Self {
        Self {
            movement: self.movement || costs.movement,
            attack: self.attack || costs.attack,
            action: self.action || costs.action,
            stealth: self.stealth || costs.stealth,
        }
    }

    /// A new record with all four slots cleared
    pub fn reset(&self) -> Self {
        Self::default()
    }
}

/// Stealth status of a unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StealthState {
    /// Whether the unit is currently stealthed
    pub active: bool,
    /// Turns of stealth remaining; reveal happens when this reaches zero
    pub rounds_left: u32,
}

/// A one-shot rule exception currently attached to a unit.
///
/// Effects are granted by abilities and consumed by the rule they modify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveEffect {
    /// One extra move that does not consume the movement slot
    DecreeMove,
    /// Bonus damage stacked onto this unit's next attack
    DamageBonus { amount: u32, source: AbilityId },
}

/// Engine-known ability behavior. Numeric parameters arrive from the
/// content catalog through [`AbilityDef`]; the engine owns the semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AbilityKind {
    /// Burst around a target cell; every caught unit defends in sequence
    AreaBlast {
        radius: u32,
        metric: Metric,
        friendly_fire: bool,
        reveals: bool,
    },
    /// Directional line from the caster; caught units defend in sequence
    LineSurge { length: u32 },
    /// Charge move along a direction; enemies passed along the path are
    /// queued for slot-free, range-ignoring attacks
    PathStrike { length: u32 },
    /// Every ally near the target enemy queues a slot-free attack on it
    Onslaught { radius: u32 },
    /// Grant an ally a one-shot slot-free move
    Decree,
    /// Stack bonus damage onto an ally's next attack
    Empower { bonus: u32 },
    /// Charge pool backing the Berserker's defensive substitution
    Guard,
}

/// One ability as configured by the content catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbilityDef {
    /// Catalog identifier
    pub id: AbilityId,
    /// What the ability does
    pub kind: AbilityKind,
    /// Charges consumed per use
    pub charge_cost: u32,
    /// Charges available at army setup
    pub initial_charges: u32,
}

/// Catalog-supplied template for one unit of an army
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub class: HeroClass,
    pub max_hp: i32,
    pub damage: u32,
    pub move_range: u32,
    pub attack_range: u32,
    pub abilities: Vec<AbilityDef>,
}

/// A single hero on the board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitState {
    /// Unique unit id
    pub id: UnitId,
    /// Owning player
    pub owner: PlayerId,
    /// Hero class
    pub class: HeroClass,
    /// Board position; `None` before placement
    pub position: Option<CellCoord>,
    /// Current hit points; never negative
    pub hp: i32,
    /// Maximum hit points
    pub max_hp: i32,
    /// Cleared when hp reaches zero; dead units stay in the unit map
    pub alive: bool,
    /// Base damage dealt when winning an exchange
    pub damage: u32,
    /// Movement range in Chebyshev distance
    pub move_range: u32,
    /// Attack range in Chebyshev distance
    pub attack_range: u32,
    /// Slots spent this turn
    pub economy: TurnEconomy,
    /// Abilities this unit carries
    pub abilities: Vec<AbilityDef>,
    /// Remaining charges per ability
    pub charges: BTreeMap<AbilityId, u32>,
    /// Stealth status
    pub stealth: StealthState,
    /// One-shot rule exceptions currently attached
    pub effects: Vec<ActiveEffect>,
}

impl UnitState {
    /// Create a unit from a catalog spec. Position is assigned later,
    /// during the placement phase.
    pub fn new(id: UnitId, owner: PlayerId, spec: UnitSpec) -> Self {
        let charges = spec
            .abilities
            .iter()
            .map(|a| (a.id.clone(), a.initial_charges))
            .collect();
        Self {
            id,
            owner,
            class: spec.class,
            position: None,
            hp: spec.max_hp,
            max_hp: spec.max_hp,
            alive: true,
            damage: spec.damage,
            move_range: spec.move_range,
            attack_range: spec.attack_range,
            economy: TurnEconomy::new(),
            abilities: spec.abilities,
            charges,
            stealth: StealthState::default(),
            effects: Vec::new(),
        }
    }

    /// Whether the unit is alive and standing on the board
    pub fn is_deployed(&self) -> bool {
        self.alive && self.position.is_some()
    }

    /// Look up one of this unit's abilities
    pub fn ability(&self, id: &str) -> Option<&AbilityDef> {
        self.abilities.iter().find(|a| a.id == id)
    }

    /// Remaining charges for an ability
    pub fn charges_of(&self, id: &str) -> u32 {
        self.charges.get(id).copied().unwrap_or(0)
    }

    /// Whether the unit can pay an ability's charge cost
    pub fn can_spend_charges(&self, id: &str, cost: u32) -> bool {
        self.charges_of(id) >= cost
    }

    /// Spend charges. Returns false (and changes nothing) if the cost
    /// exceeds the remaining pool; charges are never clamped.
    pub fn spend_charges(&mut self, id: &str, cost: u32) -> bool {
        match self.charges.get_mut(id) {
            Some(pool) if *pool >= cost => {
                *pool -= cost;
                true
            }
            _ => false,
        }
    }

    /// Apply damage, flooring hp at zero. Returns true if the unit died.
    pub fn apply_damage(&mut self, amount: u32) -> bool {
        if !self.alive {
            return false;
        }
        self.hp = (self.hp - amount as i32).max(0);
        if self.hp == 0 {
            self.alive = false;
            true
        } else {
            false
        }
    }

    /// Whether the unit carries a pending decree move
    pub fn has_decree_move(&self) -> bool {
        self.effects.contains(&ActiveEffect::DecreeMove)
    }

    /// Consume one pending decree move, if any
    pub fn take_decree_move(&mut self) -> bool {
        if let Some(pos) = self
            .effects
            .iter()
            .position(|e| *e == ActiveEffect::DecreeMove)
        {
            self.effects.remove(pos);
            true
        } else {
            false
        }
    }

    /// Consume all stacked damage bonuses, returning their total
    pub fn take_damage_bonus(&mut self) -> u32 {
        let mut total = 0;
        self.effects.retain(|e| match e {
            ActiveEffect::DamageBonus { amount, .. } => {
                total += amount;
                false
            }
            _ => true,
        });
        total
    }

    /// The guard ability backing a defensive substitution, if this unit's
    /// class and loadout allow one and a charge can be paid.
    pub fn usable_guard(&self) -> Option<&AbilityDef> {
        if self.class != HeroClass::Berserker {
            return None;
        }
        self.abilities
            .iter()
            .find(|a| matches!(a.kind, AbilityKind::Guard))
            .filter(|a| self.can_spend_charges(&a.id, a.charge_cost))
    }
}
