//! Grid coordinate system for the rectangular battle board.
//!
//! This module provides the foundational geometry types:
//! - `CellCoord`: a single board cell, ordered in reading order
//! - `Direction`: the eight compass directions for lines and charges
//! - `Metric`: the distance metrics used by movement, attacks, and blasts
//! - `Board`: board dimensions with containment and zone queries
//!
//! Cells are ordered in reading order (row first, then column) so that any
//! set of cells or units can be sequenced deterministically regardless of
//! how it was collected.

use serde::{Deserialize, Serialize};

/// A cell on the battle board.
///
/// Coordinates are signed so that off-board cells produced by ray tracing
/// can be represented before being filtered by [`Board::contains`].
/// The derived `Ord` is reading order: ascending row, then ascending column.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CellCoord {
    /// Row (increases going down the board)
    pub row: i32,
    /// Column (increases going right)
    pub col: i32,
}

impl CellCoord {
    /// Create a new cell coordinate
    pub const fn new(row: i32, col: i32) -> Self {
        Self { row, col }
    }

    /// Chebyshev (king-move) distance to another cell
    pub fn chebyshev(&self, other: &CellCoord) -> u32 {
        let dr = (self.row - other.row).abs();
        let dc = (self.col - other.col).abs();
        dr.max(dc) as u32
    }

    /// Manhattan (orthogonal-step) distance to another cell
    pub fn manhattan(&self, other: &CellCoord) -> u32 {
        let dr = (self.row - other.row).abs();
        let dc = (self.col - other.col).abs();
        (dr + dc) as u32
    }

    /// The cell one step away in the given direction
    pub fn step(&self, direction: Direction) -> CellCoord {
        let (dr, dc) = direction.delta();
        CellCoord::new(self.row + dr, self.col + dc)
    }

    /// The up-to-eight neighboring cells (not filtered by board bounds)
    pub fn neighbors(&self) -> [CellCoord; 8] {
        Direction::ALL.map(|d| self.step(d))
    }
}

/// One of the eight compass directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

impl Direction {
    /// All directions in clockwise order starting from North
    pub const ALL: [Direction; 8] = [
        Direction::North,
        Direction::NorthEast,
        Direction::East,
        Direction::SouthEast,
        Direction::South,
        Direction::SouthWest,
        Direction::West,
        Direction::NorthWest,
    ];

    /// The (row, col) delta of one step in this direction
    pub const fn delta(&self) -> (i32, i32) {
        match self {
            Direction::North => (-1, 0),
            Direction::NorthEast => (-1, 1),
            Direction::East => (0, 1),
            Direction::SouthEast => (1, 1),
            Direction::South => (1, 0),
            Direction::SouthWest => (1, -1),
            Direction::West => (0, -1),
            Direction::NorthWest => (-1, -1),
        }
    }
}

/// Distance metric for ranges and blast shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// King-move distance: diagonals count as one step
    Chebyshev,
    /// Orthogonal-step distance: diagonals count as two steps
    Manhattan,
}

impl Metric {
    /// Distance between two cells under this metric
    pub fn distance(&self, a: &CellCoord, b: &CellCoord) -> u32 {
        match self {
            Metric::Chebyshev => a.chebyshev(b),
            Metric::Manhattan => a.manhattan(b),
        }
    }
}

/// How many rows/columns deep a player's deployment zone is
pub const DEPLOYMENT_DEPTH: i32 = 2;

/// The battle board: a rows x cols rectangle of cells.
///
/// The board itself is stateless terrain; unit positions live on the units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    /// Number of rows
    pub rows: i32,
    /// Number of columns
    pub cols: i32,
}

impl Board {
    /// Create a new board
    pub fn new(rows: i32, cols: i32) -> Self {
        assert!(rows > 0 && cols > 0, "Board must have positive dimensions");
        Self { rows, cols }
    }

    /// Whether a cell lies on the board
    pub fn contains(&self, cell: &CellCoord) -> bool {
        cell.row >= 0 && cell.row < self.rows && cell.col >= 0 && cell.col < self.cols
    }

    /// All board cells within `radius` of `center` under `metric`,
    /// in reading order. Includes the center cell itself.
    pub fn cells_within(&self, center: &CellCoord, radius: u32, metric: Metric) -> Vec<CellCoord> {
        let r = radius as i32;
        let mut cells = Vec::new();
        for row in (center.row - r)..=(center.row + r) {
            for col in (center.col - r)..=(center.col + r) {
                let cell = CellCoord::new(row, col);
                if self.contains(&cell) && metric.distance(center, &cell) <= radius {
                    cells.push(cell);
                }
            }
        }
        cells
    }

    /// Trace a ray from `origin` (exclusive) in `direction`, up to `length`
    /// steps, stopping at the board edge.
    pub fn ray(&self, origin: &CellCoord, direction: Direction, length: u32) -> Vec<CellCoord> {
        let mut cells = Vec::new();
        let mut cursor = *origin;
        for _ in 0..length {
            cursor = cursor.step(direction);
            if !self.contains(&cursor) {
                break;
            }
            cells.push(cursor);
        }
        cells
    }

    /// Whether `cell` lies in `player`'s deployment zone.
    ///
    /// Players 0 and 1 deploy along the top and bottom rows; players 2 and 3
    /// along the left and right columns.
    pub fn in_deployment_zone(&self, player: u8, cell: &CellCoord) -> bool {
        if !self.contains(cell) {
            return false;
        }
        match player {
            0 => cell.row < DEPLOYMENT_DEPTH,
            1 => cell.row >= self.rows - DEPLOYMENT_DEPTH,
            2 => cell.col < DEPLOYMENT_DEPTH,
            3 => cell.col >= self.cols - DEPLOYMENT_DEPTH,
            _ => false,
        }
    }

    /// All cells of a player's deployment zone, in reading order
    pub fn deployment_zone(&self, player: u8) -> Vec<CellCoord> {
        let mut cells = Vec::new();
        for row in 0..self.rows {
            for col in 0..self.cols {
                let cell = CellCoord::new(row, col);
                if self.in_deployment_zone(player, &cell) {
                    cells.push(cell);
                }
            }
        }
        cells
    }
}
