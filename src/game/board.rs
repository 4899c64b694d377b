use rand::{Rng, RngExt};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Connect4NetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stone {
    Red,
    Yellow,
}

impl Stone {
    pub fn opponent(self) -> Self {
        match self {
            Stone::Red => Stone::Yellow,
            Stone::Yellow => Stone::Red,
        }
    }
}

/// Drop-style board: stones fall to the lowest free cell of a column.
///
/// Rows are indexed from the top, so row `height - 1` is the bottom row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    height: usize,
    width: usize,
    cells: Vec<Option<Stone>>,
    /// Stones stacked in each column
    heights: Vec<usize>,
    to_move: Stone,
}

impl Board {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            cells: vec![None; height * width],
            heights: vec![0; width],
            to_move: Stone::Red,
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn to_move(&self) -> Stone {
        self.to_move
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<Stone> {
        self.cells[row * self.width + column]
    }

    pub fn stones(&self) -> usize {
        self.heights.iter().sum()
    }

    pub fn is_full(&self) -> bool {
        self.stones() == self.height * self.width
    }

    /// Columns that still have room.
    pub fn legal_columns(&self) -> Vec<usize> {
        (0..self.width)
            .filter(|&column| self.heights[column] < self.height)
            .collect()
    }

    /// Drops a stone for the side to move and passes the turn.
    /// Returns the row the stone landed on.
    pub fn drop_stone(&mut self, column: usize) -> Result<usize> {
        if column >= self.width {
            return Err(Connect4NetError::InvalidMove(format!(
                "column {column} is outside a board of width {}",
                self.width
            )));
        }
        if self.heights[column] == self.height {
            return Err(Connect4NetError::InvalidMove(format!("column {column} is full")));
        }

        let row = self.height - 1 - self.heights[column];
        self.cells[row * self.width + column] = Some(self.to_move);
        self.heights[column] += 1;
        self.to_move = self.to_move.opponent();
        Ok(row)
    }

    /// Plays up to `plies` uniformly random drops from an empty board,
    /// stopping early if the board fills up.
    pub fn random_position<R: Rng + ?Sized>(
        height: usize,
        width: usize,
        plies: usize,
        rng: &mut R,
    ) -> Self {
        let mut board = Self::new(height, width);
        for _ in 0..plies {
            let legal = board.legal_columns();
            if legal.is_empty() {
                break;
            }
            let column = legal[rng.random_range(0..legal.len())];
            if board.drop_stone(column).is_err() {
                break;
            }
        }
        board
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in 0..self.height {
            for column in 0..self.width {
                let c = match self.cell(row, column) {
                    Some(Stone::Red) => 'R',
                    Some(Stone::Yellow) => 'Y',
                    None => '.',
                };
                write!(f, "{c}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_stones_stack_from_the_bottom() {
        let mut board = Board::new(8, 7);

        assert_eq!(board.drop_stone(3).unwrap(), 7);
        assert_eq!(board.drop_stone(3).unwrap(), 6);
        assert_eq!(board.cell(7, 3), Some(Stone::Red));
        assert_eq!(board.cell(6, 3), Some(Stone::Yellow));
        assert_eq!(board.to_move(), Stone::Red);
    }

    #[test]
    fn test_full_and_missing_columns_are_rejected() {
        let mut board = Board::new(2, 3);
        board.drop_stone(0).unwrap();
        board.drop_stone(0).unwrap();

        assert_matches!(board.drop_stone(0), Err(Connect4NetError::InvalidMove(_)));
        assert_matches!(board.drop_stone(3), Err(Connect4NetError::InvalidMove(_)));
        assert_eq!(board.legal_columns(), vec![1, 2]);
    }

    #[test]
    fn test_random_position_stops_when_full() {
        let mut rng = StdRng::seed_from_u64(9);
        let board = Board::random_position(2, 2, 10, &mut rng);

        assert!(board.is_full());
        assert!(board.legal_columns().is_empty());
    }

    #[test]
    fn test_random_position_plays_every_ply_with_room() {
        let mut rng = StdRng::seed_from_u64(4);
        let board = Board::random_position(8, 7, 20, &mut rng);

        assert_eq!(board.stones(), 20);
        assert_eq!(board.to_move(), Stone::Red);
    }

    #[test]
    fn test_display() {
        let mut board = Board::new(2, 3);
        board.drop_stone(1).unwrap();
        board.drop_stone(2).unwrap();
        assert_eq!(board.to_string(), "...\n.RY\n");
    }
}
