pub mod board;

pub use board::{Board, Stone};
