use rand::{Rng, RngExt};
use rand_distr::{Distribution, StandardNormal};
use tch::{Device, Kind, Tensor};

use crate::game::board::Board;
use crate::neural::manager::NetworkConfig;
use crate::{Connect4NetError, Result};

/// Plane 0: stones of the side to move. Plane 1: opponent stones.
pub const PLANES: usize = 2;

/// Encodes a board from the side to move's perspective, row 0 at the top.
///
/// Layout is `[plane][row][column]`, flattened.
pub fn board_to_planes(board: &Board) -> Vec<f32> {
    let (height, width) = (board.height(), board.width());
    let mut features = vec![0.0f32; PLANES * height * width];
    let me = board.to_move();

    for row in 0..height {
        for column in 0..width {
            if let Some(stone) = board.cell(row, column) {
                let plane = if stone == me { 0 } else { 1 };
                features[plane * height * width + row * width + column] = 1.0;
            }
        }
    }
    features
}

/// Stacks boards into a `[batch, 2, height, width]` tensor.
pub fn boards_to_tensor(boards: &[Board]) -> Result<Tensor> {
    let first = boards.first().ok_or_else(|| {
        Connect4NetError::InvalidConfig("cannot encode an empty batch of boards".to_string())
    })?;
    let (height, width) = (first.height(), first.width());

    let mut data = Vec::with_capacity(boards.len() * PLANES * height * width);
    for board in boards {
        if (board.height(), board.width()) != (height, width) {
            return Err(Connect4NetError::ShapeMismatch {
                context: "board batch".to_string(),
                expected: format!("{height}x{width} boards"),
                actual: vec![board.height() as i64, board.width() as i64],
            });
        }
        data.extend(board_to_planes(board));
    }

    Ok(Tensor::from_slice(&data).view([
        boards.len() as i64,
        PLANES as i64,
        height as i64,
        width as i64,
    ]))
}

/// Kind of data fed through the network for probing and export tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExampleInput {
    /// Every cell set to 1
    Ones,
    /// Standard normal noise
    Randn,
    /// Occupancy planes of random mid-game positions
    Boards,
}

/// Builds a `[batch, input_channels, board_height, board_width]` example input.
pub fn example_input<R: Rng + ?Sized>(
    kind: ExampleInput,
    batch: i64,
    config: &NetworkConfig,
    rng: &mut R,
) -> Result<Tensor> {
    if batch <= 0 {
        return Err(Connect4NetError::InvalidConfig(format!(
            "batch size must be positive, got {batch}"
        )));
    }
    let shape = config.input_shape(batch);
    let options = (Kind::Float, Device::Cpu);

    match kind {
        ExampleInput::Ones => Ok(Tensor::ones(shape, options)),
        ExampleInput::Randn => {
            let numel = shape.iter().product::<i64>() as usize;
            let noise: Vec<f32> = (0..numel).map(|_| StandardNormal.sample(&mut *rng)).collect();
            Ok(Tensor::from_slice(&noise).view(shape))
        }
        ExampleInput::Boards => {
            if config.input_channels != PLANES as i64 {
                return Err(Connect4NetError::InvalidConfig(format!(
                    "board encoding yields {PLANES} planes, network expects {}",
                    config.input_channels
                )));
            }
            let (height, width) = (config.board_height as usize, config.board_width as usize);
            let boards: Vec<Board> = (0..batch)
                .map(|_| {
                    let plies = rng.random_range(0..=height * width);
                    Board::random_position(height, width, plies, &mut *rng)
                })
                .collect();
            boards_to_tensor(&boards)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_planes_follow_side_to_move() {
        let mut board = Board::new(8, 7);
        board.drop_stone(0).unwrap(); // red, bottom-left
        board.drop_stone(6).unwrap(); // yellow, bottom-right

        // Red to move: red stones on plane 0
        let planes = board_to_planes(&board);
        assert_eq!(planes[7 * 7], 1.0);
        assert_eq!(planes[56 + 7 * 7 + 6], 1.0);
        assert_eq!(planes.iter().sum::<f32>(), 2.0);

        board.drop_stone(1).unwrap();
        // Yellow to move: yellow stone now on plane 0
        let planes = board_to_planes(&board);
        assert_eq!(planes[7 * 7 + 6], 1.0);
        assert_eq!(planes[56 + 7 * 7], 1.0);
        assert_eq!(planes[56 + 7 * 7 + 1], 1.0);
    }

    #[test]
    fn test_boards_to_tensor_shape() {
        let boards = vec![Board::new(8, 7), Board::new(8, 7), Board::new(8, 7)];
        let tensor = boards_to_tensor(&boards).unwrap();
        assert_eq!(tensor.size(), vec![3, 2, 8, 7]);
    }

    #[test]
    fn test_mixed_board_sizes_are_rejected() {
        let boards = vec![Board::new(8, 7), Board::new(6, 7)];
        assert!(boards_to_tensor(&boards).is_err());
        assert!(boards_to_tensor(&[]).is_err());
    }

    #[test]
    fn test_example_inputs_match_config() {
        let config = NetworkConfig::default();
        let mut rng = StdRng::seed_from_u64(3);

        for kind in [ExampleInput::Ones, ExampleInput::Randn, ExampleInput::Boards] {
            let input = example_input(kind, 5, &config, &mut rng).unwrap();
            assert_eq!(input.size(), vec![5, 2, 8, 7]);
        }
        assert!(example_input(ExampleInput::Ones, 0, &config, &mut rng).is_err());
    }

    #[test]
    fn test_board_inputs_are_indicator_planes() {
        let config = NetworkConfig::default();
        let mut rng = StdRng::seed_from_u64(4);
        let input = example_input(ExampleInput::Boards, 4, &config, &mut rng).unwrap();

        let values = Vec::<f32>::try_from(&input.flatten(0, -1)).unwrap();
        assert!(values.iter().all(|&v| v == 0.0 || v == 1.0));
        // a cell is never occupied on both planes
        for board in values.chunks(2 * 56) {
            let (mine, theirs) = board.split_at(56);
            assert!(mine.iter().zip(theirs).all(|(a, b)| a + b <= 1.0));
        }
    }
}
