use crate::{buffer::BufferState, placement::RolloutKey, placement::Stage};
use thiserror::Error;

/// Precondition violations of the episode buffer. These are caller bugs and are never
/// recovered from.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("`{name}` must be a 2D (episodes, positions) tensor, got rank {rank}")]
    RankMismatch { name: &'static str, rank: usize },

    #[error("`{name}` holds {got} episodes but `state` holds {expected}")]
    BatchMismatch {
        name: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("`{name}` has {got} positions per episode, the buffer expects {expected}")]
    LengthMismatch {
        name: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("storing {batch} episodes at ptr {ptr} overflows a buffer of {capacity} episodes")]
    Overflow {
        ptr: usize,
        batch: usize,
        capacity: usize,
    },

    #[error("get requires a full buffer, only {ptr} of {capacity} episodes are stored")]
    NotFull { ptr: usize, capacity: usize },

    #[error("store requires a filling buffer, the buffer is {state}; call reset first")]
    NotFilling { state: BufferState },

    #[error("reward augmentation must have shape {expected:?}, got {got:?}")]
    AugmentationShape {
        expected: (usize, usize),
        got: Vec<usize>,
    },

    #[error("buffer capacity must be at least 1 episode")]
    ZeroCapacity,

    #[error("minibatch size must be at least 1")]
    ZeroBatchSize,

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("rollout does not hold `{0}`")]
    MissingTensor(RolloutKey),

    #[error("placement plan has no `{0}` stage")]
    MissingStage(Stage),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}
