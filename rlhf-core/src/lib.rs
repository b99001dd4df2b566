pub mod buffer;
pub mod error;
pub mod models;
pub mod placement;
pub mod tensors;
pub mod utils;

use anyhow::Result;

/// A learning algorithm. Currently only the PPO trainer implements this trait.
pub trait Algorithm {
    fn train(&mut self) -> Result<()>;
}
