// builders + toy collaborators for tests
pub mod builders;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use builders::ppo::{PPOTrainerBuilder, RewardAugmentation};
