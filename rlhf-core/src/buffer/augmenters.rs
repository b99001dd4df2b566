// Reward shaping strategies. An augmenter reads a full buffer and returns the
// `(max_episodes, max_ep_length)` shaping term, the buffer scales it by `beta` and adds it
// to the environment reward.
use super::EpisodeBuffer;
use candle_core::{Result, Tensor};

pub trait RewardAugmenter {
    fn augment(&self, buffer: &EpisodeBuffer) -> Result<Tensor>;
}

impl<F> RewardAugmenter for F
where
    F: Fn(&EpisodeBuffer) -> Result<Tensor>,
{
    fn augment(&self, buffer: &EpisodeBuffer) -> Result<Tensor> {
        self(buffer)
    }
}

/// No shaping, augmented rewards equal the environment rewards.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroAugmenter;

impl RewardAugmenter for ZeroAugmenter {
    fn augment(&self, buffer: &EpisodeBuffer) -> Result<Tensor> {
        buffer.rewards().zeros_like()
    }
}

/// Per token penalty `-(pi_t - pi_0)^2 / 2` on the drift of the rollout policy away from
/// the reference. A cheap stand in for a KL penalty that only needs the realized tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogpDriftAugmenter;

impl RewardAugmenter for LogpDriftAugmenter {
    fn augment(&self, buffer: &EpisodeBuffer) -> Result<Tensor> {
        buffer
            .pi_t_logprobs()
            .sub(buffer.pi_0_logprobs())?
            .sqr()?
            .affine(-0.5, 0.)
    }
}
