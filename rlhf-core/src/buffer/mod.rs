pub mod augmenters;
pub mod minibatch;

pub use augmenters::{LogpDriftAugmenter, RewardAugmenter, ZeroAugmenter};
pub use minibatch::{Minibatch, MinibatchIterator};

use crate::{error::BufferError, utils::discounted_cumsum_rows};
use candle_core::{DType, Device, Tensor};
use derive_more::Display;
use std::ops::Range;
use tracing::debug;

type Result<T> = std::result::Result<T, BufferError>;

/// Rows whose advantage standard deviation is at most this fraction of `max(|mean|, 1)` are
/// only mean-centred.
pub const ADVANTAGE_STD_REL_EPS: f64 = 1e-6;

/// Lifecycle of an [`EpisodeBuffer`] between two resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BufferState {
    /// Accepting `store` calls.
    Filling,
    /// Every row is written, `get` may run.
    Full,
    /// Derived tensors were computed at least once. `get` may run again, `store` needs a
    /// `reset` first.
    Consumed,
}

/// Scalar diagnostics over the stored episodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferSummary {
    pub reward_mean: f32,
    pub reward_std: f32,
    pub augmented_reward: f32,
    pub completion_length_mean: f32,
    pub completion_length_std: f32,
}

impl BufferSummary {
    pub fn metrics(&self) -> [(&'static str, f32); 5] {
        [
            ("reward_mean", self.reward_mean),
            ("reward_std", self.reward_std),
            ("augmented_reward", self.augmented_reward),
            ("completion_length_mean", self.completion_length_mean),
            ("completion_length_std", self.completion_length_std),
        ]
    }
}

/// Fixed capacity store of padded episodes. Every tensor is `(max_episodes, max_ep_length)`.
///
/// Episodes are appended with [`EpisodeBuffer::store`] until the buffer is full, then
/// [`EpisodeBuffer::get`] derives augmented rewards, critic targets and advantages and hands
/// out contiguous minibatches. [`EpisodeBuffer::reset`] rewinds the write cursor without
/// clearing stale rows.
pub struct EpisodeBuffer {
    max_episodes: usize,
    max_ep_length: usize,
    device: Device,
    ptr: usize,
    state: BufferState,
    masked_targets: bool,
    reward_augmenter: Box<dyn RewardAugmenter>,

    states: Tensor,
    prompt_mask: Tensor,
    completion_mask: Tensor,
    rewards: Tensor,
    value_estimates: Tensor,
    pi_0_logprobs: Tensor,
    pi_t_logprobs: Tensor,

    reward_augmentation: Tensor,
    augmented_rewards: Tensor,
    critic_targets: Tensor,
    advantages: Tensor,
}

impl EpisodeBuffer {
    pub fn new(max_episodes: usize, max_ep_length: usize, device: Device) -> Result<Self> {
        if max_episodes == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        let shape = (max_episodes, max_ep_length);
        let ids = || Tensor::zeros(shape, DType::U32, &device);
        let floats = || Tensor::zeros(shape, DType::F32, &device);
        Ok(Self {
            max_episodes,
            max_ep_length,
            ptr: 0,
            state: BufferState::Filling,
            masked_targets: false,
            reward_augmenter: Box::new(ZeroAugmenter),
            states: ids()?,
            prompt_mask: ids()?,
            completion_mask: ids()?,
            rewards: floats()?,
            value_estimates: floats()?,
            pi_0_logprobs: floats()?,
            pi_t_logprobs: floats()?,
            reward_augmentation: floats()?,
            augmented_rewards: floats()?,
            critic_targets: floats()?,
            advantages: floats()?,
            device,
        })
    }

    pub fn with_reward_augmenter(mut self, augmenter: impl RewardAugmenter + 'static) -> Self {
        self.reward_augmenter = Box::new(augmenter);
        self
    }

    /// Zero the critic targets outside the completion mask after the discounted sum.
    pub fn with_masked_targets(mut self, masked_targets: bool) -> Self {
        self.masked_targets = masked_targets;
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &mut self,
        state: &Tensor,
        prompt_mask: &Tensor,
        completion_mask: &Tensor,
        reward: &Tensor,
        value_estimates: &Tensor,
        pi_0_logprobs: &Tensor,
        pi_t_logprobs: &Tensor,
    ) -> Result<()> {
        if self.state == BufferState::Consumed {
            return Err(BufferError::NotFilling { state: self.state });
        }
        let inputs = [
            ("state", state),
            ("prompt_mask", prompt_mask),
            ("completion_mask", completion_mask),
            ("reward", reward),
            ("value_estimates", value_estimates),
            ("pi_0_logprobs", pi_0_logprobs),
            ("pi_t_logprobs", pi_t_logprobs),
        ];
        for (name, t) in inputs {
            if t.rank() != 2 {
                return Err(BufferError::RankMismatch {
                    name,
                    rank: t.rank(),
                });
            }
        }
        let batch = state.dims()[0];
        for (name, t) in inputs {
            let got = t.dims()[0];
            if got != batch {
                return Err(BufferError::BatchMismatch {
                    name,
                    expected: batch,
                    got,
                });
            }
        }
        if self.ptr + batch > self.max_episodes {
            return Err(BufferError::Overflow {
                ptr: self.ptr,
                batch,
                capacity: self.max_episodes,
            });
        }
        for (name, t) in inputs {
            let got = t.dims()[1];
            if got != self.max_ep_length {
                return Err(BufferError::LengthMismatch {
                    name,
                    expected: self.max_ep_length,
                    got,
                });
            }
        }
        if batch == 0 {
            return Ok(());
        }

        let rows = self.ptr..self.ptr + batch;
        self.states = self.write_rows(&self.states, state, rows.clone())?;
        self.prompt_mask = self.write_rows(&self.prompt_mask, prompt_mask, rows.clone())?;
        self.completion_mask =
            self.write_rows(&self.completion_mask, completion_mask, rows.clone())?;
        self.rewards = self.write_rows(&self.rewards, reward, rows.clone())?;
        self.value_estimates =
            self.write_rows(&self.value_estimates, value_estimates, rows.clone())?;
        self.pi_0_logprobs = self.write_rows(&self.pi_0_logprobs, pi_0_logprobs, rows.clone())?;
        self.pi_t_logprobs = self.write_rows(&self.pi_t_logprobs, pi_t_logprobs, rows)?;

        self.ptr += batch;
        if self.ptr == self.max_episodes {
            self.state = BufferState::Full;
        }
        debug!(ptr = self.ptr, capacity = self.max_episodes, "stored episodes");
        Ok(())
    }

    fn write_rows(&self, dst: &Tensor, src: &Tensor, rows: Range<usize>) -> Result<Tensor> {
        let src = src.to_device(&self.device)?.to_dtype(dst.dtype())?;
        Ok(dst.slice_assign(&[rows, 0..self.max_ep_length], &src)?)
    }

    /// Derives the training tensors and returns an iterator over contiguous minibatches of
    /// `batch_size` episodes. The last minibatch is short when `batch_size` does not divide
    /// the capacity. Calling `get` again recomputes the same values.
    pub fn get(
        &mut self,
        batch_size: usize,
        gamma: f32,
        lam: f32,
        beta: f32,
    ) -> Result<MinibatchIterator<'_>> {
        if batch_size == 0 {
            return Err(BufferError::ZeroBatchSize);
        }
        if self.state == BufferState::Filling {
            return Err(BufferError::NotFull {
                ptr: self.ptr,
                capacity: self.max_episodes,
            });
        }

        let augmentation = self.reward_augmenter.augment(self)?;
        if augmentation.dims() != [self.max_episodes, self.max_ep_length] {
            return Err(BufferError::AugmentationShape {
                expected: (self.max_episodes, self.max_ep_length),
                got: augmentation.dims().to_vec(),
            });
        }
        self.reward_augmentation = augmentation
            .to_device(&self.device)?
            .to_dtype(DType::F32)?;
        self.augmented_rewards =
            (&self.rewards + self.reward_augmentation.affine(beta as f64, 0.)?)?;

        let mask = self.completion_mask.to_dtype(DType::F32)?;
        let masked_rewards = (&mask * &self.augmented_rewards)?;

        let targets = discounted_cumsum_rows(&masked_rewards, gamma)?;
        self.critic_targets = if self.masked_targets {
            (targets * &mask)?
        } else {
            targets
        };

        // V[t - 1], with a zero before the first position
        let prev_values = self
            .value_estimates
            .pad_with_zeros(1, 1, 0)?
            .narrow(1, 0, self.max_ep_length)?;
        let deltas = ((&masked_rewards + self.value_estimates.affine(gamma as f64, 0.)?)?
            - prev_values)?;
        let deltas = (deltas * &mask)?;
        let advantages = discounted_cumsum_rows(&deltas, gamma * lam)?;
        self.advantages = standardize_rows(&advantages)?;

        self.state = BufferState::Consumed;
        Ok(MinibatchIterator::new(self, batch_size))
    }

    pub fn reset(&mut self) {
        self.ptr = 0;
        self.state = BufferState::Filling;
    }

    pub fn summary(&self) -> Result<BufferSummary> {
        let per_episode = |t: &Tensor| -> Result<Vec<f32>> {
            Ok(t.to_dtype(DType::F32)?.sum(1)?.to_vec1::<f32>()?)
        };
        let (reward_mean, reward_std) = mean_std(&per_episode(&self.rewards)?);
        let (augmented_reward, _) = mean_std(&per_episode(&self.augmented_rewards)?);
        let (completion_length_mean, completion_length_std) =
            mean_std(&per_episode(&self.completion_mask)?);
        Ok(BufferSummary {
            reward_mean,
            reward_std,
            augmented_reward,
            completion_length_mean,
            completion_length_std,
        })
    }

    pub fn max_episodes(&self) -> usize {
        self.max_episodes
    }

    pub fn max_ep_length(&self) -> usize {
        self.max_ep_length
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn ptr(&self) -> usize {
        self.ptr
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn states(&self) -> &Tensor {
        &self.states
    }

    pub fn prompt_mask(&self) -> &Tensor {
        &self.prompt_mask
    }

    pub fn completion_mask(&self) -> &Tensor {
        &self.completion_mask
    }

    pub fn rewards(&self) -> &Tensor {
        &self.rewards
    }

    pub fn value_estimates(&self) -> &Tensor {
        &self.value_estimates
    }

    pub fn pi_0_logprobs(&self) -> &Tensor {
        &self.pi_0_logprobs
    }

    pub fn pi_t_logprobs(&self) -> &Tensor {
        &self.pi_t_logprobs
    }

    pub fn reward_augmentation(&self) -> &Tensor {
        &self.reward_augmentation
    }

    pub fn augmented_rewards(&self) -> &Tensor {
        &self.augmented_rewards
    }

    pub fn critic_targets(&self) -> &Tensor {
        &self.critic_targets
    }

    pub fn advantages(&self) -> &Tensor {
        &self.advantages
    }
}

/// Per row `(x - mean) / std` with the unbiased standard deviation. Statistics run in f64 so
/// a constant row centres to rounding noise well below the relative threshold.
fn standardize_rows(x: &Tensor) -> candle_core::Result<Tensor> {
    let (_, cols) = x.dims2()?;
    let dtype = x.dtype();
    let x = x.to_dtype(DType::F64)?;
    let mean = x.mean_keepdim(1)?;
    let centered = x.broadcast_sub(&mean)?;
    if cols < 2 {
        return centered.to_dtype(dtype);
    }
    let std = centered
        .sqr()?
        .sum_keepdim(1)?
        .affine(1. / (cols - 1) as f64, 0.)?
        .sqrt()?;
    let threshold = mean.abs()?.maximum(1f64)?.affine(ADVANTAGE_STD_REL_EPS, 0.)?;
    let degenerate = std.le(&threshold)?;
    let centered = degenerate
        .broadcast_as(centered.shape())?
        .where_cond(&centered.zeros_like()?, &centered)?;
    let std = degenerate.where_cond(&std.ones_like()?, &std)?;
    centered.broadcast_div(&std)?.to_dtype(dtype)
}

fn mean_std(xs: &[f32]) -> (f32, f32) {
    if xs.is_empty() {
        return (0., 0.);
    }
    let n = xs.len() as f32;
    let mean = xs.iter().sum::<f32>() / n;
    if xs.len() < 2 {
        return (mean, 0.);
    }
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / (n - 1.);
    (mean, var.sqrt())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn standardize_constant_row_is_zero() -> candle_core::Result<()> {
        let x = Tensor::new(&[[2f32, 2., 2.], [1., 2., 3.]], &Device::Cpu)?;
        let out = standardize_rows(&x)?.to_vec2::<f32>()?;
        assert_eq!(out[0], vec![0., 0., 0.]);
        assert_eq!(out[1], vec![-1., 0., 1.]);
        Ok(())
    }

    #[test]
    fn standardize_constant_nonzero_rows_are_zero() -> candle_core::Result<()> {
        for value in [1.3f32, 5.1, 17.3, 123.4, -0.7] {
            let x = Tensor::new(&[[value; 7]], &Device::Cpu)?;
            let out = standardize_rows(&x)?.to_vec2::<f32>()?;
            assert_eq!(out[0], vec![0.; 7], "row of {value}");
        }
        Ok(())
    }

    #[test]
    fn standardize_single_column_centres() -> candle_core::Result<()> {
        let x = Tensor::new(&[[4f32], [-1.]], &Device::Cpu)?;
        let out = standardize_rows(&x)?.to_vec2::<f32>()?;
        assert_eq!(out, vec![vec![0.], vec![0.]]);
        Ok(())
    }

    #[test]
    fn mean_std_is_unbiased() {
        let (mean, std) = mean_std(&[1., 2., 3., 4.]);
        assert_eq!(mean, 2.5);
        assert!((std - 1.2909944).abs() < 1e-6);
        assert_eq!(mean_std(&[3.]), (3., 0.));
    }
}
