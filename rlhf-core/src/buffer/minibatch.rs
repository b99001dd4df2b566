use super::EpisodeBuffer;
use crate::error::BufferError;
use candle_core::{Device, Tensor};
use std::ops::Range;

/// A contiguous row slice of every buffer tensor.
#[derive(Debug, Clone)]
pub struct Minibatch {
    pub rows: Range<usize>,
    pub ids: Tensor,
    pub prompt_mask: Tensor,
    pub completion_mask: Tensor,
    pub reward: Tensor,
    pub value_estimates: Tensor,
    pub pi_0_logprobs: Tensor,
    pub pi_t_logprobs: Tensor,
    pub critic_targets: Tensor,
    pub advantages: Tensor,
    pub augmented_reward: Tensor,
}

impl Minibatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            rows: self.rows.clone(),
            ids: self.ids.to_device(device)?,
            prompt_mask: self.prompt_mask.to_device(device)?,
            completion_mask: self.completion_mask.to_device(device)?,
            reward: self.reward.to_device(device)?,
            value_estimates: self.value_estimates.to_device(device)?,
            pi_0_logprobs: self.pi_0_logprobs.to_device(device)?,
            pi_t_logprobs: self.pi_t_logprobs.to_device(device)?,
            critic_targets: self.critic_targets.to_device(device)?,
            advantages: self.advantages.to_device(device)?,
            augmented_reward: self.augmented_reward.to_device(device)?,
        })
    }
}

pub struct MinibatchIterator<'a> {
    buffer: &'a EpisodeBuffer,
    batch_size: usize,
    current: usize,
}

impl<'a> MinibatchIterator<'a> {
    pub(super) fn new(buffer: &'a EpisodeBuffer, batch_size: usize) -> Self {
        Self {
            buffer,
            batch_size,
            current: 0,
        }
    }

    fn slice(&self, rows: Range<usize>) -> Result<Minibatch, BufferError> {
        let b = self.buffer;
        let take = |t: &Tensor| t.narrow(0, rows.start, rows.len());
        Ok(Minibatch {
            ids: take(b.states())?,
            prompt_mask: take(b.prompt_mask())?,
            completion_mask: take(b.completion_mask())?,
            reward: take(b.rewards())?,
            value_estimates: take(b.value_estimates())?,
            pi_0_logprobs: take(b.pi_0_logprobs())?,
            pi_t_logprobs: take(b.pi_t_logprobs())?,
            critic_targets: take(b.critic_targets())?,
            advantages: take(b.advantages())?,
            augmented_reward: take(b.augmented_rewards())?,
            rows,
        })
    }
}

impl Iterator for MinibatchIterator<'_> {
    type Item = Result<Minibatch, BufferError>;

    fn next(&mut self) -> Option<Self::Item> {
        let capacity = self.buffer.max_episodes();
        if self.current >= capacity {
            return None;
        }
        let end = (self.current + self.batch_size).min(capacity);
        let rows = self.current..end;
        self.current = end;
        Some(self.slice(rows))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self
            .buffer
            .max_episodes()
            .saturating_sub(self.current)
            .div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for MinibatchIterator<'_> {}
