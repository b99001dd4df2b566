// The collaborators the trainer drives. Model internals are opaque, only their inputs and
// outputs are fixed here. Every tensor is shaped (batch, positions) unless noted.
use crate::tensors::{Entropy, Logp, ValuesPred};
use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use std::path::Path;

/// A token level policy. The trained actor and the frozen reference share this interface.
pub trait Actor {
    /// Device the model computes on. Inputs are moved here before every call.
    fn device(&self) -> Device;

    /// Trainable parameters, used to wire the optimizer and to save checkpoints.
    fn varmap(&self) -> &VarMap;

    /// Samples completions for a batch of prompts and returns `(completion_ids,
    /// completion_mask)`. The ids hold the prompt followed by the completion, right padded to
    /// the episode length, and the mask marks the generated positions.
    fn get_rollouts(&self, prompt_ids: &Tensor, prompt_mask: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Log-probability of the token at every position of `ids` together with the entropy of
    /// the distribution it was drawn from. Gradients are tracked.
    fn get_logits(
        &self,
        ids: &Tensor,
        prompt_mask: &Tensor,
        completion_mask: &Tensor,
    ) -> Result<(Logp, Entropy)>;

    fn save(&self, path: &Path) -> Result<()> {
        self.varmap().save(path)?;
        Ok(())
    }
}

pub trait Critic {
    fn device(&self) -> Device;

    fn varmap(&self) -> &VarMap;

    /// Scalar value prediction for every position. Gradients are tracked.
    fn get_value_estimates(
        &self,
        ids: &Tensor,
        prompt_mask: &Tensor,
        completion_mask: &Tensor,
    ) -> Result<ValuesPred>;
}

pub trait Environment {
    fn device(&self) -> Device {
        Device::Cpu
    }

    /// Draws a fresh batch of prompts, returns `(prompt_ids, prompt_mask)`.
    fn reset(&mut self) -> Result<(Tensor, Tensor)>;

    /// Scores completed episodes. The returned rewards are usually sparse, nonzero only at the
    /// last completion position.
    fn get_rewards(
        &mut self,
        completion_ids: &Tensor,
        prompt_mask: &Tensor,
        completion_mask: &Tensor,
    ) -> Result<Tensor>;
}
