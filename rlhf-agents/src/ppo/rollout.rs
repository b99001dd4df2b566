use super::PPOTrainer;
use anyhow::{Result, ensure};
use candle_core::Tensor;
use rlhf_core::{
    models::{Actor, Critic, Environment},
    placement::{RolloutKey, Stage},
};

pub use rlhf_core::placement::RolloutData;

/// Right pads a `(batch, prompt_len)` mask with zeros to `(batch, width)`.
pub fn pad_right(mask: &Tensor, width: usize) -> Result<Tensor> {
    let len = mask.dim(1)?;
    ensure!(
        len <= width,
        "prompt of {len} positions does not fit in an episode of {width}"
    );
    Ok(mask.pad_with_zeros(1, 0, width - len)?)
}

impl<A: Actor, R: Actor, C: Critic, E: Environment> PPOTrainer<A, R, C, E> {
    /// Generates and scores one batch of episodes. Every model output is detached, and the
    /// returned tensors are the ones the buffer stores, already on the buffer device.
    pub fn get_rollout(&mut self) -> Result<RolloutData> {
        use RolloutKey::*;

        let plan = &self.placement_plan;
        let mut data = RolloutData::default();

        let (prompt_ids, prompt_mask) = self.env.reset()?;
        data.insert(PromptIds, prompt_ids);
        data.insert(PromptMask, prompt_mask);

        plan.apply(Stage::Actor, &mut data)?;
        let actor = &self.ppo.actor;
        let (completion_ids, completion_mask) =
            actor.get_rollouts(data.get(PromptIds)?, data.get(PromptMask)?)?;
        let prompt_mask = pad_right(data.get(PromptMask)?, completion_mask.dim(1)?)?;
        data.insert(PromptMask, prompt_mask);
        data.insert(CompletionIds, completion_ids.detach());
        data.insert(CompletionMask, completion_mask.detach());
        let (pi_t, _) = actor.get_logits(
            data.get(CompletionIds)?,
            data.get(PromptMask)?,
            data.get(CompletionMask)?,
        )?;
        data.insert(PiTLogprobs, pi_t.detach());

        plan.apply(Stage::Reference, &mut data)?;
        let (pi_0, _) = self.ppo.reference.get_logits(
            data.get(CompletionIds)?,
            data.get(PromptMask)?,
            data.get(CompletionMask)?,
        )?;
        data.insert(Pi0Logprobs, pi_0.detach());

        plan.apply(Stage::Environment, &mut data)?;
        let reward = self.env.get_rewards(
            data.get(CompletionIds)?,
            data.get(PromptMask)?,
            data.get(CompletionMask)?,
        )?;
        data.insert(Reward, reward.detach());

        plan.apply(Stage::Critic, &mut data)?;
        let values = self.ppo.critic.get_value_estimates(
            data.get(CompletionIds)?,
            data.get(PromptMask)?,
            data.get(CompletionMask)?,
        )?;
        data.insert(ValueEstimates, values.detach());

        // the prompt is already part of the completion ids
        data.remove(PromptIds)?;
        plan.apply(Stage::Buffer, &mut data)?;
        Ok(data)
    }

    pub fn store_rollout(&mut self, data: &RolloutData) -> Result<()> {
        use RolloutKey::*;

        self.buffer.store(
            data.get(CompletionIds)?,
            data.get(PromptMask)?,
            data.get(CompletionMask)?,
            data.get(Reward)?,
            data.get(ValueEstimates)?,
            data.get(Pi0Logprobs)?,
            data.get(PiTLogprobs)?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::pad_right;
    use candle_core::{Device, Tensor};

    #[test]
    fn pads_prompt_mask_to_episode_width() -> anyhow::Result<()> {
        let mask = Tensor::new(&[[1u32, 1], [0, 1]], &Device::Cpu)?;
        let padded = pad_right(&mask, 4)?.to_vec2::<u32>()?;
        assert_eq!(padded, vec![vec![1, 1, 0, 0], vec![0, 1, 0, 0]]);
        assert!(pad_right(&mask, 1).is_err());
        Ok(())
    }
}
