pub mod hooks;
pub mod rollout;

use crate::{
    optimizer::{GradAccumulator, OptimizerWithMaxGrad},
    scheduler::LinearLrSchedule,
};
use anyhow::Result;
use candle_core::Tensor;
use hooks::{HookResult, PPOHooksTrait, process_hook_result};
use rlhf_core::{
    Algorithm,
    buffer::{BufferSummary, EpisodeBuffer, Minibatch},
    models::{Actor, Critic, Environment},
    placement::PlacementPlan,
    tensors::{LogpDiff, PolicyLoss, ValueLoss},
    utils::masked_select,
};
use std::ops::Deref;
use tracing::{debug, info, warn};

/// Early stop threshold as a multiple of `target_kl`.
pub const KL_STOP_FACTOR: f32 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PPOParams {
    pub num_epochs: usize,
    pub rollout_batches_per_epoch: usize,
    pub actor_train_batch_size: usize,
    pub actor_train_iters: usize,
    pub critic_train_batch_size: usize,
    pub critic_train_iters: usize,
    pub target_kl: f32,
    pub clip_ratio: f32,
    pub gamma: f32,
    pub lam: f32,
    pub beta: f32,
}

impl Default for PPOParams {
    fn default() -> Self {
        Self {
            num_epochs: 1000,
            rollout_batches_per_epoch: 4,
            actor_train_batch_size: 16,
            actor_train_iters: 4,
            critic_train_batch_size: 16,
            critic_train_iters: 8,
            target_kl: 0.05,
            clip_ratio: 0.2,
            gamma: 1.,
            lam: 1.,
            beta: 0.005,
        }
    }
}

/// Diagnostics of one actor loss evaluation. The KL values are the mean log-probability
/// difference to the rollout policy (`kl_t`) and to the reference policy (`kl_0`).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ActorLossInfo {
    pub kl_t: f32,
    pub kl_0: f32,
    pub entropy: f32,
}

impl ActorLossInfo {
    pub fn mean(infos: &[Self]) -> Self {
        if infos.is_empty() {
            return Self::default();
        }
        let n = infos.len() as f32;
        Self {
            kl_t: infos.iter().map(|i| i.kl_t).sum::<f32>() / n,
            kl_0: infos.iter().map(|i| i.kl_0).sum::<f32>() / n,
            entropy: infos.iter().map(|i| i.entropy).sum::<f32>() / n,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CriticLossInfo {
    pub loss: f32,
    pub mae: f32,
}

impl CriticLossInfo {
    pub fn mean(infos: &[Self]) -> Self {
        if infos.is_empty() {
            return Self::default();
        }
        let n = infos.len() as f32;
        Self {
            loss: infos.iter().map(|i| i.loss).sum::<f32>() / n,
            mae: infos.iter().map(|i| i.mae).sum::<f32>() / n,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ActorUpdateReport {
    /// Iterations that evaluated the loss, including an early stopped one.
    pub iterations: usize,
    pub early_stopped: bool,
    /// Batch averaged info of the last evaluated iteration.
    pub info: ActorLossInfo,
    /// Gradient norm before clipping of the last step, when clipping is enabled.
    pub grad_norm: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CriticUpdateReport {
    pub iterations: usize,
    pub info: CriticLossInfo,
    pub grad_norm: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub summary: BufferSummary,
    pub actor: ActorUpdateReport,
    pub critic: CriticUpdateReport,
    pub actor_lr: f64,
    pub critic_lr: f64,
}

impl EpochReport {
    pub fn metrics(&self) -> Vec<(&'static str, f32)> {
        let mut metrics = self.summary.metrics().to_vec();
        metrics.extend([
            ("kl_t", self.actor.info.kl_t),
            ("kl_0", self.actor.info.kl_0),
            ("entropy", self.actor.info.entropy),
            ("critic_loss", self.critic.info.loss),
            ("critic_mae", self.critic.info.mae),
        ]);
        if let Some(norm) = self.actor.grad_norm {
            metrics.push(("actor_grad_norm", norm));
        }
        if let Some(norm) = self.critic.grad_norm {
            metrics.push(("critic_grad_norm", norm));
        }
        metrics
    }
}

/// PPO-clip surrogate `-mean(min(ratio * adv, clip(ratio, 1 - eps, 1 + eps) * adv))` with
/// `ratio = exp(logp_diff)`.
pub fn clipped_surrogate(
    logp_diff: &Tensor,
    advantages: &Tensor,
    clip_ratio: f32,
) -> candle_core::Result<PolicyLoss> {
    let ratio = logp_diff.exp()?;
    let clip_adv = (ratio.clamp(1. - clip_ratio, 1. + clip_ratio)? * advantages)?;
    Ok(PolicyLoss(
        Tensor::minimum(&(&ratio * advantages)?, &clip_adv)?
            .neg()?
            .mean_all()?,
    ))
}

/// The models, their optimizers and the hyperparameters. Hooks receive this.
pub struct PPOCore<A: Actor, R: Actor, C: Critic> {
    pub actor: A,
    pub reference: R,
    pub critic: C,
    pub actor_optimizer: OptimizerWithMaxGrad,
    pub critic_optimizer: OptimizerWithMaxGrad,
    pub actor_lr_schedule: LinearLrSchedule,
    pub critic_lr_schedule: LinearLrSchedule,
    pub params: PPOParams,
}

impl<A: Actor, R: Actor, C: Critic> PPOCore<A, R, C> {
    /// Clipped surrogate over the completion tokens of `batch`, with gradients through the
    /// actor.
    ///
    /// Returns `None` when no episode of `batch` has a completion token.
    pub fn compute_actor_loss(
        &self,
        batch: &Minibatch,
    ) -> Result<Option<(PolicyLoss, ActorLossInfo)>> {
        let batch = batch.to_device(&self.actor.device())?;
        let mask = &batch.completion_mask;
        let (logp, entropy) =
            self.actor
                .get_logits(&batch.ids, &batch.prompt_mask, &batch.completion_mask)?;
        let logp = masked_select(&logp, mask)?;
        if logp.elem_count() == 0 {
            debug!(rows = ?batch.rows, "no completion tokens, skipping actor loss");
            return Ok(None);
        }
        let logp_old = masked_select(&batch.pi_t_logprobs, mask)?;
        let logp_ref = masked_select(&batch.pi_0_logprobs, mask)?;
        let advantages = masked_select(&batch.advantages, mask)?;

        let logp_diff = LogpDiff((&logp - &logp_old)?);
        let policy_loss = clipped_surrogate(&logp_diff, &advantages, self.params.clip_ratio)?;

        let info = ActorLossInfo {
            kl_t: logp_diff.mean_all()?.to_scalar::<f32>()?,
            kl_0: (&logp - &logp_ref)?.mean_all()?.to_scalar::<f32>()?,
            entropy: masked_select(entropy.deref(), mask)?
                .mean_all()?
                .to_scalar::<f32>()?,
        };
        Ok(Some((policy_loss, info)))
    }

    /// Squared error of fresh value estimates against the critic targets, over completion
    /// tokens.
    pub fn compute_critic_loss(
        &self,
        batch: &Minibatch,
    ) -> Result<Option<(ValueLoss, CriticLossInfo)>> {
        let batch = batch.to_device(&self.critic.device())?;
        let mask = &batch.completion_mask;
        let values =
            self.critic
                .get_value_estimates(&batch.ids, &batch.prompt_mask, &batch.completion_mask)?;
        let values = masked_select(&values, mask)?;
        if values.elem_count() == 0 {
            debug!(rows = ?batch.rows, "no completion tokens, skipping critic loss");
            return Ok(None);
        }
        let targets = masked_select(&batch.critic_targets, mask)?;
        let err = (values - targets)?;
        let loss = ValueLoss(err.sqr()?.mean_all()?);
        let info = CriticLossInfo {
            loss: loss.to_scalar::<f32>()?,
            mae: err.abs()?.mean_all()?.to_scalar::<f32>()?,
        };
        Ok(Some((loss, info)))
    }
}

pub struct PPOTrainer<A: Actor, R: Actor, C: Critic, E: Environment> {
    pub ppo: PPOCore<A, R, C>,
    pub env: E,
    pub buffer: EpisodeBuffer,
    pub placement_plan: PlacementPlan,
    pub hooks: Box<dyn PPOHooksTrait<PPOCore<A, R, C>>>,
    /// Mean episode reward of every finished epoch.
    pub collected_rewards: Vec<f32>,
}

impl<A: Actor, R: Actor, C: Critic, E: Environment> PPOTrainer<A, R, C, E> {
    pub fn new(
        ppo: PPOCore<A, R, C>,
        env: E,
        buffer: EpisodeBuffer,
        placement_plan: PlacementPlan,
        hooks: Box<dyn PPOHooksTrait<PPOCore<A, R, C>>>,
    ) -> Self {
        Self {
            ppo,
            env,
            buffer,
            placement_plan,
            hooks,
            collected_rewards: vec![],
        }
    }

    /// Rewinds the buffer and fills it with `rollout_batches_per_epoch` fresh rollouts.
    pub fn collect_rollouts(&mut self) -> Result<()> {
        self.buffer.reset();
        for rollout_batch in 0..self.ppo.params.rollout_batches_per_epoch {
            let rollout = self.get_rollout()?;
            self.store_rollout(&rollout)?;
            debug!(rollout_batch, ptr = self.buffer.ptr(), "collected rollout batch");
        }
        Ok(())
    }

    /// Runs up to `actor_train_iters` passes over the buffer with one optimizer step per
    /// pass. A pass whose mean `kl_t` exceeds `1.5 * target_kl` ends the update without
    /// stepping.
    pub fn actor_update(&mut self, epoch: usize) -> Result<ActorUpdateReport> {
        let params = self.ppo.params;
        let mut report = ActorUpdateReport::default();
        for iteration in 0..params.actor_train_iters {
            let mut accumulator = GradAccumulator::default();
            let mut infos = vec![];
            let batches = self.buffer.get(
                params.actor_train_batch_size,
                params.gamma,
                params.lam,
                params.beta,
            )?;
            for batch in batches {
                let Some((loss, info)) = self.ppo.compute_actor_loss(&batch?)? else {
                    continue;
                };
                accumulator.accumulate(&loss, &self.ppo.actor_optimizer.varmap)?;
                infos.push(info);
            }
            report.iterations = iteration + 1;
            report.info = ActorLossInfo::mean(&infos);

            if report.info.kl_t > KL_STOP_FACTOR * params.target_kl {
                warn!(
                    epoch,
                    iteration,
                    kl = report.info.kl_t,
                    "early stopping actor update"
                );
                report.early_stopped = true;
                break;
            }
            if let Some(mut grads) = accumulator.take() {
                report.grad_norm = self.ppo.actor_optimizer.step(&mut grads)?;
            }
        }
        Ok(report)
    }

    pub fn critic_update(&mut self) -> Result<CriticUpdateReport> {
        let params = self.ppo.params;
        let mut report = CriticUpdateReport::default();
        for iteration in 0..params.critic_train_iters {
            let mut accumulator = GradAccumulator::default();
            let mut infos = vec![];
            let batches = self.buffer.get(
                params.critic_train_batch_size,
                params.gamma,
                params.lam,
                params.beta,
            )?;
            for batch in batches {
                let Some((loss, info)) = self.ppo.compute_critic_loss(&batch?)? else {
                    continue;
                };
                accumulator.accumulate(&loss, &self.ppo.critic_optimizer.varmap)?;
                infos.push(info);
            }
            if let Some(mut grads) = accumulator.take() {
                report.grad_norm = self.ppo.critic_optimizer.step(&mut grads)?;
            }
            report.iterations = iteration + 1;
            report.info = CriticLossInfo::mean(&infos);
        }
        Ok(report)
    }

    /// One full epoch: rollouts, actor update, critic update, schedules, hooks.
    pub fn train_epoch(&mut self, epoch: usize) -> Result<HookResult> {
        self.collect_rollouts()?;
        process_hook_result!(self.hooks.after_rollouts(&mut self.ppo, &self.buffer));

        let actor = self.actor_update(epoch)?;
        let actor_lr = self
            .ppo
            .actor_lr_schedule
            .step(&mut self.ppo.actor_optimizer);

        let critic = self.critic_update()?;
        let critic_lr = self
            .ppo
            .critic_lr_schedule
            .step(&mut self.ppo.critic_optimizer);

        let summary = self.buffer.summary()?;
        self.collected_rewards.push(summary.reward_mean);
        let report = EpochReport {
            epoch,
            summary,
            actor,
            critic,
            actor_lr,
            critic_lr,
        };
        self.hooks.after_epoch(&mut self.ppo, epoch, &report)
    }
}

impl<A: Actor, R: Actor, C: Critic, E: Environment> Algorithm for PPOTrainer<A, R, C, E> {
    fn train(&mut self) -> Result<()> {
        for epoch in 0..self.ppo.params.num_epochs {
            if self.train_epoch(epoch)? == HookResult::Break {
                info!(epoch, "training stopped by hook");
                break;
            }
        }
        Ok(())
    }
}
