use anyhow::{Context, Result, ensure};
use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use rlhf_agents::{
    optimizer::OptimizerWithMaxGrad,
    ppo::{
        PPOCore, PPOParams, PPOTrainer,
        hooks::{DefaultPPOHooks, PPOHooksTrait},
    },
    scheduler::LinearLrSchedule,
};
use rlhf_core::{
    buffer::{EpisodeBuffer, LogpDriftAugmenter, ZeroAugmenter},
    models::{Actor, Critic, Environment},
    placement::PlacementPlan,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Reward shaping applied by the episode buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardAugmentation {
    Zero,
    #[default]
    LogpDrift,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PPOTrainerBuilder {
    pub max_ep_length: usize,
    pub rollout_batch_size: usize,
    pub rollout_batches_per_epoch: usize,
    pub num_epochs: usize,
    pub actor_train_batch_size: usize,
    pub actor_train_iters: usize,
    pub actor_lr: f64,
    pub critic_train_batch_size: usize,
    pub critic_train_iters: usize,
    pub critic_lr: f64,
    pub target_kl: f32,
    pub clip_ratio: f32,
    pub gamma: f32,
    pub lam: f32,
    pub beta: f32,
    pub save_steps: usize,
    pub log_steps: usize,
    pub log_smoothing_val: f32,
    pub max_grad_norm: Option<f32>,
    pub weight_decay: f64,
    pub checkpoint_dir: PathBuf,
    pub reward_augmentation: RewardAugmentation,
    /// Zero critic targets outside the completion mask.
    pub masked_targets: bool,
}

impl Default for PPOTrainerBuilder {
    fn default() -> Self {
        Self {
            max_ep_length: 100,
            rollout_batch_size: 32,
            rollout_batches_per_epoch: 4,
            num_epochs: 1000,
            actor_train_batch_size: 16,
            actor_train_iters: 4,
            actor_lr: 1e-5,
            critic_train_batch_size: 16,
            critic_train_iters: 8,
            critic_lr: 1e-5,
            target_kl: 0.05,
            clip_ratio: 0.2,
            gamma: 1.,
            lam: 1.,
            beta: 0.005,
            save_steps: 50,
            log_steps: 1,
            log_smoothing_val: 0.95,
            max_grad_norm: None,
            weight_decay: 0.01,
            checkpoint_dir: PathBuf::from("."),
            reward_augmentation: RewardAugmentation::LogpDrift,
            masked_targets: false,
        }
    }
}

impl PPOTrainerBuilder {
    /// Reads a JSON config, missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading trainer config {}", path.display()))?;
        let builder = serde_json::from_str(&raw)
            .with_context(|| format!("parsing trainer config {}", path.display()))?;
        Ok(builder)
    }

    pub fn buffer_capacity(&self) -> usize {
        self.rollout_batch_size * self.rollout_batches_per_epoch
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_ep_length > 0, "max_ep_length must be positive");
        ensure!(
            self.rollout_batch_size > 0 && self.rollout_batches_per_epoch > 0,
            "rollout batch size and batches per epoch must be positive"
        );
        ensure!(
            self.actor_train_batch_size > 0 && self.critic_train_batch_size > 0,
            "train batch sizes must be positive"
        );
        ensure!(
            self.actor_train_iters > 0 && self.critic_train_iters > 0,
            "train iterations must be positive"
        );
        ensure!(
            self.gamma > 0. && self.gamma <= 1.,
            "gamma must be in (0, 1], got {}",
            self.gamma
        );
        ensure!(
            (0. ..=1.).contains(&self.lam),
            "lam must be in [0, 1], got {}",
            self.lam
        );
        ensure!(self.clip_ratio > 0., "clip_ratio must be positive");
        ensure!(self.target_kl > 0., "target_kl must be positive");
        ensure!(
            (0. ..1.).contains(&self.log_smoothing_val),
            "log_smoothing_val must be in [0, 1)"
        );
        Ok(())
    }

    pub fn params(&self) -> PPOParams {
        PPOParams {
            num_epochs: self.num_epochs,
            rollout_batches_per_epoch: self.rollout_batches_per_epoch,
            actor_train_batch_size: self.actor_train_batch_size,
            actor_train_iters: self.actor_train_iters,
            critic_train_batch_size: self.critic_train_batch_size,
            critic_train_iters: self.critic_train_iters,
            target_kl: self.target_kl,
            clip_ratio: self.clip_ratio,
            gamma: self.gamma,
            lam: self.lam,
            beta: self.beta,
        }
    }

    pub fn default_hooks(&self) -> DefaultPPOHooks {
        DefaultPPOHooks::new(
            self.log_steps,
            self.save_steps,
            self.checkpoint_dir.clone(),
            self.log_smoothing_val,
        )
    }

    pub fn build<A: Actor, R: Actor, C: Critic, E: Environment>(
        &self,
        actor: A,
        reference: R,
        critic: C,
        env: E,
    ) -> Result<PPOTrainer<A, R, C, E>> {
        let hooks = Box::new(self.default_hooks());
        self.build_with_hooks(actor, reference, critic, env, hooks)
    }

    pub fn build_with_hooks<A: Actor, R: Actor, C: Critic, E: Environment>(
        &self,
        actor: A,
        reference: R,
        critic: C,
        env: E,
        hooks: Box<dyn PPOHooksTrait<PPOCore<A, R, C>>>,
    ) -> Result<PPOTrainer<A, R, C, E>> {
        self.validate()?;
        let buffer_device = Device::Cpu;

        let actor_optimizer = self.optimizer(actor.varmap(), self.actor_lr)?;
        let critic_optimizer = self.optimizer(critic.varmap(), self.critic_lr)?;

        let buffer = EpisodeBuffer::new(
            self.buffer_capacity(),
            self.max_ep_length,
            buffer_device.clone(),
        )?
        .with_masked_targets(self.masked_targets);
        let buffer = match self.reward_augmentation {
            RewardAugmentation::Zero => buffer.with_reward_augmenter(ZeroAugmenter),
            RewardAugmentation::LogpDrift => buffer.with_reward_augmenter(LogpDriftAugmenter),
        };

        let placement_plan = PlacementPlan::rollout(
            actor.device(),
            reference.device(),
            env.device(),
            critic.device(),
            buffer_device,
        );

        info!(
            capacity = self.buffer_capacity(),
            max_ep_length = self.max_ep_length,
            num_epochs = self.num_epochs,
            reward_augmentation = ?self.reward_augmentation,
            "built PPO trainer"
        );
        let ppo = PPOCore {
            actor,
            reference,
            critic,
            actor_optimizer,
            critic_optimizer,
            actor_lr_schedule: LinearLrSchedule::new(self.actor_lr, self.num_epochs),
            critic_lr_schedule: LinearLrSchedule::new(self.critic_lr, self.num_epochs),
            params: self.params(),
        };
        Ok(PPOTrainer::new(ppo, env, buffer, placement_plan, hooks))
    }

    fn optimizer(&self, varmap: &VarMap, lr: f64) -> Result<OptimizerWithMaxGrad> {
        let params = ParamsAdamW {
            lr,
            weight_decay: self.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        Ok(OptimizerWithMaxGrad::new(
            optimizer,
            self.max_grad_norm,
            varmap.clone(),
        ))
    }
}
