use super::{EpochReport, PPOCore};
use crate::metrics::RollingAverage;
use anyhow::Result;
use rlhf_core::{
    buffer::EpisodeBuffer,
    models::{Actor, Critic},
};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookResult {
    Continue,
    Break,
}

macro_rules! process_hook_result {
    ($hook_res:expr) => {
        match $hook_res? {
            HookResult::Continue => {}
            HookResult::Break => return Ok(HookResult::Break),
        }
    };
}

pub(crate) use process_hook_result;

/// Extension points of the epoch loop. Returning [`HookResult::Break`] ends training.
pub trait PPOHooksTrait<P> {
    /// Runs once the buffer is full, before any update.
    fn after_rollouts(&mut self, _core: &mut P, _buffer: &EpisodeBuffer) -> Result<HookResult> {
        Ok(HookResult::Continue)
    }

    fn after_epoch(
        &mut self,
        _core: &mut P,
        _epoch: usize,
        _report: &EpochReport,
    ) -> Result<HookResult> {
        Ok(HookResult::Continue)
    }
}

pub struct EmptyPPOHooks;

impl<P> PPOHooksTrait<P> for EmptyPPOHooks {}

/// Rolling-average logging and periodic actor checkpoints.
#[derive(Debug, Clone)]
pub struct DefaultPPOHooks {
    pub log_steps: usize,
    pub save_steps: usize,
    pub checkpoint_dir: PathBuf,
    pub rolling: RollingAverage,
}

impl Default for DefaultPPOHooks {
    fn default() -> Self {
        Self::new(1, 50, ".", 0.95)
    }
}

impl DefaultPPOHooks {
    pub fn new(
        log_steps: usize,
        save_steps: usize,
        checkpoint_dir: impl Into<PathBuf>,
        log_smoothing_val: f32,
    ) -> Self {
        Self {
            log_steps,
            save_steps,
            checkpoint_dir: checkpoint_dir.into(),
            rolling: RollingAverage::new(log_smoothing_val),
        }
    }

    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.checkpoint_dir.join(format!("actor_{epoch}.safetensors"))
    }
}

impl<A: Actor, R: Actor, C: Critic> PPOHooksTrait<PPOCore<A, R, C>> for DefaultPPOHooks {
    fn after_epoch(
        &mut self,
        core: &mut PPOCore<A, R, C>,
        epoch: usize,
        report: &EpochReport,
    ) -> Result<HookResult> {
        self.rolling.extend(report.metrics());

        if self.log_steps > 0 && (epoch + 1) % self.log_steps == 0 {
            info!(
                epoch,
                actor_iterations = report.actor.iterations,
                early_stopped = report.actor.early_stopped,
                actor_lr = report.actor_lr,
                critic_lr = report.critic_lr,
                "completed epoch"
            );
            for (metric, value) in self.rolling.iter() {
                info!(epoch, metric, value, "rolling average");
            }
        }

        if self.save_steps > 0 && (epoch + 1) % self.save_steps == 0 {
            std::fs::create_dir_all(&self.checkpoint_dir)?;
            let path = self.checkpoint_path(epoch);
            core.actor.save(&path)?;
            info!(epoch, path = %path.display(), "saved actor checkpoint");
        }
        Ok(HookResult::Continue)
    }
}
