//! Cross device movement of rollout tensors.
//!
//! The actor, the reference, the environment, the critic and the buffer may each live on a
//! different device. Instead of copying tensors ad hoc, a rollout carries its tensors in a
//! [`RolloutData`] and a [`PlacementPlan`] lists, stage by stage, which tensors have to be on
//! which device before that stage runs. Every copy is a blocking `Tensor::to_device`, so a
//! stage never observes a tensor that is still in flight.

use crate::error::PlacementError;
use candle_core::{Device, Tensor};
use derive_more::Display;
use std::collections::BTreeMap;
use tracing::trace;

type Result<T> = std::result::Result<T, PlacementError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum RolloutKey {
    PromptIds,
    PromptMask,
    CompletionIds,
    CompletionMask,
    PiTLogprobs,
    Pi0Logprobs,
    Reward,
    ValueEstimates,
}

impl RolloutKey {
    /// The tensors a finished rollout hands to the buffer.
    pub const STORED: [RolloutKey; 7] = [
        RolloutKey::CompletionIds,
        RolloutKey::PromptMask,
        RolloutKey::CompletionMask,
        RolloutKey::Reward,
        RolloutKey::ValueEstimates,
        RolloutKey::Pi0Logprobs,
        RolloutKey::PiTLogprobs,
    ];

    /// The tensors every scoring model reads.
    pub const SCORING_INPUTS: [RolloutKey; 3] = [
        RolloutKey::CompletionIds,
        RolloutKey::PromptMask,
        RolloutKey::CompletionMask,
    ];
}

/// The collaborator a placement step prepares for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Stage {
    Actor,
    Reference,
    Environment,
    Critic,
    Buffer,
}

#[derive(Debug, Clone)]
pub struct Placement {
    pub keys: Vec<RolloutKey>,
    pub device: Device,
}

impl Placement {
    pub fn new(keys: &[RolloutKey], device: Device) -> Self {
        Self {
            keys: keys.to_vec(),
            device,
        }
    }
}

/// Ordered placement steps of one rollout.
#[derive(Debug, Clone)]
pub struct PlacementPlan {
    steps: Vec<(Stage, Placement)>,
}

impl PlacementPlan {
    pub fn new(steps: Vec<(Stage, Placement)>) -> Self {
        Self { steps }
    }

    /// The rollout pipeline: prompts go to the actor, its completions are scored by the
    /// reference, the environment and the critic in that order, and everything the buffer
    /// stores ends up on the buffer device.
    pub fn rollout(
        actor: Device,
        reference: Device,
        environment: Device,
        critic: Device,
        buffer: Device,
    ) -> Self {
        Self::new(vec![
            (
                Stage::Actor,
                Placement::new(&[RolloutKey::PromptIds, RolloutKey::PromptMask], actor),
            ),
            (
                Stage::Reference,
                Placement::new(&RolloutKey::SCORING_INPUTS, reference),
            ),
            (
                Stage::Environment,
                Placement::new(&RolloutKey::SCORING_INPUTS, environment),
            ),
            (
                Stage::Critic,
                Placement::new(&RolloutKey::SCORING_INPUTS, critic),
            ),
            (Stage::Buffer, Placement::new(&RolloutKey::STORED, buffer)),
        ])
    }

    pub fn steps(&self) -> &[(Stage, Placement)] {
        &self.steps
    }

    pub fn placement(&self, stage: Stage) -> Result<&Placement> {
        self.steps
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, placement)| placement)
            .ok_or(PlacementError::MissingStage(stage))
    }

    pub fn apply(&self, stage: Stage, data: &mut RolloutData) -> Result<()> {
        let placement = self.placement(stage)?;
        trace!(%stage, device = ?placement.device, "placing rollout tensors");
        data.place(placement)
    }
}

/// Working tensors of a single rollout, keyed by role.
#[derive(Debug, Clone, Default)]
pub struct RolloutData(BTreeMap<RolloutKey, Tensor>);

impl RolloutData {
    pub fn insert(&mut self, key: RolloutKey, tensor: Tensor) -> Option<Tensor> {
        self.0.insert(key, tensor)
    }

    pub fn get(&self, key: RolloutKey) -> Result<&Tensor> {
        self.0.get(&key).ok_or(PlacementError::MissingTensor(key))
    }

    pub fn remove(&mut self, key: RolloutKey) -> Result<Tensor> {
        self.0.remove(&key).ok_or(PlacementError::MissingTensor(key))
    }

    pub fn contains(&self, key: RolloutKey) -> bool {
        self.0.contains_key(&key)
    }

    pub fn device_of(&self, key: RolloutKey) -> Option<&Device> {
        self.0.get(&key).map(|t| t.device())
    }

    /// Moves every tensor named by `placement` to its device. Fails without moving anything
    /// if one of them is missing.
    pub fn place(&mut self, placement: &Placement) -> Result<()> {
        if let Some(missing) = placement.keys.iter().find(|k| !self.contains(**k)) {
            return Err(PlacementError::MissingTensor(*missing));
        }
        for key in &placement.keys {
            if let Some(tensor) = self.0.get_mut(key)
                && !tensor.device().same_device(&placement.device)
            {
                *tensor = tensor.to_device(&placement.device)?;
            }
        }
        Ok(())
    }
}
