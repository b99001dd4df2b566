// Tiny token level collaborators so the trainer can run end to end in tests.
use anyhow::{Result, anyhow, ensure};
use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{
    Embedding, Linear, VarBuilder, VarMap, embedding, linear,
    ops::{log_softmax, softmax},
};
use rand::{
    Rng, SeedableRng,
    distr::{Distribution, weighted::WeightedIndex},
    rngs::StdRng,
};
use rlhf_core::{
    models::{Actor, Critic, Environment},
    tensors::{Entropy, Logp, ValuesPred},
};
use std::cell::RefCell;

thread_local! {
    pub static RNG: RefCell<StdRng> = RefCell::new(StdRng::seed_from_u64(0));
}

pub fn seed(seed: u64) {
    RNG.with_borrow_mut(|rng| *rng = StdRng::seed_from_u64(seed));
}

/// Pads a `(batch, len - 1)` per transition tensor with a leading zero column so position
/// `t` holds the value of token `t`.
fn shift_right(t: &Tensor) -> candle_core::Result<Tensor> {
    t.pad_with_zeros(1, 1, 0)
}

/// Bigram policy: the next token distribution only depends on the current token.
pub struct ToyActor {
    varmap: VarMap,
    embedding: Embedding,
    head: Linear,
    vocab_size: usize,
    hidden: usize,
    max_ep_length: usize,
    device: Device,
}

impl ToyActor {
    pub fn new(
        vocab_size: usize,
        hidden: usize,
        max_ep_length: usize,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let embedding = embedding(vocab_size, hidden, vb.pp("embedding"))?;
        let head = linear(hidden, vocab_size, vb.pp("head"))?;
        Ok(Self {
            varmap,
            embedding,
            head,
            vocab_size,
            hidden,
            max_ep_length,
            device: device.clone(),
        })
    }

    /// A second actor holding a copy of the current parameters, used as the frozen reference.
    pub fn frozen_copy(&self) -> Result<Self> {
        let mut copy = Self::new(self.vocab_size, self.hidden, self.max_ep_length, &self.device)?;
        let vars: Vec<(String, Tensor)> = {
            let data = self
                .varmap
                .data()
                .lock()
                .map_err(|_| anyhow!("actor varmap lock poisoned"))?;
            data.iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                .collect()
        };
        for (name, tensor) in vars {
            copy.varmap.set_one(name, tensor)?;
        }
        Ok(copy)
    }

    /// Next token logits for every position of `ids`, shape `(batch, len, vocab)`.
    fn logits(&self, ids: &Tensor) -> candle_core::Result<Tensor> {
        let hidden = self.embedding.forward(&ids.contiguous()?)?;
        self.head.forward(&hidden)
    }
}

impl Actor for ToyActor {
    fn device(&self) -> Device {
        self.device.clone()
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn get_rollouts(&self, prompt_ids: &Tensor, _prompt_mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, prompt_len) = prompt_ids.dims2()?;
        ensure!(
            prompt_len > 0 && prompt_len < self.max_ep_length,
            "prompt of {prompt_len} tokens leaves no room in {} positions",
            self.max_ep_length
        );
        let mut rows: Vec<Vec<u32>> = prompt_ids.to_vec2()?;
        for _ in prompt_len..self.max_ep_length {
            let last: Vec<u32> = rows
                .iter()
                .map(|row| row.last().copied().unwrap_or_default())
                .collect();
            let last = Tensor::from_vec(last, (batch, 1), &self.device)?;
            let probs: Vec<Vec<f32>> = softmax(&self.logits(&last)?.squeeze(1)?, D::Minus1)?
                .to_vec2()?;
            RNG.with_borrow_mut(|rng| -> Result<()> {
                for (row, p) in rows.iter_mut().zip(probs) {
                    let dist = WeightedIndex::new(&p)?;
                    row.push(dist.sample(rng) as u32);
                }
                Ok(())
            })?;
        }
        let completion_len = self.max_ep_length - prompt_len;
        let mask_row: Vec<u32> = std::iter::repeat_n(0, prompt_len)
            .chain(std::iter::repeat_n(1, completion_len))
            .collect();
        let mask: Vec<u32> = (0..batch).flat_map(|_| mask_row.clone()).collect();
        let ids: Vec<u32> = rows.into_iter().flatten().collect();
        let shape = (batch, self.max_ep_length);
        Ok((
            Tensor::from_vec(ids, shape, &self.device)?,
            Tensor::from_vec(mask, shape, &self.device)?,
        ))
    }

    fn get_logits(
        &self,
        ids: &Tensor,
        _prompt_mask: &Tensor,
        _completion_mask: &Tensor,
    ) -> Result<(Logp, Entropy)> {
        let len = ids.dim(1)?;
        ensure!(len > 1, "episodes need at least two positions");
        let inputs = ids.narrow(1, 0, len - 1)?;
        let targets = ids.narrow(1, 1, len - 1)?.contiguous()?;
        let log_probs = log_softmax(&self.logits(&inputs)?, D::Minus1)?;
        let logp = log_probs
            .gather(&targets.unsqueeze(2)?, 2)?
            .squeeze(2)?;
        let entropy = (log_probs.exp()? * &log_probs)?.sum(2)?.neg()?;
        Ok((
            Logp(shift_right(&logp)?),
            Entropy(shift_right(&entropy)?),
        ))
    }
}

/// Per position value head over token embeddings.
pub struct ToyCritic {
    varmap: VarMap,
    embedding: Embedding,
    head: Linear,
    device: Device,
}

impl ToyCritic {
    pub fn new(vocab_size: usize, hidden: usize, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        Ok(Self {
            embedding: embedding(vocab_size, hidden, vb.pp("embedding"))?,
            head: linear(hidden, 1, vb.pp("value"))?,
            varmap,
            device: device.clone(),
        })
    }
}

impl Critic for ToyCritic {
    fn device(&self) -> Device {
        self.device.clone()
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn get_value_estimates(
        &self,
        ids: &Tensor,
        _prompt_mask: &Tensor,
        _completion_mask: &Tensor,
    ) -> Result<ValuesPred> {
        let hidden = self.embedding.forward(&ids.contiguous()?)?;
        Ok(ValuesPred(self.head.forward(&hidden)?.squeeze(2)?))
    }
}

/// Random prompts, rewarded by the share of completion tokens equal to `target_token`. The
/// reward sits on the last completion position.
pub struct ToyEnvironment {
    pub batch_size: usize,
    pub prompt_len: usize,
    pub vocab_size: usize,
    pub target_token: u32,
    pub device: Device,
}

impl ToyEnvironment {
    pub fn new(batch_size: usize, prompt_len: usize, vocab_size: usize, target_token: u32) -> Self {
        Self {
            batch_size,
            prompt_len,
            vocab_size,
            target_token,
            device: Device::Cpu,
        }
    }
}

impl Environment for ToyEnvironment {
    fn device(&self) -> Device {
        self.device.clone()
    }

    fn reset(&mut self) -> Result<(Tensor, Tensor)> {
        let shape = (self.batch_size, self.prompt_len);
        let ids: Vec<u32> = RNG.with_borrow_mut(|rng| {
            (0..self.batch_size * self.prompt_len)
                .map(|_| rng.random_range(0..self.vocab_size as u32))
                .collect()
        });
        Ok((
            Tensor::from_vec(ids, shape, &self.device)?,
            Tensor::ones(shape, DType::U32, &self.device)?,
        ))
    }

    fn get_rewards(
        &mut self,
        completion_ids: &Tensor,
        _prompt_mask: &Tensor,
        completion_mask: &Tensor,
    ) -> Result<Tensor> {
        let (batch, len) = completion_ids.dims2()?;
        let ids: Vec<Vec<u32>> = completion_ids.to_vec2()?;
        let mask: Vec<Vec<u32>> = completion_mask.to_dtype(DType::U32)?.to_vec2()?;
        let mut rewards = vec![0f32; batch * len];
        for (r, (ids, mask)) in ids.iter().zip(&mask).enumerate() {
            let positions: Vec<usize> = (0..len).filter(|t| mask[*t] != 0).collect();
            let Some(&last) = positions.last() else {
                continue;
            };
            let hits = positions
                .iter()
                .filter(|t| ids[**t] == self.target_token)
                .count();
            rewards[r * len + last] = hits as f32 / positions.len() as f32;
        }
        Ok(Tensor::from_vec(rewards, (batch, len), &self.device)?)
    }
}
