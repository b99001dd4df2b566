use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rlhf_core::{
    buffer::{BufferState, EpisodeBuffer, LogpDriftAugmenter},
    error::BufferError,
};

const EPISODES: usize = 6;
const LENGTH: usize = 5;

struct Episodes {
    state: Tensor,
    prompt_mask: Tensor,
    completion_mask: Tensor,
    reward: Tensor,
    value_estimates: Tensor,
    pi_0: Tensor,
    pi_t: Tensor,
}

impl Episodes {
    /// Two prompt tokens followed by a completion whose length depends on the row.
    fn new(rows: usize, offset: usize) -> Result<Self> {
        let device = Device::Cpu;
        let mut prompt = vec![];
        let mut completion = vec![];
        let mut reward = vec![];
        let mut values = vec![];
        let mut pi_0 = vec![];
        let mut pi_t = vec![];
        for r in 0..rows {
            let row = r + offset;
            let completion_len = 2 + row % 2;
            let last = 2 + completion_len - 1;
            for t in 0..LENGTH {
                prompt.push((t < 2) as u32);
                completion.push((2..=last).contains(&t) as u32);
                reward.push(if t == last { 1. + row as f32 } else { 0. });
                values.push(0.1 * (row * LENGTH + t) as f32 - 0.7 * (t % 2) as f32);
                pi_0.push(-0.5 - 0.1 * t as f32);
                pi_t.push(-0.4 - 0.05 * (row + t) as f32);
            }
        }
        let shape = (rows, LENGTH);
        let state: Vec<u32> = (0..rows * LENGTH).map(|i| (i + offset * LENGTH) as u32).collect();
        Ok(Self {
            state: Tensor::from_vec(state, shape, &device)?,
            prompt_mask: Tensor::from_vec(prompt, shape, &device)?,
            completion_mask: Tensor::from_vec(completion, shape, &device)?,
            reward: Tensor::from_vec(reward, shape, &device)?,
            value_estimates: Tensor::from_vec(values, shape, &device)?,
            pi_0: Tensor::from_vec(pi_0, shape, &device)?,
            pi_t: Tensor::from_vec(pi_t, shape, &device)?,
        })
    }

    fn store_into(&self, buffer: &mut EpisodeBuffer) -> Result<(), BufferError> {
        buffer.store(
            &self.state,
            &self.prompt_mask,
            &self.completion_mask,
            &self.reward,
            &self.value_estimates,
            &self.pi_0,
            &self.pi_t,
        )
    }
}

fn full_buffer() -> Result<EpisodeBuffer> {
    let mut buffer = EpisodeBuffer::new(EPISODES, LENGTH, Device::Cpu)?;
    Episodes::new(4, 0)?.store_into(&mut buffer)?;
    Episodes::new(2, 4)?.store_into(&mut buffer)?;
    Ok(buffer)
}

fn single_episode(
    completion_mask: &[u32],
    reward: &[f32],
    values: &[f32],
) -> Result<EpisodeBuffer> {
    let device = Device::Cpu;
    let len = completion_mask.len();
    let mut buffer = EpisodeBuffer::new(1, len, device.clone())?;
    let ids = Tensor::zeros((1, len), DType::U32, &device)?;
    let completion_mask = Tensor::from_slice(completion_mask, (1, len), &device)?;
    let prompt_mask = (completion_mask.ones_like()? - &completion_mask)?;
    let logp = Tensor::zeros((1, len), DType::F32, &device)?;
    buffer.store(
        &ids,
        &prompt_mask,
        &completion_mask,
        &Tensor::from_slice(reward, (1, len), &device)?,
        &Tensor::from_slice(values, (1, len), &device)?,
        &logp,
        &logp,
    )?;
    Ok(buffer)
}

fn assert_close(got: &[f32], expected: &[f32]) {
    assert_eq!(got.len(), expected.len());
    for (g, e) in got.iter().zip(expected) {
        assert!((g - e).abs() < 1e-4, "got {got:?}, expected {expected:?}");
    }
}

#[test]
fn store_rejects_bad_shapes() -> Result<()> {
    let mut buffer = EpisodeBuffer::new(EPISODES, LENGTH, Device::Cpu)?;
    let ok = Episodes::new(2, 0)?;

    let flat = ok.reward.flatten_all()?;
    let err = buffer
        .store(
            &ok.state,
            &ok.prompt_mask,
            &ok.completion_mask,
            &flat,
            &ok.value_estimates,
            &ok.pi_0,
            &ok.pi_t,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        BufferError::RankMismatch {
            name: "reward",
            rank: 1
        }
    ));

    let one_row = ok.value_estimates.narrow(0, 0, 1)?;
    let err = buffer
        .store(
            &ok.state,
            &ok.prompt_mask,
            &ok.completion_mask,
            &ok.reward,
            &one_row,
            &ok.pi_0,
            &ok.pi_t,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        BufferError::BatchMismatch {
            name: "value_estimates",
            expected: 2,
            got: 1
        }
    ));

    let short = ok.pi_t.narrow(1, 0, LENGTH - 1)?;
    let err = buffer
        .store(
            &ok.state,
            &ok.prompt_mask,
            &ok.completion_mask,
            &ok.reward,
            &ok.value_estimates,
            &ok.pi_0,
            &short,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        BufferError::LengthMismatch {
            name: "pi_t_logprobs",
            ..
        }
    ));
    assert_eq!(buffer.ptr(), 0);
    Ok(())
}

#[test]
fn store_rejects_overflow() -> Result<()> {
    let mut buffer = EpisodeBuffer::new(EPISODES, LENGTH, Device::Cpu)?;
    Episodes::new(4, 0)?.store_into(&mut buffer)?;
    let err = Episodes::new(3, 4)?.store_into(&mut buffer).unwrap_err();
    assert!(matches!(
        err,
        BufferError::Overflow {
            ptr: 4,
            batch: 3,
            capacity: EPISODES
        }
    ));
    assert_eq!(buffer.ptr(), 4);
    assert_eq!(buffer.state(), BufferState::Filling);
    Ok(())
}

#[test]
fn get_requires_full_buffer() -> Result<()> {
    let mut buffer = full_buffer()?;
    buffer.reset();
    Episodes::new(5, 0)?.store_into(&mut buffer)?;
    let err = buffer.get(2, 1., 1., 0.).err().unwrap();
    assert!(matches!(
        err,
        BufferError::NotFull {
            ptr: 5,
            capacity: EPISODES
        }
    ));
    Ok(())
}

#[test]
fn get_rejects_zero_batch_size() -> Result<()> {
    let mut buffer = full_buffer()?;
    assert!(matches!(
        buffer.get(0, 1., 1., 0.).err(),
        Some(BufferError::ZeroBatchSize)
    ));
    Ok(())
}

#[test]
fn zero_capacity_is_rejected() {
    assert!(matches!(
        EpisodeBuffer::new(0, LENGTH, Device::Cpu),
        Err(BufferError::ZeroCapacity)
    ));
}

#[test]
fn store_after_get_needs_reset() -> Result<()> {
    let mut buffer = full_buffer()?;
    assert_eq!(buffer.state(), BufferState::Full);
    buffer.get(3, 1., 1., 0.)?.count();
    assert_eq!(buffer.state(), BufferState::Consumed);

    let err = Episodes::new(1, 0)?.store_into(&mut buffer).unwrap_err();
    assert!(matches!(
        err,
        BufferError::NotFilling {
            state: BufferState::Consumed
        }
    ));

    // repeated gets on a consumed buffer are allowed
    assert_eq!(buffer.get(4, 1., 1., 0.)?.count(), 2);

    buffer.reset();
    Episodes::new(1, 0)?.store_into(&mut buffer)?;
    assert_eq!(buffer.ptr(), 1);
    Ok(())
}

#[test]
fn get_leaves_stored_tensors_untouched() -> Result<()> {
    let buffer = full_buffer()?;
    let states: Vec<Vec<u32>> = buffer.states().to_vec2()?;
    let rewards: Vec<Vec<f32>> = buffer.rewards().to_vec2()?;
    let values: Vec<Vec<f32>> = buffer.value_estimates().to_vec2()?;
    let pi_t: Vec<Vec<f32>> = buffer.pi_t_logprobs().to_vec2()?;

    let mut buffer = buffer.with_reward_augmenter(LogpDriftAugmenter);
    buffer.get(2, 0.9, 0.95, 0.1)?.count();

    assert_eq!(buffer.states().to_vec2::<u32>()?, states);
    assert_eq!(buffer.rewards().to_vec2::<f32>()?, rewards);
    assert_eq!(buffer.value_estimates().to_vec2::<f32>()?, values);
    assert_eq!(buffer.pi_t_logprobs().to_vec2::<f32>()?, pi_t);
    Ok(())
}

#[test]
fn minibatches_cover_the_buffer_in_order() -> Result<()> {
    let mut buffer = full_buffer()?.with_reward_augmenter(LogpDriftAugmenter);
    for batch_size in 1..=EPISODES {
        let batches = buffer
            .get(batch_size, 0.99, 0.95, 0.05)?
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(batches.len(), EPISODES.div_ceil(batch_size));
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.rows.start, i * batch_size);
            assert!(batch.len() <= batch_size);
        }
        let ids: Vec<&Tensor> = batches.iter().map(|b| &b.ids).collect();
        let advantages: Vec<&Tensor> = batches.iter().map(|b| &b.advantages).collect();
        let targets: Vec<&Tensor> = batches.iter().map(|b| &b.critic_targets).collect();
        assert_eq!(
            Tensor::cat(&ids, 0)?.to_vec2::<u32>()?,
            buffer.states().to_vec2::<u32>()?
        );
        assert_eq!(
            Tensor::cat(&advantages, 0)?.to_vec2::<f32>()?,
            buffer.advantages().to_vec2::<f32>()?
        );
        assert_eq!(
            Tensor::cat(&targets, 0)?.to_vec2::<f32>()?,
            buffer.critic_targets().to_vec2::<f32>()?
        );
    }
    Ok(())
}

#[test]
fn last_minibatch_is_short() -> Result<()> {
    let mut buffer = full_buffer()?;
    let sizes: Vec<usize> = buffer
        .get(4, 1., 1., 0.)?
        .map(|b| b.map(|b| b.ids.dims()[0]))
        .collect::<Result<_, _>>()?;
    assert_eq!(sizes, vec![4, 2]);
    Ok(())
}

#[test]
fn advantages_are_standardized_per_episode() -> Result<()> {
    let mut buffer = full_buffer()?.with_reward_augmenter(LogpDriftAugmenter);
    buffer.get(EPISODES, 0.99, 0.95, 0.01)?.count();
    for row in buffer.advantages().to_vec2::<f32>()? {
        let n = row.len() as f32;
        let mean = row.iter().sum::<f32>() / n;
        let std = (row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / (n - 1.)).sqrt();
        assert!(mean.abs() < 1e-4, "row mean {mean}");
        assert!((std - 1.).abs() < 1e-3, "row std {std}");
    }
    Ok(())
}

#[test]
fn zero_augmenter_keeps_rewards() -> Result<()> {
    let mut buffer = full_buffer()?;
    buffer.get(3, 1., 1., 0.7)?.count();
    assert_eq!(
        buffer.augmented_rewards().to_vec2::<f32>()?,
        buffer.rewards().to_vec2::<f32>()?
    );
    let augmentation = buffer.reward_augmentation().to_vec2::<f32>()?;
    assert!(augmentation.iter().flatten().all(|x| *x == 0.));
    Ok(())
}

#[test]
fn logp_drift_shapes_rewards_by_beta() -> Result<()> {
    let mut buffer = full_buffer()?.with_reward_augmenter(LogpDriftAugmenter);
    let beta = 0.5;
    buffer.get(EPISODES, 1., 1., beta)?.count();
    let rewards = buffer.rewards().to_vec2::<f32>()?;
    let pi_0 = buffer.pi_0_logprobs().to_vec2::<f32>()?;
    let pi_t = buffer.pi_t_logprobs().to_vec2::<f32>()?;
    let augmented = buffer.augmented_rewards().to_vec2::<f32>()?;
    for r in 0..EPISODES {
        let expected: Vec<f32> = (0..LENGTH)
            .map(|t| rewards[r][t] - beta * (pi_t[r][t] - pi_0[r][t]).powi(2) / 2.)
            .collect();
        assert_close(&augmented[r], &expected);
    }
    Ok(())
}

#[test]
fn critic_targets_propagate_over_the_full_row() -> Result<()> {
    let mut buffer = single_episode(&[0, 1, 1], &[0., 0., 5.], &[0.; 3])?;
    buffer.get(1, 1., 1., 0.)?.count();
    assert_eq!(buffer.critic_targets().to_vec2::<f32>()?, vec![vec![5., 5., 5.]]);

    let mut buffer = single_episode(&[0, 1, 1, 0], &[0., 0., 5., 3.], &[0.; 4])?;
    buffer.get(1, 1., 1., 0.)?.count();
    assert_eq!(
        buffer.critic_targets().to_vec2::<f32>()?,
        vec![vec![5., 5., 5., 0.]]
    );
    Ok(())
}

#[test]
fn masked_critic_targets_zero_prompt_positions() -> Result<()> {
    let mut buffer = single_episode(&[0, 1, 1], &[0., 0., 5.], &[0.; 3])?.with_masked_targets(true);
    buffer.get(1, 1., 1., 0.)?.count();
    assert_eq!(buffer.critic_targets().to_vec2::<f32>()?, vec![vec![0., 5., 5.]]);
    Ok(())
}

#[test]
fn discounted_critic_targets() -> Result<()> {
    let mut buffer = single_episode(&[0, 1, 1, 1], &[0., 1., 0., 2.], &[0.; 4])?;
    buffer.get(1, 0.5, 1., 0.)?.count();
    let targets = buffer.critic_targets().to_vec2::<f32>()?;
    assert_close(&targets[0], &[0.75, 1.5, 1., 2.]);
    Ok(())
}

#[test]
fn gae_advantages_match_hand_computation() -> Result<()> {
    let mut buffer = single_episode(&[0, 1, 1], &[0., 0., 1.], &[0.5, 0.2, 0.4])?;
    buffer.get(1, 1., 1., 0.)?.count();
    // deltas [0, -0.3, 1.2], returns [0.9, 0.9, 1.2], then standardized
    let advantages = buffer.advantages().to_vec2::<f32>()?;
    assert_close(&advantages[0], &[-0.57735, -0.57735, 1.1547]);
    Ok(())
}

#[test]
fn degenerate_rows_produce_zero_advantages() -> Result<()> {
    let mut buffer = single_episode(&[0, 0, 0], &[0., 0., 0.], &[0.3, 0.1, 0.2])?;
    buffer.get(1, 1., 1., 0.)?.count();
    let advantages = buffer.advantages().to_vec2::<f32>()?;
    assert!(advantages[0].iter().all(|x| x.is_finite() && *x == 0.));
    Ok(())
}

#[test]
fn single_token_completion_yields_zero_advantages() -> Result<()> {
    // with gamma = lam = 1 every position inherits the last delta, so the row is constant
    for reward in [0.3f32, 1.3, 5.1, 17.3, 123.4] {
        let values = [0f32; 7];
        let mut rewards = [0f32; 7];
        rewards[6] = reward;
        let mut buffer = single_episode(&[0, 0, 0, 0, 0, 0, 1], &rewards, &values)?;
        buffer.get(1, 1., 1., 0.)?.count();
        let advantages = buffer.advantages().to_vec2::<f32>()?;
        assert_eq!(advantages[0], vec![0.; 7], "reward {reward}");
    }
    Ok(())
}

#[test]
fn summary_reports_episode_statistics() -> Result<()> {
    let mut buffer = full_buffer()?;
    buffer.get(EPISODES, 1., 1., 0.)?.count();
    let summary = buffer.summary()?;
    // rewards 1..=6 at the last completion token, completion lengths alternate 2 and 3
    assert!((summary.reward_mean - 3.5).abs() < 1e-5);
    assert!((summary.reward_std - 1.8708287).abs() < 1e-5);
    assert!((summary.augmented_reward - 3.5).abs() < 1e-5);
    assert!((summary.completion_length_mean - 2.5).abs() < 1e-5);
    assert!((summary.completion_length_std - 0.5477226).abs() < 1e-5);
    Ok(())
}

#[test]
fn reset_rewinds_without_clearing() -> Result<()> {
    let mut buffer = full_buffer()?;
    let before = buffer.rewards().to_vec2::<f32>()?;
    buffer.reset();
    assert_eq!(buffer.ptr(), 0);
    assert_eq!(buffer.state(), BufferState::Filling);
    assert_eq!(buffer.rewards().to_vec2::<f32>()?, before);
    Ok(())
}
