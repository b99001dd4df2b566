use candle_core::{Result, Tensor, backprop::GradStore};
use candle_nn::{AdamW, Optimizer, VarMap};
use std::fmt::Debug;

pub struct OptimizerWithMaxGrad {
    pub optimizer: AdamW,
    pub max_grad_norm: Option<f32>,
    pub varmap: VarMap,
}

impl Debug for OptimizerWithMaxGrad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizerWithMaxGrad")
            .field("learning_rate", &self.optimizer.learning_rate())
            .field("max_grad_norm", &self.max_grad_norm)
            .finish()
    }
}

impl OptimizerWithMaxGrad {
    pub fn new(optimizer: AdamW, max_grad_norm: Option<f32>, varmap: VarMap) -> Self {
        Self {
            optimizer,
            max_grad_norm,
            varmap,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr)
    }

    /// Clips `grads` in place when a max norm is set, then applies them. Returns the global
    /// gradient norm before clipping, if it was computed.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<Option<f32>> {
        let norm = match self.max_grad_norm {
            Some(max_norm) => Some(clip_grad(grads, &self.varmap, max_norm)?),
            None => None,
        };
        self.optimizer.step(grads)?;
        Ok(norm)
    }
}

/// Rescales the gradients of every variable in `varmap` so that their global L2 norm is at
/// most `max_norm`. Returns the norm before rescaling.
pub fn clip_grad(grads: &mut GradStore, varmap: &VarMap, max_norm: f32) -> Result<f32> {
    let all_vars = varmap.all_vars();
    let mut total_norm_squared = 0f32;
    for var in all_vars.iter() {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total_norm_squared += grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    let total_norm = total_norm_squared.sqrt();
    if total_norm > max_norm {
        let clip_coef = (max_norm / (total_norm + 1e-6)) as f64;
        for var in all_vars.iter() {
            let clipped = match grads.get(var.as_tensor()) {
                Some(grad) => grad.affine(clip_coef, 0.)?,
                None => continue,
            };
            grads.insert(var.as_tensor(), clipped);
        }
    }
    Ok(total_norm)
}

/// Sums the gradients of several backward passes so that one optimizer step covers a whole
/// pass over the buffer.
#[derive(Default)]
pub struct GradAccumulator {
    grads: Option<GradStore>,
    batches: usize,
}

impl GradAccumulator {
    pub fn accumulate(&mut self, loss: &Tensor, varmap: &VarMap) -> Result<()> {
        let new = loss.backward()?;
        let grads = match self.grads.take() {
            None => new,
            Some(mut acc) => {
                for var in varmap.all_vars() {
                    let Some(grad) = new.get(var.as_tensor()) else {
                        continue;
                    };
                    let summed = match acc.get(var.as_tensor()) {
                        Some(prev) => (prev + grad)?,
                        None => grad.clone(),
                    };
                    acc.insert(var.as_tensor(), summed);
                }
                acc
            }
        };
        self.grads = Some(grads);
        self.batches += 1;
        Ok(())
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn take(&mut self) -> Option<GradStore> {
        self.batches = 0;
        self.grads.take()
    }
}
