use crate::optimizer::OptimizerWithMaxGrad;

/// Linear decay from `base_lr` to zero over `total_steps`, no warmup.
#[derive(Debug, Clone)]
pub struct LinearLrSchedule {
    base_lr: f64,
    total_steps: usize,
    current_step: usize,
}

impl LinearLrSchedule {
    pub fn new(base_lr: f64, total_steps: usize) -> Self {
        Self {
            base_lr,
            total_steps,
            current_step: 0,
        }
    }

    /// Learning rate after `step` schedule steps. A zero step budget keeps the base rate.
    pub fn lr_at(&self, step: usize) -> f64 {
        if self.total_steps == 0 {
            return self.base_lr;
        }
        let remaining = self.total_steps.saturating_sub(step);
        self.base_lr * remaining as f64 / self.total_steps as f64
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Advances the schedule by one step and writes the new rate into `optimizer`.
    pub fn step(&mut self, optimizer: &mut OptimizerWithMaxGrad) -> f64 {
        self.current_step = (self.current_step + 1).min(self.total_steps);
        let lr = self.lr_at(self.current_step);
        optimizer.set_learning_rate(lr);
        lr
    }
}
