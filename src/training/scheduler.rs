//! Learning-rate schedule

use serde::{Deserialize, Serialize};

/// Linear warmup from 0 to `base_lr`, then linear decay to `min_lr`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearScheduler {
    base_lr: f64,
    min_lr: f64,
    total_steps: usize,
    warmup_steps: usize,
    current_step: usize,
}

impl LinearScheduler {
    pub fn new(base_lr: f64, min_lr: f64, total_steps: usize, warmup_steps: usize) -> Self {
        Self {
            base_lr,
            min_lr,
            total_steps,
            warmup_steps,
            current_step: 0,
        }
    }

    /// Learning rate for the current optimizer step
    pub fn lr(&self) -> f64 {
        if self.current_step < self.warmup_steps {
            return self.base_lr * self.current_step as f64 / self.warmup_steps as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let remaining = self.total_steps.saturating_sub(self.current_step) as f64;
        let decay_factor = (remaining / decay_steps as f64).clamp(0.0, 1.0);
        self.min_lr + (self.base_lr - self.min_lr) * decay_factor
    }

    pub fn step(&mut self) {
        self.current_step += 1;
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn is_done(&self) -> bool {
        self.current_step >= self.total_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_warmup_then_decay() {
        let mut scheduler = LinearScheduler::new(1e-3, 0.0, 10, 4);
        assert_relative_eq!(scheduler.lr(), 0.0);
        scheduler.step();
        assert_relative_eq!(scheduler.lr(), 2.5e-4);
        for _ in 0..3 {
            scheduler.step();
        }
        assert_relative_eq!(scheduler.lr(), 1e-3);
        for _ in 0..3 {
            scheduler.step();
        }
        assert_relative_eq!(scheduler.lr(), 5e-4);
        for _ in 0..3 {
            scheduler.step();
        }
        assert!(scheduler.is_done());
        assert_relative_eq!(scheduler.lr(), 0.0);
    }

    #[test]
    fn test_warmup_longer_than_training() {
        let mut scheduler = LinearScheduler::new(1e-3, 0.0, 3, 100);
        scheduler.step();
        assert_relative_eq!(scheduler.lr(), 1e-5);
    }

    #[test]
    fn test_no_warmup_starts_at_base() {
        let scheduler = LinearScheduler::new(2e-4, 0.0, 5, 0);
        assert_relative_eq!(scheduler.lr(), 2e-4);
    }
}
