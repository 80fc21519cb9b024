use std::f64::consts::PI;

/// Linear warmup followed by cosine decay to zero.
///
/// Indexed by optimizer updates, never by micro-batches. Warmup starts at
/// `base_lr / warmup_steps` and reaches `base_lr` at `warmup_steps`; the
/// cosine phase then ends at exactly 0 on `total_steps` and stays there.
#[derive(Debug, Clone)]
pub struct WarmupCosine {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
}

impl WarmupCosine {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps: warmup_steps.max(1),
            total_steps,
            step: 0,
        }
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        let warmup = self.warmup_steps as f64;
        if step < self.warmup_steps {
            let start_factor = 1.0 / warmup;
            let factor = start_factor + (1.0 - start_factor) * step as f64 / warmup;
            return self.base_lr * factor;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps);
        if step >= self.total_steps || decay_steps == 0 {
            return 0.0;
        }
        let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;
        0.5 * self.base_lr * (1.0 + (PI * progress).cos())
    }

    /// Learning rate for the next update.
    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.step)
    }

    /// Advances by one optimizer update and returns the new rate.
    pub fn step(&mut self) -> f64 {
        self.step += 1;
        self.current_lr()
    }

    /// Fast-forwards to `step`, used when resuming from a checkpoint.
    pub fn set_step(&mut self, step: usize) {
        self.step = step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * b.abs().max(1.0)
    }

    #[test]
    fn test_schedule_endpoints() {
        let base = 2.5e-4;
        let schedule = WarmupCosine::new(base, 2000, 10000);
        assert!(close(schedule.lr_at(0), base / 2000.0));
        assert!(close(schedule.lr_at(2000), base));
        assert_eq!(schedule.lr_at(10000), 0.0);
        assert_eq!(schedule.lr_at(12000), 0.0);
    }

    #[test]
    fn test_warmup_is_linear_and_decay_monotone() {
        let schedule = WarmupCosine::new(1.0, 100, 1000);
        let d1 = schedule.lr_at(11) - schedule.lr_at(10);
        let d2 = schedule.lr_at(51) - schedule.lr_at(50);
        assert!((d1 - d2).abs() < 1e-12);

        let mut prev = schedule.lr_at(100);
        for step in 101..=1000 {
            let lr = schedule.lr_at(step);
            assert!(lr <= prev);
            prev = lr;
        }
        assert!(close(schedule.lr_at(550), 0.5));
    }

    #[test]
    fn test_step_advances_once_per_update() {
        let mut schedule = WarmupCosine::new(1.0, 4, 8);
        assert!(close(schedule.current_lr(), 0.25));
        let lr = schedule.step();
        assert!(close(lr, schedule.lr_at(1)));
        assert!(close(schedule.current_lr(), lr));
        schedule.set_step(8);
        assert_eq!(schedule.current_lr(), 0.0);
    }

    #[test]
    fn test_total_shorter_than_warmup() {
        let schedule = WarmupCosine::new(1.0, 10, 5);
        assert!(schedule.lr_at(3) > 0.0);
        assert_eq!(schedule.lr_at(10), 0.0);
    }
}
