use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerOption {
    AdamW { lr: f64, weight_decay: f64 },
    Sgd { lr: f64 },
}

impl OptimizerOption {
    pub fn lr(&self) -> f64 {
        match self {
            OptimizerOption::AdamW { lr, .. } | OptimizerOption::Sgd { lr } => *lr,
        }
    }
}

pub enum TrainOptimizer {
    AdamW(AdamW),
    Sgd(SGD),
}

impl std::fmt::Debug for TrainOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            TrainOptimizer::AdamW(_) => "AdamW",
            TrainOptimizer::Sgd(_) => "Sgd",
        };
        f.debug_struct("TrainOptimizer")
            .field("kind", &kind)
            .field("lr", &self.learning_rate())
            .finish()
    }
}

impl TrainOptimizer {
    pub fn backward_step(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        match self {
            TrainOptimizer::AdamW(opt) => opt.backward_step(loss),
            TrainOptimizer::Sgd(opt) => opt.backward_step(loss),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            TrainOptimizer::AdamW(opt) => opt.learning_rate(),
            TrainOptimizer::Sgd(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            TrainOptimizer::AdamW(opt) => opt.set_learning_rate(lr),
            TrainOptimizer::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

pub fn create_optimizer(opt: &OptimizerOption, vars: Vec<Var>) -> anyhow::Result<TrainOptimizer> {
    Ok(match opt {
        OptimizerOption::AdamW { lr, weight_decay } => {
            let params = ParamsAdamW {
                lr: *lr,
                weight_decay: *weight_decay,
                ..Default::default()
            };
            TrainOptimizer::AdamW(AdamW::new(vars, params)?)
        }
        OptimizerOption::Sgd { lr } => TrainOptimizer::Sgd(SGD::new(vars, *lr)?),
    })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerOption {
    Constant,
    Step { step_size: usize, gamma: f64 },
    Exponential { gamma: f64 },
    Cosine { eta_min: f64 },
}

/// Per-epoch learning-rate schedule.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    option: SchedulerOption,
    base_lr: f64,
    n_epoch: usize,
    epoch: usize,
}

pub fn create_scheduler(
    opt: &SchedulerOption,
    base_lr: f64,
    n_epoch: usize,
) -> anyhow::Result<LrScheduler> {
    if let SchedulerOption::Step { step_size: 0, .. } = opt {
        anyhow::bail!("Step scheduler needs step_size > 0");
    }
    Ok(LrScheduler {
        option: opt.clone(),
        base_lr,
        n_epoch: n_epoch.max(1),
        epoch: 0,
    })
}

impl LrScheduler {
    pub fn lr_at(&self, epoch: usize) -> f64 {
        match &self.option {
            SchedulerOption::Constant => self.base_lr,
            SchedulerOption::Step { step_size, gamma } => {
                self.base_lr * gamma.powi((epoch / step_size) as i32)
            }
            SchedulerOption::Exponential { gamma } => self.base_lr * gamma.powi(epoch as i32),
            SchedulerOption::Cosine { eta_min } => {
                let progress = epoch.min(self.n_epoch) as f64 / self.n_epoch as f64;
                eta_min
                    + (self.base_lr - eta_min) * (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0
            }
        }
    }

    /// Advance one epoch and write the new rate into `optimizer`.
    pub fn step(&mut self, optimizer: &mut TrainOptimizer) -> f64 {
        self.epoch += 1;
        let lr = self.lr_at(self.epoch);
        optimizer.set_learning_rate(lr);
        lr
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn scheduler(opt: SchedulerOption) -> LrScheduler {
        create_scheduler(&opt, 0.1, 10).unwrap()
    }

    #[test]
    fn step_decays_every_step_size_epochs() {
        let s = scheduler(SchedulerOption::Step {
            step_size: 3,
            gamma: 0.5,
        });
        assert_eq!(s.lr_at(0), 0.1);
        assert_eq!(s.lr_at(2), 0.1);
        assert_eq!(s.lr_at(3), 0.05);
        assert_eq!(s.lr_at(7), 0.025);
    }

    #[test]
    fn cosine_reaches_eta_min_at_final_epoch() {
        let s = scheduler(SchedulerOption::Cosine { eta_min: 0.001 });
        assert!((s.lr_at(0) - 0.1).abs() < 1e-12);
        assert!((s.lr_at(5) - (0.001 + 0.099 / 2.0)).abs() < 1e-12);
        assert!((s.lr_at(10) - 0.001).abs() < 1e-12);
        assert!((s.lr_at(50) - 0.001).abs() < 1e-12);
    }

    #[test]
    fn step_writes_rate_into_optimizer() {
        let var = Var::zeros(4, DType::F32, &Device::Cpu).unwrap();
        let mut optimizer =
            create_optimizer(&OptimizerOption::Sgd { lr: 0.1 }, vec![var]).unwrap();
        let mut s = scheduler(SchedulerOption::Exponential { gamma: 0.5 });
        let lr = s.step(&mut optimizer);
        assert_eq!(s.epoch(), 1);
        assert!((lr - 0.05).abs() < 1e-12);
        assert!((optimizer.learning_rate() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn invalid_schedules_are_rejected() {
        assert!(create_scheduler(&SchedulerOption::Constant, 0.1, 0).is_ok());
        assert!(create_scheduler(
            &SchedulerOption::Step {
                step_size: 0,
                gamma: 0.1
            },
            0.1,
            10
        )
        .is_err());
    }

    #[test]
    fn adamw_optimizer_minimises_a_quadratic() {
        let var = Var::new(&[3f32, -2.0], &Device::Cpu).unwrap();
        let mut optimizer = create_optimizer(
            &OptimizerOption::AdamW {
                lr: 0.1,
                weight_decay: 0.0,
            },
            vec![var.clone()],
        )
        .unwrap();
        for _ in 0..200 {
            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            optimizer.backward_step(&loss).unwrap();
        }
        let values = var.as_tensor().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.abs() < 0.5), "{values:?}");
    }
}
