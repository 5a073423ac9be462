use anyhow::{ensure, Context, Result};
use cartpole_protocol::Hyperparameters;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MIN_HIDDEN: usize = 16;
pub const MAX_HIDDEN: usize = 256;
pub const MAX_SPEED: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub seed: u64,
    /// Training speed multiplier, 1–10.
    pub speed: u32,
    pub hyperparameters: Hyperparameters,
}

impl Default for Config {
    fn default() -> Self {
        Config { seed: 0, speed: 5, hyperparameters: Hyperparameters::default() }
    }
}

impl Config {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!((1..=MAX_SPEED).contains(&self.speed), "speed must be in 1..={MAX_SPEED}, got {}", self.speed);
        validate_hyperparameters(&self.hyperparameters)
    }
}

pub fn validate_hyperparameters(hp: &Hyperparameters) -> Result<()> {
    ensure!(
        (MIN_HIDDEN..=MAX_HIDDEN).contains(&hp.hidden_size),
        "hidden size must be in {MIN_HIDDEN}..={MAX_HIDDEN}, got {}",
        hp.hidden_size
    );
    ensure!((1..=3).contains(&hp.depth), "depth must be in 1..=3, got {}", hp.depth);
    validate_learning_rate(hp.learning_rate)?;
    ensure!((0.9..=1.0).contains(&hp.discount), "discount must be in [0.9, 1], got {}", hp.discount);
    ensure!(
        (0.0..=0.1).contains(&hp.entropy_coef),
        "entropy coefficient must be in [0, 0.1], got {}",
        hp.entropy_coef
    );
    ensure!((0.0..=1.0).contains(&hp.gae_lambda), "GAE lambda must be in [0, 1], got {}", hp.gae_lambda);
    ensure!(hp.value_coef > 0.0, "value coefficient must be positive, got {}", hp.value_coef);
    ensure!(hp.max_grad_norm > 0.0, "max gradient norm must be positive, got {}", hp.max_grad_norm);
    ensure!(
        hp.lr_decay > 0.0 && hp.lr_decay <= 1.0,
        "learning-rate decay must be in (0, 1], got {}",
        hp.lr_decay
    );
    Ok(())
}

pub fn validate_learning_rate(lr: f64) -> Result<()> {
    ensure!((1e-4..=1e-2).contains(&lr), "learning rate must be in [1e-4, 1e-2], got {lr}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_out_of_range() {
        let bad = [
            Hyperparameters { hidden_size: 0, ..Default::default() },
            Hyperparameters { hidden_size: 15, ..Default::default() },
            Hyperparameters { hidden_size: 257, ..Default::default() },
            Hyperparameters { depth: 4, ..Default::default() },
            Hyperparameters { learning_rate: 0.5, ..Default::default() },
            Hyperparameters { discount: 0.5, ..Default::default() },
            Hyperparameters { entropy_coef: 0.2, ..Default::default() },
            Hyperparameters { gae_lambda: 1.5, ..Default::default() },
            Hyperparameters { value_coef: 0.0, ..Default::default() },
            Hyperparameters { max_grad_norm: -1.0, ..Default::default() },
            Hyperparameters { lr_decay: 0.0, ..Default::default() },
            Hyperparameters { learning_rate: f64::NAN, ..Default::default() },
        ];
        for hp in bad {
            assert!(validate_hyperparameters(&hp).is_err(), "accepted {hp:?}");
        }
        let cfg = Config { speed: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_hidden_size_bounds_inclusive() {
        for hidden_size in [MIN_HIDDEN, MAX_HIDDEN] {
            validate_hyperparameters(&Hyperparameters { hidden_size, ..Default::default() }).unwrap();
        }
    }

    #[test]
    fn test_load_partial_file() {
        let path = std::env::temp_dir().join(format!("cartpole-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"seed": 9, "hyperparameters": {"depth": 3, "activation": "tanh"}}"#).unwrap();
        let cfg = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.seed, 9);
        assert_eq!(cfg.speed, 5);
        assert_eq!(cfg.hyperparameters.depth, 3);
        assert_eq!(cfg.hyperparameters.hidden_size, 32);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/cartpole.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
