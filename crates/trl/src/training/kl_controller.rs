//! KL-penalty coefficient control.

use super::config::TrainerConfig;

/// Smallest coefficient the adaptive controller will produce
pub const MIN_KL_COEF: f64 = 1e-6;

/// Proportional error is clipped to this magnitude before each update
const MAX_PROPORTIONAL_ERROR: f64 = 0.2;

/// Trait for KL-coefficient controllers.
///
/// `update` is called once per rollout batch, after every optimization epoch
/// on that batch has finished.
pub trait KlController: Send {
    /// Current coefficient (beta)
    fn value(&self) -> f64;

    /// Feed the batch's mean per-token KL; `n_steps` is the batch size.
    fn update(&mut self, current_kl: f64, n_steps: usize);

    /// Overwrite the coefficient (used when resuming from a checkpoint)
    fn set_value(&mut self, value: f64);
}

/// Adaptive controller: `beta *= 1 + clip(kl / target - 1, -0.2, 0.2) * n_steps / horizon`.
#[derive(Clone, Debug)]
pub struct AdaptiveKlController {
    value: f64,
    target: f64,
    horizon: f64,
}

impl AdaptiveKlController {
    pub fn new(init_kl_coef: f64, target: f64, horizon: f64) -> Self {
        Self {
            value: init_kl_coef,
            target,
            horizon,
        }
    }

    pub fn target(&self) -> f64 {
        self.target
    }
}

impl KlController for AdaptiveKlController {
    fn value(&self) -> f64 {
        self.value
    }

    fn update(&mut self, current_kl: f64, n_steps: usize) {
        let proportional_error = (current_kl / self.target - 1.0)
            .clamp(-MAX_PROPORTIONAL_ERROR, MAX_PROPORTIONAL_ERROR);
        if !proportional_error.is_finite() {
            tracing::warn!(kl = current_kl, "Skipping KL controller update");
            return;
        }
        let mult = 1.0 + proportional_error * n_steps as f64 / self.horizon;
        self.value = (self.value * mult).max(MIN_KL_COEF);
    }

    fn set_value(&mut self, value: f64) {
        self.value = value.max(MIN_KL_COEF);
    }
}

/// Constant coefficient
#[derive(Clone, Debug)]
pub struct FixedKlController {
    value: f64,
}

impl FixedKlController {
    pub fn new(kl_coef: f64) -> Self {
        Self { value: kl_coef }
    }
}

impl KlController for FixedKlController {
    fn value(&self) -> f64 {
        self.value
    }

    fn update(&mut self, _current_kl: f64, _n_steps: usize) {}

    fn set_value(&mut self, value: f64) {
        self.value = value;
    }
}

/// Build the controller selected by `adap_kl_ctrl`
pub fn from_config(config: &TrainerConfig) -> Box<dyn KlController> {
    if config.adap_kl_ctrl {
        Box::new(AdaptiveKlController::new(
            config.init_kl_coef,
            config.target,
            config.horizon,
        ))
    } else {
        Box::new(FixedKlController::new(config.init_kl_coef))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_point_at_target() {
        let mut ctl = AdaptiveKlController::new(0.2, 6.0, 10_000.0);
        ctl.update(6.0, 256);
        assert!((ctl.value() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_increases_above_target() {
        let mut ctl = AdaptiveKlController::new(0.2, 6.0, 10_000.0);
        ctl.update(9.0, 256);
        // error clipped to 0.2
        let expected = 0.2 * (1.0 + 0.2 * 256.0 / 10_000.0);
        assert!((ctl.value() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_decreases_below_target() {
        let mut ctl = AdaptiveKlController::new(0.2, 6.0, 10_000.0);
        ctl.update(5.7, 256);
        let expected = 0.2 * (1.0 - 0.05 * 256.0 / 10_000.0);
        assert!((ctl.value() - expected).abs() < 1e-12);
        assert!(ctl.value() < 0.2);
    }

    #[test]
    fn test_floor_prevents_sign_flip() {
        // horizon shorter than the batch would drive beta negative without the floor
        let mut ctl = AdaptiveKlController::new(0.2, 1.0, 10.0);
        ctl.update(0.0, 1_000);
        assert_eq!(ctl.value(), MIN_KL_COEF);
    }

    #[test]
    fn test_non_finite_kl_is_ignored() {
        let mut ctl = AdaptiveKlController::new(0.2, 1.0, 100.0);
        ctl.update(f64::NAN, 8);
        assert_eq!(ctl.value(), 0.2);
    }

    #[test]
    fn test_fixed_controller() {
        let mut ctl = FixedKlController::new(0.05);
        ctl.update(100.0, 256);
        assert_eq!(ctl.value(), 0.05);
    }

    #[test]
    fn test_from_config() {
        let config = TrainerConfig::default().with_fixed_kl(0.3);
        let mut ctl = from_config(&config);
        ctl.update(10.0, 256);
        assert_eq!(ctl.value(), 0.3);

        let mut ctl = from_config(&TrainerConfig::default());
        ctl.update(10.0, 256);
        assert!(ctl.value() > 0.2);
    }
}
