/// Exponentially annealed relaxation temperature,
/// `tau(t) = max(tau_min, tau_0 * exp(-r * t))`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TemperatureSchedule {
    pub initial: f64,
    pub minimum: f64,
    pub decay_rate: f64,
}

impl Default for TemperatureSchedule {
    fn default() -> Self {
        TemperatureSchedule {
            initial: 1.0,
            minimum: 0.1,
            decay_rate: 1e-3,
        }
    }
}

impl TemperatureSchedule {
    pub fn new(initial: f64, minimum: f64, decay_rate: f64) -> Self {
        TemperatureSchedule {
            initial,
            minimum,
            decay_rate,
        }
    }

    pub fn at_step(&self, step: usize) -> f64 {
        (self.initial * (-self.decay_rate * step as f64).exp()).max(self.minimum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decays_to_the_floor() {
        let sched = TemperatureSchedule::new(2.0, 0.5, 0.1);
        assert_eq!(sched.at_step(0), 2.0);

        let temps = (0..100).map(|t| sched.at_step(t)).collect::<Vec<_>>();
        assert!(temps.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(temps[99], 0.5);
    }
}
