//! Up and down time generators driving churn.

use std::time::Duration;

use rand_distr::{Distribution, Exp, ExpError};

use super::SimulationRng;

/// Produces the successive intervals a churn loop sleeps for. One generator is
/// shared by every node loop of a run.
pub trait IntervalGenerator: Send + Sync + 'static {
    fn next_interval(&self) -> Duration;
}

impl<F> IntervalGenerator for F
where
    F: Fn() -> Duration + Send + Sync + 'static,
{
    fn next_interval(&self) -> Duration {
        self()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedInterval(pub Duration);

impl IntervalGenerator for FixedInterval {
    fn next_interval(&self) -> Duration {
        self.0
    }
}

/// Uniform in `[min, max)`.
#[derive(Debug, Clone)]
pub struct UniformInterval {
    min: Duration,
    max: Duration,
    rng: SimulationRng,
}

impl UniformInterval {
    pub fn new(min: Duration, max: Duration, rng: SimulationRng) -> Self {
        Self { min, max, rng }
    }
}

impl IntervalGenerator for UniformInterval {
    fn next_interval(&self) -> Duration {
        self.rng.gen_duration(self.min..self.max)
    }
}

/// Exponentially distributed intervals, memoryless session lengths.
#[derive(Debug, Clone)]
pub struct ExponentialInterval {
    sampler: Exp<f64>,
    rng: SimulationRng,
}

impl ExponentialInterval {
    pub fn new(mean: Duration, rng: SimulationRng) -> Result<Self, ExpError> {
        Ok(Self {
            sampler: Exp::new(1.0 / mean.as_secs_f64())?,
            rng,
        })
    }
}

impl IntervalGenerator for ExponentialInterval {
    fn next_interval(&self) -> Duration {
        let secs = self.sampler.sample(&mut *self.rng.lock());
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_generators() {
        let generator: Box<dyn IntervalGenerator> = Box::new(|| Duration::from_millis(5));
        assert_eq!(generator.next_interval(), Duration::from_millis(5));
        assert_eq!(
            FixedInterval(Duration::from_secs(1)).next_interval(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn uniform_stays_in_bounds() {
        let min = Duration::from_millis(20);
        let max = Duration::from_millis(40);
        let generator = UniformInterval::new(min, max, SimulationRng::new(1));
        for _ in 0..200 {
            let interval = generator.next_interval();
            assert!(interval >= min && interval < max);
        }
    }

    #[test]
    fn exponential_has_the_requested_mean() {
        let generator =
            ExponentialInterval::new(Duration::from_millis(100), SimulationRng::new(2)).unwrap();
        let n = 5_000;
        let total: Duration = (0..n).map(|_| generator.next_interval()).sum();
        let mean_ms = total.as_secs_f64() * 1_000.0 / n as f64;
        assert!((mean_ms - 100.0).abs() < 10.0, "mean was {mean_ms}");
    }
}
