//! Progress reporting hooks for the solver loop.

use tracing::info;

/// State of the solver after one iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub iteration: u32,
    pub max_difference: f64,
}

/// Receives progress from [`crate::vfi::Solver`] between sweeps.
pub trait Observer {
    fn on_iteration(&mut self, progress: &Progress);

    /// Called once, after the last iteration.
    fn on_finish(&mut self, _progress: &Progress, _converged: bool) {}
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl Observer for Silent {
    fn on_iteration(&mut self, _progress: &Progress) {}
}

impl<F> Observer for F
where
    F: FnMut(&Progress),
{
    fn on_iteration(&mut self, progress: &Progress) {
        self(progress)
    }
}

/// Logs `Iteration = n, Sup Diff = d` on the first iteration, every `every`
/// iterations, and once more when the solver stops.
#[derive(Debug, Clone, Copy)]
pub struct LogObserver {
    every: u32,
}

impl LogObserver {
    pub fn new(every: u32) -> Self {
        Self { every: every.max(1) }
    }

    fn should_report(&self, iteration: u32) -> bool {
        iteration == 1 || iteration % self.every == 0
    }

    /// The last iteration is logged once, even if it was also periodic.
    fn should_report_finish(&self, iteration: u32) -> bool {
        !self.should_report(iteration)
    }
}

impl Default for LogObserver {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Observer for LogObserver {
    fn on_iteration(&mut self, progress: &Progress) {
        if self.should_report(progress.iteration) {
            info!(
                "Iteration = {}, Sup Diff = {}",
                progress.iteration, progress.max_difference
            );
        }
    }

    fn on_finish(&mut self, progress: &Progress, converged: bool) {
        if !self.should_report_finish(progress.iteration) {
            return;
        }
        info!(
            converged,
            "Iteration = {}, Sup Diff = {}", progress.iteration, progress.max_difference
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_observer_reports_first_and_every_nth() {
        let obs = LogObserver::new(10);
        let reported: Vec<u32> = (1..=35).filter(|&i| obs.should_report(i)).collect();
        assert_eq!(reported, vec![1, 10, 20, 30]);
    }

    #[test]
    fn final_iteration_is_reported_once() {
        let obs = LogObserver::new(10);
        let lines = |last: u32| {
            let periodic = (1..=last).filter(|&i| obs.should_report(i)).count();
            periodic + usize::from(obs.should_report_finish(last))
        };
        // 257 is not periodic: 1, 10, ..., 250 plus the final line.
        assert_eq!(lines(257), 27);
        // 260 is periodic: the final line is already out.
        assert_eq!(lines(260), 27);
        assert_eq!(lines(1), 1);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let obs = LogObserver::new(0);
        assert!(obs.should_report(7));
    }

    #[test]
    fn closures_are_observers() {
        let mut last = 0;
        {
            let mut obs = |p: &Progress| last = p.iteration;
            obs.on_iteration(&Progress {
                iteration: 4,
                max_difference: 0.5,
            });
            obs.on_finish(
                &Progress {
                    iteration: 4,
                    max_difference: 0.5,
                },
                true,
            );
        }
        assert_eq!(last, 4);
    }
}
