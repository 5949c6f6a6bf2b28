//! Graded practice set: a fixed batch of trials generated up front that has
//! to be answered correctly in one attempt.

use rand::Rng;

use crate::config::ExperimentConfig;
use crate::layout::{apply_change, assign_colors, generate_layout, Change, Position};

#[derive(Debug, Clone, PartialEq)]
pub struct PracticeTrialSpec {
    pub has_change: bool,
    pub layout: Vec<Position>,
    pub test_layout: Vec<Position>,
    pub color_assignment: Vec<usize>,
    pub change: Option<Change>,
}

impl PracticeTrialSpec {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R, cfg: &ExperimentConfig) -> Self {
        let has_change = rng.gen::<f64>() < cfg.change_probability;
        let area = cfg.stimulus_area();
        let layout = generate_layout(rng, &area, cfg.num_stimuli);
        let (test_layout, change) = if has_change {
            let (test, change) = apply_change(rng, &area, &cfg.change_params(), &layout);
            (test, Some(change))
        } else {
            (layout.clone(), None)
        };
        let color_assignment = assign_colors(rng, cfg.num_stimuli);

        Self {
            has_change,
            layout,
            test_layout,
            color_assignment,
            change,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PracticeSession {
    pub trials: Vec<PracticeTrialSpec>,
    pub practice_index: usize,
    pub practice_correct_count: usize,
    pub attempt_number: u32,
}

impl PracticeSession {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R, cfg: &ExperimentConfig) -> Self {
        Self {
            trials: Self::fresh_set(rng, cfg),
            practice_index: 0,
            practice_correct_count: 0,
            attempt_number: 1,
        }
    }

    fn fresh_set<R: Rng + ?Sized>(rng: &mut R, cfg: &ExperimentConfig) -> Vec<PracticeTrialSpec> {
        (0..cfg.practice_trials.max(1))
            .map(|_| PracticeTrialSpec::generate(rng, cfg))
            .collect()
    }

    pub fn current(&self) -> Option<&PracticeTrialSpec> {
        self.trials.get(self.practice_index)
    }

    /// Credit the current trial and move on. True once the whole set is done.
    pub(crate) fn record_correct(&mut self) -> bool {
        self.practice_correct_count += 1;
        self.practice_index += 1;
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.practice_correct_count >= self.trials.len()
    }

    /// Throw the whole set away after a miss and start a new attempt.
    pub(crate) fn restart<R: Rng + ?Sized>(&mut self, rng: &mut R, cfg: &ExperimentConfig) {
        self.trials = Self::fresh_set(rng, cfg);
        self.practice_index = 0;
        self.practice_correct_count = 0;
        self.attempt_number += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn generates_three_eager_trials() {
        let mut rng = StdRng::seed_from_u64(21);
        let cfg = ExperimentConfig::default();
        let p = PracticeSession::generate(&mut rng, &cfg);
        assert_eq!(p.trials.len(), 3);
        assert_eq!(p.attempt_number, 1);
        for t in &p.trials {
            assert_eq!(t.layout.len(), cfg.num_stimuli);
            assert_eq!(t.test_layout.len(), cfg.num_stimuli);
            assert_eq!(t.color_assignment.len(), cfg.num_stimuli);
            assert_eq!(t.has_change, t.change.is_some());
            if !t.has_change {
                assert_eq!(t.layout, t.test_layout);
            }
        }
    }

    #[test]
    fn forced_change_probability() {
        let mut rng = StdRng::seed_from_u64(3);
        let always = ExperimentConfig {
            change_probability: 1.0,
            ..ExperimentConfig::default()
        };
        let never = ExperimentConfig {
            change_probability: 0.0,
            ..ExperimentConfig::default()
        };
        assert!(PracticeSession::generate(&mut rng, &always)
            .trials
            .iter()
            .all(|t| t.has_change));
        assert!(PracticeSession::generate(&mut rng, &never)
            .trials
            .iter()
            .all(|t| !t.has_change));
    }

    #[test]
    fn restart_regenerates_and_bumps_attempt() {
        let mut rng = StdRng::seed_from_u64(5);
        let cfg = ExperimentConfig::default();
        let mut p = PracticeSession::generate(&mut rng, &cfg);
        let first_set = p.trials.clone();

        assert!(!p.record_correct());
        p.restart(&mut rng, &cfg);

        assert_eq!(p.attempt_number, 2);
        assert_eq!(p.practice_index, 0);
        assert_eq!(p.practice_correct_count, 0);
        assert_ne!(p.trials, first_set);
    }

    #[test]
    fn completes_after_all_correct() {
        let mut rng = StdRng::seed_from_u64(9);
        let cfg = ExperimentConfig::default();
        let mut p = PracticeSession::generate(&mut rng, &cfg);
        assert!(!p.record_correct());
        assert!(!p.record_correct());
        assert!(p.record_correct());
        assert!(p.current().is_none());
    }
}
