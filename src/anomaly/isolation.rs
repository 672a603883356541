//! Isolation-style scoring.
//!
//! Each round draws a random subsample of the history together with the
//! candidate value and splits it at random points, keeping the side that
//! holds the candidate, until the candidate is alone or the height limit is
//! hit. Values that isolate quickly are anomalous:
//! `score = 2^(-avg_path / c(psi))`.

use fastrand::Rng;

use crate::config::AnomalyConfig;
use crate::error::AnalysisResult;

use super::{
    sample_adequacy, AnomalyDetector, ContributingFactor, DetectionContext, DetectorCategory,
    DetectorVerdict, FactorType,
};

const EULER_GAMMA: f64 = 0.577_215_664_9;

/// Average path length of an unsuccessful search in a binary search tree of
/// `n` nodes.
pub fn expected_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

pub struct IsolationDetector {
    trees: usize,
    subsample: usize,
    threshold: f64,
    seed: Option<u64>,
    min_samples: usize,
}

impl IsolationDetector {
    pub fn new(trees: usize, subsample: usize, threshold: f64, min_samples: usize) -> Self {
        Self {
            trees: trees.max(1),
            subsample: subsample.max(2),
            threshold,
            seed: None,
            min_samples,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn from_config(config: &AnomalyConfig) -> Self {
        let detector = Self::new(
            config.isolation_trees,
            config.isolation_subsample,
            config.isolation_threshold,
            config.min_samples,
        );
        match config.isolation_seed {
            Some(seed) => detector.with_seed(seed),
            None => detector,
        }
    }

    /// Isolation score of `candidate` against `values`
    pub fn score(&self, values: &[f64], candidate: f64) -> f64 {
        let mut rng = match self.seed {
            Some(seed) => Rng::with_seed(seed),
            None => Rng::new(),
        };

        // The candidate occupies one slot of the subsample.
        let psi = (self.subsample - 1).min(values.len()) + 1;
        let height_limit = (psi as f64).log2().ceil() as usize;
        let mut indices: Vec<usize> = (0..values.len()).collect();

        let mut total = 0.0;
        for _ in 0..self.trees {
            // Partial Fisher-Yates: the first psi - 1 slots become the sample.
            for i in 0..psi - 1 {
                let j = rng.usize(i..indices.len());
                indices.swap(i, j);
            }
            let mut sample: Vec<f64> = indices[..psi - 1].iter().map(|&i| values[i]).collect();
            sample.push(candidate);
            total += path_length(&mut rng, sample, candidate, height_limit);
        }

        let avg_path = total / self.trees as f64;
        let normaliser = expected_path_length(psi);
        if normaliser <= 0.0 {
            return 0.0;
        }
        2f64.powf(-avg_path / normaliser)
    }
}

fn path_length(rng: &mut Rng, mut data: Vec<f64>, candidate: f64, height_limit: usize) -> f64 {
    let mut depth = 0usize;
    loop {
        if data.len() <= 1 || depth >= height_limit {
            return depth as f64 + expected_path_length(data.len());
        }

        let (min, max) = data
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        if max - min <= f64::EPSILON {
            return depth as f64 + expected_path_length(data.len());
        }

        let split = min + rng.f64() * (max - min);
        if candidate < split {
            data.retain(|v| *v < split);
        } else {
            data.retain(|v| *v >= split);
        }
        depth += 1;
    }
}

impl AnomalyDetector for IsolationDetector {
    fn name(&self) -> &'static str {
        "isolation"
    }

    fn category(&self) -> DetectorCategory {
        DetectorCategory::Statistical
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> AnalysisResult<DetectorVerdict> {
        if ctx.values.len() < self.min_samples.max(2) {
            return Ok(DetectorVerdict::abstain());
        }

        let current = ctx.current_value();
        let score = self.score(&ctx.values, current);
        let confidence = sample_adequacy(ctx.values.len(), self.min_samples);

        if score <= self.threshold {
            return Ok(DetectorVerdict::normal(score, confidence));
        }

        let factor = ContributingFactor::new(
            FactorType::Isolation,
            format!("value {:.2} isolates quickly (isolation score {:.2})", current, score),
            confidence,
            score,
        );
        Ok(DetectorVerdict::anomalous(score, confidence, factor))
    }
}
