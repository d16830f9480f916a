use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{common_len, distinct_labels, Classifier, Model};
use crate::*;

/// Solver parameters of the linear SVM.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SvmParams {
    /// Soft margin penalty.
    pub c: f64,
    /// Maximum passes over the training data.
    pub iterations: usize,
    /// Stopping tolerance on the projected gradient spread.
    pub eps: f64,
    /// Seed for the per-pass visiting order.
    pub seed: u64,
}

impl Default for SvmParams {
    fn default() -> Self {
        Self {
            c: 10.,
            iterations: 1000,
            eps: 1e-3,
            seed: 0,
        }
    }
}

/// One-vs-rest linear SVM (hinge loss) trained by dual coordinate descent,
/// with the bias folded in as an extra constant feature.
///
/// Consumes histograms only through their sparse encoding.
pub struct LinearSvm {
    params: SvmParams,
}

struct SvmModel {
    labels: Vec<Label>,
    /// `weights[c]` has `dim + 1` entries; the last one is the bias.
    weights: Vec<Vec<f64>>,
}

impl LinearSvm {
    pub fn new(params: SvmParams) -> Self {
        Self { params }
    }

    fn check_parameters(&self, labels: &[Label]) -> BofResult<()> {
        let p = &self.params;
        let problem = if !(p.c > 0.) {
            Some(format!("c must be > 0, got {}", p.c))
        } else if p.iterations == 0 {
            Some("iterations must be > 0".to_string())
        } else if !(p.eps > 0.) {
            Some(format!("eps must be > 0, got {}", p.eps))
        } else if labels.len() < 2 {
            Some(format!("need at least two classes, got {}", labels.len()))
        } else {
            None
        };
        match problem {
            Some(msg) => Err(BofErr::InfeasibleParameters(format!("svm: {}", msg))),
            None => Ok(()),
        }
    }

    /// Binary problem: `y[i]` is +1 or -1. Returns the augmented weight vector.
    fn train_binary(&self, x: &[Vec<SparseNode>], y: &[f64], dim: usize) -> Vec<f64> {
        let c = self.params.c;
        let mut w = vec![0f64; dim + 1];
        let mut alpha = vec![0f64; x.len()];
        let q: Vec<f64> = x.iter().map(|xi| dot_self(xi) + 1.).collect();
        let mut order: Vec<usize> = (0..x.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.params.seed);

        for pass in 0..self.params.iterations {
            order.shuffle(&mut rng);
            let (mut pg_max, mut pg_min) = (f64::NEG_INFINITY, f64::INFINITY);

            for &i in &order {
                let g = y[i] * decision(&w, &x[i]) - 1.;
                let pg = if alpha[i] == 0. {
                    g.min(0.)
                } else if alpha[i] == c {
                    g.max(0.)
                } else {
                    g
                };
                pg_max = pg_max.max(pg);
                pg_min = pg_min.min(pg);

                if pg.abs() > 1e-12 {
                    let old = alpha[i];
                    alpha[i] = (alpha[i] - g / q[i]).max(0.).min(c);
                    let step = (alpha[i] - old) * y[i];
                    for node in x[i].iter().take_while(|n| !n.is_sentinel()) {
                        w[node.index as usize - 1] += step * node.value;
                    }
                    w[dim] += step;
                }
            }

            if pg_max - pg_min < self.params.eps {
                debug!(pass, "svm converged");
                return w;
            }
        }
        warn!(
            iterations = self.params.iterations,
            "svm reached the iteration limit before converging"
        );
        w
    }
}

impl Classifier for LinearSvm {
    fn fit(&self, data: &[&Histogram]) -> BofResult<Box<dyn Model>> {
        let labels = distinct_labels(data);
        self.check_parameters(&labels)?;
        let dim = common_len(data)?;

        let x: Vec<Vec<SparseNode>> = data.iter().map(|h| self.encode_sparse(h)).collect();
        let weights = labels
            .iter()
            .map(|&label| {
                let y: Vec<f64> = data
                    .iter()
                    .map(|h| if h.label() == label { 1. } else { -1. })
                    .collect();
                self.train_binary(&x, &y, dim)
            })
            .collect();

        Ok(Box::new(SvmModel { labels, weights }))
    }

    fn name(&self) -> &'static str {
        "linear-svm"
    }
}

impl Model for SvmModel {
    fn predict(&self, histogram: &Histogram) -> Label {
        let x = histogram.to_sparse();
        let mut best = (self.labels[0], f64::NEG_INFINITY);
        for (&label, w) in self.labels.iter().zip(&self.weights) {
            let d = decision(w, &x);
            if d > best.1 {
                best = (label, d);
            }
        }
        best.0
    }

    fn labels(&self) -> &[Label] {
        &self.labels
    }
}

/// `w . x + b` over a sentinel-terminated sparse vector; bins beyond the
/// trained dimension contribute nothing.
#[inline]
fn decision(w: &[f64], x: &[SparseNode]) -> f64 {
    let dim = w.len() - 1;
    let mut sum = w[dim];
    for node in x.iter().take_while(|n| !n.is_sentinel()) {
        let i = node.index as usize - 1;
        if i < dim {
            sum += w[i] * node.value;
        }
    }
    sum
}

#[inline]
fn dot_self(x: &[SparseNode]) -> f64 {
    x.iter()
        .take_while(|n| !n.is_sentinel())
        .map(|n| n.value * n.value)
        .sum()
}
