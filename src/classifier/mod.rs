use serde::{Deserialize, Serialize};

use crate::*;

mod linear_svm;
mod nearest_mean;

pub use linear_svm::{LinearSvm, SvmParams};
pub use nearest_mean::NearestMean;

/// A trained classifier. Replaced wholesale on every retrain.
pub trait Model: Send + Sync {
    fn predict(&self, histogram: &Histogram) -> Label;

    /// Labels seen during training, ascending.
    fn labels(&self) -> &[Label];
}

/// Classifier backend: fits labeled histograms into a [`Model`].
pub trait Classifier: Send + Sync {
    /// Fit a new model. Infeasible parameters or data surface as
    /// [`BofErr::InfeasibleParameters`], which callers may recover from.
    fn fit(&self, data: &[&Histogram]) -> BofResult<Box<dyn Model>>;

    /// Sparse input for backends that only consume non-zero bins.
    fn encode_sparse(&self, histogram: &Histogram) -> Vec<SparseNode> {
        histogram.to_sparse()
    }

    fn name(&self) -> &'static str;
}

/// Which classifier backend the pipeline trains.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClassifierParams {
    LinearSvm(SvmParams),
    NearestMean,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        ClassifierParams::LinearSvm(SvmParams::default())
    }
}

impl ClassifierParams {
    pub fn build(&self) -> Box<dyn Classifier> {
        match self {
            ClassifierParams::LinearSvm(p) => Box::new(LinearSvm::new(p.clone())),
            ClassifierParams::NearestMean => Box::new(NearestMean),
        }
    }
}

/// Sorted distinct labels of the training data.
fn distinct_labels(data: &[&Histogram]) -> Vec<Label> {
    let mut labels: Vec<Label> = data.iter().map(|h| h.label()).collect();
    labels.sort_unstable();
    labels.dedup();
    labels
}

/// Every histogram must share one bin count. Returns it.
fn common_len(data: &[&Histogram]) -> BofResult<usize> {
    let len = data.first().map_or(0, |h| h.len());
    match data.iter().find(|h| h.len() != len) {
        Some(h) => Err(BofErr::DimensionMismatch {
            expected: len,
            found: h.len(),
        }),
        None => Ok(len),
    }
}
