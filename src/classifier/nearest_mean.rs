use super::{common_len, distinct_labels, Classifier, Model};
use crate::*;

/// Dense nearest-class-mean classifier: predicts the label whose mean
/// training histogram is most similar (L1) to the input.
pub struct NearestMean;

struct MeanModel {
    labels: Vec<Label>,
    means: Vec<BoW>,
}

impl Classifier for NearestMean {
    fn fit(&self, data: &[&Histogram]) -> BofResult<Box<dyn Model>> {
        if data.is_empty() {
            return Err(BofErr::InfeasibleParameters(
                "nearest-mean: no training data".into(),
            ));
        }
        let dim = common_len(data)?;
        let labels = distinct_labels(data);

        let means = labels
            .iter()
            .map(|&label| {
                let mut mean: BoW = vec![0.; dim];
                let mut n = 0usize;
                for h in data.iter().filter(|h| h.label() == label) {
                    for (m, b) in mean.iter_mut().zip(h.bins()) {
                        *m += b;
                    }
                    n += 1;
                }
                let inv = 1. / n as f32;
                mean.iter_mut().for_each(|m| *m *= inv);
                mean
            })
            .collect();

        Ok(Box::new(MeanModel { labels, means }))
    }

    fn name(&self) -> &'static str {
        "nearest-mean"
    }
}

impl Model for MeanModel {
    fn predict(&self, histogram: &Histogram) -> Label {
        let bins: BoW = histogram.bins().to_vec();
        let mut best = (self.labels[0], f32::NEG_INFINITY);
        for (&label, mean) in self.labels.iter().zip(&self.means) {
            let s = mean.l1(&bins);
            if s > best.1 {
                best = (label, s);
            }
        }
        best.0
    }

    fn labels(&self) -> &[Label] {
        &self.labels
    }
}
