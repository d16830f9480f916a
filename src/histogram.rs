use serde::{Deserialize, Serialize};

use crate::*;

/// Bag-of-features encoding of one image: one bin per codebook word plus
/// the ground-truth label of the image's class.
///
/// A histogram is only valid against the codebook it was encoded with;
/// rebuilding the codebook invalidates it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Histogram {
    bins: BoW,
    label: Label,
}

/// One non-zero bin in libsvm's sparse format. Indices are 1-based and a
/// sequence is terminated by [`SparseNode::SENTINEL`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SparseNode {
    pub index: i32,
    pub value: f64,
}

impl SparseNode {
    pub const SENTINEL: SparseNode = SparseNode {
        index: -1,
        value: 0.,
    };

    pub fn is_sentinel(&self) -> bool {
        self.index < 0
    }
}

impl Histogram {
    /// Encode a descriptor set against `codebook`. The result has exactly
    /// `codebook.k()` bins summing to 1, or all zeros for an empty set.
    pub fn encode(features: &[Desc], codebook: &Codebook, label: Label) -> BofResult<Self> {
        Ok(Self {
            bins: codebook.transform(features)?,
            label,
        })
    }

    pub fn new(bins: BoW, label: Label) -> Self {
        Self { bins, label }
    }

    pub fn bins(&self) -> &[f32] {
        &self.bins
    }

    pub fn label(&self) -> Label {
        self.label
    }

    /// Number of bins, i.e. the `k` of the codebook it was encoded with.
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// True for the encoding of an image without descriptors.
    pub fn is_zero(&self) -> bool {
        self.bins.iter().all(|&b| b == 0.)
    }

    pub fn similarity(&self, other: &Histogram) -> f32 {
        self.bins.l1(&other.bins)
    }

    /// Non-zero bins as index/value pairs followed by the sentinel.
    pub fn to_sparse(&self) -> Vec<SparseNode> {
        let mut nodes: Vec<SparseNode> = self
            .bins
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != 0.)
            .map(|(i, &v)| SparseNode {
                index: i as i32 + 1,
                value: v as f64,
            })
            .collect();
        nodes.push(SparseNode::SENTINEL);
        nodes
    }
}
