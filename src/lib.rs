use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Codebook of visual words and nearest-centroid quantization,
/// the heart of this crate.
pub mod codebook;
pub use codebook::Codebook;

/// Clustering backends used to build a codebook.
pub mod cluster;
pub use cluster::{Clusterer, HierarchicalKMeans, KMeans};

/// Bag-of-features histogram encoding.
pub mod histogram;
pub use histogram::{Histogram, SparseNode};

/// Per (class, split) storage of descriptor sets and histograms.
pub mod collection;
pub use collection::ObjectCollection;

/// Static per-class manifest of image paths and split sizes.
pub mod dataset;
pub use dataset::DataSet;

/// Local descriptor extraction.
pub mod extract;
pub use extract::{DescriptorFileExtractor, FeatureExtractor};

/// SIFT/SURF descriptor extraction using opencv.
pub mod opencv_utils;
#[cfg(feature = "opencv")]
pub use opencv_utils::OpenCvExtractor;

/// Interchangeable classifier backends.
pub mod classifier;
pub use classifier::{Classifier, Model};

/// Pipeline configuration.
pub mod params;
pub use params::BofParams;

/// The bag-of-features pipeline: extraction, codebook optimization, training.
pub mod pipeline;
pub use pipeline::BagOfFeatures;

/// A local descriptor: fixed-length real vector (e.g. 128 for SIFT).
pub type Desc = Vec<f32>;

/// All descriptors extracted from one image.
pub type DescriptorSet = Vec<Desc>;

/// Bag-of-Words representation of an image or descriptor set.
///
/// Index: word id (centroid index) in the codebook.
///
/// Value: normalized count of descriptors quantized to that word.
pub type BoW = Vec<f32>;

/// Integer class label attached to every histogram of a class.
pub type Label = i32;

/// Provides method(s) for computing the similarity score between bow vectors.
pub trait BoWTrait {
    /// L1 similarity between two l1-normalized BoW, in [0, 1]. (Galvez, Eq 2).
    fn l1(&self, other: &Self) -> f32;
}

impl BoWTrait for BoW {
    fn l1(&self, other: &Self) -> f32 {
        1. - 0.5
            * (self
                .iter()
                .zip(other)
                .fold(0., |a, (b, c)| a + (b - c).abs()))
    }
}

/// One of the three partitions of a class's images.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Valid, Split::Test];
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Split::Train => "training",
            Split::Valid => "validation",
            Split::Test => "test",
        };
        f.write_str(name)
    }
}

pub type BofResult<T> = std::result::Result<T, BofErr>;

#[derive(Error, Debug)]
pub enum BofErr {
    #[error("Io Error")]
    Io(#[from] std::io::Error),
    #[error("Json Error")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "bincode")]
    #[error("Codebook Serialization Error")]
    Bincode(#[from] bincode::Error),
    #[cfg(feature = "opencv")]
    #[error("Opencv Error")]
    OpenCvInternal(#[from] opencv::Error),
    #[error("failed to extract descriptors from {path:?}: {reason}")]
    Extraction { path: PathBuf, reason: String },
    #[error("invalid parameter {name}: {message}")]
    InvalidParameter {
        name: &'static str,
        message: String,
    },
    #[error("invalid cluster count: requested {requested}, but only {available} training features")]
    InvalidClusterCount { requested: usize, available: usize },
    #[error("infeasible parameters: {0}")]
    InfeasibleParameters(String),
    #[error("codebook is not built")]
    NotBuilt,
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("{split} collection of class {label} is empty")]
    EmptyCollection { label: Label, split: Split },
    #[error("{split} histograms of class {label} are stale, re-encode them")]
    StaleHistograms { label: Label, split: Split },
    #[error("class {label} declares {expected} images but lists {found}")]
    AllocationMismatch {
        label: Label,
        expected: usize,
        found: usize,
    },
    #[error("slot {index} out of range for collection of size {len}")]
    SlotOutOfRange { index: usize, len: usize },
    #[error("no feasible codebook found in {iterations} iterations")]
    NoFeasibleCodebook { iterations: usize },
    #[error("classifier has not been trained")]
    ModelNotTrained,
    #[error("dataset has no classes")]
    NoClasses,
}

impl BofErr {
    /// Errors that only invalidate the current optimization iteration.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BofErr::InvalidClusterCount { .. } | BofErr::InfeasibleParameters(_)
        )
    }
}
