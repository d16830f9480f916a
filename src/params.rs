use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::classifier::ClassifierParams;
use crate::extract::ExtractorParams;
use crate::*;

/// Everything the pipeline needs besides the dataset manifest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BofParams {
    /// Descriptor dimensionality `L`, e.g. 128 for SIFT.
    pub feature_length: usize,
    pub extractor: ExtractorParams,
    pub cluster: ClusterParams,
    pub optimize: OptParams,
    pub classifier: ClassifierParams,
}

/// Codebook construction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClusterParams {
    pub method: ClusterMethod,
    /// Codebook size `k`. Search start value when optimizing.
    pub num_clusters: usize,
    pub num_pass: usize,
    pub max_iterations: usize,
    pub convergence_threshold: f32,
    pub seed: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum ClusterMethod {
    KMeans,
    Hierarchical { branching: usize },
}

/// Codebook size search. `num_steps == 0` builds a single codebook.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OptParams {
    pub num_steps: usize,
    pub cluster_repeat: usize,
    pub cluster_step: usize,
}

impl Default for BofParams {
    fn default() -> Self {
        Self {
            feature_length: 128,
            extractor: ExtractorParams::default(),
            cluster: ClusterParams::default(),
            optimize: OptParams::default(),
            classifier: ClassifierParams::default(),
        }
    }
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            method: ClusterMethod::KMeans,
            num_clusters: 100,
            num_pass: 1,
            max_iterations: 100,
            convergence_threshold: 1e-4,
            seed: None,
        }
    }
}

impl Default for OptParams {
    fn default() -> Self {
        Self {
            num_steps: 0,
            cluster_repeat: 1,
            cluster_step: 0,
        }
    }
}

impl ClusterParams {
    pub fn build(&self) -> Box<dyn Clusterer> {
        let kmeans = KMeans {
            max_iterations: self.max_iterations,
            convergence_threshold: self.convergence_threshold,
            num_pass: self.num_pass,
            seed: self.seed,
        };
        match self.method {
            ClusterMethod::KMeans => Box::new(kmeans),
            ClusterMethod::Hierarchical { branching } => {
                Box::new(HierarchicalKMeans { branching, kmeans })
            }
        }
    }
}

impl BofParams {
    /// Load parameters from a JSON file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(file: P) -> BofResult<Self> {
        let text = std::fs::read_to_string(file)?;
        let params: Self = serde_json::from_str(&text)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> BofResult<()> {
        let invalid = |name: &'static str, message: &str| -> BofResult<()> {
            Err(BofErr::InvalidParameter {
                name,
                message: message.to_string(),
            })
        };
        if self.feature_length == 0 {
            return invalid("feature_length", "must be > 0");
        }
        if self.cluster.num_clusters == 0 {
            return invalid("num_clusters", "must be > 0");
        }
        if self.cluster.num_pass == 0 {
            return invalid("num_pass", "must be > 0");
        }
        if self.cluster.max_iterations == 0 {
            return invalid("max_iterations", "must be > 0");
        }
        if let ClusterMethod::Hierarchical { branching } = self.cluster.method {
            if branching < 2 {
                return invalid("branching", "must be >= 2");
            }
        }
        if self.optimize.num_steps > 0 && self.optimize.cluster_repeat == 0 {
            return invalid("cluster_repeat", "must be > 0 when optimizing");
        }
        Ok(())
    }
}
