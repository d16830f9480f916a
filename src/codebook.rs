#[cfg(feature = "bincode")]
use bincode;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cluster::{nearest, squared_euclidean};
use crate::*;

#[derive(Serialize, Deserialize, PartialEq, Clone)]
/// Codebook of visual words built from the training descriptors. Can be:
/// 1. Built with any [`Clusterer`].
/// 2. Saved to a file & loaded from a file (requires bincode feature, enabled by default).
/// 3. Used to quantize descriptors and transform a descriptor set into a BoW.
///
/// A codebook with no centroids (`k() == 0`) is unbuilt and refuses to quantize.
pub struct Codebook {
    centroids: Vec<Desc>,
    length: usize,
}

/// Codebook API
impl Codebook {
    /// An unbuilt codebook for descriptors of dimensionality `length`.
    pub fn empty(length: usize) -> Self {
        Self {
            centroids: Vec::new(),
            length,
        }
    }

    /// Wrap precomputed centroids. All of them must share one non-zero length.
    pub fn from_centroids(centroids: Vec<Desc>) -> BofResult<Self> {
        let length = centroids.first().map_or(0, |c| c.len());
        let mut codebook = Self::empty(length);
        codebook.replace(centroids)?;
        Ok(codebook)
    }

    /// (Re)build the codebook from training descriptors with the given clusterer.
    ///
    /// The clusterer's output is taken as the final centroids. On failure the
    /// previous centroids are kept untouched.
    pub fn build(
        &mut self,
        features: &[Desc],
        k: usize,
        clusterer: &dyn Clusterer,
    ) -> BofResult<()> {
        if let Some(f) = features.iter().find(|f| f.len() != self.length) {
            return Err(BofErr::DimensionMismatch {
                expected: self.length,
                found: f.len(),
            });
        }
        let centroids = clusterer.cluster(features, k)?;
        if centroids.len() > k {
            return Err(BofErr::InfeasibleParameters(format!(
                "clusterer returned {} centroids for k = {}",
                centroids.len(),
                k
            )));
        }
        self.replace(centroids)
    }

    /// Index of the centroid closest to `v` (squared Euclidean distance,
    /// ties broken by lowest index).
    pub fn nearest_centroid(&self, v: &[f32]) -> BofResult<usize> {
        if !self.is_built() {
            return Err(BofErr::NotBuilt);
        }
        self.check_len(v)?;
        Ok(nearest(&self.centroids, v).0)
    }

    /// Quantize every descriptor: `result[i]` is the word id of `features[i]`.
    pub fn quantize(&self, features: &[Desc]) -> BofResult<Vec<usize>> {
        features.iter().map(|f| self.nearest_centroid(f)).collect()
    }

    /// Transform a set of descriptors into its bag of words
    /// representation with respect to the codebook. Result is l1 normalized,
    /// or all zeros for an empty set.
    pub fn transform(&self, features: &[Desc]) -> BofResult<BoW> {
        if !self.is_built() {
            return Err(BofErr::NotBuilt);
        }
        let mut bow: BoW = vec![0.; self.k()];
        for feature in features {
            bow[self.nearest_centroid(feature)?] += 1.;
        }

        // Normalize BoW vector
        let sum: f32 = bow.iter().sum();
        if sum > 0. {
            let inv_sum = 1. / sum;
            for w in bow.iter_mut() {
                *w *= inv_sum;
            }
        }
        Ok(bow)
    }

    /// Number of visual words.
    pub fn k(&self) -> usize {
        self.centroids.len()
    }

    /// Descriptor dimensionality.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_built(&self) -> bool {
        !self.centroids.is_empty()
    }

    pub fn centroids(&self) -> &[Desc] {
        &self.centroids
    }

    /// Load a codebook from a file. Every centroid must match the stored
    /// descriptor length.
    #[cfg(feature = "bincode")]
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> BofResult<Self> {
        let mut file = std::fs::File::open(file)?;
        let mut buffer: Vec<u8> = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut buffer)?;
        let raw: Codebook = bincode::deserialize(&buffer)?;

        let mut codebook = Self::empty(raw.length);
        codebook.replace(raw.centroids)?;
        Ok(codebook)
    }

    /// Save codebook to a file
    #[cfg(feature = "bincode")]
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> BofResult<()> {
        let serialized = bincode::serialize(&self)?;
        let mut file = std::fs::File::create(file)?;
        std::io::Write::write_all(&mut file, &serialized)?;
        Ok(())
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

impl Codebook {
    fn replace(&mut self, centroids: Vec<Desc>) -> BofResult<()> {
        if self.length == 0 {
            return Err(BofErr::InvalidParameter {
                name: "length",
                message: "descriptor length must be > 0".into(),
            });
        }
        for c in &centroids {
            self.check_len(c)?;
        }
        self.centroids = centroids;
        Ok(())
    }

    #[inline]
    fn check_len(&self, v: &[f32]) -> BofResult<()> {
        if v.len() != self.length {
            return Err(BofErr::DimensionMismatch {
                expected: self.length,
                found: v.len(),
            });
        }
        Ok(())
    }

    /// Mean squared distance from each centroid to its closest neighbour.
    fn mean_separation(&self) -> f32 {
        if self.k() < 2 {
            return 0.;
        }
        let total: f32 = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| {
                self.centroids
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, o)| squared_euclidean(c, o))
                    .fold(f32::INFINITY, f32::min)
            })
            .sum();
        total / self.k() as f32
    }
}

impl fmt::Debug for Codebook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codebook")
            .field("Words", &self.k())
            .field("Descriptor Length", &self.length)
            .field("Mean Nearest Word Distance", &self.mean_separation())
            .finish()
    }
}
