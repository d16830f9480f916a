use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::*;

/// Turns one image into its set of local descriptors.
pub trait FeatureExtractor: Send + Sync {
    /// Fails with [`BofErr::Extraction`] for unreadable or corrupt input,
    /// and for images that yield no descriptors at all.
    fn extract(&self, path: &Path) -> BofResult<DescriptorSet>;
}

/// On-disk encoding of precomputed descriptors.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum DescriptorFormat {
    /// A JSON array of arrays of numbers.
    Json,
    /// A bincode-serialized `Vec<Vec<f32>>`.
    #[cfg(feature = "bincode")]
    Bincode,
}

/// Reads descriptors that were extracted ahead of time, one file per image.
#[derive(Debug, Clone)]
pub struct DescriptorFileExtractor {
    pub format: DescriptorFormat,
}

impl FeatureExtractor for DescriptorFileExtractor {
    fn extract(&self, path: &Path) -> BofResult<DescriptorSet> {
        let fail = |reason: String| BofErr::Extraction {
            path: path.to_path_buf(),
            reason,
        };
        let bytes = std::fs::read(path).map_err(|e| fail(e.to_string()))?;
        let features: DescriptorSet = match self.format {
            DescriptorFormat::Json => {
                serde_json::from_slice(&bytes).map_err(|e| fail(e.to_string()))?
            }
            #[cfg(feature = "bincode")]
            DescriptorFormat::Bincode => {
                bincode::deserialize(&bytes).map_err(|e| fail(e.to_string()))?
            }
        };
        if features.is_empty() {
            return Err(fail("no descriptors".into()));
        }
        Ok(features)
    }
}

/// Which extractor the pipeline uses.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ExtractorParams {
    DescriptorFile { format: DescriptorFormat },
    #[cfg(feature = "opencv")]
    OpenCv {
        features: crate::opencv_utils::FeatureParams,
        #[serde(default)]
        preprocess: crate::opencv_utils::Preprocess,
    },
}

impl Default for ExtractorParams {
    fn default() -> Self {
        ExtractorParams::DescriptorFile {
            format: DescriptorFormat::Json,
        }
    }
}

impl ExtractorParams {
    pub fn build(&self) -> Box<dyn FeatureExtractor> {
        match self {
            ExtractorParams::DescriptorFile { format } => {
                Box::new(DescriptorFileExtractor { format: *format })
            }
            #[cfg(feature = "opencv")]
            ExtractorParams::OpenCv {
                features,
                preprocess,
            } => Box::new(
                crate::opencv_utils::OpenCvExtractor::new(features.clone())
                    .with_preprocess(preprocess.clone()),
            ),
        }
    }
}
