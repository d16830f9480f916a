#![cfg(feature = "opencv")]
use crate::{BofErr, BofResult, DescriptorSet, FeatureExtractor};
use opencv::{self, prelude::*};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

type CvImage = opencv::prelude::Mat;
type CvMat = opencv::core::Mat;

/// Detector selection and its thresholds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum FeatureParams {
    Sift {
        detection_threshold: f64,
        edge_threshold: f64,
    },
    Surf {
        hessian_threshold: f64,
        n_octaves: i32,
        n_layers: i32,
        extended: bool,
    },
}

impl Default for FeatureParams {
    fn default() -> Self {
        FeatureParams::Sift {
            detection_threshold: 0.04,
            edge_threshold: 10.,
        }
    }
}

/// Image filtering applied after loading and before detection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Preprocess {
    Identity,
    /// Histogram equalization of the grayscale image.
    EqualizeHist,
    /// Gaussian blur with a square `kernel` (odd, > 0) and standard deviation `sigma`.
    GaussianBlur { kernel: i32, sigma: f64 },
}

impl Default for Preprocess {
    fn default() -> Self {
        Preprocess::Identity
    }
}

impl Preprocess {
    pub fn apply(&self, img: CvImage) -> BofResult<CvImage> {
        match *self {
            Preprocess::Identity => Ok(img),
            Preprocess::EqualizeHist => {
                let mut out = CvMat::default()?;
                opencv::imgproc::equalize_hist(&img, &mut out)?;
                Ok(out)
            }
            Preprocess::GaussianBlur { kernel, sigma } => {
                if kernel <= 0 || kernel % 2 == 0 {
                    return Err(BofErr::InvalidParameter {
                        name: "kernel",
                        message: format!("blur kernel must be odd and > 0, got {}", kernel),
                    });
                }
                let mut out = CvMat::default()?;
                opencv::imgproc::gaussian_blur(
                    &img,
                    &mut out,
                    opencv::core::Size::new(kernel, kernel),
                    sigma,
                    sigma,
                    opencv::core::BORDER_DEFAULT,
                )?;
                Ok(out)
            }
        }
    }
}

/// Extracts SIFT or SURF descriptors from grayscale images using opencv.
pub struct OpenCvExtractor {
    params: FeatureParams,
    preprocess: Preprocess,
}

impl OpenCvExtractor {
    pub fn new(params: FeatureParams) -> Self {
        Self {
            params,
            preprocess: Preprocess::default(),
        }
    }

    pub fn with_preprocess(mut self, preprocess: Preprocess) -> Self {
        self.preprocess = preprocess;
        self
    }

    fn detect(&self, cv_img: &CvImage) -> BofResult<CvMat> {
        let mut kps = opencv::types::VectorOfKeyPoint::new();
        let mut desc = CvMat::default()?;
        let mask = CvMat::default()?;
        match self.params {
            FeatureParams::Sift {
                detection_threshold,
                edge_threshold,
            } => {
                let mut sift = opencv::features2d::SIFT::create(
                    0,
                    3,
                    detection_threshold,
                    edge_threshold,
                    1.6,
                )?;
                sift.detect_and_compute(cv_img, &mask, &mut kps, &mut desc, false)?;
            }
            FeatureParams::Surf {
                hessian_threshold,
                n_octaves,
                n_layers,
                extended,
            } => {
                let mut surf = opencv::xfeatures2d::SURF::create(
                    hessian_threshold,
                    n_octaves,
                    n_layers,
                    extended,
                    false,
                )?;
                surf.detect_and_compute(cv_img, &mask, &mut kps, &mut desc, false)?;
            }
        }
        Ok(desc)
    }
}

impl FeatureExtractor for OpenCvExtractor {
    fn extract(&self, path: &Path) -> BofResult<DescriptorSet> {
        let fail = |reason: &str| BofErr::Extraction {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        let name = path.to_str().ok_or_else(|| fail("path is not valid utf-8"))?;
        let img: CvImage = opencv::imgcodecs::imread(name, opencv::imgcodecs::IMREAD_GRAYSCALE)?;
        if img.empty()? {
            return Err(fail("unreadable image"));
        }

        let img = self.preprocess.apply(img)?;
        let desc = self.detect(&img)?;
        if desc.rows() == 0 {
            return Err(fail("no descriptors"));
        }

        // Copy data from CvMat into descriptor buffers
        let mut features: DescriptorSet = Vec::with_capacity(desc.rows() as usize);
        for i in 0..desc.rows() {
            let row = (0..desc.cols())
                .map(|j| desc.at_2d::<f32>(i, j).map(|v| *v))
                .collect::<opencv::Result<Vec<f32>>>()?;
            features.push(row);
        }
        debug!(?path, descriptors = features.len(), "extracted descriptors");
        Ok(features)
    }
}
