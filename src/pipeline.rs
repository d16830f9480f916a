use rayon::prelude::*;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::*;

/// The bag-of-features pipeline.
///
/// Owns one [`Codebook`], an [`ObjectCollection`] per (class, split), the
/// extraction/clustering/classifier backends and the trained model.
///
/// Typical use:
/// 1. [`BagOfFeatures::build_bof`]: extract descriptors, build (or optimize)
///    the codebook and encode every split.
/// 2. [`BagOfFeatures::train`]: fit the classifier on the training histograms.
/// 3. [`BagOfFeatures::test_dataset`] or [`BagOfFeatures::classify_image`].
pub struct BagOfFeatures {
    params: BofParams,
    data: Vec<DataSet>,
    /// `objects[split][class]`
    objects: [Vec<ObjectCollection>; 3],
    codex: Codebook,
    extractor: Box<dyn FeatureExtractor>,
    clusterer: Box<dyn Clusterer>,
    classifier: Box<dyn Classifier>,
    model: Option<Box<dyn Model>>,
    num_features: usize,
}

/// Result of one clustering + encoding + training + evaluation cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Strictly better than every earlier iteration; the codebook was kept.
    Improved(f64),
    NotImproved(f64),
    /// Clustering or training was infeasible for this iteration.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    pub step: usize,
    pub repeat: usize,
    /// Codebook size asked of the clusterer.
    pub requested_k: usize,
    /// Codebook size actually built, if clustering succeeded.
    pub k: Option<usize>,
    pub outcome: Outcome,
    /// Best average validation accuracy so far, this iteration included.
    pub best: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationReport {
    pub iterations: Vec<IterationRecord>,
    pub best_score: f64,
    pub best_k: usize,
}

/// Per-class accuracy on each split. `None` for splits without images.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassReport {
    pub label: Label,
    pub train: Option<f64>,
    pub valid: Option<f64>,
    pub test: Option<f64>,
}

struct Snapshot {
    codebook: Codebook,
    score: f64,
}

#[inline]
fn idx(split: Split) -> usize {
    match split {
        Split::Train => 0,
        Split::Valid => 1,
        Split::Test => 2,
    }
}

impl BagOfFeatures {
    /// Allocate one collection per (class, split) from the manifest and
    /// build the configured backends.
    pub fn new(params: BofParams, data: Vec<DataSet>) -> BofResult<Self> {
        params.validate()?;
        if data.is_empty() {
            return Err(BofErr::NoClasses);
        }
        for set in &data {
            set.validate()?;
        }

        let allocate = |split: Split| -> Vec<ObjectCollection> {
            data.iter()
                .map(|set| ObjectCollection::new(split, set.size(split)))
                .collect()
        };
        let objects = [
            allocate(Split::Train),
            allocate(Split::Valid),
            allocate(Split::Test),
        ];

        Ok(Self {
            codex: Codebook::empty(params.feature_length),
            extractor: params.extractor.build(),
            clusterer: params.cluster.build(),
            classifier: params.classifier.build(),
            model: None,
            num_features: 0,
            objects,
            data,
            params,
        })
    }

    /// Discard everything (collections, codebook, model, custom backends)
    /// and start over from a new configuration and manifest.
    pub fn alloc(&mut self, params: BofParams, data: Vec<DataSet>) -> BofResult<()> {
        *self = Self::new(params, data)?;
        Ok(())
    }

    pub fn with_extractor<E: FeatureExtractor + 'static>(mut self, extractor: E) -> Self {
        self.extractor = Box::new(extractor);
        self
    }

    pub fn with_clusterer<C: Clusterer + 'static>(mut self, clusterer: C) -> Self {
        self.clusterer = Box::new(clusterer);
        self
    }

    pub fn with_classifier<C: Classifier + 'static>(mut self, classifier: C) -> Self {
        self.classifier = Box::new(classifier);
        self.model = None;
        self
    }

    /// Extract, build the codebook (optimizing its size if configured) and
    /// encode all three splits against it.
    pub fn build_bof(&mut self) -> BofResult<()> {
        self.extract_features()?;

        if self.params.optimize.num_steps > 0 {
            self.optimize_dictionary()?;
        } else {
            self.cluster_features()?;
            self.build_all_histograms()?;
        }
        Ok(())
    }

    /// Extract descriptors for every image of every split of every class.
    ///
    /// Images that fail to extract are skipped with a warning and keep an
    /// empty descriptor set. Descriptors of the wrong length are fatal.
    pub fn extract_features(&mut self) -> BofResult<()> {
        self.num_features = 0;
        let length = self.params.feature_length;

        for (class, set) in self.data.iter().enumerate() {
            for &split in &Split::ALL {
                let extractor = &self.extractor;
                let extracted: Vec<DescriptorSet> = set
                    .paths(split)
                    .par_iter()
                    .map(|path| {
                        debug!(?path, %split, "loading image");
                        extractor.extract(path).unwrap_or_else(|e| {
                            warn!(?path, error = %e, "skipping image");
                            Vec::new()
                        })
                    })
                    .collect();

                if let Some(f) = extracted.iter().flatten().find(|f| f.len() != length) {
                    return Err(BofErr::DimensionMismatch {
                        expected: length,
                        found: f.len(),
                    });
                }

                let collection = &mut self.objects[idx(split)][class];
                for (slot, features) in extracted.into_iter().enumerate() {
                    collection.set_features(slot, features)?;
                }
                if split == Split::Train {
                    self.num_features += collection.feature_count();
                }
            }
        }
        self.invalidate();

        info!(
            features = self.num_features,
            "total number of training features"
        );
        Ok(())
    }

    /// Build the codebook at the configured size from the training descriptors.
    pub fn cluster_features(&mut self) -> BofResult<()> {
        self.cluster(self.params.cluster.num_clusters)
    }

    /// Encode every class's collection of `split` against the current codebook.
    pub fn build_histograms(&mut self, split: Split) -> BofResult<()> {
        for (class, set) in self.data.iter().enumerate() {
            self.objects[idx(split)][class].encode_all(&self.codex, set.label())?;
        }
        Ok(())
    }

    pub fn build_all_histograms(&mut self) -> BofResult<()> {
        info!(k = self.codex.k(), "building the histograms");
        for &split in &Split::ALL {
            self.build_histograms(split)?;
        }
        Ok(())
    }

    /// Search codebook sizes for the best average validation accuracy.
    ///
    /// Runs `num_steps` outer steps of `cluster_repeat` cycles each, growing
    /// `k` by `cluster_step` after every step. The first codebook to reach
    /// a score is kept; later ties do not replace it. Iterations whose
    /// clustering or training is infeasible are recorded as failed and the
    /// search goes on. Finally the best codebook is pinned and every split
    /// is re-encoded against it. The model is dropped; call [`Self::train`].
    pub fn optimize_dictionary(&mut self) -> BofResult<OptimizationReport> {
        let opt = self.params.optimize.clone();
        for (class, set) in self.data.iter().enumerate() {
            if self.objects[idx(Split::Valid)][class].is_empty() {
                return Err(BofErr::EmptyCollection {
                    label: set.label(),
                    split: Split::Valid,
                });
            }
        }

        info!(
            steps = opt.num_steps,
            repeat = opt.cluster_repeat,
            "optimizing the dictionary"
        );

        let mut best: Option<Snapshot> = None;
        let mut iterations = Vec::with_capacity(opt.num_steps * opt.cluster_repeat);
        let mut k = self.params.cluster.num_clusters;

        for step in 0..opt.num_steps {
            for repeat in 0..opt.cluster_repeat {
                let (outcome, built) = match self.evaluate(k) {
                    Ok(score) => {
                        let built = Some(self.codex.k());
                        if best.as_ref().map_or(true, |b| score > b.score) {
                            best = Some(Snapshot {
                                codebook: self.codex.clone(),
                                score,
                            });
                            (Outcome::Improved(score), built)
                        } else {
                            (Outcome::NotImproved(score), built)
                        }
                    }
                    Err(e) if e.is_recoverable() => {
                        warn!(step, repeat, k, error = %e, "iteration failed");
                        (Outcome::Failed(e.to_string()), None)
                    }
                    Err(e) => return Err(e),
                };

                let best_score = best.as_ref().map(|b| b.score);
                info!(step, repeat, k, ?outcome, best = ?best_score, "average accuracy");
                iterations.push(IterationRecord {
                    step,
                    repeat,
                    requested_k: k,
                    k: built,
                    outcome,
                    best: best_score,
                });
            }
            k += opt.cluster_step;
        }

        let best = match best {
            Some(best) => best,
            None => {
                // Drop whatever the last failed cycle left behind.
                self.codex = Codebook::empty(self.params.feature_length);
                self.invalidate();
                return Err(BofErr::NoFeasibleCodebook {
                    iterations: iterations.len(),
                });
            }
        };
        info!(
            score = best.score,
            k = best.codebook.k(),
            "best validation results"
        );

        self.codex = best.codebook;
        self.params.cluster.num_clusters = self.codex.k();
        self.invalidate();
        self.build_all_histograms()?;

        Ok(OptimizationReport {
            iterations,
            best_score: best.score,
            best_k: self.codex.k(),
        })
    }

    /// Fit the classifier on every training histogram, replacing the model.
    pub fn train(&mut self) -> BofResult<()> {
        if !self.codex.is_built() {
            return Err(BofErr::NotBuilt);
        }
        let k = self.codex.k();
        let mut data: Vec<&Histogram> = Vec::new();
        for (class, set) in self.data.iter().enumerate() {
            let collection = &self.objects[idx(Split::Train)][class];
            if !collection.is_encoded(k) {
                return Err(BofErr::StaleHistograms {
                    label: set.label(),
                    split: Split::Train,
                });
            }
            data.extend(collection.histograms());
        }

        info!(
            classifier = self.classifier.name(),
            images = data.len(),
            "training classifier"
        );
        self.model = None;
        self.model = Some(self.classifier.fit(&data)?);
        Ok(())
    }

    /// Accuracy of the current model on one class's images of `split`.
    pub fn test_set(&self, split: Split, class: usize) -> BofResult<f64> {
        let model = self.model.as_deref().ok_or(BofErr::ModelNotTrained)?;
        let set = self.data.get(class).ok_or(BofErr::SlotOutOfRange {
            index: class,
            len: self.data.len(),
        })?;
        let collection = &self.objects[idx(split)][class];
        if !collection.is_empty() && !collection.is_encoded(self.codex.k()) {
            return Err(BofErr::StaleHistograms {
                label: set.label(),
                split,
            });
        }
        let result = collection.score_against(model, set.label())?;
        debug!(label = set.label(), %split, accuracy = result, "class accuracy");
        Ok(result)
    }

    /// Train/validation/test accuracy of every class.
    pub fn test_dataset(&self) -> BofResult<Vec<ClassReport>> {
        let mut reports = Vec::with_capacity(self.data.len());
        for (class, set) in self.data.iter().enumerate() {
            let score = |split: Split| -> BofResult<Option<f64>> {
                if self.objects[idx(split)][class].is_empty() {
                    return Ok(None);
                }
                let accuracy = self.test_set(split, class)?;
                info!(label = set.label(), %split, accuracy, "dataset accuracy");
                Ok(Some(accuracy))
            };
            reports.push(ClassReport {
                label: set.label(),
                train: score(Split::Train)?,
                valid: score(Split::Valid)?,
                test: score(Split::Test)?,
            });
        }
        Ok(reports)
    }

    /// Predict the label of an image given its descriptors.
    pub fn classify(&self, features: &[Desc]) -> BofResult<Label> {
        let model = self.model.as_deref().ok_or(BofErr::ModelNotTrained)?;
        // The true label is unknown; the histogram's is never read.
        let histogram = Histogram::encode(features, &self.codex, Label::default())?;
        Ok(model.predict(&histogram))
    }

    /// Extract an image's descriptors and predict its label. An image
    /// without descriptors is an extraction failure, not a guess.
    pub fn classify_image<P: AsRef<Path>>(&self, path: P) -> BofResult<Label> {
        let path = path.as_ref();
        let features = self.extractor.extract(path)?;
        if features.is_empty() {
            return Err(BofErr::Extraction {
                path: path.to_path_buf(),
                reason: "no descriptors".into(),
            });
        }
        self.classify(&features)
    }

    /// Pin an externally built codebook. Every histogram and the model
    /// become stale.
    pub fn set_codebook(&mut self, codebook: Codebook) -> BofResult<()> {
        if codebook.length() != self.params.feature_length {
            return Err(BofErr::DimensionMismatch {
                expected: self.params.feature_length,
                found: codebook.length(),
            });
        }
        if !codebook.is_built() {
            return Err(BofErr::NotBuilt);
        }
        self.params.cluster.num_clusters = codebook.k();
        self.codex = codebook;
        self.invalidate();
        Ok(())
    }

    #[cfg(feature = "bincode")]
    pub fn load_codebook<P: AsRef<Path>>(&mut self, file: P) -> BofResult<()> {
        self.set_codebook(Codebook::load(file)?)
    }

    pub fn codebook(&self) -> &Codebook {
        &self.codex
    }

    pub fn model(&self) -> Option<&dyn Model> {
        self.model.as_deref()
    }

    pub fn collection(&self, split: Split, class: usize) -> Option<&ObjectCollection> {
        self.objects[idx(split)].get(class)
    }

    /// Mutable access to one collection, e.g. to supply descriptors directly.
    /// Touching the descriptors invalidates that collection's histograms.
    pub fn collection_mut(&mut self, split: Split, class: usize) -> Option<&mut ObjectCollection> {
        self.objects[idx(split)].get_mut(class)
    }

    /// Number of descriptors in the training split of every class, i.e.
    /// the number of vectors the codebook is clustered from.
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn params(&self) -> &BofParams {
        &self.params
    }

    pub fn datasets(&self) -> &[DataSet] {
        &self.data
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

impl BagOfFeatures {
    /// Every training descriptor of every class. Validation and test
    /// descriptors never reach the clusterer.
    fn training_features(&self) -> Vec<Desc> {
        self.objects[idx(Split::Train)]
            .iter()
            .flat_map(|c| c.all_features().cloned())
            .collect()
    }

    fn cluster(&mut self, k: usize) -> BofResult<()> {
        let features = self.training_features();
        self.num_features = features.len();
        info!(
            k,
            features = features.len(),
            method = ?self.params.cluster.method,
            "clustering training features"
        );
        self.codex.build(&features, k, self.clusterer.as_ref())?;
        self.invalidate();
        Ok(())
    }

    /// One full cycle at codebook size `k`. Returns the mean validation accuracy.
    fn evaluate(&mut self, k: usize) -> BofResult<f64> {
        self.cluster(k)?;
        self.build_histograms(Split::Train)?;
        self.build_histograms(Split::Valid)?;
        self.train()?;
        self.validation_score()
    }

    /// Mean over classes of the validation accuracy.
    fn validation_score(&self) -> BofResult<f64> {
        let scores = (0..self.data.len())
            .into_par_iter()
            .map(|class| self.test_set(Split::Valid, class))
            .collect::<BofResult<Vec<f64>>>()?;
        Ok(scores.iter().sum::<f64>() / scores.len() as f64)
    }

    /// Histograms and model no longer match the codebook.
    fn invalidate(&mut self) {
        for collections in self.objects.iter_mut() {
            for c in collections.iter_mut() {
                c.invalidate();
            }
        }
        self.model = None;
    }
}
