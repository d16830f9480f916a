use rayon::prelude::*;
use tracing::debug;

use crate::*;

/// Descriptor sets and their histograms for one (class, split) pair.
///
/// Slots are addressed by image index within the split. Histograms are
/// derived data: they exist only after [`ObjectCollection::encode_all`]
/// and are dropped by [`ObjectCollection::invalidate`] whenever the
/// codebook they were built against changes.
#[derive(Debug, Clone)]
pub struct ObjectCollection {
    split: Split,
    features: Vec<DescriptorSet>,
    histograms: Vec<Histogram>,
}

impl ObjectCollection {
    pub fn new(split: Split, n: usize) -> Self {
        let mut c = Self {
            split,
            features: Vec::new(),
            histograms: Vec::new(),
        };
        c.allocate(n);
        c
    }

    /// Reserve exactly `n` empty slots, discarding everything held before.
    pub fn allocate(&mut self, n: usize) {
        self.features = vec![Vec::new(); n];
        self.histograms = Vec::new();
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Replace the descriptor set in `slot`. Histograms become stale.
    pub fn set_features(&mut self, slot: usize, features: DescriptorSet) -> BofResult<()> {
        let len = self.len();
        let target = self
            .features
            .get_mut(slot)
            .ok_or(BofErr::SlotOutOfRange { index: slot, len })?;
        *target = features;
        self.histograms.clear();
        Ok(())
    }

    pub fn features(&self, slot: usize) -> Option<&DescriptorSet> {
        self.features.get(slot)
    }

    /// Total number of descriptors over every slot.
    pub fn feature_count(&self) -> usize {
        self.features.iter().map(|f| f.len()).sum()
    }

    /// All descriptors of all slots, in slot order.
    pub fn all_features(&self) -> impl Iterator<Item = &Desc> {
        self.features.iter().flatten()
    }

    /// Histograms encoded against the current codebook, one per slot.
    /// Empty when stale.
    pub fn histograms(&self) -> &[Histogram] {
        &self.histograms
    }

    /// True if every slot has a histogram of `k` bins.
    pub fn is_encoded(&self, k: usize) -> bool {
        self.histograms.len() == self.features.len()
            && self.histograms.iter().all(|h| h.len() == k)
    }

    /// Drop all histograms.
    pub fn invalidate(&mut self) {
        self.histograms.clear();
    }

    /// Encode every slot against `codebook`, stamping `label` on each histogram.
    pub fn encode_all(&mut self, codebook: &Codebook, label: Label) -> BofResult<()> {
        self.histograms = self
            .features
            .par_iter()
            .map(|f| Histogram::encode(f, codebook, label))
            .collect::<BofResult<Vec<_>>>()?;
        debug!(
            label,
            split = %self.split,
            images = self.histograms.len(),
            k = codebook.k(),
            "encoded histograms"
        );
        Ok(())
    }

    /// Fraction of histograms the model assigns to `label`. Images without
    /// descriptors encode to all-zero histograms and always count as misses.
    pub fn score_against(&self, model: &dyn Model, label: Label) -> BofResult<f64> {
        if self.is_empty() {
            return Err(BofErr::EmptyCollection {
                label,
                split: self.split,
            });
        }
        if self.histograms.len() != self.features.len() {
            return Err(BofErr::StaleHistograms {
                label,
                split: self.split,
            });
        }
        let hits = self
            .histograms
            .iter()
            .filter(|h| !h.is_zero() && model.predict(h) == label)
            .count();
        Ok(hits as f64 / self.len() as f64)
    }
}
