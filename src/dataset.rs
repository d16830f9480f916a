use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::*;

/// Manifest of one class: its image paths and how they are split.
///
/// Files are laid out contiguously: the first `train` files are the
/// training images, the next `valid` the validation images, then `test`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DataSet {
    files: Vec<PathBuf>,
    train: usize,
    valid: usize,
    test: usize,
    label: Label,
}

impl DataSet {
    pub fn new(
        files: Vec<PathBuf>,
        train: usize,
        valid: usize,
        test: usize,
        label: Label,
    ) -> BofResult<Self> {
        let set = Self {
            files,
            train,
            valid,
            test,
            label,
        };
        set.validate()?;
        Ok(set)
    }

    /// Every regular file in `dir`, sorted by name, split in order.
    pub fn from_dir<P: AsRef<Path>>(
        dir: P,
        train: usize,
        valid: usize,
        test: usize,
        label: Label,
    ) -> BofResult<Self> {
        let mut files: Vec<PathBuf> = Vec::new();
        for entry in dir.as_ref().read_dir()? {
            let path = entry?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Self::new(files, train, valid, test, label)
    }

    /// The declared split sizes must fit inside the file list.
    pub fn validate(&self) -> BofResult<()> {
        let expected = self.train + self.valid + self.test;
        if expected > self.files.len() {
            return Err(BofErr::AllocationMismatch {
                label: self.label,
                expected,
                found: self.files.len(),
            });
        }
        Ok(())
    }

    pub fn label(&self) -> Label {
        self.label
    }

    pub fn size(&self, split: Split) -> usize {
        match split {
            Split::Train => self.train,
            Split::Valid => self.valid,
            Split::Test => self.test,
        }
    }

    /// The image paths of one split.
    pub fn paths(&self, split: Split) -> &[PathBuf] {
        let start = match split {
            Split::Train => 0,
            Split::Valid => self.train,
            Split::Test => self.train + self.valid,
        };
        &self.files[start..start + self.size(split)]
    }
}

/// Read a JSON list of class manifests.
pub fn load_manifest<P: AsRef<Path>>(file: P) -> BofResult<Vec<DataSet>> {
    let text = std::fs::read_to_string(file)?;
    let sets: Vec<DataSet> = serde_json::from_str(&text)?;
    for set in &sets {
        set.validate()?;
    }
    Ok(sets)
}
