use bof::pipeline::Outcome;
use bof::classifier::ClassifierParams;
use bof::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Serves descriptors from memory; unknown paths fail like unreadable images.
struct MapExtractor(HashMap<PathBuf, DescriptorSet>);

impl FeatureExtractor for MapExtractor {
    fn extract(&self, path: &Path) -> BofResult<DescriptorSet> {
        self.0.get(path).cloned().ok_or_else(|| BofErr::Extraction {
            path: path.to_path_buf(),
            reason: "unreadable image".into(),
        })
    }
}

/// Always infeasible.
struct FailingClusterer;

impl Clusterer for FailingClusterer {
    fn cluster(&self, _: &[Desc], k: usize) -> BofResult<Vec<Desc>> {
        Err(BofErr::InfeasibleParameters(format!("cannot build {} words", k)))
    }
}

/// Delegates to k-means, remembering how many vectors it was given.
struct CountingClusterer {
    seen: Arc<AtomicUsize>,
    inner: KMeans,
}

impl Clusterer for CountingClusterer {
    fn cluster(&self, features: &[Desc], k: usize) -> BofResult<Vec<Desc>> {
        self.seen.store(features.len(), Ordering::SeqCst);
        self.inner.cluster(features, k)
    }
}

struct Image {
    class: usize,
    split: Split,
    features: DescriptorSet,
}

/// Build a manifest and an in-memory extractor from a list of images.
/// Images are ordered per class as train, valid, test.
fn dataset(images: Vec<Image>, labels: &[Label]) -> (Vec<DataSet>, MapExtractor) {
    let mut map = HashMap::new();
    let mut sets = Vec::new();
    for (class, &label) in labels.iter().enumerate() {
        let mut files = Vec::new();
        let mut sizes = [0usize; 3];
        for (s, &split) in Split::ALL.iter().enumerate() {
            for (i, img) in images
                .iter()
                .filter(|img| img.class == class && img.split == split)
                .enumerate()
            {
                let path = PathBuf::from(format!("class{}/{}/{}.img", class, split, i));
                map.insert(path.clone(), img.features.clone());
                files.push(path);
                sizes[s] += 1;
            }
        }
        sets.push(DataSet::new(files, sizes[0], sizes[1], sizes[2], label).unwrap());
    }
    (sets, MapExtractor(map))
}

fn img(class: usize, split: Split, features: &[[f32; 2]]) -> Image {
    Image {
        class,
        split,
        features: features.iter().map(|f| f.to_vec()).collect(),
    }
}

fn params(k: usize) -> BofParams {
    let mut p = BofParams::default();
    p.feature_length = 2;
    p.cluster.num_clusters = k;
    p.cluster.seed = Some(3);
    p.cluster.num_pass = 2;
    p
}

/// Two well separated classes: x near 0 and x near 10.
fn two_classes() -> Vec<Image> {
    let left = |dy: f32| [[0., dy], [0., 1. + dy]];
    let right = |dy: f32| [[10., dy], [10., 1. + dy]];
    let mut images = Vec::new();
    for (i, &split) in [Split::Train, Split::Train, Split::Valid, Split::Test]
        .iter()
        .enumerate()
    {
        let dy = 0.05 * i as f32;
        images.push(img(0, split, &left(dy)));
        images.push(img(1, split, &right(dy)));
    }
    images
}

fn near(c: &[f32], x: f32, y: f32, tol: f32) -> bool {
    ((c[0] - x).powi(2) + (c[1] - y).powi(2)).sqrt() < tol
}

#[test]
fn scenario_a_codebook_follows_classes() {
    let (data, extractor) = dataset(two_classes(), &[0, 1]);
    let mut bof = BagOfFeatures::new(params(4), data)
        .unwrap()
        .with_extractor(extractor);
    bof.build_bof().unwrap();

    let codebook = bof.codebook();
    assert_eq!(codebook.k(), 4);
    for c in codebook.centroids() {
        assert!(
            near(c, 0., 0.55, 0.6) || near(c, 10., 0.55, 0.6),
            "stray centroid {:?}",
            c
        );
    }

    for (class, left) in [(0usize, true), (1, false)] {
        for h in bof.collection(Split::Train, class).unwrap().histograms() {
            assert_eq!(h.len(), 4);
            for (bin, &v) in h.bins().iter().enumerate() {
                let on_left = codebook.centroids()[bin][0] < 5.;
                if on_left != left {
                    assert_eq!(v, 0., "class {} leaked into word {}", class, bin);
                }
            }
            let sum: f32 = h.bins().iter().sum();
            assert!((sum - 1.).abs() < 1e-6);
        }
    }

    bof.train().unwrap();
    let reports = bof.test_dataset().unwrap();
    assert_eq!(reports.len(), 2);
    for r in &reports {
        assert_eq!(r.train, Some(1.));
        assert_eq!(r.valid, Some(1.));
        assert_eq!(r.test, Some(1.));
    }
    assert_eq!(bof.classify(&[vec![0.1, 0.4]]).unwrap(), 0);
    assert_eq!(bof.classify(&[vec![9.8, 0.7]]).unwrap(), 1);
}

#[test]
fn scenario_b_empty_test_image_is_a_miss() {
    let mut images = two_classes();
    images.push(img(0, Split::Test, &[]));
    let (data, extractor) = dataset(images, &[0, 1]);
    let mut bof = BagOfFeatures::new(params(4), data)
        .unwrap()
        .with_extractor(extractor);
    bof.build_bof().unwrap();
    bof.train().unwrap();

    let test = bof.collection(Split::Test, 0).unwrap();
    assert_eq!(test.len(), 2);
    assert!(test.histograms()[1].is_zero());
    assert_eq!(test.histograms()[1].len(), 4);
    assert_eq!(bof.test_set(Split::Test, 0).unwrap(), 0.5);
}

#[test]
fn unreadable_image_is_skipped() {
    let (data, mut extractor) = dataset(two_classes(), &[0, 1]);
    let victim = data[1].paths(Split::Test)[0].clone();
    extractor.0.remove(&victim);
    let mut bof = BagOfFeatures::new(params(4), data)
        .unwrap()
        .with_extractor(extractor);
    bof.build_bof().unwrap();
    assert_eq!(
        bof.collection(Split::Test, 1).unwrap().features(0),
        Some(&Vec::new())
    );
    bof.train().unwrap();
    assert_eq!(bof.test_set(Split::Test, 1).unwrap(), 0.);
}

#[test]
fn scenario_c_every_iteration_infeasible() {
    let (data, extractor) = dataset(two_classes(), &[0, 1]);
    let mut p = params(2);
    p.optimize.num_steps = 2;
    p.optimize.cluster_repeat = 3;
    p.optimize.cluster_step = 1;
    let mut bof = BagOfFeatures::new(p, data)
        .unwrap()
        .with_extractor(extractor)
        .with_clusterer(FailingClusterer);
    match bof.build_bof() {
        Err(BofErr::NoFeasibleCodebook { iterations }) => assert_eq!(iterations, 6),
        other => panic!("expected NoFeasibleCodebook, got {:?}", other.err()),
    }
    assert!(!bof.codebook().is_built());
}

#[test]
fn optimization_keeps_first_best_snapshot() {
    let mut images = two_classes();
    // Extra spread so that larger codebooks stay feasible.
    for i in 0..3 {
        let d = 0.3 * i as f32;
        images.push(img(0, Split::Train, &[[d, 2.], [1. + d, 0.5]]));
        images.push(img(1, Split::Train, &[[10. - d, 2.], [9. + d, 0.5]]));
    }
    let (data, extractor) = dataset(images, &[0, 1]);
    let mut p = params(2);
    p.optimize.num_steps = 3;
    p.optimize.cluster_repeat = 2;
    p.optimize.cluster_step = 2;
    let mut bof = BagOfFeatures::new(p, data)
        .unwrap()
        .with_extractor(extractor);
    bof.extract_features().unwrap();
    let report = bof.optimize_dictionary().unwrap();

    assert_eq!(report.iterations.len(), 6);
    let requested: Vec<usize> = report.iterations.iter().map(|r| r.requested_k).collect();
    assert_eq!(requested, vec![2, 2, 4, 4, 6, 6]);

    let mut last_best = f64::NEG_INFINITY;
    let mut best_k = None;
    for r in &report.iterations {
        let best = r.best.unwrap();
        assert!(best >= last_best);
        last_best = best;
        match r.outcome {
            Outcome::Improved(score) => {
                assert_eq!(score, best);
                best_k = r.k;
            }
            Outcome::NotImproved(score) => assert!(score <= best),
            Outcome::Failed(ref reason) => panic!("unexpected failure: {}", reason),
        }
    }
    assert_eq!(report.best_score, last_best);
    assert_eq!(Some(report.best_k), best_k);

    // Every cycle separates the classes perfectly; later ties never replace the first.
    assert_eq!(report.iterations[0].outcome, Outcome::Improved(1.));
    assert!(report.iterations[1..]
        .iter()
        .all(|r| r.outcome == Outcome::NotImproved(1.)));
    assert_eq!(report.best_k, 2);
    assert_eq!(bof.codebook().k(), report.best_k);
    assert_eq!(bof.params().cluster.num_clusters, report.best_k);

    // Every split was re-encoded against the pinned codebook; the model was not kept.
    for &split in &Split::ALL {
        for class in 0..2 {
            assert!(bof.collection(split, class).unwrap().is_encoded(report.best_k));
        }
    }
    assert!(bof.model().is_none());
    bof.train().unwrap();
}

#[test]
fn infeasible_iterations_do_not_abort_search() {
    let (data, extractor) = dataset(two_classes(), &[0, 1]);
    let mut p = params(2);
    p.optimize.num_steps = 3;
    p.optimize.cluster_repeat = 1;
    // 8 training descriptors: k = 2 and 6 work, k = 10 does not.
    p.optimize.cluster_step = 4;
    let mut bof = BagOfFeatures::new(p, data)
        .unwrap()
        .with_extractor(extractor);
    bof.extract_features().unwrap();
    let report = bof.optimize_dictionary().unwrap();

    assert!(matches!(report.iterations[0].outcome, Outcome::Improved(_)));
    assert!(matches!(report.iterations[2].outcome, Outcome::Failed(_)));
    assert_eq!(report.iterations[2].k, None);
    assert!(report.best_k == 2 || report.best_k == 6);
}

#[test]
fn infeasible_classifier_is_recorded_as_failure() {
    // A single class cannot train an svm.
    let images = vec![
        img(0, Split::Train, &[[0., 0.], [1., 1.]]),
        img(0, Split::Valid, &[[0., 0.]]),
    ];
    let (data, extractor) = dataset(images, &[0]);
    let mut p = params(2);
    p.optimize.num_steps = 1;
    p.optimize.cluster_repeat = 2;
    let mut bof = BagOfFeatures::new(p, data)
        .unwrap()
        .with_extractor(extractor);
    assert!(matches!(
        bof.build_bof(),
        Err(BofErr::NoFeasibleCodebook { iterations: 2 })
    ));

    // Clustering succeeded, yet no codebook was selected: nothing is left pinned.
    assert!(!bof.codebook().is_built());
    assert!(bof.model().is_none());
    for &split in &[Split::Train, Split::Valid] {
        assert!(bof.collection(split, 0).unwrap().histograms().is_empty());
    }
}

#[test]
fn codebook_sees_training_descriptors_only() {
    let mut images = two_classes();
    images.push(img(1, Split::Valid, &[[5., 5.], [6., 6.], [7., 7.]]));
    let (data, extractor) = dataset(images, &[0, 1]);
    let seen = Arc::new(AtomicUsize::new(0));
    let mut bof = BagOfFeatures::new(params(2), data)
        .unwrap()
        .with_extractor(extractor)
        .with_clusterer(CountingClusterer {
            seen: seen.clone(),
            inner: KMeans {
                seed: Some(1),
                ..Default::default()
            },
        });
    bof.build_bof().unwrap();

    let train_total: usize = (0..2)
        .map(|c| bof.collection(Split::Train, c).unwrap().feature_count())
        .sum();
    assert_eq!(train_total, 8);
    assert_eq!(bof.num_features(), train_total);
    assert_eq!(seen.load(Ordering::SeqCst), train_total);
}

#[test]
fn rebuilt_codebook_makes_histograms_stale() {
    let (data, extractor) = dataset(two_classes(), &[0, 1]);
    let mut bof = BagOfFeatures::new(params(2), data)
        .unwrap()
        .with_extractor(extractor);
    bof.build_bof().unwrap();
    let old = bof.collection(Split::Train, 0).unwrap().histograms()[0].clone();
    assert_eq!(old.len(), 2);

    let words = vec![vec![0., 0.], vec![0., 1.], vec![10., 0.5]];
    bof.set_codebook(Codebook::from_centroids(words).unwrap())
        .unwrap();
    assert!(bof.collection(Split::Train, 0).unwrap().histograms().is_empty());
    assert!(matches!(
        bof.train(),
        Err(BofErr::StaleHistograms {
            label: 0,
            split: Split::Train
        })
    ));

    bof.build_all_histograms().unwrap();
    let new = &bof.collection(Split::Train, 0).unwrap().histograms()[0];
    assert_eq!(new.len(), 3);
    assert_ne!(new.len(), old.len());
    bof.train().unwrap();
}

#[test]
fn nearest_mean_backend_from_config() {
    let (data, extractor) = dataset(two_classes(), &[3, 7]);
    let mut p = params(4);
    p.classifier = ClassifierParams::NearestMean;
    let mut bof = BagOfFeatures::new(p, data)
        .unwrap()
        .with_extractor(extractor);
    bof.build_bof().unwrap();
    bof.train().unwrap();
    assert_eq!(bof.model().unwrap().labels(), &[3, 7]);
    assert_eq!(bof.test_set(Split::Valid, 1).unwrap(), 1.);
}

#[test]
fn hierarchical_clustering_from_config() {
    let (data, extractor) = dataset(two_classes(), &[0, 1]);
    let mut p = params(3);
    p.cluster.method = bof::params::ClusterMethod::Hierarchical { branching: 2 };
    let mut bof = BagOfFeatures::new(p, data)
        .unwrap()
        .with_extractor(extractor);
    bof.build_bof().unwrap();
    assert!(bof.codebook().k() <= 3);
    bof.train().unwrap();
    assert_eq!(bof.test_set(Split::Test, 0).unwrap(), 1.);
}

#[test]
fn wrong_descriptor_length_is_fatal() {
    let (data, extractor) = dataset(two_classes(), &[0, 1]);
    let mut p = params(2);
    p.feature_length = 3;
    let mut bof = BagOfFeatures::new(p, data)
        .unwrap()
        .with_extractor(extractor);
    assert!(matches!(
        bof.build_bof(),
        Err(BofErr::DimensionMismatch {
            expected: 3,
            found: 2
        })
    ));
}

#[test]
fn untrained_pipeline_refuses_to_classify() {
    let (data, extractor) = dataset(two_classes(), &[0, 1]);
    let mut bof = BagOfFeatures::new(params(2), data)
        .unwrap()
        .with_extractor(extractor);
    assert!(matches!(
        bof.classify(&[vec![0., 0.]]),
        Err(BofErr::ModelNotTrained)
    ));
    assert!(matches!(bof.train(), Err(BofErr::NotBuilt)));
    bof.build_bof().unwrap();
    assert!(matches!(
        bof.test_set(Split::Valid, 0),
        Err(BofErr::ModelNotTrained)
    ));
}

#[test]
fn classify_image_without_descriptors_fails() {
    let (data, mut extractor) = dataset(two_classes(), &[0, 1]);
    let blank = PathBuf::from("blank.img");
    extractor.0.insert(blank.clone(), Vec::new());
    let mut bof = BagOfFeatures::new(params(4), data)
        .unwrap()
        .with_extractor(extractor);
    bof.build_bof().unwrap();
    bof.train().unwrap();

    let known = bof.datasets()[1].paths(Split::Test)[0].clone();
    assert_eq!(bof.classify_image(&known).unwrap(), 1);
    match bof.classify_image(&blank) {
        Err(BofErr::Extraction { path, reason }) => {
            assert_eq!(path, blank);
            assert_eq!(reason, "no descriptors");
        }
        other => panic!("expected an extraction failure, got {:?}", other),
    }
    assert!(matches!(
        bof.classify_image("missing.img"),
        Err(BofErr::Extraction { .. })
    ));
}

#[test]
fn construction_validates_manifest() {
    assert!(matches!(
        BagOfFeatures::new(params(2), Vec::new()),
        Err(BofErr::NoClasses)
    ));

    let mut p = params(2);
    p.cluster.num_clusters = 0;
    let (data, _) = dataset(two_classes(), &[0, 1]);
    assert!(matches!(
        BagOfFeatures::new(p, data),
        Err(BofErr::InvalidParameter {
            name: "num_clusters",
            ..
        })
    ));
}

#[test]
fn optimizing_requires_validation_images() {
    let images = vec![
        img(0, Split::Train, &[[0., 0.], [0., 1.]]),
        img(1, Split::Train, &[[10., 0.], [10., 1.]]),
        img(1, Split::Valid, &[[10., 0.]]),
    ];
    let (data, extractor) = dataset(images, &[0, 1]);
    let mut p = params(2);
    p.optimize.num_steps = 1;
    let mut bof = BagOfFeatures::new(p, data)
        .unwrap()
        .with_extractor(extractor);
    assert!(matches!(
        bof.build_bof(),
        Err(BofErr::EmptyCollection {
            label: 0,
            split: Split::Valid
        })
    ));
}

#[cfg(feature = "bincode")]
#[test]
fn saved_codebook_can_be_pinned() {
    let (data, extractor) = dataset(two_classes(), &[0, 1]);
    let mut bof = BagOfFeatures::new(params(4), data.clone())
        .unwrap()
        .with_extractor(extractor);
    bof.build_bof().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("words.cb");
    bof.codebook().save(&path).unwrap();

    let (_, extractor) = dataset(two_classes(), &[0, 1]);
    let mut other = BagOfFeatures::new(params(2), data)
        .unwrap()
        .with_extractor(extractor);
    other.extract_features().unwrap();
    other.load_codebook(&path).unwrap();
    assert_eq!(other.codebook(), bof.codebook());
    assert_eq!(other.params().cluster.num_clusters, 4);
    other.build_all_histograms().unwrap();
    other.train().unwrap();
    assert_eq!(other.test_set(Split::Test, 1).unwrap(), 1.);
}

#[cfg(feature = "bincode")]
#[test]
fn ragged_codebook_file_is_rejected() {
    let (data, _) = dataset(two_classes(), &[0, 1]);
    let mut bof = BagOfFeatures::new(params(2), data).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ragged.cb");
    // Same layout as a serialized codebook: centroids, then descriptor length.
    let ragged = (vec![vec![0f32, 0.], vec![1f32]], 2usize);
    std::fs::write(&path, bincode::serialize(&ragged).unwrap()).unwrap();

    assert!(matches!(
        bof.load_codebook(&path),
        Err(BofErr::DimensionMismatch {
            expected: 2,
            found: 1
        })
    ));
    assert!(!bof.codebook().is_built());
}
