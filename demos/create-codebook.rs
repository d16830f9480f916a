use bof::{dataset, BofParams, Codebook, FeatureExtractor, Split};
use tracing::{info, warn};

fn main() {
    tracing_subscriber::fmt::init();

    // Load the manifest and gather the training descriptors of every class
    let params = BofParams::load("data/params.json").unwrap();
    let sets = dataset::load_manifest("data/manifest.json").unwrap();
    let extractor = params.extractor.build();
    let mut features = Vec::new();
    for set in &sets {
        for path in set.paths(Split::Train) {
            match extractor.extract(path) {
                Ok(f) => features.extend(f),
                Err(e) => warn!("Skipping {:?}: {}", path, e),
            }
        }
    }
    info!("Extracted {} training descriptors.", features.len());

    // Create codebook from features
    let mut codebook = Codebook::empty(params.feature_length);
    let clusterer = params.cluster.build();
    codebook
        .build(&features, params.cluster.num_clusters, clusterer.as_ref())
        .unwrap();
    println!("\nCodebook = {:#?}", codebook);

    // Save codebook and load it again just for fun
    codebook.save("codebooks/test.cb").unwrap();
    let loaded = Codebook::load("codebooks/test.cb").unwrap();

    // Make sure save & load worked
    assert_eq!(codebook, loaded);
}
