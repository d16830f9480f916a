use bof::{dataset, BagOfFeatures, BofParams};

fn main() {
    tracing_subscriber::fmt::init();

    // Configuration and class manifests
    let params = BofParams::load("data/params.json").unwrap();
    let sets = dataset::load_manifest("data/manifest.json").unwrap();

    // Extract, optimize the codebook size, encode, then train
    let mut bof = BagOfFeatures::new(params, sets).unwrap();
    bof.build_bof().unwrap();
    bof.train().unwrap();
    println!("Codebook: {:#?}", bof.codebook());

    // Per class accuracy on every split
    println!("Label | Train | Valid | Test");
    for r in bof.test_dataset().unwrap() {
        println!("{:>5} | {:?} | {:?} | {:?}", r.label, r.train, r.valid, r.test);
    }
}
