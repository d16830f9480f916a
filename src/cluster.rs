use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

use crate::*;

/// Turns a large set of descriptors into representative centroids.
pub trait Clusterer: Send + Sync {
    /// Cluster `features` into (at most) `k` centroids.
    ///
    /// Fails if `k` is infeasible for the input; implementations never clamp `k`.
    fn cluster(&self, features: &[Desc], k: usize) -> BofResult<Vec<Desc>>;
}

/// Flat k-means: k-means++ seeding followed by Lloyd iterations.
#[derive(Debug, Clone)]
pub struct KMeans {
    pub max_iterations: usize,
    /// Iteration stops when no centroid moves further than this.
    pub convergence_threshold: f32,
    /// Independent restarts; the one with the lowest within-cluster sum of squares wins.
    pub num_pass: usize,
    pub seed: Option<u64>,
}

impl Default for KMeans {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_threshold: 1e-4,
            num_pass: 1,
            seed: None,
        }
    }
}

/// Hierarchical k-means in the manner of FLANN: the leaf with the largest
/// within-cluster sum of squares is split into `branching` children until
/// another split would produce more than `k` leaves.
///
/// Returns at most `k` centroids, so the resulting codebook can be smaller
/// than requested.
#[derive(Debug, Clone)]
pub struct HierarchicalKMeans {
    pub branching: usize,
    pub kmeans: KMeans,
}

impl Clusterer for KMeans {
    fn cluster(&self, features: &[Desc], k: usize) -> BofResult<Vec<Desc>> {
        check_feasible(features, k)?;
        if self.num_pass == 0 {
            return Err(BofErr::InvalidParameter {
                name: "num_pass",
                message: "must be > 0".into(),
            });
        }

        let mut rng = self.rng();
        let mut best: Option<(f32, Vec<Desc>)> = None;
        for pass in 0..self.num_pass {
            let (centroids, assignments) = self.lloyd(features, k, &mut rng);
            let wcss = wcss(features, &assignments, &centroids);
            debug!(pass, wcss, k, "k-means pass finished");
            if best.as_ref().map_or(true, |(b, _)| wcss < *b) {
                best = Some((wcss, centroids));
            }
        }
        Ok(best.map(|(_, c)| c).unwrap_or_default())
    }
}

impl Clusterer for HierarchicalKMeans {
    fn cluster(&self, features: &[Desc], k: usize) -> BofResult<Vec<Desc>> {
        check_feasible(features, k)?;
        if self.branching < 2 {
            return Err(BofErr::InvalidParameter {
                name: "branching",
                message: format!("must be >= 2, got {}", self.branching),
            });
        }

        let mut rng = self.kmeans.rng();
        let all: Vec<usize> = (0..features.len()).collect();
        let mut leaves: Vec<Leaf> = vec![Leaf::new(features, all)];

        while leaves.len() + self.branching - 1 <= k {
            // Split the worst leaf that still has enough members.
            let worst = leaves
                .iter()
                .enumerate()
                .filter(|(_, l)| l.members.len() >= self.branching && l.wcss > 0.)
                .max_by(|(_, a), (_, b)| a.wcss.total_cmp(&b.wcss))
                .map(|(i, _)| i);
            let worst = match worst {
                Some(i) => i,
                None => break,
            };

            let leaf = leaves.swap_remove(worst);
            let subset: Vec<Desc> = leaf.members.iter().map(|&i| features[i].clone()).collect();
            let (_, assignments) = self.kmeans.lloyd(&subset, self.branching, &mut rng);

            let mut groups: Vec<Vec<usize>> = vec![Vec::new(); self.branching];
            for (local, &g) in assignments.iter().enumerate() {
                groups[g].push(leaf.members[local]);
            }
            debug!(
                members = leaf.members.len(),
                leaves = leaves.len() + 1,
                "splitting leaf"
            );
            leaves.extend(
                groups
                    .into_iter()
                    .filter(|g| !g.is_empty())
                    .map(|g| Leaf::new(features, g)),
            );
        }

        Ok(leaves.into_iter().map(|l| l.centroid).collect())
    }
}

impl KMeans {
    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// One run of Lloyd's algorithm. Returns centroids and the assignment of every feature.
    /// Caller guarantees `0 < k <= features.len()`.
    fn lloyd(&self, features: &[Desc], k: usize, rng: &mut StdRng) -> (Vec<Desc>, Vec<usize>) {
        let mut centroids = Self::initialize_clusters(features, k, rng);
        let mut assignments = vec![0usize; features.len()];

        for _ in 0..self.max_iterations {
            for (i, f) in features.iter().enumerate() {
                assignments[i] = nearest(&centroids, f).0;
            }

            let new_centroids = desc_mean(features, &assignments, &centroids);
            let max_shift = centroids
                .iter()
                .zip(&new_centroids)
                .map(|(a, b)| squared_euclidean(a, b).sqrt())
                .fold(0f32, f32::max);
            centroids = new_centroids;

            if max_shift < self.convergence_threshold {
                break; // converged
            }
        }

        // Final assignment against the settled centroids.
        for (i, f) in features.iter().enumerate() {
            assignments[i] = nearest(&centroids, f).0;
        }
        (centroids, assignments)
    }

    /// k-means++ seeding: each new center is drawn with probability proportional
    /// to its squared distance from the closest center chosen so far.
    fn initialize_clusters(features: &[Desc], k: usize, rng: &mut StdRng) -> Vec<Desc> {
        let mut centroids: Vec<Desc> = Vec::with_capacity(k);
        centroids.push(features[rng.gen_range(0..features.len())].clone());
        let mut min_dist = vec![f32::INFINITY; features.len()];

        while centroids.len() < k {
            let last = &centroids[centroids.len() - 1];
            for (d, f) in min_dist.iter_mut().zip(features) {
                *d = d.min(squared_euclidean(f, last));
            }

            let total: f32 = min_dist.iter().sum();
            let next = if total > 0. {
                let mut target = rng.gen_range(0. ..total);
                let mut chosen = features.len() - 1;
                for (i, &d) in min_dist.iter().enumerate() {
                    if target < d {
                        chosen = i;
                        break;
                    }
                    target -= d;
                }
                chosen
            } else {
                // Every point coincides with a center already.
                rng.gen_range(0..features.len())
            };
            centroids.push(features[next].clone());
        }
        centroids
    }
}

struct Leaf {
    members: Vec<usize>,
    centroid: Desc,
    wcss: f32,
}

impl Leaf {
    fn new(features: &[Desc], members: Vec<usize>) -> Self {
        let assignments = vec![0; members.len()];
        let subset: Vec<Desc> = members.iter().map(|&i| features[i].clone()).collect();
        let seed = vec![subset[0].clone()];
        let centroid = desc_mean(&subset, &assignments, &seed).remove(0);
        let wcss = subset.iter().map(|f| squared_euclidean(f, &centroid)).sum();
        Self {
            members,
            centroid,
            wcss,
        }
    }
}

fn check_feasible(features: &[Desc], k: usize) -> BofResult<()> {
    if k == 0 {
        return Err(BofErr::InvalidParameter {
            name: "k",
            message: "must be > 0".into(),
        });
    }
    if k > features.len() {
        return Err(BofErr::InvalidClusterCount {
            requested: k,
            available: features.len(),
        });
    }
    Ok(())
}

#[inline]
/// Squared Euclidean distance between two descriptors.
pub(crate) fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Index of (and distance to) the closest centroid. Ties go to the lowest index.
pub(crate) fn nearest(centroids: &[Desc], v: &[f32]) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (j, c) in centroids.iter().enumerate() {
        let d = squared_euclidean(c, v);
        if d < best.1 {
            best = (j, d);
        }
    }
    best
}

/// Mean of every group of descriptors. Empty groups keep their previous centroid.
fn desc_mean(features: &[Desc], assignments: &[usize], previous: &[Desc]) -> Vec<Desc> {
    let dim = previous.first().map_or(0, |c| c.len());
    let mut sums = vec![vec![0f32; dim]; previous.len()];
    let mut counts = vec![0usize; previous.len()];
    for (f, &g) in features.iter().zip(assignments) {
        counts[g] += 1;
        for (s, x) in sums[g].iter_mut().zip(f) {
            *s += x;
        }
    }
    sums.into_iter()
        .zip(counts)
        .zip(previous)
        .map(|((mut sum, count), prev)| {
            if count == 0 {
                return prev.clone();
            }
            let inv = 1. / count as f32;
            sum.iter_mut().for_each(|s| *s *= inv);
            sum
        })
        .collect()
}

fn wcss(features: &[Desc], assignments: &[usize], centroids: &[Desc]) -> f32 {
    features
        .iter()
        .zip(assignments)
        .map(|(f, &g)| squared_euclidean(f, &centroids[g]))
        .sum()
}
