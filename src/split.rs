// Copyright (c) 2020 CN Group, TU Wien
// Released under the GNU Lesser General Public License version 3,
// see accompanying file LICENSE or <https://www.gnu.org/licenses/>.

use crate::distance::{Distance, DistanceValue};
use crate::node::Entry;
use rand::rngs::StdRng;
use rand::Rng;
use std::cmp::Ordering;

/// Promotionsstrategie beim Split: wählt die beiden Referenzobjekte,
/// die nach dem Split als neue Router dienen
/// (Ciaccia/Patella/Zezula, "M-tree: An Efficient Access Method for
/// Similarity Search in Metric Spaces").
///
/// MIN_RAD: minimiert die Summe der beiden Hüllradien (teuerste Strategie)
/// MIN_MAXRAD: minimiert den größeren der beiden Hüllradien
/// M_LB_DIST: maximiert die Distanz der Kandidaten, nutzt nur die Distanzmatrix
/// RANDOM: wählt zufällig, schnell aber naiv
/// SAMPLING: mehrere zufällige Proben, die beste wird behalten
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum PromotePolicy {
    Random,
    Sampling,
    MinRad,
    MinMaxRad,
    #[default]
    MLbDist,
}

/// Aufteilungsstrategie beim Split: verteilt die Einträge auf die beiden
/// neuen Knoten unter den gewählten Routern.
///
/// BALANCED: abwechselnd das jeweils nächste Element je Router,
/// garantiert Größenunterschied von höchstens 1
/// GEN_HYPERPLANE: jedes Element zum näheren Router, Größen können abweichen
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum PartitionPolicy {
    #[default]
    Balanced,
    GenHyperplane,
}

/// Paarweise Distanzmatrix über die Kandidatenmenge eines Splits.
/// Wird einmal berechnet, damit Promotion und Probe-Partitionierungen
/// keine weiteren Aufrufe der Distanzfunktion brauchen.
pub struct DistanceMatrix<R> {
    n: usize,
    data: Vec<R>,
}

impl<R> DistanceMatrix<R>
where
    R: DistanceValue,
{
    pub fn build<T, E>(bucket: &[E], distance: &dyn Distance<T, Output = R>) -> Self
    where
        E: Entry<T, R>,
    {
        let n = bucket.len();
        let mut data = vec![R::zero(); n * n];
        for i in 0..n {
            for j in (i + 1)..n {
                let d = distance.distance(bucket[i].ref_value(), bucket[j].ref_value());
                debug_assert!(d >= R::zero(), "distance function returned a negative value");
                data[i * n + j] = d;
                data[j * n + i] = d;
            }
        }
        Self { n, data }
    }

    pub fn get(&self, i: usize, j: usize) -> R {
        self.data[i * self.n + j]
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }
}

/// Ergebnis einer (Probe-)Partitionierung: Indexmengen der beiden
/// Ausgabeknoten und ihre Hüllradien
pub(crate) struct Assignment<R> {
    pub(crate) first: Vec<usize>,
    pub(crate) second: Vec<usize>,
    pub(crate) radius_first: R,
    pub(crate) radius_second: R,
}

/// Verteilt die Kandidaten `0..matrix.len()` auf zwei Knoten mit den
/// Routern `o1` und `o2`. `subtree_radii` enthält je Kandidat den Radius
/// seines Teilbaums; er geht in die Hüllradien der Ausgabeknoten ein,
/// damit jedes erreichbare Objekt abgedeckt bleibt.
pub(crate) fn partition_indices<R>(
    matrix: &DistanceMatrix<R>,
    subtree_radii: &[R],
    o1: usize,
    o2: usize,
    policy: PartitionPolicy,
    node_capacity: usize,
) -> Assignment<R>
where
    R: DistanceValue,
{
    let n = matrix.len();
    debug_assert!(n <= 2 * node_capacity);

    let (first, second) = match policy {
        PartitionPolicy::Balanced => balanced_indices(matrix, o1, o2, node_capacity),
        PartitionPolicy::GenHyperplane => hyperplane_indices(matrix, o1, o2, node_capacity),
    };

    let max_radius = |indices: &[usize], origin: usize| {
        let mut radius = R::zero();
        for &x in indices {
            let candidate = matrix.get(origin, x) + subtree_radii[x];
            if candidate > radius {
                radius = candidate;
            }
        }
        radius
    };
    let radius_first = max_radius(&first, o1);
    let radius_second = max_radius(&second, o2);

    Assignment {
        first,
        second,
        radius_first,
        radius_second,
    }
}

/// Abwechselnde Zuteilung: beide Kandidatenlisten aufsteigend nach Distanz
/// zum jeweiligen Router sortiert, dann reihum das nächste noch freie
/// Element. Ein voller Knoten setzt aus, bis alles verteilt ist.
fn balanced_indices<R>(
    matrix: &DistanceMatrix<R>,
    o1: usize,
    o2: usize,
    node_capacity: usize,
) -> (Vec<usize>, Vec<usize>)
where
    R: DistanceValue,
{
    let n = matrix.len();
    let mut order1: Vec<usize> = (0..n).collect();
    let mut order2 = order1.clone();
    order1.sort_by(|&a, &b| {
        matrix
            .get(o1, a)
            .partial_cmp(&matrix.get(o1, b))
            .unwrap_or(Ordering::Equal)
    });
    order2.sort_by(|&a, &b| {
        matrix
            .get(o2, a)
            .partial_cmp(&matrix.get(o2, b))
            .unwrap_or(Ordering::Equal)
    });

    let mut taken = vec![false; n];
    let mut first = Vec::with_capacity(n / 2 + 1);
    let mut second = Vec::with_capacity(n / 2 + 1);
    let (mut i1, mut i2) = (0, 0);
    let mut turn_first = true;

    while first.len() + second.len() < n {
        let to_first = if first.len() >= node_capacity {
            false
        } else if second.len() >= node_capacity {
            true
        } else {
            turn_first
        };
        if to_first {
            while taken[order1[i1]] {
                i1 += 1;
            }
            taken[order1[i1]] = true;
            first.push(order1[i1]);
        } else {
            while taken[order2[i2]] {
                i2 += 1;
            }
            taken[order2[i2]] = true;
            second.push(order2[i2]);
        }
        turn_first = !turn_first;
    }

    (first, second)
}

/// Zuteilung zum näheren Router, Gleichstand zum ersten.
/// Die Router selbst gehen vorab in ihren eigenen Knoten; ein voller
/// Knoten gibt an den anderen ab, damit die Kapazität eingehalten wird.
fn hyperplane_indices<R>(
    matrix: &DistanceMatrix<R>,
    o1: usize,
    o2: usize,
    node_capacity: usize,
) -> (Vec<usize>, Vec<usize>)
where
    R: DistanceValue,
{
    let n = matrix.len();
    let mut first = vec![o1];
    let mut second = vec![o2];

    for x in 0..n {
        if x == o1 || x == o2 {
            continue;
        }
        let d1 = matrix.get(o1, x);
        let d2 = matrix.get(o2, x);
        let to_first = if d1 <= d2 {
            first.len() < node_capacity
        } else {
            second.len() >= node_capacity
        };
        if to_first {
            first.push(x);
        } else {
            second.push(x);
        }
    }

    (first, second)
}

/// Wählt die beiden zu promovierenden Kandidatenindizes. Ist `pinned`
/// gesetzt (Split eines Nicht-Wurzel-Knotens), bleibt dieser Index als
/// erster Router fest, damit das Zentrum des Knotens erhalten bleibt;
/// die Strategie wählt dann nur den zweiten Router.
pub(crate) fn promote_indices<R>(
    policy: PromotePolicy,
    partition: PartitionPolicy,
    matrix: &DistanceMatrix<R>,
    subtree_radii: &[R],
    pinned: Option<usize>,
    node_capacity: usize,
    rng: &mut StdRng,
) -> (usize, usize)
where
    R: DistanceValue,
{
    let n = matrix.len();
    debug_assert!(n >= 2, "promotion requires at least two candidates");

    match policy {
        PromotePolicy::Random => random_pair(n, pinned, rng),
        PromotePolicy::Sampling => {
            let trials = ((node_capacity + 9) / 10).max(2);
            let mut best = random_pair(n, pinned, rng);
            let mut best_score = trial_radius_sum(matrix, subtree_radii, best, partition, node_capacity);
            for _ in 1..trials {
                let pair = random_pair(n, pinned, rng);
                let score = trial_radius_sum(matrix, subtree_radii, pair, partition, node_capacity);
                if score < best_score {
                    best = pair;
                    best_score = score;
                }
            }
            best
        }
        PromotePolicy::MinRad | PromotePolicy::MinMaxRad => {
            let mut best: Option<((usize, usize), R)> = None;
            for pair in candidate_pairs(n, pinned) {
                let assignment = partition_indices(
                    matrix,
                    subtree_radii,
                    pair.0,
                    pair.1,
                    partition,
                    node_capacity,
                );
                let score = if policy == PromotePolicy::MinRad {
                    assignment.radius_first + assignment.radius_second
                } else if assignment.radius_first >= assignment.radius_second {
                    assignment.radius_first
                } else {
                    assignment.radius_second
                };
                if best.map_or(true, |(_, best_score)| score < best_score) {
                    best = Some((pair, score));
                }
            }
            best.map(|(pair, _)| pair).unwrap_or((0, 1))
        }
        PromotePolicy::MLbDist => {
            let mut best = (0, 1);
            let mut best_dist: Option<R> = None;
            for (i, j) in candidate_pairs(n, pinned) {
                let d = matrix.get(i, j);
                if best_dist.map_or(true, |bd| d > bd) {
                    best = (i, j);
                    best_dist = Some(d);
                }
            }
            best
        }
    }
}

fn trial_radius_sum<R>(
    matrix: &DistanceMatrix<R>,
    subtree_radii: &[R],
    pair: (usize, usize),
    partition: PartitionPolicy,
    node_capacity: usize,
) -> R
where
    R: DistanceValue,
{
    let assignment = partition_indices(
        matrix,
        subtree_radii,
        pair.0,
        pair.1,
        partition,
        node_capacity,
    );
    assignment.radius_first + assignment.radius_second
}

/// Alle Kandidatenpaare; bei fixiertem ersten Router nur dessen Zeile
fn candidate_pairs(n: usize, pinned: Option<usize>) -> Vec<(usize, usize)> {
    match pinned {
        Some(p) => (0..n).filter(|&j| j != p).map(|j| (p, j)).collect(),
        None => {
            let mut pairs = Vec::with_capacity(n * (n - 1) / 2);
            for i in 0..n {
                for j in (i + 1)..n {
                    pairs.push((i, j));
                }
            }
            pairs
        }
    }
}

/// Zwei verschiedene Indizes, gleichverteilt; der zweite wird über das
/// Lücken-Verfahren gezogen, damit er nie mit dem ersten zusammenfällt
fn random_pair(n: usize, pinned: Option<usize>, rng: &mut StdRng) -> (usize, usize) {
    let i = match pinned {
        Some(p) => p,
        None => rng.gen_range(0..n),
    };
    let mut j = rng.gen_range(0..n - 1);
    if j >= i {
        j += 1;
    }
    (i, j)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::FnDistance;
    use crate::node::LeafEntry;
    use rand::SeedableRng;

    fn bucket_1d(values: &[f64]) -> Vec<LeafEntry<f64, usize, f64>> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| LeafEntry {
                value: v,
                id: i,
                dist_parent: 0.0,
            })
            .collect()
    }

    fn matrix_1d(values: &[f64]) -> DistanceMatrix<f64> {
        let bucket = bucket_1d(values);
        let dist = FnDistance::new(|a: &f64, b: &f64| (a - b).abs());
        DistanceMatrix::build(&bucket, &dist)
    }

    #[test]
    fn test_matrix_symmetric_zero_diagonal() {
        let m = matrix_1d(&[1.0, 4.0, 9.0]);
        assert_eq!(m.len(), 3);
        for i in 0..3 {
            assert_eq!(m.get(i, i), 0.0);
            for j in 0..3 {
                assert_eq!(m.get(i, j), m.get(j, i));
            }
        }
        assert_eq!(m.get(0, 2), 8.0);
    }

    #[test]
    fn test_balanced_sizes_differ_at_most_one() {
        let values = [0.0, 1.0, 2.0, 10.0, 11.0, 12.0];
        let m = matrix_1d(&values);
        let radii = vec![0.0; values.len()];
        let a = partition_indices(&m, &radii, 0, 5, PartitionPolicy::Balanced, 5);
        assert_eq!(a.first.len() + a.second.len(), values.len());
        assert!(a.first.len().abs_diff(a.second.len()) <= 1);
        // die Router landen im eigenen Knoten
        assert!(a.first.contains(&0));
        assert!(a.second.contains(&5));
    }

    #[test]
    fn test_balanced_respects_capacity() {
        let values = [0.0, 1.0, 2.0, 3.0, 4.0];
        let m = matrix_1d(&values);
        let radii = vec![0.0; values.len()];
        let a = partition_indices(&m, &radii, 0, 4, PartitionPolicy::Balanced, 4);
        assert!(a.first.len() <= 4);
        assert!(a.second.len() <= 4);
        assert!(!a.first.is_empty());
        assert!(!a.second.is_empty());
    }

    #[test]
    fn test_hyperplane_assigns_to_nearer_router() {
        let values = [0.0, 1.0, 2.0, 10.0, 11.0];
        let m = matrix_1d(&values);
        let radii = vec![0.0; values.len()];
        let a = partition_indices(&m, &radii, 0, 4, PartitionPolicy::GenHyperplane, 4);
        assert_eq!(a.first, vec![0, 1, 2]);
        assert_eq!(a.second, vec![4, 3]);
        assert_eq!(a.radius_first, 2.0);
        assert_eq!(a.radius_second, 1.0);
    }

    #[test]
    fn test_hyperplane_tie_goes_to_first() {
        // 5.0 liegt genau zwischen beiden Routern
        let values = [0.0, 5.0, 10.0];
        let m = matrix_1d(&values);
        let radii = vec![0.0; values.len()];
        let a = partition_indices(&m, &radii, 0, 2, PartitionPolicy::GenHyperplane, 2);
        assert!(a.first.contains(&1));
    }

    #[test]
    fn test_hyperplane_all_near_first_router() {
        // alle Elemente näher am ersten Router, Kapazität bleibt eingehalten
        let values = [0.0, 1.0, 2.0, 3.0, 100.0];
        let m = matrix_1d(&values);
        let radii = vec![0.0; values.len()];
        let a = partition_indices(&m, &radii, 0, 4, PartitionPolicy::GenHyperplane, 4);
        assert!(a.first.len() <= 4);
        assert!(a.second.len() <= 4);
        assert_eq!(a.first.len() + a.second.len(), values.len());
    }

    #[test]
    fn test_subtree_radii_enter_cover_radius() {
        let values = [0.0, 4.0];
        let m = matrix_1d(&values);
        let radii = vec![1.5, 2.5];
        let a = partition_indices(&m, &radii, 0, 1, PartitionPolicy::GenHyperplane, 2);
        // jeder Router deckt den eigenen Teilbaum ab
        assert_eq!(a.radius_first, 1.5);
        assert_eq!(a.radius_second, 2.5);
    }

    #[test]
    fn test_mlb_dist_picks_farthest_pair() {
        let values = [3.0, 0.0, 10.0, 7.0];
        let m = matrix_1d(&values);
        let radii = vec![0.0; values.len()];
        let mut rng = StdRng::seed_from_u64(7);
        let (i, j) = promote_indices(
            PromotePolicy::MLbDist,
            PartitionPolicy::Balanced,
            &m,
            &radii,
            None,
            3,
            &mut rng,
        );
        assert_eq!((i, j), (1, 2));
    }

    #[test]
    fn test_mlb_dist_pinned_picks_farthest_from_centre() {
        let values = [3.0, 0.0, 10.0, 7.0];
        let m = matrix_1d(&values);
        let radii = vec![0.0; values.len()];
        let mut rng = StdRng::seed_from_u64(7);
        let (i, j) = promote_indices(
            PromotePolicy::MLbDist,
            PartitionPolicy::Balanced,
            &m,
            &radii,
            Some(0),
            3,
            &mut rng,
        );
        assert_eq!(i, 0);
        assert_eq!(j, 2);
    }

    #[test]
    fn test_min_rad_prefers_tight_pair() {
        // zwei enge Cluster: (0, 1) und (100, 101)
        let values = [0.0, 1.0, 100.0, 101.0];
        let m = matrix_1d(&values);
        let radii = vec![0.0; values.len()];
        let mut rng = StdRng::seed_from_u64(7);
        let (i, j) = promote_indices(
            PromotePolicy::MinRad,
            PartitionPolicy::GenHyperplane,
            &m,
            &radii,
            None,
            3,
            &mut rng,
        );
        // ein Router je Cluster minimiert die Radiensumme
        assert!((i < 2) != (j < 2), "got pair ({}, {})", i, j);
    }

    #[test]
    fn test_random_pair_distinct() {
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..200 {
            let (i, j) = random_pair(5, None, &mut rng);
            assert_ne!(i, j);
            assert!(i < 5 && j < 5);
        }
        for _ in 0..200 {
            let (i, j) = random_pair(5, Some(2), &mut rng);
            assert_eq!(i, 2);
            assert_ne!(j, 2);
            assert!(j < 5);
        }
    }
}
