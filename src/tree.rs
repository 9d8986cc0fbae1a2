// Copyright (c) 2020 CN Group, TU Wien
// Released under the GNU Lesser General Public License version 3,
// see accompanying file LICENSE or <https://www.gnu.org/licenses/>.

use crate::distance::{Distance, DistanceValue};
use crate::nearest::NearestList;
use crate::node::{Entry, LeafEntry, Node, NodeEntries, NodeId, RoutingEntry};
use crate::query::RangeQuery;
use crate::split::{partition_indices, promote_indices, DistanceMatrix, PartitionPolicy, PromotePolicy};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::fmt::Write as _;

/// M-Baum: dynamischer, balancierter Indexbaum für Ähnlichkeitssuche in
/// metrischen Räumen. Gespeichert werden Werte vom Typ `T` unter einem vom
/// Aufrufer vergebenen Identifikator `I`; Distanzen haben den Skalartyp `R`.
///
/// Alle Knoten liegen in einer Arena und werden über Indizes adressiert;
/// Eltern-Verweise sind nicht-besitzende Indizes, Kinder gehören exklusiv
/// ihrem Elternknoten. Der Baum ist strikt einfädig, jede Operation läuft
/// bis zum Ende durch.
pub struct MTree<T, I, R = f64> {
    pub(crate) nodes: Vec<Node<T, I, R>>,
    pub(crate) root: Option<NodeId>,
    pub(crate) distance: Box<dyn Distance<T, Output = R>>,
    pub(crate) capacity: usize,
    pub(crate) promote_policy: PromotePolicy,
    pub(crate) partition_policy: PartitionPolicy,
    pub(crate) rng: StdRng,
    pub(crate) len: usize,
}

/// Ergebnis von Promotion und Partitionierung eines übergelaufenen Knotens
struct SplitOutcome<E, T, R> {
    first: Vec<E>,
    second: Vec<E>,
    center_first: T,
    center_second: T,
    radius_first: R,
    radius_second: R,
}

/// Queue-Eintrag für die k-NN-Traversierung (Min-Heap über die untere
/// Distanzschranke des Teilbaums)
struct KnnQueueEntry<R> {
    bound: R,
    node: NodeId,
    /// Distanz der Anfrage zum Referenzobjekt des Elternrouters
    center_distance: R,
}

impl<R: PartialOrd> PartialEq for KnnQueueEntry<R> {
    fn eq(&self, other: &Self) -> bool {
        self.bound == other.bound
    }
}

impl<R: PartialOrd> Eq for KnnQueueEntry<R> {}

impl<R: PartialOrd> PartialOrd for KnnQueueEntry<R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        other.bound.partial_cmp(&self.bound)
    }
}

impl<R: PartialOrd> Ord for KnnQueueEntry<R> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .bound
            .partial_cmp(&self.bound)
            .unwrap_or(Ordering::Equal)
    }
}

impl<T, I, R> MTree<T, I, R>
where
    T: Clone,
    I: Clone,
    R: DistanceValue,
{
    /// Erstellt einen neuen M-Baum mit den Standardstrategien
    /// (M_LB_DIST-Promotion, balancierte Partitionierung)
    pub fn new<D>(distance: D, capacity: usize) -> Self
    where
        D: Distance<T, Output = R> + 'static,
    {
        Self::with_policies(
            distance,
            capacity,
            PromotePolicy::default(),
            PartitionPolicy::default(),
        )
    }

    /// Erstellt einen neuen M-Baum mit expliziten Split-Strategien
    pub fn with_policies<D>(
        distance: D,
        capacity: usize,
        promote_policy: PromotePolicy,
        partition_policy: PartitionPolicy,
    ) -> Self
    where
        D: Distance<T, Output = R> + 'static,
    {
        assert!(capacity >= 2, "node capacity must be at least 2");
        Self {
            nodes: Vec::new(),
            root: None,
            distance: Box::new(distance),
            capacity,
            promote_policy,
            partition_policy,
            rng: StdRng::from_entropy(),
            len: 0,
        }
    }

    /// Wie `with_policies`, aber mit festem Startwert für die
    /// zufallsbasierten Promotionsstrategien (deterministische Tests)
    pub fn with_seed<D>(
        distance: D,
        capacity: usize,
        promote_policy: PromotePolicy,
        partition_policy: PartitionPolicy,
        seed: u64,
    ) -> Self
    where
        D: Distance<T, Output = R> + 'static,
    {
        let mut tree = Self::with_policies(distance, capacity, promote_policy, partition_policy);
        tree.rng = StdRng::seed_from_u64(seed);
        tree
    }

    /// Anzahl der gespeicherten Einträge
    pub fn size(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximale Anzahl Einträge je Knoten
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Gilt ab dem nächsten Split
    pub fn set_promote_policy(&mut self, policy: PromotePolicy) {
        self.promote_policy = policy;
    }

    /// Gilt ab dem nächsten Split
    pub fn set_partition_policy(&mut self, policy: PartitionPolicy) {
        self.partition_policy = policy;
    }

    /// Leert den Baum; die Arena wird vollständig freigegeben
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = None;
        self.len = 0;
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node<T, I, R> {
        &self.nodes[id.index()]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node<T, I, R> {
        &mut self.nodes[id.index()]
    }

    fn alloc(&mut self, node: Node<T, I, R>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub(crate) fn dist(&self, a: &T, b: &T) -> R {
        let d = self.distance.distance(a, b);
        debug_assert!(d >= R::zero(), "distance function returned a negative value");
        d
    }

    /// Fügt einen Eintrag ein. Der Identifikator darf noch nicht im Baum
    /// vorkommen; Eindeutigkeit wird nicht geprüft.
    pub fn insert(&mut self, id: I, value: T) {
        let mut current = match self.root {
            Some(root) => root,
            None => {
                let entry = LeafEntry {
                    value,
                    id,
                    dist_parent: R::zero(),
                };
                let root = self.alloc(Node {
                    parent: None,
                    entries: NodeEntries::Leaf(vec![entry]),
                });
                self.root = Some(root);
                self.len = 1;
                return;
            }
        };

        // Abstieg: im abdeckenden Router mit kleinster Distanz, sonst im
        // Router mit der kleinsten nötigen Radiusvergrößerung; dessen
        // Hüllradius wird dabei minimal erweitert
        let mut dist_parent = R::zero();
        loop {
            if self.node(current).is_leaf() {
                break;
            }

            let mut covered: Option<(usize, R)> = None;
            let mut enlarge: Option<(usize, R, R)> = None;
            for (i, routing) in self.node(current).routing_entries().iter().enumerate() {
                let d = self.dist(&value, &routing.center);
                if d <= routing.cover_radius {
                    if covered.map_or(true, |(_, best)| d < best) {
                        covered = Some((i, d));
                    }
                } else {
                    let increase = d - routing.cover_radius;
                    if enlarge.map_or(true, |(_, _, best)| increase < best) {
                        enlarge = Some((i, d, increase));
                    }
                }
            }

            let (next, d) = match covered {
                Some((i, d)) => (self.node(current).routing_entries()[i].child, d),
                None => {
                    let (i, d, _) = enlarge.expect("routing node without entries");
                    let routing = &mut self.node_mut(current).routing_entries_mut()[i];
                    routing.cover_radius = d;
                    (routing.child, d)
                }
            };
            current = next;
            dist_parent = d;
        }

        let entry = LeafEntry {
            value,
            id,
            dist_parent,
        };
        if self.node(current).len() < self.capacity {
            self.node_mut(current).leaf_entries_mut().push(entry);
        } else {
            self.split_leaf(current, entry);
        }
        self.len += 1;
    }

    /// Bereichssuche als Iterator über `(Identifikator, Distanz)`
    pub fn range_search<'a>(&'a self, needle: &'a T, radius: R) -> RangeQuery<'a, T, I, R> {
        RangeQuery::new(self, needle, radius)
    }

    /// Bereichssuche: alle Identifikatoren im Radius um die Anfrage,
    /// Reihenfolge unbestimmt
    pub fn range(&self, needle: &T, radius: R) -> Vec<I> {
        self.range_search(needle, radius).map(|(id, _)| id).collect()
    }

    /// k-NN-Suche: höchstens k Einträge, aufsteigend nach Distanz,
    /// Gleichstände in beliebiger Reihenfolge.
    ///
    /// Best-First-Traversierung: ein Min-Heap über die untere
    /// Distanzschranke der Teilbäume, dazu die Kandidatenliste mit dem
    /// k-t-besten Pruning-Radius. Obere Schranken der Teilbäume gehen als
    /// Platzhalter in die Liste ein und drücken den Radius vorab; beim
    /// Besuch eines Teilbaums wird sein Platzhalter zurückgezogen.
    pub fn knn_search(&self, needle: &T, k: usize) -> Vec<(I, R)> {
        assert!(k >= 1, "k must be at least 1");
        let root = match self.root {
            Some(root) => root,
            None => return Vec::new(),
        };

        let mut queue: BinaryHeap<KnnQueueEntry<R>> = BinaryHeap::new();
        queue.push(KnnQueueEntry {
            bound: R::zero(),
            node: root,
            center_distance: R::zero(),
        });
        let mut nearest: NearestList<I, R> = NearestList::new(k);

        while let Some(entry) = queue.pop() {
            if entry.bound > nearest.pruning_radius() {
                break;
            }
            nearest.retract_pending(entry.node);
            let dist_to_parent = entry.center_distance;

            match &self.node(entry.node).entries {
                NodeEntries::Routing(entries) => {
                    for routing in entries {
                        let radius = nearest.pruning_radius();
                        let cheap = R::abs_diff(dist_to_parent, routing.dist_parent);
                        if R::clamped_sub(cheap, routing.cover_radius) > radius {
                            continue;
                        }
                        let d = self.dist(needle, &routing.center);
                        let lower = R::clamped_sub(d, routing.cover_radius);
                        if lower <= radius {
                            queue.push(KnnQueueEntry {
                                bound: lower,
                                node: routing.child,
                                center_distance: d,
                            });
                            nearest.push_pending(routing.child, d + routing.cover_radius);
                        }
                    }
                }
                NodeEntries::Leaf(entries) => {
                    for leaf in entries {
                        let radius = nearest.pruning_radius();
                        if R::abs_diff(dist_to_parent, leaf.dist_parent) > radius {
                            continue;
                        }
                        let d = self.dist(needle, &leaf.value);
                        if d <= radius {
                            nearest.push_result(leaf.id.clone(), d);
                        }
                    }
                }
            }
        }

        nearest.into_results()
    }

    /// Split eines vollen Blatts: der Arena-Platz des alten Knotens wird
    /// für den ersten Ausgabeknoten wiederverwendet, so bleibt der
    /// Kind-Verweis des Elternrouters gültig
    fn split_leaf(&mut self, node_id: NodeId, extra: LeafEntry<T, I, R>) {
        let was_root = self.root == Some(node_id);
        let mut bucket = std::mem::take(self.node_mut(node_id).leaf_entries_mut());
        bucket.push(extra);

        let outcome = self.promote_and_partition(bucket, was_root);
        let parent = self.node(node_id).parent;
        self.node_mut(node_id).entries = NodeEntries::Leaf(outcome.first);
        let second_id = self.alloc(Node {
            parent,
            entries: NodeEntries::Leaf(outcome.second),
        });

        self.reattach(
            node_id,
            second_id,
            outcome.center_first,
            outcome.radius_first,
            outcome.center_second,
            outcome.radius_second,
            was_root,
        );
    }

    /// Split eines vollen inneren Knotens (rekursiv aus `reattach`)
    fn split_routing(&mut self, node_id: NodeId, extra: RoutingEntry<T, R>) {
        let was_root = self.root == Some(node_id);
        let mut bucket = std::mem::take(self.node_mut(node_id).routing_entries_mut());
        bucket.push(extra);

        let outcome = self.promote_and_partition(bucket, was_root);
        let parent = self.node(node_id).parent;
        self.node_mut(node_id).entries = NodeEntries::Routing(outcome.first);
        let second_id = self.alloc(Node {
            parent,
            entries: NodeEntries::Routing(outcome.second),
        });
        self.relink_children(node_id);
        self.relink_children(second_id);

        self.reattach(
            node_id,
            second_id,
            outcome.center_first,
            outcome.radius_first,
            outcome.center_second,
            outcome.radius_second,
            was_root,
        );
    }

    /// Promotion und Partitionierung über der Kandidatenmenge `bucket`.
    /// Die Distanzmatrix wird einmal berechnet und von beiden Schritten
    /// verwendet. Beim Split eines Nicht-Wurzel-Knotens bleibt dessen
    /// Zentrumseintrag als erster Router fixiert, damit der Eintrag im
    /// Elternknoten weiterhin ein unter ihm gespeichertes Objekt benennt.
    fn promote_and_partition<E>(&mut self, bucket: Vec<E>, was_root: bool) -> SplitOutcome<E, T, R>
    where
        E: Entry<T, R>,
    {
        let matrix = DistanceMatrix::build(&bucket, self.distance.as_ref());
        let subtree_radii: Vec<R> = bucket.iter().map(|e| e.subtree_radius()).collect();
        let pinned = if was_root {
            None
        } else {
            bucket.iter().position(|e| e.dist_parent() <= R::zero())
        };

        let (i1, i2) = promote_indices(
            self.promote_policy,
            self.partition_policy,
            &matrix,
            &subtree_radii,
            pinned,
            self.capacity,
            &mut self.rng,
        );
        let assignment = partition_indices(
            &matrix,
            &subtree_radii,
            i1,
            i2,
            self.partition_policy,
            self.capacity,
        );

        let center_first = bucket[i1].ref_value().clone();
        let center_second = bucket[i2].ref_value().clone();

        let mut slots: Vec<Option<E>> = bucket.into_iter().map(Some).collect();
        let mut collect = |indices: &[usize], origin: usize| -> Vec<E> {
            indices
                .iter()
                .map(|&x| {
                    let mut entry = slots[x].take().expect("bucket index assigned twice");
                    entry.set_dist_parent(matrix.get(origin, x));
                    entry
                })
                .collect()
        };
        let first = collect(&assignment.first, i1);
        let second = collect(&assignment.second, i2);

        SplitOutcome {
            first,
            second,
            center_first,
            center_second,
            radius_first: assignment.radius_first,
            radius_second: assignment.radius_second,
        }
    }

    /// Hängt die beiden Ausgabeknoten eines Splits wieder ein: bei einem
    /// Wurzel-Split wächst der Baum um eine neue Wurzel, sonst ersetzt der
    /// erste Router den alten Eintrag im Elternknoten und der zweite wird
    /// angehängt oder löst dort den nächsten Split aus
    #[allow(clippy::too_many_arguments)]
    fn reattach(
        &mut self,
        first_id: NodeId,
        second_id: NodeId,
        center_first: T,
        radius_first: R,
        center_second: T,
        radius_second: R,
        was_root: bool,
    ) {
        if was_root {
            let root_id = self.alloc(Node {
                parent: None,
                entries: NodeEntries::Routing(vec![
                    RoutingEntry {
                        center: center_first,
                        child: first_id,
                        cover_radius: radius_first,
                        dist_parent: R::zero(),
                    },
                    RoutingEntry {
                        center: center_second,
                        child: second_id,
                        cover_radius: radius_second,
                        dist_parent: R::zero(),
                    },
                ]),
            });
            self.node_mut(first_id).parent = Some(root_id);
            self.node_mut(second_id).parent = Some(root_id);
            self.root = Some(root_id);
            return;
        }

        let parent_id = self
            .node(first_id)
            .parent
            .expect("non-root node without parent");

        // Distanzen der neuen Router zum Referenzobjekt des Elternknotens
        let parent_center = self.parent_center(parent_id);
        let (dist_first, dist_second) = match &parent_center {
            Some(center) => (
                self.dist(center, &center_first),
                self.dist(center, &center_second),
            ),
            None => (R::zero(), R::zero()),
        };

        let replacement = RoutingEntry {
            center: center_first,
            child: first_id,
            cover_radius: radius_first,
            dist_parent: dist_first,
        };
        let appended = RoutingEntry {
            center: center_second,
            child: second_id,
            cover_radius: radius_second,
            dist_parent: dist_second,
        };

        {
            let entries = self.node_mut(parent_id).routing_entries_mut();
            let pos = entries
                .iter()
                .position(|r| r.child == first_id)
                .expect("split node missing from its parent");
            entries[pos] = replacement;
        }
        self.node_mut(second_id).parent = Some(parent_id);

        if self.node(parent_id).len() < self.capacity {
            self.node_mut(parent_id).routing_entries_mut().push(appended);
        } else {
            self.split_routing(parent_id, appended);
        }
    }

    /// Referenzobjekt des Routers, der auf `node_id` zeigt
    /// (None für die Wurzel)
    fn parent_center(&self, node_id: NodeId) -> Option<T> {
        let parent = self.node(node_id).parent?;
        let entry = self
            .node(parent)
            .routing_entries()
            .iter()
            .find(|r| r.child == node_id)
            .expect("child node missing from its parent");
        Some(entry.center.clone())
    }

    fn relink_children(&mut self, node_id: NodeId) {
        let children: Vec<NodeId> = self
            .node(node_id)
            .routing_entries()
            .iter()
            .map(|r| r.child)
            .collect();
        for child in children {
            self.node_mut(child).parent = Some(node_id);
        }
    }
}

impl<T, I, R> MTree<T, I, R>
where
    T: Clone + fmt::Debug,
    I: Clone + fmt::Debug,
    R: DistanceValue + fmt::Debug,
{
    /// Gibt den Baum ebenenweise aus, eine Zeile je Knoten: Einträge durch
    /// `|` getrennt mit Distanz- und Radius-Annotation, `_` für freie
    /// Plätze, die Wurzel trägt `no parent`
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let root = match self.root {
            Some(root) => root,
            None => return out,
        };

        let mut queue = VecDeque::from([root]);
        while let Some(node_id) = queue.pop_front() {
            let node = self.node(node_id);
            let mut slots: Vec<String> = Vec::with_capacity(self.capacity);
            match &node.entries {
                NodeEntries::Leaf(entries) => {
                    for entry in entries {
                        slots.push(format!(
                            "{:?}:{:?} d={:?}",
                            entry.id, entry.value, entry.dist_parent
                        ));
                    }
                }
                NodeEntries::Routing(entries) => {
                    for entry in entries {
                        slots.push(format!(
                            "{:?} d={:?} r={:?}",
                            entry.center, entry.dist_parent, entry.cover_radius
                        ));
                        queue.push_back(entry.child);
                    }
                }
            }
            while slots.len() < self.capacity {
                slots.push("_".to_string());
            }
            let _ = write!(out, "[{}]", slots.join(" | "));
            if node.parent.is_none() {
                out.push_str(" no parent");
            }
            out.push('\n');
        }
        out
    }
}
