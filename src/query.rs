// Copyright (c) 2020 CN Group, TU Wien
// Released under the GNU Lesser General Public License version 3,
// see accompanying file LICENSE or <https://www.gnu.org/licenses/>.

use crate::distance::DistanceValue;
use crate::node::{NodeEntries, NodeId};
use crate::tree::MTree;

/// Iterator für die Bereichssuche: liefert alle Einträge, deren Wert
/// höchstens `radius` von der Anfrage entfernt liegt.
///
/// Die Traversierung prüft je Kandidat zweistufig: zuerst die billige
/// Schranke aus den zwischengespeicherten Elterndistanzen
/// (Dreiecksungleichung, ohne Aufruf der Distanzfunktion), erst danach
/// die exakte Distanz.
pub struct RangeQuery<'a, T, I, R> {
    tree: &'a MTree<T, I, R>,
    needle: &'a T,
    radius: R,
    /// noch zu besuchende Knoten mit der Distanz der Anfrage
    /// zum jeweiligen Eltern-Referenzobjekt
    stack: Vec<(NodeId, R)>,
    leaf: Option<(NodeId, R)>,
    slot: usize,
}

impl<'a, T, I, R> RangeQuery<'a, T, I, R>
where
    T: Clone,
    I: Clone,
    R: DistanceValue,
{
    pub(crate) fn new(tree: &'a MTree<T, I, R>, needle: &'a T, radius: R) -> Self {
        let stack = match tree.root {
            Some(root) => vec![(root, R::zero())],
            None => Vec::new(),
        };
        Self {
            tree,
            needle,
            radius,
            stack,
            leaf: None,
            slot: 0,
        }
    }
}

impl<'a, T, I, R> Iterator for RangeQuery<'a, T, I, R>
where
    T: Clone,
    I: Clone,
    R: DistanceValue,
{
    type Item = (I, R);

    fn next(&mut self) -> Option<Self::Item> {
        let tree = self.tree;
        loop {
            if let Some((leaf_id, dist_to_parent)) = self.leaf {
                let entries = tree.node(leaf_id).leaf_entries();
                while self.slot < entries.len() {
                    let entry = &entries[self.slot];
                    self.slot += 1;
                    if R::abs_diff(dist_to_parent, entry.dist_parent) > self.radius {
                        continue;
                    }
                    let d = tree.dist(self.needle, &entry.value);
                    if d <= self.radius {
                        return Some((entry.id.clone(), d));
                    }
                }
                self.leaf = None;
            }

            let (node_id, dist_to_parent) = self.stack.pop()?;
            match &tree.node(node_id).entries {
                NodeEntries::Leaf(_) => {
                    self.leaf = Some((node_id, dist_to_parent));
                    self.slot = 0;
                }
                NodeEntries::Routing(entries) => {
                    for routing in entries {
                        let lower = R::abs_diff(dist_to_parent, routing.dist_parent);
                        if R::clamped_sub(lower, routing.cover_radius) > self.radius {
                            continue;
                        }
                        let d = tree.dist(self.needle, &routing.center);
                        if R::clamped_sub(d, routing.cover_radius) <= self.radius {
                            self.stack.push((routing.child, d));
                        }
                    }
                }
            }
        }
    }
}
