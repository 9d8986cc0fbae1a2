// Copyright (c) 2020 CN Group, TU Wien
// Released under the GNU Lesser General Public License version 3,
// see accompanying file LICENSE or <https://www.gnu.org/licenses/>.

use crate::distance::DistanceValue;
use crate::node::NodeId;

/// Kandidat in der Ergebnisliste: entweder ein gefundenes Objekt oder die
/// obere Distanzschranke eines noch nicht besuchten Teilbaums
enum Slot<I> {
    Result(I),
    Pending(NodeId),
}

/// Längenbeschränkte, aufsteigend sortierte Kandidatenliste für die
/// k-NN-Suche. Neben echten Treffern hält sie je wartendem Teilbaum einen
/// Platzhalter mit dessen oberer Distanzschranke; dadurch sinkt der
/// Pruning-Radius schon, bevor die Objekte des Teilbaums gesehen wurden.
/// Beim Besuch eines Teilbaums muss sein Platzhalter zurückgezogen werden,
/// sonst zählt er doppelt zu den dort gefundenen Treffern.
pub struct NearestList<I, R> {
    k: usize,
    entries: Vec<(R, Slot<I>)>,
}

impl<I, R> NearestList<I, R>
where
    R: DistanceValue,
{
    pub fn new(k: usize) -> Self {
        assert!(k >= 1, "k must be at least 1");
        Self {
            k,
            entries: Vec::with_capacity(k + 1),
        }
    }

    /// Aktueller Pruning-Radius: die k-t kleinste bekannte Schranke,
    /// unendlich solange weniger als k Kandidaten vorliegen
    pub fn pruning_radius(&self) -> R {
        if self.entries.len() < self.k {
            R::infinity()
        } else {
            self.entries[self.k - 1].0
        }
    }

    /// Nimmt ein gefundenes Objekt auf
    pub fn push_result(&mut self, id: I, dist: R) {
        self.push(dist, Slot::Result(id));
    }

    /// Nimmt die obere Schranke eines wartenden Teilbaums auf
    pub fn push_pending(&mut self, node: NodeId, bound: R) {
        self.push(bound, Slot::Pending(node));
    }

    /// Zieht den Platzhalter eines Teilbaums zurück (beim Besuch des Knotens)
    pub fn retract_pending(&mut self, node: NodeId) {
        self.entries
            .retain(|(_, slot)| !matches!(slot, Slot::Pending(n) if *n == node));
    }

    fn push(&mut self, key: R, slot: Slot<I>) {
        let pos = self
            .entries
            .iter()
            .position(|(d, _)| *d > key)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, (key, slot));
        self.entries.truncate(self.k);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Die gefundenen Objekte, aufsteigend nach Distanz
    pub fn into_results(self) -> Vec<(I, R)> {
        self.entries
            .into_iter()
            .filter_map(|(dist, slot)| match slot {
                Slot::Result(id) => Some((id, dist)),
                Slot::Pending(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radius_infinite_until_full() {
        let mut list: NearestList<u32, f64> = NearestList::new(2);
        assert_eq!(list.pruning_radius(), f64::INFINITY);
        list.push_result(1, 3.0);
        assert_eq!(list.pruning_radius(), f64::INFINITY);
        list.push_result(2, 5.0);
        assert_eq!(list.pruning_radius(), 5.0);
    }

    #[test]
    fn test_truncates_to_k() {
        let mut list: NearestList<u32, f64> = NearestList::new(2);
        list.push_result(1, 3.0);
        list.push_result(2, 5.0);
        list.push_result(3, 1.0);
        assert_eq!(list.pruning_radius(), 3.0);
        assert_eq!(list.into_results(), vec![(3, 1.0), (1, 3.0)]);
    }

    #[test]
    fn test_pending_tightens_radius() {
        let mut list: NearestList<u32, f64> = NearestList::new(2);
        list.push_pending(NodeId(0), 4.0);
        list.push_pending(NodeId(1), 6.0);
        assert_eq!(list.pruning_radius(), 6.0);
        // Platzhalter zählen nicht zu den Ergebnissen
        assert!(list.into_results().is_empty());
    }

    #[test]
    fn test_retract_reopens_radius() {
        let mut list: NearestList<u32, f64> = NearestList::new(2);
        list.push_result(7, 5.0);
        list.push_pending(NodeId(3), 6.0);
        assert_eq!(list.pruning_radius(), 6.0);
        list.retract_pending(NodeId(3));
        assert_eq!(list.pruning_radius(), f64::INFINITY);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_result_displaces_own_placeholder() {
        // Teilbaum meldet Schranke 6, sein nächstes Objekt liegt bei 5:
        // nach Rückzug und Einfügen bleibt die Liste konsistent
        let mut list: NearestList<u32, f64> = NearestList::new(2);
        list.push_pending(NodeId(0), 6.0);
        list.push_result(1, 5.0);
        list.retract_pending(NodeId(0));
        list.push_result(2, 7.0);
        assert_eq!(list.into_results(), vec![(1, 5.0), (2, 7.0)]);
    }

    #[test]
    fn test_integer_distances() {
        let mut list: NearestList<&str, u32> = NearestList::new(3);
        list.push_result("a", 2);
        list.push_result("b", 0);
        assert_eq!(list.pruning_radius(), u32::MAX);
        list.push_result("c", 9);
        assert_eq!(list.pruning_radius(), 9);
        assert_eq!(list.into_results(), vec![("b", 0), ("a", 2), ("c", 9)]);
    }
}
