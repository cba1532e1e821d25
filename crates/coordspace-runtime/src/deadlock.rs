//! Wait-for graph and deadlock detection
//!
//! Vertices are transactions. An edge `A -> B` means an operation of `A` is
//! blocked on an entry locked by `B`. Each blocked operation contributes its
//! own edges, so an edge stays while at least one operation still needs it.
//!
//! Detection snapshots the graph into a dense arena (vertices by integer id)
//! and runs Tarjan's strongly connected components over it with fresh
//! scratch state. Components with more than one transaction are deadlocks.

use coordspace_common::TxId;
use coordspace_common::config::VictimPolicyConfig;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Identifier of one blocked operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaitId(pub u64);

#[derive(Default)]
struct GraphState {
    /// blocked operation -> (waiting transaction, holders)
    waits: HashMap<WaitId, (TxId, BTreeSet<TxId>)>,
    /// (waiter, holder) -> number of operations contributing the edge
    edges: BTreeMap<(TxId, TxId), usize>,
}

impl GraphState {
    fn release(&mut self, waiter: TxId, holder: TxId) {
        if let Some(count) = self.edges.get_mut(&(waiter, holder)) {
            *count -= 1;
            if *count == 0 {
                self.edges.remove(&(waiter, holder));
            }
        }
    }

    fn drop_op(&mut self, op: WaitId) -> Option<(TxId, BTreeSet<TxId>)> {
        let (waiter, holders) = self.waits.remove(&op)?;
        for holder in &holders {
            self.release(waiter, *holder);
        }
        Some((waiter, holders))
    }
}

/// Wait-for graph with its own lock
#[derive(Default)]
pub struct WaitForGraph {
    state: Mutex<GraphState>,
}

impl WaitForGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the holders a blocked operation waits on, replacing its previous
    /// edges. Returns whether any edge is new for this operation.
    pub fn set_waits<I>(&self, op: WaitId, waiter: TxId, holders: I) -> bool
    where
        I: IntoIterator<Item = TxId>,
    {
        let holders: BTreeSet<TxId> = holders.into_iter().filter(|h| *h != waiter).collect();
        let mut state = self.state.lock();
        let previous = state.drop_op(op).map(|(_, old)| old).unwrap_or_default();
        let added = holders.iter().any(|h| !previous.contains(h));
        for holder in &holders {
            *state.edges.entry((waiter, *holder)).or_insert(0) += 1;
        }
        if !holders.is_empty() {
            state.waits.insert(op, (waiter, holders));
        }
        added
    }

    /// Remove the edges of a finished or cancelled operation
    pub fn remove_op(&self, op: WaitId) {
        self.state.lock().drop_op(op);
    }

    /// Remove a transaction as waiter and as holder
    pub fn remove_transaction(&self, tx: TxId) {
        let mut state = self.state.lock();
        let own: Vec<WaitId> = state
            .waits
            .iter()
            .filter(|(_, (waiter, _))| *waiter == tx)
            .map(|(op, _)| *op)
            .collect();
        for op in own {
            state.drop_op(op);
        }

        let held: Vec<(WaitId, TxId)> = state
            .waits
            .iter()
            .filter(|(_, (_, holders))| holders.contains(&tx))
            .map(|(op, (waiter, _))| (*op, *waiter))
            .collect();
        for (op, waiter) in held {
            state.release(waiter, tx);
            if let Some((_, holders)) = state.waits.get_mut(&op) {
                holders.remove(&tx);
                if holders.is_empty() {
                    state.waits.remove(&op);
                }
            }
        }
    }

    #[must_use]
    pub fn has_edge(&self, waiter: TxId, holder: TxId) -> bool {
        self.state.lock().edges.contains_key(&(waiter, holder))
    }

    /// Number of distinct edges
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.state.lock().edges.len()
    }

    #[must_use]
    pub fn snapshot(&self) -> WaitSnapshot {
        let edges: Vec<(TxId, TxId)> = self.state.lock().edges.keys().copied().collect();
        WaitSnapshot::from_edges(edges)
    }
}

/// Dense copy of the graph used by one detection run
#[derive(Debug, Default)]
pub struct WaitSnapshot {
    vertices: Vec<TxId>,
    adjacency: Vec<Vec<usize>>,
}

impl WaitSnapshot {
    /// Build from `(waiter, holder)` edges; vertices are numbered in
    /// transaction order
    pub fn from_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (TxId, TxId)>,
    {
        let edges: Vec<(TxId, TxId)> = edges.into_iter().collect();
        let ids: BTreeSet<TxId> = edges.iter().flat_map(|(a, b)| [*a, *b]).collect();
        let vertices: Vec<TxId> = ids.into_iter().collect();
        let slot: HashMap<TxId, usize> = vertices.iter().enumerate().map(|(i, tx)| (*tx, i)).collect();

        let mut adjacency = vec![Vec::new(); vertices.len()];
        for (from, to) in edges {
            adjacency[slot[&from]].push(slot[&to]);
        }
        Self {
            vertices,
            adjacency,
        }
    }

    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Strongly connected components with more than one vertex
    #[must_use]
    pub fn cycles(&self) -> Vec<Vec<TxId>> {
        let mut search = CycleSearch::new(&self.adjacency);
        for v in 0..self.vertices.len() {
            if search.index[v].is_none() {
                search.visit(v);
            }
        }
        search
            .components
            .into_iter()
            .filter(|c| c.len() > 1)
            .map(|c| {
                let mut cycle: Vec<TxId> = c.into_iter().map(|v| self.vertices[v]).collect();
                cycle.sort_unstable();
                cycle
            })
            .collect()
    }
}

/// Tarjan's algorithm scratch state
///
/// The depth-first search keeps its own stack of `(vertex, next edge)`
/// frames, so a long wait chain never deepens the thread stack.
struct CycleSearch<'a> {
    adjacency: &'a [Vec<usize>],
    index: Vec<Option<usize>>,
    low: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    calls: Vec<(usize, usize)>,
    next: usize,
    components: Vec<Vec<usize>>,
}

impl<'a> CycleSearch<'a> {
    fn new(adjacency: &'a [Vec<usize>]) -> Self {
        let n = adjacency.len();
        Self {
            adjacency,
            index: vec![None; n],
            low: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            calls: Vec::new(),
            next: 0,
            components: Vec::new(),
        }
    }

    fn enter(&mut self, v: usize) {
        self.index[v] = Some(self.next);
        self.low[v] = self.next;
        self.next += 1;
        self.stack.push(v);
        self.on_stack[v] = true;
        self.calls.push((v, 0));
    }

    fn visit(&mut self, root: usize) {
        let adjacency = self.adjacency;
        self.enter(root);

        while let Some(frame) = self.calls.last_mut() {
            let (v, edge) = *frame;
            if let Some(&w) = adjacency[v].get(edge) {
                frame.1 += 1;
                match self.index[w] {
                    None => self.enter(w),
                    Some(iw) if self.on_stack[w] => {
                        self.low[v] = self.low[v].min(iw);
                    }
                    Some(_) => {}
                }
                continue;
            }

            // every edge of v explored
            self.calls.pop();
            if let Some(&(parent, _)) = self.calls.last() {
                self.low[parent] = self.low[parent].min(self.low[v]);
            }
            if Some(self.low[v]) == self.index[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }
}

/// Picks the transaction aborted to break a cycle
pub trait VictimPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, cycle: &[TxId]) -> Option<TxId>;
}

/// Abort the most recently started transaction
pub struct YoungestVictim;

impl VictimPolicy for YoungestVictim {
    fn name(&self) -> &'static str {
        "youngest"
    }

    fn select(&self, cycle: &[TxId]) -> Option<TxId> {
        cycle.iter().copied().max()
    }
}

/// Abort the longest running transaction
pub struct OldestVictim;

impl VictimPolicy for OldestVictim {
    fn name(&self) -> &'static str {
        "oldest"
    }

    fn select(&self, cycle: &[TxId]) -> Option<TxId> {
        cycle.iter().copied().min()
    }
}

#[must_use]
pub fn victim_policy(config: VictimPolicyConfig) -> Box<dyn VictimPolicy> {
    match config {
        VictimPolicyConfig::Youngest => Box::new(YoungestVictim),
        VictimPolicyConfig::Oldest => Box::new(OldestVictim),
    }
}

/// A detected cycle and the transaction chosen to break it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deadlock {
    pub cycle: Vec<TxId>,
    pub victim: TxId,
}

/// Wait-for graph plus victim selection
pub struct DeadlockDetector {
    graph: WaitForGraph,
    policy: Box<dyn VictimPolicy>,
    runs: AtomicU64,
}

impl DeadlockDetector {
    pub fn new(policy: Box<dyn VictimPolicy>) -> Self {
        Self {
            graph: WaitForGraph::new(),
            policy,
            runs: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn graph(&self) -> &WaitForGraph {
        &self.graph
    }

    /// Number of detection runs so far
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Find every cycle and pick one victim per cycle
    ///
    /// Only reads the graph; the caller aborts the victims.
    pub fn detect(&self) -> Vec<Deadlock> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.graph.snapshot();
        if snapshot.vertex_count() < 2 {
            return Vec::new();
        }

        let deadlocks: Vec<Deadlock> = snapshot
            .cycles()
            .into_iter()
            .filter_map(|cycle| {
                let victim = self.policy.select(&cycle)?;
                Some(Deadlock { cycle, victim })
            })
            .collect();

        for deadlock in &deadlocks {
            warn!(
                "Deadlock among transactions {:?}, aborting {} ({} policy)",
                deadlock.cycle,
                deadlock.victim,
                self.policy.name()
            );
        }
        debug!(
            "Deadlock scan over {} transactions found {} cycle(s)",
            snapshot.vertex_count(),
            deadlocks.len()
        );
        deadlocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(n: u64) -> TxId {
        TxId::new(n)
    }

    #[test]
    fn test_three_cycle_reported_once() {
        let snapshot = WaitSnapshot::from_edges([(tx(1), tx(2)), (tx(2), tx(3)), (tx(3), tx(1))]);
        assert_eq!(snapshot.cycles(), vec![vec![tx(1), tx(2), tx(3)]]);
    }

    #[test]
    fn test_chain_has_no_cycle() {
        let snapshot = WaitSnapshot::from_edges([(tx(1), tx(2)), (tx(2), tx(3))]);
        assert!(snapshot.cycles().is_empty());
    }

    #[test]
    fn test_self_loop_not_reported() {
        let snapshot = WaitSnapshot::from_edges([(tx(1), tx(1))]);
        assert!(snapshot.cycles().is_empty());
    }

    #[test]
    fn test_disjoint_cycles_and_tail() {
        let snapshot = WaitSnapshot::from_edges([
            (tx(1), tx(2)),
            (tx(2), tx(1)),
            (tx(3), tx(4)),
            (tx(4), tx(5)),
            (tx(5), tx(3)),
            (tx(6), tx(1)),
        ]);
        let mut cycles = snapshot.cycles();
        cycles.sort();
        assert_eq!(cycles, vec![vec![tx(1), tx(2)], vec![tx(3), tx(4), tx(5)]]);
    }

    #[test]
    fn test_cycles_joined_by_one_edge_stay_apart() {
        // 1 <-> 2 -> 3 <-> 4
        let snapshot = WaitSnapshot::from_edges([
            (tx(1), tx(2)),
            (tx(2), tx(1)),
            (tx(2), tx(3)),
            (tx(3), tx(4)),
            (tx(4), tx(3)),
        ]);
        let mut cycles = snapshot.cycles();
        cycles.sort();
        assert_eq!(cycles, vec![vec![tx(1), tx(2)], vec![tx(3), tx(4)]]);
    }

    #[test]
    fn test_long_wait_chain() {
        const LEN: u64 = 200_000;
        let chain: Vec<(TxId, TxId)> = (1..LEN).map(|i| (tx(i), tx(i + 1))).collect();

        let open = WaitSnapshot::from_edges(chain.iter().copied());
        assert!(open.cycles().is_empty());

        let closed = WaitSnapshot::from_edges(chain.into_iter().chain([(tx(LEN), tx(1))]));
        let cycles = closed.cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 200_000);
        assert_eq!(cycles[0].first(), Some(&tx(1)));
    }

    #[test]
    fn test_edge_multiplicity() {
        let graph = WaitForGraph::new();
        assert!(graph.set_waits(WaitId(1), tx(1), [tx(2)]));
        assert!(graph.set_waits(WaitId(2), tx(1), [tx(2)]));
        assert!(!graph.set_waits(WaitId(1), tx(1), [tx(2)]));
        assert_eq!(graph.edge_count(), 1);

        graph.remove_op(WaitId(1));
        assert!(graph.has_edge(tx(1), tx(2)));
        graph.remove_op(WaitId(2));
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_set_waits_replaces_previous_edges() {
        let graph = WaitForGraph::new();
        graph.set_waits(WaitId(1), tx(1), [tx(2), tx(3)]);
        graph.set_waits(WaitId(1), tx(1), [tx(3)]);
        assert!(!graph.has_edge(tx(1), tx(2)));
        assert!(graph.has_edge(tx(1), tx(3)));
    }

    #[test]
    fn test_remove_transaction_as_holder_and_waiter() {
        let graph = WaitForGraph::new();
        graph.set_waits(WaitId(1), tx(1), [tx(2), tx(3)]);
        graph.set_waits(WaitId(2), tx(2), [tx(3)]);
        graph.remove_transaction(tx(3));
        assert!(graph.has_edge(tx(1), tx(2)));
        assert_eq!(graph.edge_count(), 1);

        graph.remove_transaction(tx(1));
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_detector_picks_one_victim_per_cycle() {
        let detector = DeadlockDetector::new(victim_policy(VictimPolicyConfig::Youngest));
        detector.graph().set_waits(WaitId(1), tx(4), [tx(7)]);
        detector.graph().set_waits(WaitId(2), tx(7), [tx(4)]);
        assert_eq!(
            detector.detect(),
            vec![Deadlock {
                cycle: vec![tx(4), tx(7)],
                victim: tx(7),
            }]
        );

        let oldest = DeadlockDetector::new(victim_policy(VictimPolicyConfig::Oldest));
        oldest.graph().set_waits(WaitId(1), tx(4), [tx(7)]);
        oldest.graph().set_waits(WaitId(2), tx(7), [tx(4)]);
        assert_eq!(oldest.detect()[0].victim, tx(4));
        assert_eq!(oldest.runs(), 1);
    }
}
