//! Dinic max-flow / min-cut over an explicit residual graph.
//!
//! Augmenting paths are found with an explicit stack so deep level graphs
//! (long thin image regions) cannot overflow the call stack.

use std::collections::VecDeque;

const EPSILON: f64 = 1e-9;
const UNREACHED: usize = usize::MAX;

#[derive(Debug, Clone)]
pub(super) struct FlowGraph {
    adjacency: Vec<Vec<usize>>,
    to: Vec<usize>,
    capacity: Vec<f64>,
}

impl FlowGraph {
    pub(super) fn new(nodes: usize) -> Self {
        Self {
            adjacency: vec![Vec::new(); nodes],
            to: Vec::new(),
            capacity: Vec::new(),
        }
    }

    /// Add `u -> v` with `forward` capacity and `v -> u` with `backward`.
    pub(super) fn add_edge(&mut self, u: usize, v: usize, forward: f64, backward: f64) {
        let e = self.to.len();
        self.to.push(v);
        self.capacity.push(forward);
        self.adjacency[u].push(e);
        self.to.push(u);
        self.capacity.push(backward);
        self.adjacency[v].push(e + 1);
    }

    fn levels(&self, source: usize, sink: usize) -> Option<Vec<usize>> {
        let mut level = vec![UNREACHED; self.adjacency.len()];
        level[source] = 0;
        let mut queue = VecDeque::from([source]);
        while let Some(u) = queue.pop_front() {
            for &e in &self.adjacency[u] {
                let v = self.to[e];
                if self.capacity[e] > EPSILON && level[v] == UNREACHED {
                    level[v] = level[u] + 1;
                    queue.push_back(v);
                }
            }
        }
        (level[sink] != UNREACHED).then_some(level)
    }

    /// Push a blocking flow through the level graph.
    fn blocking_flow(&mut self, source: usize, sink: usize, level: &[usize]) -> f64 {
        let mut next = vec![0_usize; self.adjacency.len()];
        let mut path: Vec<usize> = Vec::new();
        let mut total = 0.0;
        let mut u = source;
        loop {
            if u == sink {
                let pushed = path
                    .iter()
                    .map(|&e| self.capacity[e])
                    .fold(f64::INFINITY, f64::min);
                for &e in &path {
                    self.capacity[e] -= pushed;
                    self.capacity[e ^ 1] += pushed;
                }
                total += pushed;
                let saturated = path
                    .iter()
                    .position(|&e| self.capacity[e] <= EPSILON)
                    .unwrap_or(0);
                path.truncate(saturated);
                u = path.last().map_or(source, |&e| self.to[e]);
                continue;
            }
            let mut advanced = false;
            while next[u] < self.adjacency[u].len() {
                let e = self.adjacency[u][next[u]];
                let v = self.to[e];
                if self.capacity[e] > EPSILON && level[v] == level[u] + 1 {
                    path.push(e);
                    u = v;
                    advanced = true;
                    break;
                }
                next[u] += 1;
            }
            if advanced {
                continue;
            }
            match path.pop() {
                None => return total,
                Some(e) => {
                    u = self.to[e ^ 1];
                    next[u] += 1;
                }
            }
        }
    }

    /// Saturate the graph; returns the total flow.
    pub(super) fn max_flow(&mut self, source: usize, sink: usize) -> f64 {
        let mut flow = 0.0;
        while let Some(level) = self.levels(source, sink) {
            let pushed = self.blocking_flow(source, sink, &level);
            if pushed <= EPSILON {
                break;
            }
            flow += pushed;
        }
        flow
    }

    /// Nodes reachable from `source` in the residual graph: the source side
    /// of a minimum cut once [`max_flow`](Self::max_flow) has run.
    pub(super) fn source_side(&self, source: usize) -> Vec<bool> {
        let mut seen = vec![false; self.adjacency.len()];
        seen[source] = true;
        let mut stack = vec![source];
        while let Some(u) = stack.pop() {
            for &e in &self.adjacency[u] {
                let v = self.to[e];
                if self.capacity[e] > EPSILON && !seen[v] {
                    seen[v] = true;
                    stack.push(v);
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_network() {
        // CLRS flow network, max flow 23.
        let mut g = FlowGraph::new(6);
        g.add_edge(0, 1, 16.0, 0.0);
        g.add_edge(0, 2, 13.0, 0.0);
        g.add_edge(1, 2, 10.0, 4.0);
        g.add_edge(1, 3, 12.0, 0.0);
        g.add_edge(2, 4, 14.0, 0.0);
        g.add_edge(3, 2, 9.0, 0.0);
        g.add_edge(3, 5, 20.0, 0.0);
        g.add_edge(4, 3, 7.0, 0.0);
        g.add_edge(4, 5, 4.0, 0.0);
        assert!((g.max_flow(0, 5) - 23.0).abs() < 1e-9);
        let side = g.source_side(0);
        assert!(side[0]);
        assert!(!side[5]);
    }

    #[test]
    fn cut_separates_weakly_linked_chain() {
        // s -> a -> b -> t with a weak middle link.
        let mut g = FlowGraph::new(4);
        g.add_edge(0, 1, 10.0, 0.0);
        g.add_edge(1, 2, 1.0, 1.0);
        g.add_edge(2, 3, 10.0, 0.0);
        assert!((g.max_flow(0, 3) - 1.0).abs() < 1e-9);
        assert_eq!(g.source_side(0), vec![true, true, false, false]);
    }

    #[test]
    fn long_path_does_not_recurse() {
        let n = 100_000;
        let mut g = FlowGraph::new(n);
        for i in 0..n - 1 {
            g.add_edge(i, i + 1, 2.0, 0.0);
        }
        assert!((g.max_flow(0, n - 1) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn disconnected_sink_has_no_flow() {
        let mut g = FlowGraph::new(3);
        g.add_edge(0, 1, 5.0, 0.0);
        assert!(g.max_flow(0, 2).abs() < 1e-12);
    }
}
