//! In-memory hierarchical navigable small-world graph.
//!
//! Levels are derived from the record id so that rebuilding from the same records
//! yields the same layer structure. Deletions leave tombstones that still route
//! traversal; once they exceed a tenth of all nodes the graph is rebuilt.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::vector_index::{DistanceMetric, HnswParams};

const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    dist: f32,
    idx: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.idx.cmp(&other.idx))
    }
}

#[derive(Debug)]
struct Node {
    id: String,
    vector: Vec<f32>,
    /// Neighbour lists, one per layer from 0 up to this node's level.
    links: Vec<Vec<usize>>,
    deleted: bool,
}

#[derive(Debug)]
pub struct HnswGraph {
    params: HnswParams,
    metric: DistanceMetric,
    nodes: Vec<Node>,
    by_id: HashMap<String, usize>,
    entry: Option<usize>,
    top_level: usize,
    tombstones: usize,
}

impl HnswGraph {
    #[must_use]
    pub fn new(params: HnswParams, metric: DistanceMetric) -> Self {
        Self {
            params,
            metric,
            nodes: Vec::new(),
            by_id: HashMap::new(),
            entry: None,
            top_level: 0,
            tombstones: 0,
        }
    }

    /// Live (non-deleted) node count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    #[must_use]
    pub fn vector(&self, id: &str) -> Option<&[f32]> {
        self.by_id.get(id).map(|&i| self.nodes[i].vector.as_slice())
    }

    #[must_use]
    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    #[must_use]
    pub fn params(&self) -> HnswParams {
        self.params
    }

    /// Deterministic level for `id`, geometric with `mL = 1 / ln(m)`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn level_for(&self, id: &str) -> usize {
        let hash = blake3::hash(id.as_bytes());
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&hash.as_bytes()[..8]);
        let raw = u64::from_le_bytes(buf) >> 11;
        let unit = (raw as f64 + 1.0) / (1u64 << 53) as f64;
        let ml = 1.0 / (self.params.m.max(2) as f64).ln();
        let level = (-unit.ln() * ml).floor();
        (level as usize).min(MAX_LEVEL)
    }

    /// Insert or replace the vector stored under `id`.
    ///
    /// A replaced node is tombstoned and counts toward the rebuild threshold.
    pub fn insert(&mut self, id: &str, vector: Vec<f32>) {
        let replaced = self.tombstone(id);
        self.link(id, vector);
        if replaced {
            self.compact_if_needed();
        }
    }

    fn link(&mut self, id: &str, vector: Vec<f32>) {
        let level = self.level_for(id);
        let idx = self.nodes.len();
        self.nodes.push(Node {
            id: id.to_owned(),
            vector,
            links: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.by_id.insert(id.to_owned(), idx);

        let Some(entry) = self.entry else {
            self.entry = Some(idx);
            self.top_level = level;
            return;
        };

        let query = self.nodes[idx].vector.clone();
        let mut entry_points = vec![entry];
        for layer in (level + 1..=self.top_level).rev() {
            if let Some(best) = self.search_layer(&query, &entry_points, 1, layer, &|_| true).first()
            {
                entry_points = vec![best.idx];
            }
        }

        for layer in (0..=level.min(self.top_level)).rev() {
            let found = self.search_layer(
                &query,
                &entry_points,
                self.params.ef_construction.max(1),
                layer,
                &|i| i != idx,
            );
            let neighbours: Vec<usize> = found
                .iter()
                .take(self.params.m.max(1))
                .map(|c| c.idx)
                .collect();
            self.nodes[idx].links[layer].clone_from(&neighbours);
            for &n in &neighbours {
                self.nodes[n].links[layer].push(idx);
                self.prune(n, layer);
            }
            if !found.is_empty() {
                entry_points = found.iter().map(|c| c.idx).collect();
            }
        }

        if level > self.top_level {
            self.top_level = level;
            self.entry = Some(idx);
        }
    }

    /// Mark `id` deleted. Returns whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        if !self.tombstone(id) {
            return false;
        }
        self.compact_if_needed();
        true
    }

    fn compact_if_needed(&mut self) {
        if self.tombstones * 10 > self.nodes.len() {
            self.rebuild();
        }
    }

    fn tombstone(&mut self, id: &str) -> bool {
        match self.by_id.remove(id) {
            Some(idx) => {
                self.nodes[idx].deleted = true;
                self.tombstones += 1;
                true
            }
            None => false,
        }
    }

    /// Rebuild from the live nodes, dropping tombstones.
    pub fn rebuild(&mut self) {
        let live: Vec<(String, Vec<f32>)> = std::mem::take(&mut self.nodes)
            .into_iter()
            .filter(|n| !n.deleted)
            .map(|n| (n.id, n.vector))
            .collect();
        tracing::debug!(nodes = live.len(), tombstones = self.tombstones, "rebuilding hnsw graph");
        self.clear();
        for (id, vector) in live {
            self.link(&id, vector);
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.by_id.clear();
        self.entry = None;
        self.top_level = 0;
        self.tombstones = 0;
    }

    /// Approximate `k` nearest live nodes accepted by `allow`, as `(id, distance)`.
    #[must_use]
    pub fn search(&self, query: &[f32], k: usize, allow: &dyn Fn(&str) -> bool) -> Vec<(String, f32)> {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        let mut ep = entry;
        for layer in (1..=self.top_level).rev() {
            if let Some(best) = self.search_layer(query, &[ep], 1, layer, &|_| true).first() {
                ep = best.idx;
            }
        }
        let ef = self.params.ef_search.max(k);
        let accept = |i: usize| !self.nodes[i].deleted && allow(&self.nodes[i].id);
        self.search_layer(query, &[ep], ef, 0, &accept)
            .into_iter()
            .take(k)
            .map(|c| (self.nodes[c.idx].id.clone(), c.dist))
            .collect()
    }

    /// Exact `k` nearest live nodes accepted by `allow`.
    #[must_use]
    pub fn exact_search(
        &self,
        query: &[f32],
        k: usize,
        allow: &dyn Fn(&str) -> bool,
    ) -> Vec<(String, f32)> {
        let mut scored: Vec<Candidate> = self
            .by_id
            .iter()
            .filter(|(id, _)| allow(id))
            .map(|(_, &idx)| Candidate {
                dist: self.metric.distance(query, &self.nodes[idx].vector),
                idx,
            })
            .collect();
        scored.sort_unstable();
        scored
            .into_iter()
            .take(k)
            .map(|c| (self.nodes[c.idx].id.clone(), c.dist))
            .collect()
    }

    fn distance(&self, query: &[f32], idx: usize) -> f32 {
        self.metric.distance(query, &self.nodes[idx].vector)
    }

    fn max_links(&self, layer: usize) -> usize {
        let m = self.params.m.max(1);
        if layer == 0 { m * 2 } else { m }
    }

    fn prune(&mut self, idx: usize, layer: usize) {
        let cap = self.max_links(layer);
        if self.nodes[idx].links[layer].len() <= cap {
            return;
        }
        let base = &self.nodes[idx].vector;
        let mut scored: Vec<Candidate> = self.nodes[idx].links[layer]
            .iter()
            .map(|&n| Candidate {
                dist: self.metric.distance(base, &self.nodes[n].vector),
                idx: n,
            })
            .collect();
        scored.sort_unstable();
        scored.truncate(cap);
        self.nodes[idx].links[layer] = scored.into_iter().map(|c| c.idx).collect();
    }

    /// Best-first search on one layer. Results hold only nodes accepted by `accept`,
    /// sorted by ascending distance; rejected nodes are still traversed.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[usize],
        ef: usize,
        layer: usize,
        accept: &dyn Fn(usize) -> bool,
    ) -> Vec<Candidate> {
        let mut visited: HashSet<usize> = HashSet::new();
        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        for &ep in entry_points {
            if !visited.insert(ep) {
                continue;
            }
            let c = Candidate {
                dist: self.distance(query, ep),
                idx: ep,
            };
            frontier.push(Reverse(c));
            if accept(ep) {
                results.push(c);
                if results.len() > ef {
                    results.pop();
                }
            }
        }

        while let Some(Reverse(current)) = frontier.pop() {
            if results.len() >= ef && results.peek().is_some_and(|w| current.dist > w.dist) {
                break;
            }
            let Some(links) = self.nodes[current.idx].links.get(layer) else {
                continue;
            };
            for &n in links {
                if !visited.insert(n) {
                    continue;
                }
                let c = Candidate {
                    dist: self.distance(query, n),
                    idx: n,
                };
                let worst = results.peek().map_or(f32::INFINITY, |w| w.dist);
                if results.len() < ef || c.dist < worst {
                    frontier.push(Reverse(c));
                    if accept(n) {
                        results.push(c);
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        results.into_sorted_vec()
    }
}
