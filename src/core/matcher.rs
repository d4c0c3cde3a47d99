use crate::core::fingerprint::FingerprintSet;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Union-find over record indices.
#[derive(Debug)]
pub struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    pub fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    pub fn find(&mut self, i: usize) -> usize {
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // Path compression
        let mut node = i;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }

    /// Components with more than one member, members ascending, groups
    /// ordered by their smallest member.
    pub fn components(&mut self) -> Vec<Vec<usize>> {
        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..self.parent.len() {
            let root = self.find(i);
            by_root.entry(root).or_default().push(i);
        }
        let mut groups: Vec<Vec<usize>> = by_root.into_values().filter(|g| g.len() > 1).collect();
        groups.sort_by_key(|g| g[0]);
        groups
    }
}

/// Clusters fingerprint sets whose Hamming distance, across transform
/// variants, is within a threshold.
#[derive(Debug, Clone, Copy)]
pub struct NearDuplicateMatcher {
    threshold: u32,
}

impl NearDuplicateMatcher {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    /// Connected components of the near-duplicate relation, as indices into
    /// `sets`. Singletons are omitted.
    ///
    /// Rows of the pair matrix are evaluated in parallel against a read-only
    /// view; edges are then merged into the union-find on one thread.
    pub fn group(&self, sets: &[&FingerprintSet]) -> Vec<Vec<usize>> {
        let n = sets.len();
        if n < 2 {
            return Vec::new();
        }

        let edges: Vec<(usize, usize)> = (0..n)
            .into_par_iter()
            .flat_map_iter(|i| {
                let source = sets[i];
                ((i + 1)..n)
                    .filter(move |&j| source.matches(sets[j], self.threshold))
                    .map(move |j| (i, j))
            })
            .collect();

        log::debug!("Matcher found {} near-duplicate edges among {} images", edges.len(), n);

        let mut dsu = DisjointSet::new(n);
        for (a, b) in edges {
            dsu.union(a, b);
        }
        dsu.components()
    }
}

impl Default for NearDuplicateMatcher {
    fn default() -> Self {
        Self::new(5)
    }
}
