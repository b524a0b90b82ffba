//! Reverse Cuthill–McKee reordering of the ODE variables for banded Jacobians.

use std::collections::{BTreeSet, VecDeque};

/// Result of a bandwidth-reducing reordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandReordering {
    /// `order[new] = old`.
    pub order: Vec<usize>,
    /// `new_index[old] = new`.
    pub new_index: Vec<usize>,
    pub lower: usize,
    pub upper: usize,
}

/// Half-bandwidths of a sparsity pattern given as `(row, col)` entries.
pub fn half_bandwidths(entries: &[(usize, usize)], new_index: &[usize]) -> (usize, usize) {
    entries.iter().fold((0, 0), |(lower, upper), &(row, col)| {
        let (r, c) = (new_index[row], new_index[col]);
        if r > c {
            (lower.max(r - c), upper)
        } else {
            (lower, upper.max(c - r))
        }
    })
}

fn symmetric_graph(n: usize, entries: &[(usize, usize)]) -> Vec<Vec<usize>> {
    let mut sets = vec![BTreeSet::new(); n];
    for &(row, col) in entries {
        if row != col && row < n && col < n {
            sets[row].insert(col);
            sets[col].insert(row);
        }
    }
    sets.into_iter().map(|s| s.into_iter().collect()).collect()
}

/// Breadth-first level structure from `root`, restricted to unvisited nodes.
fn level_structure(graph: &[Vec<usize>], root: usize, visited: &[bool]) -> Vec<Vec<usize>> {
    let mut seen = visited.to_vec();
    seen[root] = true;
    let mut levels = vec![vec![root]];
    loop {
        let mut next = Vec::new();
        for &node in levels.last().into_iter().flatten() {
            for &neighbor in &graph[node] {
                if !seen[neighbor] {
                    seen[neighbor] = true;
                    next.push(neighbor);
                }
            }
        }
        if next.is_empty() {
            return levels;
        }
        levels.push(next);
    }
}

/// George–Liu search for a node of (near) maximal eccentricity.
fn pseudo_peripheral_node(graph: &[Vec<usize>], start: usize, visited: &[bool]) -> usize {
    let mut root = start;
    let mut levels = level_structure(graph, root, visited);
    loop {
        let Some(candidate) = levels
            .last()
            .and_then(|last| last.iter().copied().min_by_key(|&v| graph[v].len()))
        else {
            return root;
        };
        let candidate_levels = level_structure(graph, candidate, visited);
        if candidate_levels.len() <= levels.len() {
            return root;
        }
        root = candidate;
        levels = candidate_levels;
    }
}

/// Computes the Reverse Cuthill–McKee order of an `n`-variable system whose Jacobian
/// has the given nonzero `(row, col)` entries.
pub fn reverse_cuthill_mckee(n: usize, entries: &[(usize, usize)]) -> BandReordering {
    let graph = symmetric_graph(n, entries);
    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);

    while order.len() < n {
        let Some(start) = (0..n)
            .filter(|&v| !visited[v])
            .min_by_key(|&v| graph[v].len())
        else {
            break;
        };
        let root = pseudo_peripheral_node(&graph, start, &visited);

        let mut queue = VecDeque::from([root]);
        visited[root] = true;
        while let Some(node) = queue.pop_front() {
            order.push(node);
            let mut neighbors: Vec<usize> = graph[node]
                .iter()
                .copied()
                .filter(|&v| !visited[v])
                .collect();
            neighbors.sort_by_key(|&v| (graph[v].len(), v));
            for neighbor in neighbors {
                visited[neighbor] = true;
                queue.push_back(neighbor);
            }
        }
    }
    order.reverse();

    let mut new_index = vec![0; n];
    for (new, &old) in order.iter().enumerate() {
        new_index[old] = new;
    }
    let (lower, upper) = half_bandwidths(entries, &new_index);
    BandReordering {
        order,
        new_index,
        lower,
        upper,
    }
}
