// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Dependency graph analysis for job plans.
//!
//! Diagnostic only: the scheduler never consults this module. Cycles and
//! dangling dependencies are reported here so a plan can be checked before
//! it is enqueued.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

use serde::Serialize;

use crate::types::{DecomposedJob, Job};

#[derive(Debug, Clone)]
struct Node {
    id: String,
    depends_on: Vec<String>,
}

/// Immutable view of the `depends_on` edges of a set of jobs.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

/// Jobs grouped into waves that could run concurrently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionOrder {
    /// Each wave only depends on jobs in earlier waves.
    pub waves: Vec<Vec<String>>,
    /// Jobs that can never become ready: part of a cycle, depending on an
    /// unknown job, or downstream of either.
    pub unresolved: Vec<String>,
}

impl ExecutionOrder {
    /// Plain-text rendering, one wave per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, wave) in self.waves.iter().enumerate() {
            let _ = writeln!(out, "wave {}: {}", i + 1, wave.join(", "));
        }
        if !self.unresolved.is_empty() {
            let _ = writeln!(out, "unresolved: {}", self.unresolved.join(", "));
        }
        out
    }
}

/// Shape of a dependency graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub jobs: usize,
    pub edges: usize,
    /// Jobs with no dependencies.
    pub roots: usize,
    /// Number of execution waves.
    pub max_depth: usize,
}

impl DependencyGraph {
    /// Build a graph from scheduled jobs.
    pub fn from_jobs(jobs: &[Job]) -> Self {
        Self::build(jobs.iter().map(|j| (&j.id, &j.depends_on)))
    }

    /// Build a graph from decomposition records.
    pub fn from_decomposed(jobs: &[DecomposedJob]) -> Self {
        Self::build(jobs.iter().map(|j| (&j.id, &j.depends_on)))
    }

    fn build<'a>(edges: impl Iterator<Item = (&'a String, &'a Vec<String>)>) -> Self {
        let mut graph = Self::default();
        for (id, depends_on) in edges {
            // Later duplicates win, matching enqueue semantics.
            if let Some(&i) = graph.index.get(id) {
                graph.nodes[i].depends_on = depends_on.clone();
                continue;
            }
            graph.index.insert(id.clone(), graph.nodes.len());
            graph.nodes.push(Node {
                id: id.clone(),
                depends_on: depends_on.clone(),
            });
        }
        graph
    }

    /// Number of jobs in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether the graph contains a job.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Edges pointing at jobs that are not in the graph, as `(job, dependency)`.
    pub fn missing_dependencies(&self) -> Vec<(String, String)> {
        self.nodes
            .iter()
            .flat_map(|n| {
                n.depends_on
                    .iter()
                    .filter(|d| !self.index.contains_key(d.as_str()))
                    .map(|d| (n.id.clone(), d.clone()))
            })
            .collect()
    }

    /// Group jobs into waves, preserving input order within each wave.
    pub fn execution_order(&self) -> ExecutionOrder {
        let mut placed: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<&Node> = self.nodes.iter().collect();
        let mut waves = Vec::new();

        loop {
            let (wave, rest): (Vec<&Node>, Vec<&Node>) = remaining
                .into_iter()
                .partition(|n| n.depends_on.iter().all(|d| placed.contains(d.as_str())));
            remaining = rest;

            if wave.is_empty() {
                break;
            }
            placed.extend(wave.iter().map(|n| n.id.as_str()));
            waves.push(wave.into_iter().map(|n| n.id.clone()).collect());
        }

        ExecutionOrder {
            waves,
            unresolved: remaining.into_iter().map(|n| n.id.clone()).collect(),
        }
    }

    /// Find dependency cycles.
    ///
    /// Each cycle is listed from the first job reached in input order,
    /// following `depends_on` edges.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut cycles = Vec::new();
        // Depth-first with an explicit stack of (node, next dependency index)
        // so long chains cannot exhaust the call stack.
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for root in 0..self.nodes.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            marks[root] = Mark::InProgress;
            stack.push((root, 0));

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                let Some(dep) = self.nodes[node].depends_on.get(frame.1) else {
                    marks[node] = Mark::Done;
                    stack.pop();
                    continue;
                };
                frame.1 += 1;

                let Some(&next) = self.index.get(dep) else {
                    continue;
                };
                match marks[next] {
                    Mark::Unvisited => {
                        marks[next] = Mark::InProgress;
                        stack.push((next, 0));
                    }
                    Mark::InProgress => {
                        if let Some(start) = stack.iter().position(|&(p, _)| p == next) {
                            cycles.push(
                                stack[start..]
                                    .iter()
                                    .map(|&(i, _)| self.nodes[i].id.clone())
                                    .collect(),
                            );
                        }
                    }
                    Mark::Done => {}
                }
            }
        }
        cycles
    }

    /// Every job that transitively depends on `id`, in input order.
    ///
    /// These are the jobs a failure of `id` leaves stranded in `pending`.
    pub fn blocked_by(&self, id: &str) -> Vec<String> {
        let mut dependents: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in &node.depends_on {
                dependents.entry(dep.as_str()).or_default().push(i);
            }
        }

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for &i in dependents.get(current).into_iter().flatten() {
                if seen.insert(i) {
                    queue.push_back(self.nodes[i].id.as_str());
                }
            }
        }

        let mut blocked: Vec<usize> = seen.into_iter().filter(|&i| self.nodes[i].id != id).collect();
        blocked.sort_unstable();
        blocked.into_iter().map(|i| self.nodes[i].id.clone()).collect()
    }

    /// Size and depth of the graph.
    pub fn stats(&self) -> GraphStats {
        GraphStats {
            jobs: self.nodes.len(),
            edges: self.nodes.iter().map(|n| n.depends_on.len()).sum(),
            roots: self.nodes.iter().filter(|n| n.depends_on.is_empty()).count(),
            max_depth: self.execution_order().waves.len(),
        }
    }
}
