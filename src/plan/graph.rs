//! Task dependency graph for a plan.
//!
//! Edges run from a dependency to the task that needs it. Nodes are added in
//! input order, so node indices double as input positions and every listing
//! below comes out in input order.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

use super::spec::PlannedTask;

/// Result of the layered topological sort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layering {
    /// Groups of mutually independent tasks, earliest first.
    pub layers: Vec<Vec<String>>,
    /// Tasks that could never become ready (they sit on or behind a cycle).
    pub unscheduled: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

pub struct PlanGraph<'a> {
    graph: DiGraph<&'a PlannedTask, ()>,
    index: HashMap<&'a str, NodeIndex>,
    duplicates: Vec<&'a str>,
    self_dependencies: Vec<&'a str>,
    unknown_dependencies: Vec<(&'a str, &'a str)>,
}

impl<'a> PlanGraph<'a> {
    /// Build the graph. For duplicate ids the first occurrence wins; the
    /// repeats are recorded and left out of the graph.
    pub fn build(tasks: &'a [PlannedTask]) -> Self {
        let mut graph = DiGraph::new();
        let mut index: HashMap<&'a str, NodeIndex> = HashMap::new();
        let mut duplicates = Vec::new();

        for task in tasks {
            if index.contains_key(task.id.as_str()) {
                if !duplicates.contains(&task.id.as_str()) {
                    duplicates.push(task.id.as_str());
                }
                continue;
            }
            let node = graph.add_node(task);
            index.insert(task.id.as_str(), node);
        }

        let mut self_dependencies = Vec::new();
        let mut unknown_dependencies = Vec::new();
        let nodes: Vec<NodeIndex> = graph.node_indices().collect();
        for node in nodes {
            let task: &'a PlannedTask = graph[node];
            for dep in &task.depends_on {
                if *dep == task.id {
                    if !self_dependencies.contains(&task.id.as_str()) {
                        self_dependencies.push(task.id.as_str());
                    }
                    continue;
                }
                match index.get(dep.as_str()) {
                    Some(&dep_node) => {
                        graph.update_edge(dep_node, node, ());
                    }
                    None => unknown_dependencies.push((task.id.as_str(), dep.as_str())),
                }
            }
        }

        Self {
            graph,
            index,
            duplicates,
            self_dependencies,
            unknown_dependencies,
        }
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn task(&self, id: &str) -> Option<&'a PlannedTask> {
        self.index.get(id).map(|&n| self.graph[n])
    }

    /// Unique tasks in input order.
    pub fn tasks(&self) -> impl Iterator<Item = &'a PlannedTask> + '_ {
        self.graph.node_indices().map(|n| self.graph[n])
    }

    pub fn duplicates(&self) -> &[&'a str] {
        &self.duplicates
    }

    pub fn self_dependencies(&self) -> &[&'a str] {
        &self.self_dependencies
    }

    /// `(task, missing dependency)` pairs.
    pub fn unknown_dependencies(&self) -> &[(&'a str, &'a str)] {
        &self.unknown_dependencies
    }

    /// Ids of the tasks `id` depends on that exist in the plan.
    pub fn dependencies(&self, id: &str) -> Vec<&'a str> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Ids of the tasks that depend on `id`.
    pub fn dependents(&self, id: &str) -> Vec<&'a str> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<&'a str> {
        match self.index.get(id) {
            Some(&node) => self
                .sorted_neighbors(node, direction)
                .into_iter()
                .map(|n| self.graph[n].id.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    fn sorted_neighbors(&self, node: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.graph.neighbors_directed(node, direction).collect();
        out.sort();
        out
    }

    /// Every cycle found by a white/gray/black depth-first search. Each
    /// cycle lists its members in dependency order starting from the task
    /// where the back edge lands.
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        let mut color = vec![Color::White; self.graph.node_count()];
        // position on the current DFS path, for gray nodes
        let mut depth = vec![0usize; self.graph.node_count()];
        let mut path: Vec<NodeIndex> = Vec::new();
        let mut cycles = Vec::new();

        for start in self.graph.node_indices() {
            if color[start.index()] != Color::White {
                continue;
            }
            // explicit stack: (node, outgoing neighbours, next neighbour)
            let mut stack = vec![(start, self.sorted_neighbors(start, Direction::Outgoing), 0)];
            color[start.index()] = Color::Gray;
            path.push(start);

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                let next = frame.1.get(frame.2).copied();
                frame.2 += 1;
                let Some(next) = next else {
                    color[node.index()] = Color::Black;
                    path.pop();
                    stack.pop();
                    continue;
                };
                match color[next.index()] {
                    Color::White => {
                        color[next.index()] = Color::Gray;
                        depth[next.index()] = path.len();
                        path.push(next);
                        stack.push((next, self.sorted_neighbors(next, Direction::Outgoing), 0));
                    }
                    Color::Gray => cycles.push(
                        path[depth[next.index()]..]
                            .iter()
                            .map(|&n| self.graph[n].id.clone())
                            .collect(),
                    ),
                    Color::Black => {}
                }
            }
        }
        cycles
    }

    pub fn has_cycle(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// Layered topological sort. Each round takes every remaining task whose
    /// dependencies are all scheduled; members keep input order. When a
    /// round makes no progress the rest is returned as `unscheduled`.
    pub fn execution_layers(&self) -> Layering {
        let mut scheduled = vec![false; self.graph.node_count()];
        let mut remaining: Vec<NodeIndex> = self.graph.node_indices().collect();
        let mut layers = Vec::new();

        while !remaining.is_empty() {
            let ready: Vec<NodeIndex> = remaining
                .iter()
                .copied()
                .filter(|&n| {
                    self.graph
                        .neighbors_directed(n, Direction::Incoming)
                        .all(|dep| scheduled[dep.index()])
                })
                .collect();
            if ready.is_empty() {
                break;
            }
            for n in &ready {
                scheduled[n.index()] = true;
            }
            remaining.retain(|n| !scheduled[n.index()]);
            layers.push(ready.iter().map(|&n| self.graph[n].id.clone()).collect());
        }

        Layering {
            layers,
            unscheduled: remaining
                .iter()
                .map(|&n| self.graph[n].id.clone())
                .collect(),
        }
    }

    /// Layer index of every scheduled task.
    pub fn layer_of(layering: &Layering) -> HashMap<&str, usize> {
        let mut out = HashMap::new();
        for (i, layer) in layering.layers.iter().enumerate() {
            for id in layer {
                out.insert(id.as_str(), i);
            }
        }
        out
    }

    /// Ids reachable from `id` along dependency edges (its transitive prerequisites).
    pub fn prerequisites(&self, id: &str) -> HashSet<&'a str> {
        let mut seen = HashSet::new();
        let mut stack = self.dependencies(id);
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.dependencies(next));
            }
        }
        seen
    }
}
