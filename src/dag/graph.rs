//! # Task Graph
//!
//! Arena-backed dependency graph between migration tasks.
//!
//! ## Overview
//!
//! Tasks live in a dense `Vec` and are addressed by index internally; a
//! `HashMap` maps public [`TaskId`]s to indices. Each task keeps its incoming
//! (prerequisite) and outgoing (dependent) index lists, so both directions are
//! answered without scanning the edge set.
//!
//! An edge `from -> to` means `from` must complete before `to` starts. The
//! incoming edges of a task are its complete prerequisite set.
//!
//! ## Cycle Handling
//!
//! [`TaskGraph::add_edge`] refuses any edge that would close a cycle and leaves
//! the graph untouched. [`TaskGraph::load`] trusts persisted edges and skips
//! that check, so cycles in stored data are reported by
//! [`TaskGraph::resolve_order`] instead.
//!
//! ## Ordering
//!
//! Resolution is Kahn's algorithm with a min-heap of ready tasks, so among
//! tasks whose prerequisites are satisfied the smallest id always comes first.
//! The same input always yields the same order.

use super::store::{TaskDagFind, TaskDagStore};
use super::task::{Task, TaskId};
use crate::error::{Result, SchemaflowError};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from persisted tasks and edges.
    ///
    /// Unknown endpoints, self-edges and duplicate edges are rejected; cycles
    /// are not checked here and surface from [`TaskGraph::resolve_order`].
    pub fn load(
        tasks: impl IntoIterator<Item = Task>,
        edges: impl IntoIterator<Item = (TaskId, TaskId)>,
    ) -> Result<Self> {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(task)?;
        }
        for (from, to) in edges {
            let (from_idx, to_idx) = graph.edge_indices(from, to)?;
            graph.link(from_idx, to_idx);
        }
        Ok(graph)
    }

    /// Rebuild the graph for `tasks` from an edge store.
    ///
    /// Every prerequisite of a task in the set must also be in the set.
    pub async fn load_from_store(
        store: &dyn TaskDagStore,
        tasks: Vec<Task>,
    ) -> Result<Self> {
        let ids: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
        let mut edges = Vec::new();
        for task in &tasks {
            let rows = store
                .find_task_dag_list(&TaskDagFind {
                    to_task_id: task.id,
                })
                .await?;
            for row in rows {
                if !ids.contains(&row.from_task_id) {
                    return Err(SchemaflowError::Validation(format!(
                        "Task {} depends on task {} which is not part of the task set",
                        row.to_task_id, row.from_task_id
                    )));
                }
                edges.push((row.from_task_id, row.to_task_id));
            }
        }
        debug!(
            task_count = tasks.len(),
            edge_count = edges.len(),
            "Loaded task graph from store"
        );
        Self::load(tasks, edges)
    }

    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.index.contains_key(&task.id) {
            return Err(SchemaflowError::Validation(format!(
                "Task {} already exists",
                task.id
            )));
        }
        self.index.insert(task.id, self.tasks.len());
        self.tasks.push(task);
        self.incoming.push(Vec::new());
        self.outgoing.push(Vec::new());
        Ok(())
    }

    /// Add a dependency: `from` must complete before `to` starts
    pub fn add_edge(&mut self, from: TaskId, to: TaskId) -> Result<()> {
        let (from_idx, to_idx) = self.edge_indices(from, to)?;
        if let Some(path) = self.path_between(to_idx, from_idx) {
            // path runs to ..= from; the new edge closes it
            let mut cycle = Vec::with_capacity(path.len());
            cycle.push(from);
            cycle.extend(path[..path.len() - 1].iter().map(|&i| self.tasks[i].id));
            return Err(SchemaflowError::Cycle { tasks: cycle });
        }
        self.link(from_idx, to_idx);
        Ok(())
    }

    fn edge_indices(&self, from: TaskId, to: TaskId) -> Result<(usize, usize)> {
        let from_idx = self.index_of(from)?;
        let to_idx = self.index_of(to)?;
        if from_idx == to_idx {
            return Err(SchemaflowError::Validation(format!(
                "Task {from} cannot depend on itself"
            )));
        }
        if self.outgoing[from_idx].contains(&to_idx) {
            return Err(SchemaflowError::Validation(format!(
                "Edge {from} -> {to} already exists"
            )));
        }
        Ok((from_idx, to_idx))
    }

    fn link(&mut self, from_idx: usize, to_idx: usize) {
        self.outgoing[from_idx].push(to_idx);
        self.incoming[to_idx].push(from_idx);
    }

    fn index_of(&self, id: TaskId) -> Result<usize> {
        self.index
            .get(&id)
            .copied()
            .ok_or_else(|| SchemaflowError::Validation(format!("Unknown task {id}")))
    }

    /// Shortest path `start ..= goal` along outgoing edges
    fn path_between(&self, start: usize, goal: usize) -> Option<Vec<usize>> {
        let mut parent: HashMap<usize, usize> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut seen = HashSet::from([start]);

        while let Some(node) = queue.pop_front() {
            if node == goal {
                let mut path = vec![goal];
                let mut current = goal;
                while let Some(&prev) = parent.get(&current) {
                    path.push(prev);
                    current = prev;
                }
                path.reverse();
                return Some(path);
            }
            for &next in &self.outgoing[node] {
                if seen.insert(next) {
                    parent.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    /// Linear order of `ids` honouring every edge between them.
    ///
    /// Edges to tasks outside `ids` are ignored. Fails with a `Cycle` error,
    /// and no partial order, if the induced subgraph is cyclic.
    pub fn resolve_order(&self, ids: &[TaskId]) -> Result<Vec<TaskId>> {
        let mut members = HashSet::with_capacity(ids.len());
        for &id in ids {
            members.insert(self.index_of(id)?);
        }

        let mut in_degree: HashMap<usize, usize> = members
            .iter()
            .map(|&idx| {
                let degree = self.incoming[idx]
                    .iter()
                    .filter(|p| members.contains(*p))
                    .count();
                (idx, degree)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(TaskId, usize)>> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&idx, _)| Reverse((self.tasks[idx].id, idx)))
            .collect();

        let mut order = Vec::with_capacity(members.len());
        while let Some(Reverse((id, idx))) = ready.pop() {
            order.push(id);
            for &next in &self.outgoing[idx] {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((self.tasks[next].id, next)));
                    }
                }
            }
        }

        if order.len() < members.len() {
            let remaining: BTreeSet<usize> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(idx, _)| idx)
                .collect();
            return Err(SchemaflowError::Cycle {
                tasks: self.extract_cycle(&remaining),
            });
        }
        Ok(order)
    }

    /// Order every task in the graph
    pub fn resolve_all(&self) -> Result<Vec<TaskId>> {
        let ids: Vec<TaskId> = self.tasks.iter().map(|t| t.id).collect();
        self.resolve_order(&ids)
    }

    /// One concrete cycle among tasks left over by Kahn's algorithm.
    ///
    /// Every leftover task has a leftover prerequisite, so walking
    /// prerequisites backwards must revisit a task.
    fn extract_cycle(&self, remaining: &BTreeSet<usize>) -> Vec<TaskId> {
        let Some(&start) = remaining.iter().min_by_key(|&&i| self.tasks[i].id) else {
            return Vec::new();
        };
        let mut walk = vec![start];
        let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        loop {
            let Some(prev) = self.incoming[current]
                .iter()
                .copied()
                .filter(|p| remaining.contains(p))
                .min_by_key(|&p| self.tasks[p].id)
            else {
                break;
            };
            if let Some(&at) = position.get(&prev) {
                let mut cycle: Vec<TaskId> =
                    walk[at..].iter().rev().map(|&i| self.tasks[i].id).collect();
                if let Some(min_pos) = cycle
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, id)| **id)
                    .map(|(pos, _)| pos)
                {
                    cycle.rotate_left(min_pos);
                }
                return cycle;
            }
            position.insert(prev, walk.len());
            walk.push(prev);
            current = prev;
        }
        remaining.iter().map(|&i| self.tasks[i].id).collect()
    }

    /// Direct prerequisites of `id`
    pub fn prerequisites_of(&self, id: TaskId) -> Result<BTreeSet<TaskId>> {
        let idx = self.index_of(id)?;
        Ok(self.incoming[idx].iter().map(|&i| self.tasks[i].id).collect())
    }

    /// Direct dependents of `id`
    pub fn dependents_of(&self, id: TaskId) -> Result<BTreeSet<TaskId>> {
        let idx = self.index_of(id)?;
        Ok(self.outgoing[idx].iter().map(|&i| self.tasks[i].id).collect())
    }

    /// Every task reachable from `id` along dependency edges
    pub fn transitive_dependents_of(&self, id: TaskId) -> Result<BTreeSet<TaskId>> {
        let idx = self.index_of(id)?;
        let mut seen = HashSet::new();
        let mut stack = self.outgoing[idx].clone();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.outgoing[next].iter().copied());
            }
        }
        Ok(seen.into_iter().map(|i| self.tasks[i].id).collect())
    }

    /// Weakly connected components, each sorted, ordered by smallest id.
    ///
    /// Tasks in different groups share no dependency and may run concurrently.
    pub fn independent_groups(&self) -> Vec<Vec<TaskId>> {
        let mut visited = vec![false; self.tasks.len()];
        let mut groups = Vec::new();

        for start in 0..self.tasks.len() {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let mut group = Vec::new();
            let mut stack = vec![start];
            while let Some(node) = stack.pop() {
                group.push(self.tasks[node].id);
                for &next in self.incoming[node].iter().chain(&self.outgoing[node]) {
                    if !visited[next] {
                        visited[next] = true;
                        stack.push(next);
                    }
                }
            }
            group.sort();
            groups.push(group);
        }

        groups.sort_by_key(|g| g.first().copied());
        groups
    }

    /// Tasks without prerequisites
    pub fn roots(&self) -> Vec<TaskId> {
        let mut roots: Vec<TaskId> = self
            .incoming
            .iter()
            .enumerate()
            .filter(|(_, preds)| preds.is_empty())
            .map(|(i, _)| self.tasks[i].id)
            .collect();
        roots.sort();
        roots
    }

    /// Tasks nothing depends on
    pub fn leaves(&self) -> Vec<TaskId> {
        let mut leaves: Vec<TaskId> = self
            .outgoing
            .iter()
            .enumerate()
            .filter(|(_, succs)| succs.is_empty())
            .map(|(i, _)| self.tasks[i].id)
            .collect();
        leaves.sort();
        leaves
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.index.get(&id).map(|&i| &self.tasks[i])
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    /// All edges as `(from, to)` pairs, grouped by source in insertion order
    pub fn edges(&self) -> impl Iterator<Item = (TaskId, TaskId)> + '_ {
        self.outgoing.iter().enumerate().flat_map(move |(from, succs)| {
            succs
                .iter()
                .map(move |&to| (self.tasks[from].id, self.tasks[to].id))
        })
    }

    pub fn edge_count(&self) -> usize {
        self.outgoing.iter().map(Vec::len).sum()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
