use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use crate::error::{Error, Result};

/// Generic directed acyclic graph.
///
/// * `K` node key
/// * `V` node payload
/// * `E` edge payload
///
/// Node insertion order is remembered and is the tie break whenever several nodes become
/// available at the same time (begin nodes, topological order). Edges that would close a cycle
/// are refused, so a `Dag` built only through [`Dag::add_edge`] never contains one.
#[derive(Debug, Clone)]
pub struct Dag<K, V, E> {
    nodes: HashMap<K, V>,

    /// Keys in the order they were first added.
    order: Vec<K>,

    /// Position of every key in `order`.
    position: HashMap<K, usize>,

    /// source -> target -> edge payload
    edges: HashMap<K, HashMap<K, E>>,

    /// target -> sources
    reverse_edges: HashMap<K, HashSet<K>>,
}

impl<K, V, E> Default for Dag<K, V, E>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> Dag<K, V, E>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Dag { nodes: HashMap::new(), order: Vec::new(), position: HashMap::new(), edges: HashMap::new(), reverse_edges: HashMap::new() }
    }

    /// Adds a node, overwriting the payload if the key already exists. An overwritten node keeps
    /// its original insertion position.
    pub fn add_node(&mut self, key: K, value: V) {
        if !self.position.contains_key(&key) {
            self.position.insert(key.clone(), self.order.len());
            self.order.push(key.clone());
        }
        self.nodes.insert(key, value);
    }

    /// Adds the edge `from -> to`.
    ///
    /// Returns `false` without touching the graph if
    /// * `from == to`,
    /// * an endpoint is missing and `create_node` is `false`,
    /// * the edge would close a cycle.
    ///
    /// Missing endpoints are created with `V::default()` when `create_node` is `true`.
    pub fn add_edge(&mut self, from: K, to: K, payload: E, create_node: bool) -> bool
    where
        V: Default,
    {
        if !self.is_legal_add_edge(&from, &to, create_node) {
            log::debug!("Refused edge: self loop, unknown endpoint or cycle.");
            return false;
        }

        if !self.contains_node(&from) {
            self.add_node(from.clone(), V::default());
        }
        if !self.contains_node(&to) {
            self.add_node(to.clone(), V::default());
        }

        self.insert_edge(from, to, payload);
        true
    }

    /// Stores an edge without any validation. Both endpoints must already exist.
    pub(crate) fn insert_edge(&mut self, from: K, to: K, payload: E) {
        self.edges.entry(from.clone()).or_default().insert(to.clone(), payload);
        self.reverse_edges.entry(to).or_default().insert(from);
    }

    fn is_legal_add_edge(&self, from: &K, to: &K, create_node: bool) -> bool {
        if from == to {
            return false;
        }

        if !create_node && (!self.contains_node(from) || !self.contains_node(to)) {
            return false;
        }

        // The edge closes a cycle iff `from` is already reachable from `to`.
        let mut visited: HashSet<&K> = HashSet::new();
        let mut queue: VecDeque<&K> = VecDeque::new();
        queue.push_back(to);
        visited.insert(to);

        while let Some(current) = queue.pop_front() {
            if current == from {
                return false;
            }
            if let Some(successors) = self.edges.get(current) {
                for next in successors.keys() {
                    if visited.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }

        true
    }

    pub fn contains_node(&self, key: &K) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn contains_edge(&self, from: &K, to: &K) -> bool {
        self.edges.get(from).is_some_and(|targets| targets.contains_key(to))
    }

    pub fn node(&self, key: &K) -> Option<&V> {
        self.nodes.get(key)
    }

    pub fn edge(&self, from: &K, to: &K) -> Option<&E> {
        self.edges.get(from).and_then(|targets| targets.get(to))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(HashMap::len).sum()
    }

    /// Node keys in insertion order.
    pub fn keys(&self) -> &[K] {
        &self.order
    }

    pub fn indegree(&self, key: &K) -> usize {
        self.reverse_edges.get(key).map_or(0, HashSet::len)
    }

    pub fn outdegree(&self, key: &K) -> usize {
        self.edges.get(key).map_or(0, HashMap::len)
    }

    /// Nodes without predecessors, in insertion order.
    pub fn begin_nodes(&self) -> Vec<K> {
        self.order.iter().filter(|key| self.indegree(key) == 0).cloned().collect()
    }

    /// Nodes without successors, in insertion order.
    pub fn end_nodes(&self) -> Vec<K> {
        self.order.iter().filter(|key| self.outdegree(key) == 0).cloned().collect()
    }

    /// Direct successors of `key`, in insertion order.
    pub fn subsequent_nodes(&self, key: &K) -> Vec<K> {
        match self.edges.get(key) {
            Some(targets) => self.in_insertion_order(targets.keys()),
            None => Vec::new(),
        }
    }

    /// Direct predecessors of `key`, in insertion order.
    pub fn previous_nodes(&self, key: &K) -> Vec<K> {
        match self.reverse_edges.get(key) {
            Some(sources) => self.in_insertion_order(sources.iter()),
            None => Vec::new(),
        }
    }

    fn in_insertion_order<'a>(&self, keys: impl Iterator<Item = &'a K>) -> Vec<K>
    where
        K: 'a,
    {
        let mut keys: Vec<&K> = keys.collect();
        keys.sort_by_key(|key| self.position.get(*key).copied().unwrap_or(usize::MAX));
        keys.into_iter().cloned().collect()
    }

    /// Kahn's algorithm, level by level: every round consumes all nodes whose indegree is
    /// currently zero (in insertion order) and only then decrements their successors.
    ///
    /// Returns the consumed nodes. Fewer than `node_count()` means the graph has a cycle.
    fn consume_zero_indegree_levels(&self) -> Vec<K> {
        let mut indegree: HashMap<&K, usize> = self.order.iter().map(|key| (key, self.indegree(key))).collect();
        let mut removed: HashSet<&K> = HashSet::with_capacity(self.order.len());
        let mut result: Vec<K> = Vec::with_capacity(self.order.len());

        loop {
            let ready: Vec<&K> = self.order.iter().filter(|key| !removed.contains(key) && indegree.get(key) == Some(&0)).collect();

            if ready.is_empty() {
                break;
            }

            for key in ready {
                removed.insert(key);
                result.push(key.clone());

                if let Some(successors) = self.edges.get(key) {
                    for successor in successors.keys() {
                        if let Some(degree) = indegree.get_mut(successor) {
                            *degree = degree.saturating_sub(1);
                        }
                    }
                }
            }
        }

        result
    }

    pub fn has_cycle(&self) -> bool {
        self.consume_zero_indegree_levels().len() < self.nodes.len()
    }

    /// Topological order of all nodes.
    ///
    /// # Errors
    /// `Error::GraphHasCycle` when some nodes can never reach indegree zero.
    pub fn topological_sort(&self) -> Result<Vec<K>> {
        let sorted = self.consume_zero_indegree_levels();

        if sorted.len() != self.nodes.len() {
            return Err(Error::GraphHasCycle);
        }

        Ok(sorted)
    }
}
