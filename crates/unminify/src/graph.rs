//! Call-graph construction and topological depth.
//!
//! Edges are name-based, not binding-based: minified code shadows heavily
//! and the oracle reasons at the lexical-name level, so two functions are
//! linked whenever one names the other in call position. The graph may
//! contain cycles; depth computation cuts back-edges so a valid
//! leaves-first order always exists.

use ahash::{AHashMap, AHashSet};
use indexmap::IndexMap;

use crate::parse::FunctionInfo;

/// The function inventory plus derived call edges and depth map.
#[derive(Debug)]
pub struct CallGraph {
    /// All functions keyed by stable ID, in extraction (span) order.
    functions: IndexMap<String, FunctionInfo>,
    /// Original name to function ID. One entry per non-empty name;
    /// first declaration by span order wins on collision.
    by_name: AHashMap<String, String>,
    /// Inverse edges: for each function, the IDs of functions that call it.
    callers: AHashMap<String, Vec<String>>,
    /// Topological depth; leaves are 0, cycles contribute 0 through
    /// back-edges.
    depths: AHashMap<String, usize>,
}

impl CallGraph {
    /// Builds the graph from the extractor's inventory.
    #[must_use]
    pub fn build(records: Vec<FunctionInfo>) -> Self {
        let mut functions: IndexMap<String, FunctionInfo> = IndexMap::with_capacity(records.len());
        let mut by_name: AHashMap<String, String> = AHashMap::new();
        for record in records {
            if !record.original_name.is_empty() {
                by_name
                    .entry(record.original_name.clone())
                    .or_insert_with(|| record.id.clone());
            }
            functions.insert(record.id.clone(), record);
        }

        let mut callers: AHashMap<String, Vec<String>> = AHashMap::new();
        for (id, record) in &functions {
            for callee_name in &record.callees {
                if let Some(callee_id) = by_name.get(callee_name) {
                    if callee_id != id {
                        callers.entry(callee_id.clone()).or_default().push(id.clone());
                    }
                }
            }
        }

        let mut graph = Self {
            functions,
            by_name,
            callers,
            depths: AHashMap::new(),
        };
        graph.compute_depths();
        graph
    }

    fn compute_depths(&mut self) {
        let ids: Vec<String> = self.functions.keys().cloned().collect();
        let mut depths: AHashMap<String, usize> = AHashMap::with_capacity(ids.len());
        let mut on_stack: AHashSet<String> = AHashSet::new();
        for id in &ids {
            self.depth_of(id, &mut depths, &mut on_stack);
        }
        self.depths = depths;
    }

    /// Memoized DFS. A callee currently on the DFS stack is a back-edge and
    /// contributes 0, which breaks cycles without failing the ordering.
    fn depth_of(
        &self,
        id: &str,
        depths: &mut AHashMap<String, usize>,
        on_stack: &mut AHashSet<String>,
    ) -> usize {
        if let Some(d) = depths.get(id) {
            return *d;
        }
        if !on_stack.insert(id.to_owned()) {
            return 0;
        }
        let mut depth = 0;
        if let Some(record) = self.functions.get(id) {
            for callee_name in &record.callees {
                if let Some(callee_id) = self.by_name.get(callee_name) {
                    if callee_id != id && !on_stack.contains(callee_id) {
                        depth = depth.max(1 + self.depth_of(callee_id, depths, on_stack));
                    }
                }
            }
        }
        on_stack.remove(id);
        depths.insert(id.to_owned(), depth);
        depth
    }

    /// All functions in extraction order.
    pub fn functions(&self) -> impl Iterator<Item = &FunctionInfo> {
        self.functions.values()
    }

    /// Number of functions in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the graph contains no functions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Looks up a function by ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&FunctionInfo> {
        self.functions.get(id)
    }

    /// Resolves an original name to the function that first declared it.
    #[must_use]
    pub fn resolve_name(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(String::as_str)
    }

    /// IDs of the functions that call `id` by name.
    #[must_use]
    pub fn callers_of(&self, id: &str) -> &[String] {
        self.callers.get(id).map_or(&[], Vec::as_slice)
    }

    /// Topological depth of a function; 0 for leaves and unknown IDs.
    #[must_use]
    pub fn depth(&self, id: &str) -> usize {
        self.depths.get(id).copied().unwrap_or(0)
    }
}
