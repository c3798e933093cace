//! Extension description registry.
//!
//! The registry is a copy-on-write table: every delta builds the next
//! snapshot aside and swaps it in under the write lock, so concurrent readers
//! observe either the previous or the next table, never a partial one.
//! Callers that need read-then-write consistency hold the orchestrator lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::description::{
    ExtensionDescription, ExtensionIdentifier, ON_STARTUP_FINISHED, WILDCARD_ACTIVATION_EVENT,
};

/// Result of a registry delta.
#[derive(Debug, Clone, Default)]
pub struct DeltaResult {
    /// Extensions forcibly removed because they sit on a dependency cycle.
    pub removed_due_to_looping: Vec<Arc<ExtensionDescription>>,
    /// Additions skipped because their id or UUID was already registered.
    pub skipped_duplicates: Vec<ExtensionIdentifier>,
}

#[derive(Debug, Default)]
struct RegistrySnapshot {
    version: u64,
    descriptions: Vec<Arc<ExtensionDescription>>,
    by_key: HashMap<String, usize>,
    activation_map: HashMap<String, Vec<ExtensionIdentifier>>,
}

impl RegistrySnapshot {
    fn build(version: u64, descriptions: Vec<Arc<ExtensionDescription>>) -> Self {
        let mut by_key = HashMap::with_capacity(descriptions.len());
        let mut activation_map: HashMap<String, Vec<ExtensionIdentifier>> = HashMap::new();
        for (idx, desc) in descriptions.iter().enumerate() {
            by_key.insert(desc.identifier.key().to_string(), idx);
            for event in desc.effective_activation_events() {
                activation_map
                    .entry(event)
                    .or_default()
                    .push(desc.identifier.clone());
            }
        }
        Self {
            version,
            descriptions,
            by_key,
            activation_map,
        }
    }
}

/// Registry of the extension descriptions known to the orchestrator.
pub struct ExtensionDescriptionRegistry {
    state: RwLock<Arc<RegistrySnapshot>>,
}

impl ExtensionDescriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.state.read().clone()
    }

    /// Monotonic version, bumped by every delta.
    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// Apply removals, then additions, then drop every extension on a
    /// dependency cycle.
    ///
    /// Missing removal targets and duplicate additions are skipped one by
    /// one; the rest of the batch is always committed.
    pub fn delta_extensions(
        &self,
        to_add: Vec<Arc<ExtensionDescription>>,
        to_remove: &[ExtensionIdentifier],
    ) -> DeltaResult {
        let mut state = self.state.write();
        let current = state.clone();

        let remove_keys: HashSet<&str> = to_remove.iter().map(|id| id.key()).collect();
        for id in to_remove {
            if !current.by_key.contains_key(id.key()) {
                debug!(extension_id = %id, "Ignoring removal of unregistered extension");
            }
        }

        let mut next: Vec<Arc<ExtensionDescription>> = current
            .descriptions
            .iter()
            .filter(|desc| !remove_keys.contains(desc.identifier.key()))
            .cloned()
            .collect();

        let mut keys: HashSet<String> = next
            .iter()
            .map(|desc| desc.identifier.key().to_string())
            .collect();
        let mut uuids: HashSet<uuid::Uuid> = next.iter().filter_map(|desc| desc.uuid).collect();

        let mut result = DeltaResult::default();
        for desc in to_add {
            if keys.contains(desc.identifier.key()) {
                warn!(extension_id = %desc.identifier, "Extension already registered, skipping");
                result.skipped_duplicates.push(desc.identifier.clone());
                continue;
            }
            if let Some(uuid) = desc.uuid {
                if !uuids.insert(uuid) {
                    warn!(extension_id = %desc.identifier, %uuid, "Extension UUID already registered, skipping");
                    result.skipped_duplicates.push(desc.identifier.clone());
                    continue;
                }
            }
            keys.insert(desc.identifier.key().to_string());
            next.push(desc);
        }

        let looping = find_looping_extensions(&next);
        if !looping.is_empty() {
            let (dropped, kept): (Vec<_>, Vec<_>) = next
                .into_iter()
                .partition(|desc| looping.contains(desc.identifier.key()));
            next = kept;
            result.removed_due_to_looping = dropped;
        }

        *state = Arc::new(RegistrySnapshot::build(current.version + 1, next));
        result
    }

    pub fn get_extension_description(
        &self,
        id: &ExtensionIdentifier,
    ) -> Option<Arc<ExtensionDescription>> {
        let snapshot = self.snapshot();
        snapshot
            .by_key
            .get(id.key())
            .map(|idx| snapshot.descriptions[*idx].clone())
    }

    /// All descriptions in insertion order.
    pub fn get_all_extension_descriptions(&self) -> Vec<Arc<ExtensionDescription>> {
        self.snapshot().descriptions.clone()
    }

    pub fn contains_extension(&self, id: &ExtensionIdentifier) -> bool {
        self.snapshot().by_key.contains_key(id.key())
    }

    /// Whether any registered extension is interested in `event`.
    ///
    /// An exact declaration matches, a `*` declaration matches every event,
    /// and `onStartupFinished` matches as soon as anything is registered.
    pub fn contains_activation_event(&self, event: &str) -> bool {
        let snapshot = self.snapshot();
        snapshot.activation_map.contains_key(event)
            || snapshot.activation_map.contains_key(WILDCARD_ACTIVATION_EVENT)
            || (event == ON_STARTUP_FINISHED && !snapshot.descriptions.is_empty())
    }

    pub fn len(&self) -> usize {
        self.snapshot().descriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ExtensionDescriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Keys of every extension that belongs to a dependency cycle.
///
/// Only edges to registered extensions count; a dependency on something that
/// is not installed is not a loop.
fn find_looping_extensions(descriptions: &[Arc<ExtensionDescription>]) -> HashSet<String> {
    let index_of: HashMap<&str, usize> = descriptions
        .iter()
        .enumerate()
        .map(|(idx, desc)| (desc.identifier.key(), idx))
        .collect();

    let edges: Vec<Vec<usize>> = descriptions
        .iter()
        .map(|desc| {
            desc.extension_dependencies
                .iter()
                .filter_map(|dep| index_of.get(dep.key()).copied())
                .collect()
        })
        .collect();

    let mut scc = StronglyConnected::new(&edges);
    for node in 0..descriptions.len() {
        if scc.index[node].is_none() {
            scc.visit(node);
        }
    }

    let mut looping = HashSet::new();
    for component in scc.components {
        let is_cycle = component.len() > 1 || edges[component[0]].contains(&component[0]);
        if is_cycle {
            for node in component {
                looping.insert(descriptions[node].identifier.key().to_string());
            }
        }
    }
    looping
}

/// Tarjan's strongly connected components over the dependency graph.
struct StronglyConnected<'a> {
    edges: &'a [Vec<usize>],
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    next_index: usize,
    components: Vec<Vec<usize>>,
}

impl<'a> StronglyConnected<'a> {
    fn new(edges: &'a [Vec<usize>]) -> Self {
        let n = edges.len();
        Self {
            edges,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            next_index: 0,
            components: Vec::new(),
        }
    }

    fn visit(&mut self, v: usize) {
        self.index[v] = Some(self.next_index);
        self.lowlink[v] = self.next_index;
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        let edges = self.edges;
        for &w in &edges[v] {
            match self.index[w] {
                None => {
                    self.visit(w);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                }
                Some(w_index) if self.on_stack[w] => {
                    self.lowlink[v] = self.lowlink[v].min(w_index);
                }
                Some(_) => {}
            }
        }

        if self.index[v] == Some(self.lowlink[v]) {
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
