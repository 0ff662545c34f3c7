//! Wave layering over the unit dependency graph.
//!
//! Cycles are found with Tarjan's strongly-connected-components pass so the
//! report names exactly the members of each cycle. Layering of the remaining
//! acyclic part is a Kahn topological walk.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use keel_core::{ReconcilableUnit, UnitId};

use crate::error::GraphError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The grouper's view of one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub id: UnitId,
    pub declared_wave: i64,
    pub depends_on: BTreeSet<UnitId>,
    /// Implicit edge: a unit waits for its owner.
    pub owner: Option<UnitId>,
}

impl GraphNode {
    pub fn new(id: impl Into<UnitId>, declared_wave: i64) -> Self {
        Self {
            id: id.into(),
            declared_wave,
            depends_on: BTreeSet::new(),
            owner: None,
        }
    }

    pub fn depends_on(mut self, dep: impl Into<UnitId>) -> Self {
        self.depends_on.insert(dep.into());
        self
    }

    pub fn owned_by(mut self, owner: impl Into<UnitId>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

impl From<&ReconcilableUnit> for GraphNode {
    fn from(unit: &ReconcilableUnit) -> Self {
        Self {
            id: unit.id.clone(),
            declared_wave: unit.wave.declared,
            depends_on: unit.depends_on.clone(),
            owner: unit.owner.clone(),
        }
    }
}

/// Effective wave of every schedulable unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WavePlan {
    effective: BTreeMap<UnitId, i64>,
}

impl WavePlan {
    pub fn wave_of(&self, id: &UnitId) -> Option<i64> {
        self.effective.get(id).copied()
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.effective.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.effective.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effective.is_empty()
    }

    /// Waves in ascending order; members sorted by id within a wave.
    pub fn ordered_waves(&self) -> Vec<(i64, Vec<UnitId>)> {
        let mut waves: BTreeMap<i64, Vec<UnitId>> = BTreeMap::new();
        for (id, wave) in &self.effective {
            waves.entry(*wave).or_default().push(id.clone());
        }
        waves.into_iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UnitId, i64)> {
        self.effective.iter().map(|(id, w)| (id, *w))
    }
}

/// Full grouping result: the plan for healthy parts of the graph plus every
/// problem found, so callers can keep scheduling units that are unaffected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grouping {
    pub plan: WavePlan,
    pub cycles: Vec<Vec<UnitId>>,
    pub missing: Vec<(UnitId, UnitId)>,
    /// Units outside any cycle that transitively depend on a cycle member or
    /// on a unit with a missing dependency.
    pub blocked: BTreeSet<UnitId>,
}

impl Grouping {
    pub fn in_cycle(&self, id: &UnitId) -> Option<&[UnitId]> {
        self.cycles
            .iter()
            .find(|c| c.contains(id))
            .map(Vec::as_slice)
    }

    pub fn missing_for(&self, id: &UnitId) -> Vec<&UnitId> {
        self.missing
            .iter()
            .filter(|(u, _)| u == id)
            .map(|(_, d)| d)
            .collect()
    }

    /// The first problem found, as a single error.
    pub fn error(&self) -> Option<GraphError> {
        if !self.cycles.is_empty() {
            return Some(GraphError::Cycle {
                cycles: self.cycles.clone(),
            });
        }
        self.missing
            .first()
            .map(|(unit, dependency)| GraphError::MissingDependency {
                unit: unit.clone(),
                dependency: dependency.clone(),
            })
    }
}

// ---------------------------------------------------------------------------
// Grouping
// ---------------------------------------------------------------------------

/// Strict grouping: ordered waves of unit ids, or the first configuration error.
pub fn group(nodes: &[GraphNode]) -> Result<Vec<Vec<UnitId>>, GraphError> {
    let grouping = plan(nodes);
    if let Some(err) = grouping.error() {
        return Err(err);
    }
    Ok(grouping
        .plan
        .ordered_waves()
        .into_iter()
        .map(|(_, ids)| ids)
        .collect())
}

/// Lenient grouping used by the scheduler.
pub fn plan(nodes: &[GraphNode]) -> Grouping {
    let index: BTreeMap<&UnitId, &GraphNode> = nodes.iter().map(|n| (&n.id, n)).collect();

    let mut missing = Vec::new();
    let mut deps: BTreeMap<&UnitId, Vec<&UnitId>> = BTreeMap::new();
    for node in nodes {
        let mut edges = Vec::new();
        for dep in &node.depends_on {
            match index.get_key_value(dep) {
                Some((key, _)) => edges.push(*key),
                None => missing.push((node.id.clone(), dep.clone())),
            }
        }
        // An owner already gone is not a dependency; it is being torn down.
        if let Some((key, _)) = node.owner.as_ref().and_then(|o| index.get_key_value(o)) {
            if !edges.contains(key) {
                edges.push(*key);
            }
        }
        deps.insert(&node.id, edges);
    }

    let cycles = strongly_connected_cycles(&deps);

    let mut poisoned: BTreeSet<&UnitId> = cycles
        .iter()
        .flatten()
        .filter_map(|id| index.get_key_value(id).map(|(key, _)| *key))
        .collect();
    for (unit, _) in &missing {
        if let Some((key, _)) = index.get_key_value(unit) {
            poisoned.insert(*key);
        }
    }

    // Kahn walk: dependency -> dependent.
    let mut dependents: BTreeMap<&UnitId, Vec<&UnitId>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&UnitId, usize> = BTreeMap::new();
    for (unit, edges) in &deps {
        in_degree.entry(*unit).or_insert(0);
        for dep in edges {
            dependents.entry(*dep).or_default().push(*unit);
            *in_degree.entry(*unit).or_insert(0) += 1;
        }
    }
    let mut queue: VecDeque<&UnitId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut effective: BTreeMap<UnitId, i64> = BTreeMap::new();
    let mut blocked: BTreeSet<UnitId> = BTreeSet::new();
    while let Some(id) = queue.pop_front() {
        let edges = deps.get(id).map(Vec::as_slice).unwrap_or(&[]);
        let upstream_bad = edges
            .iter()
            .any(|d| poisoned.contains(d) || blocked.contains(*d));
        // Poisoned units are reported through `cycles` and `missing`.
        let is_poisoned = poisoned.contains(id);
        if !is_poisoned && upstream_bad {
            blocked.insert(id.clone());
        } else if !is_poisoned {
            let declared = index.get(id).map_or(0, |n| n.declared_wave);
            let from_deps = edges
                .iter()
                .filter_map(|d| effective.get(*d))
                .map(|w| w + 1)
                .max();
            let wave = from_deps.map_or(declared, |w| w.max(declared));
            effective.insert(id.clone(), wave);
        }
        continue_kahn(id, &dependents, &mut in_degree, &mut queue);
    }

    // Anything Kahn never reached sits downstream of a cycle.
    for node in nodes {
        if !effective.contains_key(&node.id) && !poisoned.contains(&node.id) {
            blocked.insert(node.id.clone());
        }
    }

    Grouping {
        plan: WavePlan { effective },
        cycles,
        missing,
        blocked,
    }
}

fn continue_kahn<'a>(
    id: &'a UnitId,
    dependents: &BTreeMap<&'a UnitId, Vec<&'a UnitId>>,
    in_degree: &mut BTreeMap<&'a UnitId, usize>,
    queue: &mut VecDeque<&'a UnitId>,
) {
    for next in dependents.get(id).into_iter().flatten() {
        if let Some(d) = in_degree.get_mut(next) {
            *d -= 1;
            if *d == 0 {
                queue.push_back(*next);
            }
        }
    }
}

/// Every unit that transitively depends on `root`, through explicit edges or
/// ownership. `root` itself is not included.
pub fn dependents_closure(nodes: &[GraphNode], root: &UnitId) -> BTreeSet<UnitId> {
    let mut reverse: BTreeMap<&UnitId, Vec<&UnitId>> = BTreeMap::new();
    for node in nodes {
        for dep in node.depends_on.iter().chain(node.owner.iter()) {
            reverse.entry(dep).or_default().push(&node.id);
        }
    }
    let mut seen = BTreeSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        for next in reverse.get(id).into_iter().flatten() {
            if *next != root && seen.insert((*next).clone()) {
                stack.push(*next);
            }
        }
    }
    seen
}

// ---------------------------------------------------------------------------
// Tarjan SCC
// ---------------------------------------------------------------------------

struct Tarjan<'a> {
    deps: &'a BTreeMap<&'a UnitId, Vec<&'a UnitId>>,
    next_index: usize,
    index: BTreeMap<&'a UnitId, usize>,
    lowlink: BTreeMap<&'a UnitId, usize>,
    stack: Vec<&'a UnitId>,
    on_stack: BTreeSet<&'a UnitId>,
    cycles: Vec<Vec<UnitId>>,
}

impl<'a> Tarjan<'a> {
    fn visit(&mut self, v: &'a UnitId) {
        self.index.insert(v, self.next_index);
        self.lowlink.insert(v, self.next_index);
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack.insert(v);

        let edges = self.deps.get(v).cloned().unwrap_or_default();
        for w in edges {
            if !self.index.contains_key(w) {
                self.visit(w);
                let low = self.lowlink[v].min(self.lowlink[w]);
                self.lowlink.insert(v, low);
            } else if self.on_stack.contains(w) {
                let low = self.lowlink[v].min(self.index[w]);
                self.lowlink.insert(v, low);
            }
        }

        if self.lowlink[v] == self.index[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack.remove(w);
                component.push(w.clone());
                if w == v {
                    break;
                }
            }
            let self_loop = self.deps.get(v).map_or(false, |e| e.contains(&v));
            if component.len() > 1 || self_loop {
                component.sort();
                self.cycles.push(component);
            }
        }
    }
}

fn strongly_connected_cycles(deps: &BTreeMap<&UnitId, Vec<&UnitId>>) -> Vec<Vec<UnitId>> {
    let mut tarjan = Tarjan {
        deps,
        next_index: 0,
        index: BTreeMap::new(),
        lowlink: BTreeMap::new(),
        stack: Vec::new(),
        on_stack: BTreeSet::new(),
        cycles: Vec::new(),
    };
    for v in deps.keys() {
        if !tarjan.index.contains_key(*v) {
            tarjan.visit(*v);
        }
    }
    let mut cycles = tarjan.cycles;
    cycles.sort();
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_wave_is_a_floor() {
        let nodes = vec![
            GraphNode::new("a", 0),
            GraphNode::new("b", 5).depends_on("a"),
            GraphNode::new("c", 0).depends_on("b"),
        ];
        let plan = plan(&nodes).plan;
        assert_eq!(plan.wave_of(&"a".into()), Some(0));
        assert_eq!(plan.wave_of(&"b".into()), Some(5));
        assert_eq!(plan.wave_of(&"c".into()), Some(6));
    }

    #[test]
    fn negative_waves_are_allowed() {
        let nodes = vec![GraphNode::new("early", -2), GraphNode::new("late", 0)];
        let waves = group(&nodes).unwrap();
        assert_eq!(waves, vec![vec![UnitId::from("early")], vec![UnitId::from("late")]]);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let nodes = vec![GraphNode::new("a", 0).depends_on("a")];
        let g = plan(&nodes);
        assert_eq!(g.cycles, vec![vec![UnitId::from("a")]]);
        assert!(g.plan.is_empty());
    }

    #[test]
    fn missing_owner_is_ignored_but_missing_dependency_is_not() {
        let nodes = vec![
            GraphNode::new("mr", 0).owned_by("gone"),
            GraphNode::new("app", 0).depends_on("nowhere"),
        ];
        let g = plan(&nodes);
        assert_eq!(g.plan.wave_of(&"mr".into()), Some(0));
        assert_eq!(g.missing, vec![(UnitId::from("app"), UnitId::from("nowhere"))]);
        assert!(!g.plan.contains(&"app".into()));
    }
}
