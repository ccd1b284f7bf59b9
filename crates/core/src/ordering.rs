//! Feature installation ordering
//!
//! Topological sort over hard (`dependsOn`) and soft (`installsAfter`)
//! edges. Hard edges must be satisfied; soft edges only order features that
//! are actually present and are dropped silently otherwise. The sort is
//! Kahn's algorithm with a deterministic tie-breaker, so identical inputs
//! always produce identical output; hash reproducibility depends on it.

use std::collections::{HashMap, HashSet};

use tracing::{debug, instrument};

use crate::errors::{OrderingError, Result};
use crate::features::ResolvedFeature;

/// Order features for installation.
///
/// When `override_order` is non-empty it is applied as a prefix: features it
/// names come first in the given order (no topological validation against
/// the override), followed by the remaining features in topological order.
#[instrument(skip_all, fields(count = features.len()))]
pub fn order_features(
    features: Vec<ResolvedFeature>,
    override_order: &[String],
) -> Result<Vec<ResolvedFeature>> {
    let sorted = topo_sort(features)?;

    if override_order.is_empty() {
        return Ok(sorted);
    }

    let mut prefix: Vec<ResolvedFeature> = Vec::new();
    let mut rest = sorted;
    for name in override_order {
        if let Some(pos) = rest.iter().position(|f| matches_name(f, name)) {
            prefix.push(rest.remove(pos));
        }
    }
    prefix.extend(rest);
    Ok(prefix)
}

/// Whether `name` (an id or reference string) identifies this feature.
fn matches_name(feature: &ResolvedFeature, name: &str) -> bool {
    if feature.id == name {
        return true;
    }
    let canonical = feature.reference.canonical();
    if canonical == name {
        return true;
    }
    // Tolerate version-less references against versioned canonical ids.
    canonical
        .rsplit_once(':')
        .is_some_and(|(base, _)| base == name)
}

fn topo_sort(features: Vec<ResolvedFeature>) -> Result<Vec<ResolvedFeature>> {
    let n = features.len();
    let index_of: HashMap<String, usize> = {
        let mut map = HashMap::new();
        for (idx, feature) in features.iter().enumerate() {
            map.insert(feature.id.clone(), idx);
        }
        map
    };
    let find = |name: &str| -> Option<usize> {
        index_of.get(name).copied().or_else(|| {
            features
                .iter()
                .position(|f| matches_name(f, name))
        })
    };

    // Hard edges: dependency -> dependent. Soft deps are kept per node for
    // the tie-break score.
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut soft_deps: Vec<HashSet<usize>> = vec![HashSet::new(); n];

    for (idx, feature) in features.iter().enumerate() {
        for (dep_name, _) in feature.depends_on() {
            match find(dep_name) {
                Some(dep_idx) => {
                    if dep_idx != idx {
                        dependents[dep_idx].push(idx);
                        in_degree[idx] += 1;
                    }
                }
                // The fetch fixpoint pulls every reachable dependency, so a
                // miss here means the dependency was explicitly disabled.
                None => {
                    return Err(OrderingError::MissingDependency {
                        from: feature.id.clone(),
                        to: dep_name.clone(),
                    }
                    .into())
                }
            }
        }
        for soft_name in feature.installs_after() {
            if let Some(soft_idx) = find(soft_name) {
                if soft_idx != idx {
                    soft_deps[idx].insert(soft_idx);
                }
            }
        }
    }

    let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut processed: HashSet<usize> = HashSet::with_capacity(n);
    let mut order: Vec<usize> = Vec::with_capacity(n);

    while !ready.is_empty() {
        // Prefer the candidate whose soft dependencies are most already
        // installed; break remaining ties by lexicographic id.
        let best = ready
            .iter()
            .enumerate()
            .min_by(|(_, &a), (_, &b)| {
                score(&soft_deps[b], &processed)
                    .cmp(&score(&soft_deps[a], &processed))
                    .then_with(|| features[a].id.cmp(&features[b].id))
            })
            .map(|(pos, _)| pos)
            .expect("ready is non-empty");

        let idx = ready.remove(best);
        processed.insert(idx);
        order.push(idx);
        for &dependent in &dependents[idx] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(dependent);
            }
        }
    }

    if order.len() != n {
        let mut members: Vec<String> = (0..n)
            .filter(|i| !processed.contains(i))
            .map(|i| features[i].id.clone())
            .collect();
        members.sort();
        return Err(OrderingError::CycleDetected { members }.into());
    }

    debug!(order = ?order.iter().map(|&i| &features[i].id).collect::<Vec<_>>(), "features ordered");

    // Reassemble in computed order.
    let mut slots: Vec<Option<ResolvedFeature>> = features.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .map(|i| slots[i].take().expect("each index appears once"))
        .collect())
}

fn score(soft: &HashSet<usize>, processed: &HashSet<usize>) -> i64 {
    let satisfied = soft.intersection(processed).count() as i64;
    let pending = soft.len() as i64 - satisfied;
    satisfied - pending
}
