//! Key-set helpers, dependency ordering and time parsing.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::SchedulerError;

pub type KeySet = BTreeSet<String>;

/// Map from a key to the set of keys it depends on.
pub type DepMap = BTreeMap<String, KeySet>;

/// Current wall time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Convert introspection time arguments (Unix seconds) to the graph's
/// millisecond timeline.
pub fn unix_secs_to_ms(secs: u64) -> u64 {
    secs.saturating_mul(1_000)
}

/// True if `k1` depends on `k2`, directly or transitively.
pub fn depends_on(k1: &str, k2: &str, deps: &DepMap) -> bool {
    depends_on_rec(k1, k2, deps, &mut KeySet::new())
}

fn depends_on_rec(k1: &str, k2: &str, deps: &DepMap, visited: &mut KeySet) -> bool {
    let k1_deps = match deps.get(k1) {
        Some(set) => set,
        None => return false,
    };
    if k1_deps.contains(k2) {
        return true;
    }

    visited.insert(k1.to_string());
    for dep in k1_deps {
        if visited.contains(dep) {
            continue;
        }
        if depends_on_rec(dep, k2, deps, visited) {
            return true;
        }
    }
    false
}

/// Order keys by Kahn's algorithm so that the given dependencies are
/// respected.
///
/// With `dep_first`, a key follows everything it depends on; otherwise the
/// order is reversed (dependents first). Candidate ties are broken
/// lexicographically so the output is deterministic. When no candidate
/// exists and `handle_cycle` is set, any key that transitively depends on
/// itself is eligible; without `handle_cycle` a cycle is an error.
pub fn topological_order(
    keys: &KeySet,
    deps: &DepMap,
    dep_first: bool,
    handle_cycle: bool,
) -> Result<Vec<String>, SchedulerError> {
    let mut remains = keys.clone();
    let mut remains_deps: DepMap = BTreeMap::new();
    for (key, key_deps) in deps {
        if !keys.contains(key) {
            continue;
        }
        remains_deps.insert(
            key.clone(),
            key_deps.intersection(keys).cloned().collect(),
        );
    }

    let mut sorted = Vec::with_capacity(remains.len());
    while !remains.is_empty() {
        let mut candidates: Vec<&String> = Vec::new();
        for key in &remains {
            let candidate = if dep_first {
                remains_deps.get(key).map_or(true, KeySet::is_empty)
            } else {
                !remains_deps.values().any(|key2_deps| key2_deps.contains(key))
            };
            if candidate {
                candidates.push(key);
            }
        }

        if candidates.is_empty() {
            if !handle_cycle {
                return Err(SchedulerError::DependencyCycle);
            }
            for key in &remains {
                if depends_on(key, key, deps) {
                    candidates.push(key);
                }
            }
            if candidates.is_empty() {
                // remaining keys depend on keys outside the set
                candidates.extend(remains.iter());
            }
        }

        // BTreeSet iteration is already ordered, so the first candidate is
        // the lexicographically smallest.
        let key = candidates[0].clone();
        sorted.push(key.clone());

        remains.remove(&key);
        remains_deps.remove(&key);
        for key2_deps in remains_deps.values_mut() {
            key2_deps.remove(&key);
        }
    }
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn keys(items: &[&str]) -> KeySet {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn deps(pairs: &[(&str, &[&str])]) -> DepMap {
        pairs
            .iter()
            .map(|(k, ds)| (k.to_string(), keys(ds)))
            .collect()
    }

    #[test]
    fn chain_orders_dependencies_first() {
        let set = keys(&["a", "b", "c"]);
        let map = deps(&[("a", &["b"]), ("b", &["c"])]);

        let sorted = topological_order(&set, &map, true, false).unwrap();
        assert_eq!(sorted, vec!["c", "b", "a"]);

        let reversed = topological_order(&set, &map, false, false).unwrap();
        assert_eq!(reversed, vec!["a", "b", "c"]);
    }

    #[test]
    fn independent_keys_sort_lexicographically() {
        let set = keys(&["z", "m", "a"]);
        let sorted = topological_order(&set, &DepMap::new(), true, false).unwrap();
        assert_eq!(sorted, vec!["a", "m", "z"]);
    }

    #[test]
    fn cycle_without_handling_is_an_error() {
        let set = keys(&["a", "b"]);
        let map = deps(&[("a", &["b"]), ("b", &["a"])]);
        assert_eq!(
            topological_order(&set, &map, true, false),
            Err(SchedulerError::DependencyCycle)
        );
    }

    #[test]
    fn cycle_handling_picks_smallest_cycle_member() {
        let set = keys(&["a/1", "a/2", "a/3"]);
        let map = deps(&[("a/1", &["a/2"]), ("a/2", &["a/3"]), ("a/3", &["a/1"])]);
        let sorted = topological_order(&set, &map, true, true).unwrap();
        // a/1 breaks the cycle, which frees its dependent a/3 next
        assert_eq!(sorted, vec!["a/1", "a/3", "a/2"]);
    }

    #[test]
    fn deps_outside_the_set_are_ignored() {
        let set = keys(&["b", "a"]);
        let map = deps(&[("a", &["external"]), ("b", &["a"])]);
        let sorted = topological_order(&set, &map, true, false).unwrap();
        assert_eq!(sorted, vec!["a", "b"]);
    }

    #[test]
    fn depends_on_is_transitive() {
        let map = deps(&[("a", &["b"]), ("b", &["c"])]);
        assert!(depends_on("a", "c", &map));
        assert!(!depends_on("c", "a", &map));
    }

    #[test]
    fn depends_on_handles_cycles() {
        let map = deps(&[("a", &["b"]), ("b", &["a"])]);
        assert!(depends_on("a", "a", &map));
        assert!(depends_on("b", "b", &map));
        assert!(!depends_on("a", "x", &map));
    }

    proptest! {
        /// For acyclic inputs, every edge a -> b puts b before a when
        /// dependencies go first, and a before b otherwise.
        #[test]
        fn order_respects_edges(
            edges in proptest::collection::vec((0u8..8, 0u8..8), 0..20),
            dep_first in proptest::bool::ANY,
        ) {
            // build an acyclic map by only keeping edges from bigger to
            // smaller ids
            let mut map = DepMap::new();
            let mut set = KeySet::new();
            for id in 0u8..8 {
                set.insert(format!("k{}", id));
            }
            for (from, to) in edges {
                if from > to {
                    map.entry(format!("k{}", from))
                        .or_default()
                        .insert(format!("k{}", to));
                }
            }

            let sorted = topological_order(&set, &map, dep_first, false).unwrap();
            prop_assert_eq!(sorted.len(), set.len());

            let position: std::collections::HashMap<&str, usize> = sorted
                .iter()
                .enumerate()
                .map(|(i, k)| (k.as_str(), i))
                .collect();
            for (from, deps_of) in &map {
                for to in deps_of {
                    let (pf, pt) = (position[from.as_str()], position[to.as_str()]);
                    if dep_first {
                        prop_assert!(pt < pf, "{} must precede {}", to, from);
                    } else {
                        prop_assert!(pf < pt, "{} must precede {}", from, to);
                    }
                }
            }
        }
    }
}
