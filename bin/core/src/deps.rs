use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::anyhow;

/// Orders container names so every dependency lands before its
/// dependents (Kahn's algorithm). Dependencies naming containers
/// outside the batch are ignored: they are either already up to
/// date or not due this tick, and must not wedge the sort.
///
/// Errors on a cycle, naming the containers stuck in it. The
/// auto-apply caller falls back to its original order rather
/// than skipping the tick.
///
/// Ready nodes are drained in name order, so the result is
/// deterministic regardless of input order.
pub fn update_order(
  containers: &[(String, Vec<String>)],
) -> anyhow::Result<Vec<String>> {
  let names = containers
    .iter()
    .map(|(name, _)| name.as_str())
    .collect::<HashSet<_>>();

  // in-degree per node, and dependency -> dependents edges.
  let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
  let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
  for (name, dependencies) in containers {
    let in_batch = dependencies
      .iter()
      .filter(|dep| {
        names.contains(dep.as_str())
          && dep.as_str() != name.as_str()
      })
      .collect::<Vec<_>>();
    pending.insert(name, in_batch.len());
    for dep in in_batch {
      dependents.entry(dep).or_default().push(name);
    }
  }

  let mut order = Vec::with_capacity(containers.len());
  loop {
    let ready = pending
      .iter()
      .filter(|(_, in_degree)| **in_degree == 0)
      .map(|(name, _)| *name)
      .collect::<Vec<_>>();
    if ready.is_empty() {
      break;
    }
    for name in ready {
      pending.remove(name);
      order.push(name.to_string());
      if let Some(dependents) = dependents.get(name) {
        for dependent in dependents {
          if let Some(in_degree) = pending.get_mut(dependent) {
            *in_degree = in_degree.saturating_sub(1);
          }
        }
      }
    }
  }

  if !pending.is_empty() {
    let stuck = pending.keys().copied().collect::<Vec<_>>();
    return Err(anyhow!(
      "dependency cycle detected among containers: {}",
      stuck.join(", ")
    ));
  }

  Ok(order)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn graph(
    edges: &[(&str, &[&str])],
  ) -> Vec<(String, Vec<String>)> {
    edges
      .iter()
      .map(|(name, deps)| {
        (
          name.to_string(),
          deps.iter().map(|d| d.to_string()).collect(),
        )
      })
      .collect()
  }

  fn position(order: &[String], name: &str) -> usize {
    order.iter().position(|n| n == name).unwrap()
  }

  #[test]
  fn dependencies_come_first() {
    let order = update_order(&graph(&[
      ("app", &["db", "cache"]),
      ("cache", &[]),
      ("db", &[]),
    ]))
    .unwrap();
    assert_eq!(order.len(), 3);
    assert!(position(&order, "db") < position(&order, "app"));
    assert!(position(&order, "cache") < position(&order, "app"));
  }

  #[test]
  fn chains_and_diamonds() {
    let order = update_order(&graph(&[
      ("frontend", &["api"]),
      ("api", &["db", "queue"]),
      ("queue", &["db"]),
      ("db", &[]),
    ]))
    .unwrap();
    assert!(position(&order, "db") < position(&order, "queue"));
    assert!(position(&order, "queue") < position(&order, "api"));
    assert!(
      position(&order, "api") < position(&order, "frontend")
    );
  }

  #[test]
  fn out_of_batch_dependencies_are_ignored() {
    let order = update_order(&graph(&[
      ("app", &["postgres-not-updating"]),
      ("worker", &["app"]),
    ]))
    .unwrap();
    assert_eq!(order, vec!["app".to_string(), "worker".to_string()]);
  }

  #[test]
  fn self_dependency_does_not_wedge() {
    let order =
      update_order(&graph(&[("app", &["app"])])).unwrap();
    assert_eq!(order, vec!["app".to_string()]);
  }

  #[test]
  fn cycle_is_an_error_naming_the_members() {
    let err = update_order(&graph(&[
      ("a", &["b"]),
      ("b", &["a"]),
      ("standalone", &[]),
    ]))
    .unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("a"));
    assert!(message.contains("b"));
    assert!(!message.contains("standalone,"));
  }

  #[test]
  fn ordering_is_deterministic() {
    let forward = update_order(&graph(&[
      ("c", &[]),
      ("a", &[]),
      ("b", &[]),
    ]))
    .unwrap();
    let reverse = update_order(&graph(&[
      ("b", &[]),
      ("a", &[]),
      ("c", &[]),
    ]))
    .unwrap();
    assert_eq!(forward, reverse);
    assert_eq!(
      forward,
      vec!["a".to_string(), "b".to_string(), "c".to_string()]
    );
  }
}
