//! The operation model (spec §4.D) and the pure config differ (spec §4.C)
//! that turns an old/new [`Config`](crate::config::Config) pair into a
//! stably-ordered list of [`Operation`]s safe to apply sequentially.

use crate::config::{Config, Rule};

/// A primitive mutation of controller state, total-ordered by [`priority`]
/// for safe batch application (spec §4.D). Equality is field-wise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    AddRule { key: String },
    RemoveRule { key: String },
    AddPort { key: String, port: u16 },
    RemovePort { key: String, port: u16 },
    AddTarget { key: String, target: String },
    RemoveTarget { key: String, target: String },
}

impl Operation {
    /// The priority band this operation's variant belongs to. Lower sorts
    /// first. This is the single source of truth for cross-variant
    /// ordering (spec §4.D):
    /// `RemovePort(1) < RemoveTarget(2) < RemoveRule(3) < AddRule(4) <
    /// AddTarget(5) < AddPort(6)`.
    pub fn priority(&self) -> u8 {
        match self {
            Operation::RemovePort { .. } => 1,
            Operation::RemoveTarget { .. } => 2,
            Operation::RemoveRule { .. } => 3,
            Operation::AddRule { .. } => 4,
            Operation::AddTarget { .. } => 5,
            Operation::AddPort { .. } => 6,
        }
    }

    /// The rule key this operation applies to.
    pub fn key(&self) -> &str {
        match self {
            Operation::AddRule { key }
            | Operation::RemoveRule { key }
            | Operation::AddPort { key, .. }
            | Operation::RemovePort { key, .. }
            | Operation::AddTarget { key, .. }
            | Operation::RemoveTarget { key, .. } => key,
        }
    }
}

/// Compares `old` to `new` and returns the ordered list of [`Operation`]s
/// that mutate a controller whose state is `old` into one whose state is
/// `new` (spec §4.C). Deterministic for fixed inputs; does not mutate
/// either config.
///
/// # Panics
///
/// Panics if the internal partitioning invariant (equal-length common-rule
/// lists derived from each side) is violated — spec §4.C calls this a
/// programming error, since it can only happen if `old`/`new` aren't really
/// partitioned by the same key set.
pub fn diff(old: &Config, new: &Config) -> Vec<Operation> {
    let mut old_sorted: Vec<&Rule> = old.rules.iter().collect();
    let mut new_sorted: Vec<&Rule> = new.rules.iter().collect();
    old_sorted.sort_by(|a, b| a.key.cmp(&b.key));
    new_sorted.sort_by(|a, b| a.key.cmp(&b.key));

    let mut ops = Vec::new();
    let mut old_common = Vec::new();
    let mut new_common = Vec::new();

    let mut oi = 0usize;
    let mut ni = 0usize;
    while oi < old_sorted.len() && ni < new_sorted.len() {
        let o = old_sorted[oi];
        let n = new_sorted[ni];
        match o.key.cmp(&n.key) {
            std::cmp::Ordering::Less => {
                ops.push(Operation::RemoveRule { key: o.key.clone() });
                oi += 1;
            }
            std::cmp::Ordering::Greater => {
                push_add_rule(&mut ops, n);
                ni += 1;
            }
            std::cmp::Ordering::Equal => {
                old_common.push(o);
                new_common.push(n);
                oi += 1;
                ni += 1;
            }
        }
    }
    for o in &old_sorted[oi..] {
        ops.push(Operation::RemoveRule { key: o.key.clone() });
    }
    for n in &new_sorted[ni..] {
        push_add_rule(&mut ops, n);
    }

    assert_eq!(
        old_common.len(),
        new_common.len(),
        "differ partitioning invariant violated: common-rule lists have different lengths"
    );

    for (o, n) in old_common.iter().zip(new_common.iter()) {
        diff_common_rule(&mut ops, o, n);
    }

    ops.sort_by_key(|op| op.priority());
    ops
}

/// `AddRule` followed by an `AddTarget` per target and an `AddPort` per
/// port, in that order (spec §4.C step 2) — the per-rule order the final
/// stable sort preserves within each priority band.
fn push_add_rule(ops: &mut Vec<Operation>, rule: &Rule) {
    ops.push(Operation::AddRule {
        key: rule.key.clone(),
    });
    for target in &rule.targets {
        ops.push(Operation::AddTarget {
            key: rule.key.clone(),
            target: target.clone(),
        });
    }
    for &port in &rule.ports {
        ops.push(Operation::AddPort {
            key: rule.key.clone(),
            port,
        });
    }
}

fn diff_common_rule(ops: &mut Vec<Operation>, old: &Rule, new: &Rule) {
    debug_assert_eq!(old.key, new.key);
    for port in old.ports.difference(&new.ports) {
        ops.push(Operation::RemovePort {
            key: old.key.clone(),
            port: *port,
        });
    }
    for port in new.ports.difference(&old.ports) {
        ops.push(Operation::AddPort {
            key: old.key.clone(),
            port: *port,
        });
    }
    for target in old.targets.difference(&new.targets) {
        ops.push(Operation::RemoveTarget {
            key: old.key.clone(),
            target: target.clone(),
        });
    }
    for target in new.targets.difference(&old.targets) {
        ops.push(Operation::AddTarget {
            key: old.key.clone(),
            target: target.clone(),
        });
    }
}
