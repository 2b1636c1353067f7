//! Id generation helpers.
//!
//! Three distinct id shapes are needed across the core: task ids minted from
//! a PRD's `idPattern`, fix-task ids derived from a base task, and event ids
//! that must be strictly increasing within a bus's lifetime.

use std::sync::atomic::{AtomicU64, Ordering};

/// Replace the `{id}` placeholder in a requirement id-pattern with `n`.
///
/// Falls back to `TASK-<n>-<wallclock_ms>` when the pattern has no
/// placeholder, matching the store's documented fallback behaviour.
pub fn substitute_id_pattern(pattern: &str, n: u64, wallclock_ms: i64) -> String {
    if pattern.contains("{id}") {
        pattern.replace("{id}", &n.to_string())
    } else {
        format!("TASK-{n}-{wallclock_ms}")
    }
}

/// Build a fix-task id of the form `fix-<base>-<wallclock_ms>`.
pub fn generate_fix_task_id(base_task_id: &str, wallclock_ms: i64) -> String {
    format!("fix-{base_task_id}-{wallclock_ms}")
}

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Allocate the next `evt-<wallclockms>-<seq>` id.
///
/// The sequence counter is process-global and monotonically increasing,
/// which is what guarantees strictly-increasing ids even when two events
/// land on the same millisecond.
pub fn generate_event_id(wallclock_ms: i64) -> String {
    let seq = EVENT_SEQ.fetch_add(1, Ordering::SeqCst);
    format!("evt-{wallclock_ms}-{seq}")
}

/// Strip one or more `fix-...-<ts>` wrappers to recover the original base id.
///
/// A fix-task created against another fix-task (shouldn't normally happen,
/// but the retry ledger must still converge) is credited to the innermost
/// non-fix id.
pub fn base_task_id(id: &str) -> &str {
    let mut current = id;
    while let Some(rest) = current.strip_prefix("fix-") {
        match rest.rfind('-') {
            Some(idx) if rest[idx + 1..].chars().all(|c| c.is_ascii_digit()) && idx > 0 => {
                current = &rest[..idx];
            }
            _ => return rest,
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_placeholder() {
        assert_eq!(substitute_id_pattern("TASK-{id}", 7, 1000), "TASK-7");
    }

    #[test]
    fn falls_back_without_placeholder() {
        assert_eq!(substitute_id_pattern("nope", 7, 1000), "TASK-7-1000");
    }

    #[test]
    fn fix_task_id_shape() {
        assert_eq!(generate_fix_task_id("T1", 123), "fix-T1-123");
    }

    #[test]
    fn event_ids_strictly_increase() {
        let a = generate_event_id(1000);
        let b = generate_event_id(1000);
        assert_ne!(a, b);
        let seq_a: u64 = a.rsplit('-').next().unwrap().parse().unwrap();
        let seq_b: u64 = b.rsplit('-').next().unwrap().parse().unwrap();
        assert!(seq_b > seq_a);
    }

    #[test]
    fn base_task_id_strips_single_wrapper() {
        assert_eq!(base_task_id("fix-T1-1700000000000"), "T1");
    }

    #[test]
    fn base_task_id_strips_nested_wrappers() {
        assert_eq!(base_task_id("fix-fix-T1-1000-2000"), "T1");
    }

    #[test]
    fn base_task_id_identity_for_plain_id() {
        assert_eq!(base_task_id("T1"), "T1");
    }

    fn event_seq(id: &str) -> u64 {
        id.rsplit('-').next().unwrap().parse().unwrap()
    }

    proptest::proptest! {
        /// However the caller jitters `wallclock_ms` between calls — forward,
        /// backward, or repeated — the allocated sequence number is strictly
        /// increasing, since it is the only thing `generate_event_id` actually
        /// guarantees uniqueness from.
        #[test]
        fn generated_event_ids_have_a_strictly_increasing_sequence(
            wallclocks in proptest::collection::vec(proptest::num::i64::ANY, 2..50)
        ) {
            let ids: Vec<String> = wallclocks.iter().map(|&ms| generate_event_id(ms)).collect();
            let seqs: Vec<u64> = ids.iter().map(|id| event_seq(id)).collect();
            for window in seqs.windows(2) {
                proptest::prop_assert!(window[1] > window[0]);
            }
        }
    }
}
