//! Helper functions for common reconciliation patterns
//!
//! Status condition bookkeeping shared by the reconcilers.

use crds::Condition;
use serde_json::json;

/// Merges `condition` into `existing`, replacing any condition of the same type.
///
/// Returns `None` when an equivalent condition is already present, so callers
/// can skip the status write. The timestamp is not compared.
pub fn upsert_condition(existing: &[Condition], condition: Condition) -> Option<Vec<Condition>> {
    if existing
        .iter()
        .any(|c| c.type_ == condition.type_ && c.same_state(&condition))
    {
        return None;
    }

    let mut conditions: Vec<Condition> = existing
        .iter()
        .filter(|c| c.type_ != condition.type_)
        .cloned()
        .collect();
    conditions.push(condition);
    Some(conditions)
}

/// Merge patch body replacing `status.conditions`.
pub fn conditions_patch(conditions: &[Condition]) -> serde_json::Value {
    json!({
        "status": {
            "conditions": conditions
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::ConditionStatus;

    #[test]
    fn test_upsert_into_empty() {
        let ready = Condition::new("Ready", ConditionStatus::True, "Synced", "ok");
        let merged = upsert_condition(&[], ready.clone()).unwrap();
        assert_eq!(merged, vec![ready]);
    }

    #[test]
    fn test_upsert_unchanged_returns_none() {
        let ready = Condition::new("Ready", ConditionStatus::True, "Synced", "ok");
        let mut again = ready.clone();
        again.last_transition_time = None;
        assert!(upsert_condition(&[ready], again).is_none());
    }

    #[test]
    fn test_upsert_replaces_same_type_and_keeps_others() {
        let other = Condition::new("Other", ConditionStatus::True, "Fine", "ok");
        let pending = Condition::new("Ready", ConditionStatus::False, "Pending", "waiting");
        let ready = Condition::new("Ready", ConditionStatus::True, "Synced", "ok");

        let merged = upsert_condition(&[other.clone(), pending], ready.clone()).unwrap();
        assert_eq!(merged, vec![other, ready]);
    }

    #[test]
    fn test_conditions_patch_shape() {
        let ready = Condition::new("Ready", ConditionStatus::True, "Synced", "ok");
        let patch = conditions_patch(&[ready]);
        assert_eq!(patch["status"]["conditions"][0]["type"], "Ready");
    }
}
