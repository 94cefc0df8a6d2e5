use showsync_core::{AggregateReadiness, OverallStatus, SubscriptionHealthRecord};
use std::collections::{BTreeMap, BTreeSet};

/// Folds named health records into one verdict.
///
/// `can_submit_forms` is intentionally permissive: any ready subscription is
/// enough, even when a required one is not.
pub fn aggregate(
    records: &BTreeMap<String, SubscriptionHealthRecord>,
    required: &BTreeSet<String>,
) -> AggregateReadiness {
    let total = records.len();
    let ready = records.values().filter(|record| record.is_ready).count();
    let failed = records
        .values()
        .filter(|record| record.circuit_breaker_open)
        .count();

    let required_ready = required.iter().all(|name| {
        records
            .get(name)
            .map(|record| record.is_ready)
            .unwrap_or(false)
    });

    let overall_status = if ready > 0 && failed == 0 {
        OverallStatus::Healthy
    } else if ready > 0 && ready < total {
        OverallStatus::Partial
    } else {
        OverallStatus::Failed
    };

    AggregateReadiness {
        total,
        ready,
        failed,
        required_ready,
        overall_status,
        can_submit_forms: required_ready || ready > 0,
    }
}
