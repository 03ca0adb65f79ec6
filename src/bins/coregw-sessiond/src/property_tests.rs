//! Property-based tests across the credit and session layers.

use std::sync::Arc;

use proptest::prelude::*;

use coregw_proto::{PolicyRule, SessionConfig, TgppContext, TrackingType};

use crate::credit::{grant_total, Bucket, SessionCredit};
use crate::rule_store::StaticRuleStore;
use crate::session_state::SessionState;
use crate::stored::{RuleLifetime, SessionCreditUpdateCriteria, SessionStateUpdateCriteria};

/// One step of a random credit workload.
#[derive(Debug, Clone)]
enum CreditOp {
    AddUsed(u64, u64),
    Grant(u64),
    Report,
    Ack,
    Fail,
}

fn credit_op() -> impl Strategy<Value = CreditOp> {
    prop_oneof![
        (0u64..5000, 0u64..5000).prop_map(|(tx, rx)| CreditOp::AddUsed(tx, rx)),
        (0u64..10_000).prop_map(CreditOp::Grant),
        Just(CreditOp::Report),
        Just(CreditOp::Ack),
        Just(CreditOp::Fail),
    ]
}

fn apply_op(credit: &mut SessionCredit, op: &CreditOp, uc: &mut SessionCreditUpdateCriteria) {
    match op {
        CreditOp::AddUsed(tx, rx) => credit.add_used_credit(*tx, *rx, uc),
        CreditOp::Grant(volume) => credit.receive_credit(&grant_total(*volume), uc),
        CreditOp::Report => {
            if !credit.is_reporting() {
                credit.get_usage_for_reporting(uc);
            }
        }
        CreditOp::Ack => credit.receive_credit(&grant_total(0), uc),
        CreditOp::Fail => credit.mark_failure(5001, uc),
    }
}

proptest! {
    /// Reported + Reporting never exceed Used, and the unreported
    /// remainder accounts for the difference exactly.
    #[test]
    fn prop_usage_accounting_is_conserved(ops in prop::collection::vec(credit_op(), 1..40)) {
        let mut credit = SessionCredit::default();
        let mut uc = SessionCreditUpdateCriteria::default();
        for op in &ops {
            apply_op(&mut credit, op, &mut uc);
            for (used, reporting, reported) in [
                (Bucket::UsedTx, Bucket::ReportingTx, Bucket::ReportedTx),
                (Bucket::UsedRx, Bucket::ReportingRx, Bucket::ReportedRx),
            ] {
                let used = credit.get_credit(used);
                let accounted =
                    credit.get_credit(reporting) + credit.get_credit(reported);
                prop_assert!(accounted <= used, "accounted {accounted} > used {used}");
            }
        }
    }

    /// Counters only grow: Used, Allowed, and Reported are monotone over
    /// any workload, and the allowed floor never passes Allowed.
    #[test]
    fn prop_buckets_are_monotone(ops in prop::collection::vec(credit_op(), 1..40)) {
        let mut credit = SessionCredit::default();
        let mut uc = SessionCreditUpdateCriteria::default();
        let mut prev_used = 0;
        let mut prev_allowed = 0;
        let mut prev_reported = 0;
        for op in &ops {
            apply_op(&mut credit, op, &mut uc);
            let used = credit.get_credit(Bucket::UsedTx) + credit.get_credit(Bucket::UsedRx);
            let allowed = credit.get_credit(Bucket::AllowedTotal);
            let reported =
                credit.get_credit(Bucket::ReportedTx) + credit.get_credit(Bucket::ReportedRx);
            prop_assert!(used >= prev_used);
            prop_assert!(allowed >= prev_allowed);
            prop_assert!(reported >= prev_reported);
            prop_assert!(credit.get_credit(Bucket::AllowedFloorTotal) <= allowed);
            prev_used = used;
            prev_allowed = allowed;
            prev_reported = reported;
        }
    }

    /// Marshal/unmarshal is the identity on any reachable credit.
    #[test]
    fn prop_credit_marshal_roundtrip(ops in prop::collection::vec(credit_op(), 0..30)) {
        let mut credit = SessionCredit::default();
        let mut uc = SessionCreditUpdateCriteria::default();
        for op in &ops {
            apply_op(&mut credit, op, &mut uc);
        }
        let restored = SessionCredit::unmarshal(&credit.marshal());
        prop_assert_eq!(credit, restored);
    }
}

fn rule_store_with(rule_ids: &[String]) -> Arc<StaticRuleStore> {
    let store = StaticRuleStore::new();
    for rule_id in rule_ids {
        store.insert_rule(PolicyRule {
            id: rule_id.clone(),
            tracking_type: TrackingType::NoTracking,
            ..Default::default()
        });
    }
    Arc::new(store)
}

proptest! {
    /// After sync_rules_to_time: every installed or scheduled rule keeps
    /// its lifetime entry, and no rule is both active and scheduled.
    #[test]
    fn prop_sync_rules_keeps_rule_invariants(
        lifetimes in prop::collection::vec((0i64..200, 0i64..200), 1..15),
        now in 0i64..250,
    ) {
        let rule_ids: Vec<String> =
            (0..lifetimes.len()).map(|i| format!("rule-{i}")).collect();
        let rule_store = rule_store_with(&rule_ids);
        let mut session = SessionState::new(
            "IMSI000000000000001",
            "IMSI000000000000001-1",
            SessionConfig::default(),
            rule_store,
            TgppContext::default(),
            0,
        );
        let mut uc = SessionStateUpdateCriteria::default();
        for (rule_id, (activation, deactivation)) in rule_ids.iter().zip(&lifetimes) {
            let lifetime = RuleLifetime {
                activation_time: *activation,
                // deactivation either never, or after some offset
                deactivation_time: if *deactivation % 3 == 0 { 0 } else { *deactivation },
            };
            if lifetime.activation_time > 0 {
                session.schedule_static_rule(rule_id, lifetime, &mut uc);
            } else {
                session.activate_static_rule(rule_id, lifetime, &mut uc);
            }
        }

        let mut sync_uc = SessionStateUpdateCriteria::default();
        session.sync_rules_to_time(now, &mut sync_uc);

        for rule_id in &rule_ids {
            let installed = session.is_static_rule_installed(rule_id);
            let scheduled = session.is_static_rule_scheduled(rule_id);
            prop_assert!(!(installed && scheduled), "{rule_id} both active and scheduled");
            if installed || scheduled {
                prop_assert!(
                    session.get_rule_lifetime(rule_id).is_some(),
                    "{rule_id} lost its lifetime"
                );
            }
        }
    }

    /// Marshaling a session after a random rule workload round-trips.
    #[test]
    fn prop_session_marshal_roundtrip(
        active in prop::collection::vec("[a-z]{3,8}", 0..8),
        usage in prop::collection::vec((0u64..10_000, 0u64..10_000), 0..8),
    ) {
        let rule_ids: Vec<String> = active.iter().map(|s| format!("r-{s}")).collect();
        let rule_store = rule_store_with(&rule_ids);
        let mut session = SessionState::new(
            "IMSI000000000000001",
            "IMSI000000000000001-1",
            SessionConfig::default(),
            rule_store.clone(),
            TgppContext::default(),
            7,
        );
        let mut uc = SessionStateUpdateCriteria::default();
        for rule_id in &rule_ids {
            session.activate_static_rule(rule_id, RuleLifetime::always(), &mut uc);
        }
        for (i, (tx, rx)) in usage.iter().enumerate() {
            if let Some(rule_id) = rule_ids.get(i % rule_ids.len().max(1)) {
                session.add_rule_usage(rule_id, *tx, *rx, &mut uc);
            }
        }
        let marshaled = session.marshal();
        let restored = SessionState::unmarshal(&marshaled, rule_store);
        prop_assert_eq!(restored.marshal(), marshaled);
    }
}
