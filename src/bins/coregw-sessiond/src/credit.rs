//! Per-credit volume accounting.
//!
//! A `SessionCredit` is the counter bundle behind every charging grant and
//! usage monitor. Counters are organized as buckets that are incremented
//! independently and only ever reset as part of the reporting cycle:
//!
//! - `Used*` accumulates traffic reported by the user plane.
//! - `Allowed*` accumulates granted volume from the controller.
//! - `Reporting*` holds usage that is in transit to the controller.
//! - `Reported*` holds usage the controller has acknowledged.
//! - `AllowedFloor*` saves the pre-grant allowance, so the volume of the
//!   most recent grant is always `Allowed - AllowedFloor`.

use coregw_proto::{CreditLimitType, GrantedUnits};
use serde::{Deserialize, Serialize};

use crate::stored::{SessionCreditUpdateCriteria, StoredSessionCredit};

/// Fraction of a grant that must be consumed before a partial usage
/// report is sent upstream.
pub const USAGE_REPORTING_THRESHOLD: f64 = 0.8;

/// Number of counter buckets per credit.
pub const BUCKET_COUNT: usize = 12;

/// Counter buckets tracked per credit. Each value is a byte volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bucket {
    UsedTx = 0,
    UsedRx = 1,
    AllowedTotal = 2,
    AllowedTx = 3,
    AllowedRx = 4,
    ReportingTx = 5,
    ReportingRx = 6,
    ReportedTx = 7,
    ReportedRx = 8,
    AllowedFloorTotal = 9,
    AllowedFloorTx = 10,
    AllowedFloorRx = 11,
}

impl Bucket {
    pub const ALL: [Bucket; BUCKET_COUNT] = [
        Bucket::UsedTx,
        Bucket::UsedRx,
        Bucket::AllowedTotal,
        Bucket::AllowedTx,
        Bucket::AllowedRx,
        Bucket::ReportingTx,
        Bucket::ReportingRx,
        Bucket::ReportedTx,
        Bucket::ReportedRx,
        Bucket::AllowedFloorTotal,
        Bucket::AllowedFloorTx,
        Bucket::AllowedFloorRx,
    ];
}

/// Which granted dimensions participate in exhaustion checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GrantTrackingType {
    #[default]
    TrackingUnset,
    TotalOnly,
    TxOnly,
    RxOnly,
    TxAndRx,
    AllTotalTxRx,
}

/// A tx/rx byte pair produced for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    pub bytes_tx: u64,
    pub bytes_rx: u64,
}

/// Counter bundle for one charging or monitoring credit.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCredit {
    reporting: bool,
    credit_limit_type: CreditLimitType,
    buckets: [u64; BUCKET_COUNT],
    grant_tracking_type: GrantTrackingType,
    received_granted_units: GrantedUnits,
}

impl Default for SessionCredit {
    fn default() -> Self {
        SessionCredit::new(CreditLimitType::Finite)
    }
}

impl SessionCredit {
    pub fn new(credit_limit_type: CreditLimitType) -> Self {
        SessionCredit {
            reporting: false,
            credit_limit_type,
            buckets: [0; BUCKET_COUNT],
            grant_tracking_type: GrantTrackingType::TrackingUnset,
            received_granted_units: GrantedUnits::default(),
        }
    }

    pub fn unmarshal(stored: &StoredSessionCredit) -> Self {
        SessionCredit {
            reporting: stored.reporting,
            credit_limit_type: stored.credit_limit_type,
            buckets: stored.buckets,
            grant_tracking_type: stored.grant_tracking_type,
            received_granted_units: stored.received_granted_units,
        }
    }

    pub fn marshal(&self) -> StoredSessionCredit {
        StoredSessionCredit {
            reporting: self.reporting,
            credit_limit_type: self.credit_limit_type,
            buckets: self.buckets,
            grant_tracking_type: self.grant_tracking_type,
            received_granted_units: self.received_granted_units,
        }
    }

    /// Snapshot of the credit-owned fields, with zeroed deltas, for use as
    /// the starting point of a per-credit sub-journal.
    pub fn get_update_criteria(&self) -> SessionCreditUpdateCriteria {
        SessionCreditUpdateCriteria {
            reporting: self.reporting,
            grant_tracking_type: self.grant_tracking_type,
            received_granted_units: self.received_granted_units,
            ..Default::default()
        }
    }

    pub fn get_credit(&self, bucket: Bucket) -> u64 {
        self.buckets[bucket as usize]
    }

    pub fn is_reporting(&self) -> bool {
        self.reporting
    }

    pub fn credit_limit_type(&self) -> CreditLimitType {
        self.credit_limit_type
    }

    pub fn grant_tracking_type(&self) -> GrantTrackingType {
        self.grant_tracking_type
    }

    pub fn received_granted_units(&self) -> &GrantedUnits {
        &self.received_granted_units
    }

    /// Accumulate traffic reported by the user plane.
    pub fn add_used_credit(
        &mut self,
        used_tx: u64,
        used_rx: u64,
        uc: &mut SessionCreditUpdateCriteria,
    ) {
        self.add_credit(used_tx, Bucket::UsedTx, uc);
        self.add_credit(used_rx, Bucket::UsedRx, uc);
    }

    /// Additive bucket update, recorded into the sub-journal.
    pub fn add_credit(&mut self, amount: u64, bucket: Bucket, uc: &mut SessionCreditUpdateCriteria) {
        self.buckets[bucket as usize] = self.buckets[bucket as usize].saturating_add(amount);
        uc.bucket_deltas[bucket as usize] =
            uc.bucket_deltas[bucket as usize].saturating_add(amount);
    }

    /// Apply a fresh grant from the controller.
    ///
    /// An arriving grant acknowledges the report that solicited it, so any
    /// in-flight `Reporting*` volume is settled into `Reported*` first.
    pub fn receive_credit(&mut self, gsu: &GrantedUnits, uc: &mut SessionCreditUpdateCriteria) {
        let acked_tx = self.buckets[Bucket::ReportingTx as usize];
        let acked_rx = self.buckets[Bucket::ReportingRx as usize];
        self.add_credit(acked_tx, Bucket::ReportedTx, uc);
        self.add_credit(acked_rx, Bucket::ReportedRx, uc);
        self.reset_reporting_credit(uc);

        self.grant_tracking_type = Self::determine_grant_tracking_type(gsu);
        uc.grant_tracking_type = self.grant_tracking_type;

        let dims = [
            (Bucket::AllowedTotal, Bucket::AllowedFloorTotal, gsu.total),
            (Bucket::AllowedTx, Bucket::AllowedFloorTx, gsu.tx),
            (Bucket::AllowedRx, Bucket::AllowedFloorRx, gsu.rx),
        ];
        for (allowed, floor, unit) in dims {
            // raise the floor to the pre-grant allowance
            let floor_delta = self.buckets[allowed as usize]
                .saturating_sub(self.buckets[floor as usize]);
            self.add_credit(floor_delta, floor, uc);
            if unit.is_valid {
                self.add_credit(unit.volume, allowed, uc);
            }
        }

        self.received_granted_units = *gsu;
        uc.received_granted_units = *gsu;
        log::debug!(
            "Received grant total={}/{} tx={}/{} rx={}/{} tracking={:?}",
            gsu.total.is_valid,
            gsu.total.volume,
            gsu.tx.is_valid,
            gsu.tx.volume,
            gsu.rx.is_valid,
            gsu.rx.volume,
            self.grant_tracking_type,
        );
    }

    /// A failed update rolls the in-flight report back into `Used*` so the
    /// bytes are retried with the next report.
    pub fn mark_failure(&mut self, result_code: u32, uc: &mut SessionCreditUpdateCriteria) {
        log::warn!("Credit update failed with result code {result_code}, rolling back report");
        self.reset_reporting_credit(uc);
    }

    pub fn reset_reporting_credit(&mut self, uc: &mut SessionCreditUpdateCriteria) {
        self.buckets[Bucket::ReportingTx as usize] = 0;
        self.buckets[Bucket::ReportingRx as usize] = 0;
        self.reporting = false;
        uc.reporting = false;
    }

    fn unreported_usage(&self) -> Usage {
        let tx = self.buckets[Bucket::UsedTx as usize]
            .saturating_sub(self.buckets[Bucket::ReportedTx as usize])
            .saturating_sub(self.buckets[Bucket::ReportingTx as usize]);
        let rx = self.buckets[Bucket::UsedRx as usize]
            .saturating_sub(self.buckets[Bucket::ReportedRx as usize])
            .saturating_sub(self.buckets[Bucket::ReportingRx as usize]);
        Usage { bytes_tx: tx, bytes_rx: rx }
    }

    /// Move the current unreported delta into the reporting buckets and
    /// return it. At most one reporting cycle is open at a time.
    pub fn get_usage_for_reporting(&mut self, uc: &mut SessionCreditUpdateCriteria) -> Usage {
        let usage = self.unreported_usage();
        // in-transit volume is not journaled; it settles into Reported
        // or rolls back to zero
        self.buckets[Bucket::ReportingTx as usize] += usage.bytes_tx;
        self.buckets[Bucket::ReportingRx as usize] += usage.bytes_rx;
        self.reporting = true;
        uc.reporting = true;
        usage
    }

    /// Everything not yet acknowledged, for a final (terminating) report.
    pub fn get_all_unreported_usage_for_reporting(
        &mut self,
        uc: &mut SessionCreditUpdateCriteria,
    ) -> Usage {
        self.get_usage_for_reporting(uc)
    }

    /// True when any participating dimension has consumed at least
    /// `threshold` of its allowance. A threshold of 1.0 checks hard
    /// exhaustion.
    ///
    /// If the most recent grant carried zero volume for every dimension,
    /// partial-threshold checks are deferred until hard exhaustion, so the
    /// engine does not loop sending empty reports.
    pub fn is_quota_exhausted(&self, threshold: f64) -> bool {
        let dims = match self.participating_dims() {
            Some(dims) => dims,
            None => return false,
        };
        let exhausted = dims
            .iter()
            .any(|&(allowed, used)| Self::dim_exhausted(allowed, used, threshold));
        if !exhausted {
            return false;
        }
        if threshold < 1.0 && self.current_grant_contains_zero() {
            return dims.iter().any(|&(allowed, used)| used >= allowed);
        }
        true
    }

    fn dim_exhausted(allowed: u64, used: u64, threshold: f64) -> bool {
        if used >= allowed {
            return true;
        }
        (used as f64) >= (allowed as f64) * threshold
    }

    /// (allowed, used) pairs for the tracked dimensions, or None when no
    /// grant has established a tracking type yet.
    fn participating_dims(&self) -> Option<Vec<(u64, u64)>> {
        let allowed_total = self.buckets[Bucket::AllowedTotal as usize];
        let allowed_tx = self.buckets[Bucket::AllowedTx as usize];
        let allowed_rx = self.buckets[Bucket::AllowedRx as usize];
        let used_tx = self.buckets[Bucket::UsedTx as usize];
        let used_rx = self.buckets[Bucket::UsedRx as usize];
        let used_total = used_tx.saturating_add(used_rx);
        match self.grant_tracking_type {
            GrantTrackingType::TrackingUnset => None,
            GrantTrackingType::TotalOnly => Some(vec![(allowed_total, used_total)]),
            GrantTrackingType::TxOnly => Some(vec![(allowed_tx, used_tx)]),
            GrantTrackingType::RxOnly => Some(vec![(allowed_rx, used_rx)]),
            GrantTrackingType::TxAndRx => Some(vec![(allowed_tx, used_tx), (allowed_rx, used_rx)]),
            GrantTrackingType::AllTotalTxRx => Some(vec![
                (allowed_total, used_total),
                (allowed_tx, used_tx),
                (allowed_rx, used_rx),
            ]),
        }
    }

    /// True when the most recent grant carried no volume at all.
    pub fn current_grant_contains_zero(&self) -> bool {
        let gsu = &self.received_granted_units;
        let units = [gsu.total, gsu.tx, gsu.rx];
        units.iter().filter(|u| u.is_valid).all(|u| u.volume == 0)
    }

    /// Merge-path setter for the reporting flag.
    pub fn set_reporting(&mut self, reporting: bool) {
        self.reporting = reporting;
    }

    pub fn set_grant_tracking_type(
        &mut self,
        tracking: GrantTrackingType,
        uc: &mut SessionCreditUpdateCriteria,
    ) {
        self.grant_tracking_type = tracking;
        uc.grant_tracking_type = tracking;
    }

    pub fn set_received_granted_units(
        &mut self,
        gsu: GrantedUnits,
        uc: &mut SessionCreditUpdateCriteria,
    ) {
        self.received_granted_units = gsu;
        uc.received_granted_units = gsu;
    }

    fn determine_grant_tracking_type(gsu: &GrantedUnits) -> GrantTrackingType {
        let total = gsu.total.is_valid;
        let tx = gsu.tx.is_valid;
        let rx = gsu.rx.is_valid;
        match (total, tx, rx) {
            (true, true, true) => GrantTrackingType::AllTotalTxRx,
            (true, _, _) => GrantTrackingType::TotalOnly,
            (false, true, true) => GrantTrackingType::TxAndRx,
            (false, true, false) => GrantTrackingType::TxOnly,
            (false, false, true) => GrantTrackingType::RxOnly,
            (false, false, false) => {
                log::debug!("Grant with no valid units, tracking type left unset");
                GrantTrackingType::TrackingUnset
            }
        }
    }
}

/// Build a total-volume grant. Test and bootstrap helper.
pub fn grant_total(volume: u64) -> GrantedUnits {
    GrantedUnits {
        total: coregw_proto::CreditUnit { is_valid: true, volume },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coregw_proto::CreditUnit;

    fn scratch() -> SessionCreditUpdateCriteria {
        SessionCreditUpdateCriteria::default()
    }

    #[test]
    fn test_grant_tracking_type_determination() {
        let mut credit = SessionCredit::default();
        credit.receive_credit(&grant_total(100), &mut scratch());
        assert_eq!(credit.grant_tracking_type(), GrantTrackingType::TotalOnly);

        let gsu = GrantedUnits {
            total: CreditUnit { is_valid: true, volume: 100 },
            tx: CreditUnit { is_valid: true, volume: 40 },
            rx: CreditUnit { is_valid: true, volume: 60 },
        };
        credit.receive_credit(&gsu, &mut scratch());
        assert_eq!(credit.grant_tracking_type(), GrantTrackingType::AllTotalTxRx);

        let gsu = GrantedUnits {
            tx: CreditUnit { is_valid: true, volume: 40 },
            ..Default::default()
        };
        credit.receive_credit(&gsu, &mut scratch());
        assert_eq!(credit.grant_tracking_type(), GrantTrackingType::TxOnly);
    }

    #[test]
    fn test_receive_credit_tracks_allowed_and_floor() {
        let mut credit = SessionCredit::default();
        credit.receive_credit(&grant_total(1000), &mut scratch());
        assert_eq!(credit.get_credit(Bucket::AllowedTotal), 1000);
        assert_eq!(credit.get_credit(Bucket::AllowedFloorTotal), 0);

        credit.receive_credit(&grant_total(1000), &mut scratch());
        assert_eq!(credit.get_credit(Bucket::AllowedTotal), 2000);
        assert_eq!(credit.get_credit(Bucket::AllowedFloorTotal), 1000);
    }

    #[test]
    fn test_reporting_cycle() {
        let mut credit = SessionCredit::default();
        let mut uc = scratch();
        credit.receive_credit(&grant_total(1000), &mut uc);
        credit.add_used_credit(300, 500, &mut uc);

        let usage = credit.get_usage_for_reporting(&mut uc);
        assert_eq!(usage, Usage { bytes_tx: 300, bytes_rx: 500 });
        assert!(credit.is_reporting());
        assert_eq!(credit.get_credit(Bucket::ReportingTx), 300);

        // the next grant acknowledges the in-flight report
        credit.receive_credit(&grant_total(1000), &mut uc);
        assert!(!credit.is_reporting());
        assert_eq!(credit.get_credit(Bucket::ReportingTx), 0);
        assert_eq!(credit.get_credit(Bucket::ReportedTx), 300);
        assert_eq!(credit.get_credit(Bucket::ReportedRx), 500);
    }

    #[test]
    fn test_failure_rolls_back_reporting() {
        let mut credit = SessionCredit::default();
        let mut uc = scratch();
        credit.receive_credit(&grant_total(1000), &mut uc);
        credit.add_used_credit(100, 100, &mut uc);
        let usage = credit.get_usage_for_reporting(&mut uc);
        assert_eq!(usage.bytes_tx + usage.bytes_rx, 200);

        credit.mark_failure(5001, &mut uc);
        assert!(!credit.is_reporting());
        assert_eq!(credit.get_credit(Bucket::ReportedTx), 0);
        // the bytes stay in Used and are picked up by the retry
        let retry = credit.get_usage_for_reporting(&mut uc);
        assert_eq!(retry, Usage { bytes_tx: 100, bytes_rx: 100 });
    }

    #[test]
    fn test_quota_exhaustion_threshold_boundary() {
        let mut credit = SessionCredit::default();
        let mut uc = scratch();
        credit.receive_credit(&grant_total(1000), &mut uc);

        credit.add_used_credit(500, 299, &mut uc);
        assert!(!credit.is_quota_exhausted(0.8));

        // 800 of 1000 used: exactly at the reporting threshold
        credit.add_used_credit(0, 1, &mut uc);
        assert!(credit.is_quota_exhausted(0.8));
        assert!(!credit.is_quota_exhausted(1.0));

        credit.add_used_credit(200, 0, &mut uc);
        assert!(credit.is_quota_exhausted(1.0));
    }

    #[test]
    fn test_zero_grant_defers_reporting_until_hard_exhaustion() {
        let mut credit = SessionCredit::default();
        let mut uc = scratch();
        credit.receive_credit(&grant_total(1000), &mut uc);
        credit.add_used_credit(600, 300, &mut uc);

        // controller answers with a zero grant
        credit.receive_credit(&grant_total(0), &mut uc);
        assert!(credit.current_grant_contains_zero());
        assert!(!credit.is_quota_exhausted(0.8));

        // only hard exhaustion triggers the last report
        credit.add_used_credit(100, 0, &mut uc);
        assert!(credit.is_quota_exhausted(0.8));
        assert!(credit.is_quota_exhausted(1.0));
    }

    #[test]
    fn test_unset_tracking_is_never_exhausted() {
        let credit = SessionCredit::default();
        assert!(!credit.is_quota_exhausted(0.8));
        assert!(!credit.is_quota_exhausted(1.0));
    }

    #[test]
    fn test_tx_and_rx_tracking_exhausts_on_either() {
        let mut credit = SessionCredit::default();
        let mut uc = scratch();
        let gsu = GrantedUnits {
            tx: CreditUnit { is_valid: true, volume: 100 },
            rx: CreditUnit { is_valid: true, volume: 1000 },
            ..Default::default()
        };
        credit.receive_credit(&gsu, &mut uc);
        credit.add_used_credit(90, 10, &mut uc);
        assert!(credit.is_quota_exhausted(0.8));
        assert!(!credit.is_quota_exhausted(1.0));
    }

    #[test]
    fn test_marshal_roundtrip() {
        let mut credit = SessionCredit::new(CreditLimitType::InfiniteMetered);
        let mut uc = scratch();
        credit.receive_credit(&grant_total(1000), &mut uc);
        credit.add_used_credit(12, 34, &mut uc);
        let restored = SessionCredit::unmarshal(&credit.marshal());
        assert_eq!(credit, restored);
    }

    #[test]
    fn test_usage_conservation() {
        // Reported + Reporting + unreported == Used, at every step
        let mut credit = SessionCredit::default();
        let mut uc = scratch();
        credit.receive_credit(&grant_total(10_000), &mut uc);
        let conserved = |c: &SessionCredit| {
            let used = c.get_credit(Bucket::UsedTx);
            let accounted = c.get_credit(Bucket::ReportedTx)
                + c.get_credit(Bucket::ReportingTx)
                + c.unreported_usage().bytes_tx;
            used == accounted
        };
        credit.add_used_credit(100, 0, &mut uc);
        assert!(conserved(&credit));
        credit.get_usage_for_reporting(&mut uc);
        assert!(conserved(&credit));
        credit.add_used_credit(50, 0, &mut uc);
        assert!(conserved(&credit));
        credit.receive_credit(&grant_total(1000), &mut uc);
        assert!(conserved(&credit));
    }
}
