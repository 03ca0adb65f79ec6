//! Usage monitors.
//!
//! A monitor wraps a session credit without final-unit semantics. The
//! controller refills it like a charging grant; a monitor whose last
//! grant was empty and whose quota is gone gets deleted instead of
//! re-reported.

use coregw_proto::MonitoringLevel;

use crate::credit::SessionCredit;
use crate::stored::StoredMonitor;

/// Volume monitor at session, PCC-rule, or ADC-rule level.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Monitor {
    pub credit: SessionCredit,
    pub level: MonitoringLevel,
}

impl Monitor {
    pub fn new(level: MonitoringLevel) -> Self {
        Monitor { credit: SessionCredit::default(), level }
    }

    pub fn unmarshal(stored: &StoredMonitor) -> Self {
        Monitor { credit: SessionCredit::unmarshal(&stored.credit), level: stored.level }
    }

    pub fn marshal(&self) -> StoredMonitor {
        StoredMonitor { credit: self.credit.marshal(), level: self.level }
    }

    /// True when the monitor ran dry and the controller stopped refilling
    /// it (the last grant carried no volume).
    pub fn should_delete_monitor(&self) -> bool {
        self.credit.current_grant_contains_zero() && self.credit.is_quota_exhausted(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credit::grant_total;
    use crate::stored::SessionCreditUpdateCriteria;

    #[test]
    fn test_monitor_not_deleted_while_refillable() {
        let mut uc = SessionCreditUpdateCriteria::default();
        let mut monitor = Monitor::new(MonitoringLevel::PccRuleLevel);
        monitor.credit.receive_credit(&grant_total(1000), &mut uc);
        monitor.credit.add_used_credit(1000, 0, &mut uc);
        // exhausted, but the last grant was non-zero
        assert!(!monitor.should_delete_monitor());
    }

    #[test]
    fn test_monitor_deleted_after_zero_grant_exhaustion() {
        let mut uc = SessionCreditUpdateCriteria::default();
        let mut monitor = Monitor::new(MonitoringLevel::SessionLevel);
        monitor.credit.receive_credit(&grant_total(1000), &mut uc);
        monitor.credit.add_used_credit(500, 0, &mut uc);
        monitor.credit.receive_credit(&grant_total(0), &mut uc);
        assert!(!monitor.should_delete_monitor());
        monitor.credit.add_used_credit(500, 0, &mut uc);
        assert!(monitor.should_delete_monitor());
    }

    #[test]
    fn test_marshal_roundtrip() {
        let mut uc = SessionCreditUpdateCriteria::default();
        let mut monitor = Monitor::new(MonitoringLevel::AdcRuleLevel);
        monitor.credit.receive_credit(&grant_total(64), &mut uc);
        let restored = Monitor::unmarshal(&monitor.marshal());
        assert_eq!(monitor, restored);
    }
}
