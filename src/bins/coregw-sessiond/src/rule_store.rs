//! Policy rule storage and indexing.
//!
//! `StaticRuleStore` is the process-wide catalog of static rules, loaded
//! once at startup and read-mostly afterwards. `DynamicRuleStore` is the
//! in-session ordered collection used for dynamic, gy-dynamic, and
//! scheduled rules. Both keep inverse indexes from charging key and
//! monitoring key back to rule ids.

use std::collections::HashMap;
use std::sync::RwLock;

use coregw_proto::{CreditKey, PolicyRule};

/// Primary map plus the two inverse indexes, kept in sync on every
/// insert and removal.
#[derive(Debug, Clone, Default)]
struct RuleIndex {
    rules_by_id: HashMap<String, PolicyRule>,
    ids_by_charging_key: HashMap<CreditKey, Vec<String>>,
    ids_by_monitoring_key: HashMap<String, Vec<String>>,
}

impl RuleIndex {
    fn insert(&mut self, rule: PolicyRule) {
        if let Some(key) = rule.charging_key() {
            self.ids_by_charging_key.entry(key).or_default().push(rule.id.clone());
        }
        if let Some(mkey) = rule.monitoring_key() {
            self.ids_by_monitoring_key
                .entry(mkey.to_string())
                .or_default()
                .push(rule.id.clone());
        }
        self.rules_by_id.insert(rule.id.clone(), rule);
    }

    fn remove(&mut self, rule_id: &str) -> Option<PolicyRule> {
        let rule = self.rules_by_id.remove(rule_id)?;
        if let Some(key) = rule.charging_key() {
            if let Some(ids) = self.ids_by_charging_key.get_mut(&key) {
                ids.retain(|id| id != rule_id);
                if ids.is_empty() {
                    self.ids_by_charging_key.remove(&key);
                }
            }
        }
        if let Some(mkey) = rule.monitoring_key() {
            if let Some(ids) = self.ids_by_monitoring_key.get_mut(mkey) {
                ids.retain(|id| id != rule_id);
                if ids.is_empty() {
                    let mkey = mkey.to_string();
                    self.ids_by_monitoring_key.remove(&mkey);
                }
            }
        }
        Some(rule)
    }

    fn get(&self, rule_id: &str) -> Option<&PolicyRule> {
        self.rules_by_id.get(rule_id)
    }

    fn charging_key_for(&self, rule_id: &str) -> Option<CreditKey> {
        self.rules_by_id.get(rule_id).and_then(|r| r.charging_key())
    }

    fn monitoring_key_for(&self, rule_id: &str) -> Option<String> {
        self.rules_by_id
            .get(rule_id)
            .and_then(|r| r.monitoring_key().map(str::to_string))
    }

    fn rule_ids_for_charging_key(&self, key: &CreditKey) -> Vec<String> {
        self.ids_by_charging_key.get(key).cloned().unwrap_or_default()
    }

    fn rule_definitions_for_charging_key(&self, key: &CreditKey) -> Vec<PolicyRule> {
        self.rule_ids_for_charging_key(key)
            .iter()
            .filter_map(|id| self.rules_by_id.get(id).cloned())
            .collect()
    }

    fn monitored_rules_count(&self) -> u32 {
        self.ids_by_monitoring_key.values().map(|ids| ids.len() as u32).sum()
    }
}

// ============================================================================
// Static rule store
// ============================================================================

/// Gateway-wide catalog of static rules, referenced by id from sessions.
/// Insertions happen during startup; afterwards the store is read-only.
#[derive(Debug, Default)]
pub struct StaticRuleStore {
    index: RwLock<RuleIndex>,
}

impl StaticRuleStore {
    pub fn new() -> Self {
        StaticRuleStore::default()
    }

    pub fn insert_rule(&self, rule: PolicyRule) {
        self.write().insert(rule);
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<PolicyRule> {
        self.read().get(rule_id).cloned()
    }

    pub fn has_rule(&self, rule_id: &str) -> bool {
        self.read().get(rule_id).is_some()
    }

    pub fn get_charging_key_for_rule_id(&self, rule_id: &str) -> Option<CreditKey> {
        self.read().charging_key_for(rule_id)
    }

    pub fn get_monitoring_key_for_rule_id(&self, rule_id: &str) -> Option<String> {
        self.read().monitoring_key_for(rule_id)
    }

    pub fn get_rule_ids_for_charging_key(&self, key: &CreditKey) -> Vec<String> {
        self.read().rule_ids_for_charging_key(key)
    }

    pub fn get_rule_definitions_for_charging_key(&self, key: &CreditKey) -> Vec<PolicyRule> {
        self.read().rule_definitions_for_charging_key(key)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RuleIndex> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RuleIndex> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Dynamic rule store
// ============================================================================

/// Ordered, per-session collection of rules carried by value.
#[derive(Debug, Clone, Default)]
pub struct DynamicRuleStore {
    order: Vec<String>,
    index: RuleIndex,
}

impl DynamicRuleStore {
    pub fn insert_rule(&mut self, rule: PolicyRule) {
        if self.index.get(&rule.id).is_some() {
            return; // uniqueness within a collection
        }
        self.order.push(rule.id.clone());
        self.index.insert(rule);
    }

    /// Remove a rule, returning it when it was installed.
    pub fn remove_rule(&mut self, rule_id: &str) -> Option<PolicyRule> {
        let rule = self.index.remove(rule_id)?;
        self.order.retain(|id| id != rule_id);
        Some(rule)
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<&PolicyRule> {
        self.index.get(rule_id)
    }

    pub fn get_rule_ids(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Rules in insertion order.
    pub fn get_rules(&self) -> Vec<PolicyRule> {
        self.order
            .iter()
            .filter_map(|id| self.index.get(id).cloned())
            .collect()
    }

    pub fn get_charging_key_for_rule_id(&self, rule_id: &str) -> Option<CreditKey> {
        self.index.charging_key_for(rule_id)
    }

    pub fn get_monitoring_key_for_rule_id(&self, rule_id: &str) -> Option<String> {
        self.index.monitoring_key_for(rule_id)
    }

    pub fn get_rule_definitions_for_charging_key(&self, key: &CreditKey) -> Vec<PolicyRule> {
        self.index.rule_definitions_for_charging_key(key)
    }

    pub fn monitored_rules_count(&self) -> u32 {
        self.index.monitored_rules_count()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coregw_proto::TrackingType;

    fn charged_rule(id: &str, rating_group: u32) -> PolicyRule {
        PolicyRule {
            id: id.to_string(),
            rating_group,
            tracking_type: TrackingType::OnlyOcs,
            ..Default::default()
        }
    }

    fn monitored_rule(id: &str, mkey: &str) -> PolicyRule {
        PolicyRule {
            id: id.to_string(),
            monitoring_key: mkey.to_string(),
            tracking_type: TrackingType::OnlyPcrf,
            ..Default::default()
        }
    }

    #[test]
    fn test_static_store_lookup_and_indexes() {
        let store = StaticRuleStore::new();
        store.insert_rule(charged_rule("rule1", 1));
        store.insert_rule(charged_rule("rule2", 1));
        store.insert_rule(monitored_rule("rule3", "mk1"));

        assert!(store.get_rule("rule1").is_some());
        assert!(store.get_rule("nope").is_none());
        assert_eq!(store.get_charging_key_for_rule_id("rule1"), Some(CreditKey::new(1)));
        assert_eq!(store.get_charging_key_for_rule_id("rule3"), None);
        assert_eq!(store.get_monitoring_key_for_rule_id("rule3"), Some("mk1".to_string()));

        let ids = store.get_rule_ids_for_charging_key(&CreditKey::new(1));
        assert_eq!(ids, vec!["rule1".to_string(), "rule2".to_string()]);
        assert!(store.get_rule_ids_for_charging_key(&CreditKey::new(9)).is_empty());
    }

    #[test]
    fn test_dynamic_store_insert_remove() {
        let mut store = DynamicRuleStore::default();
        store.insert_rule(charged_rule("dyn1", 5));
        store.insert_rule(monitored_rule("dyn2", "mk2"));
        assert_eq!(store.len(), 2);
        assert_eq!(store.get_rule_ids(), vec!["dyn1".to_string(), "dyn2".to_string()]);

        // duplicate insert is ignored
        store.insert_rule(charged_rule("dyn1", 5));
        assert_eq!(store.len(), 2);

        let removed = store.remove_rule("dyn1");
        assert_eq!(removed.map(|r| r.id), Some("dyn1".to_string()));
        assert!(store.remove_rule("dyn1").is_none());
        assert_eq!(store.get_rule_ids(), vec!["dyn2".to_string()]);
        assert!(store.get_rule_definitions_for_charging_key(&CreditKey::new(5)).is_empty());
    }

    #[test]
    fn test_monitored_rules_count() {
        let mut store = DynamicRuleStore::default();
        assert_eq!(store.monitored_rules_count(), 0);
        store.insert_rule(monitored_rule("dyn1", "mk1"));
        store.insert_rule(monitored_rule("dyn2", "mk1"));
        store.insert_rule(charged_rule("dyn3", 1));
        assert_eq!(store.monitored_rules_count(), 2);
        store.remove_rule("dyn1");
        assert_eq!(store.monitored_rules_count(), 1);
    }
}
