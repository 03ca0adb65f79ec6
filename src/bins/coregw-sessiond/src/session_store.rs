//! Durable session storage.
//!
//! Sessions are persisted as serialized [`StoredSessionState`] records
//! keyed by `(imsi, session_id)`, each carrying a version that bumps on
//! every write. Readers get fresh `SessionState` copies; writers hand
//! back the update-criteria journals their operations produced, and the
//! store merge-applies them onto the stored records. A merge conflict
//! fails the whole commit so the caller can reload and retry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::SessionError;
use crate::rule_store::StaticRuleStore;
use crate::session_state::SessionState;
use crate::stored::{SessionStateUpdateCriteria, StoredSessionState};

/// All loaded sessions of the touched subscribers, keyed by IMSI.
pub type SessionMap = HashMap<String, Vec<SessionState>>;

/// Journals per subscriber and session, produced by one transaction.
pub type SessionUpdate = HashMap<String, HashMap<String, SessionStateUpdateCriteria>>;

#[derive(Debug, Clone)]
struct StoredRecord {
    session_id: String,
    serialized: String,
    version: u64,
}

/// In-memory durable store with per-session versioning.
#[derive(Debug, Default)]
pub struct SessionStore {
    rule_store: Arc<StaticRuleStore>,
    records: Mutex<HashMap<String, Vec<StoredRecord>>>,
}

impl SessionStore {
    pub fn new(rule_store: Arc<StaticRuleStore>) -> Self {
        SessionStore { rule_store, records: Mutex::new(HashMap::new()) }
    }

    /// Seed one journal-per-session for every session in the map.
    pub fn get_default_session_update(session_map: &SessionMap) -> SessionUpdate {
        let mut update = SessionUpdate::new();
        for (imsi, sessions) in session_map {
            let by_session = update.entry(imsi.clone()).or_default();
            for session in sessions {
                by_session
                    .entry(session.get_session_id().to_string())
                    .or_default();
            }
        }
        update
    }

    /// Persist a newly created session. Fails on duplicate session id.
    pub fn create_session(&self, session: &SessionState) -> bool {
        let stored = session.marshal();
        let serialized = match serde_json::to_string(&stored) {
            Ok(serialized) => serialized,
            Err(e) => {
                log::error!("Failed to serialize session {}: {e}", stored.session_id);
                return false;
            }
        };
        let mut records = self.lock();
        let subscriber_records = records.entry(stored.imsi.clone()).or_default();
        if subscriber_records.iter().any(|r| r.session_id == stored.session_id) {
            log::error!("Session {} already exists in store", stored.session_id);
            return false;
        }
        subscriber_records.push(StoredRecord {
            session_id: stored.session_id.clone(),
            serialized,
            version: 1,
        });
        true
    }

    /// Load fresh session copies for the given subscribers.
    pub fn read_sessions(&self, imsis: &HashSet<String>) -> SessionMap {
        let records = self.lock();
        let mut session_map = SessionMap::new();
        for imsi in imsis {
            let Some(subscriber_records) = records.get(imsi) else { continue };
            let sessions = subscriber_records
                .iter()
                .filter_map(|record| self.deserialize(record))
                .collect();
            session_map.insert(imsi.clone(), sessions);
        }
        session_map
    }

    /// Same as [`read_sessions`](Self::read_sessions); deletion commits go
    /// through the regular update path.
    pub fn read_sessions_for_deletion(&self, imsis: &HashSet<String>) -> SessionMap {
        self.read_sessions(imsis)
    }

    /// Load every stored session.
    pub fn read_all_sessions(&self) -> SessionMap {
        let records = self.lock();
        let mut session_map = SessionMap::new();
        for (imsi, subscriber_records) in records.iter() {
            let sessions: Vec<SessionState> = subscriber_records
                .iter()
                .filter_map(|record| self.deserialize(record))
                .collect();
            if !sessions.is_empty() {
                session_map.insert(imsi.clone(), sessions);
            }
        }
        session_map
    }

    /// Merge-apply the journals onto the stored records. Ended sessions
    /// are deleted; everything else is replayed, re-serialized, and its
    /// version bumped. Returns false (committing nothing further) on the
    /// first merge conflict.
    pub fn update_sessions(&self, session_update: SessionUpdate) -> bool {
        let mut records = self.lock();
        for (imsi, by_session) in session_update {
            for (session_id, uc) in by_session {
                if uc.is_empty() {
                    continue;
                }
                let Some(subscriber_records) = records.get_mut(&imsi) else {
                    log::error!("Cannot update session {session_id}: subscriber {imsi} not found");
                    return false;
                };
                if uc.is_session_ended {
                    subscriber_records.retain(|r| r.session_id != session_id);
                    if subscriber_records.is_empty() {
                        records.remove(&imsi);
                    }
                    log::debug!("Session {session_id} removed from store");
                    continue;
                }
                let Some(record) =
                    subscriber_records.iter_mut().find(|r| r.session_id == session_id)
                else {
                    log::error!("Cannot update session {session_id}: not found");
                    return false;
                };
                let Some(mut session) = self.deserialize(record) else {
                    return false;
                };
                if !session.apply_update_criteria(&uc) {
                    log::error!("{}, aborting commit", SessionError::MergeConflict(session_id));
                    return false;
                }
                match serde_json::to_string(&session.marshal()) {
                    Ok(serialized) => {
                        record.serialized = serialized;
                        record.version += 1;
                    }
                    Err(e) => {
                        log::error!("Failed to serialize session {session_id}: {e}");
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Current version of one stored session.
    pub fn get_version(&self, imsi: &str, session_id: &str) -> Option<u64> {
        self.lock()
            .get(imsi)?
            .iter()
            .find(|r| r.session_id == session_id)
            .map(|r| r.version)
    }

    fn deserialize(&self, record: &StoredRecord) -> Option<SessionState> {
        match serde_json::from_str::<StoredSessionState>(&record.serialized) {
            Ok(stored) => Some(SessionState::unmarshal(&stored, self.rule_store.clone())),
            Err(e) => {
                log::error!("Corrupt stored session {}: {e}", record.session_id);
                None
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<StoredRecord>>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coregw_proto::{SessionConfig, TgppContext};

    use crate::stored::{RuleLifetime, SessionFsmState};

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(StaticRuleStore::new()))
    }

    fn session(store: &SessionStore, imsi: &str, session_id: &str) -> SessionState {
        SessionState::new(
            imsi,
            session_id,
            SessionConfig::default(),
            store.rule_store.clone(),
            TgppContext::default(),
            0,
        )
    }

    #[test]
    fn test_create_read_roundtrip() {
        let store = store();
        let session = session(&store, "IMSI1", "IMSI1-1");
        assert!(store.create_session(&session));
        assert!(!store.create_session(&session)); // duplicate refused

        let imsis: HashSet<String> = ["IMSI1".to_string()].into();
        let session_map = store.read_sessions(&imsis);
        assert_eq!(session_map["IMSI1"].len(), 1);
        assert_eq!(session_map["IMSI1"][0].get_session_id(), "IMSI1-1");
        assert_eq!(store.get_version("IMSI1", "IMSI1-1"), Some(1));
    }

    #[test]
    fn test_update_bumps_version_and_persists() {
        let store = store();
        store.rule_store.insert_rule(coregw_proto::PolicyRule {
            id: "rule1".to_string(),
            ..Default::default()
        });
        let mut session = session(&store, "IMSI1", "IMSI1-1");
        assert!(store.create_session(&session));

        let mut uc = SessionStateUpdateCriteria::default();
        session.activate_static_rule("rule1", RuleLifetime::always(), &mut uc);
        let mut session_update = SessionUpdate::new();
        session_update
            .entry("IMSI1".to_string())
            .or_default()
            .insert("IMSI1-1".to_string(), uc);
        assert!(store.update_sessions(session_update));
        assert_eq!(store.get_version("IMSI1", "IMSI1-1"), Some(2));

        let imsis: HashSet<String> = ["IMSI1".to_string()].into();
        let reloaded = store.read_sessions(&imsis);
        assert!(reloaded["IMSI1"][0].is_static_rule_installed("rule1"));
    }

    #[test]
    fn test_merge_conflict_aborts_commit() {
        let store = store();
        let session = session(&store, "IMSI1", "IMSI1-1");
        assert!(store.create_session(&session));

        // no lifetime recorded: the merge must refuse
        let mut uc = SessionStateUpdateCriteria::default();
        uc.static_rules_to_install.insert("rule1".to_string());
        let mut session_update = SessionUpdate::new();
        session_update
            .entry("IMSI1".to_string())
            .or_default()
            .insert("IMSI1-1".to_string(), uc);
        assert!(!store.update_sessions(session_update));
        assert_eq!(store.get_version("IMSI1", "IMSI1-1"), Some(1));
    }

    #[test]
    fn test_session_ended_removes_record() {
        let store = store();
        let mut session = session(&store, "IMSI1", "IMSI1-1");
        assert!(store.create_session(&session));

        let mut uc = SessionStateUpdateCriteria::default();
        session.set_fsm_state(SessionFsmState::Released, &mut uc);
        session.set_fsm_state(SessionFsmState::Terminated, &mut uc);
        uc.is_session_ended = true;
        let mut session_update = SessionUpdate::new();
        session_update
            .entry("IMSI1".to_string())
            .or_default()
            .insert("IMSI1-1".to_string(), uc);
        assert!(store.update_sessions(session_update));
        assert!(store.read_all_sessions().is_empty());
    }

    #[test]
    fn test_empty_update_is_noop() {
        let store = store();
        let session = session(&store, "IMSI1", "IMSI1-1");
        assert!(store.create_session(&session));
        let imsis: HashSet<String> = ["IMSI1".to_string()].into();
        let session_map = store.read_sessions(&imsis);
        let session_update = SessionStore::get_default_session_update(&session_map);
        assert!(store.update_sessions(session_update));
        assert_eq!(store.get_version("IMSI1", "IMSI1-1"), Some(1));
    }
}
