//! Profile store
//!
//! Owns the rule library and the profiles that reference it by name, and
//! publishes the active profile's resolved rules as an immutable [`RuleSet`].
//!
//! Mutations are serialized by a single async mutex that is held across
//! persistence, so the backend always sees changes in the same order as the
//! in-memory state. Each mutation is persisted as one [`Changeset`] and
//! applied in memory only after the backend accepted it; a storage failure
//! leaves both the backend and the store unchanged.
//!
//! Readers never take the mutex: [`ProfileStore::active_rule_set`] loads the
//! current snapshot pointer, which is swapped whole whenever the active
//! profile or any rule it references changes.

use crate::core::error::{Error, Result, StorageError};
use crate::core::firewall::{Action, ConnectionEvent, MAX_RULES, Profile, Rule};
use crate::core::matcher::{RuleSet, learned_rule};
use crate::core::retry::{RetryPolicy, with_retry};
use crate::core::storage::{Changeset, MemoryProfileBackend, PersistedState, ProfileBackend};
use crate::oplog::OpLog;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;

/// Name of the profile created on first start.
pub const DEFAULT_PROFILE_NAME: &str = "Default";

/// Portable form of a profile: the profile plus every rule it references
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileExport {
    pub profile: Profile,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Default)]
struct State {
    rules: BTreeMap<String, Rule>,
    profiles: BTreeMap<String, Profile>,
    active: Option<String>,
    version: u64,
}

impl State {
    fn from_persisted(persisted: PersistedState) -> Self {
        let mut state = State::default();
        for rule in persisted.rules {
            if let Err(e) = rule.validate() {
                tracing::warn!("Skipping stored rule '{}': {}", rule.name, e);
                continue;
            }
            state.rules.insert(rule.name.clone(), rule);
        }

        for mut profile in persisted.profiles {
            let mut seen = HashSet::new();
            profile.rules.retain(|name| {
                if !state.rules.contains_key(name) {
                    tracing::warn!(
                        "Profile '{}' references unknown rule '{}', dropping reference",
                        profile.name,
                        name
                    );
                    return false;
                }
                seen.insert(name.clone())
            });
            profile.active = false;
            state.profiles.insert(profile.name.clone(), profile);
        }

        state.active = persisted.active.filter(|name| {
            let known = state.profiles.contains_key(name);
            if !known {
                tracing::warn!("Stored active profile '{name}' does not exist, ignoring");
            }
            known
        });
        state
    }

    fn profile(&self, name: &str) -> Result<&Profile> {
        self.profiles
            .get(name)
            .ok_or_else(|| Error::ProfileNotFound(name.to_string()))
    }

    fn is_active(&self, name: &str) -> bool {
        self.active.as_deref() == Some(name)
    }

    fn active_references(&self, rule: &str) -> bool {
        self.active
            .as_ref()
            .and_then(|name| self.profiles.get(name))
            .is_some_and(|p| p.references(rule))
    }

    fn listed(&self, profile: &Profile) -> Profile {
        let mut profile = profile.clone();
        profile.active = self.is_active(&profile.name);
        profile
    }
}

pub struct ProfileStore {
    snapshot: ArcSwap<RuleSet>,
    state: tokio::sync::Mutex<State>,
    backend: Arc<dyn ProfileBackend>,
    retry: RetryPolicy,
    oplog: Arc<OpLog>,
}

impl ProfileStore {
    /// Loads persisted rules and profiles from `backend`.
    ///
    /// Profile references to rules that no longer exist are dropped with a
    /// warning rather than failing the load.
    pub async fn open(
        backend: Arc<dyn ProfileBackend>,
        retry: RetryPolicy,
        oplog: Arc<OpLog>,
    ) -> Result<Self> {
        let persisted = with_retry("profile store load", retry, || backend.load()).await?;
        let state = State::from_persisted(persisted);
        tracing::info!(
            "Loaded {} profile(s) and {} rule(s), active: {}",
            state.profiles.len(),
            state.rules.len(),
            state.active.as_deref().unwrap_or("none")
        );

        let store = Self {
            snapshot: ArcSwap::from_pointee(RuleSet::empty()),
            state: tokio::sync::Mutex::new(state),
            backend,
            retry,
            oplog,
        };
        {
            let mut state = store.state.lock().await;
            store.publish(&mut state);
        }
        Ok(store)
    }

    /// Empty store that keeps everything in memory.
    pub fn in_memory() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RuleSet::empty()),
            state: tokio::sync::Mutex::new(State::default()),
            backend: Arc::new(MemoryProfileBackend::new()),
            retry: RetryPolicy::default(),
            oplog: Arc::new(OpLog::default()),
        }
    }

    /// Current rule set of the active profile. Never blocks on writers.
    pub fn active_rule_set(&self) -> Arc<RuleSet> {
        self.snapshot.load_full()
    }

    pub fn active_profile_name(&self) -> Option<String> {
        self.snapshot.load().profile().map(str::to_string)
    }

    fn publish(&self, state: &mut State) {
        state.version += 1;
        let set = match state.active.as_ref().and_then(|n| state.profiles.get(n)) {
            Some(profile) => RuleSet::compile(
                profile.name.clone(),
                state.version,
                profile
                    .rules
                    .iter()
                    .filter_map(|name| state.rules.get(name).cloned()),
            ),
            None => RuleSet::empty(),
        };
        tracing::debug!(
            "Published rule set v{} for profile {:?} ({} rules)",
            set.version(),
            set.profile(),
            set.len()
        );
        self.snapshot.store(Arc::new(set));
    }

    async fn persist<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StorageError>>,
    {
        match with_retry(operation, self.retry, op).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.oplog
                    .error(
                        "storage-error",
                        format!("Failed to {operation}"),
                        serde_json::json!({ "operation": operation, "error": e.to_string() }),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn commit(&self, operation: &str, changes: Changeset) -> Result<()> {
        self.persist(operation, || self.backend.commit(&changes)).await
    }

    /// Creates the default profile and activates it when the store is empty.
    pub async fn ensure_default(&self) -> Result<()> {
        let has_profiles = !self.state.lock().await.profiles.is_empty();
        if has_profiles {
            return Ok(());
        }
        self.create_profile(DEFAULT_PROFILE_NAME, "Created on first start")
            .await?;
        self.set_active(DEFAULT_PROFILE_NAME).await
    }

    pub async fn create_profile(&self, name: &str, description: &str) -> Result<Profile> {
        let profile = Profile::new(name, description);
        profile.validate()?;

        let mut state = self.state.lock().await;
        if state.profiles.contains_key(name) {
            return Err(Error::DuplicateProfile(name.to_string()));
        }
        self.commit("save profile", Changeset::new().save_profile(profile.clone()))
            .await?;
        state.profiles.insert(profile.name.clone(), profile.clone());
        drop(state);

        self.oplog
            .info(
                "profile-create",
                format!("Created profile '{name}'"),
                serde_json::json!({ "profile": name }),
            )
            .await;
        Ok(profile)
    }

    /// Deletes a profile. The active profile cannot be deleted.
    pub async fn delete_profile(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.profile(name)?;
        if state.is_active(name) {
            return Err(Error::ActiveProfile(name.to_string()));
        }
        self.commit("delete profile", Changeset::new().delete_profile(name))
            .await?;
        state.profiles.remove(name);
        drop(state);

        self.oplog
            .info(
                "profile-delete",
                format!("Deleted profile '{name}'"),
                serde_json::json!({ "profile": name }),
            )
            .await;
        Ok(())
    }

    /// Makes `name` the only active profile and publishes its rule set.
    pub async fn set_active(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.profile(name)?;
        let previous = state.active.clone();
        if previous.as_deref() == Some(name) {
            return Ok(());
        }
        self.persist("save active profile", || {
            self.backend.save_active(Some(name))
        })
        .await?;
        state.active = Some(name.to_string());
        self.publish(&mut state);
        drop(state);

        self.oplog
            .info(
                "profile-activate",
                format!("Activated profile '{name}'"),
                serde_json::json!({ "profile": name, "previous": previous }),
            )
            .await;
        Ok(())
    }

    /// Adds `rule` to the library and appends a reference to it in `profile`.
    ///
    /// Fails if the profile already references a rule of the same name, or
    /// if the library holds a different rule of that name. An identical
    /// library rule is shared rather than stored twice.
    pub async fn add_rule(&self, profile: &str, rule: Rule) -> Result<()> {
        rule.validate()?;
        let mut state = self.state.lock().await;
        let target = state.profile(profile)?;
        if target.references(&rule.name) {
            return Err(Error::DuplicateRule {
                profile: profile.to_string(),
                rule: rule.name,
            });
        }
        if target.rules.len() >= MAX_RULES {
            return Err(Error::validation(
                "rules",
                format!("profile '{profile}' already has {MAX_RULES} rules"),
            ));
        }
        if let Some(existing) = state.rules.get(&rule.name)
            && *existing != rule
        {
            return Err(Error::validation(
                "rules",
                format!(
                    "rule '{}' already exists with a different definition",
                    rule.name
                ),
            ));
        }
        let mut updated = target.clone();
        updated.rules.push(rule.name.clone());

        self.commit(
            "save rule",
            Changeset::new()
                .save_rule(rule.clone())
                .save_profile(updated.clone()),
        )
        .await?;

        let name = rule.name.clone();
        let republish = state.is_active(profile);
        state.rules.insert(name.clone(), rule);
        state.profiles.insert(profile.to_string(), updated);
        if republish {
            self.publish(&mut state);
        }
        drop(state);

        self.oplog
            .info(
                "rule-add",
                format!("Added rule '{name}' to profile '{profile}'"),
                serde_json::json!({ "profile": profile, "rule": name }),
            )
            .await;
        Ok(())
    }

    /// Removes the reference to `rule` from `profile`. The rule stays in the
    /// library.
    pub async fn remove_rule(&self, profile: &str, rule: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let target = state.profile(profile)?;
        if !target.references(rule) {
            return Err(Error::RuleNotInProfile {
                profile: profile.to_string(),
                rule: rule.to_string(),
            });
        }
        let mut updated = target.clone();
        updated.rules.retain(|r| r != rule);

        self.commit("save profile", Changeset::new().save_profile(updated.clone()))
            .await?;
        state.profiles.insert(profile.to_string(), updated);
        if state.is_active(profile) {
            self.publish(&mut state);
        }
        drop(state);

        self.oplog
            .info(
                "rule-remove",
                format!("Removed rule '{rule}' from profile '{profile}'"),
                serde_json::json!({ "profile": profile, "rule": rule }),
            )
            .await;
        Ok(())
    }

    /// Creates or replaces a library rule. Profiles referencing it pick up
    /// the new definition.
    pub async fn put_rule(&self, rule: Rule) -> Result<()> {
        rule.validate()?;
        let mut state = self.state.lock().await;
        self.commit("save rule", Changeset::new().save_rule(rule.clone()))
            .await?;
        let name = rule.name.clone();
        let republish = state.active_references(&name);
        let replaced = state.rules.insert(name.clone(), rule).is_some();
        if republish {
            self.publish(&mut state);
        }
        drop(state);

        let verb = if replaced { "Replaced" } else { "Stored" };
        self.oplog
            .info(
                "rule-add",
                format!("{verb} rule '{name}'"),
                serde_json::json!({ "rule": name, "replaced": replaced }),
            )
            .await;
        Ok(())
    }

    /// Deletes a library rule and every profile reference to it.
    pub async fn delete_rule(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.rules.contains_key(name) {
            return Err(Error::RuleNotFound(name.to_string()));
        }

        let affected: Vec<Profile> = state
            .profiles
            .values()
            .filter(|p| p.references(name))
            .map(|p| {
                let mut p = p.clone();
                p.rules.retain(|r| r != name);
                p
            })
            .collect();
        let changes = affected
            .iter()
            .cloned()
            .fold(Changeset::new().delete_rule(name), Changeset::save_profile);
        self.commit("delete rule", changes).await?;

        let republish = state.active_references(name);
        for profile in affected {
            state.profiles.insert(profile.name.clone(), profile);
        }
        state.rules.remove(name);
        if republish {
            self.publish(&mut state);
        }
        drop(state);

        self.oplog
            .info(
                "rule-remove",
                format!("Deleted rule '{name}'"),
                serde_json::json!({ "rule": name }),
            )
            .await;
        Ok(())
    }

    /// Turns a one-off decision into a permanent rule in `profile`.
    ///
    /// A previously learned rule with the same generated name is replaced in
    /// place, in the library and in every profile referencing it. Otherwise
    /// the new rule is appended to `profile`.
    pub async fn learn_rule(
        &self,
        profile: &str,
        event: &ConnectionEvent,
        action: Action,
    ) -> Result<Rule> {
        let rule = learned_rule(event, action);
        rule.validate()?;
        let mut state = self.state.lock().await;
        let target = state.profile(profile)?;
        let mut changes = Changeset::new().save_rule(rule.clone());
        let mut updated = None;
        if !target.references(&rule.name) {
            if target.rules.len() >= MAX_RULES {
                return Err(Error::validation(
                    "rules",
                    format!("profile '{profile}' already has {MAX_RULES} rules"),
                ));
            }
            let mut extended = target.clone();
            extended.rules.push(rule.name.clone());
            changes = changes.save_profile(extended.clone());
            updated = Some(extended);
        }
        self.commit("save rule", changes).await?;

        let name = rule.name.clone();
        let replaced = state.rules.insert(name.clone(), rule.clone()).is_some();
        if let Some(extended) = updated {
            state.profiles.insert(profile.to_string(), extended);
        }
        if state.is_active(profile) || state.active_references(&name) {
            self.publish(&mut state);
        }
        drop(state);

        self.oplog
            .info(
                "rule-add",
                format!("Learned rule '{name}' in profile '{profile}'"),
                serde_json::json!({
                    "profile": profile,
                    "rule": name,
                    "action": action.as_str(),
                    "replaced": replaced,
                }),
            )
            .await;
        Ok(rule)
    }

    pub async fn rule(&self, name: &str) -> Option<Rule> {
        self.state.lock().await.rules.get(name).cloned()
    }

    /// Every library rule, sorted by name.
    pub async fn list_rules(&self) -> Vec<Rule> {
        self.state.lock().await.rules.values().cloned().collect()
    }

    /// Every profile, sorted by name, with `active` reflecting the store.
    pub async fn list_profiles(&self) -> Vec<Profile> {
        let state = self.state.lock().await;
        state.profiles.values().map(|p| state.listed(p)).collect()
    }

    pub async fn profile(&self, name: &str) -> Result<Profile> {
        let state = self.state.lock().await;
        state.profile(name).map(|p| state.listed(p))
    }

    /// The profile with its rules resolved in declared order.
    pub async fn export_profile(&self, name: &str) -> Result<ProfileExport> {
        let state = self.state.lock().await;
        let profile = state.listed(state.profile(name)?);
        let rules = profile
            .rules
            .iter()
            .map(|r| {
                state
                    .rules
                    .get(r)
                    .cloned()
                    .ok_or_else(|| Error::Internal(format!("dangling rule reference '{r}'")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ProfileExport { profile, rules })
    }

    /// Imports an exported profile under its own name.
    ///
    /// Bundled rules are added to the library. A bundled rule may not
    /// silently redefine a different library rule of the same name, and
    /// every reference must resolve. The imported profile is never activated.
    pub async fn import_profile(&self, export: ProfileExport) -> Result<Profile> {
        let ProfileExport { mut profile, rules } = export;
        profile.active = false;
        profile.validate()?;
        for rule in &rules {
            rule.validate()?;
        }

        let mut seen = HashSet::new();
        if let Some(dup) = profile.rules.iter().find(|r| !seen.insert(r.as_str())) {
            return Err(Error::DuplicateRule {
                profile: profile.name.clone(),
                rule: dup.clone(),
            });
        }

        let mut state = self.state.lock().await;
        if state.profiles.contains_key(&profile.name) {
            return Err(Error::DuplicateProfile(profile.name));
        }
        let bundled: BTreeMap<&str, &Rule> = rules.iter().map(|r| (r.name.as_str(), r)).collect();
        for (name, rule) in &bundled {
            if let Some(existing) = state.rules.get(*name)
                && existing != *rule
            {
                return Err(Error::validation(
                    "rules",
                    format!("rule '{name}' already exists with a different definition"),
                ));
            }
        }
        if let Some(missing) = profile
            .rules
            .iter()
            .find(|r| !bundled.contains_key(r.as_str()) && !state.rules.contains_key(*r))
        {
            return Err(Error::RuleNotFound(missing.clone()));
        }

        let new_rules: Vec<&Rule> = bundled
            .values()
            .filter(|r| !state.rules.contains_key(&r.name))
            .copied()
            .collect();
        let changes = new_rules
            .iter()
            .map(|r| (*r).clone())
            .fold(Changeset::new(), Changeset::save_rule)
            .save_profile(profile.clone());
        self.commit("import profile", changes).await?;

        for rule in new_rules {
            state.rules.insert(rule.name.clone(), rule.clone());
        }
        state.profiles.insert(profile.name.clone(), profile.clone());
        drop(state);

        self.oplog
            .info(
                "profile-create",
                format!("Imported profile '{}'", profile.name),
                serde_json::json!({ "profile": profile.name, "rules": profile.rules.len() }),
            )
            .await;
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::firewall::{Direction, PortEntry, Protocol};
    use crate::core::test_helpers::{FlakyProfileBackend, outbound, rule, store_with};

    #[tokio::test]
    async fn test_create_and_activate() {
        let store = ProfileStore::in_memory();
        assert!(store.active_profile_name().is_none());
        assert!(store.active_rule_set().is_empty());

        store.create_profile("Home", "home network").await.unwrap();
        store
            .add_rule("Home", rule("block-telnet", "*", Action::Block))
            .await
            .unwrap();
        store.set_active("Home").await.unwrap();

        let set = store.active_rule_set();
        assert_eq!(set.profile(), Some("Home"));
        assert_eq!(set.rules().map(|r| r.name.as_str()).collect::<Vec<_>>(), ["block-telnet"]);

        let listed = store.list_profiles().await;
        assert_eq!(listed.iter().filter(|p| p.active).count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_profile() {
        let store = ProfileStore::in_memory();
        store.create_profile("Home", "").await.unwrap();
        assert!(matches!(
            store.create_profile("Home", "").await,
            Err(Error::DuplicateProfile(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_profile_name() {
        let store = ProfileStore::in_memory();
        assert!(matches!(
            store.create_profile("../etc", "").await,
            Err(Error::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_active_unknown_profile() {
        let store = store_with("Home", vec![rule("a", "*", Action::Allow)]).await;
        let before = store.active_rule_set();
        assert!(matches!(
            store.set_active("Nope").await,
            Err(Error::ProfileNotFound(_))
        ));
        assert!(Arc::ptr_eq(&before, &store.active_rule_set()));
    }

    #[tokio::test]
    async fn test_delete_active_profile_fails() {
        let store = store_with("Home", vec![rule("a", "*", Action::Allow)]).await;
        let err = store.delete_profile("Home").await.unwrap_err();
        assert!(matches!(err, Error::ActiveProfile(_)));
        assert!(err.is_reference());
        assert_eq!(store.active_profile_name().as_deref(), Some("Home"));
        assert_eq!(store.active_rule_set().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_inactive_profile() {
        let store = store_with("Home", vec![]).await;
        store.create_profile("Travel", "").await.unwrap();
        store.delete_profile("Travel").await.unwrap();
        assert!(matches!(
            store.delete_profile("Travel").await,
            Err(Error::ProfileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_rule_in_profile() {
        let store = store_with("Home", vec![rule("a", "*", Action::Allow)]).await;
        let err = store
            .add_rule("Home", rule("a", "/bin/x", Action::Block))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRule { .. }));
        // Library definition unchanged
        assert_eq!(store.rule("a").await.unwrap().application, "*");
    }

    #[tokio::test]
    async fn test_invalid_rule_never_enters_set() {
        let store = store_with("Home", vec![]).await;
        let bad = rule("bad", "*", Action::Allow).with_ports(vec![PortEntry::range(90, 80)]);
        assert!(matches!(
            store.add_rule("Home", bad).await,
            Err(Error::Validation { .. })
        ));
        assert!(store.active_rule_set().is_empty());
        assert!(store.rule("bad").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_rule() {
        let store = store_with(
            "Home",
            vec![rule("a", "*", Action::Allow), rule("b", "*", Action::Block)],
        )
        .await;
        store.remove_rule("Home", "a").await.unwrap();
        assert_eq!(store.active_rule_set().rules().next().unwrap().name, "b");
        // Still in the library
        assert!(store.rule("a").await.is_some());

        assert!(matches!(
            store.remove_rule("Home", "a").await,
            Err(Error::RuleNotInProfile { .. })
        ));
    }

    #[tokio::test]
    async fn test_put_rule_republishes_active() {
        let store = store_with("Home", vec![rule("a", "*", Action::Allow)]).await;
        let v1 = store.active_rule_set().version();
        store.put_rule(rule("a", "*", Action::Block)).await.unwrap();
        let set = store.active_rule_set();
        assert!(set.version() > v1);
        assert_eq!(set.rules().next().unwrap().action, Action::Block);
    }

    #[tokio::test]
    async fn test_delete_rule_removes_references() {
        let store = store_with("Home", vec![rule("a", "*", Action::Allow)]).await;
        store.create_profile("Work", "").await.unwrap();
        store
            .add_rule("Work", rule("a", "*", Action::Allow))
            .await
            .unwrap();

        store.delete_rule("a").await.unwrap();
        assert!(store.active_rule_set().is_empty());
        assert!(store.profile("Work").await.unwrap().rules.is_empty());
        assert!(matches!(
            store.delete_rule("a").await,
            Err(Error::RuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_learn_rule_replaces_previous() {
        let store = store_with("Home", vec![]).await;
        let event = outbound("/usr/bin/curl", Protocol::Tcp, 443);

        let learned = store
            .learn_rule("Home", &event, Action::Allow)
            .await
            .unwrap();
        assert_eq!(learned.name, "auto_curl_tcp_443");
        assert_eq!(learned.direction, Some(Direction::Outbound));

        store
            .learn_rule("Home", &event, Action::Block)
            .await
            .unwrap();
        let set = store.active_rule_set();
        assert_eq!(set.len(), 1);
        assert_eq!(set.evaluate(&event, Action::Allow).action, Action::Block);
    }

    #[tokio::test]
    async fn test_export_import() {
        let store = store_with(
            "Home",
            vec![
                rule("b", "*", Action::Block),
                rule("a", "/usr/bin/curl", Action::Allow),
            ],
        )
        .await;
        let mut export = store.export_profile("Home").await.unwrap();
        assert_eq!(
            export.rules.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            ["b", "a"]
        );

        assert!(matches!(
            store.import_profile(export.clone()).await,
            Err(Error::DuplicateProfile(_))
        ));

        export.profile.name = "Copy".to_string();
        let imported = store.import_profile(export).await.unwrap();
        assert!(!imported.active);
        assert_eq!(imported.rules, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(store.active_profile_name().as_deref(), Some("Home"));
    }

    #[tokio::test]
    async fn test_import_rejects_conflicting_rule() {
        let store = store_with("Home", vec![rule("a", "*", Action::Allow)]).await;
        let mut profile = Profile::new("Other", "");
        profile.rules.push("a".into());
        let export = ProfileExport {
            profile,
            rules: vec![rule("a", "*", Action::Block)],
        };
        assert!(matches!(
            store.import_profile(export).await,
            Err(Error::Validation { .. })
        ));
        assert!(store.profile("Other").await.is_err());
    }

    #[tokio::test]
    async fn test_import_rejects_unresolved_reference() {
        let store = ProfileStore::in_memory();
        let mut profile = Profile::new("Other", "");
        profile.rules.push("ghost".into());
        let export = ProfileExport {
            profile,
            rules: vec![],
        };
        assert!(matches!(
            store.import_profile(export).await,
            Err(Error::RuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_open_restores_and_drops_dangling() {
        let mut profile = Profile::new("Home", "");
        profile.rules = vec!["a".into(), "ghost".into()];
        let backend = Arc::new(MemoryProfileBackend::with_state(PersistedState {
            rules: vec![rule("a", "*", Action::Allow)],
            profiles: vec![profile],
            active: Some("Home".into()),
        }));

        let store = ProfileStore::open(backend, RetryPolicy::default(), Arc::new(OpLog::default()))
            .await
            .unwrap();
        assert_eq!(store.active_profile_name().as_deref(), Some("Home"));
        assert_eq!(store.profile("Home").await.unwrap().rules, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_persistence_failure_leaves_state_unchanged() {
        let backend = Arc::new(FlakyProfileBackend::new());
        let oplog = Arc::new(OpLog::in_memory(10));
        let retry = RetryPolicy {
            attempts: 2,
            backoff: std::time::Duration::from_millis(1),
            timeout: std::time::Duration::from_millis(100),
        };
        let store = ProfileStore::open(backend.clone(), retry, oplog.clone())
            .await
            .unwrap();
        store.create_profile("Home", "").await.unwrap();
        store.set_active("Home").await.unwrap();

        backend.fail();
        let err = store
            .add_rule("Home", rule("a", "*", Action::Allow))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage { attempts: 2, .. }));
        assert!(store.rule("a").await.is_none());
        assert!(store.active_rule_set().is_empty());

        let events = oplog.recent(1);
        assert_eq!(events[0].category, "storage-error");
        assert_eq!(events[0].level, crate::oplog::Level::Error);

        backend.recover();
        store
            .add_rule("Home", rule("a", "*", Action::Allow))
            .await
            .unwrap();
        assert_eq!(backend.state().rules.len(), 1);
    }

    #[tokio::test]
    async fn test_add_rule_rejects_conflicting_library_rule() {
        let store = store_with("Home", vec![rule("web", "/usr/bin/firefox", Action::Allow)]).await;
        store.create_profile("Work", "").await.unwrap();

        let err = store
            .add_rule("Work", rule("web", "/usr/bin/firefox", Action::Block))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{err}");
        assert!(store.profile("Work").await.unwrap().rules.is_empty());
        assert_eq!(
            store.rule("web").await.unwrap().action,
            Action::Allow
        );

        // The same definition is shared between profiles
        store
            .add_rule("Work", rule("web", "/usr/bin/firefox", Action::Allow))
            .await
            .unwrap();
        assert_eq!(store.list_rules().await.len(), 1);
    }

    #[tokio::test]
    async fn test_put_rule_records_operation() {
        let oplog = Arc::new(OpLog::in_memory(10));
        let store = ProfileStore::open(
            Arc::new(MemoryProfileBackend::new()),
            RetryPolicy::default(),
            oplog.clone(),
        )
        .await
        .unwrap();

        store.put_rule(rule("a", "*", Action::Allow)).await.unwrap();
        store.put_rule(rule("a", "*", Action::Block)).await.unwrap();

        let events = oplog.recent(2);
        assert!(events.iter().all(|e| e.category == "rule-add"));
        assert_eq!(events[0].details["replaced"], serde_json::json!(true));
        assert_eq!(events[1].details["replaced"], serde_json::json!(false));
        assert_eq!(events[0].details["rule"], serde_json::json!("a"));
    }

    #[tokio::test]
    async fn test_learn_rule_redefines_rule_shared_with_other_profile() {
        let store = store_with("Home", vec![]).await;
        store.create_profile("Work", "").await.unwrap();
        let event = outbound("/usr/bin/curl", Protocol::Tcp, 443);

        store
            .learn_rule("Work", &event, Action::Block)
            .await
            .unwrap();
        let learned = store
            .learn_rule("Home", &event, Action::Allow)
            .await
            .unwrap();

        assert_eq!(store.rule(&learned.name).await.unwrap().action, Action::Allow);
        assert_eq!(store.profile("Work").await.unwrap().rules, vec![learned.name.clone()]);
        assert_eq!(
            store.active_rule_set().evaluate(&event, Action::Block).action,
            Action::Allow
        );
    }

    async fn open_dir(path: &std::path::Path) -> ProfileStore {
        let backend = crate::core::persist::FileProfileBackend::open(path)
            .await
            .unwrap();
        let retry = RetryPolicy {
            attempts: 2,
            backoff: std::time::Duration::from_millis(1),
            timeout: std::time::Duration::from_secs(5),
        };
        ProfileStore::open(Arc::new(backend), retry, Arc::new(OpLog::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_disk_and_memory_in_step() {
        let dir = tempfile::tempdir().unwrap();
        let web = outbound("/usr/bin/firefox", Protocol::Tcp, 443);
        {
            let store = open_dir(dir.path()).await;
            store.create_profile("Home", "").await.unwrap();
            store
                .add_rule("Home", rule("web", "/usr/bin/firefox", Action::Allow))
                .await
                .unwrap();
            store.set_active("Home").await.unwrap();
            store.create_profile("Work", "").await.unwrap();

            assert!(
                store
                    .add_rule("Work", rule("web", "/usr/bin/firefox", Action::Block))
                    .await
                    .is_err()
            );

            // Removing "web" rewrites rules.json and Home.json; the checksum
            // write after them fails
            let sum = dir.path().join("profiles/Home.json.sha256");
            std::fs::remove_file(&sum).unwrap();
            std::fs::create_dir(&sum).unwrap();
            std::fs::write(sum.join("keep"), b"x").unwrap();

            let err = store.delete_rule("web").await.unwrap_err();
            assert!(matches!(err, Error::Storage { .. }), "{err}");
            assert!(store.rule("web").await.is_some());
            assert_eq!(
                store.active_rule_set().evaluate(&web, Action::Block).action,
                Action::Allow
            );
            std::fs::remove_dir_all(&sum).unwrap();
        }

        let store = open_dir(dir.path()).await;
        assert_eq!(store.profile("Home").await.unwrap().rules, vec!["web".to_string()]);
        assert!(store.profile("Work").await.unwrap().rules.is_empty());
        assert_eq!(
            store.active_rule_set().evaluate(&web, Action::Block).action,
            Action::Allow
        );
    }

    #[tokio::test]
    async fn test_ensure_default() {
        let store = ProfileStore::in_memory();
        store.ensure_default().await.unwrap();
        assert_eq!(store.active_profile_name().as_deref(), Some(DEFAULT_PROFILE_NAME));
        // Idempotent
        store.ensure_default().await.unwrap();
        assert_eq!(store.list_profiles().await.len(), 1);
    }
}
