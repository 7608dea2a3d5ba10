/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Lifecycle of status-bearing records (sources, chroots, repositories,
//! remotes, the daemon key).
//!
//! Records move UNPREPARED -> PREPARED -> ACTIVE. An entity can only be
//! active while everything it depends on is active. A failed check on an
//! active entity drops it (and its dependents) back to prepared with
//! `auto_reactivate` set, so the next successful check restores it.

use crate::state::StateConfiguration;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use entity::source::ReleaseInfo;
use entity::status::{Status, StatusRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StatusFile {
    #[serde(default)]
    records: BTreeMap<String, StatusRecord>,
    #[serde(default)]
    releases: BTreeMap<String, ReleaseInfo>,
}

/// Persistent status records, keyed by status id.
#[derive(Debug)]
pub struct StatusStore {
    path: Option<PathBuf>,
    inner: Mutex<StatusFile>,
}

impl StatusStore {
    pub fn load(path: &Path) -> Result<Self> {
        let file = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read status file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse status file {}", path.display()))?
        } else {
            StatusFile::default()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            inner: Mutex::new(file),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(StatusFile::default()),
        }
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut StatusFile) -> T) -> T {
        match self.inner.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn persist(&self, file: &StatusFile) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(file)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> StatusRecord {
        self.with_file(|f| f.records.get(id).cloned().unwrap_or_default())
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.get(id).is_active()
    }

    pub fn set(&self, id: &str, record: StatusRecord) -> Result<()> {
        let snapshot = self.with_file(|f| {
            f.records.insert(id.to_string(), record);
            f.clone()
        });
        self.persist(&snapshot)
    }

    pub fn records(&self) -> BTreeMap<String, StatusRecord> {
        self.with_file(|f| f.records.clone())
    }

    pub fn set_release(&self, source_id: &str, release: Option<ReleaseInfo>) -> Result<()> {
        let snapshot = self.with_file(|f| {
            match release {
                Some(release) => f.releases.insert(source_id.to_string(), release),
                None => f.releases.remove(source_id),
            };
            f.clone()
        });
        self.persist(&snapshot)
    }

    /// Copy prepared Release data into the sources of `config`.
    pub fn apply_releases(&self, mut config: StateConfiguration) -> StateConfiguration {
        self.with_file(|f| {
            for source in &mut config.sources {
                if let Some(release) = f.releases.get(&source.status_id()) {
                    source.release = Some(release.clone());
                }
            }
        });
        config
    }
}

/// Hooks of one status-bearing entity.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn status_id(&self) -> String;

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn prepare(&self) -> Result<()>;

    async fn unprepare(&self) -> Result<()>;

    async fn check(&self) -> Result<()>;
}

/// The dependency graph of registered entities plus their stored status.
pub struct StatusModel<'a> {
    store: &'a StatusStore,
    entities: BTreeMap<String, Box<dyn Lifecycle + 'a>>,
}

impl<'a> StatusModel<'a> {
    pub fn new(store: &'a StatusStore) -> Self {
        Self {
            store,
            entities: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, entity: Box<dyn Lifecycle + 'a>) {
        self.entities.insert(entity.status_id(), entity);
    }

    pub fn ids(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    pub fn status(&self, id: &str) -> StatusRecord {
        self.store.get(id)
    }

    fn entity(&self, id: &str) -> Result<&(dyn Lifecycle + 'a)> {
        self.entities
            .get(id)
            .map(|e| e.as_ref())
            .ok_or_else(|| anyhow!("Unknown status entity '{}'", id))
    }

    /// `id` and its transitive dependencies, dependencies first.
    pub fn closure(&self, id: &str) -> Result<Vec<String>> {
        fn visit<'a>(
            model: &StatusModel<'a>,
            id: &str,
            visiting: &mut Vec<String>,
            done: &mut BTreeSet<String>,
            order: &mut Vec<String>,
        ) -> Result<()> {
            if done.contains(id) {
                return Ok(());
            }
            if visiting.iter().any(|v| v == id) {
                bail!("Dependency cycle: {} -> {}", visiting.join(" -> "), id);
            }

            visiting.push(id.to_string());
            for dependency in model.entity(id)?.dependencies() {
                visit(model, &dependency, visiting, done, order)?;
            }
            visiting.pop();

            done.insert(id.to_string());
            order.push(id.to_string());
            Ok(())
        }

        let mut order = Vec::new();
        visit(self, id, &mut Vec::new(), &mut BTreeSet::new(), &mut order)?;
        Ok(order)
    }

    /// Every entity that transitively depends on `id`.
    pub fn dependents(&self, id: &str) -> Vec<String> {
        let mut result: Vec<String> = Vec::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for (other, entity) in &self.entities {
                if entity.dependencies().contains(&current) && !result.contains(other) {
                    result.push(other.clone());
                    frontier.push(other.clone());
                }
            }
        }
        result
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut StatusRecord)) -> Result<()> {
        let mut record = self.store.get(id);
        f(&mut record);
        self.store.set(id, record)
    }

    /// Prepare dependencies and then `id`; already prepared entities are
    /// left alone.
    pub async fn prepare(&self, id: &str) -> Result<()> {
        for current in self.closure(id)? {
            if self.store.get(&current).is_prepared() {
                continue;
            }

            info!(entity = %current, "Preparing");
            self.entity(&current)?
                .prepare()
                .await
                .with_context(|| format!("Failed to prepare '{}'", current))?;
            self.update(&current, |r| {
                r.status = Status::Prepared;
                r.last_error = None;
            })?;
        }
        Ok(())
    }

    /// Prepare if needed, then check and activate dependencies and `id`.
    pub async fn activate(&self, id: &str) -> Result<()> {
        self.prepare(id).await?;

        for current in self.closure(id)? {
            if self.store.get(&current).is_active() {
                continue;
            }

            if let Err(e) = self.entity(&current)?.check().await {
                self.update(&current, |r| r.last_error = Some(format!("{:#}", e)))?;
                return Err(e.context(format!("Failed to activate '{}'", current)));
            }

            info!(entity = %current, "Activating");
            self.update(&current, |r| {
                r.status = Status::Active;
                r.auto_reactivate = false;
                r.last_checked = Some(Utc::now().naive_utc());
                r.last_error = None;
            })?;
        }
        Ok(())
    }

    /// Run the entity's check. Failure while active deactivates it and its
    /// dependents with `auto_reactivate`; success re-activates an entity that
    /// was deactivated that way.
    pub async fn check(&self, id: &str) -> Result<()> {
        let record = self.store.get(id);
        match self.entity(id)?.check().await {
            Ok(()) => {
                let reactivate = record.auto_reactivate && record.status == Status::Prepared;
                let deps_active = self
                    .entity(id)?
                    .dependencies()
                    .iter()
                    .all(|d| self.store.is_active(d));
                self.update(id, |r| {
                    r.last_checked = Some(Utc::now().naive_utc());
                    r.last_error = None;
                    if reactivate && deps_active {
                        info!(entity = %id, "Auto-reactivating");
                        r.status = Status::Active;
                        r.auto_reactivate = false;
                    }
                })?;
                Ok(())
            }
            Err(e) => {
                let message = format!("{:#}", e);
                if record.is_active() {
                    warn!(entity = %id, error = %message, "Check failed, auto-deactivating");
                    for dependent in std::iter::once(id.to_string()).chain(self.dependents(id)) {
                        if self.store.is_active(&dependent) {
                            self.update(&dependent, |r| {
                                r.status = Status::Prepared;
                                r.auto_reactivate = true;
                            })?;
                        }
                    }
                }
                self.update(id, |r| {
                    r.last_checked = Some(Utc::now().naive_utc());
                    r.last_error = Some(message);
                })?;
                Err(e)
            }
        }
    }

    pub fn deactivate(&self, id: &str) -> Result<()> {
        for current in std::iter::once(id.to_string()).chain(self.dependents(id)) {
            if self.store.is_active(&current) {
                info!(entity = %current, "Deactivating");
                self.update(&current, |r| {
                    r.status = Status::Prepared;
                    r.auto_reactivate = false;
                })?;
            }
        }
        Ok(())
    }

    /// Deactivate (with dependents) and undo preparation of `id`.
    pub async fn unprepare(&self, id: &str) -> Result<()> {
        self.deactivate(id)?;

        info!(entity = %id, "Unpreparing");
        self.entity(id)?
            .unprepare()
            .await
            .with_context(|| format!("Failed to unprepare '{}'", id))?;
        self.update(id, |r| {
            r.status = Status::Unprepared;
            r.auto_reactivate = false;
        })
    }

    /// Run checks on every registered entity in dependency order, retrying
    /// activation for entities waiting on `auto_reactivate`.
    pub async fn check_all(&self) -> BTreeMap<String, Result<()>> {
        let mut results = BTreeMap::new();
        for id in self.ids() {
            let record = self.store.get(&id);
            let result = if record.is_active() || record.auto_reactivate {
                match self.closure(&id) {
                    Ok(order) => {
                        let mut result = Ok(());
                        for current in order {
                            let r = self.store.get(&current);
                            if r.is_active() || r.auto_reactivate {
                                if let Err(e) = self.check(&current).await {
                                    result = Err(e);
                                    break;
                                }
                            }
                        }
                        result
                    }
                    Err(e) => Err(e),
                }
            } else {
                Ok(())
            };
            results.insert(id, result);
        }
        results
    }
}
