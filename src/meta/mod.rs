//! Metadata collections: domains and projects, each backed by one
//! `storage::Store` plus an in-memory map keyed by id (and, for domains, a
//! secondary map keyed by hostname).
//!
//! Mutations write through to storage and `flush()` before returning, so a
//! collection is crash-safe up to the last completed mutation. A single
//! `std::sync::Mutex` per collection serializes writers (§5); these methods
//! are synchronous (the storage layer is sync, positional-write based) —
//! async callers that don't want to block their executor thread should wrap
//! calls in `tokio::task::spawn_blocking`.

pub mod domain;
pub mod project;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use uuid::Uuid;

pub use domain::Domain;
pub use project::{Project, ProjectStatus};

use crate::error::CoreError;
use crate::storage::Store;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct Inner<T> {
    store: Store,
    by_id: HashMap<Uuid, T>,
}

pub struct DomainCollection {
    inner: Mutex<Inner<Domain>>,
    by_hostname: Mutex<HashMap<String, Uuid>>,
}

impl DomainCollection {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let store = Store::open(path)?;
        let mut by_id = HashMap::new();
        let mut by_hostname = HashMap::new();
        for id in store.ids() {
            let value = store.read(&id)?;
            let domain = Domain::try_from(&value)?;
            by_hostname.insert(domain.hostname.clone(), domain.id);
            by_id.insert(domain.id, domain);
        }
        Ok(Self {
            inner: Mutex::new(Inner { store, by_id }),
            by_hostname: Mutex::new(by_hostname),
        })
    }

    pub fn create(&self, hostname: String, project_id: Uuid) -> Result<Domain, CoreError> {
        domain::validate_hostname(&hostname)?;
        let mut inner = self.inner.lock().expect("domain collection lock poisoned");
        let mut by_hostname = self.by_hostname.lock().expect("hostname index lock poisoned");
        if by_hostname.contains_key(&hostname) {
            return Err(CoreError::Conflict(format!(
                "hostname '{hostname}' already registered"
            )));
        }
        let record = Domain::new(hostname.clone(), project_id, now_ms());
        let value = crate::codec::Value::from(&record);
        inner.store.write(&value)?;
        inner.store.flush()?;
        by_hostname.insert(hostname, record.id);
        inner.by_id.insert(record.id, record.clone());
        Ok(record)
    }

    pub fn get(&self, id: &Uuid) -> Option<Domain> {
        self.inner
            .lock()
            .expect("domain collection lock poisoned")
            .by_id
            .get(id)
            .cloned()
    }

    pub fn find_by_hostname(&self, hostname: &str) -> Option<Domain> {
        let id = *self
            .by_hostname
            .lock()
            .expect("hostname index lock poisoned")
            .get(hostname)?;
        self.get(&id)
    }

    pub fn list(&self) -> Vec<Domain> {
        let inner = self.inner.lock().expect("domain collection lock poisoned");
        let mut domains: Vec<Domain> = inner.by_id.values().cloned().collect();
        domains.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        domains
    }

    pub fn update(
        &self,
        id: &Uuid,
        mutate: impl FnOnce(&mut Domain),
    ) -> Result<Domain, CoreError> {
        let mut inner = self.inner.lock().expect("domain collection lock poisoned");
        let mut by_hostname = self.by_hostname.lock().expect("hostname index lock poisoned");
        let mut domain = inner
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        let old_hostname = domain.hostname.clone();
        mutate(&mut domain);
        domain.updated_at = now_ms();
        if domain.hostname != old_hostname {
            if by_hostname.contains_key(&domain.hostname) {
                return Err(CoreError::Conflict(format!(
                    "hostname '{}' already registered",
                    domain.hostname
                )));
            }
            domain::validate_hostname(&domain.hostname)?;
        }
        // Updates are delete-then-insert at the storage layer: a new
        // storage id is minted each time, but the external `id` field
        // (the one callers key by) never changes.
        let old_storage_id = storage_id_for(&mut inner.store, *id)?;
        inner.store.delete(&old_storage_id)?;
        let new_value = crate::codec::Value::from(&domain);
        inner.store.write(&new_value)?;
        inner.store.flush()?;
        if domain.hostname != old_hostname {
            by_hostname.remove(&old_hostname);
            by_hostname.insert(domain.hostname.clone(), domain.id);
        }
        inner.by_id.insert(domain.id, domain.clone());
        Ok(domain)
    }

    pub fn delete(&self, id: &Uuid) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().expect("domain collection lock poisoned");
        let mut by_hostname = self.by_hostname.lock().expect("hostname index lock poisoned");
        let domain = inner
            .by_id
            .remove(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        by_hostname.remove(&domain.hostname);
        let storage_id = storage_id_for(&mut inner.store, *id)?;
        inner.store.delete(&storage_id)?;
        inner.store.flush()?;
        Ok(())
    }
}

/// The storage layer keys records by its own minted id, not by the domain's
/// or project's external `id` field. Since every in-memory object already
/// carries its external id as a field, deleting by external id requires a
/// linear scan to recover the matching storage id the first time; this is
/// bounded by fleet size and only runs on delete, which is rare relative to
/// reads.
fn storage_id_for(store: &mut Store, external_id: Uuid) -> Result<Uuid, CoreError> {
    for storage_id in store.ids() {
        let value = store.read(&storage_id)?;
        if value.get("id").and_then(|v| v.as_uuid()) == Some(external_id) {
            return Ok(storage_id);
        }
    }
    Err(CoreError::NotFound(external_id.to_string()))
}

pub struct ProjectCollection {
    inner: Mutex<Inner<Project>>,
    projects_dir: std::path::PathBuf,
    sockets_dir: std::path::PathBuf,
}

impl ProjectCollection {
    pub fn open(
        path: impl AsRef<Path>,
        projects_dir: impl Into<std::path::PathBuf>,
        sockets_dir: impl Into<std::path::PathBuf>,
    ) -> Result<Self, CoreError> {
        let store = Store::open(path)?;
        let mut by_id = HashMap::new();
        for id in store.ids() {
            let value = store.read(&id)?;
            let mut project = Project::try_from(&value)?;
            // The supervisor is the sole authority for liveness: whatever
            // was persisted, every project boots as `stopped` with no pid.
            project.status = ProjectStatus::Stopped;
            project.pid = None;
            by_id.insert(project.id, project);
        }
        Ok(Self {
            inner: Mutex::new(Inner { store, by_id }),
            projects_dir: projects_dir.into(),
            sockets_dir: sockets_dir.into(),
        })
    }

    /// Validates `name`, writes `binary` to `<projects_dir>/<id>` with mode
    /// 0755, and persists the record — the "binary written to disk, record
    /// persisted" step of a project's birth (§3).
    pub fn upload(&self, name: String, binary: &[u8]) -> Result<Project, CoreError> {
        project::validate_project_name(&name)?;
        let mut inner = self.inner.lock().expect("project collection lock poisoned");
        if inner.by_id.values().any(|p| p.name == name) {
            return Err(CoreError::Conflict(format!(
                "project named '{name}' already exists"
            )));
        }
        let record = Project::new(name, "", &self.sockets_dir, now_ms());
        let binary_path = self.projects_dir.join(record.id.to_string());
        std::fs::write(&binary_path, binary)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o755);
            std::fs::set_permissions(&binary_path, perms)?;
        }
        let mut record = record;
        record.binary_path = binary_path;
        let value = crate::codec::Value::from(&record);
        inner.store.write(&value)?;
        inner.store.flush()?;
        inner.by_id.insert(record.id, record.clone());
        Ok(record)
    }

    pub fn get(&self, id: &Uuid) -> Option<Project> {
        self.inner
            .lock()
            .expect("project collection lock poisoned")
            .by_id
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Project> {
        let inner = self.inner.lock().expect("project collection lock poisoned");
        let mut projects: Vec<Project> = inner.by_id.values().cloned().collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        projects
    }

    pub fn update(
        &self,
        id: &Uuid,
        mutate: impl FnOnce(&mut Project),
    ) -> Result<Project, CoreError> {
        let mut inner = self.inner.lock().expect("project collection lock poisoned");
        let mut project = inner
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        mutate(&mut project);
        project.updated_at = now_ms();
        let old_storage_id = storage_id_for(&mut inner.store, *id)?;
        inner.store.delete(&old_storage_id)?;
        let value = crate::codec::Value::from(&project);
        inner.store.write(&value)?;
        inner.store.flush()?;
        inner.by_id.insert(project.id, project.clone());
        Ok(project)
    }

    pub fn delete(&self, id: &Uuid) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().expect("project collection lock poisoned");
        let project = inner
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if project.status != ProjectStatus::Stopped {
            return Err(CoreError::Conflict(
                "project must be stopped before deletion".into(),
            ));
        }
        let storage_id = storage_id_for(&mut inner.store, *id)?;
        inner.store.delete(&storage_id)?;
        inner.store.flush()?;
        inner.by_id.remove(id);
        let _ = std::fs::remove_file(&project.binary_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn create_then_find_by_hostname() {
        let dir = tempdir().unwrap();
        let collection = DomainCollection::open(dir.path().join("domains.db")).unwrap();
        let project_id = Uuid::new_v4();
        let domain = collection.create("a.test".into(), project_id).unwrap();
        let found = collection.find_by_hostname("a.test").unwrap();
        assert_eq!(found.id, domain.id);
    }

    #[test]
    fn duplicate_hostname_is_conflict() {
        let dir = tempdir().unwrap();
        let collection = DomainCollection::open(dir.path().join("domains.db")).unwrap();
        let project_id = Uuid::new_v4();
        collection.create("a.test".into(), project_id).unwrap();
        let err = collection.create("a.test".into(), project_id).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[test]
    fn hostname_index_matches_id_index_after_updates() {
        let dir = tempdir().unwrap();
        let collection = DomainCollection::open(dir.path().join("domains.db")).unwrap();
        let project_id = Uuid::new_v4();
        let d1 = collection.create("a.test".into(), project_id).unwrap();
        let d2 = collection.create("b.test".into(), project_id).unwrap();
        collection
            .update(&d1.id, |d| d.hostname = "a2.test".into())
            .unwrap();
        collection.delete(&d2.id).unwrap();

        let all = collection.list();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].hostname, "a2.test");
        assert!(collection.find_by_hostname("a.test").is_none());
        assert!(collection.find_by_hostname("b.test").is_none());
        assert!(collection.find_by_hostname("a2.test").is_some());
    }

    #[test]
    fn projects_reset_to_stopped_on_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("projects.db");
        let projects_dir = dir.path().join("projects");
        let sockets_dir = dir.path().join("sockets");
        std::fs::create_dir_all(&projects_dir).unwrap();
        std::fs::create_dir_all(&sockets_dir).unwrap();

        let collection =
            ProjectCollection::open(&db_path, &projects_dir, &sockets_dir).unwrap();
        let project = collection.upload("demo".into(), b"#!/bin/sh\n").unwrap();
        collection
            .update(&project.id, |p| {
                p.status = ProjectStatus::Running;
                p.pid = Some(123);
            })
            .unwrap();
        drop(collection);

        let reopened = ProjectCollection::open(&db_path, &projects_dir, &sockets_dir).unwrap();
        let reloaded = reopened.get(&project.id).unwrap();
        assert_eq!(reloaded.status, ProjectStatus::Stopped);
        assert_eq!(reloaded.pid, None);
    }

    #[test]
    fn missing_record_lookup_is_not_an_error() {
        let dir = tempdir().unwrap();
        let collection = DomainCollection::open(dir.path().join("domains.db")).unwrap();
        assert!(collection.get(&Uuid::new_v4()).is_none());
        assert!(collection.find_by_hostname("missing.test").is_none());
    }

    #[test]
    fn mutation_on_missing_id_is_an_error() {
        let dir = tempdir().unwrap();
        let collection = DomainCollection::open(dir.path().join("domains.db")).unwrap();
        let err = collection
            .update(&Uuid::new_v4(), |_| {})
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn delete_refuses_running_project() {
        let dir = tempdir().unwrap();
        let projects_dir = dir.path().join("projects");
        let sockets_dir = dir.path().join("sockets");
        std::fs::create_dir_all(&projects_dir).unwrap();
        std::fs::create_dir_all(&sockets_dir).unwrap();
        let collection =
            ProjectCollection::open(dir.path().join("projects.db"), &projects_dir, &sockets_dir)
                .unwrap();
        let project = collection.upload("demo".into(), b"x").unwrap();
        collection
            .update(&project.id, |p| p.status = ProjectStatus::Running)
            .unwrap();
        let err = collection.delete(&project.id).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }
}
