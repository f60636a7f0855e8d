//! Per-type profile store: directory scan, CRUD, atomic writes, and
//! change events. Generic over the profile type so the four stores
//! (serial/socat/power-supply/job) share one implementation instead of
//! four hand-copied ones.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::profiles::model::{ProfileBase, ProfileKind};
use crate::profiles::validator::{ensure_unique_name, is_name_unique, next_available_id};

/// Implemented by every profile type so [`ProfileStore`] can treat them
/// uniformly.
pub trait ProfileRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn kind() -> ProfileKind;
    fn base(&self) -> &ProfileBase;
    fn base_mut(&mut self) -> &mut ProfileBase;
}

/// What changed, published after every successful mutation.
#[derive(Debug, Clone)]
pub enum ProfileChange {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ProfileChangeEvent {
    pub kind: ProfileKind,
    pub id: i64,
    pub change: ProfileChange,
}

/// A factory for the hard-coded system default a store materializes the
/// first time it is opened with zero entries.
pub type DefaultFactory<T> = Arc<dyn Fn() -> T + Send + Sync>;

pub struct ProfileStore<T: ProfileRecord> {
    base_path: PathBuf,
    records: Mutex<HashMap<i64, T>>,
    default_factory: DefaultFactory<T>,
    events: broadcast::Sender<ProfileChangeEvent>,
}

impl<T: ProfileRecord> ProfileStore<T> {
    /// Scans `<profiles_base_path>/<kind directory>` and loads every
    /// `*.json` file found, indexing by Id.
    #[instrument(skip(default_factory), fields(kind = ?T::kind()))]
    pub async fn load(profiles_base_path: &std::path::Path, default_factory: DefaultFactory<T>) -> Result<Self> {
        let base_path = profiles_base_path.join(T::kind().directory_name());
        tokio::fs::create_dir_all(&base_path)
            .await
            .map_err(|e| Error::internal(format!("could not create {}", base_path.display())).with_source(e))?;

        let mut records = HashMap::new();
        let mut dir = tokio::fs::read_dir(&base_path)
            .await
            .map_err(|e| Error::internal(format!("could not scan {}", base_path.display())).with_source(e))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| Error::internal("error reading profile directory entry").with_source(e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                    Ok(record) => {
                        records.insert(record.base().id, record);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable profile file"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable profile file"),
            }
        }

        debug!(count = records.len(), "loaded profile store");

        let (tx, _rx) = broadcast::channel(64);
        let store = Self {
            base_path,
            records: Mutex::new(records),
            default_factory,
            events: tx,
        };
        store.ensure_default_exists().await?;
        Ok(store)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProfileChangeEvent> {
        self.events.subscribe()
    }

    fn publish(&self, id: i64, change: ProfileChange) {
        let _ = self.events.send(ProfileChangeEvent {
            kind: T::kind(),
            id,
            change,
        });
    }

    fn file_path(&self, id: i64) -> PathBuf {
        self.base_path.join(format!("{id}.json"))
    }

    /// Write-temp-then-rename, per 4.3.
    async fn write_atomic(&self, record: &T) -> Result<()> {
        let path = self.file_path(record.base().id);
        let tmp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::internal("failed to serialize profile").with_source(e))?;
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| Error::internal(format!("failed to write {}", tmp_path.display())).with_source(e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| Error::internal(format!("failed to finalize {}", path.display())).with_source(e))?;
        Ok(())
    }

    async fn remove_file(&self, id: i64) -> Result<()> {
        let path = self.file_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::internal(format!("failed to remove {}", path.display())).with_source(e)),
        }
    }

    pub async fn get_all(&self) -> Vec<T> {
        self.records.lock().await.values().cloned().collect()
    }

    pub async fn get_by_id(&self, id: i64) -> Result<T> {
        self.records
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("profile {id} not found")))
    }

    pub async fn get_default(&self) -> Option<T> {
        self.records
            .lock()
            .await
            .values()
            .find(|r| r.base().is_default)
            .cloned()
    }

    pub async fn is_name_unique(&self, candidate: &str, exclude_id: Option<i64>) -> bool {
        let guard = self.records.lock().await;
        let existing: Vec<(i64, String)> = guard
            .values()
            .map(|r| (r.base().id, r.base().name.clone()))
            .collect();
        is_name_unique(&existing, candidate, exclude_id)
    }

    pub async fn ensure_unique_name(&self, base_name: &str) -> Result<String> {
        let guard = self.records.lock().await;
        let existing: Vec<(i64, String)> = guard
            .values()
            .map(|r| (r.base().id, r.base().name.clone()))
            .collect();
        ensure_unique_name(base_name, &existing)
    }

    pub async fn get_next_available_id(&self) -> i64 {
        let guard = self.records.lock().await;
        let ids: Vec<i64> = guard.keys().copied().collect();
        next_available_id(&ids)
    }

    #[instrument(skip(self, record), fields(kind = ?T::kind()))]
    pub async fn create(&self, mut record: T) -> Result<T> {
        let mut guard = self.records.lock().await;
        let existing: Vec<(i64, String)> = guard
            .values()
            .map(|r| (r.base().id, r.base().name.clone()))
            .collect();
        if !is_name_unique(&existing, &record.base().name, None) {
            return Err(Error::conflict(format!(
                "a profile named '{}' already exists",
                record.base().name
            )));
        }
        let ids: Vec<i64> = guard.keys().copied().collect();
        let id = next_available_id(&ids);
        let base = record.base_mut();
        base.id = id;
        let now = chrono::Utc::now();
        base.created_at = now;
        base.modified_at = now;

        self.write_atomic(&record).await?;
        guard.insert(id, record.clone());
        drop(guard);
        self.publish(id, ProfileChange::Created);
        Ok(record)
    }

    #[instrument(skip(self, updater), fields(kind = ?T::kind(), id))]
    pub async fn update(&self, id: i64, updater: impl FnOnce(&mut T)) -> Result<T> {
        let mut guard = self.records.lock().await;
        let mut record = guard
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("profile {id} not found")))?;
        if record.base().is_read_only {
            return Err(Error::unauthorized(format!(
                "profile {id} is read-only and cannot be updated"
            )));
        }
        updater(&mut record);
        record.base_mut().id = id;

        let existing: Vec<(i64, String)> = guard
            .values()
            .map(|r| (r.base().id, r.base().name.clone()))
            .collect();
        if !is_name_unique(&existing, &record.base().name, Some(id)) {
            return Err(Error::conflict(format!(
                "a profile named '{}' already exists",
                record.base().name
            )));
        }
        record.base_mut().touch();

        self.write_atomic(&record).await?;
        guard.insert(id, record.clone());
        drop(guard);
        self.publish(id, ProfileChange::Updated);
        Ok(record)
    }

    #[instrument(skip(self), fields(kind = ?T::kind(), id))]
    pub async fn delete(&self, id: i64) -> Result<()> {
        let mut guard = self.records.lock().await;
        let record = guard
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("profile {id} not found")))?;
        if record.base().is_read_only || record.base().is_default {
            return Err(Error::unauthorized(format!(
                "profile {id} is read-only or default and cannot be deleted"
            )));
        }
        self.remove_file(id).await?;
        guard.remove(&id);
        drop(guard);
        self.publish(id, ProfileChange::Deleted);
        Ok(())
    }

    pub async fn duplicate(&self, id: i64) -> Result<T> {
        let source = self.get_by_id(id).await?;
        let mut clone = source.clone();
        let base_name = format!("{} (copy)", clone.base().name);
        let new_name = self.ensure_unique_name(&base_name).await?;
        clone.base_mut().name = new_name;
        clone.base_mut().is_default = false;
        clone.base_mut().is_read_only = false;
        self.create(clone).await
    }

    /// Clears `IsDefault` on every other profile of this type, sets it on
    /// `id`. Idempotent: calling twice with the same id is a no-op on the
    /// second call.
    #[instrument(skip(self), fields(kind = ?T::kind(), id))]
    pub async fn set_default(&self, id: i64) -> Result<()> {
        let mut guard = self.records.lock().await;
        if !guard.contains_key(&id) {
            return Err(Error::not_found(format!("profile {id} not found")));
        }
        let mut to_write = Vec::new();
        for (record_id, record) in guard.iter_mut() {
            let should_be_default = *record_id == id;
            if record.base().is_default != should_be_default {
                record.base_mut().is_default = should_be_default;
                record.base_mut().touch();
                to_write.push(record.clone());
            }
        }
        drop(guard);
        for record in &to_write {
            self.write_atomic(record).await?;
        }
        if !to_write.is_empty() {
            self.publish(id, ProfileChange::Updated);
        }
        Ok(())
    }

    /// Materializes a hard-coded, read-only, default system profile the
    /// first time this store is opened with no entries.
    async fn ensure_default_exists(&self) -> Result<()> {
        let is_empty = self.records.lock().await.is_empty();
        if !is_empty {
            return Ok(());
        }
        let mut record = (self.default_factory)();
        let mut guard = self.records.lock().await;
        let ids: Vec<i64> = guard.keys().copied().collect();
        let id = next_available_id(&ids);
        record.base_mut().id = id;
        self.write_atomic(&record).await?;
        guard.insert(id, record);
        Ok(())
    }

    /// All-or-nothing: uniqueness is a name invariant (4.2), not an id
    /// one, so a name conflict is checked — and, with `replace_existing`,
    /// resolved — against whichever id currently holds that name, not just
    /// the incoming record's own id. Two incoming records sharing a name
    /// conflict unconditionally: no replace semantics can seat both.
    #[instrument(skip(self, incoming), fields(kind = ?T::kind(), count = incoming.len()))]
    pub async fn import(&self, incoming: Vec<T>, replace_existing: bool) -> Result<()> {
        let mut guard = self.records.lock().await;

        for (i, a) in incoming.iter().enumerate() {
            for b in incoming.iter().skip(i + 1) {
                if a.base().name.to_lowercase() == b.base().name.to_lowercase() {
                    return Err(Error::conflict(format!(
                        "import batch contains two profiles named '{}'",
                        a.base().name
                    )));
                }
            }
        }

        let incoming_ids: HashSet<i64> = incoming.iter().map(|r| r.base().id).collect();
        let mut ids_to_replace = Vec::new();
        for record in &incoming {
            let name_lower = record.base().name.to_lowercase();
            let colliding_id = guard
                .values()
                .find(|r| r.base().name.to_lowercase() == name_lower)
                .map(|r| r.base().id);
            if let Some(existing_id) = colliding_id {
                if existing_id != record.base().id {
                    if !replace_existing {
                        return Err(Error::conflict(format!(
                            "import conflicts with existing profile named '{}'",
                            record.base().name
                        )));
                    }
                    ids_to_replace.push(existing_id);
                }
            }
        }

        for record in &incoming {
            self.write_atomic(record).await?;
        }
        for id in ids_to_replace {
            if !incoming_ids.contains(&id) {
                self.remove_file(id).await?;
            }
            guard.remove(&id);
        }
        for record in incoming {
            let id = record.base().id;
            guard.insert(id, record);
        }
        Ok(())
    }

    pub async fn export(&self) -> Vec<T> {
        self.get_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::model::SerialPortProfile;

    fn default_factory() -> DefaultFactory<SerialPortProfile> {
        Arc::new(|| SerialPortProfile::new_default("/dev/ttyUSB0"))
    }

    async fn new_store() -> (tempfile::TempDir, ProfileStore<SerialPortProfile>) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::load(dir.path(), default_factory()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn bootstraps_a_read_only_default_on_an_empty_directory() {
        let (_dir, store) = new_store().await;
        let all = store.get_all().await;
        assert_eq!(all.len(), 1);
        let default = store.get_default().await.unwrap();
        assert_eq!(default.base.id, 1);
        assert!(default.base.is_default);
        assert!(default.base.is_read_only);
    }

    #[tokio::test]
    async fn default_profile_rejects_update_and_delete() {
        let (_dir, store) = new_store().await;
        let default = store.get_default().await.unwrap();

        let update_err = store.update(default.base.id, |p| p.base.description = "x".into()).await.unwrap_err();
        assert_eq!(update_err.kind(), crate::error::ErrorKind::Unauthorized);

        let delete_err = store.delete(default.base.id).await.unwrap_err();
        assert_eq!(delete_err.kind(), crate::error::ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn id_gap_filling_reuses_the_lowest_deleted_id() {
        let (_dir, store) = new_store().await;
        // id 1 is already the bootstrap default; create three more.
        let mut ids = Vec::new();
        for n in 0..3 {
            let mut profile = SerialPortProfile::new_default(format!("/dev/ttyUSB{n}"));
            profile.base.name = format!("serial-{n}");
            ids.push(store.create(profile).await.unwrap().base.id);
        }
        assert_eq!(ids, vec![2, 3, 4]);

        store.delete(3).await.unwrap();
        let mut fourth = SerialPortProfile::new_default("/dev/ttyUSB9");
        fourth.base.name = "serial-fourth".into();
        let created = store.create(fourth).await.unwrap();
        assert_eq!(created.base.id, 3);
    }

    #[tokio::test]
    async fn export_then_import_replace_existing_round_trips() {
        let (_dir, store) = new_store().await;
        let mut extra = SerialPortProfile::new_default("/dev/ttyUSB1");
        extra.base.name = "extra".into();
        store.create(extra).await.unwrap();

        let exported = store.export().await;
        assert_eq!(exported.len(), 2);

        let (_dir2, store2) = new_store().await;
        store2.import(exported.clone(), true).await.unwrap();
        let mut reimported = store2.export().await;
        let mut original = exported;
        reimported.sort_by_key(|p| p.base.id);
        original.sort_by_key(|p| p.base.id);
        assert_eq!(reimported.len(), original.len());
        for (a, b) in reimported.iter().zip(original.iter()) {
            assert_eq!(a.base.id, b.base.id);
            assert_eq!(a.base.name, b.base.name);
        }
    }

    #[tokio::test]
    async fn import_without_replace_conflicts_on_duplicate_name() {
        let (_dir, store) = new_store().await;
        let default = store.get_default().await.unwrap();
        let mut colliding = default.clone();
        colliding.base.id = 99;
        let err = store.import(vec![colliding], false).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    /// A name conflict is resolved by removing whichever id currently
    /// holds that name, not by keying on the incoming record's own id —
    /// otherwise the store would end up with two profiles sharing a name.
    #[tokio::test]
    async fn import_with_replace_existing_overwrites_by_name_not_id() {
        let (_dir, store) = new_store().await;
        let default = store.get_default().await.unwrap();
        assert_eq!(default.base.id, 1);

        let mut colliding = default.clone();
        colliding.base.id = 99;
        colliding.base.description = "replacement".into();
        store.import(vec![colliding], true).await.unwrap();

        let all = store.get_all().await;
        assert_eq!(all.len(), 1);
        let only = &all[0];
        assert_eq!(only.base.id, 99);
        assert_eq!(only.base.description, "replacement");
    }

    #[tokio::test]
    async fn import_batch_with_duplicate_names_conflicts_even_with_replace() {
        let (_dir, store) = new_store().await;
        let mut a = SerialPortProfile::new_default("/dev/ttyUSB1");
        a.base.id = 10;
        a.base.name = "duplicate".into();
        let mut b = SerialPortProfile::new_default("/dev/ttyUSB2");
        b.base.id = 11;
        b.base.name = "duplicate".into();
        let err = store.import(vec![a, b], true).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn set_default_is_idempotent() {
        let (_dir, store) = new_store().await;
        let mut second = SerialPortProfile::new_default("/dev/ttyUSB2");
        second.base.name = "second".into();
        let second = store.create(second).await.unwrap();

        store.set_default(second.base.id).await.unwrap();
        let after_first = store.get_default().await.unwrap();
        store.set_default(second.base.id).await.unwrap();
        let after_second = store.get_default().await.unwrap();
        assert_eq!(after_first.base.id, after_second.base.id);
        assert_eq!(store.get_all().await.iter().filter(|p| p.base.is_default).count(), 1);
    }
}
