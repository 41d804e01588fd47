//! Entity store gateway.
//!
//! The worker only ever touches applications and actors through
//! [`EntityStore::transaction`]: every read and the status write of one
//! attempt happen inside a single transaction, which commits when the
//! closure returns `Ok` and aborts otherwise.
//!
//! [`RedbStore`] backs this with a redb file. redb admits one write
//! transaction at a time, so a read-modify-write inside `transaction` is
//! serializable and two attempts against the same application can never
//! both act on the same previous status.

use std::path::Path;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use tracing::warn;

use crate::error::{AppflowError, Result};
use crate::types::{Actor, Application, ApplicationStatus};

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

const APPS: Table = TableDefinition::new("applications");
const ACTORS: Table = TableDefinition::new("actors");

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Handle scoped to one open transaction.
pub trait StoreTx {
    fn find_application(&self, id: &str) -> Result<Option<Application>>;

    fn find_actor(&self, id: &str) -> Result<Option<Actor>>;

    /// Write `status` to the application and return the updated record.
    fn update_status(&mut self, id: &str, status: ApplicationStatus) -> Result<Application>;
}

pub trait EntityStore: Send + Sync {
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T>;
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

pub struct RedbStore {
    db: Database,
}

struct RedbTx {
    wt: WriteTransaction,
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

impl RedbTx {
    fn find<T: serde::de::DeserializeOwned>(&self, def: Table, id: &str) -> Result<Option<T>> {
        let table = self.wt.open_table(def)?;
        let found = match table.get(id)? {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        Ok(found)
    }
}

impl StoreTx for RedbTx {
    fn find_application(&self, id: &str) -> Result<Option<Application>> {
        self.find(APPS, id)
    }

    fn find_actor(&self, id: &str) -> Result<Option<Actor>> {
        self.find(ACTORS, id)
    }

    fn update_status(&mut self, id: &str, status: ApplicationStatus) -> Result<Application> {
        let mut app: Application = self
            .find(APPS, id)?
            .ok_or_else(|| AppflowError::ApplicationNotFound(id.to_string()))?;
        app.status = status;
        app.updated_at = Utc::now();

        let value = serde_json::to_vec(&app)?;
        let mut table = self.wt.open_table(APPS)?;
        table.insert(id, value.as_slice())?;
        Ok(app)
    }
}

impl RedbStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        let wt = db.begin_write()?;
        wt.open_table(APPS)?;
        wt.open_table(ACTORS)?;
        wt.commit()?;
        Ok(Self { db })
    }

    fn put(&self, def: Table, id: &str, value: &[u8]) -> Result<()> {
        let wt = self.db.begin_write()?;
        {
            let mut table = wt.open_table(def)?;
            table.insert(id, value)?;
        }
        wt.commit()?;
        Ok(())
    }

    fn get<T: serde::de::DeserializeOwned>(&self, def: Table, id: &str) -> Result<Option<T>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(def)?;
        let found = match table.get(id)? {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        Ok(found)
    }

    fn all<T: serde::de::DeserializeOwned>(&self, def: Table) -> Result<Vec<T>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(def)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            result.push(decode(v.value())?);
        }
        Ok(result)
    }

    pub fn insert_application(&self, app: &Application) -> Result<()> {
        self.put(APPS, &app.id, &serde_json::to_vec(app)?)
    }

    pub fn insert_actor(&self, actor: &Actor) -> Result<()> {
        self.put(ACTORS, &actor.id, &serde_json::to_vec(actor)?)
    }

    pub fn get_application(&self, id: &str) -> Result<Application> {
        self.get(APPS, id)?
            .ok_or_else(|| AppflowError::ApplicationNotFound(id.to_string()))
    }

    pub fn get_actor(&self, id: &str) -> Result<Actor> {
        self.get(ACTORS, id)?
            .ok_or_else(|| AppflowError::ActorNotFound(id.to_string()))
    }

    /// Oldest first.
    pub fn list_applications(&self) -> Result<Vec<Application>> {
        let mut apps: Vec<Application> = self.all(APPS)?;
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(apps)
    }

    pub fn list_actors(&self) -> Result<Vec<Actor>> {
        let mut actors: Vec<Actor> = self.all(ACTORS)?;
        actors.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(actors)
    }
}

impl EntityStore for RedbStore {
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T>,
    {
        let mut tx = RedbTx {
            wt: self.db.begin_write()?,
        };
        match f(&mut tx) {
            Ok(value) => {
                tx.wt.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = tx.wt.abort() {
                    warn!(error = %abort, "abort after failed transaction also failed");
                }
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, RedbStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("store.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn insert_and_get() {
        let (_dir, store) = open_tmp();
        let owner = Actor::new("Acme", Role::Provider);
        let app = Application::new("Weather", &owner.id);
        store.insert_actor(&owner).unwrap();
        store.insert_application(&app).unwrap();

        assert_eq!(store.get_actor(&owner.id).unwrap().role, Role::Provider);
        let loaded = store.get_application(&app.id).unwrap();
        assert_eq!(loaded.name, "Weather");
        assert_eq!(loaded.owner_id, owner.id);
    }

    #[test]
    fn missing_records_are_reported() {
        let (_dir, store) = open_tmp();
        assert!(matches!(
            store.get_application("nope"),
            Err(AppflowError::ApplicationNotFound(_))
        ));
        assert!(matches!(
            store.get_actor("nope"),
            Err(AppflowError::ActorNotFound(_))
        ));
    }

    #[test]
    fn transaction_commits_on_ok() {
        let (_dir, store) = open_tmp();
        let app = Application::new("Weather", "p-1");
        store.insert_application(&app).unwrap();

        let updated = store
            .transaction(|tx| tx.update_status(&app.id, ApplicationStatus::Pending))
            .unwrap();
        assert_eq!(updated.status, ApplicationStatus::Pending);
        assert_eq!(
            store.get_application(&app.id).unwrap().status,
            ApplicationStatus::Pending
        );
    }

    #[test]
    fn transaction_aborts_on_err() {
        let (_dir, store) = open_tmp();
        let app = Application::new("Weather", "p-1");
        store.insert_application(&app).unwrap();

        let result: Result<()> = store.transaction(|tx| {
            tx.update_status(&app.id, ApplicationStatus::Pending)?;
            Err(AppflowError::Conflict("forced".into()))
        });
        assert!(result.is_err());
        assert_eq!(
            store.get_application(&app.id).unwrap().status,
            ApplicationStatus::Draft
        );
    }

    #[test]
    fn transaction_reads_its_own_writes() {
        let (_dir, store) = open_tmp();
        let app = Application::new("Weather", "p-1");
        store.insert_application(&app).unwrap();

        let seen = store
            .transaction(|tx| {
                tx.update_status(&app.id, ApplicationStatus::Pending)?;
                Ok(tx.find_application(&app.id)?.map(|a| a.status))
            })
            .unwrap();
        assert_eq!(seen, Some(ApplicationStatus::Pending));
    }

    #[test]
    fn update_of_missing_application_fails() {
        let (_dir, store) = open_tmp();
        let err = store
            .transaction(|tx| tx.update_status("ghost", ApplicationStatus::Pending))
            .unwrap_err();
        assert!(matches!(err, AppflowError::ApplicationNotFound(_)));
    }

    #[test]
    fn listings_are_oldest_first() {
        let (_dir, store) = open_tmp();
        let first = Application::new("First", "p-1");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = Application::new("Second", "p-1");
        store.insert_application(&second).unwrap();
        store.insert_application(&first).unwrap();

        let names: Vec<String> = store
            .list_applications()
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["First", "Second"]);
        assert!(store.list_actors().unwrap().is_empty());
    }
}
