use crate::registry::error::{RegistryError, RegistryResult};
use crate::registry::types::{CanisterId, NewStorage, Principal, StageCursor, StorageRecord};
use crate::registry::CreationStatus;
use sqlx::{Row, SqlitePool};

/// Durable store of storage records, keyed by a monotonically increasing id.
pub struct StorageRegistry {
    pool: SqlitePool,
}

impl StorageRegistry {
    pub async fn new(pool: SqlitePool) -> RegistryResult<Self> {
        // AUTOINCREMENT keeps ids of deleted records from being reused
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS storages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                canister_id TEXT,
                active INTEGER NOT NULL,
                record TEXT NOT NULL,
                cursor TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_storages_owner ON storages(owner)")
            .execute(&pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_storages_canister ON storages(canister_id)")
            .execute(&pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_storages_active ON storages(active)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Insert a `Pending` record and return it with its id.
    pub async fn insert(&self, new: NewStorage) -> RegistryResult<StorageRecord> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO storages (owner, canister_id, active, record, created_at, updated_at)
            VALUES (?, ?, 1, '{}', ?, ?)
            "#,
        )
        .bind(new.owner.as_str())
        .bind(new.canister_id.as_ref().map(|c| c.as_str().to_string()))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let record = StorageRecord {
            id: result.last_insert_rowid() as u64,
            owner: new.owner,
            canister_id: new.canister_id,
            release_tag: new.release_tag,
            release_selector: new.release_selector,
            target: new.target,
            init_arg: new.init_arg,
            status: CreationStatus::Pending,
            created_at: now,
            completed_at: None,
            upgrade: None,
            update_available: None,
        };

        sqlx::query("UPDATE storages SET record = ? WHERE id = ?")
            .bind(serde_json::to_string(&record)?)
            .bind(record.id as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(record)
    }

    /// Persist the record's current state.
    pub async fn save(&self, record: &StorageRecord) -> RegistryResult<()> {
        let mut stored = record.clone();
        stored.update_available = None;

        let result = sqlx::query(
            r#"
            UPDATE storages
            SET owner = ?, canister_id = ?, active = ?, record = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(stored.owner.as_str())
        .bind(stored.canister_id.as_ref().map(|c| c.as_str().to_string()))
        .bind(stored.is_active())
        .bind(serde_json::to_string(&stored)?)
        .bind(chrono::Utc::now().timestamp())
        .bind(stored.id as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(record.id));
        }
        Ok(())
    }

    pub async fn get(&self, id: u64) -> RegistryResult<Option<StorageRecord>> {
        let row = sqlx::query("SELECT record FROM storages WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row.try_get::<String, _>("record")?)?)),
            None => Ok(None),
        }
    }

    pub async fn find_by_canister(
        &self,
        canister_id: &CanisterId,
    ) -> RegistryResult<Option<StorageRecord>> {
        let records = self
            .query_records(
                "SELECT record FROM storages WHERE canister_id = ? ORDER BY id",
                Some(canister_id.as_str()),
            )
            .await?;
        Ok(records.into_iter().next())
    }

    pub async fn list_by_owner(&self, owner: &Principal) -> RegistryResult<Vec<StorageRecord>> {
        self.query_records(
            "SELECT record FROM storages WHERE owner = ? ORDER BY id",
            Some(owner.as_str()),
        )
        .await
    }

    pub async fn list_all(&self) -> RegistryResult<Vec<StorageRecord>> {
        self.query_records("SELECT record FROM storages ORDER BY id", None).await
    }

    /// Records the scheduler still has to advance.
    pub async fn list_active(&self) -> RegistryResult<Vec<StorageRecord>> {
        self.query_records("SELECT record FROM storages WHERE active = 1 ORDER BY id", None)
            .await
    }

    async fn query_records(
        &self,
        sql: &str,
        param: Option<&str>,
    ) -> RegistryResult<Vec<StorageRecord>> {
        let mut query = sqlx::query(sql);
        if let Some(param) = param {
            query = query.bind(param);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(serde_json::from_str(&row.try_get::<String, _>("record")?)?);
        }
        Ok(records)
    }

    /// Delete a record; returns whether it existed.
    pub async fn delete(&self, id: u64) -> RegistryResult<bool> {
        let result = sqlx::query("DELETE FROM storages WHERE id = ?")
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn cursor(&self, id: u64) -> RegistryResult<StageCursor> {
        let row = sqlx::query("SELECT cursor FROM storages WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RegistryError::NotFound(id))?;

        match row.try_get::<Option<String>, _>("cursor")? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(StageCursor::default()),
        }
    }

    pub async fn set_cursor(&self, id: u64, cursor: &StageCursor) -> RegistryResult<()> {
        sqlx::query("UPDATE storages SET cursor = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(cursor)?)
            .bind(chrono::Utc::now().timestamp())
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_cursor(&self, id: u64) -> RegistryResult<()> {
        sqlx::query("UPDATE storages SET cursor = NULL WHERE id = ?")
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::release::ReleaseSelector;
    use crate::registry::types::{Progress, StorageTarget};

    async fn registry() -> StorageRegistry {
        StorageRegistry::new(db::connect("sqlite::memory:").await.unwrap())
            .await
            .unwrap()
    }

    fn new_storage(owner: &str, canister: Option<&str>) -> NewStorage {
        NewStorage {
            owner: Principal::new(owner),
            canister_id: canister.map(CanisterId::new),
            release_tag: "v1".into(),
            release_selector: ReleaseSelector::Latest,
            target: match canister {
                Some(id) => StorageTarget::Existing {
                    canister_id: CanisterId::new(id),
                },
                None => StorageTarget::Create {
                    initial_cycles: 1,
                    subnet_hint: None,
                },
            },
            init_arg: vec![],
        }
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let registry = registry().await;

        let record = registry.insert(new_storage("alice", None)).await.unwrap();
        assert_eq!(record.status, CreationStatus::Pending);

        let loaded = registry.get(record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(registry.get(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ids_are_never_reused() {
        let registry = registry().await;

        let first = registry.insert(new_storage("alice", None)).await.unwrap();
        let second = registry.insert(new_storage("bob", None)).await.unwrap();
        assert!(registry.delete(second.id).await.unwrap());

        let third = registry.insert(new_storage("carol", None)).await.unwrap();
        assert!(first.id < second.id && second.id < third.id);
    }

    #[tokio::test]
    async fn test_active_tracks_status() {
        let registry = registry().await;
        let mut record = registry.insert(new_storage("alice", Some("c1"))).await.unwrap();
        assert_eq!(registry.list_active().await.unwrap().len(), 1);

        record.status = CreationStatus::Completed {
            canister_id: CanisterId::new("c1"),
        };
        registry.save(&record).await.unwrap();
        assert!(registry.list_active().await.unwrap().is_empty());

        let found = registry
            .find_by_canister(&CanisterId::new("c1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, record.id);
    }

    #[tokio::test]
    async fn test_list_by_owner() {
        let registry = registry().await;
        registry.insert(new_storage("alice", None)).await.unwrap();
        registry.insert(new_storage("bob", None)).await.unwrap();
        registry.insert(new_storage("alice", None)).await.unwrap();

        assert_eq!(registry.list_by_owner(&Principal::new("alice")).await.unwrap().len(), 2);
        assert_eq!(registry.list_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cursor_round_trip() {
        let registry = registry().await;
        let mut record = registry.insert(new_storage("alice", None)).await.unwrap();
        assert_eq!(registry.cursor(record.id).await.unwrap(), StageCursor::default());

        let cursor = StageCursor {
            batch_id: Some(7),
            chunk_ids: vec![1, 2, 3],
            ..Default::default()
        };
        registry.set_cursor(record.id, &cursor).await.unwrap();

        // Saving the record leaves the cursor alone
        record.status = CreationStatus::UploadingFrontend {
            canister_id: CanisterId::new("c1"),
            progress: Progress::new(3, 10),
        };
        registry.save(&record).await.unwrap();
        assert_eq!(registry.cursor(record.id).await.unwrap(), cursor);

        registry.clear_cursor(record.id).await.unwrap();
        assert_eq!(registry.cursor(record.id).await.unwrap(), StageCursor::default());
    }

    #[tokio::test]
    async fn test_save_missing_record() {
        let registry = registry().await;
        let mut record = registry.insert(new_storage("alice", None)).await.unwrap();
        registry.delete(record.id).await.unwrap();

        record.status = CreationStatus::CheckingAllowance;
        assert!(matches!(
            registry.save(&record).await,
            Err(RegistryError::NotFound(_))
        ));
    }
}
