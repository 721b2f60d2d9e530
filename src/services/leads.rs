use crate::db::DbPool;
use crate::entities::lead;
use crate::errors::{ServiceError, ServiceResult};
use crate::models::{Lead, LeadRecord, StorageDriver};
use crate::webhooks::{SpreadsheetRelay, SpreadsheetRow};
use async_trait::async_trait;
use metrics::counter;
use sea_orm::{ActiveModelTrait, ConnectionTrait, EntityTrait, PaginatorTrait};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Durable, append-only lead storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Insert one lead and return it with its generated id.
    async fn insert(&self, lead: &Lead) -> ServiceResult<LeadRecord>;

    async fn find_by_id(&self, id: Uuid) -> ServiceResult<Option<LeadRecord>>;

    async fn count(&self) -> ServiceResult<u64>;
}

/// Lead store backed by the relational database.
#[derive(Clone)]
pub struct SeaOrmLeadStore {
    db: Arc<DbPool>,
}

impl SeaOrmLeadStore {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    pub fn storage_driver(&self) -> StorageDriver {
        self.db.get_database_backend().into()
    }
}

#[async_trait]
impl LeadStore for SeaOrmLeadStore {
    async fn insert(&self, lead: &Lead) -> ServiceResult<LeadRecord> {
        let model = lead::ActiveModel::from_lead(Uuid::new_v4(), lead, self.storage_driver())
            .insert(&*self.db)
            .await?;
        Ok(LeadRecord::try_from(model)?)
    }

    async fn find_by_id(&self, id: Uuid) -> ServiceResult<Option<LeadRecord>> {
        let model = lead::Entity::find_by_id(id).one(&*self.db).await?;
        Ok(model.map(LeadRecord::try_from).transpose()?)
    }

    async fn count(&self) -> ServiceResult<u64> {
        Ok(lead::Entity::find().count(&*self.db).await?)
    }
}

/// Persists captured leads and relays them to the spreadsheet.
#[derive(Clone)]
pub struct LeadService {
    store: Arc<dyn LeadStore>,
    relay: SpreadsheetRelay,
}

impl LeadService {
    pub fn new(store: Arc<dyn LeadStore>, relay: SpreadsheetRelay) -> Self {
        Self { store, relay }
    }

    /// Saves a validated lead.
    ///
    /// The database write is awaited and its failure is returned as a
    /// persistence failure. The spreadsheet relay runs on its own task and
    /// never affects the result.
    #[instrument(skip(self, lead), fields(email = %lead.email))]
    pub async fn save_lead(&self, lead: Lead) -> ServiceResult<LeadRecord> {
        let record = self.store.insert(&lead).await.map_err(|e| {
            error!("Failed to persist lead: {}", e);
            counter!("enrollment_leads.persist_failures", 1);
            match e {
                ServiceError::PersistenceFailure(_) => e,
                other => ServiceError::persistence(other.to_string()),
            }
        })?;

        counter!("enrollment_leads.saved", 1);
        info!(lead_id = %record.id, driver = %record.storage_driver, "Lead saved");

        self.relay.send_async(SpreadsheetRow::from(&record.lead));

        Ok(record)
    }

    pub async fn find_lead(&self, id: Uuid) -> ServiceResult<LeadRecord> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("lead {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection, run_migrations};
    use chrono::Utc;

    fn lead(email: &str) -> Lead {
        Lead {
            name: "Ada Lovelace".into(),
            email: email.into(),
            phone: "5551234567".into(),
            referral: Default::default(),
            created_at: Utc::now(),
        }
    }

    async fn sqlite_store() -> SeaOrmLeadStore {
        let db = establish_connection("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        SeaOrmLeadStore::new(Arc::new(db))
    }

    #[tokio::test]
    async fn duplicate_emails_are_separate_leads() {
        let store = sqlite_store().await;
        let service = LeadService::new(Arc::new(store.clone()), SpreadsheetRelay::disabled());

        let first = service.save_lead(lead("ada@example.com")).await.unwrap();
        let second = service.save_lead(lead("ada@example.com")).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.storage_driver, StorageDriver::Sqlite);
        assert_eq!(store.count().await.unwrap(), 2);

        let found = service.find_lead(first.id).await.unwrap();
        assert_eq!(found.lead.email, "ada@example.com");
    }

    #[tokio::test]
    async fn store_failures_surface_as_persistence_failures() {
        let mut store = MockLeadStore::new();
        store
            .expect_insert()
            .returning(|_| Err(ServiceError::Internal("connection reset".into())));

        let service = LeadService::new(Arc::new(store), SpreadsheetRelay::disabled());
        let err = service.save_lead(lead("ada@example.com")).await.unwrap_err();

        assert!(matches!(err, ServiceError::PersistenceFailure(_)));
        assert_eq!(err.response_message(), "Signup failed, please try again");
    }

    #[tokio::test]
    async fn unknown_lead_is_not_found() {
        let store = sqlite_store().await;
        let service = LeadService::new(Arc::new(store), SpreadsheetRelay::disabled());
        assert!(matches!(
            service.find_lead(Uuid::new_v4()).await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
