use chrono::{DateTime, Utc};
use sea_orm::DbBackend;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use utoipa::ToSchema;
use uuid::Uuid;

/// Raw lead form body as posted by the browser. Every field is optional so
/// that missing fields surface as validation errors rather than a body
/// rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({
    "name": "Ada Lovelace",
    "email": "ada@example.com",
    "phone": "+1 (555) 123-4567",
    "promotionCode": "EARLY36",
    "utmSource": "newsletter"
}))]
pub struct LeadSubmission {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Passed through to checkout; never validated locally
    pub promotion_code: Option<String>,
    pub referrer: Option<String>,
    pub utm_source: Option<String>,
    pub utm_campaign: Option<String>,
}

/// Where a visitor came from, as reported by the landing page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Referral {
    pub referrer: Option<String>,
    pub utm_source: Option<String>,
    pub utm_campaign: Option<String>,
}

impl Referral {
    pub fn is_empty(&self) -> bool {
        self.referrer.is_none() && self.utm_source.is_none() && self.utm_campaign.is_none()
    }
}

/// A validated, sanitized lead. Constructed only by the lead validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub referral: Referral,
    pub created_at: DateTime<Utc>,
}

impl Lead {
    /// The same lead as a raw submission, used to re-validate stored values.
    pub fn to_submission(&self) -> LeadSubmission {
        LeadSubmission {
            name: Some(self.name.clone()),
            email: Some(self.email.clone()),
            phone: Some(self.phone.clone()),
            promotion_code: None,
            referrer: self.referral.referrer.clone(),
            utm_source: self.referral.utm_source.clone(),
            utm_campaign: self.referral.utm_campaign.clone(),
        }
    }
}

/// Backing store that accepted a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StorageDriver {
    Postgres,
    Sqlite,
    Mysql,
}

impl From<DbBackend> for StorageDriver {
    fn from(backend: DbBackend) -> Self {
        match backend {
            DbBackend::Postgres => StorageDriver::Postgres,
            DbBackend::Sqlite => StorageDriver::Sqlite,
            DbBackend::MySql => StorageDriver::Mysql,
        }
    }
}

/// A lead as persisted by the lead store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub lead: Lead,
    pub storage_driver: StorageDriver,
}
