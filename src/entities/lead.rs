use crate::models::{Lead, LeadRecord, Referral, StorageDriver};
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::ActiveValue::Set;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "leads")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub storage_driver: String,
    pub referrer: Option<String>,
    pub utm_source: Option<String>,
    pub utm_campaign: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl ActiveModel {
    /// New row for a validated lead.
    pub fn from_lead(id: Uuid, lead: &Lead, driver: StorageDriver) -> Self {
        Self {
            id: Set(id),
            name: Set(lead.name.clone()),
            email: Set(lead.email.clone()),
            phone: Set(lead.phone.clone()),
            storage_driver: Set(driver.to_string()),
            referrer: Set(lead.referral.referrer.clone()),
            utm_source: Set(lead.referral.utm_source.clone()),
            utm_campaign: Set(lead.referral.utm_campaign.clone()),
            created_at: Set(lead.created_at),
        }
    }
}

impl TryFrom<Model> for LeadRecord {
    type Error = DbErr;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let storage_driver = StorageDriver::from_str(&model.storage_driver).map_err(|_| {
            DbErr::Type(format!("unknown storage driver '{}'", model.storage_driver))
        })?;

        Ok(LeadRecord {
            id: model.id,
            lead: Lead {
                name: model.name,
                email: model.email,
                phone: model.phone,
                referral: Referral {
                    referrer: model.referrer,
                    utm_source: model.utm_source,
                    utm_campaign: model.utm_campaign,
                },
                created_at: model.created_at,
            },
            storage_driver,
        })
    }
}
