use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_leads_table::Migration),
            Box::new(m20240601_000002_add_lead_referral_columns::Migration),
        ]
    }
}

mod m20240601_000001_create_leads_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_leads_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // Append-only; email is deliberately not unique
            manager
                .create_table(
                    Table::create()
                        .table(Leads::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Leads::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Leads::Name).string_len(100).not_null())
                        .col(ColumnDef::new(Leads::Email).string_len(255).not_null())
                        .col(ColumnDef::new(Leads::Phone).string_len(20).not_null())
                        .col(
                            ColumnDef::new(Leads::StorageDriver)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Leads::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_leads_email")
                        .table(Leads::Table)
                        .col(Leads::Email)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_leads_created_at")
                        .table(Leads::Table)
                        .col(Leads::CreatedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Leads::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Leads {
        Table,
        Id,
        Name,
        Email,
        Phone,
        StorageDriver,
        CreatedAt,
    }
}

mod m20240601_000002_add_lead_referral_columns {

    use super::m20240601_000001_create_leads_table::Leads;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_add_lead_referral_columns"
        }
    }

    #[derive(DeriveIden)]
    enum Referral {
        Referrer,
        UtmSource,
        UtmCampaign,
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // SQLite only supports one column per ALTER TABLE
            for column in [Referral::Referrer, Referral::UtmSource, Referral::UtmCampaign] {
                manager
                    .alter_table(
                        Table::alter()
                            .table(Leads::Table)
                            .add_column(ColumnDef::new(column).string_len(255).null())
                            .to_owned(),
                    )
                    .await?;
            }
            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            for column in [Referral::UtmCampaign, Referral::UtmSource, Referral::Referrer] {
                manager
                    .alter_table(
                        Table::alter()
                            .table(Leads::Table)
                            .drop_column(column)
                            .to_owned(),
                    )
                    .await?;
            }
            Ok(())
        }
    }
}
