use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .alter_table(
                Table::alter()
                    .table(CustomDomainEntity::Table)
                    .add_column_if_not_exists(
                        ColumnDef::new(CustomDomainEntity::DnsCheckStartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .add_column_if_not_exists(
                        ColumnDef::new(CustomDomainEntity::LeaseOwner).string().null(),
                    )
                    .add_column_if_not_exists(
                        ColumnDef::new(CustomDomainEntity::LeaseExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("IDX_CUSTOM_DOMAIN_LEASE")
                    .table(CustomDomainEntity::Table)
                    .col(CustomDomainEntity::LeaseExpiresAt)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("IDX_CUSTOM_DOMAIN_LEASE")
                    .table(CustomDomainEntity::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .alter_table(
                Table::alter()
                    .table(CustomDomainEntity::Table)
                    .drop_column(CustomDomainEntity::DnsCheckStartedAt)
                    .drop_column(CustomDomainEntity::LeaseOwner)
                    .drop_column(CustomDomainEntity::LeaseExpiresAt)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
}

#[derive(Iden)]
enum CustomDomainEntity {
    Table,
    #[iden = "dnsCheckStartedAt"]
    DnsCheckStartedAt,
    #[iden = "leaseOwner"]
    LeaseOwner,
    #[iden = "leaseExpiresAt"]
    LeaseExpiresAt,
}
