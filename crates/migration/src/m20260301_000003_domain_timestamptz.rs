use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // 旧的无时区时间戳按 UTC 写入
        manager
            .get_connection()
            .execute_unprepared("SET LOCAL TIME ZONE 'UTC'")
            .await?;

        let mut alter = Table::alter();
        alter.table(CustomDomainEntity::Table);
        for column in CustomDomainEntity::nullable() {
            alter.modify_column(ColumnDef::new(column).timestamp_with_time_zone().null());
        }
        for column in CustomDomainEntity::required() {
            alter.modify_column(ColumnDef::new(column).timestamp_with_time_zone().not_null());
        }
        manager.alter_table(alter.to_owned()).await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared("SET LOCAL TIME ZONE 'UTC'")
            .await?;

        let mut alter = Table::alter();
        alter.table(CustomDomainEntity::Table);
        for column in CustomDomainEntity::nullable() {
            alter.modify_column(ColumnDef::new(column).timestamp().null());
        }
        for column in CustomDomainEntity::required() {
            alter.modify_column(ColumnDef::new(column).timestamp().not_null());
        }
        manager.alter_table(alter.to_owned()).await?;

        Ok(())
    }
}

#[derive(Iden, Clone, Copy)]
enum CustomDomainEntity {
    Table,
    #[iden = "dnsVerifiedAt"]
    DnsVerifiedAt,
    #[iden = "sslExpiresAt"]
    SslExpiresAt,
    #[iden = "lastCheckedAt"]
    LastCheckedAt,
    #[iden = "activatedAt"]
    ActivatedAt,
    #[iden = "lastErrorAt"]
    LastErrorAt,
    #[iden = "lastHealthCheckAt"]
    LastHealthCheckAt,
    #[iden = "createdAt"]
    CreatedAt,
    #[iden = "updatedAt"]
    UpdatedAt,
}

impl CustomDomainEntity {
    fn nullable() -> [Self; 6] {
        [
            Self::DnsVerifiedAt,
            Self::SslExpiresAt,
            Self::LastCheckedAt,
            Self::ActivatedAt,
            Self::LastErrorAt,
            Self::LastHealthCheckAt,
        ]
    }

    fn required() -> [Self; 2] {
        [Self::CreatedAt, Self::UpdatedAt]
    }
}
