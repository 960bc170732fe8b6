use sea_orm_migration::prelude::extension::postgres::Type;
use sea_orm_migration::prelude::*;

const STATUS_ENUM: &str = "custom_domain_entity_status_enum";
const STATUSES: [&str; 8] = [
    "pending",
    "verifying_dns",
    "dns_verified",
    "generating_ssl",
    "active",
    "failed",
    "expired",
    "suspended",
];

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // 已由 Web 后端建好表的数据库保持原样
        if manager.has_table("custom_domain_entity").await? {
            return Ok(());
        }

        manager
            .create_type(
                Type::create()
                    .as_enum(Alias::new(STATUS_ENUM))
                    .values(STATUSES.iter().map(|s| Alias::new(*s)))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(CustomDomainEntity::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CustomDomainEntity::Id)
                            .uuid()
                            .not_null()
                            .primary_key()
                            .default(Expr::cust("gen_random_uuid()")),
                    )
                    .col(
                        ColumnDef::new(CustomDomainEntity::Domain)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(CustomDomainEntity::BioId).uuid().not_null())
                    .col(ColumnDef::new(CustomDomainEntity::UserId).uuid().not_null())
                    .col(
                        ColumnDef::new(CustomDomainEntity::Status)
                            .enumeration(
                                Alias::new(STATUS_ENUM),
                                STATUSES.iter().map(|s| Alias::new(*s)),
                            )
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(CustomDomainEntity::ErrorMessage).string().null())
                    .col(ColumnDef::new(CustomDomainEntity::ExpectedDnsValue).string().null())
                    .col(ColumnDef::new(CustomDomainEntity::DnsVerifiedAt).timestamp().null())
                    .col(ColumnDef::new(CustomDomainEntity::ActualDnsValue).string().null())
                    .col(
                        ColumnDef::new(CustomDomainEntity::SslActive)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(CustomDomainEntity::SslExpiresAt).timestamp().null())
                    .col(
                        ColumnDef::new(CustomDomainEntity::SslCertificatePath)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CustomDomainEntity::SslPrivateKeyPath)
                            .string()
                            .null(),
                    )
                    .col(ColumnDef::new(CustomDomainEntity::LastCheckedAt).timestamp().null())
                    .col(ColumnDef::new(CustomDomainEntity::ActivatedAt).timestamp().null())
                    .col(
                        ColumnDef::new(CustomDomainEntity::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(CustomDomainEntity::LastErrorAt).timestamp().null())
                    .col(
                        ColumnDef::new(CustomDomainEntity::RedirectWww)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(CustomDomainEntity::ForceHttps)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(CustomDomainEntity::RedirectTo).string().null())
                    .col(
                        ColumnDef::new(CustomDomainEntity::VerificationToken)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CustomDomainEntity::LastHealthCheckAt)
                            .timestamp()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CustomDomainEntity::IsHealthy)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(CustomDomainEntity::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(CustomDomainEntity::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        for (name, column) in [
            ("IDX_CUSTOM_DOMAIN_DOMAIN", CustomDomainEntity::Domain),
            ("IDX_CUSTOM_DOMAIN_BIO", CustomDomainEntity::BioId),
            ("IDX_CUSTOM_DOMAIN_USER", CustomDomainEntity::UserId),
            ("IDX_CUSTOM_DOMAIN_STATUS", CustomDomainEntity::Status),
        ] {
            manager
                .create_index(
                    Index::create()
                        .name(name)
                        .table(CustomDomainEntity::Table)
                        .col(column)
                        .to_owned(),
                )
                .await?;
        }

        // bio / user 表属于 Web 后端，独立部署依赖级联删除接口
        for (name, column, owner) in [
            ("FK_CUSTOM_DOMAIN_BIO", CustomDomainEntity::BioId, "bio_entity"),
            ("FK_CUSTOM_DOMAIN_USER", CustomDomainEntity::UserId, "user_entity"),
        ] {
            if !manager.has_table(owner).await? {
                continue;
            }
            manager
                .create_foreign_key(
                    ForeignKey::create()
                        .name(name)
                        .from(CustomDomainEntity::Table, column)
                        .to(Alias::new(owner), Alias::new("id"))
                        .on_delete(ForeignKeyAction::Cascade)
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(CustomDomainEntity::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        manager
            .drop_type(
                Type::drop()
                    .if_exists()
                    .name(Alias::new(STATUS_ENUM))
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
}

#[derive(Iden)]
enum CustomDomainEntity {
    Table,
    Id,
    Domain,
    #[iden = "bioId"]
    BioId,
    #[iden = "userId"]
    UserId,
    Status,
    #[iden = "errorMessage"]
    ErrorMessage,
    #[iden = "expectedDnsValue"]
    ExpectedDnsValue,
    #[iden = "dnsVerifiedAt"]
    DnsVerifiedAt,
    #[iden = "actualDnsValue"]
    ActualDnsValue,
    #[iden = "sslActive"]
    SslActive,
    #[iden = "sslExpiresAt"]
    SslExpiresAt,
    #[iden = "sslCertificatePath"]
    SslCertificatePath,
    #[iden = "sslPrivateKeyPath"]
    SslPrivateKeyPath,
    #[iden = "lastCheckedAt"]
    LastCheckedAt,
    #[iden = "activatedAt"]
    ActivatedAt,
    #[iden = "retryCount"]
    RetryCount,
    #[iden = "lastErrorAt"]
    LastErrorAt,
    #[iden = "redirectWww"]
    RedirectWww,
    #[iden = "forceHttps"]
    ForceHttps,
    #[iden = "redirectTo"]
    RedirectTo,
    #[iden = "verificationToken"]
    VerificationToken,
    #[iden = "lastHealthCheckAt"]
    LastHealthCheckAt,
    #[iden = "isHealthy"]
    IsHealthy,
    #[iden = "createdAt"]
    CreatedAt,
    #[iden = "updatedAt"]
    UpdatedAt,
}
