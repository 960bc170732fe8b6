use sea_orm_migration::prelude::*;

mod m20240205_000001_custom_domains;
mod m20260301_000002_domain_leases;
mod m20260301_000003_domain_timestamptz;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240205_000001_custom_domains::Migration),
            Box::new(m20260301_000002_domain_leases::Migration),
            Box::new(m20260301_000003_domain_timestamptz::Migration),
        ]
    }
}
