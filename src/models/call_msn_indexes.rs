use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let table = crate::models::call::Entity;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_calls_caller_msn")
                    .table(table)
                    .col(crate::models::call::Column::CallerMsn)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_calls_called_msn")
                    .table(table)
                    .col(crate::models::call::Column::CalledMsn)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let table = crate::models::call::Entity;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_calls_called_msn")
                    .table(table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_calls_caller_msn")
                    .table(table)
                    .to_owned(),
            )
            .await
    }
}
