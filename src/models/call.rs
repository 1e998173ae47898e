use sea_orm::entity::prelude::*;
use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::{
    big_integer_null, integer, string, string_null, timestamp, timestamp_null,
};
use sea_orm_migration::sea_query::Expr;

use crate::event::CallStatus;

/// One row per call lifecycle, keyed by the stable call id.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "calls")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub call_id: String,
    pub line: i32,
    pub status: String,
    pub finish_state: Option<String>,
    pub caller: Option<String>,
    pub called: Option<String>,
    pub caller_msn: Option<String>,
    pub called_msn: Option<String>,
    pub trunk: Option<String>,
    /// Set when the row is inserted, i.e. on the first non-idle transition.
    pub start_timestamp: Option<DateTimeUtc>,
    /// Set when the line went to talking.
    pub connect_timestamp: Option<DateTimeUtc>,
    /// Set when the line reached a terminal state.
    pub end_timestamp: Option<DateTimeUtc>,
    /// Call duration in seconds as reported by the router.
    pub duration: Option<i64>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

fn status_alphabet() -> Vec<&'static str> {
    CallStatus::ALL.iter().map(|status| status.as_str()).collect()
}

fn finish_states() -> Vec<&'static str> {
    CallStatus::ALL
        .iter()
        .filter(|status| status.is_terminal())
        .map(|status| status.as_str())
        .collect()
}

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Entity)
                    .if_not_exists()
                    .col(string(Column::CallId).primary_key())
                    .col(integer(Column::Line))
                    .col(
                        string(Column::Status)
                            .check(Expr::col(Column::Status).is_in(status_alphabet())),
                    )
                    .col(
                        string_null(Column::FinishState)
                            .check(Expr::col(Column::FinishState).is_in(finish_states())),
                    )
                    .col(string_null(Column::Caller))
                    .col(string_null(Column::Called))
                    .col(string_null(Column::CallerMsn))
                    .col(string_null(Column::CalledMsn))
                    .col(string_null(Column::Trunk))
                    .col(timestamp_null(Column::StartTimestamp))
                    .col(timestamp_null(Column::ConnectTimestamp))
                    .col(timestamp_null(Column::EndTimestamp))
                    .col(big_integer_null(Column::Duration))
                    .col(timestamp(Column::CreatedAt).default(Expr::current_timestamp()))
                    .col(timestamp(Column::UpdatedAt).default(Expr::current_timestamp()))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_calls_line")
                    .table(Entity)
                    .col(Column::Line)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_calls_status")
                    .table(Entity)
                    .col(Column::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_calls_start_timestamp")
                    .table(Entity)
                    .col(Column::StartTimestamp)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Entity).to_owned())
            .await
    }
}
