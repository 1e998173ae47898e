//! Persistence for call lifecycles: one row per call id, inserted on the
//! first transition out of idle and updated on every later transition.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect,
};

use crate::event::{CallEvent, CallStatus};
use crate::models::{self, call};

#[derive(Clone)]
pub struct CallStore {
    db: DatabaseConnection,
}

impl CallStore {
    /// Opens (and migrates) the bridge database under `<data_dir>/database/`.
    pub async fn open(data_dir: &str) -> Result<Self> {
        Self::connect(&models::database_url(data_dir)).await
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let db = models::create_db(database_url).await?;
        Ok(Self { db })
    }

    /// Inserts the row for a fresh lifecycle. `status` is the state entered
    /// by the first transition out of idle; the event supplies participants
    /// and the start timestamp.
    pub async fn insert_call(
        &self,
        call_id: &str,
        line: u32,
        status: CallStatus,
        event: &CallEvent,
    ) -> Result<()> {
        let now = Utc::now();
        let record = call::ActiveModel {
            call_id: Set(call_id.to_string()),
            line: Set(line as i32),
            status: Set(status.as_str().to_string()),
            finish_state: Set(None),
            caller: Set(opt(&event.caller)),
            called: Set(opt(&event.called)),
            caller_msn: Set(opt(&event.caller_msn)),
            called_msn: Set(opt(&event.called_msn)),
            trunk: Set(opt(&event.trunk)),
            start_timestamp: Set(Some(event.timestamp.with_timezone(&Utc))),
            connect_timestamp: Set(None),
            end_timestamp: Set(None),
            duration: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        call::Entity::insert(record)
            .exec(&self.db)
            .await
            .with_context(|| format!("failed to insert call {}", call_id))?;
        Ok(())
    }

    /// Applies an event-driven transition to an existing row: status and
    /// updated_at always, the connect timestamp on talking, the end
    /// timestamp and a positive duration on terminal states.
    pub async fn update_on_transition(
        &self,
        call_id: &str,
        status: CallStatus,
        event: &CallEvent,
    ) -> Result<()> {
        let mut record = call::ActiveModel {
            status: Set(status.as_str().to_string()),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };

        if status == CallStatus::Talking {
            record.connect_timestamp = Set(Some(event.timestamp.with_timezone(&Utc)));
        } else if status.is_terminal() {
            record.end_timestamp = Set(Some(event.timestamp.with_timezone(&Utc)));
            if event.duration > 0 {
                record.duration = Set(Some(event.duration as i64));
            }
        }

        self.update_existing(call_id, record).await
    }

    /// Records how a call ended after the machine auto-reset to idle. The
    /// row's status deliberately stays at the terminal value so historical
    /// queries keep the classification.
    pub async fn record_finish_state(&self, call_id: &str, finish: CallStatus) -> Result<()> {
        let record = call::ActiveModel {
            finish_state: Set(Some(finish.as_str().to_string())),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        self.update_existing(call_id, record).await
    }

    pub async fn get_call(&self, call_id: &str) -> Result<Option<call::Model>> {
        call::Entity::find_by_id(call_id.to_string())
            .one(&self.db)
            .await
            .with_context(|| format!("failed to load call {}", call_id))
    }

    pub async fn get_calls_by_line(&self, line: u32, limit: u64) -> Result<Vec<call::Model>> {
        call::Entity::find()
            .filter(call::Column::Line.eq(line as i32))
            .order_by_desc(call::Column::StartTimestamp)
            .limit(limit)
            .all(&self.db)
            .await
            .with_context(|| format!("failed to load calls for line {}", line))
    }

    pub async fn close(self) -> Result<()> {
        self.db.close().await.context("failed to close database")
    }

    async fn update_existing(&self, call_id: &str, record: call::ActiveModel) -> Result<()> {
        let result = call::Entity::update_many()
            .set(record)
            .filter(call::Column::CallId.eq(call_id))
            .exec(&self.db)
            .await
            .with_context(|| format!("failed to update call {}", call_id))?;

        if result.rows_affected == 0 {
            bail!("call not found: {}", call_id);
        }
        Ok(())
    }
}

fn opt(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
