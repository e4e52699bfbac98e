//! Notification log repository.

use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};

use crate::Result;
use crate::database::begin_immediate;
use crate::database::models::NotificationLogDbModel;
use crate::database::retry::retry_on_sqlite_busy;

/// Notification log repository trait.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Append an entry to `queue`'s log.
    ///
    /// The entry's `(millis, seq)` is strictly greater than every earlier
    /// entry of the same queue, even when the wall clock steps backwards.
    async fn append(
        &self,
        queue: &str,
        job_id: &str,
        outcome: &str,
        now: i64,
    ) -> Result<NotificationLogDbModel>;

    /// Entries of `queue` at or after `(millis, seq)`, oldest first.
    async fn read_from(
        &self,
        queue: &str,
        millis: i64,
        seq: i64,
        limit: i64,
    ) -> Result<Vec<NotificationLogDbModel>>;
}

/// Insert the next entry of `queue`'s log on an open write transaction.
///
/// Callers that change job state append here before committing, so the
/// state change and its entry become visible together.
pub(crate) async fn append_entry(
    conn: &mut SqliteConnection,
    queue: &str,
    job_id: &str,
    outcome: &str,
    now: i64,
) -> Result<NotificationLogDbModel> {
    let last: Option<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT millis, seq FROM notification_log
        WHERE queue_name = ?
        ORDER BY millis DESC, seq DESC
        LIMIT 1
        "#,
    )
    .bind(queue)
    .fetch_optional(&mut *conn)
    .await?;

    let (millis, seq) = match last {
        Some((last_millis, last_seq)) if last_millis >= now => (last_millis, last_seq + 1),
        _ => (now, 0),
    };

    sqlx::query(
        r#"
        INSERT INTO notification_log (queue_name, millis, seq, job_id, outcome, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(queue)
    .bind(millis)
    .bind(seq)
    .bind(job_id)
    .bind(outcome)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(NotificationLogDbModel {
        queue_name: queue.to_string(),
        millis,
        seq,
        job_id: job_id.to_string(),
        outcome: outcome.to_string(),
        created_at: now,
    })
}

/// SQLx implementation of NotificationRepository.
pub struct SqlxNotificationRepository {
    pool: SqlitePool,
}

impl SqlxNotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRepository for SqlxNotificationRepository {
    async fn append(
        &self,
        queue: &str,
        job_id: &str,
        outcome: &str,
        now: i64,
    ) -> Result<NotificationLogDbModel> {
        retry_on_sqlite_busy("append_notification", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let entry = append_entry(&mut tx, queue, job_id, outcome, now).await?;
            tx.commit().await?;
            Ok(entry)
        })
        .await
    }

    async fn read_from(
        &self,
        queue: &str,
        millis: i64,
        seq: i64,
        limit: i64,
    ) -> Result<Vec<NotificationLogDbModel>> {
        let entries = sqlx::query_as::<_, NotificationLogDbModel>(
            r#"
            SELECT * FROM notification_log
            WHERE queue_name = ?
              AND (millis > ? OR (millis = ? AND seq >= ?))
            ORDER BY millis, seq
            LIMIT ?
            "#,
        )
        .bind(queue)
        .bind(millis)
        .bind(millis)
        .bind(seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}
