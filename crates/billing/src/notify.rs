//! Notification sink
//!
//! Notifications are a fire-and-forget side effect of billing transitions. Sweeps may
//! overlap (several worker replicas, a manual run), so the sink sends a notice only if
//! the same user has not received one with the same title since a given instant, and
//! does the check and the insert as one atomic step.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Notification kind shown by the UI
pub const KIND_WARNING: &str = "warning";

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Record a notification unless `user_id` already received one titled `title` at
    /// or after `since`. Returns whether it was recorded.
    async fn notify_once_since(
        &self,
        user_id: Uuid,
        title: &str,
        message: &str,
        kind: &str,
        since: OffsetDateTime,
    ) -> BillingResult<bool>;
}

/// Notifications stored in the CRM's `notifications` table
#[derive(Clone)]
pub struct PgNotificationSink {
    pool: PgPool,
}

impl PgNotificationSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSink for PgNotificationSink {
    async fn notify_once_since(
        &self,
        user_id: Uuid,
        title: &str,
        message: &str,
        kind: &str,
        since: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent senders of the same title to the same user until commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("notify:{}:{}", user_id, title))
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO notifications (user_id, title, message, kind)
            SELECT $1, $2, $3, $4
            WHERE NOT EXISTS (
                SELECT 1 FROM notifications
                WHERE user_id = $1 AND title = $2 AND created_at >= $5
            )
            "#,
        )
        .bind(user_id)
        .bind(title)
        .bind(message)
        .bind(kind)
        .bind(since)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted.rows_affected() > 0)
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryNotificationSink, SentNotification};

#[cfg(any(test, feature = "test-util"))]
mod memory {
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SentNotification {
        pub user_id: Uuid,
        pub title: String,
        pub message: String,
        pub kind: String,
        pub created_at: OffsetDateTime,
    }

    /// Records notifications in memory. Timestamps come from [`MemoryNotificationSink::set_now`]
    /// so sweeps run at a fixed instant dedupe the way they would in production.
    #[derive(Default, Clone)]
    pub struct MemoryNotificationSink {
        inner: Arc<Mutex<(Vec<SentNotification>, Option<OffsetDateTime>)>>,
    }

    impl MemoryNotificationSink {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, (Vec<SentNotification>, Option<OffsetDateTime>)> {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Timestamp to stamp on the following notifications
        pub fn set_now(&self, now: OffsetDateTime) {
            self.lock().1 = Some(now);
        }

        pub fn sent(&self) -> Vec<SentNotification> {
            self.lock().0.clone()
        }
    }

    #[async_trait]
    impl NotificationSink for MemoryNotificationSink {
        async fn notify_once_since(
            &self,
            user_id: Uuid,
            title: &str,
            message: &str,
            kind: &str,
            since: OffsetDateTime,
        ) -> BillingResult<bool> {
            let mut guard = self.lock();
            if guard
                .0
                .iter()
                .any(|n| n.user_id == user_id && n.title == title && n.created_at >= since)
            {
                return Ok(false);
            }
            let created_at = guard.1.unwrap_or_else(OffsetDateTime::now_utc);
            guard.0.push(SentNotification {
                user_id,
                title: title.to_string(),
                message: message.to_string(),
                kind: kind.to_string(),
                created_at,
            });
            Ok(true)
        }
    }
}
