//! Operator notification delivery

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::db::{CreateNotification, NotificationRepository};

/// Where operator-facing events go. Task runners hold this behind a trait so
/// tests can capture notifications instead of writing rows.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, kind: &str, title: &str, body: &str) -> Result<()>;
}

/// Stores notifications in the database and mirrors them to the log.
pub struct DbNotifier {
    repo: NotificationRepository,
}

impl DbNotifier {
    pub fn new(repo: NotificationRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl Notifier for DbNotifier {
    async fn notify(&self, kind: &str, title: &str, body: &str) -> Result<()> {
        info!(kind, title, "{body}");
        self.repo
            .create(&CreateNotification {
                kind: kind.to_string(),
                title: title.to_string(),
                body: body.to_string(),
            })
            .await?;
        Ok(())
    }
}

/// Log-only delivery, for setups without a notification surface.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, kind: &str, title: &str, body: &str) -> Result<()> {
        warn!(kind, title, "{body}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_db_notifier_stores_rows() {
        let db = Database::connect_memory().await.unwrap();
        let notifier = DbNotifier::new(db.notifications());

        notifier
            .notify("switch_failed", "Source switch failed", "details")
            .await
            .unwrap();

        let unread = db.notifications().list_unread().await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].title, "Source switch failed");
    }
}
