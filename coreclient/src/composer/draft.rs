// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Draft persistence.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use terncommon::identifiers::ChatId;
use thiserror::Error;
use tokio::sync::Mutex;

/// The autosaved, not-yet-sent composition text for a chat.
#[derive(Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub struct Draft {
    /// The text currently composed in the draft.
    pub message: String,
    /// The time when the draft was last updated.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum DraftStoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    /// Persistent storage is unavailable (e.g. private browsing, quota).
    /// Autosave degrades to a no-op.
    #[error("draft storage unavailable")]
    Unavailable,
}

/// Draft store collaborator, keyed by chat.
///
/// May be unavailable; callers treat every error as non-fatal and disable
/// autosave for the session.
#[trait_variant::make(Send)]
pub trait DraftStore: Send + Sync + 'static {
    async fn save(&self, chat_id: ChatId, draft: &Draft) -> Result<(), DraftStoreError>;
    async fn load(&self, chat_id: ChatId) -> Result<Option<Draft>, DraftStoreError>;
    async fn clear(&self, chat_id: ChatId) -> Result<(), DraftStoreError>;
}

impl<D: DraftStore> DraftStore for Arc<D> {
    async fn save(&self, chat_id: ChatId, draft: &Draft) -> Result<(), DraftStoreError> {
        (**self).save(chat_id, draft).await
    }

    async fn load(&self, chat_id: ChatId) -> Result<Option<Draft>, DraftStoreError> {
        (**self).load(chat_id).await
    }

    async fn clear(&self, chat_id: ChatId) -> Result<(), DraftStoreError> {
        (**self).clear(chat_id).await
    }
}

/// Sqlite-backed draft store.
pub struct SqliteDraftStore {
    pool: SqlitePool,
}

impl SqliteDraftStore {
    /// Creates the draft table if it does not exist yet.
    pub async fn new(pool: SqlitePool) -> Result<Self, DraftStoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS message_draft (
                chat_id BLOB PRIMARY KEY,
                message TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

impl DraftStore for SqliteDraftStore {
    async fn save(&self, chat_id: ChatId, draft: &Draft) -> Result<(), DraftStoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO message_draft (chat_id, message, updated_at)
            VALUES (?, ?, ?)",
        )
        .bind(chat_id)
        .bind(&draft.message)
        .bind(draft.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, chat_id: ChatId) -> Result<Option<Draft>, DraftStoreError> {
        let row = sqlx::query(
            "SELECT message, updated_at FROM message_draft
            WHERE chat_id = ?",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(Draft {
                message: row.try_get("message")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn clear(&self, chat_id: ChatId) -> Result<(), DraftStoreError> {
        sqlx::query("DELETE FROM message_draft WHERE chat_id = ?")
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory draft store for embedders without durable storage.
#[derive(Debug, Default)]
pub struct MemoryDraftStore {
    drafts: Mutex<HashMap<ChatId, Draft>>,
}

impl MemoryDraftStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DraftStore for MemoryDraftStore {
    async fn save(&self, chat_id: ChatId, draft: &Draft) -> Result<(), DraftStoreError> {
        self.drafts.lock().await.insert(chat_id, draft.clone());
        Ok(())
    }

    async fn load(&self, chat_id: ChatId) -> Result<Option<Draft>, DraftStoreError> {
        Ok(self.drafts.lock().await.get(&chat_id).cloned())
    }

    async fn clear(&self, chat_id: ChatId) -> Result<(), DraftStoreError> {
        self.drafts.lock().await.remove(&chat_id);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use chrono::SubsecRound;
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    async fn store() -> SqliteDraftStore {
        // A single connection, so every query sees the same in-memory
        // database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteDraftStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn store_load_update_and_clear_draft() {
        let store = store().await;
        let chat_id = ChatId::random();

        // 1. Load non-existent draft
        assert_eq!(store.load(chat_id).await.unwrap(), None);

        // 2. Store a new draft
        // Rounded to avoid precision issues with SQLite TEXT storage.
        let now = Utc::now().round_subsecs(6);
        let draft = Draft {
            message: "Hello, world!".to_owned(),
            updated_at: now,
        };
        store.save(chat_id, &draft).await.unwrap();
        assert_eq!(store.load(chat_id).await.unwrap(), Some(draft));

        // 3. Overwrite (INSERT OR REPLACE)
        let updated = Draft {
            message: "Updated message.".to_owned(),
            updated_at: Utc::now().round_subsecs(6),
        };
        store.save(chat_id, &updated).await.unwrap();
        assert_eq!(
            store.load(chat_id).await.unwrap().map(|d| d.message),
            Some("Updated message.".to_owned())
        );

        // 4. Clear
        store.clear(chat_id).await.unwrap();
        assert_eq!(store.load(chat_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn drafts_are_keyed_by_chat() {
        let store = store().await;
        let chat_a = ChatId::random();
        let chat_b = ChatId::random();
        let draft = Draft {
            message: "only in a".to_owned(),
            updated_at: Utc::now().round_subsecs(6),
        };
        store.save(chat_a, &draft).await.unwrap();
        assert!(store.load(chat_a).await.unwrap().is_some());
        assert!(store.load(chat_b).await.unwrap().is_none());
    }
}
