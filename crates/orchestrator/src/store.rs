//! Session store implementations: in-process (dashmap) and SQLite (sqlx).

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use proto::{
    Message, ReflectionEntry, ReflectionKind, SessionId, SessionState, SessionStore, StepNote,
    StoreError,
};
use serde_json::Value;
use sqlx::{Row, sqlite::SqlitePool};
use tracing::{debug, info};

/// Process-local store. State is lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<SessionId, SessionState>,
    history: DashMap<(SessionId, String), Vec<Message>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_step(&self, session_id: &SessionId) -> Result<Option<String>, StoreError> {
        Ok(self
            .sessions
            .get(session_id)
            .and_then(|state| state.current_step.clone()))
    }

    async fn set_step(&self, session_id: &SessionId, step: &str) -> Result<(), StoreError> {
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionState::new(session_id.clone()))
            .current_step = Some(step.to_string());
        Ok(())
    }

    async fn append_note(
        &self,
        session_id: &SessionId,
        step: &str,
        payload: Value,
    ) -> Result<(), StoreError> {
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionState::new(session_id.clone()))
            .notes
            .push(StepNote {
                step: step.to_string(),
                payload,
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn append_reflection(
        &self,
        session_id: &SessionId,
        step: &str,
        kind: ReflectionKind,
        content: &str,
    ) -> Result<(), StoreError> {
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionState::new(session_id.clone()))
            .reflections
            .push(ReflectionEntry {
                step: step.to_string(),
                kind,
                content: content.to_string(),
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn load_state(&self, session_id: &SessionId) -> Result<SessionState, StoreError> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|state| state.clone())
            .unwrap_or_else(|| SessionState::new(session_id.clone())))
    }

    async fn append_history(
        &self,
        session_id: &SessionId,
        agent: &str,
        messages: &[Message],
    ) -> Result<(), StoreError> {
        self.history
            .entry((session_id.clone(), agent.to_string()))
            .or_default()
            .extend(messages.iter().cloned());
        Ok(())
    }

    async fn load_history(
        &self,
        session_id: &SessionId,
        agent: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let key = (session_id.clone(), agent.to_string());
        Ok(self
            .history
            .get(&key)
            .map(|messages| {
                let skip = if limit == 0 { 0 } else { messages.len().saturating_sub(limit) };
                messages[skip..].to_vec()
            })
            .unwrap_or_default())
    }
}

/// SQLite-backed store
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Open (or create) the database file and run migrations. Accepts a plain
    /// path, a `~`-prefixed path, or a `sqlite:` URL.
    pub async fn open(db_url: &str) -> Result<Self, StoreError> {
        let path = db_url.strip_prefix("sqlite:").unwrap_or(db_url);
        let path = path.split('?').next().unwrap_or(path);
        let path = if let Some(rest) = path.strip_prefix('~') {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            format!("{home}{rest}")
        } else {
            path.to_string()
        };

        if let Some(parent) = std::path::Path::new(&path).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        }

        let pool = SqlitePool::connect(&format!("sqlite:{path}?mode=rwc"))
            .await
            .map_err(|e| StoreError::Sqlx(e.to_string()))?;

        let migrations_dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
        let migrator = sqlx::migrate::Migrator::new(migrations_dir.as_path())
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        migrator
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        info!(path = %path, "SQLite session store opened");
        Ok(Self { pool })
    }

    async fn ensure_session(&self, session_id: &SessionId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("INSERT OR IGNORE INTO sessions (id, current_step, created_at, updated_at) VALUES (?, NULL, ?, ?)")
            .bind(session_id.as_str())
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get_step(&self, session_id: &SessionId) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT current_step FROM sessions WHERE id = ?")
            .bind(session_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        Ok(row.and_then(|row| row.get::<Option<String>, _>("current_step")))
    }

    async fn set_step(&self, session_id: &SessionId, step: &str) -> Result<(), StoreError> {
        self.ensure_session(session_id).await?;
        sqlx::query("UPDATE sessions SET current_step = ?, updated_at = ? WHERE id = ?")
            .bind(step)
            .bind(Utc::now().to_rfc3339())
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        debug!(session_id = %session_id, step, "Persisted step");
        Ok(())
    }

    async fn append_note(
        &self,
        session_id: &SessionId,
        step: &str,
        payload: Value,
    ) -> Result<(), StoreError> {
        self.ensure_session(session_id).await?;
        let encoded = serde_json::to_string(&payload).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query("INSERT INTO step_notes (session_id, step, payload, created_at) VALUES (?, ?, ?, ?)")
            .bind(session_id.as_str())
            .bind(step)
            .bind(encoded)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        Ok(())
    }

    async fn append_reflection(
        &self,
        session_id: &SessionId,
        step: &str,
        kind: ReflectionKind,
        content: &str,
    ) -> Result<(), StoreError> {
        self.ensure_session(session_id).await?;
        sqlx::query("INSERT INTO reflections (session_id, step, kind, content, created_at) VALUES (?, ?, ?, ?, ?)")
            .bind(session_id.as_str())
            .bind(step)
            .bind(kind.to_string())
            .bind(content)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        debug!(session_id = %session_id, step, kind = %kind, "Logged reflection");
        Ok(())
    }

    async fn load_state(&self, session_id: &SessionId) -> Result<SessionState, StoreError> {
        let mut state = SessionState::new(session_id.clone());
        state.current_step = self.get_step(session_id).await?;

        let notes = sqlx::query("SELECT step, payload, created_at FROM step_notes WHERE session_id = ? ORDER BY id ASC")
            .bind(session_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        for row in notes {
            let raw: String = row.get("payload");
            let payload = serde_json::from_str(&raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
            state.notes.push(StepNote {
                step: row.get("step"),
                payload,
                created_at: parse_timestamp(&row.get::<String, _>("created_at")),
            });
        }

        let reflections =
            sqlx::query("SELECT step, kind, content, created_at FROM reflections WHERE session_id = ? ORDER BY id ASC")
                .bind(session_id.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        for row in reflections {
            let kind_str: String = row.get("kind");
            let kind = ReflectionKind::from_str(&kind_str).map_err(|e| StoreError::Serialization(e.to_string()))?;
            state.reflections.push(ReflectionEntry {
                step: row.get("step"),
                kind,
                content: row.get("content"),
                created_at: parse_timestamp(&row.get::<String, _>("created_at")),
            });
        }

        Ok(state)
    }

    async fn append_history(
        &self,
        session_id: &SessionId,
        agent: &str,
        messages: &[Message],
    ) -> Result<(), StoreError> {
        if messages.is_empty() {
            return Ok(());
        }
        self.ensure_session(session_id).await?;
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Sqlx(e.to_string()))?;
        for message in messages {
            let encoded = serde_json::to_string(message).map_err(|e| StoreError::Serialization(e.to_string()))?;
            sqlx::query("INSERT INTO agent_history (session_id, agent, message, created_at) VALUES (?, ?, ?, ?)")
                .bind(session_id.as_str())
                .bind(agent)
                .bind(encoded)
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| StoreError::Sqlx(e.to_string()))?;
        debug!(session_id = %session_id, agent, count = messages.len(), "Saved agent history");
        Ok(())
    }

    async fn load_history(
        &self,
        session_id: &SessionId,
        agent: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = if limit == 0 { -1 } else { i64::try_from(limit).unwrap_or(i64::MAX) };
        let rows = sqlx::query(
            "SELECT message FROM (SELECT id, message FROM agent_history WHERE session_id = ? AND agent = ? \
             ORDER BY id DESC LIMIT ?) ORDER BY id ASC",
        )
        .bind(session_id.as_str())
        .bind(agent)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Sqlx(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let raw: String = row.get("message");
                serde_json::from_str(&raw).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }
}
