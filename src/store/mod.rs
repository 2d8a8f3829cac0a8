//! Embedded SQLite store for projects, stories, and agent logs.
//!
//! The connection sits behind an async mutex so loops can share one handle;
//! SQLite's own locking serializes writers across processes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

/// A story row as persisted.
#[derive(Debug, Clone)]
pub struct StoryRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: i64,
    pub passes: bool,
    pub in_progress: bool,
}

impl From<&crate::prd::UserStory> for StoryRecord {
    fn from(story: &crate::prd::UserStory) -> Self {
        StoryRecord {
            id: story.id.clone(),
            title: story.title.clone(),
            description: story.description.clone(),
            acceptance_criteria: story.acceptance_criteria.clone(),
            priority: story.priority,
            passes: story.passes,
            in_progress: story.in_progress,
        }
    }
}

/// Summary row for project listings.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProjectInfo {
    pub name: String,
    pub title: String,
    pub description: String,
}

/// A timestamped log line for one PRD.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// SQLite-backed store.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Store> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        Self::bootstrap(conn)
    }

    /// In-memory store, used by tests.
    pub fn in_memory() -> Result<Store> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Store> {
        conn.busy_timeout(Duration::from_secs(10))?;
        // WAL allows concurrent readers while a loop is writing.
        // PRAGMA journal_mode returns a row, so query_row and ignore it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Self::migrate(&conn)?;

        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                title TEXT,
                description TEXT,
                repo_url TEXT,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS user_stories (
                id TEXT NOT NULL,
                project_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                acceptance_criteria TEXT,
                priority INTEGER DEFAULT 0,
                passes INTEGER DEFAULT 0,
                in_progress INTEGER DEFAULT 0,
                PRIMARY KEY (project_id, id),
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS agent_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_name TEXT NOT NULL,
                message TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );",
        )
        .context("failed to migrate database")?;
        Ok(())
    }

    /// Upsert a project by name and return its id.
    pub async fn save_project(
        &self,
        name: &str,
        title: &str,
        description: &str,
        repo_url: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO projects (name, title, description, repo_url, updated_at)
             VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
             ON CONFLICT(name) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                repo_url = excluded.repo_url,
                updated_at = CURRENT_TIMESTAMP",
            params![name, title, description, repo_url],
        )?;
        let id = conn.query_row(
            "SELECT id FROM projects WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Look up a project by name: `(id, title, description, repo_url)`.
    pub async fn get_project(
        &self,
        name: &str,
    ) -> Result<Option<(i64, String, String, Option<String>)>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, title, description, repo_url FROM projects WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        row.get(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Look up a project id by name.
    pub async fn get_project_id(&self, name: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let id = conn
            .query_row(
                "SELECT id FROM projects WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Upsert a story by `(project_id, id)`.
    pub async fn save_story(&self, project_id: i64, story: &StoryRecord) -> Result<()> {
        let criteria = serde_json::to_string(&story.acceptance_criteria)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_stories
                (id, project_id, title, description, acceptance_criteria, priority, passes, in_progress)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(project_id, id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                acceptance_criteria = excluded.acceptance_criteria,
                priority = excluded.priority,
                passes = excluded.passes,
                in_progress = excluded.in_progress",
            params![
                story.id,
                project_id,
                story.title,
                story.description,
                criteria,
                story.priority,
                story.passes,
                story.in_progress,
            ],
        )?;
        Ok(())
    }

    /// Stories for a project, ordered by priority ascending.
    pub async fn get_stories(&self, project_id: i64) -> Result<Vec<StoryRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, title, description, acceptance_criteria, priority, passes, in_progress
             FROM user_stories WHERE project_id = ?1 ORDER BY priority ASC",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            let criteria_json: Option<String> = row.get(3)?;
            Ok(StoryRecord {
                id: row.get(0)?,
                title: row.get(1)?,
                description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                acceptance_criteria: criteria_json
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or_default(),
                priority: row.get(4)?,
                passes: row.get(5)?,
                in_progress: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Progress fields for a project, keyed by story id.
    pub async fn get_progress(&self, project_id: i64) -> Result<HashMap<String, (bool, bool)>> {
        let stories = self.get_stories(project_id).await?;
        Ok(stories
            .into_iter()
            .map(|s| (s.id, (s.passes, s.in_progress)))
            .collect())
    }

    /// Delete one story from a project.
    pub async fn delete_story(&self, project_id: i64, story_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM user_stories WHERE project_id = ?1 AND id = ?2",
            params![project_id, story_id],
        )?;
        Ok(())
    }

    /// Delete a project and everything belonging to it, transactionally.
    ///
    /// A name with no row is not an error.
    pub async fn delete_project(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM projects WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = id {
            tx.execute("DELETE FROM user_stories WHERE project_id = ?1", params![id])?;
            tx.execute(
                "DELETE FROM agent_logs WHERE project_name = ?1",
                params![name],
            )?;
            tx.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Append a log line for a PRD.
    pub async fn append_log(&self, project_name: &str, message: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agent_logs (project_name, message, timestamp) VALUES (?1, ?2, ?3)",
            params![project_name, message, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// The most recent `limit` log lines for a PRD, oldest first.
    pub async fn get_logs(&self, project_name: &str, limit: u32) -> Result<Vec<LogLine>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT message, timestamp FROM agent_logs
             WHERE project_name = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project_name, limit], |row| {
            let message: String = row.get(0)?;
            let timestamp: String = row.get(1)?;
            Ok((message, timestamp))
        })?;

        let mut logs: Vec<LogLine> = rows
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(message, timestamp)| LogLine {
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or(DateTime::UNIX_EPOCH),
                message,
            })
            .collect();
        logs.reverse();
        Ok(logs)
    }

    /// All projects, most recently updated first.
    pub async fn list_projects(&self) -> Result<Vec<ProjectInfo>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT name, title, description FROM projects ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let title: Option<String> = row.get(1)?;
            let description: Option<String> = row.get(2)?;
            Ok(ProjectInfo {
                title: title.filter(|t| !t.is_empty()).unwrap_or_else(|| name.clone()),
                name,
                description: description.unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}
