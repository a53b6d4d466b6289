// Persisted word collection: SQLite rows with image payloads stored as files

mod migrations;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::core::config::StorageConfig;
use crate::core::errors::{StorageError, StorageResult};
use crate::core::types::CapturedWord;

use migrations::run_migrations;

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct StoreInner {
    sender: Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to word store thread: {}", err);
            }
            if let Err(err) = handle.join() {
                error!("Failed to join word store thread: {:?}", err);
            }
        }
    }
}

const WORD_COLUMNS: &str = "id, detected_text, translation, target_language, captured_date, \
                            image_file, notes, is_reviewed, review_count, last_reviewed_date";

/// Fixed-width RFC 3339 so that text ordering matches time ordering
fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {}", field))
}

/// Row plus the name of its out-of-line image file
fn row_to_word(row: &Row) -> Result<(CapturedWord, Option<String>)> {
    let id: String = row.get("id")?;
    let captured: String = row.get("captured_date")?;
    let reviewed: Option<String> = row.get("last_reviewed_date")?;
    let review_count: i64 = row.get("review_count")?;

    let word = CapturedWord {
        id: Uuid::parse_str(&id).with_context(|| format!("invalid word id '{}'", id))?,
        detected_text: row.get("detected_text")?,
        translation: row.get("translation")?,
        target_language: row.get("target_language")?,
        captured_date: parse_datetime(&captured, "captured_date")?,
        image_data: None,
        notes: row.get("notes")?,
        is_reviewed: row.get("is_reviewed")?,
        review_count: u32::try_from(review_count)
            .map_err(|_| anyhow!("review_count contains invalid value {}", review_count))?,
        last_reviewed_date: reviewed
            .map(|raw| parse_datetime(&raw, "last_reviewed_date"))
            .transpose()?,
    };
    Ok((word, row.get("image_file")?))
}

fn image_file_name(id: Uuid) -> String {
    format!("{}.img", id)
}

fn insert_row(conn: &Connection, record: &CapturedWord) -> Result<()> {
    conn.execute(
        "INSERT INTO words (id, detected_text, translation, target_language, captured_date,
                            image_file, notes, is_reviewed, review_count, last_reviewed_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.id.to_string(),
            record.detected_text,
            record.translation,
            record.target_language,
            format_datetime(&record.captured_date),
            record.image_data.as_ref().map(|_| image_file_name(record.id)),
            record.notes,
            record.is_reviewed,
            record.review_count,
            record.last_reviewed_date.as_ref().map(format_datetime),
        ],
    )
    .with_context(|| format!("failed to insert word {}", record.id))?;
    Ok(())
}

/// Write through a temp file so a failed write never leaves a partial image
fn write_image_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("img.tmp");
    let written = std::fs::write(&tmp, bytes).and_then(|_| std::fs::rename(&tmp, path));
    if written.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    written
}

fn attach_image(image_dir: &Path, (mut word, file): (CapturedWord, Option<String>)) -> Result<CapturedWord> {
    if let Some(file) = file {
        let path = image_dir.join(&file);
        match std::fs::read(&path) {
            Ok(bytes) => word.image_data = Some(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("Image file {} for word {} is missing", path.display(), word.id);
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to read image {}", path.display())))
            }
        }
    }
    Ok(word)
}

fn query_words(
    conn: &Connection,
    image_dir: &Path,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<CapturedWord>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut words = Vec::new();
    while let Some(row) = rows.next()? {
        words.push(attach_image(image_dir, row_to_word(row)?)?);
    }
    Ok(words)
}

fn select_word(conn: &Connection, image_dir: &Path, id: &str) -> Result<Option<CapturedWord>> {
    let sql = format!("SELECT {} FROM words WHERE id = ?1", WORD_COLUMNS);
    Ok(query_words(conn, image_dir, &sql, params![id])?.into_iter().next())
}

/// Single shared append/query/delete surface for captured words
///
/// All statements run on one dedicated thread, so concurrent callers are
/// serialized without external locking.
#[derive(Clone)]
pub struct WordStore {
    inner: Arc<StoreInner>,
    db_path: Arc<PathBuf>,
    image_dir: Arc<PathBuf>,
}

impl WordStore {
    pub fn open(config: &StorageConfig) -> Result<Self> {
        Self::new(PathBuf::from(&config.database_path), PathBuf::from(&config.image_dir))
    }

    pub fn new(db_path: PathBuf, image_dir: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
        std::fs::create_dir_all(&image_dir)
            .with_context(|| format!("failed to create image directory {}", image_dir.display()))?;

        let (command_tx, command_rx) = channel::unbounded::<DbCommand>();
        let (ready_tx, ready_rx) = channel::bounded::<Result<()>>(1);
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("capword-store".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(
                            anyhow::Error::new(err).context("failed to open SQLite database")
                        ));
                        return;
                    }
                };
                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {}", err);
                }

                let init = run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init).is_err() {
                    error!("Word store initialization receiver dropped");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => task(&mut conn),
                        DbCommand::Shutdown => break,
                    }
                }
                debug!("Word store thread shutting down");
            })
            .context("failed to spawn word store thread")?;

        ready_rx
            .recv()
            .context("word store thread exited before signaling readiness")??;

        info!("✓ Word store ready at {}", db_path.display());

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
            image_dir: Arc::new(image_dir),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &Path) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let image_dir = Arc::clone(&self.image_dir);

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn, &image_dir);
            if reply_tx.send(result).is_err() {
                error!("Word store caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to word store thread: {}", err))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("word store thread terminated unexpectedly"))?
    }

    /// Insert a complete record; its image, if any, must decode
    #[instrument(skip(self, word), fields(id = %word.id, language = %word.target_language))]
    pub async fn insert(&self, word: &CapturedWord) -> StorageResult<()> {
        self.insert_all(std::slice::from_ref(word)).await
    }

    /// Insert several records in one transaction: all are stored or none are
    #[instrument(skip(self, words), fields(count = words.len()))]
    pub async fn insert_all(&self, words: &[CapturedWord]) -> StorageResult<()> {
        if let Some(bad) = words.iter().find(|w| !w.image_is_valid()) {
            return Err(StorageError::InvalidImage(bad.id));
        }
        let records = words.to_vec();
        self.execute(move |conn, image_dir| {
            // Rows first: a duplicate id fails here before any file is touched
            let tx = conn.transaction().context("failed to begin insert")?;
            for record in &records {
                insert_row(&tx, record)?;
            }

            let mut written = Vec::new();
            let mut outcome = Ok(());
            for record in &records {
                if let Some(bytes) = &record.image_data {
                    let path = image_dir.join(image_file_name(record.id));
                    if let Err(e) = write_image_atomically(&path, bytes) {
                        outcome = Err(anyhow::Error::new(e)
                            .context(format!("failed to write image for word {}", record.id)));
                        break;
                    }
                    written.push(path);
                }
            }
            if outcome.is_ok() {
                outcome = tx.commit().context("failed to commit words");
            }
            if outcome.is_err() {
                for path in written {
                    let _ = std::fs::remove_file(path);
                }
            }
            outcome
        })
        .await?;
        Ok(())
    }

    /// Every word, newest first
    pub async fn fetch_all(&self) -> StorageResult<Vec<CapturedWord>> {
        let words = self
            .execute(|conn, image_dir| {
                let sql = format!(
                    "SELECT {} FROM words ORDER BY captured_date DESC, rowid DESC",
                    WORD_COLUMNS
                );
                query_words(conn, image_dir, &sql, params![])
            })
            .await?;
        Ok(words)
    }

    pub async fn fetch_by_language(&self, language: &str) -> StorageResult<Vec<CapturedWord>> {
        let language = language.to_string();
        let words = self
            .execute(move |conn, image_dir| {
                let sql = format!(
                    "SELECT {} FROM words WHERE target_language = ?1
                     ORDER BY captured_date DESC, rowid DESC",
                    WORD_COLUMNS
                );
                query_words(conn, image_dir, &sql, params![language])
            })
            .await?;
        Ok(words)
    }

    /// The `limit` newest words
    pub async fn fetch_recent(&self, limit: usize) -> StorageResult<Vec<CapturedWord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let words = self
            .execute(move |conn, image_dir| {
                let sql = format!(
                    "SELECT {} FROM words ORDER BY captured_date DESC, rowid DESC LIMIT ?1",
                    WORD_COLUMNS
                );
                query_words(conn, image_dir, &sql, params![limit])
            })
            .await?;
        Ok(words)
    }

    pub async fn get(&self, id: Uuid) -> StorageResult<CapturedWord> {
        self.execute(move |conn, image_dir| select_word(conn, image_dir, &id.to_string()))
            .await?
            .ok_or(StorageError::NotFound(id))
    }

    /// Set the reviewed flag, bump the count and stamp the time
    pub async fn mark_reviewed(&self, id: Uuid) -> StorageResult<CapturedWord> {
        let now = Utc::now();
        self.execute(move |conn, image_dir| {
            let changed = conn
                .execute(
                    "UPDATE words
                     SET is_reviewed = 1,
                         review_count = review_count + 1,
                         last_reviewed_date = ?1
                     WHERE id = ?2",
                    params![format_datetime(&now), id.to_string()],
                )
                .context("failed to mark word reviewed")?;
            if changed == 0 {
                return Ok(None);
            }
            select_word(conn, image_dir, &id.to_string())
        })
        .await?
        .ok_or(StorageError::NotFound(id))
    }

    pub async fn update_notes(&self, id: Uuid, notes: Option<String>) -> StorageResult<()> {
        let changed = self
            .execute(move |conn, _| {
                conn.execute(
                    "UPDATE words SET notes = ?1 WHERE id = ?2",
                    params![notes, id.to_string()],
                )
                .context("failed to update notes")
            })
            .await?;
        if changed == 0 {
            return Err(StorageError::NotFound(id));
        }
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> StorageResult<()> {
        let deleted = self
            .execute(move |conn, image_dir| {
                let file: Option<Option<String>> = conn
                    .query_row(
                        "SELECT image_file FROM words WHERE id = ?1",
                        params![id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(file) = file else {
                    return Ok(false);
                };
                conn.execute("DELETE FROM words WHERE id = ?1", params![id.to_string()])
                    .context("failed to delete word")?;
                if let Some(file) = file {
                    remove_image(image_dir, &file);
                }
                Ok(true)
            })
            .await?;
        if !deleted {
            return Err(StorageError::NotFound(id));
        }
        Ok(())
    }

    /// Remove every word; returns how many were deleted
    pub async fn delete_all(&self) -> StorageResult<usize> {
        let removed = self
            .execute(|conn, image_dir| {
                let files: Vec<String> = {
                    let mut stmt =
                        conn.prepare("SELECT image_file FROM words WHERE image_file IS NOT NULL")?;
                    let rows = stmt.query_map([], |row| row.get(0))?;
                    rows.collect::<rusqlite::Result<_>>()?
                };
                let removed = conn
                    .execute("DELETE FROM words", [])
                    .context("failed to delete words")?;
                for file in files {
                    remove_image(image_dir, &file);
                }
                Ok(removed)
            })
            .await?;
        info!("Deleted {} words", removed);
        Ok(removed)
    }

    pub async fn count(&self) -> StorageResult<usize> {
        let count = self
            .execute(|conn, _| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM words", [], |row| row.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(count.max(0) as usize)
    }

    pub async fn count_by_language(&self, language: &str) -> StorageResult<usize> {
        let language = language.to_string();
        let count = self
            .execute(move |conn, _| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM words WHERE target_language = ?1",
                    params![language],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await?;
        Ok(count.max(0) as usize)
    }
}

fn remove_image(image_dir: &Path, file: &str) {
    let path = image_dir.join(file);
    if let Err(err) = std::fs::remove_file(&path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            error!("Failed to remove image {}: {}", path.display(), err);
        }
    }
}
