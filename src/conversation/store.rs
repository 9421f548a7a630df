//! Durable, append-only conversation log.
//!
//! Each conversation lives in `<dir>/<sanitized id>.jsonl`:
//!
//! ```text
//! {"type":"header","id":"…","created_at":"…","backend_used":"remote:gpt-4o","version":1}
//! {"type":"message","id":"…","role":"system","content":{…},"timestamp":"…","token_count":9}
//! {"type":"message", …}
//! ```
//!
//! A record is committed once its trailing newline is on disk. `create`
//! writes the header through a temp file and an atomic rename; `append`
//! writes exactly one line and syncs it. Whatever follows the last newline is
//! an interrupted write, and so is a final line that does not parse: `load`
//! ignores it and the next `append` truncates it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, TermpalError};

use super::types::{Conversation, ConversationMeta, Message};

const LOG_VERSION: u32 = 1;
const LOG_EXTENSION: &str = "jsonl";

/// First record of every log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogHeader {
    id: String,
    created_at: DateTime<Utc>,
    backend_used: String,
    version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record {
    Header(LogHeader),
    Message(Message),
}

/// Listing entry for a stored conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub backend_used: String,
}

/// Per-conversation write state.
#[derive(Debug, Default)]
struct LogState {
    /// Byte length of the committed prefix, once verified in this process
    committed_len: Option<u64>,
}

/// File-backed conversation store.
///
/// Safe to share between tasks: appends to one id are serialized by a per-id
/// lock, appends to distinct ids proceed concurrently.
pub struct ConversationStore {
    dir: PathBuf,
    logs: Mutex<HashMap<String, Arc<Mutex<LogState>>>>,
}

impl ConversationStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| storage_err("creating store directory", &dir, e))?;
        Ok(Self {
            dir,
            logs: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for `id`.
    pub fn log_path(&self, id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", sanitize_key(id), LOG_EXTENSION))
    }

    /// Whether a log exists for `id`.
    pub async fn exists(&self, id: &str) -> bool {
        tokio::fs::try_exists(self.log_path(id))
            .await
            .unwrap_or(false)
    }

    /// Persist a new conversation: header plus any messages it already holds.
    ///
    /// The whole file appears at once via rename, so a crash leaves either no
    /// log or a complete one. Fails if a log for the id already exists.
    pub async fn create(&self, conversation: &Conversation) -> Result<()> {
        let lock = self.log_lock(conversation.id()).await;
        let mut state = lock.lock().await;

        let path = self.log_path(conversation.id());
        let mut body = encode_record(&Record::Header(LogHeader {
            id: conversation.id().to_string(),
            created_at: conversation.meta().created_at,
            backend_used: conversation.meta().backend_used.clone(),
            version: LOG_VERSION,
        }))?;
        for message in conversation.messages() {
            body.push_str(&encode_record(&Record::Message(message.clone()))?);
        }

        let dir = self.dir.clone();
        let target = path.clone();
        let len = body.len() as u64;
        tokio::task::spawn_blocking(move || write_new_log(&dir, &target, body.as_bytes()))
            .await
            .map_err(|e| TermpalError::Storage(format!("create task failed: {}", e)))??;

        state.committed_len = Some(len);
        debug!(conversation = %conversation.id(), path = %path.display(), "Created conversation log");
        Ok(())
    }

    /// Append one message to the log of `id` and sync it to disk.
    ///
    /// When this returns `Ok`, the message survives a crash. When it returns
    /// an error, earlier messages are untouched and the partial line (if any)
    /// is truncated by the next append or skipped by the next load.
    pub async fn append(&self, id: &str, message: &Message) -> Result<()> {
        let lock = self.log_lock(id).await;
        let mut state = lock.lock().await;

        let path = self.log_path(id);
        let committed = match state.committed_len {
            Some(len) => len,
            None => committed_prefix_len(&path).await?,
        };

        let line = encode_record(&Record::Message(message.clone()))?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| storage_err("opening log for append", &path, e))?;
        let on_disk = file
            .metadata()
            .await
            .map_err(|e| storage_err("reading log metadata", &path, e))?
            .len();
        if on_disk != committed {
            warn!(
                conversation = %id,
                discarded_bytes = on_disk.saturating_sub(committed),
                "Truncating uncommitted tail of conversation log"
            );
            file.set_len(committed)
                .await
                .map_err(|e| storage_err("truncating log tail", &path, e))?;
        }
        file.seek(SeekFrom::Start(committed))
            .await
            .map_err(|e| storage_err("seeking log", &path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| storage_err("appending to log", &path, e))?;
        file.sync_data()
            .await
            .map_err(|e| storage_err("syncing log", &path, e))?;

        state.committed_len = Some(committed + line.len() as u64);
        Ok(())
    }

    /// Reconstruct a conversation from its log.
    pub async fn load(&self, id: &str) -> Result<Conversation> {
        let path = self.log_path(id);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| storage_err("reading log", &path, e))?;
        let (header, messages) = parse_log(&path, &bytes)?;

        if header.id != id {
            return Err(TermpalError::Storage(format!(
                "{}: header id '{}' does not match '{}'",
                path.display(),
                header.id,
                id
            )));
        }

        let meta = ConversationMeta {
            created_at: header.created_at,
            backend_used: header.backend_used,
        };
        Conversation::from_parts(id, meta, messages)
            .map_err(|e| TermpalError::Storage(format!("{}: {}", path.display(), e)))
    }

    /// List stored conversations, oldest first.
    pub async fn list(&self) -> Result<Vec<ConversationInfo>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| storage_err("listing store", &self.dir, e))?;

        let mut infos = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_err("listing store", &self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            match read_header(&path).await {
                Ok(header) => infos.push(ConversationInfo {
                    id: header.id,
                    created_at: header.created_at,
                    backend_used: header.backend_used,
                }),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable log"),
            }
        }

        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(infos)
    }

    /// Delete the log of `id`. Returns `false` if there was none.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let lock = self.log_lock(id).await;
        let mut state = lock.lock().await;

        let path = self.log_path(id);
        let deleted = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(storage_err("deleting log", &path, e)),
        };
        state.committed_len = None;
        drop(state);
        self.logs.lock().await.remove(id);
        Ok(deleted)
    }

    async fn log_lock(&self, id: &str) -> Arc<Mutex<LogState>> {
        let mut logs = self.logs.lock().await;
        logs.entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LogState::default())))
            .clone()
    }
}

fn encode_record(record: &Record) -> Result<String> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    Ok(line)
}

fn write_new_log(dir: &Path, target: &Path, body: &[u8]) -> Result<()> {
    if target.exists() {
        return Err(TermpalError::Storage(format!(
            "{}: conversation log already exists",
            target.display()
        )));
    }
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| storage_err("creating temp log", dir, e))?;
    tmp.write_all(body)
        .map_err(|e| storage_err("writing temp log", tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| storage_err("syncing temp log", tmp.path(), e))?;
    tmp.persist_noclobber(target)
        .map_err(|e| storage_err("renaming temp log", target, e.error))?;
    Ok(())
}

/// Length of the committed prefix of the log at `path`.
async fn committed_prefix_len(path: &Path) -> Result<u64> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| storage_err("reading log", path, e))?;
    Ok(committed_len(&bytes) as u64)
}

/// Length of the committed prefix of a log body.
///
/// Stops before an unterminated tail, and before a final terminated line
/// that does not parse: both are what an interrupted append leaves behind.
/// The header line is never discarded this way.
fn committed_len(bytes: &[u8]) -> usize {
    let Some(last_newline) = bytes.iter().rposition(|b| *b == b'\n') else {
        return 0;
    };
    let start = bytes[..last_newline]
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    let line = &bytes[start..last_newline];
    let torn = start > 0
        && !line.iter().all(u8::is_ascii_whitespace)
        && serde_json::from_slice::<Record>(line).is_err();
    if torn {
        start
    } else {
        last_newline + 1
    }
}

async fn read_header(path: &Path) -> Result<LogHeader> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| storage_err("reading log", path, e))?;
    let first = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    match parse_record(path, 1, first)? {
        Record::Header(header) => Ok(header),
        Record::Message(_) => Err(TermpalError::Storage(format!(
            "{}:1: expected header record",
            path.display()
        ))),
    }
}

fn parse_record(path: &Path, line_number: usize, line: &[u8]) -> Result<Record> {
    serde_json::from_slice::<Record>(line).map_err(|e| {
        TermpalError::Storage(format!("{}:{}: {}", path.display(), line_number, e))
    })
}

/// Parse a log body into its header and messages.
///
/// The tail an interrupted append can leave (an unterminated line, or a
/// final line that does not parse) is dropped. A malformed line anywhere
/// else is corruption and fails the load.
fn parse_log(path: &Path, bytes: &[u8]) -> Result<(LogHeader, Vec<Message>)> {
    let committed = &bytes[..committed_len(bytes)];
    if committed.len() < bytes.len() {
        warn!(
            path = %path.display(),
            discarded_bytes = bytes.len() - committed.len(),
            "Discarding incomplete trailing record"
        );
    }

    let mut header = None;
    let mut messages = Vec::new();

    for (index, line) in committed.split(|b| *b == b'\n').enumerate() {
        let line_number = index + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match parse_record(path, line_number, line)? {
            Record::Header(h) => {
                if line_number != 1 || header.is_some() {
                    return Err(TermpalError::Storage(format!(
                        "{}:{}: unexpected header record",
                        path.display(),
                        line_number
                    )));
                }
                if h.version != LOG_VERSION {
                    return Err(TermpalError::Storage(format!(
                        "{}:{}: unsupported log version {}",
                        path.display(),
                        line_number,
                        h.version
                    )));
                }
                header = Some(h);
            }
            Record::Message(m) => {
                if header.is_none() {
                    return Err(TermpalError::Storage(format!(
                        "{}:{}: missing header record",
                        path.display(),
                        line_number
                    )));
                }
                messages.push(m);
            }
        }
    }

    let header = header
        .ok_or_else(|| TermpalError::Storage(format!("{}: missing header record", path.display())))?;
    Ok((header, messages))
}

fn storage_err(action: &str, path: &Path, err: std::io::Error) -> TermpalError {
    TermpalError::Storage(format!("{} {}: {}", action, path.display(), err))
}

/// Sanitize a conversation id for use as a filename.
///
/// Characters that are problematic in filenames are percent-encoded so the
/// mapping stays reversible.
fn sanitize_key(key: &str) -> String {
    let mut result = String::with_capacity(key.len() * 3);
    for c in key.chars() {
        match c {
            '/' => result.push_str("%2F"),
            '\\' => result.push_str("%5C"),
            ':' => result.push_str("%3A"),
            '*' => result.push_str("%2A"),
            '?' => result.push_str("%3F"),
            '"' => result.push_str("%22"),
            '<' => result.push_str("%3C"),
            '>' => result.push_str("%3E"),
            '|' => result.push_str("%7C"),
            '%' => result.push_str("%25"),
            c => result.push(c),
        }
    }
    result
}
