//! # Mutation Log
//!
//! Append-only record of every mutation applied to the cache, replayed at boot instead of
//! rebuilding from the event store.
//!
//! ## Format
//!
//! JSON lines, one `Mutation` each:
//! - `{"op":"upsert","profile_id":1,"visit":{..}}`
//! - `{"op":"replace","profile_id":1,"visits":[..]}`
//! - `{"op":"flush","profile_id":1}`
//! - `{"op":"flush_all"}`
//!
//! ## Notes
//! - Appends can be suspended, a rebuild would otherwise log one line per canonical visit
//! - After a rebuild the log is rewritten to a `flush_all` plus the rebuilt views
//! - A last line without its newline is a torn append. Replay drops it and truncates the file
//!   back to the last complete line, so later appends start on a fresh line
//! - Appends run on the blocking pool, the writer may fsync
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    task::spawn_blocking,
};
use tracing::{debug, warn};

use crate::{
    cache::CacheStore,
    error::{StartupError, StoreError},
    models::{CanonicalVisit, UserId},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    Upsert {
        profile_id: UserId,
        visit: CanonicalVisit,
    },
    Replace {
        profile_id: UserId,
        visits: Vec<CanonicalVisit>,
    },
    Flush {
        profile_id: UserId,
    },
    FlushAll,
}

impl Mutation {
    pub async fn apply(&self, cache: &dyn CacheStore) -> Result<(), StoreError> {
        match self {
            Mutation::Upsert { profile_id, visit } => cache.upsert(*profile_id, *visit).await,
            Mutation::Replace { profile_id, visits } => cache.replace(*profile_id, visits).await,
            Mutation::Flush { profile_id } => cache.flush(*profile_id).await,
            Mutation::FlushAll => cache.flush_all().await,
        }
    }
}

/// How replay left the end of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    /// Partial entry after the last newline.
    Torn,
    /// Last entry parsed but was never terminated.
    Unterminated,
}

pub struct MutationLog {
    path: PathBuf,
    fsync: bool,
    enabled: AtomicBool,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl MutationLog {
    pub fn new(path: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            path: path.into(),
            fsync,
            enabled: AtomicBool::new(true),
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Stop appending until `resume`.
    pub fn suspend(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn resume(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn append(&self, mutation: &Mutation) -> Result<(), StoreError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut line = serde_json::to_vec(mutation)?;
        line.push(b'\n');

        let mut guard = self.writer.lock();
        if guard.is_none() {
            *guard = Some(open_append(&self.path)?);
        }

        if let Some(writer) = guard.as_mut() {
            writer.write_all(&line)?;
            writer.flush()?;
            if self.fsync {
                writer.get_ref().sync_data()?;
            }
        }

        Ok(())
    }

    /// Replace the whole log with `mutations`. Written aside and renamed into place.
    pub fn rewrite<I>(&self, mutations: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = Mutation>,
    {
        let mut guard = self.writer.lock();
        guard.take();

        let staging = self.path.with_extension("rewrite");
        let mut writer = BufWriter::new(File::create(&staging)?);

        let mut written = 0;
        for mutation in mutations {
            serde_json::to_writer(&mut writer, &mutation)?;
            writer.write_all(b"\n")?;
            written += 1;
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&staging, &self.path)?;

        Ok(written)
    }

    /// Apply every logged mutation to `cache`, in order.
    pub async fn replay(&self, cache: &dyn CacheStore) -> Result<usize, StartupError> {
        let file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StartupError::MissingLog(self.path.clone()));
            }
            Err(e) => return Err(StoreError::Io(e).into()),
        };

        let mut reader = BufReader::new(file);
        let mut buffer = Vec::new();
        let mut line = 0;
        let mut applied = 0;
        let mut intact: u64 = 0;
        let mut tail = None;

        loop {
            buffer.clear();
            let read = reader
                .read_until(b'\n', &mut buffer)
                .await
                .map_err(StoreError::Io)?;
            if read == 0 {
                break;
            }
            line += 1;

            let complete = buffer.last() == Some(&b'\n');
            if complete {
                intact += read as u64;
            }

            let text = String::from_utf8_lossy(&buffer);
            let text = text.trim();
            if text.is_empty() {
                if !complete {
                    tail = Some(Tail::Torn);
                }
                continue;
            }

            let mutation = match serde_json::from_str::<Mutation>(text) {
                Ok(mutation) => mutation,
                Err(e) if !complete => {
                    warn!("Dropping torn entry at line {line} of {}: {e}", self.path.display());
                    tail = Some(Tail::Torn);
                    break;
                }
                Err(e) => {
                    return Err(StartupError::CorruptLog {
                        line,
                        reason: e.to_string(),
                    });
                }
            };

            mutation.apply(cache).await?;
            applied += 1;

            if !complete {
                tail = Some(Tail::Unterminated);
            }
        }

        if let Some(tail) = tail {
            self.repair(tail, intact).await?;
        }

        debug!("Replayed {applied} mutations from {}", self.path.display());

        Ok(applied)
    }

    /// Make the log end on a newline again: drop a torn entry or terminate a whole one.
    async fn repair(&self, tail: Tail, intact: u64) -> Result<(), StoreError> {
        self.writer.lock().take();

        let mut options = tokio::fs::OpenOptions::new();
        let mut file = match tail {
            Tail::Torn => {
                let file = options.write(true).open(&self.path).await?;
                file.set_len(intact).await?;
                file
            }
            Tail::Unterminated => {
                let mut file = options.append(true).open(&self.path).await?;
                file.write_all(b"\n").await?;
                file
            }
        };
        file.flush().await?;
        file.sync_all().await?;

        warn!("Repaired {tail:?} tail of {}", self.path.display());

        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;

    Ok(BufWriter::new(file))
}

/// Cache that logs every mutation it applies.
pub struct JournaledCache {
    inner: Arc<dyn CacheStore>,
    log: Arc<MutationLog>,
}

impl JournaledCache {
    pub fn new(inner: Arc<dyn CacheStore>, log: Arc<MutationLog>) -> Self {
        Self { inner, log }
    }

    pub fn log(&self) -> &Arc<MutationLog> {
        &self.log
    }

    async fn journal(&self, mutation: Mutation) -> Result<(), StoreError> {
        if !self.log.is_enabled() {
            return Ok(());
        }

        let log = self.log.clone();
        spawn_blocking(move || log.append(&mutation)).await?
    }
}

#[async_trait]
impl CacheStore for JournaledCache {
    async fn upsert(&self, profile_id: UserId, visit: CanonicalVisit) -> Result<(), StoreError> {
        self.inner.upsert(profile_id, visit).await?;
        self.journal(Mutation::Upsert { profile_id, visit }).await
    }

    async fn query(
        &self,
        profile_id: UserId,
        limit: usize,
    ) -> Result<Vec<CanonicalVisit>, StoreError> {
        self.inner.query(profile_id, limit).await
    }

    async fn view(&self, profile_id: UserId) -> Result<Vec<CanonicalVisit>, StoreError> {
        self.inner.view(profile_id).await
    }

    async fn replace(
        &self,
        profile_id: UserId,
        visits: &[CanonicalVisit],
    ) -> Result<(), StoreError> {
        self.inner.replace(profile_id, visits).await?;
        self.journal(Mutation::Replace {
            profile_id,
            visits: visits.to_vec(),
        })
        .await
    }

    async fn flush(&self, profile_id: UserId) -> Result<(), StoreError> {
        self.inner.flush(profile_id).await?;
        self.journal(Mutation::Flush { profile_id }).await
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.inner.flush_all().await?;
        self.journal(Mutation::FlushAll).await
    }

    async fn profiles(&self) -> Result<Vec<UserId>, StoreError> {
        self.inner.profiles().await
    }
}
