//! Recipient mailboxes: the bundled delivery transport.
//!
//! Delivery is at-least-once. A message handed out by `take`/`recv` stays in
//! the unacknowledged list until the recipient acks it; `reconnect` puts every
//! unacknowledged message back at the head of the inbox. A full inbox refuses
//! new messages instead of evicting old ones, so the gateway retries.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::config::MailboxConfig;
use crate::error::{Error, Result};
use crate::protocol::Envelope;

const DEFAULT_MAX_SIZE: usize = 1000;
const DEFAULT_COMPACT_AFTER: usize = 64;

/// Boundary between the gateway and whatever carries envelopes to sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand one envelope to the session registered as `instance_id`.
    async fn deliver(&self, instance_id: &str, envelope: &Envelope) -> Result<()>;
}

/// One session's mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMailbox {
    pub instance_id: String,
    /// Delivered, not yet handed out.
    pub inbox: VecDeque<Envelope>,
    /// Handed out, awaiting ack.
    pub unacked: Vec<Envelope>,
    pub total_received: u64,
    pub total_acked: u64,
    /// Deliveries refused because the inbox was full.
    #[serde(default)]
    pub total_refused: u64,
    pub last_activity: i64,
    /// Snapshot lines currently in the mailbox file.
    #[serde(skip)]
    file_lines: usize,
}

/// Result of offering an envelope to a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Offer {
    Accepted,
    AlreadyHeld,
    Full,
}

impl SessionMailbox {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            inbox: VecDeque::new(),
            unacked: Vec::new(),
            total_received: 0,
            total_acked: 0,
            total_refused: 0,
            last_activity: chrono::Utc::now().timestamp_millis(),
            file_lines: 0,
        }
    }

    fn holds(&self, message_id: &str) -> bool {
        self.inbox.iter().any(|e| e.message_id == message_id)
            || self.unacked.iter().any(|e| e.message_id == message_id)
    }

    fn push(&mut self, envelope: Envelope, max_size: usize) -> Offer {
        if self.holds(&envelope.message_id) {
            return Offer::AlreadyHeld;
        }
        if self.inbox.len() >= max_size {
            self.total_refused += 1;
            return Offer::Full;
        }
        self.inbox.push_back(envelope);
        self.total_received += 1;
        self.touch();
        Offer::Accepted
    }

    fn take(&mut self) -> Option<Envelope> {
        let envelope = self.inbox.pop_front()?;
        self.unacked.push(envelope.clone());
        self.touch();
        Some(envelope)
    }

    fn ack(&mut self, message_id: &str) -> bool {
        let Some(pos) = self.unacked.iter().position(|e| e.message_id == message_id) else {
            return false;
        };
        self.unacked.remove(pos);
        self.total_acked += 1;
        self.touch();
        true
    }

    fn requeue(&mut self) -> usize {
        let count = self.unacked.len();
        for envelope in self.unacked.drain(..).rev() {
            self.inbox.push_front(envelope);
        }
        self.touch();
        count
    }

    fn touch(&mut self) {
        self.last_activity = chrono::Utc::now().timestamp_millis();
    }

    pub fn stats(&self) -> MailboxStats {
        MailboxStats {
            instance_id: self.instance_id.clone(),
            inbox_count: self.inbox.len(),
            unacked_count: self.unacked.len(),
            total_received: self.total_received,
            total_acked: self.total_acked,
            total_refused: self.total_refused,
            last_activity: self.last_activity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStats {
    pub instance_id: String,
    pub inbox_count: usize,
    pub unacked_count: usize,
    pub total_received: u64,
    pub total_acked: u64,
    pub total_refused: u64,
    pub last_activity: i64,
}

/// All session mailboxes, optionally persisted as JSONL snapshots.
#[derive(Debug)]
pub struct MailboxStore {
    base_path: Option<PathBuf>,
    max_size: usize,
    compact_after: usize,
    cache: Mutex<HashMap<String, SessionMailbox>>,
    signals: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Default for MailboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxStore {
    /// In-memory store.
    pub fn new() -> Self {
        Self {
            base_path: None,
            max_size: DEFAULT_MAX_SIZE,
            compact_after: DEFAULT_COMPACT_AFTER,
            cache: Mutex::new(HashMap::new()),
            signals: Mutex::new(HashMap::new()),
        }
    }

    /// Store persisting one `<instance>.jsonl` file per mailbox under `dir`.
    pub fn persistent(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            base_path: Some(dir),
            ..Self::new()
        })
    }

    pub fn from_config(config: &MailboxConfig) -> Result<Self> {
        let store = match &config.dir {
            Some(dir) => Self::persistent(dir)?,
            None => Self::new(),
        };
        Ok(store
            .with_max_size(config.max_size)
            .with_compact_after(config.compact_after))
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    pub fn with_compact_after(mut self, lines: usize) -> Self {
        self.compact_after = lines.max(1);
        self
    }

    /// Put an envelope in a mailbox. Returns false if it was already there.
    ///
    /// A full inbox is an error; nothing already queued is given up.
    pub fn push(&self, instance_id: &str, envelope: Envelope) -> Result<bool> {
        let message_id = envelope.message_id.clone();
        match self.update(instance_id, |mailbox| mailbox.push(envelope, self.max_size))? {
            Offer::Accepted => {
                self.signal(instance_id).notify_one();
                Ok(true)
            }
            Offer::AlreadyHeld => Ok(false),
            Offer::Full => {
                tracing::warn!(instance_id, %message_id, max_size = self.max_size, "mailbox full");
                Err(Error::Transport(format!(
                    "mailbox {} is full ({} messages)",
                    instance_id, self.max_size
                )))
            }
        }
    }

    /// Hand out the oldest pending message, if any.
    pub fn take(&self, instance_id: &str) -> Result<Option<Envelope>> {
        self.update(instance_id, SessionMailbox::take)
    }

    /// Wait up to `timeout` for the next message.
    pub async fn recv(&self, instance_id: &str, timeout: Duration) -> Result<Option<Envelope>> {
        let signal = self.signal(instance_id);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(envelope) = self.take(instance_id)? {
                return Ok(Some(envelope));
            }
            if tokio::time::timeout_at(deadline, signal.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Acknowledge a handed-out message. False if it was not outstanding.
    pub fn ack(&self, instance_id: &str, message_id: &str) -> Result<bool> {
        self.update(instance_id, |mailbox| mailbox.ack(message_id))
    }

    /// Requeue everything handed out but not acknowledged.
    pub fn reconnect(&self, instance_id: &str) -> Result<usize> {
        let requeued = self.update(instance_id, SessionMailbox::requeue)?;
        if requeued > 0 {
            tracing::info!(instance_id, requeued, "requeued unacknowledged messages");
            self.signal(instance_id).notify_one();
        }
        Ok(requeued)
    }

    /// Messages waiting to be handed out, oldest first.
    pub fn pending(&self, instance_id: &str) -> Result<Vec<Envelope>> {
        self.read(instance_id, |mailbox| mailbox.inbox.iter().cloned().collect())
    }

    pub fn stats(&self, instance_id: &str) -> Result<MailboxStats> {
        self.read(instance_id, SessionMailbox::stats)
    }

    /// Forget a mailbox. Its file, if any, is kept.
    pub fn remove(&self, instance_id: &str) -> Option<SessionMailbox> {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_id);
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_id)
    }

    fn read<T>(&self, instance_id: &str, f: impl FnOnce(&SessionMailbox) -> T) -> Result<T> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let mailbox = self.load_into(&mut cache, instance_id)?;
        Ok(f(mailbox))
    }

    /// Mutate a mailbox and append its new state to disk.
    fn update<T>(&self, instance_id: &str, f: impl FnOnce(&mut SessionMailbox) -> T) -> Result<T> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let mailbox = self.load_into(&mut cache, instance_id)?;
        let out = f(&mut *mailbox);
        self.save(mailbox)?;
        Ok(out)
    }

    fn load_into<'c>(
        &self,
        cache: &'c mut HashMap<String, SessionMailbox>,
        instance_id: &str,
    ) -> Result<&'c mut SessionMailbox> {
        if !cache.contains_key(instance_id) {
            let mailbox = match self.load(instance_id)? {
                Some(mailbox) => mailbox,
                None => SessionMailbox::new(instance_id),
            };
            cache.insert(instance_id.to_string(), mailbox);
        }
        cache
            .get_mut(instance_id)
            .ok_or_else(|| Error::NotFound(format!("mailbox {}", instance_id)))
    }

    fn signal(&self, instance_id: &str) -> Arc<Notify> {
        let mut signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(signals.entry(instance_id.to_string()).or_default())
    }

    fn mailbox_path(&self, instance_id: &str) -> Option<PathBuf> {
        let safe: String = instance_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.base_path
            .as_ref()
            .map(|base| base.join(format!("{}.jsonl", safe)))
    }

    /// Last line of the mailbox file is its latest state.
    fn load(&self, instance_id: &str) -> Result<Option<SessionMailbox>> {
        let Some(path) = self.mailbox_path(instance_id) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut last = None;
        let mut lines = 0;
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                last = Some(line);
                lines += 1;
            }
        }
        match last {
            Some(line) => {
                let mut mailbox: SessionMailbox = serde_json::from_str(&line)?;
                mailbox.file_lines = lines;
                Ok(Some(mailbox))
            }
            None => Ok(None),
        }
    }

    /// Append the mailbox state, or rewrite the file once it is long enough.
    fn save(&self, mailbox: &mut SessionMailbox) -> Result<()> {
        let Some(path) = self.mailbox_path(&mailbox.instance_id) else {
            return Ok(());
        };
        let compact = mailbox.file_lines >= self.compact_after;
        let mut file = if compact {
            OpenOptions::new()
                .write(true)
                .truncate(true)
                .create(true)
                .open(&path)?
        } else {
            OpenOptions::new().create(true).append(true).open(&path)?
        };
        writeln!(file, "{}", serde_json::to_string(&*mailbox)?)?;

        if compact {
            tracing::debug!(instance_id = %mailbox.instance_id, lines = mailbox.file_lines, "compacted mailbox file");
            mailbox.file_lines = 1;
        } else {
            mailbox.file_lines += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MailboxStore {
    async fn deliver(&self, instance_id: &str, envelope: &Envelope) -> Result<()> {
        if !self.push(instance_id, envelope.clone())? {
            tracing::debug!(instance_id, message_id = %envelope.message_id, "already in mailbox");
        }
        Ok(())
    }
}
