//! Write-ahead logs for durable queues.
//!
//! Each durable queue owns one append-only file `<hex(sha256(name))>.wal` in
//! the WAL directory, so every valid queue name fits the file name limit. The
//! real name lives in the config record. A file is a sequence of records:
//!
//! ```text
//! [u32 LE magic][u32 LE body len][u32 LE crc32c(body)][body]
//! ```
//!
//! The body starts with a kind byte: a queue config record, a data record
//! carrying an encoded message, or an ack record carrying the id of a message
//! that left the queue. Replaying a file yields the config plus every data
//! record that was never acked, in offer order.

use crate::message::Message;
use crate::protocol::{Compressor, Encryptor, Protocol};
use crate::queue::MessageQueue;
use crate::{CourierError, Result};
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

const RECORD_MAGIC: u32 = 0x4357_4C31; // "CWL1"
const RECORD_HEADER_LEN: usize = 12;
const WAL_EXTENSION: &str = "wal";

const KIND_CONFIG: u8 = 1;
const KIND_DATA: u8 = 2;
const KIND_ACK: u8 = 3;

/// Queue parameters recorded at the head of every log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalQueueConfig {
    pub name: String,
    pub capacity: usize,
    pub bounded: bool,
}

impl WalQueueConfig {
    pub fn of(queue: &MessageQueue) -> Self {
        Self {
            name: queue.name().to_string(),
            capacity: queue.capacity(),
            bounded: queue.is_bounded(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    Config(WalQueueConfig),
    Data(Message),
    Ack(Uuid),
}

impl WalRecord {
    fn encode_body(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        match self {
            WalRecord::Config(config) => {
                body.push(KIND_CONFIG);
                body.extend(serde_json::to_vec(config)?);
            }
            WalRecord::Data(msg) => {
                body.push(KIND_DATA);
                body.extend(Protocol::encode(
                    msg,
                    &Compressor::off(),
                    &Encryptor::off(),
                    usize::MAX,
                )?);
            }
            WalRecord::Ack(id) => {
                body.push(KIND_ACK);
                body.extend_from_slice(id.as_bytes());
            }
        }
        Ok(body)
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let (kind, rest) = body
            .split_first()
            .ok_or_else(|| CourierError::invalid_message("empty WAL record"))?;
        match *kind {
            KIND_CONFIG => Ok(WalRecord::Config(serde_json::from_slice(rest)?)),
            KIND_DATA => Ok(WalRecord::Data(Protocol::decode(rest)?)),
            KIND_ACK => {
                let id = Uuid::from_slice(rest)
                    .map_err(|e| CourierError::invalid_message(format!("bad ack record: {}", e)))?;
                Ok(WalRecord::Ack(id))
            }
            other => Err(CourierError::invalid_message(format!(
                "unknown WAL record kind {}",
                other
            ))),
        }
    }
}

/// Frame one record for appending to a log.
pub fn encode_record(record: &WalRecord) -> Result<Vec<u8>> {
    let body = record.encode_body()?;
    let len = u32::try_from(body.len()).map_err(|_| CourierError::MessageTooLarge {
        size: body.len(),
        max: u32::MAX as usize,
    })?;

    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
    buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc32c(&body).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode every intact record of a log. Reading stops at the first torn or
/// corrupt record; the reason is returned alongside the records before it.
pub fn decode_records(mut bytes: &[u8]) -> (Vec<WalRecord>, Option<String>) {
    let mut records = Vec::new();
    while !bytes.is_empty() {
        let Some((header, rest)) = bytes.split_first_chunk::<RECORD_HEADER_LEN>() else {
            return (records, Some("torn record header".to_string()));
        };
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != RECORD_MAGIC {
            return (records, Some(format!("bad record magic {:#x}", magic)));
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let expected_crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if rest.len() < len {
            return (records, Some("torn record body".to_string()));
        }
        let (body, rest) = rest.split_at(len);
        let actual_crc = crc32c(body);
        if actual_crc != expected_crc {
            return (
                records,
                Some(format!("crc mismatch: expected {:#x}, got {:#x}", expected_crc, actual_crc)),
            );
        }
        match WalRecord::decode_body(body) {
            Ok(record) => records.push(record),
            Err(e) => return (records, Some(e.to_string())),
        }
        bytes = rest;
    }
    (records, None)
}

/// A durable queue rebuilt from its log.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredQueue {
    pub config: WalQueueConfig,
    pub messages: Vec<Message>,
}

/// Owns the WAL directory. A disabled manager accepts every call and writes
/// nothing.
#[derive(Debug)]
pub struct WalQueueManager {
    dir: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl WalQueueManager {
    pub fn disabled() -> Self {
        Self {
            dir: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Open (creating if needed) the WAL directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CourierError::io_with_path(e, &dir))?;
        info!("Write-ahead log directory: {}", dir.display());
        Ok(Self {
            dir: Some(dir),
            write_lock: Mutex::new(()),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Path of the log for `queue_name`, if the WAL is enabled.
    pub fn log_path(&self, queue_name: &str) -> Option<PathBuf> {
        let digest = hex::encode(Sha256::digest(queue_name));
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.{}", digest, WAL_EXTENSION)))
    }

    /// Start a fresh log for a newly created durable queue.
    pub fn log_config(&self, queue: &MessageQueue) -> Result<()> {
        let Some(path) = self.log_path(queue.name()) else {
            return Ok(());
        };
        let frame = encode_record(&WalRecord::Config(WalQueueConfig::of(queue)))?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        fs::write(&path, frame).map_err(|e| CourierError::io_with_path(e, &path))
    }

    pub fn log_offer(&self, queue_name: &str, msg: &Message) -> Result<()> {
        self.append(queue_name, &WalRecord::Data(msg.clone()))
    }

    pub fn log_ack(&self, queue_name: &str, id: Uuid) -> Result<()> {
        self.append(queue_name, &WalRecord::Ack(id))
    }

    /// Delete the log of a removed queue.
    pub fn remove_log(&self, queue_name: &str) -> Result<()> {
        let Some(path) = self.log_path(queue_name) else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CourierError::io_with_path(e, &path)),
        }
    }

    /// Rewrite a queue's log as its config plus the messages it currently
    /// holds, dropping acked history.
    pub fn compact(&self, queue: &MessageQueue) -> Result<()> {
        let Some(path) = self.log_path(queue.name()) else {
            return Ok(());
        };
        let mut buf = encode_record(&WalRecord::Config(WalQueueConfig::of(queue)))?;
        for msg in queue.snapshot().into_iter().filter(|m| !m.is_transient()) {
            buf.extend(encode_record(&WalRecord::Data(msg))?);
        }

        let tmp = path.with_extension("wal.tmp");
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        fs::write(&tmp, &buf).map_err(|e| CourierError::io_with_path(e, &tmp))?;
        fs::rename(&tmp, &path).map_err(|e| CourierError::io_with_path(e, &path))?;
        debug!(queue = queue.name(), bytes = buf.len(), "compacted queue log");
        Ok(())
    }

    /// Replay every log in the directory.
    pub fn recover(&self) -> Result<Vec<RecoveredQueue>> {
        let mut recovered = Vec::new();
        for path in self.log_files()? {
            let bytes = fs::read(&path).map_err(|e| CourierError::io_with_path(e, &path))?;
            let (records, stopped) = decode_records(&bytes);
            if let Some(reason) = stopped {
                warn!("Queue log {} ends early: {}", path.display(), reason);
            }
            match replay(records) {
                Some(queue) => recovered.push(queue),
                None => warn!("Ignoring queue log without a config record: {}", path.display()),
            }
        }
        Ok(recovered)
    }

    /// Number of log files in the WAL directory.
    pub fn file_count(&self) -> usize {
        self.log_files().map(|files| files.len()).unwrap_or(0)
    }

    /// Total size of all log files in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.log_files()
            .map(|files| {
                files
                    .iter()
                    .filter_map(|path| fs::metadata(path).ok())
                    .map(|meta| meta.len())
                    .sum()
            })
            .unwrap_or(0)
    }

    fn append(&self, queue_name: &str, record: &WalRecord) -> Result<()> {
        let Some(path) = self.log_path(queue_name) else {
            return Ok(());
        };
        let frame = encode_record(record)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| CourierError::io_with_path(e, &path))?;
        file.write_all(&frame)
            .and_then(|_| file.sync_data())
            .map_err(|e| CourierError::io_with_path(e, &path))
    }

    fn log_files(&self) -> Result<Vec<PathBuf>> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| CourierError::io_with_path(e, dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == WAL_EXTENSION))
            .collect();
        files.sort();
        Ok(files)
    }
}

fn replay(records: Vec<WalRecord>) -> Option<RecoveredQueue> {
    let mut config = None;
    let mut messages = Vec::new();
    let mut acked = HashSet::new();
    for record in records {
        match record {
            WalRecord::Config(c) => config = Some(c),
            WalRecord::Data(msg) => messages.push(msg),
            WalRecord::Ack(id) => {
                acked.insert(id);
            }
        }
    }
    messages.retain(|m| !acked.contains(&m.id()));
    config.map(|config| RecoveredQueue { config, messages })
}
