//! Durable log and state machine storage for raft.
//!
//! Everything lives under one directory:
//!
//! - `log`: checksummed records, each an appended entry or a purge marker
//! - `vote.json`: the last granted vote
//! - `snapshot.json`: the latest state machine snapshot
//! - `peers.json`: the last known membership, id to raft address
//!
//! On open the snapshot seeds the state machine and the log is replayed
//! into memory. Entries past the snapshot are re-applied by raft once it
//! learns they are committed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::fs;
use std::io::{self, Cursor};
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use openraft::storage::{LogState, RaftLogReader, RaftSnapshotBuilder, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, Membership, OptionalSend, RaftStorage, SnapshotMeta,
    StorageError, StorageIOError, StoredMembership, Vote,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use vigil_core::{MasterResponse, MasterState};

use crate::disk::{read_optional, write_atomic, LogReader, LogWriter, StoreError};
use crate::raft::TypeConfig;

const LOG_FILE: &str = "log";
const VOTE_FILE: &str = "vote.json";
const SNAPSHOT_FILE: &str = "snapshot.json";
const PEERS_FILE: &str = "peers.json";

/// One record in the log file.
#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Entry(Entry<TypeConfig>),
    /// Everything up to and including this id is gone.
    Purged(LogId<u64>),
}

/// The state machine image shipped between nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterSnapshot {
    pub last_applied: Option<LogId<u64>>,
    pub last_membership: StoredMembership<u64, BasicNode>,
    pub masters: BTreeSet<String>,
}

/// On-disk form of `snapshot.json`.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    meta: SnapshotMeta<u64, BasicNode>,
    snapshot: MasterSnapshot,
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta<u64, BasicNode>,
    data: Vec<u8>,
}

/// Combined log and state machine storage, persisted to a directory.
#[derive(Debug)]
pub struct Storage {
    dir: PathBuf,
    log_file: Mutex<LogWriter>,
    vote: RwLock<Option<Vote<u64>>>,
    log: RwLock<BTreeMap<u64, Entry<TypeConfig>>>,
    last_purged: RwLock<Option<LogId<u64>>>,
    last_applied: RwLock<Option<LogId<u64>>>,
    last_membership: RwLock<StoredMembership<u64, BasicNode>>,
    snapshot: RwLock<Option<StoredSnapshot>>,
    masters: MasterState,
}

impl Storage {
    /// Opens the storage in `dir`, creating it if needed, and loads any
    /// prior state into `masters`.
    ///
    /// A checksum mismatch anywhere in the log fails the open.
    pub fn open(dir: impl Into<PathBuf>, masters: MasterState) -> Result<Arc<Self>, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let vote = read_json::<Vote<u64>>(&dir.join(VOTE_FILE))?;

        let mut last_applied = None;
        let mut last_membership = StoredMembership::default();
        let mut snapshot = None;
        if let Some(file) = read_json::<SnapshotFile>(&dir.join(SNAPSHOT_FILE))? {
            last_applied = file.snapshot.last_applied;
            last_membership = file.snapshot.last_membership.clone();
            masters.restore(file.snapshot.masters.clone());
            let data = serde_json::to_vec(&file.snapshot).map_err(|e| invalid(&dir, e))?;
            snapshot = Some(StoredSnapshot {
                meta: file.meta,
                data,
            });
        }

        let log_path = dir.join(LOG_FILE);
        let mut log = BTreeMap::new();
        let mut last_purged = None;
        if log_path.exists() {
            let mut reader = LogReader::open(&log_path)?;
            while let Some(payload) = reader.next_record()? {
                let record: LogRecord =
                    bincode::deserialize(&payload).map_err(|e| invalid(&log_path, e))?;
                match record {
                    LogRecord::Entry(entry) => {
                        log.insert(entry.log_id.index, entry);
                    }
                    LogRecord::Purged(log_id) => {
                        log.retain(|index, _| *index > log_id.index);
                        last_purged = Some(log_id);
                    }
                }
            }
        }
        let log_file = LogWriter::open(&log_path)?;

        if !log.is_empty() || snapshot.is_some() {
            info!(
                dir = %dir.display(),
                entries = log.len(),
                masters = masters.len(),
                "recovered raft state"
            );
        }

        Ok(Arc::new(Self {
            dir,
            log_file: Mutex::new(log_file),
            vote: RwLock::new(vote),
            log: RwLock::new(log),
            last_purged: RwLock::new(last_purged),
            last_applied: RwLock::new(last_applied),
            last_membership: RwLock::new(last_membership),
            snapshot: RwLock::new(snapshot),
            masters,
        }))
    }

    /// Removes all persisted state in `dir`.
    pub fn wipe(dir: &Path) -> Result<(), StoreError> {
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether this node has ever taken part in a cluster.
    pub async fn has_history(&self) -> bool {
        self.vote.read().await.is_some()
            || !self.log.read().await.is_empty()
            || self.last_purged.read().await.is_some()
            || self.snapshot.read().await.is_some()
    }

    /// Last membership written to `peers.json`.
    pub fn persisted_peers(&self) -> Result<BTreeMap<u64, String>, StoreError> {
        Ok(read_json(&self.dir.join(PEERS_FILE))?.unwrap_or_default())
    }

    pub fn save_peers(&self, peers: &BTreeMap<u64, String>) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(peers).map_err(|e| invalid(&self.dir, e))?;
        write_atomic(&self.dir.join(PEERS_FILE), &data)
    }

    /// Flushes and fsyncs the log.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.writer().sync()
    }

    fn writer(&self) -> std::sync::MutexGuard<'_, LogWriter> {
        self.log_file.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save_membership(&self, membership: &Membership<u64, BasicNode>) -> Result<(), StoreError> {
        let peers = membership
            .nodes()
            .map(|(id, node)| (*id, node.addr.clone()))
            .collect();
        self.save_peers(&peers)
    }

    /// Rewrites the log file from the in-memory log.
    fn rewrite_log(
        &self,
        log: &BTreeMap<u64, Entry<TypeConfig>>,
        last_purged: Option<LogId<u64>>,
    ) -> Result<(), StoreError> {
        let mut records = Vec::with_capacity(log.len() + 1);
        if let Some(log_id) = last_purged {
            records.push(encode(&self.dir, &LogRecord::Purged(log_id))?);
        }
        for entry in log.values() {
            records.push(encode(&self.dir, &LogRecord::Entry(entry.clone()))?);
        }
        let mut writer = self.writer();
        writer.rewrite(records.iter().map(Vec::as_slice))?;
        writer.sync()
    }

    fn save_snapshot(
        &self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: &MasterSnapshot,
    ) -> Result<(), StoreError> {
        let file = SnapshotFile {
            meta: meta.clone(),
            snapshot: snapshot.clone(),
        };
        let data = serde_json::to_vec(&file).map_err(|e| invalid(&self.dir, e))?;
        write_atomic(&self.dir.join(SNAPSHOT_FILE), &data)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StoreError> {
    match read_optional(path)? {
        Some(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| invalid(path, e)),
        None => Ok(None),
    }
}

fn encode(dir: &Path, record: &LogRecord) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(record).map_err(|e| invalid(dir, e))
}

fn invalid(path: &Path, e: impl std::fmt::Display) -> StoreError {
    StoreError::InvalidData {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

impl StoredSnapshot {
    fn to_snapshot(&self) -> Snapshot<TypeConfig> {
        Snapshot {
            meta: self.meta.clone(),
            snapshot: Box::new(Cursor::new(self.data.clone())),
        }
    }
}

/// Snapshot ids are `<term>-<index>` of the last applied entry.
fn snapshot_id(last_applied: Option<LogId<u64>>) -> String {
    match last_applied {
        Some(id) => format!("{}-{}", id.leader_id.term, id.index),
        None => "0-0".to_string(),
    }
}

impl RaftLogReader<TypeConfig> for Arc<Storage> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        Ok(self
            .log
            .read()
            .await
            .range(range)
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<Storage> {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let image = MasterSnapshot {
            last_applied: *self.last_applied.read().await,
            last_membership: self.last_membership.read().await.clone(),
            masters: self.masters.snapshot(),
        };
        let meta = SnapshotMeta {
            last_log_id: image.last_applied,
            last_membership: image.last_membership.clone(),
            snapshot_id: snapshot_id(image.last_applied),
        };
        let data = serde_json::to_vec(&image)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;
        self.save_snapshot(&meta, &image)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;
        debug!(snapshot = %meta.snapshot_id, masters = image.masters.len(), "built snapshot");

        let stored = StoredSnapshot { meta, data };
        let snapshot = stored.to_snapshot();
        *self.snapshot.write().await = Some(stored);
        Ok(snapshot)
    }
}

impl RaftStorage<TypeConfig> for Arc<Storage> {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<u64>> {
        let last_purged_log_id = *self.last_purged.read().await;
        // an empty log after a purge still ends at the purge point
        let last_log_id = match self.log.read().await.last_key_value() {
            Some((_, entry)) => Some(entry.log_id),
            None => last_purged_log_id,
        };
        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn save_vote(&mut self, vote: &Vote<u64>) -> Result<(), StorageError<u64>> {
        let persisted = serde_json::to_vec(vote)
            .map_err(|e| invalid(&self.dir, e))
            .and_then(|data| write_atomic(&self.dir.join(VOTE_FILE), &data));
        if let Err(e) = persisted {
            return Err(StorageIOError::write_vote(&e).into());
        }
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<u64>>, StorageError<u64>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        Arc::clone(self)
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        let mut log = self.log.write().await;
        let mut writer = self.writer();
        for entry in entries {
            let record = LogRecord::Entry(entry);
            encode(&self.dir, &record)
                .and_then(|data| writer.append(&data))
                .map_err(|e| StorageIOError::write_logs(&e))?;
            if let LogRecord::Entry(entry) = record {
                log.insert(entry.log_id.index, entry);
            }
        }
        // raft treats returned entries as durable
        writer.sync().map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<u64>,
    ) -> Result<(), StorageError<u64>> {
        let mut log = self.log.write().await;
        let removed = log.split_off(&log_id.index);
        debug!(from = log_id.index, removed = removed.len(), "truncating conflicting logs");
        let purged = *self.last_purged.read().await;
        self.rewrite_log(&log, purged)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        let mut log = self.log.write().await;
        *log = log.split_off(&(log_id.index + 1));
        self.rewrite_log(&log, Some(log_id))
            .map_err(|e| StorageIOError::write_logs(&e))?;
        *self.last_purged.write().await = Some(log_id);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), StorageError<u64>> {
        Ok((
            *self.last_applied.read().await,
            self.last_membership.read().await.clone(),
        ))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<MasterResponse>, StorageError<u64>> {
        let mut responses = Vec::with_capacity(entries.len());
        for entry in entries {
            let response = match &entry.payload {
                EntryPayload::Normal(cmd) => self.masters.apply(cmd),
                EntryPayload::Membership(membership) => {
                    self.save_membership(membership)
                        .map_err(|e| StorageIOError::apply(entry.log_id, &e))?;
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    MasterResponse {
                        masters: self.masters.len(),
                    }
                }
                EntryPayload::Blank => MasterResponse {
                    masters: self.masters.len(),
                },
            };
            responses.push(response);
            *self.last_applied.write().await = Some(entry.log_id);
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::default())
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let data = snapshot.into_inner();
        let image: MasterSnapshot = serde_json::from_slice(&data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

        // disk first, so a crash mid-install reopens to the new image
        self.save_snapshot(meta, &image)
            .and_then(|()| self.save_membership(image.last_membership.membership()))
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;

        info!(
            snapshot = %meta.snapshot_id,
            masters = image.masters.len(),
            "installed snapshot from leader"
        );
        *self.last_applied.write().await = image.last_applied;
        *self.last_membership.write().await = image.last_membership;
        self.masters.restore(image.masters);
        *self.snapshot.write().await = Some(StoredSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        Ok(self
            .snapshot
            .read()
            .await
            .as_ref()
            .map(StoredSnapshot::to_snapshot))
    }
}
