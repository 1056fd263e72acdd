use memfab_core::model::{SnapshotMeta, SnapshotPhase};
use memfab_core::wire::Event;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ReassemblyError {
    #[error("unknown snapshot id: {0}")]
    UnknownSnapshot(String),
    #[error("chunk index {index} out of range for {total} chunks")]
    ChunkIndexOutOfRange { index: u32, total: u32 },
    #[error("chunk count mismatch: announced {expected}, chunk says {got}")]
    ChunkCountMismatch { expected: u32, got: u32 },
    #[error("chunk payload too large: {size} > {max}")]
    ChunkTooLarge { size: usize, max: usize },
    #[error("snapshot {0} is not fully received")]
    NotReady(String),
    #[error("snapshot {0} is already complete")]
    AlreadyComplete(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotState {
    Announced,
    Receiving,
    Complete,
}

#[derive(Debug)]
struct SnapshotEntry {
    meta: SnapshotMeta,
    rel_path: PathBuf,
    chunks: Vec<Option<String>>,
    received: u32,
    completion_requested: bool,
    state: SnapshotState,
    stored_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkProgress {
    pub received: u32,
    pub total: u32,
    /// True when this chunk filled the last gap after an early completion
    /// message; the caller should finalize now.
    pub ready: bool,
}

/// Everything needed to persist a finished snapshot. Produced under the
/// table lock, written to disk after it is released.
#[derive(Debug, Clone)]
pub struct PersistJob {
    pub id: String,
    pub path: PathBuf,
    pub filename: String,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub id: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    #[serde(rename = "containerId")]
    pub container_id: String,
    pub phase: SnapshotPhase,
    pub timestamp: i64,
    pub size: u64,
    pub filename: String,
    #[serde(rename = "receivedChunks")]
    pub received_chunks: u32,
    #[serde(rename = "totalChunks")]
    pub total_chunks: u32,
    pub status: SnapshotState,
}

/// Per-snapshot reassembly state machine. Chunk payloads are opaque text;
/// the persisted blob is their in-index-order concatenation, byte for byte.
pub struct SnapshotTable {
    dir: PathBuf,
    max_chunk_bytes: usize,
    entries: HashMap<String, SnapshotEntry>,
}

impl SnapshotTable {
    pub fn new(dir: PathBuf, max_chunk_bytes: usize) -> Self {
        Self {
            dir,
            max_chunk_bytes,
            entries: HashMap::new(),
        }
    }

    /// Announce a snapshot. Re-announcing an id replaces its chunk table
    /// outright; there is no merging with a previous attempt.
    pub fn announce(&mut self, meta: SnapshotMeta) -> Event {
        let rel_path = PathBuf::from(&meta.filename);
        self.announce_at(meta, rel_path)
    }

    fn announce_at(&mut self, meta: SnapshotMeta, rel_path: PathBuf) -> Event {
        let chunks = match meta.total_chunks {
            Some(total) => vec![None; total as usize],
            None => Vec::new(),
        };
        if self.entries.contains_key(&meta.id) {
            warn!(event = "snapshot_reannounced", snapshot_id = %meta.id);
        }
        info!(
            event = "snapshot_announced",
            snapshot_id = %meta.id,
            service = %meta.service_name,
            phase = %meta.phase,
            declared_size = meta.size
        );
        let event = Event::SnapshotStarted {
            snapshot: meta.clone(),
        };
        self.entries.insert(
            meta.id.clone(),
            SnapshotEntry {
                meta,
                rel_path,
                chunks,
                received: 0,
                completion_requested: false,
                state: SnapshotState::Announced,
                stored_size: None,
            },
        );
        event
    }

    /// Store one chunk. Duplicate indexes are last-writer-wins and do not
    /// re-increment the received count.
    pub fn receive_chunk(
        &mut self,
        id: &str,
        index: u32,
        total: u32,
        data: String,
    ) -> Result<ChunkProgress, ReassemblyError> {
        if data.len() > self.max_chunk_bytes {
            return Err(ReassemblyError::ChunkTooLarge {
                size: data.len(),
                max: self.max_chunk_bytes,
            });
        }
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| ReassemblyError::UnknownSnapshot(id.to_string()))?;
        if entry.state == SnapshotState::Complete {
            return Err(ReassemblyError::AlreadyComplete(id.to_string()));
        }

        if entry.chunks.is_empty() {
            entry.chunks = vec![None; total as usize];
        } else if entry.chunks.len() != total as usize {
            return Err(ReassemblyError::ChunkCountMismatch {
                expected: entry.chunks.len() as u32,
                got: total,
            });
        }
        let slot = entry
            .chunks
            .get_mut(index as usize)
            .ok_or(ReassemblyError::ChunkIndexOutOfRange { index, total })?;
        if slot.is_none() {
            entry.received += 1;
        }
        *slot = Some(data);
        entry.state = SnapshotState::Receiving;
        entry.meta.total_chunks = Some(total);

        let populated = entry.chunks.iter().all(Option::is_some);
        Ok(ChunkProgress {
            received: entry.received,
            total,
            ready: populated && entry.completion_requested,
        })
    }

    /// Handle a completion message. Returns true when the chunk table is
    /// fully populated and the snapshot can be finalized now; an early
    /// completion is remembered and reconciled on the last chunk.
    pub fn request_completion(&mut self, id: &str) -> Result<bool, ReassemblyError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| ReassemblyError::UnknownSnapshot(id.to_string()))?;
        if entry.state == SnapshotState::Complete {
            return Ok(false);
        }
        entry.completion_requested = true;
        let populated = !entry.chunks.is_empty() && entry.chunks.iter().all(Option::is_some);
        if !populated {
            info!(
                event = "snapshot_completion_pending",
                snapshot_id = id,
                received = entry.received
            );
        }
        Ok(populated)
    }

    /// Concatenate the chunk payloads in index order. The entry is left
    /// untouched until [`mark_persisted`] confirms the disk write.
    ///
    /// [`mark_persisted`]: SnapshotTable::mark_persisted
    pub fn finalize_payload(&self, id: &str) -> Result<PersistJob, ReassemblyError> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| ReassemblyError::UnknownSnapshot(id.to_string()))?;
        if entry.chunks.is_empty() || !entry.chunks.iter().all(Option::is_some) {
            return Err(ReassemblyError::NotReady(id.to_string()));
        }
        let payload: String = entry
            .chunks
            .iter()
            .map(|chunk| chunk.as_deref().unwrap_or_default())
            .collect();
        Ok(PersistJob {
            id: id.to_string(),
            path: self.dir.join(&entry.rel_path),
            filename: entry.meta.filename.clone(),
            payload,
        })
    }

    /// The disk write succeeded: release the chunk table and mark complete.
    pub fn mark_persisted(&mut self, id: &str, size: u64) -> Result<Event, ReassemblyError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| ReassemblyError::UnknownSnapshot(id.to_string()))?;
        entry.state = SnapshotState::Complete;
        entry.stored_size = Some(size);
        entry.chunks = Vec::new();
        info!(event = "snapshot_persisted", snapshot_id = id, size);
        Ok(Event::SnapshotCompleted {
            snapshot_id: id.to_string(),
            filename: entry.meta.filename.clone(),
            size,
        })
    }

    /// Single-shot upload: announce, populate and request completion in one
    /// step. The caller persists the returned job, then calls
    /// [`mark_persisted`](SnapshotTable::mark_persisted).
    pub fn stage_upload(
        &mut self,
        meta: SnapshotMeta,
        rel_path: PathBuf,
        data: String,
    ) -> (Event, PersistJob) {
        let mut meta = meta;
        meta.total_chunks = Some(1);
        meta.size = data.len() as u64;
        if self.entries.contains_key(&meta.id) {
            warn!(event = "snapshot_reannounced", snapshot_id = %meta.id);
        }
        info!(
            event = "snapshot_uploaded",
            snapshot_id = %meta.id,
            service = %meta.service_name,
            phase = %meta.phase,
            size = meta.size
        );
        let started = Event::SnapshotStarted {
            snapshot: meta.clone(),
        };
        let job = PersistJob {
            id: meta.id.clone(),
            path: self.dir.join(&rel_path),
            filename: meta.filename.clone(),
            payload: data.clone(),
        };
        self.entries.insert(
            meta.id.clone(),
            SnapshotEntry {
                meta,
                rel_path,
                chunks: vec![Some(data)],
                received: 1,
                completion_requested: true,
                state: SnapshotState::Receiving,
                stored_size: None,
            },
        );
        (started, job)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_complete(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .map(|entry| entry.state == SnapshotState::Complete)
            .unwrap_or(false)
    }

    /// On-disk location of a completed snapshot blob.
    pub fn blob_path(&self, id: &str) -> Option<PathBuf> {
        self.entries
            .get(id)
            .filter(|entry| entry.state == SnapshotState::Complete)
            .map(|entry| self.dir.join(&entry.rel_path))
    }

    pub fn list(&self) -> Vec<SnapshotInfo> {
        let mut out: Vec<SnapshotInfo> = self
            .entries
            .values()
            .map(|entry| SnapshotInfo {
                id: entry.meta.id.clone(),
                service_name: entry.meta.service_name.clone(),
                container_id: entry.meta.container_id.clone(),
                phase: entry.meta.phase,
                timestamp: entry.meta.timestamp,
                size: entry.stored_size.unwrap_or(entry.meta.size),
                filename: entry.meta.filename.clone(),
                received_chunks: entry.received,
                total_chunks: entry.meta.total_chunks.unwrap_or(0),
                status: entry.state,
            })
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id)));
        out
    }

    pub fn snapshot_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memfab_core::model::SnapshotPhase;

    fn meta(id: &str, total: Option<u32>) -> SnapshotMeta {
        SnapshotMeta {
            id: id.to_string(),
            service_name: "svc-a".to_string(),
            container_id: "c1".to_string(),
            phase: SnapshotPhase::Before,
            timestamp: 1,
            size: 9,
            filename: "b.heapsnapshot".to_string(),
            total_chunks: total,
        }
    }

    fn table() -> SnapshotTable {
        SnapshotTable::new(PathBuf::from("/tmp/snapshots"), 1024 * 1024)
    }

    #[test]
    fn chunks_in_any_permutation_concatenate_in_index_order() {
        let mut table = table();
        table.announce(meta("before_svc-a_1", Some(3)));
        for (index, data) in [(0u32, "abc"), (2, "ghi"), (1, "def")] {
            let progress = table
                .receive_chunk("before_svc-a_1", index, 3, data.to_string())
                .expect("chunk");
            assert!(!progress.ready);
        }
        assert!(table.request_completion("before_svc-a_1").expect("complete"));
        let job = table.finalize_payload("before_svc-a_1").expect("finalize");
        assert_eq!(job.payload, "abcdefghi");
        assert!(job.path.ends_with("b.heapsnapshot"));
    }

    #[test]
    fn early_completion_is_reconciled_on_last_chunk() {
        let mut table = table();
        table.announce(meta("before_svc-a_1", Some(2)));
        table
            .receive_chunk("before_svc-a_1", 0, 2, "aa".to_string())
            .expect("chunk 0");
        // Completion arrives before chunk 1: snapshot stays receiving.
        assert!(!table.request_completion("before_svc-a_1").expect("request"));
        assert!(table.finalize_payload("before_svc-a_1").is_err());

        let progress = table
            .receive_chunk("before_svc-a_1", 1, 2, "bb".to_string())
            .expect("chunk 1");
        assert!(progress.ready);
        let job = table.finalize_payload("before_svc-a_1").expect("finalize");
        assert_eq!(job.payload, "aabb");
    }

    #[test]
    fn duplicate_chunk_is_last_writer_wins_without_recount() {
        let mut table = table();
        table.announce(meta("s", Some(2)));
        let first = table
            .receive_chunk("s", 0, 2, "old".to_string())
            .expect("chunk");
        assert_eq!(first.received, 1);
        let dup = table
            .receive_chunk("s", 0, 2, "new".to_string())
            .expect("duplicate");
        assert_eq!(dup.received, 1);
        table.receive_chunk("s", 1, 2, "!".to_string()).expect("chunk");
        table.request_completion("s").expect("complete");
        assert_eq!(table.finalize_payload("s").expect("finalize").payload, "new!");
    }

    #[test]
    fn chunk_table_allocates_from_first_chunk_when_unannounced_total() {
        let mut table = table();
        table.announce(meta("s", None));
        let progress = table
            .receive_chunk("s", 1, 2, "b".to_string())
            .expect("chunk");
        assert_eq!(progress.total, 2);
        assert_eq!(progress.received, 1);
    }

    #[test]
    fn unknown_snapshot_chunk_and_completion_are_errors() {
        let mut table = table();
        assert!(matches!(
            table.receive_chunk("ghost", 0, 1, "x".to_string()),
            Err(ReassemblyError::UnknownSnapshot(_))
        ));
        assert!(matches!(
            table.request_completion("ghost"),
            Err(ReassemblyError::UnknownSnapshot(_))
        ));
    }

    #[test]
    fn chunk_index_and_count_are_validated() {
        let mut table = table();
        table.announce(meta("s", Some(2)));
        assert!(matches!(
            table.receive_chunk("s", 5, 2, "x".to_string()),
            Err(ReassemblyError::ChunkIndexOutOfRange { .. })
        ));
        assert!(matches!(
            table.receive_chunk("s", 0, 3, "x".to_string()),
            Err(ReassemblyError::ChunkCountMismatch { .. })
        ));
        assert!(table.received_chunks_at_most_total());
    }

    #[test]
    fn reannounce_replaces_chunk_table() {
        let mut table = table();
        table.announce(meta("s", Some(2)));
        table.receive_chunk("s", 0, 2, "aa".to_string()).expect("chunk");
        table.announce(meta("s", Some(3)));
        let progress = table
            .receive_chunk("s", 0, 3, "zz".to_string())
            .expect("chunk");
        assert_eq!(progress.received, 1);
        assert_eq!(progress.total, 3);
    }

    #[test]
    fn late_chunk_for_completed_snapshot_is_rejected() {
        let mut table = table();
        table.announce(meta("s", Some(1)));
        table
            .receive_chunk("s", 0, 1, "payload".to_string())
            .expect("chunk");
        table.request_completion("s").expect("complete");
        table.mark_persisted("s", 7).expect("persist");

        assert!(matches!(
            table.receive_chunk("s", 0, 1, "payload".to_string()),
            Err(ReassemblyError::AlreadyComplete(_))
        ));
        // A replayed completion message is a quiet no-op.
        assert!(!table.request_completion("s").expect("replay"));
        assert!(table.is_complete("s"));
        assert!(table.blob_path("s").is_some());
    }

    #[test]
    fn mark_persisted_releases_chunks_and_reports_completion() {
        let mut table = table();
        table.announce(meta("s", Some(1)));
        table
            .receive_chunk("s", 0, 1, "payload".to_string())
            .expect("chunk");
        table.request_completion("s").expect("complete");
        let event = table.mark_persisted("s", 7).expect("persist");
        assert!(matches!(event, Event::SnapshotCompleted { size: 7, .. }));
        assert!(table.is_complete("s"));
        assert!(table.blob_path("s").is_some());
        assert_eq!(table.list()[0].size, 7);
    }

    #[test]
    fn stage_upload_is_announce_chunk_complete_in_one_step() {
        let mut table = table();
        let (started, job) = table.stage_upload(
            meta("before_svc-a_9", None),
            PathBuf::from("svc-a/b.heapsnapshot"),
            "whole blob".to_string(),
        );
        assert!(matches!(started, Event::SnapshotStarted { .. }));
        assert_eq!(job.payload, "whole blob");
        assert!(job.path.ends_with("svc-a/b.heapsnapshot"));
        let event = table
            .mark_persisted("before_svc-a_9", job.payload.len() as u64)
            .expect("persist");
        assert!(matches!(event, Event::SnapshotCompleted { size: 10, .. }));
    }

    impl SnapshotTable {
        fn received_chunks_at_most_total(&self) -> bool {
            self.entries.values().all(|entry| {
                entry
                    .meta
                    .total_chunks
                    .map(|total| entry.received <= total)
                    .unwrap_or(true)
            })
        }
    }
}
