//! Filesystem store
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<campaign_id>/checkpoint.json
//! <root>/<campaign_id>/events.jsonl
//! <root>/<campaign_id>/report.json
//! ```
//!
//! JSON documents are written to a temporary file and renamed into place, so
//! a crash leaves either the old or the new checkpoint, never half of one.
//! The event log is append-only; a line torn by a crash mid-append is
//! dropped on read and cut off before the next append. Its events were never
//! acknowledged, so the bus delivers them again.

use super::{chain_onto, CampaignStore};
use crate::context::{CampaignContext, CampaignReport};
use crate::error::StoreError;
use crate::events::{verify_chain, ChainedEvent, LogEvent};
use crate::types::CampaignId;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

const CHECKPOINT: &str = "checkpoint.json";
const EVENTS: &str = "events.jsonl";
const REPORT: &str = "report.json";

/// Parsed event log
#[derive(Debug)]
struct LogRead {
    entries: Vec<ChainedEvent>,
    /// Bytes after the last complete line
    torn: bool,
}

/// Store writing JSON documents under a root directory
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    /// Last chained entry per campaign; serializes appends
    tails: Mutex<HashMap<CampaignId, Option<ChainedEvent>>>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            tails: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn campaign_dir(&self, id: &CampaignId) -> PathBuf {
        self.root.join(id.to_string())
    }

    async fn write_json<T: Serialize + Sync>(&self, id: &CampaignId, file: &str, value: &T) -> Result<(), StoreError> {
        let dir = self.campaign_dir(id);
        tokio::fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = dir.join(format!("{file}.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, dir.join(file)).await?;
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, id: &CampaignId, file: &str) -> Result<Option<T>, StoreError> {
        match tokio::fs::read(self.campaign_dir(id).join(file)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_log(&self, id: &CampaignId) -> Result<LogRead, StoreError> {
        let bytes = match tokio::fs::read(self.campaign_dir(id).join(EVENTS)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(LogRead {
                    entries: Vec::new(),
                    torn: false,
                })
            }
            Err(e) => return Err(e.into()),
        };
        // Only newline-terminated lines are complete
        let complete = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        let torn = complete < bytes.len();
        let entries = bytes[..complete]
            .split(|b| *b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .map(serde_json::from_slice)
            .collect::<Result<Vec<ChainedEvent>, _>>()?;
        verify_chain(&entries)?;
        if torn {
            warn!(campaign_id = %id, dropped_bytes = bytes.len() - complete, "Dropping torn event log tail");
        }
        Ok(LogRead { entries, torn })
    }

    /// Rewrite the log with only its complete entries
    async fn repair_log(&self, id: &CampaignId, entries: &[ChainedEvent]) -> Result<(), StoreError> {
        let dir = self.campaign_dir(id);
        let tmp = dir.join(format!("{EVENTS}.tmp"));
        tokio::fs::write(&tmp, encode_lines(entries)?).await?;
        tokio::fs::rename(&tmp, dir.join(EVENTS)).await?;
        Ok(())
    }

    async fn write_lines(&self, id: &CampaignId, lines: &[u8]) -> Result<(), StoreError> {
        let dir = self.campaign_dir(id);
        tokio::fs::create_dir_all(&dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS))
            .await?;
        file.write_all(lines).await?;
        file.sync_data().await?;
        Ok(())
    }
}

fn encode_lines(entries: &[ChainedEvent]) -> Result<Vec<u8>, StoreError> {
    let mut lines = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut lines, entry)?;
        lines.push(b'\n');
    }
    Ok(lines)
}

#[async_trait]
impl CampaignStore for FileStore {
    async fn save_checkpoint(&self, context: &CampaignContext) -> Result<(), StoreError> {
        self.write_json(&context.campaign.id, CHECKPOINT, context).await
    }

    async fn load_checkpoint(&self, id: &CampaignId) -> Result<Option<CampaignContext>, StoreError> {
        self.read_json(id, CHECKPOINT).await
    }

    async fn append_events(&self, id: &CampaignId, events: &[LogEvent]) -> Result<u64, StoreError> {
        let mut tails = self.tails.lock().await;
        let tail = match tails.get(id) {
            Some(tail) => tail.clone(),
            None => {
                let mut log = self.read_log(id).await?;
                if log.torn {
                    self.repair_log(id, &log.entries).await?;
                }
                log.entries.pop()
            }
        };
        let linked = chain_onto(tail.as_ref(), events)?;

        if let Err(e) = self.write_lines(id, &encode_lines(&linked)?).await {
            // The file may now end mid-line; re-read before the next append
            tails.remove(id);
            return Err(e);
        }

        let new_tail = linked.last().cloned().or(tail);
        let len = new_tail.as_ref().map_or(0, |t| t.index + 1);
        tails.insert(*id, new_tail);
        Ok(len)
    }

    async fn load_events(&self, id: &CampaignId) -> Result<Vec<ChainedEvent>, StoreError> {
        Ok(self.read_log(id).await?.entries)
    }

    async fn save_report(&self, report: &CampaignReport) -> Result<(), StoreError> {
        self.write_json(&report.campaign.id, REPORT, report).await
    }

    async fn load_report(&self, id: &CampaignId) -> Result<Option<CampaignReport>, StoreError> {
        self.read_json(id, REPORT).await
    }

    async fn list_campaigns(&self) -> Result<Vec<CampaignId>, StoreError> {
        let mut ids = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Ok(id) = name.parse::<CampaignId>() {
                if tokio::fs::try_exists(entry.path().join(CHECKPOINT)).await? {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, Severity};
    use pretty_assertions::assert_eq;

    fn event(id: CampaignId, seq: u64) -> LogEvent {
        LogEvent::new(EventKind::Operation, id.to_string(), "w1", Severity::Info, "op").with_sequence(seq)
    }

    async fn tear_log(store: &FileStore, id: &CampaignId) {
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(store.campaign_dir(id).join(EVENTS))
            .await
            .unwrap();
        file.write_all(br#"{"index":1,"prev_hash":"ab"#).await.unwrap();
    }

    #[tokio::test]
    async fn torn_tail_is_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let id = CampaignId::new();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.append_events(&id, &[event(id, 1)]).await.unwrap();
        tear_log(&store, &id).await;

        let reopened = FileStore::open(dir.path()).await.unwrap();
        let log = reopened.load_events(&id).await.unwrap();

        assert_eq!(log.len(), 1);
        assert_eq!(log[0].event.sequence, 1);
    }

    #[tokio::test]
    async fn append_after_a_torn_tail_continues_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let id = CampaignId::new();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.append_events(&id, &[event(id, 1)]).await.unwrap();
        tear_log(&store, &id).await;

        let reopened = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.append_events(&id, &[event(id, 2), event(id, 3)]).await.unwrap(), 3);

        let log = FileStore::open(dir.path()).await.unwrap().load_events(&id).await.unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[1].prev_hash, log[0].hash);
        let text = tokio::fs::read_to_string(store.campaign_dir(&id).join(EVENTS)).await.unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.ends_with('\n'));
    }
}
