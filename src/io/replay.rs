//! Scripted sensor source replaying a JSONL sighting file
//!
//! One JSON object per line, `at_ms` relative to the first start:
//!
//! ```text
//! {"at_ms": 0,    "type": "region_enter", "beacon": "F7826DA6-...-1-1"}
//! {"at_ms": 500,  "type": "ranged",       "beacon": "F7826DA6-...-1-1", "rssi": -52}
//! {"at_ms": 9000, "type": "region_exit",  "beacon": "F7826DA6-...-1-1"}
//! {"at_ms": 9500, "type": "fail",         "kind": "HardwareUnavailable", "detail": "bluetooth off"}
//! ```
//!
//! A region replay takes region and fail entries; a ranging replay takes
//! ranged entries. Stopping pauses at the current entry and a later start
//! continues from there.

use crate::domain::types::{BeaconIdentity, ErrorKind, ObservationSource, Proximity};
use crate::io::sources::{SensorSource, SourceHandle};
use anyhow::Context;
use parking_lot::Mutex;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One scripted line
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptEntry {
    RegionEnter {
        at_ms: u64,
        beacon: BeaconIdentity,
    },
    RegionExit {
        at_ms: u64,
        beacon: BeaconIdentity,
    },
    Ranged {
        at_ms: u64,
        beacon: BeaconIdentity,
        rssi: i16,
        #[serde(default)]
        proximity: Option<Proximity>,
    },
    Fail {
        at_ms: u64,
        kind: ErrorKind,
        #[serde(default)]
        detail: String,
    },
}

impl ScriptEntry {
    pub fn at_ms(&self) -> u64 {
        match self {
            ScriptEntry::RegionEnter { at_ms, .. }
            | ScriptEntry::RegionExit { at_ms, .. }
            | ScriptEntry::Ranged { at_ms, .. }
            | ScriptEntry::Fail { at_ms, .. } => *at_ms,
        }
    }

    fn belongs_to(&self, kind: ObservationSource) -> bool {
        match self {
            ScriptEntry::Ranged { .. } => kind == ObservationSource::Ranging,
            _ => kind == ObservationSource::Region,
        }
    }

    fn apply(&self, handle: &SourceHandle) {
        match self {
            ScriptEntry::RegionEnter { beacon, .. } => handle.region_enter(beacon.clone()),
            ScriptEntry::RegionExit { beacon, .. } => handle.region_exit(beacon.clone()),
            ScriptEntry::Ranged { beacon, rssi, proximity, .. } => {
                handle.ranged(beacon.clone(), *rssi, proximity.unwrap_or(Proximity::Unknown))
            }
            ScriptEntry::Fail { kind, detail, .. } => handle.failed(*kind, detail.clone()),
        }
    }
}

/// Parse a JSONL script. Blank lines and `#` comments are skipped.
pub fn parse_script(text: &str) -> anyhow::Result<Vec<ScriptEntry>> {
    let mut entries = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry: ScriptEntry = serde_json::from_str(line)
            .with_context(|| format!("invalid script entry on line {}", index + 1))?;
        entries.push(entry);
    }
    entries.sort_by_key(ScriptEntry::at_ms);
    Ok(entries)
}

pub struct ReplaySource {
    name: &'static str,
    entries: Arc<Vec<ScriptEntry>>,
    cursor: Arc<AtomicUsize>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplaySource {
    /// Keep only the entries this kind of source would deliver
    pub fn new(kind: ObservationSource, entries: &[ScriptEntry]) -> Self {
        let name = match kind {
            ObservationSource::Region => "replay_region",
            ObservationSource::Ranging => "replay_ranging",
        };
        let entries: Vec<ScriptEntry> = entries.iter().filter(|e| e.belongs_to(kind)).cloned().collect();
        Self {
            name,
            entries: Arc::new(entries),
            cursor: Arc::new(AtomicUsize::new(0)),
            task: Mutex::new(None),
        }
    }

    pub fn from_file<P: AsRef<Path>>(kind: ObservationSource, path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read replay script {}", path.display()))?;
        Ok(Self::new(kind, &parse_script(&text)?))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries already delivered
    pub fn position(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}

impl SensorSource for ReplaySource {
    fn name(&self) -> &'static str {
        self.name
    }

    fn start(&self, handle: SourceHandle) {
        let entries = self.entries.clone();
        let cursor = self.cursor.clone();
        let name = self.name;

        let task = tokio::spawn(async move {
            handle.ready();
            let start = cursor.load(Ordering::Relaxed);
            let mut clock_ms = start.checked_sub(1).and_then(|i| entries.get(i)).map_or(0, |e| e.at_ms());
            info!(source = %name, from = %start, total = %entries.len(), "replay_started");

            for (index, entry) in entries.iter().enumerate().skip(start) {
                let wait = entry.at_ms().saturating_sub(clock_ms);
                if wait > 0 {
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                }
                clock_ms = entry.at_ms();
                debug!(source = %name, entry = ?entry, "replay_entry");
                entry.apply(&handle);
                cursor.store(index + 1, Ordering::Relaxed);
            }
            info!(source = %name, "replay_finished");
        });

        if let Some(previous) = self.task.lock().replace(task) {
            warn!(source = %self.name, "replay_restarted_while_running");
            previous.abort();
        }
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!(source = %self.name, position = %self.position(), "replay_stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::metrics::Metrics;
    use crate::services::dispatcher::{Control, Sighting, SightingInbox};
    use tokio::sync::mpsc;

    const SCRIPT: &str = r#"
# two beacons
{"at_ms": 0, "type": "region_enter", "beacon": "U-1-1"}
{"at_ms": 5, "type": "ranged", "beacon": "U-1-1", "rssi": -50}
{"at_ms": 10, "type": "region_exit", "beacon": "U-1-1"}
{"at_ms": 20, "type": "fail", "kind": "PermissionDenied", "detail": "revoked"}
"#;

    #[test]
    fn test_parse_script() {
        let entries = parse_script(SCRIPT).unwrap();
        assert_eq!(entries.len(), 4);
        assert!(matches!(&entries[1], ScriptEntry::Ranged { rssi: -50, proximity: None, .. }));
        assert!(matches!(&entries[3], ScriptEntry::Fail { kind: ErrorKind::PermissionDenied, .. }));
    }

    #[test]
    fn test_parse_script_reports_line() {
        let err = parse_script("{\"at_ms\": 0, \"type\": \"region_enter\", \"beacon\": \"U-1-1\"}\nnope")
            .unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_sources_split_entries_by_kind() {
        let entries = parse_script(SCRIPT).unwrap();
        assert_eq!(ReplaySource::new(ObservationSource::Region, &entries).len(), 3);
        assert_eq!(ReplaySource::new(ObservationSource::Ranging, &entries).len(), 1);
    }

    #[tokio::test]
    async fn test_region_replay_delivers_in_order() {
        let entries = parse_script(SCRIPT).unwrap();
        let source = ReplaySource::new(ObservationSource::Region, &entries);
        let inbox = Arc::new(SightingInbox::new(16, Arc::new(Metrics::new())));
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        source.start(SourceHandle::new(source.name(), inbox.clone(), control_tx));

        assert!(matches!(control_rx.recv().await, Some(Control::SourceReady { source: "replay_region" })));
        assert!(matches!(
            control_rx.recv().await,
            Some(Control::SourceFailed { kind: ErrorKind::PermissionDenied, .. })
        ));
        assert!(matches!(inbox.pop(), Some(Sighting::RegionEnter { .. })));
        assert!(matches!(inbox.pop(), Some(Sighting::RegionExit { .. })));
        assert_eq!(source.position(), 3);
        source.stop();
    }
}
