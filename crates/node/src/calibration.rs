//! Dry/wet calibration record: persistence and first-run acquisition.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized ──load ok──────────────────────────────────────▶ Calibrated
//!      │
//!      └──load failed──▶ AwaitingDry ──digits──▶ AwaitingWet ──digits──▶ Calibrated
//! ```
//!
//! Acquisition takes its input from the operator chat. Once a record has been
//! persisted the node never recalibrates on its own; only a missing or
//! malformed file on a later boot restarts the cycle.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::dispatch::parse_calibration_input;
use crate::ports::{CalibrationStorage, ChatLink, Clock};

/// Delay between chat polls while waiting for a reference value.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CalibrationPoint {
    pub raw: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CalibrationRecord {
    pub dry: CalibrationPoint,
    pub wet: CalibrationPoint,
}

/// On-disk shape. Both keys are required and must be integers.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    seco_raw: i64,
    humedo_raw: i64,
}

impl From<StoredRecord> for CalibrationRecord {
    fn from(s: StoredRecord) -> Self {
        Self {
            dry: CalibrationPoint { raw: s.seco_raw },
            wet: CalibrationPoint { raw: s.humedo_raw },
        }
    }
}

impl From<&CalibrationRecord> for StoredRecord {
    fn from(r: &CalibrationRecord) -> Self {
        Self {
            seco_raw: r.dry.raw,
            humedo_raw: r.wet.raw,
        }
    }
}

// ---------------------------------------------------------------------------
// JSON file storage
// ---------------------------------------------------------------------------

/// Calibration record kept as a small JSON object on local disk.
#[derive(Debug, Clone)]
pub(crate) struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl CalibrationStorage for JsonFileStorage {
    fn load(&self) -> Result<CalibrationRecord> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read calibration: {}", self.path.display()))?;
        let stored: StoredRecord = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse calibration: {}", self.path.display()))?;
        Ok(stored.into())
    }

    /// Write to a sibling temp file and rename it over the target, so a
    /// power cut never leaves a half-written record behind.
    fn save(&self, record: &CalibrationRecord) -> Result<()> {
        let json = serde_json::to_vec(&StoredRecord::from(record))?;
        let tmp = self.path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CalibrationPhase {
    Uninitialized,
    AwaitingDry,
    AwaitingWet { dry: CalibrationPoint },
    Calibrated(CalibrationRecord),
}

/// What a piece of operator input did to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputOutcome {
    /// Not digits, or not expected in the current phase.
    Ignored,
    /// Wet value equal to the dry value; a zero span is never stored.
    ZeroSpan(i64),
    DryStored(i64),
    WetStored(i64),
}

pub(crate) struct CalibrationStore<P> {
    storage: P,
    phase: CalibrationPhase,
}

impl<P: CalibrationStorage> CalibrationStore<P> {
    pub(crate) fn new(storage: P) -> Self {
        Self {
            storage,
            phase: CalibrationPhase::Uninitialized,
        }
    }

    pub(crate) fn record(&self) -> Option<CalibrationRecord> {
        match self.phase {
            CalibrationPhase::Calibrated(r) => Some(r),
            _ => None,
        }
    }

    /// Read the persisted record. Any failure routes to `AwaitingDry`
    /// instead of failing the boot.
    pub(crate) fn load(&mut self) -> CalibrationPhase {
        self.phase = match self.storage.load() {
            Ok(record) => {
                info!(
                    dry = record.dry.raw,
                    wet = record.wet.raw,
                    "calibration loaded"
                );
                CalibrationPhase::Calibrated(record)
            }
            Err(e) => {
                warn!("no usable calibration ({e:#}); interactive calibration required");
                CalibrationPhase::AwaitingDry
            }
        };
        self.phase
    }

    /// Feed one operator message into the state machine.
    pub(crate) fn accept_input(&mut self, text: &str) -> InputOutcome {
        let Some(value) = parse_calibration_input(text) else {
            return InputOutcome::Ignored;
        };

        match self.phase {
            CalibrationPhase::AwaitingDry => {
                self.phase = CalibrationPhase::AwaitingWet {
                    dry: CalibrationPoint { raw: value },
                };
                info!(dry = value, "dry reference stored");
                InputOutcome::DryStored(value)
            }
            CalibrationPhase::AwaitingWet { dry } if dry.raw == value => {
                InputOutcome::ZeroSpan(value)
            }
            CalibrationPhase::AwaitingWet { dry } => {
                self.phase = CalibrationPhase::Calibrated(CalibrationRecord {
                    dry,
                    wet: CalibrationPoint { raw: value },
                });
                info!(wet = value, "wet reference stored");
                InputOutcome::WetStored(value)
            }
            CalibrationPhase::Uninitialized | CalibrationPhase::Calibrated(_) => {
                InputOutcome::Ignored
            }
        }
    }

    /// Load the record, or run interactive acquisition to completion.
    pub(crate) async fn ensure_calibrated<L, C>(
        &mut self,
        chat: &mut L,
        clock: &C,
        node_id: &str,
    ) -> CalibrationRecord
    where
        L: ChatLink,
        C: Clock,
    {
        if self.phase == CalibrationPhase::Uninitialized {
            self.load();
        }
        if let Some(record) = self.record() {
            return record;
        }
        self.acquire(chat, clock, node_id).await
    }

    /// Poll the chat until both reference points are stored, then persist.
    ///
    /// Polling is unbounded: the node has nothing useful to do without a
    /// calibration.
    pub(crate) async fn acquire<L, C>(
        &mut self,
        chat: &mut L,
        clock: &C,
        node_id: &str,
    ) -> CalibrationRecord
    where
        L: ChatLink,
        C: Clock,
    {
        if !matches!(self.phase, CalibrationPhase::AwaitingWet { .. }) {
            self.phase = CalibrationPhase::AwaitingDry;
        }

        if self.phase == CalibrationPhase::AwaitingDry {
            notify(
                chat,
                &format!(
                    "Node {node_id} needs calibration.\n\nEnter the sensor value in \
                     COMPLETELY DRY soil and reply with the number only."
                ),
            )
            .await;
        }

        let record = loop {
            if let CalibrationPhase::Calibrated(record) = self.phase {
                break record;
            }

            match chat.poll().await {
                Ok(Some(text)) => match self.accept_input(&text) {
                    InputOutcome::DryStored(v) => {
                        notify(chat, &format!("OK. Dry value stored: {v}")).await;
                        notify(
                            chat,
                            "Now enter the sensor value in COMPLETELY WET (saturated) soil.",
                        )
                        .await;
                    }
                    InputOutcome::WetStored(v) => {
                        notify(chat, &format!("OK. Wet value stored: {v}")).await;
                    }
                    InputOutcome::ZeroSpan(v) => {
                        notify(
                            chat,
                            &format!("Wet value {v} equals the dry value; send a different reading."),
                        )
                        .await;
                    }
                    InputOutcome::Ignored => {
                        info!(text = %text, "ignoring non-numeric calibration input");
                    }
                },
                Ok(None) => {}
                Err(e) => warn!("chat poll failed during calibration: {e:#}"),
            }

            if matches!(self.phase, CalibrationPhase::Calibrated(_)) {
                continue;
            }
            clock.sleep(POLL_INTERVAL).await;
        };

        if let Err(e) = self.storage.save(&record) {
            // Keep running on the in-memory record; the next boot will ask again.
            error!("failed to persist calibration: {e:#}");
        }
        notify(chat, &format!("Node {node_id} calibrated and ready. Starting up.")).await;
        info!(dry = record.dry.raw, wet = record.wet.raw, "calibration complete");
        record
    }
}

async fn notify<L: ChatLink>(chat: &mut L, text: &str) {
    if let Err(e) = chat.send(text).await {
        warn!("chat send failed: {e:#}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeChat, FakeClock, MemoryStorage};

    fn record(dry: i64, wet: i64) -> CalibrationRecord {
        CalibrationRecord {
            dry: CalibrationPoint { raw: dry },
            wet: CalibrationPoint { raw: wet },
        }
    }

    // -- JsonFileStorage ------------------------------------------------------

    #[test]
    fn file_round_trip_loads_calibrated() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(dir.path().join("config.json"));
        storage.save(&record(100, 500)).unwrap();

        let mut store = CalibrationStore::new(storage);
        assert_eq!(store.load(), CalibrationPhase::Calibrated(record(100, 500)));
    }

    #[test]
    fn file_uses_legacy_key_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        JsonFileStorage::new(&path).save(&record(800, 300)).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["seco_raw"], 800);
        assert_eq!(json["humedo_raw"], 300);
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(dir.path().join("config.json"));
        storage.save(&record(1, 2)).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn missing_file_routes_to_awaiting_dry() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CalibrationStore::new(JsonFileStorage::new(dir.path().join("nope.json")));
        assert_eq!(store.load(), CalibrationPhase::AwaitingDry);
    }

    #[test]
    fn missing_key_routes_to_awaiting_dry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"seco_raw": 800}"#).unwrap();

        let mut store = CalibrationStore::new(JsonFileStorage::new(&path));
        assert_eq!(store.load(), CalibrationPhase::AwaitingDry);
    }

    #[test]
    fn mistyped_value_routes_to_awaiting_dry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"seco_raw": "800", "humedo_raw": 300}"#).unwrap();

        let mut store = CalibrationStore::new(JsonFileStorage::new(&path));
        assert_eq!(store.load(), CalibrationPhase::AwaitingDry);
    }

    #[test]
    fn garbage_file_routes_to_awaiting_dry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();

        let mut store = CalibrationStore::new(JsonFileStorage::new(&path));
        assert_eq!(store.load(), CalibrationPhase::AwaitingDry);
    }

    // -- accept_input ---------------------------------------------------------

    #[test]
    fn input_sequence_reaches_calibrated() {
        let mut store = CalibrationStore::new(MemoryStorage::default());
        store.load();

        assert_eq!(store.accept_input("hello"), InputOutcome::Ignored);
        assert_eq!(store.accept_input("800"), InputOutcome::DryStored(800));
        assert_eq!(store.accept_input("-3"), InputOutcome::Ignored);
        assert_eq!(store.accept_input("800"), InputOutcome::ZeroSpan(800));
        assert_eq!(store.accept_input("300"), InputOutcome::WetStored(300));
        assert_eq!(store.record(), Some(record(800, 300)));
    }

    #[test]
    fn input_ignored_once_calibrated() {
        let mut store = CalibrationStore::new(MemoryStorage::with(record(800, 300)));
        store.load();
        assert_eq!(store.accept_input("42"), InputOutcome::Ignored);
        assert_eq!(store.record(), Some(record(800, 300)));
    }

    // -- ensure_calibrated ----------------------------------------------------

    #[tokio::test]
    async fn persisted_record_skips_acquisition() {
        let storage = MemoryStorage::with(record(100, 500));
        let mut store = CalibrationStore::new(storage.clone());
        let mut chat = FakeChat::default();
        let clock = FakeClock::default();

        let rec = store.ensure_calibrated(&mut chat, &clock, "1").await;

        assert_eq!(rec, record(100, 500));
        assert!(chat.sent.is_empty());
        assert!(clock.slept().is_empty());
        assert_eq!(storage.saves(), 0);
    }

    #[tokio::test]
    async fn interactive_acquisition_persists_and_confirms() {
        let storage = MemoryStorage::default();
        let mut store = CalibrationStore::new(storage.clone());
        let mut chat = FakeChat::with_inbox([
            None,
            Some("abc"),
            Some("812"),
            None,
            Some("312"),
        ]);
        let clock = FakeClock::default();

        let rec = store.ensure_calibrated(&mut chat, &clock, "7").await;

        assert_eq!(rec, record(812, 312));
        assert_eq!(storage.saved(), Some(record(812, 312)));
        assert!(chat.sent[0].contains("Node 7 needs calibration"));
        assert!(chat.sent.iter().any(|m| m == "OK. Dry value stored: 812"));
        assert!(chat.sent.iter().any(|m| m == "OK. Wet value stored: 312"));
        assert!(chat.sent.last().unwrap().contains("calibrated and ready"));
        // One sleep after every poll that did not finish calibration.
        assert_eq!(clock.slept().len(), 4);
        assert!(clock.slept().iter().all(|d| *d == POLL_INTERVAL));
    }

    #[tokio::test]
    async fn poll_errors_do_not_abort_acquisition() {
        let storage = MemoryStorage::default();
        let mut store = CalibrationStore::new(storage.clone());
        let mut chat = FakeChat::with_inbox([Some("900"), Some("400")]);
        chat.fail_polls = 2;
        let clock = FakeClock::default();

        let rec = store.ensure_calibrated(&mut chat, &clock, "1").await;
        assert_eq!(rec, record(900, 400));
    }

    #[tokio::test]
    async fn save_failure_still_returns_record() {
        let storage = MemoryStorage::default();
        storage.fail_saves();
        let mut store = CalibrationStore::new(storage.clone());
        let mut chat = FakeChat::with_inbox([Some("900"), Some("400")]);
        let clock = FakeClock::default();

        let rec = store.ensure_calibrated(&mut chat, &clock, "1").await;
        assert_eq!(rec, record(900, 400));
        assert_eq!(storage.saved(), None);
    }
}
