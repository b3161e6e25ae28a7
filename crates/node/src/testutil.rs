//! In-crate fakes for the collaborator traits. Test builds only.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::calibration::CalibrationRecord;
use crate::mapper::VoltScale;
use crate::ports::{ArtifactSource, CalibrationStorage, ChatLink, Clock, Pump, Sensor};
use crate::telemetry::{TelemetryPayload, TelemetrySink};
use crate::update::FetchError;

// -- Sensor -------------------------------------------------------------------

/// Hands out a fixed list of codes, then fails.
pub(crate) struct ScriptedSensor {
    values: VecDeque<i32>,
    pub reads: usize,
}

impl ScriptedSensor {
    pub(crate) fn new(values: Vec<i32>) -> Self {
        Self {
            values: values.into(),
            reads: 0,
        }
    }
}

impl Sensor for ScriptedSensor {
    fn read_raw(&mut self) -> Result<i32> {
        let value = self
            .values
            .pop_front()
            .ok_or_else(|| anyhow!("scripted sensor exhausted"))?;
        self.reads += 1;
        Ok(value)
    }

    fn scale(&self) -> VoltScale {
        VoltScale::ADS1115_4V096
    }
}

// -- Clock --------------------------------------------------------------------

/// Records requested sleeps and returns immediately.
#[derive(Default)]
pub(crate) struct FakeClock {
    slept: RefCell<Vec<Duration>>,
}

impl FakeClock {
    pub(crate) fn slept(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }
}

impl Clock for FakeClock {
    async fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}

// -- Chat ---------------------------------------------------------------------

/// Scripted inbox; every poll pops one entry. `None` entries model an empty
/// poll, and an exhausted inbox keeps answering `None`.
#[derive(Default)]
pub(crate) struct FakeChat {
    inbox: VecDeque<Option<String>>,
    pub sent: Vec<String>,
    /// The next `fail_polls` polls error out.
    pub fail_polls: usize,
    pub fail_sends: bool,
}

impl FakeChat {
    pub(crate) fn with_inbox<const N: usize>(inbox: [Option<&str>; N]) -> Self {
        Self {
            inbox: inbox.into_iter().map(|m| m.map(str::to_string)).collect(),
            ..Self::default()
        }
    }
}

impl ChatLink for FakeChat {
    async fn send(&mut self, text: &str) -> Result<()> {
        if self.fail_sends {
            bail!("chat unreachable");
        }
        self.sent.push(text.to_string());
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<String>> {
        if self.fail_polls > 0 {
            self.fail_polls -= 1;
            bail!("chat unreachable");
        }
        Ok(self.inbox.pop_front().flatten())
    }
}

// -- Calibration storage ------------------------------------------------------

#[derive(Default)]
struct StorageState {
    record: Option<CalibrationRecord>,
    saves: usize,
    fail_saves: bool,
}

/// Shared in-memory record; clones observe the same state.
#[derive(Clone, Default)]
pub(crate) struct MemoryStorage {
    state: Rc<RefCell<StorageState>>,
}

impl MemoryStorage {
    pub(crate) fn with(record: CalibrationRecord) -> Self {
        let storage = Self::default();
        storage.state.borrow_mut().record = Some(record);
        storage
    }

    /// Successful saves so far.
    pub(crate) fn saves(&self) -> usize {
        self.state.borrow().saves
    }

    pub(crate) fn saved(&self) -> Option<CalibrationRecord> {
        self.state.borrow().record
    }

    pub(crate) fn fail_saves(&self) {
        self.state.borrow_mut().fail_saves = true;
    }
}

impl CalibrationStorage for MemoryStorage {
    fn load(&self) -> Result<CalibrationRecord> {
        self.state
            .borrow()
            .record
            .ok_or_else(|| anyhow!("no calibration stored"))
    }

    fn save(&self, record: &CalibrationRecord) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_saves {
            bail!("storage is read-only");
        }
        state.record = Some(*record);
        state.saves += 1;
        Ok(())
    }
}

// -- Artifact source ----------------------------------------------------------

enum Reply {
    Body(Vec<u8>),
    Status(u16),
    Transport(String),
}

/// Answers every fetch with the same canned reply.
pub(crate) struct CannedSource {
    reply: Reply,
    fetches: Cell<usize>,
}

impl CannedSource {
    fn new(reply: Reply) -> Self {
        Self {
            reply,
            fetches: Cell::new(0),
        }
    }

    pub(crate) fn ok(body: &[u8]) -> Self {
        Self::new(Reply::Body(body.to_vec()))
    }

    pub(crate) fn status(code: u16) -> Self {
        Self::new(Reply::Status(code))
    }

    pub(crate) fn transport(reason: &str) -> Self {
        Self::new(Reply::Transport(reason.to_string()))
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.get()
    }
}

impl ArtifactSource for CannedSource {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
        self.fetches.set(self.fetches.get() + 1);
        match &self.reply {
            Reply::Body(body) => Ok(body.clone()),
            Reply::Status(code) => Err(FetchError::Status(*code)),
            Reply::Transport(reason) => Err(FetchError::Transport(reason.clone())),
        }
    }
}

// -- Pump ---------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct RecordingPump {
    pub history: Vec<bool>,
}

impl Pump for RecordingPump {
    fn set_running(&mut self, on: bool) {
        self.history.push(on);
    }
}

// -- Telemetry ----------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeSink {
    pub published: Vec<TelemetryPayload>,
    pub fail: bool,
}

impl TelemetrySink for FakeSink {
    async fn publish(&mut self, payload: &TelemetryPayload) -> Result<()> {
        if self.fail {
            bail!("broker unreachable");
        }
        self.published.push(payload.clone());
        Ok(())
    }
}
