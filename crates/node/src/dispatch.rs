//! Inbound command parsing and execution.
//!
//! Each channel has its own parser, so channel identity never depends on the
//! payload:
//!
//! | channel      | source                    | accepted text                  | action           |
//! |--------------|---------------------------|--------------------------------|------------------|
//! | `irrigation` | `<ns>/<id>/riego` topic   | `REGAR`                        | `Irrigate`       |
//! | `admin`      | `<ns>/<id>/admin` topic   | `ACTUALIZAR`                   | `Restart`        |
//! | `chat`       | polled operator chat      | `actualizar` (any case)        | `Update`         |
//! | `chat`       | polled operator chat      | digits only                    | `CalibrationInput` |
//!
//! Anything else is logged and dropped; unknown commands are never an error.

use std::time::Duration;

use tracing::{info, warn};

use crate::ports::{ArtifactSource, ChatLink, Clock, Pump};
use crate::update::UpdateCoordinator;

pub(crate) const IRRIGATE_TEXT: &str = "REGAR";
pub(crate) const UPDATE_TEXT: &str = "ACTUALIZAR";

/// Time given to in-flight telemetry and the acknowledgement before an
/// admin restart.
pub(crate) const RESTART_GRACE: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Channel {
    Irrigation,
    Admin,
    Chat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Command {
    pub channel: Channel,
    pub text: String,
}

impl Command {
    pub(crate) fn new(channel: Channel, text: impl Into<String>) -> Self {
        Self {
            channel,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Irrigate,
    Restart,
    Update,
    CalibrationInput(i64),
}

/// What the cycle driver must do after a command has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Directive {
    Continue,
    Restart,
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

fn parse_irrigation(text: &str) -> Option<Action> {
    (text.trim() == IRRIGATE_TEXT).then_some(Action::Irrigate)
}

fn parse_admin(text: &str) -> Option<Action> {
    (text.trim() == UPDATE_TEXT).then_some(Action::Restart)
}

fn parse_chat(text: &str) -> Option<Action> {
    let text = text.trim();
    if text.eq_ignore_ascii_case(UPDATE_TEXT) {
        Some(Action::Update)
    } else {
        parse_calibration_input(text).map(Action::CalibrationInput)
    }
}

/// A message made entirely of ASCII digits, as an integer.
pub(crate) fn parse_calibration_input(text: &str) -> Option<i64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

pub(crate) fn parse_command(command: &Command) -> Option<Action> {
    match command.channel {
        Channel::Irrigation => parse_irrigation(&command.text),
        Channel::Admin => parse_admin(&command.text),
        Channel::Chat => parse_chat(&command.text),
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub(crate) struct Dispatcher<'a, P, L, C, A> {
    pub node_id: &'a str,
    pub irrigation: Duration,
    pub pump: &'a mut P,
    pub chat: &'a mut L,
    pub clock: &'a C,
    pub updater: &'a UpdateCoordinator<A>,
}

impl<P, L, C, A> Dispatcher<'_, P, L, C, A>
where
    P: Pump,
    L: ChatLink,
    C: Clock,
    A: ArtifactSource,
{
    pub(crate) async fn dispatch(&mut self, command: &Command) -> Directive {
        let Some(action) = parse_command(command) else {
            info!(
                channel = ?command.channel,
                text = %command.text,
                "ignoring unrecognised command"
            );
            return Directive::Continue;
        };

        info!(channel = ?command.channel, ?action, "dispatching command");

        match action {
            Action::Irrigate => {
                self.irrigate().await;
                Directive::Continue
            }
            Action::Restart => {
                self.notify(&format!("Node {}: received. Restarting now.", self.node_id))
                    .await;
                self.clock.sleep(RESTART_GRACE).await;
                Directive::Restart
            }
            Action::Update => self.update().await,
            Action::CalibrationInput(value) => {
                info!(value, "calibration input outside calibration; ignoring");
                Directive::Continue
            }
        }
    }

    async fn irrigate(&mut self) {
        info!(seconds = self.irrigation.as_secs(), "irrigation started");
        self.pump.set_running(true);
        self.clock.sleep(self.irrigation).await;
        self.pump.set_running(false);
        info!("irrigation finished");
    }

    async fn update(&mut self) -> Directive {
        self.notify(&format!(
            "Node {}: OK, starting the update process.",
            self.node_id
        ))
        .await;

        match self.updater.run(self.chat, self.clock).await {
            Ok(attempt) => {
                info!(
                    url = %attempt.source_url,
                    bytes = attempt.downloaded_bytes,
                    backup = attempt.backup_taken,
                    installed = attempt.installed,
                    "update installed; restarting"
                );
                Directive::Restart
            }
            Err(e) => {
                warn!("update aborted: {e}");
                self.notify(&format!("Node {}: update aborted: {e}", self.node_id))
                    .await;
                Directive::Continue
            }
        }
    }

    async fn notify(&mut self, text: &str) {
        if let Err(e) = self.chat.send(text).await {
            warn!("chat send failed: {e:#}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
