//! Pump relay and device restart. The `gpio` feature gates the real rppal
//! relay driver; without it, a mock pump logs state changes.

use std::ffi::OsString;
use std::path::Path;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::ports::Pump;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Exit status used when the in-place restart cannot exec, so the service
/// supervisor brings the node back up.
pub(crate) const RESTART_EXIT_CODE: i32 = 75;

// ---------------------------------------------------------------------------
// Real relay (production; requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct RelayPump {
    pin: OutputPin,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl RelayPump {
    pub(crate) fn new(gpio_pin: u8, active_low: bool) -> Result<Self> {
        let mut pin = Gpio::new()?.get(gpio_pin)?.into_output();
        // Fail-safe: pump off at startup.
        if active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(gpio_pin, active_low, "pump relay initialised");
        Ok(Self { pin, active_low })
    }
}

#[cfg(feature = "gpio")]
impl Pump for RelayPump {
    fn set_running(&mut self, on: bool) {
        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        info!(on, "pump relay set");
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct RelayPump {
    pub(crate) running: bool,
}

#[cfg(not(feature = "gpio"))]
impl RelayPump {
    pub(crate) fn new(gpio_pin: u8, _active_low: bool) -> Result<Self> {
        info!(gpio_pin, "[mock-gpio] pump relay registered (not wired)");
        Ok(Self { running: false })
    }
}

#[cfg(not(feature = "gpio"))]
impl Pump for RelayPump {
    fn set_running(&mut self, on: bool) {
        self.running = on;
        info!("[mock-gpio] pump {}", if on { "ON" } else { "OFF" });
    }
}

// ---------------------------------------------------------------------------
// Restart
// ---------------------------------------------------------------------------

/// Replace the current process with `program`, which after a successful
/// update is the newly installed one. Never returns; if the exec fails the
/// process exits with `RESTART_EXIT_CODE`.
pub(crate) fn restart(program: &Path) -> ! {
    info!(program = %program.display(), "restarting");

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;

        let err = std::process::Command::new(program)
            .args(restart_args())
            .exec();
        error!("exec failed: {err}");
    }
    #[cfg(not(unix))]
    warn!("in-place restart unsupported on this platform");

    warn!(code = RESTART_EXIT_CODE, "exiting for supervisor restart");
    std::process::exit(RESTART_EXIT_CODE);
}

/// Arguments for the next process image, unchanged and without requiring
/// valid UTF-8.
fn restart_args() -> Vec<OsString> {
    std::env::args_os().skip(1).collect()
}

// ===========================================================================
// Tests
// ===========================================================================
