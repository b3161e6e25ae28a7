//! ADS1115 16-bit ADC driver over I2C for the soil moisture channel.
//!
//! Single-shot, single-ended reads at PGA ±4.096 V and 128 SPS, which covers
//! a capacitive sensor powered from 3.3 V. Compiled with the `adc` feature.

use std::{thread, time::Duration};

use anyhow::Context;
use rppal::i2c::I2c;

use crate::mapper::VoltScale;
use crate::ports::Sensor;

// ── ADS1115 registers ───────────────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS       — write 1 to start single-shot conversion
//   [14:12] MUX      — input multiplexer (channel selection)
//   [11:9]  PGA      — programmable gain amplifier
//   [8]     MODE     — 0 = continuous, 1 = single-shot
//   [7:5]   DR       — data rate
//   [4:2]   comparator mode/polarity/latch
//   [1:0]   COMP_QUE — 11 = comparator disabled

/// OS=1, PGA=001 (±4.096 V), MODE=1, DR=100 (128 SPS), COMP_QUE=11.
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

const MUX_SHIFT: u8 = 12;
/// Single-ended MUX codes for AIN0..AIN3 against GND.
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

/// ~7.8 ms conversion at 128 SPS.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Read back: 1 once the conversion has finished.
const OS_READY_BIT: u16 = 1 << 15;

/// Largest single-ended code.
const MAX_CODE: i32 = 32767;

/// Config register value for a single-ended read on `channel` (0–3).
fn config_for_channel(channel: u8) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[usize::from(channel & 0b11)] << MUX_SHIFT)
}

// ── Driver ──────────────────────────────────────────────────────────────────

pub(crate) struct Ads1115 {
    i2c: I2c,
    channel: u8,
}

impl Ads1115 {
    /// Open I2C bus 1 and address the converter at `addr`.
    pub(crate) fn new(addr: u16, channel: u8) -> anyhow::Result<Self> {
        anyhow::ensure!(
            usize::from(channel) < MUX_SINGLE_ENDED.len(),
            "ADS1115 channel {channel} out of range (0–3)"
        );

        let mut i2c = I2c::new().context("failed to open i2c bus")?;
        i2c.set_slave_address(addr)?;

        tracing::info!(
            addr = format_args!("0x{addr:02x}"),
            channel,
            "ads1115 initialised"
        );

        Ok(Self { i2c, channel })
    }
}

impl Sensor for Ads1115 {
    fn read_raw(&mut self) -> anyhow::Result<i32> {
        self.i2c
            .block_write(REG_CONFIG, &config_for_channel(self.channel).to_be_bytes())
            .context("ads1115 config write failed")?;

        thread::sleep(CONVERSION_WAIT);

        // One wait is normally enough at 128 SPS; poll OS briefly in case.
        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c
            .block_read(REG_CONVERSION, &mut buf)
            .context("ads1115 conversion read failed")?;
        Ok(clamp_code(i16::from_be_bytes(buf)))
    }

    fn scale(&self) -> VoltScale {
        VoltScale::ADS1115_4V096
    }
}

/// Single-ended results are non-negative; anything else is bus noise.
fn clamp_code(raw: i16) -> i32 {
    i32::from(raw).clamp(0, MAX_CODE)
}

// ── Tests ───────────────────────────────────────────────────────────────────
