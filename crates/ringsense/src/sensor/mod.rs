// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! Sensor capability interface.
//!
//! Chip drivers live outside this crate; the core consumes them through
//! [`SensorSource`], a synchronous per-channel read with failure as a
//! first-class return variant. The polling cycle's control flow is the same
//! no matter which sensors are attached.

use std::fmt;

mod sim;

pub use sim::SimulatedSensors;

/// Anemometer output floor (volts) - maps to 0 m/s.
pub const ANEMOMETER_MIN_VOLTS: f64 = 0.4;
/// Anemometer output ceiling (volts) - maps to full scale.
pub const ANEMOMETER_MAX_VOLTS: f64 = 2.0;
/// Anemometer full-scale wind speed (m/s).
pub const ANEMOMETER_MAX_SPEED: f64 = 32.4;

/// Environmental channels polled on every token cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelId {
    Temperature,
    Humidity,
    SoilMoisture,
    SoilTemperature,
    WindSpeed,
}

impl ChannelId {
    /// Every channel, in poll order.
    pub const ALL: [ChannelId; 5] = [
        ChannelId::Temperature,
        ChannelId::Humidity,
        ChannelId::SoilMoisture,
        ChannelId::SoilTemperature,
        ChannelId::WindSpeed,
    ];

    /// Stable name used in logs and at the storage boundary.
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelId::Temperature => "temperature",
            ChannelId::Humidity => "humidity",
            ChannelId::SoilMoisture => "soil_moisture",
            ChannelId::SoilTemperature => "soil_temperature",
            ChannelId::WindSpeed => "wind_speed",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-channel sensor failure, recorded as data and never fatal to the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorFailure {
    /// Channel has no attached or initialized sensor.
    Unavailable,
    /// Driver returned a value outside the channel's physical range.
    OutOfRange,
    /// Read exceeded the per-channel wall-clock budget.
    Timeout,
    /// Bus-level error code from the driver (I2C/ADC etc.).
    Bus(u16),
}

impl fmt::Display for SensorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorFailure::Unavailable => write!(f, "sensor unavailable"),
            SensorFailure::OutOfRange => write!(f, "value out of range"),
            SensorFailure::Timeout => write!(f, "poll budget exceeded"),
            SensorFailure::Bus(code) => write!(f, "bus error {:#06x}", code),
        }
    }
}

/// Synchronous sensor access, one value per channel per call.
///
/// Implementations should return within the configured poll budget; the
/// coordinator records overruns as [`SensorFailure::Timeout`] but cannot
/// preempt a stuck driver.
pub trait SensorSource: Send {
    /// Read one channel. Failure is data, not control flow.
    fn read(&mut self, channel: ChannelId) -> Result<f64, SensorFailure>;

    /// Channels this source exposes. Defaults to the full fleet set.
    fn channels(&self) -> &[ChannelId] {
        &ChannelId::ALL
    }
}

/// Convert raw anemometer ADC voltage to wind speed in m/s.
///
/// Linear map of 0.4-2.0 V onto 0.0-32.4 m/s, clamped to the output range
/// (below-floor voltage reads as calm, not negative).
pub fn wind_speed_from_voltage(volts: f64) -> f64 {
    let span_v = ANEMOMETER_MAX_VOLTS - ANEMOMETER_MIN_VOLTS;
    let speed = (volts - ANEMOMETER_MIN_VOLTS) / span_v * ANEMOMETER_MAX_SPEED;
    speed.clamp(0.0, ANEMOMETER_MAX_SPEED)
}
