// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! Deterministic simulated sensor fleet for rigs and tests.

use super::{wind_speed_from_voltage, ChannelId, SensorFailure, SensorSource};
use std::collections::HashMap;

/// Simulated sensors producing slow deterministic waveforms.
///
/// Each channel follows a triangle wave around a plausible baseline, phase
/// shifted per channel so values stay distinguishable in logs. No RNG: the
/// same step always yields the same value, which keeps scenario tests exact.
///
/// Failures can be scripted per channel with [`SimulatedSensors::fail_channel`]
/// and persist until [`SimulatedSensors::heal_channel`].
pub struct SimulatedSensors {
    step: u64,
    failures: HashMap<ChannelId, SensorFailure>,
}

/// One full waveform period, in read steps.
const WAVE_PERIOD: u64 = 240;

impl SimulatedSensors {
    pub fn new() -> Self {
        Self {
            step: 0,
            failures: HashMap::new(),
        }
    }

    /// Make `channel` fail every read with `failure` until healed.
    pub fn fail_channel(&mut self, channel: ChannelId, failure: SensorFailure) {
        self.failures.insert(channel, failure);
    }

    /// Clear a scripted failure.
    pub fn heal_channel(&mut self, channel: ChannelId) {
        self.failures.remove(&channel);
    }

    /// Triangle wave in [0, 1] at the given phase offset.
    fn wave(&self, phase: u64) -> f64 {
        let pos = (self.step + phase) % WAVE_PERIOD;
        let half = WAVE_PERIOD / 2;
        if pos < half {
            pos as f64 / half as f64
        } else {
            (WAVE_PERIOD - pos) as f64 / half as f64
        }
    }
}

impl Default for SimulatedSensors {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for SimulatedSensors {
    fn read(&mut self, channel: ChannelId) -> Result<f64, SensorFailure> {
        self.step = self.step.wrapping_add(1);
        if let Some(failure) = self.failures.get(&channel) {
            return Err(*failure);
        }

        let value = match channel {
            // degrees C around a mild afternoon
            ChannelId::Temperature => 18.0 + 8.0 * self.wave(0),
            // relative humidity %
            ChannelId::Humidity => 40.0 + 25.0 * self.wave(60),
            // capacitive soil probe, raw counts
            ChannelId::SoilMoisture => 320.0 + 180.0 * self.wave(120),
            ChannelId::SoilTemperature => 14.0 + 5.0 * self.wave(30),
            // drive the real conversion path with a swept ADC voltage
            ChannelId::WindSpeed => {
                let volts = 0.4 + 1.6 * self.wave(180);
                wind_speed_from_voltage(volts)
            }
        };
        Ok(value)
    }
}
