use thiserror::Error;

use crate::{
    config::AdcConfig,
    types::{Acceleration, SensorReading},
};

/// TMP36 output at 0 °C.
const TMP36_OFFSET_VOLTS: f32 = 0.5;
const TMP36_CELSIUS_PER_VOLT: f32 = 100.0;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("{sensor} initialization failed: {details}")]
    InitFailed {
        sensor: &'static str,
        details: String,
    },
    #[error("{sensor} read failed: {details}")]
    ReadFailed {
        sensor: &'static str,
        details: String,
    },
}

/// One analog channel returning raw converter counts.
pub trait AnalogInput {
    fn read_raw(&mut self) -> Result<u16, SensorError>;
}

/// Three-axis accelerometer reporting m/s².
pub trait MotionSensor {
    fn read_acceleration(&mut self) -> Result<Acceleration, SensorError>;
}

pub fn raw_to_volts(raw: u16, adc: &AdcConfig) -> f32 {
    f32::from(raw) * (adc.reference_volts / adc.resolution)
}

pub fn tmp36_celsius(volts: f32) -> f32 {
    (volts - TMP36_OFFSET_VOLTS) * TMP36_CELSIUS_PER_VOLT
}

pub struct SensorSuite<A, M> {
    adc: AdcConfig,
    temperature: A,
    motion: M,
}

impl<A: AnalogInput, M: MotionSensor> SensorSuite<A, M> {
    pub fn new(adc: AdcConfig, temperature: A, motion: M) -> Self {
        Self {
            adc,
            temperature,
            motion,
        }
    }

    /// Single instantaneous sample, no filtering.
    pub fn read_temperature(&mut self) -> Result<f32, SensorError> {
        let raw = self.temperature.read_raw()?;
        Ok(tmp36_celsius(raw_to_volts(raw, &self.adc)))
    }

    pub fn read_motion(&mut self) -> Result<Acceleration, SensorError> {
        self.motion.read_acceleration()
    }

    pub fn read(&mut self) -> Result<SensorReading, SensorError> {
        let temperature_c = self.read_temperature()?;
        let acceleration = self.read_motion()?;
        Ok(SensorReading {
            temperature_c,
            acceleration,
        })
    }

    pub fn motion_mut(&mut self) -> &mut M {
        &mut self.motion
    }

    pub fn temperature_mut(&mut self) -> &mut A {
        &mut self.temperature
    }
}
