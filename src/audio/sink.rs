use std::sync::Arc;
use std::time::Duration;
use log::{info, warn};
use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::{OutputStream, Source};
use serde::Serialize;
use crate::error::{Error, Result};
use super::{AudioPipeline, BLOCK_SIZE, SAMPLE_RATE};

/// Audio device names belonging to one line, handed to network clients
/// so they can open the line's audio themselves.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceIds {
    pub serial: String,
    pub input: String,
    pub output: String,
}

fn find_device(mut devices: impl Iterator<Item = rodio::Device>, serial: &str) -> Option<rodio::Device> {
    devices.find(|device| device.name().map(|name| name.contains(serial)).unwrap_or(false))
}

/// Looks up the input and output device names containing `serial`.
pub fn resolve_device_ids(serial: &str) -> DeviceIds {
    let host = rodio::cpal::default_host();
    let name_of = |device: Option<rodio::Device>| {
        device.and_then(|d| d.name().ok()).unwrap_or_default()
    };
    let input = name_of(host.input_devices().ok().and_then(|devices| find_device(devices, serial)));
    let output = name_of(host.output_devices().ok().and_then(|devices| find_device(devices, serial)));
    if input.is_empty() || output.is_empty() {
        warn!("[{}] Audio devices not found (input: '{}', output: '{}')", serial, input, output);
    }
    DeviceIds {
        serial: serial.to_owned(),
        input,
        output,
    }
}

/// Endless 16 kHz mono stream pulled from a line's pipeline in fixed blocks.
pub struct LineOutput {
    pipeline: Arc<AudioPipeline>,
    block: [i16; BLOCK_SIZE],
    pos: usize,
}

impl LineOutput {
    pub fn new(pipeline: Arc<AudioPipeline>) -> Self {
        Self {
            pipeline,
            block: [0; BLOCK_SIZE],
            pos: BLOCK_SIZE,
        }
    }
}

impl Iterator for LineOutput {
    type Item = i16;

    fn next(&mut self) -> Option<i16> {
        if self.pos == BLOCK_SIZE {
            self.pipeline.fill(&mut self.block);
            self.pos = 0;
        }
        let sample = self.block[self.pos];
        self.pos += 1;
        Some(sample)
    }
}

impl Source for LineOutput {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Opens the output device whose name contains `serial` (or the default device) and
/// starts streaming `pipeline` to it. The stream plays for as long as the returned value lives.
pub fn open_output(serial: &str, pipeline: Arc<AudioPipeline>) -> Result<OutputStream> {
    let host = rodio::cpal::default_host();
    let device = host.output_devices()
        .ok()
        .and_then(|devices| find_device(devices, serial))
        .or_else(|| {
            warn!("[{}] No matching output device, using the default", serial);
            host.default_output_device()
        })
        .ok_or_else(|| Error::Audio(format!("[{}] no output device available", serial)))?;

    let (stream, handle) = OutputStream::try_from_device(&device)
        .map_err(|err| Error::Audio(format!("[{}] {}", serial, err)))?;
    handle.play_raw(LineOutput::new(pipeline).convert_samples())
        .map_err(|err| Error::Audio(format!("[{}] {}", serial, err)))?;

    info!("[{}] Audio output on '{}'", serial, device.name().unwrap_or_default());
    Ok(stream)
}
