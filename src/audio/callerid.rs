use std::f64::consts::TAU;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{mpsc, Arc};
use std::thread;
use log::{debug, info, warn};
use crate::callerid::{decode, CallerIdPayload};
use crate::config::ModemConfig;
use crate::error::{Error, Result};
use super::{downmix, resample, AudioSource, SAMPLE_RATE};

const BAUD_RATE: u32 = 1200;
const MARK_FREQUENCY: f64 = 1200.0;
const SPACE_FREQUENCY: f64 = 2200.0;
const FSK_GAIN: f64 = 0.25;
const SEIZURE_BITS: usize = 300;
const CARRIER_BITS: usize = 180;
const MODEM_OUTPUT: &str = "output.wav";

/// Phase-continuous Bell-202 modulation of `bits` (`true` = mark).
pub fn bell202(bits: impl IntoIterator<Item = bool>) -> Vec<i16> {
    let samples_per_bit = SAMPLE_RATE as f64 / BAUD_RATE as f64;
    let mut samples = Vec::new();
    let mut phase = 0.0f64;
    let mut emitted = 0usize;
    for (i, bit) in bits.into_iter().enumerate() {
        let frequency = if bit { MARK_FREQUENCY } else { SPACE_FREQUENCY };
        let end = ((i + 1) as f64 * samples_per_bit).round() as usize;
        while emitted < end {
            samples.push((phase.sin() * FSK_GAIN * i16::MAX as f64).round() as i16);
            phase = (phase + TAU * frequency / SAMPLE_RATE as f64) % TAU;
            emitted += 1;
        }
    }
    samples
}

/// Fixed waveforms framing every Caller-ID burst, plus the modem used for the payload.
pub struct CallerIdAssets {
    pub seizure: Arc<[i16]>,
    pub carrier: Arc<[i16]>,
    pub modem: PathBuf,
}

impl CallerIdAssets {
    /// Builds the assets from config, synthesizing any waveform without a recording.
    pub fn load(config: &ModemConfig) -> Result<Self> {
        let seizure = match &config.seizure_wav {
            Some(path) => read_wav(path)?,
            None => bell202((0..SEIZURE_BITS).map(|i| i % 2 == 1)),
        };
        let carrier = match &config.carrier_wav {
            Some(path) => read_wav(path)?,
            None => bell202(std::iter::repeat(true).take(CARRIER_BITS)),
        };
        Ok(Self {
            seizure: seizure.into(),
            carrier: carrier.into(),
            modem: config.executable.clone(),
        })
    }
}

/// Reads a WAV file as 16 kHz mono.
pub fn read_wav(path: &Path) -> Result<Vec<i16>> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let samples: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => {
            let shift = 16 - spec.bits_per_sample;
            reader.samples::<i16>()
                .map(|s| s.map(|s| s << shift))
                .collect::<std::result::Result<_, _>>()?
        },
        hound::SampleFormat::Int => {
            let shift = spec.bits_per_sample - 16;
            reader.samples::<i32>()
                .map(|s| s.map(|s| (s >> shift) as i16))
                .collect::<std::result::Result<_, _>>()?
        },
        hound::SampleFormat::Float => {
            reader.samples::<f32>()
                .map(|s| s.map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
                .collect::<std::result::Result<_, _>>()?
        },
    };
    Ok(resample(&downmix(&samples, spec.channels), spec.sample_rate, SAMPLE_RATE))
}

/// Runs the FSK modem over the encoded message and returns the modulated waveform.
pub fn modulate(modem: &Path, message: &[u8]) -> Result<Vec<i16>> {
    let dir = std::env::temp_dir().join(format!("callerid-{:016x}", rand::random::<u64>()));
    fs::create_dir_all(&dir).map_err(|err| Error::ExternalProcess(format!("temp dir: {}", err)))?;
    let result = run_modem(modem, &dir, message);
    if let Err(err) = fs::remove_dir_all(&dir) {
        debug!("Unable to remove {}: {}", dir.display(), err);
    }
    result
}

fn run_modem(modem: &Path, dir: &Path, message: &[u8]) -> Result<Vec<i16>> {
    let mut child = Command::new(modem)
        .args(["--tx", "1200", "-f", MODEM_OUTPUT, "-R"])
        .arg(SAMPLE_RATE.to_string())
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| Error::ExternalProcess(format!("unable to start {}: {}", modem.display(), err)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(message).map_err(|err| Error::ExternalProcess(format!("modem stdin: {}", err)))?;
    }

    let output = child.wait_with_output().map_err(|err| Error::ExternalProcess(err.to_string()))?;
    if !output.status.success() {
        return Err(Error::ExternalProcess(format!(
            "{} exited with {}: {}",
            modem.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    read_wav(&dir.join(MODEM_OUTPUT))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Stage {
    Seizure,
    Carrier,
    Payload,
    TrailingCarrier,
    Done,
}

/// Seizure, carrier, modulated payload, carrier.
///
/// The payload is produced on a background thread as soon as the source is created.
/// The payload stage waits for it.
pub struct CallerIdSource {
    stage: Stage,
    offset: usize,
    seizure: Arc<[i16]>,
    carrier: Arc<[i16]>,
    payload: Option<Vec<i16>>,
    pending: Option<mpsc::Receiver<Result<Vec<i16>>>>,
}

impl CallerIdSource {
    pub fn new(assets: &CallerIdAssets, payload: &CallerIdPayload) -> Result<Self> {
        let message = payload.encode()?;
        if let Ok(decoded) = decode(&message) {
            debug!("Caller-ID message {:02X?} ({:?})", message, decoded);
        }
        let modem = assets.modem.clone();
        Ok(Self::with_producer(assets, move || modulate(&modem, &message)))
    }

    /// Starts `produce` on a background thread to supply the payload waveform.
    pub fn with_producer<F>(assets: &CallerIdAssets, produce: F) -> Self
    where F: FnOnce() -> Result<Vec<i16>> + Send + 'static {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(produce());
        });
        Self {
            stage: Stage::Seizure,
            offset: 0,
            seizure: Arc::clone(&assets.seizure),
            carrier: Arc::clone(&assets.carrier),
            payload: None,
            pending: Some(rx),
        }
    }

    fn next_stage(&mut self) {
        self.offset = 0;
        self.stage = match self.stage {
            Stage::Seizure => Stage::Carrier,
            Stage::Carrier => Stage::Payload,
            Stage::Payload => Stage::TrailingCarrier,
            Stage::TrailingCarrier | Stage::Done => Stage::Done,
        };
    }

    /// Blocks until the background modem run has finished.
    fn await_payload(&mut self) {
        let Some(rx) = self.pending.take() else { return };
        match rx.recv() {
            Ok(Ok(samples)) => {
                debug!("Caller-ID payload ready ({} samples)", samples.len());
                self.payload = Some(samples);
            },
            Ok(Err(err)) => warn!("Caller-ID payload unavailable: {}", err),
            Err(_) => warn!("Caller-ID payload producer vanished"),
        }
    }
}

impl AudioSource for CallerIdSource {
    fn read(&mut self, buf: &mut [i16]) -> bool {
        let mut filled = 0;
        while filled < buf.len() {
            if self.stage == Stage::Payload {
                self.await_payload();
            }
            let data: &[i16] = match self.stage {
                Stage::Seizure => &self.seizure,
                Stage::Carrier | Stage::TrailingCarrier => &self.carrier,
                Stage::Payload => self.payload.as_deref().unwrap_or(&[]),
                Stage::Done => break,
            };
            let n = (buf.len() - filled).min(data.len() - self.offset);
            buf[filled..filled + n].copy_from_slice(&data[self.offset..self.offset + n]);
            filled += n;
            self.offset += n;
            if self.offset == data.len() {
                self.next_stage();
            }
        }
        buf[filled..].fill(0);
        self.stage == Stage::Done
    }

    fn stop(&mut self) {
        if self.stage != Stage::Done {
            info!("Caller-ID interrupted during {:?}", self.stage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assets() -> CallerIdAssets {
        CallerIdAssets {
            seizure: vec![1i16; 500].into(),
            carrier: vec![2i16; 300].into(),
            modem: PathBuf::from("minimodem"),
        }
    }

    fn drain(source: &mut CallerIdSource) -> Vec<i16> {
        let mut out = Vec::new();
        let mut buf = [0i16; 320];
        loop {
            let done = source.read(&mut buf);
            out.extend_from_slice(&buf);
            if done {
                return out
            }
        }
    }

    #[test]
    fn stages_play_in_order() {
        let mut source = CallerIdSource::with_producer(&assets(), || Ok(vec![3i16; 700]));
        let out = drain(&mut source);
        assert!(out[..500].iter().all(|s| *s == 1));
        assert!(out[500..800].iter().all(|s| *s == 2));
        assert!(out[800..1500].iter().all(|s| *s == 3));
        assert!(out[1500..1800].iter().all(|s| *s == 2));
        assert!(out[1800..].iter().all(|s| *s == 0));
    }

    #[test]
    fn payload_waits_for_slow_producer() {
        let mut source = CallerIdSource::with_producer(&assets(), || {
            thread::sleep(std::time::Duration::from_millis(100));
            Ok(vec![3i16; 40])
        });
        let out = drain(&mut source);
        assert!(out[800..840].iter().all(|s| *s == 3));
        assert!(out[840..1140].iter().all(|s| *s == 2));
    }

    #[test]
    fn failed_production_skips_payload() {
        let mut source = CallerIdSource::with_producer(&assets(), || {
            Err(Error::ExternalProcess("exit status 1".into()))
        });
        let out = drain(&mut source);
        assert!(out[..500].iter().all(|s| *s == 1));
        assert!(out[500..1100].iter().all(|s| *s == 2));
        assert!(out[1100..].iter().all(|s| *s == 0));
    }

    #[test]
    fn missing_modem_is_external_process_error() {
        let result = modulate(Path::new("/nonexistent/modem-binary"), &[0x80, 0, 0x80]);
        assert!(matches!(result, Err(Error::ExternalProcess(_))));
    }

    #[test]
    fn bell202_bit_timing() {
        let samples = bell202(std::iter::repeat(true).take(CARRIER_BITS));
        assert_eq!(samples.len(), 2400);
        let seizure = bell202((0..SEIZURE_BITS).map(|i| i % 2 == 1));
        assert_eq!(seizure.len(), 4000);
    }

    #[test]
    fn synthesized_assets() {
        let assets = CallerIdAssets::load(&ModemConfig::default()).unwrap();
        assert_eq!(assets.seizure.len(), 4000);
        assert_eq!(assets.carrier.len(), 2400);
        assert!(assets.carrier.iter().any(|s| *s != 0));
    }
}
