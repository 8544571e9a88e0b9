use std::f64::consts::TAU;
use super::{AudioSource, SAMPLE_RATE};

/// Mixing gain applied to each frequency of a tone.
const TONE_GAIN: f64 = 0.2;

pub const BUSY_TONE: &[f32] = &[480.0, 620.0];
pub const RINGBACK_TONE: &[f32] = &[440.0, 480.0];

/// 0.5 s on, 0.5 s off.
pub const BUSY_CADENCE: (usize, usize) = (SAMPLE_RATE as usize / 2, SAMPLE_RATE as usize / 2);
/// 2 s on, 4 s off.
pub const RINGBACK_CADENCE: (usize, usize) = (SAMPLE_RATE as usize * 2, SAMPLE_RATE as usize * 4);

/// Sum of sine waves, optionally gated by an on/off cadence measured in samples.
#[derive(Clone, Debug)]
pub struct ToneSource {
    frequencies: Vec<f32>,
    /// `(on, off)` sample counts. `(0, 0)` plays continuously.
    cadence: (usize, usize),
    offset: usize,
}

impl ToneSource {
    pub fn continuous(frequencies: &[f32]) -> Self {
        Self::with_cadence(frequencies, (0, 0))
    }

    pub fn with_cadence(frequencies: &[f32], cadence: (usize, usize)) -> Self {
        Self {
            frequencies: frequencies.to_vec(),
            cadence,
            offset: 0,
        }
    }

    pub fn busy() -> Self {
        Self::with_cadence(BUSY_TONE, BUSY_CADENCE)
    }

    pub fn ringback() -> Self {
        Self::with_cadence(RINGBACK_TONE, RINGBACK_CADENCE)
    }

    fn sample_at(&self, n: usize) -> i16 {
        let (on, off) = self.cadence;
        let period = on + off;
        if period > 0 && n % period >= on {
            return 0
        }
        let t = n as f64 / SAMPLE_RATE as f64;
        let point: f64 = self.frequencies
            .iter()
            .map(|f| (TAU * *f as f64 * t).sin() * TONE_GAIN)
            .sum();
        (point * i16::MAX as f64).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
    }
}

impl AudioSource for ToneSource {
    fn read(&mut self, buf: &mut [i16]) -> bool {
        for (i, sample) in buf.iter_mut().enumerate() {
            *sample = self.sample_at(self.offset + i);
        }
        self.offset += buf.len();
        false
    }
}
