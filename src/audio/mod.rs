mod callerid;
mod file;
mod sink;
mod tone;

use std::sync::{mpsc, Mutex};
use log::trace;
use crate::error::lock;

pub use self::callerid::*;
pub use self::file::*;
pub use self::sink::*;
pub use self::tone::*;

/// Output sample rate of every line.
pub const SAMPLE_RATE: u32 = 16000;

/// Number of samples pulled from a source at a time (20 ms).
pub const BLOCK_SIZE: usize = 320;

/// A producer of 16 kHz mono samples.
pub trait AudioSource: Send {
    /// Fills `buf` completely and returns `true` once the source is exhausted.
    /// Samples past the end of the source are written as silence.
    fn read(&mut self, buf: &mut [i16]) -> bool;

    /// Called when the source is replaced or stopped before it finished.
    fn stop(&mut self) {}
}

struct Mixer {
    /// The active source. Taken out while the sink is reading from it.
    source: Option<Box<dyn AudioSource>>,
    /// Bumped whenever the active source changes.
    generation: u64,
    /// Set while the sink holds the source outside of the lock.
    reading: bool,
    /// Completion notification for `play_and_wait`.
    on_done: Option<mpsc::SyncSender<()>>,
}

impl Mixer {
    fn finish(&mut self) {
        if let Some(tx) = self.on_done.take() {
            let _ = tx.try_send(());
        }
    }

    /// Removes the current source and wakes any waiter.
    fn clear(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.stop();
        }
        self.generation += 1;
        self.finish();
    }
}

/// Single-active-source output for one line.
pub struct AudioPipeline {
    mixer: Mutex<Mixer>,
}

impl Default for AudioPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioPipeline {
    pub fn new() -> Self {
        Self {
            mixer: Mutex::new(Mixer {
                source: None,
                generation: 0,
                reading: false,
                on_done: None,
            }),
        }
    }

    fn install(&self, source: Box<dyn AudioSource>, on_done: Option<mpsc::SyncSender<()>>) {
        let mut mixer = lock(&self.mixer);
        mixer.clear();
        mixer.source = Some(source);
        mixer.on_done = on_done;
    }

    /// Replaces the current source with `source`.
    pub fn play(&self, source: impl AudioSource + 'static) {
        self.install(Box::new(source), None);
    }

    /// Replaces the current source and blocks until it finishes, is replaced, or is stopped.
    pub fn play_and_wait(&self, source: impl AudioSource + 'static) {
        let (tx, rx) = mpsc::sync_channel(1);
        self.install(Box::new(source), Some(tx));
        let _ = rx.recv();
    }

    pub fn stop(&self) {
        let mut mixer = lock(&self.mixer);
        if mixer.source.is_some() || mixer.reading {
            mixer.clear();
        }
    }

    /// Whether a source is installed (or being read).
    pub fn is_playing(&self) -> bool {
        let mixer = lock(&self.mixer);
        mixer.source.is_some() || mixer.reading
    }

    /// Pulls the next block from the active source into `buf`, or silence if there is none.
    ///
    /// The source is read outside of the lock so that a slow source never blocks
    /// `play` or `stop`. If the source was replaced in the meantime, it is stopped and dropped.
    pub fn fill(&self, buf: &mut [i16]) {
        buf.fill(0);

        let (mut source, generation) = {
            let mut mixer = lock(&self.mixer);
            match mixer.source.take() {
                Some(source) => {
                    mixer.reading = true;
                    (source, mixer.generation)
                },
                None => return
            }
        };

        let done = source.read(buf);

        let mut mixer = lock(&self.mixer);
        mixer.reading = false;
        if mixer.generation != generation {
            // Replaced or stopped while reading. The newer source owns the output.
            source.stop();
            buf.fill(0);
            return
        }
        if done {
            trace!("Audio source finished");
            mixer.generation += 1;
            mixer.finish();
        } else {
            mixer.source = Some(source);
        }
    }
}

/// Converts samples from `from_rate` to `to_rate` by linear interpolation.
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let index = pos as usize;
            let frac = pos - index as f64;
            let a = samples[index.min(samples.len() - 1)] as f64;
            let b = samples[(index + 1).min(samples.len() - 1)] as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

/// Averages interleaved channels down to mono.
pub fn downmix(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|frame| (frame.iter().map(|s| *s as i32).sum::<i32>() / frame.len() as i32) as i16)
        .collect()
}

/// A fixed buffer of samples played once.
#[cfg(test)]
pub struct ClipSource {
    samples: Vec<i16>,
    offset: usize,
}

#[cfg(test)]
impl ClipSource {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples, offset: 0 }
    }
}

#[cfg(test)]
impl AudioSource for ClipSource {
    fn read(&mut self, buf: &mut [i16]) -> bool {
        let n = buf.len().min(self.samples.len() - self.offset);
        buf[..n].copy_from_slice(&self.samples[self.offset..self.offset + n]);
        buf[n..].fill(0);
        self.offset += n;
        self.offset == self.samples.len()
    }
}
