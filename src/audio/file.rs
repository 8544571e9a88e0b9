use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use log::{debug, warn};
use rodio::Source;
use crate::error::{Error, Result};
use super::{downmix, resample, AudioSource, SAMPLE_RATE};

/// Decodes a sound file into 16 kHz mono samples.
pub fn decode_file(path: &Path) -> Result<Vec<i16>> {
    let file = File::open(path).map_err(|err| Error::Audio(format!("{}: {}", path.display(), err)))?;
    let decoder = rodio::Decoder::new(BufReader::new(file))
        .map_err(|err| Error::Audio(format!("{}: {}", path.display(), err)))?;
    let channels = decoder.channels();
    let sample_rate = decoder.sample_rate();
    let samples: Vec<i16> = decoder.convert_samples::<i16>().collect();
    Ok(resample(&downmix(&samples, channels), sample_rate, SAMPLE_RATE))
}

/// Plays a sound file once. The file is decoded on the first pull.
pub struct FileSource {
    path: PathBuf,
    samples: Option<Vec<i16>>,
    offset: usize,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            samples: None,
            offset: 0,
        }
    }
}

impl AudioSource for FileSource {
    fn read(&mut self, buf: &mut [i16]) -> bool {
        if self.samples.is_none() {
            match decode_file(&self.path) {
                Ok(samples) => {
                    debug!("Decoded {} ({} samples)", self.path.display(), samples.len());
                    self.samples = Some(samples);
                },
                Err(err) => {
                    warn!("Unable to play sound: {}", err);
                    self.samples = Some(Vec::new());
                }
            }
        }
        let samples = self.samples.as_deref().unwrap_or(&[]);
        let n = buf.len().min(samples.len() - self.offset);
        buf[..n].copy_from_slice(&samples[self.offset..self.offset + n]);
        buf[n..].fill(0);
        self.offset += n;
        self.offset == samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_finishes_silently() {
        let mut source = FileSource::new("/nonexistent/sound.wav");
        let mut buf = [9i16; 64];
        assert!(source.read(&mut buf));
        assert!(buf.iter().all(|s| *s == 0));
    }

    #[test]
    fn decodes_and_resamples_wav() {
        let path = std::env::temp_dir().join(format!("hidphone-file-{:016x}.wav", rand::random::<u64>()));
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..800 {
            writer.write_sample(1000i16).unwrap();
            writer.write_sample(3000i16).unwrap();
        }
        writer.finalize().unwrap();

        let samples = decode_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(samples.len(), 1600);
        assert!(samples.iter().all(|s| *s == 2000));
    }
}
