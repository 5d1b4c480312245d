//! Audio Frequency Analyzer.
//!
//! Produces byte-scaled frequency bins from a window of response audio, the
//! same contract a browser `AnalyserNode` offers: Blackman window, FFT,
//! magnitude smoothing over time, then decibels mapped linearly from
//! `[min_db, max_db]` onto `0..=255`.

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Mono PCM audio, shared cheaply between the player and the analyzer
#[derive(Clone, PartialEq)]
pub struct PcmAudio {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl PcmAudio {
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate: sample_rate.max(1),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl fmt::Debug for PcmAudio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcmAudio")
            .field("samples", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// Anything the lip-sync binding can read audio windows from
pub trait AudioSource: Send {
    fn sample_rate(&self) -> u32;

    /// Fill `out` with the samples that precede `position`, zero-padded at the
    /// start. Returns false once `position` is past the end of the audio.
    fn window_at(&self, position: Duration, out: &mut [f32]) -> bool;
}

impl AudioSource for PcmAudio {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn window_at(&self, position: Duration, out: &mut [f32]) -> bool {
        let end = (position.as_secs_f64() * self.sample_rate as f64) as usize;
        if end > self.samples.len() {
            out.fill(0.0);
            return false;
        }
        let start = end.saturating_sub(out.len());
        let pad = out.len() - (end - start);
        out[..pad].fill(0.0);
        out[pad..].copy_from_slice(&self.samples[start..end]);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// FFT length; the analyzer yields half as many bins
    pub fft_size: usize,
    /// Weight of the previous frame in [0,1)
    pub smoothing: f32,
    pub min_db: f32,
    pub max_db: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            fft_size: 256,
            smoothing: 0.8,
            min_db: -100.0,
            max_db: -30.0,
        }
    }
}

pub struct FrequencyAnalyzer {
    config: AnalyzerConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    input: Vec<f32>,
    buffer: Vec<Complex32>,
    smoothed: Vec<f32>,
    bins: Vec<u8>,
}

impl FrequencyAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        let size = config.fft_size.max(32).next_power_of_two();
        let config = AnalyzerConfig {
            fft_size: size,
            smoothing: config.smoothing.clamp(0.0, 0.99),
            min_db: config.min_db,
            max_db: if config.max_db > config.min_db {
                config.max_db
            } else {
                config.min_db + 1.0
            },
        };
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(size);
        let window = (0..size)
            .map(|n| {
                let x = n as f32 / size as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();
        Self {
            config,
            fft,
            window,
            input: vec![0.0; size],
            buffer: vec![Complex32::new(0.0, 0.0); size],
            smoothed: vec![0.0; size / 2],
            bins: vec![0; size / 2],
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn fft_size(&self) -> usize {
        self.config.fft_size
    }

    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    /// Read the window ending at `position` from `source` and analyze it.
    /// Returns `None` once the source has run out.
    pub fn sample(&mut self, source: &dyn AudioSource, position: Duration) -> Option<&[u8]> {
        let mut input = std::mem::take(&mut self.input);
        let live = source.window_at(position, &mut input);
        let result = if live {
            self.analyze(&input);
            true
        } else {
            false
        };
        self.input = input;
        result.then_some(self.bins.as_slice())
    }

    /// Analyze one time-domain window. Shorter input is zero-padded.
    pub fn analyze(&mut self, samples: &[f32]) -> &[u8] {
        let size = self.config.fft_size;
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let s = samples.get(i).copied().unwrap_or(0.0);
            *slot = Complex32::new(s * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buffer);

        let tau = self.config.smoothing;
        let range = self.config.max_db - self.config.min_db;
        for k in 0..self.smoothed.len() {
            let magnitude = self.buffer[k].norm() / size as f32;
            self.smoothed[k] = tau * self.smoothed[k] + (1.0 - tau) * magnitude;
            let db = if self.smoothed[k] > 0.0 {
                20.0 * self.smoothed[k].log10()
            } else {
                f32::NEG_INFINITY
            };
            let scaled = 255.0 * (db - self.config.min_db) / range;
            self.bins[k] = scaled.clamp(0.0, 255.0) as u8;
        }
        &self.bins
    }

    pub fn reset(&mut self) {
        self.smoothed.fill(0.0);
        self.bins.fill(0);
    }
}

impl fmt::Debug for FrequencyAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrequencyAnalyzer")
            .field("config", &self.config)
            .finish()
    }
}

/// Mean bin value scaled to [0,1]
pub fn volume(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    let sum: u32 = bins.iter().map(|&b| b as u32).sum();
    sum as f32 / bins.len() as f32 / 255.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, rate: u32, secs: f32, amp: f32) -> PcmAudio {
        let n = (rate as f32 * secs) as usize;
        let samples: Vec<f32> = (0..n)
            .map(|i| amp * (2.0 * PI * freq * i as f32 / rate as f32).sin())
            .collect();
        PcmAudio::new(samples, rate)
    }

    #[test]
    fn silence_has_zero_volume() {
        let mut analyzer = FrequencyAnalyzer::new(AnalyzerConfig::default());
        let bins = analyzer.analyze(&[0.0; 256]);
        assert_eq!(bins.len(), 128);
        assert_eq!(volume(bins), 0.0);
    }

    #[test]
    fn tone_peaks_in_its_bin() {
        let mut analyzer = FrequencyAnalyzer::new(AnalyzerConfig {
            smoothing: 0.0,
            ..Default::default()
        });
        // bin width is 16000 / 256 = 62.5 Hz
        // quiet enough that neighbouring bins do not saturate
        let audio = tone(1000.0, 16000, 0.1, 0.001);
        let bins = analyzer
            .sample(&audio, Duration::from_millis(50))
            .unwrap()
            .to_vec();
        let peak = bins
            .iter()
            .enumerate()
            .max_by_key(|(_, &b)| b)
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 16);
        assert!(volume(&bins) > 0.0);
    }

    #[test]
    fn source_past_end_yields_none() {
        let mut analyzer = FrequencyAnalyzer::new(AnalyzerConfig::default());
        let audio = tone(440.0, 8000, 0.1, 0.5);
        assert!(analyzer.sample(&audio, Duration::from_millis(50)).is_some());
        assert!(analyzer.sample(&audio, Duration::from_millis(200)).is_none());
    }

    #[test]
    fn volume_of_full_bins_is_one() {
        assert_eq!(volume(&[255; 8]), 1.0);
        assert_eq!(volume(&[]), 0.0);
    }

    #[test]
    fn window_is_zero_padded_at_start() {
        let audio = PcmAudio::new(vec![1.0; 10], 1000);
        let mut out = [9.0f32; 8];
        assert!(audio.window_at(Duration::from_millis(4), &mut out));
        assert_eq!(out, [0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
    }
}
