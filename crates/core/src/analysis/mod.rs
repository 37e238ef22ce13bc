use std::{fmt, ops::Range, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{Result, VisualError};

/// Block size the band edges below were tuned for.
const REFERENCE_BLOCK: usize = 1024;
/// Band edges in bins of a [`REFERENCE_BLOCK`] transform.
const BASS_BINS: Range<usize> = 1..12;
const MID_BINS: Range<usize> = 12..185;
const TREBLE_START: usize = 185;
/// Samples are normalised floats; the scaling constants assume 16-bit PCM.
const PCM_FULL_SCALE: f32 = 32_768.0;
const MAGNITUDE_SCALE: f32 = 100_000.0;
const BASS_GAIN: f32 = 2.0;
const MID_GAIN: f32 = 3.0;
const TREBLE_GAIN: f32 = 5.0;

/// Latest three-band loudness reading, every component in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioSnapshot {
    pub bass: f32,
    pub mid: f32,
    pub treble: f32,
}

impl AudioSnapshot {
    pub const SILENT: Self = Self {
        bass: 0.0,
        mid: 0.0,
        treble: 0.0,
    };

    /// Builds a snapshot, clamping each band into `[0, 1]`.
    pub fn new(bass: f32, mid: f32, treble: f32) -> Self {
        Self {
            bass: soft_clip(bass),
            mid: soft_clip(mid),
            treble: soft_clip(treble),
        }
    }

    pub fn as_array(&self) -> [f32; 3] {
        [self.bass, self.mid, self.treble]
    }

    /// Blends `next` over `self`, keeping `smoothing` of the previous value.
    pub fn smoothed(&self, next: AudioSnapshot, smoothing: f32) -> AudioSnapshot {
        let keep = if smoothing.is_finite() {
            smoothing.clamp(0.0, 0.99)
        } else {
            0.0
        };
        let mix = |prev: f32, new: f32| prev * keep + new * (1.0 - keep);
        AudioSnapshot::new(
            mix(self.bass, next.bass),
            mix(self.mid, next.mid),
            mix(self.treble, next.treble),
        )
    }
}

/// Reduces blocks of samples into [`AudioSnapshot`]s.
///
/// Each block is transformed with a real FFT, the magnitude spectrum is split
/// into bass, mid and treble ranges, and the mean magnitude of every range is
/// scaled and clipped into `[0, 1]`.
pub struct BandAnalyzer {
    smoothing: f32,
    last: AudioSnapshot,
    processed_blocks: u64,
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl BandAnalyzer {
    pub fn new() -> Self {
        Self::with_smoothing(0.0)
    }

    pub fn with_smoothing(smoothing: f32) -> Self {
        Self {
            smoothing,
            last: AudioSnapshot::SILENT,
            processed_blocks: 0,
            fft_planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    /// Number of blocks analysed since construction or the last reset.
    pub fn processed_blocks(&self) -> u64 {
        self.processed_blocks
    }

    pub fn latest(&self) -> AudioSnapshot {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = AudioSnapshot::SILENT;
        self.processed_blocks = 0;
    }

    /// Analyses one block. Out-of-range and non-finite samples are clipped so
    /// the output never leaves `[0, 1]`.
    pub fn process(&mut self, samples: &[f32]) -> Result<AudioSnapshot> {
        if samples.len() < 2 {
            return Err(VisualError::InvalidInput(
                "band analysis requires blocks with at least two samples",
            ));
        }

        let len = samples.len();
        let fft = self.prepare_fft(len);
        for (slot, sample) in fft.input.iter_mut().zip(samples) {
            *slot = if sample.is_finite() {
                sample.clamp(-1.0, 1.0)
            } else {
                0.0
            };
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        // Magnitudes grow with the block length; bring them back to the
        // reference block so the scaling constants stay valid.
        let normalise = PCM_FULL_SCALE * REFERENCE_BLOCK as f32 / len as f32 / MAGNITUDE_SCALE;
        let bins = fft.spectrum.len();
        let bass = mean_magnitude(&fft.spectrum, scaled_range(BASS_BINS, len, bins));
        let mid = mean_magnitude(&fft.spectrum, scaled_range(MID_BINS, len, bins));
        let treble = mean_magnitude(&fft.spectrum, scaled_range(TREBLE_START..bins, len, bins));

        let raw = AudioSnapshot::new(
            bass * normalise * BASS_GAIN,
            mid * normalise * MID_GAIN,
            treble * normalise * TREBLE_GAIN,
        );

        self.last = if self.smoothing > 0.0 {
            self.last.smoothed(raw, self.smoothing)
        } else {
            raw
        };
        self.processed_blocks += 1;
        Ok(self.last)
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        if self.fft.as_ref().is_some_and(|fft| fft.size != size) {
            self.fft = None;
        }

        self.fft.get_or_insert_with(|| {
            let plan = self.fft_planner.plan_fft_forward(size);
            FftResources {
                size,
                scratch: plan.make_scratch_vec(),
                spectrum: plan.make_output_vec(),
                input: plan.make_input_vec(),
                plan,
            }
        })
    }
}

impl Default for BandAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for BandAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BandAnalyzer")
            .field("smoothing", &self.smoothing)
            .field("last", &self.last)
            .field("processed_blocks", &self.processed_blocks)
            .field("fft_size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

/// Maps a reference-block bin range onto a transform of `len` samples with
/// `bins` output bins. Ranges never collapse to zero width.
fn scaled_range(range: Range<usize>, len: usize, bins: usize) -> Range<usize> {
    let scale = |bin: usize| bin * len / REFERENCE_BLOCK;
    let start = scale(range.start).clamp(1, bins.saturating_sub(1).max(1));
    let end = if range.end >= bins {
        bins
    } else {
        scale(range.end).clamp(start + 1, bins)
    };
    start..end
}

fn mean_magnitude(spectrum: &[Complex32], range: Range<usize>) -> f32 {
    let slice = spectrum.get(range).unwrap_or(&[]);
    if slice.is_empty() {
        return 0.0;
    }
    slice.iter().map(|c| c.norm()).sum::<f32>() / slice.len() as f32
}

/// Clamps into `[0, 1]`, mapping NaN to zero.
fn soft_clip(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
