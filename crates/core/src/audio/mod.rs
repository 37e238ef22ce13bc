use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::{AudioConfig, AudioSnapshot, BandAnalyzer, Result, VisualError};

#[cfg(feature = "capture")]
mod capture;

/// How long a channel-fed read waits before letting the capture loop check
/// its stop flag.
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Back-off after a failed read.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of one blocking read from a [`SampleSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRead {
    /// The whole block was filled.
    Full,
    /// Not enough samples arrived in time; the block is left untouched.
    Pending,
    /// The producer is gone and no more samples will arrive.
    Closed,
}

/// Blocking producer of mono samples, read from the capture thread.
pub trait SampleSource: Send + 'static {
    fn read_block(&mut self, block: &mut [f32]) -> Result<BlockRead>;
}

/// Single-slot, overwrite-on-write channel holding the latest snapshot.
#[derive(Clone, Default)]
pub struct SnapshotSlot {
    shared: Arc<Mutex<AudioSnapshot>>,
}

impl SnapshotSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: AudioSnapshot) {
        // A poisoned slot still holds a complete snapshot; keep publishing.
        let mut slot = self.shared.lock().unwrap_or_else(|err| err.into_inner());
        *slot = snapshot;
    }

    pub fn latest(&self) -> AudioSnapshot {
        *self.shared.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl std::fmt::Debug for SnapshotSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotSlot")
            .field("latest", &self.latest())
            .finish()
    }
}

/// Lifecycle of an [`AudioSignalSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureState {
    Running,
    /// No input was available at start; the slot holds a permanent zero vector.
    Disabled(String),
    Stopped,
}

/// Owns the capture thread and publishes band loudness for the render side.
pub struct AudioSignalSource {
    slot: SnapshotSlot,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    state: CaptureState,
    #[cfg(feature = "capture")]
    stream: Option<cpal::Stream>,
}

impl AudioSignalSource {
    /// Opens the configured (or default) input device and starts capturing.
    /// When no device can be opened the source comes up disabled.
    pub fn start(config: &AudioConfig) -> Self {
        match Self::open_device(config) {
            Ok(source) => source,
            Err(err) => {
                tracing::warn!(error = %err, "audio reactivity disabled");
                Self::disabled(err.to_string())
            }
        }
    }

    #[cfg(feature = "capture")]
    fn open_device(config: &AudioConfig) -> Result<Self> {
        let (stream, source, sample_rate) = capture::open_input(config)?;
        tracing::info!(sample_rate, "audio capture started");
        let mut signal = Self::with_source(source, config);
        signal.stream = Some(stream);
        Ok(signal)
    }

    #[cfg(not(feature = "capture"))]
    fn open_device(_config: &AudioConfig) -> Result<Self> {
        Err(VisualError::AudioDeviceUnavailable(
            "built without the `capture` feature".to_string(),
        ))
    }

    /// Starts a capture thread reading from an arbitrary sample source.
    pub fn with_source<S: SampleSource>(source: S, config: &AudioConfig) -> Self {
        let slot = SnapshotSlot::new();
        let stop = Arc::new(AtomicBool::new(false));
        let block_size = config.block_size.max(2);
        let smoothing = config.smoothing;

        let worker = {
            let slot = slot.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("audio-capture".to_string())
                .spawn(move || capture_loop(source, block_size, smoothing, &slot, &stop))
        };

        match worker {
            Ok(worker) => Self {
                slot,
                stop,
                worker: Some(worker),
                state: CaptureState::Running,
                #[cfg(feature = "capture")]
                stream: None,
            },
            Err(err) => {
                tracing::warn!(error = %err, "failed to spawn audio capture thread");
                Self::disabled(err.to_string())
            }
        }
    }

    /// A source that never produces anything but silence.
    pub fn disabled(reason: impl Into<String>) -> Self {
        Self {
            slot: SnapshotSlot::new(),
            stop: Arc::new(AtomicBool::new(true)),
            worker: None,
            state: CaptureState::Disabled(reason.into()),
            #[cfg(feature = "capture")]
            stream: None,
        }
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    /// Latest published snapshot. Never blocks on the capture thread for
    /// longer than the publish itself.
    pub fn latest(&self) -> AudioSnapshot {
        self.slot.latest()
    }

    pub fn slot(&self) -> &SnapshotSlot {
        &self.slot
    }

    /// Signals the capture loop, waits for it to exit and then releases the
    /// device stream.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("audio capture thread panicked");
            }
            tracing::info!("audio capture stopped");
        }
        #[cfg(feature = "capture")]
        drop(self.stream.take());

        if self.state == CaptureState::Running {
            self.state = CaptureState::Stopped;
        }
        self.slot.publish(AudioSnapshot::SILENT);
    }
}

impl Drop for AudioSignalSource {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AudioSignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSignalSource")
            .field("state", &self.state)
            .field("latest", &self.latest())
            .finish()
    }
}

fn capture_loop<S: SampleSource>(
    mut source: S,
    block_size: usize,
    smoothing: f32,
    slot: &SnapshotSlot,
    stop: &AtomicBool,
) {
    let mut analyzer = BandAnalyzer::with_smoothing(smoothing);
    let mut block = vec![0.0_f32; block_size];

    while !stop.load(Ordering::Acquire) {
        match source.read_block(&mut block) {
            Ok(BlockRead::Full) => match analyzer.process(&block) {
                Ok(snapshot) => slot.publish(snapshot),
                Err(err) => tracing::warn!(error = %err, "audio analysis failed"),
            },
            Ok(BlockRead::Pending) => {}
            Ok(BlockRead::Closed) => {
                tracing::info!("audio input closed");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "audio read error");
                thread::sleep(READ_ERROR_BACKOFF);
            }
        }
    }
}

/// Creates a bounded sample channel. The sender side never blocks: chunks
/// that do not fit are dropped.
pub fn sample_channel(capacity: usize) -> (SampleSender, ChannelSource) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    (
        SampleSender { tx },
        ChannelSource {
            rx,
            pending: VecDeque::new(),
            timeout: READ_TIMEOUT,
        },
    )
}

/// Producer half of [`sample_channel`], usable from realtime callbacks.
#[derive(Clone)]
pub struct SampleSender {
    tx: SyncSender<Vec<f32>>,
}

impl SampleSender {
    /// Returns `false` when the chunk was dropped or the reader is gone.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        match self.tx.try_send(samples) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Consumer half of [`sample_channel`]; regroups incoming chunks into blocks.
pub struct ChannelSource {
    rx: Receiver<Vec<f32>>,
    pending: VecDeque<f32>,
    timeout: Duration,
}

impl ChannelSource {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl SampleSource for ChannelSource {
    fn read_block(&mut self, block: &mut [f32]) -> Result<BlockRead> {
        while self.pending.len() < block.len() {
            match self.rx.recv_timeout(self.timeout) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => return Ok(BlockRead::Pending),
                Err(RecvTimeoutError::Disconnected) => return Ok(BlockRead::Closed),
            }
        }

        let len = block.len();
        for (slot, sample) in block.iter_mut().zip(self.pending.drain(..len)) {
            *slot = sample;
        }
        Ok(BlockRead::Full)
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;
    use std::time::Instant;

    use super::*;

    fn config(block_size: usize) -> AudioConfig {
        AudioConfig {
            block_size,
            ..AudioConfig::default()
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn slot_keeps_only_the_latest_value() {
        let slot = SnapshotSlot::new();
        slot.publish(AudioSnapshot::new(0.1, 0.2, 0.3));
        slot.publish(AudioSnapshot::new(0.4, 0.5, 0.6));
        assert_eq!(slot.latest(), AudioSnapshot::new(0.4, 0.5, 0.6));
        assert_eq!(slot.latest(), slot.latest());
    }

    #[test]
    fn channel_source_regroups_chunks() {
        let (tx, mut source) = sample_channel(8);
        assert!(tx.push(vec![1.0, 2.0, 3.0]));
        assert!(tx.push(vec![4.0, 5.0]));

        let mut block = [0.0; 4];
        assert_eq!(source.read_block(&mut block).unwrap(), BlockRead::Full);
        assert_eq!(block, [1.0, 2.0, 3.0, 4.0]);

        let mut source = source.with_timeout(Duration::from_millis(10));
        assert_eq!(source.read_block(&mut block).unwrap(), BlockRead::Pending);
        drop(tx);
        assert_eq!(source.read_block(&mut block).unwrap(), BlockRead::Closed);
    }

    #[test]
    fn capture_thread_publishes_band_levels() {
        let (tx, source) = sample_channel(16);
        let mut signal = AudioSignalSource::with_source(source, &config(1024));
        assert_eq!(signal.state(), &CaptureState::Running);

        let tone: Vec<f32> = (0..1024)
            .map(|i| (2.0 * PI * 4.0 * i as f32 / 1024.0).sin())
            .collect();
        assert!(tx.push(tone));

        assert!(wait_for(|| signal.latest().bass > 0.9));
        signal.stop();
        assert_eq!(signal.state(), &CaptureState::Stopped);
        assert_eq!(signal.latest(), AudioSnapshot::SILENT);
    }

    #[test]
    fn stop_joins_an_idle_capture_thread() {
        let (_tx, source) = sample_channel(1);
        let mut signal = AudioSignalSource::with_source(source, &config(256));
        let started = Instant::now();
        signal.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn disabled_source_reads_silence() {
        let signal = AudioSignalSource::disabled("no device");
        assert!(matches!(signal.state(), CaptureState::Disabled(_)));
        assert_eq!(signal.latest(), AudioSnapshot::SILENT);
    }

    #[cfg(not(feature = "capture"))]
    #[test]
    fn start_without_capture_support_is_disabled() {
        let signal = AudioSignalSource::start(&AudioConfig::default());
        assert!(matches!(signal.state(), CaptureState::Disabled(_)));
    }
}
