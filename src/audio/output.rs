use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, MutexGuard,
    },
    thread,
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, Stream, StreamConfig,
};

use super::{
    crossfade::DeckId,
    deck::{Deck, DeckState},
    decoder::spawn_decoder,
    mixer::Mixer,
};
use crate::error::{Error, Result};

// ── Output contract ───────────────────────────────────────────────────────────

/// What the engine can observe about one output slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeckSnapshot {
    pub state: DeckState,
    pub position_ms: u64,
    pub duration_ms: Option<u64>,
    /// The slot was playing and its source ran dry.
    pub finished: bool,
}

impl DeckSnapshot {
    pub fn idle() -> Self {
        Self {
            state: DeckState::Idle,
            position_ms: 0,
            duration_ms: None,
            finished: false,
        }
    }
}

/// The real-time output stage the engine drives.
///
/// Calls return quickly: loading probes the file but decoding happens on a
/// background thread.
pub trait AudioOutput: Send + Sync {
    /// Load `locator` into `deck`, replacing whatever was there. Returns the
    /// duration when the container reports one.
    fn load(&self, deck: DeckId, locator: &str) -> Result<Option<u64>>;
    fn play(&self, deck: DeckId) -> Result<()>;
    fn pause(&self, deck: DeckId);
    fn stop(&self, deck: DeckId);
    fn seek(&self, deck: DeckId, position_ms: u64) -> Result<()>;
    fn set_gain(&self, deck: DeckId, gain: f32);
    fn set_master_volume(&self, volume: f32);
    fn snapshot(&self, deck: DeckId) -> DeckSnapshot;
}

// ── cpal implementation ───────────────────────────────────────────────────────

/// State shared by the control side and the cpal callback.
struct RtState {
    deck_a: Deck,
    deck_b: Deck,
    voice: Deck,
    mixer: Mixer,
    // Scratch buffers (avoid alloc in callback)
    buf_deck_a: Vec<f32>,
    buf_deck_b: Vec<f32>,
    buf_voice: Vec<f32>,
    buf_master: Vec<f32>,
}

impl RtState {
    fn deck_mut(&mut self, id: DeckId) -> &mut Deck {
        match id {
            DeckId::DeckA => &mut self.deck_a,
            DeckId::DeckB => &mut self.deck_b,
            DeckId::Voice => &mut self.voice,
        }
    }

    fn deck(&self, id: DeckId) -> &Deck {
        match id {
            DeckId::DeckA => &self.deck_a,
            DeckId::DeckB => &self.deck_b,
            DeckId::Voice => &self.voice,
        }
    }
}

/// cpal-backed output. The stream lives on its own thread because
/// `cpal::Stream` is not `Send` on every platform.
pub struct CpalOutput {
    rt: Arc<Mutex<RtState>>,
    shutdown: Arc<AtomicBool>,
    stream_thread: Option<thread::JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device and start rendering.
    pub fn start(master_volume: f32) -> Result<Self> {
        let rt = Arc::new(Mutex::new(RtState {
            deck_a: Deck::new(DeckId::DeckA),
            deck_b: Deck::new(DeckId::DeckB),
            voice: Deck::new(DeckId::Voice),
            mixer: Mixer::new(master_volume),
            buf_deck_a: Vec::new(),
            buf_deck_b: Vec::new(),
            buf_voice: Vec::new(),
            buf_master: Vec::new(),
        }));
        let shutdown = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let rt_cb = Arc::clone(&rt);
        let shutdown_t = Arc::clone(&shutdown);

        let stream_thread = thread::Builder::new()
            .name("audio-out".into())
            .spawn(move || {
                let stream = match open_stream(rt_cb) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                while !shutdown_t.load(Ordering::Acquire) {
                    thread::park();
                }
                drop(stream);
                log::info!("Audio output stream closed");
            })
            .map_err(|e| Error::AudioOutput(format!("failed to spawn output thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| Error::AudioOutput("output thread exited during startup".into()))??;

        Ok(Self {
            rt,
            shutdown,
            stream_thread: Some(stream_thread),
        })
    }

    fn state(&self) -> MutexGuard<'_, RtState> {
        self.rt.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.stream_thread.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl AudioOutput for CpalOutput {
    fn load(&self, deck: DeckId, locator: &str) -> Result<Option<u64>> {
        let path = PathBuf::from(locator);
        // Probe outside the lock so the callback never waits on file I/O.
        let handle = spawn_decoder(path.clone(), None)?;
        Ok(self.state().deck_mut(deck).install(path, handle))
    }

    fn play(&self, deck: DeckId) -> Result<()> {
        let mut rt = self.state();
        let d = rt.deck_mut(deck);
        d.play();
        if d.state == DeckState::Playing {
            Ok(())
        } else {
            Err(Error::AudioOutput(format!("{deck} has nothing to play ({:?})", d.state)))
        }
    }

    fn pause(&self, deck: DeckId) {
        self.state().deck_mut(deck).pause();
    }

    fn stop(&self, deck: DeckId) {
        self.state().deck_mut(deck).stop();
    }

    fn seek(&self, deck: DeckId, position_ms: u64) -> Result<()> {
        self.state().deck_mut(deck).seek(position_ms)
    }

    fn set_gain(&self, deck: DeckId, gain: f32) {
        self.state().deck_mut(deck).gain = gain.clamp(0.0, 1.0);
    }

    fn set_master_volume(&self, volume: f32) {
        self.state().mixer.master_gain = volume.clamp(0.0, 1.0);
    }

    fn snapshot(&self, deck: DeckId) -> DeckSnapshot {
        let rt = self.state();
        let d = rt.deck(deck);
        DeckSnapshot {
            state: d.state,
            position_ms: d.position_ms(),
            duration_ms: d.duration_ms(),
            finished: d.state == DeckState::Playing && d.is_eof(),
        }
    }
}

fn open_stream(rt: Arc<Mutex<RtState>>) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::AudioOutput("no default audio output device found".into()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| Error::AudioOutput(format!("default config error: {e}")))?;

    log::info!(
        "Audio device: {} | sample rate: {} | channels: {}",
        device.name().unwrap_or_default(),
        supported.sample_rate().0,
        supported.channels()
    );

    let config: StreamConfig = supported.into();
    let stream = build_stream(&device, &config, rt)?;
    stream
        .play()
        .map_err(|e| Error::AudioOutput(format!("stream play error: {e}")))?;
    Ok(stream)
}

fn build_stream(device: &Device, config: &StreamConfig, rt: Arc<Mutex<RtState>>) -> Result<Stream> {
    let channels = config.channels.max(1) as usize;
    device
        .build_output_stream(
            config,
            move |output: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                audio_callback(output, channels, &rt);
            },
            |e| log::error!("cpal stream error: {e}"),
            None,
        )
        .map_err(|e| Error::AudioOutput(format!("build stream error: {e}")))
}

// ── Real-time audio callback ─────────────────────────────────────────────────
//
// Runs on the cpal thread. No blocking locks, no I/O; allocation only when the
// device changes its buffer size.
fn audio_callback(output: &mut [f32], channels: usize, rt: &Mutex<RtState>) {
    // If the control side holds the lock, output silence rather than block.
    let mut guard = match rt.try_lock() {
        Ok(g) => g,
        Err(_) => {
            output.fill(0.0);
            return;
        }
    };
    let rt = &mut *guard;

    let frames = output.len() / channels;
    let stereo_len = frames * 2;
    if rt.buf_master.len() != stereo_len {
        rt.buf_deck_a.resize(stereo_len, 0.0);
        rt.buf_deck_b.resize(stereo_len, 0.0);
        rt.buf_voice.resize(stereo_len, 0.0);
        rt.buf_master.resize(stereo_len, 0.0);
    }

    rt.deck_a.fill_buffer(&mut rt.buf_deck_a);
    rt.deck_b.fill_buffer(&mut rt.buf_deck_b);
    rt.voice.fill_buffer(&mut rt.buf_voice);
    rt.mixer
        .mix_into(&mut rt.buf_master, &rt.buf_deck_a, &rt.buf_deck_b, &rt.buf_voice);

    write_interleaved(output, channels, &rt.buf_master);
}

/// Spread a stereo buffer over the device's channel layout.
fn write_interleaved(output: &mut [f32], channels: usize, stereo: &[f32]) {
    for (frame, lr) in output.chunks_exact_mut(channels).zip(stereo.chunks_exact(2)) {
        match channels {
            1 => frame[0] = 0.5 * (lr[0] + lr[1]),
            _ => {
                frame[0] = lr[0];
                frame[1] = lr[1];
                frame[2..].fill(0.0);
            }
        }
    }
}
