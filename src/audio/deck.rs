use std::path::PathBuf;

use ringbuf::traits::Consumer as _;
use serde::{Deserialize, Serialize};

use super::{
    crossfade::DeckId,
    decoder::{spawn_decoder, DecoderHandle},
};
use crate::error::{Error, Result};

/// Playback state of one output slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeckState {
    Idle,
    Ready,
    Playing,
    Paused,
    Stopped,
}

/// Per-deck playback control and state.
///
/// The deck does not own an audio output thread. The cpal callback calls
/// `fill_buffer()` each time it needs audio.
pub struct Deck {
    pub id: DeckId,
    pub state: DeckState,
    decoder: Option<DecoderHandle>,
    pub file_path: Option<PathBuf>,
    pub sample_rate: u32,
    /// Frames actually pulled from the decoder. Underruns do not count.
    pub frames_consumed: u64,
    /// Gain applied during mix (0.0 – 1.0), driven by the engine's ramps.
    pub gain: f32,
}

impl Deck {
    pub fn new(id: DeckId) -> Self {
        Self {
            id,
            state: DeckState::Idle,
            decoder: None,
            file_path: None,
            sample_rate: 44100,
            frames_consumed: 0,
            gain: 1.0,
        }
    }

    /// Install an already-probed decoder. Any previous track is dropped.
    pub fn install(&mut self, path: PathBuf, handle: DecoderHandle) -> Option<u64> {
        self.decoder = None;
        self.sample_rate = handle.sample_rate;
        let duration = handle.duration_ms();
        self.decoder = Some(handle);
        self.file_path = Some(path);
        self.frames_consumed = 0;
        self.state = DeckState::Ready;
        duration
    }

    /// Seek by restarting the decoder at the target position.
    pub fn seek(&mut self, position_ms: u64) -> Result<()> {
        let path = self
            .file_path
            .clone()
            .ok_or_else(|| Error::InvalidState(format!("{} has no track loaded", self.id)))?;
        let handle = spawn_decoder(path, Some(position_ms))?;
        self.sample_rate = handle.sample_rate;
        self.decoder = Some(handle);
        self.frames_consumed = position_ms * self.sample_rate as u64 / 1000;
        if self.state == DeckState::Stopped || self.state == DeckState::Idle {
            self.state = DeckState::Ready;
        }
        Ok(())
    }

    pub fn play(&mut self) {
        if matches!(self.state, DeckState::Ready | DeckState::Paused) {
            self.state = DeckState::Playing;
        }
    }

    pub fn pause(&mut self) {
        if self.state == DeckState::Playing {
            self.state = DeckState::Paused;
        }
    }

    pub fn stop(&mut self) {
        self.decoder = None;
        self.file_path = None;
        self.state = DeckState::Stopped;
        self.frames_consumed = 0;
    }

    pub fn position_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.frames_consumed * 1000 / self.sample_rate as u64
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.decoder.as_ref().and_then(|d| d.duration_ms())
    }

    /// The decoder has run dry: natural end of the track.
    pub fn is_eof(&self) -> bool {
        match &self.decoder {
            Some(d) => d.drained(),
            None => self.state != DeckState::Idle,
        }
    }

    /// Fill `output` with interleaved stereo f32 samples, scaled by `self.gain`.
    /// Zeros are written for any frames the ring buffer cannot supply.
    ///
    /// Called on the real-time audio thread: no allocations, no locks.
    pub fn fill_buffer(&mut self, output: &mut [f32]) {
        if self.state != DeckState::Playing {
            output.fill(0.0);
            return;
        }
        let decoder = match &mut self.decoder {
            Some(d) => d,
            None => {
                output.fill(0.0);
                return;
            }
        };

        let mut popped = 0;
        while popped < output.len() {
            match decoder.consumer.try_pop() {
                Some(s) => {
                    output[popped] = s * self.gain;
                    popped += 1;
                }
                None => {
                    output[popped..].fill(0.0);
                    break;
                }
            }
        }
        self.frames_consumed += (popped / 2) as u64;
    }
}
