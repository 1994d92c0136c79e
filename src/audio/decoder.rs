use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
};

use ringbuf::{
    traits::{Observer as _, Producer as _, Split},
    HeapRb,
};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo, Track as MediaTrack},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
    units::Time,
};

use crate::error::{Error, Result};

/// Stereo f32 samples buffered ahead of the render thread (~3 s at 44.1 kHz)
const RING_CAPACITY: usize = 44100 * 2 * 3;

/// Consumer side of one decode, owned by a deck on the render thread.
pub struct DecoderHandle {
    pub consumer: ringbuf::HeapCons<f32>,
    pub stop_flag: Arc<AtomicBool>,
    /// Set when the decode thread reaches EOF or a fatal error.
    pub decode_done: Arc<AtomicBool>,
    pub frames_written: Arc<AtomicU64>,
    /// Frames in the file, 0 when the container does not say.
    pub total_frames: u64,
    pub sample_rate: u32,
}

impl DecoderHandle {
    pub fn duration_ms(&self) -> Option<u64> {
        if self.sample_rate == 0 || self.total_frames == 0 {
            return None;
        }
        Some(self.total_frames * 1000 / self.sample_rate as u64)
    }

    /// The decoder has finished and everything it produced was consumed.
    pub fn drained(&self) -> bool {
        self.decode_done.load(Ordering::Acquire) && self.consumer.is_empty()
    }
}

impl Drop for DecoderHandle {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

/// Probe `path` and spawn a background decode thread feeding a ring buffer.
///
/// Probing happens on the caller's thread so an unreadable file fails the
/// load immediately instead of producing a silent deck.
pub fn spawn_decoder(path: PathBuf, seek_ms: Option<u64>) -> Result<DecoderHandle> {
    let (format, track) = open_format(&path)?;
    let sample_rate = track.codec_params.sample_rate.unwrap_or(44100);
    let total_frames = track.codec_params.n_frames.unwrap_or(0);

    let rb = HeapRb::<f32>::new(RING_CAPACITY);
    let (mut producer, consumer) = rb.split();

    let stop_flag = Arc::new(AtomicBool::new(false));
    let decode_done = Arc::new(AtomicBool::new(false));
    let frames_written = Arc::new(AtomicU64::new(0));

    let handle = DecoderHandle {
        consumer,
        stop_flag: Arc::clone(&stop_flag),
        decode_done: Arc::clone(&decode_done),
        frames_written: Arc::clone(&frames_written),
        total_frames,
        sample_rate,
    };

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    thread::Builder::new()
        .name(format!("dec:{name}"))
        .spawn(move || {
            let ctx = DecodeCtx {
                producer: &mut producer,
                stop_flag: &stop_flag,
                frames_written: &frames_written,
            };
            if let Err(e) = decode_loop(format, &track, seek_ms, ctx) {
                log::warn!("Decoder for {name} exited: {e}");
            }
            decode_done.store(true, Ordering::Release);
        })
        .map_err(|e| Error::Decode(format!("failed to spawn decoder thread: {e}")))?;

    Ok(handle)
}

fn open_format(path: &Path) -> Result<(Box<dyn FormatReader>, MediaTrack)> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Decode(format!("cannot open {}: {e}", path.display())))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| Error::Decode(format!("probe failed for {}: {e}", path.display())))?;
    let track = probed
        .format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .cloned()
        .ok_or_else(|| Error::Decode(format!("no audio track in {}", path.display())))?;
    Ok((probed.format, track))
}

struct DecodeCtx<'a> {
    producer: &'a mut ringbuf::HeapProd<f32>,
    stop_flag: &'a AtomicBool,
    frames_written: &'a AtomicU64,
}

fn decode_loop(
    mut format: Box<dyn FormatReader>,
    track: &MediaTrack,
    seek_ms: Option<u64>,
    ctx: DecodeCtx<'_>,
) -> Result<()> {
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| Error::Decode(format!("codec init: {e}")))?;

    if let Some(ms) = seek_ms {
        let time = Time::from(ms as f64 / 1000.0);
        if let Err(e) = format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(track.id),
            },
        ) {
            log::warn!("Seek to {ms} ms failed: {e}");
        }
    }

    let mut samples: Option<SampleBuffer<f32>> = None;

    loop {
        if ctx.stop_flag.load(Ordering::Relaxed) {
            break;
        }
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => return Err(Error::Decode(format!("format read: {e}"))),
        };
        if packet.track_id() != track.id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                log::debug!("Skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(Error::Decode(format!("decode: {e}"))),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let needed = decoded.capacity() as u64;
        let buf = match samples.as_mut() {
            Some(b) if b.capacity() as u64 >= needed * channels as u64 => b,
            _ => samples.insert(SampleBuffer::<f32>::new(needed, spec)),
        };
        buf.copy_interleaved_ref(decoded);

        let pushed = push_stereo(buf.samples(), channels, ctx.producer, ctx.stop_flag);
        ctx.frames_written.fetch_add(pushed as u64, Ordering::Relaxed);
    }
    Ok(())
}

/// Push interleaved samples as stereo frames. Mono is duplicated, extra
/// channels are dropped. Returns frames pushed.
fn push_stereo(
    interleaved: &[f32],
    channels: usize,
    producer: &mut ringbuf::HeapProd<f32>,
    stop_flag: &AtomicBool,
) -> usize {
    let mut written = 0;
    for frame in interleaved.chunks_exact(channels) {
        let l = frame[0];
        let r = if channels > 1 { frame[1] } else { frame[0] };
        // Both halves of a frame go in together or the stream desyncs.
        loop {
            if stop_flag.load(Ordering::Relaxed) {
                return written;
            }
            if producer.vacant_len() >= 2 {
                let _ = producer.try_push(l);
                let _ = producer.try_push(r);
                break;
            }
            thread::yield_now();
        }
        written += 1;
    }
    written
}
