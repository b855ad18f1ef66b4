use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::warn;

use crate::error::{Error, Result};

mod detect;
mod ring;

pub(crate) use self::detect::RateDetector;
pub(crate) use self::ring::SampleRing;

/// 32 Ki interleaved samples = 64 KiB.
const RING_CAPACITY: usize = 32 * 1024;

/// Unit volume in Q8 fixed point.
const VOLUME_UNIT: u32 = 256;

/// Target queue depth: 50 ms of stereo audio at the detected rate.
const LATENCY_CAP_MS: u64 = 50;

/// Per-pair decay factor numerator on underrun (denominator 16).
const FADE_NUM: i32 = 15;

/// After this many consecutive missing stereo pairs, output hard silence.
const FADE_LIMIT: u32 = 64;

/// Pipeline state shared between the core's audio callback (producer), the
/// platform playback callback (consumer) and the scheduler (detection).
pub(crate) struct AudioShared {
    pub ring: SampleRing,
    volume: AtomicU32,
    muted: AtomicBool,
    enabled: AtomicBool,
    /// Cumulative video frames, bumped by the pixel converter; anchors
    /// sample-rate detection.
    pub video_frames: AtomicU64,
    /// Cumulative stereo frames accepted from the core.
    pub stereo_frames_in: AtomicU64,
    detected_rate: AtomicU32,
    /// Stereo frames the sink asks for per callback; sizes the latency floor.
    sink_request: AtomicU32,
    overflows: AtomicU64,
    underruns: AtomicU64,
}

/// Client-facing diagnostics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStats {
    pub detected_rate: u32,
    pub queued_samples: usize,
    pub overflows: u64,
    pub underruns: u64,
}

impl AudioShared {
    pub fn new() -> Self {
        Self {
            ring: SampleRing::new(RING_CAPACITY),
            volume: AtomicU32::new(VOLUME_UNIT),
            muted: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            video_frames: AtomicU64::new(0),
            stereo_frames_in: AtomicU64::new(0),
            detected_rate: AtomicU32::new(0),
            sink_request: AtomicU32::new(0),
            overflows: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
        }
    }

    pub fn set_volume(&self, volume: f32) {
        let q8 = (volume.clamp(0.0, 1.0) * VOLUME_UNIT as f32) as u32;
        self.volume.store(q8, Ordering::Relaxed);
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_detected_rate(&self, rate: u32) {
        self.detected_rate.store(rate, Ordering::Relaxed);
    }

    pub fn detected_rate(&self) -> u32 {
        self.detected_rate.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> AudioStats {
        AudioStats {
            detected_rate: self.detected_rate(),
            queued_samples: self.ring.queued(),
            overflows: self.overflows.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
        }
    }

    /// Reset the per-game counters. Called on every game load.
    pub fn reset_for_game(&self, reported_rate: f64) {
        self.ring.clear();
        self.video_frames.store(0, Ordering::Relaxed);
        self.stereo_frames_in.store(0, Ordering::Relaxed);
        self.overflows.store(0, Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);

        let initial = if (8_000.0..=192_000.0).contains(&reported_rate) {
            reported_rate.round() as u32
        } else {
            0
        };
        self.detected_rate.store(initial, Ordering::Relaxed);
    }

    /// Producer path: scale a stereo-interleaved batch by the current
    /// volume into `scratch`, shed latency if the queue is over the cap,
    /// then append to the ring.
    pub fn push_batch(&self, samples: &[i16], scratch: &mut Vec<i16>) {
        let stereo_frames = samples.len() / 2;
        self.stereo_frames_in
            .fetch_add(stereo_frames as u64, Ordering::Relaxed);

        scratch.clear();
        if self.muted.load(Ordering::Relaxed) {
            scratch.resize(samples.len(), 0);
        } else {
            let volume = self.volume.load(Ordering::Relaxed) as i32;
            scratch.extend(
                samples
                    .iter()
                    .map(|&s| ((s as i32 * volume) >> 8) as i16),
            );
        }

        let cap = self.latency_cap_samples();
        if self.ring.queued() > cap {
            self.ring.catch_up(cap / 2);
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }

        // A batch bigger than the remaining space still carves out room;
        // newest audio wins.
        if scratch.len() > self.ring.free() {
            let keep = (self.ring.capacity() - 1).saturating_sub(scratch.len());
            self.ring.catch_up(keep);
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }

        self.ring.push(scratch);
    }

    /// Interleaved-sample cap: 50 ms at the detected rate, floored at four
    /// sink callbacks so tiny periods never thrash.
    fn latency_cap_samples(&self) -> usize {
        let rate = match self.detected_rate() {
            0 => 32_768,
            rate => rate,
        } as u64;
        let cap = rate * 2 * LATENCY_CAP_MS / 1000;
        let floor = self.sink_request.load(Ordering::Relaxed) as u64 * 2 * 4;

        cap.max(floor).min(RING_CAPACITY as u64 - 1) as usize
    }
}

/// Underrun-masking state carried across playback callbacks.
struct SinkState {
    primed: bool,
    last: [i16; 2],
    misses: u32,
}

impl SinkState {
    fn new() -> Self {
        Self {
            primed: false,
            last: [0; 2],
            misses: 0,
        }
    }
}

/// One playback callback: copy from the ring, fading out on underrun.
///
/// Until the ring holds a full callback of audio the sink stays silent
/// (pre-buffer); afterwards short misses repeat the last sample pair
/// attenuated by 15/16 per pair, reaching hard silence after 64 pairs.
fn fill_output(shared: &AudioShared, state: &mut SinkState, data: &mut [i16]) {
    let frames = data.len() / 2;
    shared
        .sink_request
        .store(frames as u32, Ordering::Relaxed);

    if !state.primed {
        if shared.ring.queued() < data.len() {
            data.fill(0);
            return;
        }
        state.primed = true;
    }

    let got = shared.ring.pop_into(data);

    if got >= 2 {
        state.last = [data[got - 2], data[got - 1]];
        state.misses = 0;
    }

    if got == data.len() {
        return;
    }

    shared.underruns.fetch_add(1, Ordering::Relaxed);

    for pair in data[got..].chunks_mut(2) {
        if state.misses >= FADE_LIMIT {
            state.last = [0; 2];
        } else {
            state.last[0] = ((state.last[0] as i32 * FADE_NUM) / 16) as i16;
            state.last[1] = ((state.last[1] as i32 * FADE_NUM) / 16) as i16;
            state.misses += 1;
        }

        pair[0] = state.last[0];
        if pair.len() > 1 {
            pair[1] = state.last[1];
        }
    }
}

/// Platform playback stream at a fixed sample rate. Owned by the scheduler
/// thread (`cpal::Stream` is not `Send`); dropping it stops playback.
pub(crate) struct AudioSink {
    _stream: cpal::Stream,
    rate: u32,
}

impl AudioSink {
    pub fn open(shared: Arc<AudioShared>, rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no default output device".into()))?;

        let config = cpal::StreamConfig {
            channels: 2,
            sample_rate: rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let mut state = SinkState::new();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    fill_output(&shared, &mut state, data);
                },
                |err| warn!("audio stream error: {err}"),
                None,
            )
            .map_err(|err| Error::Audio(err.to_string()))?;

        stream
            .play()
            .map_err(|err| Error::Audio(err.to_string()))?;

        Ok(Self {
            _stream: stream,
            rate,
        })
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> AudioShared {
        let shared = AudioShared::new();
        shared.set_detected_rate(32_768);
        shared
    }

    #[test]
    fn volume_scales_in_fixed_point() {
        let shared = shared();
        let mut scratch = Vec::new();

        shared.set_volume(0.5);
        shared.push_batch(&[1000, -1000], &mut scratch);

        let mut out = [0i16; 2];
        shared.ring.pop_into(&mut out);
        assert_eq!(out, [500, -500]);
    }

    #[test]
    fn mute_zeroes_the_batch() {
        let shared = shared();
        let mut scratch = Vec::new();

        shared.set_muted(true);
        shared.push_batch(&[1000, -1000], &mut scratch);

        let mut out = [0i16; 2];
        shared.ring.pop_into(&mut out);
        assert_eq!(out, [0, 0]);
    }

    #[test]
    fn overflow_sheds_to_half_the_cap() {
        let shared = shared();
        let mut scratch = Vec::new();
        let cap = shared.latency_cap_samples();

        let batch = vec![1i16; cap + 2];
        shared.push_batch(&batch, &mut scratch);
        shared.push_batch(&[2, 2], &mut scratch);

        assert!(shared.ring.queued() <= cap / 2 + 4);
        assert_eq!(shared.stats().overflows, 1);
    }

    #[test]
    fn prebuffer_outputs_silence_until_filled() {
        let shared = shared();
        let mut state = SinkState::new();
        let mut scratch = Vec::new();
        let mut out = [7i16; 8];

        shared.push_batch(&[1, 1], &mut scratch);
        fill_output(&shared, &mut state, &mut out);

        assert_eq!(out, [0; 8]);
        assert!(!state.primed);
    }

    #[test]
    fn underrun_fades_geometrically() {
        let shared = shared();
        let mut state = SinkState::new();
        let mut scratch = Vec::new();

        // Prime with exactly one callback of audio, then starve.
        shared.push_batch(&[1600; 8], &mut scratch);
        let mut out = [0i16; 8];
        fill_output(&shared, &mut state, &mut out);
        assert_eq!(out, [1600; 8]);

        fill_output(&shared, &mut state, &mut out);
        assert_eq!(out[0], 1500); // 1600 * 15/16
        assert_eq!(out[2], 1406); // 1500 * 15/16
        assert!(out[2] < out[0]);
    }

    #[test]
    fn long_underrun_reaches_hard_silence() {
        let shared = shared();
        let mut state = SinkState::new();
        let mut scratch = Vec::new();

        shared.push_batch(&[i16::MAX; 4], &mut scratch);
        let mut prime = [0i16; 4];
        fill_output(&shared, &mut state, &mut prime);

        let mut out = [0i16; 2];
        for _ in 0..=FADE_LIMIT {
            fill_output(&shared, &mut state, &mut out);
        }

        assert_eq!(out, [0, 0]);
    }

    #[test]
    fn reset_for_game_prefers_a_sane_reported_rate() {
        let shared = shared();

        shared.reset_for_game(48_000.0);
        assert_eq!(shared.detected_rate(), 48_000);

        shared.reset_for_game(1_000_000.0);
        assert_eq!(shared.detected_rate(), 0);
    }
}
