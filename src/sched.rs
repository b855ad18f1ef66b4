use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::audio::{AudioShared, AudioSink, RateDetector};
use crate::cheevos::CheevosBridge;
use crate::core::{callbacks, Api};
use crate::rewind::RewindRing;
use crate::video::{Snapshot, SurfaceSlot};

/// One emulated frame at the handheld's native 59.7275 Hz.
pub(crate) const BASE_FRAME_NS: u64 = 16_742_706;

/// The ~60 Hz display signal period.
pub(crate) const DISPLAY_NS: u64 = 16_666_667;

/// Emulation frames allowed per loop iteration; bounds catch-up and the
/// shutdown latency.
const MAX_BURST: u32 = 8;

/// Accumulated emulation debt beyond this many target frames is forgiven
/// (a long pause must not fast-forward).
const SPIRAL_LIMIT: u64 = 10;

/// Display debt is capped at this many periods after a signal.
const DISPLAY_CLAMP: u64 = 3;

/// Below this, yielding beats sleeping.
const MIN_SLEEP_NS: u64 = 500_000;

const FPS_WINDOW: Duration = Duration::from_millis(500);

/// Cross-thread control scalars, all latest-wins.
///
/// `running` is the thread's start/stop fence (acquire/release); the rest
/// are relaxed since per-iteration freshness is all the loop needs.
pub(crate) struct Vitals {
    pub running: AtomicBool,
    pub speed_pct: AtomicU32,
    pub fps_x100: AtomicU32,
    pub rewind_enabled: AtomicBool,
    pub rewind_interval: AtomicU32,
    pub cheevos_enabled: AtomicBool,
}

impl Vitals {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            speed_pct: AtomicU32::new(100),
            fps_x100: AtomicU32::new(0),
            rewind_enabled: AtomicBool::new(false),
            rewind_interval: AtomicU32::new(30),
            cheevos_enabled: AtomicBool::new(false),
        }
    }
}

/// Dual-accumulator frame pacing, separated from the thread so it is
/// testable against a fake clock. One accumulator owes emulation frames
/// at the speed-scaled target period, the other owes ~60 Hz display
/// signals; both drain as work is done.
pub(crate) struct Pacer {
    emu_accum: u64,
    display_accum: u64,
}

impl Pacer {
    pub fn new() -> Self {
        Self {
            emu_accum: 0,
            display_accum: 0,
        }
    }

    pub fn target_ns(speed_pct: u32) -> u64 {
        BASE_FRAME_NS * 100 / speed_pct.clamp(25, 800) as u64
    }

    pub fn advance(&mut self, elapsed_ns: u64) {
        self.emu_accum += elapsed_ns;
        self.display_accum += elapsed_ns;
    }

    /// Consume one emulation frame's worth of debt, if owed.
    pub fn take_emu_frame(&mut self, target_ns: u64) -> bool {
        if self.emu_accum >= target_ns {
            self.emu_accum -= target_ns;
            true
        } else {
            false
        }
    }

    /// Forgive runaway debt after a stall.
    pub fn settle(&mut self, target_ns: u64) {
        if self.emu_accum > SPIRAL_LIMIT * target_ns {
            self.emu_accum = 0;
        }
    }

    /// Consume one display period, clamping leftover debt so a stall never
    /// bursts signals.
    pub fn take_display(&mut self) -> bool {
        if self.display_accum < DISPLAY_NS {
            return false;
        }

        self.display_accum -= DISPLAY_NS;
        self.display_accum = self.display_accum.min(DISPLAY_CLAMP * DISPLAY_NS);

        true
    }

    /// Nanoseconds until the next deadline of either clock.
    pub fn sleep_ns(&self, target_ns: u64) -> u64 {
        let emu = target_ns.saturating_sub(self.emu_accum);
        let display = DISPLAY_NS.saturating_sub(self.display_accum);

        emu.min(display)
    }
}

/// Everything the scheduler thread owns or shares.
pub(crate) struct SchedulerCtx {
    pub api: Arc<Api>,
    pub exec: Arc<Mutex<()>>,
    pub vitals: Arc<Vitals>,
    pub audio: Arc<AudioShared>,
    pub snapshot: Arc<Mutex<Snapshot>>,
    pub surface: Arc<Mutex<SurfaceSlot>>,
    pub rewind: Arc<Mutex<Option<RewindRing>>>,
    pub cheevos: Arc<Mutex<CheevosBridge>>,
    pub reported_rate: f64,
    pub on_display: Box<dyn FnMut() + Send>,
}

pub(crate) fn spawn(ctx: SchedulerCtx) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("frame-scheduler".into())
        .spawn(move || run_loop(ctx))
}

fn run_loop(mut ctx: SchedulerCtx) {
    let mut pacer = Pacer::new();
    let mut detector = RateDetector::new(ctx.reported_rate);
    // The playback stream lives on this thread: cpal streams are not Send.
    let mut sink: Option<AudioSink> = None;

    let mut last = Instant::now();
    let mut fps_anchor = last;
    let mut fps_frames = 0u64;
    let mut total_frames = 0u64;

    while ctx.vitals.running.load(Ordering::Acquire) {
        let now = Instant::now();
        let elapsed = now.duration_since(last).as_nanos() as u64;
        last = now;

        let target = Pacer::target_ns(ctx.vitals.speed_pct.load(Ordering::Relaxed));
        pacer.advance(elapsed);

        let mut ran = 0u32;
        if pacer.emu_accum >= target {
            let _exec = ctx.exec.lock();

            while ran < MAX_BURST && pacer.take_emu_frame(target) {
                ctx.api.run();
                ran += 1;
                total_frames += 1;
                fps_frames += 1;

                step_hooks(&ctx, total_frames);
            }
        }
        pacer.settle(target);

        maintain_sink(&ctx, &mut detector, &mut sink);

        if ran > 0 && pacer.take_display() {
            publish_frame(&mut ctx);
        }

        let fps_elapsed = fps_anchor.elapsed();
        if fps_elapsed >= FPS_WINDOW {
            let fps_x100 = fps_frames * 100_000 / fps_elapsed.as_millis().max(1) as u64;
            ctx.vitals
                .fps_x100
                .store(fps_x100 as u32, Ordering::Relaxed);
            fps_anchor = Instant::now();
            fps_frames = 0;
        }

        let sleep = pacer.sleep_ns(target);
        if sleep > MIN_SLEEP_NS {
            thread::sleep(Duration::from_nanos(sleep));
        } else {
            thread::yield_now();
        }
    }

    debug!(total_frames, "scheduler stopped");
}

/// Per-frame side work, run with the execution lock held.
fn step_hooks(ctx: &SchedulerCtx, total_frames: u64) {
    if ctx.vitals.rewind_enabled.load(Ordering::Relaxed) {
        let interval = ctx.vitals.rewind_interval.load(Ordering::Relaxed).max(1) as u64;

        if total_frames % interval == 0 {
            if let Some(ring) = ctx.rewind.lock().as_mut() {
                let api = &ctx.api;
                if let Err(err) = ring.push(|buf| api.serialize(buf)) {
                    error!(%err, "rewind capture failed");
                }
            }
        }
    }

    if ctx.vitals.cheevos_enabled.load(Ordering::Relaxed) {
        ctx.cheevos.lock().do_frame();
    }
}

/// Keep the playback sink matched to the detected rate. Open, rebuild and
/// drop all happen here so the `!Send` stream never leaves this thread.
fn maintain_sink(ctx: &SchedulerCtx, detector: &mut RateDetector, sink: &mut Option<AudioSink>) {
    if !ctx.audio.enabled() {
        *sink = None;
        return;
    }

    let frames = ctx.audio.video_frames.load(Ordering::Relaxed);
    let samples = ctx.audio.stereo_frames_in.load(Ordering::Relaxed);

    let wanted = match detector.poll(frames, samples) {
        Some(rate) => Some(rate),
        None => match (&*sink, detector.rate()) {
            // A previously failed open retries at the settled rate.
            (None, Some(rate)) => Some(rate),
            _ => None,
        },
    };

    let Some(rate) = wanted else {
        return;
    };

    if sink.as_ref().is_some_and(|s| s.rate() == rate) {
        return;
    }

    ctx.audio.set_detected_rate(rate);
    // Drop the old stream before opening the device at the new rate.
    *sink = None;
    match AudioSink::open(ctx.audio.clone(), rate) {
        Ok(new_sink) => {
            debug!(rate, "audio sink initialized");
            *sink = Some(new_sink);
        }
        Err(err) => error!(%err, rate, "audio sink unavailable"),
    }
}

fn publish_frame(ctx: &mut SchedulerCtx) {
    callbacks::with_host(|host| {
        ctx.snapshot.lock().copy_from(&host.frame);
        ctx.surface.lock().blit(&host.frame);
    });

    (ctx.on_display)();
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive the pacer against a virtual clock for `seconds`, advancing by
    /// exactly what the loop would sleep.
    fn simulate_frames(speed_pct: u32, seconds: u64) -> u64 {
        let target = Pacer::target_ns(speed_pct);
        let total_ns = seconds * 1_000_000_000;
        let mut pacer = Pacer::new();
        let mut clock = 0u64;
        let mut frames = 0u64;

        while clock < total_ns {
            let mut ran = 0;
            while ran < MAX_BURST && pacer.take_emu_frame(target) {
                frames += 1;
                ran += 1;
            }
            pacer.settle(target);
            if ran > 0 {
                pacer.take_display();
            }

            let step = pacer.sleep_ns(target).clamp(100_000, 4_000_000);
            pacer.advance(step);
            clock += step;
        }

        frames
    }

    #[test]
    fn frame_rate_tracks_the_speed_multiplier() {
        for speed in [25u32, 50, 100, 200, 800] {
            let seconds = 2u64;
            let frames = simulate_frames(speed, seconds);
            let nominal = seconds * 60 * speed as u64 / 100;

            assert!(
                frames >= nominal - 8 && frames <= nominal + 8,
                "speed {speed}%: ran {frames} frames, nominal {nominal}"
            );
        }
    }

    #[test]
    fn speed_is_clamped_to_the_supported_range() {
        assert_eq!(Pacer::target_ns(0), Pacer::target_ns(25));
        assert_eq!(Pacer::target_ns(10_000), Pacer::target_ns(800));
        assert!(Pacer::target_ns(25) > Pacer::target_ns(100));
    }

    #[test]
    fn long_stall_is_forgiven_not_fast_forwarded() {
        let target = Pacer::target_ns(100);
        let mut pacer = Pacer::new();

        // Two seconds of stall, then one iteration.
        pacer.advance(2_000_000_000);
        let mut ran = 0;
        while ran < MAX_BURST && pacer.take_emu_frame(target) {
            ran += 1;
        }
        pacer.settle(target);

        assert_eq!(ran, MAX_BURST);
        assert_eq!(pacer.emu_accum, 0);
    }

    #[test]
    fn display_debt_is_clamped() {
        let mut pacer = Pacer::new();

        pacer.advance(20 * DISPLAY_NS);
        assert!(pacer.take_display());
        assert!(pacer.display_accum <= DISPLAY_CLAMP * DISPLAY_NS);
    }

    #[test]
    fn sleep_hint_tracks_the_nearer_deadline() {
        let target = Pacer::target_ns(100);
        let pacer = Pacer::new();

        assert_eq!(pacer.sleep_ns(target), DISPLAY_NS.min(target));
    }
}
