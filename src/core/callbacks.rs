use std::ffi::{c_uint, c_void, CString};
use std::path::Path;
use std::slice;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use libretro_sys::PixelFormat;
use parking_lot::Mutex;
use tracing::warn;

use crate::audio::AudioShared;
use crate::core::environment::{self, CoreQuirks, HostVariables};
use crate::core::memory_map::MemoryMap;
use crate::input::{Keypad, DEVICE_ID_JOYPAD_MASK};
use crate::video::{infer_format, FrameBuffer, PaletteConfig};

// Libretro cores are single-instance, so the static callbacks reach host
// state through one process-global slot. Callbacks fire on whichever
// thread is inside the core (scheduler in steady state, client during
// load), hence a mutex rather than the per-thread state a pure frontend
// could get away with. The lock is never held across a retro_* call, so
// callbacks re-entering here cannot deadlock.
static HOST: Mutex<Option<HostBindings>> = Mutex::new(None);

/// Everything the core's callbacks touch.
pub(crate) struct HostBindings {
    pub pixel_format: PixelFormat,
    pub format_set: bool,
    pub frame: FrameBuffer,
    pub palette: PaletteConfig,
    pub audio: Arc<AudioShared>,
    pub keypad: Arc<Keypad>,
    pub memory: MemoryMap,
    pub vars: HostVariables,
    pub quirks: CoreQuirks,
    pub save_dir_c: CString,
    scratch: Vec<i16>,
}

impl HostBindings {
    pub fn new(
        audio: Arc<AudioShared>,
        keypad: Arc<Keypad>,
        core_path: &Path,
        save_dir: &Path,
    ) -> Self {
        // A NUL in the path would be the client's bug; an empty directory
        // string degrades to "no directory defined" on the core side.
        let save_dir_c = CString::new(save_dir.to_string_lossy().as_bytes()).unwrap_or_default();

        Self {
            pixel_format: PixelFormat::ARGB1555,
            format_set: false,
            frame: FrameBuffer::new(),
            palette: PaletteConfig::disabled(),
            audio,
            keypad,
            memory: MemoryMap::empty(),
            vars: HostVariables::new(),
            quirks: CoreQuirks::from_library_path(core_path),
            save_dir_c,
            scratch: Vec::new(),
        }
    }

    /// Per-game reset: the map is rebuilt by the next load, the frame
    /// buffer keeps its capacity (grow-only), the format survives until
    /// the core says otherwise.
    pub fn reset_for_game(&mut self) {
        self.memory = MemoryMap::empty();
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self::new(
            Arc::new(AudioShared::new()),
            Arc::new(Keypad::new()),
            Path::new("test_core.so"),
            Path::new("."),
        )
    }
}

pub(crate) fn install(bindings: HostBindings) {
    *HOST.lock() = Some(bindings);
}

pub(crate) fn clear() {
    *HOST.lock() = None;
}

/// Run `f` against the installed host, if any. This is the only door the
/// rest of the crate uses to reach callback-owned state.
pub(crate) fn with_host<R>(f: impl FnOnce(&mut HostBindings) -> R) -> Option<R> {
    HOST.lock().as_mut().map(f)
}

pub(crate) unsafe extern "C" fn environment(cmd: c_uint, data: *mut c_void) -> bool {
    match HOST.lock().as_mut() {
        Some(host) => environment::dispatch(host, cmd, data),
        None => false,
    }
}

pub(crate) unsafe extern "C" fn video_refresh(
    data: *const c_void,
    width: c_uint,
    height: c_uint,
    pitch: usize,
) {
    let mut guard = HOST.lock();
    let Some(host) = guard.as_mut() else {
        return;
    };

    // Every refresh is one 60 Hz tick for rate detection, dupes included.
    host.audio.video_frames.fetch_add(1, Ordering::Relaxed);

    if data.is_null() {
        return;
    }

    let (width, height) = (width as usize, height as usize);
    let src = slice::from_raw_parts(data.cast::<u8>(), height * pitch);
    let format = infer_format(host.pixel_format, host.format_set, width, pitch);

    if let Err(err) = host
        .frame
        .convert(src, width, height, pitch, format, &host.palette)
    {
        warn!(%err, width, height, pitch, "dropping frame");
    }
}

pub(crate) unsafe extern "C" fn audio_sample(left: i16, right: i16) {
    let mut guard = HOST.lock();
    let Some(host) = guard.as_mut() else {
        return;
    };

    let samples = [left, right];
    host.audio.push_batch(&samples, &mut host.scratch);
}

pub(crate) unsafe extern "C" fn audio_sample_batch(data: *const i16, frames: usize) -> usize {
    let mut guard = HOST.lock();
    let Some(host) = guard.as_mut() else {
        return frames;
    };

    if data.is_null() {
        return frames;
    }

    let samples = slice::from_raw_parts(data, frames * 2);
    host.audio.push_batch(samples, &mut host.scratch);

    frames
}

pub(crate) unsafe extern "C" fn input_poll() {
    // Input is pulled from the atomic keypad at input_state time.
}

pub(crate) unsafe extern "C" fn input_state(
    port: c_uint,
    device: c_uint,
    index: c_uint,
    id: c_uint,
) -> i16 {
    if port != 0 || index != 0 || device != libretro_sys::DEVICE_JOYPAD {
        return 0;
    }

    let guard = HOST.lock();
    let Some(host) = guard.as_ref() else {
        return 0;
    };

    if id == DEVICE_ID_JOYPAD_MASK {
        host.keypad.collapsed_mask()
    } else {
        host.keypad.state_for(id)
    }
}
