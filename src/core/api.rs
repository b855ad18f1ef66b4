use std::ffi::{c_char, c_uint, c_void};
use std::path::Path;
use std::ptr::null_mut;

use libloading::Library;
use libretro_sys::{GameInfo, SystemAvInfo, SystemInfo};
use tracing::debug;

use crate::error::{Error, Result};

pub(crate) type EnvironmentFn = unsafe extern "C" fn(cmd: c_uint, data: *mut c_void) -> bool;
pub(crate) type VideoRefreshFn =
    unsafe extern "C" fn(data: *const c_void, width: c_uint, height: c_uint, pitch: usize);
pub(crate) type AudioSampleFn = unsafe extern "C" fn(left: i16, right: i16);
pub(crate) type AudioSampleBatchFn = unsafe extern "C" fn(data: *const i16, frames: usize) -> usize;
pub(crate) type InputPollFn = unsafe extern "C" fn();
pub(crate) type InputStateFn =
    unsafe extern "C" fn(port: c_uint, device: c_uint, index: c_uint, id: c_uint) -> i16;

/// The core's resolved symbol table.
///
/// Only `retro_init`, `retro_run` and `retro_load_game` are required;
/// everything else degrades to `None` and the wrappers below gate on it.
///
/// Entry into the core is serialized by the session's execution lock:
/// either the scheduler thread holds it around `retro_run`, or a client
/// call holds it while the scheduler is parked. The wrappers are safe to
/// *call* under that discipline, which is why the struct is shared as-is.
pub(crate) struct Api {
    _library: Library,

    init: unsafe extern "C" fn(),
    run: unsafe extern "C" fn(),
    load_game: unsafe extern "C" fn(*const GameInfo) -> bool,

    deinit: Option<unsafe extern "C" fn()>,
    reset: Option<unsafe extern "C" fn()>,
    unload_game: Option<unsafe extern "C" fn()>,
    serialize_size: Option<unsafe extern "C" fn() -> usize>,
    serialize: Option<unsafe extern "C" fn(*mut c_void, usize) -> bool>,
    unserialize: Option<unsafe extern "C" fn(*const c_void, usize) -> bool>,
    get_system_info: Option<unsafe extern "C" fn(*mut SystemInfo)>,
    get_system_av_info: Option<unsafe extern "C" fn(*mut SystemAvInfo)>,
    get_memory_data: Option<unsafe extern "C" fn(c_uint) -> *mut c_void>,
    get_memory_size: Option<unsafe extern "C" fn(c_uint) -> usize>,

    set_environment: Option<unsafe extern "C" fn(EnvironmentFn)>,
    set_video_refresh: Option<unsafe extern "C" fn(VideoRefreshFn)>,
    set_audio_sample: Option<unsafe extern "C" fn(AudioSampleFn)>,
    set_audio_sample_batch: Option<unsafe extern "C" fn(AudioSampleBatchFn)>,
    set_input_poll: Option<unsafe extern "C" fn(InputPollFn)>,
    set_input_state: Option<unsafe extern "C" fn(InputStateFn)>,
}

impl Api {
    pub unsafe fn load(path: impl AsRef<Path>) -> Result<Self> {
        let library =
            Library::new(path.as_ref()).map_err(|err| Error::Load(err.to_string()))?;

        Ok(Self {
            init: require(&library, "retro_init")?,
            run: require(&library, "retro_run")?,
            load_game: require(&library, "retro_load_game")?,

            deinit: optional(&library, "retro_deinit"),
            reset: optional(&library, "retro_reset"),
            unload_game: optional(&library, "retro_unload_game"),
            serialize_size: optional(&library, "retro_serialize_size"),
            serialize: optional(&library, "retro_serialize"),
            unserialize: optional(&library, "retro_unserialize"),
            get_system_info: optional(&library, "retro_get_system_info"),
            get_system_av_info: optional(&library, "retro_get_system_av_info"),
            get_memory_data: optional(&library, "retro_get_memory_data"),
            get_memory_size: optional(&library, "retro_get_memory_size"),

            set_environment: optional(&library, "retro_set_environment"),
            set_video_refresh: optional(&library, "retro_set_video_refresh"),
            set_audio_sample: optional(&library, "retro_set_audio_sample"),
            set_audio_sample_batch: optional(&library, "retro_set_audio_sample_batch"),
            set_input_poll: optional(&library, "retro_set_input_poll"),
            set_input_state: optional(&library, "retro_set_input_state"),

            _library: library,
        })
    }

    /// Hand the static host callbacks to the core. Absent setters are
    /// silently skipped.
    pub fn register_callbacks(
        &self,
        environment: EnvironmentFn,
        video_refresh: VideoRefreshFn,
        audio_sample: AudioSampleFn,
        audio_sample_batch: AudioSampleBatchFn,
        input_poll: InputPollFn,
        input_state: InputStateFn,
    ) {
        unsafe {
            if let Some(set) = self.set_environment {
                set(environment);
            }
            if let Some(set) = self.set_video_refresh {
                set(video_refresh);
            }
            if let Some(set) = self.set_audio_sample {
                set(audio_sample);
            }
            if let Some(set) = self.set_audio_sample_batch {
                set(audio_sample_batch);
            }
            if let Some(set) = self.set_input_poll {
                set(input_poll);
            }
            if let Some(set) = self.set_input_state {
                set(input_state);
            }
        }
    }

    pub fn init(&self) {
        unsafe { (self.init)() }
    }

    pub fn deinit(&self) {
        if let Some(deinit) = self.deinit {
            unsafe { deinit() }
        }
    }

    pub fn run(&self) {
        unsafe { (self.run)() }
    }

    pub fn reset(&self) {
        if let Some(reset) = self.reset {
            unsafe { reset() }
        }
    }

    pub fn load_game(&self, info: &GameInfo) -> bool {
        unsafe { (self.load_game)(info) }
    }

    pub fn unload_game(&self) {
        if let Some(unload_game) = self.unload_game {
            unsafe { unload_game() }
        }
    }

    pub fn serialize_size(&self) -> usize {
        match self.serialize_size {
            Some(serialize_size) => unsafe { serialize_size() },
            None => 0,
        }
    }

    pub fn serialize(&self, buf: &mut [u8]) -> bool {
        match self.serialize {
            Some(serialize) => unsafe {
                serialize(buf.as_mut_ptr().cast::<c_void>(), buf.len())
            },
            None => false,
        }
    }

    pub fn unserialize(&self, buf: &[u8]) -> bool {
        match self.unserialize {
            Some(unserialize) => unsafe {
                unserialize(buf.as_ptr().cast::<c_void>(), buf.len())
            },
            None => false,
        }
    }

    pub fn system_info(&self) -> Option<SystemInfo> {
        let get = self.get_system_info?;
        let mut info = SystemInfo {
            library_name: std::ptr::null(),
            library_version: std::ptr::null(),
            valid_extensions: std::ptr::null(),
            need_fullpath: false,
            block_extract: false,
        };

        unsafe { get(&mut info) };

        Some(info)
    }

    pub fn av_info(&self) -> Option<SystemAvInfo> {
        let get = self.get_system_av_info?;
        let mut info = SystemAvInfo {
            geometry: libretro_sys::GameGeometry {
                base_width: 0,
                base_height: 0,
                max_width: 0,
                max_height: 0,
                aspect_ratio: f32::NAN,
            },
            timing: libretro_sys::SystemTiming {
                fps: 0.0,
                sample_rate: 0.0,
            },
        };

        unsafe { get(&mut info) };

        Some(info)
    }

    /// Raw pointer and length of a core memory region (SAVE_RAM etc.).
    /// The pointer is valid while the game stays loaded.
    pub fn memory_region(&self, id: c_uint) -> (*mut u8, usize) {
        let (Some(data), Some(size)) = (self.get_memory_data, self.get_memory_size) else {
            return (null_mut(), 0);
        };

        unsafe {
            let ptr = data(id).cast::<u8>();
            let len = size(id);

            if ptr.is_null() {
                (null_mut(), 0)
            } else {
                (ptr, len)
            }
        }
    }
}

unsafe fn require<T: Copy>(library: &Library, symbol: &'static str) -> Result<T> {
    library
        .get::<T>(symbol.as_bytes())
        .map(|item| *item)
        .map_err(|_| Error::Symbol(symbol))
}

unsafe fn optional<T: Copy>(library: &Library, symbol: &str) -> Option<T> {
    match library.get::<T>(symbol.as_bytes()) {
        Ok(item) => Some(*item),
        Err(_) => {
            debug!(symbol, "optional symbol absent");
            None
        }
    }
}

// Api is shared with the scheduler thread; fn pointers and Library are
// both Send + Sync, keep it that way.
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn _check() {
        assert_send_sync::<Api>();
    }
};

pub(crate) fn cstr_or_empty<'a>(ptr: *const c_char) -> std::borrow::Cow<'a, str> {
    if ptr.is_null() {
        return "".into();
    }

    unsafe { std::ffi::CStr::from_ptr(ptr).to_string_lossy() }
}
