use std::ffi::{c_char, c_uint, c_void, CStr, CString};
use std::path::Path;
use std::ptr::null;

use indexmap::IndexMap;
use libretro_sys::PixelFormat;
use strum::FromRepr;
use tracing::{debug, trace};

use crate::core::callbacks::HostBindings;
use crate::core::memory_map::MemoryMap;

/// Experimental-command bit; such calls may change or vanish between
/// libretro revisions.
pub(crate) const EXPERIMENTAL: u32 = 0x10000;

/// The environment commands this host answers. Anything else is
/// not-supported: a frontend that blindly acknowledges unknown commands
/// breaks cores that feature-detect.
#[derive(FromRepr, Debug, PartialEq)]
#[repr(u32)]
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
pub(crate) enum Command {
    // bool * -- frame duping support.
    GET_CAN_DUPE = 3,

    // const unsigned * -- demandingness hint; acknowledged, ignored.
    SET_PERFORMANCE_LEVEL = 8,

    // const char ** -- BIOS / system content directory.
    GET_SYSTEM_DIRECTORY = 9,

    // const enum retro_pixel_format * -- frame format for video refresh.
    SET_PIXEL_FORMAT = 10,

    // struct retro_variable * -- query one host-owned variable.
    GET_VARIABLE = 15,

    // const struct retro_variable * -- variable definitions; not persisted.
    SET_VARIABLES = 16,

    // bool * -- one-shot dirty flag for variables.
    GET_VARIABLE_UPDATE = 17,

    // struct retro_log_callback * -- not supported, cores fall back to stderr.
    GET_LOG_INTERFACE = 27,

    // const char ** -- SRAM / save directory.
    GET_SAVE_DIRECTORY = 31,

    // const struct retro_memory_map * -- emulator memory regions.
    SET_MEMORY_MAPS = 36 | EXPERIMENTAL,

    // const bool * -- core can mask achievement-breaking features.
    SET_SUPPORT_ACHIEVEMENTS = 42 | EXPERIMENTAL,

    // bool * -- collapsed joypad reads via JOYPAD_MASK.
    GET_INPUT_BITMASKS = 51 | EXPERIMENTAL,

    // unsigned * -- core options API version.
    GET_CORE_OPTIONS_VERSION = 52,
}

/// Per-core quirk allow-list, keyed off the library path. Commands outside
/// the table above are honored only for cores known to depend on them.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CoreQuirks {
    pub mgba: bool,
}

impl CoreQuirks {
    pub fn from_library_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        Self {
            mgba: name.contains("mgba"),
        }
    }
}

pub(crate) const SGB_BORDERS_KEY: &str = "mgba_sgb_borders";

/// Host-owned core variables, plus the one-shot dirty flag the core polls
/// through GET_VARIABLE_UPDATE.
pub(crate) struct HostVariables {
    values: IndexMap<String, CString>,
    dirty: bool,
}

impl HostVariables {
    pub fn new() -> Self {
        let mut vars = Self {
            values: IndexMap::new(),
            dirty: false,
        };
        vars.set(SGB_BORDERS_KEY, "ON");
        vars.dirty = false;

        vars
    }

    pub fn set(&mut self, key: &str, value: &str) {
        let value = CString::new(value).unwrap_or_default();
        self.values.insert(key.to_owned(), value);
        self.dirty = true;
    }

    pub fn get(&self, key: &str) -> Option<&CString> {
        self.values.get(key)
    }

    pub fn set_sgb_borders(&mut self, enabled: bool) {
        self.set(SGB_BORDERS_KEY, if enabled { "ON" } else { "OFF" });
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

/// Service one environment call against the host state.
///
/// # Safety
/// `data` must match the layout the command dictates; this is the core's
/// side of the ABI contract.
pub(crate) unsafe fn dispatch(host: &mut HostBindings, cmd: c_uint, data: *mut c_void) -> bool {
    let Some(command) = Command::from_repr(cmd) else {
        return dispatch_quirk(host, cmd, data);
    };

    match command {
        Command::GET_CAN_DUPE => {
            if let Some(flag) = data.cast::<bool>().as_mut() {
                *flag = true;
            }
            true
        }
        Command::SET_PERFORMANCE_LEVEL => true,
        Command::GET_SYSTEM_DIRECTORY | Command::GET_SAVE_DIRECTORY => {
            if let Some(dir) = data.cast::<*const c_char>().as_mut() {
                *dir = host.save_dir_c.as_ptr();
            }
            true
        }
        Command::SET_PIXEL_FORMAT => {
            let raw = *data.cast_const().cast::<c_uint>();
            let Some(format) = PixelFormat::from_uint(raw) else {
                debug!(raw, "unknown pixel format requested");
                return false;
            };

            debug!(?format, "pixel format set");
            host.pixel_format = format;
            host.format_set = true;
            true
        }
        Command::GET_VARIABLE => {
            let Some(variable) = data.cast::<libretro_sys::Variable>().as_mut() else {
                return false;
            };
            let Some(key) = variable.key.as_ref() else {
                return false;
            };
            let key = CStr::from_ptr(key).to_string_lossy();

            match host.vars.get(&key) {
                Some(value) => {
                    variable.value = value.as_ptr();
                    true
                }
                None => {
                    variable.value = null();
                    false
                }
            }
        }
        Command::SET_VARIABLES => true,
        Command::GET_VARIABLE_UPDATE => {
            let dirty = host.vars.take_dirty();
            if let Some(flag) = data.cast::<bool>().as_mut() {
                *flag = dirty;
            }
            true
        }
        Command::SET_MEMORY_MAPS => {
            host.memory = MemoryMap::from_raw(data.cast_const().cast());
            debug!(map = ?host.memory, "memory map published");
            true
        }
        Command::GET_INPUT_BITMASKS => {
            if let Some(flag) = data.cast::<bool>().as_mut() {
                *flag = true;
            }
            true
        }
        Command::GET_LOG_INTERFACE => false,
        Command::SET_SUPPORT_ACHIEVEMENTS | Command::GET_CORE_OPTIONS_VERSION => {
            dispatch_quirk(host, cmd, data)
        }
    }
}

/// Allow-listed commands for cores known to need them; everything else is
/// rejected so feature detection in the core stays honest.
unsafe fn dispatch_quirk(host: &mut HostBindings, cmd: c_uint, data: *mut c_void) -> bool {
    if host.quirks.mgba {
        match Command::from_repr(cmd) {
            Some(Command::SET_SUPPORT_ACHIEVEMENTS) => return true,
            Some(Command::GET_CORE_OPTIONS_VERSION) => {
                // Version 0 keeps mGBA on the legacy variable path the
                // host implements.
                if let Some(version) = data.cast::<c_uint>().as_mut() {
                    *version = 0;
                }
                return true;
            }
            _ => {}
        }
    }

    trace!(cmd, "unhandled environment command");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::callbacks::HostBindings;
    use std::path::PathBuf;

    fn host() -> HostBindings {
        HostBindings::for_tests()
    }

    #[test]
    fn can_dupe_reports_true() {
        let mut host = host();
        let mut flag = false;

        let ok = unsafe {
            dispatch(
                &mut host,
                Command::GET_CAN_DUPE as u32,
                (&mut flag as *mut bool).cast(),
            )
        };

        assert!(ok);
        assert!(flag);
    }

    #[test]
    fn pixel_format_is_recorded() {
        let mut host = host();
        let mut raw: c_uint = PixelFormat::RGB565 as c_uint;

        let ok = unsafe {
            dispatch(
                &mut host,
                Command::SET_PIXEL_FORMAT as u32,
                (&mut raw as *mut c_uint).cast(),
            )
        };

        assert!(ok);
        assert_eq!(host.pixel_format, PixelFormat::RGB565);
        assert!(host.format_set);
    }

    #[test]
    fn sgb_variable_round_trips() {
        let mut host = host();
        host.vars.set_sgb_borders(false);

        let key = CString::new(SGB_BORDERS_KEY).unwrap();
        let mut variable = libretro_sys::Variable {
            key: key.as_ptr(),
            value: null(),
        };

        let ok = unsafe {
            dispatch(
                &mut host,
                Command::GET_VARIABLE as u32,
                (&mut variable as *mut libretro_sys::Variable).cast(),
            )
        };

        assert!(ok);
        let value = unsafe { CStr::from_ptr(variable.value) };
        assert_eq!(value.to_str().unwrap(), "OFF");
    }

    #[test]
    fn unknown_variable_reports_not_found() {
        let mut host = host();
        let key = CString::new("other_core_option").unwrap();
        let mut variable = libretro_sys::Variable {
            key: key.as_ptr(),
            value: null(),
        };

        let ok = unsafe {
            dispatch(
                &mut host,
                Command::GET_VARIABLE as u32,
                (&mut variable as *mut libretro_sys::Variable).cast(),
            )
        };

        assert!(!ok);
        assert!(variable.value.is_null());
    }

    #[test]
    fn variable_update_flag_reads_once() {
        let mut host = host();
        host.vars.set_sgb_borders(true);

        let mut dirty = false;
        unsafe {
            dispatch(
                &mut host,
                Command::GET_VARIABLE_UPDATE as u32,
                (&mut dirty as *mut bool).cast(),
            );
        }
        assert!(dirty);

        unsafe {
            dispatch(
                &mut host,
                Command::GET_VARIABLE_UPDATE as u32,
                (&mut dirty as *mut bool).cast(),
            );
        }
        assert!(!dirty);
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let mut host = host();

        assert!(!unsafe { dispatch(&mut host, 14, std::ptr::null_mut()) });
        assert!(!unsafe { dispatch(&mut host, 0xDEAD, std::ptr::null_mut()) });
    }

    #[test]
    fn quirk_commands_need_the_allow_list() {
        let mut host = host();
        let mut version: c_uint = 99;
        let cmd = Command::GET_CORE_OPTIONS_VERSION as u32;

        host.quirks = CoreQuirks::default();
        assert!(!unsafe { dispatch(&mut host, cmd, (&mut version as *mut c_uint).cast()) });

        host.quirks = CoreQuirks::from_library_path(&PathBuf::from("/lib/libmgba_libretro.so"));
        assert!(unsafe { dispatch(&mut host, cmd, (&mut version as *mut c_uint).cast()) });
        assert_eq!(version, 0);
    }
}
