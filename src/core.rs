use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};

mod api;
pub(crate) mod callbacks;
pub(crate) mod environment;
pub(crate) mod memory_map;

pub(crate) use self::api::Api;

/// Platform naming of the default core library.
pub(crate) fn default_core_filename() -> &'static str {
    if cfg!(target_os = "windows") {
        "mgba_libretro.dll"
    } else if cfg!(target_os = "android") {
        "libmgba_libretro_android.so"
    } else {
        "libmgba_libretro.so"
    }
}

/// System info with the core's strings copied out of FFI lifetime.
#[derive(Debug, Clone)]
pub(crate) struct SystemInfo {
    pub library_name: String,
    pub need_fullpath: bool,
}

impl SystemInfo {
    pub fn query(api: &Api) -> Self {
        match api.system_info() {
            Some(raw) => Self {
                library_name: api::cstr_or_empty(raw.library_name).into_owned(),
                need_fullpath: raw.need_fullpath,
            },
            None => Self {
                library_name: String::new(),
                need_fullpath: false,
            },
        }
    }
}

const ROM_EXTENSIONS: [&str; 6] = ["gb", "gbc", "gba", "sgb", "dmg", "bin"];

/// Read a ROM image, looking inside zip archives for the first entry with
/// a known handheld extension.
pub(crate) fn read_rom_image(path: &Path) -> Result<Vec<u8>> {
    let is_zip = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));

    if !is_zip {
        return Ok(std::fs::read(path)?);
    }

    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(into_io)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(into_io)?;
        if !entry.is_file() {
            continue;
        }

        let name = entry.name().to_ascii_lowercase();
        let matches = ROM_EXTENSIONS
            .iter()
            .any(|ext| name.ends_with(&format!(".{ext}")));
        if !matches {
            continue;
        }

        debug!(entry = entry.name(), "loading rom from archive");
        let mut rom = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut rom)?;

        return Ok(rom);
    }

    Err(Error::Rom)
}

fn into_io(err: zip::result::ZipError) -> Error {
    Error::Io(std::io::Error::other(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_core_name_matches_the_platform() {
        let name = default_core_filename();
        assert!(name.contains("mgba_libretro"));
    }

    #[test]
    fn missing_rom_surfaces_io() {
        let err = read_rom_image(Path::new("/nonexistent/rom.gba")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
