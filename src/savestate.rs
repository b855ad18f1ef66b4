use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::slice;

use atomicwrites::{AtomicFile, OverwriteBehavior};
use tracing::debug;

use crate::core::Api;
use crate::error::{Error, Result};

pub(crate) const SLOT_COUNT: u8 = 10;

/// Save-state slots and SRAM persistence for the loaded game.
///
/// The scratch buffer is sized to the core's declared serialized-state
/// size at game load and reused for every slot operation.
pub(crate) struct SaveContext {
    save_dir: PathBuf,
    rom_base: String,
    scratch: Vec<u8>,
}

impl SaveContext {
    pub fn new(save_dir: PathBuf, rom_base: String, state_size: usize) -> Self {
        Self {
            save_dir,
            rom_base,
            scratch: vec![0; state_size],
        }
    }

    pub fn state_size(&self) -> usize {
        self.scratch.len()
    }

    pub fn state_path(&self, slot: u8) -> PathBuf {
        self.save_dir.join(format!("{}.ss{}", self.rom_base, slot))
    }

    pub fn sram_path(&self) -> PathBuf {
        self.save_dir.join(format!("{}.sav", self.rom_base))
    }

    pub fn save_state(&mut self, api: &Api, slot: u8) -> Result<()> {
        check_slot(slot)?;

        if self.scratch.is_empty() {
            return Err(Error::State("core does not support serialization"));
        }

        if !api.serialize(&mut self.scratch) {
            return Err(Error::State("core failed to serialize"));
        }

        let path = self.state_path(slot);
        write_atomically(&path, &self.scratch)?;
        debug!(?path, "state saved");

        Ok(())
    }

    pub fn load_state(&mut self, api: &Api, slot: u8) -> Result<()> {
        check_slot(slot)?;

        let path = self.state_path(slot);
        let data = fs::read(&path)?;

        if !api.unserialize(&data) {
            return Err(Error::State("core rejected the state"));
        }

        debug!(?path, "state loaded");

        Ok(())
    }

    /// Persist the battery-backed region. Size-zero regions (no battery)
    /// succeed silently.
    pub fn save_sram(&self, api: &Api, path: Option<&Path>) -> Result<()> {
        let (ptr, len) = api.memory_region(libretro_sys::MEMORY_SAVE_RAM);
        if len == 0 {
            return Ok(());
        }

        let sram = unsafe { slice::from_raw_parts(ptr, len) };
        let default = self.sram_path();
        let path = path.unwrap_or(&default);
        write_atomically(path, sram)?;
        debug!(?path, len, "sram saved");

        Ok(())
    }

    pub fn load_sram(&self, api: &Api, path: Option<&Path>) -> Result<()> {
        let (ptr, len) = api.memory_region(libretro_sys::MEMORY_SAVE_RAM);
        if len == 0 {
            return Ok(());
        }

        let default = self.sram_path();
        let path = path.unwrap_or(&default);
        let data = fs::read(path)?;

        let sram = unsafe { slice::from_raw_parts_mut(ptr, len) };
        let n = sram.len().min(data.len());
        sram[..n].copy_from_slice(&data[..n]);
        debug!(?path, n, "sram loaded");

        Ok(())
    }
}

fn check_slot(slot: u8) -> Result<()> {
    if slot < SLOT_COUNT {
        Ok(())
    } else {
        Err(Error::State("save slot out of range"))
    }
}

/// Battery saves must never be torn by a crash mid-write.
fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let file = AtomicFile::new(path, OverwriteBehavior::AllowOverwrite);

    file.write(|f| f.write_all(data)).map_err(|err| match err {
        atomicwrites::Error::Internal(err) | atomicwrites::Error::User(err) => Error::Io(err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> SaveContext {
        SaveContext::new(PathBuf::from("/data/saves"), "pokemon_red".into(), 64)
    }

    #[test]
    fn state_files_follow_the_slot_layout() {
        let ctx = context();

        assert_eq!(
            ctx.state_path(3),
            PathBuf::from("/data/saves/pokemon_red.ss3")
        );
        assert_eq!(ctx.sram_path(), PathBuf::from("/data/saves/pokemon_red.sav"));
    }

    #[test]
    fn slots_beyond_nine_are_rejected() {
        assert!(check_slot(0).is_ok());
        assert!(check_slot(9).is_ok());
        assert!(check_slot(10).is_err());
    }

    #[test]
    fn atomic_write_round_trips() {
        let dir = std::env::temp_dir().join("gibbon-savestate-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("game.sav");

        write_atomically(&path, b"battery").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"battery");

        write_atomically(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");

        fs::remove_dir_all(&dir).ok();
    }
}
