//! Native emulation host for libretro handheld cores.
//!
//! The host wraps a dynamically loaded libretro core (mGBA by default) and
//! offers a UI layer frame-paced execution, adaptive-rate audio, zero-copy
//! video, save states and rewind, deterministic input injection, a
//! link-cable bridge and a RetroAchievements bridge. One [`Session`] is the
//! whole client-facing surface; libretro cores are single-instance, so at
//! most one initialized session exists per process.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::ptr::null;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tracing::{debug, error};

mod audio;
mod cheevos;
mod core;
mod error;
mod input;
mod link;
mod rewind;
mod savestate;
mod sched;
mod video;

pub use crate::audio::AudioStats;
pub use crate::cheevos::{
    HttpRequest, HttpResponse, RcEvent, Runtime as RcRuntime, RuntimeHost as RcRuntimeHost,
    ServerCall,
};
pub use crate::error::{Error, Result};
pub use crate::input::Button;
pub use crate::video::{Surface, SurfaceBuffer};

use crate::audio::AudioShared;
use crate::cheevos::CheevosBridge;
use crate::core::callbacks::{self, HostBindings};
use crate::core::Api;
use crate::input::Keypad;
use crate::rewind::RewindRing;
use crate::savestate::SaveContext;
use crate::sched::{SchedulerCtx, Vitals};
use crate::video::{Snapshot, SurfaceSlot};

// One initialized session per process; the callback slot is global.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

struct GameState {
    save: SaveContext,
    rom_sha1: String,
    reported_rate: f64,
    // The image backs the data pointer handed to retro_load_game and is
    // kept alive for the whole game session.
    _rom_image: Vec<u8>,
    _rom_path_c: CString,
}

/// A core session: load a core, load a game, run it.
///
/// All methods are called from the client thread. While the scheduler
/// runs, calls that enter the core (state, rewind, link, reset) serialize
/// on the execution lock and may wait up to one scheduler iteration.
pub struct Session {
    core_path: PathBuf,
    save_dir: PathBuf,
    api: Option<Arc<Api>>,
    exec: Arc<Mutex<()>>,
    vitals: Arc<Vitals>,
    audio: Arc<AudioShared>,
    keypad: Arc<Keypad>,
    snapshot: Arc<Mutex<Snapshot>>,
    surface: Arc<Mutex<SurfaceSlot>>,
    rewind: Arc<Mutex<Option<RewindRing>>>,
    cheevos: Arc<Mutex<CheevosBridge>>,
    scheduler: Option<JoinHandle<()>>,
    game: Option<GameState>,
    claimed: bool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            core_path: PathBuf::from(core::default_core_filename()),
            save_dir: PathBuf::from("."),
            api: None,
            exec: Arc::new(Mutex::new(())),
            vitals: Arc::new(Vitals::new()),
            audio: Arc::new(AudioShared::new()),
            keypad: Arc::new(Keypad::new()),
            snapshot: Arc::new(Mutex::new(Snapshot::new())),
            surface: Arc::new(Mutex::new(SurfaceSlot::new())),
            rewind: Arc::new(Mutex::new(None)),
            cheevos: Arc::new(Mutex::new(CheevosBridge::new(Box::new(raw_emu_read)))),
            scheduler: None,
            game: None,
            claimed: false,
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Override the core library path. Must precede `init`.
    pub fn select_core(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        if self.api.is_some() {
            return Err(Error::State("core already initialized"));
        }

        self.core_path = path.into();
        Ok(())
    }

    /// Directory for SRAM, save states and BIOS images.
    pub fn set_save_dir(&mut self, dir: impl Into<PathBuf>) -> Result<()> {
        if self.api.is_some() {
            return Err(Error::State("core already initialized"));
        }

        self.save_dir = dir.into();
        Ok(())
    }

    /// Load the core library, resolve its symbols, register the host
    /// callbacks and run `retro_init`.
    pub fn init(&mut self) -> Result<()> {
        if self.api.is_some() {
            return Err(Error::State("core already initialized"));
        }

        if SESSION_ACTIVE.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyActive);
        }
        self.claimed = true;

        let api = match unsafe { Api::load(&self.core_path) } {
            Ok(api) => api,
            Err(err) => {
                self.claimed = false;
                SESSION_ACTIVE.store(false, Ordering::Release);
                return Err(err);
            }
        };

        callbacks::install(HostBindings::new(
            self.audio.clone(),
            self.keypad.clone(),
            &self.core_path,
            &self.save_dir,
        ));

        api.register_callbacks(
            callbacks::environment,
            callbacks::video_refresh,
            callbacks::audio_sample,
            callbacks::audio_sample_batch,
            callbacks::input_poll,
            callbacks::input_state,
        );
        api.init();

        debug!(core = %self.core_path.display(), "core initialized");
        self.api = Some(Arc::new(api));

        Ok(())
    }

    /// Install a BIOS image where the core's system-directory lookup will
    /// find it.
    pub fn load_bios(&mut self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::create_dir_all(&self.save_dir)?;
        std::fs::copy(path.as_ref(), self.save_dir.join("gba_bios.bin"))?;

        Ok(())
    }

    /// Load a ROM (plain image or zip archive). Loading over a previous
    /// game tears down all per-game state first.
    pub fn load_rom(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let api = self.api.clone().ok_or(Error::NotLoaded)?;

        self.stop_scheduler();
        if self.game.take().is_some() {
            let _exec = self.exec.lock();
            api.unload_game();
        }
        *self.rewind.lock() = None;
        callbacks::with_host(|host| host.reset_for_game());

        let rom = core::read_rom_image(path)?;
        let rom_sha1 = hex::encode(Sha1::digest(&rom));
        let system = core::SystemInfo::query(&api);
        debug!(core = %system.library_name, %rom_sha1, "loading game");

        let rom_path_c = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| Error::State("rom path contains NUL"))?;
        let info = libretro_sys::GameInfo {
            path: rom_path_c.as_ptr(),
            data: if system.need_fullpath {
                null()
            } else {
                rom.as_ptr().cast()
            },
            size: rom.len(),
            meta: null(),
        };

        {
            let _exec = self.exec.lock();
            if !api.load_game(&info) {
                return Err(Error::Rom);
            }
        }

        let av_info = api.av_info();
        let reported_rate = av_info
            .map(|info| info.timing.sample_rate)
            .unwrap_or_default();
        self.audio.reset_for_game(reported_rate);

        let rom_base = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rom".into());
        let state_size = {
            let _exec = self.exec.lock();
            api.serialize_size()
        };

        debug!(rom = %path.display(), state_size, reported_rate, "game loaded");

        self.game = Some(GameState {
            save: SaveContext::new(self.save_dir.clone(), rom_base, state_size),
            rom_sha1,
            reported_rate,
            _rom_image: rom,
            _rom_path_c: rom_path_c,
        });

        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        let api = self.require_game()?;
        let _exec = self.exec.lock();
        api.reset();

        Ok(())
    }

    /// Tear the session down: scheduler, surface, rewind, game, core,
    /// in that order. Safe to call twice; `Drop` calls it.
    pub fn destroy(&mut self) {
        self.stop_scheduler();

        let detached = self.surface.lock().detach();
        drop(detached);

        *self.rewind.lock() = None;
        self.cheevos.lock().detach();
        self.vitals.cheevos_enabled.store(false, Ordering::Relaxed);

        if let Some(api) = self.api.take() {
            let _exec = self.exec.lock();
            if self.game.take().is_some() {
                api.unload_game();
            }
            api.deinit();
        }

        callbacks::clear();

        if self.claimed {
            self.claimed = false;
            SESSION_ACTIVE.store(false, Ordering::Release);
        }
    }

    // ---- execution -------------------------------------------------------

    /// Manually step one emulation frame and refresh the display paths.
    /// Not available while the scheduler runs.
    pub fn run_frame(&mut self) -> Result<()> {
        if self.scheduler.is_some() {
            return Err(Error::State("scheduler owns execution"));
        }

        let api = self.require_game()?;
        {
            let _exec = self.exec.lock();
            api.run();
        }

        callbacks::with_host(|host| {
            self.snapshot.lock().copy_from(&host.frame);
            self.surface.lock().blit(&host.frame);
        });

        Ok(())
    }

    /// Start the frame scheduler. `on_display` fires on each ~60 Hz
    /// display signal, after the frame has been published.
    pub fn start_scheduler(&mut self, on_display: impl FnMut() + Send + 'static) -> Result<()> {
        let api = self.require_game()?;
        let game = self.game.as_ref().expect("checked by require_game");

        if self.scheduler.is_some() {
            return Err(Error::State("scheduler already running"));
        }

        self.vitals.running.store(true, Ordering::Release);

        let ctx = SchedulerCtx {
            api,
            exec: self.exec.clone(),
            vitals: self.vitals.clone(),
            audio: self.audio.clone(),
            snapshot: self.snapshot.clone(),
            surface: self.surface.clone(),
            rewind: self.rewind.clone(),
            cheevos: self.cheevos.clone(),
            reported_rate: game.reported_rate,
            on_display: Box::new(on_display),
        };

        match sched::spawn(ctx) {
            Ok(handle) => {
                self.scheduler = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.vitals.running.store(false, Ordering::Release);
                Err(Error::Io(err))
            }
        }
    }

    /// Stop and join the scheduler. The loop exits within one target
    /// frame interval.
    pub fn stop_scheduler(&mut self) {
        self.vitals.running.store(false, Ordering::Release);

        if let Some(handle) = self.scheduler.take() {
            if handle.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
    }

    /// Emulation speed in percent, clamped to 25..=800.
    pub fn set_speed(&self, pct: u32) {
        self.vitals
            .speed_pct
            .store(pct.clamp(25, 800), Ordering::Relaxed);
    }

    pub fn set_volume(&self, volume: f32) {
        self.audio.set_volume(volume);
    }

    pub fn set_muted(&self, muted: bool) {
        self.audio.set_muted(muted);
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio.set_enabled(enabled);
    }

    /// Scheduler fps readout (×100 internally, see `Vitals`).
    pub fn fps(&self) -> f32 {
        self.vitals.fps_x100.load(Ordering::Relaxed) as f32 / 100.0
    }

    pub fn audio_stats(&self) -> AudioStats {
        self.audio.stats()
    }

    /// Frames the converter had to drop (geometry or allocation failures).
    pub fn dropped_frames(&self) -> u64 {
        callbacks::with_host(|host| host.frame.dropped_frames()).unwrap_or(0)
    }

    pub fn rom_hash_sha1(&self) -> Option<&str> {
        self.game.as_ref().map(|game| game.rom_sha1.as_str())
    }

    // ---- input and state -------------------------------------------------

    /// Keypad bitmask in [`Button`] bit order.
    pub fn set_keys(&self, mask: u32) {
        self.keypad.set(mask);
    }

    pub fn save_state(&mut self, slot: u8) -> Result<()> {
        let api = self.require_game()?;
        let _exec = self.exec.lock();

        self.game
            .as_mut()
            .expect("checked by require_game")
            .save
            .save_state(&api, slot)
    }

    pub fn load_state(&mut self, slot: u8) -> Result<()> {
        let api = self.require_game()?;
        let _exec = self.exec.lock();

        self.game
            .as_mut()
            .expect("checked by require_game")
            .save
            .load_state(&api, slot)
    }

    pub fn save_sram(&self, path: Option<&Path>) -> Result<()> {
        let api = self.require_game()?;
        let _exec = self.exec.lock();

        self.game
            .as_ref()
            .expect("checked by require_game")
            .save
            .save_sram(&api, path)
    }

    pub fn load_sram(&self, path: Option<&Path>) -> Result<()> {
        let api = self.require_game()?;
        let _exec = self.exec.lock();

        self.game
            .as_ref()
            .expect("checked by require_game")
            .save
            .load_sram(&api, path)
    }

    // ---- rewind ----------------------------------------------------------

    /// Pre-allocate `capacity` snapshot slots sized to the core's declared
    /// state size. Fails early and cleanly on allocation failure.
    pub fn rewind_init(&mut self, capacity: usize) -> Result<()> {
        let _api = self.require_game()?;
        let state_size = self
            .game
            .as_ref()
            .expect("checked by require_game")
            .save
            .state_size();

        let ring = RewindRing::new(capacity, state_size)?;
        *self.rewind.lock() = Some(ring);

        Ok(())
    }

    pub fn rewind_push(&mut self) -> Result<()> {
        let api = self.require_game()?;
        let _exec = self.exec.lock();

        match self.rewind.lock().as_mut() {
            Some(ring) => ring.push(|buf| api.serialize(buf)),
            None => Err(Error::State("rewind is not initialized")),
        }
    }

    pub fn rewind_pop(&mut self) -> Result<()> {
        let api = self.require_game()?;
        let _exec = self.exec.lock();

        match self.rewind.lock().as_mut() {
            Some(ring) => ring.pop(|buf| api.unserialize(buf)),
            None => Err(Error::State("rewind is not initialized")),
        }
    }

    pub fn rewind_count(&self) -> usize {
        self.rewind.lock().as_ref().map_or(0, |ring| ring.count())
    }

    pub fn rewind_deinit(&mut self) {
        *self.rewind.lock() = None;
    }

    /// Enable automatic snapshot capture every `interval` frames on the
    /// scheduler thread.
    pub fn set_rewind_capture(&self, enabled: bool, interval: u32) {
        self.vitals
            .rewind_interval
            .store(interval.max(1), Ordering::Relaxed);
        self.vitals
            .rewind_enabled
            .store(enabled, Ordering::Relaxed);
    }

    // ---- display ---------------------------------------------------------

    /// Read the latest published frame (fallback path, pitch = width).
    pub fn with_video_frame<R>(&self, f: impl FnOnce(usize, usize, &[u32]) -> R) -> R {
        let snapshot = self.snapshot.lock();
        f(snapshot.width(), snapshot.height(), snapshot.pixels())
    }

    pub fn width(&self) -> usize {
        self.snapshot.lock().width()
    }

    pub fn height(&self) -> usize {
        self.snapshot.lock().height()
    }

    /// Attach a render surface for the zero-copy path.
    pub fn attach_surface(&self, surface: Box<dyn Surface>, width: u32, height: u32) {
        self.surface.lock().attach(surface, width, height);
    }

    /// Blit the current canonical frame immediately (outside the display
    /// signal).
    pub fn blit(&self) {
        callbacks::with_host(|host| {
            self.surface.lock().blit(&host.frame);
        });
    }

    /// Detach the render surface. No blit is in progress once this
    /// returns; the surface itself is dropped outside the lock.
    pub fn detach_surface(&self) {
        let detached = self.surface.lock().detach();
        drop(detached);
    }

    // ---- palette ---------------------------------------------------------

    /// Four-shade remap for monochrome games, shades as 0xRRGGBB lightest
    /// first.
    pub fn set_color_palette(&self, enabled: bool, shades: [u32; 4]) {
        callbacks::with_host(|host| host.palette.set(enabled, shades));
    }

    pub fn set_sgb_borders(&self, enabled: bool) {
        callbacks::with_host(|host| host.vars.set_sgb_borders(enabled));
    }

    // ---- link cable ------------------------------------------------------

    pub fn link_supported(&self) -> bool {
        callbacks::with_host(|host| !host.memory.is_empty()).unwrap_or(false)
    }

    pub fn link_read_byte(&self, addr: usize) -> Option<u8> {
        let _exec = self.exec.lock();
        callbacks::with_host(|host| unsafe { host.memory.read_byte(addr) }).flatten()
    }

    pub fn link_write_byte(&self, addr: usize, value: u8) -> bool {
        let _exec = self.exec.lock();
        callbacks::with_host(|host| unsafe { host.memory.write_byte(addr, value) })
            .unwrap_or(false)
    }

    /// 1 = mid-transfer as master, 0 = idle or receive-only, -1 = the
    /// core exposes no serial port.
    pub fn link_transfer_status(&self) -> i32 {
        let _exec = self.exec.lock();
        callbacks::with_host(|host| unsafe { link::transfer_status(&host.memory) }).unwrap_or(-1)
    }

    /// Exchange one byte over the emulated link cable; returns the byte
    /// the game was sending.
    pub fn link_exchange(&self, incoming: u8) -> Option<u8> {
        let _exec = self.exec.lock();
        callbacks::with_host(|host| unsafe { link::exchange(&host.memory, incoming) }).flatten()
    }

    // ---- achievements ----------------------------------------------------

    /// Attach the achievements runtime and enable its per-frame hook.
    pub fn rc_init(&self, runtime: Box<dyn RcRuntime>) {
        self.cheevos.lock().attach(runtime);
        self.vitals.cheevos_enabled.store(true, Ordering::Relaxed);
    }

    pub fn rc_destroy(&self) {
        self.vitals.cheevos_enabled.store(false, Ordering::Relaxed);
        self.cheevos.lock().detach();
    }

    pub fn rc_login_with_token(&self, user: &str, token: &str) {
        let _exec = self.exec.lock();
        self.cheevos.lock().login_with_token(user, token);
    }

    pub fn rc_load_game(&self, hash: &str) {
        let _exec = self.exec.lock();
        self.cheevos.lock().load_game(hash);
    }

    pub fn rc_unload(&self) {
        let _exec = self.exec.lock();
        self.cheevos.lock().unload_game();
    }

    pub fn rc_reset(&self) {
        let _exec = self.exec.lock();
        self.cheevos.lock().reset();
    }

    pub fn rc_logout(&self) {
        let _exec = self.exec.lock();
        self.cheevos.lock().logout();
    }

    pub fn rc_set_hardcore(&self, enabled: bool) {
        self.cheevos.lock().set_hardcore(enabled);
    }

    pub fn rc_set_encore(&self, enabled: bool) {
        self.cheevos.lock().set_encore(enabled);
    }

    pub fn rc_do_frame(&self) {
        let _exec = self.exec.lock();
        self.cheevos.lock().do_frame();
    }

    pub fn rc_idle(&self) {
        let _exec = self.exec.lock();
        self.cheevos.lock().idle();
    }

    pub fn rc_poll_http_request(&self) -> Option<HttpRequest> {
        self.cheevos.lock().poll_http()
    }

    pub fn rc_submit_http_response(&self, id: u32, body: Vec<u8>, status: i32) -> Result<()> {
        let _exec = self.exec.lock();
        self.cheevos
            .lock()
            .submit_http(id, HttpResponse { status, body })
    }

    pub fn rc_poll_event(&self) -> Option<RcEvent> {
        self.cheevos.lock().poll_event()
    }

    pub fn rc_is_logged_in(&self) -> bool {
        self.with_rc(|rt| rt.is_logged_in()).unwrap_or(false)
    }

    pub fn rc_user_name(&self) -> Option<String> {
        self.with_rc(|rt| rt.user_name()).flatten()
    }

    pub fn rc_game_title(&self) -> Option<String> {
        self.with_rc(|rt| rt.game_title()).flatten()
    }

    pub fn rc_game_id(&self) -> Option<u32> {
        self.with_rc(|rt| rt.game_id()).flatten()
    }

    pub fn rc_achievement_count(&self) -> u32 {
        self.with_rc(|rt| rt.achievement_count()).unwrap_or(0)
    }

    pub fn rc_unlocked_count(&self) -> u32 {
        self.with_rc(|rt| rt.unlocked_count()).unwrap_or(0)
    }

    pub fn rc_total_points(&self) -> u32 {
        self.with_rc(|rt| rt.total_points()).unwrap_or(0)
    }

    pub fn rc_unlocked_points(&self) -> u32 {
        self.with_rc(|rt| rt.unlocked_points()).unwrap_or(0)
    }

    // ---- helpers ---------------------------------------------------------

    fn require_game(&self) -> Result<Arc<Api>> {
        match (&self.api, &self.game) {
            (Some(api), Some(_)) => Ok(api.clone()),
            _ => Err(Error::NotLoaded),
        }
    }

    fn with_rc<R>(&self, f: impl FnOnce(&dyn RcRuntime) -> R) -> Option<R> {
        let bridge = self.cheevos.lock();
        bridge.runtime().map(f)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Memory-read primitive handed to the achievements bridge: resolves a
/// *real* emulator address through the core's region table.
fn raw_emu_read(addr: usize, out: &mut [u8]) -> usize {
    callbacks::with_host(|host| unsafe { host.memory.read_into(addr, out) }).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_session_reports_not_loaded() {
        let mut session = Session::new();

        assert!(matches!(session.run_frame(), Err(Error::NotLoaded)));
        assert!(matches!(session.save_state(0), Err(Error::NotLoaded)));
        assert!(matches!(session.rewind_push(), Err(Error::NotLoaded)));
        assert_eq!(session.rewind_count(), 0);
        assert_eq!(session.width(), 0);
        assert!(session.rom_hash_sha1().is_none());
    }

    #[test]
    fn setters_are_safe_before_init() {
        let session = Session::new();

        session.set_keys(0xFF);
        session.set_speed(1_000); // clamped
        session.set_volume(2.0); // clamped
        session.set_rewind_capture(true, 0); // interval floored

        assert_eq!(session.fps(), 0.0);
        assert!(!session.link_supported());
        assert_eq!(session.link_transfer_status(), -1);
    }

    #[test]
    fn rc_surface_is_inert_without_a_runtime() {
        let session = Session::new();

        assert!(session.rc_poll_http_request().is_none());
        assert!(session.rc_poll_event().is_none());
        assert!(!session.rc_is_logged_in());
        assert_eq!(session.rc_achievement_count(), 0);
        assert!(matches!(
            session.rc_submit_http_response(1, Vec::new(), 200),
            Err(Error::State(_))
        ));
    }
}
