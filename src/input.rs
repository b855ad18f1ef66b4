use std::ffi::c_uint;
use std::sync::atomic::{AtomicU32, Ordering};

use enumset::{EnumSet, EnumSetType};

/// Collapsed-bitmask joypad query; newer than the ids `libretro-sys`
/// carries constants for.
pub(crate) const DEVICE_ID_JOYPAD_MASK: c_uint = 256;

/// Joypad buttons in the host's bit order (the handheld keypad register
/// order, with X/Y appended for cores that map them).
///
/// `set_keys` masks use these bit positions; translation to libretro device
/// ids happens at the input-state callback boundary.
#[derive(EnumSetType, Debug)]
pub enum Button {
    A,
    B,
    Select,
    Start,
    Right,
    Left,
    Up,
    Down,
    R,
    L,
    X,
    Y,
}

impl Button {
    pub fn libretro_id(self) -> c_uint {
        match self {
            Button::B => libretro_sys::DEVICE_ID_JOYPAD_B,
            Button::Y => libretro_sys::DEVICE_ID_JOYPAD_Y,
            Button::Select => libretro_sys::DEVICE_ID_JOYPAD_SELECT,
            Button::Start => libretro_sys::DEVICE_ID_JOYPAD_START,
            Button::Up => libretro_sys::DEVICE_ID_JOYPAD_UP,
            Button::Down => libretro_sys::DEVICE_ID_JOYPAD_DOWN,
            Button::Left => libretro_sys::DEVICE_ID_JOYPAD_LEFT,
            Button::Right => libretro_sys::DEVICE_ID_JOYPAD_RIGHT,
            Button::A => libretro_sys::DEVICE_ID_JOYPAD_A,
            Button::X => libretro_sys::DEVICE_ID_JOYPAD_X,
            Button::L => libretro_sys::DEVICE_ID_JOYPAD_L,
            Button::R => libretro_sys::DEVICE_ID_JOYPAD_R,
        }
    }

    pub fn from_libretro_id(id: c_uint) -> Option<Self> {
        Some(match id {
            libretro_sys::DEVICE_ID_JOYPAD_B => Button::B,
            libretro_sys::DEVICE_ID_JOYPAD_Y => Button::Y,
            libretro_sys::DEVICE_ID_JOYPAD_SELECT => Button::Select,
            libretro_sys::DEVICE_ID_JOYPAD_START => Button::Start,
            libretro_sys::DEVICE_ID_JOYPAD_UP => Button::Up,
            libretro_sys::DEVICE_ID_JOYPAD_DOWN => Button::Down,
            libretro_sys::DEVICE_ID_JOYPAD_LEFT => Button::Left,
            libretro_sys::DEVICE_ID_JOYPAD_RIGHT => Button::Right,
            libretro_sys::DEVICE_ID_JOYPAD_A => Button::A,
            libretro_sys::DEVICE_ID_JOYPAD_X => Button::X,
            libretro_sys::DEVICE_ID_JOYPAD_L => Button::L,
            libretro_sys::DEVICE_ID_JOYPAD_R => Button::R,
            _ => return None,
        })
    }
}

/// The atomic keypad mask. Written by the client thread, read by the
/// input-state callback on the scheduler thread.
///
/// Relaxed ordering on both sides: per-frame freshness is all the core
/// needs, and the write itself is a single atomic word.
pub(crate) struct Keypad {
    mask: AtomicU32,
}

impl Keypad {
    pub fn new() -> Self {
        Self {
            mask: AtomicU32::new(0),
        }
    }

    pub fn set(&self, mask: u32) {
        self.mask.store(mask, Ordering::Relaxed);
    }

    pub fn pressed(&self) -> EnumSet<Button> {
        EnumSet::from_u32_truncated(self.mask.load(Ordering::Relaxed))
    }

    /// Single-button query for the plain input-state path.
    pub fn state_for(&self, id: c_uint) -> i16 {
        match Button::from_libretro_id(id) {
            Some(button) => self.pressed().contains(button) as i16,
            None => 0,
        }
    }

    /// Bitmask-collapsed query (`JOYPAD_MASK`): every pressed button folded
    /// into one word at its libretro bit position.
    pub fn collapsed_mask(&self) -> i16 {
        let mut out = 0u32;

        for button in self.pressed() {
            out |= 1 << button.libretro_id();
        }

        out as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_and_select_route_to_libretro_ids() {
        let keypad = Keypad::new();
        keypad.set(0b101);

        assert_eq!(keypad.state_for(libretro_sys::DEVICE_ID_JOYPAD_A), 1);
        assert_eq!(keypad.state_for(libretro_sys::DEVICE_ID_JOYPAD_SELECT), 1);
        assert_eq!(keypad.state_for(libretro_sys::DEVICE_ID_JOYPAD_B), 0);
    }

    #[test]
    fn collapsed_mask_uses_libretro_positions() {
        let keypad = Keypad::new();
        keypad.set(0b101);

        let expected = (1 << libretro_sys::DEVICE_ID_JOYPAD_A)
            | (1 << libretro_sys::DEVICE_ID_JOYPAD_SELECT);
        assert_eq!(keypad.collapsed_mask(), expected as i16);
    }

    #[test]
    fn setting_the_same_mask_twice_is_idempotent() {
        let keypad = Keypad::new();
        keypad.set(0b1100);
        let first = keypad.collapsed_mask();
        keypad.set(0b1100);

        assert_eq!(keypad.collapsed_mask(), first);
    }

    #[test]
    fn unknown_ids_read_as_released() {
        let keypad = Keypad::new();
        keypad.set(u32::MAX);

        assert_eq!(keypad.state_for(99), 0);
    }
}
