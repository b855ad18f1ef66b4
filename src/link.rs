use crate::core::memory_map::MemoryMap;

/// GB/GBC serial I/O registers.
const REG_SB: usize = 0xFF01;
const REG_SC: usize = 0xFF02;
const REG_IF: usize = 0xFF0F;

/// SC bit 7: transfer in progress.
const SC_TRANSFER: u8 = 0x80;
/// SC bit 0: this peer drives the clock (master).
const SC_INTERNAL_CLOCK: u8 = 0x01;
/// IF bit 3: serial interrupt.
const IF_SERIAL: u8 = 0x08;

/// Single-byte link-cable exchange against the emulated serial port.
///
/// Captures the outgoing byte from SB, substitutes the incoming byte,
/// completes the transfer (clear SC bit 7) and raises the serial
/// interrupt. Returns the captured outgoing byte.
///
/// # Safety
/// The region table must describe live core memory and the caller must
/// keep `retro_run` off the bus for the duration.
pub(crate) unsafe fn exchange(memory: &MemoryMap, incoming: u8) -> Option<u8> {
    let outgoing = memory.read_byte(REG_SB)?;

    memory.write_byte(REG_SB, incoming);

    if let Some(control) = memory.read_byte(REG_SC) {
        memory.write_byte(REG_SC, control & !SC_TRANSFER);
    }

    if let Some(flags) = memory.read_byte(REG_IF) {
        memory.write_byte(REG_IF, flags | IF_SERIAL);
    }

    Some(outgoing)
}

/// Probe the serial port: 1 when this peer is mid-transfer as master,
/// 0 when idle or receive-only, -1 when the core exposes no serial port.
///
/// # Safety
/// See `exchange`.
pub(crate) unsafe fn transfer_status(memory: &MemoryMap) -> i32 {
    let Some(control) = memory.read_byte(REG_SC) else {
        return -1;
    };

    if control & SC_TRANSFER != 0 && control & SC_INTERNAL_CLOCK != 0 {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory_map::Region;

    /// An I/O page plus the interrupt-flag byte, like a GB core's map.
    /// Boxed so the backing storage stays put when the page is returned.
    fn io_page() -> (Box<[u8; 0x80]>, MemoryMap) {
        let mut page = Box::new([0u8; 0x80]);
        let map = MemoryMap::from_regions(vec![Region::new(page.as_mut_ptr(), 0xFF00, 0x80)]);

        (page, map)
    }

    #[test]
    fn exchange_swaps_bytes_and_raises_the_interrupt() {
        let (mut page, map) = io_page();
        page[0x01] = 0xAB; // SB holds the outgoing byte
        page[0x02] = 0x81; // transfer + internal clock

        let outgoing = unsafe { exchange(&map, 0xCD) };

        assert_eq!(outgoing, Some(0xAB));
        assert_eq!(page[0x01], 0xCD);
        assert_eq!(page[0x02], 0x01); // transfer bit cleared
        assert_eq!(page[0x0F] & IF_SERIAL, IF_SERIAL);
    }

    #[test]
    fn status_reports_master_slave_and_idle() {
        let (mut page, map) = io_page();

        page[0x02] = 0x81;
        assert_eq!(unsafe { transfer_status(&map) }, 1);

        page[0x02] = 0x80;
        assert_eq!(unsafe { transfer_status(&map) }, 0);

        page[0x02] = 0x00;
        assert_eq!(unsafe { transfer_status(&map) }, 0);
    }

    #[test]
    fn unmapped_serial_port_reports_unsupported() {
        let map = MemoryMap::empty();

        assert_eq!(unsafe { transfer_status(&map) }, -1);
        assert_eq!(unsafe { exchange(&map, 0x12) }, None);
    }
}
