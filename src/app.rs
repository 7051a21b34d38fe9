//----------------------------------------------------------------------------------------------
// Module app
// Application callback interface of the XCP server
// The hosting application owns the measured and calibrated memory, the server only holds
// address offsets and cursors into it

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::platform;
use crate::protocol::CrcError;

// XCP GET_ID identification types
pub const XCP_IDT_ASCII: u8 = 0;
pub const XCP_IDT_ASAM_NAME: u8 = 1;
pub const XCP_IDT_ASAM_PATH: u8 = 2;
pub const XCP_IDT_ASAM_URL: u8 = 3;
pub const XCP_IDT_ASAM_UPLOAD: u8 = 4;
pub const XCP_IDT_ASAM_EPK: u8 = 5;

/// Callbacks from the XCP server protocol layer into the hosting application
///
/// Absolute (`ABS`) addressing exposes application memory through raw pointers, which is
/// inherently unchecked. The contract is the same as for the A2L description the XCP tool
/// works with: addresses handed to `get_pointer` come from the master and must be valid
/// for the process. Applications which can not guarantee this should serve reads and
/// writes through the checked `APP` addressing callbacks instead.
pub trait ApplicationCallbacks: Send + Sync {
    /// Monotonic 64 bit DAQ clock in ticks (default 1 tick = 1ns)
    fn get_clock(&self) -> u64 {
        platform::clock_get64()
    }

    /// Base address for absolute addressing DAQ lists
    /// DTO entry offsets of `ABS` DAQ lists are relative to this address
    fn get_base_addr(&self) -> *const u8;

    /// Resolve an (ext, addr) pair from SET_MTA to a pointer into application memory,
    /// None when the address is not mapped (surfaced to the master as access denied)
    ///
    /// # Safety
    /// The returned pointer must be valid for reads (and writes for calibration
    /// addresses) of the sizes subsequently transferred
    fn get_pointer(&self, ext: u8, addr: u32) -> Option<*mut u8>;

    /// Checked memory read for `APP` addressing, addr is an application defined handle
    fn read_memory(&self, _addr: u32, _dst: &mut [u8]) -> Result<(), CrcError> {
        Err(CrcError::AccessDenied)
    }

    /// Checked memory write for `APP` addressing
    fn write_memory(&self, _addr: u32, _src: &[u8]) -> Result<(), CrcError> {
        Err(CrcError::AccessDenied)
    }

    /// Veto an incoming CONNECT
    fn connect_permitted(&self) -> bool {
        true
    }

    /// Session ended (DISCONNECT, master address change or socket close)
    fn on_disconnect(&self) {}

    /// DAQ measurement about to start (START_STOP_SYNCH prepare), false refuses with an error
    fn prepare_daq(&self) -> bool {
        true
    }

    /// DAQ measurement started
    fn start_daq(&self) {}

    /// DAQ measurement stopped
    fn stop_daq(&self) {}

    /// Identification for GET_ID, None if the type is not available
    fn get_id(&self, id_type: u8) -> Option<Vec<u8>> {
        let _ = id_type;
        None
    }

    /// Read a chunk of the A2L description file for upload, false if not available
    fn read_a2l(&self, _offset: u32, _dst: &mut [u8]) -> bool {
        false
    }

    /// Switch the active calibration page of a segment
    fn set_cal_page(&self, _segment: u8, page: u8, _mode: u8) -> Result<(), CrcError> {
        if page == 0 {
            Ok(())
        } else {
            Err(CrcError::PageNotValid)
        }
    }

    /// Get the active calibration page of a segment
    fn get_cal_page(&self, _segment: u8, _mode: u8) -> u8 {
        0
    }

    /// Copy a calibration page
    fn copy_cal_page(&self, _src_segment: u8, _src_page: u8, _dst_segment: u8, _dst_page: u8) -> Result<(), CrcError> {
        Err(CrcError::PageNotValid)
    }

    /// Freeze (persist) the calibration segment, triggered by SET_REQUEST
    fn freeze_cal_page(&self, _segment: u8) -> Result<(), CrcError> {
        Err(CrcError::OutOfRange)
    }

    /// USER_CMD sub command
    fn user_command(&self, _cmd: u8) -> Result<(), CrcError> {
        Err(CrcError::CmdUnknown)
    }

    /// XCP clock state for TIME_CORRELATION_PROPERTIES (default free running)
    fn get_clock_state(&self) -> u8 {
        0
    }
}

//----------------------------------------------------------------------------------------------
// MemoryImageApplication
// A memory image backed application used by the demo and the tests

/// Application callbacks backed by a plain memory image
/// Address 0..size maps to the image, the image start is the `ABS` base address
pub struct MemoryImageApplication {
    name: &'static str,
    epk: &'static str,
    mem: Box<[std::cell::UnsafeCell<u8>]>,
}

// The image is read and written through raw pointers by the protocol layer (calibration)
// and the DAQ engine (sampling), concurrent word accesses are aligned atomic stores
unsafe impl Sync for MemoryImageApplication {}

impl MemoryImageApplication {
    pub fn new(name: &'static str, epk: &'static str, size: usize) -> MemoryImageApplication {
        let mut mem = Vec::with_capacity(size);
        mem.resize_with(size, || std::cell::UnsafeCell::new(0u8));
        MemoryImageApplication {
            name,
            epk,
            mem: mem.into_boxed_slice(),
        }
    }

    pub fn write_image(&self, addr: u32, data: &[u8]) {
        assert!(addr as usize + data.len() <= self.mem.len(), "address out of image");
        for (i, b) in data.iter().enumerate() {
            unsafe { *self.mem[addr as usize + i].get() = *b };
        }
    }

    pub fn read_image(&self, addr: u32, len: usize) -> Vec<u8> {
        assert!(addr as usize + len <= self.mem.len(), "address out of image");
        (0..len).map(|i| unsafe { *self.mem[addr as usize + i].get() }).collect()
    }
}

impl ApplicationCallbacks for MemoryImageApplication {
    fn get_base_addr(&self) -> *const u8 {
        self.mem.as_ptr() as *const u8
    }

    fn get_pointer(&self, _ext: u8, addr: u32) -> Option<*mut u8> {
        if (addr as usize) < self.mem.len() {
            Some(self.mem[addr as usize].get())
        } else {
            None
        }
    }

    fn read_memory(&self, addr: u32, dst: &mut [u8]) -> Result<(), CrcError> {
        if addr as usize + dst.len() > self.mem.len() {
            return Err(CrcError::AccessDenied);
        }
        for (i, b) in dst.iter_mut().enumerate() {
            *b = unsafe { *self.mem[addr as usize + i].get() };
        }
        Ok(())
    }

    fn write_memory(&self, addr: u32, src: &[u8]) -> Result<(), CrcError> {
        if addr as usize + src.len() > self.mem.len() {
            return Err(CrcError::AccessDenied);
        }
        self.write_image(addr, src);
        Ok(())
    }

    fn get_id(&self, id_type: u8) -> Option<Vec<u8>> {
        match id_type {
            XCP_IDT_ASCII | XCP_IDT_ASAM_NAME => Some(self.name.as_bytes().to_vec()),
            XCP_IDT_ASAM_EPK => Some(self.epk.as_bytes().to_vec()),
            _ => None,
        }
    }
}
