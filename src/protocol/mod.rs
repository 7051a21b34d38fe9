//----------------------------------------------------------------------------------------------
// Module protocol
// XCP 1.4 protocol layer: command decoder, connection state machine, memory transfer,
// DAQ and calibration page configuration
//
// The dispatcher consumes one command frame (len, bytes) and produces a tagged result
// which the transport layer turns into a positive response, a negative response or
// nothing. Commands with dynamic addressing (ext DYN) can not execute in the command
// handler context, they are parked in a single slot pending buffer and replayed from
// the event context which owns the base pointer.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

pub mod daq;

use crate::app::ApplicationCallbacks;
use crate::config::*;
use crate::xcp::{SessionStatus, Xcp};

//----------------------------------------------------------------------------------------------
// XCP packet identifiers (slave -> master)

pub const PID_RES: u8 = 0xFF; // positive response
pub const PID_ERR: u8 = 0xFE; // negative response
pub const PID_EV: u8 = 0xFD; // event
pub const PID_SERV: u8 = 0xFC; // service request

//----------------------------------------------------------------------------------------------
// XCP command codes

pub const CC_CONNECT: u8 = 0xFF;
pub const CC_DISCONNECT: u8 = 0xFE;
pub const CC_GET_STATUS: u8 = 0xFD;
pub const CC_SYNCH: u8 = 0xFC;
pub const CC_GET_COMM_MODE_INFO: u8 = 0xFB;
pub const CC_GET_ID: u8 = 0xFA;
pub const CC_SET_REQUEST: u8 = 0xF9;
pub const CC_SET_MTA: u8 = 0xF6;
pub const CC_UPLOAD: u8 = 0xF5;
pub const CC_SHORT_UPLOAD: u8 = 0xF4;
pub const CC_BUILD_CHECKSUM: u8 = 0xF3;
pub const CC_TRANSPORT_LAYER_CMD: u8 = 0xF2;
pub const CC_USER_CMD: u8 = 0xF1;
pub const CC_DOWNLOAD: u8 = 0xF0;
pub const CC_SHORT_DOWNLOAD: u8 = 0xED;
pub const CC_SET_CAL_PAGE: u8 = 0xEB;
pub const CC_GET_CAL_PAGE: u8 = 0xEA;
pub const CC_GET_PAG_PROCESSOR_INFO: u8 = 0xE9;
pub const CC_SET_SEGMENT_MODE: u8 = 0xE6;
pub const CC_GET_SEGMENT_MODE: u8 = 0xE5;
pub const CC_COPY_CAL_PAGE: u8 = 0xE4;
pub const CC_SET_DAQ_PTR: u8 = 0xE2;
pub const CC_WRITE_DAQ: u8 = 0xE1;
pub const CC_SET_DAQ_LIST_MODE: u8 = 0xE0;
pub const CC_GET_DAQ_LIST_MODE: u8 = 0xDF;
pub const CC_START_STOP_DAQ_LIST: u8 = 0xDE;
pub const CC_START_STOP_SYNCH: u8 = 0xDD;
pub const CC_GET_DAQ_CLOCK: u8 = 0xDC;
pub const CC_GET_DAQ_PROCESSOR_INFO: u8 = 0xDA;
pub const CC_GET_DAQ_RESOLUTION_INFO: u8 = 0xD9;
pub const CC_GET_DAQ_EVENT_INFO: u8 = 0xD7;
pub const CC_FREE_DAQ: u8 = 0xD6;
pub const CC_ALLOC_DAQ: u8 = 0xD5;
pub const CC_ALLOC_ODT: u8 = 0xD4;
pub const CC_ALLOC_ODT_ENTRY: u8 = 0xD3;
pub const CC_WRITE_DAQ_MULTIPLE: u8 = 0xC7;
pub const CC_TIME_CORRELATION_PROPERTIES: u8 = 0xC6;
pub const CC_NOP: u8 = 0xC1;
pub const CC_LEVEL_1_COMMAND: u8 = 0xC0;

// LEVEL_1_COMMAND sub commands
pub const CC_L1_GET_VERSION: u8 = 0x00;

// TRANSPORT_LAYER_CMD sub commands
pub const CC_TL_GET_SERVER_ID: u8 = 0xFF;
pub const CC_TL_GET_SERVER_ID_EXTENDED: u8 = 0xFE;
pub const CC_TL_GET_DAQ_CLOCK_MULTICAST: u8 = 0xFD;

//----------------------------------------------------------------------------------------------
// XCP error codes

pub const CRC_CMD_OK: u8 = 0x00;

/// Numeric error codes surfaced to the master in negative responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CrcError {
    CmdSynch = 0x00,
    CmdBusy = 0x10,
    CmdUnknown = 0x20,
    CmdSyntax = 0x21,
    OutOfRange = 0x22,
    WriteProtected = 0x23,
    AccessDenied = 0x24,
    AccessLocked = 0x25,
    PageNotValid = 0x26,
    ModeNotValid = 0x27,
    SegmentNotValid = 0x28,
    Sequence = 0x29,
    DaqConfig = 0x2A,
    MemoryOverflow = 0x30,
    Generic = 0x31,
    Verify = 0x32,
    ResourceTemporaryNotAccessible = 0x33,
    SubCmdUnknown = 0x34,
}

impl CrcError {
    pub fn code(self) -> u8 {
        self as u8
    }
}

//----------------------------------------------------------------------------------------------
// Protocol constants

// CONNECT resource bits
pub const RES_CAL_PAG: u8 = 0x01;
pub const RES_DAQ: u8 = 0x04;

// CONNECT comm mode basic: byte order little endian, address granularity byte,
// optional commands available
pub const COMM_MODE_BASIC: u8 = 0x80;

// Address extensions
pub const XCP_ADDR_EXT_APP: u8 = 0; // application read/write callbacks
pub const XCP_ADDR_EXT_ABS: u8 = 1; // absolute, resolved via get_pointer
pub const XCP_ADDR_EXT_DYN: u8 = 2; // event relative, deferred to the event context
pub const XCP_ADDR_EXT_A2L: u8 = 0xFD; // A2L description file upload

// Checksum types of BUILD_CHECKSUM
pub const XCP_CHECKSUM_TYPE_ADD11: u8 = 0x01; // byte sum
pub const XCP_CHECKSUM_TYPE_ADD44: u8 = 0x06; // 32 bit word sum

// GET_DAQ_PROCESSOR_INFO properties: dynamic config, timestamps, overload indication MSB
const DAQ_PROPERTIES: u8 = 0x51;

// SET_REQUEST mode bits
const SET_REQUEST_STORE_CAL: u8 = 0x01;

// TIME_CORRELATION_PROPERTIES set properties bits
const TIME_SYNCH_SET_RESPONSE_FMT: u8 = 0x03;

// START_STOP_DAQ_LIST modes
const SS_DAQ_LIST_STOP: u8 = 0;
const SS_DAQ_LIST_START: u8 = 1;
const SS_DAQ_LIST_SELECT: u8 = 2;

// START_STOP_SYNCH modes
const SS_SYNCH_STOP_ALL: u8 = 0;
const SS_SYNCH_START_SELECTED: u8 = 1;
const SS_SYNCH_STOP_SELECTED: u8 = 2;
const SS_SYNCH_PREPARE: u8 = 3;

//----------------------------------------------------------------------------------------------
// Command dispatch result

/// Result of one dispatched command, consumed by the transport layer loop
#[derive(Debug)]
pub enum XcpCmdResult {
    /// Positive response packet, starts with PID_RES
    Response(Vec<u8>),
    /// Negative response with an error code
    Error(CrcError),
    /// A deferred command is already in flight
    Busy,
    /// No response, the command is parked, answered elsewhere or NOP
    NoResponse,
}

// Execution context of the dispatcher
// Async replay from the event context supplies the base pointer for DYN addressing,
// writable only when the application triggered with mutable base memory
#[derive(Debug, Clone, Copy)]
pub enum CmdContext {
    Normal,
    Async { base: *const u8, base_len: usize, writable: bool },
}

/// The parked DYN addressing command of the single slot pending buffer
#[derive(Debug)]
pub struct PendingCommand {
    pub event: u16,
    pub data: Vec<u8>,
}

//----------------------------------------------------------------------------------------------
// Memory transfer address cursor

// The MTA cursor, set by SET_MTA or the short transfer commands and advanced by every
// transfer. The Ptr variant holds a raw pointer into application memory with the
// number of bytes remaining in its window (usize::MAX when unbounded).
#[derive(Debug)]
pub enum MtaCursor {
    Invalid,
    Ptr { ptr: *mut u8, limit: usize },
    App { addr: u32 },
    Dyn { addr: u32 },
    A2l { offset: u32 },
    Id { data: Vec<u8>, offset: u32 },
}

/// Serialized command handler state
#[derive(Debug)]
pub struct Protocol {
    pub mta: MtaCursor,
    pub daq_ptr: Option<(u16, u8, u8)>, // write cursor (daq, odt, entry idx)
    pub segment_mode: u8,
    pub cluster_id: u16,
}

// The raw MtaCursor::Ptr pointer is only dereferenced while the protocol mutex is held
// and points into memory the application promised to keep valid
unsafe impl Send for Protocol {}

impl Protocol {
    pub fn new() -> Protocol {
        Protocol {
            mta: MtaCursor::Invalid,
            daq_ptr: None,
            segment_mode: 0,
            cluster_id: 0,
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::new()
    }
}

//----------------------------------------------------------------------------------------------
// Response builder

// Little endian response assembly with natural alignment, the teacher of the layout is
// the XCP specification part 2
struct Response(Vec<u8>);

impl Response {
    fn new() -> Response {
        Response(vec![PID_RES])
    }

    fn add_u8(mut self, value: u8) -> Self {
        self.0.push(value);
        self
    }

    fn add_u16(mut self, value: u16) -> Self {
        debug_assert!(self.0.len() & 1 == 0, "add_u16: unaligned");
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn add_u32(mut self, value: u32) -> Self {
        debug_assert!(self.0.len() & 3 == 0, "add_u32: unaligned");
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn add_u64(mut self, value: u64) -> Self {
        debug_assert!(self.0.len() & 3 == 0, "add_u64: unaligned");
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn add_slice(mut self, value: &[u8]) -> Self {
        self.0.extend_from_slice(value);
        self
    }

    fn done(self) -> XcpCmdResult {
        debug_assert!(self.0.len() <= XCP_MAX_CTO_SIZE);
        XcpCmdResult::Response(self.0)
    }
}

#[inline]
fn cmd_u16(cmd: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([cmd[i], cmd[i + 1]])
}

#[inline]
fn cmd_u32(cmd: &[u8], i: usize) -> u32 {
    u32::from_le_bytes([cmd[i], cmd[i + 1], cmd[i + 2], cmd[i + 3]])
}

//----------------------------------------------------------------------------------------------
// Aligned memory access
// Downloads use width dispatched atomic stores so values sampled by the DAQ engine or
// read by the application are never torn, larger sizes fall back to bytewise copy

unsafe fn store_atomic(dst: *mut u8, src: &[u8]) {
    let a = dst as usize;
    match src.len() {
        1 => AtomicU8::from_ptr(dst).store(src[0], Ordering::Relaxed),
        2 if a & 1 == 0 => AtomicU16::from_ptr(dst as *mut u16).store(u16::from_le_bytes(src.try_into().unwrap()), Ordering::Relaxed),
        4 if a & 3 == 0 => AtomicU32::from_ptr(dst as *mut u32).store(u32::from_le_bytes(src.try_into().unwrap()), Ordering::Relaxed),
        8 if a & 7 == 0 => AtomicU64::from_ptr(dst as *mut u64).store(u64::from_le_bytes(src.try_into().unwrap()), Ordering::Relaxed),
        _ => std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()),
    }
}

unsafe fn load_atomic(src: *const u8, dst: &mut [u8]) {
    let a = src as usize;
    match dst.len() {
        1 => dst[0] = AtomicU8::from_ptr(src as *mut u8).load(Ordering::Relaxed),
        2 if a & 1 == 0 => dst.copy_from_slice(&AtomicU16::from_ptr(src as *mut u16).load(Ordering::Relaxed).to_le_bytes()),
        4 if a & 3 == 0 => dst.copy_from_slice(&AtomicU32::from_ptr(src as *mut u32).load(Ordering::Relaxed).to_le_bytes()),
        8 if a & 7 == 0 => dst.copy_from_slice(&AtomicU64::from_ptr(src as *mut u64).load(Ordering::Relaxed).to_le_bytes()),
        _ => std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()),
    }
}

//----------------------------------------------------------------------------------------------
// Command dispatcher

impl Xcp {
    /// Execute one XCP command frame and return the framed response packet, if any
    /// This is the transport layer entry point
    pub fn command(&self, cmd: &[u8]) -> Option<Vec<u8>> {
        let result = self.dispatch(cmd, CmdContext::Normal);
        Self::result_packet(result)
    }

    // Turn a dispatch result into a response packet
    pub(crate) fn result_packet(result: XcpCmdResult) -> Option<Vec<u8>> {
        match result {
            XcpCmdResult::Response(data) => Some(data),
            XcpCmdResult::Error(code) => Some(vec![PID_ERR, code.code()]),
            XcpCmdResult::Busy => Some(vec![PID_ERR, CrcError::CmdBusy.code()]),
            XcpCmdResult::NoResponse => None,
        }
    }

    pub(crate) fn dispatch(&self, cmd: &[u8], ctx: CmdContext) -> XcpCmdResult {
        if cmd.is_empty() {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let code = cmd[0];

        // Only CONNECT and the transport layer sub commands are accepted when not
        // connected, everything else is ignored without a response
        if !self.is_connected() && code != CC_CONNECT && code != CC_TRANSPORT_LAYER_CMD && code != CC_NOP {
            trace!("cmd 0x{:02X} ignored, not connected", code);
            return XcpCmdResult::NoResponse;
        }

        let mut p = self.protocol.lock();
        let result = match code {
            CC_CONNECT => self.cmd_connect(&mut p, cmd),
            CC_DISCONNECT => self.cmd_disconnect(),
            CC_GET_STATUS => self.cmd_get_status(),
            CC_SYNCH => XcpCmdResult::Error(CrcError::CmdSynch),
            CC_GET_COMM_MODE_INFO => self.cmd_get_comm_mode_info(),
            CC_GET_ID => self.cmd_get_id(&mut p, cmd),
            CC_SET_REQUEST => self.cmd_set_request(cmd),
            CC_SET_MTA => self.cmd_set_mta(&mut p, cmd, ctx),
            CC_UPLOAD => self.cmd_upload(&mut p, cmd, ctx),
            CC_SHORT_UPLOAD => self.cmd_short_upload(&mut p, cmd, ctx),
            CC_BUILD_CHECKSUM => self.cmd_build_checksum(&mut p, cmd, ctx),
            CC_TRANSPORT_LAYER_CMD => self.cmd_transport_layer(&mut p, cmd),
            CC_USER_CMD => self.cmd_user(cmd),
            CC_DOWNLOAD => self.cmd_download(&mut p, cmd, ctx),
            CC_SHORT_DOWNLOAD => self.cmd_short_download(&mut p, cmd, ctx),
            CC_SET_CAL_PAGE => self.cmd_set_cal_page(cmd),
            CC_GET_CAL_PAGE => self.cmd_get_cal_page(cmd),
            CC_GET_PAG_PROCESSOR_INFO => self.cmd_get_pag_processor_info(),
            CC_SET_SEGMENT_MODE => self.cmd_set_segment_mode(&mut p, cmd),
            CC_GET_SEGMENT_MODE => self.cmd_get_segment_mode(&mut p, cmd),
            CC_COPY_CAL_PAGE => self.cmd_copy_cal_page(cmd),
            CC_SET_DAQ_PTR => self.cmd_set_daq_ptr(&mut p, cmd),
            CC_WRITE_DAQ => self.cmd_write_daq(&mut p, cmd),
            CC_WRITE_DAQ_MULTIPLE => self.cmd_write_daq_multiple(&mut p, cmd),
            CC_SET_DAQ_LIST_MODE => self.cmd_set_daq_list_mode(cmd),
            CC_GET_DAQ_LIST_MODE => self.cmd_get_daq_list_mode(cmd),
            CC_START_STOP_DAQ_LIST => self.cmd_start_stop_daq_list(cmd),
            CC_START_STOP_SYNCH => self.cmd_start_stop_synch(cmd),
            CC_GET_DAQ_CLOCK => self.cmd_get_daq_clock(),
            CC_GET_DAQ_PROCESSOR_INFO => self.cmd_get_daq_processor_info(),
            CC_GET_DAQ_RESOLUTION_INFO => self.cmd_get_daq_resolution_info(),
            CC_GET_DAQ_EVENT_INFO => self.cmd_get_daq_event_info(&mut p, cmd),
            CC_FREE_DAQ => self.cmd_free_daq(&mut p),
            CC_ALLOC_DAQ => self.cmd_alloc_daq(cmd),
            CC_ALLOC_ODT => self.cmd_alloc_odt(cmd),
            CC_ALLOC_ODT_ENTRY => self.cmd_alloc_odt_entry(cmd),
            CC_TIME_CORRELATION_PROPERTIES => self.cmd_time_correlation_properties(&mut p, cmd),
            CC_LEVEL_1_COMMAND => self.cmd_level_1(cmd),
            CC_NOP => XcpCmdResult::NoResponse,
            _ => {
                debug!("unknown command 0x{:02X}", code);
                XcpCmdResult::Error(CrcError::CmdUnknown)
            }
        };

        if let XcpCmdResult::Error(code) = &result {
            debug!("cmd 0x{:02X} error response {:?}", cmd[0], code);
        }
        result
    }

    //------------------------------------------------------------------------------------------
    // Session control

    fn cmd_connect(&self, p: &mut Protocol, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 2 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        if !self.app.connect_permitted() {
            return XcpCmdResult::Error(CrcError::AccessDenied);
        }

        info!("CONNECT mode={}", cmd[1]);

        // A new session starts with a clean DAQ configuration and protocol state
        self.daq.write().free();
        *self.pending.lock() = None;
        *p = Protocol::new();
        self.status.store(
            (SessionStatus::SS_INITIALIZED | SessionStatus::SS_STARTED | SessionStatus::SS_CONNECTED | SessionStatus::SS_LEGACY_MODE).bits(),
            Ordering::Release,
        );

        Response::new()
            .add_u8(RES_DAQ | RES_CAL_PAG)
            .add_u8(COMM_MODE_BASIC)
            .add_u8(XCP_MAX_CTO_SIZE as u8)
            .add_u16(XCP_MAX_DTO_SIZE as u16)
            .add_u8((XCP_PROTOCOL_LAYER_VERSION >> 8) as u8)
            .add_u8((XCP_TRANSPORT_LAYER_VERSION >> 8) as u8)
            .done()
    }

    fn cmd_disconnect(&self) -> XcpCmdResult {
        info!("DISCONNECT");
        self.disconnect();
        Response::new().done()
    }

    fn cmd_get_status(&self) -> XcpCmdResult {
        let session: u8 = if self.is_daq_running() { 0x40 } else { 0x00 };
        Response::new()
            .add_u8(session)
            .add_u8(0) // resource protection, no seed/key
            .add_u8(0) // state number
            .add_u16(0) // session configuration id
            .done()
    }

    fn cmd_get_comm_mode_info(&self) -> XcpCmdResult {
        Response::new()
            .add_u8(0) // reserved
            .add_u8(0) // comm mode optional: no block mode, no interleaved mode
            .add_u8(0) // reserved
            .add_u8(0) // max bs
            .add_u8(0) // min st
            .add_u8(0) // queue size
            .add_u8(0x01) // driver version
            .done()
    }

    fn cmd_get_id(&self, p: &mut Protocol, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 2 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let id_type = cmd[1];
        match self.app.get_id(id_type) {
            Some(data) => {
                let len = data.len() as u32;
                if data.len() + 8 <= XCP_MAX_CTO_SIZE {
                    // Transfer in the response
                    Response::new().add_u8(0x01).add_u16(0).add_u32(len).add_slice(&data).done()
                } else {
                    // Arm the MTA for upload
                    p.mta = MtaCursor::Id { data, offset: 0 };
                    Response::new().add_u8(0x00).add_u16(0).add_u32(len).done()
                }
            }
            None => Response::new().add_u8(0x00).add_u16(0).add_u32(0).done(),
        }
    }

    fn cmd_set_request(&self, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 4 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let mode = cmd[1];
        if mode & SET_REQUEST_STORE_CAL != 0 {
            match self.app.freeze_cal_page(0) {
                Ok(()) => Response::new().done(),
                Err(e) => XcpCmdResult::Error(e),
            }
        } else {
            XcpCmdResult::Error(CrcError::OutOfRange)
        }
    }

    fn cmd_user(&self, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 2 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        match self.app.user_command(cmd[1]) {
            Ok(()) => Response::new().done(),
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_level_1(&self, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 2 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        match cmd[1] {
            CC_L1_GET_VERSION => Response::new()
                .add_u8(0)
                .add_u8((XCP_PROTOCOL_LAYER_VERSION >> 8) as u8)
                .add_u8(XCP_PROTOCOL_LAYER_VERSION as u8)
                .add_u8((XCP_TRANSPORT_LAYER_VERSION >> 8) as u8)
                .add_u8(XCP_TRANSPORT_LAYER_VERSION as u8)
                .done(),
            _ => XcpCmdResult::Error(CrcError::SubCmdUnknown),
        }
    }

    fn cmd_transport_layer(&self, p: &mut Protocol, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 2 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        match cmd[1] {
            CC_TL_GET_SERVER_ID | CC_TL_GET_SERVER_ID_EXTENDED => {
                // Discovery reply: magic, name length, name
                let name = self.name.as_bytes();
                let len = name.len().min(XCP_MAX_CTO_SIZE - 6);
                let mut r = Response::new().add_u8(b'X').add_u8(b'C').add_u8(b'P').add_u8(len as u8).add_slice(&name[..len]);
                if cmd[1] == CC_TL_GET_SERVER_ID_EXTENDED {
                    r = r.add_u8(0).add_slice(&p.cluster_id.to_le_bytes());
                }
                r.done()
            }
            CC_TL_GET_DAQ_CLOCK_MULTICAST => {
                if cmd.len() < 4 {
                    return XcpCmdResult::Error(CrcError::CmdSyntax);
                }
                let cluster_id = cmd_u16(cmd, 2);
                if cluster_id != p.cluster_id {
                    return XcpCmdResult::Error(CrcError::OutOfRange);
                }
                let clock = self.app.get_clock();
                Response::new()
                    .add_u8(0) // reserved
                    .add_u8(0) // trigger info: sampled during command processing
                    .add_u8(0x02) // payload format: 64 bit server clock
                    .add_u64(clock)
                    .add_u16(cluster_id)
                    .done()
            }
            _ => XcpCmdResult::Error(CrcError::SubCmdUnknown),
        }
    }

    //------------------------------------------------------------------------------------------
    // Memory transfer

    // Resolve an (ext, addr) pair into an MTA cursor
    fn resolve_mta(&self, ext: u8, addr: u32, ctx: CmdContext) -> Result<MtaCursor, CrcError> {
        match ext {
            XCP_ADDR_EXT_APP => Ok(MtaCursor::App { addr }),
            XCP_ADDR_EXT_ABS => match self.app.get_pointer(ext, addr) {
                Some(ptr) => Ok(MtaCursor::Ptr { ptr, limit: usize::MAX }),
                None => Err(CrcError::AccessDenied),
            },
            XCP_ADDR_EXT_DYN => {
                if let CmdContext::Async { base, base_len, .. } = ctx {
                    // Replay from the event context, the base pointer exists now
                    let offset = (addr & 0xFFFF) as u16 as i16;
                    let limit = if base_len == usize::MAX {
                        usize::MAX
                    } else {
                        if offset < 0 || offset as usize >= base_len {
                            return Err(CrcError::AccessDenied);
                        }
                        base_len - offset as usize
                    };
                    Ok(MtaCursor::Ptr {
                        ptr: unsafe { base.offset(offset as isize) as *mut u8 },
                        limit,
                    })
                } else {
                    Ok(MtaCursor::Dyn { addr })
                }
            }
            XCP_ADDR_EXT_A2L => Ok(MtaCursor::A2l { offset: addr }),
            _ => Err(CrcError::OutOfRange),
        }
    }

    // Dyn cursor handling shared by the MTA transfer commands: in the command handler
    // context the command is parked, in the event context the cursor resolves to a
    // pointer relative to the base supplied by the trigger
    fn dyn_cursor(&self, p: &mut Protocol, cmd: &[u8], ctx: CmdContext) -> Option<XcpCmdResult> {
        if let MtaCursor::Dyn { addr } = p.mta {
            match ctx {
                CmdContext::Normal => return Some(self.defer(cmd, addr)),
                CmdContext::Async { .. } => match self.resolve_mta(XCP_ADDR_EXT_DYN, addr, ctx) {
                    Ok(mta) => p.mta = mta,
                    Err(e) => return Some(XcpCmdResult::Error(e)),
                },
            }
        }
        None
    }

    // Defer a DYN addressing command into the pending buffer, it is replayed when the
    // event fires. Only one slot exists, interleaved mode is not supported.
    fn defer(&self, cmd: &[u8], addr: u32) -> XcpCmdResult {
        let event = (addr >> 16) as u16;
        let mut slot = self.pending.lock();
        if slot.is_some() {
            return XcpCmdResult::Busy;
        }
        trace!("defer cmd 0x{:02X} to event {}", cmd[0], event);
        *slot = Some(PendingCommand { event, data: cmd.to_vec() });
        self.status.fetch_or(SessionStatus::SS_CMD_PENDING.bits(), Ordering::Release);
        XcpCmdResult::NoResponse
    }

    // Read from the MTA cursor and advance it
    fn read_mta(&self, p: &mut Protocol, dst: &mut [u8]) -> Result<(), CrcError> {
        let n = dst.len();
        match &mut p.mta {
            MtaCursor::Ptr { ptr, limit } => {
                if n > *limit {
                    return Err(CrcError::AccessDenied);
                }
                unsafe { load_atomic(*ptr, dst) };
                *ptr = unsafe { ptr.add(n) };
                if *limit != usize::MAX {
                    *limit -= n;
                }
                Ok(())
            }
            MtaCursor::App { addr } => {
                self.app.read_memory(*addr, dst)?;
                *addr += n as u32;
                Ok(())
            }
            MtaCursor::A2l { offset } => {
                if !self.app.read_a2l(*offset, dst) {
                    return Err(CrcError::AccessDenied);
                }
                *offset += n as u32;
                Ok(())
            }
            MtaCursor::Id { data, offset } => {
                let start = *offset as usize;
                if start + n > data.len() {
                    return Err(CrcError::OutOfRange);
                }
                dst.copy_from_slice(&data[start..start + n]);
                *offset += n as u32;
                Ok(())
            }
            MtaCursor::Dyn { .. } | MtaCursor::Invalid => Err(CrcError::AccessDenied),
        }
    }

    // Write through the MTA cursor and advance it
    fn write_mta(&self, p: &mut Protocol, src: &[u8]) -> Result<(), CrcError> {
        let n = src.len();
        match &mut p.mta {
            MtaCursor::Ptr { ptr, limit } => {
                if n > *limit {
                    return Err(CrcError::AccessDenied);
                }
                unsafe { store_atomic(*ptr, src) };
                *ptr = unsafe { ptr.add(n) };
                if *limit != usize::MAX {
                    *limit -= n;
                }
                Ok(())
            }
            MtaCursor::App { addr } => {
                self.app.write_memory(*addr, src)?;
                *addr += n as u32;
                Ok(())
            }
            MtaCursor::A2l { .. } | MtaCursor::Id { .. } => Err(CrcError::WriteProtected),
            MtaCursor::Dyn { .. } | MtaCursor::Invalid => Err(CrcError::AccessDenied),
        }
    }

    fn cmd_set_mta(&self, p: &mut Protocol, cmd: &[u8], ctx: CmdContext) -> XcpCmdResult {
        if cmd.len() < 8 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let ext = cmd[3];
        let addr = cmd_u32(cmd, 4);
        trace!("SET_MTA ext={} addr=0x{:08X}", ext, addr);
        match self.resolve_mta(ext, addr, ctx) {
            Ok(mta) => {
                p.mta = mta;
                Response::new().done()
            }
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_upload(&self, p: &mut Protocol, cmd: &[u8], ctx: CmdContext) -> XcpCmdResult {
        if cmd.len() < 2 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let n = cmd[1] as usize;
        if n == 0 || n > XCP_MAX_CTO_SIZE - 1 {
            return XcpCmdResult::Error(CrcError::OutOfRange);
        }
        if let Some(result) = self.dyn_cursor(p, cmd, ctx) {
            return result;
        }
        let mut data = vec![0u8; n];
        match self.read_mta(p, &mut data) {
            Ok(()) => Response::new().add_slice(&data).done(),
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_short_upload(&self, p: &mut Protocol, cmd: &[u8], ctx: CmdContext) -> XcpCmdResult {
        if cmd.len() < 8 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let n = cmd[1] as usize;
        let ext = cmd[3];
        let addr = cmd_u32(cmd, 4);
        if n == 0 || n > XCP_MAX_CTO_SIZE - 1 {
            return XcpCmdResult::Error(CrcError::OutOfRange);
        }
        if ext == XCP_ADDR_EXT_DYN {
            if let CmdContext::Normal = ctx {
                return self.defer(cmd, addr);
            }
        }
        match self.resolve_mta(ext, addr, ctx) {
            Ok(mta) => p.mta = mta,
            Err(e) => return XcpCmdResult::Error(e),
        }
        let mut data = vec![0u8; n];
        match self.read_mta(p, &mut data) {
            Ok(()) => Response::new().add_slice(&data).done(),
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_download(&self, p: &mut Protocol, cmd: &[u8], ctx: CmdContext) -> XcpCmdResult {
        if cmd.len() < 2 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let n = cmd[1] as usize;
        if n == 0 || n > XCP_MAX_CTO_SIZE - 2 || cmd.len() < 2 + n {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        if let Some(result) = self.dyn_cursor(p, cmd, ctx) {
            return result;
        }
        if let CmdContext::Async { writable: false, .. } = ctx {
            return XcpCmdResult::Error(CrcError::AccessDenied);
        }
        match self.write_mta(p, &cmd[2..2 + n]) {
            Ok(()) => Response::new().done(),
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_short_download(&self, p: &mut Protocol, cmd: &[u8], ctx: CmdContext) -> XcpCmdResult {
        if cmd.len() < 8 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let n = cmd[1] as usize;
        let ext = cmd[3];
        let addr = cmd_u32(cmd, 4);
        if n == 0 || n > XCP_MAX_CTO_SIZE - 8 || cmd.len() < 8 + n {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        if ext == XCP_ADDR_EXT_DYN {
            if let CmdContext::Normal = ctx {
                return self.defer(cmd, addr);
            }
        }
        if let CmdContext::Async { writable: false, .. } = ctx {
            return XcpCmdResult::Error(CrcError::AccessDenied);
        }
        match self.resolve_mta(ext, addr, ctx) {
            Ok(mta) => p.mta = mta,
            Err(e) => return XcpCmdResult::Error(e),
        }
        match self.write_mta(p, &cmd[8..8 + n]) {
            Ok(()) => Response::new().done(),
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_build_checksum(&self, p: &mut Protocol, cmd: &[u8], ctx: CmdContext) -> XcpCmdResult {
        if cmd.len() < 8 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let n = cmd_u32(cmd, 4);
        if n == 0 || n > 0x0010_0000 {
            return XcpCmdResult::Error(CrcError::OutOfRange);
        }
        if let Some(result) = self.dyn_cursor(p, cmd, ctx) {
            return result;
        }

        // add11 (byte sum) unless the block is a whole number of 32 bit words
        let add44 = n % 4 == 0;
        let mut sum8: u8 = 0;
        let mut sum32: u32 = 0;
        let mut remaining = n as usize;
        let mut chunk = [0u8; 256];
        while remaining > 0 {
            let take = remaining.min(chunk.len());
            if let Err(e) = self.read_mta(p, &mut chunk[..take]) {
                return XcpCmdResult::Error(e);
            }
            if add44 {
                for w in chunk[..take].chunks_exact(4) {
                    sum32 = sum32.wrapping_add(u32::from_le_bytes(w.try_into().unwrap()));
                }
            } else {
                for b in &chunk[..take] {
                    sum8 = sum8.wrapping_add(*b);
                }
            }
            remaining -= take;
        }

        let (checksum_type, checksum) = if add44 { (XCP_CHECKSUM_TYPE_ADD44, sum32) } else { (XCP_CHECKSUM_TYPE_ADD11, sum8 as u32) };
        Response::new().add_u8(checksum_type).add_u16(0).add_u32(checksum).done()
    }

    //------------------------------------------------------------------------------------------
    // Calibration page switching

    fn cmd_set_cal_page(&self, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 4 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let (mode, segment, page) = (cmd[1], cmd[2], cmd[3]);
        debug!("SET_CAL_PAGE mode=0x{:02X} segment={} page={}", mode, segment, page);
        match self.app.set_cal_page(segment, page, mode) {
            Ok(()) => Response::new().done(),
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_get_cal_page(&self, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 3 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let (mode, segment) = (cmd[1], cmd[2]);
        let page = self.app.get_cal_page(segment, mode);
        if page == 0xFF {
            return XcpCmdResult::Error(CrcError::ModeNotValid);
        }
        Response::new().add_u8(0).add_u8(0).add_u8(page).done()
    }

    fn cmd_copy_cal_page(&self, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 5 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        match self.app.copy_cal_page(cmd[1], cmd[2], cmd[3], cmd[4]) {
            Ok(()) => Response::new().done(),
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_get_pag_processor_info(&self) -> XcpCmdResult {
        Response::new()
            .add_u8(1) // max segments
            .add_u8(0x01) // pag properties: freeze supported
            .done()
    }

    fn cmd_set_segment_mode(&self, p: &mut Protocol, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 3 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let (mode, segment) = (cmd[1], cmd[2]);
        if segment != 0 {
            return XcpCmdResult::Error(CrcError::SegmentNotValid);
        }
        p.segment_mode = mode;
        Response::new().done()
    }

    fn cmd_get_segment_mode(&self, p: &mut Protocol, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 3 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let segment = cmd[2];
        if segment != 0 {
            return XcpCmdResult::Error(CrcError::SegmentNotValid);
        }
        Response::new().add_u8(0).add_u8(p.segment_mode).done()
    }

    //------------------------------------------------------------------------------------------
    // DAQ configuration

    // DAQ configuration is only legal while measurement is stopped, the start transition
    // is a store release on the status word
    fn daq_config_allowed(&self) -> Result<(), CrcError> {
        if self.is_daq_running() {
            Err(CrcError::Sequence)
        } else {
            Ok(())
        }
    }

    fn cmd_free_daq(&self, p: &mut Protocol) -> XcpCmdResult {
        if let Err(e) = self.daq_config_allowed() {
            return XcpCmdResult::Error(e);
        }
        self.daq.write().free();
        p.daq_ptr = None;
        Response::new().done()
    }

    fn cmd_alloc_daq(&self, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 4 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        if let Err(e) = self.daq_config_allowed() {
            return XcpCmdResult::Error(e);
        }
        let count = cmd_u16(cmd, 2);
        match self.daq.write().alloc_daq(count) {
            Ok(()) => Response::new().done(),
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_alloc_odt(&self, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 5 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        if let Err(e) = self.daq_config_allowed() {
            return XcpCmdResult::Error(e);
        }
        let daq = cmd_u16(cmd, 2);
        let count = cmd[4];
        match self.daq.write().alloc_odt(daq, count) {
            Ok(()) => Response::new().done(),
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_alloc_odt_entry(&self, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 6 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        if let Err(e) = self.daq_config_allowed() {
            return XcpCmdResult::Error(e);
        }
        let daq = cmd_u16(cmd, 2);
        let (odt, count) = (cmd[4], cmd[5]);
        match self.daq.write().alloc_odt_entry(daq, odt, count) {
            Ok(()) => Response::new().done(),
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_set_daq_ptr(&self, p: &mut Protocol, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 6 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        if let Err(e) = self.daq_config_allowed() {
            return XcpCmdResult::Error(e);
        }
        let daq = cmd_u16(cmd, 2);
        let (odt, idx) = (cmd[4], cmd[5]);
        // Validate the position, the write cursor autoincrements but does not wrap
        let daq_lists = self.daq.read();
        match daq_lists.odt_index(daq, odt) {
            Ok(odt_abs) => {
                let o = &daq_lists.odts[odt_abs];
                if o.first_odt_entry as usize + idx as usize > o.last_odt_entry as usize {
                    return XcpCmdResult::Error(CrcError::OutOfRange);
                }
                p.daq_ptr = Some((daq, odt, idx));
                Response::new().done()
            }
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_write_daq(&self, p: &mut Protocol, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 8 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        if let Err(e) = self.daq_config_allowed() {
            return XcpCmdResult::Error(e);
        }
        let bit_offset = cmd[1];
        let size = cmd[2];
        let ext = cmd[3];
        let addr = cmd_u32(cmd, 4);
        match self.write_daq_entry(p, bit_offset, size, ext, addr) {
            Ok(()) => Response::new().done(),
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_write_daq_multiple(&self, p: &mut Protocol, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 2 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        if let Err(e) = self.daq_config_allowed() {
            return XcpCmdResult::Error(e);
        }
        let count = cmd[1] as usize;
        if cmd.len() < 2 + count * 8 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        for i in 0..count {
            let e = 2 + i * 8;
            let bit_offset = cmd[e];
            let size = cmd[e + 1];
            let addr = cmd_u32(cmd, e + 2);
            let ext = cmd[e + 6];
            if let Err(err) = self.write_daq_entry(p, bit_offset, size, ext, addr) {
                return XcpCmdResult::Error(err);
            }
        }
        Response::new().done()
    }

    // Shared by WRITE_DAQ and WRITE_DAQ_MULTIPLE, advances the write cursor
    fn write_daq_entry(&self, p: &mut Protocol, bit_offset: u8, size: u8, ext: u8, addr: u32) -> Result<(), CrcError> {
        if bit_offset != 0 && bit_offset != 0xFF {
            return Err(CrcError::OutOfRange); // bit granularity not supported
        }
        let (daq, odt, idx) = p.daq_ptr.ok_or(CrcError::Sequence)?;
        let offset: i32 = match ext {
            XCP_ADDR_EXT_ABS => addr as i32,
            XCP_ADDR_EXT_DYN => (addr & 0xFFFF) as u16 as i16 as i32,
            _ => return Err(CrcError::OutOfRange),
        };
        self.daq.write().write_entry(daq, odt, idx, ext, offset, size)?;
        // The cursor does not wrap across ODTs, writing past the last entry fails
        p.daq_ptr = Some((daq, odt, idx + 1));
        Ok(())
    }

    fn cmd_set_daq_list_mode(&self, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 8 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        if let Err(e) = self.daq_config_allowed() {
            return XcpCmdResult::Error(e);
        }
        let mode = cmd[1];
        let daq = cmd_u16(cmd, 2);
        let event = cmd_u16(cmd, 4);
        let prescaler = cmd[6];
        let priority = cmd[7];
        if prescaler > 1 {
            return XcpCmdResult::Error(CrcError::OutOfRange); // prescalers not supported
        }
        if mode & 0x10 == 0 {
            return XcpCmdResult::Error(CrcError::DaqConfig); // timestamps are fixed on
        }
        {
            let events = self.events.read();
            if !events.is_empty() && event as usize >= events.len() {
                return XcpCmdResult::Error(CrcError::OutOfRange);
            }
        }
        match self.daq.write().set_list_mode(daq, event, mode, priority) {
            Ok(()) => Response::new().done(),
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_get_daq_list_mode(&self, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 4 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let daq = cmd_u16(cmd, 2);
        match self.daq.read().get_list_mode(daq) {
            Ok((mode, _event, priority)) => Response::new()
                .add_u8(mode)
                .add_u16(0) // reserved
                .add_u8(1) // prescaler
                .add_u8(priority)
                .done(),
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_start_stop_daq_list(&self, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 4 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let mode = cmd[1];
        let daq = cmd_u16(cmd, 2);
        let result = {
            let daq_lists = self.daq.read();
            match mode {
                SS_DAQ_LIST_STOP => daq_lists.stop(daq),
                SS_DAQ_LIST_START => daq_lists.start(daq),
                SS_DAQ_LIST_SELECT => daq_lists.select(daq),
                _ => Err(CrcError::OutOfRange),
            }
        };
        match result {
            Ok(()) => {
                match mode {
                    SS_DAQ_LIST_START => self.start_daq(),
                    SS_DAQ_LIST_STOP => {
                        if !self.daq.read().any_running() {
                            self.stop_daq();
                        }
                    }
                    _ => {}
                }
                Response::new().add_u8(0).done() // first pid, relative ODT numbers start at 0
            }
            Err(e) => XcpCmdResult::Error(e),
        }
    }

    fn cmd_start_stop_synch(&self, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 2 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let mode = cmd[1];
        match mode {
            SS_SYNCH_STOP_ALL => {
                self.daq.read().stop_all();
                self.stop_daq();
                Response::new().done()
            }
            SS_SYNCH_START_SELECTED => {
                if !self.daq.read().start_selected() {
                    return XcpCmdResult::Error(CrcError::DaqConfig);
                }
                self.start_daq();
                Response::new().done()
            }
            SS_SYNCH_STOP_SELECTED => {
                self.daq.read().stop_selected();
                if !self.daq.read().any_running() {
                    self.stop_daq();
                }
                Response::new().done()
            }
            SS_SYNCH_PREPARE => {
                if !self.daq.read().any_selected() {
                    return XcpCmdResult::Error(CrcError::DaqConfig);
                }
                if !self.app.prepare_daq() {
                    return XcpCmdResult::Error(CrcError::ResourceTemporaryNotAccessible);
                }
                Response::new().done()
            }
            _ => XcpCmdResult::Error(CrcError::OutOfRange),
        }
    }

    //------------------------------------------------------------------------------------------
    // DAQ info and clock

    fn cmd_get_daq_processor_info(&self) -> XcpCmdResult {
        let max_event = self.events.read().len() as u16;
        // Identification field type: relative ODT number with absolute DAQ number byte or word
        let daq_key_byte: u8 = if XCP_DAQ_HEADER_SIZE == 4 { 0xC0 } else { 0x40 };
        Response::new()
            .add_u8(DAQ_PROPERTIES)
            .add_u16(XCP_MAX_DAQ_COUNT as u16)
            .add_u16(max_event)
            .add_u8(0) // min daq
            .add_u8(daq_key_byte)
            .done()
    }

    fn cmd_get_daq_resolution_info(&self) -> XcpCmdResult {
        // Timestamp mode: size, fixed, unit
        let timestamp_mode: u8 = (XCP_TIMESTAMP_SIZE as u8 & 0x07) | 0x08 | (XCP_TIMESTAMP_UNIT << 4);
        Response::new()
            .add_u8(1) // granularity odt entry daq
            .add_u8(XCP_MAX_ODT_ENTRY_SIZE as u8)
            .add_u8(1) // granularity odt entry stim
            .add_u8(0) // max size stim, not supported
            .add_u8(timestamp_mode)
            .add_u16(XCP_TIMESTAMP_TICKS)
            .done()
    }

    fn cmd_get_daq_event_info(&self, p: &mut Protocol, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 4 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let event = cmd_u16(cmd, 2);
        let events = self.events.read();
        let Some(descriptor) = events.get(event as usize) else {
            return XcpCmdResult::Error(CrcError::OutOfRange);
        };
        let (time_cycle, time_unit) = descriptor.time_cycle();
        let name = descriptor.name.as_bytes().to_vec();
        let name_len = name.len() as u8;
        let priority = descriptor.priority;
        drop(events);
        // The master uploads the event name through the MTA
        p.mta = MtaCursor::Id { data: name, offset: 0 };
        Response::new()
            .add_u8(0x04) // properties: DAQ direction
            .add_u8(0xFF) // max daq lists
            .add_u8(name_len)
            .add_u8(time_cycle)
            .add_u8(time_unit)
            .add_u8(priority)
            .done()
    }

    fn cmd_get_daq_clock(&self) -> XcpCmdResult {
        let clock = self.app.get_clock();
        if self.status().contains(SessionStatus::SS_LEGACY_MODE) {
            // XCP 1.3 response format, 32 bit timestamp
            Response::new().add_u8(0).add_u8(0).add_u8(0).add_u32(clock as u32).done()
        } else {
            Response::new()
                .add_u8(0) // reserved
                .add_u8(0) // trigger info: sampled during command processing
                .add_u8(0x02) // payload format: 64 bit server clock
                .add_u64(clock)
                .done()
        }
    }

    fn cmd_time_correlation_properties(&self, p: &mut Protocol, cmd: &[u8]) -> XcpCmdResult {
        if cmd.len() < 6 {
            return XcpCmdResult::Error(CrcError::CmdSyntax);
        }
        let set_properties = cmd[1];
        let cluster_id = cmd_u16(cmd, 4);

        if set_properties & TIME_SYNCH_SET_RESPONSE_FMT != 0 {
            // Switch GET_DAQ_CLOCK and the multicast responses to the extended format
            self.status_clear(SessionStatus::SS_LEGACY_MODE);
        }
        p.cluster_id = cluster_id;

        let server_config: u8 = if self.status().contains(SessionStatus::SS_LEGACY_MODE) { 0x00 } else { 0x02 };
        Response::new()
            .add_u8(server_config)
            .add_u8(0) // observable clocks: server clock only
            .add_u8(self.app.get_clock_state())
            .add_u8(0) // clock info: no info blocks armed
            .add_u8(0) // reserved
            .add_u16(cluster_id)
            .done()
    }
}

//----------------------------------------------------------------------------------------------
// Event descriptor

/// Descriptor of an application event channel
/// The per event mutex serialises the clock read and queue reserve pair of concurrent
/// triggers of the same event, which keeps DTO timestamps monotonic
#[derive(Debug)]
pub struct XcpEventDescriptor {
    pub name: &'static str,
    pub priority: u8,
    pub cycle_time_ns: u32,
    pub(crate) lock: parking_lot::Mutex<u64>, // last timestamp
}

impl XcpEventDescriptor {
    pub fn new(name: &'static str, cycle_time_ns: u32, priority: u8) -> XcpEventDescriptor {
        XcpEventDescriptor {
            name,
            priority,
            cycle_time_ns,
            lock: parking_lot::Mutex::new(0),
        }
    }

    // (cycle, unit) encoding of GET_DAQ_EVENT_INFO, unit is a power of ten ns exponent
    // step, cycle 0 means sporadic
    pub fn time_cycle(&self) -> (u8, u8) {
        let mut cycle = self.cycle_time_ns;
        let mut unit = 0u8;
        if cycle == 0 {
            return (0, 0);
        }
        while cycle >= 256 {
            cycle /= 10;
            unit += 1;
        }
        (cycle as u8, unit)
    }
}

pub use daq::{DaqListMode, DaqLists};
