//----------------------------------------------------------------------------------------------
// Module daq
// Dynamic DAQ list configuration tables and the event sampling engine
//
// The configuration is built by the master with FREE_DAQ, ALLOC_DAQ, ALLOC_ODT,
// ALLOC_ODT_ENTRY and WRITE_DAQ. Three tables are allocated monotonically against a byte
// budget which emulates the fixed size arena of small targets. ODT entries hold signed
// offsets relative to a base pointer supplied per event trigger (dynamic addressing) or
// to the application base address (absolute addressing).

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::sync::atomic::{AtomicU8, Ordering};

use crate::config::*;
use crate::protocol::CrcError;
use crate::queue::QueueProducer;

// Validity tag of a configured arena, checked at event time
pub const DAQ_LISTS_TAG: u16 = 0xBEAC;

// Table index sentinels of unallocated lists and ODTs
pub const DAQ_UNDEFINED_EVENT: u16 = 0xFFFF;
pub const DAQ_UNDEFINED_ADDR_EXT: u8 = 0xFF;
const DAQ_UNDEFINED_INDEX: u16 = 0xFFFF;

bitflags::bitflags! {
    /// DAQ list mode byte of SET_DAQ_LIST_MODE / GET_DAQ_LIST_MODE
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DaqListMode: u8 {
        const DIRECTION = 0x02; // STIM, not supported
        const TIMESTAMP = 0x10;
        const PID_OFF   = 0x20; // not supported
    }
}

// DAQ list state byte, written from the command thread (select, start, stop)
// and from event threads (overrun), so it is an atomic
pub const DAQ_STATE_SELECTED: u8 = 0x01;
pub const DAQ_STATE_RUNNING: u8 = 0x02;
pub const DAQ_STATE_OVERRUN: u8 = 0x04;

// Overrun indication: the MSB of the relative ODT number is set in the first frame
// transmitted after an overrun of this DAQ list
const ODT_PID_OVERRUN: u8 = 0x80;

//----------------------------------------------------------------------------------------------
// Tables

/// One (offset, size) pair describing a single scalar in an ODT
#[derive(Debug, Clone, Copy, Default)]
pub struct OdtEntry {
    pub offset: i32,
    pub size: u8,
}

/// One packet worth of concatenated samples
#[derive(Debug, Clone, Copy)]
pub struct Odt {
    pub first_odt_entry: u16,
    pub last_odt_entry: u16,
    pub size: u16, // sum of the entry sizes
}

/// A set of ODTs sharing one event trigger
#[derive(Debug)]
pub struct DaqList {
    pub first_odt: u16,
    pub last_odt: u16,
    pub event_channel: u16,
    pub addr_ext: u8, // uniform within the list
    pub mode: DaqListMode,
    pub priority: u8,
    pub state: AtomicU8,
}

impl DaqList {
    fn has_odts(&self) -> bool {
        self.first_odt != DAQ_UNDEFINED_INDEX
    }
}

// Allocation phase, commands out of the legal FREE -> ALLOC_DAQ -> ALLOC_ODT ->
// ALLOC_ODT_ENTRY order are rejected with CRC_SEQUENCE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocPhase {
    Fresh,
    Daq,
    Odt,
    OdtEntry,
}

/// The DAQ configuration arena
#[derive(Debug)]
pub struct DaqLists {
    tag: u16,
    phase: AllocPhase,
    mem_used: usize, // monotonic allocation against XCP_DAQ_MEM_SIZE
    pub lists: Vec<DaqList>,
    pub odts: Vec<Odt>,
    pub odt_entries: Vec<OdtEntry>,
}

impl DaqLists {
    pub fn new() -> DaqLists {
        DaqLists {
            tag: 0,
            phase: AllocPhase::Fresh,
            mem_used: 0,
            lists: Vec::new(),
            odts: Vec::new(),
            odt_entries: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.tag == DAQ_LISTS_TAG
    }

    /// FREE_DAQ
    pub fn free(&mut self) {
        self.tag = 0;
        self.phase = AllocPhase::Fresh;
        self.mem_used = 0;
        self.lists.clear();
        self.odts.clear();
        self.odt_entries.clear();
    }

    // Account an allocation against the arena budget
    fn alloc_mem(&mut self, bytes: usize) -> Result<(), CrcError> {
        if self.mem_used + bytes > XCP_DAQ_MEM_SIZE {
            return Err(CrcError::MemoryOverflow);
        }
        self.mem_used += bytes;
        Ok(())
    }

    /// ALLOC_DAQ
    pub fn alloc_daq(&mut self, count: u16) -> Result<(), CrcError> {
        if self.phase != AllocPhase::Fresh || !self.lists.is_empty() {
            return Err(CrcError::Sequence);
        }
        if count == 0 || count as usize > XCP_MAX_DAQ_COUNT {
            return Err(CrcError::OutOfRange);
        }
        self.alloc_mem(count as usize * std::mem::size_of::<DaqList>())?;
        for _ in 0..count {
            self.lists.push(DaqList {
                first_odt: DAQ_UNDEFINED_INDEX,
                last_odt: DAQ_UNDEFINED_INDEX,
                event_channel: DAQ_UNDEFINED_EVENT,
                addr_ext: DAQ_UNDEFINED_ADDR_EXT,
                mode: DaqListMode::empty(),
                priority: 0,
                state: AtomicU8::new(0),
            });
        }
        self.phase = AllocPhase::Daq;
        self.tag = DAQ_LISTS_TAG;
        Ok(())
    }

    /// ALLOC_ODT
    /// ODTs of one DAQ list are contiguous, a list can only be extended while it is the
    /// most recently allocated one
    pub fn alloc_odt(&mut self, daq: u16, count: u8) -> Result<(), CrcError> {
        if self.phase != AllocPhase::Daq && self.phase != AllocPhase::Odt {
            return Err(CrcError::Sequence);
        }
        if count == 0 {
            return Err(CrcError::OutOfRange);
        }
        let first_new = self.odts.len();
        if first_new + count as usize >= DAQ_UNDEFINED_INDEX as usize {
            return Err(CrcError::OutOfRange);
        }
        let list = self.lists.get(daq as usize).ok_or(CrcError::OutOfRange)?;
        let (first, last) = if !list.has_odts() {
            (first_new as u16, (first_new + count as usize - 1) as u16)
        } else if list.last_odt as usize == first_new - 1 {
            (list.first_odt, (first_new + count as usize - 1) as u16)
        } else {
            return Err(CrcError::Sequence);
        };
        // The relative ODT number is 7 bit, the MSB is the overrun indicator
        if last - first >= 0x7C {
            return Err(CrcError::OutOfRange);
        }
        self.alloc_mem(count as usize * std::mem::size_of::<Odt>())?;
        for _ in 0..count {
            self.odts.push(Odt {
                first_odt_entry: DAQ_UNDEFINED_INDEX,
                last_odt_entry: DAQ_UNDEFINED_INDEX,
                size: 0,
            });
        }
        let list = &mut self.lists[daq as usize];
        list.first_odt = first;
        list.last_odt = last;
        self.phase = AllocPhase::Odt;
        Ok(())
    }

    /// ALLOC_ODT_ENTRY
    pub fn alloc_odt_entry(&mut self, daq: u16, odt: u8, count: u8) -> Result<(), CrcError> {
        if self.phase != AllocPhase::Odt && self.phase != AllocPhase::OdtEntry {
            return Err(CrcError::Sequence);
        }
        if count == 0 {
            return Err(CrcError::OutOfRange);
        }
        let odt_abs = self.odt_index(daq, odt)?;
        let first_new = self.odt_entries.len();
        if first_new + count as usize >= DAQ_UNDEFINED_INDEX as usize {
            return Err(CrcError::OutOfRange);
        }
        if self.odts[odt_abs].first_odt_entry != DAQ_UNDEFINED_INDEX {
            return Err(CrcError::Sequence);
        }
        self.alloc_mem(count as usize * std::mem::size_of::<OdtEntry>())?;
        for _ in 0..count {
            self.odt_entries.push(OdtEntry::default());
        }
        let o = &mut self.odts[odt_abs];
        o.first_odt_entry = first_new as u16;
        o.last_odt_entry = (first_new + count as usize - 1) as u16;
        self.phase = AllocPhase::OdtEntry;
        Ok(())
    }

    // Absolute ODT index of (daq, relative odt)
    pub fn odt_index(&self, daq: u16, odt: u8) -> Result<usize, CrcError> {
        let list = self.lists.get(daq as usize).ok_or(CrcError::OutOfRange)?;
        if !list.has_odts() {
            return Err(CrcError::DaqConfig);
        }
        let idx = list.first_odt as usize + odt as usize;
        if idx > list.last_odt as usize {
            return Err(CrcError::OutOfRange);
        }
        Ok(idx)
    }

    /// WRITE_DAQ, write one ODT entry at the (daq, odt, idx) cursor position
    pub fn write_entry(&mut self, daq: u16, odt: u8, idx: u8, ext: u8, offset: i32, size: u8) -> Result<(), CrcError> {
        if self.phase != AllocPhase::OdtEntry {
            return Err(CrcError::Sequence);
        }
        if size == 0 || size as usize > XCP_MAX_ODT_ENTRY_SIZE {
            return Err(CrcError::OutOfRange);
        }
        let odt_abs = self.odt_index(daq, odt)?;
        let list = &self.lists[daq as usize];

        // Address extension must be uniform within one DAQ list
        if list.addr_ext != DAQ_UNDEFINED_ADDR_EXT && list.addr_ext != ext {
            return Err(CrcError::DaqConfig);
        }

        let o = self.odts[odt_abs];
        if o.first_odt_entry == DAQ_UNDEFINED_INDEX {
            return Err(CrcError::DaqConfig);
        }
        let entry_abs = o.first_odt_entry as usize + idx as usize;
        if entry_abs > o.last_odt_entry as usize {
            return Err(CrcError::OutOfRange);
        }

        // The DTO must hold the identification field, the timestamp in the first ODT
        // of the list and all entries
        let first = odt_abs == list.first_odt as usize;
        let header = XCP_DAQ_HEADER_SIZE + if first { XCP_TIMESTAMP_SIZE } else { 0 };
        let old = self.odt_entries[entry_abs].size as usize;
        let new_size = o.size as usize - old + size as usize;
        if new_size + header > XCP_MAX_DTO_SIZE {
            return Err(CrcError::DaqConfig);
        }

        self.odt_entries[entry_abs] = OdtEntry { offset, size };
        self.odts[odt_abs].size = new_size as u16;
        self.lists[daq as usize].addr_ext = ext;
        Ok(())
    }

    /// SET_DAQ_LIST_MODE
    pub fn set_list_mode(&mut self, daq: u16, event: u16, mode: u8, priority: u8) -> Result<(), CrcError> {
        let mode = DaqListMode::from_bits(mode).ok_or(CrcError::DaqConfig)?;
        if mode.contains(DaqListMode::DIRECTION) || mode.contains(DaqListMode::PID_OFF) {
            return Err(CrcError::DaqConfig); // STIM and PID_OFF not supported
        }
        let list = self.lists.get_mut(daq as usize).ok_or(CrcError::OutOfRange)?;
        list.event_channel = event;
        list.mode = mode;
        list.priority = priority;
        Ok(())
    }

    /// GET_DAQ_LIST_MODE
    pub fn get_list_mode(&self, daq: u16) -> Result<(u8, u16, u8), CrcError> {
        let list = self.lists.get(daq as usize).ok_or(CrcError::OutOfRange)?;
        Ok((list.mode.bits(), list.event_channel, list.priority))
    }

    // A list is startable when it has an event, ODTs and every entry written
    fn validate_list(&self, list: &DaqList) -> Result<(), CrcError> {
        if list.event_channel == DAQ_UNDEFINED_EVENT || !list.has_odts() {
            return Err(CrcError::DaqConfig);
        }
        for odt_abs in list.first_odt..=list.last_odt {
            let o = &self.odts[odt_abs as usize];
            if o.first_odt_entry == DAQ_UNDEFINED_INDEX {
                return Err(CrcError::DaqConfig);
            }
            let mut sum = 0usize;
            for e in o.first_odt_entry..=o.last_odt_entry {
                let entry = &self.odt_entries[e as usize];
                if entry.size == 0 {
                    return Err(CrcError::DaqConfig);
                }
                sum += entry.size as usize;
            }
            if sum != o.size as usize {
                return Err(CrcError::DaqConfig);
            }
        }
        Ok(())
    }

    /// START_STOP_DAQ_LIST select
    pub fn select(&self, daq: u16) -> Result<(), CrcError> {
        let list = self.lists.get(daq as usize).ok_or(CrcError::OutOfRange)?;
        self.validate_list(list)?;
        list.state.fetch_or(DAQ_STATE_SELECTED, Ordering::Relaxed);
        Ok(())
    }

    /// START_STOP_DAQ_LIST start, single list
    pub fn start(&self, daq: u16) -> Result<(), CrcError> {
        let list = self.lists.get(daq as usize).ok_or(CrcError::OutOfRange)?;
        self.validate_list(list)?;
        list.state.store(DAQ_STATE_RUNNING, Ordering::Release);
        Ok(())
    }

    /// START_STOP_DAQ_LIST stop, single list
    pub fn stop(&self, daq: u16) -> Result<(), CrcError> {
        let list = self.lists.get(daq as usize).ok_or(CrcError::OutOfRange)?;
        list.state.store(0, Ordering::Release);
        Ok(())
    }

    /// START_STOP_SYNCH prepare / start_selected, returns false if nothing is selected
    pub fn start_selected(&self) -> bool {
        let mut any = false;
        for list in &self.lists {
            if list.state.load(Ordering::Relaxed) & DAQ_STATE_SELECTED != 0 {
                list.state.store(DAQ_STATE_RUNNING, Ordering::Release);
                any = true;
            }
        }
        any
    }

    /// START_STOP_SYNCH stop_selected
    pub fn stop_selected(&self) {
        for list in &self.lists {
            if list.state.load(Ordering::Relaxed) & DAQ_STATE_SELECTED != 0 {
                list.state.store(0, Ordering::Release);
            }
        }
    }

    /// START_STOP_SYNCH stop_all
    pub fn stop_all(&self) {
        for list in &self.lists {
            list.state.store(0, Ordering::Release);
        }
    }

    pub fn any_running(&self) -> bool {
        self.lists.iter().any(|l| l.state.load(Ordering::Relaxed) & DAQ_STATE_RUNNING != 0)
    }

    pub fn any_selected(&self) -> bool {
        self.lists.iter().any(|l| l.state.load(Ordering::Relaxed) & DAQ_STATE_SELECTED != 0)
    }
}

impl Default for DaqLists {
    fn default() -> Self {
        DaqLists::new()
    }
}

//----------------------------------------------------------------------------------------------
// Event sampling engine

/// Sample all running DAQ lists of an event and emit DTO frames into the transmit queue
///
/// Entry offsets of absolute addressing lists are resolved against `abs_base`, the
/// application base address (unchecked, the offsets come from the master via the A2L
/// description). Dynamic addressing lists are resolved against the `base`/`base_len`
/// window supplied by the event trigger, out of range entries sample zero. The first
/// ODT of each list carries the timestamp. On queue overrun the remaining ODTs of this
/// event are dropped and the next transmitted frame of the list carries the overrun
/// indicator in the MSB of its ODT number.
pub fn trigger_event(daq_lists: &DaqLists, producer: &QueueProducer, event: u16, abs_base: *const u8, dyn_base: *const u8, dyn_base_len: usize, clock: u64) {
    if !daq_lists.is_valid() {
        return;
    }

    for (daq_idx, list) in daq_lists.lists.iter().enumerate() {
        if list.event_channel != event {
            continue;
        }
        if list.state.load(Ordering::Acquire) & DAQ_STATE_RUNNING == 0 {
            continue;
        }

        // The base pointer the entry offsets of this list are relative to
        let (base, base_len) = if list.addr_ext == crate::protocol::XCP_ADDR_EXT_ABS {
            (abs_base, usize::MAX)
        } else {
            (dyn_base, dyn_base_len)
        };

        for (odt_rel, odt_abs) in (list.first_odt..=list.last_odt).enumerate() {
            let odt = &daq_lists.odts[odt_abs as usize];
            let first = odt_rel == 0;
            let header = XCP_DAQ_HEADER_SIZE + if first { XCP_TIMESTAMP_SIZE } else { 0 };
            let dto_len = header + odt.size as usize;

            let Some(mut buf) = producer.reserve(dto_len as u16) else {
                // Drop the remaining ODTs of this event to keep master resynchronisation simple
                list.state.fetch_or(DAQ_STATE_OVERRUN, Ordering::Relaxed);
                return;
            };

            // Identification field
            let mut pid = odt_rel as u8;
            if list.state.load(Ordering::Relaxed) & DAQ_STATE_OVERRUN != 0 {
                pid |= ODT_PID_OVERRUN;
                list.state.fetch_and(!DAQ_STATE_OVERRUN, Ordering::Relaxed);
            }
            if XCP_DAQ_HEADER_SIZE == 2 {
                buf[0] = pid;
                buf[1] = daq_idx as u8;
            } else {
                buf[0] = pid;
                buf[1] = 0xAA;
                buf[2..4].copy_from_slice(&(daq_idx as u16).to_le_bytes());
            }

            // Timestamp in the first ODT of the list
            let mut pos = XCP_DAQ_HEADER_SIZE;
            if first {
                if XCP_TIMESTAMP_SIZE == 8 {
                    buf[pos..pos + 8].copy_from_slice(&clock.to_le_bytes());
                } else {
                    buf[pos..pos + 4].copy_from_slice(&(clock as u32).to_le_bytes());
                }
                pos += XCP_TIMESTAMP_SIZE;
            }

            // Copy the sample data, the hot path
            // The copy is unsynchronised with the application, word consistency of
            // concurrently calibrated values relies on the aligned atomic stores of the
            // download path
            for e in odt.first_odt_entry..=odt.last_odt_entry {
                let entry = &daq_lists.odt_entries[e as usize];
                let size = entry.size as usize;
                let out_of_bounds = if base_len == usize::MAX {
                    false
                } else {
                    entry.offset < 0 || entry.offset as usize + size > base_len
                };
                if out_of_bounds {
                    // A master misconfiguration must not crash the server
                    buf[pos..pos + size].fill(0);
                } else {
                    let src = unsafe { std::slice::from_raw_parts(base.offset(entry.offset as isize), size) };
                    buf[pos..pos + size].copy_from_slice(src);
                }
                pos += size;
            }
            debug_assert_eq!(pos, dto_len);

            // Wake the transmit thread at the last ODT of a priority bearing DAQ list
            if odt_abs == list.last_odt && list.priority != 0 {
                buf.commit_flush();
            } else {
                buf.commit();
            }
        }
    }
}

//----------------------------------------------------------------------------------------------
