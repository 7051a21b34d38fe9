//----------------------------------------------------------------------------------------------
// Module queue
// Lock free multi producer, single consumer transmit queue
//
// A contiguous byte ring holds variable length records {dlc:u16, ctr:u16, payload[dlc]},
// aligned to XCPTL_PACKET_ALIGNMENT. head (producers) and tail (consumer) are monotonic
// 64 bit byte counters, offsets into the ring are taken modulo the ring size.
// The ctr field doubles as commit marker: RESERVED while a producer fills the payload,
// COMMITTED afterwards, finally rewritten by the consumer with the transport layer
// packet counter. Records never wrap across the ring end, a record that would cross it
// leaves a pad marker {dlc:0} behind and is placed at offset 0. The ring is allocated
// with one extra slot so the pad marker header always has room.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::{
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::config::XCPTL_PACKET_ALIGNMENT;

// Entry header {dlc:u16, ctr:u16}
const ENTRY_HEADER_SIZE: usize = 4;

// Commit marker states of the ctr field
const CTR_RESERVED: u16 = 0xFFFF;
const CTR_COMMITTED: u16 = 0xFFFE;

#[inline]
fn align(len: usize) -> usize {
    (len + XCPTL_PACKET_ALIGNMENT - 1) & !(XCPTL_PACKET_ALIGNMENT - 1)
}

//----------------------------------------------------------------------------------------------
// Queue memory

struct QueueMemory(UnsafeCell<Box<[u8]>>);

// Producers write disjoint reserved regions, the consumer reads committed regions only,
// synchronisation is established through the head/tail counters and the ctr commit marker
unsafe impl Sync for QueueMemory {}
unsafe impl Send for QueueMemory {}

impl QueueMemory {
    #[inline]
    fn ptr(&self, offset: u64) -> *mut u8 {
        unsafe { (*self.0.get()).as_mut_ptr().add(offset as usize) }
    }

    // The ctr field of the entry header, entries are 4 byte aligned so this is 2 byte aligned
    #[inline]
    fn ctr(&self, entry_offset: u64) -> &AtomicU16 {
        unsafe { AtomicU16::from_ptr(self.ptr(entry_offset + 2) as *mut u16) }
    }

    #[inline]
    fn write_dlc(&self, entry_offset: u64, dlc: u16) {
        let p = self.ptr(entry_offset);
        unsafe {
            *p = (dlc & 0xFF) as u8;
            *p.add(1) = (dlc >> 8) as u8;
        }
    }

    #[inline]
    fn read_dlc(&self, entry_offset: u64) -> u16 {
        let p = self.ptr(entry_offset);
        unsafe { *p as u16 | (*p.add(1) as u16) << 8 }
    }
}

struct QueueInner {
    mem: QueueMemory,
    size: u64,      // usable ring size in bytes, the allocation is one slot larger
    slot_size: u64, // maximum aligned entry size

    head: AtomicU64, // producer byte counter
    tail: AtomicU64, // consumer byte counter

    reserve_lock: Mutex<()>, // producer critical section

    overruns: AtomicU32,       // reservation failures since the last consumer peek
    overruns_total: AtomicU32, // reservation failures since creation
    ctr: AtomicU16,            // transport layer packet counter

    wakeup_lock: Mutex<()>,
    wakeup: Condvar,
}

/// Create a transmit queue with `entries` slots of up to `max_payload` payload bytes each
pub fn new(entries: u32, max_payload: usize) -> (QueueProducer, QueueConsumer) {
    assert!(entries >= 2, "queue too small");
    let slot_size = align(ENTRY_HEADER_SIZE + max_payload) as u64;
    let size = entries as u64 * slot_size;
    let inner = Arc::new(QueueInner {
        mem: QueueMemory(UnsafeCell::new(vec![0u8; (size + slot_size) as usize].into_boxed_slice())),
        size,
        slot_size,
        head: AtomicU64::new(0),
        tail: AtomicU64::new(0),
        reserve_lock: Mutex::new(()),
        overruns: AtomicU32::new(0),
        overruns_total: AtomicU32::new(0),
        ctr: AtomicU16::new(0),
        wakeup_lock: Mutex::new(()),
        wakeup: Condvar::new(),
    });
    (QueueProducer { inner: Arc::clone(&inner) }, QueueConsumer { inner, stamped: 0, peek_len: 0 })
}

//----------------------------------------------------------------------------------------------
// Producer

/// Cloneable producer handle, reservation is guarded by a short mutex critical section
#[derive(Clone)]
pub struct QueueProducer {
    inner: Arc<QueueInner>,
}

impl QueueProducer {
    /// Reserve a queue entry for `payload_len` bytes
    /// On failure the overrun counter is incremented and None is returned
    pub fn reserve(&self, payload_len: u16) -> Option<TransmitBuffer<'_>> {
        let inner = &*self.inner;
        let msg_len = align(ENTRY_HEADER_SIZE + payload_len as usize) as u64;
        assert!(msg_len <= inner.slot_size, "payload exceeds queue slot size");

        let entry_offset;
        {
            let _guard = inner.reserve_lock.lock();
            let head = inner.head.load(Ordering::Relaxed);
            let tail = inner.tail.load(Ordering::Acquire);
            let offset = head % inner.size;

            // Entries never wrap across the ring end
            let needed = if offset + msg_len > inner.size { (inner.size - offset) + msg_len } else { msg_len };
            if head - tail + needed > inner.size {
                inner.overruns.fetch_add(1, Ordering::Relaxed);
                inner.overruns_total.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            if needed != msg_len {
                // Pad marker, the extra slot at the ring end guarantees room for its header
                inner.mem.write_dlc(offset, 0);
                inner.mem.ctr(offset).store(CTR_COMMITTED, Ordering::Relaxed);
                entry_offset = 0;
            } else {
                entry_offset = offset;
            }

            inner.mem.write_dlc(entry_offset, payload_len);
            inner.mem.ctr(entry_offset).store(CTR_RESERVED, Ordering::Relaxed);

            // Publish the reservation, pairs with the consumer acquire load of head
            inner.head.store(head + needed, Ordering::Release);
        }

        Some(TransmitBuffer {
            inner,
            entry_offset,
            payload_len,
            flush: false,
        })
    }

    /// Push a complete message, convenience for command responses
    pub fn push(&self, payload: &[u8]) -> bool {
        match self.reserve(payload.len() as u16) {
            Some(mut buf) => {
                buf.copy_from_slice(payload);
                buf.commit();
                true
            }
            None => false,
        }
    }

    /// Next transport layer packet counter value
    /// Used by the transport for the direct send path when the queue is empty
    pub fn next_ctr(&self) -> u16 {
        self.inner.ctr.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.head.load(Ordering::Acquire) == self.inner.tail.load(Ordering::Acquire)
    }

    /// Reservation failures not yet folded into the packet counter stream
    pub fn overruns_pending(&self) -> u32 {
        self.inner.overruns.load(Ordering::Relaxed)
    }

    /// Reservation failures since the queue was created
    pub fn overruns_total(&self) -> u32 {
        self.inner.overruns_total.load(Ordering::Relaxed)
    }

    /// Wake the transmit thread
    pub fn flush(&self) {
        let _guard = self.inner.wakeup_lock.lock();
        self.inner.wakeup.notify_one();
    }

    /// Sleep in ~20ms increments until the consumer drained the queue or the timeout elapsed
    pub fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

//----------------------------------------------------------------------------------------------
// TransmitBuffer
// A reserved queue entry, dereferences to the payload bytes

pub struct TransmitBuffer<'a> {
    inner: &'a QueueInner,
    entry_offset: u64,
    payload_len: u16,
    flush: bool,
}

impl TransmitBuffer<'_> {
    /// Commit the entry, making it visible to the consumer
    pub fn commit(self) {
        drop(self);
    }

    /// Commit and wake the transmit thread
    pub fn commit_flush(mut self) {
        self.flush = true;
        drop(self);
    }
}

impl std::ops::Deref for TransmitBuffer<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.inner.mem.ptr(self.entry_offset + ENTRY_HEADER_SIZE as u64), self.payload_len as usize) }
    }
}

impl std::ops::DerefMut for TransmitBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.inner.mem.ptr(self.entry_offset + ENTRY_HEADER_SIZE as u64), self.payload_len as usize) }
    }
}

impl Drop for TransmitBuffer<'_> {
    fn drop(&mut self) {
        // Pairs with the consumer acquire load of the ctr marker
        self.inner.mem.ctr(self.entry_offset).store(CTR_COMMITTED, Ordering::Release);
        if self.flush {
            let _guard = self.inner.wakeup_lock.lock();
            self.inner.wakeup.notify_one();
        }
    }
}

//----------------------------------------------------------------------------------------------
// Consumer

/// Single consumer handle, peeks assembled network segments and advances the tail
pub struct QueueConsumer {
    inner: Arc<QueueInner>,
    stamped: u64,  // byte position up to which packet counters have been assigned
    peek_len: u64, // length of the last peeked segment
}

impl QueueConsumer {
    pub fn is_empty(&self) -> bool {
        self.inner.head.load(Ordering::Acquire) == self.inner.tail.load(Ordering::Acquire)
    }

    /// Accumulated producer overrun count, reset on the next peek
    pub fn overruns(&self) -> u32 {
        self.inner.overruns.load(Ordering::Relaxed)
    }

    /// Block until the queue is non empty or the timeout elapsed
    /// Woken early by a producer flush, polls in ~1ms steps otherwise
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            let mut guard = self.inner.wakeup_lock.lock();
            self.inner.wakeup.wait_for(&mut guard, Duration::from_millis(1));
        }
    }

    /// Peek the next network segment without advancing the tail
    ///
    /// Concatenates adjacent committed entries into one segment, stopping at the ring
    /// wrap point, a not yet committed entry or `max_segment_size`. Producer overruns
    /// are folded into the packet counter stream here, so the master can detect the
    /// gap. Peeking again after a failed send returns the same segment.
    pub fn peek_segment(&mut self, max_segment_size: usize) -> Option<&[u8]> {
        let inner = &*self.inner;

        // Skip pad markers at the wrap point
        let mut tail;
        loop {
            let head = inner.head.load(Ordering::Acquire);
            tail = inner.tail.load(Ordering::Relaxed);
            if tail == head {
                return None;
            }
            let offset = tail % inner.size;
            if tail >= self.stamped && inner.mem.ctr(offset).load(Ordering::Acquire) == CTR_RESERVED {
                return None;
            }
            if inner.mem.read_dlc(offset) == 0 {
                tail += inner.size - offset;
                inner.tail.store(tail, Ordering::Release);
                self.stamped = self.stamped.max(tail);
                continue;
            }
            break;
        }

        // Assemble the segment
        let head = inner.head.load(Ordering::Acquire);
        let mut pos = tail;
        while pos < head {
            let offset = pos % inner.size;
            if offset == 0 && pos > tail {
                break; // wrapped around the ring end, the segment must stay contiguous
            }
            let dlc = inner.mem.read_dlc(offset);
            if dlc == 0 {
                break; // wrap point
            }
            let msg_len = align(ENTRY_HEADER_SIZE + dlc as usize) as u64;
            if (pos - tail + msg_len) as usize > max_segment_size {
                break;
            }
            if pos >= self.stamped {
                let ctr = inner.mem.ctr(offset);
                if ctr.load(Ordering::Acquire) == CTR_RESERVED {
                    break;
                }
                // Fold producer overruns into the packet counter stream
                let overruns = inner.overruns.swap(0, Ordering::Relaxed);
                if overruns > 0 {
                    inner.ctr.fetch_add(overruns as u16, Ordering::Relaxed);
                }
                ctr.store(inner.ctr.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
                self.stamped = pos + msg_len;
            }
            pos += msg_len;
        }

        let seg_len = pos - tail;
        if seg_len == 0 {
            return None;
        }
        self.peek_len = seg_len;
        Some(unsafe { std::slice::from_raw_parts(inner.mem.ptr(tail % inner.size), seg_len as usize) })
    }

    /// Advance the tail past the last peeked segment, called after the transport accepted it
    pub fn advance(&mut self) {
        let inner = &*self.inner;
        let tail = inner.tail.load(Ordering::Relaxed);
        debug_assert!(self.peek_len > 0);
        inner.tail.store(tail + self.peek_len, Ordering::Release);
        self.peek_len = 0;
    }
}

//----------------------------------------------------------------------------------------------
