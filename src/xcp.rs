//----------------------------------------------------------------------------------------------
// Module xcp
// The Xcp server core: session state, event channels, the trigger API for the
// application and the builder which wires protocol, queue and transport together
//
// All session state lives in one Xcp value created by the builder, there are no hidden
// mutable globals. The transport layer and the application hold the value behind an Arc.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicU16, AtomicU64, Ordering},
        Arc,
    },
};

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::app::ApplicationCallbacks;
use crate::config::*;
use crate::protocol::{daq, CmdContext, DaqLists, PendingCommand, Protocol, XcpEventDescriptor, PID_SERV};
use crate::queue::{self, QueueConsumer, QueueProducer};
use crate::transport::server::XcpEthServer;

//----------------------------------------------------------------------------------------------
// XCP error

#[derive(Error, Debug)]
pub enum XcpError {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("transport error: `{0}` ")]
    Transport(&'static str),

    #[error("unknown error")]
    Unknown,
}

//----------------------------------------------------------------------------------------------
// XCP log level

/// Represents the log level for the XCP server
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum XcpLogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl From<u8> for XcpLogLevel {
    fn from(item: u8) -> XcpLogLevel {
        match item {
            0 => XcpLogLevel::Off,
            1 => XcpLogLevel::Error,
            3 => XcpLogLevel::Info,
            4 => XcpLogLevel::Debug,
            5 => XcpLogLevel::Trace,
            _ => XcpLogLevel::Warn,
        }
    }
}

impl XcpLogLevel {
    /// Convert XcpLogLevel to log::LevelFilter
    pub fn to_log_level_filter(self) -> log::LevelFilter {
        match self {
            XcpLogLevel::Off => log::LevelFilter::Off,
            XcpLogLevel::Error => log::LevelFilter::Error,
            XcpLogLevel::Warn => log::LevelFilter::Warn,
            XcpLogLevel::Info => log::LevelFilter::Info,
            XcpLogLevel::Debug => log::LevelFilter::Debug,
            XcpLogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

//----------------------------------------------------------------------------------------------
// Session status

bitflags! {
    /// Represents a set of flags for the XCP session status
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct SessionStatus: u16 {
        const SS_LEGACY_MODE  = 0x0001; // XCP 1.3 compatible GET_DAQ_CLOCK format
        const SS_CMD_PENDING  = 0x0002; // a deferred command is parked
        const SS_DAQ          = 0x0040; // DAQ running
        const SS_CONNECTED    = 0x2000;
        const SS_STARTED      = 0x4000;
        const SS_INITIALIZED  = 0x8000;
    }
}

//----------------------------------------------------------------------------------------------
// XcpEvent

/// Represents a measurement event channel
/// Holds the raw u16 XCP event number used in the XCP protocol to identify an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XcpEvent {
    channel: u16,
}

impl XcpEvent {
    /// Undefined event channel number
    pub const XCP_UNDEFINED_EVENT_CHANNEL: u16 = 0xFFFF;

    pub fn new(channel: u16) -> XcpEvent {
        assert!((channel as usize) < XCP_MAX_EVENT_COUNT, "maximum number of events exceeded");
        XcpEvent { channel }
    }

    /// Get the event number used in the XCP protocol
    pub fn get_channel(self) -> u16 {
        self.channel
    }

    /// Get address extension and address for DAQ entries of this event in dynamic
    /// addressing mode, the high word of the address is the event channel
    pub fn get_dyn_ext_addr(self, offset: i16) -> (u8, u32) {
        let ext = crate::protocol::XCP_ADDR_EXT_DYN;
        let addr: u32 = (self.channel as u32) << 16 | (offset as u16 as u32);
        (ext, addr)
    }
}

//------------------------------------------------------------------------------------------
// XcpTransportLayer

/// enum to specify the transport layer of the XCP server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XcpTransportLayer {
    /// UDP transport layer
    Udp = 0,
    /// TCP transport layer
    Tcp = 1,
}

impl XcpTransportLayer {
    /// Get the protocol name of the transport layer
    pub fn protocol_name(&self) -> &'static str {
        match self {
            XcpTransportLayer::Tcp => "TCP",
            XcpTransportLayer::Udp => "UDP",
        }
    }
}

//------------------------------------------------------------------------------------------
// XcpBuilder

/// A builder to create the Xcp server instance
#[derive(Debug)]
pub struct XcpBuilder {
    name: &'static str,
    log_level: XcpLogLevel,
    queue_entries: u32,
}

impl XcpBuilder {
    /// Create a XcpBuilder
    pub fn new(name: &'static str) -> XcpBuilder {
        XcpBuilder {
            name,
            log_level: XcpLogLevel::Info,
            queue_entries: XCPTL_QUEUE_SIZE,
        }
    }

    /// Set log level
    pub fn set_log_level(mut self, log_level: XcpLogLevel) -> Self {
        self.log_level = log_level;
        self
    }

    /// Set the transmit queue size in entries
    pub fn set_queue_size(mut self, queue_entries: u32) -> Self {
        self.queue_entries = queue_entries;
        self
    }

    /// Create the XCP protocol layer instance without a server
    /// Command execution and transmit queue handling are up to the caller,
    /// used for transport layer mode and by the tests
    pub fn build(self, app: Arc<dyn ApplicationCallbacks>) -> Arc<Xcp> {
        log::set_max_level(self.log_level.to_log_level_filter());
        let xcp = Xcp::new(self.name, app, self.queue_entries);
        xcp.start();
        xcp
    }

    /// Start the XCP on Ethernet server with rx and tx threads
    pub fn start_server<A>(self, tl: XcpTransportLayer, addr: A, port: u16, app: Arc<dyn ApplicationCallbacks>) -> Result<XcpEthServer, XcpError>
    where
        A: Into<Ipv4Addr>,
    {
        let ipv4_addr: Ipv4Addr = addr.into();
        let xcp = self.build(app);
        info!("Start XCP on ETH server ({}) on {}:{}", tl.protocol_name(), ipv4_addr, port);
        XcpEthServer::start(xcp, tl, ipv4_addr, port, None)
    }

    /// Start the XCP on Ethernet server with an additional GET_DAQ_CLOCK_MULTICAST
    /// listener joined to 239.255.<cluster_id_hi>.<cluster_id_lo>
    pub fn start_server_multicast<A>(self, tl: XcpTransportLayer, addr: A, port: u16, app: Arc<dyn ApplicationCallbacks>, cluster_id: u16) -> Result<XcpEthServer, XcpError>
    where
        A: Into<Ipv4Addr>,
    {
        let ipv4_addr: Ipv4Addr = addr.into();
        let xcp = self.build(app);
        info!("Start XCP on ETH server ({}) on {}:{}, multicast cluster 0x{:04X}", tl.protocol_name(), ipv4_addr, port, cluster_id);
        XcpEthServer::start(xcp, tl, ipv4_addr, port, Some(cluster_id))
    }
}

//------------------------------------------------------------------------------------------
// Xcp

/// The XCP server instance, holds all session state
pub struct Xcp {
    pub(crate) name: &'static str,
    pub(crate) status: AtomicU16,
    pub(crate) protocol: Mutex<Protocol>,
    pub(crate) daq: RwLock<DaqLists>,
    pub(crate) pending: Mutex<Option<PendingCommand>>,
    pub(crate) events: RwLock<Vec<XcpEventDescriptor>>,
    pub(crate) producer: QueueProducer,
    pub(crate) app: Arc<dyn ApplicationCallbacks>,
    pub(crate) daq_start_clock: AtomicU64,
    consumer: Mutex<Option<QueueConsumer>>,
}

impl Xcp {
    /// Create the server core with a transmit queue of `queue_entries` slots
    pub fn new(name: &'static str, app: Arc<dyn ApplicationCallbacks>, queue_entries: u32) -> Arc<Xcp> {
        crate::platform::clock_init();
        let (producer, consumer) = queue::new(queue_entries, XCP_MAX_DTO_SIZE.max(XCP_MAX_CTO_SIZE));
        Arc::new(Xcp {
            name,
            status: AtomicU16::new(SessionStatus::SS_INITIALIZED.bits()),
            protocol: Mutex::new(Protocol::new()),
            daq: RwLock::new(DaqLists::new()),
            pending: Mutex::new(None),
            events: RwLock::new(Vec::new()),
            producer,
            app,
            daq_start_clock: AtomicU64::new(0),
            consumer: Mutex::new(Some(consumer)),
        })
    }

    /// Mark the server started, accepting CONNECT
    pub fn start(&self) {
        self.status_set(SessionStatus::SS_STARTED);
    }

    //------------------------------------------------------------------------------------------
    // Session status

    /// Get XCP session status flags
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn status_set(&self, flags: SessionStatus) {
        self.status.fetch_or(flags.bits(), Ordering::Release);
    }

    pub(crate) fn status_clear(&self, flags: SessionStatus) {
        self.status.fetch_and(!flags.bits(), Ordering::Release);
    }

    /// Check if a client is connected
    pub fn is_connected(&self) -> bool {
        self.status().contains(SessionStatus::SS_CONNECTED)
    }

    /// Check if measurement is running
    pub fn is_daq_running(&self) -> bool {
        self.status().contains(SessionStatus::SS_DAQ)
    }

    /// Accumulated transmit queue overrun count
    pub fn overrun_count(&self) -> u32 {
        self.producer.overruns_total()
    }

    //------------------------------------------------------------------------------------------
    // Session transitions, called from the command handlers and the transport layer

    // DAQ measurement start transition
    pub(crate) fn start_daq(&self) {
        if !self.is_daq_running() {
            self.daq_start_clock.store(self.app.get_clock(), Ordering::Relaxed);
            self.status_set(SessionStatus::SS_DAQ);
            info!("DAQ started");
        }
        self.app.start_daq();
    }

    // DAQ measurement stop transition
    pub(crate) fn stop_daq(&self) {
        if self.is_daq_running() {
            self.status_clear(SessionStatus::SS_DAQ);
            self.app.stop_daq();
            info!("DAQ stopped");
        }
    }

    /// End the session: stop measurement, drop the pending command, clear connected
    /// Called on DISCONNECT, master address change and socket close
    pub fn disconnect(&self) {
        if !self.is_connected() {
            return;
        }
        self.daq.read().stop_all();
        self.stop_daq();
        *self.pending.lock() = None;
        self.status_clear(SessionStatus::SS_CONNECTED | SessionStatus::SS_CMD_PENDING);
        self.app.on_disconnect();
        info!("session disconnected");
    }

    //------------------------------------------------------------------------------------------
    // Event channels

    /// Create an XCP event channel
    /// The descriptor is reported to the master via GET_DAQ_EVENT_INFO
    pub fn create_event(&self, name: &'static str, cycle_time_ns: u32, priority: u8) -> XcpEvent {
        let mut events = self.events.write();
        let channel = events.len();
        assert!(channel < XCP_MAX_EVENT_COUNT, "maximum number of events exceeded");
        assert!(!events.iter().any(|e| e.name == name), "event name already exists");
        debug!("create event {} channel={}", name, channel);
        events.push(XcpEventDescriptor::new(name, cycle_time_ns, priority));
        XcpEvent::new(channel as u16)
    }

    //------------------------------------------------------------------------------------------
    // Event trigger, the application side of the DAQ engine

    /// Trigger an event for DAQ lists in absolute addressing mode
    /// ODT entry offsets are resolved against the application base address
    pub fn trigger_event(&self, event: XcpEvent) {
        let base = self.app.get_base_addr();
        self.trigger(event.get_channel(), base, usize::MAX, true, 0);
    }

    /// Trigger an event and provide the base memory for relative addressing mode
    /// ODT entry offsets of the associated DAQ lists are relative to `base`,
    /// out of range entries sample zero
    pub fn trigger_event_ext(&self, event: XcpEvent, base: &[u8]) {
        self.trigger(event.get_channel(), base.as_ptr(), base.len(), false, 0);
    }

    /// Trigger with mutable base memory, deferred calibration writes with dynamic
    /// addressing are only served by this variant
    pub fn trigger_event_ext_mut(&self, event: XcpEvent, base: &mut [u8]) {
        self.trigger(event.get_channel(), base.as_ptr(), base.len(), true, 0);
    }

    /// Trigger with an explicit timestamp in clock ticks, 0 reads the clock
    pub fn trigger_event_at(&self, event: XcpEvent, base: &[u8], clock: u64) {
        self.trigger(event.get_channel(), base.as_ptr(), base.len(), false, clock);
    }

    fn trigger(&self, channel: u16, base: *const u8, base_len: usize, writable: bool, clock: u64) {
        let status = self.status();

        // Service a deferred command parked on this event even when DAQ is not running
        if status.contains(SessionStatus::SS_CMD_PENDING) {
            self.service_pending(channel, base, base_len, writable);
        }

        if !status.contains(SessionStatus::SS_DAQ) {
            return;
        }

        let abs_base = self.app.get_base_addr();
        let daq_lists = self.daq.read();
        let events = self.events.read();
        match events.get(channel as usize) {
            Some(descriptor) => {
                // Serialise concurrent producers of the same event, the clock read and
                // the queue reservation must not interleave or timestamps go backwards
                let mut last = descriptor.lock.lock();
                let clock = if clock != 0 { clock } else { self.app.get_clock() };
                if clock < *last {
                    warn!("event {} clock not monotonic ({} < {})", channel, clock, *last);
                }
                *last = clock;
                daq::trigger_event(&daq_lists, &self.producer, channel, abs_base, base, base_len, clock);
            }
            None => {
                let clock = if clock != 0 { clock } else { self.app.get_clock() };
                daq::trigger_event(&daq_lists, &self.producer, channel, abs_base, base, base_len, clock);
            }
        }
    }

    // Replay the parked DYN addressing command in the context of its event and emit
    // the response through the transmit queue
    fn service_pending(&self, channel: u16, base: *const u8, base_len: usize, writable: bool) {
        let cmd = {
            let mut slot = self.pending.lock();
            let matches = slot.as_ref().map(|pending| pending.event == channel).unwrap_or(false);
            if !matches {
                return;
            }
            slot.take().unwrap()
        };

        trace!("execute deferred cmd 0x{:02X} on event {}", cmd.data[0], channel);
        let result = self.dispatch(&cmd.data, CmdContext::Async { base, base_len, writable });
        self.status_clear(SessionStatus::SS_CMD_PENDING);
        if let Some(packet) = Self::result_packet(result) {
            self.producer.push(&packet);
            self.producer.flush();
        }
    }

    //------------------------------------------------------------------------------------------
    // Transmit queue access for the transport layer

    /// Take the single transmit queue consumer, owned by the transmit thread
    pub fn take_consumer(&self) -> Option<QueueConsumer> {
        self.consumer.lock().take()
    }

    pub fn queue_producer(&self) -> &QueueProducer {
        &self.producer
    }

    /// Sleep until the transmit queue is drained or the timeout elapsed
    pub fn wait_for_transmit_queue_empty(&self, timeout: std::time::Duration) -> bool {
        self.producer.wait_until_empty(timeout)
    }

    //------------------------------------------------------------------------------------------
    // Service request

    /// Print a text message to the master tool console (SERV_TEXT service packet)
    pub fn print(&self, msg: &str) {
        let mut packet = Vec::with_capacity(msg.len() + 3);
        packet.push(PID_SERV);
        packet.push(0x01); // service request code text
        packet.extend_from_slice(msg.as_bytes());
        packet.push(0);
        self.producer.push(&packet);
        self.producer.flush();
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// Public test helpers

pub mod xcp_test {
    use super::*;
    use std::sync::Once;

    #[allow(dead_code)]
    static TEST_INIT: Once = Once::new();

    /// Setup the test environment
    #[allow(dead_code)]
    pub fn test_setup(level: log::LevelFilter) {
        TEST_INIT.call_once(|| {
            env_logger::Builder::new().target(env_logger::Target::Stdout).filter_level(level).init();
        });
    }
}
