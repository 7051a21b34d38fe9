#![cfg(not(doctest))]

//-----------------------------------------------------------------------------
// Crate xcp_server
// Path: src/lib.rs

//! An XCP 1.4 on Ethernet server (slave) implementation
//! The crate provides the XCP protocol layer with a dynamic DAQ engine, a lock free
//! multi producer transmit queue and an UDP/TCP transport layer. A2L generation, file
//! persistency and the hosting application are out of scope, the application connects
//! through the `ApplicationCallbacks` trait and drives measurement by triggering events.
//!
//! ## Example
//!
//! ```
//!
//! use std::sync::Arc;
//! use xcp_server::*;
//!
//! // The application owns the measured and calibrated memory
//! let app = Arc::new(MemoryImageApplication::new("my_app", "EPK_1.0", 0x1000));
//!
//! // Start the XCP on ETH server
//! let server = XcpBuilder::new("my_app")
//!     .set_log_level(XcpLogLevel::Info)
//!     .start_server(XcpTransportLayer::Udp, [0u8, 0u8, 0u8, 0u8], 5555, app)?;
//! let xcp = Arc::clone(server.xcp());
//!
//! // Create a measurement event
//! let event = xcp.create_event("task1", 10_000_000, 0);
//!
//! #[repr(C)]
//! struct Signals { counter: u32, value: f64 }
//! let mut signals = Signals { counter: 0, value: 0.0 };
//!
//! loop {
//!     signals.counter += 1;
//!
//!     // Trigger the event, sampling of the DAQ lists bound to it happens here
//!     let base = unsafe {
//!         std::slice::from_raw_parts(&signals as *const Signals as *const u8, std::mem::size_of::<Signals>())
//!     };
//!     xcp.trigger_event_ext(event, base);
//! }
//!
//! ```

// This crate is a library
#![crate_type = "lib"]
// The library crate is named "xcp_server"
#![crate_name = "xcp_server"]

//-----------------------------------------------------------------------------

// Submodule config
pub mod config;

// Submodule platform
pub mod platform;

// Submodule app
mod app;
pub use app::ApplicationCallbacks;
pub use app::MemoryImageApplication;
pub use app::{XCP_IDT_ASAM_EPK, XCP_IDT_ASAM_NAME, XCP_IDT_ASAM_PATH, XCP_IDT_ASAM_UPLOAD, XCP_IDT_ASAM_URL, XCP_IDT_ASCII};

// Submodule queue
pub mod queue;

// Submodule protocol
pub mod protocol;
pub use protocol::CrcError;
pub use protocol::XcpCmdResult;
pub use protocol::XcpEventDescriptor;

// Submodule transport
pub mod transport;
pub use transport::server::XcpEthServer;

// Submodule xcp
mod xcp;
pub use xcp::SessionStatus;
pub use xcp::Xcp;
pub use xcp::XcpBuilder;
pub use xcp::XcpError;
pub use xcp::XcpEvent;
pub use xcp::XcpLogLevel;
pub use xcp::XcpTransportLayer;

// Reexport for integration tests
pub use xcp::xcp_test::test_setup;
