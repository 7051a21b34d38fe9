// main
// xcp_server demo application
//
// Starts the XCP on ETH server over a small memory image and generates some measurement
// signals. Absolute addressing DAQ lists sample the image, dynamic addressing DAQ lists
// sample the task stack through the event base pointer.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::{
    f64::consts::PI,
    net::Ipv4Addr,
    num::Wrapping,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use xcp_server::*;

//-----------------------------------------------------------------------------
// Parameters

const APP_NAME: &str = "xcp_server_demo";

const TASK1_CYCLE_TIME_US: u64 = 10000; // 10ms
const MAINLOOP_CYCLE_TIME_MS: u64 = 100;

const IMAGE_SIZE: usize = 0x1000;

// Memory image layout, these addresses are what the master uses with absolute addressing
const ADDR_RUN: u32 = 0x0000; // u8, clearing it stops the demo
const ADDR_AMPL: u32 = 0x0008; // f64 sine amplitude
const ADDR_PERIOD: u32 = 0x0010; // f64 sine period in s
const ADDR_MAIN_COUNTER: u32 = 0x0020; // u32, incremented in the main loop

//-----------------------------------------------------------------------------
// Command line arguments

const DEFAULT_LOG_LEVEL: u8 = 3; // (Off=0, Error=1, Warn=2, Info=3, Debug=4, Trace=5)
const DEFAULT_BIND_ADDR: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);
const DEFAULT_PORT: u16 = 5555;
const DEFAULT_TCP: bool = false; // UDP

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level (Off=0, Error=1, Warn=2, Info=3, Debug=4, Trace=5)
    #[arg(short, long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: u8,

    /// Bind address, default is ANY
    #[arg(short, long, default_value_t = DEFAULT_BIND_ADDR)]
    bind: Ipv4Addr,

    /// Use TCP as transport layer, default is UDP
    #[arg(short, long, default_value_t = DEFAULT_TCP)]
    tcp: bool,

    /// Port number
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

//-----------------------------------------------------------------------------
// Demo application tasks

lazy_static::lazy_static! {

    // Application start time
    static ref START_TIME: Instant = Instant::now();

    // Stop all tasks if false
    static ref RUN: AtomicBool = AtomicBool::new(true);
}

// Signals measured from the task stack with dynamic addressing
// The master addresses fields by their offset in this struct
#[repr(C)]
struct Task1Signals {
    counter: u32,
    counter_u8: Wrapping<u8>,
    sine: f64,
}

fn task1_signal_bytes(signals: &Task1Signals) -> &[u8] {
    // The struct is plain old data, give the DAQ engine a byte view of it
    unsafe { std::slice::from_raw_parts(signals as *const Task1Signals as *const u8, std::mem::size_of::<Task1Signals>()) }
}

// A cyclic task with stack local measurement signals, amplitude and period of the sine
// signal are calibratable through the memory image
fn task1(xcp: Arc<Xcp>, app: Arc<MemoryImageApplication>) {
    info!("task1 ({:?}) started", thread::current().id());

    let event = xcp.create_event("task1", TASK1_CYCLE_TIME_US as u32 * 1000, 0);

    let mut signals = Task1Signals {
        counter: 0,
        counter_u8: Wrapping(0),
        sine: 0.0,
    };

    while RUN.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_micros(TASK1_CYCLE_TIME_US));

        let ampl = f64::from_le_bytes(app.read_image(ADDR_AMPL, 8).try_into().unwrap());
        let period = f64::from_le_bytes(app.read_image(ADDR_PERIOD, 8).try_into().unwrap());

        signals.counter += 1;
        signals.counter_u8 += 1;
        let time = START_TIME.elapsed().as_micros() as f64 * 0.000001; // s
        signals.sine = ampl * (PI * time / period).sin();

        // Trigger event "task1", sampling the signals from stack happens here
        xcp.trigger_event_ext(event, task1_signal_bytes(&signals));
    }
    info!("task1 stopped");
}

//-----------------------------------------------------------------------------
// Demo application main

fn main() {
    println!("XCP on Ethernet server demo");

    // Args
    let args = Args::parse();
    let log_level = XcpLogLevel::from(args.log_level);

    // Logging
    env_logger::Builder::new()
        .target(env_logger::Target::Stdout)
        .filter_level(log_level.to_log_level_filter())
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    // The application memory image holds the calibration parameters and some signals
    let app = Arc::new(MemoryImageApplication::new(APP_NAME, "EPK_XCP_SERVER_DEMO_V1", IMAGE_SIZE));
    app.write_image(ADDR_RUN, &[1]);
    app.write_image(ADDR_AMPL, &100.0f64.to_le_bytes());
    app.write_image(ADDR_PERIOD, &1.0f64.to_le_bytes());

    // Start the XCP server
    let server = XcpBuilder::new(APP_NAME)
        .set_log_level(log_level)
        .start_server(
            if args.tcp { XcpTransportLayer::Tcp } else { XcpTransportLayer::Udp },
            args.bind,
            args.port,
            Arc::clone(&app) as Arc<dyn ApplicationCallbacks>,
        )
        .expect("could not start server");
    let xcp = Arc::clone(server.xcp());

    // Task1, samples signals from its stack
    let t1 = thread::spawn({
        let xcp = Arc::clone(&xcp);
        let app = Arc::clone(&app);
        move || {
            task1(xcp, app);
        }
    });

    // Mainloop, updates signals in the memory image for absolute addressing DAQ lists
    let main_event = xcp.create_event("main", MAINLOOP_CYCLE_TIME_MS as u32 * 1_000_000, 0);
    let mut main_counter: u32 = 0;
    info!("demo running, clear the run byte at 0x{:04X} to stop", ADDR_RUN);
    loop {
        thread::sleep(Duration::from_millis(MAINLOOP_CYCLE_TIME_MS));

        main_counter = main_counter.wrapping_add(1);
        app.write_image(ADDR_MAIN_COUNTER, &main_counter.to_le_bytes());

        // Trigger the event for absolute addressing measurement of the image
        xcp.trigger_event(main_event);

        // The master stops the demo by clearing the run byte (SHORT_DOWNLOAD)
        if app.read_image(ADDR_RUN, 1)[0] == 0 {
            break;
        }
    }

    info!("main task finished");

    // Stop the other tasks
    RUN.store(false, Ordering::Relaxed);
    t1.join().unwrap();

    // Let the queue drain, then stop the server
    xcp.wait_for_transmit_queue_empty(Duration::from_millis(500));
    server.stop();
    info!("server stopped");
}
