// test_server
// Integration tests for the XCP on ETH server over real sockets
// Uses the test XCP client in module xcp_test_client
//
// cargo test -- --test-threads=1 --nocapture --test test_server

#![allow(unused_imports)]

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use xcp_server::*;

mod xcp_test_client;
use xcp_test_client::{CollectingDaqDecoder, XcpTestClient};

//-----------------------------------------------------------------------------
// Test settings

const TEST_MEASUREMENT_DURATION_MS: u64 = 500;
const TEST_TASK_CYCLE_TIME_US: u64 = 1000;

//-----------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_udp_server() {
    test_setup(log::LevelFilter::Info);

    // The application under test: a memory image with some calibration data and a
    // cyclic task measuring a counter from its stack
    let app = Arc::new(MemoryImageApplication::new("server_test", "TEST_EPK", 0x1000));
    app.write_image(0x100, &[1, 2, 3, 4]);

    let server = XcpBuilder::new("server_test")
        .set_log_level(XcpLogLevel::Warn)
        .start_server(XcpTransportLayer::Udp, [127u8, 0, 0, 1], 0, Arc::clone(&app) as Arc<dyn ApplicationCallbacks>)
        .expect("could not start server");
    let port = server.port();
    let xcp = Arc::clone(server.xcp());
    assert!(server.is_running());

    let event = xcp.create_event("test_task", TEST_TASK_CYCLE_TIME_US as u32 * 1000, 0);

    // The measurement task, samples a u32 counter from its stack
    let run = Arc::new(AtomicBool::new(true));
    let task = thread::spawn({
        let xcp = Arc::clone(&xcp);
        let run = Arc::clone(&run);
        move || {
            let mut counter: u32 = 0;
            while run.load(Ordering::Relaxed) {
                counter = counter.wrapping_add(1);
                xcp.trigger_event_ext(event, &counter.to_le_bytes());
                thread::sleep(Duration::from_micros(TEST_TASK_CYCLE_TIME_US));
            }
        }
    });

    // Connect
    let dest: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let mut client = XcpTestClient::new(dest);
    let daq_decoder = Arc::new(Mutex::new(CollectingDaqDecoder::new()));
    let resp = client.connect(Arc::clone(&daq_decoder)).await.expect("connect failed");
    assert_eq!(resp[1], 0x05, "resources DAQ | CAL_PAG");

    // Calibration access through the image
    let data = client.short_upload(0x100, 0, 4).await.unwrap();
    assert_eq!(&data[1..5], &[1, 2, 3, 4]);
    client.short_download(0x200, 0, &[0x55, 0xAA]).await.unwrap();
    assert_eq!(app.read_image(0x200, 2), vec![0x55, 0xAA]);

    // Upload via MTA cursor
    client.set_mta(0x100, 0).await.unwrap();
    let data = client.upload(2).await.unwrap();
    assert_eq!(&data[1..3], &[1, 2]);
    let data = client.upload(2).await.unwrap();
    assert_eq!(&data[1..3], &[3, 4], "cursor advanced");

    // DAQ clock
    client.time_correlation_properties().await.unwrap();
    let t1 = client.get_daq_clock_raw().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let t2 = client.get_daq_clock_raw().await.unwrap();
    assert!(t2 > t1, "DAQ clock advances");

    // Configure a DAQ list measuring the task counter with dynamic addressing
    client.free_daq().await.unwrap();
    client.alloc_daq(1).await.unwrap();
    client.alloc_odt(0, 1).await.unwrap();
    client.alloc_odt_entries(0, 0, 1).await.unwrap();
    client.set_daq_ptr(0, 0, 0).await.unwrap();
    let (ext, addr) = event.get_dyn_ext_addr(0);
    client.write_daq(ext, addr, 4).await.unwrap();
    client.set_daq_list_mode(0, event.get_channel()).await.unwrap();
    client.select_daq_list(0).await.unwrap();
    client.start_selected_daq_lists().await.unwrap();

    tokio::time::sleep(Duration::from_millis(TEST_MEASUREMENT_DURATION_MS)).await;
    client.stop_all_daq_lists().await.unwrap();

    // Check the received DTO stream
    {
        let decoder = daq_decoder.lock();
        info!("received {} DTO frames, {} lost", decoder.frames.len(), decoder.lost);
        assert!(decoder.frames.len() >= 10, "DTO frames expected");

        let mut last_ts = 0u32;
        let mut last_counter = 0u32;
        for frame in &decoder.frames {
            assert_eq!(frame.len(), 10, "odt, daq, ts32, u32 counter");
            assert_eq!(frame[0], 0);
            assert_eq!(frame[1], 0);
            let ts = u32::from_le_bytes(frame[2..6].try_into().unwrap());
            let counter = u32::from_le_bytes(frame[6..10].try_into().unwrap());
            assert!(ts >= last_ts, "timestamps are monotonic");
            assert!(counter > last_counter, "counter increases");
            last_ts = ts;
            last_counter = counter;
        }
    }

    // After stop and a drained queue no further DTO arrives
    xcp.wait_for_transmit_queue_empty(Duration::from_millis(500));
    let frames_after_stop = daq_decoder.lock().frames.len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(daq_decoder.lock().frames.len(), frames_after_stop);

    client.disconnect().await.unwrap();
    assert!(!xcp.is_connected());

    run.store(false, Ordering::Relaxed);
    task.join().unwrap();
    server.stop();
}

//-----------------------------------------------------------------------------
// TCP, length prefixed command reception and reconnect after close

fn tcp_read_message(stream: &mut std::net::TcpStream) -> Vec<u8> {
    use std::io::Read;
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).unwrap();
    let dlc = header[0] as usize | (header[1] as usize) << 8;
    // Messages in the stream are aligned to 4 bytes
    let padded = (4 + dlc + 3) & !3;
    let mut payload = vec![0u8; padded - 4];
    stream.read_exact(&mut payload).unwrap();
    payload.truncate(dlc);
    payload
}

#[test]
fn test_tcp_server() {
    use std::io::Write;

    test_setup(log::LevelFilter::Info);
    let app = Arc::new(MemoryImageApplication::new("tcp_test", "TEST_EPK", 0x1000));
    app.write_image(0x10, &[7, 8, 9]);

    let server = XcpBuilder::new("tcp_test")
        .set_log_level(XcpLogLevel::Warn)
        .start_server(XcpTransportLayer::Tcp, [127u8, 0, 0, 1], 0, Arc::clone(&app) as Arc<dyn ApplicationCallbacks>)
        .expect("could not start server");
    let port = server.port();

    let mut stream = loop {
        match std::net::TcpStream::connect(("127.0.0.1", port)) {
            Ok(s) => break s,
            Err(_) => thread::sleep(Duration::from_millis(50)),
        }
    };
    stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();

    // CONNECT
    stream.write_all(&[2, 0, 0, 0, 0xFF, 0x00]).unwrap();
    let resp = tcp_read_message(&mut stream);
    assert_eq!(resp.len(), 8);
    assert_eq!(resp[0], 0xFF);
    assert_eq!(resp[1], 0x05);

    // SHORT_UPLOAD 3 bytes at 0x10
    let mut cmd = vec![8, 0, 0, 0, 0xF4, 3, 0, 0];
    cmd.extend_from_slice(&0x10u32.to_le_bytes());
    stream.write_all(&cmd).unwrap();
    let resp = tcp_read_message(&mut stream);
    assert_eq!(resp, vec![0xFF, 7, 8, 9]);

    // Closing the connection disconnects the session, the server keeps listening
    drop(stream);
    thread::sleep(Duration::from_millis(200));
    assert!(server.is_running());

    let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    stream.write_all(&[2, 0, 0, 0, 0xFF, 0x00]).unwrap();
    let resp = tcp_read_message(&mut stream);
    assert_eq!(resp[0], 0xFF, "reconnect after close works");

    drop(stream);
    server.stop();
}
