//----------------------------------------------------------------------------------------------
// Module server
// XCP on Ethernet server: UDP or TCP command reception, transmit thread draining the
// queue and an optional multicast listener for GET_DAQ_CLOCK_MULTICAST
//
// Three thread roles: the rx thread receives and dispatches commands, the single tx
// thread drains the transmit queue to the socket, event threads belong to the
// application. Shutdown works by socket timeouts and a shared running flag, there is no
// thread cooperative cancellation beyond that.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::{
    io::{ErrorKind, Read, Write},
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;

use crate::config::*;
use crate::protocol::CC_CONNECT;
use crate::queue::QueueConsumer;
use crate::transport::{frame_packet, parse_messages};
use crate::xcp::{Xcp, XcpError, XcpTransportLayer};

const RX_TIMEOUT: Duration = Duration::from_millis(100);
const TX_TIMEOUT: Duration = Duration::from_millis(100);

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

//----------------------------------------------------------------------------------------------
// XcpEthServer

/// The running XCP on Ethernet server, owns the rx, tx and multicast threads
pub struct XcpEthServer {
    xcp: Arc<Xcp>,
    running: Arc<AtomicBool>,
    port: u16,
    threads: Vec<thread::JoinHandle<()>>,
}

impl XcpEthServer {
    /// Bind the sockets and start the server threads
    pub fn start(xcp: Arc<Xcp>, tl: XcpTransportLayer, addr: Ipv4Addr, port: u16, multicast_cluster_id: Option<u16>) -> Result<XcpEthServer, XcpError> {
        let running = Arc::new(AtomicBool::new(true));
        let mut threads = Vec::new();

        xcp.start();
        if let Some(cluster_id) = multicast_cluster_id {
            xcp.protocol.lock().cluster_id = cluster_id;
        }

        let consumer = xcp.take_consumer().ok_or(XcpError::Transport("transmit queue consumer already taken"))?;

        let local_port;
        match tl {
            XcpTransportLayer::Udp => {
                let socket = UdpSocket::bind((addr, port))?;
                socket.set_read_timeout(Some(RX_TIMEOUT))?;
                local_port = socket.local_addr()?.port();
                let master = Arc::new(Mutex::new(None::<SocketAddr>));

                let rx_socket = socket.try_clone()?;
                let tx_socket = socket.try_clone()?;

                threads.push(
                    thread::Builder::new()
                        .name("xcp_rx".to_string())
                        .spawn({
                            let xcp = Arc::clone(&xcp);
                            let running = Arc::clone(&running);
                            let master = Arc::clone(&master);
                            move || udp_rx_loop(xcp, running, rx_socket, master)
                        })
                        .map_err(XcpError::Io)?,
                );
                threads.push(
                    thread::Builder::new()
                        .name("xcp_tx".to_string())
                        .spawn({
                            let running = Arc::clone(&running);
                            move || udp_tx_loop(running, tx_socket, master, consumer)
                        })
                        .map_err(XcpError::Io)?,
                );
            }
            XcpTransportLayer::Tcp => {
                let listener = TcpListener::bind((addr, port))?;
                listener.set_nonblocking(true)?;
                local_port = listener.local_addr()?.port();
                let stream = Arc::new(Mutex::new(None::<TcpStream>));

                threads.push(
                    thread::Builder::new()
                        .name("xcp_rx".to_string())
                        .spawn({
                            let xcp = Arc::clone(&xcp);
                            let running = Arc::clone(&running);
                            let stream = Arc::clone(&stream);
                            move || tcp_rx_loop(xcp, running, listener, stream)
                        })
                        .map_err(XcpError::Io)?,
                );
                threads.push(
                    thread::Builder::new()
                        .name("xcp_tx".to_string())
                        .spawn({
                            let running = Arc::clone(&running);
                            move || tcp_tx_loop(running, stream, consumer)
                        })
                        .map_err(XcpError::Io)?,
                );
            }
        }

        // Optional multicast listener for GET_DAQ_CLOCK_MULTICAST
        if let Some(cluster_id) = multicast_cluster_id {
            let group = Ipv4Addr::new(239, 255, (cluster_id >> 8) as u8, cluster_id as u8);
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, XCPTL_MULTICAST_PORT))?;
            socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
            socket.set_read_timeout(Some(RX_TIMEOUT))?;
            info!("multicast listener joined {}:{}", group, XCPTL_MULTICAST_PORT);
            threads.push(
                thread::Builder::new()
                    .name("xcp_mc".to_string())
                    .spawn({
                        let xcp = Arc::clone(&xcp);
                        let running = Arc::clone(&running);
                        move || multicast_loop(xcp, running, socket, group)
                    })
                    .map_err(XcpError::Io)?,
            );
        }

        Ok(XcpEthServer {
            xcp,
            running,
            port: local_port,
            threads,
        })
    }

    /// The protocol layer instance, used to create events and trigger measurement
    pub fn xcp(&self) -> &Arc<Xcp> {
        &self.xcp
    }

    /// The actually bound port, differs from the requested one when binding port 0
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Check if the server threads are running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed) && self.threads.iter().all(|t| !t.is_finished())
    }

    /// Stop the server, disconnect the session and join the threads
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        self.xcp.disconnect();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        info!("XCP server stopped");
    }
}

impl Drop for XcpEthServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//----------------------------------------------------------------------------------------------
// Command dispatch shared by the transports

// Dispatch all commands of a received segment and collect the response packets
fn dispatch_segment(xcp: &Xcp, data: &[u8]) -> Vec<Vec<u8>> {
    let mut responses = Vec::new();
    for cmd in parse_messages(data) {
        if let Some(packet) = xcp.command(cmd) {
            responses.push(packet);
        }
    }
    responses
}

//----------------------------------------------------------------------------------------------
// UDP

fn udp_rx_loop(xcp: Arc<Xcp>, running: Arc<AtomicBool>, socket: UdpSocket, master: Arc<Mutex<Option<SocketAddr>>>) {
    let mut buf = [0u8; XCPTL_MAX_SEGMENT_SIZE];
    while running.load(Ordering::Relaxed) {
        let (n, src) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => {
                error!("rx socket error: {}", e);
                break;
            }
        };
        if n == 0 {
            continue;
        }

        // The first datagram carrying CONNECT latches the master address, a different
        // address afterwards ends the session
        let first_cmd = if n > XCPTL_HEADER_SIZE { buf[XCPTL_HEADER_SIZE] } else { 0 };
        {
            let mut m = master.lock();
            match *m {
                Some(latched) if latched != src => {
                    if first_cmd == CC_CONNECT {
                        warn!("master address changed to {}", src);
                        xcp.disconnect();
                        *m = Some(src);
                    } else {
                        warn!("datagram from {} ignored, session owned by {}", src, latched);
                        if xcp.is_connected() {
                            xcp.disconnect();
                            *m = None;
                        }
                        continue;
                    }
                }
                None if first_cmd == CC_CONNECT => *m = Some(src),
                _ => {}
            }
        }

        for packet in dispatch_segment(&xcp, &buf[..n]) {
            let producer = xcp.queue_producer();
            if producer.is_empty() {
                // Direct send avoids the queue copy when nothing is in flight
                let frame = frame_packet(producer.next_ctr(), &packet);
                if let Err(e) = socket.send_to(&frame, src) {
                    warn!("direct response send failed: {}", e);
                }
            } else {
                producer.push(&packet);
                producer.flush();
            }
        }
    }
    debug!("rx thread terminated");
}

fn udp_tx_loop(running: Arc<AtomicBool>, socket: UdpSocket, master: Arc<Mutex<Option<SocketAddr>>>, mut consumer: QueueConsumer) {
    while running.load(Ordering::Relaxed) {
        if !consumer.wait_for_data(TX_TIMEOUT) {
            continue;
        }
        while running.load(Ordering::Relaxed) {
            let Some(segment) = consumer.peek_segment(XCPTL_MAX_SEGMENT_SIZE) else {
                break;
            };
            let Some(dest) = *master.lock() else {
                // No master latched, nothing to address the data to
                consumer.advance();
                continue;
            };
            match socket.send_to(segment, dest) {
                Ok(_) => consumer.advance(),
                Err(e) if is_timeout(&e) => thread::sleep(Duration::from_millis(1)), // retry the same segment
                Err(e) => {
                    error!("tx socket error: {}", e);
                    consumer.advance();
                }
            }
        }
    }
    debug!("tx thread terminated");
}

//----------------------------------------------------------------------------------------------
// TCP

// Read exactly buf.len() bytes from a stream with a read timeout
// Returns false when the peer closed the connection or the server is shutting down
fn tcp_read_full(stream: &mut TcpStream, buf: &mut [u8], running: &AtomicBool) -> std::io::Result<bool> {
    let mut got = 0;
    while got < buf.len() {
        if !running.load(Ordering::Relaxed) {
            return Ok(false);
        }
        match stream.read(&mut buf[got..]) {
            Ok(0) => return Ok(false), // peer closed
            Ok(n) => got += n,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn tcp_rx_loop(xcp: Arc<Xcp>, running: Arc<AtomicBool>, listener: TcpListener, shared: Arc<Mutex<Option<TcpStream>>>) {
    while running.load(Ordering::Relaxed) {
        // At most one accepted connection at a time
        let (mut stream, peer) = match listener.accept() {
            Ok(r) => r,
            Err(e) if is_timeout(&e) => {
                thread::sleep(RX_TIMEOUT);
                continue;
            }
            Err(e) => {
                error!("accept error: {}", e);
                break;
            }
        };
        info!("master connected from {}", peer);
        // The accepted stream inherits the nonblocking listener mode
        if stream.set_nonblocking(false).is_err() || stream.set_read_timeout(Some(RX_TIMEOUT)).is_err() || stream.set_nodelay(true).is_err() {
            continue;
        }
        match stream.try_clone() {
            Ok(tx_stream) => *shared.lock() = Some(tx_stream),
            Err(e) => {
                error!("stream clone failed: {}", e);
                continue;
            }
        }

        // Length prefixed command reception: exactly 4 header bytes, then dlc bytes
        let mut header = [0u8; XCPTL_HEADER_SIZE];
        let mut payload = [0u8; XCP_MAX_CTO_SIZE];
        loop {
            match tcp_read_full(&mut stream, &mut header, &running) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!("rx stream error: {}", e);
                    break;
                }
            }
            let dlc = u16::from_le_bytes([header[0], header[1]]) as usize;
            if dlc == 0 || dlc > payload.len() {
                warn!("corrupt command header, dlc={}", dlc);
                break;
            }
            match tcp_read_full(&mut stream, &mut payload[..dlc], &running) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!("rx stream error: {}", e);
                    break;
                }
            }
            if let Some(packet) = xcp.command(&payload[..dlc]) {
                let producer = xcp.queue_producer();
                producer.push(&packet);
                producer.flush();
            }
        }

        // Connection ended, keep listening
        info!("master {} disconnected", peer);
        *shared.lock() = None;
        xcp.disconnect();
    }
    debug!("rx thread terminated");
}

fn tcp_tx_loop(running: Arc<AtomicBool>, shared: Arc<Mutex<Option<TcpStream>>>, mut consumer: QueueConsumer) {
    while running.load(Ordering::Relaxed) {
        if !consumer.wait_for_data(TX_TIMEOUT) {
            continue;
        }
        while running.load(Ordering::Relaxed) {
            let Some(segment) = consumer.peek_segment(XCPTL_MAX_SEGMENT_SIZE) else {
                break;
            };
            let mut guard = shared.lock();
            let Some(stream) = guard.as_mut() else {
                consumer.advance(); // no connection, discard
                continue;
            };
            match stream.write_all(segment) {
                Ok(()) => {
                    drop(guard);
                    consumer.advance();
                }
                Err(e) if is_timeout(&e) => {
                    drop(guard);
                    thread::sleep(Duration::from_millis(1)); // retry the same segment
                }
                Err(e) => {
                    error!("tx stream error: {}", e);
                    *guard = None;
                    drop(guard);
                    consumer.advance();
                }
            }
        }
    }
    debug!("tx thread terminated");
}

//----------------------------------------------------------------------------------------------
// Multicast

fn multicast_loop(xcp: Arc<Xcp>, running: Arc<AtomicBool>, socket: UdpSocket, group: Ipv4Addr) {
    let mut buf = [0u8; XCPTL_MAX_SEGMENT_SIZE];
    while running.load(Ordering::Relaxed) {
        let (n, src) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => {
                error!("multicast socket error: {}", e);
                break;
            }
        };
        trace!("multicast datagram from {}", src);
        for packet in dispatch_segment(&xcp, &buf[..n]) {
            // Responses go back as multicast with the local clock and cluster id
            let frame = frame_packet(xcp.queue_producer().next_ctr(), &packet);
            if let Err(e) = socket.send_to(&frame, (group, XCPTL_MULTICAST_PORT)) {
                warn!("multicast response send failed: {}", e);
            }
        }
    }
    debug!("multicast thread terminated");
}
