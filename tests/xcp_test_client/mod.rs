//--------------------------------------------------------------------------------------------------------------------------------------------------
// Module xcp_test_client
// Simplified UDP XCP client for integration testing the server

#![allow(dead_code)] // because of all the unused XCP definitions

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use std::error::Error;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{timeout, Duration};

//--------------------------------------------------------------------------------------------------------------------------------------------------
// XCP Parameters

pub const CMD_TIMEOUT: Duration = Duration::from_secs(3);

pub const XCPTL_MAX_SEGMENT_SIZE: usize = 2048 * 2;

//--------------------------------------------------------------------------------------------------------------------------------------------------
// XCP error type

// XCP command response codes
pub const CRC_CMD_OK: u8 = 0x00;
pub const CRC_CMD_SYNCH: u8 = 0x00;
pub const CRC_CMD_BUSY: u8 = 0x10;
pub const CRC_CMD_UNKNOWN: u8 = 0x20;
pub const CRC_OUT_OF_RANGE: u8 = 0x22;
pub const CRC_ACCESS_DENIED: u8 = 0x24;
pub const CRC_SEQUENCE: u8 = 0x29;
pub const CRC_DAQ_CONFIG: u8 = 0x2A;

pub const ERROR_CMD_TIMEOUT: u8 = 0xF0;
pub const ERROR_TL_HEADER: u8 = 0xF1;

#[derive(Default)]
pub struct ClientError {
    code: u8,
    cmd: u8,
}

impl ClientError {
    pub fn new(code: u8, cmd: u8) -> ClientError {
        ClientError { code, cmd }
    }
    pub fn get_error_code(&self) -> u8 {
        self.code
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.code {
            ERROR_CMD_TIMEOUT => write!(f, "cmd 0x{:02X}: response timeout", self.cmd),
            ERROR_TL_HEADER => write!(f, "transport layer header error"),
            _ => write!(f, "cmd 0x{:02X}: error code 0x{:02X}", self.cmd, self.code),
        }
    }
}

impl std::fmt::Debug for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ClientError 0x{:02X} - {}", self.code, self)
    }
}

impl std::error::Error for ClientError {}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// XCP command codes

pub const CC_CONNECT: u8 = 0xFF;
pub const CC_DISCONNECT: u8 = 0xFE;
pub const CC_GET_STATUS: u8 = 0xFD;
pub const CC_SYNCH: u8 = 0xFC;
pub const CC_GET_ID: u8 = 0xFA;
pub const CC_SET_MTA: u8 = 0xF6;
pub const CC_UPLOAD: u8 = 0xF5;
pub const CC_SHORT_UPLOAD: u8 = 0xF4;
pub const CC_BUILD_CHECKSUM: u8 = 0xF3;
pub const CC_SHORT_DOWNLOAD: u8 = 0xED;
pub const CC_SET_DAQ_PTR: u8 = 0xE2;
pub const CC_WRITE_DAQ: u8 = 0xE1;
pub const CC_SET_DAQ_LIST_MODE: u8 = 0xE0;
pub const CC_GET_DAQ_LIST_MODE: u8 = 0xDF;
pub const CC_START_STOP_DAQ_LIST: u8 = 0xDE;
pub const CC_START_STOP_SYNCH: u8 = 0xDD;
pub const CC_GET_DAQ_CLOCK: u8 = 0xDC;
pub const CC_GET_DAQ_PROCESSOR_INFO: u8 = 0xDA;
pub const CC_GET_DAQ_RESOLUTION_INFO: u8 = 0xD9;
pub const CC_FREE_DAQ: u8 = 0xD6;
pub const CC_ALLOC_DAQ: u8 = 0xD5;
pub const CC_ALLOC_ODT: u8 = 0xD4;
pub const CC_ALLOC_ODT_ENTRY: u8 = 0xD3;
pub const CC_TIME_CORRELATION_PROPERTIES: u8 = 0xC6;

//--------------------------------------------------------------------------------------------------------------------------------------------------
// Build XCP commands with transport layer header

pub struct XcpCommandBuilder {
    data: BytesMut,
}

impl XcpCommandBuilder {
    pub fn new(command_code: u8) -> XcpCommandBuilder {
        let mut cmd = XcpCommandBuilder {
            data: BytesMut::with_capacity(12),
        };
        cmd.data.put_u16_le(0);
        cmd.data.put_u16_le(0);
        cmd.data.put_u8(command_code);
        cmd
    }
    pub fn add_u8(&mut self, value: u8) -> &mut Self {
        self.data.put_u8(value);
        self
    }

    pub fn add_u8_slice(&mut self, value: &[u8]) -> &mut Self {
        self.data.put_slice(value);
        self
    }

    pub fn add_u16(&mut self, value: u16) -> &mut Self {
        assert!(self.data.len() & 1 == 0, "add_u16: unaligned");
        self.data.put_u16_le(value);
        self
    }

    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        assert!(self.data.len() & 3 == 0, "add_u32: unaligned");
        self.data.put_u32_le(value);
        self
    }

    pub fn build(&mut self) -> &[u8] {
        let mut len: u16 = self.data.len().try_into().unwrap();
        assert!(len >= 5);
        len -= 4;
        self.data[0] = (len & 0xFFu16) as u8;
        self.data[1] = (len >> 8) as u8;
        self.data.as_ref()
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// DAQ decoder trait for XCP DAQ messages

pub trait XcpDaqDecoder: Send {
    /// Handle an incoming DAQ packet, transport layer header stripped
    fn decode(&mut self, lost: u32, data: &[u8]);
}

/// Collects DTO frames as received
pub struct CollectingDaqDecoder {
    pub frames: Vec<Vec<u8>>,
    pub lost: u32,
}

impl CollectingDaqDecoder {
    pub fn new() -> CollectingDaqDecoder {
        CollectingDaqDecoder { frames: Vec::new(), lost: 0 }
    }
}

impl XcpDaqDecoder for CollectingDaqDecoder {
    fn decode(&mut self, lost: u32, data: &[u8]) {
        self.lost += lost;
        self.frames.push(data.to_vec());
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// Type to control the receive task sent over the receive task control channel

#[derive(Debug, Copy, Clone)]
pub struct XcpTaskControl {
    running: bool,
    connected: bool,
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// XcpTestClient

/// Minimal XCP client over UDP
pub struct XcpTestClient {
    dest_addr: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
    rx_cmd_resp: Option<mpsc::Receiver<Vec<u8>>>,
    tx_task_control: Option<mpsc::Sender<XcpTaskControl>>,
    task_control: XcpTaskControl,
    daq_decoder: Option<Arc<Mutex<dyn XcpDaqDecoder>>>,
    max_cto_size: u8,
    max_dto_size: u16,
}

impl XcpTestClient {
    pub fn new(dest_addr: SocketAddr) -> XcpTestClient {
        XcpTestClient {
            dest_addr,
            socket: None,
            rx_cmd_resp: None,
            tx_task_control: None,
            task_control: XcpTaskControl { running: false, connected: false },
            daq_decoder: None,
            max_cto_size: 0,
            max_dto_size: 0,
        }
    }

    //------------------------------------------------------------------------
    // receiver task
    // Handle incoming data from the XCP server
    async fn receive_task(
        socket: Arc<UdpSocket>,
        tx_resp: Sender<Vec<u8>>,
        mut rx_control: Receiver<XcpTaskControl>,
        decode_daq: Arc<Mutex<dyn XcpDaqDecoder>>,
    ) -> Result<(), Box<dyn Error>> {
        let mut ctr_last: u16 = 0;
        let mut ctr_first: bool = true;
        let mut ctr_lost: u32 = 0;

        let mut buf: [u8; 8000] = [0; 8000];
        let mut task_control: Option<XcpTaskControl> = None;

        loop {
            select! {

                res = rx_control.recv() => {
                    match res {
                        Some(c) => {
                            debug!("receive_task: control status changed: connected={} running={}", c.connected, c.running);
                            if !c.connected {
                                info!("receive_task: stop, disconnect");
                                return Ok(());
                            }
                            if c.running {
                                ctr_first = true;
                                ctr_last = 0;
                                ctr_lost = 0;
                            }
                            task_control = Some(c);
                        }
                        None => {
                            info!("receive_task: stop, channel closed");
                            return Ok(());
                        }
                    }
                }

                res = socket.recv_from(&mut buf) => {
                    match res {
                        Ok((size, _)) => {
                            if size == 0 {
                                warn!("receive_task: socket closed");
                                return Ok(());
                            }
                            let mut i: usize = 0;
                            while i + 4 < size {
                                // Decode the next transport layer message in the segment
                                let len = buf[i] as usize + ((buf[i + 1] as usize) << 8);
                                if len == 0 || i + 4 + len > size {
                                    return Err(Box::new(ClientError::new(ERROR_TL_HEADER, 0)) as Box<dyn Error>);
                                }
                                let ctr = buf[i + 2] as u16 + ((buf[i + 3] as u16) << 8);
                                if ctr_first {
                                    ctr_first = false;
                                } else if ctr != ctr_last.wrapping_add(1) {
                                    ctr_lost += ctr.wrapping_sub(ctr_last.wrapping_add(1)) as u32;
                                }
                                ctr_last = ctr;
                                let pid = buf[i + 4];
                                trace!("RX: i={}, len={}, ctr={}, pid={}", i, len, ctr, pid);
                                match pid {
                                    0xFF => {
                                        // Command response
                                        tx_resp.send(buf[(i + 4)..(i + 4 + len)].to_vec()).await?;
                                    }
                                    0xFE => {
                                        // Command error response
                                        tx_resp.send(buf[(i + 4)..(i + 6)].to_vec()).await?;
                                    }
                                    0xFD | 0xFC => {
                                        // Event and service packets are ignored here
                                    }
                                    _ => {
                                        // DAQ data
                                        if let Some(c) = &task_control {
                                            if c.running {
                                                decode_daq.lock().decode(ctr_lost, &buf[i + 4..i + 4 + len]);
                                                ctr_lost = 0;
                                            }
                                        }
                                    }
                                }
                                // Messages within a segment are aligned to 4 bytes
                                i += (len + 4 + 3) & !3;
                            }
                        }
                        Err(e) => {
                            error!("receive_task: socket error {}", e);
                            return Err(Box::new(ClientError::new(ERROR_TL_HEADER, 0)) as Box<dyn Error>);
                        }
                    }
                }
            }
        }
    }

    //------------------------------------------------------------------------
    // XCP command service
    // Send a command and wait for the response
    pub async fn send_command(&mut self, cmd_bytes: &[u8]) -> Result<Vec<u8>, Box<dyn Error>> {
        let socket = self.socket.as_ref().unwrap();
        socket.send_to(cmd_bytes, self.dest_addr).await?;

        let res = timeout(CMD_TIMEOUT, self.rx_cmd_resp.as_mut().unwrap().recv()).await;
        match res {
            Ok(Some(data)) => match data[0] {
                0xFF => Ok(data),
                0xFE => Err(Box::new(ClientError::new(data[1], cmd_bytes[4])) as Box<dyn Error>),
                _ => panic!("send_command: bug in receive_task"),
            },
            Ok(None) => {
                error!("send_command: receive_task channel closed");
                Err(Box::new(ClientError::new(ERROR_CMD_TIMEOUT, 0)) as Box<dyn Error>)
            }
            Err(_) => Err(Box::new(ClientError::new(ERROR_CMD_TIMEOUT, cmd_bytes[4])) as Box<dyn Error>),
        }
    }

    //------------------------------------------------------------------------
    // Connect/disconnect, create the receive task

    pub async fn connect<D>(&mut self, daq_decoder: Arc<Mutex<D>>) -> Result<Vec<u8>, Box<dyn Error>>
    where
        D: XcpDaqDecoder + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        self.socket = Some(Arc::new(socket));

        {
            let socket = Arc::clone(self.socket.as_ref().unwrap());
            let (tx_resp, rx_resp) = mpsc::channel(1);
            self.rx_cmd_resp = Some(rx_resp);
            let (tx_control, rx_control) = mpsc::channel(3);
            self.tx_task_control = Some(tx_control);
            let daq_decoder_clone: Arc<Mutex<dyn XcpDaqDecoder>> = daq_decoder.clone();

            tokio::spawn(async move {
                let _res = XcpTestClient::receive_task(socket, tx_resp, rx_control, daq_decoder_clone).await;
            });
            tokio::time::sleep(Duration::from_millis(100)).await; // wait for the receive task to start
        }

        let data = self.send_command(XcpCommandBuilder::new(CC_CONNECT).add_u8(0).build()).await?;
        assert!(data.len() >= 8);
        self.max_cto_size = data[3];
        self.max_dto_size = data[4] as u16 | (data[5] as u16) << 8;
        info!("connected, max_cto_size={}, max_dto_size={}", self.max_cto_size, self.max_dto_size);

        self.task_control.connected = true;
        self.task_control.running = false;
        self.tx_task_control.as_ref().unwrap().send(self.task_control).await.unwrap();

        self.daq_decoder = Some(daq_decoder);
        Ok(data)
    }

    pub async fn disconnect(&mut self) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_DISCONNECT).build()).await?;
        self.task_control.connected = false;
        self.task_control.running = false;
        self.tx_task_control.as_ref().unwrap().send(self.task_control).await?;
        Ok(())
    }

    pub fn max_cto_size(&self) -> u8 {
        self.max_cto_size
    }

    pub fn max_dto_size(&self) -> u16 {
        self.max_dto_size
    }

    //------------------------------------------------------------------------
    // Memory access services

    pub async fn short_upload(&mut self, addr: u32, ext: u8, size: u8) -> Result<Vec<u8>, Box<dyn Error>> {
        let data = self
            .send_command(XcpCommandBuilder::new(CC_SHORT_UPLOAD).add_u8(size).add_u8(0).add_u8(ext).add_u32(addr).build())
            .await?;
        Ok(data)
    }

    pub async fn short_download(&mut self, addr: u32, ext: u8, data_bytes: &[u8]) -> Result<(), Box<dyn Error>> {
        let len: u8 = data_bytes.len().try_into().unwrap();
        self.send_command(
            XcpCommandBuilder::new(CC_SHORT_DOWNLOAD)
                .add_u8(len)
                .add_u8(0)
                .add_u8(ext)
                .add_u32(addr)
                .add_u8_slice(data_bytes)
                .build(),
        )
        .await?;
        Ok(())
    }

    pub async fn set_mta(&mut self, addr: u32, ext: u8) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_SET_MTA).add_u8(0).add_u8(0).add_u8(ext).add_u32(addr).build()).await?;
        Ok(())
    }

    pub async fn upload(&mut self, size: u8) -> Result<Vec<u8>, Box<dyn Error>> {
        let data = self.send_command(XcpCommandBuilder::new(CC_UPLOAD).add_u8(size).build()).await?;
        Ok(data)
    }

    //------------------------------------------------------------------------
    // DAQ services

    pub async fn free_daq(&mut self) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_FREE_DAQ).build()).await?;
        Ok(())
    }

    pub async fn alloc_daq(&mut self, count: u16) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_ALLOC_DAQ).add_u8(0).add_u16(count).build()).await?;
        Ok(())
    }

    pub async fn alloc_odt(&mut self, daq: u16, odt: u8) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_ALLOC_ODT).add_u8(0).add_u16(daq).add_u8(odt).build()).await?;
        Ok(())
    }

    pub async fn alloc_odt_entries(&mut self, daq: u16, odt: u8, count: u8) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_ALLOC_ODT_ENTRY).add_u8(0).add_u16(daq).add_u8(odt).add_u8(count).build())
            .await?;
        Ok(())
    }

    pub async fn set_daq_ptr(&mut self, daq: u16, odt: u8, idx: u8) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_SET_DAQ_PTR).add_u8(0).add_u16(daq).add_u8(odt).add_u8(idx).build())
            .await?;
        Ok(())
    }

    pub async fn write_daq(&mut self, ext: u8, addr: u32, len: u8) -> Result<(), Box<dyn Error>> {
        self.send_command(
            XcpCommandBuilder::new(CC_WRITE_DAQ)
                .add_u8(0xFF) // no bit offset
                .add_u8(len)
                .add_u8(ext)
                .add_u32(addr)
                .build(),
        )
        .await?;
        Ok(())
    }

    pub async fn set_daq_list_mode(&mut self, daq: u16, eventchannel: u16) -> Result<(), Box<dyn Error>> {
        const XCP_DAQ_MODE_TIMESTAMP: u8 = 0x10;
        self.send_command(
            XcpCommandBuilder::new(CC_SET_DAQ_LIST_MODE)
                .add_u8(XCP_DAQ_MODE_TIMESTAMP)
                .add_u16(daq)
                .add_u16(eventchannel)
                .add_u8(1) // prescaler
                .add_u8(0) // priority
                .build(),
        )
        .await?;
        Ok(())
    }

    pub async fn select_daq_list(&mut self, daq: u16) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_START_STOP_DAQ_LIST).add_u8(2).add_u16(daq).build()).await?;
        Ok(())
    }

    pub async fn start_selected_daq_lists(&mut self) -> Result<(), Box<dyn Error>> {
        // Notify the rx task first, DTO data follows immediately
        self.task_control.running = true;
        self.tx_task_control.as_ref().unwrap().send(self.task_control).await.unwrap();
        self.send_command(XcpCommandBuilder::new(CC_START_STOP_SYNCH).add_u8(1).build()).await?;
        Ok(())
    }

    pub async fn stop_all_daq_lists(&mut self) -> Result<(), Box<dyn Error>> {
        let res = self.send_command(XcpCommandBuilder::new(CC_START_STOP_SYNCH).add_u8(0).build()).await;
        self.task_control.running = false;
        self.tx_task_control.as_ref().unwrap().send(self.task_control).await?;
        res.map(|_| ())
    }

    //------------------------------------------------------------------------
    // Clock

    pub async fn time_correlation_properties(&mut self) -> Result<(), Box<dyn Error>> {
        // Set response format to advanced (64 bit GET_DAQ_CLOCK)
        self.send_command(XcpCommandBuilder::new(CC_TIME_CORRELATION_PROPERTIES).add_u8(2).add_u8(0).add_u8(0).add_u16(0).build())
            .await?;
        Ok(())
    }

    pub async fn get_daq_clock_raw(&mut self) -> Result<u64, Box<dyn Error>> {
        let data = self.send_command(XcpCommandBuilder::new(CC_GET_DAQ_CLOCK).build()).await?;
        let mut c = Cursor::new(&data[2..]);
        let _trigger_info = c.read_u8()?;
        let payload_fmt = c.read_u8()?;
        let timestamp64 = if payload_fmt == 1 {
            c.read_u32::<LittleEndian>()? as u64
        } else if payload_fmt == 2 {
            c.read_u64::<LittleEndian>()?
        } else {
            return Err(Box::new(ClientError::new(CRC_OUT_OF_RANGE, CC_GET_DAQ_CLOCK)) as Box<dyn Error>);
        };
        Ok(timestamp64)
    }
}
