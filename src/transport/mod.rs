//----------------------------------------------------------------------------------------------
// Module transport
// XCP on Ethernet framing
//
// Every XCP message on the wire is {dlc:u16 LE, ctr:u16 LE, payload[dlc]}. Multiple
// messages may share one UDP datagram or TCP segment up to XCPTL_MAX_SEGMENT_SIZE.
// Outgoing segments come straight from the transmit queue, whose entries are aligned
// to XCPTL_PACKET_ALIGNMENT, so receivers of server data advance by align4(dlc + 4).
// Incoming master command packets are framed back to back without padding.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

pub mod server;

use crate::config::{XCPTL_HEADER_SIZE, XCPTL_MAX_SEGMENT_SIZE};

/// Frame a single XCP packet with the transport layer header
pub fn frame_packet(ctr: u16, packet: &[u8]) -> Vec<u8> {
    debug_assert!(packet.len() + XCPTL_HEADER_SIZE <= XCPTL_MAX_SEGMENT_SIZE);
    let mut frame = Vec::with_capacity(XCPTL_HEADER_SIZE + packet.len());
    frame.extend_from_slice(&(packet.len() as u16).to_le_bytes());
    frame.extend_from_slice(&ctr.to_le_bytes());
    frame.extend_from_slice(packet);
    frame
}

/// Iterate the XCP messages in a received datagram
/// Master command packets are framed back to back without padding
pub fn parse_messages(data: &[u8]) -> MessageIter<'_> {
    MessageIter { data, pos: 0 }
}

pub struct MessageIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.pos + XCPTL_HEADER_SIZE > self.data.len() {
            return None;
        }
        let dlc = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]) as usize;
        let start = self.pos + XCPTL_HEADER_SIZE;
        if dlc == 0 || start + dlc > self.data.len() {
            warn!("corrupt transport layer header, dlc={}", dlc);
            return None;
        }
        self.pos = start + dlc;
        Some(&self.data[start..start + dlc])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = frame_packet(0x1234, &[0xFF, 0x00]);
        assert_eq!(frame, vec![0x02, 0x00, 0x34, 0x12, 0xFF, 0x00]);
        let msgs: Vec<&[u8]> = parse_messages(&frame).collect();
        assert_eq!(msgs, vec![&[0xFF, 0x00][..]]);
    }

    #[test]
    fn test_parse_multiple_messages() {
        let mut data = frame_packet(0, &[0xFF]);
        data.extend_from_slice(&frame_packet(1, &[0xFE, 0x20]));
        let msgs: Vec<&[u8]> = parse_messages(&data).collect();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0], &[0xFF][..]);
        assert_eq!(msgs[1], &[0xFE, 0x20][..]);
    }

    #[test]
    fn test_parse_corrupt_header() {
        // dlc runs past the end of the datagram
        let data = [0x10, 0x00, 0x00, 0x00, 0xFF];
        assert_eq!(parse_messages(&data).count(), 0);
        // empty and truncated input
        assert_eq!(parse_messages(&[]).count(), 0);
        assert_eq!(parse_messages(&[0x01, 0x00]).count(), 0);
    }
}
