//----------------------------------------------------------------------------------------------
// Module config
// Compile time parameters of the XCP protocol and transport layer

/// XCP protocol layer version (1.4), high byte is reported in the CONNECT response
pub const XCP_PROTOCOL_LAYER_VERSION: u16 = 0x0104;

/// XCP on Ethernet transport layer version, high byte is reported in the CONNECT response
pub const XCP_TRANSPORT_LAYER_VERSION: u16 = 0x0104;

/// Maximum CTO size (command and response packets), 8..=255
pub const XCP_MAX_CTO_SIZE: usize = 252;

/// Maximum DTO size (data transfer packets), must be <= XCPTL_MAX_SEGMENT_SIZE - 4
pub const XCP_MAX_DTO_SIZE: usize = 1024;

/// Maximum size of a UDP datagram or TCP segment assembled by the transport layer (MTU sized)
pub const XCPTL_MAX_SEGMENT_SIZE: usize = 1500 - 28;

/// Transport layer message header size {dlc:u16, ctr:u16}
pub const XCPTL_HEADER_SIZE: usize = 4;

/// Transmit queue entry alignment
pub const XCPTL_PACKET_ALIGNMENT: usize = 4;

/// Default number of entries in the transmit queue
pub const XCPTL_QUEUE_SIZE: u32 = 1024 * 4;

/// DAQ configuration memory budget in bytes (emulated arena size)
pub const XCP_DAQ_MEM_SIZE: usize = 32 * 1024;

/// Maximum size of a single ODT entry in bytes
pub const XCP_MAX_ODT_ENTRY_SIZE: usize = 248;

/// Maximum number of DAQ lists, <= 65534
/// The DTO identification field is 2 bytes (odt,daq) as long as this is <= 256, 4 bytes otherwise
pub const XCP_MAX_DAQ_COUNT: usize = 256;

/// Size of the DTO identification field, depends on XCP_MAX_DAQ_COUNT
pub const XCP_DAQ_HEADER_SIZE: usize = if XCP_MAX_DAQ_COUNT > 256 { 4 } else { 2 };

/// Maximum number of event channels in the event descriptor table
pub const XCP_MAX_EVENT_COUNT: usize = 256;

/// DAQ timestamp size in the first ODT of a DAQ list (4 or 8 bytes)
pub const XCP_TIMESTAMP_SIZE: usize = 4;

/// DAQ timestamp resolution, unit DAQ_TIMESTAMP_UNIT_1NS with 1 tick per unit
pub const XCP_TIMESTAMP_UNIT: u8 = 0x00; // 1ns
pub const XCP_TIMESTAMP_TICKS: u16 = 1;

/// UDP port of the GET_DAQ_CLOCK_MULTICAST listener
pub const XCPTL_MULTICAST_PORT: u16 = 5557;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_limits() {
        assert!(XCP_MAX_CTO_SIZE >= 8 && XCP_MAX_CTO_SIZE <= 255);
        assert!(XCP_MAX_DTO_SIZE <= XCPTL_MAX_SEGMENT_SIZE - XCPTL_HEADER_SIZE);
        assert!(XCP_MAX_CTO_SIZE % XCPTL_PACKET_ALIGNMENT == 0);
        assert!(XCP_MAX_DTO_SIZE % XCPTL_PACKET_ALIGNMENT == 0);
        assert!(XCP_MAX_DAQ_COUNT <= 65534);
        assert!(XCP_MAX_ODT_ENTRY_SIZE <= 255);
        assert!(XCP_TIMESTAMP_SIZE == 4 || XCP_TIMESTAMP_SIZE == 8);
    }
}
