#![forbid(unsafe_code)]

use ensim_core::Value;
use thiserror::Error;

/// A multicast packet: opaque 32-bit routing key plus 32-bit payload.
///
/// The fabric delivers a packet to every core whose routing entry matches
/// the key. Delivery is unordered across sources and unreliable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McPacket {
    pub key: u32,
    pub payload: u32,
}

impl McPacket {
    pub fn new(key: u32, payload: u32) -> Self {
        McPacket { key, payload }
    }

    pub fn with_value(key: u32, value: Value) -> Self {
        McPacket {
            key,
            payload: value.to_payload(),
        }
    }

    pub fn value(&self) -> Value {
        Value::from_payload(self.payload)
    }
}

/// Host-bound destination: chip (0, 0), monitor port.
pub const HOST_DEST_ADDR: u16 = 0x0000;
pub const HOST_DEST_PORT: u8 = 0xff;
/// No reply expected.
pub const FLAGS_NO_REPLY: u8 = 0x07;
/// IP tag for bridge uplink frames.
pub const TAG_TX_UPLINK: u8 = 1;
/// IP tag for controller reply frames.
pub const TAG_CONTROLLER_REPLY: u8 = 2;
/// `cmd_rc` for a dimensional-payload frame, in both directions.
pub const CMD_DIMENSIONAL: u16 = 1;

/// A host-link frame. Only the fields this system reads and writes are
/// carried; `data` holds little-endian 32-bit words.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdpFrame {
    pub dest_addr: u16,
    pub dest_port: u8,
    pub srce_addr: u16,
    pub srce_port: u8,
    pub flags: u8,
    pub tag: u8,
    pub cmd_rc: u16,
    pub arg1: u32,
    pub arg2: u32,
    pub data: Vec<u8>,
}

/// Longest frame data section: 64 dimensions of 4 bytes.
pub const MAX_FRAME_DATA_BYTES: usize = 256;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame truncated at byte {at}")]
    Truncated { at: usize },
    #[error("frame data too large: {len} bytes")]
    DataTooLarge { len: usize },
}

impl SdpFrame {
    /// A frame addressed to the host with the standard no-reply flags.
    pub fn to_host(srce_addr: u16, srce_port: u8, tag: u8) -> Self {
        SdpFrame {
            dest_addr: HOST_DEST_ADDR,
            dest_port: HOST_DEST_PORT,
            srce_addr,
            srce_port,
            flags: FLAGS_NO_REPLY,
            tag,
            ..SdpFrame::default()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.data.len() > MAX_FRAME_DATA_BYTES {
            return Err(FrameError::DataTooLarge {
                len: self.data.len(),
            });
        }
        let mut bytes = Vec::with_capacity(16 + self.data.len());
        bytes.extend_from_slice(&self.dest_addr.to_le_bytes());
        bytes.push(self.dest_port);
        bytes.extend_from_slice(&self.srce_addr.to_le_bytes());
        bytes.push(self.srce_port);
        bytes.push(self.flags);
        bytes.push(self.tag);
        bytes.extend_from_slice(&self.cmd_rc.to_le_bytes());
        bytes.extend_from_slice(&self.arg1.to_le_bytes());
        bytes.extend_from_slice(&self.arg2.to_le_bytes());
        bytes.extend_from_slice(&self.data);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut cursor = 0usize;
        let dest_addr = read_u16(bytes, &mut cursor)?;
        let dest_port = read_u8(bytes, &mut cursor)?;
        let srce_addr = read_u16(bytes, &mut cursor)?;
        let srce_port = read_u8(bytes, &mut cursor)?;
        let flags = read_u8(bytes, &mut cursor)?;
        let tag = read_u8(bytes, &mut cursor)?;
        let cmd_rc = read_u16(bytes, &mut cursor)?;
        let arg1 = read_u32(bytes, &mut cursor)?;
        let arg2 = read_u32(bytes, &mut cursor)?;
        let data = bytes[cursor..].to_vec();
        if data.len() > MAX_FRAME_DATA_BYTES {
            return Err(FrameError::DataTooLarge { len: data.len() });
        }
        Ok(SdpFrame {
            dest_addr,
            dest_port,
            srce_addr,
            srce_port,
            flags,
            tag,
            cmd_rc,
            arg1,
            arg2,
            data,
        })
    }

    /// Interpret the data section as fixed-point values.
    pub fn data_values(&self) -> Vec<Value> {
        decode_values(&self.data)
    }

    pub fn set_data_values(&mut self, values: &[Value]) {
        self.data = encode_values(values);
    }
}

pub fn encode_values(values: &[Value]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend_from_slice(&value.to_bits().to_le_bytes());
    }
    bytes
}

pub fn decode_values(bytes: &[u8]) -> Vec<Value> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(chunk);
            Value::from_bits(i32::from_le_bytes(buf))
        })
        .collect()
}

fn read_u8(bytes: &[u8], cursor: &mut usize) -> Result<u8, FrameError> {
    if *cursor >= bytes.len() {
        return Err(FrameError::Truncated { at: *cursor });
    }
    let value = bytes[*cursor];
    *cursor += 1;
    Ok(value)
}

fn read_u16(bytes: &[u8], cursor: &mut usize) -> Result<u16, FrameError> {
    let end = *cursor + 2;
    if end > bytes.len() {
        return Err(FrameError::Truncated { at: *cursor });
    }
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&bytes[*cursor..end]);
    *cursor = end;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32, FrameError> {
    let end = *cursor + 4;
    if end > bytes.len() {
        return Err(FrameError::Truncated { at: *cursor });
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[*cursor..end]);
    *cursor = end;
    Ok(u32::from_le_bytes(buf))
}

/// Host command surface of the simulation controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    GetTime,
    GetDrift,
    StartAt(u32),
    StopAt(u32),
}

pub const CMD_GET_TIME: u16 = 0;
pub const CMD_GET_DRIFT: u16 = 1;
pub const CMD_START_AT: u16 = 2;
pub const CMD_STOP_AT: u16 = 3;

impl HostCommand {
    /// Decode a controller command frame; `None` for reserved commands.
    pub fn from_frame(frame: &SdpFrame) -> Option<HostCommand> {
        match frame.cmd_rc {
            CMD_GET_TIME => Some(HostCommand::GetTime),
            CMD_GET_DRIFT => Some(HostCommand::GetDrift),
            CMD_START_AT => Some(HostCommand::StartAt(frame.arg1)),
            CMD_STOP_AT => Some(HostCommand::StopAt(frame.arg1)),
            _ => None,
        }
    }

    pub fn cmd_rc(&self) -> u16 {
        match self {
            HostCommand::GetTime => CMD_GET_TIME,
            HostCommand::GetDrift => CMD_GET_DRIFT,
            HostCommand::StartAt(_) => CMD_START_AT,
            HostCommand::StopAt(_) => CMD_STOP_AT,
        }
    }
}

/// Whether a kernel keeps running after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TickStatus {
    #[default]
    Running,
    /// Clean shutdown with the given exit code.
    Exited(u32),
}

/// Traffic emitted by one kernel entry point, in emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutput {
    pub packets: Vec<McPacket>,
    pub frames: Vec<SdpFrame>,
    pub status: TickStatus,
}

impl TickOutput {
    pub fn exited(code: u32) -> Self {
        TickOutput {
            status: TickStatus::Exited(code),
            ..TickOutput::default()
        }
    }

    pub fn running() -> Self {
        TickOutput::default()
    }

    pub fn push_packet(&mut self, packet: McPacket) {
        self.packets.push(packet);
    }

    pub fn push_frame(&mut self, frame: SdpFrame) {
        self.frames.push(frame);
    }
}
