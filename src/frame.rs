use bytes::{BufMut, BytesMut};

/// Defines the interpretation of the "Payload data".  If an unknown
/// opcode is received, the receiving endpoint MUST _Fail the
/// WebSocket Connection_.  The following values are defined.
/// - x0 denotes a continuation frame
/// - x1 denotes a text frame
/// - x2 denotes a binary frame
/// - x8 denotes a connection close
/// - x9 denotes a ping
/// - xA denotes a pong
///
/// x3-7 and xB-F are reserved and rejected at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// - x0 denotes a continuation frame
    Continue,
    /// - x1 denotes a text frame
    Text,
    /// - x2 denotes a binary frame
    Binary,
    /// - x8 denotes a connection close
    Close,
    /// - x9 denotes a ping
    Ping,
    /// - xA denotes a pong
    Pong,
}

impl OpCode {
    /// get corresponding u8 value
    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xa,
        }
    }

    /// parse the low nibble of the first header byte, reserved
    /// opcodes are returned as the raw value
    pub fn from_u8(val: u8) -> Result<Self, u8> {
        match val {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xa => Ok(OpCode::Pong),
            other => Err(other),
        }
    }

    /// check is close/ping/pong
    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// check is text/binary/continuation
    pub fn is_data(&self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary | OpCode::Continue)
    }
}

/// decoded view of the fixed part of a frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// final fragment of a message
    pub fin: bool,
    /// reserved bit 1, must be zero without a negotiated extension
    pub rsv1: bool,
    /// reserved bit 2
    pub rsv2: bool,
    /// reserved bit 3
    pub rsv3: bool,
    /// frame opcode
    pub opcode: OpCode,
    /// whether the payload arrived masked
    pub masked: bool,
}

impl FrameHeader {
    /// header for a locally constructed frame, rsv bits zero
    pub fn new(fin: bool, opcode: OpCode) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masked: false,
        }
    }
}

/// a single frame, payload always held unmasked
///
/// masking is applied by the encoder on the way out and removed by the
/// decoder on the way in, so the payload here is usable as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// frame header
    pub header: FrameHeader,
    /// unmasked payload
    pub payload: BytesMut,
}

impl Frame {
    /// construct a frame from parts
    pub fn new(fin: bool, opcode: OpCode, payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(payload.len());
        buf.extend_from_slice(payload);
        Self {
            header: FrameHeader::new(fin, opcode),
            payload: buf,
        }
    }

    /// helper function to construct a final text frame
    pub fn text(data: &str) -> Self {
        Self::new(true, OpCode::Text, data.as_bytes())
    }

    /// helper function to construct a final binary frame
    pub fn binary(data: &[u8]) -> Self {
        Self::new(true, OpCode::Binary, data)
    }

    /// helper function to construct a ping frame
    pub fn ping(data: &[u8]) -> Self {
        debug_assert!(data.len() <= 125);
        Self::new(true, OpCode::Ping, data)
    }

    /// helper function to construct a pong frame
    pub fn pong(data: &[u8]) -> Self {
        debug_assert!(data.len() <= 125);
        Self::new(true, OpCode::Pong, data)
    }

    /// helper function to construct a close frame
    ///
    /// a close frame without a code carries an empty payload; with a
    /// code the first two payload bytes are the code in network order
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        debug_assert!(reason.len() <= 123);
        debug_assert!(code.is_some() || reason.is_empty());
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        if let Some(code) = code {
            payload.put_u16(code);
            payload.extend_from_slice(reason.as_bytes());
        }
        Self {
            header: FrameHeader::new(true, OpCode::Close),
            payload,
        }
    }

    /// get fin bit value
    pub fn fin(&self) -> bool {
        self.header.fin
    }

    /// return frame opcode
    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    /// get payload
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_nibble_roundtrip() {
        for code in [
            OpCode::Continue,
            OpCode::Text,
            OpCode::Binary,
            OpCode::Close,
            OpCode::Ping,
            OpCode::Pong,
        ] {
            assert_eq!(OpCode::from_u8(code.as_u8()), Ok(code));
        }
    }

    #[test]
    fn reserved_opcodes_rejected() {
        for val in (0x3..=0x7).chain(0xb..=0xf) {
            assert_eq!(OpCode::from_u8(val), Err(val));
        }
    }

    #[test]
    fn close_frame_payload_layout() {
        let frame = Frame::close(Some(1000), "bye");
        assert_eq!(frame.payload(), &[0x03, 0xe8, b'b', b'y', b'e']);
        let empty = Frame::close(None, "");
        assert!(empty.payload().is_empty());
    }
}
