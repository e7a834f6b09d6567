use thiserror::Error;

use crate::connection::ConnectionState;

/// errors during handshake, read/write frame
#[derive(Debug, Error)]
pub enum WsError {
    #[error("invalid uri `{0}`")]
    InvalidUri(String),
    #[error("connection failed `{0}`")]
    ConnectionFailed(String),
    #[cfg(feature = "tls_rustls")]
    #[error("tls dns lookup failed `{0}`")]
    TlsDnsFailed(String),
    #[error("io error {0:?}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("{error}")]
    Protocol {
        /// status code to put on the wire when failing the connection
        close_code: u16,
        /// the violation that fails the connection
        error: ProtocolError,
    },
    #[error("io on invalid connection state {0:?}")]
    InvalidConnState(ConnectionState),
    #[error("close code {0} not allowed on the wire")]
    InvalidCloseCode(u16),
    #[error("control frame payload too big ({0} bytes)")]
    ControlPayloadTooBig(usize),
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<ProtocolError> for WsError {
    fn from(error: ProtocolError) -> Self {
        WsError::Protocol {
            close_code: error.close_code(),
            error,
        }
    }
}

/// wire level violations detected while decoding or assembling frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid leading bits {0:b}")]
    InvalidLeadingBits(u8),
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),
    #[error("payload length not minimally encoded")]
    NonMinimalLength,
    #[error("64 bit payload length has high bit set")]
    InvalidLengthHighBit,
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    #[error("control frame too big ({0} bytes)")]
    ControlFrameTooBig(usize),
    #[error("unmasked frame from client")]
    UnmaskedFrameFromClient,
    #[error("masked frame from server")]
    MaskedFrameFromServer,
    #[error("continuation frame without initial fragment")]
    MissingInitialFragment,
    #[error("data frame while a fragmented message is in progress")]
    UnexpectedDataFrame,
    #[error("invalid close frame payload len, expect 0 or >= 2")]
    InvalidCloseFramePayload,
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    #[error("invalid utf-8 text")]
    InvalidUtf8,
    #[error("frame too large ({size} bytes, limit {limit})")]
    FrameTooLarge { size: u64, limit: usize },
    #[error("message too large ({size} bytes, limit {limit})")]
    MessageTooLarge { size: usize, limit: usize },
}

impl ProtocolError {
    /// close code that fails the connection for this violation
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::InvalidUtf8 => 1007,
            ProtocolError::FrameTooLarge { .. } | ProtocolError::MessageTooLarge { .. } => 1009,
            _ => 1002,
        }
    }
}
