use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{ProtocolError, WsError};
use crate::frame::{Frame, FrameHeader, OpCode};

/// which side of the connection this endpoint plays
///
/// the role decides masking: client frames go out masked with a fresh
/// random key, server frames go out bare, and the decoder enforces the
/// mirror image on what it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// connection initiator, masks outgoing frames
    Client,
    /// accepting side, never masks
    Server,
}

impl Role {
    /// check is client side
    pub fn is_client(&self) -> bool {
        matches!(self, Role::Client)
    }
}

/// frame codec limits & toggles
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// reject frames with non zero rsv bits, on unless an extension
    /// is negotiated (none are)
    pub check_rsv: bool,
    /// max payload bytes of a single frame, larger frames fail the
    /// connection with 1009
    pub max_frame_size: usize,
    /// max bytes of an assembled message, checked on every fragment
    pub max_message_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            check_rsv: true,
            max_frame_size: 1024 * 1024,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// xor the payload with the mask key, byte at a time
#[inline]
pub(crate) fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// xor the payload with the mask key, a word at a time with a byte
/// tail, equivalent to [`apply_mask`]
#[inline]
pub(crate) fn apply_mask_fast32(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let mut word = [0u8; 4];
        word.copy_from_slice(chunk);
        let masked = u32::from_ne_bytes(word) ^ mask_u32;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }
    let tail = chunks.into_remainder();
    apply_mask(tail, mask);
}

/// websocket frame codec
///
/// decoding validates everything RFC 6455 lets a peer get wrong at the
/// frame level; encoding always emits the minimal length form and a
/// fresh random mask key per frame on the client side.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    config: FrameConfig,
    role: Role,
}

impl FrameCodec {
    /// codec with the given limits for one side of a connection
    pub fn new(role: Role, config: FrameConfig) -> Self {
        Self { config, role }
    }

    /// configured limits
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WsError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let b0 = src[0];
        let b1 = src[1];
        if self.config.check_rsv && b0 & 0x70 != 0 {
            return Err(ProtocolError::InvalidLeadingBits(b0 >> 4).into());
        }
        let opcode = OpCode::from_u8(b0 & 0x0f).map_err(ProtocolError::InvalidOpcode)?;
        let fin = b0 & 0x80 != 0;
        let masked = b1 & 0x80 != 0;
        match self.role {
            Role::Server if !masked => return Err(ProtocolError::UnmaskedFrameFromClient.into()),
            Role::Client if masked => return Err(ProtocolError::MaskedFrameFromServer.into()),
            _ => {}
        }
        let len7 = b1 & 0x7f;
        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControlFrame.into());
            }
            if len7 > 125 {
                return Err(ProtocolError::ControlFrameTooBig(len7 as usize).into());
            }
        }
        let (len_ext, payload_len) = match len7 {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([src[2], src[3]]) as u64;
                if len < 126 {
                    return Err(ProtocolError::NonMinimalLength.into());
                }
                (2usize, len)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(raw);
                if len & (1 << 63) != 0 {
                    return Err(ProtocolError::InvalidLengthHighBit.into());
                }
                if len < 65536 {
                    return Err(ProtocolError::NonMinimalLength.into());
                }
                (8usize, len)
            }
            len => (0usize, len as u64),
        };
        if payload_len > self.config.max_frame_size as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                limit: self.config.max_frame_size,
            }
            .into());
        }
        let header_len = 2 + len_ext + if masked { 4 } else { 0 };
        let frame_len = header_len + payload_len as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        let mask_key = if masked {
            let mut key = [0u8; 4];
            key.copy_from_slice(&src[2 + len_ext..6 + len_ext]);
            Some(key)
        } else {
            None
        };
        src.advance(header_len);
        let mut payload = src.split_to(payload_len as usize);
        if let Some(key) = mask_key {
            apply_mask_fast32(&mut payload, key);
        }
        Ok(Some(Frame {
            header: FrameHeader {
                fin,
                rsv1: b0 & 0x40 != 0,
                rsv2: b0 & 0x20 != 0,
                rsv3: b0 & 0x10 != 0,
                opcode,
                masked,
            },
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WsError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), WsError> {
        let Frame { header, mut payload } = item;
        let len = payload.len();
        let mask = if self.role.is_client() {
            Some(rand::random::<[u8; 4]>())
        } else {
            None
        };
        let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
        dst.reserve(14 + len);
        dst.put_u8((header.fin as u8) << 7 | header.opcode.as_u8());
        match len {
            0..=125 => dst.put_u8(mask_bit | len as u8),
            126..=65535 => {
                dst.put_u8(mask_bit | 126);
                dst.put_u16(len as u16);
            }
            _ => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(len as u64);
            }
        }
        if let Some(key) = mask {
            dst.put_slice(&key);
            apply_mask_fast32(&mut payload, key);
        }
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// frame oriented wrapper around a byte stream
///
/// owns the read/write buffers of one connection; the write buffer is
/// drained and flushed per frame so a frame is never interleaved with
/// another on the wire.
#[derive(Debug)]
pub struct FrameSocket<S> {
    stream: S,
    codec: FrameCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameSocket<S> {
    /// wrap a stream with default limits
    pub fn new(stream: S, role: Role) -> Self {
        Self::with_config(stream, role, FrameConfig::default())
    }

    /// wrap a stream with the given limits
    pub fn with_config(stream: S, role: Role, config: FrameConfig) -> Self {
        Self::with_remaining(stream, role, config, BytesMut::new())
    }

    /// wrap a stream, seeding bytes already read past the handshake
    pub(crate) fn with_remaining(
        stream: S,
        role: Role,
        config: FrameConfig,
        remain: BytesMut,
    ) -> Self {
        Self {
            stream,
            codec: FrameCodec::new(role, config),
            read_buf: remain,
            write_buf: BytesMut::with_capacity(4096),
        }
    }

    /// configured limits
    pub fn config(&self) -> &FrameConfig {
        &self.codec.config
    }

    /// get mutable ref of underlying stream
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// read until one complete frame is decoded
    pub async fn read_frame(&mut self) -> Result<Frame, WsError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buf)? {
                tracing::trace!(opcode = ?frame.opcode(), len = frame.payload.len(), "frame in");
                return Ok(frame);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(WsError::ConnectionClosed);
            }
        }
    }

    /// encode, write and flush one frame
    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), WsError> {
        tracing::trace!(opcode = ?frame.opcode(), len = frame.payload.len(), "frame out");
        self.codec.encode(frame, &mut self.write_buf)?;
        self.stream.write_all_buf(&mut self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// shut down the underlying stream
    pub async fn shutdown(&mut self) -> Result<(), WsError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
