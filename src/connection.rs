//! connection facade: message assembly, control handling and the
//! close handshake on top of the frame codec
//!
//! a connection is one logical task; every method takes `&mut self` and
//! suspends only at transport reads and writes, so no locking is needed
//! and frame ordering on the wire follows call order exactly.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout_at, Instant};

use crate::codec::{FrameConfig, FrameSocket, Role};
use crate::errors::{ProtocolError, WsError};
use crate::frame::{Frame, OpCode};
use crate::protocol::close_code_permitted;
use crate::utf8::Utf8Validator;

/// how long to wait for the peer's close frame after sending ours
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// a complete application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// utf-8 text message
    Text(String),
    /// binary message
    Binary(Bytes),
}

impl Message {
    pub(crate) fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }

    /// payload bytes of either kind
    pub fn as_data(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    /// payload length in bytes
    pub fn len(&self) -> usize {
        self.as_data().len()
    }

    /// check for an empty payload
    pub fn is_empty(&self) -> bool {
        self.as_data().is_empty()
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(data))
    }
}

impl From<&[u8]> for Message {
    fn from(data: &[u8]) -> Self {
        Message::Binary(Bytes::copy_from_slice(data))
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::Binary(data)
    }
}

impl From<BytesMut> for Message {
    fn from(data: BytesMut) -> Self {
        Message::Binary(data.freeze())
    }
}

/// lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// handshake in progress
    Connecting,
    /// handshake done, traffic flows
    Open,
    /// we sent a close frame, waiting for the peer's
    ClosingLocal,
    /// peer sent a close frame, we are echoing it
    ClosingRemote,
    /// terminal
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Binary,
}

/// full duplex websocket connection after a successful handshake
///
/// `recv` never returns an error: protocol violations and transport
/// failures close the connection and surface as end of stream, with the
/// terminating code available from [`Connection::close_code`].
#[derive(Debug)]
pub struct Connection<S> {
    socket: FrameSocket<S>,
    state: ConnectionState,
    close_timeout: Duration,
    /// send a ping after this much inbound silence, disabled by default
    keepalive_interval: Option<Duration>,
    /// armed when our close frame goes out
    close_deadline: Option<Instant>,
    close_sent: bool,
    close_code: Option<u16>,
    close_reason: Option<String>,
    /// in-progress fragmented message
    partial: Option<(Kind, BytesMut)>,
    utf8: Utf8Validator,
    /// messages completed while another call was driving the stream
    pending: VecDeque<Message>,
    outstanding_pings: VecDeque<(u64, Bytes)>,
    next_ping_id: u64,
    subprotocol: Option<String>,
    remote_addr: Option<SocketAddr>,
    /// set while a suspending call is in flight; still set on entry
    /// means the previous call was cancelled mid io
    io_in_flight: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// wrap an already upgraded stream with default limits
    pub fn new(stream: S, role: Role) -> Self {
        Self::with_config(stream, role, FrameConfig::default())
    }

    /// wrap an already upgraded stream with the given limits
    pub fn with_config(stream: S, role: Role, config: FrameConfig) -> Self {
        Self::with_remaining(stream, role, config, BytesMut::new())
    }

    pub(crate) fn with_remaining(
        stream: S,
        role: Role,
        config: FrameConfig,
        remain: BytesMut,
    ) -> Self {
        Self {
            socket: FrameSocket::with_remaining(stream, role, config, remain),
            state: ConnectionState::Open,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            keepalive_interval: None,
            close_deadline: None,
            close_sent: false,
            close_code: None,
            close_reason: None,
            partial: None,
            utf8: Utf8Validator::new(),
            pending: VecDeque::new(),
            outstanding_pings: VecDeque::new(),
            next_ping_id: 0,
            subprotocol: None,
            remote_addr: None,
            io_in_flight: false,
        }
    }

    /// change the close handshake timeout
    pub fn set_close_timeout(&mut self, timeout: Duration) {
        self.close_timeout = timeout;
    }

    /// ping the peer after this much inbound silence while receiving,
    /// `None` turns the keepalive off
    pub fn set_keepalive_interval(&mut self, interval: Option<Duration>) {
        self.keepalive_interval = interval;
    }

    pub(crate) fn set_subprotocol(&mut self, subprotocol: Option<String>) {
        self.subprotocol = subprotocol;
    }

    pub(crate) fn set_remote_address(&mut self, addr: Option<SocketAddr>) {
        self.remote_addr = addr;
    }

    /// subprotocol negotiated during the handshake
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// peer address, when the transport had one
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// code that ended the connection
    ///
    /// the peer's close code once its close frame arrived, 1005 for a
    /// close frame without a code, 1006 when the transport died or the
    /// close handshake timed out, or the code we failed the connection
    /// with on a protocol violation
    pub fn close_code(&self) -> Option<u16> {
        self.close_code
    }

    /// reason text that accompanied the terminating close code
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// receive the next complete message
    ///
    /// ping/pong and the close handshake are handled internally and
    /// never surface. `None` means the connection reached its end;
    /// check [`Connection::close_code`] for why.
    pub async fn recv(&mut self) -> Option<Message> {
        if let Some(msg) = self.pending.pop_front() {
            return Some(msg);
        }
        if self.enter_io().await.is_err() {
            return None;
        }
        let out = self.next_message().await;
        self.io_in_flight = false;
        out
    }

    /// send one message, fragmenting only above the frame size limit
    pub async fn send(&mut self, msg: impl Into<Message>) -> Result<(), WsError> {
        let msg = msg.into();
        if self.state != ConnectionState::Open {
            return Err(WsError::InvalidConnState(self.state));
        }
        self.enter_io().await?;
        let res = self.send_inner(msg).await;
        self.io_in_flight = false;
        if res.is_err() {
            self.close_code.get_or_insert(1006);
            self.state = ConnectionState::Closed;
        }
        res
    }

    async fn send_inner(&mut self, msg: Message) -> Result<(), WsError> {
        let opcode = msg.opcode();
        let data = msg.as_data();
        let max = self.socket.config().max_frame_size;
        if data.len() <= max {
            return self.socket.write_frame(Frame::new(true, opcode, data)).await;
        }
        let mut chunks = data.chunks(max).peekable();
        let mut code = opcode;
        while let Some(chunk) = chunks.next() {
            let fin = chunks.peek().is_none();
            self.socket.write_frame(Frame::new(fin, code, chunk)).await?;
            code = OpCode::Continue;
        }
        Ok(())
    }

    /// send a ping and wait for the matching pong
    ///
    /// pongs are matched by payload equality against the oldest
    /// outstanding ping. messages completing while waiting are queued
    /// for the next `recv`.
    pub async fn ping(&mut self, payload: &[u8]) -> Result<(), WsError> {
        if payload.len() > 125 {
            return Err(WsError::ControlPayloadTooBig(payload.len()));
        }
        if self.state != ConnectionState::Open {
            return Err(WsError::InvalidConnState(self.state));
        }
        self.enter_io().await?;
        let res = self.ping_inner(payload).await;
        self.io_in_flight = false;
        res
    }

    async fn ping_inner(&mut self, payload: &[u8]) -> Result<(), WsError> {
        let id = self.next_ping_id;
        self.next_ping_id += 1;
        self.socket.write_frame(Frame::ping(payload)).await?;
        self.outstanding_pings
            .push_back((id, Bytes::copy_from_slice(payload)));
        loop {
            if !self.outstanding_pings.iter().any(|(pid, _)| *pid == id) {
                return Ok(());
            }
            if self.state == ConnectionState::Closed {
                return Err(WsError::ConnectionClosed);
            }
            if let Some(msg) = self.step().await {
                self.pending.push_back(msg);
            }
        }
    }

    /// initiate the close handshake
    ///
    /// sends a close frame and arms the close timer; the handshake
    /// finishes during a later `recv` or `wait_closed` when the peer's
    /// close frame arrives or the timer fires
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), WsError> {
        if !close_code_permitted(code) {
            return Err(WsError::InvalidCloseCode(code));
        }
        if reason.len() > 123 {
            return Err(WsError::ControlPayloadTooBig(reason.len()));
        }
        if self.state != ConnectionState::Open {
            return Err(WsError::InvalidConnState(self.state));
        }
        self.enter_io().await?;
        let res = self.socket.write_frame(Frame::close(Some(code), reason)).await;
        self.io_in_flight = false;
        match res {
            Ok(()) => {
                self.close_sent = true;
                self.state = ConnectionState::ClosingLocal;
                self.close_deadline = Some(Instant::now() + self.close_timeout);
                tracing::debug!(code, reason, "close handshake started");
                Ok(())
            }
            Err(err) => {
                self.close_code.get_or_insert(1006);
                self.state = ConnectionState::Closed;
                Err(err)
            }
        }
    }

    /// drive the connection until it is fully closed
    ///
    /// data messages arriving while waiting are discarded
    pub async fn wait_closed(&mut self) {
        if self.io_in_flight {
            self.abort().await;
            return;
        }
        self.io_in_flight = true;
        while self.state != ConnectionState::Closed {
            let _ = self.step().await;
        }
        self.io_in_flight = false;
    }

    /// guard shared by every suspending call: a poisoned connection
    /// (previous call cancelled mid io) is aborted instead of resumed
    async fn enter_io(&mut self) -> Result<(), WsError> {
        if self.io_in_flight {
            tracing::warn!("suspended call was cancelled, aborting connection");
            self.abort().await;
            return Err(WsError::ConnectionClosed);
        }
        if self.state == ConnectionState::Closed {
            return Err(WsError::InvalidConnState(ConnectionState::Closed));
        }
        self.io_in_flight = true;
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Message> {
        loop {
            if self.state == ConnectionState::Closed {
                return None;
            }
            if let Some(msg) = self.step().await {
                return Some(msg);
            }
        }
    }

    /// read one frame and feed it through the state machine
    ///
    /// failures are terminal: they close the connection and leave the
    /// code in `close_code`, so callers only need to watch the state
    async fn step(&mut self) -> Option<Message> {
        let read = if let Some(deadline) = self.close_deadline {
            match timeout_at(deadline, self.socket.read_frame()).await {
                Ok(read) => read,
                Err(_) => {
                    tracing::debug!("peer did not answer the close frame in time");
                    self.abort().await;
                    return None;
                }
            }
        } else if let (Some(interval), ConnectionState::Open) =
            (self.keepalive_interval, self.state)
        {
            match tokio::time::timeout(interval, self.socket.read_frame()).await {
                Ok(read) => read,
                Err(_) => {
                    tracing::trace!("inbound idle, sending keepalive ping");
                    if self.socket.write_frame(Frame::ping(b"")).await.is_err() {
                        self.abort().await;
                    }
                    return None;
                }
            }
        } else {
            self.socket.read_frame().await
        };
        let frame = match read {
            Ok(frame) => frame,
            Err(WsError::Protocol { close_code, error }) => {
                self.fail(close_code, &error.to_string()).await;
                return None;
            }
            Err(_) => {
                self.abort().await;
                return None;
            }
        };
        match self.handle_frame(frame).await {
            Ok(msg) => msg,
            Err(WsError::Protocol { close_code, error }) => {
                self.fail(close_code, &error.to_string()).await;
                None
            }
            Err(_) => {
                self.abort().await;
                None
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Option<Message>, WsError> {
        match frame.opcode() {
            OpCode::Ping => {
                if self.state == ConnectionState::Open {
                    self.socket.write_frame(Frame::pong(frame.payload())).await?;
                }
                Ok(None)
            }
            OpCode::Pong => {
                if let Some((_, expected)) = self.outstanding_pings.front() {
                    if expected.as_ref() == frame.payload() {
                        self.outstanding_pings.pop_front();
                    }
                }
                Ok(None)
            }
            OpCode::Close => {
                self.handle_close(&frame).await?;
                Ok(None)
            }
            OpCode::Text | OpCode::Binary | OpCode::Continue => {
                if self.state != ConnectionState::Open {
                    // data frames arriving after the close handshake
                    // started are drained and dropped
                    return Ok(None);
                }
                self.assemble(frame)
            }
        }
    }

    async fn handle_close(&mut self, frame: &Frame) -> Result<(), WsError> {
        let (code, reason) = parse_close_payload(frame.payload())?;
        tracing::debug!(code, %reason, "close frame received");
        self.close_code = Some(code);
        self.close_reason = Some(reason);
        if self.state == ConnectionState::Open {
            self.state = ConnectionState::ClosingRemote;
            if !self.close_sent {
                let echo_code = if code == 1005 { None } else { Some(code) };
                self.socket.write_frame(Frame::close(echo_code, "")).await?;
                self.close_sent = true;
            }
        }
        self.state = ConnectionState::Closed;
        let _ = self.socket.shutdown().await;
        Ok(())
    }

    fn assemble(&mut self, frame: Frame) -> Result<Option<Message>, WsError> {
        let fin = frame.fin();
        match frame.opcode() {
            OpCode::Text | OpCode::Binary => {
                if self.partial.is_some() {
                    return Err(ProtocolError::UnexpectedDataFrame.into());
                }
                let kind = if frame.opcode() == OpCode::Text {
                    Kind::Text
                } else {
                    Kind::Binary
                };
                self.check_message_size(frame.payload.len())?;
                if kind == Kind::Text {
                    self.utf8.reset();
                    if !self.utf8.feed(frame.payload()) {
                        return Err(ProtocolError::InvalidUtf8.into());
                    }
                }
                if fin {
                    self.finish_message(kind, frame.payload).map(Some)
                } else {
                    self.partial = Some((kind, frame.payload));
                    Ok(None)
                }
            }
            OpCode::Continue => {
                let Some((kind, mut buffer)) = self.partial.take() else {
                    return Err(ProtocolError::MissingInitialFragment.into());
                };
                self.check_message_size(buffer.len() + frame.payload.len())?;
                if kind == Kind::Text && !self.utf8.feed(frame.payload()) {
                    return Err(ProtocolError::InvalidUtf8.into());
                }
                buffer.extend_from_slice(frame.payload());
                if fin {
                    self.finish_message(kind, buffer).map(Some)
                } else {
                    self.partial = Some((kind, buffer));
                    Ok(None)
                }
            }
            // control frames never reach the assembler
            OpCode::Close | OpCode::Ping | OpCode::Pong => Ok(None),
        }
    }

    fn check_message_size(&self, size: usize) -> Result<(), WsError> {
        let limit = self.socket.config().max_message_size;
        if size > limit {
            return Err(ProtocolError::MessageTooLarge { size, limit }.into());
        }
        Ok(())
    }

    fn finish_message(&mut self, kind: Kind, buffer: BytesMut) -> Result<Message, WsError> {
        match kind {
            Kind::Text => {
                if !self.utf8.is_complete() {
                    return Err(ProtocolError::InvalidUtf8.into());
                }
                let text = String::from_utf8(buffer.to_vec())
                    .map_err(|_| WsError::from(ProtocolError::InvalidUtf8))?;
                Ok(Message::Text(text))
            }
            Kind::Binary => Ok(Message::Binary(buffer.freeze())),
        }
    }

    /// fail the connection for a wire violation: send the close code,
    /// record it and drop the transport
    async fn fail(&mut self, close_code: u16, reason: &str) {
        tracing::debug!(close_code, reason, "failing connection");
        if !self.close_sent {
            let reason = if reason.len() > 123 { "" } else { reason };
            let _ = self
                .socket
                .write_frame(Frame::close(Some(close_code), reason))
                .await;
            self.close_sent = true;
        }
        self.close_code.get_or_insert(close_code);
        if self.close_reason.is_none() && !reason.is_empty() {
            self.close_reason = Some(reason.to_string());
        }
        self.state = ConnectionState::Closed;
        let _ = self.socket.shutdown().await;
    }

    /// tear the connection down without a close frame, 1006 locally
    async fn abort(&mut self) {
        self.close_code.get_or_insert(1006);
        self.state = ConnectionState::Closed;
        let _ = self.socket.shutdown().await;
    }
}

/// split a close frame payload into code and reason
///
/// an empty payload stands for "no code present" and is reported as
/// 1005; a one byte payload is malformed; the reason must be complete
/// utf-8
fn parse_close_payload(payload: &[u8]) -> Result<(u16, String), WsError> {
    match payload.len() {
        0 => Ok((1005, String::new())),
        1 => Err(ProtocolError::InvalidCloseFramePayload.into()),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !close_code_permitted(code) {
                return Err(ProtocolError::InvalidCloseCode(code).into());
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| WsError::from(ProtocolError::InvalidUtf8))?;
            Ok((code, reason.to_string()))
        }
    }
}
