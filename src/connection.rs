//! Stanza-level view of a byte transport.
//!
//! [`XmppConnection`] owns the transport and a [`StreamReader`]. Bytes are read
//! in chunks and pushed through the reader; stanzas the reader emits while a
//! chunk is processed wait in the connection's inbox until `recv_stanza` hands
//! them out.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::error::ConnectionError;
use crate::reader::framing::{StreamHeader, STREAM_CLOSE, WS_CLOSE};
use crate::reader::{FramingMode, ReaderEvent, StreamReader};
use crate::stanza::Stanza;

/// Size of a single transport read.
const READ_BUFFER_SIZE: usize = 8192;

/// Anything that can exchange whole stanzas with a peer.
#[async_trait]
pub trait StanzaChannel: Send {
    async fn send(&mut self, stanza: &Stanza) -> Result<(), ConnectionError>;
    async fn recv(&mut self) -> Result<Stanza, ConnectionError>;
}

pub struct XmppConnection<T> {
    stream: T,
    reader: StreamReader,
    inbox: VecDeque<Stanza>,
    /// Peer stream header not yet returned by `recv_open`.
    header: Option<StreamHeader>,
    peer_closed: bool,
    /// Default namespace of our outbound stream; stanzas in it omit `xmlns`.
    default_ns: Option<String>,
}

impl<T> XmppConnection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: T, mode: FramingMode, max_stanza_size: usize) -> Self {
        Self {
            stream,
            reader: StreamReader::with_limit(mode, max_stanza_size),
            inbox: VecDeque::new(),
            header: None,
            peer_closed: false,
            default_ns: None,
        }
    }

    pub fn from_config(stream: T, config: &EngineConfig) -> Self {
        Self::new(stream, config.framing, config.max_stanza_size)
    }

    pub fn mode(&self) -> FramingMode {
        self.reader.mode()
    }

    pub fn max_stanza_size(&self) -> usize {
        self.reader.max_buffer()
    }

    /// True once the peer closed its stream (`</stream:stream>` or `<close/>`).
    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Writes our stream header in the connection's framing.
    pub async fn send_open(&mut self, header: &StreamHeader) -> Result<(), ConnectionError> {
        match self.mode() {
            FramingMode::StreamWrapped => {
                self.default_ns = header.default_ns.clone();
                self.send_raw(&header.to_stream_open()).await
            }
            FramingMode::WebSocket => self.send_raw(&header.to_ws_open()).await,
            FramingMode::Standalone => Ok(()),
        }
    }

    /// Waits for the peer's stream header.
    pub async fn recv_open(&mut self) -> Result<StreamHeader, ConnectionError> {
        loop {
            if let Some(header) = self.header.take() {
                debug!(from = ?header.from, id = ?header.id, "Stream opened by peer");
                return Ok(header);
            }
            if self.peer_closed {
                return Err(ConnectionError::Closed);
            }
            self.fill().await?;
        }
    }

    pub async fn send_stanza(&mut self, stanza: &Stanza) -> Result<(), ConnectionError> {
        let xml = match self.default_ns {
            Some(ref default_ns) => stanza.to_xml_in(default_ns),
            None => stanza.to_xml(),
        };
        trace!(stanza = %xml, "Sending stanza");
        self.send_raw(&xml).await
    }

    /// Next stanza from the peer. Stanzas already parsed are returned before
    /// a close is reported.
    pub async fn recv_stanza(&mut self) -> Result<Stanza, ConnectionError> {
        loop {
            if let Some(stanza) = self.inbox.pop_front() {
                return Ok(stanza);
            }
            if self.peer_closed {
                return Err(ConnectionError::Closed);
            }
            self.fill().await?;
        }
    }

    /// Writes our stream footer.
    pub async fn send_close(&mut self) -> Result<(), ConnectionError> {
        match self.mode() {
            FramingMode::StreamWrapped => self.send_raw(STREAM_CLOSE).await,
            FramingMode::WebSocket => self.send_raw(WS_CLOSE).await,
            FramingMode::Standalone => Ok(()),
        }
    }

    /// Prepares for a stream restart (after STARTTLS or SASL success): the
    /// next bytes from the peer start a new stream.
    pub fn reset(&mut self) {
        if !self.inbox.is_empty() {
            debug!(dropped = self.inbox.len(), "Discarding stanzas from the previous stream");
        }
        self.reader.reset();
        self.inbox.clear();
        self.header = None;
        self.peer_closed = false;
    }

    /// Gives the transport back, dropping any buffered input.
    pub fn into_inner(self) -> T {
        self.stream
    }

    /// Inbound stanzas as a stream; ends when the peer closes.
    pub fn into_stanza_stream(self) -> impl Stream<Item = Result<Stanza, ConnectionError>> {
        stream::unfold(Some(self), |state| async move {
            let mut conn = state?;
            match conn.recv_stanza().await {
                Ok(stanza) => Some((Ok(stanza), Some(conn))),
                Err(ConnectionError::Closed) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    async fn send_raw(&mut self, data: &str) -> Result<(), ConnectionError> {
        self.stream.write_all(data.as_bytes()).await?;
        self.stream.flush().await?;
        debug!(bytes = data.len(), "Sent data");
        Ok(())
    }

    async fn fill(&mut self) -> Result<(), ConnectionError> {
        let mut read_buf = [0u8; READ_BUFFER_SIZE];
        let n = self.stream.read(&mut read_buf).await?;
        if n == 0 {
            debug!("Transport closed");
            self.peer_closed = true;
            return Err(ConnectionError::Closed);
        }
        debug!(bytes = n, "Received data");

        let inbox = &mut self.inbox;
        let header = &mut self.header;
        let peer_closed = &mut self.peer_closed;
        self.reader.push(&read_buf[..n], |event| match event {
            ReaderEvent::StreamOpened(h) => *header = Some(h),
            ReaderEvent::Stanza(s) => inbox.push_back(s),
            ReaderEvent::StreamClosed => *peer_closed = true,
        })?;
        Ok(())
    }
}

#[async_trait]
impl<T> StanzaChannel for XmppConnection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, stanza: &Stanza) -> Result<(), ConnectionError> {
        self.send_stanza(stanza).await
    }

    async fn recv(&mut self) -> Result<Stanza, ConnectionError> {
        self.recv_stanza().await
    }
}
