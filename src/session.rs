//! Authenticated stream: stream open, SASL, stream restart, then stanza
//! exchange with XEP-0198 accounting.
//!
//! Once stream management is enabled, every outbound stanza is recorded in the
//! ledger after it is written, and inbound `<r/>`/`<a/>` frames are consumed
//! here instead of reaching the application.

use std::collections::VecDeque;
use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, StreamManagementConfig};
use crate::connection::XmppConnection;
use crate::error::{ConnectionError, EngineError, SmError};
use crate::ns;
use crate::reader::framing::StreamHeader;
use crate::reader::FramingMode;
use crate::sasl::{self, CredentialSource};
use crate::sm::{AckPolicy, StreamManagement};
use crate::stanza::{Stanza, StanzaKind};

pub struct Session<T> {
    conn: XmppConnection<T>,
    features: Stanza,
    sm: Option<StreamManagement>,
    policy: AckPolicy,
    /// Stanzas that arrived while waiting for `<enabled/>`.
    backlog: VecDeque<Stanza>,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a connection whose (post-authentication) stream is open and whose
    /// features were already read.
    pub fn new(conn: XmppConnection<T>, features: Stanza, policy: AckPolicy) -> Self {
        Self {
            conn,
            features,
            sm: None,
            policy,
            backlog: VecDeque::new(),
        }
    }

    /// Features of the current stream.
    pub fn features(&self) -> &Stanza {
        &self.features
    }

    pub fn offers_stream_management(&self) -> bool {
        self.features.child_ns("sm", ns::STREAM_MANAGEMENT).is_some()
    }

    pub fn stream_management(&self) -> Option<&StreamManagement> {
        self.sm.as_ref()
    }

    pub fn stream_management_mut(&mut self) -> Option<&mut StreamManagement> {
        self.sm.as_mut()
    }

    /// Sends `<enable/>` and waits for the answer. Stanzas that arrive in the
    /// meantime are kept for `recv`.
    pub async fn enable_stream_management(&mut self, resume: bool) -> Result<(), EngineError> {
        if self.sm.is_some() {
            return Ok(());
        }
        if !self.offers_stream_management() {
            return Err(SmError::Failed("server does not offer stream management".into()).into());
        }

        self.conn
            .send_stanza(&StreamManagement::enable_request(resume))
            .await?;
        loop {
            let stanza = self.conn.recv_stanza().await?;
            match stanza.kind() {
                StanzaKind::SmEnabled => {
                    info!(
                        id = stanza.attr("id").unwrap_or_default(),
                        resume = stanza.attr("resume").unwrap_or("false"),
                        "Stream management enabled"
                    );
                    self.sm = Some(StreamManagement::new());
                    return Ok(());
                }
                StanzaKind::SmFailed => {
                    let reason = stanza
                        .first_child()
                        .map(|c| c.name().to_string())
                        .unwrap_or_else(|| "undefined-condition".to_string());
                    warn!(reason = %reason, "Server refused stream management");
                    return Err(SmError::Failed(reason).into());
                }
                _ => self.backlog.push_back(stanza),
            }
        }
    }

    /// Enables stream management when `config.enabled` is set and the server
    /// offers it, asking for resumption per `config.resume`. Returns whether
    /// the ledger is active afterwards. Call it once the resource is bound.
    pub async fn enable_stream_management_from(
        &mut self,
        config: &StreamManagementConfig,
    ) -> Result<bool, EngineError> {
        if !config.enabled {
            debug!("Stream management disabled by configuration");
            return Ok(self.sm.is_some());
        }
        if !self.offers_stream_management() {
            debug!("Server does not offer stream management, continuing without it");
            return Ok(false);
        }
        self.enable_stream_management(config.resume).await?;
        Ok(true)
    }

    /// Writes a stanza, then records it in the ledger. An ack request follows
    /// when the policy asks for one.
    pub async fn send(&mut self, stanza: Stanza) -> Result<(), EngineError> {
        self.conn.send_stanza(&stanza).await?;

        let Some(sm) = self.sm.as_mut() else {
            return Ok(());
        };
        if StreamManagement::is_management_frame(&stanza) {
            return Ok(());
        }
        let seq = sm.on_send(stanza);
        if self.policy.should_request(seq) {
            let request = sm.request_ack();
            self.conn.send_stanza(&request).await?;
        }
        Ok(())
    }

    /// Next application stanza. Management frames are handled internally
    /// and never returned while stream management is enabled.
    pub async fn recv(&mut self) -> Result<Stanza, EngineError> {
        if let Some(stanza) = self.backlog.pop_front() {
            return Ok(stanza);
        }

        loop {
            let stanza = self.conn.recv_stanza().await?;
            let Some(sm) = self.sm.as_mut() else {
                return Ok(stanza);
            };
            if !StreamManagement::is_management_frame(&stanza) {
                sm.on_received();
                return Ok(stanza);
            }
            if let Some(reply) = sm.handle_frame(&stanza)? {
                debug!(h = reply.attr("h").unwrap_or_default(), "Answering ack request");
                self.conn.send_stanza(&reply).await?;
            }
        }
    }

    /// Sends `<r/>` without sending a stanza.
    pub async fn request_ack(&mut self) -> Result<(), EngineError> {
        let sm = self.sm.as_ref().ok_or(SmError::NotEnabled)?;
        let request = sm.request_ack();
        self.conn.send_stanza(&request).await?;
        Ok(())
    }

    /// Closes our side of the stream and hands back the connection.
    pub async fn close(mut self) -> Result<XmppConnection<T>, EngineError> {
        if let Some(ref sm) = self.sm {
            if sm.has_unacked() {
                warn!(unacked = sm.unacked_len(), "Closing with unacknowledged stanzas");
            }
        }
        self.conn.send_close().await?;
        Ok(self.conn)
    }

    pub fn into_connection(self) -> XmppConnection<T> {
        self.conn
    }
}

/// Sends our header and, unless there is no stream wrapper, waits for the
/// server's header and features.
async fn open_stream<T>(
    conn: &mut XmppConnection<T>,
    header: &StreamHeader,
) -> Result<Stanza, EngineError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    conn.send_open(header).await?;
    if conn.mode() != FramingMode::Standalone {
        conn.recv_open().await?;
    }
    let features = conn.recv_stanza().await?;
    if features.kind() != StanzaKind::StreamFeatures {
        return Err(ConnectionError::UnexpectedStanza(format!(
            "expected stream features, got {}",
            features
        ))
        .into());
    }
    Ok(features)
}

/// Opens a stream, authenticates and restarts the stream.
///
/// `encrypted` states whether `conn` already runs over TLS. Resource binding
/// and stream management are left to the caller, on the returned session.
pub async fn login<T, S>(
    mut conn: XmppConnection<T>,
    config: &EngineConfig,
    encrypted: bool,
    credentials: &dyn CredentialSource,
    shutdown: S,
) -> Result<Session<T>, EngineError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    S: Future<Output = ()>,
{
    let header = StreamHeader::client(&config.domain);
    let features = open_stream(&mut conn, &header).await?;
    let mechanisms = sasl::mechanisms_from_features(&features);

    sasl::authenticate(
        &mut conn,
        &mechanisms,
        config.auth_options(encrypted),
        credentials,
        shutdown,
    )
    .await?;

    conn.reset();
    let features = open_stream(&mut conn, &header).await?;
    info!(domain = %config.domain, "Stream restarted after authentication");
    Ok(Session::new(conn, features, config.ack_policy()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use crate::reader::{ReaderEvent, StreamReader, DEFAULT_MAX_STANZA_SIZE};
    use crate::sasl::Credentials;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    const SERVER_OPEN: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='x1' version='1.0'>";
    const AUTH_FEATURES: &str = "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
        <mechanism>PLAIN</mechanism></mechanisms></stream:features>";
    const SESSION_FEATURES: &str = "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
        <sm xmlns='urn:xmpp:sm:3'/></stream:features>";

    /// Server side of a duplex pipe, parsing what the client writes.
    struct FakeServer {
        io: DuplexStream,
        reader: StreamReader,
        events: VecDeque<ReaderEvent>,
    }

    impl FakeServer {
        fn new(io: DuplexStream) -> Self {
            Self {
                io,
                reader: StreamReader::new(FramingMode::StreamWrapped),
                events: VecDeque::new(),
            }
        }

        async fn next_event(&mut self) -> ReaderEvent {
            loop {
                if let Some(event) = self.events.pop_front() {
                    return event;
                }
                let mut buf = vec![0u8; 4096];
                let n = self.io.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed the pipe");
                let events = &mut self.events;
                self.reader.push(&buf[..n], |e| events.push_back(e)).unwrap();
            }
        }

        async fn expect_open(&mut self) {
            match self.next_event().await {
                ReaderEvent::StreamOpened(header) => {
                    assert_eq!(header.to.as_deref(), Some("example.com"))
                }
                other => panic!("expected stream open, got {:?}", other),
            }
        }

        async fn expect_stanza(&mut self) -> Stanza {
            match self.next_event().await {
                ReaderEvent::Stanza(stanza) => stanza,
                other => panic!("expected a stanza, got {:?}", other),
            }
        }

        async fn write(&mut self, data: &str) {
            self.io.write_all(data.as_bytes()).await.unwrap();
        }

        /// Stream restart after `<success/>`.
        fn restart(&mut self) {
            self.reader.reset();
            self.events.clear();
        }
    }

    fn setup() -> (XmppConnection<DuplexStream>, FakeServer) {
        let (client, server) = duplex(64 * 1024);
        (
            XmppConnection::new(client, FramingMode::StreamWrapped, DEFAULT_MAX_STANZA_SIZE),
            FakeServer::new(server),
        )
    }

    fn config(allow_plain: bool) -> EngineConfig {
        let mut config = EngineConfig::new("example.com");
        config.allow_plain = allow_plain;
        config
    }

    /// Runs the server side of a PLAIN login and returns the server for the
    /// rest of the scenario.
    async fn serve_login(mut server: FakeServer) -> FakeServer {
        server.expect_open().await;
        server.write(&format!("{}{}", SERVER_OPEN, AUTH_FEATURES)).await;

        let auth = server.expect_stanza().await;
        assert!(auth.is("auth", ns::SASL));
        let payload = STANDARD.decode(auth.text().unwrap()).unwrap();
        assert_eq!(payload, b"\0juliet\0r0m30myr0m30");
        server.restart();
        server
            .write("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await;

        server.expect_open().await;
        server.write(&format!("{}{}", SERVER_OPEN, SESSION_FEATURES)).await;
        server
    }

    async fn logged_in() -> (Session<DuplexStream>, FakeServer) {
        let (conn, server) = setup();
        let server_task = tokio::spawn(serve_login(server));
        let creds = Credentials::new("juliet", "r0m30myr0m30");
        let session = login(conn, &config(true), true, &creds, std::future::pending())
            .await
            .unwrap();
        (session, server_task.await.unwrap())
    }

    #[tokio::test]
    async fn test_login_with_plain() {
        let (session, _server) = logged_in().await;
        assert!(session.features().child("bind").is_some());
        assert!(session.offers_stream_management());
        assert!(session.stream_management().is_none());
    }

    #[tokio::test]
    async fn test_login_refuses_plain_when_disallowed() {
        let (conn, mut server) = setup();
        let server_task = tokio::spawn(async move {
            server.expect_open().await;
            server.write(&format!("{}{}", SERVER_OPEN, AUTH_FEATURES)).await;
            // Nothing more must arrive before the client hangs up.
            let mut rest = Vec::new();
            server.io.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let creds = Credentials::new("juliet", "r0m30myr0m30");
        let result = login(conn, &config(false), false, &creds, std::future::pending()).await;
        let err = match result {
            Ok(_) => panic!("login succeeded without an allowed mechanism"),
            Err(e) => e,
        };
        assert!(matches!(err, EngineError::Auth(AuthError::NoSupportedMechanism)));
        assert!(server_task.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_management_round_trip() {
        let (mut session, mut server) = logged_in().await;

        let server_task = tokio::spawn(async move {
            let enable = server.expect_stanza().await;
            assert_eq!(enable.kind(), StanzaKind::SmEnable);
            // A stanza racing the answer ends up in the backlog.
            server.write("<presence from='romeo@example.net'/>").await;
            server.write("<enabled xmlns='urn:xmpp:sm:3' id='sm-1'/>").await;

            let message = server.expect_stanza().await;
            assert_eq!(message.attr("id"), Some("m1"));
            let request = server.expect_stanza().await;
            assert_eq!(request.kind(), StanzaKind::SmRequest);

            server
                .write("<a xmlns='urn:xmpp:sm:3' h='1'/><r xmlns='urn:xmpp:sm:3'/><message id='in1'><body>hi</body></message>")
                .await;
            let answer = server.expect_stanza().await;
            assert_eq!(answer.kind(), StanzaKind::SmAck);
            assert_eq!(answer.attr("h"), Some("0"));
            server
        });

        session.enable_stream_management(false).await.unwrap();
        assert!(session.stream_management().is_some());

        let mut message = Stanza::new("message", ns::JABBER_CLIENT);
        message.set_attr("id", "m1");
        session.send(message).await.unwrap();
        assert_eq!(session.stream_management().unwrap().unacked_len(), 1);

        let backlog = session.recv().await.unwrap();
        assert_eq!(backlog.kind(), StanzaKind::Presence);

        let incoming = session.recv().await.unwrap();
        assert_eq!(incoming.attr("id"), Some("in1"));

        let sm = session.stream_management().unwrap();
        assert_eq!(sm.unacked_len(), 0);
        assert_eq!(sm.sent_count(), 1);
        assert_eq!(sm.received_count(), 1);

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_configured_stream_management_asks_for_resumption() {
        let (mut session, mut server) = logged_in().await;
        let server_task = tokio::spawn(async move {
            let enable = server.expect_stanza().await;
            assert_eq!(enable.kind(), StanzaKind::SmEnable);
            assert_eq!(enable.attr("resume"), Some("true"));
            server
                .write("<enabled xmlns='urn:xmpp:sm:3' id='sm-2' resume='true'/>")
                .await;
            server
        });

        let mut sm_config = config(true).stream_management;
        sm_config.resume = true;
        assert!(session.enable_stream_management_from(&sm_config).await.unwrap());
        assert!(session.stream_management().is_some());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_configured_stream_management_can_be_disabled() {
        let (mut session, mut server) = logged_in().await;
        let mut sm_config = config(true).stream_management;
        sm_config.enabled = false;
        assert!(!session.enable_stream_management_from(&sm_config).await.unwrap());
        assert!(session.stream_management().is_none());

        // No <enable/> went out before this presence.
        session.send(Stanza::new("presence", ns::JABBER_CLIENT)).await.unwrap();
        assert_eq!(server.expect_stanza().await.kind(), StanzaKind::Presence);
    }

    #[tokio::test]
    async fn test_configured_stream_management_skipped_when_not_offered() {
        let (conn, mut server) = setup();
        let features = Stanza::new("features", ns::STREAM);
        let mut session = Session::new(conn, features, AckPolicy::default());
        let sm_config = config(true).stream_management;
        assert!(sm_config.enabled);
        assert!(!session.enable_stream_management_from(&sm_config).await.unwrap());

        session.send(Stanza::new("presence", ns::JABBER_CLIENT)).await.unwrap();
        drop(session);
        let mut rest = Vec::new();
        server.io.read_to_end(&mut rest).await.unwrap();
        assert!(!String::from_utf8(rest).unwrap().contains("enable"));
    }

    #[tokio::test]
    async fn test_enable_refused() {
        let (mut session, mut server) = logged_in().await;
        let server_task = tokio::spawn(async move {
            server.expect_stanza().await;
            server
                .write("<failed xmlns='urn:xmpp:sm:3'><unexpected-request xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></failed>")
                .await;
            server
        });
        let err = session.enable_stream_management(true).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::StreamManagement(SmError::Failed(ref reason)) if reason == "unexpected-request"
        ));
        assert!(session.stream_management().is_none());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_ack_needs_stream_management() {
        let (mut session, _server) = logged_in().await;
        let err = session.request_ack().await.unwrap_err();
        assert!(matches!(err, EngineError::StreamManagement(SmError::NotEnabled)));
    }

    #[tokio::test]
    async fn test_without_stream_management_frames_pass_through() {
        let (mut session, mut server) = logged_in().await;
        server.write("<r xmlns='urn:xmpp:sm:3'/>").await;
        let frame = session.recv().await.unwrap();
        assert_eq!(frame.kind(), StanzaKind::SmRequest);

        session.send(Stanza::new("presence", ns::JABBER_CLIENT)).await.unwrap();
        assert_eq!(server.expect_stanza().await.kind(), StanzaKind::Presence);
    }

    #[tokio::test]
    async fn test_close_sends_stream_footer() {
        let (session, mut server) = logged_in().await;
        let _conn = session.close().await.unwrap();
        assert_eq!(server.next_event().await, ReaderEvent::StreamClosed);
    }
}
