//! STARTTLS (RFC 6120 section 5): negotiate over the cleartext stream, then
//! swap the transport for a tokio-rustls stream and start over with a fresh
//! reader.
//!
//! Flow:
//! 1. Send our stream header, read the server's header and `<stream:features>`
//! 2. Check that the features offer `<starttls/>`
//! 3. Send `<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>`
//! 4. Read `<proceed/>` (or `<failure/>`)
//! 5. Run the TLS handshake over the same socket via `TlsConnector::connect()`
//!
//! The caller then opens a new stream over the returned connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::connection::XmppConnection;
use crate::error::{ConnectionError, EngineError};
use crate::ns;
use crate::reader::framing::StreamHeader;
use crate::stanza::{Node, Stanza, StanzaKind};

/// Installs the ring provider as the process default, once.
fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Accepts whatever certificate the server presents. Handshake signatures are
/// still checked, so the peer must hold the key of the certificate it sent.
///
/// Only installed when `dangerous_insecure_tls` is set.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// True if the features stanza offers STARTTLS.
pub fn offers_starttls(features: &Node) -> bool {
    features.child_ns("starttls", ns::TLS).is_some()
}

/// True if the server marks STARTTLS as mandatory.
pub fn starttls_required(features: &Node) -> bool {
    features
        .child_ns("starttls", ns::TLS)
        .and_then(|s| s.child("required"))
        .is_some()
}

/// Builds the connector used for the STARTTLS handshake.
///
/// Server certificates are checked against the platform trust store, unless
/// `insecure` is set, in which case any certificate is accepted.
pub fn create_tls_connector(insecure: bool) -> Result<TlsConnector, ConnectionError> {
    init_crypto_provider();

    let config = if insecure {
        warn!("Server certificate verification is off (dangerous_insecure_tls)");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .with_root_certificates(platform_roots()?)
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Trust anchors from the OS store. Unparsable entries are skipped; an empty
/// result is an error since no server could ever be verified.
fn platform_roots() -> Result<RootCertStore, ConnectionError> {
    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        debug!(error = %err, "Skipping unreadable system certificate source");
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    if ignored > 0 {
        debug!(ignored, "Ignored unparsable root certificates");
    }
    if added == 0 {
        return Err(ConnectionError::Tls(
            "no usable root certificates in the system store; \
             install a CA bundle (e.g. the ca-certificates package)"
                .to_string(),
        ));
    }
    debug!(roots = added, "Loaded system root certificates");
    Ok(roots)
}

/// Steps 2-4: asks for STARTTLS on an open stream whose features were already
/// read, and waits for `<proceed/>`.
pub async fn negotiate<T>(
    conn: &mut XmppConnection<T>,
    features: &Stanza,
    timeout: Duration,
) -> Result<(), EngineError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if !offers_starttls(features) {
        return Err(ConnectionError::Tls(format!(
            "Server does not offer STARTTLS. Features: {}",
            features
        ))
        .into());
    }
    debug!("STARTTLS: Server offers STARTTLS, proceeding");

    conn.send_stanza(&Stanza::new("starttls", ns::TLS)).await?;
    debug!("STARTTLS: Sent <starttls/> request");

    let reply = tokio::time::timeout(timeout, conn.recv_stanza())
        .await
        .map_err(|_| ConnectionError::Timeout("STARTTLS proceed response"))??;

    match reply.kind() {
        StanzaKind::Proceed => {
            info!("STARTTLS: Received <proceed/>, upgrading to TLS");
            Ok(())
        }
        StanzaKind::TlsFailure => {
            Err(ConnectionError::Tls("Server rejected STARTTLS".to_string()).into())
        }
        _ => Err(ConnectionError::UnexpectedStanza(format!(
            "expected <proceed/>, got {}",
            reply
        ))
        .into()),
    }
}

/// Step 5: TLS handshake over the connection's transport, using `domain` for
/// SNI. The returned connection has the same framing and limits but a fresh
/// reader.
pub async fn upgrade<T>(
    conn: XmppConnection<T>,
    domain: &str,
    insecure: bool,
) -> Result<XmppConnection<TlsStream<T>>, EngineError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mode = conn.mode();
    let max_stanza_size = conn.max_stanza_size();
    let connector = create_tls_connector(insecure)?;
    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|e| ConnectionError::Tls(format!("Invalid server name: {}", e)))?;

    let tls_stream = connector
        .connect(server_name, conn.into_inner())
        .await
        .map_err(|e| {
            let error_detail = format!("{}", e);
            let classification = if error_detail.contains("ertificate") {
                "certificate_error"
            } else if error_detail.contains("timed out") || error_detail.contains("timeout") {
                "timeout"
            } else if error_detail.contains("refused") || error_detail.contains("reset") {
                "connection_refused"
            } else {
                "other"
            };
            error!(domain, error = %e, error_class = classification, "TLS handshake failed");
            ConnectionError::Tls(format!(
                "TLS handshake failed with {} ({}): {}",
                domain, classification, e
            ))
        })?;

    info!(domain, "STARTTLS: TLS handshake complete");
    Ok(XmppConnection::new(tls_stream, mode, max_stanza_size))
}

/// Full STARTTLS sequence on a fresh cleartext connection: open the stream,
/// read the features, negotiate and upgrade. Every read is bounded by the
/// configured timeout.
pub async fn perform_starttls<T>(
    mut conn: XmppConnection<T>,
    config: &EngineConfig,
) -> Result<XmppConnection<TlsStream<T>>, EngineError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let timeout = config.starttls_timeout();
    debug!(domain = %config.domain, "STARTTLS: Sending stream open");
    conn.send_open(&StreamHeader::client(&config.domain)).await?;

    tokio::time::timeout(timeout, conn.recv_open())
        .await
        .map_err(|_| ConnectionError::Timeout("STARTTLS stream header"))??;
    let features = tokio::time::timeout(timeout, conn.recv_stanza())
        .await
        .map_err(|_| ConnectionError::Timeout("STARTTLS stream features"))??;
    if features.kind() != StanzaKind::StreamFeatures {
        return Err(ConnectionError::UnexpectedStanza(format!(
            "expected stream features, got {}",
            features
        ))
        .into());
    }

    negotiate(&mut conn, &features, timeout).await?;
    upgrade(conn, &config.domain, config.dangerous_insecure_tls).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{FramingMode, DEFAULT_MAX_STANZA_SIZE};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    const SERVER_OPEN: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='t1' version='1.0'>";
    const FEATURES_WITH_TLS: &str = "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'>\
        <required/></starttls></stream:features>";

    fn pair() -> (XmppConnection<DuplexStream>, DuplexStream) {
        let (client, server) = duplex(64 * 1024);
        (
            XmppConnection::new(client, FramingMode::StreamWrapped, DEFAULT_MAX_STANZA_SIZE),
            server,
        )
    }

    async fn opened_with_features(
        features: &str,
    ) -> (XmppConnection<DuplexStream>, DuplexStream, Stanza) {
        let (mut conn, mut server) = pair();
        conn.send_open(&StreamHeader::client("example.com")).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = server.read(&mut buf).await.unwrap();
        server
            .write_all(format!("{}{}", SERVER_OPEN, features).as_bytes())
            .await
            .unwrap();
        conn.recv_open().await.unwrap();
        let features = conn.recv_stanza().await.unwrap();
        (conn, server, features)
    }

    #[test]
    fn test_feature_detection() {
        let features = Node::new("features", ns::STREAM).with_child(
            Node::new("starttls", ns::TLS).with_child(Node::new("required", ns::TLS)),
        );
        assert!(offers_starttls(&features));
        assert!(starttls_required(&features));

        let optional = Node::new("features", ns::STREAM).with_child(Node::new("starttls", ns::TLS));
        assert!(offers_starttls(&optional));
        assert!(!starttls_required(&optional));

        // Right name, wrong namespace
        let bogus = Node::new("features", ns::STREAM).with_child(Node::new("starttls", ns::SASL));
        assert!(!offers_starttls(&bogus));
    }

    #[test]
    fn test_insecure_connector_builds() {
        assert!(create_tls_connector(true).is_ok());
    }

    #[test]
    fn test_accept_any_cert_still_lists_signature_schemes() {
        let verifier = AcceptAnyServerCert::new();
        let schemes = verifier.supported_verify_schemes();
        assert!(schemes.contains(&SignatureScheme::ED25519));
        assert!(schemes.contains(&SignatureScheme::ECDSA_NISTP256_SHA256));
    }

    #[tokio::test]
    async fn test_negotiate_proceed() {
        let (mut conn, mut server, features) = opened_with_features(FEATURES_WITH_TLS).await;
        server
            .write_all(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await
            .unwrap();
        negotiate(&mut conn, &features, Duration::from_secs(5)).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(
            &buf[..n],
            b"<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>".as_slice()
        );
    }

    #[tokio::test]
    async fn test_negotiate_failure() {
        let (mut conn, mut server, features) = opened_with_features(FEATURES_WITH_TLS).await;
        server
            .write_all(b"<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await
            .unwrap();
        let err = negotiate(&mut conn, &features, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, EngineError::Connection(ConnectionError::Tls(_))));
    }

    #[tokio::test]
    async fn test_negotiate_without_offer_sends_nothing() {
        let (mut conn, mut server, features) =
            opened_with_features("<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>").await;
        let err = negotiate(&mut conn, &features, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, EngineError::Connection(ConnectionError::Tls(_))));

        drop(conn);
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_negotiate_times_out() {
        let (mut conn, _server, features) = opened_with_features(FEATURES_WITH_TLS).await;
        let err = negotiate(&mut conn, &features, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, EngineError::Connection(ConnectionError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_upgrade_fails_on_non_tls_peer() {
        let (conn, mut server) = pair();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = server.read(&mut buf).await;
            let _ = server.write_all(b"<stream:error/>this is not TLS").await;
        });
        let err = match upgrade(conn, "example.com", true).await {
            Ok(_) => panic!("handshake with a non-TLS peer succeeded"),
            Err(e) => e,
        };
        assert!(matches!(err, EngineError::Connection(ConnectionError::Tls(_))));
    }

    #[tokio::test]
    async fn test_perform_starttls_requires_features() {
        let (conn, mut server) = pair();
        let config = EngineConfig::new("example.com");
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = server.read(&mut buf).await;
            let _ = server
                .write_all(format!("{}<message/>", SERVER_OPEN).as_bytes())
                .await;
            // keep the peer alive until the client gives up
            let _ = server.read(&mut buf).await;
        });
        let err = match perform_starttls(conn, &config).await {
            Ok(_) => panic!("STARTTLS succeeded without features"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            EngineError::Connection(ConnectionError::UnexpectedStanza(_))
        ));
    }
}
