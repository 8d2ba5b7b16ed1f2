//! XMPP stream engine: incremental stanza parsing, SASL authentication
//! (PLAIN, DIGEST-MD5), STARTTLS and XEP-0198 stream management over any
//! tokio byte stream.
//!
//! Typical client flow:
//!
//! ```no_run
//! # async fn run() -> Result<(), fluux_xmpp_engine::EngineError> {
//! use fluux_xmpp_engine::{login, perform_starttls, Credentials, EngineConfig, XmppConnection};
//!
//! let config = EngineConfig::from_json_str(r#"{"domain": "example.com"}"#)?;
//! let tcp = tokio::net::TcpStream::connect("example.com:5222").await?;
//! let tls = perform_starttls(XmppConnection::from_config(tcp, &config), &config).await?;
//! let creds = Credentials::new("juliet", "r0m30myr0m30");
//! let mut session = login(tls, &config, true, &creds, std::future::pending()).await?;
//! // bind a resource here, then:
//! session.enable_stream_management_from(&config.stream_management).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod ns;
pub mod reader;
pub mod sasl;
pub mod session;
pub mod sm;
pub mod stanza;
pub mod starttls;

pub use config::{EngineConfig, StreamManagementConfig};
pub use connection::{StanzaChannel, XmppConnection};
pub use error::{AuthError, ConnectionError, EngineError, ReaderError, SmError};
pub use logging::LogConfig;
pub use reader::{FramingMode, ReaderEvent, StreamHeader, StreamReader};
pub use sasl::{authenticate, AuthOptions, AuthOutcome, CredentialSource, Credentials, SaslAuth};
pub use session::{login, Session};
pub use sm::{AckPolicy, StreamManagement};
pub use stanza::{Node, Stanza, StanzaKind, StanzaSubKind};
pub use starttls::perform_starttls;
