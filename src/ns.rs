//! XML namespaces used on the wire.

/// Stream wrapper (`<stream:stream>`, `<stream:features>`, `<stream:error>`).
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// Default namespace of client-to-server streams.
pub const JABBER_CLIENT: &str = "jabber:client";

/// RFC 7395 WebSocket framing (`<open/>`, `<close/>`).
pub const FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";

pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// XEP-0198 Stream Management, version 3.
pub const STREAM_MANAGEMENT: &str = "urn:xmpp:sm:3";

pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Bound to the reserved `xml` prefix.
pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
