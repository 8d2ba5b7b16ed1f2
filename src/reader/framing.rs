//! Stream framing: the stream header and footer for both wire forms.
//!
//! TCP streams are wrapped in `<stream:stream>` … `</stream:stream>`; RFC 7395
//! WebSocket streams use standalone `<open/>` and `<close/>` elements instead.

use quick_xml::escape::escape;

use crate::ns;

/// Closing tag of a TCP stream.
pub const STREAM_CLOSE: &str = "</stream:stream>";

/// RFC 7395 equivalent of [`STREAM_CLOSE`].
pub const WS_CLOSE: &str = r#"<close xmlns="urn:ietf:params:xml:ns:xmpp-framing"/>"#;

/// Attributes of a stream opening, in either framing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub to: Option<String>,
    pub from: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
    /// Default namespace declared on the stream element (`jabber:client` for c2s).
    pub default_ns: Option<String>,
}

impl StreamHeader {
    /// Client-side header for a stream towards `domain`.
    pub fn client(domain: &str) -> Self {
        Self {
            to: Some(domain.to_string()),
            version: Some("1.0".to_string()),
            default_ns: Some(ns::JABBER_CLIENT.to_string()),
            ..Default::default()
        }
    }

    /// `<?xml version='1.0'?><stream:stream …>` for TCP framing.
    pub fn to_stream_open(&self) -> String {
        let mut tag = String::from("<?xml version='1.0'?><stream:stream");
        push_attr(&mut tag, "to", self.to.as_deref());
        push_attr(&mut tag, "from", self.from.as_deref());
        push_attr(&mut tag, "id", self.id.as_deref());
        push_attr(&mut tag, "version", self.version.as_deref());
        push_attr(&mut tag, "xml:lang", self.lang.as_deref());
        let default_ns = self.default_ns.as_deref().unwrap_or(ns::JABBER_CLIENT);
        tag.push_str(&format!(
            " xmlns='{}' xmlns:stream='{}'>",
            escape(default_ns),
            ns::STREAM
        ));
        tag
    }

    /// `<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" …/>` for RFC 7395 framing.
    pub fn to_ws_open(&self) -> String {
        let mut tag = format!("<open xmlns='{}'", ns::FRAMING);
        push_attr(&mut tag, "to", self.to.as_deref());
        push_attr(&mut tag, "from", self.from.as_deref());
        push_attr(&mut tag, "id", self.id.as_deref());
        push_attr(&mut tag, "version", self.version.as_deref());
        push_attr(&mut tag, "xml:lang", self.lang.as_deref());
        tag.push_str("/>");
        tag
    }

    pub(crate) fn set(&mut self, key: &str, value: String) {
        match key {
            "to" => self.to = Some(value),
            "from" => self.from = Some(value),
            "id" => self.id = Some(value),
            "version" => self.version = Some(value),
            _ => {} // other attributes carry nothing for the framing layer
        }
    }
}

fn push_attr(tag: &mut String, key: &str, value: Option<&str>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        tag.push_str(&format!(" {}='{}'", key, escape(value)));
    }
}
