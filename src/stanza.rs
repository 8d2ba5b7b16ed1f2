//! Stanza tree: the data model for one parsed protocol message.
//!
//! A [`Node`] owns its children; a [`Stanza`] owns the root node of one
//! complete top-level message. Namespaces are always stored resolved, never as
//! raw prefixes.

use std::fmt;
use std::ops::{Deref, DerefMut};

use quick_xml::escape::escape;

use crate::ns;

/// One XML element with resolved namespace, ordered attributes, ordered
/// children and optional text content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    name: String,
    namespace: String,
    /// `xmlns:prefix` declarations needed by prefixed attributes.
    prefixes: Vec<(String, String)>,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
    text: Option<String>,
    lang: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Attributes in insertion order.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Sets an attribute. An existing key keeps its position and gets the new value.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    /// Declares `prefix` for use in qualified attribute names such as
    /// `prefix:name`. Redeclaring a prefix replaces its namespace.
    pub fn declare_prefix(&mut self, prefix: impl Into<String>, namespace: impl Into<String>) {
        let prefix = prefix.into();
        let namespace = namespace.into();
        match self.prefixes.iter_mut().find(|(p, _)| *p == prefix) {
            Some(slot) => slot.1 = namespace,
            None => self.prefixes.push((prefix, namespace)),
        }
    }

    pub fn prefixes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.prefixes.iter().map(|(p, ns)| (p.as_str(), ns.as_str()))
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let pos = self.attributes.iter().position(|(k, _)| k == key)?;
        Some(self.attributes.remove(pos).1)
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut Vec<Node> {
        &mut self.children
    }

    pub fn first_child(&self) -> Option<&Node> {
        self.children.first()
    }

    /// First child with the given name, in any namespace.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_ns(&self, name: &str, namespace: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.is(name, namespace))
    }

    /// Appends a child and returns a handle to it.
    pub fn add_child(&mut self, child: Node) -> &mut Node {
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn set_text(&mut self, text: Option<String>) {
        self.text = text;
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Appends character data; content is accumulated progressively while the
    /// element is still open.
    pub fn append_text(&mut self, chunk: &str) {
        match self.text {
            Some(ref mut text) => text.push_str(chunk),
            None => self.text = Some(chunk.to_string()),
        }
    }

    /// Drops the text if it consists only of whitespace.
    pub fn collapse_whitespace_text(&mut self) {
        if self
            .text
            .as_deref()
            .is_some_and(|t| t.chars().all(|c| c.is_ascii_whitespace()))
        {
            self.text = None;
        }
    }

    /// The `xml:lang` annotation, kept apart from generic attributes.
    pub fn lang(&self) -> Option<&str> {
        self.lang.as_deref()
    }

    pub fn set_lang(&mut self, lang: Option<String>) {
        self.lang = lang;
    }

    /// Serialize, declaring `xmlns` on this node unconditionally.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, None);
        out
    }

    /// Serialize inside a stream whose default namespace is `default_ns`; the
    /// root omits its `xmlns` when it equals that default.
    pub fn to_xml_in(&self, default_ns: &str) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, Some(default_ns));
        out
    }

    fn write_xml(&self, out: &mut String, parent_ns: Option<&str>) {
        out.push('<');
        out.push_str(&self.name);
        let declare = match parent_ns {
            Some(parent) => parent != self.namespace,
            None => !self.namespace.is_empty(),
        };
        if declare {
            out.push_str(" xmlns='");
            out.push_str(&escape(self.namespace.as_str()));
            out.push('\'');
        }
        for (prefix, namespace) in &self.prefixes {
            out.push_str(" xmlns:");
            out.push_str(prefix);
            out.push_str("='");
            out.push_str(&escape(namespace.as_str()));
            out.push('\'');
        }
        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("='");
            out.push_str(&escape(value.as_str()));
            out.push('\'');
        }
        if let Some(ref lang) = self.lang {
            out.push_str(" xml:lang='");
            out.push_str(&escape(lang.as_str()));
            out.push('\'');
        }
        if self.text.is_none() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        if let Some(ref text) = self.text {
            out.push_str(&escape(text.as_str()));
        }
        for child in &self.children {
            child.write_xml(out, Some(&self.namespace));
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

/// Top-level element classification, keyed on name and namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
    StreamFeatures,
    StreamError,
    Auth,
    Challenge,
    Response,
    Success,
    Failure,
    StartTls,
    Proceed,
    TlsFailure,
    SmRequest,
    SmAck,
    SmEnable,
    SmEnabled,
    SmFailed,
    Unknown,
}

/// Classification of the `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaSubKind {
    None,
    Normal,
    Chat,
    GroupChat,
    Headline,
    Unavailable,
    Probe,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Get,
    Set,
    Result,
    Error,
    Unknown,
}

/// The root of one complete top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    root: Node,
}

impl Stanza {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            root: Node::new(name, namespace),
        }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn into_root(self) -> Node {
        self.root
    }

    pub fn kind(&self) -> StanzaKind {
        let name = self.root.name();
        match self.root.namespace() {
            ns::JABBER_CLIENT | "" => match name {
                "message" => StanzaKind::Message,
                "presence" => StanzaKind::Presence,
                "iq" => StanzaKind::Iq,
                _ => StanzaKind::Unknown,
            },
            ns::STREAM => match name {
                "features" => StanzaKind::StreamFeatures,
                "error" => StanzaKind::StreamError,
                _ => StanzaKind::Unknown,
            },
            ns::SASL => match name {
                "auth" => StanzaKind::Auth,
                "challenge" => StanzaKind::Challenge,
                "response" => StanzaKind::Response,
                "success" => StanzaKind::Success,
                "failure" => StanzaKind::Failure,
                _ => StanzaKind::Unknown,
            },
            ns::TLS => match name {
                "starttls" => StanzaKind::StartTls,
                "proceed" => StanzaKind::Proceed,
                "failure" => StanzaKind::TlsFailure,
                _ => StanzaKind::Unknown,
            },
            ns::STREAM_MANAGEMENT => match name {
                "r" => StanzaKind::SmRequest,
                "a" => StanzaKind::SmAck,
                "enable" => StanzaKind::SmEnable,
                "enabled" => StanzaKind::SmEnabled,
                "failed" => StanzaKind::SmFailed,
                _ => StanzaKind::Unknown,
            },
            _ => StanzaKind::Unknown,
        }
    }

    pub fn sub_kind(&self) -> StanzaSubKind {
        match self.root.attr("type") {
            None => StanzaSubKind::None,
            Some("normal") => StanzaSubKind::Normal,
            Some("chat") => StanzaSubKind::Chat,
            Some("groupchat") => StanzaSubKind::GroupChat,
            Some("headline") => StanzaSubKind::Headline,
            Some("unavailable") => StanzaSubKind::Unavailable,
            Some("probe") => StanzaSubKind::Probe,
            Some("subscribe") => StanzaSubKind::Subscribe,
            Some("subscribed") => StanzaSubKind::Subscribed,
            Some("unsubscribe") => StanzaSubKind::Unsubscribe,
            Some("unsubscribed") => StanzaSubKind::Unsubscribed,
            Some("get") => StanzaSubKind::Get,
            Some("set") => StanzaSubKind::Set,
            Some("result") => StanzaSubKind::Result,
            Some("error") => StanzaSubKind::Error,
            Some(_) => StanzaSubKind::Unknown,
        }
    }

    /// Builds an empty `result` reply to an `iq` get/set, swapping `to`/`from`
    /// and keeping the `id`. Returns `None` for anything else.
    pub fn iq_result(request: &Stanza) -> Option<Stanza> {
        Self::iq_reply(request, "result")
    }

    /// Builds an `error` reply carrying `<error type=…><condition/></error>`.
    pub fn iq_error(request: &Stanza, error_type: &str, condition: &str) -> Option<Stanza> {
        let mut reply = Self::iq_reply(request, "error")?;
        let error = Node::new("error", reply.namespace().to_string())
            .with_attr("type", error_type)
            .with_child(Node::new(condition, ns::STANZAS));
        reply.add_child(error);
        Some(reply)
    }

    fn iq_reply(request: &Stanza, reply_type: &str) -> Option<Stanza> {
        if request.kind() != StanzaKind::Iq
            || !matches!(request.sub_kind(), StanzaSubKind::Get | StanzaSubKind::Set)
        {
            return None;
        }
        let mut reply = Stanza::new("iq", request.namespace().to_string());
        reply.set_attr("type", reply_type);
        if let Some(id) = request.attr("id") {
            reply.set_attr("id", id.to_string());
        }
        if let Some(from) = request.attr("from") {
            reply.set_attr("to", from.to_string());
        }
        if let Some(to) = request.attr("to") {
            reply.set_attr("from", to.to_string());
        }
        Some(reply)
    }
}

impl From<Node> for Stanza {
    fn from(root: Node) -> Self {
        Self { root }
    }
}

impl Deref for Stanza {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.root
    }
}

impl DerefMut for Stanza {
    fn deref_mut(&mut self) -> &mut Node {
        &mut self.root
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.fmt(f)
    }
}
