//! Incremental stream reader.
//!
//! Bytes are pushed in arbitrary chunks; every complete framing event is handed
//! to the caller's sink before `push` returns. Incomplete tokens (a tag cut in
//! half, trailing text, a partial UTF-8 sequence) stay buffered until the next
//! chunk completes them, so the event sequence does not depend on where the
//! transport split the data.

pub mod framing;

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ReaderError;
use crate::ns;
use crate::stanza::{Node, Stanza};

pub use framing::StreamHeader;

/// Default cap on the size of one stanza, counted in raw input bytes.
///
/// 1 MB is generous for XMPP: typical stanzas are a few KB and the largest
/// legitimate ones (vCard avatars, MAM result pages) rarely exceed 100 KB.
pub const DEFAULT_MAX_STANZA_SIZE: usize = 1_024 * 1_024;

/// How top-level elements map to stream events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramingMode {
    /// TCP framing: everything lives inside `<stream:stream>`.
    #[serde(rename = "stream")]
    StreamWrapped,
    /// No wrapper: every top-level element is a stanza.
    Standalone,
    /// RFC 7395: top-level `<open/>`/`<close/>` delimit the stream.
    WebSocket,
}

/// One framing event produced by [`StreamReader::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    StreamOpened(StreamHeader),
    Stanza(Stanza),
    StreamClosed,
}

#[derive(Debug, Default)]
struct NsScope {
    default: Option<String>,
    prefixes: Vec<(String, String)>,
}

/// Push parser turning raw bytes into [`ReaderEvent`]s.
#[derive(Debug)]
pub struct StreamReader {
    mode: FramingMode,
    max_buffer: usize,
    buffer: Vec<u8>,
    depth: usize,
    /// Qualified names of every open element, stream wrapper included.
    open_names: Vec<String>,
    scopes: Vec<NsScope>,
    /// Nodes of the stanza under construction; the first is its root.
    open_nodes: Vec<Node>,
    /// Input bytes consumed so far by the stanza under construction.
    stanza_bytes: usize,
    in_framing_element: bool,
    finished: bool,
    error: Option<ReaderError>,
}

impl StreamReader {
    pub fn new(mode: FramingMode) -> Self {
        Self::with_limit(mode, DEFAULT_MAX_STANZA_SIZE)
    }

    pub fn with_limit(mode: FramingMode, max_buffer: usize) -> Self {
        Self {
            mode,
            max_buffer,
            buffer: Vec::new(),
            depth: 0,
            open_names: Vec::new(),
            scopes: Vec::new(),
            open_nodes: Vec::new(),
            stanza_bytes: 0,
            in_framing_element: false,
            finished: false,
            error: None,
        }
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    pub fn max_buffer(&self) -> usize {
        self.max_buffer
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// True once the stream wrapper (or RFC 7395 `<close/>`) has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn error(&self) -> Option<&ReaderError> {
        self.error.as_ref()
    }

    /// Back to the initial state, keeping mode and limit. Used when the stream
    /// restarts after STARTTLS or SASL success.
    pub fn reset(&mut self) {
        *self = Self::with_limit(self.mode, self.max_buffer);
    }

    /// Feed one chunk. Events are delivered to `sink` in order before this
    /// returns. After an error the reader is unusable and every later call
    /// returns the same error without parsing.
    pub fn push<F>(&mut self, data: &[u8], mut sink: F) -> Result<(), ReaderError>
    where
        F: FnMut(ReaderEvent),
    {
        if let Some(ref err) = self.error {
            return Err(err.clone());
        }

        self.buffer.extend_from_slice(data);
        let buffer = std::mem::take(&mut self.buffer);
        let mut consumed = 0;
        let result = self.parse(&buffer, &mut consumed, &mut sink);
        self.buffer = buffer;
        self.buffer.drain(..consumed);

        let result = result.and_then(|()| {
            if self.buffer.len() > self.max_buffer {
                Err(ReaderError::Overflow {
                    size: self.buffer.len(),
                    limit: self.max_buffer,
                })
            } else {
                Ok(())
            }
        });

        if let Err(ref err) = result {
            warn!(error = %err, depth = self.depth, "Parsing failed");
            self.error = Some(err.clone());
            self.buffer.clear();
        }
        result
    }

    fn parse<F>(
        &mut self,
        buffer: &[u8],
        consumed: &mut usize,
        sink: &mut F,
    ) -> Result<(), ReaderError>
    where
        F: FnMut(ReaderEvent),
    {
        let mut reader = Reader::from_reader(buffer);
        let config = reader.config_mut();
        config.trim_text(false);
        config.check_end_names = false; // checked against our own stack
        // Closing tags of elements opened in an earlier chunk
        config.allow_unmatched_ends = true;

        loop {
            let event = reader.read_event();
            let end = reader.buffer_position() as usize;
            let start = *consumed;

            match event {
                Ok(Event::Start(e)) => {
                    self.start_element(&e, sink)?;
                    *consumed = end;
                }
                Ok(Event::Empty(e)) => {
                    self.start_element(&e, sink)?;
                    self.end_element(utf8(e.name().into_inner())?, sink)?;
                    *consumed = end;
                }
                Ok(Event::End(e)) => {
                    self.end_element(utf8(e.name().into_inner())?, sink)?;
                    *consumed = end;
                }
                Ok(Event::Text(text)) => {
                    if end >= buffer.len() {
                        // More text (or the rest of an entity) may follow.
                        return Ok(());
                    }
                    let text = text
                        .unescape()
                        .map_err(|e| ReaderError::Syntax(e.to_string()))?;
                    self.characters(&text)?;
                    *consumed = end;
                }
                Ok(Event::CData(cdata)) => {
                    let text = utf8(&cdata)?;
                    self.characters(text)?;
                    *consumed = end;
                }
                Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                    // Stream-level metadata, ignored
                    *consumed = end;
                }
                Ok(Event::Eof) => return Ok(()),
                Err(quick_xml::Error::Syntax(
                    SyntaxError::UnclosedTag
                    | SyntaxError::UnclosedCData
                    | SyntaxError::UnclosedComment
                    | SyntaxError::UnclosedDoctype
                    | SyntaxError::UnclosedPIOrXmlDecl,
                )) => {
                    // Expected during TCP streaming: the buffer ends inside a
                    // token that the next read will complete.
                    return Ok(());
                }
                Err(quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup))
                    if buffer.len() - *consumed < "<![CDATA[".len() =>
                {
                    return Ok(());
                }
                Err(e) => return Err(ReaderError::Syntax(e.to_string())),
            }
            self.count_stanza_bytes(end - start)?;
        }
    }

    /// Charges consumed input to the stanza being built. The count restarts
    /// once no stanza is open.
    fn count_stanza_bytes(&mut self, bytes: usize) -> Result<(), ReaderError> {
        if self.open_nodes.is_empty() {
            self.stanza_bytes = 0;
            return Ok(());
        }
        self.stanza_bytes += bytes;
        if self.stanza_bytes > self.max_buffer {
            return Err(ReaderError::Overflow {
                size: self.stanza_bytes,
                limit: self.max_buffer,
            });
        }
        Ok(())
    }

    fn start_element<F>(&mut self, e: &BytesStart<'_>, sink: &mut F) -> Result<(), ReaderError>
    where
        F: FnMut(ReaderEvent),
    {
        let qname = utf8(e.name().into_inner())?.to_string();

        if self.finished {
            return Err(ReaderError::Framing(format!(
                "element <{}> after the stream was closed",
                qname
            )));
        }
        if self.in_framing_element {
            return Err(ReaderError::Framing(format!(
                "element <{}> inside a framing element",
                qname
            )));
        }

        let (prefix, local) = match qname.split_once(':') {
            Some((prefix, local)) => (Some(prefix), local),
            None => (None, qname.as_str()),
        };

        let mut scope = NsScope::default();
        let mut attributes = Vec::new();
        let mut lang = None;
        for attr in e.attributes() {
            let attr = attr.map_err(|e| ReaderError::Syntax(e.to_string()))?;
            let key = utf8(attr.key.as_ref())?.to_string();
            let value = attr
                .unescape_value()
                .map_err(|e| ReaderError::Syntax(e.to_string()))?
                .into_owned();
            if key == "xmlns" {
                scope.default = Some(value);
            } else if let Some(declared) = key.strip_prefix("xmlns:") {
                scope.prefixes.push((declared.to_string(), value));
            } else if key == "xml:lang" {
                lang = Some(value);
            } else {
                attributes.push((key, value));
            }
        }
        self.scopes.push(scope);

        let namespace = self.resolve(prefix).ok_or_else(|| {
            ReaderError::Syntax(format!(
                "undeclared namespace prefix '{}' on <{}>",
                prefix.unwrap_or_default(),
                qname
            ))
        })?;

        // Prefixed attributes keep their qualified name, so the node must
        // carry the declarations they rely on.
        let mut attr_prefixes: Vec<(String, String)> = Vec::new();
        for (key, _) in &attributes {
            let Some((attr_prefix, _)) = key.split_once(':') else {
                continue;
            };
            let uri = self.resolve(Some(attr_prefix)).ok_or_else(|| {
                ReaderError::Syntax(format!(
                    "undeclared namespace prefix '{}' on attribute '{}' of <{}>",
                    attr_prefix, key, qname
                ))
            })?;
            if attr_prefix != "xml" && !attr_prefixes.iter().any(|(p, _)| p == attr_prefix) {
                attr_prefixes.push((attr_prefix.to_string(), uri));
            }
        }

        debug!(name = %qname, depth = self.depth, "Element started");

        if self.depth == 0 {
            match self.mode {
                FramingMode::StreamWrapped => {
                    if local != "stream" || namespace != ns::STREAM {
                        return Err(ReaderError::Framing(format!(
                            "expected stream element, got <{}> in namespace '{}'",
                            qname, namespace
                        )));
                    }
                    sink(ReaderEvent::StreamOpened(self.header(attributes, lang)));
                    self.open_names.push(qname);
                    self.depth += 1;
                    return Ok(());
                }
                FramingMode::WebSocket if namespace == ns::FRAMING => {
                    if local == "open" {
                        let mut header = self.header(attributes, lang);
                        header.default_ns = None;
                        sink(ReaderEvent::StreamOpened(header));
                    } else if local != "close" {
                        return Err(ReaderError::Framing(format!(
                            "unknown framing element <{}>",
                            qname
                        )));
                    }
                    self.in_framing_element = true;
                    self.open_names.push(qname);
                    self.depth += 1;
                    return Ok(());
                }
                _ => {}
            }
        }

        let mut node = Node::new(local, namespace);
        for (attr_prefix, uri) in attr_prefixes {
            node.declare_prefix(attr_prefix, uri);
        }
        for (key, value) in attributes {
            node.set_attr(key, value);
        }
        node.set_lang(lang);
        self.open_nodes.push(node);
        self.open_names.push(qname);
        self.depth += 1;
        Ok(())
    }

    fn end_element<F>(&mut self, name: &str, sink: &mut F) -> Result<(), ReaderError>
    where
        F: FnMut(ReaderEvent),
    {
        let expected = self.open_names.pop().ok_or_else(|| {
            ReaderError::Syntax(format!("closing tag </{}> without an open element", name))
        })?;
        if expected != name {
            return Err(ReaderError::Syntax(format!(
                "closing tag </{}> does not match <{}>",
                name, expected
            )));
        }
        self.scopes.pop();
        self.depth -= 1;

        debug!(name, depth = self.depth, "Element ended");

        if self.in_framing_element {
            self.in_framing_element = false;
            if name.rsplit(':').next() == Some("close") {
                self.finished = true;
                sink(ReaderEvent::StreamClosed);
            }
            return Ok(());
        }

        if self.mode == FramingMode::StreamWrapped && self.depth == 0 {
            self.finished = true;
            sink(ReaderEvent::StreamClosed);
            return Ok(());
        }

        let mut node = self.open_nodes.pop().ok_or_else(|| {
            ReaderError::Framing(format!("closing tag </{}> outside of a stanza", name))
        })?;
        node.collapse_whitespace_text();

        match self.open_nodes.last_mut() {
            Some(parent) => parent.children_mut().push(node),
            None => sink(ReaderEvent::Stanza(Stanza::from(node))),
        }
        Ok(())
    }

    fn characters(&mut self, text: &str) -> Result<(), ReaderError> {
        match self.open_nodes.last_mut() {
            Some(node) => node.append_text(text),
            None if self.finished && !text.trim().is_empty() => {
                return Err(ReaderError::Framing(
                    "character data after the stream was closed".to_string(),
                ));
            }
            None => {} // whitespace keepalives between stanzas
        }
        Ok(())
    }

    fn resolve(&self, prefix: Option<&str>) -> Option<String> {
        match prefix {
            Some("xml") => Some(ns::XML.to_string()),
            Some(prefix) => self.scopes.iter().rev().find_map(|scope| {
                scope
                    .prefixes
                    .iter()
                    .find(|(p, _)| p == prefix)
                    .map(|(_, uri)| uri.clone())
            }),
            None => Some(
                self.scopes
                    .iter()
                    .rev()
                    .find_map(|scope| scope.default.clone())
                    .unwrap_or_default(),
            ),
        }
    }

    fn header(&self, attributes: Vec<(String, String)>, lang: Option<String>) -> StreamHeader {
        let mut header = StreamHeader {
            lang,
            default_ns: self.scopes.last().and_then(|s| s.default.clone()),
            ..Default::default()
        };
        for (key, value) in attributes {
            header.set(&key, value);
        }
        header
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, ReaderError> {
    std::str::from_utf8(bytes).map_err(|e| ReaderError::Syntax(e.to_string()))
}
