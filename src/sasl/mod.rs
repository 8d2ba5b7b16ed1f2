//! SASL negotiation (RFC 6120 section 6) with PLAIN and DIGEST-MD5.
//!
//! [`SaslAuth`] is a sans-IO state machine: it produces the frames to send and
//! consumes the frames received, one at a time. [`authenticate`] drives it over
//! a [`StanzaChannel`].

pub mod credentials;
pub mod digest_md5;

use std::future::Future;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, info, warn};

use crate::connection::StanzaChannel;
use crate::error::AuthError;
use crate::ns;
use crate::stanza::{Node, Stanza, StanzaKind};

pub use credentials::{CredentialSource, Credentials, FnCredentials};
use digest_md5::DigestParams;

/// Reason reported when a `<failure/>` carries no condition element.
const UNKNOWN_FAILURE: &str = "Unknown reason";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismKind {
    Plain,
    DigestMd5,
}

impl MechanismKind {
    pub fn name(self) -> &'static str {
        match self {
            MechanismKind::Plain => "PLAIN",
            MechanismKind::DigestMd5 => "DIGEST-MD5",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthOptions {
    /// Server identity; the DIGEST-MD5 realm when the challenge has none.
    pub server: String,
    /// Whether PLAIN may be used at all.
    pub allow_plain: bool,
    /// Whether the channel is already encrypted (TLS).
    pub encrypted: bool,
}

/// Terminal once it leaves `Pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Pending,
    Succeeded,
    Failed(AuthError),
}

/// What to do after handling a received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    Send(Stanza),
    Done,
}

#[derive(Debug)]
enum PlainPhase {
    AuthSent,
}

#[derive(Debug)]
enum DigestState {
    AuthSent { username: String, password: String },
    ResponseSent { rspauth: String },
    FinalResponseSent,
}

#[derive(Debug)]
enum Mechanism {
    None,
    Plain(PlainPhase),
    DigestMd5(DigestState),
}

/// Client side of one SASL exchange.
#[derive(Debug)]
pub struct SaslAuth {
    options: AuthOptions,
    mechanism: Mechanism,
    outcome: AuthOutcome,
}

impl SaslAuth {
    pub fn new(options: AuthOptions) -> Self {
        Self {
            options,
            mechanism: Mechanism::None,
            outcome: AuthOutcome::Pending,
        }
    }

    pub fn outcome(&self) -> &AuthOutcome {
        &self.outcome
    }

    pub fn mechanism(&self) -> Option<MechanismKind> {
        match self.mechanism {
            Mechanism::None => None,
            Mechanism::Plain(_) => Some(MechanismKind::Plain),
            Mechanism::DigestMd5(_) => Some(MechanismKind::DigestMd5),
        }
    }

    /// Picks a mechanism from the advertised list and returns the initial
    /// `<auth/>` frame. Fails without producing a frame when nothing usable is
    /// offered or credentials are missing.
    pub fn start(
        &mut self,
        mechanisms: &[String],
        credentials: &dyn CredentialSource,
    ) -> Result<Stanza, AuthError> {
        if self.outcome != AuthOutcome::Pending || !matches!(self.mechanism, Mechanism::None) {
            return Err(AuthError::AlreadyFinished);
        }
        if mechanisms.is_empty() {
            return Err(self.fail(AuthError::NotSupported));
        }

        let offered = |name: &str| mechanisms.iter().any(|m| m == name);
        let kind = if offered(MechanismKind::DigestMd5.name()) {
            MechanismKind::DigestMd5
        } else if self.options.allow_plain && offered(MechanismKind::Plain.name()) {
            MechanismKind::Plain
        } else {
            debug!(offered = ?mechanisms, allow_plain = self.options.allow_plain, "No usable SASL mechanism");
            return Err(self.fail(AuthError::NoSupportedMechanism));
        };

        let Some((username, password)) = credentials::fetch(credentials) else {
            return Err(self.fail(AuthError::NoCredentials));
        };

        let mut auth = Stanza::new("auth", ns::SASL);
        auth.set_attr("mechanism", kind.name());
        match kind {
            MechanismKind::Plain => {
                if !self.options.encrypted {
                    warn!(server = %self.options.server, "Using PLAIN authentication over an unencrypted channel");
                }
                let payload = format!("\0{}\0{}", username, password);
                auth.set_text(Some(STANDARD.encode(payload)));
                self.mechanism = Mechanism::Plain(PlainPhase::AuthSent);
            }
            MechanismKind::DigestMd5 => {
                self.mechanism = Mechanism::DigestMd5(DigestState::AuthSent { username, password });
            }
        }
        debug!(mechanism = kind.name(), "SASL mechanism selected");
        Ok(auth)
    }

    /// Consumes one frame from the server.
    pub fn handle(&mut self, frame: &Stanza) -> Result<AuthStep, AuthError> {
        if self.outcome != AuthOutcome::Pending {
            return Err(AuthError::AlreadyFinished);
        }
        if matches!(self.mechanism, Mechanism::None) {
            return Err(self.fail(AuthError::InvalidReply(
                "frame received before the exchange started".into(),
            )));
        }

        match frame.kind() {
            StanzaKind::Failure => {
                let reason = frame
                    .first_child()
                    .map(|c| c.name().to_string())
                    .unwrap_or_else(|| UNKNOWN_FAILURE.to_string());
                Err(self.fail(AuthError::Failure(reason)))
            }
            StanzaKind::Challenge => self.handle_challenge(frame),
            StanzaKind::Success => {
                let finished = matches!(
                    self.mechanism,
                    Mechanism::Plain(PlainPhase::AuthSent)
                        | Mechanism::DigestMd5(DigestState::FinalResponseSent)
                );
                if !finished {
                    return Err(self.fail(AuthError::InvalidReply(
                        "success before completing the exchange".into(),
                    )));
                }
                self.outcome = AuthOutcome::Succeeded;
                Ok(AuthStep::Done)
            }
            _ => Err(self.fail(AuthError::InvalidReply(format!(
                "unexpected <{}/> in namespace '{}'",
                frame.name(),
                frame.namespace()
            )))),
        }
    }

    /// Marks the exchange as cancelled. No-op once the outcome is terminal.
    pub fn cancel(&mut self) {
        if self.outcome == AuthOutcome::Pending {
            self.outcome = AuthOutcome::Failed(AuthError::Cancelled);
        }
    }

    fn handle_challenge(&mut self, frame: &Stanza) -> Result<AuthStep, AuthError> {
        let state = match std::mem::replace(&mut self.mechanism, Mechanism::None) {
            Mechanism::DigestMd5(state) => state,
            other => {
                self.mechanism = other;
                return Err(self.fail(AuthError::InvalidReply(
                    "peer challenged a plaintext exchange".into(),
                )));
            }
        };

        let directives = match decode_challenge(frame) {
            Ok(directives) => directives,
            Err(err) => {
                self.mechanism = Mechanism::DigestMd5(state);
                return Err(self.fail(err));
            }
        };

        let (next, reply) = match state {
            DigestState::AuthSent { username, password } => {
                match self.first_response(&directives, &username, &password) {
                    Ok((rspauth, body)) => (DigestState::ResponseSent { rspauth }, Some(body)),
                    Err(err) => {
                        self.mechanism =
                            Mechanism::DigestMd5(DigestState::AuthSent { username, password });
                        return Err(self.fail(err));
                    }
                }
            }
            DigestState::ResponseSent { rspauth } => {
                if directives.get("rspauth") != Some(&rspauth) {
                    self.mechanism = Mechanism::DigestMd5(DigestState::ResponseSent { rspauth });
                    return Err(self.fail(AuthError::InvalidReply("rspauth not matching".into())));
                }
                debug!("Server proof verified");
                (DigestState::FinalResponseSent, None)
            }
            DigestState::FinalResponseSent => {
                self.mechanism = Mechanism::DigestMd5(DigestState::FinalResponseSent);
                return Err(self.fail(AuthError::InvalidReply(
                    "challenge after the final response".into(),
                )));
            }
        };
        self.mechanism = Mechanism::DigestMd5(next);

        let mut response = Stanza::new("response", ns::SASL);
        if let Some(body) = reply {
            response.set_text(Some(STANDARD.encode(body)));
        }
        Ok(AuthStep::Send(response))
    }

    /// Returns the expected rspauth and the response directives.
    fn first_response(
        &self,
        directives: &std::collections::HashMap<String, String>,
        username: &str,
        password: &str,
    ) -> Result<(String, String), AuthError> {
        let nonce = directives
            .get("nonce")
            .ok_or_else(|| AuthError::InvalidReply("challenge without a nonce".into()))?;
        if let Some(qop) = directives.get("qop") {
            if !qop.split(',').any(|q| q.trim() == "auth") {
                return Err(AuthError::InvalidReply(format!("unsupported qop '{}'", qop)));
            }
        }
        let realm = directives
            .get("realm")
            .map(String::as_str)
            .unwrap_or(self.options.server.as_str());
        let digest_uri = format!("xmpp/{}", realm);
        let cnonce = digest_md5::generate_cnonce();

        let params = DigestParams {
            username,
            realm,
            password,
            nonce,
            cnonce: &cnonce,
            digest_uri: &digest_uri,
        };
        let (response, rspauth) = digest_md5::compute(&params);
        Ok((rspauth, digest_md5::build_response(&params, &response)))
    }

    fn fail(&mut self, err: AuthError) -> AuthError {
        debug!(error = %err, "SASL exchange failed");
        self.outcome = AuthOutcome::Failed(err.clone());
        err
    }
}

fn decode_challenge(frame: &Stanza) -> Result<std::collections::HashMap<String, String>, AuthError> {
    let text = frame.text().unwrap_or_default().trim();
    if text.is_empty() {
        return Err(AuthError::InvalidReply("empty challenge".into()));
    }
    let raw = STANDARD
        .decode(text)
        .map_err(|e| AuthError::InvalidReply(format!("challenge is not base64: {}", e)))?;
    let body = String::from_utf8(raw)
        .map_err(|_| AuthError::InvalidReply("challenge is not UTF-8".into()))?;
    digest_md5::parse_challenge(&body)
}

/// Mechanism names advertised in a `<stream:features/>` stanza.
pub fn mechanisms_from_features(features: &Node) -> Vec<String> {
    features
        .child_ns("mechanisms", ns::SASL)
        .map(|mechanisms| {
            mechanisms
                .children()
                .iter()
                .filter(|m| m.name() == "mechanism")
                .filter_map(|m| m.text())
                .map(|m| m.trim().to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Runs a complete exchange over `channel`, one frame in flight at a time.
///
/// If `shutdown` completes first the exchange resolves to
/// [`AuthError::Cancelled`].
pub async fn authenticate<C, S>(
    channel: &mut C,
    mechanisms: &[String],
    options: AuthOptions,
    credentials: &dyn CredentialSource,
    shutdown: S,
) -> Result<(), AuthError>
where
    C: StanzaChannel + ?Sized,
    S: Future<Output = ()>,
{
    let server = options.server.clone();
    let mut auth = SaslAuth::new(options);
    let mut frame = auth.start(mechanisms, credentials)?;
    info!(
        server = %server,
        mechanism = auth.mechanism().map(MechanismKind::name).unwrap_or_default(),
        "Starting SASL authentication"
    );

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                auth.cancel();
                return Err(AuthError::Cancelled);
            }
            sent = channel.send(&frame) => {
                if let Err(e) = sent {
                    return Err(auth.fail(AuthError::Transport(e.to_string())));
                }
            }
        }

        let reply = tokio::select! {
            biased;
            _ = &mut shutdown => {
                auth.cancel();
                return Err(AuthError::Cancelled);
            }
            received = channel.recv() => match received {
                Ok(reply) => reply,
                Err(e) => return Err(auth.fail(AuthError::Transport(e.to_string()))),
            }
        };

        match auth.handle(&reply) {
            Ok(AuthStep::Send(next)) => frame = next,
            Ok(AuthStep::Done) => {
                info!(server = %server, "SASL authentication succeeded");
                return Ok(());
            }
            Err(err) => {
                warn!(server = %server, error = %err, "SASL authentication failed");
                return Err(err);
            }
        }
    }
}
