//! DIGEST-MD5 (RFC 2831) primitives: challenge parsing and the
//! response/rspauth computation.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest, Md5};
use rand::RngCore;

use crate::error::AuthError;

/// Nonce count; every exchange uses its nonce exactly once.
const NONCE_COUNT: &str = "00000001";

/// Inputs of one digest computation.
#[derive(Clone, Copy)]
pub struct DigestParams<'a> {
    pub username: &'a str,
    pub realm: &'a str,
    pub password: &'a str,
    pub nonce: &'a str,
    pub cnonce: &'a str,
    pub digest_uri: &'a str,
}

/// Parses the decoded body of a challenge into its directives.
///
/// Quoted values may contain backslash escapes and commas; unquoted values run
/// to the next comma and must not be empty. A repeated directive keeps its last
/// value.
pub fn parse_challenge(challenge: &str) -> Result<HashMap<String, String>, AuthError> {
    let mut directives = HashMap::new();
    let mut chars = challenge.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            return Ok(directives);
        }

        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(',') | None => {
                    return Err(AuthError::InvalidReply(format!(
                        "challenge directive '{}' has no value",
                        key.trim()
                    )))
                }
                Some(c) => key.push(c),
            }
        }
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(AuthError::InvalidReply("empty directive name in challenge".into()));
        }

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let value = if chars.peek() == Some(&'"') {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') if chars.peek().is_some() => {
                        value.extend(chars.next());
                    }
                    Some(c) if c != '\\' => value.push(c),
                    _ => {
                        return Err(AuthError::InvalidReply(format!(
                            "unterminated quoted value for '{}'",
                            key
                        )))
                    }
                }
            }
            value
        } else {
            let mut value = String::new();
            while let Some(c) = chars.peek().copied() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            let value = value.trim().to_string();
            if value.is_empty() {
                return Err(AuthError::InvalidReply(format!(
                    "empty value for challenge directive '{}'",
                    key
                )));
            }
            value
        };

        directives.insert(key, value);
    }
}

/// Fresh client nonce: 32 random bytes, base64.
pub fn generate_cnonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Returns `(response, rspauth)`: the client proof to send and the server
/// proof expected in the second challenge, both lowercase hex.
pub fn compute(params: &DigestParams<'_>) -> (String, String) {
    let mut secret = Md5::new();
    secret.update(params.username.as_bytes());
    secret.update(b":");
    secret.update(params.realm.as_bytes());
    secret.update(b":");
    secret.update(params.password.as_bytes());
    let secret = secret.finalize();

    let mut a1 = Md5::new();
    a1.update(secret);
    a1.update(b":");
    a1.update(params.nonce.as_bytes());
    a1.update(b":");
    a1.update(params.cnonce.as_bytes());
    let ha1 = hex::encode(a1.finalize());

    let response = kd(&ha1, params, &format!("AUTHENTICATE:{}", params.digest_uri));
    let rspauth = kd(&ha1, params, &format!(":{}", params.digest_uri));
    (response, rspauth)
}

fn kd(ha1: &str, params: &DigestParams<'_>, a2: &str) -> String {
    let ha2 = hex::encode(Md5::digest(a2.as_bytes()));
    let value = format!(
        "{}:{}:{}:{}:auth:{}",
        ha1, params.nonce, NONCE_COUNT, params.cnonce, ha2
    );
    hex::encode(Md5::digest(value.as_bytes()))
}

/// The client response directives, before base64 encoding.
pub fn build_response(params: &DigestParams<'_>, response: &str) -> String {
    format!(
        "username=\"{}\",realm=\"{}\",digest-uri=\"{}\",nonce=\"{}\",nc={},cnonce=\"{}\",\
         qop=auth,charset=utf-8,response={}",
        quote(params.username),
        quote(params.realm),
        quote(params.digest_uri),
        quote(params.nonce),
        NONCE_COUNT,
        quote(params.cnonce),
        response
    )
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
