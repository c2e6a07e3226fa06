use std::collections::HashMap;
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;

use crate::crypto::{decrypt_event, DecryptError};

/// A normalized inbound chat message: private text from a human sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: String,
    pub open_id: String,
    pub chat_id: String,
    pub text: String,
}

/// What the webhook endpoint should do with a payload.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundDecision {
    /// URL-verification handshake; reply with the challenge.
    Challenge(String),
    /// Valid message to hand to the orchestrator.
    Message(InboundMessage),
    /// Drop silently with a 200 (duplicate, non-private, bot echo, ...).
    Ignored(&'static str),
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("verification token mismatch")]
    TokenMismatch,
    #[error("encrypted payload received but no encrypt key is configured")]
    MissingEncryptKey,
    #[error(transparent)]
    Decrypt(#[from] DecryptError),
    #[error("malformed webhook payload: {0}")]
    Malformed(String),
}

/// Static configuration needed to validate a webhook payload.
pub struct WebhookContext<'a> {
    pub verification_token: &'a SecretString,
    pub encrypt_key: Option<&'a SecretString>,
    pub bot_open_id: Option<&'a str>,
}

/// Validates and normalizes one channel webhook payload. Decryption happens
/// first when an `encrypt` envelope is present, then the token check, then
/// message filtering. Deduplication is the caller's job (it needs state).
pub fn verify_and_normalize(
    payload: Value,
    context: &WebhookContext<'_>,
) -> Result<InboundDecision, WebhookError> {
    let payload = match payload.get("encrypt").and_then(Value::as_str) {
        Some(encrypted) => {
            let key = context.encrypt_key.ok_or(WebhookError::MissingEncryptKey)?;
            decrypt_event(encrypted, key.expose_secret())?
        }
        None => payload,
    };

    if payload.get("type").and_then(Value::as_str) == Some("url_verification") {
        verify_token(payload.get("token"), context)?;
        let challenge = payload
            .get("challenge")
            .and_then(Value::as_str)
            .ok_or_else(|| WebhookError::Malformed("url_verification missing challenge".into()))?;
        return Ok(InboundDecision::Challenge(challenge.to_owned()));
    }

    let header = payload
        .get("header")
        .and_then(Value::as_object)
        .ok_or_else(|| WebhookError::Malformed("missing header".into()))?;
    verify_token(header.get("token").or_else(|| payload.get("token")), context)?;

    let event = payload.get("event").and_then(Value::as_object);
    let Some(event) = event else {
        return Ok(InboundDecision::Ignored("no_event"));
    };

    let message = event.get("message").and_then(Value::as_object);
    let Some(message) = message else {
        return Ok(InboundDecision::Ignored("no_message"));
    };

    let sender = event.get("sender").and_then(Value::as_object);
    if let Some(sender) = sender {
        if sender.get("sender_type").and_then(Value::as_str) == Some("bot") {
            return Ok(InboundDecision::Ignored("bot_sender"));
        }
    }

    if message.get("chat_type").and_then(Value::as_str) != Some("p2p") {
        return Ok(InboundDecision::Ignored("not_private_chat"));
    }
    if message.get("message_type").and_then(Value::as_str) != Some("text") {
        return Ok(InboundDecision::Ignored("not_text"));
    }

    let open_id = sender
        .and_then(|sender| sender.get("sender_id"))
        .and_then(|ids| ids.get("open_id"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if open_id.is_empty() {
        return Ok(InboundDecision::Ignored("missing_sender"));
    }
    if context.bot_open_id == Some(open_id) {
        return Ok(InboundDecision::Ignored("self_message"));
    }

    let message_id = message
        .get("message_id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| header.get("event_id").and_then(Value::as_str).map(str::to_owned))
        .ok_or_else(|| WebhookError::Malformed("missing message_id and event_id".into()))?;

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .and_then(|content| serde_json::from_str::<Value>(content).ok())
        .and_then(|content| content.get("text").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_default();

    let chat_id =
        message.get("chat_id").and_then(Value::as_str).unwrap_or_default().to_owned();

    Ok(InboundDecision::Message(InboundMessage {
        message_id,
        open_id: open_id.to_owned(),
        chat_id,
        text,
    }))
}

fn verify_token(token: Option<&Value>, context: &WebhookContext<'_>) -> Result<(), WebhookError> {
    let expected = context.verification_token.expose_secret();
    if expected.is_empty() {
        return Ok(());
    }
    match token.and_then(Value::as_str) {
        Some(token) if token == expected => Ok(()),
        _ => Err(WebhookError::TokenMismatch),
    }
}

/// TTL + capacity bounded deduplication keyed by message id (primary) or
/// event id (fallback). Channel retransmits of the same message must produce
/// exactly one reply.
pub struct MessageDeduplicator {
    ttl: Duration,
    max_size: usize,
    items: HashMap<String, Instant>,
}

impl MessageDeduplicator {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self { ttl, max_size: max_size.max(1), items: HashMap::new() }
    }

    /// Returns true when the key was already seen inside the TTL window;
    /// otherwise records it.
    pub fn check_and_mark(&mut self, key: &str) -> bool {
        let now = Instant::now();
        self.items.retain(|_, seen_at| now.duration_since(*seen_at) <= self.ttl);

        if self.items.contains_key(key) {
            return true;
        }
        if self.items.len() >= self.max_size {
            if let Some(oldest) =
                self.items.iter().min_by_key(|(_, seen_at)| **seen_at).map(|(key, _)| key.clone())
            {
                self.items.remove(&oldest);
            }
        }
        self.items.insert(key.to_owned(), now);
        false
    }
}
