use casebook_core::chrono::Utc;
use casebook_core::config::AutomationConfig;
use casebook_core::AutomationError;
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_API_KEY: &str = "x-automation-key";
pub const HEADER_TIMESTAMP: &str = "x-automation-timestamp";
pub const HEADER_SIGNATURE: &str = "x-automation-signature";

/// The auth material extracted from request headers.
#[derive(Clone, Debug, Default)]
pub struct AuthHeaders {
    pub api_key: Option<String>,
    pub timestamp: Option<String>,
    pub signature: Option<String>,
}

/// Verifies a management/webhook request: static API key and/or HMAC-SHA256
/// of `timestamp + "." + raw_body` within the tolerance window. When both
/// mechanisms are configured, either one passing is sufficient.
pub fn verify_shared_auth(
    config: &AutomationConfig,
    headers: &AuthHeaders,
    raw_body: &[u8],
) -> Result<(), AutomationError> {
    let configured_key =
        config.webhook_api_key.as_ref().map(|key| key.expose_secret().trim().to_owned());
    let configured_secret = config
        .webhook_signature_secret
        .as_ref()
        .map(|secret| secret.expose_secret().trim().to_owned());

    let key_configured = configured_key.as_deref().map(|key| !key.is_empty()).unwrap_or(false);
    let secret_configured =
        configured_secret.as_deref().map(|secret| !secret.is_empty()).unwrap_or(false);

    if !key_configured && !secret_configured {
        return Err(AutomationError::AuthFailed(
            "webhook auth is not configured; set AUTOMATION_WEBHOOK_API_KEY or \
             AUTOMATION_WEBHOOK_SIGNATURE_SECRET"
                .into(),
        ));
    }

    let key_ok = key_configured
        && headers
            .api_key
            .as_deref()
            .map(|provided| constant_time_eq(provided.trim(), configured_key.as_deref().unwrap_or("")))
            .unwrap_or(false);

    let signature_ok = if secret_configured {
        verify_signature(
            configured_secret.as_deref().unwrap_or(""),
            headers,
            raw_body,
            config.webhook_timestamp_tolerance_secs,
        )?
    } else {
        false
    };

    if key_configured && secret_configured {
        if key_ok || signature_ok {
            return Ok(());
        }
        return Err(AutomationError::AuthFailed("invalid webhook api key or signature".into()));
    }
    if key_configured && !key_ok {
        return Err(AutomationError::AuthFailed("invalid webhook api key".into()));
    }
    if secret_configured && !signature_ok {
        return Err(AutomationError::AuthFailed(
            "missing or invalid webhook signature headers".into(),
        ));
    }
    Ok(())
}

fn verify_signature(
    secret: &str,
    headers: &AuthHeaders,
    raw_body: &[u8],
    tolerance_secs: u64,
) -> Result<bool, AutomationError> {
    let (Some(timestamp_text), Some(signature_text)) =
        (headers.timestamp.as_deref(), headers.signature.as_deref())
    else {
        return Ok(false);
    };

    let timestamp: i64 = timestamp_text
        .trim()
        .parse()
        .map_err(|_| AutomationError::AuthFailed("invalid signature timestamp".into()))?;
    let now = Utc::now().timestamp();
    let tolerance = tolerance_secs.max(1) as i64;
    if (now - timestamp).abs() > tolerance {
        return Err(AutomationError::AuthFailed("webhook signature timestamp expired".into()));
    }

    let normalized = signature_text
        .trim()
        .strip_prefix("sha256=")
        .unwrap_or_else(|| signature_text.trim())
        .to_ascii_lowercase();

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AutomationError::AuthFailed("invalid signature secret".into()))?;
    mac.update(timestamp_text.trim().as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    let expected = hex(&mac.finalize().into_bytes());

    Ok(constant_time_eq(&normalized, &expected))
}

/// Computes the signature a caller should send; used by the risk webhook and
/// by tests.
pub fn sign_payload(secret: &str, timestamp: i64, raw_body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    hex(&mac.finalize().into_bytes())
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use casebook_core::chrono::Utc;
    use casebook_core::config::AppConfig;
    use casebook_core::AutomationError;

    use super::{sign_payload, verify_shared_auth, AuthHeaders};

    fn config(api_key: Option<&str>, secret: Option<&str>) -> casebook_core::config::AutomationConfig {
        let mut automation = AppConfig::default().automation;
        automation.webhook_api_key = api_key.map(|key| key.to_owned().into());
        automation.webhook_signature_secret = secret.map(|secret| secret.to_owned().into());
        automation.webhook_timestamp_tolerance_secs = 300;
        automation
    }

    #[test]
    fn unconfigured_auth_rejects_everything() {
        let result = verify_shared_auth(&config(None, None), &AuthHeaders::default(), b"{}");
        assert!(matches!(result, Err(AutomationError::AuthFailed(_))));
    }

    #[test]
    fn api_key_path_accepts_exact_match_only() {
        let config = config(Some("k-123"), None);

        let good = AuthHeaders { api_key: Some("k-123".into()), ..AuthHeaders::default() };
        assert!(verify_shared_auth(&config, &good, b"{}").is_ok());

        let bad = AuthHeaders { api_key: Some("k-999".into()), ..AuthHeaders::default() };
        assert!(verify_shared_auth(&config, &bad, b"{}").is_err());

        assert!(verify_shared_auth(&config, &AuthHeaders::default(), b"{}").is_err());
    }

    #[test]
    fn signature_path_verifies_timestamped_hmac() {
        let config = config(None, Some("s3cret"));
        let body = br#"{"record_id":"recX"}"#;
        let timestamp = Utc::now().timestamp();
        let signature = sign_payload("s3cret", timestamp, body);

        let good = AuthHeaders {
            api_key: None,
            timestamp: Some(timestamp.to_string()),
            signature: Some(format!("sha256={signature}")),
        };
        assert!(verify_shared_auth(&config, &good, body).is_ok());

        let tampered = AuthHeaders {
            signature: Some(format!("sha256={signature}")),
            timestamp: Some(timestamp.to_string()),
            api_key: None,
        };
        assert!(verify_shared_auth(&config, &tampered, b"{\"record_id\":\"recY\"}").is_err());
    }

    #[test]
    fn expired_timestamp_is_rejected() {
        let config = config(None, Some("s3cret"));
        let body = b"{}";
        let stale = Utc::now().timestamp() - 10_000;
        let signature = sign_payload("s3cret", stale, body);

        let headers = AuthHeaders {
            api_key: None,
            timestamp: Some(stale.to_string()),
            signature: Some(signature),
        };
        let result = verify_shared_auth(&config, &headers, body);
        assert!(matches!(result, Err(AutomationError::AuthFailed(message)) if message.contains("expired")));
    }

    #[test]
    fn either_mechanism_passes_when_both_configured() {
        let config = config(Some("k-123"), Some("s3cret"));

        let key_only = AuthHeaders { api_key: Some("k-123".into()), ..AuthHeaders::default() };
        assert!(verify_shared_auth(&config, &key_only, b"{}").is_ok());

        let timestamp = Utc::now().timestamp();
        let signature_only = AuthHeaders {
            api_key: None,
            timestamp: Some(timestamp.to_string()),
            signature: Some(sign_payload("s3cret", timestamp, b"{}")),
        };
        assert!(verify_shared_auth(&config, &signature_only, b"{}").is_ok());

        let neither = AuthHeaders { api_key: Some("wrong".into()), ..AuthHeaders::default() };
        assert!(verify_shared_auth(&config, &neither, b"{}").is_err());
    }
}
