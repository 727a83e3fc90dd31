//! Relationship template references and validity.
//!
//! A templator shares a template out of band (QR code, link) as a
//! truncated reference:
//!
//! ```text
//! BASE64URL("RLT<17 chars>|TPK<17 chars>")
//! ```
//!
//! The requester decodes it, fetches the template from the backbone and
//! checks [`ensure_usable`] before sending a relationship request.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use std::time::Duration;
use thiserror::Error;
use tether_sync_types::{RelationshipTemplateId, TemplateCache, TemplateKeyId, Timestamp};

/// Default template lifetime (7 days).
pub const DEFAULT_TEMPLATE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Errors for template references and template validity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// Reference is not valid base64.
    #[error("invalid template reference encoding: {0}")]
    InvalidEncoding(String),

    /// Decoded reference does not have the `<template>|<key>` shape.
    #[error("invalid template reference: {0}")]
    InvalidFormat(String),

    /// The template has expired.
    #[error("template {0} has expired")]
    Expired(RelationshipTemplateId),
}

/// Shareable pointer to a relationship template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateReference {
    /// The template
    pub template_id: RelationshipTemplateId,
    /// Exchange key the template was published with
    pub key_id: TemplateKeyId,
}

impl TemplateReference {
    /// Create a reference.
    pub fn new(template_id: RelationshipTemplateId, key_id: TemplateKeyId) -> Self {
        Self {
            template_id,
            key_id,
        }
    }

    /// Encode as a truncated reference string.
    pub fn to_truncated(&self) -> String {
        let raw = format!("{}|{}", self.template_id, self.key_id);
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    /// Decode a truncated reference string.
    pub fn from_truncated(truncated: &str) -> Result<Self, TemplateError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(truncated.trim())
            .map_err(|e| TemplateError::InvalidEncoding(e.to_string()))?;
        let raw = String::from_utf8(bytes)
            .map_err(|e| TemplateError::InvalidEncoding(e.to_string()))?;

        let (template, key) = raw
            .split_once('|')
            .ok_or_else(|| TemplateError::InvalidFormat("missing separator".into()))?;
        let template_id = RelationshipTemplateId::parse(template)
            .map_err(|e| TemplateError::InvalidFormat(e.to_string()))?;
        let key_id =
            TemplateKeyId::parse(key).map_err(|e| TemplateError::InvalidFormat(e.to_string()))?;

        Ok(Self {
            template_id,
            key_id,
        })
    }
}

/// Expiry time for a template published at `now` with lifetime `ttl`.
pub fn expiry_after(now: Timestamp, ttl: Duration) -> Timestamp {
    now.plus_millis(ttl.as_millis() as u64)
}

/// Check that a template can still be used to request a relationship.
pub fn ensure_usable(
    template_id: &RelationshipTemplateId,
    cache: &TemplateCache,
    now: Timestamp,
) -> Result<(), TemplateError> {
    if cache.is_expired(now) {
        return Err(TemplateError::Expired(template_id.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_sync_types::{Identity, Realm, TemplatePublicKey};

    fn cache(expires_at: Option<Timestamp>) -> TemplateCache {
        TemplateCache {
            identity: Identity::from_public_key(Realm::default(), vec![1; 32]),
            template_key: TemplatePublicKey {
                id: TemplateKeyId::generate(),
                public_key: vec![2; 32],
            },
            content: serde_json::json!({}),
            expires_at,
            max_number_of_allocations: None,
        }
    }

    // ===========================================
    // Truncated references
    // ===========================================

    #[test]
    fn reference_roundtrip() {
        let reference =
            TemplateReference::new(RelationshipTemplateId::generate(), TemplateKeyId::generate());
        let truncated = reference.to_truncated();
        assert_eq!(TemplateReference::from_truncated(&truncated).unwrap(), reference);
    }

    #[test]
    fn reference_is_url_safe() {
        let truncated =
            TemplateReference::new(RelationshipTemplateId::generate(), TemplateKeyId::generate())
                .to_truncated();
        assert!(!truncated.contains('+'));
        assert!(!truncated.contains('/'));
        assert!(!truncated.contains('='));
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        let reference =
            TemplateReference::new(RelationshipTemplateId::generate(), TemplateKeyId::generate());
        let padded = format!("  {}\n", reference.to_truncated());
        assert!(TemplateReference::from_truncated(&padded).is_ok());
    }

    #[test]
    fn invalid_base64_fails() {
        let err = TemplateReference::from_truncated("not base64 !!!").unwrap_err();
        assert!(matches!(err, TemplateError::InvalidEncoding(_)));
    }

    #[test]
    fn missing_separator_fails() {
        let encoded = URL_SAFE_NO_PAD.encode(RelationshipTemplateId::generate().as_str());
        let err = TemplateReference::from_truncated(&encoded).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidFormat(_)));
    }

    #[test]
    fn swapped_ids_fail() {
        let raw = format!(
            "{}|{}",
            TemplateKeyId::generate(),
            RelationshipTemplateId::generate()
        );
        let err = TemplateReference::from_truncated(&URL_SAFE_NO_PAD.encode(raw)).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidFormat(_)));
    }

    // ===========================================
    // Validity
    // ===========================================

    #[test]
    fn template_without_expiry_is_usable() {
        let id = RelationshipTemplateId::generate();
        assert!(ensure_usable(&id, &cache(None), Timestamp::now()).is_ok());
    }

    #[test]
    fn expired_template_is_rejected() {
        let id = RelationshipTemplateId::generate();
        let now = Timestamp::from_millis(5_000);
        let err = ensure_usable(&id, &cache(Some(Timestamp::from_millis(4_000))), now).unwrap_err();
        assert_eq!(err, TemplateError::Expired(id));
    }

    #[test]
    fn expiry_after_adds_ttl() {
        let now = Timestamp::from_millis(1_000);
        assert_eq!(
            expiry_after(now, Duration::from_secs(2)),
            Timestamp::from_millis(3_000)
        );
        assert!(expiry_after(now, DEFAULT_TEMPLATE_TTL) > now);
    }
}
