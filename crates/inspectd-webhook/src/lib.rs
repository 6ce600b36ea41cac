//! Inbound webhook verification and event decoding.
//!
//! Every webhook request is HMAC-verified against a shared secret before its
//! body is trusted; rejected requests are the caller's responsibility to
//! turn into an HTTP 400. Recognized event kinds decode straight into
//! [`inspectd_types::Job`] or an [`InstallationEvent`].

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("signature header missing or malformed")]
    MissingSignature,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("unrecognized event payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unsupported event action: {0}")]
    UnsupportedAction(String),
}

/// Verifies an `X-Hub-Signature-256`-style header (`sha256=<hex>`) against
/// the request body using the shared secret. Constant-time comparison via
/// `Mac::verify_slice`.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> Result<(), WebhookError> {
    let hex_sig = signature_header
        .strip_prefix("sha256=")
        .ok_or(WebhookError::MissingSignature)?;
    let expected = hex::decode(hex_sig).map_err(|_| WebhookError::MissingSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any size");
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::InvalidSignature)
}

/// Decoded form of an `installation` event: registers or deregisters a
/// credential triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallationEvent {
    Created {
        installation_id: i64,
        account_id: i64,
        sender_id: i64,
    },
    Deleted {
        installation_id: i64,
    },
}

#[derive(Debug, Deserialize)]
struct RawInstallationPayload {
    action: String,
    installation: RawInstallation,
    sender: RawUser,
}

#[derive(Debug, Deserialize)]
struct RawInstallation {
    id: i64,
    account: RawUser,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    id: i64,
}

pub fn decode_installation_event(body: &[u8]) -> Result<InstallationEvent, WebhookError> {
    let raw: RawInstallationPayload = serde_json::from_slice(body)?;
    match raw.action.as_str() {
        "created" => Ok(InstallationEvent::Created {
            installation_id: raw.installation.id,
            account_id: raw.installation.account.id,
            sender_id: raw.sender.id,
        }),
        "deleted" => Ok(InstallationEvent::Deleted {
            installation_id: raw.installation.id,
        }),
        other => Err(WebhookError::UnsupportedAction(other.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct RawPullRequestPayload {
    action: String,
    number: u64,
    installation: RawInstallation,
    pull_request: RawPullRequest,
}

#[derive(Debug, Deserialize)]
struct RawPullRequest {
    head: RawBranch,
    base: RawBranch,
}

#[derive(Debug, Deserialize)]
struct RawBranch {
    sha: String,
    repo: RawRepo,
}

#[derive(Debug, Deserialize)]
struct RawRepo {
    id: i64,
    clone_url: String,
}

/// `pull_request` with action `opened`/`synchronize`: queues a request-event
/// job.
pub fn decode_pull_request_event(body: &[u8]) -> Result<inspectd_types::Job, WebhookError> {
    let raw: RawPullRequestPayload = serde_json::from_slice(body)?;
    if raw.action != "opened" && raw.action != "synchronize" {
        return Err(WebhookError::UnsupportedAction(raw.action));
    }

    Ok(inspectd_types::Job {
        event: inspectd_types::EventKind::Request,
        repository: inspectd_types::RepositoryRef {
            id: raw.pull_request.head.repo.id,
            url: raw.pull_request.head.repo.clone_url.clone(),
        },
        head: inspectd_types::Revision::new(
            raw.pull_request.head.repo.clone_url,
            raw.pull_request.head.sha,
        ),
        base: inspectd_types::Revision::new(
            raw.pull_request.base.repo.clone_url,
            raw.pull_request.base.sha,
        ),
        request_number: raw.number,
        installation_id: raw.installation.id,
    })
}

#[derive(Debug, Deserialize)]
struct RawPushPayload {
    #[serde(rename = "ref")]
    reference: String,
    before: String,
    after: String,
    deleted: bool,
    installation: RawInstallation,
    repository: RawRepo,
}

/// `push` (non-deleted, non-tag): queues a push-event job. If `before` is
/// the zero SHA, [`inspectd_git::FixedRef`] falls back to `HEAD~1`.
pub fn decode_push_event(body: &[u8]) -> Result<inspectd_types::Job, WebhookError> {
    let raw: RawPushPayload = serde_json::from_slice(body)?;
    if raw.deleted {
        return Err(WebhookError::UnsupportedAction("deleted".to_string()));
    }
    if raw.reference.starts_with("refs/tags/") {
        return Err(WebhookError::UnsupportedAction("tag-push".to_string()));
    }

    Ok(inspectd_types::Job {
        event: inspectd_types::EventKind::Push,
        repository: inspectd_types::RepositoryRef {
            id: raw.repository.id,
            url: raw.repository.clone_url.clone(),
        },
        head: inspectd_types::Revision::new(raw.repository.clone_url.clone(), raw.after),
        base: inspectd_types::Revision::new(raw.repository.clone_url, raw.before),
        request_number: 0,
        installation_id: raw.installation.id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any size");
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn verify_signature_accepts_correctly_signed_body() {
        let secret = "shared-secret";
        let body = br#"{"hello":"world"}"#;
        let header = sign(secret, body);
        assert!(verify_signature(secret, body, &header).is_ok());
    }

    #[test]
    fn verify_signature_rejects_tampered_body() {
        let secret = "shared-secret";
        let body = br#"{"hello":"world"}"#;
        let header = sign(secret, body);
        let tampered = br#"{"hello":"mallory"}"#;
        assert!(verify_signature(secret, tampered, &header).is_err());
    }

    #[test]
    fn verify_signature_rejects_missing_prefix() {
        let result = verify_signature("secret", b"body", "deadbeef");
        assert!(matches!(result, Err(WebhookError::MissingSignature)));
    }

    #[test]
    fn decode_installation_created_extracts_credential_triple() {
        let body = br#"{
            "action": "created",
            "installation": {"id": 42, "account": {"id": 7}},
            "sender": {"id": 99}
        }"#;
        let event = decode_installation_event(body).unwrap();
        assert_eq!(
            event,
            InstallationEvent::Created {
                installation_id: 42,
                account_id: 7,
                sender_id: 99
            }
        );
    }

    #[test]
    fn decode_installation_deleted_carries_only_installation_id() {
        let body = br#"{
            "action": "deleted",
            "installation": {"id": 42, "account": {"id": 7}},
            "sender": {"id": 99}
        }"#;
        let event = decode_installation_event(body).unwrap();
        assert_eq!(
            event,
            InstallationEvent::Deleted {
                installation_id: 42
            }
        );
    }

    #[test]
    fn decode_push_event_uses_zero_sha_as_before_when_initial_push() {
        let body = format!(
            r#"{{
            "ref": "refs/heads/main",
            "before": "{}",
            "after": "abc123",
            "deleted": false,
            "installation": {{"id": 1, "account": {{"id": 1}}}},
            "repository": {{"id": 5, "clone_url": "https://example.com/repo.git"}}
        }}"#,
            inspectd_types::ZERO_SHA
        );
        let job = decode_push_event(body.as_bytes()).unwrap();
        assert_eq!(job.base.reference, inspectd_types::ZERO_SHA);
        assert_eq!(job.head.reference, "abc123");
        assert_eq!(job.request_number, 0);
    }

    #[test]
    fn decode_push_event_rejects_tag_push() {
        let body = br#"{
            "ref": "refs/tags/v1.0.0",
            "before": "a",
            "after": "b",
            "deleted": false,
            "installation": {"id": 1, "account": {"id": 1}},
            "repository": {"id": 5, "clone_url": "https://example.com/repo.git"}
        }"#;
        assert!(decode_push_event(body).is_err());
    }

    #[test]
    fn decode_pull_request_ignores_unsupported_actions() {
        let body = br#"{
            "action": "closed",
            "number": 1,
            "installation": {"id": 1, "account": {"id": 1}},
            "pull_request": {
                "head": {"sha": "a", "repo": {"id": 1, "clone_url": "https://example.com/repo.git"}},
                "base": {"sha": "b", "repo": {"id": 1, "clone_url": "https://example.com/repo.git"}}
            }
        }"#;
        assert!(decode_pull_request_event(body).is_err());
    }
}
