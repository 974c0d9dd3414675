//! ACME protocol entities and their state machines.

use serde::{Deserialize, Serialize};

/// Order lifecycle. `Ready` is implicit in this core: finalize accepts an
/// order whose authorizations are all valid and moves it straight to `Valid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Valid,
    Invalid,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "ready" => OrderStatus::Ready,
            "valid" => OrderStatus::Valid,
            "invalid" => OrderStatus::Invalid,
            _ => OrderStatus::Pending,
        }
    }
}

/// Shared by authorizations and challenges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthzStatus {
    Pending,
    Valid,
    Invalid,
}

impl AuthzStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthzStatus::Pending => "pending",
            AuthzStatus::Valid => "valid",
            AuthzStatus::Invalid => "invalid",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "valid" => AuthzStatus::Valid,
            "invalid" => AuthzStatus::Invalid,
            _ => AuthzStatus::Pending,
        }
    }
}

/// A `{type: "dns", value}` pair from a new-order request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmeIdentifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

/// Account bound to the JWK that signed its `new-account` request. The
/// account id is the authoritative binding key for later `kid` requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeAccount {
    pub account_id: String,
    /// Canonical JSON of the public JWK.
    pub jwk: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeOrder {
    pub order_id: String,
    pub account_id: String,
    pub identifiers: Vec<AcmeIdentifier>,
    pub status: OrderStatus,
    pub finalize_url: String,
    /// Row id in the ACME-issued-certificate table once finalized.
    pub leaf_ref: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeAuthorization {
    pub authz_id: String,
    pub order_id: String,
    pub identifier: String,
    pub status: AuthzStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeChallenge {
    pub challenge_id: String,
    pub authz_id: String,
    /// Only `http-01` in this core.
    pub kind: String,
    pub token: String,
    /// `token + "." + thumbprint(JWK)` — the string the claimant must serve.
    pub key_authorization: String,
    pub status: AuthzStatus,
    /// Set when an operator forced the challenge valid.
    pub accepted_at: Option<String>,
}

/// Exact domain or `*.suffix` pattern whose authorizations are auto-validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhitelistEntry {
    pub id: i64,
    pub domain_pattern: String,
}

/// Routes finalize-time issuance of matching domains to a specific signer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaAssignment {
    pub id: i64,
    pub domain_pattern: String,
    pub ca_id: String,
}

/// Returns true when `domain` matches `pattern` (exact, or `*.suffix` where
/// the domain equals the suffix or ends with `.suffix`).
pub fn domain_matches_pattern(domain: &str, pattern: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix("*.") {
        domain == suffix || domain.ends_with(&format!(".{suffix}"))
    } else {
        domain == pattern
    }
}
