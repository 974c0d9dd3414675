//! CA hierarchy and leaf certificate models.

use serde::{Deserialize, Serialize};

/// A self-signed root CA. Key and certificate PEMs live on disk under
/// deterministic paths keyed by `id` (see `crate::paths`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootCa {
    /// Slug identifier, unique across roots.
    pub id: String,
    /// Operator-facing display name the slug was derived from.
    pub display_name: String,
    pub common_name: String,
    /// UTC ISO-8601 expiry of the CA certificate.
    pub not_after: String,
    pub created_at: String,
}

/// An intermediate CA signed by its parent root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntermediateCa {
    pub id: String,
    pub parent_root_id: String,
    pub display_name: String,
    pub common_name: String,
    pub not_after: String,
    pub created_at: String,
}

/// An end-entity certificate. The full PEM is stored in the row; the private
/// key lives on disk keyed by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafCertificate {
    /// Monotonically increasing row id.
    pub id: i64,
    pub domain: String,
    pub not_after: String,
    pub created_at: String,
    pub pem: String,
    /// References exactly one root or intermediate.
    pub issuer_id: Option<String>,
    pub is_acme: bool,
    pub is_ev: bool,
    pub policy_oid: Option<String>,
}

/// Terminal revocation marker, at most one per leaf.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationRecord {
    pub leaf_id: i64,
    pub revoked_at: String,
}

/// Append-only audit entry recorded whenever a leaf is renewed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalEvent {
    pub id: i64,
    pub renewed_at: String,
}

/// Options accepted when creating a root or intermediate CA.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaOptions {
    pub common_name: Option<String>,
    pub validity_years: Option<u32>,
    pub key_size: Option<u32>,
    pub hash_algo: Option<String>,
}

/// Options accepted when issuing a leaf certificate.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeafOptions {
    pub san_domains: Vec<String>,
    pub validity_days: Option<u32>,
    /// `rsa-2048` … `ec-p384`; takes precedence over `key_size`.
    pub key_algorithm: Option<String>,
    pub key_size: Option<u32>,
    pub hash_algo: Option<String>,
    pub is_ev: Option<bool>,
    pub policy_oid: Option<String>,
}
