//! Leaf certificate lifecycle: issuance, revocation, renewal, deletion.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;

use crate::error::ApiError;
use crate::models::LeafOptions;
use crate::pki::{self, HashAlgorithm, KeyAlgorithm, LeafBuildOptions};
use crate::registry::CaRegistry;
use crate::storage::{NewLeaf, Store};

#[derive(Clone)]
pub struct LeafIssuer {
    store: Arc<Store>,
    registry: CaRegistry,
}

impl LeafIssuer {
    pub fn new(store: Arc<Store>, registry: CaRegistry) -> Self {
        Self { store, registry }
    }

    /// Union of the primary domain and the extra SANs: lowercased, trimmed,
    /// de-duplicated preserving first occurrence. The first survivor becomes
    /// the subject CN.
    fn san_union(primary: &str, extra: &[String]) -> Vec<String> {
        let mut seen = Vec::new();
        for raw in std::iter::once(primary).chain(extra.iter().map(|s| s.as_str())) {
            let name = raw.trim().to_ascii_lowercase();
            if !name.is_empty() && !seen.contains(&name) {
                seen.push(name);
            }
        }
        seen
    }

    async fn resolve_leaf_algorithm(&self, opts: &LeafOptions) -> Result<KeyAlgorithm, ApiError> {
        if let Some(requested) = &opts.key_algorithm {
            let algorithm = KeyAlgorithm::parse(requested).ok_or_else(|| {
                ApiError::BadRequest(format!("unknown key algorithm {requested:?}"))
            })?;
            return Ok(algorithm);
        }
        let bits = match opts.key_size {
            Some(bits) => bits,
            None => self.store.default_key_size().await?,
        };
        KeyAlgorithm::from_rsa_bits(bits)
            .ok_or_else(|| ApiError::BadRequest(format!("unsupported key size {bits}")))
    }

    async fn resolve_leaf_hash(&self, opts: &LeafOptions) -> Result<HashAlgorithm, ApiError> {
        match opts.hash_algo.as_deref() {
            Some(s) => HashAlgorithm::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown hash algorithm {s:?}"))),
            None => {
                let configured = self.store.default_hash_algorithm().await?;
                Ok(HashAlgorithm::parse(&configured).unwrap_or_default())
            }
        }
    }

    /// Issue a leaf under the given signer and return the new row id.
    pub async fn issue_leaf(
        &self,
        issuer_id: &str,
        primary_domain: &str,
        opts: LeafOptions,
    ) -> Result<i64, ApiError> {
        let san_dns = Self::san_union(primary_domain, &opts.san_domains);
        let subject_cn = san_dns
            .first()
            .cloned()
            .ok_or_else(|| ApiError::BadRequest("domain must not be empty".into()))?;

        let signer = self.registry.resolve_signer(issuer_id).await?;
        let algorithm = self.resolve_leaf_algorithm(&opts).await?;
        let hash = self.resolve_leaf_hash(&opts).await?;
        let validity_days = match opts.validity_days {
            Some(days) if days > 0 => days,
            Some(_) => return Err(ApiError::BadRequest("validityDays must be positive".into())),
            None => self.store.default_validity_days().await?,
        };

        let key = tokio::task::spawn_blocking(move || pki::generate_keypair(algorithm, hash))
            .await
            .context("keypair task join failed")??;

        let is_ev = opts.is_ev.unwrap_or(false);
        let policy_oid = opts.policy_oid.filter(|oid| !oid.trim().is_empty());
        let (cert, not_after) = pki::build_leaf_certificate(
            &key,
            &signer.cert,
            &signer.key,
            &LeafBuildOptions {
                subject_cn: subject_cn.clone(),
                san_dns,
                validity_days,
                ev_policy_oid: policy_oid.clone(),
            },
        )?;

        let id = self
            .store
            .insert_leaf_with_key(
                NewLeaf {
                    domain: subject_cn,
                    not_after,
                    created_at: Utc::now().to_rfc3339(),
                    pem: cert.pem(),
                    issuer_id: Some(signer.id.clone()),
                    is_acme: false,
                    is_ev,
                    policy_oid,
                },
                key.serialize_pem(),
            )
            .await?;
        tracing::info!("issued leaf {} under {}", id, signer.id);
        Ok(id)
    }

    /// Revocation is terminal; a second call is a conflict.
    pub async fn revoke_leaf(&self, leaf_id: i64) -> Result<(), ApiError> {
        if self.store.get_leaf(leaf_id).await?.is_none() {
            return Err(ApiError::NotFound(format!("no certificate {leaf_id}")));
        }
        let revoked = self
            .store
            .revoke_leaf(leaf_id, Utc::now().to_rfc3339())
            .await?;
        if !revoked {
            return Err(ApiError::Conflict(format!(
                "already-revoked: certificate {leaf_id}"
            )));
        }
        tracing::info!("revoked leaf {}", leaf_id);
        Ok(())
    }

    /// Revoke the old leaf, record a renewal event, and issue a replacement
    /// for the same domain under the original issuer (or the active root when
    /// the original issuer is gone from the row). One transaction.
    pub async fn renew_leaf(&self, leaf_id: i64) -> Result<i64, ApiError> {
        let old = self
            .store
            .get_leaf(leaf_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("no certificate {leaf_id}")))?;
        if self.store.get_revocation(leaf_id).await?.is_some() {
            return Err(ApiError::Conflict(format!(
                "already-revoked: certificate {leaf_id}"
            )));
        }

        let issuer_id = match &old.issuer_id {
            Some(id) => id.clone(),
            None => self
                .store
                .active_ca_id()
                .await?
                .ok_or_else(|| ApiError::Conflict("no active CA to renew under".into()))?,
        };
        let signer = self.registry.resolve_signer(&issuer_id).await?;

        let algorithm = KeyAlgorithm::from_rsa_bits(self.store.default_key_size().await?)
            .unwrap_or(KeyAlgorithm::Rsa2048);
        let hash = HashAlgorithm::parse(&self.store.default_hash_algorithm().await?)
            .unwrap_or_default();
        let validity_days = self.store.default_validity_days().await?;

        let key = tokio::task::spawn_blocking(move || pki::generate_keypair(algorithm, hash))
            .await
            .context("keypair task join failed")??;
        let (cert, not_after) = pki::build_leaf_certificate(
            &key,
            &signer.cert,
            &signer.key,
            &LeafBuildOptions {
                subject_cn: old.domain.clone(),
                san_dns: vec![old.domain.clone()],
                validity_days,
                ev_policy_oid: old.policy_oid.clone(),
            },
        )?;

        let now = Utc::now().to_rfc3339();
        let new_id = self
            .store
            .renew_leaf_atomic(
                leaf_id,
                now.clone(),
                NewLeaf {
                    domain: old.domain.clone(),
                    not_after,
                    created_at: now,
                    pem: cert.pem(),
                    issuer_id: Some(signer.id.clone()),
                    is_acme: old.is_acme,
                    is_ev: old.is_ev,
                    policy_oid: old.policy_oid.clone(),
                },
                key.serialize_pem(),
            )
            .await?
            .ok_or_else(|| {
                ApiError::Conflict(format!("already-revoked: certificate {leaf_id}"))
            })?;
        tracing::info!("renewed leaf {} as {}", leaf_id, new_id);
        Ok(new_id)
    }

    pub async fn delete_leaf(&self, leaf_id: i64) -> Result<(), ApiError> {
        if !self.store.delete_leaf(leaf_id).await? {
            return Err(ApiError::NotFound(format!("no certificate {leaf_id}")));
        }
        tracing::info!("deleted leaf {}", leaf_id);
        Ok(())
    }
}
