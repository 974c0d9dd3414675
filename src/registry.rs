//! Root and intermediate CA lifecycle: creation, activation, signer
//! resolution, and cascading deletes.
//!
//! Key material lives on disk under the deterministic layout of
//! `crate::paths`; the store rows are authoritative for existence.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use rcgen::{Certificate, CertificateParams, KeyPair};

use crate::error::ApiError;
use crate::models::{domain_matches_pattern, CaOptions, IntermediateCa, RootCa};
use crate::paths;
use crate::pki::{self, CaBuildOptions, HashAlgorithm, KeyAlgorithm};
use crate::storage::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerKind {
    Root,
    Intermediate,
}

/// A loaded CA ready to sign: its reconstructed certificate and private key.
pub struct Signer {
    pub id: String,
    pub kind: SignerKind,
    pub cert: Certificate,
    pub key: KeyPair,
    pub cert_pem: String,
}

#[derive(Clone)]
pub struct CaRegistry {
    store: Arc<Store>,
}

impl CaRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn data_dir(&self) -> PathBuf {
        self.store.data_dir().to_path_buf()
    }

    /// Resolve creation options against the configured defaults. CA signing
    /// keys are RSA in this core; unsupported widths are rejected.
    async fn resolve_ca_options(
        &self,
        opts: &CaOptions,
        default_cn: String,
    ) -> Result<(String, u32, KeyAlgorithm, HashAlgorithm), ApiError> {
        let common_name = opts
            .common_name
            .clone()
            .filter(|cn| !cn.trim().is_empty())
            .unwrap_or(default_cn);
        let validity_years = match opts.validity_years {
            Some(years) => years,
            None => self.store.default_validity_years().await?,
        };
        if validity_years == 0 {
            return Err(ApiError::BadRequest("validityYears must be positive".into()));
        }
        let key_size = match opts.key_size {
            Some(bits) => bits,
            None => self.store.default_key_size().await?,
        };
        let algorithm = KeyAlgorithm::from_rsa_bits(key_size).ok_or_else(|| {
            ApiError::BadRequest(format!(
                "unsupported CA key size {key_size}; CA keys are RSA 2048/3072/4096"
            ))
        })?;
        let hash = self.resolve_hash(opts.hash_algo.as_deref()).await?;
        Ok((common_name, validity_years, algorithm, hash))
    }

    async fn resolve_hash(&self, requested: Option<&str>) -> Result<HashAlgorithm, ApiError> {
        match requested {
            Some(s) => HashAlgorithm::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown hash algorithm {s:?}"))),
            None => {
                let configured = self.store.default_hash_algorithm().await?;
                Ok(HashAlgorithm::parse(&configured).unwrap_or_default())
            }
        }
    }

    /// Pick a slug for the display name, appending a base36 epoch suffix on
    /// collision with any existing CA id.
    async fn pick_slug(&self, name: &str) -> Result<String, ApiError> {
        let slug = paths::slugify(name);
        if slug.is_empty() {
            return Err(ApiError::BadRequest(
                "name does not yield a usable identifier".into(),
            ));
        }
        if !self.store.ca_id_in_use(&slug).await? {
            return Ok(slug);
        }
        Ok(paths::slugify_with_suffix(
            name,
            Utc::now().timestamp_millis(),
        ))
    }

    /// Create a self-signed root. The first root automatically becomes the
    /// active ACME issuer.
    pub async fn create_root(&self, name: &str, opts: CaOptions) -> Result<RootCa, ApiError> {
        let default_cn = self.store.default_common_name_root().await?;
        let (common_name, validity_years, algorithm, hash) =
            self.resolve_ca_options(&opts, default_cn).await?;
        let id = self.pick_slug(name).await?;

        let key = tokio::task::spawn_blocking(move || pki::generate_keypair(algorithm, hash))
            .await
            .context("keypair task join failed")??;
        let (cert, not_after) = pki::build_root_certificate(
            &key,
            &CaBuildOptions {
                common_name: common_name.clone(),
                validity_years,
            },
        )?;

        let data_dir = self.data_dir();
        tokio::fs::write(paths::root_key_path(&data_dir, &id), key.serialize_pem())
            .await
            .context("writing root key PEM")?;
        tokio::fs::write(paths::root_cert_path(&data_dir, &id), cert.pem())
            .await
            .context("writing root cert PEM")?;

        let root = RootCa {
            id: id.clone(),
            display_name: name.trim().to_string(),
            common_name,
            not_after,
            created_at: Utc::now().to_rfc3339(),
        };
        self.store.insert_root(root.clone()).await?;

        if self.store.active_ca_id().await?.is_none() {
            self.store
                .set_config(crate::storage::config_keys::ACTIVE_CA_ID, &id)
                .await?;
            tracing::info!("root CA {} created and activated", id);
        } else {
            tracing::info!("root CA {} created", id);
        }
        Ok(root)
    }

    /// Create an intermediate signed by an existing root.
    pub async fn create_intermediate(
        &self,
        parent_id: &str,
        name: &str,
        opts: CaOptions,
    ) -> Result<IntermediateCa, ApiError> {
        if self.store.get_root(parent_id).await?.is_none() {
            return Err(ApiError::NotFound(format!(
                "parent-not-found: no root CA {parent_id:?}"
            )));
        }
        let parent = self.load_signer_material(parent_id, SignerKind::Root).await?;

        let default_cn = self.store.default_common_name_intermediate().await?;
        let (common_name, validity_years, algorithm, hash) =
            self.resolve_ca_options(&opts, default_cn).await?;
        let id = self.pick_slug(name).await?;

        let key = tokio::task::spawn_blocking(move || pki::generate_keypair(algorithm, hash))
            .await
            .context("keypair task join failed")??;
        let (cert, not_after) = pki::build_intermediate_certificate(
            &key,
            &parent.cert,
            &parent.key,
            &CaBuildOptions {
                common_name: common_name.clone(),
                validity_years,
            },
        )?;

        let data_dir = self.data_dir();
        tokio::fs::write(
            paths::intermediate_key_path(&data_dir, &id),
            key.serialize_pem(),
        )
        .await
        .context("writing intermediate key PEM")?;
        tokio::fs::write(paths::intermediate_cert_path(&data_dir, &id), cert.pem())
            .await
            .context("writing intermediate cert PEM")?;

        let intermediate = IntermediateCa {
            id: id.clone(),
            parent_root_id: parent_id.to_string(),
            display_name: name.trim().to_string(),
            common_name,
            not_after,
            created_at: Utc::now().to_rfc3339(),
        };
        self.store.insert_intermediate(intermediate.clone()).await?;
        tracing::info!("intermediate CA {} created under {}", id, parent_id);
        Ok(intermediate)
    }

    /// Make a root the active ACME issuer. Activating an already-active root
    /// is a no-op.
    pub async fn activate(&self, id: &str) -> Result<(), ApiError> {
        if self.store.get_root(id).await?.is_none() {
            return Err(ApiError::NotFound(format!("no root CA {id:?}")));
        }
        let cert_path = paths::root_cert_path(&self.data_dir(), id);
        if !cert_path.exists() {
            return Err(ApiError::Internal(anyhow::anyhow!(
                "certificate file missing for root {id:?}"
            )));
        }
        self.store
            .set_config(crate::storage::config_keys::ACTIVE_CA_ID, id)
            .await?;
        tracing::info!("root CA {} activated", id);
        Ok(())
    }

    /// Load the signing material for a root or intermediate id.
    pub async fn resolve_signer(&self, issuer_id: &str) -> Result<Signer, ApiError> {
        let kind = if self.store.get_root(issuer_id).await?.is_some() {
            SignerKind::Root
        } else if self.store.get_intermediate(issuer_id).await?.is_some() {
            SignerKind::Intermediate
        } else {
            return Err(ApiError::NotFound(format!(
                "ca-not-found: no CA {issuer_id:?}"
            )));
        };
        self.load_signer_material(issuer_id, kind).await
    }

    async fn load_signer_material(
        &self,
        id: &str,
        kind: SignerKind,
    ) -> Result<Signer, ApiError> {
        let data_dir = self.data_dir();
        let (key_path, cert_path) = match kind {
            SignerKind::Root => (
                paths::root_key_path(&data_dir, id),
                paths::root_cert_path(&data_dir, id),
            ),
            SignerKind::Intermediate => (
                paths::intermediate_key_path(&data_dir, id),
                paths::intermediate_cert_path(&data_dir, id),
            ),
        };

        let key_pem = tokio::fs::read_to_string(&key_path)
            .await
            .with_context(|| format!("reading CA key {:?}", key_path))?;
        let cert_pem = tokio::fs::read_to_string(&cert_path)
            .await
            .with_context(|| format!("reading CA cert {:?}", cert_path))?;

        let hash = self.resolve_hash(None).await?;
        let key = pki::load_signing_key(&key_pem, hash)?;
        // Reconstruct the certificate so rcgen can use its subject as the
        // issuer DN when signing children.
        let cert = CertificateParams::from_ca_cert_pem(&cert_pem)
            .context("parsing CA certificate PEM")?
            .self_signed(&key)
            .context("reconstructing CA certificate")?;

        Ok(Signer {
            id: id.to_string(),
            kind,
            cert,
            key,
            cert_pem,
        })
    }

    /// Cascade-delete a root with everything below it.
    pub async fn delete_root(&self, id: &str) -> Result<(), ApiError> {
        match self.store.delete_root_cascade(id).await? {
            Some(report) => {
                tracing::info!(
                    "deleted root {} ({} intermediates, {} leaves)",
                    id,
                    report.intermediate_ids.len(),
                    report.leaf_ids.len()
                );
                Ok(())
            }
            None => Err(ApiError::NotFound(format!("no root CA {id:?}"))),
        }
    }

    pub async fn delete_intermediate(&self, id: &str) -> Result<(), ApiError> {
        match self.store.delete_intermediate_cascade(id).await? {
            Some(report) => {
                tracing::info!(
                    "deleted intermediate {} ({} leaves)",
                    id,
                    report.leaf_ids.len()
                );
                Ok(())
            }
            None => Err(ApiError::NotFound(format!("no intermediate CA {id:?}"))),
        }
    }

    /// Choose the signer for an ACME domain: exact assignment match first,
    /// then the longest matching wildcard suffix (ties broken by insertion
    /// order), then the configured ACME intermediate, then the active root.
    pub async fn ca_for_acme_domain(&self, domain: &str) -> Result<Option<String>, ApiError> {
        let domain = domain.trim().to_ascii_lowercase();
        let assignments = self.store.list_assignments().await?;

        for assignment in &assignments {
            if !assignment.domain_pattern.starts_with("*.")
                && assignment.domain_pattern.eq_ignore_ascii_case(&domain)
            {
                return Ok(Some(assignment.ca_id.clone()));
            }
        }

        let mut best: Option<(usize, &str)> = None;
        for assignment in &assignments {
            if let Some(suffix) = assignment.domain_pattern.strip_prefix("*.") {
                if domain_matches_pattern(&domain, &assignment.domain_pattern) {
                    // Strictly longer wins; equal length keeps the earlier row.
                    if best.map_or(true, |(len, _)| suffix.len() > len) {
                        best = Some((suffix.len(), assignment.ca_id.as_str()));
                    }
                }
            }
        }
        if let Some((_, ca_id)) = best {
            return Ok(Some(ca_id.to_string()));
        }

        if let Some(id) = self.store.active_acme_intermediate_id().await? {
            return Ok(Some(id));
        }
        Ok(self.store.active_ca_id().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn registry(dir: &std::path::Path) -> CaRegistry {
        let store = Arc::new(Store::open(&dir.join("test.sqlite"), dir).unwrap());
        CaRegistry::new(store)
    }

    fn fast_opts() -> CaOptions {
        CaOptions {
            common_name: None,
            validity_years: Some(2),
            key_size: Some(2048),
            hash_algo: None,
        }
    }

    #[tokio::test]
    async fn first_root_becomes_active_and_writes_files() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path()).await;
        let root = reg.create_root("Test CA", fast_opts()).await.unwrap();
        assert_eq!(root.id, "test-ca");
        assert!(paths::root_key_path(dir.path(), "test-ca").exists());
        assert!(paths::root_cert_path(dir.path(), "test-ca").exists());
        assert_eq!(
            reg.store.active_ca_id().await.unwrap().as_deref(),
            Some("test-ca")
        );

        // A second root does not steal the active slot.
        let other = reg.create_root("Other CA", fast_opts()).await.unwrap();
        assert_eq!(other.id, "other-ca");
        assert_eq!(
            reg.store.active_ca_id().await.unwrap().as_deref(),
            Some("test-ca")
        );

        // Explicit activation is idempotent.
        reg.activate("other-ca").await.unwrap();
        reg.activate("other-ca").await.unwrap();
        assert_eq!(
            reg.store.active_ca_id().await.unwrap().as_deref(),
            Some("other-ca")
        );
    }

    #[tokio::test]
    async fn colliding_names_get_suffixed_slugs() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path()).await;
        let first = reg.create_root("Test CA", fast_opts()).await.unwrap();
        let second = reg.create_root("Test CA", fast_opts()).await.unwrap();
        assert_eq!(first.id, "test-ca");
        assert!(second.id.starts_with("test-ca-"));
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn ecdsa_ca_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path()).await;
        let err = reg
            .create_root(
                "EC CA",
                CaOptions {
                    key_size: Some(256),
                    validity_years: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn intermediate_chains_to_parent() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path()).await;
        reg.create_root("Root", fast_opts()).await.unwrap();
        let inter = reg
            .create_intermediate("root", "Inter", fast_opts())
            .await
            .unwrap();
        assert_eq!(inter.parent_root_id, "root");

        let inter_pem =
            std::fs::read_to_string(paths::intermediate_cert_path(dir.path(), &inter.id)).unwrap();
        let root_pem =
            std::fs::read_to_string(paths::root_cert_path(dir.path(), "root")).unwrap();

        let (_, inter_der) = x509_parser::pem::parse_x509_pem(inter_pem.as_bytes()).unwrap();
        let inter_cert = inter_der.parse_x509().unwrap();
        let (_, root_der) = x509_parser::pem::parse_x509_pem(root_pem.as_bytes()).unwrap();
        let root_cert = root_der.parse_x509().unwrap();

        inter_cert
            .verify_signature(Some(root_cert.public_key()))
            .expect("intermediate verifies against parent key");
    }

    #[tokio::test]
    async fn create_intermediate_requires_parent() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path()).await;
        let err = reg
            .create_intermediate("missing", "Inter", fast_opts())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn acme_domain_prefers_exact_then_longest_wildcard() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path()).await;
        reg.store.insert_assignment("*.c", "wild-c").await.unwrap();
        reg.store
            .insert_assignment("*.b.c", "wild-bc-first")
            .await
            .unwrap();
        reg.store
            .insert_assignment("a.b.c", "exact")
            .await
            .unwrap();
        reg.store
            .insert_assignment("*.x.b.c", "wild-xbc")
            .await
            .unwrap();

        // Exact match beats any wildcard.
        assert_eq!(
            reg.ca_for_acme_domain("a.b.c").await.unwrap().as_deref(),
            Some("exact")
        );
        // Longest suffix wins among wildcards.
        assert_eq!(
            reg.ca_for_acme_domain("z.b.c").await.unwrap().as_deref(),
            Some("wild-bc-first")
        );
        assert_eq!(
            reg.ca_for_acme_domain("q.x.b.c").await.unwrap().as_deref(),
            Some("wild-xbc")
        );
        // No match falls through to configured defaults (none set here).
        assert_eq!(reg.ca_for_acme_domain("other.org").await.unwrap(), None);

        reg.store
            .set_config(crate::storage::config_keys::ACTIVE_CA_ID, "fallback-root")
            .await
            .unwrap();
        assert_eq!(
            reg.ca_for_acme_domain("other.org").await.unwrap().as_deref(),
            Some("fallback-root")
        );
        reg.store
            .set_config(
                crate::storage::config_keys::ACTIVE_ACME_INTERMEDIATE_ID,
                "fallback-inter",
            )
            .await
            .unwrap();
        assert_eq!(
            reg.ca_for_acme_domain("other.org").await.unwrap().as_deref(),
            Some("fallback-inter")
        );
    }

    #[tokio::test]
    async fn delete_root_clears_files() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path()).await;
        reg.create_root("Root", fast_opts()).await.unwrap();
        reg.create_intermediate("root", "Inter", fast_opts())
            .await
            .unwrap();
        reg.delete_root("root").await.unwrap();
        assert!(!paths::root_cert_path(dir.path(), "root").exists());
        assert!(!paths::intermediate_cert_path(dir.path(), "inter").exists());
        assert!(matches!(
            reg.delete_root("root").await.unwrap_err(),
            ApiError::NotFound(_)
        ));
    }
}
