use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::models::{
    AcmeAccount, AcmeAuthorization, AcmeChallenge, AcmeIdentifier, AcmeOrder, AuthzStatus,
    CaAssignment, IntermediateCa, LeafCertificate, OrderStatus, RenewalEvent, RevocationRecord,
    RootCa, WhitelistEntry,
};
use crate::paths;

/// Recognized config keys and their defaults.
pub mod config_keys {
    pub const ACTIVE_CA_ID: &str = "active_ca_id";
    pub const ACTIVE_ACME_INTERMEDIATE_ID: &str = "active_acme_intermediate_id";
    pub const DEFAULT_KEY_SIZE: &str = "default_key_size";
    pub const DEFAULT_VALIDITY_YEARS: &str = "default_validity_years";
    pub const DEFAULT_VALIDITY_DAYS: &str = "default_validity_days";
    pub const DEFAULT_HASH_ALGORITHM: &str = "default_hash_algorithm";
    pub const DEFAULT_COMMON_NAME_ROOT: &str = "default_common_name_root";
    pub const DEFAULT_COMMON_NAME_INTERMEDIATE: &str = "default_common_name_intermediate";

    pub const ALL: &[&str] = &[
        ACTIVE_CA_ID,
        ACTIVE_ACME_INTERMEDIATE_ID,
        DEFAULT_KEY_SIZE,
        DEFAULT_VALIDITY_YEARS,
        DEFAULT_VALIDITY_DAYS,
        DEFAULT_HASH_ALGORITHM,
        DEFAULT_COMMON_NAME_ROOT,
        DEFAULT_COMMON_NAME_INTERMEDIATE,
    ];
}

/// Fields of a leaf row about to be inserted; the id is assigned by SQLite.
#[derive(Debug, Clone)]
pub struct NewLeaf {
    pub domain: String,
    pub not_after: String,
    pub created_at: String,
    pub pem: String,
    pub issuer_id: Option<String>,
    pub is_acme: bool,
    pub is_ev: bool,
    pub policy_oid: Option<String>,
}

/// Rows removed by a cascading CA delete; files are unlinked afterwards.
#[derive(Debug, Clone, Default)]
pub struct CascadeReport {
    pub intermediate_ids: Vec<String>,
    pub leaf_ids: Vec<i64>,
}

pub struct Store {
    db: Arc<Mutex<Connection>>,
    data_dir: PathBuf,
}

impl Store {
    /// Open (or create) the store and bring the schema up to date.
    pub fn open(db_path: &Path, data_dir: &Path) -> anyhow::Result<Self> {
        if !data_dir.exists() {
            fs::create_dir_all(data_dir)
                .with_context(|| format!("creating data directory {:?}", data_dir))?;
        }
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {:?}", parent))?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening database at {:?}", db_path))?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().expect("db mutex poisoned");
            f(&mut conn)
        })
        .await
        .context("store task join failed")?
    }

    // ---- roots ----------------------------------------------------------

    pub async fn insert_root(&self, root: RootCa) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO cas (id, name, common_name, not_after, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    root.id,
                    root.display_name,
                    root.common_name,
                    root.not_after,
                    root.created_at
                ],
            )
            .context("inserting root CA")?;
            Ok(())
        })
        .await
    }

    pub async fn get_root(&self, id: &str) -> anyhow::Result<Option<RootCa>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, name, common_name, not_after, created_at FROM cas WHERE id = ?1",
                params![id],
                row_to_root,
            )
            .optional()
            .context("loading root CA")
        })
        .await
    }

    pub async fn list_roots(&self) -> anyhow::Result<Vec<RootCa>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, common_name, not_after, created_at
                 FROM cas ORDER BY created_at, id",
            )?;
            let rows = stmt
                .query_map([], row_to_root)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// True when the id is taken by any root or intermediate; used to pick
    /// collision-free slugs.
    pub async fn ca_id_in_use(&self, id: &str) -> anyhow::Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT (SELECT COUNT(*) FROM cas WHERE id = ?1)
                      + (SELECT COUNT(*) FROM intermediates WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    // ---- intermediates --------------------------------------------------

    pub async fn insert_intermediate(&self, ca: IntermediateCa) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO intermediates (id, parent_id, name, common_name, not_after, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    ca.id,
                    ca.parent_root_id,
                    ca.display_name,
                    ca.common_name,
                    ca.not_after,
                    ca.created_at
                ],
            )
            .context("inserting intermediate CA")?;
            Ok(())
        })
        .await
    }

    pub async fn get_intermediate(&self, id: &str) -> anyhow::Result<Option<IntermediateCa>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, parent_id, name, common_name, not_after, created_at
                 FROM intermediates WHERE id = ?1",
                params![id],
                row_to_intermediate,
            )
            .optional()
            .context("loading intermediate CA")
        })
        .await
    }

    pub async fn list_intermediates(&self) -> anyhow::Result<Vec<IntermediateCa>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, parent_id, name, common_name, not_after, created_at
                 FROM intermediates ORDER BY created_at, id",
            )?;
            let rows = stmt
                .query_map([], row_to_intermediate)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    // ---- leaves ---------------------------------------------------------

    /// Insert a leaf row and write its key file in one transaction; a failed
    /// file write rolls the row back so the store never points at a missing
    /// key.
    pub async fn insert_leaf_with_key(
        &self,
        leaf: NewLeaf,
        key_pem: String,
    ) -> anyhow::Result<i64> {
        let data_dir = self.data_dir.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let id = insert_leaf_row(&tx, &leaf)?;
            let key_path = paths::leaf_key_path(&data_dir, id);
            if let Err(e) = fs::write(&key_path, &key_pem) {
                let _ = fs::remove_file(&key_path);
                return Err(anyhow::Error::new(e)
                    .context(format!("writing leaf key file {:?}", key_path)));
            }
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    /// Insert a leaf row without a key file. ACME-issued leaves keep their
    /// private key on the claimant's side.
    pub async fn insert_leaf_row_only(&self, leaf: NewLeaf) -> anyhow::Result<i64> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let id = insert_leaf_row(&tx, &leaf)?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    pub async fn get_leaf(&self, id: i64) -> anyhow::Result<Option<LeafCertificate>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, domain, not_after, created_at, pem, issuer_id, is_acme, is_ev, policy_oid
                 FROM certificates WHERE id = ?1",
                params![id],
                row_to_leaf,
            )
            .optional()
            .context("loading leaf certificate")
        })
        .await
    }

    pub async fn list_leaves(&self) -> anyhow::Result<Vec<LeafCertificate>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, domain, not_after, created_at, pem, issuer_id, is_acme, is_ev, policy_oid
                 FROM certificates ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], row_to_leaf)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Remove the row, its revocation record, and its key file. The row is
    /// authoritative, so a failed unlink is logged and swallowed.
    pub async fn delete_leaf(&self, id: i64) -> anyhow::Result<bool> {
        let data_dir = self.data_dir.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM certificates WHERE id = ?1", params![id])?;
            tx.execute("DELETE FROM revocations WHERE cert_id = ?1", params![id])?;
            tx.commit()?;
            if removed > 0 {
                unlink_quietly(&paths::leaf_key_path(&data_dir, id));
            }
            Ok(removed > 0)
        })
        .await
    }

    /// Record a revocation. Returns false when the leaf was already revoked.
    pub async fn revoke_leaf(&self, id: i64, revoked_at: String) -> anyhow::Result<bool> {
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO revocations (cert_id, revoked_at) VALUES (?1, ?2)",
                params![id, revoked_at],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    pub async fn get_revocation(&self, id: i64) -> anyhow::Result<Option<RevocationRecord>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT cert_id, revoked_at FROM revocations WHERE cert_id = ?1",
                params![id],
                |row| {
                    Ok(RevocationRecord {
                        leaf_id: row.get(0)?,
                        revoked_at: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("loading revocation record")
        })
        .await
    }

    /// Atomically revoke the old leaf, append a renewal event, and insert the
    /// replacement leaf with its key file. Returns `None` when the old leaf
    /// was already revoked.
    pub async fn renew_leaf_atomic(
        &self,
        old_id: i64,
        revoked_at: String,
        new_leaf: NewLeaf,
        key_pem: String,
    ) -> anyhow::Result<Option<i64>> {
        let data_dir = self.data_dir.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let revoked = tx.execute(
                "INSERT OR IGNORE INTO revocations (cert_id, revoked_at) VALUES (?1, ?2)",
                params![old_id, revoked_at],
            )?;
            if revoked == 0 {
                return Ok(None);
            }
            tx.execute(
                "INSERT INTO renewals (renewed_at) VALUES (?1)",
                params![new_leaf.created_at],
            )?;
            let id = insert_leaf_row(&tx, &new_leaf)?;
            let key_path = paths::leaf_key_path(&data_dir, id);
            if let Err(e) = fs::write(&key_path, &key_pem) {
                let _ = fs::remove_file(&key_path);
                return Err(anyhow::Error::new(e)
                    .context(format!("writing leaf key file {:?}", key_path)));
            }
            tx.commit()?;
            Ok(Some(id))
        })
        .await
    }

    pub async fn list_revoked_ids(&self) -> anyhow::Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT cert_id FROM revocations")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    pub async fn count_renewals(&self) -> anyhow::Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM renewals", [], |r| r.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    /// Most recent renewal events, newest first.
    pub async fn list_renewals(&self, limit: u32) -> anyhow::Result<Vec<RenewalEvent>> {
        let capped = limit.clamp(1, 500) as i64;
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT id, renewed_at FROM renewals ORDER BY id DESC LIMIT ?1")?;
            let rows = stmt
                .query_map(params![capped], |row| {
                    Ok(RenewalEvent {
                        id: row.get(0)?,
                        renewed_at: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    // ---- cascading CA deletes -------------------------------------------

    /// Delete a root and every descendant: intermediates below it, leaves
    /// issued by any of them, CA assignments pointing at them, and the
    /// active-CA config keys when they referenced a deleted id. File unlinks
    /// happen after the transaction commits; the rows are authoritative.
    pub async fn delete_root_cascade(&self, id: &str) -> anyhow::Result<Option<CascadeReport>> {
        let id = id.to_string();
        let data_dir = self.data_dir.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let exists: i64 =
                tx.query_row("SELECT COUNT(*) FROM cas WHERE id = ?1", params![id], |r| {
                    r.get(0)
                })?;
            if exists == 0 {
                return Ok(None);
            }

            let mut report = CascadeReport::default();
            {
                let mut stmt = tx.prepare("SELECT id FROM intermediates WHERE parent_id = ?1")?;
                report.intermediate_ids = stmt
                    .query_map(params![id], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
            }

            let mut issuer_ids = report.intermediate_ids.clone();
            issuer_ids.push(id.clone());
            for issuer in &issuer_ids {
                report
                    .leaf_ids
                    .extend(delete_leaves_by_issuer(&tx, issuer)?);
                tx.execute(
                    "DELETE FROM acme_ca_assignments WHERE ca_id = ?1",
                    params![issuer],
                )?;
            }
            tx.execute("DELETE FROM intermediates WHERE parent_id = ?1", params![id])?;
            tx.execute("DELETE FROM cas WHERE id = ?1", params![id])?;

            clear_config_if(&tx, config_keys::ACTIVE_CA_ID, &id)?;
            for intermediate in &report.intermediate_ids {
                clear_config_if(&tx, config_keys::ACTIVE_ACME_INTERMEDIATE_ID, intermediate)?;
            }
            tx.commit()?;

            for leaf_id in &report.leaf_ids {
                unlink_quietly(&paths::leaf_key_path(&data_dir, *leaf_id));
            }
            for intermediate in &report.intermediate_ids {
                unlink_quietly(&paths::intermediate_key_path(&data_dir, intermediate));
                unlink_quietly(&paths::intermediate_cert_path(&data_dir, intermediate));
            }
            unlink_quietly(&paths::root_key_path(&data_dir, &id));
            unlink_quietly(&paths::root_cert_path(&data_dir, &id));

            Ok(Some(report))
        })
        .await
    }

    /// Delete an intermediate, its leaves, its assignments, and its files.
    pub async fn delete_intermediate_cascade(
        &self,
        id: &str,
    ) -> anyhow::Result<Option<CascadeReport>> {
        let id = id.to_string();
        let data_dir = self.data_dir.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM intermediates WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )?;
            if exists == 0 {
                return Ok(None);
            }

            let mut report = CascadeReport::default();
            report.leaf_ids = delete_leaves_by_issuer(&tx, &id)?;
            tx.execute(
                "DELETE FROM acme_ca_assignments WHERE ca_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM intermediates WHERE id = ?1", params![id])?;
            clear_config_if(&tx, config_keys::ACTIVE_ACME_INTERMEDIATE_ID, &id)?;
            tx.commit()?;

            for leaf_id in &report.leaf_ids {
                unlink_quietly(&paths::leaf_key_path(&data_dir, *leaf_id));
            }
            unlink_quietly(&paths::intermediate_key_path(&data_dir, &id));
            unlink_quietly(&paths::intermediate_cert_path(&data_dir, &id));

            Ok(Some(report))
        })
        .await
    }

    // ---- config ---------------------------------------------------------

    pub async fn get_config(&self, key: &str) -> anyhow::Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("reading config key")
        })
        .await
    }

    pub async fn set_config(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_config(&self, key: &str) -> anyhow::Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM config WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    pub async fn active_ca_id(&self) -> anyhow::Result<Option<String>> {
        self.get_config(config_keys::ACTIVE_CA_ID).await
    }

    pub async fn active_acme_intermediate_id(&self) -> anyhow::Result<Option<String>> {
        self.get_config(config_keys::ACTIVE_ACME_INTERMEDIATE_ID)
            .await
    }

    pub async fn default_key_size(&self) -> anyhow::Result<u32> {
        Ok(self
            .get_config(config_keys::DEFAULT_KEY_SIZE)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(2048))
    }

    pub async fn default_validity_years(&self) -> anyhow::Result<u32> {
        Ok(self
            .get_config(config_keys::DEFAULT_VALIDITY_YEARS)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(10))
    }

    pub async fn default_validity_days(&self) -> anyhow::Result<u32> {
        Ok(self
            .get_config(config_keys::DEFAULT_VALIDITY_DAYS)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(365))
    }

    pub async fn default_hash_algorithm(&self) -> anyhow::Result<String> {
        Ok(self
            .get_config(config_keys::DEFAULT_HASH_ALGORITHM)
            .await?
            .unwrap_or_else(|| "sha256".to_string()))
    }

    pub async fn default_common_name_root(&self) -> anyhow::Result<String> {
        Ok(self
            .get_config(config_keys::DEFAULT_COMMON_NAME_ROOT)
            .await?
            .unwrap_or_else(|| "Meine CA".to_string()))
    }

    pub async fn default_common_name_intermediate(&self) -> anyhow::Result<String> {
        Ok(self
            .get_config(config_keys::DEFAULT_COMMON_NAME_INTERMEDIATE)
            .await?
            .unwrap_or_else(|| "Intermediate CA".to_string()))
    }

    // ---- ACME accounts / orders / authorizations / challenges -----------

    pub async fn insert_account(&self, account: AcmeAccount) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO acme_accounts (id, jwk, created_at) VALUES (?1, ?2, ?3)",
                params![account.account_id, account.jwk, account.created_at],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_account(&self, id: &str) -> anyhow::Result<Option<AcmeAccount>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, jwk, created_at FROM acme_accounts WHERE id = ?1",
                params![id],
                |row| {
                    Ok(AcmeAccount {
                        account_id: row.get(0)?,
                        jwk: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("loading ACME account")
        })
        .await
    }

    pub async fn insert_order(&self, order: AcmeOrder) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            let identifiers = serde_json::to_string(&order.identifiers)?;
            conn.execute(
                "INSERT INTO acme_orders
                   (id, account_id, identifiers, status, finalize_url, cert_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    order.order_id,
                    order.account_id,
                    identifiers,
                    order.status.as_str(),
                    order.finalize_url,
                    order.leaf_ref,
                    order.created_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_order(&self, id: &str) -> anyhow::Result<Option<AcmeOrder>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, account_id, identifiers, status, finalize_url, cert_id, created_at
                 FROM acme_orders WHERE id = ?1",
                params![id],
                row_to_order,
            )
            .optional()
            .context("loading ACME order")
        })
        .await
    }

    pub async fn set_order_status(&self, id: &str, status: OrderStatus) -> anyhow::Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE acme_orders SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    /// Link the finalized certificate and flip the order to `valid` in one
    /// statement.
    pub async fn set_order_certificate(&self, id: &str, cert_row: i64) -> anyhow::Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE acme_orders SET status = 'valid', cert_id = ?2 WHERE id = ?1",
                params![id, cert_row],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn insert_authorization(&self, authz: AcmeAuthorization) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO acme_authorizations (id, order_id, identifier, status)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    authz.authz_id,
                    authz.order_id,
                    authz.identifier,
                    authz.status.as_str()
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_authorization(&self, id: &str) -> anyhow::Result<Option<AcmeAuthorization>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, order_id, identifier, status FROM acme_authorizations WHERE id = ?1",
                params![id],
                row_to_authz,
            )
            .optional()
            .context("loading ACME authorization")
        })
        .await
    }

    pub async fn authorizations_for_order(
        &self,
        order_id: &str,
    ) -> anyhow::Result<Vec<AcmeAuthorization>> {
        let order_id = order_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, order_id, identifier, status
                 FROM acme_authorizations WHERE order_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![order_id], row_to_authz)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn set_authorization_status(
        &self,
        id: &str,
        status: AuthzStatus,
    ) -> anyhow::Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE acme_authorizations SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn insert_challenge(&self, challenge: AcmeChallenge) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO acme_challenges
                   (id, authz_id, type, token, key_authorization, status, accepted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    challenge.challenge_id,
                    challenge.authz_id,
                    challenge.kind,
                    challenge.token,
                    challenge.key_authorization,
                    challenge.status.as_str(),
                    challenge.accepted_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_challenge(&self, id: &str) -> anyhow::Result<Option<AcmeChallenge>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, authz_id, type, token, key_authorization, status, accepted_at
                 FROM acme_challenges WHERE id = ?1",
                params![id],
                row_to_challenge,
            )
            .optional()
            .context("loading ACME challenge")
        })
        .await
    }

    pub async fn get_challenge_by_token(
        &self,
        token: &str,
    ) -> anyhow::Result<Option<AcmeChallenge>> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, authz_id, type, token, key_authorization, status, accepted_at
                 FROM acme_challenges WHERE token = ?1",
                params![token],
                row_to_challenge,
            )
            .optional()
            .context("loading ACME challenge by token")
        })
        .await
    }

    pub async fn challenges_for_authorization(
        &self,
        authz_id: &str,
    ) -> anyhow::Result<Vec<AcmeChallenge>> {
        let authz_id = authz_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, authz_id, type, token, key_authorization, status, accepted_at
                 FROM acme_challenges WHERE authz_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![authz_id], row_to_challenge)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn set_challenge_status(
        &self,
        id: &str,
        status: AuthzStatus,
        accepted_at: Option<String>,
    ) -> anyhow::Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            match accepted_at {
                Some(at) => conn.execute(
                    "UPDATE acme_challenges SET status = ?2, accepted_at = ?3 WHERE id = ?1",
                    params![id, status.as_str(), at],
                )?,
                None => conn.execute(
                    "UPDATE acme_challenges SET status = ?2 WHERE id = ?1",
                    params![id, status.as_str()],
                )?,
            };
            Ok(())
        })
        .await
    }

    /// Pending challenges joined with their authorization identifier, for the
    /// summary view and validator recovery after a restart.
    pub async fn pending_challenges(&self) -> anyhow::Result<Vec<(AcmeChallenge, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.authz_id, c.type, c.token, c.key_authorization, c.status,
                        c.accepted_at, a.identifier
                 FROM acme_challenges c
                 JOIN acme_authorizations a ON a.id = c.authz_id
                 WHERE c.status = 'pending' ORDER BY c.id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row_to_challenge(row)?, row.get::<_, String>(7)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    // ---- ACME-issued certificates ---------------------------------------

    pub async fn insert_acme_certificate(
        &self,
        order_id: &str,
        pem: &str,
        created_at: &str,
    ) -> anyhow::Result<i64> {
        let order_id = order_id.to_string();
        let pem = pem.to_string();
        let created_at = created_at.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO acme_certificates (order_id, pem, created_at) VALUES (?1, ?2, ?3)",
                params![order_id, pem, created_at],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn acme_certificate_for_order(
        &self,
        order_id: &str,
    ) -> anyhow::Result<Option<String>> {
        let order_id = order_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT pem FROM acme_certificates WHERE order_id = ?1
                 ORDER BY id DESC LIMIT 1",
                params![order_id],
                |row| row.get(0),
            )
            .optional()
            .context("loading ACME certificate")
        })
        .await
    }

    // ---- legacy challenges ----------------------------------------------

    pub async fn upsert_legacy_challenge(
        &self,
        token: &str,
        key_authorization: &str,
        created_at: &str,
    ) -> anyhow::Result<()> {
        let token = token.to_string();
        let key_authorization = key_authorization.to_string();
        let created_at = created_at.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO legacy_challenges (token, key_authorization, created_at)
                 VALUES (?1, ?2, ?3)",
                params![token, key_authorization, created_at],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_legacy_challenge(&self, token: &str) -> anyhow::Result<Option<String>> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT key_authorization FROM legacy_challenges WHERE token = ?1",
                params![token],
                |row| row.get(0),
            )
            .optional()
            .context("loading legacy challenge")
        })
        .await
    }

    // ---- whitelist & CA assignments -------------------------------------

    pub async fn list_whitelist(&self) -> anyhow::Result<Vec<WhitelistEntry>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, domain_pattern FROM acme_whitelist ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(WhitelistEntry {
                        id: row.get(0)?,
                        domain_pattern: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Returns the new entry id, or `None` when the pattern already exists.
    pub async fn insert_whitelist(&self, pattern: &str) -> anyhow::Result<Option<i64>> {
        let pattern = pattern.to_string();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO acme_whitelist (domain_pattern) VALUES (?1)",
                params![pattern],
            )?;
            if inserted == 0 {
                Ok(None)
            } else {
                Ok(Some(conn.last_insert_rowid()))
            }
        })
        .await
    }

    pub async fn delete_whitelist(&self, id: i64) -> anyhow::Result<bool> {
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM acme_whitelist WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
        .await
    }

    pub async fn list_assignments(&self) -> anyhow::Result<Vec<CaAssignment>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, domain_pattern, ca_id FROM acme_ca_assignments ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(CaAssignment {
                        id: row.get(0)?,
                        domain_pattern: row.get(1)?,
                        ca_id: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn insert_assignment(
        &self,
        pattern: &str,
        ca_id: &str,
    ) -> anyhow::Result<Option<i64>> {
        let pattern = pattern.to_string();
        let ca_id = ca_id.to_string();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO acme_ca_assignments (domain_pattern, ca_id) VALUES (?1, ?2)",
                params![pattern, ca_id],
            )?;
            if inserted == 0 {
                Ok(None)
            } else {
                Ok(Some(conn.last_insert_rowid()))
            }
        })
        .await
    }

    pub async fn delete_assignment(&self, id: i64) -> anyhow::Result<bool> {
        self.with_conn(move |conn| {
            let removed =
                conn.execute("DELETE FROM acme_ca_assignments WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
        .await
    }
}

// ---- schema --------------------------------------------------------------

/// Idempotent migrations: `CREATE TABLE IF NOT EXISTS` plus additive column
/// checks. Never destructive.
pub fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cas (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            common_name TEXT NOT NULL,
            not_after TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS intermediates (
            id TEXT PRIMARY KEY,
            parent_id TEXT NOT NULL,
            name TEXT NOT NULL,
            common_name TEXT NOT NULL,
            not_after TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS certificates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            domain TEXT NOT NULL,
            not_after TEXT NOT NULL,
            created_at TEXT NOT NULL,
            pem TEXT NOT NULL,
            issuer_id TEXT,
            is_acme INTEGER NOT NULL DEFAULT 0,
            is_ev INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_certificates_issuer
            ON certificates(issuer_id);
        CREATE TABLE IF NOT EXISTS revocations (
            cert_id INTEGER PRIMARY KEY,
            revoked_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS renewals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            renewed_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS acme_accounts (
            id TEXT PRIMARY KEY,
            jwk TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS acme_orders (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            identifiers TEXT NOT NULL,
            status TEXT NOT NULL,
            finalize_url TEXT NOT NULL,
            cert_id INTEGER,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS acme_authorizations (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            identifier TEXT NOT NULL,
            status TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_acme_authorizations_order
            ON acme_authorizations(order_id);
        CREATE TABLE IF NOT EXISTS acme_challenges (
            id TEXT PRIMARY KEY,
            authz_id TEXT NOT NULL,
            type TEXT NOT NULL,
            token TEXT NOT NULL,
            key_authorization TEXT NOT NULL,
            status TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_acme_challenges_token
            ON acme_challenges(token);
        CREATE TABLE IF NOT EXISTS acme_certificates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id TEXT NOT NULL,
            pem TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS legacy_challenges (
            token TEXT PRIMARY KEY,
            key_authorization TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS acme_whitelist (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            domain_pattern TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS acme_ca_assignments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            domain_pattern TEXT NOT NULL UNIQUE,
            ca_id TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )
    .context("running schema migrations")?;

    // Columns added after the initial schema shipped.
    ensure_column(conn, "certificates", "policy_oid", "TEXT")?;
    ensure_column(conn, "acme_challenges", "accepted_at", "TEXT")?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, ddl: &str) -> anyhow::Result<()> {
    let present: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )?;
    if present == 0 {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl};"))
            .with_context(|| format!("adding column {table}.{column}"))?;
    }
    Ok(())
}

// ---- row mapping ----------------------------------------------------------

fn row_to_root(row: &rusqlite::Row<'_>) -> rusqlite::Result<RootCa> {
    Ok(RootCa {
        id: row.get(0)?,
        display_name: row.get(1)?,
        common_name: row.get(2)?,
        not_after: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_intermediate(row: &rusqlite::Row<'_>) -> rusqlite::Result<IntermediateCa> {
    Ok(IntermediateCa {
        id: row.get(0)?,
        parent_root_id: row.get(1)?,
        display_name: row.get(2)?,
        common_name: row.get(3)?,
        not_after: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn row_to_leaf(row: &rusqlite::Row<'_>) -> rusqlite::Result<LeafCertificate> {
    Ok(LeafCertificate {
        id: row.get(0)?,
        domain: row.get(1)?,
        not_after: row.get(2)?,
        created_at: row.get(3)?,
        pem: row.get(4)?,
        issuer_id: row.get(5)?,
        is_acme: row.get::<_, i64>(6)? != 0,
        is_ev: row.get::<_, i64>(7)? != 0,
        policy_oid: row.get(8)?,
    })
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<AcmeOrder> {
    let identifiers_json: String = row.get(2)?;
    let identifiers: Vec<AcmeIdentifier> =
        serde_json::from_str(&identifiers_json).unwrap_or_default();
    let status: String = row.get(3)?;
    Ok(AcmeOrder {
        order_id: row.get(0)?,
        account_id: row.get(1)?,
        identifiers,
        status: OrderStatus::from_str_lossy(&status),
        finalize_url: row.get(4)?,
        leaf_ref: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_authz(row: &rusqlite::Row<'_>) -> rusqlite::Result<AcmeAuthorization> {
    let status: String = row.get(3)?;
    Ok(AcmeAuthorization {
        authz_id: row.get(0)?,
        order_id: row.get(1)?,
        identifier: row.get(2)?,
        status: AuthzStatus::from_str_lossy(&status),
    })
}

fn row_to_challenge(row: &rusqlite::Row<'_>) -> rusqlite::Result<AcmeChallenge> {
    let status: String = row.get(5)?;
    Ok(AcmeChallenge {
        challenge_id: row.get(0)?,
        authz_id: row.get(1)?,
        kind: row.get(2)?,
        token: row.get(3)?,
        key_authorization: row.get(4)?,
        status: AuthzStatus::from_str_lossy(&status),
        accepted_at: row.get(6)?,
    })
}

fn insert_leaf_row(tx: &Transaction<'_>, leaf: &NewLeaf) -> anyhow::Result<i64> {
    tx.execute(
        "INSERT INTO certificates
           (domain, not_after, created_at, pem, issuer_id, is_acme, is_ev, policy_oid)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            leaf.domain,
            leaf.not_after,
            leaf.created_at,
            leaf.pem,
            leaf.issuer_id,
            leaf.is_acme as i64,
            leaf.is_ev as i64,
            leaf.policy_oid
        ],
    )
    .context("inserting leaf certificate row")?;
    Ok(tx.last_insert_rowid())
}

fn delete_leaves_by_issuer(tx: &Transaction<'_>, issuer_id: &str) -> anyhow::Result<Vec<i64>> {
    let ids = {
        let mut stmt = tx.prepare("SELECT id FROM certificates WHERE issuer_id = ?1")?;
        let rows = stmt
            .query_map(params![issuer_id], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    for id in &ids {
        tx.execute("DELETE FROM revocations WHERE cert_id = ?1", params![id])?;
    }
    tx.execute(
        "DELETE FROM certificates WHERE issuer_id = ?1",
        params![issuer_id],
    )?;
    Ok(ids)
}

fn clear_config_if(tx: &Transaction<'_>, key: &str, value: &str) -> anyhow::Result<()> {
    tx.execute(
        "DELETE FROM config WHERE key = ?1 AND value = ?2",
        params![key, value],
    )?;
    Ok(())
}

fn unlink_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_store(dir: &Path) -> Store {
        Store::open(&dir.join("test.sqlite"), dir).expect("store opens")
    }

    fn sample_leaf(domain: &str, issuer: Option<&str>) -> NewLeaf {
        NewLeaf {
            domain: domain.to_string(),
            not_after: "2031-01-01T00:00:00+00:00".to_string(),
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            pem: "-----BEGIN CERTIFICATE-----\nMAo=\n-----END CERTIFICATE-----\n".to_string(),
            issuer_id: issuer.map(|s| s.to_string()),
            is_acme: false,
            is_ev: false,
            policy_oid: None,
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.sqlite");
        {
            let conn = Connection::open(&db_path).unwrap();
            run_migrations(&conn).unwrap();
            run_migrations(&conn).unwrap();
        }
        // A second open runs them a third time on the same file.
        let store = Store::open(&db_path, dir.path()).unwrap();
        assert!(store.list_roots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leaf_ids_are_monotonic() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let a = store
            .insert_leaf_with_key(sample_leaf("a.example.com", None), "key-a".into())
            .await
            .unwrap();
        let b = store
            .insert_leaf_with_key(sample_leaf("b.example.com", None), "key-b".into())
            .await
            .unwrap();
        assert!(b > a);
        assert!(paths::leaf_key_path(dir.path(), a).exists());
        assert!(paths::leaf_key_path(dir.path(), b).exists());
    }

    #[tokio::test]
    async fn revocation_is_terminal() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let id = store
            .insert_leaf_with_key(sample_leaf("r.example.com", None), "key".into())
            .await
            .unwrap();
        assert!(store
            .revoke_leaf(id, "2026-02-01T00:00:00+00:00".into())
            .await
            .unwrap());
        assert!(!store
            .revoke_leaf(id, "2026-02-02T00:00:00+00:00".into())
            .await
            .unwrap());
        let record = store.get_revocation(id).await.unwrap().unwrap();
        assert_eq!(record.revoked_at, "2026-02-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn renew_refuses_revoked_leaf() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let id = store
            .insert_leaf_with_key(sample_leaf("w.example.com", None), "key".into())
            .await
            .unwrap();
        store.revoke_leaf(id, "2026-01-02T00:00:00+00:00".into()).await.unwrap();
        let renewed = store
            .renew_leaf_atomic(
                id,
                "2026-01-03T00:00:00+00:00".into(),
                sample_leaf("w.example.com", None),
                "new-key".into(),
            )
            .await
            .unwrap();
        assert!(renewed.is_none());
        assert_eq!(store.count_renewals().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn root_cascade_removes_descendants_and_files() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store
            .insert_root(RootCa {
                id: "r".into(),
                display_name: "R".into(),
                common_name: "R".into(),
                not_after: "2036-01-01T00:00:00+00:00".into(),
                created_at: "2026-01-01T00:00:00+00:00".into(),
            })
            .await
            .unwrap();
        store
            .insert_intermediate(IntermediateCa {
                id: "i".into(),
                parent_root_id: "r".into(),
                display_name: "I".into(),
                common_name: "I".into(),
                not_after: "2031-01-01T00:00:00+00:00".into(),
                created_at: "2026-01-01T00:00:00+00:00".into(),
            })
            .await
            .unwrap();
        let leaf_id = store
            .insert_leaf_with_key(sample_leaf("x.example.com", Some("i")), "key".into())
            .await
            .unwrap();
        store
            .set_config(config_keys::ACTIVE_CA_ID, "r")
            .await
            .unwrap();
        store.insert_assignment("*.example.com", "i").await.unwrap();

        let report = store.delete_root_cascade("r").await.unwrap().unwrap();
        assert_eq!(report.intermediate_ids, vec!["i".to_string()]);
        assert_eq!(report.leaf_ids, vec![leaf_id]);
        assert!(store.get_root("r").await.unwrap().is_none());
        assert!(store.get_intermediate("i").await.unwrap().is_none());
        assert!(store.get_leaf(leaf_id).await.unwrap().is_none());
        assert!(store.list_assignments().await.unwrap().is_empty());
        assert!(store.active_ca_id().await.unwrap().is_none());
        assert!(!paths::leaf_key_path(dir.path(), leaf_id).exists());
    }

    #[tokio::test]
    async fn config_defaults_apply_when_unset() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        assert_eq!(store.default_key_size().await.unwrap(), 2048);
        assert_eq!(store.default_validity_years().await.unwrap(), 10);
        assert_eq!(store.default_validity_days().await.unwrap(), 365);
        assert_eq!(store.default_hash_algorithm().await.unwrap(), "sha256");
        assert_eq!(store.default_common_name_root().await.unwrap(), "Meine CA");

        store
            .set_config(config_keys::DEFAULT_VALIDITY_DAYS, "90")
            .await
            .unwrap();
        assert_eq!(store.default_validity_days().await.unwrap(), 90);
    }

    #[tokio::test]
    async fn whitelist_rejects_duplicates() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        assert!(store
            .insert_whitelist("*.example.com")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .insert_whitelist("*.example.com")
            .await
            .unwrap()
            .is_none());
    }
}
