//! ACME wire protocol handlers and the order state machine.
//!
//! Authenticated POSTs are dispatched by the `url` claim of the verified
//! protected header rather than by request path, so a JWS signed for one
//! resource can never drive another.

use std::sync::Arc;

use chrono::Utc;
use http::StatusCode;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AcmeErrorType, ApiError};
use crate::models::{
    domain_matches_pattern, AcmeAccount, AcmeAuthorization, AcmeChallenge, AcmeIdentifier,
    AcmeOrder, AuthzStatus, OrderStatus,
};
use crate::pki::{self, LeafBuildOptions};
use crate::registry::CaRegistry;
use crate::server::response::ApiResponse;
use crate::storage::{NewLeaf, Store};

use super::jws::{
    account_id_from_kid, decode_base64url, decode_protected_header, jwk_thumbprint,
    parse_flattened_jws, random_token, verify_rs256,
};
use super::validator::{mark_challenge_valid, probe_key_authorization, ChallengeValidator};

/// Leaves issued through finalize are valid for one year.
const ACME_LEAF_VALIDITY_DAYS: u32 = 365;

pub struct AcmeServer {
    store: Arc<Store>,
    registry: CaRegistry,
    validator: Arc<ChallengeValidator>,
    client: reqwest::Client,
    base_url: String,
}

impl AcmeServer {
    pub fn new(
        store: Arc<Store>,
        registry: CaRegistry,
        validator: Arc<ChallengeValidator>,
        base_url: String,
    ) -> Self {
        Self {
            store,
            registry,
            validator,
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Replay nonces are issued per response and accepted unchecked; this
    /// core deliberately skips anti-replay enforcement.
    pub fn fresh_nonce(&self) -> String {
        random_token()
    }

    pub fn directory(&self) -> Value {
        json!({
            "newNonce": self.url("/acme/new-nonce"),
            "newAccount": self.url("/acme/new-account"),
            "newOrder": self.url("/acme/new-order"),
        })
    }

    // ---- authenticated POST dispatch ------------------------------------

    /// Verify the flattened JWS body and dispatch by its `url` claim.
    pub async fn handle_post(&self, body: &[u8]) -> Result<ApiResponse, ApiError> {
        let jws = parse_flattened_jws(body)?;
        let header = decode_protected_header(&jws.protected)?;

        if !header.alg.eq_ignore_ascii_case("RS256") {
            return Err(ApiError::acme(
                AcmeErrorType::Malformed,
                format!("unsupported JWS algorithm {:?}; only RS256", header.alg),
            ));
        }

        let (jwk, account_id) = match (&header.jwk, &header.kid) {
            (Some(jwk), _) => (jwk.clone(), None),
            (None, Some(kid)) => {
                let account_id = account_id_from_kid(kid).ok_or_else(|| {
                    ApiError::acme(AcmeErrorType::Malformed, "kid carries no account id")
                })?;
                let account = self
                    .store
                    .get_account(&account_id)
                    .await?
                    .ok_or_else(|| {
                        ApiError::acme(
                            AcmeErrorType::AccountDoesNotExist,
                            format!("unknown account {account_id:?}"),
                        )
                    })?;
                let jwk: Value = serde_json::from_str(&account.jwk)
                    .map_err(|e| ApiError::Internal(anyhow::anyhow!("stored JWK corrupt: {e}")))?;
                (jwk, Some(account_id))
            }
            (None, None) => {
                return Err(ApiError::acme(
                    AcmeErrorType::Malformed,
                    "protected header carries neither jwk nor kid",
                ))
            }
        };

        let signing_input = format!("{}.{}", jws.protected, jws.payload);
        let signature = decode_base64url(&jws.signature)?;
        verify_rs256(&jwk, signing_input.as_bytes(), &signature)?;

        let payload = if jws.payload.is_empty() {
            Vec::new()
        } else {
            decode_base64url(&jws.payload)?
        };

        let url = header
            .url
            .clone()
            .ok_or_else(|| ApiError::acme(AcmeErrorType::Malformed, "protected header lacks url"))?;
        let path = url
            .find("/acme/")
            .map(|idx| url[idx..].to_string())
            .ok_or_else(|| {
                ApiError::acme(AcmeErrorType::Malformed, format!("foreign url claim {url:?}"))
            })?;

        let response = if path == "/acme/new-account" {
            self.new_account(&jwk).await?
        } else if path == "/acme/new-order" {
            let account_id = account_id.ok_or_else(|| {
                ApiError::acme(AcmeErrorType::Malformed, "new-order requires a kid")
            })?;
            self.new_order(&account_id, &jwk, &payload).await?
        } else if let Some(challenge_id) = path.strip_prefix("/acme/chall/") {
            self.challenge_post(challenge_id).await?
        } else if let Some(order_id) = path.strip_prefix("/acme/finalize/") {
            let account_id = account_id.ok_or_else(|| {
                ApiError::acme(AcmeErrorType::Malformed, "finalize requires a kid")
            })?;
            self.finalize(order_id, &account_id, &payload).await?
        } else {
            return Err(ApiError::acme(
                AcmeErrorType::Malformed,
                format!("unknown resource url {url:?}"),
            ));
        };
        Ok(response.with_header("replay-nonce", self.fresh_nonce()))
    }

    // ---- handlers --------------------------------------------------------

    async fn new_account(&self, jwk: &Value) -> Result<ApiResponse, ApiError> {
        let account_id = format!("acct-{}", Uuid::new_v4().simple());
        self.store
            .insert_account(AcmeAccount {
                account_id: account_id.clone(),
                jwk: jwk.to_string(),
                created_at: Utc::now().to_rfc3339(),
            })
            .await?;
        tracing::info!("ACME account {} registered", account_id);

        let body = json!({ "status": "valid", "orders": [] });
        Ok(ApiResponse::json(StatusCode::CREATED, &body)
            .with_header("location", self.url(&format!("/acme/account/{account_id}"))))
    }

    async fn new_order(
        &self,
        account_id: &str,
        jwk: &Value,
        payload: &[u8],
    ) -> Result<ApiResponse, ApiError> {
        #[derive(serde::Deserialize)]
        struct NewOrderPayload {
            identifiers: Vec<AcmeIdentifier>,
        }
        let payload: NewOrderPayload = serde_json::from_slice(payload)
            .map_err(|e| ApiError::acme(AcmeErrorType::Malformed, format!("bad payload: {e}")))?;
        if payload.identifiers.is_empty() {
            return Err(ApiError::acme(
                AcmeErrorType::Malformed,
                "order needs at least one identifier",
            ));
        }
        let mut identifiers = Vec::with_capacity(payload.identifiers.len());
        for identifier in &payload.identifiers {
            if identifier.kind != "dns" || identifier.value.trim().is_empty() {
                return Err(ApiError::acme(
                    AcmeErrorType::Malformed,
                    "only non-empty dns identifiers are supported",
                ));
            }
            identifiers.push(AcmeIdentifier {
                kind: "dns".to_string(),
                value: identifier.value.trim().to_ascii_lowercase(),
            });
        }

        let order_id = format!("order-{}", Uuid::new_v4().simple());
        let finalize_url = self.url(&format!("/acme/finalize/{order_id}"));
        let thumbprint = jwk_thumbprint(jwk)?;
        let whitelist = self.store.list_whitelist().await?;

        self.store
            .insert_order(AcmeOrder {
                order_id: order_id.clone(),
                account_id: account_id.to_string(),
                identifiers: identifiers.clone(),
                status: OrderStatus::Pending,
                finalize_url: finalize_url.clone(),
                leaf_ref: None,
                created_at: Utc::now().to_rfc3339(),
            })
            .await?;

        let mut authz_urls = Vec::with_capacity(identifiers.len());
        for identifier in &identifiers {
            let authz_id = format!("authz-{}", Uuid::new_v4().simple());
            let challenge_id = format!("chall-{}", Uuid::new_v4().simple());
            let token = random_token();
            let key_authorization = format!("{token}.{thumbprint}");

            let whitelisted = whitelist
                .iter()
                .any(|entry| domain_matches_pattern(&identifier.value, &entry.domain_pattern));
            let status = if whitelisted {
                AuthzStatus::Valid
            } else {
                AuthzStatus::Pending
            };

            self.store
                .insert_authorization(AcmeAuthorization {
                    authz_id: authz_id.clone(),
                    order_id: order_id.clone(),
                    identifier: identifier.value.clone(),
                    status,
                })
                .await?;
            self.store
                .insert_challenge(AcmeChallenge {
                    challenge_id: challenge_id.clone(),
                    authz_id: authz_id.clone(),
                    kind: "http-01".to_string(),
                    token: token.clone(),
                    key_authorization,
                    status,
                    accepted_at: None,
                })
                .await?;
            if !whitelisted {
                self.validator
                    .register(&challenge_id, &identifier.value, &token);
            }
            authz_urls.push(self.url(&format!("/acme/authz/{authz_id}")));
        }
        tracing::info!(
            "order {} created with {} identifier(s)",
            order_id,
            identifiers.len()
        );

        let body = json!({
            "status": "pending",
            "identifiers": identifiers,
            "authorizations": authz_urls,
            "finalize": finalize_url,
        });
        Ok(ApiResponse::json(StatusCode::CREATED, &body)
            .with_header("location", self.url(&format!("/acme/order/{order_id}"))))
    }

    /// Synchronous probe in addition to the background validator.
    async fn challenge_post(&self, challenge_id: &str) -> Result<ApiResponse, ApiError> {
        let challenge = self
            .store
            .get_challenge(challenge_id)
            .await?
            .ok_or_else(|| {
                ApiError::acme_with_status(
                    AcmeErrorType::Malformed,
                    404,
                    format!("unknown challenge {challenge_id:?}"),
                )
            })?;
        if challenge.status == AuthzStatus::Pending {
            let authz = self
                .store
                .get_authorization(&challenge.authz_id)
                .await?
                .ok_or_else(|| {
                    ApiError::Internal(anyhow::anyhow!("challenge without authorization"))
                })?;
            let body = probe_key_authorization(&self.client, &authz.identifier, &challenge.token)
                .await
                .unwrap_or_default();
            if body.trim() == challenge.key_authorization {
                mark_challenge_valid(&self.store, &challenge, None).await?;
                self.validator.remove(challenge_id);
            } else {
                return Err(ApiError::acme(
                    AcmeErrorType::IncorrectResponse,
                    format!("claimant did not serve the key authorization for {:?}", authz.identifier),
                ));
            }
        }
        let challenge = self
            .store
            .get_challenge(challenge_id)
            .await?
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("challenge vanished")))?;
        Ok(ApiResponse::ok_json(&self.challenge_json(&challenge)))
    }

    async fn finalize(
        &self,
        order_id: &str,
        account_id: &str,
        payload: &[u8],
    ) -> Result<ApiResponse, ApiError> {
        let order = self.store.get_order(order_id).await?.ok_or_else(|| {
            ApiError::acme_with_status(
                AcmeErrorType::Malformed,
                404,
                format!("unknown order {order_id:?}"),
            )
        })?;
        if order.account_id != account_id {
            return Err(ApiError::Unauthorized(
                "order belongs to a different account".into(),
            ));
        }

        let authorizations = self.store.authorizations_for_order(order_id).await?;
        if authorizations
            .iter()
            .any(|authz| authz.status != AuthzStatus::Valid)
        {
            return Err(ApiError::acme(
                AcmeErrorType::Malformed,
                "order has authorizations that are not valid yet",
            ));
        }

        #[derive(serde::Deserialize)]
        struct FinalizePayload {
            csr: String,
        }
        let payload: FinalizePayload = serde_json::from_slice(payload)
            .map_err(|e| ApiError::acme(AcmeErrorType::Malformed, format!("bad payload: {e}")))?;
        let csr_der = decode_base64url(&payload.csr)?;
        let csr = pki::parse_csr(&csr_der)?;

        let primary = order
            .identifiers
            .first()
            .map(|i| i.value.clone())
            .ok_or_else(|| ApiError::acme(AcmeErrorType::Malformed, "order has no identifiers"))?;
        let signer_id = self
            .registry
            .ca_for_acme_domain(&primary)
            .await?
            .ok_or_else(|| {
                ApiError::acme_with_status(
                    AcmeErrorType::ServerInternal,
                    503,
                    "no issuing CA configured for ACME",
                )
            })?;
        let signer = self.registry.resolve_signer(&signer_id).await?;

        let mut san_dns = Vec::new();
        for identifier in &order.identifiers {
            if !san_dns.contains(&identifier.value) {
                san_dns.push(identifier.value.clone());
            }
        }
        let (cert, not_after) = pki::issue_from_csr(
            csr,
            &signer.cert,
            &signer.key,
            &LeafBuildOptions {
                subject_cn: primary.clone(),
                san_dns,
                validity_days: ACME_LEAF_VALIDITY_DAYS,
                ev_policy_oid: None,
            },
        )?;

        let leaf_pem = cert.pem();
        let mut chain = leaf_pem.clone();
        if !chain.ends_with('\n') {
            chain.push('\n');
        }
        chain.push_str(&signer.cert_pem);

        let now = Utc::now().to_rfc3339();
        let cert_row = self
            .store
            .insert_acme_certificate(order_id, &chain, &now)
            .await?;
        for identifier in &order.identifiers {
            self.store
                .insert_leaf_row_only(NewLeaf {
                    domain: identifier.value.clone(),
                    not_after: not_after.clone(),
                    created_at: now.clone(),
                    pem: leaf_pem.clone(),
                    issuer_id: Some(signer.id.clone()),
                    is_acme: true,
                    is_ev: false,
                    policy_oid: None,
                })
                .await?;
        }
        self.store.set_order_certificate(order_id, cert_row).await?;
        tracing::info!("order {} finalized under {}", order_id, signer.id);

        let body = json!({
            "status": "valid",
            "identifiers": order.identifiers,
            "finalize": order.finalize_url,
            "certificate": self.url(&format!("/acme/cert/{order_id}")),
        });
        Ok(ApiResponse::ok_json(&body))
    }

    // ---- unauthenticated GETs -------------------------------------------

    pub async fn authorization_json(&self, authz_id: &str) -> Result<ApiResponse, ApiError> {
        let authz = self
            .store
            .get_authorization(authz_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("no authorization {authz_id:?}")))?;
        let challenges = self
            .store
            .challenges_for_authorization(authz_id)
            .await?
            .iter()
            .map(|c| self.challenge_json(c))
            .collect::<Vec<_>>();
        let body = json!({
            "identifier": { "type": "dns", "value": authz.identifier },
            "status": authz.status,
            "challenges": challenges,
        });
        Ok(ApiResponse::ok_json(&body).with_header("replay-nonce", self.fresh_nonce()))
    }

    /// Order status polling between challenge validation and finalize.
    pub async fn order_json(&self, order_id: &str) -> Result<ApiResponse, ApiError> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("no order {order_id:?}")))?;
        let authz_urls = self
            .store
            .authorizations_for_order(order_id)
            .await?
            .iter()
            .map(|authz| self.url(&format!("/acme/authz/{}", authz.authz_id)))
            .collect::<Vec<_>>();
        let mut body = json!({
            "status": order.status,
            "identifiers": order.identifiers,
            "authorizations": authz_urls,
            "finalize": order.finalize_url,
        });
        if order.status == OrderStatus::Valid && order.leaf_ref.is_some() {
            body["certificate"] = json!(self.url(&format!("/acme/cert/{order_id}")));
        }
        Ok(ApiResponse::ok_json(&body).with_header("replay-nonce", self.fresh_nonce()))
    }

    pub async fn certificate_chain(&self, order_id: &str) -> Result<ApiResponse, ApiError> {
        let pem = self
            .store
            .acme_certificate_for_order(order_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("no certificate for order {order_id:?}")))?;
        Ok(ApiResponse::pem_chain(pem))
    }

    /// Token lookup for `/.well-known/acme-challenge/{token}`: the ACME
    /// challenge table is consulted first, then the legacy table.
    pub async fn well_known_lookup(&self, token: &str) -> Result<ApiResponse, ApiError> {
        if let Some(challenge) = self.store.get_challenge_by_token(token).await? {
            return Ok(ApiResponse::text(
                StatusCode::OK,
                challenge.key_authorization,
            ));
        }
        if let Some(key_authorization) = self.store.get_legacy_challenge(token).await? {
            return Ok(ApiResponse::text(StatusCode::OK, key_authorization));
        }
        Err(ApiError::NotFound(format!("unknown token {token:?}")))
    }

    /// Operator override: force a pending authorization (and its challenge)
    /// to valid and drop any validator entry.
    pub async fn accept_authorization(&self, authz_id: &str) -> Result<(), ApiError> {
        let authz = self
            .store
            .get_authorization(authz_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("no authorization {authz_id:?}")))?;
        let challenges = self.store.challenges_for_authorization(authz_id).await?;
        let accepted_at = Utc::now().to_rfc3339();
        for challenge in &challenges {
            mark_challenge_valid(&self.store, challenge, Some(accepted_at.clone())).await?;
            self.validator.remove(&challenge.challenge_id);
        }
        if challenges.is_empty() {
            // No challenge rows: still flip the authorization itself.
            self.store
                .set_authorization_status(&authz.authz_id, AuthzStatus::Valid)
                .await?;
        }
        tracing::info!("authorization {} manually accepted", authz_id);
        Ok(())
    }

    fn challenge_json(&self, challenge: &AcmeChallenge) -> Value {
        json!({
            "type": challenge.kind,
            "url": self.url(&format!("/acme/chall/{}", challenge.challenge_id)),
            "token": challenge.token,
            "status": challenge.status,
            "acceptedAt": challenge.accepted_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::jws::testutil;
    use super::*;
    use crate::models::CaOptions;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use rsa::RsaPrivateKey;
    use tempfile::tempdir;

    struct Harness {
        server: AcmeServer,
        key: RsaPrivateKey,
        jwk: Value,
        _dir: tempfile::TempDir,
    }

    const BASE: &str = "http://localhost:8420";

    async fn harness(with_root: bool) -> Harness {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("test.sqlite"), dir.path()).unwrap());
        let registry = CaRegistry::new(Arc::clone(&store));
        if with_root {
            registry
                .create_root(
                    "Acme Root",
                    CaOptions {
                        validity_years: Some(2),
                        key_size: Some(2048),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let validator = Arc::new(ChallengeValidator::new(Arc::clone(&store)));
        let server = AcmeServer::new(store, registry, validator, BASE.to_string());
        let key = testutil::test_rsa_key();
        let jwk = testutil::jwk_for(&key);
        Harness {
            server,
            key,
            jwk,
            _dir: dir,
        }
    }

    async fn register_account(h: &Harness) -> String {
        let body = testutil::flattened_jws(
            &h.key,
            &json!({"alg": "RS256", "jwk": h.jwk, "url": format!("{BASE}/acme/new-account"), "nonce": "n"}),
            &json!({"termsOfServiceAgreed": true}),
        );
        let response = h.server.handle_post(&body).await.unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        let location = response
            .headers
            .iter()
            .find(|(name, _)| *name == "location")
            .map(|(_, value)| value.clone())
            .expect("location header");
        account_id_from_kid(&location).unwrap()
    }

    async fn create_order(h: &Harness, account_id: &str, domains: &[&str]) -> Value {
        let identifiers: Vec<Value> = domains
            .iter()
            .map(|d| json!({"type": "dns", "value": d}))
            .collect();
        let body = testutil::flattened_jws(
            &h.key,
            &json!({
                "alg": "RS256",
                "kid": format!("{BASE}/acme/account/{account_id}"),
                "url": format!("{BASE}/acme/new-order"),
                "nonce": "n",
            }),
            &json!({"identifiers": identifiers}),
        );
        let response = h.server.handle_post(&body).await.unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        response.body_json()
    }

    fn authz_id_from_url(url: &str) -> String {
        url.rsplit('/').next().unwrap().to_string()
    }

    #[tokio::test]
    async fn directory_lists_entry_points() {
        let h = harness(false).await;
        let dir = h.server.directory();
        assert_eq!(dir["newNonce"], format!("{BASE}/acme/new-nonce"));
        assert_eq!(dir["newAccount"], format!("{BASE}/acme/new-account"));
        assert_eq!(dir["newOrder"], format!("{BASE}/acme/new-order"));
    }

    #[tokio::test]
    async fn new_account_persists_jwk_and_returns_location() {
        let h = harness(false).await;
        let account_id = register_account(&h).await;
        assert!(account_id.starts_with("acct-"));
        let stored = h.server.store.get_account(&account_id).await.unwrap().unwrap();
        let stored_jwk: Value = serde_json::from_str(&stored.jwk).unwrap();
        assert_eq!(stored_jwk["n"], h.jwk["n"]);
    }

    #[tokio::test]
    async fn unknown_account_is_rejected() {
        let h = harness(false).await;
        let body = testutil::flattened_jws(
            &h.key,
            &json!({
                "alg": "RS256",
                "kid": format!("{BASE}/acme/account/acct-ghost"),
                "url": format!("{BASE}/acme/new-order"),
            }),
            &json!({"identifiers": [{"type": "dns", "value": "a.example.com"}]}),
        );
        let err = h.server.handle_post(&body).await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::Acme {
                acme_type: AcmeErrorType::AccountDoesNotExist,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn tampered_signature_is_unauthorized() {
        let h = harness(false).await;
        register_account(&h).await;
        let other_key = testutil::test_rsa_key();
        // Signed with a different key than the jwk claims.
        let body = testutil::flattened_jws(
            &other_key,
            &json!({"alg": "RS256", "jwk": h.jwk, "url": format!("{BASE}/acme/new-account")}),
            &json!({}),
        );
        let err = h.server.handle_post(&body).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn non_rs256_is_rejected() {
        let h = harness(false).await;
        let body = testutil::flattened_jws(
            &h.key,
            &json!({"alg": "ES256", "jwk": h.jwk, "url": format!("{BASE}/acme/new-account")}),
            &json!({}),
        );
        let err = h.server.handle_post(&body).await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::Acme {
                acme_type: AcmeErrorType::Malformed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn new_order_creates_pending_authz_and_challenge() {
        let h = harness(false).await;
        let account_id = register_account(&h).await;
        let order = create_order(&h, &account_id, &["App.Example.com"]).await;

        assert_eq!(order["status"], "pending");
        assert_eq!(order["identifiers"][0]["value"], "app.example.com");
        let authz_id = authz_id_from_url(order["authorizations"][0].as_str().unwrap());

        let authz = h
            .server
            .store
            .get_authorization(&authz_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(authz.status, AuthzStatus::Pending);

        let challenges = h
            .server
            .store
            .challenges_for_authorization(&authz_id)
            .await
            .unwrap();
        assert_eq!(challenges.len(), 1);
        let challenge = &challenges[0];
        assert_eq!(challenge.kind, "http-01");
        assert_eq!(challenge.status, AuthzStatus::Pending);
        // keyAuthorization = token.thumbprint
        let thumbprint = jwk_thumbprint(&h.jwk).unwrap();
        assert_eq!(
            challenge.key_authorization,
            format!("{}.{}", challenge.token, thumbprint)
        );
        // A validator entry was allocated for the pending challenge.
        assert!(h
            .server
            .validator
            .entry_snapshot(&challenge.challenge_id)
            .is_some());
    }

    #[tokio::test]
    async fn whitelisted_identifier_short_circuits_to_valid() {
        let h = harness(false).await;
        h.server
            .store
            .insert_whitelist("*.example.com")
            .await
            .unwrap();
        let account_id = register_account(&h).await;
        let order = create_order(&h, &account_id, &["auto.example.com"]).await;

        let authz_id = authz_id_from_url(order["authorizations"][0].as_str().unwrap());
        let authz = h
            .server
            .store
            .get_authorization(&authz_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(authz.status, AuthzStatus::Valid);
        let challenges = h
            .server
            .store
            .challenges_for_authorization(&authz_id)
            .await
            .unwrap();
        assert_eq!(challenges[0].status, AuthzStatus::Valid);
        assert!(h
            .server
            .validator
            .entry_snapshot(&challenges[0].challenge_id)
            .is_none());
    }

    #[tokio::test]
    async fn empty_identifiers_are_malformed() {
        let h = harness(false).await;
        let account_id = register_account(&h).await;
        let body = testutil::flattened_jws(
            &h.key,
            &json!({
                "alg": "RS256",
                "kid": format!("{BASE}/acme/account/{account_id}"),
                "url": format!("{BASE}/acme/new-order"),
            }),
            &json!({"identifiers": []}),
        );
        let err = h.server.handle_post(&body).await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::Acme {
                acme_type: AcmeErrorType::Malformed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn well_known_prefers_acme_table_over_legacy() {
        let h = harness(false).await;
        h.server
            .store
            .upsert_legacy_challenge("T", "legacy-K", "2026-01-01T00:00:00+00:00")
            .await
            .unwrap();
        let response = h.server.well_known_lookup("T").await.unwrap();
        assert_eq!(response.body_bytes().as_ref(), b"legacy-K");

        // An ACME challenge with the same token wins.
        h.server
            .store
            .insert_authorization(AcmeAuthorization {
                authz_id: "a".into(),
                order_id: "o".into(),
                identifier: "x.example.com".into(),
                status: AuthzStatus::Pending,
            })
            .await
            .unwrap();
        h.server
            .store
            .insert_challenge(AcmeChallenge {
                challenge_id: "c".into(),
                authz_id: "a".into(),
                kind: "http-01".into(),
                token: "T".into(),
                key_authorization: "acme-K".into(),
                status: AuthzStatus::Pending,
                accepted_at: None,
            })
            .await
            .unwrap();
        let response = h.server.well_known_lookup("T").await.unwrap();
        assert_eq!(response.body_bytes().as_ref(), b"acme-K");

        assert!(matches!(
            h.server.well_known_lookup("missing").await.unwrap_err(),
            ApiError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn finalize_issues_chain_and_leaf_rows() {
        let h = harness(true).await;
        h.server
            .store
            .insert_whitelist("*.example.com")
            .await
            .unwrap();
        let account_id = register_account(&h).await;
        let order_json =
            create_order(&h, &account_id, &["fin.example.com", "alt.example.com"]).await;
        let finalize_url = order_json["finalize"].as_str().unwrap().to_string();
        let order_id = finalize_url.rsplit('/').next().unwrap().to_string();

        // CSR for a fresh client-held key.
        let client_key =
            pki::generate_keypair(pki::KeyAlgorithm::EcP256, pki::HashAlgorithm::default())
                .unwrap();
        let mut params = rcgen::CertificateParams::default();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, "fin.example.com");
        params.distinguished_name = dn;
        let csr_der = params.serialize_request(&client_key).unwrap().der().to_vec();

        let body = testutil::flattened_jws(
            &h.key,
            &json!({
                "alg": "RS256",
                "kid": format!("{BASE}/acme/account/{account_id}"),
                "url": finalize_url,
            }),
            &json!({"csr": URL_SAFE_NO_PAD.encode(&csr_der)}),
        );
        let response = h.server.handle_post(&body).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        let finalized = response.body_json();
        assert_eq!(finalized["status"], "valid");

        let order = h.server.store.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Valid);
        assert!(order.leaf_ref.is_some());

        // The chain endpoint serves leaf + issuer.
        let chain = h.server.certificate_chain(&order_id).await.unwrap();
        let chain_pem = String::from_utf8(chain.body_bytes().to_vec()).unwrap();
        assert_eq!(chain_pem.matches("BEGIN CERTIFICATE").count(), 2);

        // One leaf row per identifier, flagged as ACME issued.
        let leaves = h.server.store.list_leaves().await.unwrap();
        let acme_leaves: Vec<_> = leaves.iter().filter(|l| l.is_acme).collect();
        assert_eq!(acme_leaves.len(), 2);
        assert!(acme_leaves.iter().any(|l| l.domain == "fin.example.com"));
        assert!(acme_leaves.iter().any(|l| l.domain == "alt.example.com"));
    }

    #[tokio::test]
    async fn finalize_rejects_pending_order_and_bad_csr() {
        let h = harness(true).await;
        let account_id = register_account(&h).await;
        // Not whitelisted: authorization stays pending.
        let order_json = create_order(&h, &account_id, &["pending.example.org"]).await;
        let finalize_url = order_json["finalize"].as_str().unwrap().to_string();

        let body = testutil::flattened_jws(
            &h.key,
            &json!({
                "alg": "RS256",
                "kid": format!("{BASE}/acme/account/{account_id}"),
                "url": finalize_url,
            }),
            &json!({"csr": URL_SAFE_NO_PAD.encode(b"garbage")}),
        );
        let err = h.server.handle_post(&body).await.unwrap_err();
        // Pending authorizations are checked before the CSR is touched.
        assert!(matches!(
            err,
            ApiError::Acme {
                acme_type: AcmeErrorType::Malformed,
                ..
            }
        ));

        // With a valid authorization but a garbage CSR, finalize says badCSR.
        h.server
            .store
            .insert_whitelist("valid.example.org")
            .await
            .unwrap();
        let order_json = create_order(&h, &account_id, &["valid.example.org"]).await;
        let finalize_url = order_json["finalize"].as_str().unwrap().to_string();
        let body = testutil::flattened_jws(
            &h.key,
            &json!({
                "alg": "RS256",
                "kid": format!("{BASE}/acme/account/{account_id}"),
                "url": finalize_url,
            }),
            &json!({"csr": URL_SAFE_NO_PAD.encode(b"garbage")}),
        );
        let err = h.server.handle_post(&body).await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::Acme {
                acme_type: AcmeErrorType::BadCsr,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn finalize_without_issuing_ca_is_503() {
        let h = harness(false).await;
        h.server
            .store
            .insert_whitelist("lost.example.net")
            .await
            .unwrap();
        let account_id = register_account(&h).await;
        let order_json = create_order(&h, &account_id, &["lost.example.net"]).await;
        let finalize_url = order_json["finalize"].as_str().unwrap().to_string();

        let client_key =
            pki::generate_keypair(pki::KeyAlgorithm::EcP256, pki::HashAlgorithm::default())
                .unwrap();
        let params = rcgen::CertificateParams::default();
        let csr_der = params.serialize_request(&client_key).unwrap().der().to_vec();

        let body = testutil::flattened_jws(
            &h.key,
            &json!({
                "alg": "RS256",
                "kid": format!("{BASE}/acme/account/{account_id}"),
                "url": finalize_url,
            }),
            &json!({"csr": URL_SAFE_NO_PAD.encode(&csr_der)}),
        );
        let err = h.server.handle_post(&body).await.unwrap_err();
        assert_eq!(err.status(), 503);
    }

    #[tokio::test]
    async fn manual_accept_flips_authz_and_challenge() {
        let h = harness(false).await;
        let account_id = register_account(&h).await;
        let order = create_order(&h, &account_id, &["manual.example.com"]).await;
        let authz_id = authz_id_from_url(order["authorizations"][0].as_str().unwrap());

        h.server.accept_authorization(&authz_id).await.unwrap();

        let response = h.server.authorization_json(&authz_id).await.unwrap();
        let authz_json = response.body_json();
        assert_eq!(authz_json["status"], "valid");
        assert_eq!(authz_json["challenges"][0]["status"], "valid");
        assert!(authz_json["challenges"][0]["acceptedAt"].is_string());
    }
}
