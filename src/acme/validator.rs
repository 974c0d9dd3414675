//! Background HTTP-01 challenge validator.
//!
//! One task owns the in-memory attempt map; administrative commands and the
//! synchronous challenge endpoint only remove entries or force state through
//! the store. Readers (summary view) tolerate stale snapshots.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;

use crate::models::{AcmeChallenge, AuthzStatus};
use crate::storage::Store;

const TICK_SECONDS: u64 = 5;
const RETRY_DELAY_MS: i64 = 5_000;
const MAX_ATTEMPTS: u32 = 5;

/// Per-challenge probe state. Only identifiers are held here, never rows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationEntry {
    pub domain: String,
    pub token: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Epoch milliseconds of the next allowed probe.
    pub next_attempt_at_ms: i64,
}

pub struct ChallengeValidator {
    store: Arc<Store>,
    client: reqwest::Client,
    entries: DashMap<String, ValidationEntry>,
}

impl ChallengeValidator {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            entries: DashMap::new(),
        }
    }

    /// Register a pending challenge for background probing.
    pub fn register(&self, challenge_id: &str, domain: &str, token: &str) {
        self.entries.insert(
            challenge_id.to_string(),
            ValidationEntry {
                domain: domain.to_string(),
                token: token.to_string(),
                attempt_count: 0,
                max_attempts: MAX_ATTEMPTS,
                next_attempt_at_ms: Utc::now().timestamp_millis(),
            },
        );
    }

    /// Drop the entry, e.g. after a manual accept or a synchronous probe.
    pub fn remove(&self, challenge_id: &str) {
        self.entries.remove(challenge_id);
    }

    /// Snapshot of an entry for the summary view.
    pub fn entry_snapshot(&self, challenge_id: &str) -> Option<ValidationEntry> {
        self.entries.get(challenge_id).map(|e| e.value().clone())
    }

    /// Re-register every pending challenge after a restart. Attempt budgets
    /// start fresh; the store is the only durable record.
    pub async fn recover_pending(&self) -> anyhow::Result<usize> {
        let pending = self.store.pending_challenges().await?;
        let count = pending.len();
        for (challenge, domain) in pending {
            self.register(&challenge.challenge_id, &domain, &challenge.token);
        }
        if count > 0 {
            tracing::info!("validator recovered {} pending challenge(s)", count);
        }
        Ok(count)
    }

    /// Run forever, probing due entries every five seconds. Errors only
    /// affect challenge state; they never propagate.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(TICK_SECONDS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let now_ms = Utc::now().timestamp_millis();
            let due: Vec<String> = self
                .entries
                .iter()
                .filter(|entry| entry.value().next_attempt_at_ms <= now_ms)
                .map(|entry| entry.key().clone())
                .collect();
            for challenge_id in due {
                if let Err(e) = self.probe_entry(&challenge_id).await {
                    tracing::debug!("validator probe for {} errored: {}", challenge_id, e);
                }
            }
        }
    }

    async fn probe_entry(&self, challenge_id: &str) -> anyhow::Result<()> {
        let challenge = match self.store.get_challenge(challenge_id).await? {
            Some(c) if c.status == AuthzStatus::Pending => c,
            // Gone or already settled elsewhere: just forget the entry.
            _ => {
                self.entries.remove(challenge_id);
                return Ok(());
            }
        };
        let domain = match self.entries.get(challenge_id) {
            Some(entry) => entry.value().domain.clone(),
            None => return Ok(()),
        };

        let outcome =
            probe_key_authorization(&self.client, &domain, &challenge.token).await;
        match outcome {
            Ok(body) if body.trim() == challenge.key_authorization => {
                mark_challenge_valid(&self.store, &challenge, None).await?;
                self.entries.remove(challenge_id);
                tracing::info!("challenge {} validated for {}", challenge_id, domain);
            }
            other => {
                if let Err(e) = other {
                    tracing::debug!("http-01 probe for {} failed: {}", domain, e);
                }
                self.record_failure(&challenge).await?;
            }
        }
        Ok(())
    }

    async fn record_failure(&self, challenge: &AcmeChallenge) -> anyhow::Result<()> {
        let exhausted = {
            let mut entry = match self.entries.get_mut(&challenge.challenge_id) {
                Some(e) => e,
                None => return Ok(()),
            };
            entry.attempt_count += 1;
            entry.next_attempt_at_ms = Utc::now().timestamp_millis() + RETRY_DELAY_MS;
            entry.attempt_count >= entry.max_attempts
        };
        if exhausted {
            self.store
                .set_challenge_status(&challenge.challenge_id, AuthzStatus::Invalid, None)
                .await?;
            self.store
                .set_authorization_status(&challenge.authz_id, AuthzStatus::Invalid)
                .await?;
            self.entries.remove(&challenge.challenge_id);
            tracing::warn!(
                "challenge {} exhausted its attempts and is now invalid",
                challenge.challenge_id
            );
        }
        Ok(())
    }
}

/// Fetch the key authorization a claimant serves for a token.
pub async fn probe_key_authorization(
    client: &reqwest::Client,
    domain: &str,
    token: &str,
) -> anyhow::Result<String> {
    let url = format!("http://{domain}/.well-known/acme-challenge/{token}");
    let response = client.get(&url).send().await?;
    let body = response.text().await?;
    Ok(body)
}

/// Flip a challenge and its authorization to valid. `accepted_at` records a
/// manual override.
pub async fn mark_challenge_valid(
    store: &Store,
    challenge: &AcmeChallenge,
    accepted_at: Option<String>,
) -> anyhow::Result<()> {
    store
        .set_challenge_status(&challenge.challenge_id, AuthzStatus::Valid, accepted_at)
        .await?;
    store
        .set_authorization_status(&challenge.authz_id, AuthzStatus::Valid)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AcmeAuthorization;
    use tempfile::tempdir;

    async fn store_with_challenge(dir: &std::path::Path) -> (Arc<Store>, AcmeChallenge) {
        let store = Arc::new(Store::open(&dir.join("test.sqlite"), dir).unwrap());
        store
            .insert_authorization(AcmeAuthorization {
                authz_id: "authz-1".into(),
                order_id: "order-1".into(),
                identifier: "probe.example.com".into(),
                status: AuthzStatus::Pending,
            })
            .await
            .unwrap();
        let challenge = AcmeChallenge {
            challenge_id: "chall-1".into(),
            authz_id: "authz-1".into(),
            kind: "http-01".into(),
            token: "tok".into(),
            key_authorization: "tok.thumb".into(),
            status: AuthzStatus::Pending,
            accepted_at: None,
        };
        store.insert_challenge(challenge.clone()).await.unwrap();
        (store, challenge)
    }

    #[tokio::test]
    async fn register_and_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let (store, challenge) = store_with_challenge(dir.path()).await;
        let validator = ChallengeValidator::new(store);
        validator.register(&challenge.challenge_id, "probe.example.com", "tok");

        let snapshot = validator.entry_snapshot("chall-1").unwrap();
        assert_eq!(snapshot.domain, "probe.example.com");
        assert_eq!(snapshot.attempt_count, 0);
        assert_eq!(snapshot.max_attempts, 5);

        validator.remove("chall-1");
        assert!(validator.entry_snapshot("chall-1").is_none());
    }

    #[tokio::test]
    async fn five_failures_invalidate_challenge_and_authorization() {
        let dir = tempdir().unwrap();
        let (store, challenge) = store_with_challenge(dir.path()).await;
        let validator = ChallengeValidator::new(Arc::clone(&store));
        validator.register(&challenge.challenge_id, "probe.example.com", "tok");

        for _ in 0..MAX_ATTEMPTS {
            validator.record_failure(&challenge).await.unwrap();
        }

        assert!(validator.entry_snapshot("chall-1").is_none());
        let challenge = store.get_challenge("chall-1").await.unwrap().unwrap();
        assert_eq!(challenge.status, AuthzStatus::Invalid);
        let authz = store.get_authorization("authz-1").await.unwrap().unwrap();
        assert_eq!(authz.status, AuthzStatus::Invalid);
    }

    #[tokio::test]
    async fn manual_accept_marks_both_valid() {
        let dir = tempdir().unwrap();
        let (store, challenge) = store_with_challenge(dir.path()).await;
        mark_challenge_valid(&store, &challenge, Some("2026-03-01T00:00:00+00:00".into()))
            .await
            .unwrap();

        let challenge = store.get_challenge("chall-1").await.unwrap().unwrap();
        assert_eq!(challenge.status, AuthzStatus::Valid);
        assert_eq!(
            challenge.accepted_at.as_deref(),
            Some("2026-03-01T00:00:00+00:00")
        );
        let authz = store.get_authorization("authz-1").await.unwrap().unwrap();
        assert_eq!(authz.status, AuthzStatus::Valid);
    }

    #[tokio::test]
    async fn recover_pending_rebuilds_entries() {
        let dir = tempdir().unwrap();
        let (store, _) = store_with_challenge(dir.path()).await;
        let validator = ChallengeValidator::new(store);
        assert_eq!(validator.recover_pending().await.unwrap(), 1);
        let snapshot = validator.entry_snapshot("chall-1").unwrap();
        assert_eq!(snapshot.domain, "probe.example.com");
    }
}
