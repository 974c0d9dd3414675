//! Read-only aggregate consumed by dashboards and the SSE feed.
//!
//! Snapshots are point-in-time reads over the store plus the validator's
//! in-memory timers; readers tolerate staleness.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use crate::acme::{ChallengeValidator, ValidationEntry};
use crate::models::RenewalEvent;
use crate::server::stats::{RequestStats, StatsSnapshot};
use crate::storage::Store;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RootSummary {
    pub id: String,
    pub name: String,
    pub common_name: String,
    pub not_after: String,
    pub created_at: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntermediateSummary {
    pub id: String,
    pub parent_root_id: String,
    pub name: String,
    pub common_name: String,
    pub not_after: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafSummary {
    pub id: i64,
    pub domain: String,
    pub not_after: String,
    pub created_at: String,
    pub issuer_id: Option<String>,
    pub has_pem: bool,
    pub revoked: bool,
    pub is_ev: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenChallengeSummary {
    pub challenge_id: String,
    pub authz_id: String,
    pub domain: String,
    pub token: String,
    /// Attempt timers when the background validator still holds the entry.
    pub validator: Option<ValidationEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub certs_total: u64,
    pub certs_valid: u64,
    pub renewals_total: u64,
    pub recent_renewals: Vec<RenewalEvent>,
    pub server_time_utc: String,
    pub server_time_local: String,
    pub roots: Vec<RootSummary>,
    pub intermediates: Vec<IntermediateSummary>,
    pub certificates: Vec<LeafSummary>,
    pub open_challenges: Vec<OpenChallengeSummary>,
    pub request_stats: StatsSnapshot,
}

pub async fn build_summary(
    store: &Store,
    validator: &Arc<ChallengeValidator>,
    stats: &RequestStats,
) -> anyhow::Result<Summary> {
    let now = Utc::now();
    let active_ca = store.active_ca_id().await?;
    let revoked: HashSet<i64> = store.list_revoked_ids().await?.into_iter().collect();

    let roots = store
        .list_roots()
        .await?
        .into_iter()
        .map(|root| RootSummary {
            is_active: active_ca.as_deref() == Some(root.id.as_str()),
            id: root.id,
            name: root.display_name,
            common_name: root.common_name,
            not_after: root.not_after,
            created_at: root.created_at,
        })
        .collect();

    let intermediates = store
        .list_intermediates()
        .await?
        .into_iter()
        .map(|ca| IntermediateSummary {
            id: ca.id,
            parent_root_id: ca.parent_root_id,
            name: ca.display_name,
            common_name: ca.common_name,
            not_after: ca.not_after,
            created_at: ca.created_at,
        })
        .collect();

    let leaves = store.list_leaves().await?;
    let certs_total = leaves.len() as u64;
    let mut certs_valid = 0u64;
    let certificates: Vec<LeafSummary> = leaves
        .into_iter()
        .map(|leaf| {
            let leaf_revoked = revoked.contains(&leaf.id);
            if !leaf_revoked && expires_after(&leaf.not_after, &now) {
                certs_valid += 1;
            }
            LeafSummary {
                id: leaf.id,
                domain: leaf.domain,
                not_after: leaf.not_after,
                created_at: leaf.created_at,
                issuer_id: leaf.issuer_id,
                has_pem: !leaf.pem.is_empty(),
                revoked: leaf_revoked,
                is_ev: leaf.is_ev,
            }
        })
        .collect();

    let open_challenges = store
        .pending_challenges()
        .await?
        .into_iter()
        .map(|(challenge, domain)| OpenChallengeSummary {
            validator: validator.entry_snapshot(&challenge.challenge_id),
            challenge_id: challenge.challenge_id,
            authz_id: challenge.authz_id,
            domain,
            token: challenge.token,
        })
        .collect();

    Ok(Summary {
        certs_total,
        certs_valid,
        renewals_total: store.count_renewals().await?,
        recent_renewals: store.list_renewals(10).await?,
        server_time_utc: now.to_rfc3339(),
        server_time_local: Local::now().to_rfc3339(),
        roots,
        intermediates,
        certificates,
        open_challenges,
        request_stats: stats.snapshot(),
    })
}

fn expires_after(not_after: &str, now: &DateTime<Utc>) -> bool {
    DateTime::parse_from_rfc3339(not_after)
        .map(|t| t.with_timezone(&Utc) > *now)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AcmeAuthorization, AcmeChallenge, AuthzStatus};
    use crate::storage::NewLeaf;
    use tempfile::tempdir;

    #[tokio::test]
    async fn summary_counts_valid_and_revoked() {
        let dir = tempdir().unwrap();
        let store =
            Arc::new(Store::open(&dir.path().join("test.sqlite"), dir.path()).unwrap());
        let validator = Arc::new(ChallengeValidator::new(Arc::clone(&store)));
        let stats = RequestStats::new();

        let fresh = NewLeaf {
            domain: "ok.example.com".into(),
            not_after: (Utc::now() + chrono::Duration::days(30)).to_rfc3339(),
            created_at: Utc::now().to_rfc3339(),
            pem: "PEM".into(),
            issuer_id: None,
            is_acme: false,
            is_ev: false,
            policy_oid: None,
        };
        let expired = NewLeaf {
            domain: "old.example.com".into(),
            not_after: (Utc::now() - chrono::Duration::days(1)).to_rfc3339(),
            ..fresh.clone()
        };
        let id_fresh = store
            .insert_leaf_with_key(fresh.clone(), "k".into())
            .await
            .unwrap();
        store
            .insert_leaf_with_key(expired, "k".into())
            .await
            .unwrap();
        let id_revoked = store.insert_leaf_with_key(fresh, "k".into()).await.unwrap();
        store
            .revoke_leaf(id_revoked, Utc::now().to_rfc3339())
            .await
            .unwrap();

        let summary = build_summary(&store, &validator, &stats).await.unwrap();
        assert_eq!(summary.certs_total, 3);
        assert_eq!(summary.certs_valid, 1);
        let fresh_row = summary
            .certificates
            .iter()
            .find(|c| c.id == id_fresh)
            .unwrap();
        assert!(!fresh_row.revoked);
        assert!(fresh_row.has_pem);
        let revoked_row = summary
            .certificates
            .iter()
            .find(|c| c.id == id_revoked)
            .unwrap();
        assert!(revoked_row.revoked);
    }

    #[tokio::test]
    async fn open_challenges_carry_validator_timers() {
        let dir = tempdir().unwrap();
        let store =
            Arc::new(Store::open(&dir.path().join("test.sqlite"), dir.path()).unwrap());
        let validator = Arc::new(ChallengeValidator::new(Arc::clone(&store)));
        let stats = RequestStats::new();

        store
            .insert_authorization(AcmeAuthorization {
                authz_id: "a1".into(),
                order_id: "o1".into(),
                identifier: "watch.example.com".into(),
                status: AuthzStatus::Pending,
            })
            .await
            .unwrap();
        store
            .insert_challenge(AcmeChallenge {
                challenge_id: "c1".into(),
                authz_id: "a1".into(),
                kind: "http-01".into(),
                token: "tok".into(),
                key_authorization: "tok.tp".into(),
                status: AuthzStatus::Pending,
                accepted_at: None,
            })
            .await
            .unwrap();
        validator.register("c1", "watch.example.com", "tok");

        let summary = build_summary(&store, &validator, &stats).await.unwrap();
        assert_eq!(summary.open_challenges.len(), 1);
        let open = &summary.open_challenges[0];
        assert_eq!(open.domain, "watch.example.com");
        let timers = open.validator.as_ref().expect("validator entry attached");
        assert_eq!(timers.max_attempts, 5);
    }
}
