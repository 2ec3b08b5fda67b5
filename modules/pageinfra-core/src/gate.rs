//! Recency gate: short-lived exclusive claims per URL.
//!
//! A claim is advisory. It expires after its TTL with no release signal and
//! is never a source of truth; the staleness filter and the conditional
//! writes downstream stay correct without it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn, Instrument};

use pageinfra_common::LogContext;
use pageinfra_store::ClaimStore;

use crate::error::Result;

/// What the gate does with a URL when the claim backend cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GatePolicy {
    /// Keep the URL as if the claim succeeded, so the scrape is not lost.
    #[default]
    FailOpen,
    /// Drop the URL.
    FailClosed,
}

pub struct RecencyGate {
    claims: Arc<dyn ClaimStore>,
    prefix: String,
    ttl: Duration,
    policy: GatePolicy,
    concurrency: usize,
}

impl RecencyGate {
    pub fn new(claims: Arc<dyn ClaimStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            claims,
            prefix: prefix.into(),
            ttl,
            policy: GatePolicy::default(),
            concurrency: 16,
        }
    }

    pub fn with_policy(mut self, policy: GatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn key(&self, url: &str) -> String {
        format!("{}:{}", self.prefix, url)
    }

    /// True iff this call newly took the claim for `url`.
    pub async fn try_claim(&self, url: &str) -> Result<bool> {
        Ok(self.claims.try_claim(&self.key(url), self.ttl).await?)
    }

    /// The URLs this caller claimed, in input order. A URL repeated in the
    /// input is claimed at most once; later occurrences lose. Backend
    /// failures follow the gate policy.
    pub async fn filter_unclaimed(&self, ctx: &LogContext, urls: &[String]) -> Vec<String> {
        let span = ctx.span("filter_unclaimed");
        async {
            let start = Instant::now();

            let mut seen = HashSet::new();
            let unique: Vec<(usize, &String)> = urls
                .iter()
                .enumerate()
                .filter(|(_, url)| seen.insert(url.as_str()))
                .collect();

            let mut claimed: Vec<(usize, String)> =
                stream::iter(unique.into_iter().map(|(idx, url)| async move {
                    match self.try_claim(url).await {
                        Ok(true) => Some((idx, url.clone())),
                        Ok(false) => {
                            debug!(url = url.as_str(), "Claimed elsewhere, dropping");
                            None
                        }
                        Err(e) => match self.policy {
                            GatePolicy::FailOpen => {
                                warn!(url = url.as_str(), error = %e, "Claim backend failed, keeping URL");
                                Some((idx, url.clone()))
                            }
                            GatePolicy::FailClosed => {
                                warn!(url = url.as_str(), error = %e, "Claim backend failed, dropping URL");
                                None
                            }
                        },
                    }
                }))
                .buffer_unordered(self.concurrency)
                .filter_map(|claimed| async move { claimed })
                .collect()
                .await;
            claimed.sort_by_key(|(idx, _)| *idx);

            info!(
                quantity = urls.len(),
                claimed = claimed.len(),
                duration_ms = start.elapsed().as_millis() as u64,
                "URLs gated"
            );
            claimed.into_iter().map(|(_, url)| url).collect()
        }
        .instrument(span)
        .await
    }
}
