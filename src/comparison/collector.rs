//! Shadow collector
//!
//! Fans one request out to every shadow slot concurrently and joins under a single
//! deadline. Slots keep configuration order regardless of arrival order.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::target::ShadowTarget;
use crate::models::{RequestDescriptor, ShadowFailure, ShadowResult};

/// One entry of the collection plan
#[derive(Clone)]
pub enum ShadowSlot {
    Target(Arc<dyn ShadowTarget>),
    /// Named in the event but not configured
    Unknown(String),
}

impl ShadowSlot {
    pub fn name(&self) -> &str {
        match self {
            ShadowSlot::Target(t) => t.name(),
            ShadowSlot::Unknown(name) => name,
        }
    }
}

pub struct ShadowCollector {
    budget: Duration,
}

impl ShadowCollector {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    /// Collect one result per slot, returning no later than the budget.
    ///
    /// Tasks still running at the deadline are aborted and marked `timeout`.
    pub async fn collect(
        &self,
        request: Arc<RequestDescriptor>,
        slots: &[ShadowSlot],
    ) -> Vec<ShadowResult> {
        let deadline = Instant::now() + self.budget;
        let mut results: Vec<Option<ShadowResult>> = vec![None; slots.len()];
        let mut tasks = JoinSet::new();
        let mut timed_out = false;

        for (idx, slot) in slots.iter().enumerate() {
            match slot {
                ShadowSlot::Target(target) => {
                    let target = Arc::clone(target);
                    let request = Arc::clone(&request);
                    tasks.spawn(async move {
                        // Caught here so the slot index survives a panicking target
                        let outcome = AssertUnwindSafe(target.invoke(&request, deadline))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                warn!(shadow = target.name(), "shadow task panicked");
                                Err(ShadowFailure::connection("shadow task panicked"))
                            });
                        (idx, outcome)
                    });
                }
                ShadowSlot::Unknown(name) => {
                    results[idx] = Some(ShadowResult::failed(
                        name.clone(),
                        ShadowFailure::connection(format!("shadow target `{name}` is not configured")),
                    ));
                }
            }
        }

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((idx, outcome)))) => {
                    let name = slots[idx].name();
                    results[idx] = Some(match outcome {
                        Ok(response) => ShadowResult::responded(name, response),
                        Err(failure) => {
                            debug!(shadow = name, kind = %failure.kind, "shadow failed");
                            ShadowResult::failed(name, failure)
                        }
                    });
                }
                Ok(Some(Err(join_err))) => {
                    // Only reachable on cancellation; the slot is filled below
                    warn!("shadow task died: {}", join_err);
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(outstanding = tasks.len(), "collection budget elapsed");
                    tasks.abort_all();
                    timed_out = true;
                    break;
                }
            }
        }

        results
            .into_iter()
            .zip(slots)
            .map(|(result, slot)| {
                result.unwrap_or_else(|| {
                    let failure = if timed_out {
                        ShadowFailure::timeout(format!(
                            "no response within {}ms",
                            self.budget.as_millis()
                        ))
                    } else {
                        ShadowFailure::connection("shadow task terminated without a result")
                    };
                    ShadowResult::failed(slot.name(), failure)
                })
            })
            .collect()
    }
}
