use crate::dispatcher::{DispatchError, Dispatcher};
use crate::filter::Candidate;
use crate::identity::CallerIdentity;
use crate::types::Aggregate;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Duration, Instant, sleep_until};
use tracing::Instrument;

// Extra time given to tasks past the request deadline before they are abandoned.
const JOIN_GRACE: Duration = Duration::from_millis(250);

/// Fans a request out to every candidate cluster and gathers one aggregate per
/// candidate, in candidate order.
#[derive(Clone)]
pub struct Executor {
    dispatcher: Arc<Dispatcher>,
    max_concurrent: usize,
}

impl Executor {
    pub fn new(dispatcher: Arc<Dispatcher>, max_concurrent: usize) -> Self {
        Self {
            dispatcher,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub async fn execute(
        &self,
        candidates: Vec<Candidate>,
        uri: &str,
        caller: Option<CallerIdentity>,
        deadline: Instant,
    ) -> Vec<Aggregate> {
        let uri: Arc<str> = Arc::from(uri);
        let caller = caller.map(Arc::new);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        let mut slots: Vec<Option<Aggregate>> = vec![None; candidates.len()];
        let mut pending = HashMap::new();
        let mut join_set = JoinSet::new();

        // Each task owns its slot index, results land by index not completion order.
        for (slot, candidate) in candidates.iter().enumerate() {
            let dispatcher = self.dispatcher.clone();
            let semaphore = semaphore.clone();
            let candidate = candidate.clone();
            let uri = uri.clone();
            let caller = caller.clone();
            let span = tracing::info_span!("dispatch", cluster = %candidate.name());

            let handle = join_set.spawn(
                async move {
                    let _permit = match tokio::time::timeout_at(deadline, semaphore.acquire_owned()).await {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) => return (slot, pending_failure(&candidate, DispatchError::PoolClosed)),
                        Err(_) => return (slot, pending_failure(&candidate, DispatchError::Timeout)),
                    };
                    let aggregate = dispatcher
                        .dispatch(&candidate, &uri, caller.as_deref(), deadline)
                        .await;
                    (slot, aggregate)
                }
                .instrument(span),
            );
            pending.insert(handle.id(), slot);
        }

        let give_up = sleep_until(deadline + JOIN_GRACE);
        tokio::pin!(give_up);

        loop {
            tokio::select! {
                _ = &mut give_up => break,
                join_result = join_set.join_next_with_id() => match join_result {
                    Some(Ok((id, (slot, aggregate)))) => {
                        pending.remove(&id);
                        slots[slot] = Some(aggregate);
                    }
                    Some(Err(e)) => {
                        // A panicking task only loses its own slot.
                        if let Some(slot) = pending.remove(&e.id()) {
                            let error = DispatchError::Panicked(panic_message(e));
                            slots[slot] = Some(pending_failure(&candidates[slot], error));
                        }
                    }
                    None => break,
                }
            }
        }

        // Anything still running past the grace period is abandoned.
        join_set.abort_all();
        slots
            .into_iter()
            .zip(&candidates)
            .map(|(slot, candidate)| {
                slot.unwrap_or_else(|| pending_failure(candidate, DispatchError::Timeout))
            })
            .collect()
    }
}

fn pending_failure(candidate: &Candidate, error: DispatchError) -> Aggregate {
    error.record(Aggregate::new(
        candidate.name().to_string(),
        candidate.location.clone(),
    ))
}

fn panic_message(error: JoinError) -> String {
    if error.is_cancelled() {
        return "task was cancelled".into();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".into()
    }
}
