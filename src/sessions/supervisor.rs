//! Bind-deadline supervision.
//!
//! Every created session gets one supervisor task. It races the session's
//! bind signal against a deadline and is the only party that ever starts the
//! session's worker, so a session is served at most once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::bind::BindWaiter;
use super::{SessionRecord, SessionStore};

/// How a supervised session left the pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// Bound in time; the worker ran to completion.
    Served,
    /// Nobody bound before the deadline; the record was reclaimed silently.
    Expired,
    /// The session was terminated or dropped while still pending.
    Abandoned,
}

/// Wait for `record` to be bound, then run `serve` on the bound record.
///
/// If the deadline passes first and the supervisor wins the claim, the record
/// is removed without contacting any transport. If a handshake claimed the
/// signal first, the supervisor waits for it to finish attaching instead.
pub async fn supervise<F, Fut>(
    store: Arc<dyn SessionStore>,
    record: SessionRecord,
    mut waiter: BindWaiter,
    deadline: Duration,
    serve: F,
) -> SupervisorOutcome
where
    F: FnOnce(SessionRecord) -> Fut,
    Fut: Future<Output = ()>,
{
    let id = record.id.clone();
    let signal = Arc::clone(&record.bind);

    let bound = tokio::select! {
        res = &mut waiter => res.is_ok(),
        () = tokio::time::sleep(deadline) => {
            if signal.try_claim() {
                store.reclaim(&id).await;
                info!("Session {id} not bound within {}s, reclaimed", deadline.as_secs_f32());
                return SupervisorOutcome::Expired;
            }
            debug!("Session {id}: deadline hit during bind, waiting for handshake");
            waiter.await.is_ok()
        }
    };

    if !bound {
        store.reclaim(&id).await;
        return SupervisorOutcome::Abandoned;
    }

    let Some(bound_record) = store.get(&id).await else {
        return SupervisorOutcome::Abandoned;
    };
    serve(bound_record).await;
    SupervisorOutcome::Served
}
