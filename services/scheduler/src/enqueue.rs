//! The enqueue action: move admitted pending jobs into the queue.

use tracing::{debug, info};

use crate::session::{JobPhase, SchedulingSession, Session};

/// Offer each pending job to the session's predicates, in job order.
///
/// Returns the keys of the jobs moved to [`JobPhase::Inqueue`].
pub fn enqueue_pending(session: &mut Session) -> Vec<String> {
    let mut enqueued = Vec::new();
    let mut rejected = 0usize;

    for index in 0..session.jobs().len() {
        let job = session.jobs()[index].clone();
        if job.phase != JobPhase::Pending {
            continue;
        }

        if session.job_enqueueable(&job) {
            session.jobs_mut()[index].phase = JobPhase::Inqueue;
            debug!(job = %job, "Job enqueued");
            enqueued.push(job.key());
        } else {
            rejected += 1;
        }
    }

    info!(enqueued = enqueued.len(), rejected, "Enqueue pass complete");
    enqueued
}
