//! Overcommit admission gate.
//!
//! At session open the gate computes how much the cluster can still take:
//! ready-node allocatable scaled by the overcommit factor, minus everything
//! already in use. Each admitted job's minimum resources are then counted
//! against that budget for the rest of the session. Jobs without a minimum
//! are best-effort and always admitted.

use std::time::Instant;

use clusterinfo_resource::{check_scale_factor, ResourceError, ResourceVector};
use tracing::{debug, warn};

use crate::plugin::{ArgumentError, Arguments, Plugin};
use crate::session::{JobInfo, JobPhase, NodeInfo, SchedulingSession};

/// Name the plugin registers under.
pub const PLUGIN_NAME: &str = "overcommit";

/// Argument key for the overcommit factor.
pub const OVERCOMMIT_FACTOR_KEY: &str = "overcommit-factor";

pub const DEFAULT_OVERCOMMIT_FACTOR: f64 = 1.2;

/// Outcome of one admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The job declares no minimum.
    BestEffort,

    /// The job's minimum fits in the remaining budget.
    Admitted,

    /// Admitting the job would exceed the budget.
    Rejected,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

/// Per-session admission state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionGate {
    idle: ResourceVector,
    inqueue: ResourceVector,
}

impl AdmissionGate {
    /// Compute the session budget from the current nodes and jobs.
    ///
    /// If the cluster is already over-used beyond the overcommit allowance
    /// the budget is empty, so only best-effort jobs get through.
    pub fn open(nodes: &[NodeInfo], jobs: &[JobInfo], factor: f64) -> Self {
        let inqueue = ResourceVector::try_sum(
            jobs.iter()
                .filter(|job| job.phase == JobPhase::Inqueue)
                .filter_map(|job| job.min_resources.as_ref()),
        );

        match (idle_budget(nodes, factor), inqueue) {
            (Ok(idle), Ok(inqueue)) => Self::with_budget(idle, inqueue),
            (Err(e), _) | (_, Err(e)) => {
                warn!(factor, error = %e, "No idle resources within the overcommit allowance");
                Self::with_budget(ResourceVector::empty(), ResourceVector::empty())
            }
        }
    }

    /// A gate with an explicit budget.
    pub fn with_budget(idle: ResourceVector, inqueue: ResourceVector) -> Self {
        Self { idle, inqueue }
    }

    pub fn idle(&self) -> &ResourceVector {
        &self.idle
    }

    pub fn inqueue(&self) -> &ResourceVector {
        &self.inqueue
    }

    /// Decide on one job, recording its minimum if admitted.
    pub fn admit(&mut self, job: &JobInfo) -> Admission {
        let Some(min) = &job.min_resources else {
            debug!(job = %job, "Job is best-effort, allowing enqueue");
            return Admission::BestEffort;
        };

        let wanted = match self.inqueue.add(min) {
            Ok(wanted) => wanted,
            Err(e) => {
                warn!(job = %job, error = %e, "Job minimum cannot be counted, rejecting enqueue");
                return Admission::Rejected;
            }
        };
        if wanted.less_equal(&self.idle) {
            debug!(job = %job, inqueue = %wanted, idle = %self.idle, "Sufficient resources, allowing enqueue");
            self.inqueue = wanted;
            Admission::Admitted
        } else {
            debug!(job = %job, inqueue = %self.inqueue, min = %min, idle = %self.idle, "Idle resources overused, rejecting enqueue");
            Admission::Rejected
        }
    }
}

/// Scaled ready-node allocatable minus what every node already uses.
fn idle_budget(nodes: &[NodeInfo], factor: f64) -> Result<ResourceVector, ResourceError> {
    let allocatable =
        ResourceVector::try_sum(nodes.iter().filter(|n| n.ready).map(|n| &n.allocatable))?;
    let used = ResourceVector::try_sum(nodes.iter().map(|n| &n.used))?;
    debug!(allocatable = %allocatable, used = %used, "Summed node resources");
    allocatable.scale(factor)?.subtract(&used)
}

/// Read the overcommit factor, falling back to the default on bad input.
pub fn overcommit_factor(arguments: &Arguments) -> f64 {
    let parsed = arguments.get_f64(OVERCOMMIT_FACTOR_KEY).and_then(|factor| {
        factor
            .map(|f| {
                check_scale_factor(f).map(|()| f).map_err(|_| ArgumentError::OutOfRange {
                    key: OVERCOMMIT_FACTOR_KEY.to_string(),
                    value: f,
                })
            })
            .transpose()
    });
    match parsed {
        Ok(Some(factor)) => factor,
        Ok(None) => DEFAULT_OVERCOMMIT_FACTOR,
        Err(e) => {
            warn!(
                error = %e,
                default = DEFAULT_OVERCOMMIT_FACTOR,
                "Invalid overcommit factor, using default"
            );
            DEFAULT_OVERCOMMIT_FACTOR
        }
    }
}

/// Installs an [`AdmissionGate`] as an enqueue predicate on every session.
#[derive(Debug, Clone)]
pub struct OvercommitPlugin {
    arguments: Arguments,
}

impl OvercommitPlugin {
    pub fn new(arguments: Arguments) -> Self {
        Self { arguments }
    }

    pub fn factor(&self) -> f64 {
        overcommit_factor(&self.arguments)
    }
}

impl Plugin for OvercommitPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn on_session_open(&mut self, session: &mut dyn SchedulingSession) {
        let started = Instant::now();
        let factor = self.factor();

        let mut gate = AdmissionGate::open(session.nodes(), session.jobs(), factor);
        debug!(
            factor,
            idle = %gate.idle(),
            inqueue = %gate.inqueue(),
            elapsed_ns = started.elapsed().as_nanos() as u64,
            "Overcommit gate opened"
        );

        // The predicate owns the gate; it is dropped with the session.
        session.add_job_enqueueable_fn(
            PLUGIN_NAME,
            Box::new(move |job| gate.admit(job).is_admitted()),
        );
    }

    fn on_session_close(&mut self, _session: &mut dyn SchedulingSession) {
        debug!("Overcommit gate closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterinfo_resource::{Quantity, CPU, MEMORY};

    fn cpu(units: u64) -> ResourceVector {
        ResourceVector::empty().with(CPU, Quantity::from_units(units))
    }

    fn node(allocatable: ResourceVector, used: ResourceVector, ready: bool) -> NodeInfo {
        NodeInfo {
            name: "n".to_string(),
            allocatable,
            used,
            ready,
        }
    }

    fn job(name: &str, min: Option<ResourceVector>) -> JobInfo {
        JobInfo::new("default", name, min, JobPhase::Pending)
    }

    #[test]
    fn test_scaled_budget() {
        let gate = AdmissionGate::open(&[node(cpu(10), cpu(0), true)], &[], 1.2);
        assert_eq!(gate.idle(), &cpu(12));
        assert!(gate.inqueue().is_empty());
    }

    #[test]
    fn test_admission_sequence() {
        let mut gate = AdmissionGate::open(&[node(cpu(10), cpu(0), true)], &[], 1.2);

        assert_eq!(gate.admit(&job("j1", Some(cpu(5)))), Admission::Admitted);
        assert_eq!(gate.inqueue(), &cpu(5));
        assert_eq!(gate.admit(&job("j2", Some(cpu(8)))), Admission::Rejected);
        assert_eq!(gate.inqueue(), &cpu(5));
        assert_eq!(gate.admit(&job("j3", None)), Admission::BestEffort);
        assert_eq!(gate.admit(&job("j4", Some(cpu(7)))), Admission::Admitted);
        assert_eq!(gate.inqueue(), &cpu(12));
    }

    #[test]
    fn test_not_ready_allocatable_excluded_but_used_counted() {
        let nodes = [
            node(cpu(10), cpu(2), true),
            node(cpu(100), cpu(3), false),
        ];
        let gate = AdmissionGate::open(&nodes, &[], 1.0);
        assert_eq!(gate.idle(), &cpu(5));
    }

    #[test]
    fn test_existing_inqueue_jobs_count() {
        let mut queued = job("q", Some(cpu(4)));
        queued.phase = JobPhase::Inqueue;
        let mut running = job("r", Some(cpu(50)));
        running.phase = JobPhase::Running;

        let mut gate =
            AdmissionGate::open(&[node(cpu(10), cpu(0), true)], &[queued, running], 1.0);
        assert_eq!(gate.inqueue(), &cpu(4));
        assert_eq!(gate.admit(&job("j", Some(cpu(7)))), Admission::Rejected);
        assert_eq!(gate.admit(&job("k", Some(cpu(6)))), Admission::Admitted);
    }

    #[test]
    fn test_overused_cluster_has_empty_budget() {
        let mut gate = AdmissionGate::open(&[node(cpu(10), cpu(20), true)], &[], 1.2);
        assert!(gate.idle().is_empty());
        assert_eq!(gate.admit(&job("j", Some(cpu(1)))), Admission::Rejected);
        assert_eq!(
            gate.admit(&job("empty", Some(ResourceVector::empty()))),
            Admission::Admitted
        );
        assert_eq!(gate.admit(&job("be", None)), Admission::BestEffort);
    }

    #[test]
    fn test_missing_dimension_in_budget_rejects() {
        let mut gate = AdmissionGate::with_budget(cpu(10), ResourceVector::empty());
        let wants_memory = cpu(1).with(MEMORY, Quantity::from_units(1));
        assert_eq!(gate.admit(&job("j", Some(wants_memory))), Admission::Rejected);
    }

    #[test]
    fn test_factor_argument() {
        assert_eq!(overcommit_factor(&Arguments::new()), 1.2);
        assert_eq!(
            overcommit_factor(&Arguments::new().with(OVERCOMMIT_FACTOR_KEY, "2.5")),
            2.5
        );
        assert_eq!(
            overcommit_factor(&Arguments::new().with(OVERCOMMIT_FACTOR_KEY, "lots")),
            1.2
        );
        assert_eq!(
            overcommit_factor(&Arguments::new().with(OVERCOMMIT_FACTOR_KEY, "1e30")),
            1.2
        );
    }

    #[test]
    fn test_oversized_factor_gives_empty_budget() {
        let mut gate = AdmissionGate::open(&[node(cpu(10), cpu(0), true)], &[], 1e30);
        assert!(gate.idle().is_empty());
        assert_eq!(gate.admit(&job("j", Some(cpu(1)))), Admission::Rejected);
        assert_eq!(gate.admit(&job("be", None)), Admission::BestEffort);
    }

    #[test]
    fn test_overflowing_sums_do_not_panic() {
        let huge = ResourceVector::empty().with(CPU, Quantity::from_milli(u128::MAX / 2 + 1));

        let gate = AdmissionGate::open(
            &[node(huge.clone(), cpu(0), true), node(huge.clone(), cpu(0), true)],
            &[],
            1.0,
        );
        assert!(gate.idle().is_empty());

        let mut gate = AdmissionGate::with_budget(huge.clone(), huge.clone());
        assert_eq!(gate.admit(&job("j", Some(huge.clone()))), Admission::Rejected);
        assert_eq!(gate.inqueue(), &huge);
    }
}
