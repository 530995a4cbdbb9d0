//! The slice of a scheduling session that admission plugins see.

use std::fmt;

use clusterinfo_resource::ResourceVector;
use tracing::debug;

/// A node as seen by the scheduler at session open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub allocatable: ResourceVector,

    /// Resources already requested by tasks placed on the node.
    pub used: ResourceVector,
    pub ready: bool,
}

/// Job lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// Waiting for admission.
    Pending,

    /// Admitted; its pods may now be created.
    Inqueue,
    Running,
    Completed,
}

/// A gang of tasks scheduled together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub namespace: String,
    pub name: String,

    /// Smallest footprint the job accepts. `None` marks a best-effort job.
    pub min_resources: Option<ResourceVector>,
    pub phase: JobPhase,
}

impl JobInfo {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        min_resources: Option<ResourceVector>,
        phase: JobPhase,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            min_resources,
            phase,
        }
    }

    /// `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for JobInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Decides whether a pending job may be enqueued. Called once per candidate.
pub type EnqueuePredicate = Box<dyn FnMut(&JobInfo) -> bool + Send>;

/// What the scheduler exposes to plugins for one session.
pub trait SchedulingSession {
    fn nodes(&self) -> &[NodeInfo];

    fn jobs(&self) -> &[JobInfo];

    /// Register an enqueue predicate on behalf of `plugin`.
    fn add_job_enqueueable_fn(&mut self, plugin: &str, predicate: EnqueuePredicate);
}

/// An in-process scheduling session.
pub struct Session {
    nodes: Vec<NodeInfo>,
    jobs: Vec<JobInfo>,
    predicates: Vec<(String, EnqueuePredicate)>,
}

impl Session {
    pub fn new(nodes: Vec<NodeInfo>, jobs: Vec<JobInfo>) -> Self {
        Self {
            nodes,
            jobs,
            predicates: Vec::new(),
        }
    }

    /// Ask every registered predicate about `job`. All must agree.
    ///
    /// Evaluation stops at the first rejection, so later predicates never
    /// record a job an earlier one turned away.
    pub fn job_enqueueable(&mut self, job: &JobInfo) -> bool {
        for (plugin, predicate) in self.predicates.iter_mut() {
            if !predicate(job) {
                debug!(plugin = %plugin, job = %job, "Job rejected for enqueue");
                return false;
            }
        }
        true
    }

    pub fn jobs_mut(&mut self) -> &mut [JobInfo] {
        &mut self.jobs
    }

    pub fn predicate_count(&self) -> usize {
        self.predicates.len()
    }

    /// Drop every registered predicate and the state they own.
    pub fn close(&mut self) {
        self.predicates.clear();
    }
}

impl SchedulingSession for Session {
    fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    fn jobs(&self) -> &[JobInfo] {
        &self.jobs
    }

    fn add_job_enqueueable_fn(&mut self, plugin: &str, predicate: EnqueuePredicate) {
        self.predicates.push((plugin.to_string(), predicate));
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("nodes", &self.nodes.len())
            .field("jobs", &self.jobs.len())
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_predicates_must_admit() {
        let mut session = Session::new(vec![], vec![]);
        session.add_job_enqueueable_fn("yes", Box::new(|_| true));
        session.add_job_enqueueable_fn("no", Box::new(|_| false));

        let job = JobInfo::new("default", "j", None, JobPhase::Pending);
        assert!(!session.job_enqueueable(&job));

        session.close();
        assert_eq!(session.predicate_count(), 0);
        assert!(session.job_enqueueable(&job));
    }

    #[test]
    fn test_job_key() {
        let job = JobInfo::new("team-a", "train", None, JobPhase::Pending);
        assert_eq!(job.key(), "team-a/train");
        assert_eq!(job.to_string(), "team-a/train");
    }
}
