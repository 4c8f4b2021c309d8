//! The workflow model and its YAML wire format.

use std::collections::HashMap;
use std::collections::HashSet;

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use joblet_core::JobId;
use joblet_core::JobSpec;
use joblet_core::JobStatus;
use joblet_core::NetworkMode;
use joblet_core::ResourceLimits;
use joblet_core::UploadSpec;

use crate::parser::ParseError;
use crate::parser::parse_requirement;
use crate::requirement::Requirement;

/// One upload entry in the workflow YAML format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WorkflowUpload {
    /// The client-side source path the transport streams from.
    pub source: String,
    /// The destination path inside the sandbox.
    pub target: String,
    /// The file mode for the destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// One job entry in the workflow YAML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WorkflowJobFile {
    /// The command to execute.
    pub command: String,
    /// The argument vector.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// The runtime specification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    /// The volumes to mount.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    /// The client uploads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uploads: Vec<WorkflowUpload>,
    /// The environment for the command.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    /// The maximum CPU percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu: Option<u32>,
    /// The maximum memory, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<u64>,
    /// The maximum I/O throughput, in bytes per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iobps: Option<u64>,
    /// The CPU core mask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<String>,
    /// The maximum number of PIDs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pids: Option<u32>,
    /// The network mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// The number of GPUs to allocate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<u32>,
    /// A dependency requirement expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<String>,
    /// Sugar for an `AND` of `<name>=COMPLETED` requirements.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// A workflow definition in its YAML wire format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WorkflowFile {
    /// The jobs, keyed by in-workflow name.
    pub jobs: IndexMap<String, WorkflowJobFile>,
}

impl WorkflowFile {
    /// Parses a workflow definition from YAML bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, WorkflowError> {
        serde_yaml_ng::from_slice(bytes).map_err(|e| WorkflowError::Format(e.to_string()))
    }

    /// Serialises the workflow definition back to YAML.
    pub fn to_yaml(&self) -> Result<String, WorkflowError> {
        serde_yaml_ng::to_string(self).map_err(|e| WorkflowError::Format(e.to_string()))
    }
}

/// Error type for workflow validation and parsing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowError {
    /// The YAML could not be parsed.
    #[error("invalid workflow definition: {0}")]
    Format(String),
    /// The workflow has no jobs.
    #[error("a workflow must define at least one job")]
    Empty,
    /// A requirement could not be parsed.
    #[error("invalid requirement for job `{job}`: {source}")]
    Requirement {
        /// The job whose requirement failed to parse.
        job: String,
        /// The parse error.
        #[source]
        source: ParseError,
    },
    /// A requirement references a job that does not exist.
    #[error("job `{job}` requires unknown job `{referenced}`")]
    UnknownReference {
        /// The job whose requirement has the bad reference.
        job: String,
        /// The referenced name.
        referenced: String,
    },
    /// The dependency graph has a cycle.
    #[error("the workflow dependency graph contains a cycle")]
    Cycle,
}

/// The status of a workflow.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// At least one job has not reached a terminal status.
    Running,
    /// Every job completed.
    Completed,
    /// Every job is terminal and at least one failed.
    Failed,
    /// Every job is terminal, none failed, and at least one was
    /// canceled.
    Canceled,
}

impl WorkflowStatus {
    /// Determines if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One job tracked by a workflow.
#[derive(Debug, Clone)]
pub struct WorkflowJob {
    /// The in-workflow name.
    pub name: String,
    /// The specification derived from the workflow file.
    pub spec: JobSpec,
    /// The dependency requirement, if any.
    pub requirement: Option<Requirement>,
    /// The client upload sources, index-aligned with the spec's uploads.
    pub upload_sources: Vec<String>,
    /// The identifier assigned at submission, if submitted.
    pub submitted: Option<JobId>,
    /// The job's last observed status.
    pub status: JobStatus,
}

impl WorkflowJob {
    /// Gets the key the job's status is cached under: the UUID once
    /// assigned, the in-workflow name before.
    fn status_key(&self) -> String {
        match self.submitted {
            Some(id) => id.to_string(),
            None => self.name.clone(),
        }
    }
}

/// Counters summarising a workflow's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkflowCounters {
    /// The total number of jobs.
    pub total: usize,
    /// The number of completed jobs.
    pub completed: usize,
    /// The number of failed or stopped jobs.
    pub failed: usize,
    /// The number of canceled jobs.
    pub canceled: usize,
}

/// The scheduling actions produced by a recomputation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Recomputation {
    /// Jobs whose requirements are now satisfied, in definition order.
    pub ready: Vec<String>,
    /// Jobs whose requirements became provably unsatisfiable.
    pub canceled: Vec<String>,
}

/// A workflow: a DAG of jobs with dependency requirements, tracked from
/// submission to a terminal status.
#[derive(Debug, Clone)]
pub struct Workflow {
    /// The workflow identifier.
    pub id: Uuid,
    /// The jobs, keyed by in-workflow name, in definition order.
    jobs: IndexMap<String, WorkflowJob>,
    /// The status cache keyed by each job's current status key.
    statuses: HashMap<String, JobStatus>,
    /// The workflow status.
    status: WorkflowStatus,
    /// When the workflow was accepted.
    pub created_at: DateTime<Utc>,
    /// When the workflow reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Validates a workflow file and builds the tracked workflow.
    ///
    /// Checks that every requirement parses, that every referenced name
    /// exists, and that the dependency graph is acyclic.
    pub fn from_file(file: &WorkflowFile) -> Result<Self, WorkflowError> {
        if file.jobs.is_empty() {
            return Err(WorkflowError::Empty);
        }

        let id = Uuid::new_v4();
        let names: HashSet<&String> = file.jobs.keys().collect();
        let mut jobs = IndexMap::with_capacity(file.jobs.len());
        let mut statuses = HashMap::with_capacity(file.jobs.len());

        for (name, entry) in &file.jobs {
            let requirement = build_requirement(name, entry)?;

            if let Some(requirement) = &requirement {
                for referenced in requirement.referenced_jobs() {
                    if !names.contains(&referenced) {
                        return Err(WorkflowError::UnknownReference {
                            job: name.clone(),
                            referenced,
                        });
                    }
                }
            }

            let (spec, upload_sources) = build_spec(id, entry);
            statuses.insert(name.clone(), JobStatus::Pending);
            jobs.insert(
                name.clone(),
                WorkflowJob {
                    name: name.clone(),
                    spec,
                    requirement,
                    upload_sources,
                    submitted: None,
                    status: JobStatus::Pending,
                },
            );
        }

        let workflow = Self {
            id,
            jobs,
            statuses,
            status: WorkflowStatus::Running,
            created_at: Utc::now(),
            ended_at: None,
        };
        workflow.check_acyclic()?;
        Ok(workflow)
    }

    /// Verifies the dependency graph has no cycles.
    fn check_acyclic(&self) -> Result<(), WorkflowError> {
        let mut graph = DiGraph::<&str, ()>::new();
        let mut nodes = HashMap::new();
        for name in self.jobs.keys() {
            nodes.insert(name.as_str(), graph.add_node(name.as_str()));
        }

        for (name, job) in &self.jobs {
            if let Some(requirement) = &job.requirement {
                for referenced in requirement.referenced_jobs() {
                    // Self-references are cycles of length one.
                    let from = nodes[name.as_str()];
                    let to = nodes[referenced.as_str()];
                    graph.add_edge(to, from, ());
                }
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(WorkflowError::Cycle);
        }

        Ok(())
    }

    /// Gets the workflow's status.
    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    /// Gets the tracked jobs in definition order.
    pub fn jobs(&self) -> impl Iterator<Item = &WorkflowJob> {
        self.jobs.values()
    }

    /// Gets one tracked job by name.
    pub fn job(&self, name: &str) -> Option<&WorkflowJob> {
        self.jobs.get(name)
    }

    /// Computes the progress counters.
    pub fn counters(&self) -> WorkflowCounters {
        let mut counters = WorkflowCounters {
            total: self.jobs.len(),
            ..Default::default()
        };
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Completed => counters.completed += 1,
                JobStatus::Failed | JobStatus::Stopped => counters.failed += 1,
                JobStatus::Canceled => counters.canceled += 1,
                _ => {}
            }
        }
        counters
    }

    /// Records a job's submission, rewriting every reference from its
    /// in-workflow name to the assigned UUID.
    pub fn record_submitted(&mut self, name: &str, id: JobId) {
        let uuid = id.to_string();

        if let Some(job) = self.jobs.get_mut(name) {
            job.submitted = Some(id);
            if let Some(status) = self.statuses.remove(name) {
                self.statuses.insert(uuid.clone(), status);
            }
        }

        for job in self.jobs.values_mut() {
            if let Some(requirement) = &mut job.requirement {
                requirement.rename_job(name, &uuid);
            }
        }
    }

    /// Records a status observation for a job, by status key.
    ///
    /// Returns `true` when the observation belongs to this workflow.
    pub fn record_status(&mut self, key: &str, status: JobStatus) -> bool {
        let Some(job) = self
            .jobs
            .values_mut()
            .find(|job| job.status_key() == key)
        else {
            return false;
        };

        job.status = status;
        self.statuses.insert(key.to_string(), status);
        true
    }

    /// Recomputes readiness and impossibility for unsubmitted jobs.
    ///
    /// Jobs whose requirements are satisfied are returned as ready; jobs
    /// whose requirements are provably unsatisfiable transition to
    /// `CANCELED`, which may cascade further impossibilities (handled by
    /// iterating to a fixed point). The workflow status and timestamps
    /// are refreshed afterwards.
    pub fn recompute(&mut self) -> Recomputation {
        let mut result = Recomputation::default();

        // Cancellations cascade: a canceled job is terminal, which can
        // make other requirements impossible.
        loop {
            let mut canceled = Vec::new();
            for job in self.jobs.values() {
                if job.submitted.is_some() || job.status != JobStatus::Pending {
                    continue;
                }

                if let Some(requirement) = &job.requirement {
                    if requirement.is_impossible(&self.statuses) {
                        canceled.push(job.name.clone());
                    }
                }
            }

            if canceled.is_empty() {
                break;
            }

            for name in canceled {
                // SAFETY: the name came from the jobs map above.
                let job = self.jobs.get_mut(&name).unwrap();
                job.status = JobStatus::Canceled;
                self.statuses.insert(job.status_key(), JobStatus::Canceled);
                result.canceled.push(name);
            }
        }

        for job in self.jobs.values() {
            if job.submitted.is_some() || job.status != JobStatus::Pending {
                continue;
            }

            let ready = job
                .requirement
                .as_ref()
                .map(|requirement| requirement.evaluate(&self.statuses))
                .unwrap_or(true);
            if ready {
                result.ready.push(job.name.clone());
            }
        }

        self.refresh_status();
        result
    }

    /// Refreshes the workflow-level status from the job statuses.
    ///
    /// The workflow is terminal iff every job is terminal: `COMPLETED`
    /// when everything completed, otherwise `FAILED` when anything
    /// failed, otherwise `CANCELED`.
    fn refresh_status(&mut self) {
        if self.status.is_terminal() {
            return;
        }

        if !self.jobs.values().all(|job| job.status.is_terminal()) {
            return;
        }

        let counters = self.counters();
        self.status = if counters.failed > 0 {
            WorkflowStatus::Failed
        } else if counters.canceled > 0 {
            WorkflowStatus::Canceled
        } else {
            WorkflowStatus::Completed
        };
        self.ended_at = Some(Utc::now());
    }
}

/// Builds a job's requirement from its file entry.
///
/// `requires` and `depends-on` compose with `AND`: the sugar lowers each
/// listed name to `<name>=COMPLETED`.
fn build_requirement(
    name: &str,
    entry: &WorkflowJobFile,
) -> Result<Option<Requirement>, WorkflowError> {
    use crate::requirement::Expr;

    let mut requirements: Vec<Requirement> = entry
        .depends_on
        .iter()
        .map(|name| Requirement::completed(name.clone()))
        .collect();

    if let Some(requires) = &entry.requires {
        requirements.push(parse_requirement(requires).map_err(|source| {
            WorkflowError::Requirement {
                job: name.to_string(),
                source,
            }
        })?);
    }

    let mut iter = requirements.into_iter();
    let first = match iter.next() {
        Some(first) => first,
        None => return Ok(None),
    };

    let combined = iter.fold(first, |acc, next| {
        Requirement::Expression(Expr::And(
            Box::new(requirement_to_expr(acc)),
            Box::new(requirement_to_expr(next)),
        ))
    });
    Ok(Some(combined))
}

/// Lowers a requirement to its expression form.
fn requirement_to_expr(requirement: Requirement) -> crate::requirement::Expr {
    use crate::requirement::CompareOp;
    use crate::requirement::Expr;

    match requirement {
        Requirement::Simple { job, status } => Expr::Comparison {
            job,
            op: CompareOp::Is(status),
        },
        Requirement::Expression(expr) => expr,
    }
}

/// Builds a job specification (and the aligned upload source list) from a
/// file entry.
fn build_spec(workflow_id: Uuid, entry: &WorkflowJobFile) -> (JobSpec, Vec<String>) {
    let uploads = entry
        .uploads
        .iter()
        .enumerate()
        .map(|(index, upload)| UploadSpec {
            index,
            destination: upload.target.clone().into(),
            mode: upload.mode.unwrap_or(joblet_core::DEFAULT_UPLOAD_MODE),
            // The size arrives with the stream; it is unknown at
            // definition time.
            size: 0,
        })
        .collect();

    let spec = JobSpec {
        command: entry.command.clone(),
        args: entry.args.clone(),
        env: entry.env.clone(),
        uploads,
        limits: ResourceLimits {
            max_cpu_percent: entry.max_cpu,
            max_memory_bytes: entry.max_memory,
            max_io_bps: entry.max_iobps,
            cpu_cores: entry.cpu_cores.clone(),
            max_pids: entry.max_pids,
            workspace_quota_bytes: None,
        },
        runtime: entry.runtime.clone(),
        network: entry
            .network
            .clone()
            .map(|mode| NetworkMode::try_from(mode).expect("network mode conversion is infallible"))
            .unwrap_or_default(),
        volumes: entry.volumes.clone(),
        schedule_at: None,
        workflow_id: Some(workflow_id),
        gpu_count: entry.gpus.unwrap_or(0),
        builder: false,
    };

    let sources = entry
        .uploads
        .iter()
        .map(|upload| upload.source.clone())
        .collect();
    (spec, sources)
}
