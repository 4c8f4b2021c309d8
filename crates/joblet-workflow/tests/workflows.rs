//! Tests for workflow parsing, validation, and scheduling.

use joblet_core::JobId;
use joblet_core::JobStatus;
use joblet_workflow::Workflow;
use joblet_workflow::WorkflowError;
use joblet_workflow::WorkflowFile;
use joblet_workflow::WorkflowStatus;
use pretty_assertions::assert_eq;

/// A three-job chain: `b` requires `a`, `c` requires both.
const CHAIN: &str = r#"
jobs:
  a:
    command: "true"
  b:
    command: "true"
    requires: a=COMPLETED
  c:
    command: "true"
    requires: a=COMPLETED AND b=COMPLETED
"#;

/// Parses a workflow file, panicking on failure.
fn parse(yaml: &str) -> WorkflowFile {
    WorkflowFile::parse(yaml.as_bytes()).expect("workflow should parse")
}

/// Submits a ready job by name, simulating the manager assigning an id.
fn submit(workflow: &mut Workflow, name: &str) -> JobId {
    let id = JobId::new();
    workflow.record_submitted(name, id);
    id
}

/// Drives a submitted job to a terminal status.
fn finish(workflow: &mut Workflow, id: JobId, status: JobStatus) {
    assert!(workflow.record_status(&id.to_string(), status));
}

#[test]
fn chain_completes_in_dependency_order() {
    let mut workflow = Workflow::from_file(&parse(CHAIN)).unwrap();

    // Only `a` is ready initially.
    let recomputation = workflow.recompute();
    assert_eq!(recomputation.ready, vec!["a"]);
    assert!(recomputation.canceled.is_empty());

    let a = submit(&mut workflow, "a");
    finish(&mut workflow, a, JobStatus::Completed);

    let recomputation = workflow.recompute();
    assert_eq!(recomputation.ready, vec!["b"]);

    let b = submit(&mut workflow, "b");
    finish(&mut workflow, b, JobStatus::Completed);

    let recomputation = workflow.recompute();
    assert_eq!(recomputation.ready, vec!["c"]);

    let c = submit(&mut workflow, "c");
    finish(&mut workflow, c, JobStatus::Completed);
    workflow.recompute();

    assert_eq!(workflow.status(), WorkflowStatus::Completed);
    let counters = workflow.counters();
    assert_eq!(counters.total, 3);
    assert_eq!(counters.completed, 3);
    assert_eq!(counters.failed + counters.canceled, 0);
}

#[test]
fn failure_cascades_to_cancellation() {
    let mut workflow = Workflow::from_file(&parse(CHAIN)).unwrap();

    assert_eq!(workflow.recompute().ready, vec!["a"]);
    let a = submit(&mut workflow, "a");
    finish(&mut workflow, a, JobStatus::Failed);

    // `b` becomes impossible, which cascades to `c`; neither ever ran.
    let recomputation = workflow.recompute();
    assert!(recomputation.ready.is_empty());
    assert_eq!(recomputation.canceled, vec!["b", "c"]);

    assert_eq!(workflow.status(), WorkflowStatus::Failed);
    let counters = workflow.counters();
    assert_eq!(counters.failed, 1);
    assert_eq!(counters.canceled, 2);
    assert_eq!(
        workflow.job("b").unwrap().status,
        JobStatus::Canceled
    );
    assert!(workflow.job("b").unwrap().submitted.is_none());
}

#[test]
fn or_requirement_survives_one_failed_branch() {
    let yaml = r#"
jobs:
  fast:
    command: "true"
  slow:
    command: "true"
  merge:
    command: "true"
    requires: fast=COMPLETED OR slow=COMPLETED
"#;
    let mut workflow = Workflow::from_file(&parse(yaml)).unwrap();

    let ready = workflow.recompute().ready;
    assert_eq!(ready, vec!["fast", "slow"]);

    let fast = submit(&mut workflow, "fast");
    let slow = submit(&mut workflow, "slow");
    finish(&mut workflow, fast, JobStatus::Failed);

    // One branch is dead but the other is still live.
    let recomputation = workflow.recompute();
    assert!(recomputation.canceled.is_empty());

    finish(&mut workflow, slow, JobStatus::Completed);
    assert_eq!(workflow.recompute().ready, vec!["merge"]);
}

#[test]
fn depends_on_lowers_to_completed_requirements() {
    let yaml = r#"
jobs:
  a:
    command: "true"
  b:
    command: "true"
  c:
    command: "true"
    depends-on: [a, b]
"#;
    let mut workflow = Workflow::from_file(&parse(yaml)).unwrap();

    let ready = workflow.recompute().ready;
    assert_eq!(ready, vec!["a", "b"]);

    let a = submit(&mut workflow, "a");
    let b = submit(&mut workflow, "b");
    finish(&mut workflow, a, JobStatus::Completed);
    assert!(workflow.recompute().ready.is_empty());

    finish(&mut workflow, b, JobStatus::Completed);
    assert_eq!(workflow.recompute().ready, vec!["c"]);
}

#[test]
fn submission_rewrites_requirement_references() {
    let mut workflow = Workflow::from_file(&parse(CHAIN)).unwrap();
    workflow.recompute();

    let a = submit(&mut workflow, "a");

    // After rewriting, the requirement of `b` references the UUID.
    let b = workflow.job("b").unwrap();
    assert_eq!(
        b.requirement.as_ref().unwrap().referenced_jobs(),
        vec![a.to_string()]
    );

    // Status updates keyed by the UUID drive readiness.
    finish(&mut workflow, a, JobStatus::Completed);
    assert_eq!(workflow.recompute().ready, vec!["b"]);
}

#[test]
fn cycles_are_rejected() {
    let yaml = r#"
jobs:
  a:
    command: "true"
    requires: b=COMPLETED
  b:
    command: "true"
    requires: a=COMPLETED
"#;
    assert_eq!(
        Workflow::from_file(&parse(yaml)).unwrap_err(),
        WorkflowError::Cycle
    );

    let yaml = r#"
jobs:
  a:
    command: "true"
    requires: a=COMPLETED
"#;
    assert_eq!(
        Workflow::from_file(&parse(yaml)).unwrap_err(),
        WorkflowError::Cycle
    );
}

#[test]
fn unknown_references_are_rejected() {
    let yaml = r#"
jobs:
  a:
    command: "true"
    requires: ghost=COMPLETED
"#;
    assert_eq!(
        Workflow::from_file(&parse(yaml)).unwrap_err(),
        WorkflowError::UnknownReference {
            job: "a".to_string(),
            referenced: "ghost".to_string(),
        }
    );
}

#[test]
fn empty_workflows_are_rejected() {
    assert_eq!(
        Workflow::from_file(&WorkflowFile::default()).unwrap_err(),
        WorkflowError::Empty
    );
}

#[test]
fn counters_never_exceed_the_total_and_terminal_matches_exhaustion() {
    // Drive the chain through every combination of terminal outcomes for
    // `a` and check the counter invariant at each step.
    for outcome in [JobStatus::Completed, JobStatus::Failed, JobStatus::Stopped] {
        let mut workflow = Workflow::from_file(&parse(CHAIN)).unwrap();

        let check = |workflow: &Workflow| {
            let counters = workflow.counters();
            let terminal_count = counters.completed + counters.failed + counters.canceled;
            assert!(terminal_count <= counters.total);
            assert_eq!(
                workflow.status().is_terminal(),
                terminal_count == counters.total,
                "workflow must be terminal exactly when every job is"
            );
        };

        check(&workflow);
        workflow.recompute();
        check(&workflow);

        let a = submit(&mut workflow, "a");
        finish(&mut workflow, a, outcome);
        workflow.recompute();
        check(&workflow);

        if outcome == JobStatus::Completed {
            let b = submit(&mut workflow, "b");
            finish(&mut workflow, b, JobStatus::Completed);
            workflow.recompute();
            check(&workflow);

            let c = submit(&mut workflow, "c");
            finish(&mut workflow, c, JobStatus::Completed);
            workflow.recompute();
            check(&workflow);
            assert_eq!(workflow.status(), WorkflowStatus::Completed);
        } else {
            // Any non-completed terminal for `a` cancels the rest.
            assert_eq!(workflow.status(), WorkflowStatus::Failed);
        }
    }
}

#[test]
fn yaml_round_trips_through_the_model() {
    let yaml = r#"
jobs:
  build:
    command: make
    args: [all]
    runtime: gcc@13
    env:
      CFLAGS: -O2
    max-cpu: 200
    max-memory: 1073741824
    network: none
    uploads:
      - source: ./Makefile
        target: Makefile
  test:
    command: make
    args: [check]
    volumes: [cache]
    depends-on: [build]
  report:
    command: ./report.sh
    requires: build=COMPLETED AND test IN (COMPLETED, STOPPED)
"#;
    let parsed = parse(yaml);
    let serialised = parsed.to_yaml().unwrap();
    let reparsed = WorkflowFile::parse(serialised.as_bytes()).unwrap();
    assert_eq!(parsed, reparsed);
}

#[test]
fn file_entries_carry_limits_into_job_specs() {
    let yaml = r#"
jobs:
  train:
    command: python
    args: [train.py]
    runtime: python-3.11-ml
    max-cpu: 400
    max-memory: 8589934592
    max-iobps: 104857600
    cpu-cores: 0-3
    gpus: 1
    network: bridge
"#;
    let workflow = Workflow::from_file(&parse(yaml)).unwrap();
    let job = workflow.job("train").unwrap();

    assert_eq!(job.spec.limits.max_cpu_percent, Some(400));
    assert_eq!(job.spec.limits.max_memory_bytes, Some(8 << 30));
    assert_eq!(job.spec.limits.max_io_bps, Some(100 << 20));
    assert_eq!(job.spec.limits.cpu_cores.as_deref(), Some("0-3"));
    assert_eq!(job.spec.gpu_count, 1);
    assert_eq!(job.spec.runtime.as_deref(), Some("python-3.11-ml"));
    assert_eq!(job.spec.workflow_id, Some(workflow.id));
}
