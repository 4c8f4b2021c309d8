//! The dependency requirement model.
//!
//! A requirement is a predicate over workflow job statuses that must be
//! true before a job is released for submission. The two variants —
//! simple (`build=COMPLETED`) and expression (a boolean tree) — share the
//! same operations: evaluation against the current status map,
//! impossibility analysis, and enumeration of referenced jobs.

use std::collections::HashMap;
use std::fmt;

use joblet_core::JobStatus;

/// The comparison applied to one referenced job's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareOp {
    /// The job's status equals the literal.
    Is(JobStatus),
    /// The job's status does not equal the literal.
    IsNot(JobStatus),
    /// The job's status is one of the literals.
    In(Vec<JobStatus>),
    /// The job's status is none of the literals.
    NotIn(Vec<JobStatus>),
}

/// A node in a requirement expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// A comparison against one job's status.
    Comparison {
        /// The referenced job (in-workflow name, or UUID after
        /// rewriting).
        job: String,
        /// The comparison operator and literals.
        op: CompareOp,
    },
    /// Logical negation.
    Not(Box<Expr>),
    /// Logical conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Logical disjunction.
    Or(Box<Expr>, Box<Expr>),
}

/// A job's dependency requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// A single job-status equality (the `depends-on` sugar lowers to
    /// this).
    Simple {
        /// The referenced job.
        job: String,
        /// The expected status.
        status: JobStatus,
    },
    /// A boolean expression tree.
    Expression(Expr),
}

/// Looks a job's status up, defaulting to `PENDING` for jobs that have
/// not been observed yet.
fn status_of(statuses: &HashMap<String, JobStatus>, job: &str) -> JobStatus {
    statuses.get(job).copied().unwrap_or(JobStatus::Pending)
}

impl CompareOp {
    /// Evaluates the comparison against a status.
    fn evaluate(&self, status: JobStatus) -> bool {
        match self {
            Self::Is(expected) => status == *expected,
            Self::IsNot(expected) => status != *expected,
            Self::In(expected) => expected.contains(&status),
            Self::NotIn(expected) => !expected.contains(&status),
        }
    }
}

impl Expr {
    /// Evaluates the expression against the current status map.
    pub fn evaluate(&self, statuses: &HashMap<String, JobStatus>) -> bool {
        match self {
            Self::Comparison { job, op } => op.evaluate(status_of(statuses, job)),
            Self::Not(inner) => !inner.evaluate(statuses),
            Self::And(left, right) => left.evaluate(statuses) && right.evaluate(statuses),
            Self::Or(left, right) => left.evaluate(statuses) || right.evaluate(statuses),
        }
    }

    /// Determines if the expression can be proven unsatisfiable in every
    /// reachable future state.
    ///
    /// The analysis is conservative: a terminal job's status never
    /// changes again, so any comparison against it is decided; anything
    /// else is assumed still reachable. `AND` is impossible when any
    /// child is, `OR` when all children are, and `NOT` when its child is
    /// decided true.
    pub fn is_impossible(&self, statuses: &HashMap<String, JobStatus>) -> bool {
        match self {
            Self::Comparison { job, op } => {
                let status = status_of(statuses, job);
                status.is_terminal() && !op.evaluate(status)
            }
            Self::Not(inner) => inner.is_certain(statuses),
            Self::And(left, right) => {
                left.is_impossible(statuses) || right.is_impossible(statuses)
            }
            Self::Or(left, right) => left.is_impossible(statuses) && right.is_impossible(statuses),
        }
    }

    /// Determines if the expression is decided true in every reachable
    /// future state (the dual of [`is_impossible`][Self::is_impossible]).
    fn is_certain(&self, statuses: &HashMap<String, JobStatus>) -> bool {
        match self {
            Self::Comparison { job, op } => {
                let status = status_of(statuses, job);
                status.is_terminal() && op.evaluate(status)
            }
            Self::Not(inner) => inner.is_impossible(statuses),
            Self::And(left, right) => left.is_certain(statuses) && right.is_certain(statuses),
            Self::Or(left, right) => left.is_certain(statuses) || right.is_certain(statuses),
        }
    }

    /// Collects the names of the jobs the expression references.
    pub fn referenced_jobs(&self) -> Vec<String> {
        let mut jobs = Vec::new();
        self.collect_referenced(&mut jobs);
        jobs
    }

    /// Accumulates referenced job names depth-first.
    fn collect_referenced(&self, jobs: &mut Vec<String>) {
        match self {
            Self::Comparison { job, .. } => {
                if !jobs.contains(job) {
                    jobs.push(job.clone());
                }
            }
            Self::Not(inner) => inner.collect_referenced(jobs),
            Self::And(left, right) | Self::Or(left, right) => {
                left.collect_referenced(jobs);
                right.collect_referenced(jobs);
            }
        }
    }

    /// Rewrites every reference to a job name.
    ///
    /// Used when the job manager assigns a UUID at submission: the
    /// in-workflow name is replaced so the expression tree and the status
    /// cache share a single source of truth.
    pub fn rename_job(&mut self, from: &str, to: &str) {
        match self {
            Self::Comparison { job, .. } => {
                if job == from {
                    *job = to.to_string();
                }
            }
            Self::Not(inner) => inner.rename_job(from, to),
            Self::And(left, right) | Self::Or(left, right) => {
                left.rename_job(from, to);
                right.rename_job(from, to);
            }
        }
    }

    /// Gets the precedence level of the expression's root, for
    /// parenthesis-free display.
    fn precedence(&self) -> u8 {
        match self {
            Self::Or(..) => 0,
            Self::And(..) => 1,
            Self::Not(..) => 2,
            Self::Comparison { .. } => 3,
        }
    }

    /// Formats a child, parenthesising when its precedence is lower than
    /// the parent requires.
    fn fmt_child(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        if self.precedence() < min {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Comparison { job, op } => match op {
                CompareOp::Is(status) => write!(f, "{job}={status}"),
                CompareOp::IsNot(status) => write!(f, "{job}!={status}"),
                CompareOp::In(statuses) => {
                    write!(f, "{job} IN ({})", format_status_list(statuses))
                }
                CompareOp::NotIn(statuses) => {
                    write!(f, "{job} NOT IN ({})", format_status_list(statuses))
                }
            },
            Self::Not(inner) => {
                write!(f, "NOT ")?;
                inner.fmt_child(f, 2)
            }
            Self::And(left, right) => {
                left.fmt_child(f, 1)?;
                write!(f, " AND ")?;
                right.fmt_child(f, 1)
            }
            Self::Or(left, right) => {
                left.fmt_child(f, 0)?;
                write!(f, " OR ")?;
                right.fmt_child(f, 0)
            }
        }
    }
}

/// Formats a status list for display.
fn format_status_list(statuses: &[JobStatus]) -> String {
    statuses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Requirement {
    /// Creates the requirement the `depends-on` sugar lowers to: the
    /// referenced job must be `COMPLETED`.
    pub fn completed(job: impl Into<String>) -> Self {
        Self::Simple {
            job: job.into(),
            status: JobStatus::Completed,
        }
    }

    /// Evaluates the requirement against the current status map.
    pub fn evaluate(&self, statuses: &HashMap<String, JobStatus>) -> bool {
        match self {
            Self::Simple { job, status } => status_of(statuses, job) == *status,
            Self::Expression(expr) => expr.evaluate(statuses),
        }
    }

    /// Determines if the requirement can be proven unsatisfiable.
    ///
    /// A simple requirement is impossible when the referenced job is in a
    /// terminal status that differs from the expected one.
    pub fn is_impossible(&self, statuses: &HashMap<String, JobStatus>) -> bool {
        match self {
            Self::Simple { job, status } => {
                let current = status_of(statuses, job);
                current.is_terminal() && current != *status
            }
            Self::Expression(expr) => expr.is_impossible(statuses),
        }
    }

    /// Collects the names of the jobs the requirement references.
    pub fn referenced_jobs(&self) -> Vec<String> {
        match self {
            Self::Simple { job, .. } => vec![job.clone()],
            Self::Expression(expr) => expr.referenced_jobs(),
        }
    }

    /// Rewrites every reference to a job name.
    pub fn rename_job(&mut self, from: &str, to: &str) {
        match self {
            Self::Simple { job, .. } => {
                if job == from {
                    *job = to.to_string();
                }
            }
            Self::Expression(expr) => expr.rename_job(from, to),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple { job, status } => write!(f, "{job}={status}"),
            Self::Expression(expr) => expr.fmt(f),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Builds a status map from pairs.
    fn statuses(pairs: &[(&str, JobStatus)]) -> HashMap<String, JobStatus> {
        pairs
            .iter()
            .map(|(name, status)| (name.to_string(), *status))
            .collect()
    }

    /// Builds an equality comparison.
    fn is(job: &str, status: JobStatus) -> Expr {
        Expr::Comparison {
            job: job.to_string(),
            op: CompareOp::Is(status),
        }
    }

    #[test]
    fn unknown_jobs_evaluate_as_pending() {
        let req = Requirement::completed("build");
        assert!(!req.evaluate(&statuses(&[])));
        assert!(!req.is_impossible(&statuses(&[])));
    }

    #[test]
    fn simple_requirement_is_impossible_at_a_different_terminal() {
        let req = Requirement::completed("build");
        assert!(req.is_impossible(&statuses(&[("build", JobStatus::Failed)])));
        assert!(!req.is_impossible(&statuses(&[("build", JobStatus::Running)])));
        assert!(!req.is_impossible(&statuses(&[("build", JobStatus::Completed)])));
    }

    #[test]
    fn or_requires_all_branches_dead() {
        let expr = Expr::Or(
            Box::new(is("a", JobStatus::Completed)),
            Box::new(is("b", JobStatus::Completed)),
        );

        assert!(!expr.is_impossible(&statuses(&[("a", JobStatus::Failed)])));
        assert!(expr.is_impossible(&statuses(&[
            ("a", JobStatus::Failed),
            ("b", JobStatus::Canceled),
        ])));
    }

    #[test]
    fn and_dies_with_any_branch() {
        let expr = Expr::And(
            Box::new(is("a", JobStatus::Completed)),
            Box::new(is("b", JobStatus::Completed)),
        );

        assert!(expr.is_impossible(&statuses(&[("a", JobStatus::Failed)])));
        assert!(!expr.is_impossible(&statuses(&[("a", JobStatus::Completed)])));
    }

    #[test]
    fn not_is_impossible_once_its_child_is_decided_true() {
        let expr = Expr::Not(Box::new(is("a", JobStatus::Completed)));

        // The inner comparison is decided true forever.
        assert!(expr.is_impossible(&statuses(&[("a", JobStatus::Completed)])));
        // Still undecided while the job runs.
        assert!(!expr.is_impossible(&statuses(&[("a", JobStatus::Running)])));
        // Decided false forever, so the negation is certain.
        assert!(!expr.is_impossible(&statuses(&[("a", JobStatus::Failed)])));
    }

    #[test]
    fn in_and_not_in_track_terminal_membership() {
        let expr = Expr::Comparison {
            job: "a".to_string(),
            op: CompareOp::In(vec![JobStatus::Completed, JobStatus::Stopped]),
        };
        assert!(expr.is_impossible(&statuses(&[("a", JobStatus::Failed)])));
        assert!(!expr.is_impossible(&statuses(&[("a", JobStatus::Stopped)])));

        let expr = Expr::Comparison {
            job: "a".to_string(),
            op: CompareOp::NotIn(vec![JobStatus::Failed]),
        };
        assert!(expr.is_impossible(&statuses(&[("a", JobStatus::Failed)])));
        assert!(!expr.is_impossible(&statuses(&[("a", JobStatus::Completed)])));
    }

    #[test]
    fn rename_rewrites_every_reference() {
        let mut expr = Expr::And(
            Box::new(is("a", JobStatus::Completed)),
            Box::new(Expr::Not(Box::new(is("a", JobStatus::Failed)))),
        );
        expr.rename_job("a", "01234567-89ab-cdef-0123-456789abcdef");
        assert_eq!(
            expr.referenced_jobs(),
            vec!["01234567-89ab-cdef-0123-456789abcdef".to_string()]
        );
    }

    #[test]
    fn display_respects_precedence() {
        let expr = Expr::Or(
            Box::new(Expr::And(
                Box::new(is("a", JobStatus::Completed)),
                Box::new(is("b", JobStatus::Completed)),
            )),
            Box::new(Expr::Not(Box::new(Expr::Or(
                Box::new(is("c", JobStatus::Failed)),
                Box::new(is("d", JobStatus::Failed)),
            )))),
        );
        assert_eq!(
            expr.to_string(),
            "a=COMPLETED AND b=COMPLETED OR NOT (c=FAILED OR d=FAILED)"
        );
    }
}
