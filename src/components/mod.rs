//! Pure decision components shared by both pipeline stages
//!
//! Nothing in here performs I/O; the workers feed collaborator output in and
//! act on what comes back.

pub mod decision_engine;
pub mod verdict;

pub use decision_engine::{
    ClassifierDecision, Decision, DecisionConfig, DecisionEngine, VerdictDecision,
};
pub use verdict::{parse_verdict, verdict_schema, Verdict, VerdictError};
