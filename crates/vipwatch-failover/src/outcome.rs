//! Typed result of best-effort cloud mutations.

use std::fmt;

use vipwatch_cloud::CloudResult;

/// What happened to a best-effort call whose failure must not stop the
/// caller. Keeps an expected absence apart from an unexpected failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    NotFound,
    Failed(String),
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        *self == Outcome::Ok
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

impl From<CloudResult<()>> for Outcome {
    fn from(result: CloudResult<()>) -> Self {
        match result {
            Ok(()) => Outcome::Ok,
            Err(e) if e.is_not_found() => Outcome::NotFound,
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok => f.write_str("ok"),
            Outcome::NotFound => f.write_str("not found"),
            Outcome::Failed(detail) => write!(f, "failed: {detail}"),
        }
    }
}
