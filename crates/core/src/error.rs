use std::fmt;

/// Errors surfaced by a reconciliation pass and the placement helpers.
#[derive(Debug, thiserror::Error)]
pub enum StewardError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("reading management state: {0:#}")]
    ManagementState(anyhow::Error),
    #[error("deleting namespace {namespace}: {error:#}")]
    NamespaceDelete { namespace: String, error: anyhow::Error },
    #[error("updating status: {0:#}")]
    StatusUpdate(anyhow::Error),
    #[error("{0}")]
    Aggregate(AggregateError),
    #[error("sync cancelled")]
    Cancelled,
}

pub type StewardResult<T> = Result<T, StewardError>;

/// Ordered, non-empty list of errors collected during one pass.
#[derive(Debug)]
pub struct AggregateError(Vec<anyhow::Error>);

impl AggregateError {
    /// Returns `None` for an empty list so that "no errors" never becomes an error value.
    pub fn new(errors: Vec<anyhow::Error>) -> Option<Self> {
        if errors.is_empty() { None } else { Some(Self(errors)) }
    }

    pub fn errors(&self) -> &[anyhow::Error] { &self.0 }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_messages(&self.0))
    }
}

impl std::error::Error for AggregateError {}

/// Joins error texts (with their context chain) using `\n`. No escaping is applied.
pub fn join_messages(errors: &[anyhow::Error]) -> String {
    errors.iter().map(|e| format!("{:#}", e)).collect::<Vec<_>>().join("\n")
}

/// Folds a list of errors into the outcome of a pass: empty is success.
pub fn aggregate(errors: Vec<anyhow::Error>) -> StewardResult<()> {
    match AggregateError::new(errors) {
        None => Ok(()),
        Some(agg) => Err(StewardError::Aggregate(agg)),
    }
}
