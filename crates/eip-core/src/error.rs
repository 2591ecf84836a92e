use thiserror::Error;

/// Per-indicator failure from the Source Connector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source unavailable for {indicator}: {reason}")]
    Unavailable { indicator: String, reason: String },
    #[error("malformed source response for {indicator}: {reason}")]
    Format { indicator: String, reason: String },
}

impl SourceError {
    pub fn indicator(&self) -> &str {
        match self {
            SourceError::Unavailable { indicator, .. } | SourceError::Format { indicator, .. } => {
                indicator
            }
        }
    }
}

/// Why a raw row was dropped during cleansing. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("value is null")]
    MissingValue,
    #[error("value {0:?} is not numeric")]
    NonNumericValue(String),
    #[error("value {0:?} is not finite")]
    NonFiniteValue(String),
    #[error("observation date is missing")]
    MissingDate,
    #[error("observation date {0:?} is malformed")]
    MalformedDate(String),
    #[error("observation date {0} is in the future")]
    FutureDate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InsightServiceError {
    #[error("insight service timed out after {0}s")]
    Timeout(u64),
    #[error("insight service quota exhausted: {0}")]
    Quota(String),
    #[error("insight service rejected credentials: {0}")]
    Auth(String),
    #[error("insight service error: {0}")]
    Service(String),
    #[error("insight generator not configured")]
    NotConfigured,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid indicator code {0:?}")]
    InvalidCode(String),
    #[error("invalid aggregate column {0:?}")]
    InvalidColumn(String),
    #[error("duplicate indicator code {0:?}")]
    DuplicateCode(String),
    #[error("duplicate aggregate column {0:?}")]
    DuplicateColumn(String),
}

/// Run-level errors. Only storage and aggregation-swap failures abort a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("source unavailable for {indicator}: {reason}")]
    SourceUnavailable { indicator: String, reason: String },
    #[error("malformed source response for {indicator}: {reason}")]
    SourceFormat { indicator: String, reason: String },
    #[error("no indicator could be fetched ({0} attempted)")]
    NoIndicatorsLanded(usize),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("aggregation failed: {0}")]
    AggregationFailure(String),
    #[error(transparent)]
    InsightService(#[from] InsightServiceError),
}

impl From<SourceError> for PipelineError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Unavailable { indicator, reason } => {
                PipelineError::SourceUnavailable { indicator, reason }
            }
            SourceError::Format { indicator, reason } => {
                PipelineError::SourceFormat { indicator, reason }
            }
        }
    }
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::NoIndicatorsLanded(_)
                | PipelineError::StorageUnavailable(_)
                | PipelineError::AggregationFailure(_)
        )
    }
}
