use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("internal: {0}.")]
    InternalError(#[from] InternalError),
    #[error(transparent)]
    UserError(#[from] UserError),
}

#[derive(Error, Debug)]
pub enum InternalError {
    #[error("unknown indexer type for attribute `{0}`")]
    UnknownIndexerType(String),
    #[error("stem variant `{variant}` of `{word}` is missing from the word index")]
    MissingStemVariant { word: String, variant: String },
    #[error("the aggregate record is missing field slot {0}")]
    MissingRecordSlot(usize),
    #[error("fanout aggregation lost its parameter block")]
    FanoutParametersLost,
}

#[derive(Error, Debug)]
pub enum UserError {
    #[error("{0}")]
    InvalidQuerySyntax(String),
    #[error("`{0}` is not indexed as a numeric field")]
    NotANumericField(String),
    #[error("`{0}` is not indexed as a tag field")]
    NotATagField(String),
    #[error("`{0}` is not indexed as a text field")]
    NotATextField(String),
    #[error("{0} is not a vector index")]
    NotAVectorIndex(String),
    #[error("Unknown attribute `{0}`")]
    UnknownAttribute(String),
    #[error("No default text field available and no @field specified")]
    NoDefaultTextField,
    #[error("Index with name `{0}` not found")]
    IndexNotFound(String),
    #[error("Parameter `{0}` not found")]
    ParameterNotFound(String),
    #[error("Parameter `{0}` not used")]
    ParameterNotUsed(String),
    #[error("Parameter `{0}` is already defined")]
    ParameterAlreadyDefined(String),
    #[error("Function `{0}` is unknown")]
    UnknownFunction(String),
    #[error("Function `{name}` expects between {min} and {max} arguments, but {got} were found")]
    BadFunctionArity { name: String, min: usize, max: usize, got: usize },
    #[error("Attribute `{name}` unknown/invalid near position {position}")]
    UnknownExprAttribute { name: String, position: usize },
    #[error("{message} at or near position {position}")]
    ExprSyntax { message: String, position: usize },
    #[error("`{name}` must be within [{min}, {max}]")]
    ConfigValueOutOfRange { name: &'static str, min: String, max: String },
    #[error("Unknown configuration key `{0}`")]
    UnknownConfigKey(String),
    #[error("The query timed out")]
    Timeout,
    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    OutOfMemory,
    #[error("Index or slot consistency check failed")]
    ConsistencyCheckFailed,
    #[error("ACL permission denied for the requested key prefixes")]
    PermissionDenied,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Protocol-level error class prefix for a given error. The dispatcher
/// prepends this to the human-readable message.
pub fn error_class(error: &Error) -> &'static str {
    match error {
        Error::InternalError(_) => "INTERNAL",
        Error::UserError(e) => match e {
            UserError::IndexNotFound(_)
            | UserError::ParameterNotFound(_)
            | UserError::ParameterNotUsed(_)
            | UserError::UnknownFunction(_) => "NOT-FOUND",
            UserError::Timeout => "TIMEOUT",
            UserError::OutOfMemory => "OOM",
            UserError::ConsistencyCheckFailed => "INTERNAL",
            UserError::PermissionDenied => "PERMISSION-DENIED",
            _ => "ERR",
        },
    }
}
