use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::Cow;
use std::error::Error;
use std::fmt;

pub type Result<T, E = DbError> = std::result::Result<T, E>;

/// Broad classification of an error.
///
/// Upstream callers use the kind to decide how to log and whether retrying
/// makes sense. The message and fields carry the details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbErrorKind {
    /// Malformed command text.
    Parse,
    /// Command references something that doesn't exist.
    Resolve,
    /// One or more objects not accessible to the caller.
    Authorization,
    /// Errors with the request itself, e.g. bad parameter values.
    Processing,
    /// Infrastructure failures (buffers, connectors, storage).
    Component,
    /// Transaction state violations.
    Transaction,
    /// Request canceled by the client or session termination.
    Canceled,
    /// Bugs.
    Internal,
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Parse => "parse",
            Self::Resolve => "resolve",
            Self::Authorization => "authorization",
            Self::Processing => "processing",
            Self::Component => "component",
            Self::Transaction => "transaction",
            Self::Canceled => "canceled",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

pub struct DbError {
    /// Boxed to keep the size of results small.
    inner: Box<DbErrorInner>,
}

struct DbErrorInner {
    kind: DbErrorKind,
    msg: String,
    source: Option<Box<dyn Error + Send + Sync>>,
    fields: Vec<ErrorField>,
    backtrace: Backtrace,
}

struct ErrorField {
    key: Cow<'static, str>,
    value: String,
}

impl DbError {
    /// Create a new processing error.
    pub fn new(msg: impl Into<String>) -> Self {
        Self::with_kind(DbErrorKind::Processing, msg)
    }

    pub fn with_kind(kind: DbErrorKind, msg: impl Into<String>) -> Self {
        DbError {
            inner: Box::new(DbErrorInner {
                kind,
                msg: msg.into(),
                source: None,
                fields: Vec::new(),
                backtrace: Backtrace::capture(),
            }),
        }
    }

    pub fn with_source(msg: impl Into<String>, source: Box<dyn Error + Send + Sync>) -> Self {
        let mut err = Self::new(msg);
        err.inner.source = Some(source);
        err
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::with_kind(DbErrorKind::Internal, msg)
    }

    pub fn component(msg: impl Into<String>) -> Self {
        Self::with_kind(DbErrorKind::Component, msg)
    }

    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::with_kind(DbErrorKind::Transaction, msg)
    }

    pub fn canceled(msg: impl Into<String>) -> Self {
        Self::with_kind(DbErrorKind::Canceled, msg)
    }

    /// Change the kind of this error.
    pub fn kind_of(mut self, kind: DbErrorKind) -> Self {
        self.inner.kind = kind;
        self
    }

    /// Attach a structured field to the error.
    pub fn with_field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<Cow<'static, str>>,
        V: fmt::Display,
    {
        self.inner.fields.push(ErrorField {
            key: key.into(),
            value: value.to_string(),
        });
        self
    }

    pub fn kind(&self) -> DbErrorKind {
        self.inner.kind
    }

    pub fn get_msg(&self) -> &str {
        &self.inner.msg
    }

    /// Get the value of a field by key, if set.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.inner
            .fields
            .iter()
            .find(|f| f.key == key)
            .map(|f| f.value.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner
            .fields
            .iter()
            .map(|f| (f.key.as_ref(), f.value.as_str()))
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.inner.backtrace
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.msg)?;

        for field in &self.inner.fields {
            write!(f, "\n  {}: {}", field.key, field.value)?;
        }

        if let Some(source) = &self.inner.source {
            write!(f, "\nError source: {source}")?;
        }

        if self.inner.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\nBacktrace: {}", self.inner.backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbError")
            .field("kind", &self.inner.kind)
            .field("msg", &self.inner.msg)
            .field("fields", &self.fields().collect::<Vec<_>>())
            .field("source", &self.inner.source)
            .finish_non_exhaustive()
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for DbError {
    fn from(value: std::io::Error) -> Self {
        DbError::with_source("IO error", Box::new(value)).kind_of(DbErrorKind::Component)
    }
}

impl From<serde_json::Error> for DbError {
    fn from(value: serde_json::Error) -> Self {
        DbError::with_source("Serialization error", Box::new(value))
            .kind_of(DbErrorKind::Component)
    }
}

/// Extension trait for attaching context to errors.
pub trait ResultExt<T, E> {
    /// Wrap the error with a message.
    fn context(self, msg: &'static str) -> Result<T>;

    /// Wrap the error with a lazily created message.
    fn context_fn<F>(self, f: F) -> Result<T>
    where
        F: Fn() -> String;
}

impl<T, E> ResultExt<T, E> for std::result::Result<T, E>
where
    E: Error + Send + Sync + 'static,
{
    fn context(self, msg: &'static str) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(DbError::with_source(msg, Box::new(e))),
        }
    }

    fn context_fn<F>(self, f: F) -> Result<T>
    where
        F: Fn() -> String,
    {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(DbError::with_source(f(), Box::new(e))),
        }
    }
}

pub trait OptionExt<T> {
    /// Return an internal error if the option is None.
    fn required(self, msg: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, msg: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(DbError::internal(format!("Missing required value: {msg}"))),
        }
    }
}
