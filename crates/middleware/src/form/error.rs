use serde::de;
use std::fmt;
use std::str::Utf8Error;
use thiserror::Error;

/// Failure to parse an `application/x-www-form-urlencoded` payload.
#[derive(Error, Debug)]
pub enum FormError {
    #[error("invalid form: body is not valid utf-8: {source}")]
    InvalidUtf8 {
        #[from]
        source: Utf8Error,
    },

    #[error("invalid form: invalid URL escape {escape:?}")]
    InvalidEscape { escape: String },

    #[error("invalid form: {reason}")]
    Malformed { reason: String },
}

impl FormError {
    pub fn invalid_escape<S: ToString>(escape: S) -> Self {
        Self::InvalidEscape { escape: escape.to_string() }
    }

    pub fn malformed<S: ToString>(str: S) -> Self {
        Self::Malformed { reason: str.to_string() }
    }
}

/// Failure to decode form values into a typed message.
///
/// Carries the dotted path of the offending field when one can be named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    field: Option<String>,
    reason: String,
    // `field` is still relative to the struct being decoded
    relative: bool,
}

impl DecodeError {
    pub fn new<S: ToString>(field: Option<String>, reason: S) -> Self {
        Self { field, reason: reason.to_string(), relative: false }
    }

    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Anchors the error at `path` unless it already names an absolute field.
    pub(crate) fn at(mut self, path: &str) -> Self {
        match self.field.take() {
            None => self.field = (!path.is_empty()).then(|| path.to_owned()),
            Some(field) if self.relative => {
                self.field = Some(join_path(path, &field));
                self.relative = false;
            }
            Some(field) => self.field = Some(field),
        }
        self
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "invalid field {field:?}: {}", self.reason),
            None => write!(f, "invalid form: {}", self.reason),
        }
    }
}

impl std::error::Error for DecodeError {}

impl de::Error for DecodeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self { field: None, reason: msg.to_string(), relative: false }
    }

    fn missing_field(field: &'static str) -> Self {
        Self { field: Some(field.to_owned()), reason: "missing value".to_owned(), relative: true }
    }

    fn unknown_field(field: &str, _expected: &'static [&'static str]) -> Self {
        Self { field: Some(field.to_owned()), reason: "unknown field".to_owned(), relative: true }
    }
}

pub(crate) fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() { key.to_owned() } else { format!("{parent}.{key}") }
}
