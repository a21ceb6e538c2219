//! Static mapping from MQTT subtopic suffixes to record fields.
//!
//! Each registry entry names the subtopic suffix a meter publishes on, the
//! storage column the value lands in, and the kind of value to parse. Suffixes
//! are resolved to a [`FieldId`] once per message; the id is an index into the
//! record's slot vector.

pub mod parse;
mod profiles;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

pub use self::parse::{parse_value, ParseError};
pub use self::profiles::{DSMR_LOGGER_FIELDS, DSMR_READER_FIELDS};

/// Column that carries the flush timestamp. Never a registry column.
pub const TIMESTAMP_COLUMN: &str = "timestamp_utc";

/// Kind of value carried by a field's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Float,
    Integer,
    Boolean,
    Timestamp,
}

impl FieldKind {
    /// Returns the label used in logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed field value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    pub const fn kind(&self) -> FieldKind {
        match self {
            Self::Float(_) => FieldKind::Float,
            Self::Integer(_) => FieldKind::Integer,
            Self::Boolean(_) => FieldKind::Boolean,
            Self::Timestamp(_) => FieldKind::Timestamp,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

/// One registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Subtopic suffix (topic with the root prefix removed).
    pub suffix: &'static str,
    /// Storage column name.
    pub column: &'static str,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn new(suffix: &'static str, column: &'static str, kind: FieldKind) -> Self {
        Self {
            suffix,
            column,
            kind,
        }
    }

    /// Float field whose column is named after its suffix.
    pub const fn float(suffix: &'static str) -> Self {
        Self::new(suffix, suffix, FieldKind::Float)
    }
}

/// Index of a field within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub(crate) usize);

impl FieldId {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Built-in registry tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryProfile {
    /// DSMR-reader topics (`dsmr/reading/*`, `dsmr/consumption/gas/*`).
    #[default]
    DsmrReader,
    /// DSMR-logger firmware topics.
    DsmrLogger,
}

impl RegistryProfile {
    pub const fn fields(self) -> &'static [FieldSpec] {
        match self {
            Self::DsmrReader => DSMR_READER_FIELDS,
            Self::DsmrLogger => DSMR_LOGGER_FIELDS,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DsmrReader => "dsmr_reader",
            Self::DsmrLogger => "dsmr_logger",
        }
    }
}

/// Errors raised while building a registry.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry has no fields")]
    Empty,

    #[error("duplicate subtopic suffix: {suffix}")]
    DuplicateSuffix { suffix: &'static str },

    #[error("duplicate column: {column}")]
    DuplicateColumn { column: &'static str },

    #[error("invalid column identifier: {column:?}")]
    InvalidColumn { column: &'static str },

    #[error("column {TIMESTAMP_COLUMN} is reserved for the flush timestamp")]
    ReservedColumn,
}

/// Immutable suffix-to-field table.
#[derive(Debug, Clone)]
pub struct FieldRegistry {
    fields: &'static [FieldSpec],
    by_suffix: HashMap<&'static str, FieldId>,
}

impl FieldRegistry {
    /// Builds a registry, rejecting duplicate suffixes or columns and
    /// column names that are not plain SQL identifiers.
    pub fn new(fields: &'static [FieldSpec]) -> Result<Self, RegistryError> {
        if fields.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut by_suffix = HashMap::with_capacity(fields.len());
        let mut columns = HashMap::with_capacity(fields.len());

        for (idx, spec) in fields.iter().enumerate() {
            if !is_identifier(spec.column) {
                return Err(RegistryError::InvalidColumn {
                    column: spec.column,
                });
            }
            if spec.column.eq_ignore_ascii_case(TIMESTAMP_COLUMN) {
                return Err(RegistryError::ReservedColumn);
            }
            if columns
                .insert(spec.column.to_ascii_lowercase(), idx)
                .is_some()
            {
                return Err(RegistryError::DuplicateColumn {
                    column: spec.column,
                });
            }
            if by_suffix.insert(spec.suffix, FieldId(idx)).is_some() {
                return Err(RegistryError::DuplicateSuffix {
                    suffix: spec.suffix,
                });
            }
        }

        Ok(Self { fields, by_suffix })
    }

    /// Builds the registry for a built-in profile.
    pub fn for_profile(profile: RegistryProfile) -> Result<Self, RegistryError> {
        Self::new(profile.fields())
    }

    /// Resolves a subtopic suffix. Unknown suffixes return `None`.
    pub fn lookup(&self, suffix: &str) -> Option<(FieldId, &FieldSpec)> {
        let id = *self.by_suffix.get(suffix)?;
        Some((id, &self.fields[id.0]))
    }

    pub fn spec(&self, id: FieldId) -> &FieldSpec {
        &self.fields[id.0]
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &'static [FieldSpec] {
        self.fields
    }

    /// Returns true if `column` names a registry field (case-insensitive).
    pub fn has_column(&self, column: &str) -> bool {
        self.fields
            .iter()
            .any(|f| f.column.eq_ignore_ascii_case(column))
    }
}

/// Returns true for `[A-Za-z_][A-Za-z0-9_]*`.
pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
