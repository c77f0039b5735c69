//! Byte encodings for projects.
//!
//! Two interchangeable encodings are supported, picked once per deployment:
//! XML and JSON. Both carry a schema version and both decode into the same
//! model types, so `decode(encode(p)) == p` for either one.
//!
//! Besides whole projects, each encoding handles the two document kinds used
//! by split storage: a project *header* (metadata, base language and an index
//! of language codes) and a single *language* table.

mod json;
mod xml;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::{validate_identifier, LanguageTable, Project};

/// Schema version written into, and required from, every document.
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("decode failed: {reason}")]
pub struct DecodeError {
    pub reason: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("encode failed: {reason}")]
pub struct EncodeError {
    pub reason: String,
}

impl EncodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// A decoded split-storage header: the project without its target
/// languages, plus the codes of the languages stored in their own files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectHeader {
    pub project: Project,
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Xml,
    Json,
}

impl Codec {
    /// File extension used for documents in this encoding.
    pub fn extension(&self) -> &'static str {
        match self {
            Codec::Xml => "xml",
            Codec::Json => "json",
        }
    }

    pub fn encode_project(&self, project: &Project) -> Result<Vec<u8>, EncodeError> {
        match self {
            Codec::Xml => xml::encode_project(project),
            Codec::Json => json::encode_project(project),
        }
    }

    pub fn decode_project(&self, bytes: &[u8]) -> Result<Project, DecodeError> {
        let project = match self {
            Codec::Xml => xml::decode_project(bytes)?,
            Codec::Json => json::decode_project(bytes)?,
        };
        project.check_consistency().map_err(DecodeError::new)?;
        Ok(project)
    }

    /// Encode metadata and base language; target languages are written as
    /// an index of codes only.
    pub fn encode_header(&self, project: &Project) -> Result<Vec<u8>, EncodeError> {
        match self {
            Codec::Xml => xml::encode_header(project),
            Codec::Json => json::encode_header(project),
        }
    }

    pub fn decode_header(&self, bytes: &[u8]) -> Result<ProjectHeader, DecodeError> {
        let header = match self {
            Codec::Xml => xml::decode_header(bytes)?,
            Codec::Json => json::decode_header(bytes)?,
        };
        header.project.check_consistency().map_err(DecodeError::new)?;
        for code in &header.languages {
            validate_identifier("language code", code)
                .map_err(|e| DecodeError::new(e.to_string()))?;
            if code == header.project.base_language_code() {
                return Err(DecodeError::new(format!(
                    "language index lists the base language '{}'",
                    code
                )));
            }
        }
        Ok(header)
    }

    pub fn encode_language(&self, table: &LanguageTable) -> Result<Vec<u8>, EncodeError> {
        match self {
            Codec::Xml => xml::encode_language(table),
            Codec::Json => json::encode_language(table),
        }
    }

    pub fn decode_language(&self, bytes: &[u8]) -> Result<LanguageTable, DecodeError> {
        let table = match self {
            Codec::Xml => xml::decode_language(bytes)?,
            Codec::Json => json::decode_language(bytes)?,
        };
        table.check_consistency().map_err(DecodeError::new)?;
        Ok(table)
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xml" => Ok(Codec::Xml),
            "json" => Ok(Codec::Json),
            other => Err(format!("unknown data format '{other}' (expected xml or json)")),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

fn check_version(version: Option<u32>) -> Result<(), DecodeError> {
    match version {
        Some(SCHEMA_VERSION) => Ok(()),
        Some(other) => Err(DecodeError::new(format!("unknown schema version {other}"))),
        None => Err(DecodeError::new("missing schema version")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
