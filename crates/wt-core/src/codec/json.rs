use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{check_version, DecodeError, EncodeError, ProjectHeader, SCHEMA_VERSION};
use crate::model::{LanguageTable, Project, ProjectId, ProjectType};

#[derive(Deserialize)]
struct VersionProbe {
    version: Option<u32>,
}

#[derive(Serialize)]
struct Versioned<'a, T> {
    version: u32,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Serialize)]
struct ProjectBody<'a> {
    project: &'a Project,
}

#[derive(Deserialize)]
struct ProjectDoc {
    project: Project,
}

#[derive(Serialize)]
struct HeaderBody<'a> {
    header: HeaderRef<'a>,
}

#[derive(Serialize)]
struct HeaderRef<'a> {
    id: &'a ProjectId,
    project_type: ProjectType,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    base: &'a LanguageTable,
    languages: Vec<&'a str>,
}

#[derive(Deserialize)]
struct HeaderDoc {
    header: HeaderOwned,
}

#[derive(Deserialize)]
struct HeaderOwned {
    id: ProjectId,
    project_type: ProjectType,
    name: String,
    #[serde(default)]
    url: Option<String>,
    base: LanguageTable,
    #[serde(default)]
    languages: Vec<String>,
}

#[derive(Serialize)]
struct LanguageBody<'a> {
    language: &'a LanguageTable,
}

#[derive(Deserialize)]
struct LanguageDoc {
    language: LanguageTable,
}

fn to_bytes<T: Serialize>(body: &T) -> Result<Vec<u8>, EncodeError> {
    serde_json::to_vec_pretty(&Versioned {
        version: SCHEMA_VERSION,
        body,
    })
    .map_err(|e| EncodeError::new(e.to_string()))
}

fn from_bytes<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, DecodeError> {
    let probe: VersionProbe =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::new(format!("json: {e}")))?;
    check_version(probe.version)?;
    serde_json::from_slice(bytes).map_err(|e| DecodeError::new(format!("json: {e}")))
}

pub(super) fn encode_project(project: &Project) -> Result<Vec<u8>, EncodeError> {
    to_bytes(&ProjectBody { project })
}

pub(super) fn decode_project(bytes: &[u8]) -> Result<Project, DecodeError> {
    from_bytes::<ProjectDoc>(bytes).map(|doc| doc.project)
}

pub(super) fn encode_header(project: &Project) -> Result<Vec<u8>, EncodeError> {
    to_bytes(&HeaderBody {
        header: HeaderRef {
            id: project.id(),
            project_type: project.project_type(),
            name: &project.name,
            url: project.url.as_deref(),
            base: project.base_language(),
            languages: project.languages().map(|t| t.code()).collect(),
        },
    })
}

pub(super) fn decode_header(bytes: &[u8]) -> Result<ProjectHeader, DecodeError> {
    let header = from_bytes::<HeaderDoc>(bytes)?.header;
    Ok(ProjectHeader {
        project: Project {
            id: header.id,
            project_type: header.project_type,
            name: header.name,
            url: header.url,
            base: header.base,
            languages: BTreeMap::new(),
            dirty: false,
        },
        languages: header.languages,
    })
}

pub(super) fn encode_language(table: &LanguageTable) -> Result<Vec<u8>, EncodeError> {
    to_bytes(&LanguageBody { language: table })
}

pub(super) fn decode_language(bytes: &[u8]) -> Result<LanguageTable, DecodeError> {
    from_bytes::<LanguageDoc>(bytes).map(|doc| doc.language)
}
