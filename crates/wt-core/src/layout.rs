use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::{Codec, DecodeError, EncodeError};
use crate::model::{LanguageTable, Project, ProjectId};

/// File name of the header document in split storage.
pub const HEADER_STEM: &str = "project";

/// How a project maps onto files below the store root.
///
/// - `OneFile`: `<id>.<ext>` holds the whole project.
/// - `SplitLanguages`: `<id>/project.<ext>` holds metadata, the base language
///   and the language index; every target language lives in `<id>/<code>.<ext>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    #[default]
    OneFile,
    SplitLanguages,
}

/// One physical file to persist, relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl Layout {
    /// The file whose presence means the project exists.
    pub fn primary_path(&self, codec: Codec, id: &ProjectId) -> PathBuf {
        match self {
            Layout::OneFile => PathBuf::from(format!("{}.{}", id, codec.extension())),
            Layout::SplitLanguages => PathBuf::from(id.as_str())
                .join(format!("{}.{}", HEADER_STEM, codec.extension())),
        }
    }

    /// Per-language file in split storage. `None` for one-file storage.
    pub fn language_path(&self, codec: Codec, id: &ProjectId, code: &str) -> Option<PathBuf> {
        match self {
            Layout::OneFile => None,
            Layout::SplitLanguages => {
                Some(PathBuf::from(id.as_str()).join(format!("{}.{}", code, codec.extension())))
            }
        }
    }

    /// Encode `project` into the fragments this layout persists.
    pub fn fragments(&self, codec: Codec, project: &Project) -> Result<Vec<Fragment>, EncodeError> {
        let id = project.id();
        match self {
            Layout::OneFile => Ok(vec![Fragment {
                path: self.primary_path(codec, id),
                bytes: codec.encode_project(project)?,
            }]),
            Layout::SplitLanguages => {
                let mut fragments = Vec::with_capacity(project.languages().count() + 1);
                fragments.push(Fragment {
                    path: self.primary_path(codec, id),
                    bytes: codec.encode_header(project)?,
                });
                for table in project.languages() {
                    if let Some(path) = self.language_path(codec, id, table.code()) {
                        fragments.push(Fragment {
                            path,
                            bytes: codec.encode_language(table)?,
                        });
                    }
                }
                Ok(fragments)
            }
        }
    }

    /// Decode the primary file. Returns the project and the language codes
    /// that still have to be read from their own files.
    pub fn decode_primary(
        &self,
        codec: Codec,
        bytes: &[u8],
    ) -> Result<(Project, Vec<String>), DecodeError> {
        match self {
            Layout::OneFile => Ok((codec.decode_project(bytes)?, Vec::new())),
            Layout::SplitLanguages => {
                let header = codec.decode_header(bytes)?;
                Ok((header.project, header.languages))
            }
        }
    }

    /// Merge a decoded language file into `project`.
    pub fn merge_language(
        &self,
        project: &mut Project,
        expected_code: &str,
        table: LanguageTable,
    ) -> Result<(), DecodeError> {
        if table.code() != expected_code {
            return Err(DecodeError::new(format!(
                "file for language '{}' contains language '{}'",
                expected_code,
                table.code()
            )));
        }
        project
            .insert_language(table)
            .map_err(|e| DecodeError::new(e.to_string()))
    }

    /// Map a directory entry directly below the store root back to a
    /// project id, if it is one.
    pub fn project_id_for_entry(&self, codec: Codec, root: &Path, name: &str) -> Option<ProjectId> {
        match self {
            Layout::OneFile => {
                let stem = name.strip_suffix(&format!(".{}", codec.extension()))?;
                ProjectId::new(stem).ok()
            }
            Layout::SplitLanguages => {
                let id = ProjectId::new(name).ok()?;
                root.join(self.primary_path(codec, &id)).is_file().then_some(id)
            }
        }
    }
}

impl FromStr for Layout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "one-file" => Ok(Layout::OneFile),
            "split-languages" => Ok(Layout::SplitLanguages),
            other => Err(format!(
                "unknown storage format '{other}' (expected one-file or split-languages)"
            )),
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::OneFile => f.write_str("one-file"),
            Layout::SplitLanguages => f.write_str("split-languages"),
        }
    }
}
