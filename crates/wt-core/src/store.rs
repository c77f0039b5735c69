use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{Codec, DecodeError, EncodeError};
use crate::config::StorageConfig;
use crate::layout::Layout;
use crate::model::{Project, ProjectId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("project '{0}' not found")]
    NotFound(ProjectId),
    #[error("corrupt project data in {}: {source}", path.display())]
    Corruption {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },
    #[error("{} would be {size} bytes, over the {limit} byte limit", path.display())]
    SizeLimit {
        path: PathBuf,
        size: usize,
        limit: usize,
    },
    #[error("project '{found}' cannot be stored as '{expected}'")]
    IdMismatch { expected: ProjectId, found: ProjectId },
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Live file plus its existing backups, most recent first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSet {
    pub path: PathBuf,
    pub backups: Vec<PathBuf>,
}

/// `<file>.bak<n>` next to `path`.
pub fn backup_path(path: &Path, n: usize) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.bak{n}"))
}

// ---------------------------------------------------------------------------
// ProjectStore
// ---------------------------------------------------------------------------

/// File-system-backed project persistence.
///
/// Every write goes to a temporary sibling first; backups are rotated
/// (`.bak1` is the most recent prior version) and only then is the temporary
/// file renamed over the live one. An interrupted write leaves the previous
/// version in place.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    root: PathBuf,
    layout: Layout,
    codec: Codec,
    size_limit: usize,
    num_backups: usize,
}

impl ProjectStore {
    pub fn new(root: impl Into<PathBuf>, layout: Layout, codec: Codec) -> Self {
        let defaults = StorageConfig::default();
        Self {
            root: root.into(),
            layout,
            codec,
            size_limit: defaults.language_file_size,
            num_backups: defaults.num_backup_files,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            config.project_root_path(),
            config.storage_format,
            config.data_format,
        )
        .with_size_limit(config.language_file_size)
        .with_backups(config.num_backup_files)
    }

    pub fn with_size_limit(mut self, bytes: usize) -> Self {
        self.size_limit = bytes;
        self
    }

    pub fn with_backups(mut self, count: usize) -> Self {
        self.num_backups = count;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn exists(&self, id: &ProjectId) -> bool {
        self.root
            .join(self.layout.primary_path(self.codec, id))
            .is_file()
    }

    /// Load a project. A missing primary file is `NotFound`; undecodable
    /// data is `Corruption`. In split storage a missing language file only
    /// drops that language.
    pub fn read(&self, id: &ProjectId) -> Result<Project, StoreError> {
        let primary = self.root.join(self.layout.primary_path(self.codec, id));
        let bytes = match fs::read(&primary) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()))
            }
            Err(e) => return Err(io_err(&primary)(e)),
        };

        let corrupt = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Corruption { path, source }
        };

        let (mut project, languages) = self
            .layout
            .decode_primary(self.codec, &bytes)
            .map_err(corrupt(&primary))?;
        if project.id() != id {
            return Err(corrupt(&primary)(DecodeError::new(format!(
                "file holds project '{}'",
                project.id()
            ))));
        }

        for code in languages {
            let Some(rel) = self.layout.language_path(self.codec, id, &code) else {
                continue;
            };
            let path = self.root.join(rel);
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(project = %id, language = %code, path = %path.display(),
                        "language file missing, treating language as absent");
                    continue;
                }
                Err(e) => return Err(io_err(&path)(e)),
            };
            let table = self
                .codec
                .decode_language(&bytes)
                .map_err(corrupt(&path))?;
            self.layout
                .merge_language(&mut project, &code, table)
                .map_err(corrupt(&path))?;
        }

        debug!(project = %id, languages = project.languages().count(), "project read");
        Ok(project)
    }

    /// Persist `project` under `id`, rotating backups per physical file.
    ///
    /// All fragments are encoded and checked against the size limit before
    /// anything on disk is touched.
    pub fn write(&self, id: &ProjectId, project: &Project) -> Result<(), StoreError> {
        if project.id() != id {
            return Err(StoreError::IdMismatch {
                expected: id.clone(),
                found: project.id().clone(),
            });
        }

        let fragments = self.layout.fragments(self.codec, project)?;
        if let Some(oversized) = fragments.iter().find(|f| f.bytes.len() > self.size_limit) {
            return Err(StoreError::SizeLimit {
                path: oversized.path.clone(),
                size: oversized.bytes.len(),
                limit: self.size_limit,
            });
        }

        let total: usize = fragments.iter().map(|f| f.bytes.len()).sum();
        for fragment in &fragments {
            self.replace_file(&self.root.join(&fragment.path), &fragment.bytes)?;
        }
        info!(project = %id, files = fragments.len(), bytes = total, "project written");
        Ok(())
    }

    /// Temp file, fsync, rotate, rename. The temp file is removed on failure.
    fn replace_file(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let parent = path.parent().unwrap_or(self.root.as_path());
        fs::create_dir_all(parent).map_err(io_err(parent))?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{}.tmp-{}", name, Uuid::new_v4()));

        let result = (|| -> Result<(), StoreError> {
            let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
            file.write_all(bytes).map_err(io_err(&tmp))?;
            file.sync_all().map_err(io_err(&tmp))?;
            drop(file);

            self.rotate_backups(path)?;
            fs::rename(&tmp, path).map_err(io_err(path))?;
            sync_dir(parent)
        })();

        if result.is_err() && tmp.exists() {
            if let Err(e) = fs::remove_file(&tmp) {
                warn!(path = %tmp.display(), error = %e, "failed to remove temporary file");
            }
        }
        result
    }

    /// Shift `.bak{i}` to `.bak{i+1}` from the highest index down, dropping
    /// anything beyond the retention count, then make the live file `.bak1`.
    /// The live file itself stays in place until the final rename.
    fn rotate_backups(&self, path: &Path) -> Result<(), StoreError> {
        let n = self.num_backups;
        if n == 0 {
            return remove_backups_from(path, 1);
        }
        if !path.exists() {
            // Nothing to rotate; only trim what a larger setting left behind.
            return remove_backups_from(path, n + 1);
        }
        remove_backups_from(path, n)?;

        for i in (1..n).rev() {
            let from = backup_path(path, i);
            if from.exists() {
                let to = backup_path(path, i + 1);
                fs::rename(&from, &to).map_err(io_err(&from))?;
            }
        }

        let newest = backup_path(path, 1);
        if fs::hard_link(path, &newest).is_err() {
            fs::copy(path, &newest).map_err(io_err(&newest))?;
        }
        debug!(path = %path.display(), keep = n, "backups rotated");
        Ok(())
    }

    /// Remove a project's live files and backups. Returns whether anything
    /// existed.
    pub fn delete(&self, id: &ProjectId) -> Result<bool, StoreError> {
        match self.layout {
            Layout::OneFile => {
                let primary = self.root.join(self.layout.primary_path(self.codec, id));
                let mut removed = false;
                for path in std::iter::once(primary.clone()).chain(existing_backups(&primary)) {
                    match fs::remove_file(&path) {
                        Ok(()) => removed = true,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(io_err(&path)(e)),
                    }
                }
                if removed {
                    info!(project = %id, "project deleted");
                }
                Ok(removed)
            }
            Layout::SplitLanguages => {
                let dir = self.root.join(id.as_str());
                match fs::remove_dir_all(&dir) {
                    Ok(()) => {
                        info!(project = %id, "project deleted");
                        Ok(true)
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(io_err(&dir)(e)),
                }
            }
        }
    }

    /// Ids of all projects below the root, sorted.
    pub fn list(&self) -> Result<Vec<ProjectId>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.root)(e)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.root))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = self.layout.project_id_for_entry(self.codec, &self.root, name) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Backup chains of every live file of a project.
    pub fn backups(&self, id: &ProjectId) -> Result<Vec<BackupSet>, StoreError> {
        let primary = self.root.join(self.layout.primary_path(self.codec, id));
        let mut live = vec![primary.clone()];

        if self.layout == Layout::SplitLanguages {
            let dir = self.root.join(id.as_str());
            if dir.is_dir() {
                let suffix = format!(".{}", self.codec.extension());
                let mut languages = Vec::new();
                for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
                    let path = entry.map_err(io_err(&dir))?.path();
                    let is_language = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.ends_with(&suffix) && !n.starts_with('.'))
                        .unwrap_or(false);
                    if is_language && path != primary {
                        languages.push(path);
                    }
                }
                languages.sort();
                live.extend(languages);
            }
        }

        Ok(live
            .into_iter()
            .filter(|path| path.exists() || backup_path(path, 1).exists())
            .map(|path| BackupSet {
                backups: existing_backups(&path),
                path,
            })
            .collect())
    }
}

/// Contiguous `.bak1`, `.bak2`, ... that exist for `path`.
/// Delete `.bak{from}` and every contiguous higher slot.
fn remove_backups_from(path: &Path, from: usize) -> Result<(), StoreError> {
    let mut slot = from;
    loop {
        let candidate = backup_path(path, slot);
        if !candidate.exists() {
            return Ok(());
        }
        fs::remove_file(&candidate).map_err(io_err(&candidate))?;
        slot += 1;
    }
}

fn existing_backups(path: &Path) -> Vec<PathBuf> {
    (1..)
        .map(|i| backup_path(path, i))
        .take_while(|p| p.exists())
        .collect()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(io_err(dir))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
