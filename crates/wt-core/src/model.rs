use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::history::{HistoryError, HistoryPolicy};

/// Longest accepted project id or language code.
pub const MAX_IDENTIFIER_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("invalid {kind} '{value}': {reason}")]
    InvalidIdentifier {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("unknown project type '{0}'")]
    UnknownProjectType(String),
}

/// Check a project id or language code. Both end up as path components, so
/// only a conservative character set is accepted.
pub fn validate_identifier(kind: &'static str, value: &str) -> Result<(), ModelError> {
    let invalid = |reason| ModelError::InvalidIdentifier {
        kind,
        value: value.to_string(),
        reason,
    };
    if value.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(invalid("too long"));
    }
    if value.starts_with('.') {
        return Err(invalid("must not start with '.'"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid("only ASCII letters, digits, '-', '_' and '.' are allowed"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ProjectId
// ---------------------------------------------------------------------------

/// Validated project identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Result<Self, ModelError> {
        let id = id.into();
        validate_identifier("project id", &id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProjectId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProjectId> for String {
    fn from(id: ProjectId) -> Self {
        id.0
    }
}

impl FromStr for ProjectId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ProjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ProjectType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProjectType {
    #[serde(rename = "newgrf")]
    NewGrf,
    #[serde(rename = "game-script")]
    GameScript,
    #[serde(rename = "openttd")]
    OpenTtd,
}

impl ProjectType {
    pub const ALL: [ProjectType; 3] = [
        ProjectType::NewGrf,
        ProjectType::GameScript,
        ProjectType::OpenTtd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::NewGrf => "newgrf",
            ProjectType::GameScript => "game-script",
            ProjectType::OpenTtd => "openttd",
        }
    }
}

impl FromStr for ProjectType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProjectType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ModelError::UnknownProjectType(s.to_string()))
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StabilityState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityState {
    #[default]
    Unstable,
    Stable,
}

impl fmt::Display for StabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StabilityState::Unstable => f.write_str("unstable"),
            StabilityState::Stable => f.write_str("stable"),
        }
    }
}

// ---------------------------------------------------------------------------
// StringValue / Change
// ---------------------------------------------------------------------------

/// Text of a string, plus optional case/plural variants keyed by case name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StringValue {
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cases: BTreeMap<String, String>,
}

impl StringValue {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cases: BTreeMap::new(),
        }
    }

    pub fn with_case(mut self, case: impl Into<String>, text: impl Into<String>) -> Self {
        self.cases.insert(case.into(), text.into());
        self
    }
}

/// One accepted edit. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub(crate) seq: u64,
    pub(crate) value: StringValue,
    pub(crate) author: String,
    pub(crate) timestamp: DateTime<Utc>,
}

impl Change {
    pub(crate) fn new(
        seq: u64,
        value: StringValue,
        author: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            seq,
            value,
            author: author.into(),
            timestamp,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn value(&self) -> &StringValue {
        &self.value
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

// ---------------------------------------------------------------------------
// StringEntry
// ---------------------------------------------------------------------------

/// A translatable string with its bounded edit history.
///
/// `lifetime_changes` counts every change ever recorded and is never reduced
/// by pruning; sequence numbers are derived from it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StringEntry {
    pub(crate) value: StringValue,
    #[serde(default)]
    pub(crate) history: VecDeque<Change>,
    #[serde(default)]
    pub(crate) lifetime_changes: u64,
    #[serde(skip)]
    pub(crate) stability: StabilityState,
}

impl StringEntry {
    /// Build an entry from persisted parts. Sequence numbers must be strictly
    /// increasing and covered by `lifetime_changes`.
    pub fn from_parts(
        value: StringValue,
        history: Vec<Change>,
        lifetime_changes: u64,
    ) -> Result<Self, String> {
        let entry = Self {
            value,
            history: history.into(),
            lifetime_changes,
            stability: StabilityState::Unstable,
        };
        entry.check_consistency()?;
        Ok(entry)
    }

    pub(crate) fn check_consistency(&self) -> Result<(), String> {
        let mut previous: Option<&Change> = None;
        for change in &self.history {
            if change.seq == 0 {
                return Err("change sequence numbers start at 1".to_string());
            }
            if let Some(prev) = previous {
                if change.seq <= prev.seq {
                    return Err(format!(
                        "change sequence {} does not follow {}",
                        change.seq, prev.seq
                    ));
                }
                if change.timestamp < prev.timestamp {
                    return Err(format!("change {} is older than its predecessor", change.seq));
                }
            }
            previous = Some(change);
        }
        if let Some(newest) = previous {
            if self.lifetime_changes < newest.seq {
                return Err(format!(
                    "lifetime change count {} is below newest sequence {}",
                    self.lifetime_changes, newest.seq
                ));
            }
        }
        Ok(())
    }

    pub fn value(&self) -> &StringValue {
        &self.value
    }

    /// Retained changes, oldest first.
    pub fn history(&self) -> impl ExactSizeIterator<Item = &Change> + DoubleEndedIterator {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn newest_change(&self) -> Option<&Change> {
        self.history.back()
    }

    pub fn lifetime_changes(&self) -> u64 {
        self.lifetime_changes
    }

    /// Last computed stability. Use [`HistoryPolicy::refresh`] to bring it
    /// up to date for a given instant.
    pub fn stability(&self) -> StabilityState {
        self.stability
    }
}

impl PartialEq for StringEntry {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
            && self.history == other.history
            && self.lifetime_changes == other.lifetime_changes
    }
}

impl Eq for StringEntry {}

// ---------------------------------------------------------------------------
// LanguageTable
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageTable {
    pub(crate) code: String,
    #[serde(default)]
    pub(crate) strings: BTreeMap<String, StringEntry>,
}

impl LanguageTable {
    pub fn new(code: impl Into<String>) -> Result<Self, ModelError> {
        let code = code.into();
        validate_identifier("language code", &code)?;
        Ok(Self {
            code,
            strings: BTreeMap::new(),
        })
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn get(&self, key: &str) -> Option<&StringEntry> {
        self.strings.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StringEntry)> {
        self.strings.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Insert a persisted entry, replacing any previous one under `key`.
    pub fn insert(&mut self, key: impl Into<String>, entry: StringEntry) {
        self.strings.insert(key.into(), entry);
    }

    /// Current values of all entries classified stable at `now`.
    pub fn stable_values(
        &mut self,
        policy: &HistoryPolicy,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, StringValue> {
        self.strings
            .iter_mut()
            .filter_map(|(key, entry)| {
                let stable = policy.refresh(entry, now) == StabilityState::Stable;
                stable.then(|| (key.clone(), entry.value.clone()))
            })
            .collect()
    }

    fn stability_counts(&mut self, policy: &HistoryPolicy, now: DateTime<Utc>) -> LanguageReport {
        let mut report = LanguageReport {
            code: self.code.clone(),
            total: self.strings.len(),
            stable: 0,
            unstable: 0,
        };
        for entry in self.strings.values_mut() {
            match policy.refresh(entry, now) {
                StabilityState::Stable => report.stable += 1,
                StabilityState::Unstable => report.unstable += 1,
            }
        }
        report
    }
}

/// Per-language stability summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LanguageReport {
    pub code: String,
    pub total: usize,
    pub stable: usize,
    pub unstable: usize,
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// A translation project: a base language plus target-language tables.
///
/// The dirty flag is in-memory bookkeeping for the cache; it is neither
/// persisted nor part of value equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub(crate) id: ProjectId,
    pub(crate) project_type: ProjectType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub(crate) base: LanguageTable,
    #[serde(default)]
    pub(crate) languages: BTreeMap<String, LanguageTable>,
    #[serde(skip)]
    pub(crate) dirty: bool,
}

impl Project {
    pub fn new(
        id: ProjectId,
        project_type: ProjectType,
        base_language: &str,
    ) -> Result<Self, ModelError> {
        Ok(Self {
            name: id.to_string(),
            id,
            project_type,
            url: None,
            base: LanguageTable::new(base_language)?,
            languages: BTreeMap::new(),
            dirty: false,
        })
    }

    pub fn id(&self) -> &ProjectId {
        &self.id
    }

    pub fn project_type(&self) -> ProjectType {
        self.project_type
    }

    pub fn base_language(&self) -> &LanguageTable {
        &self.base
    }

    pub fn base_language_code(&self) -> &str {
        &self.base.code
    }

    /// Look up any table, base language included.
    pub fn language(&self, code: &str) -> Option<&LanguageTable> {
        if code == self.base.code {
            Some(&self.base)
        } else {
            self.languages.get(code)
        }
    }

    /// Target languages (base excluded), ordered by code.
    pub fn languages(&self) -> impl Iterator<Item = &LanguageTable> {
        self.languages.values()
    }

    pub fn language_codes(&self) -> Vec<String> {
        self.languages.keys().cloned().collect()
    }

    /// Add or replace a target-language table.
    pub fn insert_language(&mut self, table: LanguageTable) -> Result<(), ModelError> {
        if table.code == self.base.code {
            return Err(ModelError::InvalidIdentifier {
                kind: "language code",
                value: table.code,
                reason: "is the base language",
            });
        }
        self.languages.insert(table.code.clone(), table);
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Record an edit of `key` in `language` (base language included) and
    /// mark the project dirty. Missing tables and entries are created; they
    /// are removed again if the change is rejected.
    pub fn record_change(
        &mut self,
        policy: &HistoryPolicy,
        language: &str,
        key: &str,
        value: StringValue,
        author: &str,
        now: DateTime<Utc>,
    ) -> Result<StabilityState, HistoryError> {
        if key.is_empty() {
            return Err(HistoryError::InvalidChange("string key must not be empty".into()));
        }
        let is_base = language == self.base.code;
        let new_table = !is_base && !self.languages.contains_key(language);
        if new_table {
            self.languages
                .insert(language.to_string(), LanguageTable::new(language)?);
        }
        let table = if is_base {
            &mut self.base
        } else {
            match self.languages.get_mut(language) {
                Some(table) => table,
                None => return Err(HistoryError::InvalidChange("language table vanished".into())),
            }
        };

        let new_entry = !table.strings.contains_key(key);
        let entry = table.strings.entry(key.to_string()).or_default();
        let result = policy.record_change(entry, value, author, now);

        if result.is_err() {
            if new_entry {
                table.strings.remove(key);
            }
            if new_table {
                self.languages.remove(language);
            }
        } else {
            self.dirty = true;
        }
        result
    }

    /// Classify one entry, refreshing its cached state.
    pub fn classify(
        &mut self,
        policy: &HistoryPolicy,
        language: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<StabilityState> {
        let table = if language == self.base.code {
            &mut self.base
        } else {
            self.languages.get_mut(language)?
        };
        table.strings.get_mut(key).map(|entry| policy.refresh(entry, now))
    }

    /// Values of one language for download: only the stable strings, or
    /// every current value when `stable_only` is false. `None` if the
    /// project has no such language.
    pub fn export_values(
        &mut self,
        policy: &HistoryPolicy,
        language: &str,
        stable_only: bool,
        now: DateTime<Utc>,
    ) -> Option<BTreeMap<String, StringValue>> {
        let table = if language == self.base.code {
            &mut self.base
        } else {
            self.languages.get_mut(language)?
        };
        if stable_only {
            return Some(table.stable_values(policy, now));
        }
        Some(
            table
                .strings
                .iter()
                .map(|(key, entry)| (key.clone(), entry.value.clone()))
                .collect(),
        )
    }

    /// Re-classify every entry and summarise per language, base first.
    pub fn refresh_stability(
        &mut self,
        policy: &HistoryPolicy,
        now: DateTime<Utc>,
    ) -> Vec<LanguageReport> {
        let mut reports = vec![self.base.stability_counts(policy, now)];
        reports.extend(
            self.languages
                .values_mut()
                .map(|table| table.stability_counts(policy, now)),
        );
        reports
    }

    /// Structural checks applied to every decoded project.
    pub(crate) fn check_consistency(&self) -> Result<(), String> {
        validate_identifier("language code", &self.base.code).map_err(|e| e.to_string())?;
        for (code, table) in &self.languages {
            if code != &table.code {
                return Err(format!("language table '{}' stored under '{}'", table.code, code));
            }
            if code == &self.base.code {
                return Err(format!("language '{}' duplicates the base language", code));
            }
        }
        for table in std::iter::once(&self.base).chain(self.languages.values()) {
            table.check_consistency()?;
        }
        Ok(())
    }
}

impl LanguageTable {
    pub(crate) fn check_consistency(&self) -> Result<(), String> {
        validate_identifier("language code", &self.code).map_err(|e| e.to_string())?;
        for (key, entry) in &self.strings {
            if key.is_empty() {
                return Err(format!("empty string key in language '{}'", self.code));
            }
            entry
                .check_consistency()
                .map_err(|e| format!("{}/{}: {}", self.code, key, e))?;
        }
        Ok(())
    }
}

impl PartialEq for Project {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.project_type == other.project_type
            && self.name == other.name
            && self.url == other.url
            && self.base == other.base
            && self.languages == other.languages
    }
}

impl Eq for Project {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> HistoryPolicy {
        HistoryPolicy::new(5, 2, 600)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn identifiers_reject_path_tricks() {
        assert!(ProjectId::new("opengfx").is_ok());
        assert!(ProjectId::new("my-set_2.0").is_ok());
        assert!(ProjectId::new("").is_err());
        assert!(ProjectId::new("..").is_err());
        assert!(ProjectId::new("a/b").is_err());
        assert!(ProjectId::new("x".repeat(MAX_IDENTIFIER_LEN + 1)).is_err());
        assert!(LanguageTable::new("en_GB").is_ok());
        assert!(LanguageTable::new("en GB").is_err());
    }

    #[test]
    fn project_type_parses_case_insensitively() {
        assert_eq!("Game-Script".parse::<ProjectType>().unwrap(), ProjectType::GameScript);
        assert_eq!("newgrf".parse::<ProjectType>().unwrap(), ProjectType::NewGrf);
        assert!("scenario".parse::<ProjectType>().is_err());
    }

    #[test]
    fn record_change_creates_language_and_marks_dirty() {
        let mut project =
            Project::new(ProjectId::new("demo").unwrap(), ProjectType::NewGrf, "en_GB").unwrap();
        assert!(!project.is_dirty());

        project
            .record_change(&policy(), "nl_NL", "STR_HELLO", StringValue::new("Hallo"), "anne", at(0))
            .unwrap();

        assert!(project.is_dirty());
        let table = project.language("nl_NL").unwrap();
        assert_eq!(table.get("STR_HELLO").unwrap().value().text, "Hallo");
        assert_eq!(project.language_codes(), vec!["nl_NL".to_string()]);
    }

    #[test]
    fn base_language_edits_go_to_base_table() {
        let mut project =
            Project::new(ProjectId::new("demo").unwrap(), ProjectType::GameScript, "en_GB").unwrap();
        project
            .record_change(&policy(), "en_GB", "STR_TITLE", StringValue::new("Title"), "dev", at(0))
            .unwrap();
        assert_eq!(project.base_language().len(), 1);
        assert_eq!(project.languages().count(), 0);
    }

    #[test]
    fn rejected_change_leaves_no_trace() {
        let mut project =
            Project::new(ProjectId::new("demo").unwrap(), ProjectType::NewGrf, "en_GB").unwrap();
        let err = project.record_change(
            &policy(),
            "de_DE",
            "STR_X",
            StringValue::new("x"),
            "bob",
            DateTime::<Utc>::from_timestamp(-5, 0).unwrap(),
        );
        assert!(matches!(err, Err(HistoryError::InvalidChange(_))));
        assert!(project.language("de_DE").is_none());
        assert!(!project.is_dirty());
    }

    #[test]
    fn equality_ignores_dirty_flag_and_cached_stability() {
        let mut a =
            Project::new(ProjectId::new("demo").unwrap(), ProjectType::NewGrf, "en_GB").unwrap();
        a.record_change(&policy(), "fr_FR", "K", StringValue::new("v"), "x", at(0))
            .unwrap();
        let mut b = a.clone();
        b.clear_dirty();
        b.refresh_stability(&HistoryPolicy::new(5, 0, 0), at(10));
        assert_eq!(a, b);
    }

    #[test]
    fn from_parts_rejects_inconsistent_history() {
        let change = |seq, secs| Change::new(seq, StringValue::new("v"), "a", at(secs));
        assert!(StringEntry::from_parts(StringValue::new("v"), vec![change(1, 0), change(2, 1)], 2).is_ok());
        assert!(StringEntry::from_parts(StringValue::new("v"), vec![change(2, 0), change(2, 1)], 2).is_err());
        assert!(StringEntry::from_parts(StringValue::new("v"), vec![change(3, 0)], 2).is_err());
        assert!(StringEntry::from_parts(StringValue::new("v"), vec![change(1, 5), change(2, 1)], 2).is_err());
    }

    #[test]
    fn export_keeps_only_stable_strings_unless_asked() {
        let mut project =
            Project::new(ProjectId::new("demo").unwrap(), ProjectType::NewGrf, "en_GB").unwrap();
        let p = HistoryPolicy::new(5, 1, 60);
        project
            .record_change(&p, "de_DE", "OLD", StringValue::new("alt"), "x", at(0))
            .unwrap();
        project
            .record_change(&p, "de_DE", "NEW", StringValue::new("neu"), "x", at(100))
            .unwrap();

        let stable = project.export_values(&p, "de_DE", true, at(120)).unwrap();
        assert_eq!(stable.keys().collect::<Vec<_>>(), vec!["OLD"]);
        assert_eq!(stable["OLD"].text, "alt");

        let all = project.export_values(&p, "de_DE", false, at(120)).unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["NEW", "OLD"]);

        assert!(project.export_values(&p, "fr_FR", true, at(120)).is_none());
        assert_eq!(project.export_values(&p, "en_GB", true, at(120)).unwrap().len(), 0);
    }

    #[test]
    fn report_counts_base_and_targets() {
        let mut project =
            Project::new(ProjectId::new("demo").unwrap(), ProjectType::NewGrf, "en_GB").unwrap();
        let p = HistoryPolicy::new(5, 1, 60);
        project
            .record_change(&p, "en_GB", "A", StringValue::new("a"), "x", at(0))
            .unwrap();
        project
            .record_change(&p, "de_DE", "A", StringValue::new("a"), "x", at(100))
            .unwrap();

        let reports = project.refresh_stability(&p, at(120));
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].code, "en_GB");
        assert_eq!(reports[0].stable, 1);
        assert_eq!(reports[1].code, "de_DE");
        assert_eq!(reports[1].unstable, 1);
    }
}
