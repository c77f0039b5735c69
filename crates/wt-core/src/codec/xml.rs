//! XML encoding.
//!
//! ```xml
//! <project version="1" id="opengfx" type="newgrf" name="OpenGFX" url="...">
//!   <base>
//!     <language code="en_GB">
//!       <string key="STR_TRAIN" changes="7">
//!         <value><text>Train</text><case name="plural">Trains</case></value>
//!         <change seq="7" author="anne" time="2024-05-01T10:00:00Z"><text>Train</text></change>
//!       </string>
//!     </language>
//!   </base>
//!   <languages>
//!     <language code="nl_NL">...</language>
//!   </languages>
//! </project>
//! ```
//!
//! Split storage uses `<project-header>` (with a `<language-index>` of
//! `<language-ref code=".."/>` instead of `<languages>`) and a standalone
//! `<language version="1" code="..">` document.

use std::collections::BTreeMap;
use std::fmt::Display;

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use super::{check_version, DecodeError, EncodeError, ProjectHeader, SCHEMA_VERSION};
use crate::model::{
    Change, LanguageTable, Project, ProjectId, ProjectType, StringEntry, StringValue,
};

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

fn write_err(e: impl Display) -> EncodeError {
    EncodeError::new(format!("xml: {e}"))
}

struct XmlOut {
    writer: Writer<Vec<u8>>,
}

impl XmlOut {
    fn new() -> Result<Self, EncodeError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(write_err)?;
        Ok(Self { writer })
    }

    fn start(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<(), EncodeError> {
        let mut start = BytesStart::new(name);
        for attr in attrs {
            start.push_attribute(*attr);
        }
        self.writer.write_event(Event::Start(start)).map_err(write_err)
    }

    fn end(&mut self, name: &str) -> Result<(), EncodeError> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(write_err)
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<(), EncodeError> {
        let mut start = BytesStart::new(name);
        for attr in attrs {
            start.push_attribute(*attr);
        }
        self.writer.write_event(Event::Empty(start)).map_err(write_err)
    }

    /// Element with exact text content. Empty text is written as `<name/>`
    /// so indentation never leaks into the value.
    fn text_element(&mut self, name: &str, attrs: &[(&str, &str)], text: &str) -> Result<(), EncodeError> {
        if text.is_empty() {
            return self.empty(name, attrs);
        }
        self.start(name, attrs)?;
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(write_err)?;
        self.end(name)
    }

    fn finish(mut self) -> Result<Vec<u8>, EncodeError> {
        self.writer
            .write_event(Event::Text(BytesText::new("\n")))
            .map_err(write_err)?;
        Ok(self.writer.into_inner())
    }

    fn value_body(&mut self, value: &StringValue) -> Result<(), EncodeError> {
        self.text_element("text", &[], &value.text)?;
        for (case, text) in &value.cases {
            self.text_element("case", &[("name", case.as_str())], text)?;
        }
        Ok(())
    }

    fn entry(&mut self, key: &str, entry: &StringEntry) -> Result<(), EncodeError> {
        let changes = entry.lifetime_changes().to_string();
        self.start("string", &[("key", key), ("changes", changes.as_str())])?;

        self.start("value", &[])?;
        self.value_body(entry.value())?;
        self.end("value")?;

        for change in entry.history() {
            let seq = change.seq().to_string();
            let time = format_time(change.timestamp());
            self.start(
                "change",
                &[
                    ("seq", seq.as_str()),
                    ("author", change.author()),
                    ("time", time.as_str()),
                ],
            )?;
            self.value_body(change.value())?;
            self.end("change")?;
        }
        self.end("string")
    }

    fn language(&mut self, table: &LanguageTable, version: Option<&str>) -> Result<(), EncodeError> {
        let mut attrs = Vec::with_capacity(2);
        if let Some(v) = version {
            attrs.push(("version", v));
        }
        attrs.push(("code", table.code()));
        if table.is_empty() {
            return self.empty("language", &attrs);
        }
        self.start("language", &attrs)?;
        for (key, entry) in table.iter() {
            self.entry(key, entry)?;
        }
        self.end("language")
    }

    fn project_start(&mut self, root: &str, project: &Project, version: &str) -> Result<(), EncodeError> {
        let mut attrs = vec![
            ("version", version),
            ("id", project.id().as_str()),
            ("type", project.project_type().as_str()),
            ("name", project.name.as_str()),
        ];
        if let Some(url) = project.url.as_deref() {
            attrs.push(("url", url));
        }
        self.start(root, &attrs)?;
        self.start("base", &[])?;
        self.language(project.base_language(), None)?;
        self.end("base")
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub(super) fn encode_project(project: &Project) -> Result<Vec<u8>, EncodeError> {
    let version = SCHEMA_VERSION.to_string();
    let mut out = XmlOut::new()?;
    out.project_start("project", project, &version)?;
    out.start("languages", &[])?;
    for table in project.languages() {
        out.language(table, None)?;
    }
    out.end("languages")?;
    out.end("project")?;
    out.finish()
}

pub(super) fn encode_header(project: &Project) -> Result<Vec<u8>, EncodeError> {
    let version = SCHEMA_VERSION.to_string();
    let mut out = XmlOut::new()?;
    out.project_start("project-header", project, &version)?;
    out.start("language-index", &[])?;
    for table in project.languages() {
        out.empty("language-ref", &[("code", table.code())])?;
    }
    out.end("language-index")?;
    out.end("project-header")?;
    out.finish()
}

pub(super) fn encode_language(table: &LanguageTable) -> Result<Vec<u8>, EncodeError> {
    let version = SCHEMA_VERSION.to_string();
    let mut out = XmlOut::new()?;
    out.language(table, Some(version.as_str()))?;
    out.finish()
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

fn read_err(e: impl Display) -> DecodeError {
    DecodeError::new(format!("xml: {e}"))
}

/// Minimal element tree. Text of container elements is collected but only
/// read for leaf elements such as `<text>` and `<case>`.
#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, DecodeError> {
        let name = std::str::from_utf8(start.name().as_ref())
            .map_err(read_err)?
            .to_string();
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(read_err)?;
            let key = std::str::from_utf8(attr.key.as_ref())
                .map_err(read_err)?
                .to_string();
            let value = attr.unescape_value().map_err(read_err)?.into_owned();
            attrs.push((key, value));
        }
        Ok(Self {
            name,
            attrs,
            ..Self::default()
        })
    }

    fn expect_name(&self, name: &str) -> Result<(), DecodeError> {
        if self.name == name {
            Ok(())
        } else {
            Err(DecodeError::new(format!(
                "expected <{}>, found <{}>",
                name, self.name
            )))
        }
    }

    fn opt_attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn attr(&self, name: &str) -> Result<&str, DecodeError> {
        self.opt_attr(name).ok_or_else(|| {
            DecodeError::new(format!("<{}> is missing attribute '{}'", self.name, name))
        })
    }

    fn parsed_attr<T>(&self, name: &str) -> Result<T, DecodeError>
    where
        T: std::str::FromStr,
        T::Err: Display,
    {
        let raw = self.attr(name)?;
        raw.parse().map_err(|e: T::Err| {
            DecodeError::new(format!("<{}> attribute '{}'='{}': {}", self.name, name, raw, e))
        })
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn child<'a>(&'a self, name: &'a str) -> Result<&'a Element, DecodeError> {
        let mut found = self.children_named(name);
        match (found.next(), found.next()) {
            (Some(child), None) => Ok(child),
            (None, _) => Err(DecodeError::new(format!(
                "<{}> is missing <{}>",
                self.name, name
            ))),
            (Some(_), Some(_)) => Err(DecodeError::new(format!(
                "<{}> has more than one <{}>",
                self.name, name
            ))),
        }
    }
}

fn parse_tree(bytes: &[u8]) -> Result<Element, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(read_err)?;
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader.read_event().map_err(|e| {
            DecodeError::new(format!("xml at byte {}: {}", reader.buffer_position(), e))
        })?;
        match event {
            Event::Start(start) => {
                if root.is_some() {
                    return Err(DecodeError::new("content after the root element"));
                }
                stack.push(Element::from_start(&start)?);
            }
            Event::Empty(start) => {
                let element = Element::from_start(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None if root.is_none() => root = Some(element),
                    None => return Err(DecodeError::new("content after the root element")),
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| DecodeError::new("unbalanced closing tag"))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::Text(t) => {
                let content = t.unescape().map_err(read_err)?;
                match stack.last_mut() {
                    Some(current) => current.text.push_str(&content),
                    None if content.trim().is_empty() => {}
                    None => return Err(DecodeError::new("text outside the root element")),
                }
            }
            Event::CData(t) => {
                let raw = t.into_inner();
                let content = std::str::from_utf8(&raw).map_err(read_err)?;
                match stack.last_mut() {
                    Some(current) => current.text.push_str(content),
                    None => return Err(DecodeError::new("CDATA outside the root element")),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(DecodeError::new(format!(
            "truncated document: <{}> is not closed",
            stack.last().map(|e| e.name.as_str()).unwrap_or_default()
        )));
    }
    root.ok_or_else(|| DecodeError::new("empty document"))
}

fn read_version(root: &Element) -> Result<(), DecodeError> {
    let version = match root.opt_attr("version") {
        Some(raw) => Some(
            raw.parse::<u32>()
                .map_err(|_| DecodeError::new(format!("bad schema version '{raw}'")))?,
        ),
        None => None,
    };
    check_version(version)
}

fn read_value(element: &Element) -> Result<StringValue, DecodeError> {
    let text = element.child("text")?.text.clone();
    let mut cases = BTreeMap::new();
    for case in element.children_named("case") {
        let name = case.attr("name")?.to_string();
        if cases.insert(name.clone(), case.text.clone()).is_some() {
            return Err(DecodeError::new(format!("duplicate case '{name}'")));
        }
    }
    Ok(StringValue { text, cases })
}

fn read_entry(element: &Element) -> Result<(String, StringEntry), DecodeError> {
    element.expect_name("string")?;
    let key = element.attr("key")?.to_string();
    let lifetime: u64 = element.parsed_attr("changes")?;
    let value = read_value(element.child("value")?)?;

    let mut history = Vec::new();
    for change in element.children_named("change") {
        let seq: u64 = change.parsed_attr("seq")?;
        let author = change.attr("author")?;
        let raw_time = change.attr("time")?;
        let time = DateTime::parse_from_rfc3339(raw_time)
            .map_err(|e| DecodeError::new(format!("change time '{raw_time}': {e}")))?
            .with_timezone(&Utc);
        history.push(Change::new(seq, read_value(change)?, author, time));
    }

    let entry = StringEntry::from_parts(value, history, lifetime)
        .map_err(|e| DecodeError::new(format!("string '{key}': {e}")))?;
    Ok((key, entry))
}

fn read_language(element: &Element) -> Result<LanguageTable, DecodeError> {
    element.expect_name("language")?;
    let mut table = LanguageTable::new(element.attr("code")?)
        .map_err(|e| DecodeError::new(e.to_string()))?;
    for child in element.children_named("string") {
        let (key, entry) = read_entry(child)?;
        if table.get(&key).is_some() {
            return Err(DecodeError::new(format!(
                "duplicate string '{}' in language '{}'",
                key,
                table.code()
            )));
        }
        table.insert(key, entry);
    }
    Ok(table)
}

fn read_project_head(root: &Element) -> Result<Project, DecodeError> {
    read_version(root)?;
    let id = ProjectId::new(root.attr("id")?).map_err(|e| DecodeError::new(e.to_string()))?;
    let project_type: ProjectType = root.parsed_attr("type")?;
    let base = read_language(root.child("base")?.child("language")?)?;
    Ok(Project {
        id,
        project_type,
        name: root.attr("name")?.to_string(),
        url: root.opt_attr("url").map(str::to_string),
        base,
        languages: BTreeMap::new(),
        dirty: false,
    })
}

pub(super) fn decode_project(bytes: &[u8]) -> Result<Project, DecodeError> {
    let root = parse_tree(bytes)?;
    root.expect_name("project")?;
    let mut project = read_project_head(&root)?;
    if let Ok(languages) = root.child("languages") {
        for element in languages.children_named("language") {
            let table = read_language(element)?;
            let code = table.code().to_string();
            if project.languages.insert(code.clone(), table).is_some() {
                return Err(DecodeError::new(format!("duplicate language '{code}'")));
            }
        }
    }
    Ok(project)
}

pub(super) fn decode_header(bytes: &[u8]) -> Result<ProjectHeader, DecodeError> {
    let root = parse_tree(bytes)?;
    root.expect_name("project-header")?;
    let project = read_project_head(&root)?;
    let mut languages = Vec::new();
    if let Ok(index) = root.child("language-index") {
        for reference in index.children_named("language-ref") {
            languages.push(reference.attr("code")?.to_string());
        }
    }
    Ok(ProjectHeader { project, languages })
}

pub(super) fn decode_language(bytes: &[u8]) -> Result<LanguageTable, DecodeError> {
    let root = parse_tree(bytes)?;
    read_version(&root)?;
    read_language(&root)
}
