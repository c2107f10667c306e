//! Agent output protocol.
//!
//! ```text
//! <<<<piggyback-target>>>>
//! <<<azure_name:sep(124)>>>
//! field|field
//! <<<<>>>>
//! ```
//!
//! Sections collect pre-rendered lines and are written in one go under the
//! writer lock, so concurrent tasks never interleave their blocks.

use std::fmt::Display;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::AgentError;
use crate::resource::AzureSubscription;

pub const SECTION_PREFIX: &str = "azure_";
/// `|`
pub const DEFAULT_SEPARATOR: u32 = 124;
const AUTHORIZATION_HINT: &str = "HINT: Make sure you have a proper role asigned to your client!";

// ── JSON rendering ──────────────────────────────────────────────────

/// `", "` / `": "` separators and `\uXXXX` escapes for non-ASCII text.
struct PythonFormatter;

impl Formatter for PythonFormatter {
    fn begin_array_value<W: ?Sized + Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        if fragment.is_ascii() {
            return writer.write_all(fragment.as_bytes());
        }
        let mut units = [0u16; 2];
        for c in fragment.chars() {
            if c.is_ascii() {
                writer.write_all(&[c as u8])?;
            } else {
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

/// Render `value` the way the downstream section parsers expect it.
pub fn python_json<T: Serialize + ?Sized>(value: &T) -> String {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, PythonFormatter);
    if value.serialize(&mut ser).is_err() {
        return "null".to_string();
    }
    String::from_utf8(out).unwrap_or_default()
}

/// Like [`python_json`], with object keys sorted at every level.
pub fn python_json_sorted(value: &Value) -> String {
    python_json(&sort_keys(value))
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Value::Object(
                keys.into_iter()
                    .map(|k| (k.clone(), sort_keys(&map[k])))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

// ── Writer ──────────────────────────────────────────────────────────

/// Output stream shared by every task of a run.
pub struct SectionWriter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl SectionWriter {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Writer capturing into memory, with a handle to read it back.
    pub fn in_memory() -> (Self, OutputBuffer) {
        let buffer = OutputBuffer::default();
        (Self::new(buffer.clone()), buffer)
    }

    /// Write `block` as is, under the stream lock.
    pub fn write_text(&self, block: &str) -> io::Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "section writer poisoned"))?;
        out.write_all(block.as_bytes())?;
        out.flush()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
    pub fn contents(&self) -> String {
        self.0
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "buffer poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Sections ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    title: String,
    separator: char,
    piggytargets: Vec<String>,
    lines: Vec<String>,
}

impl Section {
    fn with_targets(name: &str, piggytargets: Vec<String>, separator: u32) -> Self {
        let full_name = format!("{SECTION_PREFIX}{name}").replace('-', "_");
        Self {
            title: format!("<<<{full_name}:sep({separator})>>>\n"),
            separator: char::from_u32(separator).unwrap_or('|'),
            piggytargets,
            lines: Vec::new(),
        }
    }

    /// Section of the host the agent runs for.
    pub fn main(name: &str) -> Self {
        Self::with_targets(name, vec![String::new()], DEFAULT_SEPARATOR)
    }

    pub fn main_sep(name: &str, separator: u32) -> Self {
        Self::with_targets(name, vec![String::new()], separator)
    }

    /// Section piggybacked to `targets`, host names made safe per
    /// subscription.
    pub fn piggyback<S: AsRef<str>>(name: &str, targets: &[S], subscription: &AzureSubscription) -> Self {
        Self::piggyback_sep(name, targets, subscription, DEFAULT_SEPARATOR)
    }

    pub fn piggyback_sep<S: AsRef<str>>(
        name: &str,
        targets: &[S],
        subscription: &AzureSubscription,
        separator: u32,
    ) -> Self {
        let targets: Vec<String> = targets
            .iter()
            .map(|t| subscription.safe_hostname(t.as_ref()))
            .collect();
        if targets.is_empty() {
            return Self::with_targets(name, vec![String::new()], separator);
        }
        Self::with_targets(name, targets, separator)
    }

    /// Host labels: the first line holds the labels, the second the tags.
    pub fn labels<L: Serialize, T: Serialize>(
        target: &str,
        subscription: &AzureSubscription,
        labels: &L,
        tags: &T,
    ) -> Self {
        let mut section = Self::piggyback_sep("labels", &[target], subscription, 0);
        section.add([python_json(labels)]);
        section.add([python_json(tags)]);
        section
    }

    pub fn add<I, T>(&mut self, row: I)
    where
        I: IntoIterator<Item = T>,
        T: Display,
    {
        let line = row
            .into_iter()
            .map(|token| token.to_string())
            .collect::<Vec<_>>()
            .join(&self.separator.to_string());
        self.lines.push(line);
    }

    pub fn add_rows<R, I, T>(&mut self, rows: R)
    where
        R: IntoIterator<Item = I>,
        I: IntoIterator<Item = T>,
        T: Display,
    {
        for row in rows {
            self.add(row);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn render(&self, write_empty: bool) -> String {
        if !(write_empty || !self.lines.is_empty()) {
            return String::new();
        }
        let mut block = String::new();
        for target in &self.piggytargets {
            block.push_str(&format!("<<<<{target}>>>>\n"));
            block.push_str(&self.title);
            for line in &self.lines {
                block.push_str(line);
                block.push('\n');
            }
        }
        block.push_str("<<<<>>>>\n");
        block
    }

    /// Write the block; an empty section is skipped unless `write_empty`.
    pub fn write(&self, writer: &SectionWriter, write_empty: bool) -> io::Result<()> {
        let block = self.render(write_empty);
        if block.is_empty() {
            return Ok(());
        }
        writer.write_text(&block)
    }
}

// ── agent_info ──────────────────────────────────────────────────────

/// Issues found while processing metrics, written as `agent_info`.
#[derive(Debug, Default)]
pub struct IssueCollector {
    issues: Mutex<Vec<Value>>,
}

impl IssueCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, issue_type: &str, issued_by: &str, msg: &str) {
        let issue = serde_json::json!({"type": issue_type, "issued_by": issued_by, "msg": msg});
        if let Ok(mut issues) = self.issues.lock() {
            issues.push(issue);
        }
    }

    pub fn len(&self) -> usize {
        self.issues.lock().map(|i| i.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dumpinfo(&self) -> Vec<[String; 2]> {
        self.issues
            .lock()
            .map(|issues| {
                issues
                    .iter()
                    .map(|issue| ["issue".to_string(), python_json(issue)])
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Shorten an error text to what is useful in a bailout line.
pub fn bailout_message(text: &str) -> String {
    let text = text.split("Trace ID").next().unwrap_or_default();
    let text = text.splitn(3, ':').last().unwrap_or_default();
    let mut msg = text.trim_matches(|c| c == ' ' || c == ',').to_string();
    if msg.contains("does not have authorization to perform action") {
        msg.push_str(AUTHORIZATION_HINT);
    }
    msg
}

/// Text of an error as shown in a bailout, without the kind prefix.
pub fn error_text(error: &AgentError) -> String {
    match error {
        AgentError::Azure(e) => e.message.clone(),
        other => other.to_string(),
    }
}

/// `agent_info` section carrying one bailout, on the subscription host or
/// on the main host.
pub fn bailout_section(
    status: u8,
    component: &str,
    message: &str,
    subscription: Option<&AzureSubscription>,
) -> Section {
    let mut section = match subscription {
        Some(sub) => Section::piggyback("agent_info", &[&sub.hostname], sub),
        None => Section::main("agent_info"),
    };
    let entry = (status, format!("{component}: {message}"));
    section.add(["agent-bailout".to_string(), python_json(&entry)]);
    section
}

/// Write a bailout for `error`.
pub fn write_exception_to_agent_info_section(
    writer: &SectionWriter,
    error: &AgentError,
    component: &str,
    subscription: Option<&AzureSubscription>,
) -> io::Result<()> {
    warn!("Writing exception for component {}:\n {}", component, error);
    let message = bailout_message(&error_text(error));
    bailout_section(2, component, &message, subscription).write(writer, false)
}

// ─── Tests ──────────────────────────────────────────────────────────
