//! The external rule-design collaborator.
//!
//! An advisor receives a JSON request (a metadata summary, or a batch of
//! files) and answers with free text that should contain JSON. Answers are
//! untrusted: they are repaired where possible, retried, and otherwise
//! replaced by the catch-all.

use crate::error::Error;
use crate::model::FileRecord;
use crate::rules::Rule;
use crate::summary::MetadataSummary;
use ahash::AHashMap;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, info, warn};

/// Repair candidates tried before declaring a response malformed.
const MAX_REPAIR_CANDIDATES: usize = 64;

#[derive(Debug, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AdvisorRequest<'a> {
    /// Design an ordered rule set for the whole tree.
    Rules {
        summary: &'a MetadataSummary,
        catch_all_template: &'a str,
    },
    /// Choose a destination for each listed file.
    Direct { root: &'a str, files: Vec<FileBrief> },
}

#[derive(Debug, Clone, Serialize)]
pub struct FileBrief {
    pub path: String,
    pub size_bytes: u64,
    pub extension: String,
    pub modified: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_taken: Option<NaiveDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
}

impl FileBrief {
    pub fn new(record: &FileRecord, cluster: Option<&str>) -> Self {
        Self {
            path: record.relative_path.clone(),
            size_bytes: record.size_bytes,
            extension: record.extension.clone(),
            modified: record.modified,
            date_taken: record.date_taken,
            cluster: cluster.map(str::to_string),
        }
    }
}

pub trait RuleAdvisor: Send + Sync {
    fn name(&self) -> &str;

    /// Raw response text for `request`.
    fn consult(&self, request: &AdvisorRequest<'_>) -> Result<String, Error>;
}

/// Runs an external program: the request goes to its stdin as JSON, the
/// response is whatever it prints on stdout.
pub struct CommandAdvisor {
    label: String,
    program: String,
    args: Vec<String>,
}

impl CommandAdvisor {
    /// `command_line` is split on whitespace; no shell quoting is applied.
    pub fn new(command_line: &str) -> Result<Self, Error> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::Advisor("empty advisor command".to_string()))?;
        Ok(Self {
            label: command_line.trim().to_string(),
            program,
            args: parts.collect(),
        })
    }
}

impl RuleAdvisor for CommandAdvisor {
    fn name(&self) -> &str {
        &self.label
    }

    fn consult(&self, request: &AdvisorRequest<'_>) -> Result<String, Error> {
        let payload = serde_json::to_vec(request)?;
        debug!("Sending {} bytes to advisor '{}'", payload.len(), self.label);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Advisor(format!("failed to start '{}': {}", self.program, e)))?;

        // Feed stdin from a separate thread so a chatty child cannot deadlock
        // on a full stdout pipe.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Advisor("advisor stdin unavailable".to_string()))?;
        let feeder = thread::spawn(move || stdin.write_all(&payload));

        let output = child.wait_with_output()?;
        match feeder.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Advisor closed stdin early: {}", e),
            Err(_) => warn!("Advisor stdin writer panicked"),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Advisor(format!(
                "'{}' exited with {}: {}",
                self.label,
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Replays a prepared response document for every request.
pub struct FileAdvisor {
    path: PathBuf,
    label: String,
}

impl FileAdvisor {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            label: path.display().to_string(),
        }
    }
}

impl RuleAdvisor for FileAdvisor {
    fn name(&self) -> &str {
        &self.label
    }

    fn consult(&self, _request: &AdvisorRequest<'_>) -> Result<String, Error> {
        Ok(fs::read_to_string(&self.path)?)
    }
}

/// Pull the JSON part out of a chatty response: a ```json fence, any fence,
/// or the span from the first `{` to the last `}`.
pub fn extract_json_payload(text: &str) -> Option<String> {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + "```json".len()..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        if let Some(newline) = rest.find('\n') {
            let body = &rest[newline + 1..];
            if let Some(end) = body.find("```") {
                return Some(body[..end].trim().to_string());
            }
        }
    }

    let first = trimmed.find('{')?;
    let last = trimmed.rfind('}')?;
    if first <= last {
        return Some(trimmed[first..=last].to_string());
    }

    None
}

fn closers(stack: &[char]) -> String {
    stack
        .iter()
        .rev()
        .map(|open| if *open == '{' { '}' } else { ']' })
        .collect()
}

/// A place where a truncated document can be cut and closed.
struct CutPoint {
    /// Exclusive end of the kept prefix.
    end: usize,
    /// Closers for the containers still open at `end`.
    closers: String,
}

/// Salvage a response that was cut off mid-document. Candidates end at a
/// structural boundary (after a closed value, or before a comma) and get
/// their open containers closed; the longest candidate that parses wins.
/// A dangling partial string is dropped rather than closed.
///
/// Cut points are collected in one pass; the text is only copied when a
/// candidate is tried.
pub fn recover_truncated_json(text: &str) -> Option<Value> {
    let start = text.find(['{', '['])?;
    let body = &text[start..];

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut cuts: VecDeque<CutPoint> = VecDeque::new();
    let mut push = |end: usize, stack: &[char]| {
        if cuts.len() == MAX_REPAIR_CANDIDATES {
            cuts.pop_front();
        }
        cuts.push_back(CutPoint {
            end,
            closers: closers(stack),
        });
    };

    for (idx, ch) in body.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => stack.push(ch),
            '}' | ']' => {
                stack.pop();
                push(idx + 1, &stack);
                if stack.is_empty() {
                    // The document closed on its own; anything after is noise.
                    break;
                }
            }
            ',' => push(idx, &stack),
            _ => {}
        }
    }
    if !in_string && !stack.is_empty() {
        push(body.trim_end().len(), &stack);
    }

    cuts.iter()
        .rev()
        .find_map(|cut| {
            let mut candidate = String::with_capacity(cut.end + cut.closers.len());
            candidate.push_str(&body[..cut.end]);
            candidate.push_str(&cut.closers);
            serde_json::from_str::<Value>(&candidate).ok()
        })
        .filter(|value| value.is_object() || value.is_array())
}

/// Parse an advisor response, repairing it if needed.
pub fn parse_advisor_json(text: &str) -> Result<Value, Error> {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        return Ok(value);
    }
    if let Some(payload) = extract_json_payload(text) {
        if let Ok(value) = serde_json::from_str::<Value>(&payload) {
            return Ok(value);
        }
    }
    if let Some(value) = recover_truncated_json(text) {
        warn!("Advisor response was truncated, recovered a partial document");
        return Ok(value);
    }

    let snippet: String = text.chars().take(200).collect();
    Err(Error::AdvisorResponseMalformed(snippet))
}

/// Rules from `{"rules": [...]}` or a bare array. Individually malformed
/// rules are skipped.
pub fn parse_rule_set(text: &str) -> Result<Vec<Rule>, Error> {
    let value = parse_advisor_json(text)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("rules") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(Error::AdvisorResponseMalformed(
                    "response has no \"rules\" array".to_string(),
                ))
            }
        },
        _ => {
            return Err(Error::AdvisorResponseMalformed(
                "response is not an object".to_string(),
            ))
        }
    };

    let total = items.len();
    let rules: Vec<Rule> = items
        .into_iter()
        .enumerate()
        .filter_map(|(idx, item)| match serde_json::from_value::<Rule>(item) {
            Ok(rule) => Some(rule),
            Err(e) => {
                warn!("Ignoring malformed rule #{}: {}", idx + 1, e);
                None
            }
        })
        .collect();

    if rules.is_empty() && total > 0 {
        return Err(Error::AdvisorResponseMalformed(
            "no usable rules in response".to_string(),
        ));
    }
    Ok(rules)
}

/// Per-file destinations keyed by relative source path. Accepts
/// `{"decisions": {path: dest}}`, `{"decisions"|"moves": [{"path"|"old",
/// "destination"|"new"}]}`, or a bare `{path: dest}` object.
pub fn parse_decisions(text: &str) -> Result<AHashMap<String, String>, Error> {
    let value = parse_advisor_json(text)?;
    let mut map = match value {
        Value::Object(map) => map,
        _ => {
            return Err(Error::AdvisorResponseMalformed(
                "decisions must be an object".to_string(),
            ))
        }
    };
    let nested = match map.remove("decisions") {
        Some(value) => Some(value),
        None => map.remove("moves"),
    };
    let body = match nested {
        Some(value) => value,
        None => Value::Object(map),
    };

    let mut decisions = AHashMap::new();
    match body {
        Value::Object(entries) => {
            for (path, dest) in entries {
                if let Value::String(dest) = dest {
                    decisions.insert(path, dest);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                let path = item.get("path").or_else(|| item.get("old"));
                let dest = item.get("destination").or_else(|| item.get("new"));
                if let (Some(Value::String(path)), Some(Value::String(dest))) = (path, dest) {
                    decisions.insert(path.clone(), dest.clone());
                }
            }
        }
        _ => {
            return Err(Error::AdvisorResponseMalformed(
                "decisions must be an object or array".to_string(),
            ))
        }
    }
    Ok(decisions)
}

/// Ask `advisor` and parse the answer, retrying up to `retries` more times.
pub fn consult_with_retries<T>(
    advisor: &dyn RuleAdvisor,
    request: &AdvisorRequest<'_>,
    retries: u32,
    parse: impl Fn(&str) -> Result<T, Error>,
) -> Result<T, Error> {
    let mut last_error = None;
    for attempt in 0..=retries {
        if attempt > 0 {
            info!("Retrying advisor '{}' (attempt {})", advisor.name(), attempt + 1);
        }
        match advisor.consult(request).and_then(|text| parse(&text)) {
            Ok(parsed) => return Ok(parsed),
            Err(e) => {
                warn!("Advisor '{}' attempt {} failed: {}", advisor.name(), attempt + 1, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| Error::Advisor("advisor was never consulted".to_string())))
}
