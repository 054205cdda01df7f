//! Organization rules: matchers, destination templates, and the ordered rule
//! set evaluated first-match-wins with a catch-all sentinel at the end.

use crate::cluster::Cluster;
use crate::config::DEFAULT_CATCH_ALL_TEMPLATE;
use crate::hasher::hash_str;
use crate::model::{FileCategory, FileRecord};
use crate::paths::{self, normalize_relative};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{trace, warn};

pub const CATCH_ALL_ID: &str = "catch-all";
const MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} in template '{template}'")]
pub struct TemplateError {
    pub template: String,
    pub message: String,
}

impl TemplateError {
    fn new(template: &str, message: impl Into<String>) -> Self {
        Self {
            template: template.to_string(),
            message: message.into(),
        }
    }
}

/// Criteria for matching a file. Every criterion that is set must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchCriteria {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext_in: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext_not_in: Option<Vec<String>>,
    /// Glob over the `/`-separated relative path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub glob: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_name_contains_any: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_contains_any: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size_bytes: Option<u64>,
    /// ISO 8601 date or date-time, inclusive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_start: Option<String>,
    /// ISO 8601 date or date-time, inclusive. A bare date covers the whole day.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_in: Option<Vec<FileCategory>>,
    /// `"any"`, `"none"`, or a cluster id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
}

impl MatchCriteria {
    pub fn is_unconditional(&self) -> bool {
        *self == MatchCriteria::default()
    }
}

/// A rule as authored (by a person or the advisor).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub id: String,
    pub name: String,
    /// Higher runs first. Ties keep authoring order.
    pub priority: i64,
    #[serde(rename = "match")]
    pub criteria: MatchCriteria,
    #[serde(alias = "target_template")]
    pub destination_template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Piece {
    Literal(String),
    Year,
    Month,
    MonthNum,
    Ext,
    Type,
    Parent,
    OriginalName,
    Stem,
    Cluster,
    EventName,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    pieces: Vec<Piece>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(TemplateError::new(source, "empty template"));
        }
        if trimmed.starts_with('/')
            || trimmed.starts_with('\\')
            || trimmed.chars().nth(1) == Some(':')
        {
            return Err(TemplateError::new(source, "absolute path"));
        }
        if trimmed.split(['/', '\\']).any(|s| s.trim() == "..") {
            return Err(TemplateError::new(source, "parent directory segment"));
        }

        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut chars = trimmed.chars();
        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => {
                                return Err(TemplateError::new(source, "unbalanced '{'"));
                            }
                            Some(ch) => name.push(ch),
                        }
                    }
                    let piece = match name.trim() {
                        "year" => Piece::Year,
                        "month" => Piece::Month,
                        "month_num" => Piece::MonthNum,
                        "ext" => Piece::Ext,
                        "type" => Piece::Type,
                        "parent" => Piece::Parent,
                        "original_name" => Piece::OriginalName,
                        "stem" => Piece::Stem,
                        "cluster" => Piece::Cluster,
                        "event_name" => Piece::EventName,
                        other => {
                            return Err(TemplateError::new(
                                source,
                                format!("unknown placeholder '{{{other}}}'"),
                            ));
                        }
                    };
                    if !literal.is_empty() {
                        pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                    }
                    pieces.push(piece);
                }
                '}' => return Err(TemplateError::new(source, "unbalanced '}'")),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            pieces.push(Piece::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            pieces,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render a relative destination for `record`. The result is normalized,
    /// always ends with the file's original name, and never points inside a
    /// bundle.
    pub fn render(
        &self,
        record: &FileRecord,
        cluster: Option<&Cluster>,
        event_name: Option<&str>,
    ) -> Result<String, TemplateError> {
        let original_name = record.file_name();
        let when = record.effective_time();
        let (_, stem, _) = paths::split_name(original_name);

        let mut out = String::new();
        for piece in &self.pieces {
            let value: String = match piece {
                Piece::Literal(text) => {
                    out.push_str(text);
                    continue;
                }
                Piece::Year => when.year().to_string(),
                Piece::Month => MONTHS[when.month0() as usize].to_string(),
                Piece::MonthNum => format!("{:02}", when.month()),
                Piece::Ext => record.extension.clone(),
                Piece::Type => record.category.folder_name().to_string(),
                Piece::Parent => record.parent_name().to_string(),
                Piece::OriginalName => original_name.to_string(),
                Piece::Stem => stem.to_string(),
                Piece::Cluster => cluster
                    .map(|c| c.label.clone())
                    .unwrap_or_else(|| "Unclustered".to_string()),
                Piece::EventName => event_name
                    .map(str::to_string)
                    .or_else(|| cluster.map(|c| c.label.clone()))
                    .unwrap_or_else(|| "Misc".to_string()),
            };
            out.push_str(&sanitize_segment_value(&value));
        }

        finalize_destination(&out, original_name)
            .map_err(|message| TemplateError::new(&self.source, message))
    }
}

/// Turn a raw relative destination into its final form: normalized, ending
/// with `original_name`, duplicate segments collapsed, outside any bundle.
/// Also applied to per-file destinations chosen by the advisor.
pub fn finalize_destination(raw: &str, original_name: &str) -> Result<String, &'static str> {
    let normalized = normalize_relative(raw).ok_or("rendered to an empty or escaping path")?;
    let full = if normalized.rsplit('/').next() == Some(original_name) {
        normalized
    } else {
        format!("{}/{}", normalized, original_name)
    };
    let segments: Vec<&str> = full.split('/').collect();

    let deduped = dedupe_segments(&segments);
    if paths::path_contains_bundle(&deduped) {
        return Err("destination inside a bundle");
    }
    Ok(deduped)
}

fn sanitize_segment_value(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '-',
            c => c,
        })
        .collect()
}

/// Collapse `Misc/Misc` and `2023 - Misc/Misc` style repetition.
fn dedupe_segments(segments: &[&str]) -> String {
    let mut kept: Vec<&str> = Vec::with_capacity(segments.len());
    for (i, segment) in segments.iter().enumerate() {
        if let Some(prev) = i.checked_sub(1).map(|p| segments[p]) {
            let is_last = i + 1 == segments.len();
            if !is_last
                && (*segment == prev || prev.ends_with(&format!(" - {segment}")))
            {
                continue;
            }
        }
        kept.push(segment);
    }
    kept.join("/")
}

#[derive(Debug, Clone)]
enum ClusterFilter {
    Any,
    None,
    Id(String),
}

/// Matcher with pre-parsed globs, extensions and dates.
#[derive(Debug, Clone)]
struct Matcher {
    ext_in: Option<Vec<String>>,
    ext_not_in: Option<Vec<String>>,
    glob: Option<Pattern>,
    parent_any: Option<Vec<String>>,
    path_any: Option<Vec<String>>,
    min_size: Option<u64>,
    max_size: Option<u64>,
    date_start: Option<NaiveDateTime>,
    date_end: Option<NaiveDateTime>,
    categories: Option<Vec<FileCategory>>,
    cluster: Option<ClusterFilter>,
}

fn lower_all(values: &[String]) -> Vec<String> {
    values.iter().map(|v| v.to_lowercase()).collect()
}

fn parse_date(raw: &str, end_of_day: bool) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(dt);
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    }
}

impl Matcher {
    fn compile(criteria: &MatchCriteria) -> Result<Self, String> {
        let glob = criteria
            .glob
            .as_deref()
            .map(Pattern::new)
            .transpose()
            .map_err(|e| format!("invalid glob: {e}"))?;
        let date_start = match criteria.date_start.as_deref() {
            Some(raw) => Some(parse_date(raw, false).ok_or(format!("invalid date_start '{raw}'"))?),
            None => None,
        };
        let date_end = match criteria.date_end.as_deref() {
            Some(raw) => Some(parse_date(raw, true).ok_or(format!("invalid date_end '{raw}'"))?),
            None => None,
        };
        let cluster = criteria.cluster.as_deref().map(|c| match c {
            "any" => ClusterFilter::Any,
            "none" => ClusterFilter::None,
            id => ClusterFilter::Id(id.to_string()),
        });

        Ok(Self {
            ext_in: criteria
                .ext_in
                .as_deref()
                .map(crate::config::normalize_extensions),
            ext_not_in: criteria
                .ext_not_in
                .as_deref()
                .map(crate::config::normalize_extensions),
            glob,
            parent_any: criteria.parent_name_contains_any.as_deref().map(lower_all),
            path_any: criteria.path_contains_any.as_deref().map(lower_all),
            min_size: criteria.min_size_bytes,
            max_size: criteria.max_size_bytes,
            date_start,
            date_end,
            categories: criteria.category_in.clone(),
            cluster,
        })
    }

    fn matches(&self, record: &FileRecord, cluster: Option<&Cluster>) -> bool {
        let ext = record.extension.as_str();
        if let Some(exts) = &self.ext_in {
            if !exts.iter().any(|e| e == ext) {
                return false;
            }
        }
        if let Some(exts) = &self.ext_not_in {
            if exts.iter().any(|e| e == ext) {
                return false;
            }
        }
        if let Some(glob) = &self.glob {
            let options = MatchOptions {
                case_sensitive: false,
                require_literal_separator: false,
                require_literal_leading_dot: false,
            };
            if !glob.matches_with(&record.relative_path, options) {
                return false;
            }
        }
        if let Some(needles) = &self.parent_any {
            let parent = record.parent_name().to_lowercase();
            if !needles.iter().any(|n| parent.contains(n.as_str())) {
                return false;
            }
        }
        if let Some(needles) = &self.path_any {
            let path = record.relative_path.to_lowercase();
            if !needles.iter().any(|n| path.contains(n.as_str())) {
                return false;
            }
        }
        if self.min_size.is_some_and(|min| record.size_bytes < min) {
            return false;
        }
        if self.max_size.is_some_and(|max| record.size_bytes > max) {
            return false;
        }
        if self.date_start.is_some() || self.date_end.is_some() {
            let when = record.effective_time().naive_utc();
            if self.date_start.is_some_and(|start| when < start) {
                return false;
            }
            if self.date_end.is_some_and(|end| when > end) {
                return false;
            }
        }
        if let Some(categories) = &self.categories {
            if !categories.contains(&record.category) {
                return false;
            }
        }
        match &self.cluster {
            None => true,
            Some(ClusterFilter::Any) => cluster.is_some(),
            Some(ClusterFilter::None) => cluster.is_none(),
            Some(ClusterFilter::Id(id)) => cluster.is_some_and(|c| &c.id == id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: String,
    pub name: String,
    matcher: Matcher,
    template: Result<Template, TemplateError>,
    event_name: Option<String>,
}

impl CompiledRule {
    fn render(
        &self,
        record: &FileRecord,
        cluster: Option<&Cluster>,
    ) -> Result<String, TemplateError> {
        match &self.template {
            Ok(template) => template.render(record, cluster, self.event_name.as_deref()),
            Err(e) => Err(e.clone()),
        }
    }
}

/// One entry of the evaluation list. The last entry is always the catch-all.
#[derive(Debug, Clone)]
pub enum RuleEntry {
    Explicit(CompiledRule),
    CatchAll(CompiledRule),
}

/// Result of evaluating a record against a [`RuleSet`].
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub rule_id: String,
    pub relative_destination: String,
    /// Set when the first matching rule had a broken template and the record
    /// fell through to the catch-all.
    pub template_error: Option<TemplateError>,
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    entries: Vec<RuleEntry>,
    rejected: Vec<(String, String)>,
    synthesized_catch_all: bool,
    fingerprint: u64,
}

impl RuleSet {
    /// Order `rules` by priority and close the list with a catch-all.
    ///
    /// The first unconditional rule becomes the catch-all; anything ordered
    /// after it is unreachable and dropped. Without one, a catch-all using
    /// `catch_all_template` is synthesized.
    pub fn new(rules: Vec<Rule>, catch_all_template: &str) -> Self {
        let fingerprint = hash_str(&serde_json::to_string(&rules).unwrap_or_default());

        let mut ordered: Vec<(usize, Rule)> = rules.into_iter().enumerate().collect();
        ordered.sort_by(|(ia, a), (ib, b)| b.priority.cmp(&a.priority).then(ia.cmp(ib)));

        let mut entries = Vec::new();
        let mut rejected = Vec::new();
        let mut catch_all: Option<CompiledRule> = None;

        for (idx, rule) in ordered {
            let id = if rule.id.trim().is_empty() {
                format!("rule-{}", idx + 1)
            } else {
                rule.id.trim().to_string()
            };
            if catch_all.is_some() {
                warn!("Rule '{}' is unreachable after the catch-all, dropping", id);
                rejected.push((id, "unreachable after catch-all".to_string()));
                continue;
            }
            let matcher = match Matcher::compile(&rule.criteria) {
                Ok(m) => m,
                Err(reason) => {
                    warn!("Rejecting rule '{}': {}", id, reason);
                    rejected.push((id, reason));
                    continue;
                }
            };
            let template = Template::parse(&rule.destination_template);
            if let Err(e) = &template {
                warn!("Rule '{}' has a malformed template: {}", id, e);
            }
            let compiled = CompiledRule {
                id: id.clone(),
                name: if rule.name.is_empty() { id } else { rule.name },
                matcher,
                template,
                event_name: rule.event_name.filter(|e| !e.trim().is_empty()),
            };
            if rule.criteria.is_unconditional() {
                if compiled.template.is_ok() {
                    catch_all = Some(compiled);
                } else {
                    rejected.push((compiled.id, "catch-all with malformed template".to_string()));
                }
            } else {
                entries.push(RuleEntry::Explicit(compiled));
            }
        }

        let synthesized_catch_all = catch_all.is_none();
        let sentinel = catch_all.unwrap_or_else(|| synthesize_catch_all(catch_all_template));
        entries.push(RuleEntry::CatchAll(sentinel));

        Self {
            entries,
            rejected,
            synthesized_catch_all,
            fingerprint,
        }
    }

    pub fn entries(&self) -> &[RuleEntry] {
        &self.entries
    }

    pub fn rejected(&self) -> &[(String, String)] {
        &self.rejected
    }

    pub fn synthesized_catch_all(&self) -> bool {
        self.synthesized_catch_all
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// First-match-wins evaluation. Always produces a destination.
    pub fn evaluate(&self, record: &FileRecord, cluster: Option<&Cluster>) -> RuleMatch {
        let mut template_error = None;
        for entry in &self.entries {
            match entry {
                RuleEntry::Explicit(rule) => {
                    if !rule.matcher.matches(record, cluster) {
                        continue;
                    }
                    match rule.render(record, cluster) {
                        Ok(relative_destination) => {
                            trace!("{} matched rule {}", record.relative_path, rule.id);
                            return RuleMatch {
                                rule_id: rule.id.clone(),
                                relative_destination,
                                template_error: None,
                            };
                        }
                        Err(e) => {
                            warn!(
                                "Template error for {} under rule '{}': {}",
                                record.relative_path, rule.id, e
                            );
                            template_error = Some(e);
                            break;
                        }
                    }
                }
                RuleEntry::CatchAll(_) => break,
            }
        }
        self.catch_all(record, cluster, template_error)
    }

    fn catch_all(
        &self,
        record: &FileRecord,
        cluster: Option<&Cluster>,
        template_error: Option<TemplateError>,
    ) -> RuleMatch {
        let (rule_id, rendered) = match self.entries.last() {
            Some(RuleEntry::CatchAll(rule)) => (rule.id.clone(), rule.render(record, cluster)),
            _ => (CATCH_ALL_ID.to_string(), Err(TemplateError::new("", "missing catch-all"))),
        };
        let relative_destination = rendered.unwrap_or_else(|e| {
            warn!("Catch-all failed for {}: {}", record.relative_path, e);
            format!("Uncategorized/{}", sanitize_segment_value(record.file_name()))
        });
        RuleMatch {
            rule_id,
            relative_destination,
            template_error,
        }
    }
}

fn synthesize_catch_all(template: &str) -> CompiledRule {
    let parsed = Template::parse(template).or_else(|e| {
        warn!("Configured catch-all template is malformed ({}), using default", e);
        Template::parse(DEFAULT_CATCH_ALL_TEMPLATE)
    });
    CompiledRule {
        id: CATCH_ALL_ID.to_string(),
        name: "Catch-all".to_string(),
        matcher: Matcher::compile(&MatchCriteria::default())
            .unwrap_or_else(|_| unreachable!("empty criteria always compile")),
        template: parsed,
        event_name: None,
    }
}

impl fmt::Display for RuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, rule) = match self {
            RuleEntry::Explicit(rule) => ("rule", rule),
            RuleEntry::CatchAll(rule) => ("catch-all", rule),
        };
        let template = match &rule.template {
            Ok(t) => t.source().to_string(),
            Err(e) => format!("<invalid: {}>", e.message),
        };
        write!(f, "[{}] {} ({}) -> {}", kind, rule.name, rule.id, template)
    }
}
