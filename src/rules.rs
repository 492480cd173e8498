#![forbid(unsafe_code)]

//! Declarative per-channel title rewriting and blocking.
//!
//! Rules are declared in `channels.toml`, compiled once per channel into a
//! [`RuleSet`], and applied to the working video map before the queue is
//! computed. Renames run in declaration order and each one sees the output of
//! the previous one. Filters are independent predicates; a video is blocked
//! when any of them matches, so their order never changes the outcome.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::model::VideoRecord;

pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenameRule {
    /// Literal substring replacement.
    Replace { from: String, to: String },
    /// Regex replacement; `replacement` may use `$1` / `$name` references.
    RegexReplace { pattern: String, replacement: String },
    Prepend { value: String },
    Append { value: String },
    /// Rebuilds the whole title from the named groups of `pattern`.
    ///
    /// `template` accepts `{group}` for a named capture, `{index}` for the
    /// 1-based position in the chronological listing and `{date}` for the
    /// upload date. `{{` and `}}` produce literal braces.
    Reformat {
        pattern: String,
        template: String,
        #[serde(default)]
        strict: bool,
        #[serde(default)]
        date_format: Option<String>,
        #[serde(default)]
        index_width: usize,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMatch {
    #[default]
    Contains,
    StartsWith,
    EndsWith,
    Equals,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateOp {
    Before,
    After,
    On,
    Between,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterRule {
    Title {
        #[serde(rename = "match", default)]
        mode: TextMatch,
        value: String,
        #[serde(default)]
        case_sensitive: bool,
        #[serde(default)]
        negate: bool,
    },
    Date {
        op: DateOp,
        date: NaiveDate,
        #[serde(default)]
        until: Option<NaiveDate>,
        #[serde(default)]
        negate: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplatePart {
    Literal(String),
    Capture(String),
    Index,
    Date,
}

#[derive(Debug, Clone)]
struct Reformat {
    regex: Regex,
    parts: Vec<TemplatePart>,
    strict: bool,
    date_format: String,
    index_width: usize,
}

impl Reformat {
    fn apply(
        &self,
        title: &str,
        index: usize,
        published_at: DateTime<Utc>,
    ) -> SyncResult<Option<String>> {
        let Some(captures) = self.regex.captures(title) else {
            if self.strict {
                return Err(SyncError::StrictPatternMismatch {
                    title: title.to_owned(),
                    pattern: self.regex.as_str().to_owned(),
                });
            }
            return Ok(None);
        };

        let mut out = String::with_capacity(title.len());
        for part in &self.parts {
            match part {
                TemplatePart::Literal(text) => out.push_str(text),
                TemplatePart::Capture(name) => {
                    if let Some(value) = captures.name(name) {
                        out.push_str(value.as_str());
                    }
                }
                TemplatePart::Index => {
                    out.push_str(&format!("{:0width$}", index, width = self.index_width))
                }
                TemplatePart::Date => {
                    out.push_str(&published_at.format(&self.date_format).to_string())
                }
            }
        }
        Ok(Some(out))
    }
}

#[derive(Debug, Clone)]
enum CompiledRename {
    Replace { from: String, to: String },
    RegexReplace { regex: Regex, replacement: String },
    Prepend(String),
    Append(String),
    Reformat(Reformat),
}

#[derive(Debug, Clone)]
enum TitleMatcher {
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    Equals(String),
    Regex(Regex),
}

#[derive(Debug, Clone)]
enum CompiledFilter {
    Title {
        matcher: TitleMatcher,
        case_sensitive: bool,
        negate: bool,
    },
    Date {
        op: DateOp,
        date: NaiveDate,
        until: Option<NaiveDate>,
        negate: bool,
    },
}

impl CompiledFilter {
    fn matches(&self, video: &VideoRecord) -> bool {
        match self {
            CompiledFilter::Title {
                matcher,
                case_sensitive,
                negate,
            } => {
                let title = if *case_sensitive {
                    video.title().to_owned()
                } else {
                    video.title().to_lowercase()
                };
                let hit = match matcher {
                    TitleMatcher::Contains(needle) => title.contains(needle.as_str()),
                    TitleMatcher::StartsWith(needle) => title.starts_with(needle.as_str()),
                    TitleMatcher::EndsWith(needle) => title.ends_with(needle.as_str()),
                    TitleMatcher::Equals(needle) => title == *needle,
                    TitleMatcher::Regex(regex) => regex.is_match(video.title()),
                };
                hit != *negate
            }
            CompiledFilter::Date {
                op,
                date,
                until,
                negate,
            } => {
                let day = video.published_at.date_naive();
                let hit = match op {
                    DateOp::Before => day < *date,
                    DateOp::After => day > *date,
                    DateOp::On => day == *date,
                    DateOp::Between => until.is_some_and(|end| day >= *date && day <= end),
                };
                hit != *negate
            }
        }
    }
}

/// Compiled rename and filter rules of one channel.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    renames: Vec<CompiledRename>,
    filters: Vec<CompiledFilter>,
}

impl RuleSet {
    pub fn compile(
        channel: &str,
        renames: &[RenameRule],
        filters: &[FilterRule],
    ) -> SyncResult<Self> {
        let invalid = |reason: String| SyncError::InvalidRule {
            channel: channel.to_owned(),
            reason,
        };

        let renames = renames
            .iter()
            .map(|rule| compile_rename(rule).map_err(&invalid))
            .collect::<SyncResult<Vec<_>>>()?;
        let filters = filters
            .iter()
            .map(|rule| compile_filter(rule).map_err(&invalid))
            .collect::<SyncResult<Vec<_>>>()?;

        Ok(Self { renames, filters })
    }

    pub fn is_empty(&self) -> bool {
        self.renames.is_empty() && self.filters.is_empty()
    }

    /// Runs every rename rule over one title. `index` is the 1-based position
    /// of the video in the chronological listing.
    pub fn rename_title(
        &self,
        title: &str,
        index: usize,
        published_at: DateTime<Utc>,
    ) -> SyncResult<String> {
        let mut current = title.to_owned();
        for rule in &self.renames {
            current = match rule {
                CompiledRename::Replace { from, to } => current.replace(from.as_str(), to),
                CompiledRename::RegexReplace { regex, replacement } => regex
                    .replace_all(&current, replacement.as_str())
                    .into_owned(),
                CompiledRename::Prepend(value) => format!("{value}{current}"),
                CompiledRename::Append(value) => format!("{current}{value}"),
                CompiledRename::Reformat(reformat) => reformat
                    .apply(&current, index, published_at)?
                    .unwrap_or(current),
            };
        }
        Ok(current)
    }

    /// Renames every video of a chronologically ordered map in place, then
    /// makes the titles filesystem-safe.
    pub fn rename_all(&self, videos: &mut [VideoRecord]) -> SyncResult<()> {
        for (position, video) in videos.iter_mut().enumerate() {
            if !self.renames.is_empty() {
                let renamed = self.rename_title(video.title(), position + 1, video.published_at)?;
                if renamed != video.title() {
                    video.set_title(renamed);
                }
            }
            video.sanitize();
        }
        Ok(())
    }

    /// True when any filter matches the video.
    pub fn blocks(&self, video: &VideoRecord) -> bool {
        self.filters.iter().any(|filter| filter.matches(video))
    }

    pub fn blocked_ids<'a>(&self, videos: &'a [VideoRecord]) -> Vec<&'a str> {
        videos
            .iter()
            .filter(|video| self.blocks(video))
            .map(|video| video.id.as_str())
            .collect()
    }
}

fn compile_rename(rule: &RenameRule) -> Result<CompiledRename, String> {
    Ok(match rule {
        RenameRule::Replace { from, to } => {
            if from.is_empty() {
                return Err("replace rule needs a non-empty `from`".into());
            }
            CompiledRename::Replace {
                from: from.clone(),
                to: to.clone(),
            }
        }
        RenameRule::RegexReplace {
            pattern,
            replacement,
        } => CompiledRename::RegexReplace {
            regex: build_regex(pattern, true)?,
            replacement: replacement.clone(),
        },
        RenameRule::Prepend { value } => CompiledRename::Prepend(value.clone()),
        RenameRule::Append { value } => CompiledRename::Append(value.clone()),
        RenameRule::Reformat {
            pattern,
            template,
            strict,
            date_format,
            index_width,
        } => {
            let regex = build_regex(pattern, true)?;
            let parts = parse_template(template)?;
            for part in &parts {
                if let TemplatePart::Capture(name) = part
                    && !regex.capture_names().flatten().any(|group| group == name)
                {
                    return Err(format!(
                        "template token {{{name}}} is not a named group of {pattern:?}"
                    ));
                }
            }
            let date_format = date_format
                .clone()
                .unwrap_or_else(|| DEFAULT_DATE_FORMAT.to_string());
            if StrftimeItems::new(&date_format).any(|item| matches!(item, Item::Error)) {
                return Err(format!("invalid date format {date_format:?}"));
            }
            CompiledRename::Reformat(Reformat {
                regex,
                parts,
                strict: *strict,
                date_format,
                index_width: *index_width,
            })
        }
    })
}

fn compile_filter(rule: &FilterRule) -> Result<CompiledFilter, String> {
    Ok(match rule {
        FilterRule::Title {
            mode,
            value,
            case_sensitive,
            negate,
        } => {
            let needle = if *case_sensitive {
                value.clone()
            } else {
                value.to_lowercase()
            };
            let matcher = match mode {
                TextMatch::Contains => TitleMatcher::Contains(needle),
                TextMatch::StartsWith => TitleMatcher::StartsWith(needle),
                TextMatch::EndsWith => TitleMatcher::EndsWith(needle),
                TextMatch::Equals => TitleMatcher::Equals(needle),
                TextMatch::Regex => TitleMatcher::Regex(build_regex(value, *case_sensitive)?),
            };
            CompiledFilter::Title {
                matcher,
                case_sensitive: *case_sensitive,
                negate: *negate,
            }
        }
        FilterRule::Date {
            op,
            date,
            until,
            negate,
        } => {
            if *op == DateOp::Between {
                match until {
                    None => return Err("`between` date filter needs `until`".into()),
                    Some(end) if end < date => {
                        return Err(format!("date range {date}..{end} is empty"));
                    }
                    Some(_) => {}
                }
            }
            CompiledFilter::Date {
                op: *op,
                date: *date,
                until: *until,
                negate: *negate,
            }
        }
    })
}

fn build_regex(pattern: &str, case_sensitive: bool) -> Result<Regex, String> {
    RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|err| format!("invalid pattern {pattern:?}: {err}"))
}

fn parse_template(template: &str) -> Result<Vec<TemplatePart>, String> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut token = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(next) => token.push(next),
                        None => return Err(format!("unclosed `{{` in template {template:?}")),
                    }
                }
                if !literal.is_empty() {
                    parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                }
                parts.push(match token.trim() {
                    "index" => TemplatePart::Index,
                    "date" => TemplatePart::Date,
                    "" => return Err(format!("empty token in template {template:?}")),
                    name => TemplatePart::Capture(name.to_owned()),
                });
            }
            '}' => return Err(format!("unmatched `}}` in template {template:?}")),
            other => literal.push(other),
        }
    }

    if !literal.is_empty() {
        parts.push(TemplatePart::Literal(literal));
    }
    Ok(parts)
}
