use crate::error::RuleError;
use crate::matcher::{AddressPattern, CharWindow, Matcher};
use crate::translation::{TranslationLoader, TranslationTable};
use regex::Regex;
use rustc_hash::FxHashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateMode {
    Exact,
    Contains,
    Regex,
}

#[derive(Debug, Clone)]
pub struct Translation {
    pub mode: TranslateMode,
    pub table: Arc<TranslationTable>,
    pub default_value: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Extraction {
    /// Concatenate every match; keep the raw value when nothing matches.
    Extract(Regex),
    /// Concatenate every match; contribute nothing when nothing matches.
    StrictExtract(Regex),
    /// Rewrite the listed capture groups of every match.
    ReplaceGroups {
        pattern: Regex,
        replacements: Vec<(usize, String)>,
    },
}

#[derive(Debug, Clone)]
pub enum Grouping {
    ConnectedSubfields {
        codes: Vec<char>,
        default_text: Option<String>,
        table: Option<Arc<TranslationTable>>,
        scope: Option<Vec<String>>,
    },
    ConcatenatedSubfields {
        codes: Vec<char>,
        separator: String,
        table: Option<Arc<TranslationTable>>,
        scope: Option<Vec<String>>,
    },
}

impl Grouping {
    pub fn scope(&self) -> Option<&[String]> {
        match self {
            Grouping::ConnectedSubfields { scope, .. }
            | Grouping::ConcatenatedSubfields { scope, .. } => scope.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connective {
    And,
    Or,
}

/// `subfieldExists` / `subfieldNotExists` over one field occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistencePredicate {
    pub codes: Vec<char>,
    pub connective: Connective,
    pub negated: bool,
    pub scope: Option<Vec<String>>,
}

impl ExistencePredicate {
    /// With `negated`, the connective joins the "is absent" tests.
    pub fn evaluate(&self, present: &[char]) -> bool {
        let test = |code: &char| present.contains(code) != self.negated;
        match self.connective {
            Connective::And => self.codes.iter().all(test),
            Connective::Or => self.codes.iter().any(test),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldRule {
    pub target: String,
    pub matchers: Vec<Matcher>,
    pub multi_valued: bool,
    pub allow_duplicates: bool,
    pub literal_text: Option<String>,
    pub translation: Option<Translation>,
    pub extraction: Option<Extraction>,
    pub grouping: Option<Grouping>,
    pub existence: Option<ExistencePredicate>,
    /// `getAllFields`: match every field except these tags.
    pub all_fields_except: Option<Vec<String>>,
    pub full_record: bool,
}

impl FieldRule {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            matchers: Vec::new(),
            multi_valued: false,
            allow_duplicates: false,
            literal_text: None,
            translation: None,
            extraction: None,
            grouping: None,
            existence: None,
            all_fields_except: None,
            full_record: false,
        }
    }

    /// Contributes without looking at individual fields.
    pub fn is_record_level(&self) -> bool {
        self.literal_text.is_some() || self.full_record
    }
}

/// Compiled rules plus the tag prefilter used by the mapping engine.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<FieldRule>,
    by_tag: FxHashMap<String, Vec<usize>>,
    all_fields: Vec<usize>,
    record_level: Vec<usize>,
}

impl RuleSet {
    /// Reads a rule file; translation files resolve relative to its directory.
    pub fn from_file(path: &Path) -> Result<Self, RuleError> {
        let text = fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut loader = TranslationLoader::new(base);
        let rules = compile(&text, &mut loader)?;
        info!(file = %path.display(), rules = rules.len(), "Rule set compiled");
        Ok(Self::new(rules))
    }

    pub fn new(rules: Vec<FieldRule>) -> Self {
        let mut by_tag: FxHashMap<String, Vec<usize>> = FxHashMap::default();
        let mut all_fields = Vec::new();
        let mut record_level = Vec::new();
        for (idx, rule) in rules.iter().enumerate() {
            if rule.is_record_level() {
                record_level.push(idx);
                continue;
            }
            if rule.all_fields_except.is_some() {
                all_fields.push(idx);
                continue;
            }
            for matcher in &rule.matchers {
                let entry = by_tag.entry(matcher.pattern.tag().to_string()).or_default();
                if !entry.contains(&idx) {
                    entry.push(idx);
                }
            }
        }
        Self {
            rules,
            by_tag,
            all_fields,
            record_level,
        }
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule(&self, idx: usize) -> &FieldRule {
        &self.rules[idx]
    }

    /// Rule indices whose matchers reference `tag`.
    pub fn candidates(&self, tag: &str) -> &[usize] {
        self.by_tag.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all_fields_rules(&self) -> &[usize] {
        &self.all_fields
    }

    pub fn record_level_rules(&self) -> &[usize] {
        &self.record_level
    }
}

/// One parsed directive. Bare tokens become [`Directive::Pattern`].
#[derive(Debug, Clone)]
enum Directive {
    Pattern(Matcher),
    MultiValued,
    AllowDuplicates,
    CustomText(Option<String>),
    Translate(TranslateMode, String),
    DefaultValue(String),
    RegEx(String),
    RegExStrict(String),
    RegExReplace {
        pattern: String,
        replacements: Vec<(usize, String)>,
    },
    Connected {
        codes: Vec<char>,
        default_text: Option<String>,
        scope: Option<Vec<String>>,
    },
    TranslateConnected(String),
    Concatenated {
        codes: Vec<char>,
        separator: String,
        scope: Option<Vec<String>>,
    },
    TranslateConcatenated(String),
    Exists(ExistencePredicate),
    AllFields(Vec<String>),
    FullRecord,
}

/// Compiles rule text into ordered rules. A repeated target replaces the earlier rule.
pub fn compile(text: &str, loader: &mut TranslationLoader) -> Result<Vec<FieldRule>, RuleError> {
    let mut rules: Vec<FieldRule> = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        // bracket structure is checked over the whole line, target included
        if let Err(message) = split_top_level(line, ',') {
            let head = line.split_once('=').map_or(line, |(t, _)| t).trim();
            return Err(RuleError::Syntax {
                line: line_no,
                target: head.to_string(),
                message,
            });
        }
        let Some((target, body)) = line.split_once('=') else {
            warn!(line = line_no, "Rule line without '=' ignored");
            continue;
        };
        let target = target.trim();
        if target.is_empty() {
            warn!(line = line_no, "Rule line without target field ignored");
            continue;
        }

        let syntax = |message: String| RuleError::Syntax {
            line: line_no,
            target: target.to_string(),
            message,
        };
        let tokens = split_top_level(body, ',').map_err(syntax)?;
        let mut directives = Vec::with_capacity(tokens.len());
        let mut bare = Vec::new();
        for token in tokens {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match parse_directive(token).map_err(syntax)? {
                Some(Directive::Pattern(m)) => bare.push((token.to_string(), m)),
                Some(d) => directives.push(d),
                None => warn!(line = line_no, rule = target, token, "Unknown rule option ignored"),
            }
        }

        let rule = build_rule(target, directives, bare, loader);
        debug!(rule = %rule.target, matchers = rule.matchers.len(), "Rule compiled");
        if let Some(existing) = rules.iter_mut().find(|r| r.target == rule.target) {
            warn!(line = line_no, rule = target, "Duplicate rule target, later definition wins");
            *existing = rule;
        } else {
            rules.push(rule);
        }
    }

    Ok(rules)
}

fn build_rule(
    target: &str,
    directives: Vec<Directive>,
    bare: Vec<(String, Matcher)>,
    loader: &mut TranslationLoader,
) -> FieldRule {
    let mut rule = FieldRule::new(target);
    let mut custom_text: Option<Option<String>> = None;
    let mut translate: Option<(TranslateMode, String)> = None;
    let mut default_value = None;
    let mut connected_file = None;
    let mut concatenated_file = None;

    for directive in directives {
        match directive {
            Directive::Pattern(_) => {}
            Directive::MultiValued => rule.multi_valued = true,
            Directive::AllowDuplicates => rule.allow_duplicates = true,
            Directive::CustomText(text) => custom_text = Some(text),
            Directive::Translate(mode, file) => translate = Some((mode, file)),
            Directive::DefaultValue(value) => default_value = Some(value),
            Directive::RegEx(p) => {
                if let Some(re) = compile_regex(target, &p) {
                    rule.extraction = Some(Extraction::Extract(re));
                }
            }
            Directive::RegExStrict(p) => {
                if let Some(re) = compile_regex(target, &p) {
                    rule.extraction = Some(Extraction::StrictExtract(re));
                }
            }
            Directive::RegExReplace {
                pattern,
                replacements,
            } => {
                if let Some(re) = compile_regex(target, &pattern) {
                    rule.extraction = Some(Extraction::ReplaceGroups {
                        pattern: re,
                        replacements,
                    });
                }
            }
            Directive::Connected {
                codes,
                default_text,
                scope,
            } => {
                rule.grouping = Some(Grouping::ConnectedSubfields {
                    codes,
                    default_text,
                    table: None,
                    scope,
                })
            }
            Directive::TranslateConnected(file) => connected_file = Some(file),
            Directive::Concatenated {
                codes,
                separator,
                scope,
            } => {
                rule.grouping = Some(Grouping::ConcatenatedSubfields {
                    codes,
                    separator,
                    table: None,
                    scope,
                })
            }
            Directive::TranslateConcatenated(file) => concatenated_file = Some(file),
            Directive::Exists(predicate) => rule.existence = Some(predicate),
            Directive::AllFields(except) => rule.all_fields_except = Some(except),
            Directive::FullRecord => rule.full_record = true,
        }
    }

    if let Some(text) = custom_text {
        // the remaining bare tokens are the constant, not address patterns
        let literal = text.unwrap_or_else(|| {
            bare.iter()
                .map(|(token, _)| unescape(token))
                .collect::<Vec<_>>()
                .join(", ")
        });
        rule.literal_text = Some(literal);
        return rule;
    }

    rule.matchers = bare.into_iter().map(|(_, m)| m).collect();

    if let Some((mode, file)) = translate {
        rule.translation = loader.load(&file).map(|table| Translation {
            mode,
            table,
            default_value: default_value.take(),
        });
    }
    if default_value.is_some() && rule.translation.is_none() {
        debug!(rule = target, "defaultValue without a usable translation ignored");
    }

    match (&mut rule.grouping, connected_file, concatenated_file) {
        (Some(Grouping::ConnectedSubfields { table, .. }), Some(file), _) => *table = loader.load(&file),
        (Some(Grouping::ConcatenatedSubfields { table, .. }), _, Some(file)) => *table = loader.load(&file),
        (_, None, None) => {}
        _ => warn!(rule = target, "Grouping translation without matching grouping option ignored"),
    }

    rule
}

fn compile_regex(target: &str, pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(rule = target, pattern, error = %e, "Invalid regex, extraction option dropped");
            None
        }
    }
}

/// Splits on `sep` outside brackets. Escaped characters are kept verbatim.
fn split_top_level(text: &str, sep: char) -> Result<Vec<String>, String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth -= 1;
                if depth < 0 {
                    return Err(format!("unexpected ']' in '{}'", text.trim()));
                }
                current.push(c);
            }
            c if c == sep && depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }

    if depth != 0 {
        return Err(format!("{depth} unclosed '[' in '{}'", text.trim()));
    }
    parts.push(current);
    Ok(parts)
}

/// Splits `name[arg][arg]...` into the name and raw bracket contents.
fn split_name_args(token: &str) -> Result<(String, Vec<String>), String> {
    let Some(open) = find_unescaped(token, '[') else {
        return Ok((token.to_string(), Vec::new()));
    };
    let name = token[..open].trim().to_string();
    let mut args = Vec::new();
    let mut rest = &token[open..];

    while !rest.is_empty() {
        if !rest.starts_with('[') {
            warn!(token, trailing = rest, "Text after bracketed argument ignored");
            break;
        }
        let mut depth = 0;
        let mut escaped = false;
        let mut close = None;
        for (i, c) in rest.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' => escaped = true,
                '[' => depth += 1,
                ']' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let close = close.ok_or_else(|| format!("unclosed '[' in '{token}'"))?;
        args.push(rest[1..close].to_string());
        rest = rest[close + 1..].trim_start();
    }

    Ok((name, args))
}

fn find_unescaped(s: &str, target: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == target {
            return Some(i);
        }
    }
    None
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Regex arguments keep their escapes except for the directive separator.
fn unescape_regex(s: &str) -> String {
    s.replace("\\,", ",")
}

/// `Err` only for bracket structure; unusable options come back as `None`.
fn parse_directive(token: &str) -> Result<Option<Directive>, String> {
    let (name, args) = split_name_args(token)?;
    let first = args.first().map(|a| unescape(a.trim()));
    let file = first.clone().filter(|a| !a.is_empty());
    let list = || split_arg_list(args.first().map(String::as_str).unwrap_or(""));

    let directive = match name.to_ascii_lowercase().as_str() {
        "multivalued" => Directive::MultiValued,
        "allowduplicates" => Directive::AllowDuplicates,
        "customtext" => Directive::CustomText(first),
        "getfullrecordasxml" => Directive::FullRecord,
        "getallfields" => Directive::AllFields(
            list().0.iter().map(|t| t.trim().to_string()).collect(),
        ),
        "translatevalue" => match file {
            Some(f) => Directive::Translate(TranslateMode::Exact, f),
            None => return Ok(None),
        },
        "translatevaluecontains" => match file {
            Some(f) => Directive::Translate(TranslateMode::Contains, f),
            None => return Ok(None),
        },
        "translatevalueregex" => match file {
            Some(f) => Directive::Translate(TranslateMode::Regex, f),
            None => return Ok(None),
        },
        "translateconnectedsubfields" => match file {
            Some(f) => Directive::TranslateConnected(f),
            None => return Ok(None),
        },
        "translateconcatenatedsubfields" => match file {
            Some(f) => Directive::TranslateConcatenated(f),
            None => return Ok(None),
        },
        "defaultvalue" => Directive::DefaultValue(first.unwrap_or_default()),
        "regex" => match args.first() {
            Some(p) => Directive::RegEx(unescape_regex(p)),
            None => return Ok(None),
        },
        "regexstrict" => match args.first() {
            Some(p) => Directive::RegExStrict(unescape_regex(p)),
            None => return Ok(None),
        },
        "regexreplace" => return Ok(parse_regex_replace(&args)),
        "connectedsubfields" => {
            let (parts, scope) = list();
            let (codes, rest) = split_codes(&parts);
            Directive::Connected {
                codes,
                default_text: rest.first().map(|t| t.trim().to_string()),
                scope,
            }
        }
        "concatenatedsubfields" => {
            let (mut parts, scope) = list();
            // the last entry is always the separator, even when it is one character
            let separator = match parts.len() {
                0 | 1 => " ".to_string(),
                _ => parts.pop().unwrap_or_default(),
            };
            Directive::Concatenated {
                codes: parts.iter().filter_map(|p| single_char(p)).collect(),
                separator,
                scope,
            }
        }
        "subfieldexists" | "subfieldnotexists" => {
            let negated = name.eq_ignore_ascii_case("subfieldNotExists");
            let (parts, scope) = list();
            let (codes, rest) = split_codes(&parts);
            let connective = match rest.last().map(|s| s.trim().to_ascii_uppercase()) {
                Some(s) if s == "OR" => Connective::Or,
                _ => Connective::And,
            };
            Directive::Exists(ExistencePredicate {
                codes,
                connective,
                negated,
                scope,
            })
        }
        _ => return Ok(parse_pattern(&name, &args)),
    };
    Ok(Some(directive))
}

/// `regExReplace[PATTERN][N:REPLACEMENT]...`; malformed groups are skipped.
fn parse_regex_replace(args: &[String]) -> Option<Directive> {
    let (pattern, groups) = args.split_first()?;
    let mut replacements = Vec::new();
    for group in groups {
        let group = unescape(group);
        let parsed = group
            .split_once(':')
            .and_then(|(n, r)| Some((n.trim().parse().ok()?, r.to_string())));
        match parsed {
            Some(replacement) => replacements.push(replacement),
            None => warn!(group = %group, "regExReplace group is not N:REPLACEMENT, skipped"),
        }
    }
    if replacements.is_empty() {
        warn!(pattern = %pattern, "regExReplace without N:REPLACEMENT groups, option dropped");
        return None;
    }
    Some(Directive::RegExReplace {
        pattern: unescape_regex(pattern),
        replacements,
    })
}

/// Bare address token, optionally followed by one `[from-to]` window.
fn parse_pattern(name: &str, args: &[String]) -> Option<Directive> {
    let pattern = AddressPattern::parse(&unescape(name));
    let window = match args {
        [] => None,
        [arg] if looks_like_address(name) => Some(CharWindow::parse(arg)?),
        _ => return None,
    };
    Some(Directive::Pattern(Matcher { pattern, window }))
}

fn looks_like_address(name: &str) -> bool {
    matches!(AddressPattern::parse(name), AddressPattern::Control { .. } | AddressPattern::Data { .. })
}

/// Splits a `a:b:c` argument, pulling out a nested `applyToFields[...]` scope.
/// Entries are unescaped but not trimmed, so a separator may be whitespace.
fn split_arg_list(arg: &str) -> (Vec<String>, Option<Vec<String>>) {
    let mut scope = None;
    let mut parts = Vec::new();
    let Ok(raw_parts) = split_top_level(arg, ':') else {
        return (parts, scope);
    };
    for part in raw_parts {
        if let Ok((name, inner)) = split_name_args(part.trim()) {
            if name.eq_ignore_ascii_case("applyToFields") && !inner.is_empty() {
                scope = Some(
                    inner[0]
                        .split(':')
                        .map(|t| unescape(t.trim()))
                        .filter(|t| !t.is_empty())
                        .collect(),
                );
                continue;
            }
        }
        if !part.is_empty() {
            parts.push(unescape(&part));
        }
    }
    (parts, scope)
}

/// Leading single-character entries are subfield codes; the rest is returned.
fn split_codes(parts: &[String]) -> (Vec<char>, Vec<String>) {
    let mut codes = Vec::new();
    let mut rest = Vec::new();
    for part in parts {
        match single_char(part) {
            Some(c) if rest.is_empty() => codes.push(c),
            _ => rest.push(part.clone()),
        }
    }
    (codes, rest)
}

fn single_char(s: &str) -> Option<char> {
    let mut chars = s.trim().chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn compile_str(text: &str) -> Result<Vec<FieldRule>, RuleError> {
        let dir = TempDir::new().unwrap();
        let mut loader = TranslationLoader::new(dir.path());
        compile(text, &mut loader)
    }

    fn compile_with_tables(text: &str, tables: &[(&str, &str)]) -> Vec<FieldRule> {
        let dir = TempDir::new().unwrap();
        for (name, content) in tables {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        let mut loader = TranslationLoader::new(dir.path());
        compile(text, &mut loader).unwrap()
    }

    fn patterns(rule: &FieldRule) -> Vec<String> {
        rule.matchers.iter().map(|m| m.pattern.to_string()).collect()
    }

    #[test]
    fn split_respects_brackets_and_escapes() {
        let parts = split_top_level("100$**$a, regEx[a,b], customText[x\\,y], 245", ',').unwrap();
        let parts: Vec<_> = parts.iter().map(|p| p.trim()).collect();
        assert_eq!(parts, ["100$**$a", "regEx[a,b]", "customText[x\\,y]", "245"]);
    }

    #[test]
    fn escaped_comma_outside_brackets_does_not_split() {
        let parts = split_top_level("a\\,b, c", ',').unwrap();
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn unbalanced_brackets_are_fatal() {
        for text in [
            "title = 245$**$a, regEx[abc",
            "title = 245$**$a, regEx[a]]",
            "title = 245$**$a, connectedSubfields[a:applyToFields[100:700]",
        ] {
            let err = compile_str(text).unwrap_err();
            assert!(matches!(err, RuleError::Syntax { line: 1, .. }), "{text}");
        }
    }

    #[test]
    fn unbalanced_bracket_on_later_line_aborts_whole_set() {
        let err = compile_str("id = 001\ntitle = 245$**$a\nbroken = 300$**$a, regEx[(\n").unwrap_err();
        match err {
            RuleError::Syntax { line, target, .. } => {
                assert_eq!(line, 3);
                assert_eq!(target, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unbalanced_brackets_outside_the_body_are_fatal() {
        let err = compile_str("id = 001\ntitle 245$**$a, regEx[abc\n").unwrap_err();
        assert!(matches!(err, RuleError::Syntax { line: 2, .. }));

        match compile_str("title[ = 245$**$a").unwrap_err() {
            RuleError::Syntax { line, target, .. } => {
                assert_eq!(line, 1);
                assert_eq!(target, "title[");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn options_never_end_up_as_matchers() {
        let rules = compile_str(
            "subject = 650$**$a, 651$**$a, multiValued, allowDuplicates, regEx[\\w+], \
             connectedSubfields[a:b:none], subfieldExists[a:b:OR], defaultValue[x]",
        )
        .unwrap();
        assert_eq!(patterns(&rules[0]), ["650$**$a", "651$**$a"]);
        assert!(rules[0].multi_valued);
        assert!(rules[0].allow_duplicates);
    }

    #[test]
    fn option_names_are_case_insensitive() {
        let rules = compile_str("subject = 650$**$a, multivalued").unwrap();
        assert!(rules[0].multi_valued);
        assert_eq!(rules[0].matchers.len(), 1);
    }

    #[test]
    fn unknown_bracketed_option_is_dropped() {
        let rules = compile_str("title = 245$**$a, frobnicate[1]").unwrap();
        assert_eq!(patterns(&rules[0]), ["245$**$a"]);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let rules = compile_str("# header\n\nid = 001\n! legacy\nno separator here\n").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].target, "id");
    }

    #[test]
    fn custom_text_keeps_literal_and_no_matchers() {
        let rules = compile_str("recordtype = marc, customText\nformat = customText[Book\\, printed]").unwrap();
        assert_eq!(rules[0].literal_text.as_deref(), Some("marc"));
        assert!(rules[0].matchers.is_empty());
        assert_eq!(rules[1].literal_text.as_deref(), Some("Book, printed"));
    }

    #[test]
    fn translation_is_loaded_and_shared() {
        let rules = compile_with_tables(
            "lang = 041$**$a, translateValue[lang.properties], defaultValue[Unknown]\n\
             lang2 = 041$**$b, translateValueContains[lang.properties]",
            &[("lang.properties", "ger = German\n")],
        );
        let t0 = rules[0].translation.as_ref().unwrap();
        let t1 = rules[1].translation.as_ref().unwrap();
        assert_eq!(t0.mode, TranslateMode::Exact);
        assert_eq!(t0.default_value.as_deref(), Some("Unknown"));
        assert_eq!(t1.mode, TranslateMode::Contains);
        assert!(Arc::ptr_eq(&t0.table, &t1.table));
    }

    #[test]
    fn missing_translation_file_degrades_to_pass_through() {
        let rules = compile_str("lang = 041$**$a, translateValue[nope.properties]").unwrap();
        assert!(rules[0].translation.is_none());
        assert_eq!(rules[0].matchers.len(), 1);
    }

    #[test]
    fn last_translate_mode_wins() {
        let rules = compile_with_tables(
            "lang = 041$**$a, translateValue[t.properties], translateValueRegex[t.properties]",
            &[("t.properties", "a = b\n")],
        );
        assert_eq!(rules[0].translation.as_ref().unwrap().mode, TranslateMode::Regex);
    }

    #[test]
    fn last_regex_mode_wins() {
        let rules = compile_str("year = 260$**$c, regEx[\\d+], regExStrict[\\d{4}]").unwrap();
        assert!(matches!(rules[0].extraction, Some(Extraction::StrictExtract(_))));
    }

    #[test]
    fn invalid_regex_is_dropped_not_fatal() {
        let rules = compile_str("year = 260$**$c, regEx[(?<]").unwrap();
        assert!(rules[0].extraction.is_none());
    }

    #[test]
    fn regex_replace_parses_groups() {
        let rules = compile_str("date = 260$**$c, regExReplace[(\\d{4})-(\\d{2})][2:xx][1:yyyy]").unwrap();
        match &rules[0].extraction {
            Some(Extraction::ReplaceGroups { pattern, replacements }) => {
                assert_eq!(pattern.as_str(), "(\\d{4})-(\\d{2})");
                assert_eq!(replacements, &vec![(2, "xx".to_string()), (1, "yyyy".to_string())]);
            }
            other => panic!("unexpected extraction: {other:?}"),
        }
    }

    #[test]
    fn regex_replace_without_groups_is_dropped() {
        let rules = compile_str("date = 260$**$c, regExReplace[1:xx]").unwrap();
        assert!(rules[0].extraction.is_none());
        assert_eq!(patterns(&rules[0]), ["260$**$c"]);
    }

    #[test]
    fn regex_keeps_escaped_brackets() {
        let rules = compile_str("vol = 490$**$v, regEx[\\[(\\d+)\\]]").unwrap();
        match &rules[0].extraction {
            Some(Extraction::Extract(re)) => assert_eq!(re.as_str(), "\\[(\\d+)\\]"),
            other => panic!("unexpected extraction: {other:?}"),
        }
    }

    #[test]
    fn concatenated_subfields_with_scope() {
        let rules = compile_str(
            "name = 100$**$a, 700$**$a, concatenatedSubfields[a:b:c: / :applyToFields[100]]",
        )
        .unwrap();
        match &rules[0].grouping {
            Some(Grouping::ConcatenatedSubfields { codes, separator, scope, .. }) => {
                assert_eq!(codes, &vec!['a', 'b', 'c']);
                assert_eq!(separator, " / ");
                assert_eq!(scope.as_deref(), Some(&["100".to_string()][..]));
            }
            other => panic!("unexpected grouping: {other:?}"),
        }
    }

    #[test]
    fn connected_subfields_with_default_text() {
        let rules = compile_str("gnd = 100$**$a, connectedSubfields[0:9:NoId]").unwrap();
        match &rules[0].grouping {
            Some(Grouping::ConnectedSubfields { codes, default_text, .. }) => {
                assert_eq!(codes, &vec!['0', '9']);
                assert_eq!(default_text.as_deref(), Some("NoId"));
            }
            other => panic!("unexpected grouping: {other:?}"),
        }
    }

    #[test]
    fn existence_predicates() {
        let rules = compile_str(
            "a = 100$**$a, subfieldExists[a:b:OR]\nb = 100$**$a, subfieldNotExists[9]",
        )
        .unwrap();
        let exists = rules[0].existence.as_ref().unwrap();
        assert_eq!(exists.connective, Connective::Or);
        assert!(!exists.negated);
        assert!(exists.evaluate(&['b']));
        assert!(!exists.evaluate(&['c']));

        let not_exists = rules[1].existence.as_ref().unwrap();
        assert!(not_exists.negated);
        assert!(not_exists.evaluate(&['a']));
        assert!(!not_exists.evaluate(&['a', '9']));
    }

    #[test]
    fn address_with_window() {
        let rules = compile_str("language = 008[35-37]").unwrap();
        assert_eq!(rules[0].matchers[0].window, Some(CharWindow { from: 35, to: 37 }));
    }

    #[test]
    fn get_all_fields_and_full_record() {
        let rules = compile_str("fulltext = getAllFields[001:856]\nfullrecord = getFullRecordAsXML").unwrap();
        assert_eq!(
            rules[0].all_fields_except.as_deref(),
            Some(&["001".to_string(), "856".to_string()][..])
        );
        assert!(rules[1].full_record);
        assert!(rules[1].is_record_level());
    }

    #[test]
    fn duplicate_target_replaces_earlier_rule() {
        let rules = compile_str("title = 245$**$a\ntitle = 331$**$a").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(patterns(&rules[0]), ["331$**$a"]);
    }

    #[test]
    fn prefilter_indexes_rules_by_tag() {
        let set = RuleSet::new(
            compile_str("title = 245$**$a, 246$**$a\nid = 001\nkind = x, customText").unwrap(),
        );
        assert_eq!(set.candidates("245"), [0]);
        assert_eq!(set.candidates("246"), [0]);
        assert_eq!(set.candidates("001"), [1]);
        assert!(set.candidates("100").is_empty());
        assert_eq!(set.record_level_rules(), [2]);
    }
}
