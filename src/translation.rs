use once_cell::sync::OnceCell;
use regex::Regex;
use rustc_hash::FxHashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct TranslationTable {
    entries: Vec<(String, String)>,
    exact: FxHashMap<String, usize>,
    patterns: OnceCell<Vec<(Regex, usize)>>,
}

impl TranslationTable {
    /// One `key = value` per line; `#`/`!` comments and `\=`, `\:`, `\uXXXX` escapes.
    pub fn parse(text: &str) -> Self {
        let mut table = TranslationTable::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some(split) = find_unescaped(line, '=') else {
                debug!(line, "Translation line without '=' ignored");
                continue;
            };
            let key = unescape(line[..split].trim());
            let value = unescape(line[split + 1..].trim());
            table.insert(key, value);
        }
        table
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        let mut table = TranslationTable::default();
        for (k, v) in pairs {
            table.insert(k.into(), v.into());
        }
        table
    }

    fn insert(&mut self, key: String, value: String) {
        // later duplicates win for exact lookups, like a properties file
        self.exact.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn exact(&self, value: &str) -> Option<&str> {
        self.exact
            .get(value)
            .map(|&i| self.entries[i].1.as_str())
    }

    /// Translations of every key contained in `value`, in file order.
    pub fn contains(&self, value: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| !k.is_empty() && value.contains(k.as_str()))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Translations of every key that, read as a regex, matches `value`.
    pub fn regex(&self, value: &str) -> Vec<&str> {
        let patterns = self.patterns.get_or_init(|| {
            self.entries
                .iter()
                .enumerate()
                .filter_map(|(i, (k, _))| match Regex::new(k) {
                    Ok(re) => Some((re, i)),
                    Err(e) => {
                        warn!(key = %k, error = %e, "Invalid regex key in translation table");
                        None
                    }
                })
                .collect()
        });
        patterns
            .iter()
            .filter(|(re, _)| re.is_match(value))
            .map(|(_, i)| self.entries[*i].1.as_str())
            .collect()
    }
}

/// Resolves table file names relative to the rule file and caches each table,
/// so rules naming the same file share one copy.
pub struct TranslationLoader {
    base_dir: PathBuf,
    cache: FxHashMap<String, Option<Arc<TranslationTable>>>,
}

impl TranslationLoader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            cache: FxHashMap::default(),
        }
    }

    /// Returns `None` when the file cannot be read; the caller degrades the rule.
    pub fn load(&mut self, name: &str) -> Option<Arc<TranslationTable>> {
        if let Some(cached) = self.cache.get(name) {
            return cached.clone();
        }
        let path = self.resolve(name);
        let table = match fs::read_to_string(&path) {
            Ok(text) => {
                let table = TranslationTable::parse(&text);
                debug!(file = %path.display(), entries = table.len(), "Translation table loaded");
                Some(Arc::new(table))
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Translation file missing, rule falls back to raw values");
                None
            }
        };
        self.cache.insert(name.to_string(), table.clone());
        table
    }

    fn resolve(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
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
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&hex);
                    }
                }
            }
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
