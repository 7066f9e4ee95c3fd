use crate::config::{CONNECTED_SEPARATOR, INDICATOR_SENTINEL, LEADER_TAG};
use crate::matcher::CharWindow;
use crate::models::{Address, Document, RawField, Record, TargetField};
use crate::rules::{Extraction, FieldRule, Grouping, RuleSet, TranslateMode, Translation};
use crate::translation::TranslationTable;
use quick_xml::escape::escape;
use rustc_hash::FxHashSet;
use std::fmt::Write;

/// Maps every field of `record` and returns the target fields in rule order.
pub fn map_record(record: &Record, rules: &RuleSet) -> Document {
    let mut contributions: Vec<Vec<String>> = vec![Vec::new(); rules.len()];

    for group in record.instances() {
        // concatenation emits once per field occurrence
        let mut concatenated: FxHashSet<usize> = FxHashSet::default();
        for field in group {
            let tag = field.address.tag();
            for &idx in rules.candidates(tag) {
                let rule = rules.rule(idx);
                if let Some(matcher) = rule.matchers.iter().find(|m| m.pattern.matches(&field.address)) {
                    let values = apply_rule(rule, matcher.window, field, group, &mut || concatenated.insert(idx));
                    contributions[idx].extend(values);
                }
            }
            if field.address.is_control() {
                continue;
            }
            for &idx in rules.all_fields_rules() {
                let rule = rules.rule(idx);
                let excluded = rule
                    .all_fields_except
                    .as_ref()
                    .is_some_and(|except| except.iter().any(|t| t == tag));
                if !excluded {
                    let values = apply_rule(rule, None, field, group, &mut || concatenated.insert(idx));
                    contributions[idx].extend(values);
                }
            }
        }
    }

    for &idx in rules.record_level_rules() {
        let rule = rules.rule(idx);
        if let Some(text) = &rule.literal_text {
            contributions[idx].push(text.clone());
        } else if rule.full_record {
            contributions[idx].push(record_to_marcxml(record));
        }
    }

    let fields = rules
        .rules()
        .iter()
        .zip(contributions)
        .filter(|(_, values)| !values.is_empty())
        .map(|(rule, values)| TargetField {
            name: rule.target.clone(),
            values: collect_values(rule, values),
        })
        .collect();

    Document { fields }
}

fn collect_values(rule: &FieldRule, values: Vec<String>) -> Vec<String> {
    if rule.allow_duplicates {
        return values;
    }
    if !rule.multi_valued {
        return values.into_iter().take(1).collect();
    }
    let mut seen = FxHashSet::default();
    values.into_iter().filter(|v| seen.insert(v.clone())).collect()
}

/// Runs one field through one rule. `first_in_group` reports whether this rule
/// has not yet emitted a concatenation for the current field occurrence.
fn apply_rule(
    rule: &FieldRule,
    window: Option<CharWindow>,
    field: &RawField,
    group: &[RawField],
    first_in_group: &mut dyn FnMut() -> bool,
) -> Vec<String> {
    let tag = field.address.tag();

    if let Some(predicate) = &rule.existence {
        if in_scope(predicate.scope.as_deref(), tag) {
            let present: Vec<char> = group.iter().filter_map(|f| subfield_code(&f.address)).collect();
            if !predicate.evaluate(&present) {
                return Vec::new();
            }
        }
    }

    let raw = match window {
        Some(w) => w.apply(&field.value),
        None => field.value.clone(),
    };

    let grouping = rule
        .grouping
        .as_ref()
        .filter(|g| !field.address.is_control() && in_scope(g.scope(), tag));

    let value = match grouping {
        Some(Grouping::ConcatenatedSubfields {
            codes,
            separator,
            table,
            ..
        }) => {
            if !first_in_group() {
                return Vec::new();
            }
            let parts: Vec<String> = group
                .iter()
                .filter(|f| subfield_code(&f.address).is_some_and(|c| codes.contains(&c)))
                .filter_map(|f| extract(rule.extraction.as_ref(), &f.value))
                .map(|v| translate_part(table.as_deref(), v))
                .filter(|v| !v.is_empty())
                .collect();
            if parts.is_empty() {
                return Vec::new();
            }
            parts.join(separator.as_str())
        }
        Some(Grouping::ConnectedSubfields {
            codes,
            default_text,
            table,
            ..
        }) => {
            let Some(value) = extract(rule.extraction.as_ref(), &raw) else {
                return Vec::new();
            };
            connect(&value, field, group, codes, default_text.as_deref(), table.as_deref())
        }
        None => match extract(rule.extraction.as_ref(), &raw) {
            Some(value) => value,
            None => return Vec::new(),
        },
    };

    let value = value.trim();
    if value.is_empty() {
        return Vec::new();
    }

    match &rule.translation {
        Some(translation) => translate(translation, value),
        None => vec![value.to_string()],
    }
}

fn in_scope(scope: Option<&[String]>, tag: &str) -> bool {
    scope.map_or(true, |tags| tags.iter().any(|t| t == tag))
}

fn subfield_code(address: &Address) -> Option<char> {
    match address {
        Address::Data { code, .. } => Some(*code),
        Address::Control { .. } => None,
    }
}

/// `None` drops the value.
fn extract(extraction: Option<&Extraction>, value: &str) -> Option<String> {
    match extraction {
        None => Some(value.to_string()),
        Some(Extraction::Extract(re)) => {
            let joined: String = re.find_iter(value).map(|m| m.as_str()).collect();
            Some(if joined.is_empty() { value.to_string() } else { joined })
        }
        Some(Extraction::StrictExtract(re)) => {
            let joined: String = re.find_iter(value).map(|m| m.as_str()).collect();
            (!joined.is_empty()).then_some(joined)
        }
        Some(Extraction::ReplaceGroups {
            pattern,
            replacements,
        }) => Some(replace_groups(pattern, replacements, value)),
    }
}

/// Rewrites the numbered capture groups of every match, keeping the rest of the text.
fn replace_groups(pattern: &regex::Regex, replacements: &[(usize, String)], value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last = 0;
    for caps in pattern.captures_iter(value) {
        let Some(whole) = caps.get(0) else { continue };
        let mut spans: Vec<(usize, usize, &str)> = replacements
            .iter()
            .filter_map(|(n, repl)| caps.get(*n).map(|m| (m.start(), m.end(), repl.as_str())))
            .collect();
        spans.sort_by_key(|(start, _, _)| *start);

        out.push_str(&value[last..whole.start()]);
        let mut cursor = whole.start();
        for (start, end, repl) in spans {
            // overlapping groups: the earliest one wins
            if start < cursor {
                continue;
            }
            out.push_str(&value[cursor..start]);
            out.push_str(repl);
            cursor = end;
        }
        out.push_str(&value[cursor..whole.end()]);
        last = whole.end();
    }
    out.push_str(&value[last..]);
    out
}

/// Pairs the field with the Nth occurrence of each connected code, where N is
/// the field's own occurrence index among its code within the field occurrence.
fn connect(
    value: &str,
    field: &RawField,
    group: &[RawField],
    codes: &[char],
    default_text: Option<&str>,
    table: Option<&TranslationTable>,
) -> String {
    let Some(own_code) = subfield_code(&field.address) else {
        return value.to_string();
    };
    let nth = group
        .iter()
        .take_while(|f| !std::ptr::eq(*f, field))
        .filter(|f| subfield_code(&f.address) == Some(own_code))
        .count();

    let connected: Vec<String> = codes
        .iter()
        .filter_map(|code| {
            group
                .iter()
                .filter(|f| subfield_code(&f.address) == Some(*code))
                .nth(nth)
        })
        .map(|f| translate_part(table, f.value.trim().to_string()))
        .filter(|v| !v.is_empty())
        .collect();

    let mut composite = value.trim().to_string();
    if connected.is_empty() {
        if let Some(text) = default_text {
            composite.push_str(CONNECTED_SEPARATOR);
            composite.push_str(text);
        }
    } else {
        for part in connected {
            composite.push_str(CONNECTED_SEPARATOR);
            composite.push_str(&part);
        }
    }
    composite
}

/// Grouping translations keep the raw part when the table has no entry.
fn translate_part(table: Option<&TranslationTable>, part: String) -> String {
    match table.and_then(|t| t.exact(part.trim())) {
        Some(translated) => translated.to_string(),
        None => part,
    }
}

fn translate(translation: &Translation, value: &str) -> Vec<String> {
    let table = &translation.table;
    let hits: Vec<&str> = match translation.mode {
        TranslateMode::Exact => table.exact(value).into_iter().collect(),
        TranslateMode::Contains => table.contains(value),
        TranslateMode::Regex => table.regex(value),
    };
    if hits.is_empty() {
        return translation.default_value.iter().cloned().collect();
    }
    hits.into_iter().map(str::to_string).collect()
}

/// Serialises the record back to MARCXML for `getFullRecordAsXML`.
pub fn record_to_marcxml(record: &Record) -> String {
    let mut xml = String::from("<record>");
    let indicator = |c: char| if c == INDICATOR_SENTINEL { ' ' } else { c };

    for group in record.instances() {
        let Some(first) = group.first() else { continue };
        match &first.address {
            Address::Control { tag } if tag == LEADER_TAG => {
                let _ = write!(xml, "<leader>{}</leader>", escape(&first.value));
            }
            Address::Control { tag } => {
                let _ = write!(
                    xml,
                    "<controlfield tag=\"{}\">{}</controlfield>",
                    escape(tag),
                    escape(&first.value)
                );
            }
            Address::Data { tag, ind1, ind2, .. } => {
                let _ = write!(
                    xml,
                    "<datafield tag=\"{}\" ind1=\"{}\" ind2=\"{}\">",
                    escape(tag),
                    escape(&indicator(*ind1).to_string()),
                    escape(&indicator(*ind2).to_string())
                );
                for sub in group {
                    if let Some(code) = subfield_code(&sub.address) {
                        let _ = write!(
                            xml,
                            "<subfield code=\"{}\">{}</subfield>",
                            escape(&code.to_string()),
                            escape(&sub.value)
                        );
                    }
                }
                xml.push_str("</datafield>");
            }
        }
    }

    xml.push_str("</record>");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::compile;
    use crate::translation::TranslationLoader;
    use tempfile::TempDir;

    fn rules(text: &str, tables: &[(&str, &str)]) -> RuleSet {
        let dir = TempDir::new().unwrap();
        for (name, content) in tables {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        let mut loader = TranslationLoader::new(dir.path());
        RuleSet::new(compile(text, &mut loader).unwrap())
    }

    /// Builds a record from `(tag, ind1, ind2, [(code, value)])`; control fields use code `None`.
    struct RecordBuilder {
        record: Record,
        instance: usize,
    }

    impl RecordBuilder {
        fn new() -> Self {
            Self {
                record: Record::default(),
                instance: 0,
            }
        }

        fn control(mut self, tag: &str, value: &str) -> Self {
            self.record.fields.push(RawField {
                address: Address::control(tag),
                value: value.to_string(),
                instance: self.instance,
            });
            self.instance += 1;
            self
        }

        fn data(mut self, tag: &str, ind1: char, ind2: char, subfields: &[(char, &str)]) -> Self {
            for (code, value) in subfields {
                self.record.fields.push(RawField {
                    address: Address::data(tag, Some(ind1), Some(ind2), *code),
                    value: value.to_string(),
                    instance: self.instance,
                });
            }
            self.instance += 1;
            self
        }

        fn build(self) -> Record {
            self.record
        }
    }

    #[test]
    fn single_valued_keeps_first_value() {
        let set = rules("title = 245$**$a, 246$**$a", &[]);
        let record = RecordBuilder::new()
            .data("245", '1', '0', &[('a', "X")])
            .data("246", '1', ' ', &[('a', "Y")])
            .build();
        assert_eq!(map_record(&record, &set).get("title"), ["X"]);
    }

    #[test]
    fn allow_duplicates_keeps_everything() {
        let set = rules("title = 245$**$a, 246$**$a, allowDuplicates", &[]);
        let record = RecordBuilder::new()
            .data("245", '1', '0', &[('a', "X")])
            .data("246", '1', ' ', &[('a', "Y")])
            .data("246", '1', ' ', &[('a', "Y")])
            .build();
        assert_eq!(map_record(&record, &set).get("title"), ["X", "Y", "Y"]);
    }

    #[test]
    fn multi_valued_deduplicates_in_order() {
        let set = rules("subject = 650$**$a, multiValued", &[]);
        let record = RecordBuilder::new()
            .data("650", ' ', '0', &[('a', "Cats")])
            .data("650", ' ', '0', &[('a', "Dogs")])
            .data("650", ' ', '7', &[('a', "Cats")])
            .build();
        assert_eq!(map_record(&record, &set).get("subject"), ["Cats", "Dogs"]);
    }

    #[test]
    fn empty_targets_are_omitted() {
        let set = rules("title = 245$**$a\nisbn = 020$**$a", &[]);
        let record = RecordBuilder::new().data("245", '1', '0', &[('a', "T")]).build();
        let doc = map_record(&record, &set);
        assert_eq!(doc.fields.len(), 1);
        assert!(doc.get("isbn").is_empty());
    }

    #[test]
    fn exact_translation_with_default() {
        let set = rules(
            "a = 041$**$a, translateValue[t.properties]\n\
             b = 041$**$a, translateValue[t.properties], defaultValue[Other]",
            &[("t.properties", "a = Alpha\n")],
        );
        let hit = RecordBuilder::new().data("041", ' ', ' ', &[('a', "a")]).build();
        let miss = RecordBuilder::new().data("041", ' ', ' ', &[('a', "ab")]).build();

        assert_eq!(map_record(&hit, &set).get("a"), ["Alpha"]);
        assert!(map_record(&miss, &set).get("a").is_empty());
        assert_eq!(map_record(&miss, &set).get("b"), ["Other"]);
    }

    #[test]
    fn contains_translation() {
        let set = rules(
            "a = 041$**$a, translateValueContains[t.properties]",
            &[("t.properties", "a = Alpha\n")],
        );
        let record = RecordBuilder::new().data("041", ' ', ' ', &[('a', "xaby")]).build();
        assert_eq!(map_record(&record, &set).get("a"), ["Alpha"]);
    }

    #[test]
    fn regex_translation_multi_valued() {
        let set = rules(
            "format = 300$**$a, translateValueRegex[f.properties], multiValued",
            &[("f.properties", "^\\\\d+ p = Print\nill = Illustrated\n")],
        );
        let record = RecordBuilder::new().data("300", ' ', ' ', &[('a', "120 p. : ill.")]).build();
        assert_eq!(map_record(&record, &set).get("format"), ["Print", "Illustrated"]);
    }

    #[test]
    fn windowed_control_field_translation() {
        let set = rules(
            "language = 008[35-37], translateValue[lang.properties]",
            &[("lang.properties", "ger = German\n")],
        );
        let fixed = format!("{}ger d", "x".repeat(35));
        let record = RecordBuilder::new().control("008", &fixed).build();
        assert_eq!(map_record(&record, &set).get("language"), ["German"]);
    }

    #[test]
    fn extract_keeps_raw_value_without_match() {
        let set = rules("year = 260$**$c, regEx[\\d{4}]", &[]);
        let dated = RecordBuilder::new().data("260", ' ', ' ', &[('c', "c1999, 2001")]).build();
        let undated = RecordBuilder::new().data("260", ' ', ' ', &[('c', "s.a.")]).build();
        assert_eq!(map_record(&dated, &set).get("year"), ["19992001"]);
        assert_eq!(map_record(&undated, &set).get("year"), ["s.a."]);
    }

    #[test]
    fn strict_extract_drops_value_without_match() {
        let set = rules("year = 260$**$c, regExStrict[\\d{4}]", &[]);
        let undated = RecordBuilder::new().data("260", ' ', ' ', &[('c', "s.a.")]).build();
        assert!(map_record(&undated, &set).get("year").is_empty());
    }

    #[test]
    fn replace_groups_rewrites_captures() {
        let set = rules("date = 260$**$c, regExReplace[(\\d{4})-(\\d{2})][2:xx]", &[]);
        let record = RecordBuilder::new().data("260", ' ', ' ', &[('c', "from 2020-05 on")]).build();
        assert_eq!(map_record(&record, &set).get("date"), ["from 2020-xx on"]);
    }

    #[test]
    fn concatenated_subfields_emit_once_per_occurrence() {
        let set = rules("name = 100$**$*, concatenatedSubfields[a:d:, ], multiValued, allowDuplicates", &[]);
        let record = RecordBuilder::new()
            .data("100", '1', ' ', &[('a', "Doe, Jane"), ('e', "author"), ('d', "1900-1980")])
            .build();
        assert_eq!(map_record(&record, &set).get("name"), ["Doe, Jane, 1900-1980"]);
    }

    #[test]
    fn concatenated_scope_limits_to_named_tags() {
        let set = rules(
            "name = 100$**$a, 700$**$a, concatenatedSubfields[a:d: :applyToFields[100]], multiValued",
            &[],
        );
        let record = RecordBuilder::new()
            .data("100", '1', ' ', &[('a', "Doe"), ('d', "1900")])
            .data("700", '1', ' ', &[('a', "Roe"), ('d', "1950")])
            .build();
        assert_eq!(map_record(&record, &set).get("name"), ["Doe 1900", "Roe"]);
    }

    #[test]
    fn concatenated_translation_translates_parts() {
        let set = rules(
            "role = 700$**$a, concatenatedSubfields[a:4: - ], translateConcatenatedSubfields[r.properties]",
            &[("r.properties", "edt = Editor\n")],
        );
        let record = RecordBuilder::new()
            .data("700", '1', ' ', &[('a', "Roe"), ('4', "edt")])
            .build();
        assert_eq!(map_record(&record, &set).get("role"), ["Roe - Editor"]);
    }

    #[test]
    fn connected_subfields_pair_nth_occurrence() {
        let set = rules("gnd = 689$**$a, connectedSubfields[0:NoId], multiValued", &[]);
        let record = RecordBuilder::new()
            .data("689", '0', '0', &[('a', "Alpha"), ('0', "id-1"), ('a', "Beta"), ('a', "Gamma"), ('0', "id-2")])
            .build();
        assert_eq!(
            map_record(&record, &set).get("gnd"),
            ["Alpha, id-1", "Beta, id-2", "Gamma, NoId"]
        );
    }

    #[test]
    fn connected_subfields_translate_connected_part() {
        let set = rules(
            "lang = 041$**$a, connectedSubfields[b], translateConnectedSubfields[l.properties]",
            &[("l.properties", "eng = English\n")],
        );
        let record = RecordBuilder::new().data("041", ' ', ' ', &[('a', "ger"), ('b', "eng")]).build();
        assert_eq!(map_record(&record, &set).get("lang"), ["ger, English"]);
    }

    #[test]
    fn existence_gate_applies_to_field_occurrence() {
        let set = rules(
            "withId = 700$**$a, subfieldExists[0], multiValued\n\
             withoutId = 700$**$a, subfieldNotExists[0], multiValued",
            &[],
        );
        let record = RecordBuilder::new()
            .data("700", '1', ' ', &[('a', "Linked"), ('0', "(DE-588)1")])
            .data("700", '1', ' ', &[('a', "Plain")])
            .build();
        let doc = map_record(&record, &set);
        assert_eq!(doc.get("withId"), ["Linked"]);
        assert_eq!(doc.get("withoutId"), ["Plain"]);
    }

    #[test]
    fn custom_text_always_contributes() {
        let set = rules("recordtype = marc, customText", &[]);
        let doc = map_record(&Record::default(), &set);
        assert_eq!(doc.get("recordtype"), ["marc"]);
    }

    #[test]
    fn get_all_fields_skips_exceptions_and_control_fields() {
        let set = rules("fulltext = getAllFields[856], multiValued", &[]);
        let record = RecordBuilder::new()
            .control("001", "123")
            .data("245", '1', '0', &[('a', "Title")])
            .data("856", '4', '0', &[('u', "http://example.org")])
            .data("500", ' ', ' ', &[('a', "Note")])
            .build();
        assert_eq!(map_record(&record, &set).get("fulltext"), ["Title", "Note"]);
    }

    #[test]
    fn full_record_xml_is_escaped() {
        let set = rules("fullrecord = getFullRecordAsXML", &[]);
        let record = RecordBuilder::new()
            .control("LDR", "00000nam")
            .control("001", "1")
            .data("245", '1', ' ', &[('a', "Fish & <Chips>")])
            .build();
        let xml = map_record(&record, &set).get("fullrecord")[0].clone();
        assert_eq!(
            xml,
            "<record><leader>00000nam</leader><controlfield tag=\"001\">1</controlfield>\
             <datafield tag=\"245\" ind1=\"1\" ind2=\" \"><subfield code=\"a\">Fish &amp; &lt;Chips&gt;</subfield>\
             </datafield></record>"
        );
    }

    #[test]
    fn values_are_trimmed_and_blank_values_dropped() {
        let set = rules("title = 245$**$a, multiValued", &[]);
        let record = RecordBuilder::new()
            .data("245", '1', '0', &[('a', "  Padded  ")])
            .data("245", '1', '0', &[('a', "   ")])
            .build();
        assert_eq!(map_record(&record, &set).get("title"), ["Padded"]);
    }

    #[test]
    fn output_follows_rule_order() {
        let set = rules("b = 100$**$a\na = 245$**$a", &[]);
        let record = RecordBuilder::new()
            .data("245", '1', '0', &[('a', "T")])
            .data("100", '1', ' ', &[('a', "N")])
            .build();
        let names: Vec<_> = map_record(&record, &set).fields.into_iter().map(|f| f.name).collect();
        assert_eq!(names, ["b", "a"]);
    }
}
