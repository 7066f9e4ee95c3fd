use crate::config::LEADER_TAG;
use crate::error::ParseError;
use crate::models::{Address, RawField, Record};
use bzip2::read::BzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};

/// Where accumulated text goes when the current element closes.
#[derive(Debug)]
enum Capture {
    Leader,
    Control(String),
    Subfield(char),
    /// Inside a skipped element; text is discarded.
    Skip,
}

#[derive(Debug)]
struct OpenDatafield {
    tag: String,
    ind1: Option<char>,
    ind2: Option<char>,
}

#[derive(Debug)]
enum State {
    Idle,
    InRecord,
    InControlfield,
    InDatafield(OpenDatafield),
    InSubfield(OpenDatafield),
}

/// Builder for the record currently being read.
#[derive(Debug, Default)]
struct PartialRecord {
    fields: Vec<RawField>,
    instance: usize,
}

/// Streams [`Record`]s out of MARCXML. Elements match by local name and the
/// leader is kept as control field `LDR`. Malformed elements are skipped and
/// counted; XML errors end the input.
pub struct MarcXmlReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    load_timestamp: String,
    state: State,
    record: Option<PartialRecord>,
    capture: Option<Capture>,
    text: String,
    malformed: u64,
    done: bool,
}

impl MarcXmlReader<Box<dyn BufRead>> {
    /// Opens a plain or `.bz2` compressed file.
    pub fn open(path: impl AsRef<Path>, load_timestamp: &str) -> Result<Self, ParseError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let is_bz2 = path.extension().is_some_and(|e| e == "bz2");

        let inner: Box<dyn BufRead> = if is_bz2 {
            Box::new(BufReader::with_capacity(1024 * 1024, BzDecoder::new(file)))
        } else {
            Box::new(BufReader::with_capacity(1024 * 1024, file))
        };
        debug!(file = %path.display(), compressed = is_bz2, "Opened record source");
        Ok(Self::new(inner, load_timestamp))
    }
}

impl<'a> MarcXmlReader<&'a [u8]> {
    pub fn from_xml(xml: &'a str, load_timestamp: &str) -> Self {
        Self::new(xml.as_bytes(), load_timestamp)
    }
}

impl<R: BufRead> MarcXmlReader<R> {
    pub fn new(inner: R, load_timestamp: &str) -> Self {
        Self {
            reader: Reader::from_reader(inner),
            buf: Vec::with_capacity(8192),
            load_timestamp: load_timestamp.to_string(),
            state: State::Idle,
            record: None,
            capture: None,
            text: String::new(),
            malformed: 0,
            done: false,
        }
    }

    /// Elements skipped so far because they did not fit the record structure.
    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    fn read_record(&mut self, buf: &mut Vec<u8>) -> Result<Option<Record>, ParseError> {
        loop {
            buf.clear();
            let event = self.reader.read_event_into(buf).map_err(|source| ParseError::Xml {
                position: self.reader.buffer_position(),
                source,
            })?;

            match event {
                Event::Start(ref e) => self.open_element(e),
                Event::Empty(ref e) => {
                    self.open_element(e);
                    let name = e.local_name();
                    if let Some(record) = self.close_element(name.as_ref()) {
                        return Ok(Some(record));
                    }
                }
                Event::Text(ref e) => {
                    if self.capture.is_some() {
                        match e.unescape() {
                            Ok(text) => self.text.push_str(&text),
                            Err(err) => warn!(error = %err, "Undecodable text skipped"),
                        }
                    }
                }
                Event::CData(ref e) => {
                    if self.capture.is_some() {
                        self.text.push_str(&String::from_utf8_lossy(e));
                    }
                }
                Event::End(ref e) => {
                    let name = e.local_name();
                    if let Some(record) = self.close_element(name.as_ref()) {
                        return Ok(Some(record));
                    }
                }
                Event::Eof => {
                    if self.record.is_some() {
                        self.malformed += 1;
                        warn!("Input ended inside a record, partial record dropped");
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    fn open_element(&mut self, e: &BytesStart) {
        let name = e.local_name();
        let in_record = matches!(self.state, State::InRecord);
        match name.as_ref() {
            b"record" => {
                if self.record.is_some() {
                    self.malformed += 1;
                    warn!("Nested record element, restarting record");
                }
                self.record = Some(PartialRecord::default());
                self.state = State::InRecord;
            }
            b"leader" if in_record => self.begin_capture(Capture::Leader, State::InControlfield),
            b"controlfield" if in_record => match attribute(e, b"tag") {
                Some(tag) => self.begin_capture(Capture::Control(tag), State::InControlfield),
                None => {
                    self.malformed += 1;
                    warn!("controlfield without tag skipped");
                    self.begin_capture(Capture::Skip, State::InControlfield);
                }
            },
            b"datafield" if in_record => {
                let tag = attribute(e, b"tag").unwrap_or_default();
                if tag.is_empty() {
                    self.malformed += 1;
                    warn!("datafield without tag, its subfields are skipped");
                }
                self.state = State::InDatafield(OpenDatafield {
                    tag,
                    ind1: attribute(e, b"ind1").and_then(|v| v.chars().next()),
                    ind2: attribute(e, b"ind2").and_then(|v| v.chars().next()),
                });
            }
            b"subfield" if !matches!(self.state, State::InDatafield(_)) => {
                if self.record.is_some() {
                    self.malformed += 1;
                    warn!("subfield outside a datafield skipped");
                    self.capture = Some(Capture::Skip);
                    self.text.clear();
                }
            }
            b"subfield" => {
                let State::InDatafield(field) = std::mem::replace(&mut self.state, State::InRecord) else {
                    return;
                };
                let code = attribute(e, b"code").and_then(|v| v.trim().chars().next());
                let capture = match code {
                    Some(code) if !field.tag.is_empty() => Capture::Subfield(code),
                    Some(_) => Capture::Skip,
                    None => {
                        self.malformed += 1;
                        warn!(tag = %field.tag, "subfield without code skipped");
                        Capture::Skip
                    }
                };
                self.begin_capture(capture, State::InSubfield(field));
            }
            _ => {}
        }
    }

    fn begin_capture(&mut self, capture: Capture, state: State) {
        self.capture = Some(capture);
        self.text.clear();
        self.state = state;
    }

    fn close_element(&mut self, name: &[u8]) -> Option<Record> {
        match name {
            b"leader" | b"controlfield" => {
                if matches!(self.state, State::InControlfield) {
                    self.state = State::InRecord;
                }
                match self.capture.take() {
                    Some(Capture::Leader) => self.push_control(LEADER_TAG.to_string()),
                    Some(Capture::Control(tag)) => self.push_control(tag),
                    _ => {}
                }
            }
            b"subfield" => {
                let capture = self.capture.take();
                if let State::InSubfield(_) = self.state {
                    let State::InSubfield(field) = std::mem::replace(&mut self.state, State::InRecord) else {
                        return None;
                    };
                    if let Some(Capture::Subfield(code)) = capture {
                        let value = self.text.trim().to_string();
                        if let Some(record) = self.record.as_mut() {
                            record.fields.push(RawField {
                                address: Address::data(field.tag.clone(), field.ind1, field.ind2, code),
                                value,
                                instance: record.instance,
                            });
                        }
                    }
                    self.state = State::InDatafield(field);
                }
            }
            b"datafield" => {
                if let State::InDatafield(_) = self.state {
                    self.state = State::InRecord;
                    if let Some(record) = self.record.as_mut() {
                        record.instance += 1;
                    }
                }
            }
            b"record" => {
                self.state = State::Idle;
                self.capture = None;
                let partial = self.record.take()?;
                return Some(self.finish(partial));
            }
            _ => {}
        }
        None
    }

    /// Control values keep inner and edge spaces since positions are meaningful.
    fn push_control(&mut self, tag: String) {
        let value = self.text.trim_matches(|c| c == '\n' || c == '\r' || c == '\t').to_string();
        if let Some(record) = self.record.as_mut() {
            record.fields.push(RawField {
                address: Address::control(tag),
                value,
                instance: record.instance,
            });
            record.instance += 1;
        }
    }

    fn finish(&self, partial: PartialRecord) -> Record {
        let mut record = Record {
            id: None,
            fields: partial.fields,
            load_timestamp: self.load_timestamp.clone(),
        };
        record.id = record.fallback_id();
        record
    }
}

impl<R: BufRead> Iterator for MarcXmlReader<R> {
    type Item = Result<Record, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = std::mem::take(&mut self.buf);
        let result = self.read_record(&mut buf);
        self.buf = buf;
        match result {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn attribute(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<collection xmlns="http://www.loc.gov/MARC21/slim">
  <record>
    <leader>00000nam a2200000 c 4500</leader>
    <controlfield tag="001">AC000001</controlfield>
    <controlfield tag="008">850101s1985    gw            000 0 ger d</controlfield>
    <datafield tag="245" ind1="1" ind2="0">
      <subfield code="a">Main title &amp; more</subfield>
      <subfield code="b">subtitle</subfield>
    </datafield>
    <datafield tag="700" ind1="1" ind2=" ">
      <subfield code="a">Doe, Jane</subfield>
    </datafield>
  </record>
  <record>
    <controlfield tag="SYS">000000002</controlfield>
  </record>
</collection>"#;

    fn parse_all(xml: &str) -> Vec<Record> {
        MarcXmlReader::from_xml(xml, "1700000000000")
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn reads_records_in_order() {
        let records = parse_all(SAMPLE);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id.as_deref(), Some("AC000001"));
        assert_eq!(records[1].id.as_deref(), Some("000000002"));
        assert_eq!(records[0].load_timestamp, "1700000000000");
    }

    #[test]
    fn subfields_carry_address_and_occurrence() {
        let records = parse_all(SAMPLE);
        let fields = &records[0].fields;
        let title = fields.iter().find(|f| f.address.to_string() == "245$10$a").unwrap();
        assert_eq!(title.value, "Main title & more");
        let sub = fields.iter().find(|f| f.address.to_string() == "245$10$b").unwrap();
        assert_eq!(title.instance, sub.instance);

        let person = fields.iter().find(|f| f.address.tag() == "700").unwrap();
        assert_eq!(person.address.to_string(), "700$1-$a");
        assert_ne!(person.instance, title.instance);
    }

    #[test]
    fn leader_and_fixed_fields_keep_positions() {
        let records = parse_all(SAMPLE);
        assert_eq!(records[0].control_value("LDR"), Some("00000nam a2200000 c 4500"));
        let fixed = records[0].control_value("008").unwrap();
        assert_eq!(&fixed[35..38], "ger");
    }

    #[test]
    fn namespaced_elements_match_by_local_name() {
        let xml = r#"<marc:collection xmlns:marc="http://www.loc.gov/MARC21/slim">
            <marc:record>
              <marc:controlfield tag="001">X1</marc:controlfield>
              <marc:datafield tag="020" ind1=" " ind2=" "><marc:subfield code="a">123</marc:subfield></marc:datafield>
            </marc:record>
          </marc:collection>"#;
        let records = parse_all(xml);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id.as_deref(), Some("X1"));
        assert_eq!(records[0].fields[1].address.to_string(), "020$--$a");
    }

    #[test]
    fn malformed_elements_are_skipped() {
        let xml = r#"<collection><record>
            <controlfield tag="001">M1</controlfield>
            <subfield code="a">stray</subfield>
            <controlfield>no tag</controlfield>
            <datafield tag="100" ind1="1"><subfield>no code</subfield><subfield code="a">Kept</subfield></datafield>
          </record></collection>"#;
        let mut reader = MarcXmlReader::from_xml(xml, "t");
        let record = reader.next().unwrap().unwrap();
        let values: Vec<_> = record.fields.iter().map(|f| f.value.as_str()).collect();
        assert_eq!(values, ["M1", "Kept"]);
        assert_eq!(reader.malformed_count(), 3);
        assert!(reader.next().is_none());
    }

    #[test]
    fn empty_subfield_element_yields_empty_value() {
        let xml = r#"<record><datafield tag="500" ind1=" " ind2=" "><subfield code="a"/></datafield></record>"#;
        let records = parse_all(xml);
        assert_eq!(records[0].fields.len(), 1);
        assert_eq!(records[0].fields[0].value, "");
    }

    #[test]
    fn truncated_input_drops_partial_record() {
        let xml = r#"<collection><record><controlfield tag="001">A</controlfield></record><record><controlfield tag="001">B"#;
        let mut reader = MarcXmlReader::from_xml(xml, "t");
        let first = reader.next().unwrap().unwrap();
        assert_eq!(first.id.as_deref(), Some("A"));
        // a truncated document is either an XML error or a silent end, never a record
        match reader.next() {
            None => assert_eq!(reader.malformed_count(), 1),
            Some(result) => assert!(result.is_err()),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn reads_bzip2_files() {
        use bzip2::write::BzEncoder;
        use bzip2::Compression;
        use std::io::Write;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("records.xml.bz2");
        let mut encoder = BzEncoder::new(File::create(&path).unwrap(), Compression::fast());
        encoder.write_all(SAMPLE.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let records: Vec<_> = MarcXmlReader::open(&path, "t")
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
    }
}
