use std::io::BufRead;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::delta::{DeltaKind, DeltaRecord};
use crate::error::{Result, ThinBackupError};

//------------------------------------------
// thin_delta output:
//
//   <superblock>
//     <diff left="3" right="4">
//       <same begin="0" length="7"/>
//       <right_only begin="7" length="2"/>
//       ...
//     </diff>
//   </superblock>
//
// thin_dump output (single device, --dev-id):
//
//   <superblock>
//     <device dev_id="3" ...>
//       <single_mapping origin_block="12" data_block="99" time="0"/>
//       <range_mapping origin_begin="40" data_begin="50" length="8" time="0"/>
//     </device>
//   </superblock>

fn attr_u64(e: &quick_xml::events::BytesStart, name: &str, program: &str) -> Result<u64> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ThinBackupError::ToolOutputUnparseable {
            program: program.to_string(),
            reason: format!("malformed attribute: {err}"),
        })?;
        if attr.key.as_ref() == name.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|err| ThinBackupError::ToolOutputUnparseable {
                    program: program.to_string(),
                    reason: format!("malformed attribute value: {err}"),
                })?;
            return value
                .parse::<u64>()
                .map_err(|err| ThinBackupError::ToolOutputUnparseable {
                    program: program.to_string(),
                    reason: format!("bad integer for '{name}': {err}"),
                });
        }
    }
    Err(ThinBackupError::ToolOutputUnparseable {
        program: program.to_string(),
        reason: format!("missing attribute '{name}'"),
    })
}

fn delta_record_from_tag(
    tag: &str,
    e: &quick_xml::events::BytesStart,
    program: &str,
) -> Result<Option<DeltaRecord>> {
    let Some(kind) = DeltaKind::from_tag(tag) else {
        return Ok(None);
    };
    let begin = attr_u64(e, "begin", program)?;
    let length = attr_u64(e, "length", program)?;
    Ok(Some(DeltaRecord::new(kind, begin, length)))
}

fn dump_record_from_tag(
    tag: &str,
    e: &quick_xml::events::BytesStart,
    program: &str,
) -> Result<Option<DeltaRecord>> {
    match tag {
        "single_mapping" => {
            let begin = attr_u64(e, "origin_block", program)?;
            Ok(Some(DeltaRecord::new(DeltaKind::RightOnly, begin, 1)))
        }
        "range_mapping" => {
            let begin = attr_u64(e, "origin_begin", program)?;
            let length = attr_u64(e, "length", program)?;
            Ok(Some(DeltaRecord::new(DeltaKind::RightOnly, begin, length)))
        }
        _ => Ok(None),
    }
}

/// Which of the two tools produced the XML being parsed, so the right tag
/// set is recognised and error messages name the right program.
#[derive(Clone, Copy)]
enum Source {
    Delta,
    Dump,
}

impl Source {
    fn program(self) -> &'static str {
        match self {
            Source::Delta => "thin_delta",
            Source::Dump => "thin_dump",
        }
    }

    fn record_from_tag(
        self,
        tag: &str,
        e: &quick_xml::events::BytesStart,
    ) -> Result<Option<DeltaRecord>> {
        match self {
            Source::Delta => delta_record_from_tag(tag, e, self.program()),
            Source::Dump => dump_record_from_tag(tag, e, self.program()),
        }
    }
}

/// Streams `DeltaRecord`s out of `thin_delta`/`thin_dump` XML without
/// buffering the whole tree: each `Start`/`Empty` event for a recognised tag
/// is turned into one record as it's read.
struct XmlDeltaReader<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    source: Source,
    done: bool,
}

impl<R: BufRead> XmlDeltaReader<R> {
    fn new(inner: R, source: Source) -> Self {
        let reader = Reader::from_reader(inner);
        XmlDeltaReader {
            reader,
            buf: Vec::new(),
            source,
            done: false,
        }
    }

    fn next_record(&mut self) -> Result<Option<DeltaRecord>> {
        loop {
            if self.done {
                return Ok(None);
            }
            self.buf.clear();
            let event =
                self.reader
                    .read_event_into(&mut self.buf)
                    .map_err(|err| ThinBackupError::ToolOutputUnparseable {
                        program: self.source.program().to_string(),
                        reason: format!("XML parse error: {err}"),
                    })?;

            match event {
                Event::Eof => {
                    self.done = true;
                    return Ok(None);
                }
                Event::Start(e) | Event::Empty(e) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    if let Some(rec) = self.source.record_from_tag(&tag, &e)? {
                        return Ok(Some(rec));
                    }
                    // superblock/diff/device wrapper elements and any
                    // unrecognised tag are simply skipped.
                }
                _ => {}
            }
        }
    }
}

impl<R: BufRead> Iterator for XmlDeltaReader<R> {
    type Item = Result<DeltaRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Parses `thin_delta --metadata-snap --thin1 <p> --thin2 <c>` output into a
/// lazy stream of `DeltaRecord`s, in the ascending-`begin_block` order the
/// tool already emits them in.
pub fn parse_delta<R: BufRead + 'static>(inner: R) -> impl Iterator<Item = Result<DeltaRecord>> {
    XmlDeltaReader::new(inner, Source::Delta)
}

/// Parses `thin_dump --metadata-snap --dev-id <id>` output into a lazy
/// stream of `DeltaRecord`s, every entry classified `RIGHT_ONLY` (used for
/// from-scratch backups, where the whole current mapping is `NEW`).
pub fn parse_dump<R: BufRead + 'static>(inner: R) -> impl Iterator<Item = Result<DeltaRecord>> {
    XmlDeltaReader::new(inner, Source::Dump)
}

//------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_delta_tags() {
        let xml = br#"<superblock>
  <diff left="3" right="4">
    <same begin="0" length="7"/>
    <right_only begin="7" length="2"/>
    <different begin="9" length="1"/>
    <left_only begin="10" length="3"/>
  </diff>
</superblock>"#;
        let recs: Result<Vec<_>> = parse_delta(Cursor::new(xml.to_vec())).collect();
        let recs = recs.unwrap();
        assert_eq!(
            recs,
            vec![
                DeltaRecord::new(DeltaKind::Same, 0, 7),
                DeltaRecord::new(DeltaKind::RightOnly, 7, 2),
                DeltaRecord::new(DeltaKind::Different, 9, 1),
                DeltaRecord::new(DeltaKind::LeftOnly, 10, 3),
            ]
        );
    }

    #[test]
    fn parses_dump_tags_as_right_only() {
        let xml = br#"<superblock>
  <device dev_id="3">
    <single_mapping origin_block="12" data_block="99" time="0"/>
    <range_mapping origin_begin="40" data_begin="50" length="8" time="0"/>
  </device>
</superblock>"#;
        let recs: Result<Vec<_>> = parse_dump(Cursor::new(xml.to_vec())).collect();
        let recs = recs.unwrap();
        assert_eq!(
            recs,
            vec![
                DeltaRecord::new(DeltaKind::RightOnly, 12, 1),
                DeltaRecord::new(DeltaKind::RightOnly, 40, 8),
            ]
        );
    }

    #[test]
    fn missing_attribute_is_unparseable() {
        let xml = br#"<superblock><diff left="1" right="2"><same length="3"/></diff></superblock>"#;
        let recs: Result<Vec<_>> = parse_delta(Cursor::new(xml.to_vec())).collect();
        assert!(recs.is_err());
    }
}

//------------------------------------------
