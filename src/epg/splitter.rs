//! XMLTV splitter.
//!
//! Takes one XMLTV document and writes one well-formed XMLTV file per
//! distinct `channel` attribute into the output directory, preserving
//! `<programme>` elements in source order. The whole document is checked
//! for well-formedness before any output file is opened, so a malformed
//! document produces no partial outputs.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use tracing::warn;

const TV_TAG: &[u8] = b"tv";
const PROGRAMME_TAG: &[u8] = b"programme";
const CHANNEL_ATTR: &[u8] = b"channel";

pub const XMLTV_PREAMBLE: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
                                  <!DOCTYPE tv SYSTEM \"xmltv.dtd\">\n\
                                  <tv generator-info-name=\"dvb-epg-gen\">\n";
pub const XMLTV_POSTAMBLE: &str = "</tv>\n";

#[derive(Debug)]
pub enum SplitError {
    /// Document is not well-formed XML.
    Xml(quick_xml::Error),
    /// Document has no `<tv>` root element.
    MissingTvRoot,
    /// Document ends with unclosed elements.
    UnexpectedEof,
    /// Reading the input or writing an output file failed.
    Io(io::Error),
}

impl std::fmt::Display for SplitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SplitError::Xml(e) => write!(f, "Xml parse error: {}", e),
            SplitError::MissingTvRoot => write!(f, "Can't find tv tag"),
            SplitError::UnexpectedEof => write!(f, "Unexpected end of document"),
            SplitError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for SplitError {}

impl From<quick_xml::Error> for SplitError {
    fn from(err: quick_xml::Error) -> Self {
        SplitError::Xml(err)
    }
}

impl From<io::Error> for SplitError {
    fn from(err: io::Error) -> Self {
        SplitError::Io(err)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SplitSummary {
    /// Distinct channels that produced an output file.
    pub channels: usize,
    /// Programme elements written across all files.
    pub programmes: usize,
}

/// Split an XMLTV file on disk into per-channel files under `out_dir`.
pub fn split_file(path: &Path, out_dir: &Path) -> Result<SplitSummary, SplitError> {
    let xml = std::fs::read(path)?;
    split_document(&xml, out_dir)
}

/// Split an in-memory XMLTV document into per-channel files under
/// `out_dir`.
pub fn split_document(xml: &[u8], out_dir: &Path) -> Result<SplitSummary, SplitError> {
    validate(xml)?;

    let mut files = ChannelFileSet::new(out_dir);
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_tv = false;
    let mut depth = 0usize;
    let mut programmes = 0usize;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                if !in_tv {
                    if e.name().as_ref() == TV_TAG {
                        in_tv = true;
                    }
                } else if depth == 0 && e.name().as_ref() == PROGRAMME_TAG {
                    let start = e.to_owned();
                    buf.clear();
                    if copy_programme(&mut reader, &start, &mut files)? {
                        programmes += 1;
                    }
                    continue;
                } else {
                    depth += 1;
                }
            }
            Event::Empty(e) => {
                if in_tv && depth == 0 && e.name().as_ref() == PROGRAMME_TAG {
                    if let Some(channel) = channel_of(&e)? {
                        if let Some(writer) = files.writer_for(&channel) {
                            writer.write_event(Event::Empty(e.to_owned()))?;
                            programmes += 1;
                        }
                    }
                }
            }
            Event::End(e) => {
                if in_tv {
                    if depth == 0 {
                        if e.name().as_ref() == TV_TAG {
                            in_tv = false;
                        }
                    } else {
                        depth -= 1;
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let channels = files.finish()?;
    Ok(SplitSummary {
        channels,
        programmes,
    })
}

/// Full streaming pass over the document: any malformed construct
/// surfaces here, before a single output file exists.
fn validate(xml: &[u8]) -> Result<(), SplitError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut saw_tv = false;
    let mut depth = 0usize;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                if e.name().as_ref() == TV_TAG {
                    saw_tv = true;
                }
                depth += 1;
            }
            Event::Empty(e) => {
                if e.name().as_ref() == TV_TAG {
                    saw_tv = true;
                }
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Eof => {
                if depth != 0 {
                    return Err(SplitError::UnexpectedEof);
                }
                break;
            }
            _ => {}
        }
        buf.clear();
    }
    if saw_tv {
        Ok(())
    } else {
        Err(SplitError::MissingTvRoot)
    }
}

/// Copy one `<programme>` subtree to its channel file. Returns whether
/// anything was written; elements without a channel attribute and
/// channels whose file cannot be opened are consumed and dropped.
fn copy_programme(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'static>,
    files: &mut ChannelFileSet,
) -> Result<bool, SplitError> {
    let writer = match channel_of(start)? {
        Some(channel) => files.writer_for(&channel),
        None => None,
    };

    if let Some(writer) = writer {
        writer.write_event(Event::Start(start.clone()))?;
        copy_subtree(reader, Some(writer))?;
        Ok(true)
    } else {
        copy_subtree(reader, None)?;
        Ok(false)
    }
}

/// Stream events until the matching `</programme>`, forwarding them to
/// `writer` when present.
fn copy_subtree(
    reader: &mut Reader<&[u8]>,
    mut writer: Option<&mut Writer<BufWriter<File>>>,
) -> Result<(), SplitError> {
    let mut buf = Vec::new();
    let mut depth = 0usize;
    loop {
        let event = reader.read_event_into(&mut buf)?;
        match &event {
            Event::Start(_) => depth += 1,
            Event::End(e) => {
                if depth == 0 {
                    debug_assert_eq!(e.name().as_ref(), PROGRAMME_TAG);
                    if let Some(w) = writer.as_deref_mut() {
                        w.write_event(event.borrow())?;
                    }
                    return Ok(());
                }
                depth -= 1;
            }
            // Validation already rejected truncated documents.
            Event::Eof => return Err(SplitError::UnexpectedEof),
            _ => {}
        }
        if let Some(w) = writer.as_deref_mut() {
            w.write_event(event.borrow())?;
        }
        buf.clear();
    }
}

fn channel_of(e: &BytesStart<'_>) -> Result<Option<String>, SplitError> {
    let attr = e
        .try_get_attribute(CHANNEL_ATTR)
        .map_err(quick_xml::Error::from)?;
    match attr {
        Some(attr) => {
            let value = attr.unescape_value().map_err(quick_xml::Error::from)?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

/// Per-document cache of open channel writers. Each file is opened once,
/// primed with the XMLTV preamble, and sealed with the postamble in
/// `finish`. Dropping the set closes whatever is open.
struct ChannelFileSet {
    out_dir: PathBuf,
    open: HashMap<String, Writer<BufWriter<File>>>,
}

impl ChannelFileSet {
    fn new(out_dir: &Path) -> Self {
        Self {
            out_dir: out_dir.to_path_buf(),
            open: HashMap::new(),
        }
    }

    /// Writer for `channel`, opening `<out_dir>/<channel>.xml` on first
    /// use. Returns `None` (with a warning) when the file cannot be
    /// opened; the caller skips the programme.
    fn writer_for(&mut self, channel: &str) -> Option<&mut Writer<BufWriter<File>>> {
        if !self.open.contains_key(channel) {
            let writer = match self.open_channel(channel) {
                Ok(writer) => writer,
                Err(err) => {
                    warn!(channel, error = %err, "Can't open output file for channel");
                    return None;
                }
            };
            self.open.insert(channel.to_string(), writer);
        }
        self.open.get_mut(channel)
    }

    fn open_channel(&self, channel: &str) -> io::Result<Writer<BufWriter<File>>> {
        if channel.is_empty() || channel.chars().any(std::path::is_separator) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "channel id is not a valid file name",
            ));
        }
        let path = self.out_dir.join(format!("{channel}.xml"));
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(XMLTV_PREAMBLE.as_bytes())?;
        Ok(Writer::new(file))
    }

    /// Seal and close every open file; returns how many there were.
    fn finish(self) -> io::Result<usize> {
        let count = self.open.len();
        for (_, writer) in self.open {
            let mut file = writer.into_inner();
            file.write_all(XMLTV_POSTAMBLE.as_bytes())?;
            file.flush()?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv generator-info-name="upstream">
  <channel id="c1"><display-name>One</display-name></channel>
  <programme channel="c1" start="20240101000000"><title>a</title></programme>
  <programme channel="c2" start="20240101010000"><title>b</title></programme>
  <programme channel="c1" start="20240101020000"><title>c</title></programme>
</tv>"#;

    #[test]
    fn one_file_per_distinct_channel() {
        let dir = tempfile::tempdir().unwrap();
        let summary = split_document(DOC.as_bytes(), dir.path()).unwrap();

        assert_eq!(summary.channels, 2);
        assert_eq!(summary.programmes, 3);
        assert!(dir.path().join("c1.xml").exists());
        assert!(dir.path().join("c2.xml").exists());
    }

    #[test]
    fn outputs_are_bracketed_xmltv() {
        let dir = tempfile::tempdir().unwrap();
        split_document(DOC.as_bytes(), dir.path()).unwrap();

        let c1 = std::fs::read_to_string(dir.path().join("c1.xml")).unwrap();
        assert!(c1.starts_with(XMLTV_PREAMBLE));
        assert!(c1.ends_with(XMLTV_POSTAMBLE));
        assert_eq!(c1.matches("<programme").count(), 2);
        assert!(c1.contains("<title>a</title>"));
        assert!(c1.contains("<title>c</title>"));
        assert!(!c1.contains("<title>b</title>"));
    }

    #[test]
    fn programme_without_channel_attribute_skipped() {
        let doc = r#"<tv><programme start="x"><title>orphan</title></programme>
                     <programme channel="c9"><title>kept</title></programme></tv>"#;
        let dir = tempfile::tempdir().unwrap();
        let summary = split_document(doc.as_bytes(), dir.path()).unwrap();

        assert_eq!(summary.channels, 1);
        assert_eq!(summary.programmes, 1);
    }

    #[test]
    fn self_closing_programme_handled() {
        let doc = r#"<tv><programme channel="c1" start="20240101000000"/></tv>"#;
        let dir = tempfile::tempdir().unwrap();
        let summary = split_document(doc.as_bytes(), dir.path()).unwrap();

        assert_eq!(summary.channels, 1);
        assert_eq!(summary.programmes, 1);
        let c1 = std::fs::read_to_string(dir.path().join("c1.xml")).unwrap();
        assert!(c1.contains("<programme"));
    }

    #[test]
    fn malformed_document_produces_no_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let doc = r#"<tv><programme channel="c1"><title>a</tv>"#;
        assert!(split_document(doc.as_bytes(), dir.path()).is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn missing_tv_root_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = split_document(b"<guide></guide>", dir.path()).unwrap_err();
        assert!(matches!(err, SplitError::MissingTvRoot));
    }

    #[test]
    fn channel_with_path_separator_skipped() {
        let doc = r#"<tv><programme channel="../evil"><title>x</title></programme></tv>"#;
        let dir = tempfile::tempdir().unwrap();
        let summary = split_document(doc.as_bytes(), dir.path()).unwrap();

        assert_eq!(summary.channels, 0);
        assert_eq!(summary.programmes, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn nested_programme_markup_preserved_in_order() {
        let doc = r#"<tv>
  <programme channel="c1"><title lang="en">first</title><desc>d1</desc></programme>
  <programme channel="c1"><title lang="en">second</title></programme>
</tv>"#;
        let dir = tempfile::tempdir().unwrap();
        split_document(doc.as_bytes(), dir.path()).unwrap();

        let c1 = std::fs::read_to_string(dir.path().join("c1.xml")).unwrap();
        let first = c1.find("first").unwrap();
        let second = c1.find("second").unwrap();
        assert!(first < second);
        assert!(c1.contains(r#"<title lang="en">first</title>"#));
        assert!(c1.contains("<desc>d1</desc>"));
    }
}
