use std::io::{Cursor, Read, Seek};

use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::ExtractionError;

/// Upper bound on the inflated size of `word/document.xml`.
pub const MAX_DOCUMENT_XML_BYTES: u64 = 32 * 1024 * 1024;

/// Pulls paragraph text out of a DOCX container's `word/document.xml`.
pub fn extract_docx_text(bytes: &[u8]) -> Result<String, ExtractionError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractionError::Docx(format!("Failed to open DOCX: {e}")))?;
    read_document_xml(&mut archive, MAX_DOCUMENT_XML_BYTES)
}

fn read_document_xml<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    max_bytes: u64,
) -> Result<String, ExtractionError> {
    let mut document_xml = archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractionError::Docx(format!("Failed to find document.xml: {e}")))?;

    if document_xml.size() > max_bytes {
        return Err(too_large(max_bytes));
    }

    // The declared size is untrusted; bound the actual inflated stream too.
    let mut xml = String::new();
    (&mut document_xml)
        .take(max_bytes + 1)
        .read_to_string(&mut xml)
        .map_err(|e| ExtractionError::Docx(format!("Failed to read document.xml: {e}")))?;
    if xml.len() as u64 > max_bytes {
        return Err(too_large(max_bytes));
    }

    parse_document_xml(&xml)
}

fn too_large(max_bytes: u64) -> ExtractionError {
    ExtractionError::Docx(format!("document.xml exceeds {max_bytes} bytes"))
}

fn parse_document_xml(xml: &str) -> Result<String, ExtractionError> {
    // Whitespace inside <w:t> is content, so text is not trimmed.
    let mut reader = Reader::from_str(xml);

    let mut text = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => text.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(ref e)) => {
                // <w:tab/> and <w:br/> separate words inside a paragraph.
                match e.local_name().as_ref() {
                    b"tab" => text.push('\t'),
                    b"br" => text.push('\n'),
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if in_text {
                    let decoded = e
                        .decode()
                        .map_err(|e| ExtractionError::Docx(format!("XML decoding error: {e}")))?;
                    text.push_str(&decoded);
                }
            }
            Ok(Event::GeneralRef(r)) => {
                if in_text {
                    if let Ok(Some(ch)) = r.resolve_char_ref() {
                        text.push(ch);
                    } else if let Ok(name) = r.decode() {
                        if let Some(value) = resolve_predefined_entity(&name) {
                            text.push_str(value);
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractionError::Docx(format!("XML parsing error: {e}"))),
            _ => {}
        }
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const DOCUMENT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Jane Doe</w:t></w:r></w:p>
    <w:p><w:r><w:t>Skills:</w:t></w:r><w:r><w:tab/><w:t>Go</w:t></w:r></w:p>
  </w:body>
</w:document>"#;

    fn docx_bytes(document: &str) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("word/document.xml", options).unwrap();
            writer.write_all(document.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        buffer.into_inner()
    }

    #[test]
    fn test_paragraphs_become_lines() {
        let text = extract_docx_text(&docx_bytes(DOCUMENT)).unwrap();
        assert_eq!(text, "Jane Doe\nSkills:\tGo\n");
    }

    #[test]
    fn test_entities_are_resolved() {
        let document = r#"<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>R&amp;D at AT&amp;T</w:t></w:r></w:p>
    <w:p><w:r><w:t xml:space="preserve">Tom &amp; Jerry &lt;QA&gt; &#169;</w:t></w:r></w:p>
  </w:body>
</w:document>"#;
        let text = extract_docx_text(&docx_bytes(document)).unwrap();
        assert_eq!(text, "R&D at AT&T\nTom & Jerry <QA> \u{a9}\n");
    }

    #[test]
    fn test_oversized_document_xml_is_rejected() {
        let mut archive = zip::ZipArchive::new(Cursor::new(docx_bytes(DOCUMENT))).unwrap();
        let err = read_document_xml(&mut archive, 64).unwrap_err();
        assert!(matches!(err, ExtractionError::Docx(_)));
        assert!(err.to_string().contains("exceeds 64 bytes"));

        let mut archive = zip::ZipArchive::new(Cursor::new(docx_bytes(DOCUMENT))).unwrap();
        assert!(read_document_xml(&mut archive, MAX_DOCUMENT_XML_BYTES).is_ok());
    }

    #[test]
    fn test_missing_document_xml() {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            writer
                .start_file("other.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.finish().unwrap();
        }
        let err = extract_docx_text(&buffer.into_inner()).unwrap_err();
        assert!(err.to_string().contains("document.xml"));
    }

    #[test]
    fn test_not_a_zip() {
        assert!(matches!(
            extract_docx_text(b"PK\x03\x04garbage"),
            Err(ExtractionError::Docx(_))
        ));
    }
}
