//! Streaming walk over AWS query-API XML responses.
//!
//! Responses are small and shallow, so parsers track the path of open
//! elements and pick values out by path suffix instead of building a tree.

use crate::error::QueueError;
use quick_xml::events::Event;
use quick_xml::Reader;

#[cfg(test)]
#[path = "xml_tests.rs"]
mod tests;

/// One step of the walk. `path` lists the open elements, outermost first.
#[derive(Debug)]
pub(crate) enum XmlEvent<'a> {
    Open(&'a [String]),
    Text(&'a [String], &'a str),
    Close(&'a [String]),
}

/// Whether `path` ends with the element names in `suffix`
pub(crate) fn path_ends_with(path: &[String], suffix: &[&str]) -> bool {
    path.len() >= suffix.len()
        && path[path.len() - suffix.len()..]
            .iter()
            .zip(suffix)
            .all(|(actual, expected)| actual == expected)
}

/// Feed every element boundary and text node of `xml` to `visit`.
///
/// Text is passed untrimmed and unescaped; CDATA sections are passed as
/// text. Namespace prefixes are ignored.
pub(crate) fn walk<F>(xml: &str, mut visit: F) -> Result<(), QueueError>
where
    F: FnMut(XmlEvent<'_>),
{
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);

    let mut path: Vec<String> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                visit(XmlEvent::Open(&path));
            }
            Ok(Event::Empty(ref e)) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                visit(XmlEvent::Open(&path));
                visit(XmlEvent::Close(&path));
                path.pop();
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(|e| QueueError::MalformedResponse {
                    message: format!("Failed to unescape XML text: {}", e),
                })?;
                visit(XmlEvent::Text(&path, &text));
            }
            Ok(Event::CData(e)) => {
                let raw = e.into_inner();
                let text = String::from_utf8_lossy(&raw);
                visit(XmlEvent::Text(&path, &text));
            }
            Ok(Event::End(_)) => {
                visit(XmlEvent::Close(&path));
                path.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(QueueError::MalformedResponse {
                    message: format!("XML parsing error: {}", e),
                })
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(())
}

/// First text found under an element whose path ends with `suffix`
pub(crate) fn find_text(xml: &str, suffix: &[&str]) -> Result<Option<String>, QueueError> {
    let mut found: Option<String> = None;
    let mut done = false;
    walk(xml, |event| match event {
        XmlEvent::Text(path, text) if !done && path_ends_with(path, suffix) => {
            found.get_or_insert_with(String::new).push_str(text);
        }
        XmlEvent::Close(path) if found.is_some() && path_ends_with(path, suffix) => {
            done = true;
        }
        _ => {}
    })?;
    Ok(found.map(|s| s.trim().to_string()))
}

/// Like [`find_text`] but a missing element is a malformed response
pub(crate) fn require_text(xml: &str, suffix: &[&str]) -> Result<String, QueueError> {
    find_text(xml, suffix)?.ok_or_else(|| QueueError::MalformedResponse {
        message: format!("{} not found in response", suffix.join("/")),
    })
}
