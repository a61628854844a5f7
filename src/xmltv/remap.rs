//! Guide remapping
//!
//! The external guide knows channels by their source ids (`BBC1.uk`); the
//! media server knows them by guide number (`101`). Remapping streams the
//! XML, keeps only channels present in the lineup's tvg-id set, rewrites
//! ids, and drops every programme that references an unmatched channel.

use std::collections::{HashMap, HashSet};

use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};

use super::XmltvError;

/// Remap a guide against the lineup
///
/// `map` is tvg-id → guide number. With `prune_empty` set, channels that
/// end up with no programmes are dropped too.
pub fn remap_guide(
    xml: &str,
    map: &HashMap<&str, &str>,
    prune_empty: bool,
) -> Result<String, XmltvError> {
    // First pass: which mapped channels actually have programmes
    let mut with_programmes: HashSet<String> = HashSet::new();
    if prune_empty {
        let mut reader = Reader::from_str(xml);
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) | Ok(Event::Empty(e))
                    if e.name().as_ref() == b"programme" =>
                {
                    if let Some(channel) = attr_value(&e, b"channel")? {
                        if map.contains_key(channel.as_str()) {
                            with_programmes.insert(channel);
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(XmltvError::ParseError(e.to_string())),
            }
        }
    }

    let keep_channel = |id: &str| -> bool {
        map.contains_key(id) && (!prune_empty || with_programmes.contains(id))
    };

    // Second pass: emit
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    loop {
        let event = reader
            .read_event()
            .map_err(|e| XmltvError::ParseError(e.to_string()))?;
        match event {
            Event::Start(e) if e.name().as_ref() == b"channel" => {
                let id = attr_value(&e, b"id")?.unwrap_or_default();
                if keep_channel(&id) {
                    let guide_number = map[id.as_str()];
                    write(&mut writer, Event::Start(rewrite_attr(&e, b"id", guide_number)?))?;
                } else {
                    reader
                        .read_to_end(e.name())
                        .map_err(|e| XmltvError::ParseError(e.to_string()))?;
                }
            }
            Event::Empty(e) if e.name().as_ref() == b"channel" => {
                let id = attr_value(&e, b"id")?.unwrap_or_default();
                if keep_channel(&id) {
                    let guide_number = map[id.as_str()];
                    write(&mut writer, Event::Empty(rewrite_attr(&e, b"id", guide_number)?))?;
                }
            }
            Event::Start(e) if e.name().as_ref() == b"programme" => {
                let channel = attr_value(&e, b"channel")?.unwrap_or_default();
                match map.get(channel.as_str()) {
                    Some(guide_number) => {
                        write(
                            &mut writer,
                            Event::Start(rewrite_attr(&e, b"channel", guide_number)?),
                        )?;
                    }
                    None => {
                        // Programme references a channel the lineup dropped
                        reader
                            .read_to_end(e.name())
                            .map_err(|e| XmltvError::ParseError(e.to_string()))?;
                    }
                }
            }
            Event::Empty(e) if e.name().as_ref() == b"programme" => {
                let channel = attr_value(&e, b"channel")?.unwrap_or_default();
                if let Some(guide_number) = map.get(channel.as_str()) {
                    write(
                        &mut writer,
                        Event::Empty(rewrite_attr(&e, b"channel", guide_number)?),
                    )?;
                }
            }
            Event::Eof => break,
            other => write(&mut writer, other)?,
        }
    }

    String::from_utf8(writer.into_inner())
        .map_err(|e| XmltvError::ParseError(format!("remapped guide is not UTF-8: {}", e)))
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), XmltvError> {
    writer
        .write_event(event)
        .map_err(|e| XmltvError::ParseError(e.to_string()))
}

/// Read one attribute as an owned string
fn attr_value(element: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, XmltvError> {
    for attribute in element.attributes() {
        let attribute = attribute.map_err(|e| XmltvError::ParseError(e.to_string()))?;
        if attribute.key.as_ref() == key {
            let value = attribute
                .unescape_value()
                .map_err(|e| XmltvError::ParseError(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Copy a start tag, replacing one attribute value
fn rewrite_attr(
    element: &BytesStart<'_>,
    key: &[u8],
    new_value: &str,
) -> Result<BytesStart<'static>, XmltvError> {
    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    let mut out = BytesStart::new(name);

    for attribute in element.attributes() {
        let attribute = attribute.map_err(|e| XmltvError::ParseError(e.to_string()))?;
        if attribute.key.as_ref() == key {
            out.push_attribute((String::from_utf8_lossy(key).as_ref(), new_value));
        } else {
            let attr_key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let attr_value = attribute
                .unescape_value()
                .map_err(|e| XmltvError::ParseError(e.to_string()))?
                .into_owned();
            out.push_attribute(Attribute::from((attr_key.as_str(), attr_value.as_str())));
        }
    }

    Ok(out)
}
