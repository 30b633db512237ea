/**
 * REPLY DECODER - single-pass SEMP reply reader
 *
 * ROLE:
 * Walks the reply as a stream of start/text/end events and drives one
 * ContainerSet per record. A record is every element sitting at the
 * poller's base path. Object tags are captured on the way, the record is
 * handed to a RecordSink as soon as its end tag is read, and nothing but the
 * current record is kept in memory.
 *
 * HOW IT WORKS:
 * - an element becomes a nested object when its first child shows up,
 *   otherwise it is a leaf written with the schema type of its full path
 * - `rpc-reply/@semp-version` and `rpc-reply/more-cookie` are reported back
 *   to the caller, the cookie's inner `<rpc>` re-serialized verbatim
 * - `execute-result/@code` other than `ok` fails the reply
 * - mismatched or unclosed elements fail the reply; records already handed
 *   to the sink stay handed
 */

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::collections::BTreeMap;
use std::io::BufRead;
use tracing::{debug, trace};

use crate::containers::{ContainerContext, ContainerSet, EncodingKind, WirePayload};
use crate::error::{PumpError, Result};
use crate::poller::Poller;
use crate::schema::SchemaRegistry;

const REPLY_ROOT: &str = "rpc-reply";
const MORE_COOKIE_PATH: &str = "/rpc-reply/more-cookie";
const EXECUTE_RESULT_PATH: &str = "/rpc-reply/execute-result";

/// One record read from a reply: a payload per encoding and its object tags.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub payloads: BTreeMap<EncodingKind, WirePayload>,
    pub tags: BTreeMap<String, String>,
}

/// Receives records as they are finalized.
///
/// An error aborts the decode; it is returned from [`ReplyDecoder::decode`].
pub trait RecordSink {
    fn on_record(&mut self, record: DecodedRecord) -> Result<()>;
}

impl RecordSink for Vec<DecodedRecord> {
    fn on_record(&mut self, record: DecodedRecord) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOutcome {
    pub records: usize,
    /// Complete request for the next page, if the reply was truncated.
    pub more_cookie: Option<String>,
    /// Version the appliance answered with.
    pub semp_version: Option<String>,
}

/// An element below the record root.
struct Frame {
    name: String,
    multiple: bool,
    nested: bool,
    text: String,
}

struct OpenRecord {
    depth: usize,
    set: ContainerSet,
    frames: Vec<Frame>,
}

struct CookieCapture {
    depth: usize,
    writer: Writer<Vec<u8>>,
}

pub struct ReplyDecoder<'a> {
    poller: &'a Poller,
    schema: &'a SchemaRegistry,
    encodings: Vec<EncodingKind>,
    semp_version: String,
    tag_paths: BTreeMap<String, String>,
}

impl<'a> ReplyDecoder<'a> {
    pub fn new(
        poller: &'a Poller,
        schema: &'a SchemaRegistry,
        encodings: Vec<EncodingKind>,
        semp_version: impl Into<String>,
    ) -> Self {
        Self {
            tag_paths: poller.tag_paths(),
            poller,
            schema,
            encodings,
            semp_version: semp_version.into(),
        }
    }

    pub fn decode<R: BufRead, S: RecordSink + ?Sized>(&self, input: R, sink: &mut S) -> Result<DecodeOutcome> {
        let mut reader = Reader::from_reader(input);
        reader.trim_text(true);

        let mut outcome = DecodeOutcome::default();
        let mut path: Vec<String> = Vec::new();
        let mut record: Option<OpenRecord> = None;
        let mut cookie: Option<CookieCapture> = None;
        let mut tags: BTreeMap<String, String> = BTreeMap::new();
        let mut capturing: Option<String> = None;
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let event = reader.read_event_into(&mut buf)?;
            match &event {
                Event::Start(start) | Event::Empty(start) => {
                    let empty = matches!(event, Event::Empty(_));
                    let name = element_name(start);

                    if let Some(capture) = cookie.as_mut() {
                        capture.writer.write_event(&event)?;
                        if !empty {
                            path.push(name);
                        }
                        continue;
                    }

                    path.push(name.clone());
                    let full = join(&path);
                    trace!("<{}>", full);

                    if path.len() == 1 && name == REPLY_ROOT {
                        outcome.semp_version = attribute(start, b"semp-version")?;
                    } else if full == EXECUTE_RESULT_PATH {
                        check_execute_result(start)?;
                    } else if full == MORE_COOKIE_PATH && !empty {
                        cookie = Some(CookieCapture { depth: path.len(), writer: Writer::new(Vec::new()) });
                    }

                    if full == self.poller.base_path && record.is_none() {
                        let version = outcome.semp_version.as_deref().unwrap_or(&self.semp_version);
                        let ctx = ContainerContext::new(self.poller.base_path.clone(), version);
                        record = Some(OpenRecord {
                            depth: path.len(),
                            set: ContainerSet::new(&self.encodings, &ctx),
                            frames: Vec::new(),
                        });
                    } else if let Some(open) = record.as_mut() {
                        if let Some(parent) = open.frames.last_mut() {
                            if !parent.nested {
                                parent.nested = true;
                                open.set.start_nested(&parent.name, parent.multiple);
                            }
                        }
                        let multiple = self.schema.lookup(&full).multiple;
                        open.frames.push(Frame { name, multiple, nested: false, text: String::new() });
                    }

                    capturing = self.tag_paths.get(&full).cloned();

                    if empty {
                        self.close_element(&mut path, &mut record, &mut tags, sink, &mut outcome)?;
                        capturing = None;
                    }
                }
                Event::Text(text) => {
                    let text = text.unescape()?;
                    if let Some(capture) = cookie.as_mut() {
                        capture.writer.write_event(&event)?;
                        continue;
                    }
                    self.append_text(&text, &mut record, &mut tags, capturing.as_deref());
                }
                Event::CData(data) => {
                    if let Some(capture) = cookie.as_mut() {
                        capture.writer.write_event(&event)?;
                        continue;
                    }
                    let text = String::from_utf8_lossy(&**data).into_owned();
                    self.append_text(&text, &mut record, &mut tags, capturing.as_deref());
                }
                Event::End(_) => {
                    if let Some(capture) = cookie.as_mut() {
                        if path.len() > capture.depth {
                            capture.writer.write_event(&event)?;
                            path.pop();
                            continue;
                        }
                        if let Some(done) = cookie.take() {
                            let request = String::from_utf8(done.writer.into_inner())
                                .map_err(|e| PumpError::Decode(format!("more-cookie is not UTF-8: {e}")))?;
                            debug!("Reply for {} continues, more-cookie of {} bytes", self.poller.name, request.len());
                            outcome.more_cookie = Some(request).filter(|r| !r.is_empty());
                        }
                    }
                    self.close_element(&mut path, &mut record, &mut tags, sink, &mut outcome)?;
                    capturing = None;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !path.is_empty() {
            return Err(PumpError::Decode(format!(
                "reply for {} ended inside {}",
                self.poller.name,
                join(&path)
            )));
        }
        Ok(outcome)
    }

    fn append_text(
        &self,
        text: &str,
        record: &mut Option<OpenRecord>,
        tags: &mut BTreeMap<String, String>,
        capturing: Option<&str>,
    ) {
        if let Some(frame) = record.as_mut().and_then(|open| open.frames.last_mut()) {
            frame.text.push_str(text);
        }
        if let Some(tag) = capturing {
            tags.entry(tag.to_string()).or_default().push_str(text.trim());
        }
    }

    fn close_element<S: RecordSink + ?Sized>(
        &self,
        path: &mut Vec<String>,
        record: &mut Option<OpenRecord>,
        tags: &mut BTreeMap<String, String>,
        sink: &mut S,
        outcome: &mut DecodeOutcome,
    ) -> Result<()> {
        let full = join(path);
        let closes_record = record.as_ref().is_some_and(|open| open.depth == path.len());

        if closes_record {
            if let Some(open) = record.take() {
                sink.on_record(DecodedRecord { payloads: open.set.finish(), tags: std::mem::take(tags) })?;
                outcome.records += 1;
            }
        } else if let Some(open) = record.as_mut() {
            let frame = open
                .frames
                .pop()
                .ok_or_else(|| PumpError::Decode(format!("unbalanced element {full}")))?;
            if frame.nested {
                open.set.close_nested(&frame.name);
            } else {
                let entry = self.schema.lookup(&full);
                open.set.put_typed(entry.xsd_type, &frame.name, frame.text.trim(), entry.multiple);
            }
        }

        path.pop();
        Ok(())
    }
}

fn element_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn join(path: &[String]) -> String {
    let mut joined = String::new();
    for segment in path {
        joined.push('/');
        joined.push_str(segment);
    }
    joined
}

fn attribute(start: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in start.attributes() {
        let attr = attr.map_err(|e| PumpError::Decode(format!("bad attribute: {e}")))?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn check_execute_result(start: &BytesStart<'_>) -> Result<()> {
    match attribute(start, b"code")? {
        Some(code) if code.eq_ignore_ascii_case("ok") => Ok(()),
        Some(code) => {
            let reason = attribute(start, b"reason")?.unwrap_or_default();
            Err(PumpError::SempReply(format!("execute-result code '{code}' {reason}").trim_end().to_string()))
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::VPN_NAME_TAG;
    use crate::schema::{SchemaEntry, XsdType};
    use serde_json::json;
    use statspump_devkit::{SempReplyBuilder, VpnFixture};

    fn decode(poller: &Poller, xml: &str) -> Result<(DecodeOutcome, Vec<DecodedRecord>)> {
        let schema = SchemaRegistry::with_builtins();
        let decoder = ReplyDecoder::new(poller, &schema, vec![EncodingKind::Json], "soltr/7_1");
        let mut records = Vec::new();
        let outcome = decoder.decode(xml.as_bytes(), &mut records)?;
        Ok((outcome, records))
    }

    fn json(record: &DecodedRecord) -> &serde_json::Value {
        match &record.payloads[&EncodingKind::Json] {
            WirePayload::Json(value) => value,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn decodes_one_record_per_vpn_with_tags() {
        let poller = Poller::vpn_detail();
        let xml = SempReplyBuilder::vpn_page(
            "soltr/9_0",
            &[VpnFixture::up("default"), VpnFixture::down("guest")],
            None,
        );
        let (outcome, records) = decode(&poller, &xml).unwrap();

        assert_eq!(outcome.records, 2);
        assert_eq!(outcome.semp_version.as_deref(), Some("soltr/9_0"));
        assert!(outcome.more_cookie.is_none());

        assert_eq!(records[0].tags[VPN_NAME_TAG], "default");
        assert_eq!(records[0].tags["OPERATIONAL"], "true");
        assert_eq!(records[1].tags[VPN_NAME_TAG], "guest");
        assert_eq!(records[1].tags["LOCAL_STATUS"], "Down");
        assert_eq!(records[1].tags["SMF_TOPIC_FORMAT"], "true");

        let first = json(&records[0]);
        assert_eq!(first["name"], json!("default"));
        assert_eq!(first["enabled"], json!(true));
        assert_eq!(first["connections"], json!(1));
        assert_eq!(first["event-configuration"]["publish-topic-format"]["mqtt"], json!("false"));
    }

    #[test]
    fn more_cookie_is_reserialized() {
        let poller = Poller::vpn_detail();
        let next = "<rpc semp-version=\"soltr/9_0\"><show><message-vpn><vpn-name>*</vpn-name>\
                    <detail/></message-vpn></show></rpc>";
        let xml = SempReplyBuilder::vpn_page("soltr/9_0", &[VpnFixture::up("a")], Some(next));
        let (outcome, records) = decode(&poller, &xml).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(outcome.more_cookie.as_deref(), Some(next));
    }

    #[test]
    fn failed_execute_result_is_an_error() {
        let poller = Poller::hostname();
        let xml = SempReplyBuilder::new("soltr/7_1").result_code("fail").build();
        assert!(matches!(decode(&poller, &xml), Err(PumpError::SempReply(_))));
    }

    #[test]
    fn malformed_nesting_aborts() {
        let poller = Poller::hostname();
        let mismatched = "<rpc-reply><rpc><show><hostname><hostname>r</name></hostname></show></rpc></rpc-reply>";
        assert!(decode(&poller, mismatched).is_err());

        let truncated = "<rpc-reply><rpc><show><hostname><hostname>r</hostname>";
        assert!(matches!(decode(&poller, truncated), Err(PumpError::Decode(_))));
    }

    #[test]
    fn builtin_tags_are_captured() {
        let (_, records) = decode(&Poller::hostname(), &SempReplyBuilder::hostname("soltr/7_1", "router-a")).unwrap();
        assert_eq!(records[0].tags["HOSTNAME"], "router-a");

        let xml = SempReplyBuilder::redundancy("soltr/7_1", "Active/Standby", "Local Active", "Shutdown");
        let (_, records) = decode(&Poller::redundancy(), &xml).unwrap();
        assert_eq!(records[0].tags["REDUNDANCY_MODE"], "Active/Standby");
        assert_eq!(records[0].tags["PRIMARY_ACTIVITY_DETAIL"], "Local Active");
        assert_eq!(records[0].tags["BACKUP_ACTIVITY"], "Shutdown");

        let (_, records) =
            decode(&Poller::message_spool(), &SempReplyBuilder::message_spool("soltr/7_1", "AD-Active")).unwrap();
        assert_eq!(records[0].tags["AD_STATUS"], "AD-Active");
    }

    #[test]
    fn multiple_elements_follow_schema() {
        let poller = Poller::builder("Clients")
            .request("<rpc/>")
            .base_path("/rpc-reply/rpc/show/client/client")
            .build()
            .unwrap();
        let mut schema = SchemaRegistry::new();
        schema.insert("/rpc-reply/rpc/show/client/client/subscription", SchemaEntry::multiple(XsdType::String));
        schema.insert("/rpc-reply/rpc/show/client/client/stats/rx", SchemaEntry::new(XsdType::Long));
        let xml = SempReplyBuilder::new("soltr/7_1")
            .body(
                "<show><client><client><name>c1</name><subscription>a/b</subscription>\
                 <subscription>c/d</subscription><stats><rx>12</rx></stats></client></client></show>",
            )
            .build();

        let decoder = ReplyDecoder::new(&poller, &schema, vec![EncodingKind::Json], "soltr/7_1");
        let mut records = Vec::new();
        decoder.decode(xml.as_bytes(), &mut records).unwrap();
        let value = json(&records[0]);
        assert_eq!(value["subscription"], json!(["a/b", "c/d"]));
        assert_eq!(value["stats"]["rx"], json!(12));
    }
}
