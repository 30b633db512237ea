use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tracing::warn;

use super::{Container, ContainerContext, EncodingKind, Scalar, WirePayload};
use crate::schema::XsdType;

/// Raw markup for one or more records plus the optional SEMP envelope.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlFragment {
    pub preamble: String,
    pub records: Vec<String>,
    pub postamble: String,
}

impl XmlFragment {
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(
            self.preamble.len() + self.postamble.len() + self.records.iter().map(String::len).sum::<usize>(),
        );
        out.push_str(&self.preamble);
        for record in &self.records {
            out.push_str(record);
        }
        out.push_str(&self.postamble);
        out
    }
}

/// Markup writer over an in-memory buffer.
struct Markup {
    writer: Writer<Vec<u8>>,
}

impl Markup {
    fn new() -> Self {
        Self { writer: Writer::new(Vec::new()) }
    }

    fn emit(&mut self, event: Event<'_>) {
        if let Err(e) = self.writer.write_event(event) {
            warn!("Cannot write XML event: {}", e);
        }
    }

    fn open(&mut self, name: &str) {
        self.emit(Event::Start(BytesStart::new(name)));
    }

    fn close(&mut self, name: &str) {
        self.emit(Event::End(BytesEnd::new(name)));
    }

    fn leaf(&mut self, name: &str, text: &str) {
        self.open(name);
        self.emit(Event::Text(BytesText::new(text)));
        self.close(name);
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.writer.into_inner()).into_owned()
    }
}

/// Opening and closing envelope for the parents of `base_path`.
fn envelope(ctx: &ContainerContext) -> (String, String) {
    let segments: Vec<&str> = ctx.base_path.split('/').filter(|s| !s.is_empty()).collect();
    let parents = &segments[..segments.len().saturating_sub(1)];
    let mut pre = Markup::new();
    let mut post = Markup::new();
    for (i, name) in parents.iter().enumerate() {
        if i == 0 && *name == "rpc-reply" {
            let start = BytesStart::new(*name).with_attributes([("semp-version", ctx.semp_version.as_str())]);
            pre.emit(Event::Start(start));
        } else {
            pre.open(name);
        }
    }
    for (i, name) in parents.iter().enumerate().rev() {
        if i == 0 && *name == "rpc-reply" {
            post.emit(Event::Empty(BytesStart::new("execute-result").with_attributes([("code", "ok")])));
        }
        post.close(name);
    }
    (pre.into_string(), post.into_string())
}

/// Re-emits the record as markup, keeping leaf text as the reply sent it.
pub struct XmlContainer {
    enveloped: bool,
    base: String,
    preamble: String,
    postamble: String,
    body: Markup,
}

impl XmlContainer {
    pub fn new(ctx: &ContainerContext, enveloped: bool) -> Self {
        let (preamble, postamble) = if enveloped { envelope(ctx) } else { (String::new(), String::new()) };
        let base = ctx.base_element().to_string();
        let mut body = Markup::new();
        body.open(&base);
        Self { enveloped, base, preamble, postamble, body }
    }
}

impl Container for XmlContainer {
    fn kind(&self) -> EncodingKind {
        if self.enveloped { EncodingKind::XmlEnvelope } else { EncodingKind::Xml }
    }

    fn start_nested(&mut self, name: &str, _multiple: bool) {
        self.body.open(name);
    }

    fn close_nested(&mut self, name: &str) {
        self.body.close(name);
    }

    fn put(&mut self, name: &str, value: Scalar, _multiple: bool) {
        self.body.leaf(name, &value.to_text());
    }

    fn put_typed(&mut self, _xsd: XsdType, name: &str, raw: &str, _multiple: bool) {
        self.body.leaf(name, raw.trim());
    }

    fn finish(self: Box<Self>) -> WirePayload {
        let Self { base, preamble, postamble, mut body, .. } = *self;
        body.close(&base);
        WirePayload::Xml(XmlFragment { preamble, records: vec![body.into_string()], postamble })
    }
}
