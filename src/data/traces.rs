use std::collections::BTreeMap;

use emit::{
    well_known::{KEY_ERR, KEY_SPAN_ID, KEY_SPAN_NAME, KEY_SPAN_PARENT, KEY_TRACE_ID},
    Filter, Props,
};

use crate::{
    data::{
        collect_attributes, stream_map_entry, stream_record_value, unix_millis, AttributeValue,
        Common, CommonAttributes, EncodedPayload, Request,
    },
    Error,
};

/**
A completed span in New Relic's data model.
*/
#[derive(Debug, Clone)]
pub(crate) struct SpanRecord {
    pub id: emit::span::SpanId,
    pub trace_id: emit::span::TraceId,
    pub parent_id: Option<emit::span::SpanId>,
    pub name: String,
    pub timestamp_ms: u64,
    pub duration_ms: f64,
    pub attributes: BTreeMap<String, AttributeValue>,
}

#[derive(Default)]
pub(crate) struct TracesEventEncoder;

impl TracesEventEncoder {
    pub fn encode_event(
        &self,
        evt: &emit::event::Event<impl emit::props::Props>,
    ) -> Option<SpanRecord> {
        if !emit::kind::is_span_filter().matches(evt) {
            return None;
        }

        let range = evt.extent().and_then(|extent| extent.as_range())?;

        let start = range.start.to_unix();
        let end = range.end.to_unix();

        let props = evt.props();

        let id: emit::span::SpanId = props.pull(KEY_SPAN_ID)?;
        let trace_id: emit::span::TraceId = props.pull(KEY_TRACE_ID)?;
        let parent_id: Option<emit::span::SpanId> = props.pull(KEY_SPAN_PARENT);

        let name = match props.get(KEY_SPAN_NAME) {
            Some(name) => name.to_string(),
            None => evt.msg().to_string(),
        };

        let mut attributes = collect_attributes(props);

        if let Some(err) = props.get(KEY_ERR) {
            attributes.insert(
                "error.message".into(),
                AttributeValue::String(err.to_string()),
            );
        }

        Some(SpanRecord {
            id,
            trace_id,
            parent_id,
            name,
            timestamp_ms: unix_millis(range.start),
            duration_ms: end.saturating_sub(start).as_nanos() as f64 / 1_000_000.0,
            attributes,
        })
    }
}

/**
Encodes span records into Trace API requests.
*/
pub(crate) struct TracesRequestEncoder {
    pub attributes: CommonAttributes,
    pub max_batch_size: usize,
}

impl TracesRequestEncoder {
    /**
    Encode spans into one request per `max_batch_size` spans.
    */
    pub fn encode_requests(&self, spans: &[SpanRecord]) -> Result<Vec<EncodedPayload>, Error> {
        spans
            .chunks(self.max_batch_size.max(1))
            .map(|chunk| {
                let chunk = chunk.iter().map(EncodedSpan).collect::<Vec<_>>();

                EncodedPayload::encode(Request {
                    common: Common {
                        timestamp_ms: None,
                        interval_ms: None,
                        attributes: &self.attributes,
                    },
                    items_label: "spans",
                    items: &chunk,
                })
            })
            .collect()
    }
}

struct EncodedSpan<'a>(&'a SpanRecord);

impl<'a> sval::Value for EncodedSpan<'a> {
    fn stream<'sval, S: sval::Stream<'sval> + ?Sized>(&'sval self, stream: &mut S) -> sval::Result {
        let span = self.0;

        stream.record_begin(None, None, None, None)?;

        stream_record_value(stream, "id", &sval::Display::new(&span.id))?;
        stream_record_value(stream, "trace.id", &sval::Display::new(&span.trace_id))?;
        stream_record_value(stream, "timestamp", &span.timestamp_ms)?;
        stream_record_value(stream, "attributes", &SpanAttributes(span))?;

        stream.record_end(None, None, None)
    }
}

struct SpanAttributes<'a>(&'a SpanRecord);

impl<'a> sval::Value for SpanAttributes<'a> {
    fn stream<'sval, S: sval::Stream<'sval> + ?Sized>(&'sval self, stream: &mut S) -> sval::Result {
        let span = self.0;

        stream.map_begin(None)?;

        stream_map_entry(stream, "name", &*span.name)?;
        stream_map_entry(stream, "duration.ms", &span.duration_ms)?;

        if let Some(ref parent_id) = span.parent_id {
            stream_map_entry(stream, "parent.id", &sval::Display::new(parent_id))?;
        }

        for (k, v) in &span.attributes {
            match &**k {
                "name" | "duration.ms" | "parent.id" => continue,
                _ => stream_map_entry(stream, k, v)?,
            }
        }

        stream.map_end()
    }
}
