/*!
Conversion of `emit` events into New Relic's JSON data model.

This module is split by signal: `metrics` turns metric events into snapshots and encodes delta-tracked records, `traces` turns span events into span records. Both produce payloads for the Metric and Trace APIs' `newrelic` JSON format.
*/

use std::{
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
};

use crate::Error;

pub(crate) mod metrics;
pub(crate) mod traces;

/**
The attributes shared by every item in a request.
*/
pub(crate) type CommonAttributes = BTreeMap<String, AttributeValue>;

/**
An attribute value in one of the types New Relic accepts.

Floats are compared and hashed by their bit pattern so attribute sets can be used to identify metric series.
*/
#[derive(Debug, Clone)]
pub(crate) enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AttributeValue::String(a), AttributeValue::String(b)) => a == b,
            (AttributeValue::Int(a), AttributeValue::Int(b)) => a == b,
            (AttributeValue::Float(a), AttributeValue::Float(b)) => a.to_bits() == b.to_bits(),
            (AttributeValue::Bool(a), AttributeValue::Bool(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for AttributeValue {}

impl Hash for AttributeValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            AttributeValue::String(v) => {
                state.write_u8(0);
                v.hash(state);
            }
            AttributeValue::Int(v) => {
                state.write_u8(1);
                v.hash(state);
            }
            AttributeValue::Float(v) => {
                state.write_u8(2);
                v.to_bits().hash(state);
            }
            AttributeValue::Bool(v) => {
                state.write_u8(3);
                v.hash(state);
            }
        }
    }
}

impl<'a> From<&'a str> for AttributeValue {
    fn from(value: &'a str) -> Self {
        AttributeValue::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(v) => fmt::Display::fmt(v, f),
            AttributeValue::Int(v) => fmt::Display::fmt(v, f),
            AttributeValue::Float(v) => fmt::Display::fmt(v, f),
            AttributeValue::Bool(v) => fmt::Display::fmt(v, f),
        }
    }
}

impl AttributeValue {
    /**
    Convert an arbitrary `emit` value into an attribute.

    Strings, integers, floats, and booleans are kept as-is. Anything else is formatted into a string.
    */
    pub fn from_value(value: emit::Value) -> Self {
        use sval::Value as _;

        struct Extract {
            value: Option<AttributeValue>,
            text: Option<String>,
        }

        impl<'sval> sval::Stream<'sval> for Extract {
            fn null(&mut self) -> sval::Result {
                sval::error()
            }

            fn bool(&mut self, value: bool) -> sval::Result {
                self.value = Some(AttributeValue::Bool(value));

                Ok(())
            }

            fn text_begin(&mut self, num_bytes: Option<usize>) -> sval::Result {
                self.text = Some(String::with_capacity(num_bytes.unwrap_or(0)));

                Ok(())
            }

            fn text_fragment_computed(&mut self, fragment: &str) -> sval::Result {
                self.text.as_mut().ok_or_else(sval::Error::new)?.push_str(fragment);

                Ok(())
            }

            fn text_end(&mut self) -> sval::Result {
                self.value = self.text.take().map(AttributeValue::String);

                Ok(())
            }

            fn i64(&mut self, value: i64) -> sval::Result {
                self.value = Some(AttributeValue::Int(value));

                Ok(())
            }

            fn u64(&mut self, value: u64) -> sval::Result {
                self.value = Some(match i64::try_from(value) {
                    Ok(value) => AttributeValue::Int(value),
                    Err(_) => AttributeValue::Float(value as f64),
                });

                Ok(())
            }

            fn f64(&mut self, value: f64) -> sval::Result {
                self.value = Some(AttributeValue::Float(value));

                Ok(())
            }

            fn seq_begin(&mut self, _: Option<usize>) -> sval::Result {
                sval::error()
            }

            fn seq_value_begin(&mut self) -> sval::Result {
                sval::error()
            }

            fn seq_value_end(&mut self) -> sval::Result {
                sval::error()
            }

            fn seq_end(&mut self) -> sval::Result {
                sval::error()
            }
        }

        let mut extract = Extract {
            value: None,
            text: None,
        };

        match value.stream(&mut extract) {
            Ok(()) => extract
                .value
                .unwrap_or_else(|| AttributeValue::String(value.to_string())),
            Err(_) => AttributeValue::String(value.to_string()),
        }
    }
}

impl sval::Value for AttributeValue {
    fn stream<'sval, S: sval::Stream<'sval> + ?Sized>(&'sval self, stream: &mut S) -> sval::Result {
        match self {
            AttributeValue::String(v) => stream.value(&**v),
            AttributeValue::Int(v) => stream.i64(*v),
            AttributeValue::Float(v) => stream.f64(*v),
            AttributeValue::Bool(v) => stream.bool(*v),
        }
    }
}

/**
A summary of a set of observations, in the shape recognized as a New Relic summary metric.

Attach a `Summary` as the value of a metric sample to report it as a summary:

```
let summary = emit_newrelic::Summary::new(3, 9.0).with_min(1.0).with_max(5.0);

emit::emit!(
    "{metric_agg} of {metric_name} is {metric_value}",
    evt_kind: "metric",
    metric_name: "request_duration_ms",
    metric_agg: "count",
    #[emit::as_sval]
    metric_value: summary,
);
```

The `count` and `sum` are treated as running totals unless the sample covers a time range. Any map or record with numeric `count` and `sum` entries is also recognized as a summary.
*/
#[derive(sval_derive::Value, Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    /**
    The number of observations.
    */
    pub count: u64,
    /**
    The total of all observations.
    */
    pub sum: f64,
    /**
    The smallest observation, if known.
    */
    pub min: Option<f64>,
    /**
    The largest observation, if known.
    */
    pub max: Option<f64>,
}

impl Summary {
    /**
    Create a summary from a count and sum.
    */
    pub fn new(count: u64, sum: f64) -> Self {
        Summary {
            count,
            sum,
            min: None,
            max: None,
        }
    }

    /**
    Set the smallest observation.
    */
    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /**
    Set the largest observation.
    */
    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }
}

/**
A JSON request body.
*/
#[derive(Debug, Clone)]
pub(crate) struct EncodedPayload(Vec<u8>);

impl EncodedPayload {
    pub fn encode(value: impl sval::Value) -> Result<Self, Error> {
        let mut buf = Vec::new();

        sval_json::stream_to_io_write(&mut buf, value)
            .map_err(|e| Error::new("failed to encode a JSON payload", e))?;

        Ok(EncodedPayload(buf))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/**
The `common` block shared by all items in a request.
*/
pub(crate) struct Common<'a> {
    pub timestamp_ms: Option<u64>,
    pub interval_ms: Option<u64>,
    pub attributes: &'a CommonAttributes,
}

impl<'a> sval::Value for Common<'a> {
    fn stream<'sval, S: sval::Stream<'sval> + ?Sized>(&'sval self, stream: &mut S) -> sval::Result {
        stream.record_begin(None, None, None, None)?;

        if let Some(timestamp_ms) = self.timestamp_ms {
            stream_record_value(stream, "timestamp", &timestamp_ms)?;
        }

        if let Some(interval_ms) = self.interval_ms {
            stream_record_value(stream, "interval.ms", &interval_ms)?;
        }

        stream_record_value(stream, "attributes", &Attributes(self.attributes))?;

        stream.record_end(None, None, None)
    }
}

pub(crate) struct Attributes<'a>(pub &'a BTreeMap<String, AttributeValue>);

impl<'a> sval::Value for Attributes<'a> {
    fn stream<'sval, S: sval::Stream<'sval> + ?Sized>(&'sval self, stream: &mut S) -> sval::Result {
        stream.map_begin(Some(self.0.len()))?;

        for (k, v) in self.0 {
            stream_map_entry(stream, k, v)?;
        }

        stream.map_end()
    }
}

/**
A request body: a single-element array holding the common block and the items.
*/
pub(crate) struct Request<'a, T> {
    pub common: Common<'a>,
    pub items_label: &'static str,
    pub items: &'a [T],
}

impl<'a, T: sval::Value> sval::Value for Request<'a, T> {
    fn stream<'sval, S: sval::Stream<'sval> + ?Sized>(&'sval self, stream: &mut S) -> sval::Result {
        stream.seq_begin(Some(1))?;
        stream.seq_value_begin()?;

        stream.record_begin(None, None, None, None)?;
        stream_record_value(stream, "common", &self.common)?;
        stream_record_value(stream, self.items_label, self.items)?;
        stream.record_end(None, None, None)?;

        stream.seq_value_end()?;
        stream.seq_end()
    }
}

pub(crate) fn stream_record_value<'sval, S: sval::Stream<'sval> + ?Sized>(
    stream: &mut S,
    label: &str,
    value: &(impl sval::Value + ?Sized),
) -> sval::Result {
    let label = sval::Label::new_computed(label);

    stream.record_value_begin(None, &label)?;
    stream.value_computed(value)?;
    stream.record_value_end(None, &label)
}

pub(crate) fn stream_map_entry<'sval, S: sval::Stream<'sval> + ?Sized>(
    stream: &mut S,
    key: &str,
    value: &(impl sval::Value + ?Sized),
) -> sval::Result {
    stream.map_key_begin()?;
    stream.value_computed(key)?;
    stream.map_key_end()?;

    stream.map_value_begin()?;
    stream.value_computed(value)?;
    stream.map_value_end()
}

/**
Whether a property is one of `emit`'s well-known keys that's represented by some other part of a New Relic record.

Distribution buckets change on every sample, so they're never attributes. A metric's identity would otherwise change each time it's sampled.
*/
pub(crate) fn is_well_known(key: &str) -> bool {
    use emit::well_known::*;

    matches!(
        key,
        KEY_EVT_KIND
            | KEY_METRIC_NAME
            | KEY_METRIC_AGG
            | KEY_METRIC_VALUE
            | KEY_METRIC_UNIT
            | KEY_DIST_BUCKET_SCALE
            | KEY_DIST_BUCKET_POINTS
            | KEY_SPAN_NAME
            | KEY_SPAN_KIND
            | KEY_SPAN_ID
            | KEY_SPAN_PARENT
            | KEY_TRACE_ID
            | KEY_ERR
            | KEY_LVL
            | KEY_MDL
            | KEY_MSG
            | KEY_TPL
            | KEY_TS
            | KEY_TS_START
    )
}

/**
Collect the properties of an event that aren't well-known into a set of attributes.

If a key appears more than once, the first value wins.
*/
pub(crate) fn collect_attributes(props: impl emit::Props) -> BTreeMap<String, AttributeValue> {
    use std::ops::ControlFlow;

    let mut attributes = BTreeMap::new();

    let _ = props.for_each(|k, v| {
        if !is_well_known(k.get()) {
            attributes
                .entry(k.get().to_owned())
                .or_insert_with(|| AttributeValue::from_value(v));
        }

        ControlFlow::Continue(())
    });

    attributes
}

pub(crate) fn unix_millis(ts: emit::Timestamp) -> u64 {
    ts.to_unix().as_millis() as u64
}
