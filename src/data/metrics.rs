use emit::{Filter as _, Props as _};

use crate::{
    data::{
        collect_attributes, stream_record_value, unix_millis, AttributeValue, Attributes, Common,
        CommonAttributes, EncodedPayload, Request,
    },
    delta::{EmissionRecord, MetricSnapshot, MetricValue, Temporality},
    Error,
};

/**
Turns `emit` metric events into [`MetricSnapshot`]s.

This is the only place the shape of a metric value is inspected. Values that aren't a number or a count and sum pair are rejected here, so nothing downstream needs to probe them again.
*/
#[derive(Default)]
pub(crate) struct MetricsEventEncoder;

/**
Why a metric event couldn't be converted into a snapshot.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejected {
    NotAMetric,
    UnsupportedValue,
}

impl MetricsEventEncoder {
    pub fn encode_event(
        &self,
        evt: &emit::event::Event<impl emit::props::Props>,
        now: impl FnOnce() -> Option<emit::Timestamp>,
    ) -> Result<MetricSnapshot, Rejected> {
        if !emit::kind::is_metric_filter().matches(evt) {
            return Err(Rejected::NotAMetric);
        }

        let Some(metric_value) = evt.props().get(emit::well_known::KEY_METRIC_VALUE) else {
            return Err(Rejected::NotAMetric);
        };

        let shape = ValueShape::of(metric_value).ok_or(Rejected::UnsupportedValue)?;

        let cumulative = match evt
            .props()
            .get(emit::well_known::KEY_METRIC_AGG)
            .and_then(|agg| agg.to_cow_str())
            .as_deref()
        {
            Some(emit::well_known::METRIC_AGG_COUNT) | Some(emit::well_known::METRIC_AGG_SUM) => {
                true
            }
            _ => false,
        };

        let value = match shape {
            ValueShape::Summary {
                count,
                sum,
                min,
                max,
            } => MetricValue::Summary {
                count,
                sum,
                min,
                max,
            },
            ValueShape::Number(value) if cumulative => MetricValue::Counter(value),
            ValueShape::Number(value) => MetricValue::Gauge(value),
        };

        let (timestamp_ms, temporality) = match evt.extent() {
            Some(extent) => match extent.as_range() {
                Some(range) => {
                    let start = unix_millis(range.start);
                    let end = unix_millis(range.end);

                    (
                        end,
                        Temporality::Delta {
                            interval_ms: end.saturating_sub(start),
                        },
                    )
                }
                None => (unix_millis(*extent.as_point()), Temporality::Cumulative),
            },
            None => (
                now().map(unix_millis).unwrap_or_default(),
                Temporality::Cumulative,
            ),
        };

        let name = match evt.props().get(emit::well_known::KEY_METRIC_NAME) {
            Some(name) => name.to_string(),
            None => evt.msg().to_string(),
        };

        let mut tags = collect_attributes(evt.props());

        if let Some(unit) = evt.props().get(emit::well_known::KEY_METRIC_UNIT) {
            tags.insert("unit".into(), AttributeValue::String(unit.to_string()));
        }

        Ok(MetricSnapshot {
            name,
            tags,
            value,
            temporality,
            timestamp_ms,
        })
    }
}

/**
The recognized shapes of a metric value.
*/
#[derive(Debug, Clone, Copy, PartialEq)]
enum ValueShape {
    Number(f64),
    Summary {
        count: f64,
        sum: f64,
        min: Option<f64>,
        max: Option<f64>,
    },
}

impl ValueShape {
    fn of(value: emit::Value) -> Option<Self> {
        use sval::Value as _;

        #[derive(Default)]
        struct Extract {
            depth: usize,
            number: Option<f64>,
            key: Option<String>,
            field: Option<Field>,
            count: Option<f64>,
            sum: Option<f64>,
            min: Option<f64>,
            max: Option<f64>,
        }

        #[derive(Clone, Copy)]
        enum Field {
            Count,
            Sum,
            Min,
            Max,
            Other,
        }

        impl Field {
            fn of(label: &str) -> Self {
                match label {
                    "count" => Field::Count,
                    "sum" => Field::Sum,
                    "min" => Field::Min,
                    "max" => Field::Max,
                    _ => Field::Other,
                }
            }
        }

        impl Extract {
            fn number(&mut self, value: f64) -> sval::Result {
                match self.depth {
                    0 => {
                        self.number = Some(value);

                        Ok(())
                    }
                    1 => {
                        match self.field {
                            Some(Field::Count) => self.count = Some(value),
                            Some(Field::Sum) => self.sum = Some(value),
                            Some(Field::Min) => self.min = Some(value),
                            Some(Field::Max) => self.max = Some(value),
                            Some(Field::Other) => (),
                            None => return sval::error(),
                        }

                        Ok(())
                    }
                    _ => sval::error(),
                }
            }

            fn begin_entries(&mut self) -> sval::Result {
                if self.depth > 0 {
                    return sval::error();
                }

                self.depth += 1;

                Ok(())
            }

            fn end_entries(&mut self) -> sval::Result {
                self.depth -= 1;

                Ok(())
            }
        }

        impl<'sval> sval::Stream<'sval> for Extract {
            fn null(&mut self) -> sval::Result {
                // Missing min or max values are fine
                match (self.depth, self.field) {
                    (1, Some(Field::Min | Field::Max | Field::Other)) => Ok(()),
                    _ => sval::error(),
                }
            }

            fn bool(&mut self, _: bool) -> sval::Result {
                match (self.depth, self.field) {
                    (1, Some(Field::Other)) => Ok(()),
                    _ => sval::error(),
                }
            }

            fn text_begin(&mut self, _: Option<usize>) -> sval::Result {
                match (self.depth, &self.key, self.field) {
                    (1, Some(_), None) => Ok(()),
                    (1, None, Some(Field::Other)) => Ok(()),
                    _ => sval::error(),
                }
            }

            fn text_fragment_computed(&mut self, fragment: &str) -> sval::Result {
                if let Some(ref mut key) = self.key {
                    key.push_str(fragment);
                }

                Ok(())
            }

            fn text_end(&mut self) -> sval::Result {
                Ok(())
            }

            fn i64(&mut self, value: i64) -> sval::Result {
                self.number(value as f64)
            }

            fn u64(&mut self, value: u64) -> sval::Result {
                self.number(value as f64)
            }

            fn f64(&mut self, value: f64) -> sval::Result {
                self.number(value)
            }

            fn map_begin(&mut self, _: Option<usize>) -> sval::Result {
                self.begin_entries()
            }

            fn map_key_begin(&mut self) -> sval::Result {
                self.key = Some(String::new());

                Ok(())
            }

            fn map_key_end(&mut self) -> sval::Result {
                self.field = self.key.take().map(|key| Field::of(&key));

                Ok(())
            }

            fn map_value_begin(&mut self) -> sval::Result {
                Ok(())
            }

            fn map_value_end(&mut self) -> sval::Result {
                self.field = None;

                Ok(())
            }

            fn map_end(&mut self) -> sval::Result {
                self.end_entries()
            }

            fn record_begin(
                &mut self,
                _: Option<&sval::Tag>,
                _: Option<&sval::Label>,
                _: Option<&sval::Index>,
                _: Option<usize>,
            ) -> sval::Result {
                self.begin_entries()
            }

            fn record_value_begin(
                &mut self,
                _: Option<&sval::Tag>,
                label: &sval::Label,
            ) -> sval::Result {
                self.field = Some(Field::of(label.as_str()));

                Ok(())
            }

            fn record_value_end(&mut self, _: Option<&sval::Tag>, _: &sval::Label) -> sval::Result {
                self.field = None;

                Ok(())
            }

            fn record_end(
                &mut self,
                _: Option<&sval::Tag>,
                _: Option<&sval::Label>,
                _: Option<&sval::Index>,
            ) -> sval::Result {
                self.end_entries()
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

        let mut extract = Extract::default();
        value.stream(&mut extract).ok()?;

        let finite = |v: Option<f64>| v.filter(|v| v.is_finite());

        if let Some(number) = extract.number {
            return finite(Some(number)).map(ValueShape::Number);
        }

        match (finite(extract.count), finite(extract.sum)) {
            (Some(count), Some(sum)) => Some(ValueShape::Summary {
                count,
                sum,
                min: finite(extract.min),
                max: finite(extract.max),
            }),
            _ => None,
        }
    }
}

/**
Encodes processed metric records into a Metric API request.
*/
pub(crate) struct MetricsRequestEncoder {
    pub attributes: CommonAttributes,
    pub interval_ms: u64,
}

impl MetricsRequestEncoder {
    pub fn encode_request(
        &self,
        timestamp_ms: Option<u64>,
        records: &[EmissionRecord],
    ) -> Result<EncodedPayload, Error> {
        let records = records.iter().map(MetricRecord).collect::<Vec<_>>();

        EncodedPayload::encode(Request {
            common: Common {
                timestamp_ms,
                interval_ms: Some(self.interval_ms),
                attributes: &self.attributes,
            },
            items_label: "metrics",
            items: &records,
        })
    }
}

struct MetricRecord<'a>(&'a EmissionRecord);

impl<'a> sval::Value for MetricRecord<'a> {
    fn stream<'sval, S: sval::Stream<'sval> + ?Sized>(&'sval self, stream: &mut S) -> sval::Result {
        let record = self.0;

        stream.record_begin(None, None, None, None)?;

        stream_record_value(stream, "name", &*record.name)?;

        match record.value {
            MetricValue::Gauge(value) => {
                stream_record_value(stream, "type", "gauge")?;
                stream_record_value(stream, "value", &value)?;
            }
            MetricValue::Counter(value) => {
                stream_record_value(stream, "type", "count")?;
                stream_record_value(stream, "value", &value)?;
            }
            MetricValue::Summary {
                count,
                sum,
                min,
                max,
            } => {
                stream_record_value(stream, "type", "summary")?;
                stream_record_value(
                    stream,
                    "value",
                    &SummaryValue {
                        count,
                        sum,
                        min,
                        max,
                    },
                )?;
            }
        }

        stream_record_value(stream, "timestamp", &record.timestamp_ms)?;

        if let Some(interval_ms) = record.interval_ms {
            stream_record_value(stream, "interval.ms", &interval_ms)?;
        }

        stream_record_value(stream, "attributes", &Attributes(&record.tags))?;

        stream.record_end(None, None, None)
    }
}

struct SummaryValue {
    count: f64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl sval::Value for SummaryValue {
    fn stream<'sval, S: sval::Stream<'sval> + ?Sized>(&'sval self, stream: &mut S) -> sval::Result {
        stream.record_begin(None, None, None, None)?;

        stream_record_value(stream, "count", &self.count)?;
        stream_record_value(stream, "sum", &self.sum)?;

        if let Some(min) = self.min {
            stream_record_value(stream, "min", &min)?;
        }

        if let Some(max) = self.max {
            stream_record_value(stream, "max", &max)?;
        }

        stream.record_end(None, None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use crate::{
        data::tests::{decode, ts},
        delta::DeltaTracker,
        Summary,
    };

    fn encode(evt: emit::Event<impl emit::Props>) -> Result<MetricSnapshot, Rejected> {
        MetricsEventEncoder.encode_event(&evt, || Some(ts(42)))
    }

    #[test]
    fn encode_count_as_cumulative_counter() {
        let snapshot = encode(emit::evt!(
            extent: ts(1000),
            "{metric_agg} of {metric_name} is {metric_value}",
            evt_kind: "metric",
            metric_name: "test",
            metric_agg: "count",
            metric_value: 43,
            route: "/",
        ))
        .unwrap();

        assert_eq!("test", snapshot.name);
        assert_eq!(MetricValue::Counter(43.0), snapshot.value);
        assert_eq!(Temporality::Cumulative, snapshot.temporality);
        assert_eq!(1000, snapshot.timestamp_ms);
        assert_eq!(1, snapshot.tags.len());
        assert_eq!(Some(&AttributeValue::from("/")), snapshot.tags.get("route"));
    }

    #[test]
    fn encode_distribution_keeps_identity_stable() {
        let first = encode(emit::evt!(
            extent: ts(1000),
            "{metric_agg} of {metric_name} is {metric_value}",
            evt_kind: "metric",
            metric_name: "latency",
            metric_agg: "count",
            metric_value: 3,
            #[emit::as_sval]
            dist_exp_buckets: [(1.0f64, 3u64)],
            dist_exp_scale: 2,
        ))
        .unwrap();

        let second = encode(emit::evt!(
            extent: ts(2000),
            "{metric_agg} of {metric_name} is {metric_value}",
            evt_kind: "metric",
            metric_name: "latency",
            metric_agg: "count",
            metric_value: 5,
            #[emit::as_sval]
            dist_exp_buckets: [(1.0f64, 4u64), (2.0f64, 1u64)],
            dist_exp_scale: 2,
        ))
        .unwrap();

        assert!(first.tags.is_empty());
        assert_eq!(first.tags, second.tags);

        let mut tracker = DeltaTracker::new();

        let values = tracker
            .process(vec![first, second])
            .into_iter()
            .map(|record| record.value)
            .collect::<Vec<_>>();

        assert_eq!(
            vec![MetricValue::Counter(3.0), MetricValue::Counter(2.0)],
            values
        );
        assert_eq!(1, tracker.tracked());
    }

    #[test]
    fn encode_sum_as_counter() {
        let snapshot = encode(emit::evt!(
            "{metric_agg} of {metric_name} is {metric_value}",
            evt_kind: "metric",
            metric_name: "test",
            metric_agg: "sum",
            metric_value: 43.1,
        ))
        .unwrap();

        assert_eq!(MetricValue::Counter(43.1), snapshot.value);
    }

    #[test]
    fn encode_last_as_gauge() {
        for agg in ["last", "min", "max", "something_else"] {
            let snapshot = encode(emit::evt!(
                "{metric_agg} of {metric_name} is {metric_value}",
                evt_kind: "metric",
                metric_name: "test",
                metric_agg: agg,
                metric_value: 43,
            ))
            .unwrap();

            assert_eq!(MetricValue::Gauge(43.0), snapshot.value, "{agg}");
        }
    }

    #[test]
    fn encode_range_extent_as_delta() {
        let snapshot = encode(emit::evt!(
            extent: ts(1000)..ts(6000),
            "{metric_agg} of {metric_name} is {metric_value}",
            evt_kind: "metric",
            metric_name: "test",
            metric_agg: "count",
            metric_value: 4,
        ))
        .unwrap();

        assert_eq!(MetricValue::Counter(4.0), snapshot.value);
        assert_eq!(Temporality::Delta { interval_ms: 5000 }, snapshot.temporality);
        assert_eq!(6000, snapshot.timestamp_ms);
    }

    #[test]
    fn encode_missing_extent_uses_now() {
        let snapshot = encode(emit::evt!(
            "{metric_agg} of {metric_name} is {metric_value}",
            evt_kind: "metric",
            metric_name: "test",
            metric_agg: "last",
            metric_value: 1,
        ))
        .unwrap();

        assert_eq!(42, snapshot.timestamp_ms);
    }

    #[test]
    fn encode_summary_struct() {
        let summary = Summary::new(3, 9.0).with_min(1.0).with_max(5.0);

        let snapshot = encode(emit::evt!(
            "{metric_agg} of {metric_name} is {metric_value}",
            evt_kind: "metric",
            metric_name: "test",
            metric_agg: "count",
            #[emit::as_sval]
            metric_value: summary,
        ))
        .unwrap();

        assert_eq!(
            MetricValue::Summary {
                count: 3.0,
                sum: 9.0,
                min: Some(1.0),
                max: Some(5.0),
            },
            snapshot.value
        );
    }

    #[test]
    fn encode_summary_map() {
        let mut summary = BTreeMap::new();
        summary.insert("count", 2.0);
        summary.insert("sum", 4.0);

        // A summary shape wins over the aggregation
        let snapshot = encode(emit::evt!(
            "{metric_agg} of {metric_name} is {metric_value}",
            evt_kind: "metric",
            metric_name: "test",
            metric_agg: "last",
            #[emit::as_sval]
            metric_value: summary,
        ))
        .unwrap();

        assert_eq!(
            MetricValue::Summary {
                count: 2.0,
                sum: 4.0,
                min: None,
                max: None,
            },
            snapshot.value
        );
    }

    #[test]
    fn encode_unit_as_tag() {
        let snapshot = encode(emit::evt!(
            "{metric_agg} of {metric_name} is {metric_value}",
            evt_kind: "metric",
            metric_name: "test",
            metric_agg: "last",
            metric_unit: "ms",
            metric_value: 1,
        ))
        .unwrap();

        assert_eq!(Some(&AttributeValue::from("ms")), snapshot.tags.get("unit"));
    }

    #[test]
    fn reject_unsupported_values() {
        let mut partial = BTreeMap::new();
        partial.insert("count", 2.0);

        for rejected in [
            encode(emit::evt!(
                "{metric_agg} of {metric_name} is {metric_value}",
                evt_kind: "metric",
                metric_name: "test",
                metric_agg: "count",
                metric_value: "not a number",
            )),
            encode(emit::evt!(
                "{metric_agg} of {metric_name} is {metric_value}",
                evt_kind: "metric",
                metric_name: "test",
                metric_agg: "count",
                metric_value: f64::NAN,
            )),
            encode(emit::evt!(
                "{metric_agg} of {metric_name} is {metric_value}",
                evt_kind: "metric",
                metric_name: "test",
                metric_agg: "count",
                #[emit::as_sval]
                metric_value: [1, 2, 3],
            )),
            encode(emit::evt!(
                "{metric_agg} of {metric_name} is {metric_value}",
                evt_kind: "metric",
                metric_name: "test",
                metric_agg: "count",
                #[emit::as_sval]
                metric_value: partial,
            )),
        ] {
            assert_eq!(Err(Rejected::UnsupportedValue), rejected);
        }
    }

    #[test]
    fn reject_non_metrics() {
        assert_eq!(
            Err(Rejected::NotAMetric),
            encode(emit::evt!("not a metric {x}", x: 1))
        );
    }

    #[test]
    fn encode_request_records() {
        let encoder = MetricsRequestEncoder {
            attributes: CommonAttributes::from([("service.name".to_owned(), "svc".into())]),
            interval_ms: 5000,
        };

        let records = [
            EmissionRecord {
                name: "a".into(),
                tags: BTreeMap::from([("route".to_owned(), "/".into())]),
                value: MetricValue::Counter(3.0),
                timestamp_ms: 2000,
                interval_ms: Some(1000),
            },
            EmissionRecord {
                name: "b".into(),
                tags: BTreeMap::new(),
                value: MetricValue::Gauge(42.0),
                timestamp_ms: 2000,
                interval_ms: None,
            },
            EmissionRecord {
                name: "c".into(),
                tags: BTreeMap::new(),
                value: MetricValue::Summary {
                    count: 1.0,
                    sum: 5.0,
                    min: None,
                    max: Some(5.0),
                },
                timestamp_ms: 2000,
                interval_ms: None,
            },
        ];

        let payload = encoder.encode_request(Some(2000), &records).unwrap();

        assert_eq!(
            serde_json::json!([{
                "common": {
                    "timestamp": 2000,
                    "interval.ms": 5000,
                    "attributes": { "service.name": "svc" }
                },
                "metrics": [
                    {
                        "name": "a",
                        "type": "count",
                        "value": 3.0,
                        "timestamp": 2000,
                        "interval.ms": 1000,
                        "attributes": { "route": "/" }
                    },
                    {
                        "name": "b",
                        "type": "gauge",
                        "value": 42.0,
                        "timestamp": 2000,
                        "attributes": {}
                    },
                    {
                        "name": "c",
                        "type": "summary",
                        "value": { "count": 1.0, "sum": 5.0, "max": 5.0 },
                        "timestamp": 2000,
                        "attributes": {}
                    }
                ]
            }]),
            decode(&payload)
        );
    }
}
