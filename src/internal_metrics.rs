use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{data::traces::SpanRecord, delta::MetricSnapshot};

macro_rules! metrics {
    (
        $pub_container:ty {
            $field:ident: $internal_container:ident {
                $(
                    $(#[$meta:meta])*
                    $metric:ident: $ty:ident -> $pub_ty:ident,
                )*
            }
        }
    ) => {
        #[derive(Default)]
        pub(crate) struct $internal_container {
            $(
                $(#[$meta])*
                pub(crate) $metric: $ty,
            )*
        }

        impl $internal_container {
            pub fn sample(&self) -> impl Iterator<Item = emit::metric::Metric<'static, emit::empty::Empty>> + 'static {
                let $internal_container { $($metric),* } = self;

                [$(
                    emit::metric::Metric::new(
                        emit::pkg!(),
                        stringify!($metric),
                        <$ty>::AGG,
                        emit::empty::Empty,
                        $metric.sample(),
                        emit::empty::Empty,
                    ),
                )*]
                .into_iter()
            }
        }

        impl $pub_container {
            $(
                $(#[$meta])*
                pub fn $metric(&self) -> $pub_ty {
                    self.$field.$metric.sample()
                }
            )*
        }
    };
}

#[derive(Default)]
pub(crate) struct Counter(AtomicUsize);

impl Counter {
    const AGG: &'static str = emit::well_known::METRIC_AGG_COUNT;

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sample(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

metrics!(
    NewRelicMetrics {
        metrics: InternalMetrics {
            /**
            An event was discarded because it wasn't a metric or span, or the emitter was stopped.
            */
            event_discarded: Counter -> usize,
            /**
            A metric sample was discarded because its value wasn't a number or a summary.
            */
            metric_value_unsupported: Counter -> usize,
            /**
            A span was discarded because it didn't have a time range, span id, or trace id.
            */
            span_invalid: Counter -> usize,
            /**
            A batch of metrics was accepted by the Metric API.
            */
            metrics_batch_sent: Counter -> usize,
            /**
            A batch of metrics failed to encode, failed to send, or was rejected by the Metric API.

            Failed batches are not retried.
            */
            metrics_batch_failed: Counter -> usize,
            /**
            A batch of metrics produced no records, so no request was made.
            */
            metrics_batch_suppressed: Counter -> usize,
            /**
            A batch of spans was accepted by the Trace API.
            */
            traces_batch_sent: Counter -> usize,
            /**
            A batch of spans failed to encode, failed to send, or was rejected by the Trace API.
            */
            traces_batch_failed: Counter -> usize,
            /**
            A new connection was established to a New Relic endpoint.
            */
            transport_conn_established: Counter -> usize,
            /**
            Attempting to connect to a New Relic endpoint failed.
            */
            transport_conn_failed: Counter -> usize,
            /**
            A TLS handshake completed.
            */
            transport_conn_tls_handshake: Counter -> usize,
            /**
            A TLS handshake failed.
            */
            transport_conn_tls_failed: Counter -> usize,
            /**
            An HTTP request was sent.
            */
            transport_request_sent: Counter -> usize,
            /**
            Attempting to send an HTTP request failed.
            */
            transport_request_failed: Counter -> usize,
            /**
            Compressing a request body failed.
            */
            transport_request_compress_failed: Counter -> usize,
        }
    }
);

/**
Metrics produced by a [`crate::NewRelic`] emitter.

You can enumerate the metrics using the [`emit::metric::Source`] implementation. See [`emit::metric`] for details.
*/
pub struct NewRelicMetrics {
    pub(crate) metrics_channel_metrics: Option<emit_batcher::ChannelMetrics<Vec<MetricSnapshot>>>,
    pub(crate) traces_channel_metrics: Option<emit_batcher::ChannelMetrics<Vec<SpanRecord>>>,
    pub(crate) metrics: Arc<InternalMetrics>,
}

impl emit::metric::Source for NewRelicMetrics {
    fn sample_metrics<S: emit::metric::sampler::Sampler>(&self, sampler: S) {
        self.metrics_channel_metrics
            .sample_metrics(emit::metric::sampler::from_fn(|metric| {
                sampler.metric(metric.by_ref().with_mdl(emit::path!("emit_newrelic::metrics")));
            }));

        self.traces_channel_metrics
            .sample_metrics(emit::metric::sampler::from_fn(|metric| {
                sampler.metric(metric.by_ref().with_mdl(emit::path!("emit_newrelic::traces")));
            }));

        for metric in self.metrics.sample() {
            sampler.metric(metric);
        }
    }
}
