/*!
Configuration and background processing for the New Relic emitter.

This module is a consumer of `data`, using it to turn incoming events into snapshots and span records. These are batched and exported on a background worker, which sends them to New Relic through the `http` module.
*/

use std::{
    future::Future,
    ops::ControlFlow,
    pin::Pin,
    sync::{Arc, Mutex, RwLock, Weak},
    thread,
    time::{Duration, Instant},
};

use emit::{Clock as _, Filter as _, Props as _};
use futures_util::{stream::FuturesUnordered, StreamExt};

use crate::{
    data::{
        metrics::{MetricsEventEncoder, MetricsRequestEncoder, Rejected},
        traces::{SpanRecord, TracesEventEncoder, TracesRequestEncoder},
        AttributeValue, CommonAttributes, EncodedPayload,
    },
    delta::{DeltaTracker, MetricSnapshot},
    internal_metrics::InternalMetrics,
    Error, NewRelicMetrics,
};

use self::http::HttpConnection;

mod http;

const DEFAULT_METRIC_HOST: &str = "metric-api.newrelic.com";
const DEFAULT_TRACE_HOST: &str = "trace-api.newrelic.com";
const DEFAULT_PORT: u16 = 443;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_BATCH_SIZE: usize = 600;
const DEFAULT_SERVICE_NAME: &str = "unknown_service";

const METRIC_API_PATH: &str = "/metric/v1";
const TRACE_API_PATH: &str = "/trace/v1";

const CHANNEL_CAPACITY: usize = 1024;

/**
An [`emit::Emitter`] that sends metrics and spans to New Relic.

Use [`crate::new`] to start a [`NewRelicBuilder`] for configuring a [`NewRelic`] instance.

See the crate root documentation for more details.
*/
pub struct NewRelic {
    inner: RwLock<Option<NewRelicInner>>,
    metrics: Arc<InternalMetrics>,
}

struct NewRelicInner {
    metrics_signal: Option<Arc<MetricsSignal>>,
    traces_signal: Option<TracesSignal>,
    metrics: Arc<InternalMetrics>,
    _handle: thread::JoinHandle<()>,
}

impl NewRelic {
    /**
    Start a builder for configuring a [`NewRelic`] instance.

    The [`NewRelicBuilder`] can be completed by calling [`NewRelicBuilder::spawn`].
    */
    pub fn builder(insert_key: impl Into<String>) -> NewRelicBuilder {
        NewRelicBuilder::new(insert_key)
    }

    /**
    Get an [`emit::metric::Source`] for instrumentation produced by a [`NewRelic`] instance.

    These metrics can be used to monitor the running health of your diagnostic pipeline.
    */
    pub fn metric_source(&self) -> NewRelicMetrics {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

        NewRelicMetrics {
            metrics_channel_metrics: inner
                .as_ref()
                .and_then(|inner| inner.metrics_signal.as_ref())
                .map(|signal| signal.sender.metric_source()),
            traces_channel_metrics: inner
                .as_ref()
                .and_then(|inner| inner.traces_signal.as_ref())
                .map(|signal| signal.sender.metric_source()),
            metrics: self.metrics.clone(),
        }
    }

    /**
    Stop the emitter.

    Any registered metric sources are sampled one last time, then all pending metrics and spans are flushed, waiting up to `timeout` for them to be sent. The background worker then shuts down and all delta state is discarded.

    Once stopped, events emitted are discarded and further calls to `stop` or [`emit::Emitter::blocking_flush`] return immediately. This method returns `false` if the final flush didn't complete within `timeout`.
    */
    pub fn stop(&self, timeout: Duration) -> bool {
        let Some(inner) = self
            .inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return true;
        };

        if let Some(ref signal) = inner.metrics_signal {
            signal.sample_sources();
        }

        let flushed = inner.blocking_flush(timeout);

        emit::debug!(rt: emit::runtime::internal(), "stopped New Relic emitter");

        drop(inner);

        flushed
    }
}

impl emit::Emitter for NewRelic {
    fn emit<E: emit::event::ToEvent>(&self, evt: E) {
        match *self.inner.read().unwrap_or_else(|e| e.into_inner()) {
            Some(ref inner) => inner.emit(evt),
            None => self.metrics.event_discarded.increment(),
        }
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        match *self.inner.read().unwrap_or_else(|e| e.into_inner()) {
            Some(ref inner) => inner.blocking_flush(timeout),
            None => true,
        }
    }
}

impl NewRelicInner {
    fn emit<E: emit::event::ToEvent>(&self, evt: E) {
        let evt = evt.to_event();

        if let Some(ref signal) = self.metrics_signal {
            if signal.try_send(&evt) {
                return;
            }
        }

        if let Some(ref signal) = self.traces_signal {
            if signal.try_send(&evt) {
                return;
            }
        }

        self.metrics.event_discarded.increment();
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        let start = Instant::now();

        if let Some(ref signal) = self.metrics_signal {
            if !emit_batcher::tokio::blocking_flush(
                &signal.sender,
                timeout.saturating_sub(start.elapsed()),
            ) {
                return false;
            }
        }

        if let Some(ref signal) = self.traces_signal {
            if !emit_batcher::tokio::blocking_flush(
                &signal.sender,
                timeout.saturating_sub(start.elapsed()),
            ) {
                return false;
            }
        }

        true
    }
}

/**
The producing side of the metrics signal.

Metric events, either emitted directly or sampled from registered sources, are converted into snapshots here and sent to the background worker.
*/
struct MetricsSignal {
    encoder: MetricsEventEncoder,
    sender: emit_batcher::Sender<Vec<MetricSnapshot>>,
    reporter: emit::metric::Reporter,
    metrics: Arc<InternalMetrics>,
}

impl MetricsSignal {
    fn try_send(&self, evt: &emit::Event<impl emit::Props>) -> bool {
        match self
            .encoder
            .encode_event(evt, || emit::platform::system_clock::SystemClock::new().now())
        {
            Ok(snapshot) => {
                self.sender.send(snapshot);

                true
            }
            Err(Rejected::UnsupportedValue) => {
                self.metrics.metric_value_unsupported.increment();

                let name = evt
                    .props()
                    .get(emit::well_known::KEY_METRIC_NAME)
                    .map(|name| name.to_string())
                    .unwrap_or_default();

                emit::warn!(
                    rt: emit::runtime::internal(),
                    "discarding metric {name} because its value isn't a number or summary",
                    name,
                );

                true
            }
            Err(Rejected::NotAMetric) => false,
        }
    }

    fn sample_sources(&self) {
        self.reporter.emit_metrics(self);
    }
}

impl emit::Emitter for MetricsSignal {
    fn emit<E: emit::event::ToEvent>(&self, evt: E) {
        if !self.try_send(&evt.to_event()) {
            self.metrics.event_discarded.increment();
        }
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        emit_batcher::tokio::blocking_flush(&self.sender, timeout)
    }
}

/**
The producing side of the traces signal.
*/
struct TracesSignal {
    encoder: TracesEventEncoder,
    sender: emit_batcher::Sender<Vec<SpanRecord>>,
    metrics: Arc<InternalMetrics>,
}

impl TracesSignal {
    fn try_send(&self, evt: &emit::Event<impl emit::Props>) -> bool {
        if !emit::kind::is_span_filter().matches(evt) {
            return false;
        }

        match self.encoder.encode_event(evt) {
            Some(span) => self.sender.send(span),
            None => {
                self.metrics.span_invalid.increment();

                emit::warn!(
                    rt: emit::runtime::internal(),
                    "discarding span {msg} because it's missing a time range, span id, or trace id",
                    msg: evt.msg().to_string(),
                );
            }
        }

        true
    }
}

/**
Periodically samples the metric sources registered on a [`MetricsSignal`].

The schedule ends once the signal has been dropped.
*/
struct MetricsSchedule {
    signal: Weak<MetricsSignal>,
    interval: Duration,
}

impl MetricsSchedule {
    async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            let Some(signal) = self.signal.upgrade() else {
                return;
            };

            signal.sample_sources();
        }
    }
}

/**
A client that can deliver an encoded payload to New Relic.
*/
pub(crate) trait BatchClient {
    fn send_batch(
        &self,
        payload: EncodedPayload,
    ) -> impl Future<Output = Result<BatchResponse, Error>> + Send;
}

/**
The outcome of a request that reached New Relic.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchResponse {
    status: u16,
}

impl BatchResponse {
    pub fn new(status: u16) -> Self {
        BatchResponse { status }
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }
}

#[emit::span(
    rt: emit::runtime::internal(),
    guard: span,
    "send New Relic {signal} batch of {batch_size} items",
)]
async fn send_payload(
    client: &impl BatchClient,
    signal: &'static str,
    batch_size: usize,
    payload: EncodedPayload,
) -> Result<(), Error> {
    match client.send_batch(payload).await {
        Ok(res) if res.ok() => {
            span.complete_with(|evt| {
                emit::debug!(
                    rt: emit::runtime::internal(),
                    evt,
                    "New Relic {signal} batch of {batch_size} items sent",
                    signal,
                    batch_size,
                )
            });

            Ok(())
        }
        Ok(res) => {
            let err = Error::msg(format_args!(
                "New Relic responded with status code {status}",
                status = res.status_code()
            ));

            span.complete_with(|evt| {
                emit::error!(
                    rt: emit::runtime::internal(),
                    evt,
                    "New Relic {signal} batch of {batch_size} items failed: {err}",
                    signal,
                    batch_size,
                    err,
                )
            });

            Err(err)
        }
        Err(err) => {
            span.complete_with(|evt| {
                emit::error!(
                    rt: emit::runtime::internal(),
                    evt,
                    "New Relic {signal} batch of {batch_size} items failed: {err}",
                    signal,
                    batch_size,
                    err,
                )
            });

            Err(err)
        }
    }
}

/**
Turns batches of metric snapshots into Metric API requests.

The delta state lives here. It's only ever updated under its lock, and it isn't rolled back if a request fails.
*/
pub(crate) struct MetricsExporter<C> {
    tracker: Mutex<DeltaTracker>,
    encoder: MetricsRequestEncoder,
    client: C,
    metrics: Arc<InternalMetrics>,
}

impl<C: BatchClient> MetricsExporter<C> {
    pub fn new(encoder: MetricsRequestEncoder, client: C, metrics: Arc<InternalMetrics>) -> Self {
        MetricsExporter {
            tracker: Mutex::new(DeltaTracker::new()),
            encoder,
            client,
            metrics,
        }
    }

    pub async fn export(&self, snapshots: Vec<MetricSnapshot>) {
        let records = {
            let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());

            tracker.process(snapshots)
        };

        // Empty payloads aren't sent
        if records.is_empty() {
            self.metrics.metrics_batch_suppressed.increment();

            return;
        }

        let timestamp_ms = records.iter().map(|record| record.timestamp_ms).max();

        let payload = match self.encoder.encode_request(timestamp_ms, &records) {
            Ok(payload) => payload,
            Err(err) => {
                self.metrics.metrics_batch_failed.increment();

                emit::error!(
                    rt: emit::runtime::internal(),
                    "failed to encode New Relic metrics batch: {err}",
                    err,
                );

                return;
            }
        };

        match send_payload(&self.client, "metrics", records.len(), payload).await {
            Ok(()) => self.metrics.metrics_batch_sent.increment(),
            Err(_) => self.metrics.metrics_batch_failed.increment(),
        }
    }
}

/**
Turns batches of span records into Trace API requests.
*/
pub(crate) struct TracesExporter<C> {
    encoder: TracesRequestEncoder,
    client: C,
    metrics: Arc<InternalMetrics>,
}

impl<C: BatchClient> TracesExporter<C> {
    pub fn new(encoder: TracesRequestEncoder, client: C, metrics: Arc<InternalMetrics>) -> Self {
        TracesExporter {
            encoder,
            client,
            metrics,
        }
    }

    pub async fn export(&self, spans: Vec<SpanRecord>) {
        if spans.is_empty() {
            return;
        }

        let payloads = match self.encoder.encode_requests(&spans) {
            Ok(payloads) => payloads,
            Err(err) => {
                self.metrics.traces_batch_failed.increment();

                emit::error!(
                    rt: emit::runtime::internal(),
                    "failed to encode New Relic traces batch: {err}",
                    err,
                );

                return;
            }
        };

        let mut remaining = spans.len();

        for payload in payloads {
            let batch_size = remaining.min(self.encoder.max_batch_size.max(1));
            remaining -= batch_size;

            match send_payload(&self.client, "traces", batch_size, payload).await {
                Ok(()) => self.metrics.traces_batch_sent.increment(),
                Err(_) => self.metrics.traces_batch_failed.increment(),
            }
        }
    }
}

/**
A builder for [`NewRelic`].

Use [`crate::new`] to start a builder and [`NewRelicBuilder::spawn`] to complete it, passing the resulting [`NewRelic`] to [`emit::Setup::emit_to`].

Both metrics and traces are enabled by default. Signals can be configured through [`NewRelicBuilder::metrics`] and [`NewRelicBuilder::traces`], or disabled through [`NewRelicBuilder::without_metrics`] and [`NewRelicBuilder::without_traces`].

See the crate root documentation for more details.
*/
#[must_use = "call `.spawn()` to complete the builder"]
pub struct NewRelicBuilder {
    insert_key: String,
    service_name: Option<String>,
    common_attributes: CommonAttributes,
    metrics: Option<NewRelicMetricsBuilder>,
    traces: Option<NewRelicTracesBuilder>,
}

impl NewRelicBuilder {
    /**
    Start a builder for a [`NewRelic`] emitter that authenticates with the given license or insert key.
    */
    pub fn new(insert_key: impl Into<String>) -> Self {
        NewRelicBuilder {
            insert_key: insert_key.into(),
            service_name: None,
            common_attributes: CommonAttributes::new(),
            metrics: Some(NewRelicMetricsBuilder::new()),
            traces: Some(NewRelicTracesBuilder::new()),
        }
    }

    /**
    Set the `service.name` attribute reported with all metrics and spans.

    If no service name is set then `unknown_service` is used.
    */
    pub fn service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    /**
    Set additional attributes reported with all metrics and spans.

    Strings, numbers, and booleans are reported as-is. Other values are formatted as strings.
    */
    pub fn common_attributes(mut self, attributes: impl emit::props::Props) -> Self {
        let _ = attributes.for_each(|k, v| {
            self.common_attributes
                .entry(k.get().to_owned())
                .or_insert_with(|| AttributeValue::from_value(v));

            ControlFlow::Continue(())
        });

        self
    }

    /**
    Configure the metrics signal.
    */
    pub fn metrics(mut self, builder: NewRelicMetricsBuilder) -> Self {
        self.metrics = Some(builder);
        self
    }

    /**
    Configure the traces signal.
    */
    pub fn traces(mut self, builder: NewRelicTracesBuilder) -> Self {
        self.traces = Some(builder);
        self
    }

    /**
    Don't send any metrics.
    */
    pub fn without_metrics(mut self) -> Self {
        self.metrics = None;
        self
    }

    /**
    Don't send any spans.
    */
    pub fn without_traces(mut self) -> Self {
        self.traces = None;
        self
    }

    /**
    Try spawn a [`NewRelic`] instance which can be used to send metrics and spans to New Relic.

    This method will fail if any previously configured values are invalid, such as an empty insert key or malformed host, or if the background worker can't be started.

    See the crate root documentation for more details.
    */
    pub fn spawn(self) -> Result<NewRelic, Error> {
        let metrics = Arc::new(InternalMetrics::default());

        match self.spawn_inner(metrics.clone()) {
            Ok(inner) => Ok(NewRelic {
                inner: RwLock::new(Some(inner)),
                metrics,
            }),
            Err(err) => {
                emit::error!(
                    rt: emit::runtime::internal(),
                    "New Relic configuration is invalid: {err}",
                    err,
                );

                Err(err)
            }
        }
    }

    fn common(&self) -> CommonAttributes {
        let mut common = self.common_attributes.clone();

        common.insert(
            "service.name".into(),
            AttributeValue::String(
                self.service_name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SERVICE_NAME.into()),
            ),
        );

        common.insert("instrumentation.provider".into(), "emit".into());

        common
    }

    fn spawn_inner(self, metrics: Arc<InternalMetrics>) -> Result<NewRelicInner, Error> {
        let insert_key = self.insert_key.trim();

        if insert_key.is_empty() {
            return Err(Error::msg("a New Relic license or insert key is required"));
        }

        let metrics_client = match self.metrics {
            Some(ref builder) => Some(builder.connection(metrics.clone(), insert_key)?),
            None => None,
        };

        let traces_client = match self.traces {
            Some(ref builder) => Some(builder.connection(metrics.clone(), insert_key)?),
            None => None,
        };

        self.spawn_with_clients(metrics, metrics_client, traces_client)
    }

    fn spawn_with_clients<CM, CT>(
        self,
        metrics: Arc<InternalMetrics>,
        metrics_client: Option<CM>,
        traces_client: Option<CT>,
    ) -> Result<NewRelicInner, Error>
    where
        CM: BatchClient + Send + Sync + 'static,
        CT: BatchClient + Send + Sync + 'static,
    {
        let common = self.common();

        let (metrics_signal, process_metrics) = match self.metrics.zip(metrics_client) {
            Some((builder, client)) => {
                let interval = builder.interval;

                let exporter = MetricsExporter::new(
                    MetricsRequestEncoder {
                        attributes: common.clone(),
                        interval_ms: interval.as_millis() as u64,
                    },
                    client,
                    metrics.clone(),
                );

                let (sender, receiver) = emit_batcher::bounded(CHANNEL_CAPACITY);

                let signal = Arc::new(MetricsSignal {
                    encoder: MetricsEventEncoder,
                    sender,
                    reporter: builder.reporter,
                    metrics: metrics.clone(),
                });

                let schedule = MetricsSchedule {
                    signal: Arc::downgrade(&signal),
                    interval,
                };

                (Some(signal), Some((exporter, receiver, schedule)))
            }
            None => (None, None),
        };

        let (traces_signal, process_traces) = match self.traces.zip(traces_client) {
            Some((builder, client)) => {
                let exporter = TracesExporter::new(
                    TracesRequestEncoder {
                        attributes: common,
                        max_batch_size: builder.max_batch_size,
                    },
                    client,
                    metrics.clone(),
                );

                let (sender, receiver) = emit_batcher::bounded(CHANNEL_CAPACITY);

                let signal = TracesSignal {
                    encoder: TracesEventEncoder,
                    sender,
                    metrics: metrics.clone(),
                };

                (Some(signal), Some((exporter, receiver)))
            }
            None => (None, None),
        };

        let receive = move || async move {
            let mut processors = FuturesUnordered::<Pin<Box<dyn Future<Output = ()>>>>::new();

            if let Some((exporter, receiver, schedule)) = process_metrics {
                let exporter = Arc::new(exporter);

                processors.push(Box::pin(receiver.exec(
                    |wait| tokio::time::sleep(wait),
                    move |batch| {
                        let exporter = exporter.clone();

                        async move {
                            exporter.export(batch).await;

                            Ok(())
                        }
                    },
                )));

                processors.push(Box::pin(schedule.run()));
            }

            if let Some((exporter, receiver)) = process_traces {
                let exporter = Arc::new(exporter);

                processors.push(Box::pin(receiver.exec(
                    |wait| tokio::time::sleep(wait),
                    move |batch| {
                        let exporter = exporter.clone();

                        async move {
                            exporter.export(batch).await;

                            Ok(())
                        }
                    },
                )));
            }

            // Each signal is processed independently so a slow
            // endpoint for one doesn't hold up the other
            while processors.next().await.is_some() {}
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::new("failed to build the background runtime", e))?;

        // Batches are always processed on a dedicated thread so
        // flushing from a caller can never deadlock
        let handle = thread::Builder::new()
            .name("emit_newrelic_worker".into())
            .spawn(move || runtime.block_on(receive()))
            .map_err(|e| Error::new("failed to spawn background worker", e))?;

        Ok(NewRelicInner {
            metrics_signal,
            traces_signal,
            metrics,
            _handle: handle,
        })
    }
}

/**
A builder for the metrics signal, sent to New Relic's Metric API.

Use [`NewRelicMetricsBuilder::new`] to start a builder and pass it to [`NewRelicBuilder::metrics`].
*/
#[must_use = "pass the builder to `NewRelicBuilder::metrics`"]
pub struct NewRelicMetricsBuilder {
    host: String,
    port: u16,
    interval: Duration,
    allow_compression: bool,
    timeout: Duration,
    reporter: emit::metric::Reporter,
}

impl Default for NewRelicMetricsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NewRelicMetricsBuilder {
    /**
    Start a builder for the metrics signal with default settings.

    Metrics are sent to `metric-api.newrelic.com:443`, sampling registered sources every 5 seconds.
    */
    pub fn new() -> Self {
        NewRelicMetricsBuilder {
            host: DEFAULT_METRIC_HOST.into(),
            port: DEFAULT_PORT,
            interval: DEFAULT_INTERVAL,
            allow_compression: true,
            timeout: DEFAULT_TIMEOUT,
            reporter: emit::metric::Reporter::new(),
        }
    }

    /**
    Override the host of the Metric API.

    The host may include an `http://` or `https://` scheme and a port, but not a path. If it doesn't include a scheme then `https` is used.
    */
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /**
    Override the port of the Metric API.

    This is ignored if the host includes a port.
    */
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /**
    Set how often registered metric sources are sampled.

    This is also reported as the `interval.ms` of each request.
    */
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /**
    Register a source of metrics to sample every interval.

    Counts and sums sampled from sources are treated as running totals, and sent to New Relic as the change since the last sample.
    */
    pub fn source(mut self, source: impl emit::metric::Source + Send + Sync + 'static) -> Self {
        self.reporter.add_source(source);
        self
    }

    /**
    Whether to compress request payloads.

    Passing `false` to this method will disable compression on all requests.
    */
    #[cfg(feature = "gzip")]
    pub fn allow_compression(mut self, allow: bool) -> Self {
        self.allow_compression = allow;
        self
    }

    /**
    Set the maximum amount of time to wait for a single request to complete.
    */
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn connection(
        &self,
        metrics: Arc<InternalMetrics>,
        insert_key: &str,
    ) -> Result<HttpConnection, Error> {
        if self.interval.is_zero() {
            return Err(Error::msg("the metrics interval must be greater than zero"));
        }

        HttpConnection::new(
            metrics,
            url(&self.host, self.port, METRIC_API_PATH),
            self.allow_compression,
            self.timeout,
            vec![("Api-Key".to_owned(), insert_key.to_owned())],
        )
    }
}

/**
A builder for the traces signal, sent to New Relic's Trace API.

Use [`NewRelicTracesBuilder::new`] to start a builder and pass it to [`NewRelicBuilder::traces`].
*/
#[must_use = "pass the builder to `NewRelicBuilder::traces`"]
pub struct NewRelicTracesBuilder {
    host: String,
    port: u16,
    max_batch_size: usize,
    allow_compression: bool,
    timeout: Duration,
}

impl Default for NewRelicTracesBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NewRelicTracesBuilder {
    /**
    Start a builder for the traces signal with default settings.

    Spans are sent to `trace-api.newrelic.com:443`, in requests of at most 600 spans.
    */
    pub fn new() -> Self {
        NewRelicTracesBuilder {
            host: DEFAULT_TRACE_HOST.into(),
            port: DEFAULT_PORT,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            allow_compression: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /**
    Override the host of the Trace API.

    The host may include an `http://` or `https://` scheme and a port, but not a path. If it doesn't include a scheme then `https` is used.
    */
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /**
    Override the port of the Trace API.

    This is ignored if the host includes a port.
    */
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /**
    Set the maximum number of spans to send in a single request.

    Larger batches are split over multiple requests.
    */
    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /**
    Whether to compress request payloads.

    Passing `false` to this method will disable compression on all requests.
    */
    #[cfg(feature = "gzip")]
    pub fn allow_compression(mut self, allow: bool) -> Self {
        self.allow_compression = allow;
        self
    }

    /**
    Set the maximum amount of time to wait for a single request to complete.
    */
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn connection(
        &self,
        metrics: Arc<InternalMetrics>,
        insert_key: &str,
    ) -> Result<HttpConnection, Error> {
        if self.max_batch_size == 0 {
            return Err(Error::msg("the maximum span batch size must be greater than zero"));
        }

        HttpConnection::new(
            metrics,
            url(&self.host, self.port, TRACE_API_PATH),
            self.allow_compression,
            self.timeout,
            vec![
                ("Api-Key".to_owned(), insert_key.to_owned()),
                ("Data-Format".to_owned(), "newrelic".to_owned()),
                ("Data-Format-Version".to_owned(), "1".to_owned()),
            ],
        )
    }
}

fn url(host: &str, port: u16, path: &str) -> String {
    let host = host.trim().trim_end_matches('/');

    let (scheme, authority) = host.split_once("://").unwrap_or(("https", host));

    // A port on the host takes precedence
    match authority.parse::<http::uri::Authority>() {
        Ok(authority) if authority.port_u16().is_some() => format!("{scheme}://{authority}{path}"),
        _ => format!("{scheme}://{authority}:{port}{path}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicU64, Ordering},
    };

    use crate::{
        data::tests::ts,
        delta::{tests::snapshot, MetricValue},
    };

    #[derive(Clone)]
    struct InMemoryClient {
        requests: Arc<Mutex<Vec<serde_json::Value>>>,
        response: Result<u16, &'static str>,
    }

    impl InMemoryClient {
        fn new() -> Self {
            Self::respond(Ok(202))
        }

        fn respond(response: Result<u16, &'static str>) -> Self {
            InMemoryClient {
                requests: Arc::new(Mutex::new(Vec::new())),
                response,
            }
        }

        fn requests(&self) -> Vec<serde_json::Value> {
            self.requests.lock().unwrap().clone()
        }

        fn sent_metrics(&self) -> Vec<serde_json::Value> {
            self.requests()
                .into_iter()
                .flat_map(|req| req[0]["metrics"].as_array().unwrap().clone())
                .collect()
        }
    }

    impl BatchClient for InMemoryClient {
        fn send_batch(
            &self,
            payload: EncodedPayload,
        ) -> impl Future<Output = Result<BatchResponse, Error>> + Send {
            let requests = self.requests.clone();
            let response = self.response;

            async move {
                requests
                    .lock()
                    .unwrap()
                    .push(serde_json::from_slice(payload.as_bytes()).unwrap());

                response.map(BatchResponse::new).map_err(Error::msg)
            }
        }
    }

    fn metrics_exporter(client: InMemoryClient) -> MetricsExporter<InMemoryClient> {
        MetricsExporter::new(
            MetricsRequestEncoder {
                attributes: CommonAttributes::from([
                    ("service.name".to_owned(), "test".into()),
                    ("instrumentation.provider".to_owned(), "emit".into()),
                ]),
                interval_ms: 5000,
            },
            client,
            Arc::new(InternalMetrics::default()),
        )
    }

    fn traces_exporter(
        client: InMemoryClient,
        max_batch_size: usize,
    ) -> TracesExporter<InMemoryClient> {
        TracesExporter::new(
            TracesRequestEncoder {
                attributes: CommonAttributes::new(),
                max_batch_size,
            },
            client,
            Arc::new(InternalMetrics::default()),
        )
    }

    fn span(id: u64) -> SpanRecord {
        SpanRecord {
            id: emit::span::SpanId::from_u64(id).unwrap(),
            trace_id: emit::span::TraceId::from_u128(1).unwrap(),
            parent_id: None,
            name: "test".into(),
            timestamp_ms: 1,
            duration_ms: 1.0,
            attributes: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn export_counter_first_observation_then_delta() {
        let client = InMemoryClient::new();
        let exporter = metrics_exporter(client.clone());

        exporter
            .export(vec![snapshot("requests", &[], MetricValue::Counter(5.0), 1000)])
            .await;
        exporter
            .export(vec![snapshot("requests", &[], MetricValue::Counter(8.0), 6000)])
            .await;

        let sent = client.sent_metrics();

        assert_eq!(2, sent.len());

        assert_eq!("count", sent[0]["type"]);
        assert_eq!(5.0, sent[0]["value"]);
        assert!(sent[0].get("interval.ms").is_none());

        assert_eq!(3.0, sent[1]["value"]);
        assert_eq!(5000, sent[1]["interval.ms"]);
    }

    #[tokio::test]
    async fn export_summary_pair_deltas() {
        let client = InMemoryClient::new();
        let exporter = metrics_exporter(client.clone());

        let summary = |count, sum| MetricValue::Summary {
            count,
            sum,
            min: None,
            max: None,
        };

        exporter
            .export(vec![snapshot("latency", &[], summary(2.0, 4.0), 1000)])
            .await;
        exporter
            .export(vec![snapshot("latency", &[], summary(3.0, 9.0), 2000)])
            .await;

        let sent = client.sent_metrics();

        assert_eq!("summary", sent[1]["type"]);
        assert_eq!(1.0, sent[1]["value"]["count"]);
        assert_eq!(5.0, sent[1]["value"]["sum"]);
    }

    #[tokio::test]
    async fn export_gauge_passthrough() {
        let client = InMemoryClient::new();
        let exporter = metrics_exporter(client.clone());

        for ts in [1000, 2000] {
            exporter
                .export(vec![snapshot("queue", &[], MetricValue::Gauge(42.0), ts)])
                .await;
        }

        let sent = client.sent_metrics();

        assert_eq!(2, sent.len());
        for metric in sent {
            assert_eq!("gauge", metric["type"]);
            assert_eq!(42.0, metric["value"]);
        }
    }

    #[tokio::test]
    async fn export_identities_are_isolated() {
        let client = InMemoryClient::new();
        let exporter = metrics_exporter(client.clone());

        exporter
            .export(vec![
                snapshot("requests", &[("tag", "a")], MetricValue::Counter(5.0), 1000),
                snapshot("requests", &[("tag", "b")], MetricValue::Counter(7.0), 1000),
            ])
            .await;
        exporter
            .export(vec![
                snapshot("requests", &[("tag", "a")], MetricValue::Counter(6.0), 2000),
                snapshot("requests", &[("tag", "b")], MetricValue::Counter(10.0), 2000),
            ])
            .await;

        let sent = client.sent_metrics();

        assert_eq!(4, sent.len());
        assert_eq!("a", sent[2]["attributes"]["tag"]);
        assert_eq!(1.0, sent[2]["value"]);
        assert_eq!("b", sent[3]["attributes"]["tag"]);
        assert_eq!(3.0, sent[3]["value"]);
    }

    #[tokio::test]
    async fn export_empty_batch_is_not_sent() {
        let client = InMemoryClient::new();
        let exporter = metrics_exporter(client.clone());

        exporter.export(Vec::new()).await;

        assert_eq!(0, client.requests().len());
        assert_eq!(1, exporter.metrics.metrics_batch_suppressed.sample());
        assert_eq!(0, exporter.metrics.metrics_batch_sent.sample());
    }

    #[tokio::test]
    async fn export_request_carries_common_block() {
        let client = InMemoryClient::new();
        let exporter = metrics_exporter(client.clone());

        exporter
            .export(vec![
                snapshot("a", &[], MetricValue::Gauge(1.0), 1000),
                snapshot("b", &[], MetricValue::Gauge(1.0), 3000),
            ])
            .await;

        let requests = client.requests();

        assert_eq!(1, requests.len());
        assert_eq!(
            serde_json::json!({
                "timestamp": 3000,
                "interval.ms": 5000,
                "attributes": {
                    "service.name": "test",
                    "instrumentation.provider": "emit"
                }
            }),
            requests[0][0]["common"]
        );
    }

    #[tokio::test]
    async fn export_failure_keeps_delta_state() {
        let failing = InMemoryClient::respond(Err("connection refused"));
        let exporter = metrics_exporter(failing.clone());

        exporter
            .export(vec![snapshot("requests", &[], MetricValue::Counter(5.0), 1000)])
            .await;

        assert_eq!(1, failing.requests().len());
        assert_eq!(1, exporter.metrics.metrics_batch_failed.sample());

        let rejected = InMemoryClient::respond(Ok(500));
        let exporter = MetricsExporter {
            client: rejected.clone(),
            ..exporter
        };

        exporter
            .export(vec![snapshot("requests", &[], MetricValue::Counter(8.0), 2000)])
            .await;

        assert_eq!(2, exporter.metrics.metrics_batch_failed.sample());

        // The failed interval is lost, but the next delta starts from the last observation
        assert_eq!(3.0, rejected.sent_metrics()[0]["value"]);
        assert_eq!(1, exporter.tracker.lock().unwrap().tracked());
    }

    #[tokio::test]
    async fn export_traces_split_into_batches() {
        let client = InMemoryClient::new();
        let exporter = traces_exporter(client.clone(), 2);

        exporter.export((1..=3).map(span).collect()).await;

        let requests = client.requests();

        assert_eq!(2, requests.len());
        assert_eq!(2, requests[0][0]["spans"].as_array().unwrap().len());
        assert_eq!(1, requests[1][0]["spans"].as_array().unwrap().len());
        assert_eq!(2, exporter.metrics.traces_batch_sent.sample());
    }

    #[tokio::test]
    async fn export_traces_empty_batch_is_not_sent() {
        let client = InMemoryClient::new();
        let exporter = traces_exporter(client.clone(), 600);

        exporter.export(Vec::new()).await;

        assert_eq!(0, client.requests().len());
    }

    #[tokio::test]
    async fn export_traces_failure_is_counted() {
        let client = InMemoryClient::respond(Ok(403));
        let exporter = traces_exporter(client.clone(), 600);

        exporter.export(vec![span(1)]).await;

        assert_eq!(1, exporter.metrics.traces_batch_failed.sample());
        assert_eq!(0, exporter.metrics.traces_batch_sent.sample());
    }

    #[test]
    fn batch_response_ok() {
        assert!(BatchResponse::new(200).ok());
        assert!(BatchResponse::new(202).ok());
        assert!(!BatchResponse::new(199).ok());
        assert!(!BatchResponse::new(400).ok());
        assert!(!BatchResponse::new(503).ok());

        assert_eq!(413, BatchResponse::new(413).status_code());
    }

    #[test]
    fn url_from_host() {
        assert_eq!(
            "https://metric-api.newrelic.com:443/metric/v1",
            url(DEFAULT_METRIC_HOST, 443, METRIC_API_PATH)
        );
        assert_eq!(
            "http://localhost:8080/trace/v1",
            url("http://localhost/", 8080, TRACE_API_PATH)
        );
    }

    #[test]
    fn url_from_host_with_port() {
        assert_eq!(
            "http://localhost:8080/trace/v1",
            url("http://localhost:8080", 443, TRACE_API_PATH)
        );
        assert_eq!(
            "https://metric-api.eu.newrelic.com:443/metric/v1",
            url("https://metric-api.eu.newrelic.com:443", 8443, METRIC_API_PATH)
        );
        assert_eq!(
            "https://localhost:4318/metric/v1",
            url("localhost:4318", 443, METRIC_API_PATH)
        );

        let emitter = crate::new("key")
            .metrics(NewRelicMetricsBuilder::new().host("http://localhost:8080"))
            .traces(NewRelicTracesBuilder::new().host("http://localhost:8080"))
            .spawn()
            .unwrap();

        assert!(emitter.stop(Duration::from_secs(1)));
    }

    #[test]
    fn builder_common_attributes() {
        let builder = crate::new("key")
            .service_name("my-service")
            .common_attributes(emit::props! {
                #[emit::key("host.name")]
                host_name: "web-1",
                replicas: 3,
            });

        let common = builder.common();

        assert_eq!(Some(&"my-service".into()), common.get("service.name"));
        assert_eq!(Some(&"emit".into()), common.get("instrumentation.provider"));
        assert_eq!(Some(&"web-1".into()), common.get("host.name"));
        assert_eq!(Some(&AttributeValue::Int(3)), common.get("replicas"));
    }

    #[test]
    fn builder_default_service_name() {
        let common = crate::new("key").common();

        assert_eq!(Some(&"unknown_service".into()), common.get("service.name"));
    }

    #[test]
    fn spawn_invalid_config() {
        assert!(crate::new("  ").spawn().is_err());

        assert!(crate::new("key")
            .metrics(NewRelicMetricsBuilder::new().host("ftp://example.com"))
            .spawn()
            .is_err());

        assert!(crate::new("key")
            .traces(NewRelicTracesBuilder::new().max_batch_size(0))
            .spawn()
            .is_err());

        assert!(crate::new("key")
            .metrics(NewRelicMetricsBuilder::new().interval(Duration::ZERO))
            .spawn()
            .is_err());
    }

    #[test]
    fn emit_routes_events() {
        let emitter = crate::new("key")
            .metrics(NewRelicMetricsBuilder::new().host("http://localhost"))
            .traces(NewRelicTracesBuilder::new().host("http://localhost"))
            .spawn()
            .unwrap();

        emit::Emitter::emit(
            &emitter,
            emit::evt!(
                extent: ts(1),
                "{metric_agg} of {metric_name} is {metric_value}",
                evt_kind: "metric",
                metric_name: "test",
                metric_agg: "count",
                metric_value: "not a number",
            ),
        );

        emit::Emitter::emit(
            &emitter,
            emit::evt!(
                extent: ts(1)..ts(2),
                "span without ids",
                evt_kind: "span",
            ),
        );

        emit::Emitter::emit(&emitter, emit::evt!("a log event"));

        let source = emitter.metric_source();

        assert_eq!(1, source.metric_value_unsupported());
        assert_eq!(1, source.span_invalid());
        assert_eq!(1, source.event_discarded());

        emitter.stop(Duration::from_secs(1));
    }

    #[test]
    fn stop_is_idempotent() {
        let emitter = crate::new("key")
            .metrics(NewRelicMetricsBuilder::new().host("http://localhost"))
            .without_traces()
            .spawn()
            .unwrap();

        assert!(emitter.stop(Duration::from_secs(1)));
        assert!(emitter.stop(Duration::from_secs(1)));
        assert!(emit::Emitter::blocking_flush(&emitter, Duration::from_secs(1)));

        emit::Emitter::emit(
            &emitter,
            emit::evt!(
                extent: ts(1),
                "{metric_agg} of {metric_name} is {metric_value}",
                evt_kind: "metric",
                metric_name: "test",
                metric_agg: "count",
                metric_value: 1,
            ),
        );

        assert_eq!(1, emitter.metric_source().event_discarded());
    }

    fn spawn_in_memory(builder: NewRelicBuilder, client: &InMemoryClient) -> NewRelic {
        let metrics = Arc::new(InternalMetrics::default());

        let inner = builder
            .spawn_with_clients(metrics.clone(), Some(client.clone()), Some(client.clone()))
            .unwrap();

        NewRelic {
            inner: RwLock::new(Some(inner)),
            metrics,
        }
    }

    #[test]
    fn stop_samples_sources_once_with_deltas() {
        let client = InMemoryClient::new();
        let total = Arc::new(AtomicU64::new(0));

        let emitter = spawn_in_memory(
            crate::new("key")
                .metrics(
                    NewRelicMetricsBuilder::new()
                        .interval(Duration::from_secs(3600))
                        .source({
                            let total = total.clone();

                            emit::metric::source::from_fn(move |sampler| {
                                sampler.metric(emit::metric::Metric::new(
                                    emit::path!("test"),
                                    "requests",
                                    emit::well_known::METRIC_AGG_COUNT,
                                    emit::empty::Empty,
                                    total.load(Ordering::Relaxed),
                                    emit::empty::Empty,
                                ));
                            })
                        }),
                )
                .without_traces(),
            &client,
        );

        emit::Emitter::emit(
            &emitter,
            emit::evt!(
                extent: ts(1000),
                "{metric_agg} of {metric_name} is {metric_value}",
                evt_kind: "metric",
                metric_name: "requests",
                metric_agg: "count",
                metric_value: 5,
            ),
        );

        assert!(emit::Emitter::blocking_flush(
            &emitter,
            Duration::from_secs(5)
        ));

        let sent = client.sent_metrics();

        assert_eq!(1, sent.len());
        assert_eq!(5.0, sent[0]["value"]);

        total.store(8, Ordering::Relaxed);

        assert!(emitter.stop(Duration::from_secs(5)));

        let sent = client.sent_metrics();

        // The source is sampled exactly once, relative to the last observation
        assert_eq!(2, sent.len());
        assert_eq!("requests", sent[1]["name"]);
        assert_eq!("count", sent[1]["type"]);
        assert_eq!(3.0, sent[1]["value"]);
        assert!(sent[1]["interval.ms"].as_u64().unwrap() > 0);
    }

    #[test]
    fn schedule_samples_sources_without_flushing() {
        let client = InMemoryClient::new();

        let emitter = spawn_in_memory(
            crate::new("key")
                .metrics(
                    NewRelicMetricsBuilder::new()
                        .interval(Duration::from_millis(10))
                        .source(emit::metric::source::from_fn(|sampler| {
                            sampler.metric(emit::metric::Metric::new(
                                emit::path!("test"),
                                "queue_depth",
                                emit::well_known::METRIC_AGG_LAST,
                                emit::empty::Empty,
                                42,
                                emit::empty::Empty,
                            ));
                        })),
                )
                .without_traces(),
            &client,
        );

        let start = Instant::now();
        while client.requests().is_empty() && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }

        let sent = client.sent_metrics();

        assert!(!sent.is_empty());
        assert_eq!("queue_depth", sent[0]["name"]);
        assert_eq!("gauge", sent[0]["type"]);
        assert_eq!(42.0, sent[0]["value"]);

        assert!(emitter.stop(Duration::from_secs(5)));
    }
}
