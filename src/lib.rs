/*!
Emit metrics and spans to New Relic.

Metrics are sent to the [Metric API](https://docs.newrelic.com/docs/data-apis/ingest-apis/metric-api/introduction-metric-api/) and spans are sent to the [Trace API](https://docs.newrelic.com/docs/distributed-tracing/trace-api/introduction-trace-api/), both as JSON over HTTP. All network IO is performed on batches in a dedicated background thread.

Other diagnostic events, like logs, are not sent to New Relic. Combine this emitter with another one if you need them.

# Getting started

Add `emit` and `emit_newrelic` to your `Cargo.toml`:

```toml
[dependencies.emit]
version = "1.17.2"

[dependencies.emit_newrelic]
version = "0.1.0"
```

Initialize `emit` using an insert key for your New Relic account:

```no_run
fn main() {
    let rt = emit::setup()
        .emit_to(
            emit_newrelic::new("<your insert key>")
                .service_name("my_app")
                .spawn()
                .unwrap(),
        )
        .init();

    // Your app code goes here

    rt.blocking_flush(std::time::Duration::from_secs(30));
}
```

The emitter can also be configured through environment variables using [`NewRelicBuilder::from_env`]:

```no_run
fn main() {
    let rt = emit::setup()
        .emit_to(emit_newrelic::NewRelicBuilder::from_env().spawn().unwrap())
        .init();

    // Your app code goes here

    rt.blocking_flush(std::time::Duration::from_secs(30));
}
```

The following environment variables are recognized:

- `NEW_RELIC_INSERT_KEY` or `NEW_RELIC_API_KEY`: the key to authenticate with.
- `NEW_RELIC_SERVICE_NAME` or `OTEL_SERVICE_NAME`: the `service.name` attribute.
- `NEW_RELIC_METRIC_HOST` and `NEW_RELIC_TRACE_HOST`: the hosts of each API.
- `NEW_RELIC_PORT`: the port of both APIs.
- `NEW_RELIC_METRIC_EXPORT_INTERVAL`: how often to sample metric sources, in seconds.

# Metrics

Events with `evt_kind: "metric"` are converted into New Relic metrics. The `metric_agg` of a sample decides its type:

- `count` and `sum` become New Relic `count` metrics.
- Anything else, like `last`, `min`, or `max`, becomes a New Relic `gauge`.
- A value shaped like a [`Summary`] always becomes a New Relic `summary`, regardless of its aggregation.

Samples with a point extent are treated as cumulative. The first time a cumulative counter or summary is seen it's sent as-is. Each later sample is sent as the difference from the previous one, along with the interval between them. Samples with a range extent are already deltas, and are sent as-is.

```
emit::emit!(
    "{metric_agg} of {metric_name} is {metric_value}",
    evt_kind: "metric",
    metric_agg: "count",
    metric_name: "requests",
    metric_value: 42,
);
```

Values that aren't numbers or summaries are discarded and logged to [`emit::runtime::internal`].

## Metric sources

Sources of metrics, like an [`emit::metric::Reporter`] would use, can be registered with [`NewRelicMetricsBuilder::source`]. They're sampled on a fixed interval in the background, and once more when the emitter is stopped:

```no_run
fn main() {
    let rt = emit::setup()
        .emit_to(
            emit_newrelic::new("<your insert key>")
                .metrics(
                    emit_newrelic::NewRelicMetricsBuilder::new()
                        .interval(std::time::Duration::from_secs(10))
                        .source(emit::metric::source::from_fn(|sampler| {
                            sampler.metric(emit::metric::Metric::new(
                                emit::path!("my_app"),
                                "queue_depth",
                                emit::well_known::METRIC_AGG_LAST,
                                emit::empty::Empty,
                                42,
                                emit::empty::Empty,
                            ));
                        })),
                )
                .spawn()
                .unwrap(),
        )
        .init();

    // Your app code goes here

    rt.blocking_flush(std::time::Duration::from_secs(30));
}
```

# Traces

Events with `evt_kind: "span"`, a time range for their extent, a `trace_id`, and a `span_id` are sent as spans. Use `emit`'s `#[span]` attribute to produce them:

```
#[emit::span("greet {user}")]
fn greet(user: &str) {
    // Your code goes here
}
```

Spans are sent in batches of up to [`NewRelicTracesBuilder::max_batch_size`] spans per request.

# Stopping

Call [`NewRelic::stop`] before your application exits to sample metric sources one last time and flush any pending batches. After stopping, any events emitted are discarded.

Flushing through [`emit::Emitter::blocking_flush`] waits for pending batches to be sent without stopping.

# Troubleshooting

If you're not seeing diagnostics appear in New Relic as expected, you can rule out configuration issues in `emit_newrelic` by configuring `emit`'s internal logger, and collect metrics from it:

```no_run
# mod emit_term {
#     pub fn stdout() -> impl emit::runtime::InternalEmitter + Send + Sync + 'static {
#        emit::runtime::AssertInternal(emit::emitter::from_fn(|_| {}))
#     }
# }
use emit::metric::Source;

fn main() {
    // 1. Initialize the internal logger
    //    Diagnostics produced by `emit_newrelic` itself will go here
    let internal = emit::setup()
        .emit_to(emit_term::stdout())
        .init_internal();

    let mut reporter = emit::metric::Reporter::new();

    let rt = emit::setup()
        .emit_to({
            let newrelic = emit_newrelic::new("<your insert key>").spawn().unwrap();

            // 2. Add `emit_newrelic`'s metrics to a reporter so we can see what it's up to
            //    You can do this independently of the internal emitter
            reporter.add_source(newrelic.metric_source());

            newrelic
        })
        .init();

    // Your app code goes here

    rt.blocking_flush(std::time::Duration::from_secs(30));

    // 3. Report metrics after attempting to flush
    //    You could also do this periodically as your application runs
    reporter.emit_metrics(&internal.emitter());
}
```

# Cargo features

- `tls` (default): Support `https` endpoints using `rustls` with the platform's native certificates.
- `tls-native`: Use the platform's native TLS implementation instead of `rustls`.
- `gzip` (default): Compress request bodies.
*/

#![deny(missing_docs)]

use std::fmt;

mod client;
mod data;
mod delta;
mod env;
mod internal_metrics;

pub use self::{client::*, data::Summary, internal_metrics::NewRelicMetrics};

/**
Start a builder for a New Relic emitter.

The `insert_key` is used to authenticate requests to the Metric and Trace APIs. Both metrics and traces are enabled using New Relic's US endpoints, with the following defaults:

- Metric sources are sampled every 5 seconds.
- Requests time out after 10 seconds.
- Up to 600 spans are sent per request.

Once configured, call [`NewRelicBuilder::spawn`] to complete the builder, passing the resulting [`NewRelic`] to [`emit::Setup::emit_to`].
*/
pub fn new(insert_key: impl Into<String>) -> NewRelicBuilder {
    NewRelicBuilder::new(insert_key)
}

/**
An error encountered configuring or sending to New Relic.
*/
pub struct Error(Box<dyn std::error::Error + Send + Sync>);

impl Error {
    pub(crate) fn new(
        msg: impl fmt::Display,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error(Box::new(WithSource {
            msg: msg.to_string(),
            source: Box::new(source),
        }))
    }

    pub(crate) fn msg(msg: impl fmt::Display) -> Self {
        Error(msg.to_string().into())
    }
}

struct WithSource {
    msg: String,
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl fmt::Debug for WithSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("msg", &self.msg)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for WithSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.msg, f)
    }
}

impl std::error::Error for WithSource {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}
