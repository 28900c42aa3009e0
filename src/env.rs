/*!
Support configuration via environment variables.

The following variables are recognized:

- `NEW_RELIC_INSERT_KEY`: the key to authenticate with. Falls back to `NEW_RELIC_API_KEY`.
- `NEW_RELIC_SERVICE_NAME`: the `service.name` attribute. Falls back to `OTEL_SERVICE_NAME`.
- `NEW_RELIC_METRIC_HOST`: the host of the Metric API.
- `NEW_RELIC_TRACE_HOST`: the host of the Trace API.
- `NEW_RELIC_PORT`: the port of both APIs.
- `NEW_RELIC_METRIC_EXPORT_INTERVAL`: how often to sample metric sources, in seconds.

If a variable is missing or invalid, then its default value is used.
*/

use std::{env, time::Duration};

use crate::{NewRelicBuilder, NewRelicMetricsBuilder, NewRelicTracesBuilder};

const NEW_RELIC_INSERT_KEY: &'static str = "NEW_RELIC_INSERT_KEY";
const NEW_RELIC_API_KEY: &'static str = "NEW_RELIC_API_KEY";

const NEW_RELIC_SERVICE_NAME: &'static str = "NEW_RELIC_SERVICE_NAME";
const OTEL_SERVICE_NAME: &'static str = "OTEL_SERVICE_NAME";

const NEW_RELIC_METRIC_HOST: &'static str = "NEW_RELIC_METRIC_HOST";
const NEW_RELIC_TRACE_HOST: &'static str = "NEW_RELIC_TRACE_HOST";
const NEW_RELIC_PORT: &'static str = "NEW_RELIC_PORT";

const NEW_RELIC_METRIC_EXPORT_INTERVAL: &'static str = "NEW_RELIC_METRIC_EXPORT_INTERVAL";

impl NewRelicBuilder {
    /**
    Create a builder with configuration from environment variables.

    Both metrics and traces are enabled. See the crate root documentation for the set of variables that are recognized.
    */
    pub fn from_env() -> Self {
        NewRelicConfig::from_env(env::vars()).into_builder()
    }
}

#[derive(Default, Debug, PartialEq)]
pub(crate) struct NewRelicConfig {
    insert_key: Option<String>,
    service_name: Option<String>,
    metric_host: Option<String>,
    trace_host: Option<String>,
    port: Option<u16>,
    metric_export_interval: Option<Duration>,
}

impl NewRelicConfig {
    pub(crate) fn from_env<K: AsRef<str>, V: AsRef<str>>(
        env: impl Iterator<Item = (K, V)>,
    ) -> NewRelicConfig {
        fn non_empty(v: &str) -> Option<String> {
            let v = trim(v);

            if v.is_empty() {
                None
            } else {
                Some(v.to_owned())
            }
        }

        fn port(v: &str) -> Option<u16> {
            let v = trim(v);

            match v.parse::<u16>() {
                Ok(port) if port > 0 => Some(port),
                _ => {
                    emit::warn!(rt: emit::runtime::internal(), "{v} is not a valid port");

                    None
                }
            }
        }

        fn interval(v: &str) -> Option<Duration> {
            let v = trim(v);

            match v.parse::<f64>() {
                Ok(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
                _ => {
                    emit::warn!(rt: emit::runtime::internal(), "{v} is not a valid export interval in seconds");

                    None
                }
            }
        }

        let mut config = NewRelicConfig::default();

        let mut api_key = None;
        let mut otel_service_name = None;

        for (k, v) in env {
            let k = k.as_ref();

            // Credentials

            if k.eq_ignore_ascii_case(NEW_RELIC_INSERT_KEY) {
                config.insert_key = non_empty(v.as_ref());
                continue;
            }

            if k.eq_ignore_ascii_case(NEW_RELIC_API_KEY) {
                api_key = non_empty(v.as_ref());
                continue;
            }

            // Service name

            if k.eq_ignore_ascii_case(NEW_RELIC_SERVICE_NAME) {
                config.service_name = non_empty(v.as_ref());
                continue;
            }

            if k.eq_ignore_ascii_case(OTEL_SERVICE_NAME) {
                otel_service_name = non_empty(v.as_ref());
                continue;
            }

            // Endpoints

            if k.eq_ignore_ascii_case(NEW_RELIC_METRIC_HOST) {
                config.metric_host = non_empty(v.as_ref());
                continue;
            }

            if k.eq_ignore_ascii_case(NEW_RELIC_TRACE_HOST) {
                config.trace_host = non_empty(v.as_ref());
                continue;
            }

            if k.eq_ignore_ascii_case(NEW_RELIC_PORT) {
                config.port = port(v.as_ref());
                continue;
            }

            // Scheduling

            if k.eq_ignore_ascii_case(NEW_RELIC_METRIC_EXPORT_INTERVAL) {
                config.metric_export_interval = interval(v.as_ref());
                continue;
            }
        }

        config.insert_key = config.insert_key.or(api_key);
        config.service_name = config.service_name.or(otel_service_name);

        config
    }

    fn into_builder(self) -> NewRelicBuilder {
        let mut metrics = NewRelicMetricsBuilder::new();
        let mut traces = NewRelicTracesBuilder::new();

        if let Some(host) = self.metric_host {
            metrics = metrics.host(host);
        }

        if let Some(host) = self.trace_host {
            traces = traces.host(host);
        }

        if let Some(port) = self.port {
            metrics = metrics.port(port);
            traces = traces.port(port);
        }

        if let Some(interval) = self.metric_export_interval {
            metrics = metrics.interval(interval);
        }

        let mut builder = NewRelicBuilder::new(self.insert_key.unwrap_or_default())
            .metrics(metrics)
            .traces(traces);

        if let Some(service_name) = self.service_name {
            builder = builder.service_name(service_name);
        }

        builder
    }
}

fn trim(v: &str) -> &str {
    v.trim()
}
