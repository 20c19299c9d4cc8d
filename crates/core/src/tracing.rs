//! Logging setup for the `netbed` binary and ad-hoc experiments.
//!
//! Library code only emits `tracing` events; installing a subscriber is left to
//! whoever drives the run. Tests rely on `test-log` instead.

#[cfg(feature = "trace")]
pub use self::tracer::init_tracer;

#[cfg(feature = "trace")]
mod tracer {
    use ::tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

    /// Installs the global subscriber.
    ///
    /// `level` overrides the default filter (DEBUG in debug builds, INFO
    /// otherwise); `RUST_LOG` directives still apply on top. Behaviour can be
    /// tuned through the environment:
    ///
    /// - `NETBED_LOG_FORMAT=json` switches to JSON lines,
    /// - `NETBED_LOG_TO_STDERR` writes to stderr instead of stdout,
    /// - `NETBED_DISABLE_LOGS` skips installing anything.
    ///
    /// Calling it again once a subscriber is installed is a no-op.
    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        if std::env::var("NETBED_DISABLE_LOGS").is_ok() {
            return Ok(());
        }

        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(level.unwrap_or(default_filter).into())
            .from_env_lossy();

        let to_stderr = std::env::var("NETBED_LOG_TO_STDERR").is_ok();
        let use_json = std::env::var("NETBED_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let with_location = cfg!(any(test, debug_assertions));

        let fmt_layer = match (use_json, to_stderr) {
            (true, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (true, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
            (false, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (false, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
        };

        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        if let Err(err) = subscriber.try_init() {
            ::tracing::debug!(%err, "tracing subscriber already installed");
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn init_twice_is_harmless() {
            init_tracer(Some(LevelFilter::WARN)).unwrap();
            init_tracer(None).unwrap();
        }
    }
}
