#[cfg(feature = "trace")]
pub(crate) mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

    /// Installs the global subscriber: an env filter plus a fmt layer.
    ///
    /// `RUST_LOG` directives take precedence over `level`. Setting
    /// `STAGECHAIN_DISABLE_LOGS` skips installation entirely and
    /// `STAGECHAIN_LOG_TO_STDERR` sends output to stderr.
    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let default_filter = level.unwrap_or(default_filter);
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default_filter.into())
            .from_env_lossy();

        if std::env::var("STAGECHAIN_DISABLE_LOGS").is_ok() {
            return Ok(());
        }
        let to_stderr = std::env::var("STAGECHAIN_LOG_TO_STDERR").is_ok();

        let fmt_layer = tracing_subscriber::fmt::layer().with_level(true);
        let fmt_layer = if cfg!(any(test, debug_assertions)) {
            fmt_layer
                .pretty()
                .with_file(true)
                .with_line_number(true)
                .boxed()
        } else {
            fmt_layer.with_thread_names(true).boxed()
        };
        let fmt_layer = if to_stderr {
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_writer(std::io::stderr)
                .boxed()
        } else {
            fmt_layer
        };

        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}
