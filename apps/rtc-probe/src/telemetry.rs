use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_FILTER: &str = "info,rtc_probe=debug";

/// Install the global subscriber. Logs go to stderr so reports printed on
/// stdout stay clean. A second call is a no-op.
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|err| {
        eprintln!("ignoring invalid log filter {filter:?}: {err}");
        EnvFilter::new(DEFAULT_FILTER)
    });
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = Registry::default().with(env_filter).with(fmt_layer).try_init();
}
