use crate::config::LoggingConfig;
use std::backtrace::Backtrace;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the tracing subscriber and, when a DSN is configured, Sentry.
///
/// The returned guard flushes pending Sentry events on drop and must be held for
/// the lifetime of the process.
pub fn init(config: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                attach_stacktrace: true,
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    install_panic_hook();
    guard
}

// Dispatch task panics are caught at the join boundary, this hook makes sure the
// stack is still logged before that happens.
fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        let backtrace = Backtrace::force_capture();
        tracing::error!(
            panic = %info,
            location = %location,
            backtrace = %backtrace,
            "Panic"
        );
        previous(info);
    }));
}
