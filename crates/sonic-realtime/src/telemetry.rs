use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::ChronoLocal;

/// Installs the global `fmt` subscriber.
///
/// `RUST_LOG` directives, when present, take precedence over `level`.
/// Returns false if a subscriber was already installed.
pub fn init_tracing(level: Level) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::rfc_3339())
        .try_init()
        .is_ok()
}
