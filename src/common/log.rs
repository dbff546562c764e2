use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_tree::HierarchicalLayer;

/// Initializes the global tracing subscriber.
///
/// `RUST_LOG` controls the filter; the default keeps organizer traffic at
/// `info` and everything else at `warn`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,strata_wm=info"));
    let tree = HierarchicalLayer::default()
        .with_indent_amount(2)
        .with_targets(true)
        .with_filter(filter);
    tracing_subscriber::registry().with(tree).init();
}
