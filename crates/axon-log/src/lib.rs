// ABOUTME: Tracing subscriber setup shared by the connector binaries.
// ABOUTME: Picks connector-focused filter directives unless RUST_LOG says otherwise.

use tracing_subscriber::EnvFilter;

/// Crates whose stream and heartbeat traffic verbose mode shows.
pub const CONNECTOR_CRATES: &[&str] = &["axon_connector", "axon_grpc"];

/// Directives used when RUST_LOG is unset.
///
/// Quiet mode logs INFO from everything. Verbose mode drops other crates to WARN
/// and shows the connector crates at DEBUG.
pub fn default_directives(verbose: bool) -> String {
    if !verbose {
        return "info".to_string();
    }
    let mut directives = vec!["warn".to_string()];
    directives.extend(CONNECTOR_CRATES.iter().map(|name| format!("{name}=debug")));
    directives.join(",")
}

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)))
}

/// Install a stderr subscriber. Does nothing when one is already installed.
pub fn init(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_writer(std::io::stderr)
        .try_init();
}
