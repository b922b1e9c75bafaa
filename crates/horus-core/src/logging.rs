//! Tracing subscriber setup shared by the CLI and tests.
//!
//! `RUST_LOG` overrides the default filter. `HORUS_LOG_FORMAT=json` switches
//! to JSON lines. Output goes to stderr so command output on stdout stays
//! clean.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "horus_core=info,horus_cli=info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn wants_json() -> bool {
    std::env::var("HORUS_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    if wants_json() {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}
