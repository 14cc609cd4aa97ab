// ABOUTME: Logging setup for the beacon binary.
// ABOUTME: stderr output with an EnvFilter; RUST_LOG wins, -v raises the default level.

use tracing_subscriber::EnvFilter;

/// Filter used when RUST_LOG is not set. WARN for dependencies, the chosen
/// level for beacon's own crates.
pub fn default_directives(verbose: u8) -> String {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    format!("warn,beacon_cli={level},beacon_rpc={level}")
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_beacon_level() {
        assert_eq!(default_directives(0), "warn,beacon_cli=info,beacon_rpc=info");
        assert!(default_directives(1).contains("beacon_rpc=debug"));
        assert!(default_directives(5).contains("beacon_rpc=trace"));
    }

    #[test]
    fn default_directives_parse() {
        for verbose in 0..3 {
            assert!(EnvFilter::try_new(default_directives(verbose)).is_ok());
        }
    }
}
