//! Logging setup
//!
//! Installs a `tracing` fmt subscriber. `RUST_LOG` wins when set; otherwise
//! the level is `debug` or `info`.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Calling it again is harmless.
pub fn init(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Fails only when a subscriber is already installed
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init(true);
        init(false);
        tracing::info!("logging initialised");
    }
}
