//! Diagnostic logging setup

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter for a `-v` count; `RUST_LOG` wins when set
fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "proxy_warden=info,warn",
        1 => "proxy_warden=debug,info",
        _ => "proxy_warden=trace,sqlx=info,debug",
    }
}

/// Install a stderr fmt subscriber; a second call is a no-op
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_parse() {
        for verbosity in 0..3 {
            assert!(default_filter(verbosity).parse::<EnvFilter>().is_ok());
        }
    }

    #[test]
    fn test_init_twice() {
        init(0);
        init(2);
    }
}
