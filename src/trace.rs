use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable that overrides the `--log-level` flag. It accepts
/// full `EnvFilter` directives, e.g. `scrape_sidecar=debug,async_nats=warn`.
pub const LOG_ENV: &str = "SCRAPE_SIDECAR_LOG";

/// Turn a bare level into directives for this crate and the bus client,
/// anything else is passed through untouched.
pub fn directives(levels: &str) -> String {
    match levels {
        "off" | "error" | "warn" | "info" | "debug" | "trace" => {
            format!("scrape_sidecar={levels},async_nats={levels}")
        }
        other => other.to_string(),
    }
}

pub fn init(color: bool, json: bool, levels: &str) {
    let filter = EnvFilter::try_new(directives(levels)).unwrap_or_else(|err| {
        eprintln!("invalid log directives {levels:?}, fallback to info, {err}");

        EnvFilter::new(directives("info"))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(color)
        .with_writer(std::io::stderr);

    // an already installed subscriber is not worth failing startup for
    let _ = if json {
        builder.json().flatten_event(true).finish().try_init()
    } else {
        builder.finish().try_init()
    };
}

#[cfg(test)]
pub fn test_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .finish()
        .try_init(); // tests run in parallel, only the first one wins
}
