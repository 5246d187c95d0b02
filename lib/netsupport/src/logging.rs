//! Structured logging plumbing shared by every long-lived object in the core: connections,
//! the server registry, the global timer and the coder pools all hold a child `Logger`
//! built from one of these roots.

pub use slog::{debug, error, o, trace, warn, Discard, Logger};

use sloggers::{Build, Config, LoggerConfig};

/// Builds a logger from a `sloggers` TOML config fragment, e.g. the
/// `[logging]` table of a manager's config file.
pub fn from_toml(toml: &str) -> Result<Logger, serdeconv::Error> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml)?;
    Ok(config.build_logger().unwrap_or_else(|_| discard()))
}

/// The default terminal logger: debug level, stderr destination.
pub fn terminal() -> Logger {
    from_toml(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .unwrap_or_else(|_| discard())
}

/// A logger that discards everything. Used as the default when no logger is supplied, so
/// library consumers who don't care about logs pay no setup cost.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
