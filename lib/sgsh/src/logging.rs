pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

/// Build the default terminal logger used by all sgsh binaries.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Default logging config must parse");

    config.build_logger().expect("Logger construction failed")
}

/// Resolve an optional parent logger into a child or a discard sink.
#[inline]
pub fn child<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        _ => Logger::root(Discard, o!()),
    }
}
