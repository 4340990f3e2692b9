use tracing::Level;

/// Install a global fmt subscriber at the given level.
///
/// Returns false when a subscriber was already installed, so calling this
/// from several tests or from an embedding binary is harmless.
pub fn init_tracing(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Map a textual level from config or environment to a tracing level
pub fn parse_level(value: &str) -> Level {
    match value.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let _ = init_tracing(Level::DEBUG);
        assert!(!init_tracing(Level::DEBUG));
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("bogus"), Level::INFO);
    }
}
