/// Environment variable that disables the constraint solver by default.
pub const DISABLE_SOLVER_VAR: &str = "RTEN_EXPORT_DISABLE_SOLVER";

/// Environment variable that enables logging of every recorded shape guard.
pub const LOG_GUARDS_VAR: &str = "RTEN_EXPORT_LOG_GUARDS";

/// Interpret a string value such as "1" or "no" as a boolean.
pub fn str_as_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "true" | "t" | "yes" | "y" => Some(true),
        "0" | "false" | "f" | "no" | "n" => Some(false),
        _ => None,
    }
}

/// Return whether a feature flag controlled by an environment variable is
/// enabled.
pub fn env_flag(name: &str, default: bool) -> bool {
    let Ok(value) = std::env::var(name) else {
        return default;
    };
    str_as_bool(&value).unwrap_or_else(|| {
        tracing::warn!("unrecognized boolean value \"{}\" for {}", value, name);
        default
    })
}
