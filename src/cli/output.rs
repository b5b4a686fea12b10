//! Output helpers shared by the subcommands.
//!
//! Global flags are mirrored into environment variables by `main` so every
//! module can consult them without threading a config value around.

pub fn is_quiet() -> bool {
    std::env::var("UNLIST_QUIET").map(|v| v == "1").unwrap_or(false)
}

pub fn is_json() -> bool {
    std::env::var("UNLIST_JSON").map(|v| v == "1").unwrap_or(false)
}

pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    );
}
