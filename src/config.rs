/// Environment variable enabling the post-run instruction count report.
pub const INST_COUNTS_ENV: &str = "OCLGRIND_INST_COUNTS";
/// Environment variable enabling the interactive debugger.
pub const INTERACTIVE_ENV: &str = "OCLGRIND_INTERACTIVE";
/// Environment variable restricting execution to the first and last group.
pub const QUICK_ENV: &str = "OCLGRIND_QUICK";

/// Device modes, fixed at startup.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub interactive: bool,
    pub show_inst_counts: bool,
    pub quick_mode: bool,
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            interactive: env_enabled(INTERACTIVE_ENV),
            show_inst_counts: env_enabled(INST_COUNTS_ENV),
            quick_mode: env_enabled(QUICK_ENV),
        }
    }
}

// only the exact string "1" counts as enabled
fn env_enabled(name: &str) -> bool {
    std::env::var(name).map_or(false, |value| value == "1")
}
