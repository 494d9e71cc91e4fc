//! Device profiles: the per-vendor pattern sets fed into the session core.
//!
//! A profile is plain data. The engine never hardcodes vendor knowledge;
//! everything it needs to drive a device - prompt shape, pager token, error
//! vocabulary, login dialog - arrives through this record. The stock profiles
//! below exist for tests and demos, not as a vendor catalog.

use indexmap::IndexMap;

/// Immutable per-vendor configuration consumed by [`Session`](crate::Session)
/// and the telnet login dialog.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    /// Profile name, used in logs only.
    pub name: String,

    /// Prompt regex. Mandatory. A capture group named `prompt` marks the
    /// stable suffix recorded at connect for tighter matching later.
    pub prompt_pattern: String,

    /// Pager interrupts such as `--More--`. May be empty.
    pub pager_patterns: Vec<String>,

    /// Error vocabulary: name -> regex. Names surface in
    /// [`CmdResult::detected_error`](crate::session::CmdResult).
    pub error_patterns: IndexMap<String, String>,

    /// Question patterns the device may ask mid-command.
    pub question_patterns: Vec<String>,

    /// Login prompt for transports that authenticate in-band (telnet).
    pub login_prompt_pattern: String,

    /// Password prompt for in-band authentication.
    pub password_prompt_pattern: String,

    /// Commands sent right after prompt discovery (pager disabling etc.).
    pub terminal_setup_commands: Vec<String>,

    /// Byte written to continue past a pager interrupt.
    pub pager_continue: u8,
}

impl DeviceProfile {
    /// Create a profile with the given name and prompt pattern; everything
    /// else starts empty.
    pub fn new(name: impl Into<String>, prompt_pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt_pattern: prompt_pattern.into(),
            pager_patterns: vec![],
            error_patterns: IndexMap::new(),
            question_patterns: vec![],
            login_prompt_pattern: r"(?i)(login|username):\s*$".to_string(),
            password_prompt_pattern: r"(?i)password:\s*$".to_string(),
            terminal_setup_commands: vec![],
            pager_continue: b' ',
        }
    }

    /// Add a pager pattern.
    pub fn with_pager(mut self, pattern: impl Into<String>) -> Self {
        self.pager_patterns.push(pattern.into());
        self
    }

    /// Add a named error pattern.
    pub fn with_error(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.error_patterns.insert(name.into(), pattern.into());
        self
    }

    /// Add a question pattern.
    pub fn with_question(mut self, pattern: impl Into<String>) -> Self {
        self.question_patterns.push(pattern.into());
        self
    }

    /// Override the login prompt pattern.
    pub fn with_login_prompt(mut self, pattern: impl Into<String>) -> Self {
        self.login_prompt_pattern = pattern.into();
        self
    }

    /// Override the password prompt pattern.
    pub fn with_password_prompt(mut self, pattern: impl Into<String>) -> Self {
        self.password_prompt_pattern = pattern.into();
        self
    }

    /// Add a terminal setup command.
    pub fn with_setup_command(mut self, command: impl Into<String>) -> Self {
        self.terminal_setup_commands.push(command.into());
        self
    }

    /// Override the pager continuation byte (default: space).
    pub fn with_pager_continue(mut self, byte: u8) -> Self {
        self.pager_continue = byte;
        self
    }

    /// Generic Unix-ish profile. Good enough for lab boxes and tests.
    pub fn generic() -> Self {
        Self::new("generic", r"(?m)^[\w\-.@:~]+[$#>]\s*$")
            .with_error("not_found", r"(?m)command not found")
            .with_error("permission", r"(?m)[Pp]ermission denied")
    }

    /// IOS-like profile used by tests and demos.
    pub fn ios_like() -> Self {
        Self::new("ios_like", r"(?m)^[\w\-.]+(?:\(config[^)]*\))?[#>]\s*$")
            .with_pager(r" ?--+\s?[Mm]ore\s?--+")
            .with_error("invalid", r"(?m)^% (?:Invalid|Incomplete|Ambiguous).*")
            .with_question(r"\[confirm\]\s*$")
            .with_setup_command("terminal length 0")
            .with_setup_command("terminal width 512")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_patterns() {
        let profile = DeviceProfile::new("test", r"r>\s*$")
            .with_pager("--More--")
            .with_error("invalid", r"^% .*")
            .with_question(r"confirm\?");

        assert_eq!(profile.pager_patterns, vec!["--More--"]);
        assert_eq!(profile.error_patterns.get("invalid").unwrap(), r"^% .*");
        assert_eq!(profile.question_patterns.len(), 1);
        assert_eq!(profile.pager_continue, b' ');
    }

    #[test]
    fn error_pattern_order_is_preserved() {
        let profile = DeviceProfile::new("test", "p")
            .with_error("z_first", "a")
            .with_error("a_second", "b");
        let names: Vec<&String> = profile.error_patterns.keys().collect();
        assert_eq!(names, vec!["z_first", "a_second"]);
    }
}
