//! Context builder for AI requests
//!
//! Trims terminal output to a bounded tail, classifies what the user is
//! doing (OS, shell, command family, risk), and derives the cache key used
//! to deduplicate identical prompts server-side.

use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Lines of terminal output kept
const MAX_LINES: usize = 200;

/// Byte cap applied after the line trim
const MAX_BYTES: usize = 32 * 1024;

/// Characters of terminal output hashed into the cache key
const CACHE_KEY_PREFIX_CHARS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsHint {
    Linux,
    Darwin,
    Windows,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellHint {
    Bash,
    Zsh,
    Fish,
    Powershell,
    Cmd,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Docker,
    Git,
    Nodejs,
    Python,
    Database,
    Network,
    System,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// `rm -rf <absolute path>`; the path prefix decides whether it is
/// destructive (see [`assess_risk`])
static RM_RF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\brm\s+(?:-[a-zA-Z]*r[a-zA-Z]*f[a-zA-Z]*|-[a-zA-Z]*f[a-zA-Z]*r[a-zA-Z]*)\s+(/\S*)")
        .expect("rm -rf pattern")
});

/// Absolute prefixes where recursive deletion is considered routine
const SAFE_RM_PREFIXES: [&str; 3] = ["/home", "/tmp", "/var/tmp"];

static HIGH_RISK: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\bmkfs(\.\w+)?\s",
        r"\bdd\s+if=\S+\s+of=/dev/[sh]d",
        r"\bshutdown\s+-[hr]\b",
        r"\breboot\b",
        r"\binit\s+[06]\b",
        r":\(\)\s*\{\s*:\|:\s*&\s*\}\s*;?\s*:",
    ]
    .iter()
    .map(|re| Regex::new(re).expect("high risk pattern"))
    .collect()
});

static MEDIUM_RISK: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\bsudo\s",
        r"\bchmod\s+777\b",
        r"\bchown\s",
        r"\biptables\b",
        r"\bfirewall",
    ]
    .iter()
    .map(|re| Regex::new(re).expect("medium risk pattern"))
    .collect()
});

static ERROR_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)\b(error|failed|failure|fatal|panic|traceback|exception|command not found|no such file|permission denied|segmentation fault)\b",
    )
    .expect("error markers")
});

/// Everything the pipeline knows about one request's terminal context.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalContext {
    pub terminal_output: String,
    pub current_input: String,
    pub os_hint: OsHint,
    pub shell_hint: ShellHint,
    pub error_detected: bool,
    pub command_type: CommandType,
    pub risk_level: RiskLevel,
    pub cache_key: String,
}

/// Build the context for one request from raw terminal output and the
/// user's current input line.
pub fn build(terminal_output: &str, current_input: &str) -> TerminalContext {
    let trimmed = trim_output(terminal_output, MAX_LINES, MAX_BYTES);
    let combined = format!("{}\n{}", trimmed, current_input);

    let os_hint = detect_os(&combined);
    let shell_hint = detect_shell(&trimmed);
    let command_type = classify_command(current_input);
    let risk_level = assess_risk(&combined);
    let error_detected = ERROR_MARKERS.is_match(&trimmed);
    let cache_key = cache_key(&trimmed, current_input, os_hint, shell_hint);

    TerminalContext {
        terminal_output: trimmed,
        current_input: current_input.to_string(),
        os_hint,
        shell_hint,
        error_detected,
        command_type,
        risk_level,
        cache_key,
    }
}

/// Keep the last `max_lines` lines, then the last `max_bytes` bytes without
/// splitting a UTF-8 sequence.
pub fn trim_output(output: &str, max_lines: usize, max_bytes: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let tail = if lines.len() > max_lines {
        lines[lines.len() - max_lines..].join("\n")
    } else {
        output.to_string()
    };

    if tail.len() <= max_bytes {
        return tail;
    }

    let mut start = tail.len() - max_bytes;
    while !tail.is_char_boundary(start) {
        start += 1;
    }
    tail[start..].to_string()
}

fn detect_os(text: &str) -> OsHint {
    let lower = text.to_lowercase();
    if lower.contains("darwin") || lower.contains("macos") || lower.contains("mac os") {
        OsHint::Darwin
    } else if lower.contains("windows")
        || lower.contains("c:\\")
        || lower.contains("powershell")
    {
        OsHint::Windows
    } else if lower.contains("linux")
        || lower.contains("ubuntu")
        || lower.contains("debian")
        || lower.contains("centos")
        || lower.contains("/proc/")
    {
        OsHint::Linux
    } else {
        OsHint::Unknown
    }
}

/// Shell from shebang-like tokens or the prompt suffix of the last lines.
fn detect_shell(text: &str) -> ShellHint {
    let lower = text.to_lowercase();
    for (token, hint) in [
        ("/bin/zsh", ShellHint::Zsh),
        ("zsh:", ShellHint::Zsh),
        ("/bin/bash", ShellHint::Bash),
        ("bash:", ShellHint::Bash),
        ("/bin/fish", ShellHint::Fish),
        ("fish:", ShellHint::Fish),
        ("powershell", ShellHint::Powershell),
        ("ps c:\\", ShellHint::Powershell),
    ] {
        if lower.contains(token) {
            return hint;
        }
    }

    for line in text.lines().rev().take(10) {
        let line = line.trim_end();
        if line.ends_with('$') || line.ends_with("$ ") {
            return ShellHint::Bash;
        }
        if line.ends_with('%') || line.ends_with("% ") {
            return ShellHint::Zsh;
        }
        if line.ends_with('>') || line.ends_with("> ") {
            return ShellHint::Cmd;
        }
    }
    ShellHint::Unknown
}

fn classify_command(input: &str) -> CommandType {
    let first = input
        .trim()
        .trim_start_matches("sudo ")
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase();

    match first.as_str() {
        "docker" | "docker-compose" | "podman" => CommandType::Docker,
        "git" => CommandType::Git,
        "node" | "npm" | "npx" | "yarn" | "pnpm" => CommandType::Nodejs,
        "python" | "python3" | "pip" | "pip3" | "poetry" => CommandType::Python,
        "mysql" | "psql" | "mongosh" | "mongo" | "redis-cli" | "sqlite3" => CommandType::Database,
        "curl" | "wget" | "ping" | "ssh" | "scp" | "netstat" | "ss" | "dig" | "nslookup" => {
            CommandType::Network
        }
        "top" | "htop" | "ps" | "kill" | "killall" | "systemctl" | "service" | "df" | "du"
        | "free" | "uname" => CommandType::System,
        _ => CommandType::General,
    }
}

pub fn assess_risk(text: &str) -> RiskLevel {
    for capture in RM_RF.captures_iter(text) {
        let path = &capture[1];
        let safe = SAFE_RM_PREFIXES.iter().any(|prefix| {
            path.strip_prefix(prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        });
        if !safe {
            return RiskLevel::High;
        }
    }
    if HIGH_RISK.iter().any(|re| re.is_match(text)) {
        RiskLevel::High
    } else if MEDIUM_RISK.iter().any(|re| re.is_match(text)) {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// md5 over the head of the terminal output plus the input and hints.
fn cache_key(output: &str, input: &str, os: OsHint, shell: ShellHint) -> String {
    let prefix: String = output.chars().take(CACHE_KEY_PREFIX_CHARS).collect();
    let mut hasher = Md5::new();
    hasher.update(prefix.as_bytes());
    hasher.update(input.as_bytes());
    hasher.update(format!("{:?}|{:?}", os, shell).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_to_line_and_byte_caps() {
        let output: String = (0..500)
            .map(|i| format!("line {}\n", i))
            .collect();
        let trimmed = trim_output(&output, 200, 32 * 1024);
        assert_eq!(trimmed.lines().count(), 200);
        assert!(trimmed.starts_with("line 300"));

        let wide = "€".repeat(20_000); // 3 bytes each
        let trimmed = trim_output(&wide, 200, 1000);
        assert!(trimmed.len() <= 1000);
        assert!(trimmed.chars().all(|c| c == '€'));
    }

    #[test]
    fn os_and_shell_hints() {
        let ctx = build("Linux prod-1 5.15.0 x86_64 GNU/Linux\nuser@prod-1:~$ ", "ls");
        assert_eq!(ctx.os_hint, OsHint::Linux);
        assert_eq!(ctx.shell_hint, ShellHint::Bash);

        let ctx = build("Darwin laptop 23.1.0\nlaptop% ", "ls");
        assert_eq!(ctx.os_hint, OsHint::Darwin);
        assert_eq!(ctx.shell_hint, ShellHint::Zsh);

        let ctx = build("Microsoft Windows\nC:\\Users\\me> ", "dir");
        assert_eq!(ctx.os_hint, OsHint::Windows);
        assert_eq!(ctx.shell_hint, ShellHint::Cmd);
    }

    #[test]
    fn command_classification() {
        assert_eq!(classify_command("docker ps -a"), CommandType::Docker);
        assert_eq!(classify_command("git push origin main"), CommandType::Git);
        assert_eq!(classify_command("npm install"), CommandType::Nodejs);
        assert_eq!(classify_command("pip install requests"), CommandType::Python);
        assert_eq!(classify_command("psql -U admin"), CommandType::Database);
        assert_eq!(classify_command("curl -s https://x"), CommandType::Network);
        assert_eq!(classify_command("systemctl restart nginx"), CommandType::System);
        assert_eq!(classify_command("sudo systemctl stop nginx"), CommandType::System);
        assert_eq!(classify_command("echo hi"), CommandType::General);
    }

    #[test]
    fn risk_levels() {
        assert_eq!(assess_risk("rm -rf /etc"), RiskLevel::High);
        assert_eq!(assess_risk("rm -rf /tmp/build"), RiskLevel::Low);
        assert_eq!(assess_risk("rm -rf /home/me/junk"), RiskLevel::Low);
        assert_eq!(assess_risk("mkfs.ext4 /dev/sdb1"), RiskLevel::High);
        assert_eq!(assess_risk("dd if=/dev/zero of=/dev/sda"), RiskLevel::High);
        assert_eq!(assess_risk("shutdown -h now"), RiskLevel::High);
        assert_eq!(assess_risk(":(){ :|: & };:"), RiskLevel::High);
        assert_eq!(assess_risk("sudo apt update"), RiskLevel::Medium);
        assert_eq!(assess_risk("chmod 777 /srv/app"), RiskLevel::Medium);
        assert_eq!(assess_risk("ls -la"), RiskLevel::Low);
    }

    #[test]
    fn error_detection() {
        let ctx = build("bash: foo: command not found", "foo");
        assert!(ctx.error_detected);
        let ctx = build("all good here", "ls");
        assert!(!ctx.error_detected);
    }

    #[test]
    fn cache_key_is_stable_and_sensitive() {
        let a = build("output", "ls");
        let b = build("output", "ls");
        let c = build("output", "ls -la");
        assert_eq!(a.cache_key, b.cache_key);
        assert_ne!(a.cache_key, c.cache_key);
        assert_eq!(a.cache_key.len(), 32);
    }
}
