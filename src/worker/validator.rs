use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Why a command line was refused.
///
/// Validation is defense-in-depth over the container boundary: purely
/// syntactic, happy to over-reject creative quoting, but a forbidden word
/// appearing as a standalone token must never slip through.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("command is empty")]
    Empty,
    #[error("command matches forbidden pattern '{0}'")]
    ForbiddenPattern(String),
    #[error("command '{0}' is not whitelisted")]
    NotWhitelisted(String),
    #[error("command could not be parsed")]
    ParseError,
}

impl CommandError {
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::Empty => "empty",
            CommandError::ForbiddenPattern(_) => "forbidden-pattern",
            CommandError::NotWhitelisted(_) => "not-whitelisted",
            CommandError::ParseError => "parse-error",
        }
    }
}

static ALLOWED_COMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // Text processing
        "grep", "egrep", "fgrep", "sed", "awk", "jq", "sort", "uniq", "cut", "tr", "cat", "tee",
        "wc", "head", "tail", "diff", "comm", "column", "fold", "fmt", "nl", "paste", "split",
        "csplit", "strings", "rev", "tac", "join", "expand", "unexpand", "less", "more",
        // File operations
        "ls", "find", "stat", "file", "mkdir", "rmdir", "touch", "cp", "mv", "rm", "ln", "chmod",
        "chown", "chgrp", "du", "df", "tree", "basename", "dirname", "readlink", "realpath",
        // Archives and compression
        "tar", "gzip", "gunzip", "bzip2", "bunzip2", "xz", "unxz", "zip", "unzip", "7z", "zcat",
        "zgrep", "zless",
        // Navigation and environment
        "cd", "pwd", "env", "printenv", "whoami", "id", "date", "uptime", "uname",
        // Language interpreters and build tools
        "python", "python3", "pip", "pip3", "node", "npm", "npx", "ruby", "gem", "perl", "php",
        "java", "javac", "gcc", "g++", "cc", "make", "cargo", "rustc", "go",
        // Version control
        "git", "svn", "hg",
        // Database clients
        "mysql", "psql", "sqlite3", "redis-cli", "mongosh",
        // Shell builtins and arithmetic
        "echo", "printf", "bc", "expr", "test", "true", "false", "seq", "sleep", "timeout",
        "xargs", "which", "type", "read", "export", "set", "unset", "alias", "source",
        // Checksums and codecs
        "md5sum", "sha1sum", "sha256sum", "sha512sum", "cksum", "base64", "base32", "xxd", "od",
        "hexdump",
    ]
    .into_iter()
    .collect()
});

static FORBIDDEN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Network clients
        r"\bcurl\b",
        r"\bwget\b",
        r"\bnc\b",
        r"\bncat\b",
        r"\bssh\b",
        r"\bscp\b",
        r"\bsftp\b",
        r"\brsync\b",
        r"\bftp\b",
        r"\bping\b",
        r"\bdig\b",
        r"\bnslookup\b",
        r"\btelnet\b",
        r"\bsocat\b",
        r"\blsof\b",
        r"\bnetstat\b",
        r"\bifconfig\b",
        r"\bip\b",
        // Privilege escalation
        r"\bsudo\b",
        r"\bsu\b",
        r"\bdoas\b",
        r"\bpkexec\b",
        // Disk operations
        r"\bdd\b",
        r"\bmkfs\b",
        r"\bmount\b",
        r"\bumount\b",
        r"\bfdisk\b",
        r"\bparted\b",
        r"\blosetup\b",
        // Kernel and system control
        r"\bmodprobe\b",
        r"\binsmod\b",
        r"\brmmod\b",
        r"\bsysctl\b",
        r"\bdmesg\b",
        r"\breboot\b",
        r"\bshutdown\b",
        r"\bhalt\b",
        r"\bpoweroff\b",
        r"\bsystemctl\b",
        r"\bservice\b",
        // Container escape vectors
        r"\bdocker\b",
        r"\bkubectl\b",
        r"\bpodman\b",
        r"\brunc\b",
        r"\bchroot\b",
        r"\bunshare\b",
        r"\bnsenter\b",
        // Persistence
        r"\bcrontab\b",
        r"\bat\b",
        r"\bbatch\b",
        // Destructive rm against absolute paths
        r"rm\s+-rf?\s+/",
    ]
    .iter()
    .map(|pattern| Regex::new(&format!("(?i){pattern}")).expect("forbidden pattern compiles"))
    .collect()
});

/// Decide whether a command line may be dispatched into a container.
pub fn validate_command(command: &str) -> Result<(), CommandError> {
    if command.trim().is_empty() {
        return Err(CommandError::Empty);
    }

    // Blacklist over the raw string, quotes and all
    for pattern in FORBIDDEN_PATTERNS.iter() {
        if pattern.is_match(command) {
            return Err(CommandError::ForbiddenPattern(pattern.as_str().to_string()));
        }
    }

    let tokens = shlex::split(command).ok_or(CommandError::ParseError)?;

    // Whitelist the head of every pipeline segment
    for segment in tokens.split(|token| matches!(token.as_str(), "|" | "&&" | "||" | ";")) {
        if let Some(head) = segment.first() {
            if !ALLOWED_COMMANDS.contains(head.as_str()) {
                return Err(CommandError::NotWhitelisted(head.clone()));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_commands() {
        assert!(validate_command("whoami").is_ok());
        assert!(validate_command("pwd").is_ok());
        assert!(validate_command("echo hi > f.txt").is_ok());
        assert!(validate_command("python3 --version").is_ok());
    }

    #[test]
    fn accepts_pipelines_and_connectives() {
        assert!(validate_command("cat data.csv | grep error | wc -l").is_ok());
        assert!(validate_command("cd /workspace && ls -la ; echo done").is_ok());
        assert!(validate_command("test -f x.txt || touch x.txt").is_ok());
    }

    #[test]
    fn rejects_empty_input() {
        assert_eq!(validate_command(""), Err(CommandError::Empty));
        assert_eq!(validate_command("   \t "), Err(CommandError::Empty));
    }

    #[test]
    fn rejects_forbidden_patterns() {
        let err = validate_command("curl http://example.com").unwrap_err();
        match err {
            CommandError::ForbiddenPattern(pattern) => assert!(pattern.contains("curl")),
            other => panic!("expected forbidden pattern, got {other:?}"),
        }

        assert!(matches!(
            validate_command("sudo ls"),
            Err(CommandError::ForbiddenPattern(_))
        ));
        assert!(matches!(
            validate_command("echo hi && wget http://x"),
            Err(CommandError::ForbiddenPattern(_))
        ));
    }

    #[test]
    fn blacklist_runs_before_whitelist() {
        // docker is both unknown to the whitelist and blacklisted; the
        // blacklist wins so the client sees the pattern
        assert!(matches!(
            validate_command("docker ps"),
            Err(CommandError::ForbiddenPattern(_))
        ));
    }

    #[test]
    fn rejects_destructive_rm() {
        assert!(matches!(
            validate_command("rm -rf /"),
            Err(CommandError::ForbiddenPattern(_))
        ));
        assert!(matches!(
            validate_command("rm -rf /workspace/data"),
            Err(CommandError::ForbiddenPattern(_))
        ));
        // Relative rm stays available for workspace hygiene
        assert!(validate_command("rm -rf build").is_ok());
    }

    #[test]
    fn rejects_unwhitelisted_segment_heads() {
        assert_eq!(
            validate_command("frobnicate --all"),
            Err(CommandError::NotWhitelisted("frobnicate".to_string()))
        );
        assert_eq!(
            validate_command("echo hi | frobnicate"),
            Err(CommandError::NotWhitelisted("frobnicate".to_string()))
        );
    }

    #[test]
    fn operators_inside_quotes_are_not_separators() {
        assert!(validate_command("echo 'a | b && c'").is_ok());
        assert_eq!(
            validate_command("echo \"unterminated"),
            Err(CommandError::ParseError)
        );
    }

    #[test]
    fn forbidden_words_match_case_insensitively() {
        assert!(matches!(
            validate_command("CURL http://example.com"),
            Err(CommandError::ForbiddenPattern(_))
        ));
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(CommandError::Empty.kind(), "empty");
        assert_eq!(
            CommandError::ForbiddenPattern("x".into()).kind(),
            "forbidden-pattern"
        );
        assert_eq!(
            CommandError::NotWhitelisted("x".into()).kind(),
            "not-whitelisted"
        );
        assert_eq!(CommandError::ParseError.kind(), "parse-error");
    }
}
