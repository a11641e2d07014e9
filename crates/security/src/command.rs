//! Command allowlisting for everything Kestrel spawns.
//!
//! Discovery commands, tool call commands, MCP stdio servers and shell tool
//! invocations are vetted here before a process is created. A command is
//! accepted only when its program basename is on the allowlist and the line
//! carries no shell metacharacters, redirections, or sensitive-path
//! references.

use std::collections::BTreeSet;
use std::path::Path;

/// Programs that are always allowed.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "ls", "cat", "head", "tail", "echo", "pwd", "date", "whoami", "wc", "grep", "find", "which",
    "git", "cargo", "rustc", "node", "npm", "npx", "python", "python3", "pip", "uv", "uvx",
    "deno",
];

/// Characters that make a command line mean something other than argv.
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '$', '`', '>', '<', '(', ')', '{', '}', '\n'];

/// Locations a command line must never mention.
const SENSITIVE_PATHS: &[&str] = &[
    "~/.ssh",
    "~/.gnupg",
    "~/.aws",
    "/etc/shadow",
    "/etc/sudoers",
    "/etc/passwd",
    "/root/.ssh",
];

/// Result of checking a command line.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandCheck {
    /// Safe to spawn as `argv[0]` with the remaining arguments.
    Allowed { argv: Vec<String> },
    /// Refused before spawn.
    Denied { reason: String },
}

/// Allowlist policy applied to command lines.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed: BTreeSet<String>,
}

impl CommandPolicy {
    /// Default allowlist plus `extra` program names.
    pub fn new(extra: &[String]) -> Self {
        let mut allowed: BTreeSet<String> =
            DEFAULT_ALLOWED_COMMANDS.iter().map(|s| s.to_string()).collect();
        allowed.extend(extra.iter().cloned());
        Self { allowed }
    }

    pub fn is_allowed_program(&self, program: &str) -> bool {
        self.allowed.contains(program_basename(program))
    }

    /// Vet a full command line and split it into argv.
    ///
    /// Rules:
    /// - The line must split cleanly with shell quoting rules
    /// - No shell metacharacters or redirections outside quotes
    /// - No argument may reference a sensitive path
    /// - The program basename must be allowlisted
    pub fn check(&self, command_line: &str) -> CommandCheck {
        if let Some(c) = unquoted_metacharacter(command_line) {
            return CommandCheck::Denied {
                reason: format!("shell metacharacter '{}' is not allowed", c.escape_default()),
            };
        }

        let Some(argv) = shlex::split(command_line) else {
            return CommandCheck::Denied {
                reason: "unbalanced quotes".into(),
            };
        };
        if argv.is_empty() {
            return CommandCheck::Denied {
                reason: "empty command".into(),
            };
        }

        self.check_argv(argv)
    }

    /// Vet an already-split argv.
    pub fn check_argv(&self, argv: Vec<String>) -> CommandCheck {
        let Some(program) = argv.first() else {
            return CommandCheck::Denied {
                reason: "empty command".into(),
            };
        };

        if let Some(arg) = argv.iter().find(|a| mentions_sensitive_path(a)) {
            return CommandCheck::Denied {
                reason: format!("argument '{arg}' references a sensitive path"),
            };
        }

        if !self.is_allowed_program(program) {
            return CommandCheck::Denied {
                reason: format!(
                    "'{}' is not in the command allowlist ({} commands configured)",
                    program_basename(program),
                    self.allowed.len()
                ),
            };
        }

        CommandCheck::Allowed { argv }
    }
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new(&[])
    }
}

/// True when `line` is one plain program invocation: it splits cleanly, has
/// no unquoted metacharacters (so no chaining, pipes or substitutions) and
/// mentions no sensitive path. The program itself is not checked.
pub fn is_single_command(line: &str) -> bool {
    if unquoted_metacharacter(line).is_some() {
        return false;
    }
    match shlex::split(line) {
        Some(argv) => !argv.is_empty() && !argv.iter().any(|a| mentions_sensitive_path(a)),
        None => false,
    }
}

/// `/usr/bin/git` and `git` both name `git`.
pub fn program_basename(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
}

/// The first metacharacter that appears outside single or double quotes.
fn unquoted_metacharacter(line: &str) -> Option<char> {
    let mut single = false;
    let mut double = false;
    let mut escaped = false;
    for c in line.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if !single => escaped = true,
            '\'' if !double => single = !single,
            '"' if !single => double = !double,
            // `$` and backticks still expand inside double quotes.
            '$' | '`' if double => return Some(c),
            c if !single && !double && SHELL_METACHARACTERS.contains(&c) => return Some(c),
            _ => {}
        }
    }
    None
}

fn mentions_sensitive_path(arg: &str) -> bool {
    let home = std::env::var("HOME").ok();
    SENSITIVE_PATHS.iter().any(|p| {
        if arg.contains(p) {
            return true;
        }
        match (&home, p.strip_prefix('~')) {
            (Some(home), Some(rest)) => arg.contains(&format!("{home}{rest}")),
            _ => false,
        }
    })
}
