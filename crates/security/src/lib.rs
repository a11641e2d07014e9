//! Security primitives for Kestrel: path containment, shell escaping, and
//! command allowlisting.
//!
//! Provides:
//! - **Path validation**: resolve-then-compare containment to a workspace root
//! - **Shell escaping**: single-quote escaping for POSIX shells
//! - **Command policy**: allowlist and metacharacter checks before any spawn

pub mod command;
pub mod path;
pub mod shell;

pub use command::{
    CommandCheck, CommandPolicy, DEFAULT_ALLOWED_COMMANDS, is_single_command, program_basename,
};
pub use path::{PathValidationError, expand_tilde, is_within_root, resolve, validate_path};
pub use shell::{escape_shell_arg, join_escaped};
