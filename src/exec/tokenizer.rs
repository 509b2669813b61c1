//! Command line tokenizer.
//!
//! Splits the raw line sent by a client into an argument vector. There is no
//! quoting or escaping: tokens are separated by spaces and nothing else.

/// Default cap on the number of arguments, command name included.
pub const MAX_ARGS: usize = 100;

/// Owned argument vector for one command cycle.
///
/// The first element is the command name. A vector built from an empty line
/// holds a single empty placeholder, so it is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgVector {
    args: Vec<String>,
}

impl ArgVector {
    /// The command name (possibly the empty placeholder).
    pub fn command(&self) -> &str {
        &self.args[0]
    }

    /// Arguments after the command name.
    pub fn arguments(&self) -> &[String] {
        &self.args[1..]
    }

    /// Every slot, command name first.
    pub fn as_slice(&self) -> &[String] {
        &self.args
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// True when the line held nothing but whitespace.
    pub fn is_placeholder(&self) -> bool {
        self.args.len() == 1 && self.args[0].is_empty()
    }
}

/// Strip the line terminator a client sends after its command.
fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Trim leading and trailing spaces only.
fn trim_spaces(token: &str) -> &str {
    token.trim_matches(' ')
}

/// Tokenize a command line into at most `max_args` arguments.
///
/// Runs of spaces never yield empty tokens. Anything past the `max_args`-th
/// token is discarded.
pub fn tokenize(line: &str, max_args: usize) -> ArgVector {
    let max_args = max_args.max(1);
    let mut args: Vec<String> = strip_line_ending(line)
        .split(' ')
        .map(trim_spaces)
        .filter(|token| !token.is_empty())
        .take(max_args)
        .map(str::to_owned)
        .collect();

    if args.is_empty() {
        args.push(String::new());
    }

    ArgVector { args }
}

/// Decode a raw command buffer and tokenize it.
///
/// The buffer is cut at its first NUL byte, if any. Invalid UTF-8 is
/// replaced rather than rejected.
pub fn tokenize_bytes(raw: &[u8], max_args: usize) -> ArgVector {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let line = String::from_utf8_lossy(&raw[..end]);
    tokenize(&line, max_args)
}
