//! Structured command descriptors.
//!
//! A [`CommandSpec`] is a program plus an argument list and the set of exit
//! codes that count as success. Rendering quotes every token, so callers
//! never splice strings together. Pipelines go through the explicit
//! [`CommandSpec::shell`] escape hatch.

use serde::Serialize;
use std::fmt;

/// Exit codes accepted as success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCodes {
    /// Only the listed codes are accepted
    Only(Vec<i32>),
    /// Every exit code is accepted
    Any,
}

impl Default for ExitCodes {
    fn default() -> Self {
        ExitCodes::Only(vec![0])
    }
}

impl ExitCodes {
    /// Returns true if `code` counts as success.
    pub fn accepts(&self, code: i32) -> bool {
        match self {
            ExitCodes::Any => true,
            ExitCodes::Only(codes) => codes.contains(&code),
        }
    }
}

/// A remote command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    sudo: bool,
    expected: ExitCodes,
    raw: bool,
}

impl CommandSpec {
    /// Create a command running `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            sudo: false,
            expected: ExitCodes::default(),
            raw: false,
        }
    }

    /// Create a command from a literal shell line.
    ///
    /// The line is passed to the remote shell untouched. Use this only for
    /// pipelines and redirections.
    pub fn shell(line: impl Into<String>) -> Self {
        Self {
            program: line.into(),
            args: Vec::new(),
            sudo: false,
            expected: ExitCodes::default(),
            raw: true,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run the command with privilege escalation
    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Accept any exit code
    pub fn allow_failure(mut self) -> Self {
        self.expected = ExitCodes::Any;
        self
    }

    /// Accept exactly the given exit codes
    pub fn expect_codes<I: IntoIterator<Item = i32>>(mut self, codes: I) -> Self {
        self.expected = ExitCodes::Only(codes.into_iter().collect());
        self
    }

    /// Program name (or the full line for shell commands)
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument list
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Whether the command runs under sudo
    pub fn is_sudo(&self) -> bool {
        self.sudo
    }

    /// Whether the command is a literal shell line
    pub fn is_raw(&self) -> bool {
        self.raw
    }

    /// Accepted exit codes
    pub fn expected(&self) -> &ExitCodes {
        &self.expected
    }

    /// Returns true if `code` counts as success for this command.
    pub fn accepts(&self, code: i32) -> bool {
        self.expected.accepts(code)
    }

    /// Render the command line, quoting every token.
    pub fn render(&self) -> String {
        if self.raw {
            return self.program.clone();
        }
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|token| shell_words::quote(token).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sudo {
            write!(f, "sudo ")?;
        }
        if self.raw {
            write!(f, "[shell] ")?;
        }
        write!(f, "{}", self.render())
    }
}
