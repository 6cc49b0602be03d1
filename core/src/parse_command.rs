//! Request normalization: splitting wrapped command strings, stripping
//! `KEY=value` prefixes, and recognizing `bash -c` / `sh -c` wrappers so the
//! policy always evaluates the command that will actually run.
//!
//! This is a purpose-built tokenizer rather than an external shell: the
//! grammar here is exactly what the allow/deny pipeline assumes, and any
//! drift between the two would open a policy gap.

use crate::error::Result;
use crate::error::ShemcpErr;

/// Quote- and escape-aware splitter on ASCII whitespace.
///
/// Single quotes are literal until the closing quote; inside double quotes a
/// backslash consumes the following character; outside quotes a backslash
/// emits the next character verbatim. Unbalanced quotes are tolerated and
/// the current token is emitted at end of input.
pub fn tokenize_command_string(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars();

    #[derive(PartialEq)]
    enum QuoteState {
        None,
        Single,
        Double,
    }
    let mut quote = QuoteState::None;

    while let Some(ch) = chars.next() {
        match quote {
            QuoteState::None => match ch {
                '\'' => {
                    quote = QuoteState::Single;
                    in_token = true;
                }
                '"' => {
                    quote = QuoteState::Double;
                    in_token = true;
                }
                '\\' => {
                    in_token = true;
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    in_token = true;
                    current.push(c);
                }
            },
            QuoteState::Single => match ch {
                '\'' => quote = QuoteState::None,
                c => current.push(c),
            },
            QuoteState::Double => match ch {
                '"' => quote = QuoteState::None,
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                c => current.push(c),
            },
        }
    }

    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Single-space join with no re-quoting. Policy regexes match against this
/// exact reconstruction, so it must stay stable.
pub fn reconstruct_command_line(tokens: &[String]) -> String {
    tokens.join(" ")
}

/// A command with its leading `KEY=value` assignments split off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrippedCommand {
    /// The raw prefix tokens, preserved so `env_tokens + [cmd] + args`
    /// recovers the original invocation.
    pub env_tokens: Vec<String>,
    /// The same prefix split into name/value pairs.
    pub env_vars: Vec<(String, String)>,
    pub cmd: String,
    pub args: Vec<String>,
}

/// Extracts leading `KEY=value` assignments from `cmd` + `args`. A token is
/// an assignment iff it contains `=` and does not start with `-`, which
/// keeps `--flag=value` attached to the command.
pub fn strip_env_prefix(cmd: &str, args: &[String]) -> Result<StrippedCommand> {
    let mut tokens = Vec::with_capacity(args.len() + 1);
    tokens.push(cmd.to_string());
    tokens.extend(args.iter().cloned());

    let mut env_tokens = Vec::new();
    let mut env_vars = Vec::new();
    let mut rest = tokens.into_iter();

    while let Some(token) = rest.next() {
        if let Some(eq) = token.find('=')
            && !token.starts_with('-')
        {
            env_vars.push((token[..eq].to_string(), token[eq + 1..].to_string()));
            env_tokens.push(token);
            continue;
        }
        return Ok(StrippedCommand {
            env_tokens,
            env_vars,
            cmd: token,
            args: rest.collect(),
        });
    }

    Err(ShemcpErr::NoCommandAfterEnv)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Bash,
    Sh,
}

impl ShellKind {
    pub fn program(self) -> &'static str {
        match self {
            ShellKind::Bash => "/bin/bash",
            ShellKind::Sh => "/bin/sh",
        }
    }

    /// Strict-mode flags injected ahead of `-c`. `pipefail` is not POSIX,
    /// so `sh` only gets `-e`.
    pub fn strict_flags(self) -> &'static [&'static str] {
        match self {
            ShellKind::Bash => &["-o", "pipefail", "-o", "errexit"],
            ShellKind::Sh => &["-e"],
        }
    }

    fn from_cmd(cmd: &str) -> Option<Self> {
        match cmd {
            "bash" => Some(ShellKind::Bash),
            "sh" => Some(ShellKind::Sh),
            _ => None,
        }
    }
}

/// Outcome of shell-wrapper recognition.
#[derive(Debug, Clone, PartialEq)]
pub struct WrapperParse {
    pub is_wrapper: bool,
    pub shell: Option<ShellKind>,
    pub should_use_login: bool,
    /// The argument to `-c`, when wrapped.
    pub command_string: Option<String>,
    /// User flags (other than `-l`/`-c`) to replay on the spawn line.
    pub flags_before_command: Vec<String>,
    /// Index into the original args of the first trailing positional
    /// parameter after the command string.
    pub args_after_command: usize,
    /// First token of the command that policy should inspect.
    pub executable_to_check: String,
}

/// Recognizes `bash`/`sh` used as a `-c` wrapper and decomposes the flag
/// cluster grammar: `l` anywhere marks login mode, `c` demands the command
/// string from the next argument, `o` consumes a following option value,
/// and any other short flag is re-emitted individually.
pub fn parse_shell_wrapper(cmd: &str, args: &[String]) -> Result<WrapperParse> {
    let shell = ShellKind::from_cmd(cmd);
    let wraps = shell.is_some() && args.first().is_some_and(|arg| arg.starts_with('-'));
    let Some(shell) = shell.filter(|_| wraps) else {
        return Ok(WrapperParse {
            is_wrapper: false,
            shell: None,
            should_use_login: false,
            command_string: None,
            flags_before_command: Vec::new(),
            args_after_command: 0,
            executable_to_check: cmd.to_string(),
        });
    };

    let mut flags_before_command = Vec::new();
    let mut should_use_login = false;
    let mut command_string: Option<String> = None;
    let mut args_after_command = args.len();
    let mut i = 0;

    while i < args.len() {
        let arg = &args[i];
        if !arg.starts_with('-') {
            break;
        }
        if arg.starts_with("--") {
            flags_before_command.push(arg.clone());
            i += 1;
            continue;
        }

        let mut expects_command = false;
        let mut expects_value = false;
        for ch in arg.chars().skip(1) {
            match ch {
                'l' => should_use_login = true,
                'c' => expects_command = true,
                'o' => {
                    flags_before_command.push("-o".to_string());
                    expects_value = true;
                }
                other => flags_before_command.push(format!("-{other}")),
            }
        }
        i += 1;

        if expects_command {
            match args.get(i) {
                Some(command) => {
                    command_string = Some(command.clone());
                    args_after_command = i + 1;
                }
                None => return Err(ShemcpErr::MissingCommandString),
            }
            break;
        }
        if expects_value
            && let Some(value) = args.get(i)
            && !value.starts_with('-')
        {
            flags_before_command.push(value.clone());
            i += 1;
        }
    }

    let command_string = command_string.ok_or(ShemcpErr::MissingDashC)?;
    let inner_tokens = tokenize_command_string(&command_string);
    let Some(executable_to_check) = inner_tokens.first().cloned() else {
        return Err(ShemcpErr::EmptyCommandString);
    };

    Ok(WrapperParse {
        is_wrapper: true,
        shell: Some(shell),
        should_use_login,
        command_string: Some(command_string),
        flags_before_command,
        args_after_command,
        executable_to_check,
    })
}
