//! Backend command templates, rendered invocations and parser plumbing shared
//! by every capability manager.

use std::fmt;

use tracing::debug;

use crate::error::{Error, Result};

/// A fixed argv for one backend operation. Arguments may contain `{key}`
/// placeholders which are substituted per argument at render time, so a
/// substituted value can never split into extra arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: &'static str,
    pub args: &'static [&'static str],
    /// Exit codes besides 0 that still mean the operation succeeded.
    pub ok_codes: &'static [i32],
}

impl CommandTemplate {
    pub const fn new(program: &'static str, args: &'static [&'static str]) -> Self {
        Self {
            program,
            args,
            ok_codes: &[],
        }
    }

    pub const fn tolerating(self, ok_codes: &'static [i32]) -> Self {
        Self { ok_codes, ..self }
    }

    pub fn render(&self, vars: &[(&str, &str)]) -> Invocation {
        Invocation {
            program: self.program.to_string(),
            args: self.args.iter().map(|arg| substitute(arg, vars)).collect(),
            ok_codes: self.ok_codes,
        }
    }
}

fn substitute(arg: &str, vars: &[(&str, &str)]) -> String {
    let mut out = arg.to_string();
    for (key, value) in vars {
        let placeholder = format!("{{{key}}}");
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, value);
        }
    }
    out
}

/// A concrete program + argument vector ready for the executor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub ok_codes: &'static [i32],
}

impl Invocation {
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv().join(" "))
    }
}

/// Records recovered from free-text tool output plus the number of
/// non-blank lines that could not be understood.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub records: Vec<T>,
    pub skipped: usize,
}

impl<T> Default for Parsed<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            skipped: 0,
        }
    }
}

impl<T> Parsed<T> {
    pub fn push(&mut self, record: T) {
        self.records.push(record);
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    pub fn into_records(self, tool: &str) -> Vec<T> {
        if self.skipped > 0 {
            debug!(tool, skipped = self.skipped, kept = self.records.len(), "skipped unparsable output lines");
        }
        self.records
    }
}

pub type ParseFn<T> = fn(&str) -> Parsed<T>;

/// Rejects values that are empty, contain whitespace or control characters,
/// or could be mistaken for an option by the backend tool.
pub fn validate_name(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{kind} name is empty")));
    }
    if value.starts_with('-') {
        return Err(Error::InvalidArgument(format!(
            "{kind} name may not start with '-': {value}"
        )));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidArgument(format!(
            "{kind} name contains whitespace or control characters: {value:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_inside_arguments() {
        let t = CommandTemplate::new("firewall-cmd", &["--permanent", "--add-port={port}/{proto}"]);
        let inv = t.render(&[("port", "22"), ("proto", "tcp")]);
        assert_eq!(inv.argv(), vec!["firewall-cmd", "--permanent", "--add-port=22/tcp"]);
    }

    #[test]
    fn substituted_value_stays_one_argument() {
        let t = CommandTemplate::new("apt", &["install", "-y", "{name}"]);
        let inv = t.render(&[("name", "foo; rm -rf /")]);
        assert_eq!(inv.args.len(), 3);
        assert_eq!(inv.args[2], "foo; rm -rf /");
    }

    #[test]
    fn unknown_placeholders_are_left_alone() {
        let t = CommandTemplate::new("dpkg-query", &["-W", r"-f=${Package}\t${Version}\n"]);
        let inv = t.render(&[("name", "x")]);
        assert_eq!(inv.args[1], r"-f=${Package}\t${Version}\n");
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_name("package", "nginx").is_ok());
        assert!(validate_name("package", "").is_err());
        assert!(validate_name("package", "--purge").is_err());
        assert!(validate_name("package", "two words").is_err());
    }
}
