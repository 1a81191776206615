//! Declarative command-line option schema and parser.
//!
//! Every plugin and the supervisor itself describe their options as data
//! (an [`OptionSchema`]) rather than writing ad hoc argument loops. The
//! parser supports the conveniences original TSDuck command lines rely
//! on: long-option abbreviation, `@file` argument-file expansion (with
//! `@@` as an escape for a literal leading `@`), thousands-separator
//! stripping in numeric values, `0x`/`0X` hex parsing, and per-option
//! occurrence-count bounds. Parse errors accumulate instead of aborting
//! on the first one, so a user sees every mistake in one pass.

use std::collections::HashMap;

use smallvec::SmallVec;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgsError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("ambiguous option '{0}': matches {1}")]
    AmbiguousOption(String, String),
    #[error("option '{0}' requires a value")]
    MissingValue(String),
    #[error("option '{0}' does not take a value")]
    UnexpectedValue(String),
    #[error("invalid integer value '{1}' for option '{0}'")]
    InvalidInteger(String, String),
    #[error("value {1} for option '{0}' out of range [{2}, {3}]")]
    OutOfRange(String, i64, i64, i64),
    #[error("option '{0}' given {1} times, expected between {2} and {3}")]
    BadOccurrenceCount(String, usize, usize, usize),
    #[error("cannot read argument file '{0}': {1}")]
    ArgFileUnreadable(String, String),
    #[error("{0} error(s) while parsing arguments:\n{1}")]
    Accumulated(usize, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// A pure presence/absence switch; never takes a value.
    Flag,
    /// An arbitrary string value.
    String,
    /// A signed integer, optionally hex (`0x...`) or thousands-separated
    /// (`1,000,000` / `1_000_000`).
    Integer,
}

/// Declarative description of one option (`--name` / `-n`).
#[derive(Debug, Clone)]
pub struct OptionSpec {
    pub name: &'static str,
    pub short: Option<char>,
    pub kind: ValueKind,
    pub min_occurrences: usize,
    pub max_occurrences: usize,
    pub int_range: Option<(i64, i64)>,
}

impl OptionSpec {
    pub fn flag(name: &'static str) -> Self {
        OptionSpec {
            name,
            short: None,
            kind: ValueKind::Flag,
            min_occurrences: 0,
            max_occurrences: usize::MAX,
            int_range: None,
        }
    }

    pub fn string(name: &'static str) -> Self {
        OptionSpec {
            name,
            short: None,
            kind: ValueKind::String,
            min_occurrences: 0,
            max_occurrences: usize::MAX,
            int_range: None,
        }
    }

    pub fn integer(name: &'static str) -> Self {
        OptionSpec {
            name,
            short: None,
            kind: ValueKind::Integer,
            min_occurrences: 0,
            max_occurrences: usize::MAX,
            int_range: None,
        }
    }

    pub fn short(mut self, c: char) -> Self {
        self.short = Some(c);
        self
    }

    pub fn occurrences(mut self, min: usize, max: usize) -> Self {
        self.min_occurrences = min;
        self.max_occurrences = max;
        self
    }

    pub fn range(mut self, min: i64, max: i64) -> Self {
        self.int_range = Some((min, max));
        self
    }
}

/// A full set of option declarations for one plugin or the supervisor.
#[derive(Debug, Clone, Default)]
pub struct OptionSchema {
    specs: Vec<OptionSpec>,
}

impl OptionSchema {
    pub fn empty() -> Self {
        OptionSchema { specs: Vec::new() }
    }

    pub fn new(specs: Vec<OptionSpec>) -> Self {
        OptionSchema { specs }
    }

    /// The predefined options every plugin and the supervisor accept,
    /// mirroring the always-available `--help`/`--version`/`--verbose`/
    /// `--debug[=level]` family.
    pub fn with_standard_options(mut self) -> Self {
        self.specs.push(OptionSpec::flag("help").occurrences(0, 1));
        self.specs.push(OptionSpec::flag("version").occurrences(0, 1));
        self.specs
            .push(OptionSpec::flag("verbose").short('v').occurrences(0, usize::MAX));
        self.specs.push(
            OptionSpec {
                name: "debug",
                short: Some('d'),
                kind: ValueKind::Integer,
                min_occurrences: 0,
                max_occurrences: 1,
                int_range: Some((0, 99)),
            },
        );
        self
    }

    fn find<'a>(&'a self, token: &str) -> Result<&'a OptionSpec, ArgsError> {
        if let Some(spec) = self.specs.iter().find(|s| s.name == token) {
            return Ok(spec);
        }
        let matches: Vec<&OptionSpec> =
            self.specs.iter().filter(|s| s.name.starts_with(token)).collect();
        match matches.len() {
            0 => Err(ArgsError::UnknownOption(token.to_string())),
            1 => Ok(matches[0]),
            _ => {
                let names: Vec<&str> = matches.iter().map(|s| s.name).collect();
                Err(ArgsError::AmbiguousOption(token.to_string(), names.join(", ")))
            }
        }
    }

    fn find_short(&self, c: char) -> Result<&OptionSpec, ArgsError> {
        self.specs
            .iter()
            .find(|s| s.short == Some(c))
            .ok_or_else(|| ArgsError::UnknownOption(c.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Flag,
    Str(String),
    Int(i64),
}

/// Parsed option values plus leftover positional parameters, keyed by
/// option name. Each option accumulates every occurrence's value in a
/// small inline vector: in practice a plugin option is given zero, one,
/// or a handful of times, so `SmallVec` avoids a heap allocation for the
/// overwhelmingly common case while still growing for the rare option
/// that legitimately repeats many times (e.g. repeated `-v`).
#[derive(Debug, Clone, Default)]
pub struct ParsedArgs {
    values: HashMap<String, SmallVec<[ArgValue; 4]>>,
    pub positional: Vec<String>,
}

impl ParsedArgs {
    pub fn empty() -> Self {
        ParsedArgs::default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.values.get(name).map(|v| v.len()).unwrap_or(0)
    }

    pub fn present(&self, name: &str) -> bool {
        self.count(name) > 0
    }

    pub fn value_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name)?.first()? {
            ArgValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn value_int(&self, name: &str) -> Option<i64> {
        match self.values.get(name)?.first()? {
            ArgValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn all_int(&self, name: &str) -> Vec<i64> {
        self.values
            .get(name)
            .map(|vs| {
                vs.iter()
                    .filter_map(|v| match v {
                        ArgValue::Int(i) => Some(*i),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_str(&self, name: &str) -> Vec<&str> {
        self.values
            .get(name)
            .map(|vs| {
                vs.iter()
                    .filter_map(|v| match v {
                        ArgValue::Str(s) => Some(s.as_str()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn push(&mut self, name: &str, value: ArgValue) {
        self.values.entry(name.to_string()).or_default().push(value);
    }
}

/// Strip thousands separators (`,` or `_`) and parse a possibly-hex
/// integer, per the original's numeric-literal conveniences.
fn parse_integer(raw: &str) -> Option<i64> {
    let cleaned: String = raw.chars().filter(|c| *c != ',' && *c != '_').collect();
    if let Some(hex) = cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok();
    }
    if let Some(hex) = cleaned.strip_prefix("-0x").or_else(|| cleaned.strip_prefix("-0X")) {
        return i64::from_str_radix(hex, 16).ok().map(|v: i64| -v);
    }
    cleaned.parse::<i64>().ok()
}

/// Expand `@file` arguments (one argument per line in the named file) and
/// the `@@` escape for a literal argument starting with `@`. Argument
/// file reading failures are reported as errors, not panics.
fn expand_arg_files(
    raw: &[String],
    read_file: &dyn Fn(&str) -> std::io::Result<String>,
) -> Result<Vec<String>, ArgsError> {
    let mut expanded = Vec::with_capacity(raw.len());
    for arg in raw {
        if let Some(rest) = arg.strip_prefix("@@") {
            expanded.push(format!("@{rest}"));
        } else if let Some(path) = arg.strip_prefix('@') {
            let contents = read_file(path)
                .map_err(|e| ArgsError::ArgFileUnreadable(path.to_string(), e.to_string()))?;
            for line in contents.lines() {
                let line = line.trim();
                if !line.is_empty() {
                    expanded.push(line.to_string());
                }
            }
        } else {
            expanded.push(arg.clone());
        }
    }
    Ok(expanded)
}

fn default_file_reader(path: &str) -> std::io::Result<String> {
    std::fs::read_to_string(path)
}

/// Parse `raw` against `schema`, expanding `@file` references through the
/// real filesystem. See [`parse_with_reader`] to inject a fake reader for
/// testing.
pub fn parse(raw: &[String], schema: &OptionSchema) -> Result<ParsedArgs, ArgsError> {
    parse_with_reader(raw, schema, &default_file_reader)
}

pub fn parse_with_reader(
    raw: &[String],
    schema: &OptionSchema,
    read_file: &dyn Fn(&str) -> std::io::Result<String>,
) -> Result<ParsedArgs, ArgsError> {
    let args = expand_arg_files(raw, read_file)?;
    let mut parsed = ParsedArgs::empty();
    let mut errors: Vec<ArgsError> = Vec::new();
    let mut occurrence_counts: HashMap<&'static str, usize> = HashMap::new();

    let mut i = 0;
    while i < args.len() {
        let token = &args[i];
        let (spec_result, inline_value) = if let Some(long) = token.strip_prefix("--") {
            match long.split_once('=') {
                Some((name, value)) => (schema.find(name), Some(value.to_string())),
                None => (schema.find(long), None),
            }
        } else if let Some(short) = token.strip_prefix('-') {
            let mut chars = short.chars();
            match chars.next() {
                Some(c) => {
                    let rest: String = chars.collect();
                    let inline = if rest.is_empty() { None } else { Some(rest) };
                    (schema.find_short(c), inline)
                }
                None => (Err(ArgsError::UnknownOption(token.clone())), None),
            }
        } else {
            parsed.positional.push(token.clone());
            i += 1;
            continue;
        };

        let spec = match spec_result {
            Ok(spec) => spec,
            Err(e) => {
                errors.push(e);
                i += 1;
                continue;
            }
        };

        *occurrence_counts.entry(spec.name).or_insert(0) += 1;

        match spec.kind {
            ValueKind::Flag => {
                if inline_value.is_some() {
                    errors.push(ArgsError::UnexpectedValue(spec.name.to_string()));
                } else {
                    parsed.push(spec.name, ArgValue::Flag);
                }
                i += 1;
            }
            ValueKind::String => {
                let value = if let Some(v) = inline_value {
                    i += 1;
                    Some(v)
                } else if i + 1 < args.len() {
                    let v = args[i + 1].clone();
                    i += 2;
                    Some(v)
                } else {
                    i += 1;
                    None
                };
                match value {
                    Some(v) => parsed.push(spec.name, ArgValue::Str(v)),
                    None => errors.push(ArgsError::MissingValue(spec.name.to_string())),
                }
            }
            ValueKind::Integer => {
                let value = if let Some(v) = inline_value {
                    i += 1;
                    Some(v)
                } else if i + 1 < args.len() {
                    let v = args[i + 1].clone();
                    i += 2;
                    Some(v)
                } else {
                    i += 1;
                    None
                };
                match value {
                    None => errors.push(ArgsError::MissingValue(spec.name.to_string())),
                    Some(v) => match parse_integer(&v) {
                        None => errors.push(ArgsError::InvalidInteger(spec.name.to_string(), v)),
                        Some(n) => {
                            if let Some((lo, hi)) = spec.int_range {
                                if n < lo || n > hi {
                                    errors.push(ArgsError::OutOfRange(spec.name.to_string(), n, lo, hi));
                                    continue;
                                }
                            }
                            parsed.push(spec.name, ArgValue::Int(n));
                        }
                    },
                }
            }
        }
    }

    for spec in schema.specs.iter() {
        let count = occurrence_counts.get(spec.name).copied().unwrap_or(0);
        if count < spec.min_occurrences || count > spec.max_occurrences {
            errors.push(ArgsError::BadOccurrenceCount(
                spec.name.to_string(),
                count,
                spec.min_occurrences,
                spec.max_occurrences,
            ));
        }
    }

    if errors.is_empty() {
        Ok(parsed)
    } else {
        let joined = errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n");
        Err(ArgsError::Accumulated(errors.len(), joined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdMap;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_flags_strings_and_integers() {
        let schema = OptionSchema::new(vec![
            OptionSpec::flag("verbose").short('v'),
            OptionSpec::string("name"),
            OptionSpec::integer("count").range(0, 100),
        ]);
        let parsed = parse(&strs(&["--verbose", "--name", "alice", "--count", "42"]), &schema).unwrap();
        assert!(parsed.present("verbose"));
        assert_eq!(parsed.value_str("name"), Some("alice"));
        assert_eq!(parsed.value_int("count"), Some(42));
    }

    #[test]
    fn abbreviation_matches_unique_prefix() {
        let schema = OptionSchema::new(vec![OptionSpec::string("filename")]);
        let parsed = parse(&strs(&["--file", "a.ts"]), &schema).unwrap();
        assert_eq!(parsed.value_str("filename"), Some("a.ts"));
    }

    #[test]
    fn ambiguous_abbreviation_is_rejected() {
        let schema = OptionSchema::new(vec![OptionSpec::string("format"), OptionSpec::string("force")]);
        let err = parse(&strs(&["--fo", "x"]), &schema).unwrap_err();
        match err {
            ArgsError::Accumulated(1, msg) => assert!(msg.contains("ambiguous")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn hex_and_thousands_separators_parse() {
        let schema = OptionSchema::new(vec![OptionSpec::integer("bitrate")]);
        let parsed = parse(&strs(&["--bitrate", "0x1000"]), &schema).unwrap();
        assert_eq!(parsed.value_int("bitrate"), Some(0x1000));
        let parsed2 = parse(&strs(&["--bitrate", "1,000,000"]), &schema).unwrap();
        assert_eq!(parsed2.value_int("bitrate"), Some(1_000_000));
    }

    #[test]
    fn occurrence_bounds_are_enforced() {
        let schema = OptionSchema::new(vec![OptionSpec::string("input").occurrences(1, 1)]);
        let err = parse(&strs(&[]), &schema).unwrap_err();
        match err {
            ArgsError::Accumulated(1, msg) => assert!(msg.contains("expected between 1 and 1")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn arg_file_expands_one_token_per_line() {
        let schema = OptionSchema::new(vec![OptionSpec::string("name")]);
        let mut files: StdMap<&str, &str> = StdMap::new();
        files.insert("opts.txt", "--name\nbob\n");
        let reader = |path: &str| -> std::io::Result<String> {
            files
                .get(path)
                .map(|s| s.to_string())
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "missing"))
        };
        let parsed = parse_with_reader(&strs(&["@opts.txt"]), &schema, &reader).unwrap();
        assert_eq!(parsed.value_str("name"), Some("bob"));
    }

    #[test]
    fn double_at_escapes_literal_leading_at() {
        let schema = OptionSchema::new(vec![OptionSpec::string("name")]);
        let reader = |_: &str| -> std::io::Result<String> { unreachable!("should not read a file") };
        let parsed = parse_with_reader(&strs(&["--name", "@@bob"]), &schema, &reader).unwrap();
        assert_eq!(parsed.value_str("name"), Some("@bob"));
    }

    #[test]
    fn errors_accumulate_across_multiple_bad_options() {
        let schema = OptionSchema::new(vec![OptionSpec::integer("count").range(0, 10)]);
        let err = parse(&strs(&["--count", "abc", "--bogus"]), &schema).unwrap_err();
        match err {
            ArgsError::Accumulated(n, _) => assert_eq!(n, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
