//! Route command language
//!
//! One command per line, blank lines and `#` comments ignored:
//!
//! ```text
//! route add    <service> <host><path> <dstURL> [weight <float>] [tags "<csv>"] [opts "<k=v …>"]
//! route del    [<service>] [<host><path>] [<dstURL>]
//! route weight <service> <host><path> weight <float> [tags "<csv>"]
//! ```
//!
//! Whitespace outside double quotes separates tokens; `"…"` groups tokens.
//! Parsing collects an error for every bad line so a registry payload can be
//! reported in full before it is rejected.
//!
//! # Example
//!
//! ```
//! use switchyard_core::command::{parse_program, Command};
//!
//! let program = "route add svc app.com/api http://10.0.0.1:8080/ weight 0.5 tags \"a,b\"";
//! let commands = parse_program(program).unwrap();
//! assert!(matches!(commands[0], Command::Add(_)));
//! assert_eq!(commands[0].to_string(), "route add svc app.com/api http://10.0.0.1:8080/ weight 0.5 tags \"a,b\"");
//! ```

use std::fmt;

use url::Url;

use crate::error::{ParseError, ParseErrors};
use crate::target::{Scheme, TargetOptions, parse_destination};

/// A `<host><path>` token split into its parts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostPath {
    /// Lowercase host, empty for the catch-all bucket
    pub host: String,
    /// Path prefix, always starting with `/`
    pub path: String,
}

impl HostPath {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            path: path.into(),
        }
    }

    pub fn parse(token: &str) -> Result<Self, String> {
        if token.is_empty() {
            return Err("empty host/path".to_string());
        }
        match token.find('/') {
            Some(0) => Ok(HostPath::new("", token)),
            Some(idx) => Ok(HostPath::new(&token[..idx], &token[idx..])),
            None => Ok(HostPath::new(token, "/")),
        }
    }
}

impl fmt::Display for HostPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.host, self.path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteAdd {
    pub service: String,
    pub host_path: HostPath,
    pub scheme: Scheme,
    pub dst: Url,
    pub weight: f64,
    pub tags: Vec<String>,
    pub opts: TargetOptions,
}

/// `route del`; `None` fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDel {
    pub service: Option<String>,
    pub host_path: Option<HostPath>,
    pub dst: Option<String>,
}

impl RouteDel {
    /// Delete every route pointing at `dst`, as emitted by the breaker overlay
    pub fn destination(dst: impl Into<String>) -> Self {
        Self {
            dst: Some(dst.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, service: &str, host_path: &HostPath, dst: &str) -> bool {
        self.service.as_deref().is_none_or(|s| s == service)
            && self.host_path.as_ref().is_none_or(|hp| hp == host_path)
            && self.dst.as_deref().is_none_or(|d| d == dst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteWeight {
    pub service: String,
    pub host_path: HostPath,
    pub weight: f64,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Add(RouteAdd),
    Del(RouteDel),
    Weight(RouteWeight),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Add(add) => {
                write!(
                    f,
                    "route add {} {} {} weight {}",
                    add.service,
                    add.host_path,
                    add.dst.as_str(),
                    add.weight
                )?;
                if !add.tags.is_empty() {
                    write!(f, " tags \"{}\"", add.tags.join(","))?;
                }
                if !add.opts.is_empty() {
                    write!(f, " opts \"{}\"", add.opts)?;
                }
                Ok(())
            }
            Command::Del(del) => {
                let host_path = del.host_path.as_ref().map(HostPath::to_string);
                write!(
                    f,
                    "route del {} {} {}",
                    del.service.as_deref().unwrap_or("*"),
                    host_path.as_deref().unwrap_or("*"),
                    del.dst.as_deref().unwrap_or("*")
                )
            }
            Command::Weight(w) => {
                write!(
                    f,
                    "route weight {} {} weight {}",
                    w.service, w.host_path, w.weight
                )?;
                if let Some(tags) = &w.tags {
                    write!(f, " tags \"{}\"", tags.join(","))?;
                }
                Ok(())
            }
        }
    }
}

/// Parse a whole program, reporting every failing line
pub fn parse_program(program: &str) -> Result<Vec<Command>, ParseErrors> {
    let mut commands = Vec::new();
    let mut errors = Vec::new();

    for (idx, line) in program.lines().enumerate() {
        match parse_line(line) {
            Ok(Some(cmd)) => commands.push(cmd),
            Ok(None) => {}
            Err((column, message)) => errors.push(ParseError {
                line: idx + 1,
                column,
                text: line.to_string(),
                message,
            }),
        }
    }

    if errors.is_empty() {
        Ok(commands)
    } else {
        Err(ParseErrors(errors))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    text: String,
    /// 1-based character column
    column: usize,
}

type LineError = (usize, String);

fn tokenize(line: &str) -> Result<Vec<Token>, LineError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut start = 0;
    let mut quote_start: Option<usize> = None;

    for (idx, ch) in line.chars().enumerate() {
        let column = idx + 1;
        if let Some(qs) = quote_start {
            if ch == '"' {
                tokens.push(Token {
                    text: std::mem::take(&mut current),
                    column: qs,
                });
                quote_start = None;
            } else {
                current.push(ch);
            }
            continue;
        }
        if ch == '"' {
            if !current.is_empty() {
                tokens.push(Token {
                    text: std::mem::take(&mut current),
                    column: start,
                });
            }
            quote_start = Some(column);
        } else if ch.is_whitespace() {
            if !current.is_empty() {
                tokens.push(Token {
                    text: std::mem::take(&mut current),
                    column: start,
                });
            }
        } else {
            if current.is_empty() {
                start = column;
            }
            current.push(ch);
        }
    }

    if let Some(qs) = quote_start {
        return Err((qs, "unterminated quote".to_string()));
    }
    if !current.is_empty() {
        tokens.push(Token {
            text: current,
            column: start,
        });
    }
    Ok(tokens)
}

fn parse_line(line: &str) -> Result<Option<Command>, LineError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let tokens = tokenize(line)?;
    let first = &tokens[0];
    if first.text != "route" {
        return Err((first.column, format!("expected 'route', got '{}'", first.text)));
    }
    let Some(verb) = tokens.get(1) else {
        return Err((line.chars().count() + 1, "missing command after 'route'".to_string()));
    };

    let args = &tokens[2..];
    let end = line.chars().count() + 1;
    match verb.text.as_str() {
        "add" => parse_add(args, end).map(|c| Some(Command::Add(c))),
        "del" => parse_del(args).map(|c| Some(Command::Del(c))),
        "weight" => parse_weight(args, end).map(|c| Some(Command::Weight(c))),
        other => Err((verb.column, format!("unknown command 'route {}'", other))),
    }
}

fn required<'a>(args: &'a [Token], idx: usize, what: &str, end: usize) -> Result<&'a Token, LineError> {
    args.get(idx)
        .ok_or_else(|| (end, format!("missing {}", what)))
}

fn parse_weight_value(token: &Token) -> Result<f64, LineError> {
    let weight = token
        .text
        .parse::<f64>()
        .map_err(|_| (token.column, format!("invalid weight '{}'", token.text)))?;
    if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
        return Err((token.column, format!("weight {} outside [0,1]", token.text)));
    }
    Ok(weight)
}

fn parse_tags(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}

fn parse_host_path(token: &Token) -> Result<HostPath, LineError> {
    HostPath::parse(&token.text).map_err(|msg| (token.column, msg))
}

fn parse_dst(token: &Token) -> Result<(Scheme, Url), LineError> {
    parse_destination(&token.text).map_err(|msg| (token.column, msg))
}

/// Optional trailing clauses shared by `add` and `weight`
#[derive(Default)]
struct Clauses {
    weight: Option<f64>,
    tags: Option<Vec<String>>,
    opts: Option<TargetOptions>,
}

fn parse_clauses(args: &[Token], allow_opts: bool, end: usize) -> Result<Clauses, LineError> {
    let mut clauses = Clauses::default();
    let mut iter = args.iter();
    while let Some(key) = iter.next() {
        let value = iter
            .next()
            .ok_or_else(|| (end, format!("missing value for '{}'", key.text)))?;
        match key.text.as_str() {
            "weight" if clauses.weight.is_none() => {
                clauses.weight = Some(parse_weight_value(value)?);
            }
            "tags" if clauses.tags.is_none() => clauses.tags = Some(parse_tags(&value.text)),
            "opts" if allow_opts && clauses.opts.is_none() => {
                clauses.opts =
                    Some(TargetOptions::parse(&value.text).map_err(|msg| (value.column, msg))?);
            }
            "weight" | "tags" | "opts" if allow_opts || key.text != "opts" => {
                return Err((key.column, format!("duplicate '{}' clause", key.text)));
            }
            other => return Err((key.column, format!("unexpected token '{}'", other))),
        }
    }
    Ok(clauses)
}

fn parse_add(args: &[Token], end: usize) -> Result<RouteAdd, LineError> {
    let service = required(args, 0, "service", end)?;
    let host_path = parse_host_path(required(args, 1, "host/path", end)?)?;
    let (scheme, dst) = parse_dst(required(args, 2, "destination", end)?)?;
    let clauses = parse_clauses(&args[3..], true, end)?;

    Ok(RouteAdd {
        service: service.text.clone(),
        host_path,
        scheme,
        dst,
        weight: clauses.weight.unwrap_or(1.0),
        tags: clauses.tags.unwrap_or_default(),
        opts: clauses.opts.unwrap_or_default(),
    })
}

fn parse_weight(args: &[Token], end: usize) -> Result<RouteWeight, LineError> {
    let service = required(args, 0, "service", end)?;
    let host_path = parse_host_path(required(args, 1, "host/path", end)?)?;
    let clauses = parse_clauses(&args[2..], false, end)?;
    let weight = clauses
        .weight
        .ok_or_else(|| (end, "route weight requires 'weight <float>'".to_string()))?;

    Ok(RouteWeight {
        service: service.text.clone(),
        host_path,
        weight,
        tags: clauses.tags,
    })
}

fn parse_del(args: &[Token]) -> Result<RouteDel, LineError> {
    let mut del = RouteDel::default();

    if args.len() > 3 {
        return Err((args[3].column, format!("unexpected token '{}'", args[3].text)));
    }

    if args.len() == 3 {
        if args[0].text != "*" {
            del.service = Some(args[0].text.clone());
        }
        if args[1].text != "*" {
            del.host_path = Some(parse_host_path(&args[1])?);
        }
        if args[2].text != "*" {
            del.dst = Some(parse_dst(&args[2])?.1.to_string());
        }
        return Ok(del);
    }

    // Short form: each field is recognized by its shape.
    for token in args.iter().filter(|t| t.text != "*") {
        if token.text.contains("://") {
            if del.dst.is_some() {
                return Err((token.column, "destination given twice".to_string()));
            }
            del.dst = Some(parse_dst(token)?.1.to_string());
        } else if token.text.contains('/') {
            if del.host_path.is_some() {
                return Err((token.column, "host/path given twice".to_string()));
            }
            del.host_path = Some(parse_host_path(token)?);
        } else {
            if del.service.is_some() {
                return Err((token.column, "service given twice".to_string()));
            }
            del.service = Some(token.text.clone());
        }
    }
    Ok(del)
}
