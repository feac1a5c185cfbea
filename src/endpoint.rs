//! Recognition of outbound HTTP calls and their reconciliation with the
//! route catalog.
//!
//! A call's URL expression is reduced to a list of path segments, each either
//! a literal or a placeholder. The segment list yields both a compact pattern
//! code (`c`/`v` per segment) and an anchored regex; a catalog route matches
//! when it accepts the verb, has the same pattern code, and its normalized
//! name matches the regex.

use crate::catalog::{RouteCatalog, RouteDescriptor};
use crate::syntax::{Call, Expr};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

pub const ROUTE_VERBS: &[&str] = &["get", "post", "put", "delete", "head"];

const PLACEHOLDER_REGEX: &str = "([^/]+)";

/// Routing metadata attached to a recognized call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteAnnotation {
    /// Upper-case HTTP method.
    pub method: String,
    /// Callee as written, e.g. `requests.get`.
    pub chain: String,
    pub pattern: String,
    /// Human-readable endpoint with `{}` placeholders.
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<RouteDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder,
}

/// Segments of a URL expression plus the derived pattern code and regex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPattern {
    pub segments: Vec<Segment>,
}

impl EndpointPattern {
    pub fn code(&self) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(_) => 'c',
                Segment::Placeholder => 'v',
            })
            .collect()
    }

    pub fn regex_source(&self) -> String {
        let body = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => regex::escape(text),
                Segment::Placeholder => PLACEHOLDER_REGEX.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/");
        format!("^/{body}/")
    }

    pub fn display(&self) -> String {
        let body = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.as_str(),
                Segment::Placeholder => "{}",
            })
            .collect::<Vec<_>>()
            .join("/");
        if body.is_empty() {
            "/".to_string()
        } else {
            format!("/{body}/")
        }
    }
}

/// Decides which calls are routing candidates and matches them.
pub struct EndpointMatcher<'a> {
    catalog: &'a RouteCatalog,
    clients: Vec<String>,
}

impl<'a> EndpointMatcher<'a> {
    pub fn new(catalog: &'a RouteCatalog, clients: &[String]) -> Self {
        Self {
            catalog,
            clients: clients
                .iter()
                .map(|client| client.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Method and URL expression of a routing candidate, or `None` when the
    /// call does not look like an HTTP client invocation.
    pub fn candidate<'c>(&self, call: &'c Call) -> Option<(String, &'c Expr)> {
        let Expr::Attribute { value, attr } = call.func.as_ref() else {
            return None;
        };
        if !self.is_client(value) {
            return None;
        }
        let attr = attr.to_ascii_lowercase();
        if attr == "request" {
            let method = match call.args.first().or_else(|| call.keyword("method"))? {
                Expr::Str { value } => value.trim().to_ascii_uppercase(),
                _ => return None,
            };
            let url = call.args.get(1).or_else(|| call.keyword("url"))?;
            return Some((method, url));
        }
        if !ROUTE_VERBS.contains(&attr.as_str()) {
            return None;
        }
        let url = call.args.first().or_else(|| call.keyword("url"))?;
        Some((attr.to_ascii_uppercase(), url))
    }

    fn is_client(&self, receiver: &Expr) -> bool {
        let Some(name) = receiver_name(receiver) else {
            return false;
        };
        let name = name.to_ascii_lowercase();
        self.clients.iter().any(|client| *client == name)
            || name.ends_with("session")
            || name.ends_with("client")
    }

    /// Annotate `call` in place when it is a routing candidate. Returns
    /// whether the call was recognized.
    pub fn annotate(&self, call: &mut Call) -> bool {
        let Some((method, url)) = self.candidate(call) else {
            return false;
        };
        let pattern = endpoint_pattern(url);
        let matched = self.find(&method, &pattern).cloned();
        let chain = call.func.render();
        debug!(
            chain = %chain,
            method = %method,
            endpoint = %pattern.display(),
            pattern = %pattern.code(),
            matched = matched.as_ref().map(|route| route.func_name.as_str()),
            line = call.lineno,
            "routing call"
        );
        call.route = Some(RouteAnnotation {
            method,
            chain,
            pattern: pattern.code(),
            endpoint: pattern.display(),
            matched,
        });
        true
    }

    /// First catalog route accepting `method` whose pattern code equals the
    /// candidate's and whose name matches the candidate regex. A URL with no
    /// segments never matches, not even the root route.
    pub fn find(&self, method: &str, pattern: &EndpointPattern) -> Option<&'a RouteDescriptor> {
        if pattern.segments.is_empty() {
            debug!(method, "endpoint has no path segments");
            return None;
        }
        let code = pattern.code();
        let source = pattern.regex_source();
        let regex = match Regex::new(&source) {
            Ok(regex) => regex,
            Err(err) => {
                warn!(regex = %source, error = %err, "invalid endpoint regex");
                return None;
            }
        };
        self.catalog.routes().iter().find(|route| {
            route.accepts(method) && route.route_pattern == code && regex.is_match(&route.name)
        })
    }
}

fn receiver_name(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Name { id } => Some(id),
        Expr::Attribute { attr, .. } => Some(attr),
        Expr::Call(call) => receiver_name(&call.func),
        _ => None,
    }
}

/// Reduce a URL expression to path segments.
///
/// Literal text has backslashes turned into slashes; the first literal loses
/// any `scheme://host` prefix; a `?` or `#` ends the path. Any other
/// sub-expression is one placeholder, but only after a literal has been
/// seen, so a URL that starts with a variable drops that leading segment.
pub fn endpoint_pattern(url: &Expr) -> EndpointPattern {
    let mut builder = PatternBuilder::default();
    builder.walk(url);
    EndpointPattern {
        segments: builder.segments,
    }
}

#[derive(Default)]
struct PatternBuilder {
    segments: Vec<Segment>,
    seen_literal: bool,
    in_query: bool,
}

impl PatternBuilder {
    fn walk(&mut self, expr: &Expr) {
        if self.in_query {
            return;
        }
        match expr {
            Expr::Str { value } => self.literal(value),
            Expr::JoinedStr { values } => {
                for value in values {
                    self.walk(value);
                }
            }
            Expr::BinOp { left, op, right } if op == "+" => {
                self.walk(left);
                self.walk(right);
            }
            Expr::BinOp { left, op, .. } if op == "%" => self.walk(left),
            Expr::Call(call) if is_format_call(call) => {
                if let Expr::Attribute { value, .. } = call.func.as_ref() {
                    self.walk(value);
                }
            }
            _ => self.placeholder(),
        }
    }

    fn literal(&mut self, raw: &str) {
        let mut text = raw.replace('\\', "/");
        if !self.seen_literal {
            text = strip_scheme_and_host(&text).to_string();
        }
        self.seen_literal = true;
        if let Some(idx) = text.find(['?', '#']) {
            text.truncate(idx);
            self.in_query = true;
        }
        for part in text.split('/').filter(|part| !part.is_empty()) {
            if is_placeholder_segment(part) {
                self.segments.push(Segment::Placeholder);
            } else {
                self.segments.push(Segment::Literal(part.to_string()));
            }
        }
    }

    fn placeholder(&mut self) {
        if self.seen_literal {
            self.segments.push(Segment::Placeholder);
        }
    }
}

fn is_format_call(call: &Call) -> bool {
    matches!(
        call.func.as_ref(),
        Expr::Attribute { value, attr }
            if attr == "format" && matches!(value.as_ref(), Expr::Str { .. } | Expr::JoinedStr { .. })
    )
}

fn strip_scheme_and_host(value: &str) -> &str {
    let Some(idx) = value.find("://") else {
        return value;
    };
    let rest = &value[idx + 3..];
    match rest.find('/') {
        Some(slash) => &rest[slash..],
        None => "",
    }
}

/// Literal segments that stand for a value rather than a fixed path part:
/// numbers, UUIDs and format placeholders.
fn is_placeholder_segment(segment: &str) -> bool {
    let trimmed = segment.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('<') || trimmed.starts_with(':') {
        return true;
    }
    if trimmed.contains('%') {
        return true;
    }
    if trimmed.chars().all(|ch| ch.is_ascii_digit()) {
        return true;
    }
    looks_like_uuid(trimmed)
}

fn looks_like_uuid(segment: &str) -> bool {
    let mut hex = 0usize;
    let mut dash = 0usize;
    for ch in segment.chars() {
        if ch == '-' {
            dash += 1;
            continue;
        }
        if ch.is_ascii_hexdigit() {
            hex += 1;
            continue;
        }
        return false;
    }
    dash > 0 && hex >= 16
}
