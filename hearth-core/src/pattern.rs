use regex::Regex;
use std::collections::HashMap;

/// A compiled Express-style route pattern.
///
/// Supported syntax, compiled once at route construction:
/// - literal segments: `/login`
/// - named params: `/user/:action` (one segment)
/// - optional params: `/user/:action/:user?/:opt?`
/// - custom charsets: `/:prefix([$@!]):recipe` (several tokens may share a
///   segment)
/// - splats: `:opts*` (zero or more trailing segments) and a bare `*`
///   catch-all
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    /// Compile a pattern, anchored to the full path.
    pub fn compile(pattern: &str) -> Result<Self, String> {
        let mut out = String::from("^");

        if pattern == "*" || pattern == "/*" {
            out.push_str("(?P<splat>/?.*)");
        } else {
            for segment in pattern.split('/').filter(|s| !s.is_empty()) {
                match segment_kind(segment) {
                    SegmentKind::Optional { name, charset } => {
                        out.push_str(&format!("(?:/(?P<{name}>{charset}))?"));
                    }
                    SegmentKind::Splat { name } => {
                        out.push_str(&format!("(?:/(?P<{name}>.*))?"));
                    }
                    SegmentKind::Plain(tokens) => {
                        out.push('/');
                        for token in tokens {
                            match token {
                                Token::Literal(text) => out.push_str(&regex::escape(&text)),
                                Token::Param { name, charset } => {
                                    // Modifiers are only meaningful on
                                    // lone-token segments; elsewhere the
                                    // param is required.
                                    let name = name.trim_end_matches(['?', '*']);
                                    out.push_str(&format!("(?P<{name}>{charset})"));
                                }
                            }
                        }
                    }
                }
            }
            if out == "^" {
                out.push('/');
            }
            out.push_str("/?");
        }
        out.push('$');

        let regex = Regex::new(&out).map_err(|e| format!("bad route pattern {pattern:?}: {e}"))?;
        Ok(Self { source: pattern.to_string(), regex })
    }

    /// Match a request path. `None` means no match; a hit returns the
    /// extracted named params (absent optionals are omitted).
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let caps = self.regex.captures(path)?;
        let mut params = HashMap::new();
        for name in self.regex.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                params.insert(name.to_string(), m.as_str().to_string());
            }
        }
        Some(params)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

enum SegmentKind {
    Plain(Vec<Token>),
    Optional { name: String, charset: String },
    Splat { name: String },
}

enum Token {
    Literal(String),
    Param { name: String, charset: String },
}

/// Classify one `/`-separated segment and tokenize it.
fn segment_kind(segment: &str) -> SegmentKind {
    let tokens = tokenize(segment);

    // A lone-token segment may carry a `?` or `*` modifier that makes the
    // whole segment (including its slash) optional.
    if tokens.len() == 1
        && let Token::Param { name, charset } = &tokens[0]
    {
        if let Some(stripped) = name.strip_suffix('?') {
            return SegmentKind::Optional { name: stripped.to_string(), charset: charset.clone() };
        }
        if let Some(stripped) = name.strip_suffix('*') {
            return SegmentKind::Splat { name: stripped.to_string() };
        }
    }

    SegmentKind::Plain(tokens)
}

fn tokenize(segment: &str) -> Vec<Token> {
    // `:name`, optionally followed by `(charset)` and a `?`/`*` modifier,
    // interleaved with literal text.
    let token_re = Regex::new(r":(\w+)(?:\(([^)]*)\))?([?*])?").expect("static token regex");
    let mut tokens = Vec::new();
    let mut last = 0;

    for caps in token_re.captures_iter(segment) {
        let whole = caps.get(0).expect("capture 0");
        if whole.start() > last {
            tokens.push(Token::Literal(segment[last..whole.start()].to_string()));
        }
        let name = caps.get(1).expect("param name").as_str();
        let charset = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_else(|| "[^/]+".to_string());
        let modifier = caps.get(3).map(|m| m.as_str()).unwrap_or("");
        tokens.push(Token::Param { name: format!("{name}{modifier}"), charset });
        last = whole.end();
    }
    if last < segment.len() {
        tokens.push(Token::Literal(segment[last..].to_string()));
    }
    tokens
}
