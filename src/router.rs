//! Method + path dispatcher with named segments.
//!
//! Patterns are made of literal segments and `:name` parameter segments; no
//! wildcards.  Routes live in a segment tree built once at startup and only
//! read afterwards, so lookups need no locking.  At each depth literal
//! children are tried before the parameter child, so `/modules/search` wins
//! over `/modules/:id` for the path `/modules/search`.

use axum::http::Method;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("route {method} {pattern} conflicts with an existing route")]
    Duplicate { method: Method, pattern: &'static str },
    #[error("invalid route pattern {pattern:?}: {reason}")]
    InvalidPattern {
        pattern: &'static str,
        reason: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Params
// ---------------------------------------------------------------------------

/// Path parameters bound by a successful lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(&'static str, String)>,
}

impl Params {
    /// The value bound to `name`, or `None` if the route has no such
    /// parameter.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Result of a successful [`Router::at`].
#[derive(Debug)]
pub struct Match<'r, H> {
    pub handler: &'r H,
    pub params: Params,
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

struct Route<H> {
    method: Method,
    pattern: &'static str,
    /// Parameter names in left-to-right order.
    params: Vec<&'static str>,
    handler: H,
}

struct Node<H> {
    literals: Vec<(&'static str, Node<H>)>,
    param: Option<Box<Node<H>>>,
    routes: Vec<Route<H>>,
}

impl<H> Default for Node<H> {
    fn default() -> Self {
        Self {
            literals: Vec::new(),
            param: None,
            routes: Vec::new(),
        }
    }
}

impl<H> Node<H> {
    fn literal_child(&mut self, segment: &'static str) -> &mut Node<H> {
        let index = match self.literals.iter().position(|(s, _)| *s == segment) {
            Some(index) => index,
            None => {
                self.literals.push((segment, Node::default()));
                self.literals.len() - 1
            }
        };
        &mut self.literals[index].1
    }

    /// Depth-first search preferring literal children.  Backtracks into the
    /// parameter child when the literal branch has no route for `method`.
    fn find<'p>(
        &self,
        method: &Method,
        segments: &[&'p str],
        values: &mut Vec<&'p str>,
    ) -> Option<&Route<H>> {
        let Some((&segment, rest)) = segments.split_first() else {
            return self.routes.iter().find(|route| route.method == *method);
        };
        if segment.is_empty() {
            return None;
        }

        if let Some((_, child)) = self.literals.iter().find(|(s, _)| *s == segment)
            && let Some(route) = child.find(method, rest, values)
        {
            return Some(route);
        }

        if let Some(child) = &self.param {
            values.push(segment);
            if let Some(route) = child.find(method, rest, values) {
                return Some(route);
            }
            values.pop();
        }

        None
    }
}

enum Segment {
    Literal(&'static str),
    Param(&'static str),
}

fn parse_pattern(pattern: &'static str) -> Result<Vec<Segment>, RouteError> {
    let invalid = |reason| RouteError::InvalidPattern { pattern, reason };

    let rest = pattern
        .strip_prefix('/')
        .ok_or_else(|| invalid("must start with '/'"))?;
    if rest.is_empty() {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    let mut names: Vec<&str> = Vec::new();
    for segment in rest.split('/') {
        if segment.is_empty() {
            return Err(invalid("empty segment"));
        }
        if segment.starts_with('*') {
            return Err(invalid("wildcard segments are not supported"));
        }
        match segment.strip_prefix(':') {
            Some("") => return Err(invalid("unnamed parameter")),
            Some(name) if names.contains(&name) => return Err(invalid("repeated parameter name")),
            Some(name) => {
                names.push(name);
                segments.push(Segment::Param(name));
            }
            None => segments.push(Segment::Literal(segment)),
        }
    }
    Ok(segments)
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct Router<H> {
    root: Node<H>,
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> Router<H> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
        }
    }

    /// Register `handler` for `method` requests matching `pattern`.
    ///
    /// Fails if the pattern is malformed or another route already answers
    /// `method` for the same path shape (e.g. `/a/:x` and `/a/:y`).
    pub fn insert(
        &mut self,
        method: Method,
        pattern: &'static str,
        handler: H,
    ) -> Result<(), RouteError> {
        let segments = parse_pattern(pattern)?;

        let mut node = &mut self.root;
        let mut params = Vec::new();
        for segment in segments {
            node = match segment {
                Segment::Literal(literal) => node.literal_child(literal),
                Segment::Param(name) => {
                    params.push(name);
                    &mut **node.param.get_or_insert_with(Box::default)
                }
            };
        }

        if let Some(existing) = node.routes.iter().find(|route| route.method == method) {
            tracing::debug!(existing = existing.pattern, pattern, "route conflict");
            return Err(RouteError::Duplicate { method, pattern });
        }
        node.routes.push(Route {
            method,
            pattern,
            params,
            handler,
        });
        Ok(())
    }

    /// Resolve `method` + `path`.  Method and path misses both return `None`.
    pub fn at(&self, method: &Method, path: &str) -> Option<Match<'_, H>> {
        let rest = path.strip_prefix('/')?;
        let segments: Vec<&str> = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split('/').collect()
        };

        let mut values = Vec::with_capacity(segments.len());
        let route = self.root.find(method, &segments, &mut values)?;

        let entries = route
            .params
            .iter()
            .zip(values)
            .map(|(name, value)| (*name, value.to_string()))
            .collect();
        Some(Match {
            handler: &route.handler,
            params: Params { entries },
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
