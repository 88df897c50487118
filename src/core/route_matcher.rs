//! Path templates and best-match route resolution.
//!
//! A template is a `/`-separated list of segments. Each segment is a literal,
//! a `{name}` placeholder matching exactly one non-empty path segment, or (last
//! only) a catch-all written `{everything}` or `{*name}` that matches zero or
//! more remaining segments. Empty segments are ignored on both sides, so
//! `/a/b/` and `/a//b` match like `/a/b`.
//!
//! Candidates are ranked once when the snapshot is built; matching walks them
//! in rank order and returns the first hit.
use std::{cmp::Ordering, fmt, sync::Arc};

use http::Method;
use thiserror::Error;

use crate::core::snapshot::{Aggregate, Route};

const EVERYTHING: &str = "everything";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template '{0}' must start with '/'")]
    MissingLeadingSlash(String),
    #[error("template '{template}': placeholder must span a whole segment, got '{segment}'")]
    PartialPlaceholder { template: String, segment: String },
    #[error("template '{0}' contains an empty placeholder name")]
    EmptyPlaceholder(String),
    #[error("template '{template}' binds '{name}' more than once")]
    DuplicatePlaceholder { template: String, name: String },
    #[error("template '{0}': a catch-all placeholder must be the last segment")]
    CatchAllNotLast(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder(String),
    CatchAll(String),
}

/// Parsed path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        if !template.starts_with('/') {
            return Err(TemplateError::MissingLeadingSlash(template.to_string()));
        }

        let parts: Vec<&str> = split_path(template).collect();
        let mut segments = Vec::with_capacity(parts.len());
        let mut names: Vec<&str> = Vec::new();

        for (index, part) in parts.iter().enumerate() {
            let is_braced = part.starts_with('{') && part.ends_with('}') && part.len() >= 2;
            if !is_braced {
                if part.contains('{') || part.contains('}') {
                    return Err(TemplateError::PartialPlaceholder {
                        template: template.to_string(),
                        segment: part.to_string(),
                    });
                }
                segments.push(Segment::Literal(part.to_string()));
                continue;
            }

            let inner = &part[1..part.len() - 1];
            let (name, catch_all) = match inner.strip_prefix('*') {
                Some(rest) => (rest, true),
                None => (inner, inner.eq_ignore_ascii_case(EVERYTHING)),
            };
            if name.is_empty() {
                return Err(TemplateError::EmptyPlaceholder(template.to_string()));
            }
            if names.contains(&name) {
                return Err(TemplateError::DuplicatePlaceholder {
                    template: template.to_string(),
                    name: name.to_string(),
                });
            }
            names.push(name);

            if catch_all {
                if index + 1 != parts.len() {
                    return Err(TemplateError::CatchAllNotLast(template.to_string()));
                }
                segments.push(Segment::CatchAll(name.to_string()));
            } else {
                segments.push(Segment::Placeholder(name.to_string()));
            }
        }

        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn placeholder_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Placeholder(name) | Segment::CatchAll(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| matches!(segment, Segment::Literal(_)))
            .count()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn has_catch_all(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::CatchAll(_)))
    }

    /// Match a request path, returning the placeholder bindings on success.
    pub fn matches(&self, path: &str, case_sensitive: bool) -> Option<PathBindings> {
        let parts: Vec<&str> = split_path(path).collect();
        let mut bindings = PathBindings::default();

        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(literal) => {
                    let part = parts.get(index)?;
                    let equal = if case_sensitive {
                        literal == part
                    } else {
                        literal.eq_ignore_ascii_case(part)
                    };
                    if !equal {
                        return None;
                    }
                }
                Segment::Placeholder(name) => {
                    let part = parts.get(index)?;
                    bindings.insert(name, decode_segment(part));
                }
                Segment::CatchAll(name) => {
                    let rest = parts.get(index..).unwrap_or_default();
                    bindings.insert(name, rest.join("/"));
                    return Some(bindings);
                }
            }
        }

        (parts.len() == self.segments.len()).then_some(bindings)
    }

    /// Substitute bindings into this template to produce a path.
    ///
    /// Placeholders without a binding are emitted verbatim; an empty catch-all
    /// contributes no segment.
    pub fn render(&self, bindings: &PathBindings) -> String {
        let mut path = String::new();
        for segment in &self.segments {
            let value = match segment {
                Segment::Literal(literal) => literal.clone(),
                Segment::Placeholder(name) => match bindings.get(name) {
                    Some(value) => urlencoding::encode(value).into_owned(),
                    None => format!("{{{name}}}"),
                },
                Segment::CatchAll(name) => match bindings.get(name) {
                    Some(value) => value.to_string(),
                    None => format!("{{{name}}}"),
                },
            };
            if value.is_empty() {
                continue;
            }
            path.push('/');
            path.push_str(&value);
        }

        if path.is_empty() || (self.raw.ends_with('/') && self.raw.len() > 1) {
            path.push('/');
        }
        path
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// Ordered placeholder bindings captured while matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathBindings(Vec<(String, String)>);

impl PathBindings {
    pub fn insert(&mut self, name: &str, value: String) {
        match self.0.iter_mut().find(|(existing, _)| existing == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What a table entry resolves to.
#[derive(Debug, Clone)]
pub enum MatchTarget {
    Route(Arc<Route>),
    Aggregate(Arc<Aggregate>),
}

impl MatchTarget {
    pub fn id(&self) -> &str {
        match self {
            MatchTarget::Route(route) => &route.id,
            MatchTarget::Aggregate(aggregate) => &aggregate.id,
        }
    }
}

/// Successful resolution of an inbound request.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub target: MatchTarget,
    pub bindings: PathBindings,
}

#[derive(Debug)]
struct Candidate {
    target: MatchTarget,
    template: PathTemplate,
    /// Empty means any method.
    methods: Vec<Method>,
    host: Option<String>,
    priority: i32,
    case_sensitive: bool,
    order: usize,
}

impl Candidate {
    fn rank(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.host.is_some().cmp(&self.host.is_some()))
            .then_with(|| {
                other
                    .template
                    .literal_count()
                    .cmp(&self.template.literal_count())
            })
            .then_with(|| {
                self.template
                    .segment_count()
                    .cmp(&other.template.segment_count())
            })
            .then_with(|| {
                self.template
                    .has_catch_all()
                    .cmp(&other.template.has_catch_all())
            })
            .then_with(|| self.order.cmp(&other.order))
    }

    fn accepts_host(&self, host: Option<&str>) -> bool {
        let Some(expected) = &self.host else {
            return true;
        };
        let Some(host) = host else {
            return false;
        };
        if expected.contains(':') {
            expected.eq_ignore_ascii_case(host)
        } else {
            expected.eq_ignore_ascii_case(strip_port(host))
        }
    }
}

fn strip_port(host: &str) -> &str {
    // bracketed IPv6 literal
    if let Some(end) = host.find(']') {
        return &host[..=end];
    }
    host.split(':').next().unwrap_or(host)
}

/// Immutable, pre-ranked set of match candidates owned by a snapshot.
#[derive(Debug, Default)]
pub struct RouteTable {
    candidates: Vec<Candidate>,
}

impl RouteTable {
    pub fn builder() -> RouteTableBuilder {
        RouteTableBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Resolve `method host path` to the best candidate.
    pub fn find(&self, method: &Method, host: Option<&str>, path: &str) -> Option<RouteMatch> {
        self.candidates.iter().find_map(|candidate| {
            if !candidate.methods.is_empty() && !candidate.methods.contains(method) {
                return None;
            }
            if !candidate.accepts_host(host) {
                return None;
            }
            candidate
                .template
                .matches(path, candidate.case_sensitive)
                .map(|bindings| RouteMatch {
                    target: candidate.target.clone(),
                    bindings,
                })
        })
    }
}

#[derive(Debug, Default)]
pub struct RouteTableBuilder {
    candidates: Vec<Candidate>,
}

impl RouteTableBuilder {
    pub fn route(&mut self, route: Arc<Route>) -> &mut Self {
        let order = self.candidates.len();
        self.candidates.push(Candidate {
            template: route.upstream.clone(),
            methods: route.methods.clone(),
            host: route.upstream_host.clone(),
            priority: route.priority,
            case_sensitive: route.case_sensitive,
            order,
            target: MatchTarget::Route(route),
        });
        self
    }

    /// Aggregates answer GET only.
    pub fn aggregate(&mut self, aggregate: Arc<Aggregate>) -> &mut Self {
        let order = self.candidates.len();
        self.candidates.push(Candidate {
            template: aggregate.upstream.clone(),
            methods: vec![Method::GET],
            host: aggregate.upstream_host.clone(),
            priority: aggregate.priority,
            case_sensitive: false,
            order,
            target: MatchTarget::Aggregate(aggregate),
        });
        self
    }

    pub fn build(mut self) -> RouteTable {
        self.candidates.sort_by(Candidate::rank);
        RouteTable {
            candidates: self.candidates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::tests::test_route;

    #[test]
    fn test_parse_template() {
        let template = PathTemplate::parse("/api/{version}/users/{*rest}").unwrap();
        assert_eq!(template.literal_count(), 2);
        assert_eq!(template.segment_count(), 4);
        assert!(template.has_catch_all());
        assert_eq!(
            template.placeholder_names().collect::<Vec<_>>(),
            vec!["version", "rest"]
        );
    }

    #[test]
    fn test_parse_rejects_malformed_templates() {
        assert!(matches!(
            PathTemplate::parse("api"),
            Err(TemplateError::MissingLeadingSlash(_))
        ));
        assert!(matches!(
            PathTemplate::parse("/v{id}"),
            Err(TemplateError::PartialPlaceholder { .. })
        ));
        assert!(matches!(
            PathTemplate::parse("/{id}/{id}"),
            Err(TemplateError::DuplicatePlaceholder { .. })
        ));
        assert!(matches!(
            PathTemplate::parse("/{everything}/tail"),
            Err(TemplateError::CatchAllNotLast(_))
        ));
        assert!(matches!(
            PathTemplate::parse("/{}"),
            Err(TemplateError::EmptyPlaceholder(_))
        ));
    }

    #[test]
    fn test_placeholder_matches_one_segment() {
        let template = PathTemplate::parse("/users/{id}").unwrap();
        let bindings = template.matches("/users/42", false).unwrap();
        assert_eq!(bindings.get("id"), Some("42"));

        assert!(template.matches("/users", false).is_none());
        assert!(template.matches("/users/42/orders", false).is_none());
        assert!(template.matches("/users/", false).is_none());
    }

    #[test]
    fn test_catch_all_matches_zero_or_more() {
        let template = PathTemplate::parse("/files/{everything}").unwrap();
        assert_eq!(
            template.matches("/files/a/b/c", false).unwrap().get("everything"),
            Some("a/b/c")
        );
        assert_eq!(
            template.matches("/files", false).unwrap().get("everything"),
            Some("")
        );
    }

    #[test]
    fn test_root_template() {
        let template = PathTemplate::parse("/").unwrap();
        assert!(template.matches("/", false).is_some());
        assert!(template.matches("/x", false).is_none());
        assert_eq!(template.render(&PathBindings::default()), "/");
    }

    #[test]
    fn test_literal_case_sensitivity() {
        let template = PathTemplate::parse("/Api").unwrap();
        assert!(template.matches("/api", false).is_some());
        assert!(template.matches("/api", true).is_none());
    }

    #[test]
    fn test_render_downstream_path() {
        let upstream = PathTemplate::parse("/orders/{id}/{everything}").unwrap();
        let downstream = PathTemplate::parse("/api/v2/orders/{id}/{everything}").unwrap();

        let bindings = upstream.matches("/orders/7/items/3", false).unwrap();
        assert_eq!(downstream.render(&bindings), "/api/v2/orders/7/items/3");

        let bindings = upstream.matches("/orders/7", false).unwrap();
        assert_eq!(downstream.render(&bindings), "/api/v2/orders/7");
    }

    #[test]
    fn test_literal_route_beats_placeholder_route() {
        let mut builder = RouteTable::builder();
        builder
            .route(Arc::new(test_route("by-id", "/a/{id}")))
            .route(Arc::new(test_route("literal", "/a/b")));
        let table = builder.build();

        let matched = table.find(&Method::GET, None, "/a/b").unwrap();
        assert_eq!(matched.target.id(), "literal");

        let matched = table.find(&Method::GET, None, "/a/c").unwrap();
        assert_eq!(matched.target.id(), "by-id");
        assert_eq!(matched.bindings.get("id"), Some("c"));
    }

    #[test]
    fn test_fewer_segments_then_declaration_order() {
        let mut builder = RouteTable::builder();
        builder
            .route(Arc::new(test_route("catch-all", "/a/{everything}")))
            .route(Arc::new(test_route("first", "/a/{x}")))
            .route(Arc::new(test_route("second", "/a/{y}")));
        let table = builder.build();

        assert_eq!(
            table.find(&Method::GET, None, "/a/z").unwrap().target.id(),
            "first"
        );
        assert_eq!(
            table.find(&Method::GET, None, "/a/z/q").unwrap().target.id(),
            "catch-all"
        );
    }

    #[test]
    fn test_priority_and_host_constraints() {
        let mut low = test_route("low", "/a/b");
        low.priority = 0;
        let mut hosted = test_route("hosted", "/a/{x}");
        hosted.upstream_host = Some("api.example.com".to_string());

        let mut builder = RouteTable::builder();
        builder
            .route(Arc::new(low))
            .route(Arc::new(hosted))
            .route(Arc::new(test_route("generic", "/a/{x}")));
        let table = builder.build();

        assert_eq!(
            table
                .find(&Method::GET, Some("API.example.com:8080"), "/a/b")
                .unwrap()
                .target
                .id(),
            "hosted"
        );
        assert_eq!(
            table.find(&Method::GET, Some("other"), "/a/b").unwrap().target.id(),
            "generic"
        );
    }

    #[test]
    fn test_method_filter() {
        let mut post_only = test_route("post", "/items");
        post_only.methods = vec![Method::POST];
        let mut builder = RouteTable::builder();
        builder.route(Arc::new(post_only));
        let table = builder.build();

        assert!(table.find(&Method::GET, None, "/items").is_none());
        assert!(table.find(&Method::POST, None, "/items").is_some());
    }
}
