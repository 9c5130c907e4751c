//! Request classification by method, destination and URL path.

use crate::http::{Destination, Method, Request};

/// Which strategy family a request belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKind {
  /// Navigation to an HTML document (app shell)
  Navigation,
  /// GET under the API prefix
  ApiRead,
  /// Script or style sheet
  StaticAsset,
  /// Answer/hint submission that is queued when the network fails
  ProtectedWrite { session_id: Option<String> },
  /// Straight to the network, untouched
  Passthrough,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
  Literal(String),
  Session,
  Any,
}

/// Path pattern such as `/api/v1/sessions/{session}/answers`.
///
/// `{session}` captures the session id; any other `{name}` matches a single
/// segment without capturing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
  raw: String,
  segments: Vec<Segment>,
}

impl PathTemplate {
  pub fn parse(template: &str) -> Self {
    let segments = template
      .split('/')
      .filter(|s| !s.is_empty())
      .map(|s| {
        if s == "{session}" {
          Segment::Session
        } else if s.starts_with('{') && s.ends_with('}') {
          Segment::Any
        } else {
          Segment::Literal(s.to_string())
        }
      })
      .collect();

    Self {
      raw: template.to_string(),
      segments,
    }
  }

  /// Match a path. `Some(session)` on match, where `session` is the captured
  /// `{session}` segment if the template has one.
  pub fn matches(&self, path: &str) -> Option<Option<String>> {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() != self.segments.len() {
      return None;
    }

    let mut session = None;
    for (segment, part) in self.segments.iter().zip(parts) {
      match segment {
        Segment::Literal(lit) if lit == part => {}
        Segment::Literal(_) => return None,
        Segment::Session => session = Some(part.to_string()),
        Segment::Any => {}
      }
    }
    Some(session)
  }

  pub fn as_str(&self) -> &str {
    &self.raw
  }
}

/// Routing rules for the app's origin.
#[derive(Debug, Clone)]
pub struct RouteTable {
  api_prefix: String,
  protected_writes: Vec<PathTemplate>,
}

impl RouteTable {
  pub fn new(api_prefix: &str, protected_writes: &[String]) -> Self {
    Self {
      api_prefix: api_prefix.to_string(),
      protected_writes: protected_writes
        .iter()
        .map(|t| PathTemplate::parse(t))
        .collect(),
    }
  }

  pub fn classify(&self, request: &Request) -> RouteKind {
    let path = request.path();

    if request.method == Method::Post {
      if let Some(session_id) = self.protected_writes.iter().find_map(|t| t.matches(path)) {
        return RouteKind::ProtectedWrite { session_id };
      }
    }

    if request.method != Method::Get {
      return RouteKind::Passthrough;
    }

    match request.destination {
      Destination::Document => RouteKind::Navigation,
      Destination::Script | Destination::Style => RouteKind::StaticAsset,
      _ if path.starts_with(&self.api_prefix) => RouteKind::ApiRead,
      _ => RouteKind::Passthrough,
    }
  }
}
