//! Maps a handshake request URI to the endpoint it subscribes to.
//!
//! - `/ws/context/{project}?user_id=..&since=..` joins one project scope
//! - `/ws/updates?user_id=..` joins the global scope

use percent_encoding::percent_decode_str;
use serde::Deserialize;
use thiserror::Error;

const PROJECT_PREFIX: &str = "/ws/context/";
const GLOBAL_PATH: &str = "/ws/updates";

/// Where a new connection subscribes, taken from the handshake request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    /// `None` for the global endpoint.
    pub project_name: Option<String>,
    pub user_id: Option<String>,
    /// Last change id the client has seen. Only used on project endpoints.
    pub since: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("No endpoint at {0}")]
    NotFound(String),

    #[error("Invalid query string: {0}")]
    BadQuery(String),
}

#[derive(Debug, Default, Deserialize)]
struct ConnectQuery {
    user_id: Option<String>,
    #[serde(default)]
    since: u64,
}

impl Endpoint {
    /// Resolves a path and optional query string.
    pub fn resolve(path: &str, query: Option<&str>) -> Result<Self, RouteError> {
        let path = path.strip_suffix('/').unwrap_or(path);

        let project_name = if path == GLOBAL_PATH {
            None
        } else if let Some(segment) = path.strip_prefix(PROJECT_PREFIX) {
            Some(decode_project(segment).ok_or_else(|| RouteError::NotFound(path.to_string()))?)
        } else {
            return Err(RouteError::NotFound(path.to_string()));
        };

        let query: ConnectQuery = match query {
            Some(raw) if !raw.is_empty() => serde_urlencoded::from_str(raw)
                .map_err(|e| RouteError::BadQuery(e.to_string()))?,
            _ => ConnectQuery::default(),
        };

        Ok(Self {
            since: if project_name.is_some() { query.since } else { 0 },
            project_name,
            user_id: query.user_id.filter(|u| !u.is_empty()),
        })
    }
}

/// Decodes a single non-empty path segment.
fn decode_project(segment: &str) -> Option<String> {
    if segment.is_empty() || segment.contains('/') {
        return None;
    }
    let name = percent_decode_str(segment).decode_utf8().ok()?;
    if name.trim().is_empty() {
        return None;
    }
    Some(name.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_endpoint() {
        let endpoint =
            Endpoint::resolve("/ws/context/demo", Some("user_id=alice&since=12")).unwrap();
        assert_eq!(endpoint.project_name.as_deref(), Some("demo"));
        assert_eq!(endpoint.user_id.as_deref(), Some("alice"));
        assert_eq!(endpoint.since, 12);
    }

    #[test]
    fn test_project_name_is_decoded() {
        let endpoint = Endpoint::resolve("/ws/context/my%20project/", None).unwrap();
        assert_eq!(endpoint.project_name.as_deref(), Some("my project"));
        assert_eq!(endpoint.user_id, None);
        assert_eq!(endpoint.since, 0);
    }

    #[test]
    fn test_global_endpoint_ignores_since() {
        let endpoint = Endpoint::resolve("/ws/updates", Some("user_id=ops&since=5")).unwrap();
        assert_eq!(endpoint.project_name, None);
        assert_eq!(endpoint.user_id.as_deref(), Some("ops"));
        assert_eq!(endpoint.since, 0);
    }

    #[test]
    fn test_empty_user_id_is_anonymous() {
        let endpoint = Endpoint::resolve("/ws/context/demo", Some("user_id=")).unwrap();
        assert_eq!(endpoint.user_id, None);
    }

    #[test]
    fn test_unknown_paths() {
        for path in ["/", "/ws", "/ws/context/", "/ws/context/a/b", "/ws/updates/extra"] {
            assert!(
                matches!(Endpoint::resolve(path, None), Err(RouteError::NotFound(_))),
                "{path} should not resolve"
            );
        }
    }

    #[test]
    fn test_bad_since() {
        assert!(matches!(
            Endpoint::resolve("/ws/context/demo", Some("since=latest")),
            Err(RouteError::BadQuery(_))
        ));
    }
}
