//! Namespaced module routes and middleware.
//!
//! A module declares routes relative to its own prefix through a
//! [`ModuleRouter`]; it never sees the namespace or other modules' paths.
//! The registry resolves `/<namespace>/<module>/<rest>` against the live
//! snapshot and runs host auth, the module's middleware chain and the
//! handler inside the fault isolation boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::metrics::ModuleMetrics;
use super::snapshot::ModuleRuntime;
use super::types::Result;
use crate::config::DefaultRouteAuth;

pub type Request = axum::extract::Request;
pub type Response = axum::response::Response;

pub type RouteHandler = Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Response>> + Send + Sync>;
pub type Middleware =
    Arc<dyn Fn(Request, Next) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// Path segment reserved for static assets.
pub const STATIC_SEGMENT: &str = "static";

// ============================================================================
// Auth
// ============================================================================

/// Host authentication a route requires.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthRequirement {
    #[default]
    Public,
    Authenticated,
    Role(String),
}

impl AuthRequirement {
    /// Combine with the host default. A route can tighten but never loosen it.
    pub fn effective(&self, default: DefaultRouteAuth) -> AuthRequirement {
        match (self, default) {
            (Self::Public, DefaultRouteAuth::Authenticated) => Self::Authenticated,
            (other, _) => other.clone(),
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self, Self::Public)
    }
}

/// Extract a bearer token from the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

// ============================================================================
// Paths
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Param(String),
}

/// A validated relative path such as `/items/:id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

fn is_static_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~')
}

impl PathPattern {
    pub fn parse(path: &str) -> std::result::Result<Self, String> {
        if !path.starts_with('/') {
            return Err(format!("route path must start with `/`: {path}"));
        }
        let trimmed = path.trim_end_matches('/');
        let mut segments = Vec::new();
        if !trimmed.is_empty() {
            for seg in trimmed[1..].split('/') {
                if seg.is_empty() {
                    return Err(format!("route path has an empty segment: {path}"));
                }
                if let Some(name) = seg.strip_prefix(':') {
                    let valid = !name.is_empty()
                        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                    if !valid {
                        return Err(format!("invalid path parameter `{seg}` in {path}"));
                    }
                    if segments
                        .iter()
                        .any(|s| matches!(s, Segment::Param(p) if p == name))
                    {
                        return Err(format!("duplicate path parameter `{name}` in {path}"));
                    }
                    segments.push(Segment::Param(name.to_string()));
                } else if seg.chars().all(is_static_char) && seg != "." && seg != ".." {
                    segments.push(Segment::Static(seg.to_string()));
                } else {
                    return Err(format!("invalid path segment `{seg}` in {path}"));
                }
            }
        }
        if matches!(segments.first(), Some(Segment::Static(s)) if s == STATIC_SEGMENT) {
            return Err(format!("`/{STATIC_SEGMENT}` is reserved for static assets: {path}"));
        }
        Ok(Self {
            raw: if trimmed.is_empty() {
                "/".to_string()
            } else {
                trimmed.to_string()
            },
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Two patterns with the same shape match exactly the same paths.
    pub fn same_shape(&self, other: &PathPattern) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| match (a, b) {
                    (Segment::Static(x), Segment::Static(y)) => x == y,
                    (Segment::Param(_), Segment::Param(_)) => true,
                    _ => false,
                })
    }

    /// Static segments sort before params, so `/items/new` beats `/items/:id`.
    fn specificity(&self) -> Vec<u8> {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Static(_) => 0,
                Segment::Param(_) => 1,
            })
            .collect()
    }

    pub fn matches(&self, segments: &[&str]) -> Option<PathParams> {
        if segments.len() != self.segments.len() {
            return None;
        }
        let mut params = BTreeMap::new();
        for (pattern, actual) in self.segments.iter().zip(segments) {
            match pattern {
                Segment::Static(s) if s.as_str() == *actual => {}
                Segment::Static(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), (*actual).to_string());
                }
            }
        }
        Some(PathParams(params))
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Path parameters of the matched route, inserted as a request extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(BTreeMap<String, String>);

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Split `/<namespace>/<module>/<rest>` into the module name and the
/// relative path (`/` when empty).
pub fn split_extension_path<'a>(namespace: &str, path: &'a str) -> Option<(&'a str, String)> {
    let rest = path.strip_prefix('/')?.strip_prefix(namespace)?;
    let rest = rest.strip_prefix('/')?;
    let (module, tail) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    if module.is_empty() {
        return None;
    }
    let tail = tail.trim_end_matches('/');
    Some((
        module,
        if tail.is_empty() {
            "/".to_string()
        } else {
            tail.to_string()
        },
    ))
}

fn relative_segments(rel: &str) -> Vec<&str> {
    rel.split('/').filter(|s| !s.is_empty()).collect()
}

// ============================================================================
// Declaration
// ============================================================================

/// A route as declared by a module.
#[derive(Clone)]
pub struct RouteDeclaration {
    pub method: Method,
    pub path: String,
    pub auth: AuthRequirement,
    pub handler: RouteHandler,
}

/// Narrowed router handed to `Extension::routes`.
#[derive(Default)]
pub struct ModuleRouter {
    routes: Vec<RouteDeclaration>,
    middleware: Vec<Middleware>,
}

/// Options on the route just declared.
pub struct RouteOptions<'a> {
    route: &'a mut RouteDeclaration,
}

impl RouteOptions<'_> {
    /// Require a valid bearer token.
    pub fn require_auth(self) -> Self {
        if self.route.auth.is_public() {
            self.route.auth = AuthRequirement::Authenticated;
        }
        self
    }

    /// Require an authenticated user holding `role`.
    pub fn require_role(self, role: impl Into<String>) -> Self {
        self.route.auth = AuthRequirement::Role(role.into());
        self
    }
}

impl ModuleRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F, Fut, R>(&mut self, method: Method, path: &str, handler: F) -> RouteOptions<'_>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: IntoResponse,
    {
        let handler: RouteHandler = Arc::new(move |req| {
            handler(req)
                .map(|res| res.map(IntoResponse::into_response))
                .boxed()
        });
        self.routes.push(RouteDeclaration {
            method,
            path: path.to_string(),
            auth: AuthRequirement::Public,
            handler,
        });
        let idx = self.routes.len() - 1;
        RouteOptions {
            route: &mut self.routes[idx],
        }
    }

    pub fn get<F, Fut, R>(&mut self, path: &str, handler: F) -> RouteOptions<'_>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: IntoResponse,
    {
        self.route(Method::GET, path, handler)
    }

    pub fn post<F, Fut, R>(&mut self, path: &str, handler: F) -> RouteOptions<'_>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: IntoResponse,
    {
        self.route(Method::POST, path, handler)
    }

    pub fn put<F, Fut, R>(&mut self, path: &str, handler: F) -> RouteOptions<'_>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: IntoResponse,
    {
        self.route(Method::PUT, path, handler)
    }

    pub fn patch<F, Fut, R>(&mut self, path: &str, handler: F) -> RouteOptions<'_>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: IntoResponse,
    {
        self.route(Method::PATCH, path, handler)
    }

    pub fn delete<F, Fut, R>(&mut self, path: &str, handler: F) -> RouteOptions<'_>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: IntoResponse,
    {
        self.route(Method::DELETE, path, handler)
    }

    /// Add middleware around every route of this module. The first layer
    /// added runs outermost.
    pub fn layer<F, Fut>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        self.middleware
            .push(Arc::new(move |req, next| middleware(req, next).boxed()));
        self
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn middleware_count(&self) -> usize {
        self.middleware.len()
    }

    pub(crate) fn into_parts(self) -> (Vec<RouteDeclaration>, Vec<Middleware>) {
        (self.routes, self.middleware)
    }
}

/// Validate declared routes, rejecting bad paths and duplicates.
pub(crate) fn compile_routes(
    declarations: Vec<RouteDeclaration>,
) -> std::result::Result<Vec<(RouteDeclaration, PathPattern)>, String> {
    let mut compiled: Vec<(RouteDeclaration, PathPattern)> = Vec::with_capacity(declarations.len());
    for decl in declarations {
        let pattern = PathPattern::parse(&decl.path)?;
        if compiled
            .iter()
            .any(|(d, p)| d.method == decl.method && p.same_shape(&pattern))
        {
            return Err(format!("duplicate route {} {}", decl.method, pattern));
        }
        compiled.push((decl, pattern));
    }
    compiled.sort_by_key(|(_, p)| p.specificity());
    Ok(compiled)
}

// ============================================================================
// Middleware chain
// ============================================================================

/// Remainder of a module's middleware chain, ending in the route handler.
pub struct Next {
    middleware: Arc<[Middleware]>,
    index: usize,
    handler: RouteHandler,
}

impl Next {
    pub(crate) fn new(middleware: Arc<[Middleware]>, handler: RouteHandler) -> Self {
        Self {
            middleware,
            index: 0,
            handler,
        }
    }

    pub async fn run(self, req: Request) -> Result<Response> {
        match self.middleware.get(self.index).cloned() {
            Some(layer) => {
                let next = Next {
                    middleware: self.middleware,
                    index: self.index + 1,
                    handler: self.handler,
                };
                layer(req, next).await
            }
            None => (self.handler)(req).await,
        }
    }
}

// ============================================================================
// Live tables
// ============================================================================

/// A live route in the snapshot.
pub struct RouteEntry {
    pub method: Method,
    pub pattern: PathPattern,
    pub auth: AuthRequirement,
    pub(crate) handler: RouteHandler,
}

/// Everything the dispatch path needs for one enabled module.
pub struct ModuleRoutes {
    pub module: String,
    pub routes: Vec<RouteEntry>,
    pub(crate) middleware: Arc<[Middleware]>,
    pub(crate) assets: BTreeMap<String, super::contract::StaticAsset>,
    pub(crate) runtime: Arc<ModuleRuntime>,
    pub(crate) metrics: Arc<ModuleMetrics>,
}

/// Outcome of matching a relative path against one module.
pub enum RouteMatch<'a> {
    Found(&'a RouteEntry, PathParams),
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

impl ModuleRoutes {
    pub fn find(&self, method: &Method, rel: &str) -> RouteMatch<'_> {
        let segments = relative_segments(rel);
        let mut allowed = Vec::new();
        for route in &self.routes {
            if let Some(params) = route.pattern.matches(&segments) {
                if &route.method == method {
                    return RouteMatch::Found(route, params);
                }
                if !allowed.contains(&route.method) {
                    allowed.push(route.method.clone());
                }
            }
        }
        if allowed.is_empty() {
            RouteMatch::NotFound
        } else {
            RouteMatch::MethodNotAllowed(allowed)
        }
    }

    /// Asset at `rel` if it lies under `/static/`.
    pub fn asset(&self, rel: &str) -> Option<&super::contract::StaticAsset> {
        let path = rel.strip_prefix("/static/")?;
        self.assets.get(path)
    }

    pub fn is_static_path(rel: &str) -> bool {
        rel == "/static" || rel.starts_with("/static/")
    }
}

// ============================================================================
// Responses
// ============================================================================

/// JSON error in the host's envelope format.
pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        axum::Json(json!({
            "success": false,
            "error": { "code": code, "message": message }
        })),
    )
        .into_response()
}

pub fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Not found")
}

pub fn method_not_allowed(allowed: &[Method]) -> Response {
    let mut response = error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "METHOD_NOT_ALLOWED",
        "Method not allowed",
    );
    let allow = allowed
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if let Ok(value) = header::HeaderValue::from_str(&allow) {
        response.headers_mut().insert(header::ALLOW, value);
    }
    response
}

pub fn internal_error() -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "Internal server error",
    )
}

/// Response for an error a handler returned. Server-side errors are not
/// described to the client.
pub fn extension_error_response(error: &super::types::ExtensionError) -> Response {
    let status = error.status_code();
    if status.is_server_error() {
        return error_response(status, "EXTENSION_ERROR", "Internal server error");
    }
    let code = match status {
        StatusCode::BAD_REQUEST => "BAD_REQUEST",
        StatusCode::UNAUTHORIZED => "UNAUTHORIZED",
        StatusCode::FORBIDDEN => "FORBIDDEN",
        StatusCode::NOT_FOUND => "NOT_FOUND",
        _ => "EXTENSION_ERROR",
    };
    error_response(status, code, &error.to_string())
}
