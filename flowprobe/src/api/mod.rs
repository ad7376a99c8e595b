pub mod flows;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// JSON envelope shared by every endpoint
#[derive(Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            message: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            message: Some(message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query_params: HashMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: String) -> Self {
        Self {
            status: 200,
            content_type: "application/json".to_string(),
            body,
        }
    }

    pub fn text(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/plain".to_string(),
            body,
        }
    }

    pub fn error(status: u16, message: String) -> Self {
        let error_response = ApiResponse::<()>::error(message);
        let body = serde_json::to_string(&error_response).unwrap_or_else(|_| {
            r#"{"status":"error","message":"JSON serialization failed"}"#.to_string()
        });
        Self {
            status,
            content_type: "application/json".to_string(),
            body,
        }
    }

    pub fn method_not_allowed() -> Self {
        Self::error(405, "Method not allowed".to_string())
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain".to_string(),
            body: "Not Found".to_string(),
        }
    }
}

/// API handlers by module
#[derive(Clone)]
pub enum ApiHandler {
    Flows(flows::FlowApiHandler),
}

impl ApiHandler {
    pub fn module_name(&self) -> &'static str {
        match self {
            ApiHandler::Flows(_) => "flows",
        }
    }

    pub fn supported_routes(&self) -> Vec<&'static str> {
        match self {
            ApiHandler::Flows(handler) => handler.supported_routes(),
        }
    }

    pub async fn handle_request(
        &self,
        request: &HttpRequest,
    ) -> Result<HttpResponse, anyhow::Error> {
        match self {
            ApiHandler::Flows(handler) => handler.handle_request(request).await,
        }
    }
}

/// Maps request paths to module handlers
#[derive(Clone, Default)]
pub struct ApiRouter {
    handlers: HashMap<String, ApiHandler>,
}

impl ApiRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register an API handler for a module
    pub fn register_handler(&mut self, handler: ApiHandler) {
        self.handlers
            .insert(handler.module_name().to_string(), handler);
    }

    /// Route a request to the first handler claiming its path prefix
    pub async fn route_request(
        &self,
        request: &HttpRequest,
    ) -> Result<HttpResponse, anyhow::Error> {
        for handler in self.handlers.values() {
            for route in handler.supported_routes() {
                if request.path.starts_with(route) {
                    return handler.handle_request(request).await;
                }
            }
        }

        Ok(HttpResponse::not_found())
    }
}

/// Parse the request line, query string and body of a raw HTTP request
pub fn parse_http_request(request_bytes: &[u8]) -> Result<HttpRequest, anyhow::Error> {
    let request_str = String::from_utf8_lossy(request_bytes);
    let request_line = request_str
        .lines()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty request"))?;

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(anyhow::anyhow!("Invalid request line"));
    }

    let method = parts[0].to_string();
    let (path, query_str) = match parts[1].split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query)),
        None => (parts[1].to_string(), None),
    };

    let mut query_params = HashMap::new();
    if let Some(query) = query_str {
        for param in query.split('&') {
            if let Some((key, value)) = param.split_once('=') {
                query_params.insert(key.to_string(), value.to_string());
            }
        }
    }

    let body = request_str
        .find("\r\n\r\n")
        .map(|start| request_str[start + 4..].to_string())
        .filter(|body| !body.is_empty());

    Ok(HttpRequest {
        method,
        path,
        query_params,
        body,
    })
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn render_http_response(response: &HttpResponse) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.status,
        status_text(response.status),
        response.content_type,
        response.body.len(),
        response.body
    )
}

pub async fn send_http_response(
    stream: &mut TcpStream,
    response: &HttpResponse,
) -> Result<(), anyhow::Error> {
    stream
        .write_all(render_http_response(response).as_bytes())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line_and_query() {
        let raw = b"GET /api/flows?limit=10&proto=6 HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let request = parse_http_request(raw).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/api/flows");
        assert_eq!(request.query_params.get("limit").map(String::as_str), Some("10"));
        assert_eq!(request.query_params.get("proto").map(String::as_str), Some("6"));
        assert!(request.body.is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_http_request(b"").is_err());
        assert!(parse_http_request(b"GET\r\n\r\n").is_err());
    }

    #[test]
    fn test_rendered_response_has_length_and_status() {
        let rendered = render_http_response(&HttpResponse::method_not_allowed());
        assert!(rendered.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));

        let rendered = render_http_response(&HttpResponse::text("abc".to_string()));
        assert!(rendered.contains("Content-Type: text/plain\r\n"));
        assert!(rendered.contains("Content-Length: 3\r\n"));
        assert!(rendered.ends_with("\r\n\r\nabc"));
    }

    #[tokio::test]
    async fn test_router_without_handlers_is_not_found() {
        let router = ApiRouter::new();
        let request = parse_http_request(b"GET /api/flows HTTP/1.1\r\n\r\n").unwrap();
        let response = router.route_request(&request).await.unwrap();
        assert_eq!(response.status, 404);
    }
}
