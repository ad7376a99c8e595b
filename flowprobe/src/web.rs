use crate::api::{parse_http_request, send_http_response, ApiRouter, HttpResponse};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinSet;

// Requests larger than this are cut off
const REQUEST_BUFFER: usize = 8192;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Serve the API router until `shutdown_notify` fires.
pub async fn start_server(
    bind_addr: SocketAddr,
    api_router: ApiRouter,
    shutdown_notify: Arc<Notify>,
    web_log: bool,
) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(bind_addr).await?;
    serve(listener, api_router, shutdown_notify, web_log).await
}

pub async fn serve(
    listener: TcpListener,
    api_router: ApiRouter,
    shutdown_notify: Arc<Notify>,
    web_log: bool,
) -> Result<(), anyhow::Error> {
    info!("HTTP API listening on {}", listener.local_addr()?);

    // Registered once so a notification between accepts is not missed
    let shutdown = shutdown_notify.notified();
    tokio::pin!(shutdown);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let router = api_router.clone();
                connections.spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, router, web_log).await {
                        debug!("Error handling connection from {}: {}", peer, e);
                    }
                });
            }
            _ = &mut shutdown => {
                info!("HTTP API received shutdown signal, stopping...");
                break;
            }
        }
    }

    // Open connections hold router clones, and through them the table
    drop(api_router);
    while connections.join_next().await.is_some() {}

    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    router: ApiRouter,
    web_log: bool,
) -> Result<(), anyhow::Error> {
    let mut buffer = vec![0u8; REQUEST_BUFFER];
    let n = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buffer)).await??;
    if n == 0 {
        return Ok(());
    }

    let response = match parse_http_request(&buffer[..n]) {
        Ok(request) => {
            let response = match router.route_request(&request).await {
                Ok(response) => response,
                Err(e) => HttpResponse::error(500, e.to_string()),
            };
            if web_log {
                info!(
                    "{} {} {} -> {}",
                    peer, request.method, request.path, response.status
                );
            }
            response
        }
        Err(e) => HttpResponse::error(400, e.to_string()),
    };

    send_http_response(&mut stream, &response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::flows::FlowApiHandler;
    use crate::api::ApiHandler;
    use crate::flow::FlowTable;
    use std::sync::atomic::AtomicBool;
    use tokio::io::AsyncWriteExt;

    async fn request(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_server_routes_and_stops() {
        let table = Arc::new(FlowTable::create(16, 0).unwrap());
        let mut router = ApiRouter::new();
        router.register_handler(ApiHandler::Flows(FlowApiHandler::new(
            table,
            Arc::default(),
            Arc::new(AtomicBool::new(false)),
        )));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let server = tokio::spawn(serve(listener, router, Arc::clone(&shutdown), false));

        let response = request(addr, "GET /api/flows/dump HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("t->n_entries = 16\n"));

        let response = request(addr, "GET /missing HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404"));

        let response = request(addr, "garbage\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400"));

        shutdown.notify_waiters();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_open_connections() {
        let table = Arc::new(FlowTable::create(16, 0).unwrap());
        let mut router = ApiRouter::new();
        router.register_handler(ApiHandler::Flows(FlowApiHandler::new(
            Arc::clone(&table),
            Arc::default(),
            Arc::new(AtomicBool::new(false)),
        )));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let server = tokio::spawn(serve(listener, router, Arc::clone(&shutdown), false));

        let response = request(addr, "GET /api/flows/totals HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

        // A client that connected but has not sent its request yet
        let idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!server.is_finished());

        drop(idle);
        server.await.unwrap().unwrap();
        assert_eq!(Arc::strong_count(&table), 1);
    }
}
