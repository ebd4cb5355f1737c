//! Local HTTP listener the browser is redirected to after sign-in.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace};

use crate::errors::{MsAuthError, Result};

/// Browsers open speculative connections that never send a request
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HEADER_LINES: usize = 100;

/// Outcome shown to the user on the redirect page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseState {
    Success,
    Failure,
    Invalid,
}

impl ResponseState {
    pub fn default_message(self) -> &'static str {
        match self {
            Self::Success => "You have successfully authenticated.",
            Self::Failure => "Authentication failed.",
            Self::Invalid => "Invalid response.",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Renders the page the browser lands on
pub trait PageRenderer: Send + Sync {
    /// Produce a complete HTML document showing `message`
    fn render(&self, message: &str) -> String;

    /// Message to show for a given state
    fn message(&self, state: ResponseState) -> String {
        state.default_message().to_string()
    }
}

/// Bare HTML page with the message as a heading
#[derive(Debug, Clone, Copy, Default)]
pub struct SimplePage;

impl PageRenderer for SimplePage {
    fn render(&self, message: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta http-equiv="X-UA-Compatible" content="IE=edge">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>OAuth2</title>
</head>
<body>
    <h1>{}</h1>
</body>
</html>
"#,
            escape_html(message)
        )
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Listener on `127.0.0.1:<port>` yielding one [`Callback`] per GET request.
///
/// Connections are read concurrently so an idle socket can't hold up the
/// real redirect. Dropping the server stops accepting.
#[derive(Debug)]
pub struct RedirectServer {
    addr: SocketAddr,
    callbacks: mpsc::Receiver<Callback>,
    acceptor: JoinHandle<()>,
}

impl RedirectServer {
    /// Bind the listener; port 0 picks a free port
    #[instrument]
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let addr = listener.local_addr()?;
        let (tx, callbacks) = mpsc::channel(8);

        let acceptor = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!("Redirect listener accept failed: {}", e);
                        continue;
                    }
                };
                trace!(%peer, "Accepted redirect connection");

                let tx = tx.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(REQUEST_READ_TIMEOUT, read_request(stream)).await {
                        Ok(Ok(Some(callback))) => {
                            let _ = tx.send(callback).await;
                        }
                        Ok(Ok(None)) => {}
                        Ok(Err(e)) => debug!(%peer, "Dropping malformed redirect request: {}", e),
                        Err(_) => trace!(%peer, "Redirect connection idle, closing"),
                    }
                });
            }
        });

        debug!(%addr, "Redirect listener started");
        Ok(Self {
            addr,
            callbacks,
            acceptor,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.addr.port()
    }

    /// Wait for the next GET request
    pub async fn accept(&mut self) -> Result<Callback> {
        self.callbacks
            .recv()
            .await
            .ok_or_else(|| MsAuthError::InvalidRedirect("Redirect listener stopped".to_string()))
    }
}

impl Drop for RedirectServer {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

/// One GET request that reached the listener, waiting for a reply
#[derive(Debug)]
pub struct Callback {
    stream: TcpStream,
    path: String,
    params: HashMap<String, String>,
}

impl Callback {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Decoded query parameters
    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Answer with the page for `state` and close the connection
    pub async fn respond(mut self, state: ResponseState, renderer: &dyn PageRenderer) -> Result<()> {
        let body = renderer.render(&renderer.message(state));
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );

        self.stream.write_all(head.as_bytes()).await?;
        self.stream.write_all(body.as_bytes()).await?;
        self.stream.flush().await?;
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

/// Read the request head; non-GET requests are answered with 405 here
async fn read_request(stream: TcpStream) -> Result<Option<Callback>> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(None);
    }

    // Drain headers; nothing in them matters here
    let mut line = String::new();
    for _ in 0..MAX_HEADER_LINES {
        line.clear();
        if reader.read_line(&mut line).await? == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let mut stream = reader.into_inner();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(MsAuthError::InvalidRedirect(format!(
            "Malformed request line: {:?}",
            request_line.trim_end()
        )));
    };

    if !method.eq_ignore_ascii_case("GET") {
        stream
            .write_all(b"HTTP/1.1 405 Method Not Allowed\r\nAllow: GET\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
        let _ = stream.shutdown().await;
        return Ok(None);
    }

    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let params = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    Ok(Some(Callback {
        stream,
        path: path.to_string(),
        params,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_messages() {
        assert_eq!(ResponseState::Success.default_message(), "You have successfully authenticated.");
        assert_eq!(ResponseState::Failure.default_message(), "Authentication failed.");
        assert_eq!(ResponseState::Invalid.default_message(), "Invalid response.");
        assert!(ResponseState::Success.is_success());
        assert!(!ResponseState::Invalid.is_success());
    }

    #[test]
    fn test_simple_page_escapes() {
        let page = SimplePage.render("<b>hi</b>");
        assert!(page.contains("<h1>&lt;b&gt;hi&lt;/b&gt;</h1>"));
        assert!(page.starts_with("<!DOCTYPE html>"));
    }

    #[tokio::test]
    async fn test_callback_roundtrip() {
        let mut server = RedirectServer::bind(0).await.unwrap();
        let port = server.local_port();

        let request = tokio::spawn(async move {
            reqwest::get(format!("http://127.0.0.1:{port}/?code=M.C123&state=abc%20def"))
                .await
                .unwrap()
        });

        let callback = server.accept().await.unwrap();
        assert_eq!(callback.path(), "/");
        assert_eq!(callback.param("code"), Some("M.C123"));
        assert_eq!(callback.param("state"), Some("abc def"));
        callback.respond(ResponseState::Success, &SimplePage).await.unwrap();

        let response = request.await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/html; charset=utf-8"
        );
        assert!(response.text().await.unwrap().contains("You have successfully authenticated."));
    }

    #[tokio::test]
    async fn test_post_is_rejected() {
        let mut server = RedirectServer::bind(0).await.unwrap();
        let port = server.local_port();

        let response = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/?code=abc"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

        // The POST never surfaces as a callback
        let pending = tokio::time::timeout(Duration::from_millis(200), server.accept()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_idle_connection_does_not_block() {
        let mut server = RedirectServer::bind(0).await.unwrap();
        let port = server.local_port();

        let _idle = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = tokio::spawn(async move {
            reqwest::get(format!("http://127.0.0.1:{port}/?code=xyz")).await.unwrap()
        });

        let callback = tokio::time::timeout(Duration::from_secs(5), server.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(callback.param("code"), Some("xyz"));
        callback.respond(ResponseState::Invalid, &SimplePage).await.unwrap();

        let body = request.await.unwrap().text().await.unwrap();
        assert!(body.contains("Invalid response."));
    }
}
