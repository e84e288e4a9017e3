use std::{
    io::{self, Write},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::RecvTimeoutError,
    },
    thread,
    time::Duration,
};

use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, info, warn};

use crate::{clock_service::ClockService, config::ServerConfig, error::ServerError};

pub const STREAM_PATH: &str = "/api/time/stream";
const ACCEPT_POLL: Duration = Duration::from_millis(200);
const KEEP_ALIVE: Duration = Duration::from_secs(15);

/// HTTP front for the clock: a server-sent event stream plus a health route.
pub struct TimeServer {
    server: Server,
    service: Arc<ClockService>,
    allowed_origin: Arc<str>,
    headers: FixedHeaders,
}

struct FixedHeaders {
    cors: Header,
    json: Header,
    allow_methods: Header,
    allow_headers: Header,
}

impl TimeServer {
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] when the address cannot be bound and
    /// [`ServerError::InvalidHeader`] when the allowed origin is not a valid
    /// header value.
    pub fn bind(config: &ServerConfig, service: Arc<ClockService>) -> Result<Self, ServerError> {
        let server = Server::http(config.bind_addr).map_err(|source| ServerError::Bind {
            addr: config.bind_addr,
            source,
        })?;
        Ok(Self {
            server,
            service,
            allowed_origin: Arc::from(config.allowed_origin.as_str()),
            headers: FixedHeaders {
                cors: header("Access-Control-Allow-Origin", &config.allowed_origin)?,
                json: header("Content-Type", "application/json")?,
                allow_methods: header("Access-Control-Allow-Methods", "GET, OPTIONS")?,
                allow_headers: header("Access-Control-Allow-Headers", "Content-Type")?,
            },
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.server_addr().to_ip()
    }

    /// Serves requests until `running` is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] when accepting a connection fails.
    pub fn run(&self, running: &AtomicBool) -> Result<(), ServerError> {
        while running.load(Ordering::SeqCst) {
            if let Some(request) = self.server.recv_timeout(ACCEPT_POLL)? {
                self.handle(request);
            }
        }
        Ok(())
    }

    fn handle(&self, request: Request) {
        let method = request.method().clone();
        let path = request.url().split('?').next().unwrap_or_default().to_string();
        debug!(%method, %path, "request");
        let outcome = match (method, path.as_str()) {
            (Method::Get, STREAM_PATH) => {
                let service = Arc::clone(&self.service);
                let origin = Arc::clone(&self.allowed_origin);
                let spawned = thread::Builder::new()
                    .name("clock-stream".to_string())
                    .spawn(move || stream_clock(request, &service, &origin));
                if let Err(e) = spawned {
                    warn!(error = %e, "cannot spawn stream thread");
                }
                return;
            }
            (Method::Get, "/") => {
                request.respond(self.json(200, r#"{"message":"Server is running!"}"#))
            }
            (Method::Get, _) => request.respond(self.json(404, r#"{"message":"Not found"}"#)),
            (Method::Options, _) => request.respond(
                Response::empty(StatusCode(204))
                    .with_header(self.headers.cors.clone())
                    .with_header(self.headers.allow_methods.clone())
                    .with_header(self.headers.allow_headers.clone()),
            ),
            _ => request.respond(self.json(405, r#"{"message":"Method not allowed"}"#)),
        };
        if let Err(e) = outcome {
            debug!(error = %e, "failed to write response");
        }
    }

    fn json(&self, status: u16, body: &str) -> Response<io::Cursor<Vec<u8>>> {
        Response::from_string(body)
            .with_status_code(StatusCode(status))
            .with_header(self.headers.json.clone())
            .with_header(self.headers.cors.clone())
    }
}

fn header(name: &str, value: &str) -> Result<Header, ServerError> {
    Header::from_bytes(name.as_bytes(), value.as_bytes())
        .map_err(|()| ServerError::InvalidHeader(format!("{name}: {value}")))
}

fn stream_head(origin: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/event-stream\r\n\
         Cache-Control: no-cache\r\n\
         Connection: keep-alive\r\n\
         X-Accel-Buffering: no\r\n\
         Access-Control-Allow-Origin: {origin}\r\n\r\n"
    )
}

/// Serves one subscriber until its connection stops accepting writes.
fn stream_clock(request: Request, service: &ClockService, origin: &str) {
    let peer = request.remote_addr().copied();
    let mut writer = request.into_writer();
    if write_flush(&mut writer, stream_head(origin).as_bytes()).is_err() {
        return;
    }
    let subscription = service.subscribe();
    info!(
        subscriber = subscription.id(),
        ?peer,
        subscribers = service.subscriber_count(),
        "clock stream opened"
    );
    loop {
        let frame = match subscription.recv_timeout(KEEP_ALIVE) {
            Ok(state) => match state.sse_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "cannot encode clock state");
                    continue;
                }
            },
            Err(RecvTimeoutError::Timeout) => ": keep-alive\n\n".to_string(),
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if let Err(e) = write_flush(&mut writer, frame.as_bytes()) {
            debug!(subscriber = subscription.id(), error = %e, "subscriber write failed");
            break;
        }
    }
    let id = subscription.id();
    service.unsubscribe(subscription);
    info!(
        subscriber = id,
        subscribers = service.subscriber_count(),
        "clock stream closed"
    );
}

fn write_flush(writer: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes)?;
    writer.flush()
}
