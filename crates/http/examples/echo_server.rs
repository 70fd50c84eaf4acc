//! Serves a few routes on 127.0.0.1:8080.
//!
//! ```text
//! curl -v http://127.0.0.1:8080/
//! curl -v -H 'Expect: 100-continue' -d 'hello' http://127.0.0.1:8080/echo
//! curl -N http://127.0.0.1:8080/events
//! websocat ws://127.0.0.1:8080/ws
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt, stream};
use http::{Method, header};
use micro_flux::connection::HttpConnection;
use micro_flux::handler::{HttpServerRequest, HttpServerResponse, Reply, WebSocketInbound, WebSocketOutbound, make_handler};
use micro_flux::protocol::HttpError;
use micro_flux::reactive::{Unit, from_stream, just};
use tokio::net::TcpListener;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

fn route(mut request: HttpServerRequest, response: &mut HttpServerResponse<'_>) -> Result<Reply, HttpError> {
    match (request.method(), request.uri().path()) {
        (&Method::GET, "/") => {
            response.header(header::CONTENT_TYPE, mime::TEXT_PLAIN_UTF_8.as_ref())?;
            Ok(response.send_stream(just(Unit::from("Hello World!\r\n"))))
        }
        (&Method::POST, "/echo") => {
            let body = request.receive().map_ok(Unit::Binary);
            Ok(response.send_stream(from_stream(body)))
        }
        (&Method::GET, "/events") => {
            response.sse()?.flush_each();
            let ticks = ticker(Duration::from_secs(1)).take(5).enumerate();
            let events = ticks.map(|(i, ())| Ok::<_, HttpError>(Unit::from(format!("data: tick {i}\n\n"))));
            Ok(response.send_stream(from_stream(events)))
        }
        (&Method::GET, "/ws") => Ok(response.upgrade_to_websocket(None, false, echo)),
        _ => Ok(response.send_not_found()),
    }
}

fn echo(inbound: WebSocketInbound, outbound: WebSocketOutbound) -> micro_flux::reactive::BoxSource<Unit> {
    outbound.send(inbound.receive_text().map_ok(|text| Unit::from(format!("echo: {text}"))))
}

fn ticker(period: Duration) -> impl futures::Stream<Item = ()> + Send + 'static {
    stream::unfold(tokio::time::interval(period), |mut interval| async move {
        interval.tick().await;
        Some(((), interval))
    })
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!(port = 8080, "start listening");
    let listener = match TcpListener::bind("127.0.0.1:8080").await {
        Ok(listener) => listener,
        Err(e) => {
            error!(cause = %e, "bind server error");
            return;
        }
    };

    let handler = Arc::new(make_handler(route));
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(cause = %e, "failed to accept");
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            match HttpConnection::new(reader, writer).process(handler).await {
                Ok(()) => info!(%remote_addr, "connection shutdown"),
                Err(e) => error!(%remote_addr, cause = %e, "connection failed"),
            }
        });
    }
}
