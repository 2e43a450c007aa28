use std::{convert::Infallible, net::SocketAddr, path::PathBuf, sync::Arc};

use serde::Serialize;
use warp::{
    filters::BoxedFilter,
    http::StatusCode,
    reply::{self, Response},
    Filter, Rejection, Reply,
};

use crate::{config::AllowedOrigin, error::RelayError, relay::Relay};

pub static BANNER: &str = "GitHub issue chat relay";

/// Largest POST body accepted.
const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

fn error_reply(status: StatusCode, message: &str) -> Response {
    reply::with_status(reply::json(&ErrorBody { error: message }), status).into_response()
}

// Status mapping for every handler. Upstream detail goes to the log only.
fn respond<T: Serialize>(result: Result<T, RelayError>) -> Response {
    match result {
        Ok(payload) => reply::json(&payload).into_response(),
        Err(RelayError::InvalidInput(reason)) => error_reply(StatusCode::BAD_REQUEST, reason),
        Err(RelayError::RateLimited) => error_reply(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many posts, try again later.",
        ),
        Err(RelayError::Upstream(err)) => {
            log::error!("{}", err);
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, "Server error")
        }
    }
}

fn with_relay(relay: Arc<Relay>) -> impl Filter<Extract = (Arc<Relay>,), Error = Infallible> + Clone {
    warp::any().map(move || relay.clone())
}

// GET / -> plain text banner
fn banner() -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path::end().and(warp::get()).map(|| BANNER)
}

async fn list_messages(relay: Arc<Relay>) -> Result<Response, Infallible> {
    Ok(respond(relay.list_messages().await))
}

async fn post_message(
    remote: Option<SocketAddr>,
    body: warp::hyper::body::Bytes,
    relay: Arc<Relay>,
) -> Result<Response, Infallible> {
    let client = remote.map(|addr| addr.ip());
    Ok(respond(relay.post_message(client, &body).await))
}

// GET /messages -> chat log
// POST /messages {displayName?, message} -> new comment
fn messages(relay: Arc<Relay>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::get()
        .and(with_relay(relay.clone()))
        .and_then(list_messages);
    let post = warp::post()
        .and(warp::addr::remote())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(with_relay(relay))
        .and_then(post_message);
    warp::path!("messages").and(list.or(post))
}

// GET /static/.. -> files from the configured directory
fn static_files(dir: Option<PathBuf>) -> BoxedFilter<(Response,)> {
    let prefix = warp::path("static");
    match dir {
        Some(dir) => prefix
            .and(warp::get())
            .and(warp::fs::dir(dir))
            .map(|file: warp::fs::File| file.into_response())
            .boxed(),
        None => prefix
            .and_then(|| async { Err::<Response, Rejection>(warp::reject::not_found()) })
            .boxed(),
    }
}

fn cors(origin: &AllowedOrigin) -> warp::cors::Builder {
    let builder = warp::cors()
        .allow_methods(vec!["GET", "POST"])
        .allow_header("content-type");
    match origin {
        AllowedOrigin::Any => builder.allow_any_origin(),
        AllowedOrigin::Exact(origin) => builder.allow_origin(origin.as_str()),
    }
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found")
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large")
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (StatusCode::LENGTH_REQUIRED, "Content-Length required")
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
    } else if let Some(cors) = err.find::<warp::cors::CorsForbidden>() {
        log::debug!("{}", cors);
        (StatusCode::FORBIDDEN, "Origin not allowed")
    } else {
        log::error!("unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Server error")
    };
    Ok(error_reply(status, message))
}

pub fn build_filters(
    relay: Arc<Relay>,
    origin: &AllowedOrigin,
    static_dir: Option<PathBuf>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    banner()
        .or(messages(relay))
        .or(static_files(static_dir))
        .recover(handle_rejection)
        // error replies get CORS headers too; the outer recover only sees CorsForbidden
        .with(cors(origin))
        .recover(handle_rejection)
        .with(warp::log("chat_relay::access"))
}
