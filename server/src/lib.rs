use hyper::{http, server::conn::AddrStream, Body, Request, Response};
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use std::{collections::VecDeque, convert::TryInto, net::SocketAddr, sync::Arc};
use subtle::ConstantTimeEq;

use crate::config::Settings;

pub mod api;
pub mod config;
pub mod db;
mod error;
pub mod nft;
pub mod reconcile;
pub mod state;
#[cfg(test)]
mod test;
pub mod util;
pub mod wg;

pub use error::ServerError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub type Db = Arc<Mutex<Connection>>;

#[derive(Clone)]
pub struct Context {
    pub db: Db,
    /// Serializes all state-touching work: readers share, writers are
    /// exclusive for the whole of their saved-state scope.
    pub lock: Arc<RwLock<()>>,
    pub settings: Arc<Settings>,
}

pub async fn serve(context: Context) -> Result<(), ServerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], context.settings.listen_port));

    let make_svc = hyper::service::make_service_fn(move |socket: &AddrStream| {
        let remote_addr = socket.remote_addr();
        let context = context.clone();
        async move {
            Ok::<_, http::Error>(hyper::service::service_fn(move |req: Request<Body>| {
                log::debug!("{} - {} {}", &remote_addr, req.method(), req.uri());
                http_service(req, context.clone())
            }))
        }
    });

    hyper::Server::bind(&addr).serve(make_svc).await?;

    Ok(())
}

pub(crate) async fn http_service(
    req: Request<Body>,
    context: Context,
) -> Result<Response<Body>, http::Error> {
    // Break the path into components.
    let components: VecDeque<_> = req
        .uri()
        .path()
        .trim_start_matches('/')
        .split('/')
        .map(String::from)
        .collect();

    routes(req, context, components)
        .await
        .or_else(TryInto::try_into)
}

async fn routes(
    req: Request<Body>,
    context: Context,
    mut components: VecDeque<String>,
) -> Result<Response<Body>, ServerError> {
    let component = components.pop_front();

    // the liveness probe is the only endpoint without bearer auth
    if component.as_deref() == Some("network")
        && components.front().map(String::as_str) == Some("status")
    {
        return api::network::status();
    }

    verify_token(&req, &context)?;

    match component.as_deref() {
        Some("peer") => api::peer::routes(req, components, context).await,
        Some("subnet") => api::subnet::routes(req, components, context).await,
        Some("service") => api::service::routes(req, components, context).await,
        Some("network") => api::network::routes(req, components, context).await,
        _ => Err(ServerError::NotFound("no such endpoint".to_string())),
    }
}

/// Missing or malformed scheme is a 401; a present-but-wrong token is a
/// 403. Comparison is constant-time.
fn verify_token(req: &Request<Body>, context: &Context) -> Result<(), ServerError> {
    let header = req
        .headers()
        .get(http::header::AUTHORIZATION)
        .ok_or(ServerError::Unauthorized)?;
    let value = header.to_str().map_err(|_| ServerError::Unauthorized)?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or(ServerError::Unauthorized)?;
    if token
        .as_bytes()
        .ct_eq(context.settings.api_token.as_bytes())
        .into()
    {
        Ok(())
    } else {
        Err(ServerError::Forbidden)
    }
}
