use bytes::Buf;
use hyper::{header, Body, Request, Response, StatusCode};
use ipnet::Ipv4Net;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;

use crate::ServerError;

pub async fn form_body<F: DeserializeOwned>(req: Request<Body>) -> Result<F, ServerError> {
    let content_len: usize = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.parse().ok())
        .ok_or_else(|| ServerError::BadRequest("missing or invalid Content-Length".to_string()))?;

    // Topology uploads carry the whole graph; anything bigger is abuse.
    if content_len > 1024 * 1024 {
        return Err(ServerError::BadRequest("request body too large".to_string()));
    }

    let whole_body = hyper::body::aggregate(req).await?;

    serde_json::from_reader(whole_body.reader()).map_err(Into::into)
}

pub fn json_response<F: Serialize>(form: F) -> Result<Response<Body>, ServerError> {
    let json = serde_json::to_string(&form)?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json))?)
}

pub fn message_response(message: &str) -> Result<Response<Body>, ServerError> {
    json_response(serde_json::json!({ "message": message }))
}

pub fn query_params(req: &Request<Body>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

pub fn required_param<'a>(
    params: &'a HashMap<String, String>,
    name: &str,
) -> Result<&'a str, ServerError> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| ServerError::BadRequest(format!("missing query parameter {name:?}")))
}

/// Parse a CIDR parameter, masking any set host bits so lookups are keyed on
/// the canonical network address.
pub fn parse_cidr(s: &str) -> Result<Ipv4Net, ServerError> {
    s.parse::<Ipv4Net>()
        .map(|net| net.trunc())
        .map_err(|_| ServerError::BadRequest(format!("invalid subnet {s:?}")))
}

pub fn parse_address(s: &str) -> Result<std::net::Ipv4Addr, ServerError> {
    s.parse()
        .map_err(|_| ServerError::BadRequest(format!("invalid IPv4 address {s:?}")))
}
