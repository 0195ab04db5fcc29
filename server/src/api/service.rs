use crate::{
    db::{link, DatabasePeer, DatabaseService, DatabaseSubnet},
    nft, state,
    util::{self, message_response, query_params, required_param},
    Context, ServerError,
};
use driftcove_shared::{Protocol, Service};
use hyper::{Body, Method, Request, Response};
use std::collections::VecDeque;

pub async fn routes(
    req: Request<Body>,
    mut components: VecDeque<String>,
    context: Context,
) -> Result<Response<Body>, ServerError> {
    let method = req.method().clone();
    match (method, components.pop_front().as_deref()) {
        (Method::POST, Some("create")) => handlers::create(req, context).await,
        (Method::DELETE, Some("delete")) => handlers::delete(req, context).await,
        (Method::POST, Some("connect")) => handlers::connect(req, context).await,
        (Method::DELETE, Some("disconnect")) => handlers::disconnect(req, context).await,
        (method, Some("subnet")) => match (method, components.pop_front().as_deref()) {
            (Method::POST, Some("connect")) => handlers::subnet_connect(req, context).await,
            (Method::DELETE, Some("disconnect")) => handlers::subnet_disconnect(req, context).await,
            _ => Err(ServerError::NotFound("no such endpoint".to_string())),
        },
        _ => Err(ServerError::NotFound("no such endpoint".to_string())),
    }
}

mod handlers {
    use super::*;

    pub async fn create(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let service_name = required_param(&params, "service_name")?.to_string();
        let department = required_param(&params, "department")?.to_string();
        let username = required_param(&params, "username")?.to_string();
        let port: u16 = required_param(&params, "port")?
            .parse()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| {
                ServerError::BadRequest("port must be an integer between 1 and 65535".to_string())
            })?;
        let description = params.get("description").cloned().unwrap_or_default();
        let protocol: Protocol = match params.get("protocol") {
            Some(raw) => raw.parse().map_err(ServerError::BadRequest)?,
            None => Protocol::default(),
        };

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        if DatabaseService::get_by_name(&conn, &service_name)?.is_some() {
            return message_response("Service already exists");
        }
        let host = DatabasePeer::get_by_username(&conn, &username)?.ok_or_else(|| {
            ServerError::NotFound(format!(
                "Peer {username} does not exist, create the peer first and then assign the service to it"
            ))
        })?;

        let service = Service {
            name: service_name,
            department,
            port,
            description,
            protocol,
        };

        state::with_saved_state(&conn, &context.settings, || {
            DatabaseService::create(&conn, &host, service)?;
            Ok(())
        })?;

        message_response("Service created successfully")
    }

    /// Delete a service, revoking every peer and subnet grant pointing at it.
    pub async fn delete(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let service_name = required_param(&params, "service_name")?.to_string();

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let service = DatabaseService::get_by_name(&conn, &service_name)?
            .ok_or_else(|| ServerError::NotFound("Service not found".to_string()))?;
        let host = DatabaseService::host(&conn, &service)?
            .ok_or_else(|| ServerError::NotFound("Service host not found".to_string()))?;

        state::with_saved_state(&conn, &context.settings, || {
            for guest in link::peers_linked_to_service(&conn, &service)? {
                log::info!("revoking {} from peer {}", *service, guest);
                nft::revoke_service(guest.address, host.address, service.port, service.protocol)?;
                link::remove_peer_service(&conn, guest.address, &service)?;
            }
            for subnet in link::subnets_linked_to_service(&conn, &service)? {
                nft::revoke_subnet_service(&subnet.subnet, host.address, service.port, service.protocol)?;
                link::remove_subnet_service(&conn, &subnet.subnet, &service)?;
            }
            DatabaseService::delete(&conn, &service)
        })?;

        message_response("Service deleted")
    }

    pub async fn connect(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let username = required_param(&params, "username")?.to_string();
        let service_name = required_param(&params, "service_name")?.to_string();

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let peer = DatabasePeer::get_by_username(&conn, &username)?
            .ok_or_else(|| ServerError::NotFound("Peer not found".to_string()))?;
        let service = DatabaseService::get_by_name(&conn, &service_name)?
            .ok_or_else(|| ServerError::NotFound("Service not found".to_string()))?;
        let host = DatabaseService::host(&conn, &service)?
            .ok_or_else(|| ServerError::NotFound("Service host not found".to_string()))?;

        state::with_saved_state(&conn, &context.settings, || {
            link::add_peer_service(&conn, peer.address, &service)?;
            log::info!("connecting peer {} to service {}", *peer, *service);
            nft::grant_service(peer.address, host.address, service.port, service.protocol);
            Ok(())
        })?;

        message_response(&format!("Peer {username} connected to service {service_name}"))
    }

    pub async fn disconnect(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let username = required_param(&params, "username")?.to_string();
        let service_name = required_param(&params, "service_name")?.to_string();

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let peer = DatabasePeer::get_by_username(&conn, &username)?
            .ok_or_else(|| ServerError::NotFound("Peer not found".to_string()))?;
        let service = DatabaseService::get_by_name(&conn, &service_name)?
            .ok_or_else(|| ServerError::NotFound("Service not found".to_string()))?;
        let host = DatabaseService::host(&conn, &service)?
            .ok_or_else(|| ServerError::NotFound("Service host not found".to_string()))?;

        let linked = link::peers_linked_to_service(&conn, &service)?
            .iter()
            .any(|guest| guest.address == peer.address);
        if !linked {
            return Err(ServerError::BadRequest(format!(
                "Peer {username} is not connected to service {service_name}"
            )));
        }

        state::with_saved_state(&conn, &context.settings, || {
            log::info!("disconnecting peer {} from service {}", *peer, *service);
            nft::revoke_service(peer.address, host.address, service.port, service.protocol)?;
            link::remove_peer_service(&conn, peer.address, &service)
        })?;

        message_response(&format!(
            "Peer {username} disconnected from service {service_name}"
        ))
    }

    /// Grant every member of a subnet access to a service.
    pub async fn subnet_connect(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let cidr = util::parse_cidr(required_param(&params, "subnet_address")?)?;
        let service_name = required_param(&params, "service_name")?.to_string();

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let subnet = DatabaseSubnet::get(&conn, &cidr)?
            .ok_or_else(|| ServerError::NotFound("Subnet not found".to_string()))?;
        let service = DatabaseService::get_by_name(&conn, &service_name)?
            .ok_or_else(|| ServerError::NotFound("Service not found".to_string()))?;
        let host = DatabaseService::host(&conn, &service)?
            .ok_or_else(|| ServerError::NotFound("Service host not found".to_string()))?;

        state::with_saved_state(&conn, &context.settings, || {
            link::add_subnet_service(&conn, &subnet.subnet, &service)?;
            nft::grant_subnet_service(&subnet.subnet, host.address, service.port, service.protocol)
        })?;

        message_response(&format!(
            "Subnet {cidr} connected to service {service_name}"
        ))
    }

    pub async fn subnet_disconnect(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let cidr = util::parse_cidr(required_param(&params, "subnet_address")?)?;
        let service_name = required_param(&params, "service_name")?.to_string();

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let subnet = DatabaseSubnet::get(&conn, &cidr)?
            .ok_or_else(|| ServerError::NotFound("Subnet not found".to_string()))?;
        let service = DatabaseService::get_by_name(&conn, &service_name)?
            .ok_or_else(|| ServerError::NotFound("Service not found".to_string()))?;
        let host = DatabaseService::host(&conn, &service)?
            .ok_or_else(|| ServerError::NotFound("Service host not found".to_string()))?;

        state::with_saved_state(&conn, &context.settings, || {
            link::remove_subnet_service(&conn, &subnet.subnet, &service)?;
            nft::revoke_subnet_service(&subnet.subnet, host.address, service.port, service.protocol)
        })?;

        message_response(&format!(
            "Subnet {cidr} disconnected from service {service_name}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;
    use anyhow::Result;
    use hyper::StatusCode;

    async fn setup(server: &test::Server) {
        server.create_subnet("10.42.0.0/24", "net").await;
        server
            .request("POST", "/peer/create?username=host&subnet=10.42.0.0/24")
            .await;
        server
            .request("POST", "/peer/create?username=guest&subnet=10.42.0.0/24")
            .await;
        server
            .request(
                "POST",
                "/service/create?service_name=wiki&department=eng&username=host&port=8080",
            )
            .await;
    }

    #[tokio::test]
    async fn test_create_service() -> Result<()> {
        let server = test::Server::new()?;
        setup(&server).await;

        let conn = server.context.db.lock();
        let wiki = DatabaseService::get_by_name(&conn, "wiki")?.unwrap();
        assert_eq!(wiki.port, 8080);
        assert_eq!(wiki.protocol, Protocol::Both);
        let host = DatabaseService::host(&conn, &wiki)?.unwrap();
        assert_eq!(host.username, "host");
        Ok(())
    }

    #[tokio::test]
    async fn test_create_existing_service_is_a_noop() -> Result<()> {
        let server = test::Server::new()?;
        setup(&server).await;

        let res = server
            .request(
                "POST",
                "/service/create?service_name=wiki&department=eng&username=guest&port=9090",
            )
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = test::body_json(res).await;
        assert_eq!(body["message"], "Service already exists");

        // still owned by the original host, on the original port
        let conn = server.context.db.lock();
        let wiki = DatabaseService::get_by_name(&conn, "wiki")?.unwrap();
        assert_eq!(wiki.port, 8080);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_service_validation() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/24", "net").await;

        let res = server
            .request(
                "POST",
                "/service/create?service_name=wiki&department=eng&username=ghost&port=8080",
            )
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = server
            .request(
                "POST",
                "/service/create?service_name=wiki&department=eng&username=ghost&port=0",
            )
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = server
            .request(
                "POST",
                "/service/create?service_name=wiki&department=eng&username=ghost&port=70000",
            )
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn test_service_with_explicit_protocol() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/24", "net").await;
        server
            .request("POST", "/peer/create?username=host&subnet=10.42.0.0/24")
            .await;
        let res = server
            .request(
                "POST",
                "/service/create?service_name=dns&department=infra&username=host&port=53&protocol=udp",
            )
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let conn = server.context.db.lock();
        let dns = DatabaseService::get_by_name(&conn, "dns")?.unwrap();
        assert_eq!(dns.protocol, Protocol::Udp);
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_peer() -> Result<()> {
        let server = test::Server::new()?;
        setup(&server).await;

        let res = server
            .request("POST", "/service/connect?username=guest&service_name=wiki")
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        {
            let conn = server.context.db.lock();
            let wiki = DatabaseService::get_by_name(&conn, "wiki")?.unwrap();
            let guests = link::peers_linked_to_service(&conn, &wiki)?;
            assert_eq!(guests.len(), 1);
            assert_eq!(guests[0].username, "guest");
        }

        let res = server
            .request(
                "DELETE",
                "/service/disconnect?username=guest&service_name=wiki",
            )
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        // a second disconnect is a 400: the link is gone
        let res = server
            .request(
                "DELETE",
                "/service/disconnect?username=guest&service_name=wiki",
            )
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_service_revokes_guests() -> Result<()> {
        let server = test::Server::new()?;
        setup(&server).await;
        server
            .request("POST", "/service/connect?username=guest&service_name=wiki")
            .await;
        server
            .request(
                "POST",
                "/service/subnet/connect?subnet_address=10.42.0.0/24&service_name=wiki",
            )
            .await;

        let res = server
            .request("DELETE", "/service/delete?service_name=wiki")
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let conn = server.context.db.lock();
        assert!(DatabaseService::get_by_name(&conn, "wiki")?.is_none());
        assert!(link::peer_service_map(&conn)?.is_empty());
        assert!(link::subnet_service_map(&conn)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_subnet_service_roundtrip() -> Result<()> {
        let server = test::Server::new()?;
        setup(&server).await;

        let res = server
            .request(
                "POST",
                "/service/subnet/connect?subnet_address=10.42.0.0/24&service_name=wiki",
            )
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        {
            let conn = server.context.db.lock();
            let services = link::services_linked_to_subnet(&conn, &"10.42.0.0/24".parse()?)?;
            assert_eq!(services.len(), 1);
        }

        let res = server
            .request(
                "DELETE",
                "/service/subnet/disconnect?subnet_address=10.42.0.0/24&service_name=wiki",
            )
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let conn = server.context.db.lock();
        assert!(link::services_linked_to_subnet(&conn, &"10.42.0.0/24".parse()?)?.is_empty());
        Ok(())
    }
}
