use crate::{
    config::Settings,
    db::{link, DatabasePeer, DatabaseService, DatabaseSubnet},
    nft, state,
    util::{self, json_response, message_response, query_params, required_param},
    wg, Context, ServerError,
};
use driftcove_shared::Peer;
use hyper::{Body, Method, Request, Response};
use rusqlite::Connection;
use std::collections::VecDeque;

pub async fn routes(
    req: Request<Body>,
    mut components: VecDeque<String>,
    context: Context,
) -> Result<Response<Body>, ServerError> {
    let method = req.method().clone();
    match (method, components.pop_front().as_deref()) {
        (Method::POST, Some("create")) => handlers::create(req, context).await,
        (Method::GET, Some("config")) => handlers::config(req, context).await,
        (Method::GET, Some("info")) => handlers::info(req, context).await,
        (Method::GET, Some("all")) => handlers::all(req, context).await,
        (Method::DELETE, Some("") | None) => handlers::delete(req, context).await,
        (Method::GET, Some("subnets")) => handlers::subnets(req, context).await,
        (Method::POST, Some("connect")) => handlers::connect(req, context).await,
        (Method::DELETE, Some("disconnect")) => handlers::disconnect(req, context).await,
        (method, Some("admin")) => {
            match (
                method,
                components.pop_front().as_deref(),
                components.pop_front().as_deref(),
            ) {
                (Method::POST, Some("peer"), Some("connect")) => {
                    handlers::admin_connect(req, context).await
                },
                (Method::DELETE, Some("peer"), Some("disconnect")) => {
                    handlers::admin_disconnect(req, context).await
                },
                _ => Err(ServerError::NotFound("no such endpoint".to_string())),
            }
        },
        _ => Err(ServerError::NotFound("no such endpoint".to_string())),
    }
}

/// Cascade removal of a peer: every grant, link and derived artifact goes,
/// then the WireGuard entry and the catalog row, then a sweep of the pair
/// sets for residual tuples. Runs inside the caller's saved-state scope.
pub(crate) fn remove_peer_cascade(
    conn: &Connection,
    settings: &Settings,
    peer: &Peer,
) -> Result<(), ServerError> {
    log::info!("removing peer {peer} and every link touching it");

    // 1) services hosted by the peer: revoke guests and subnet grants, drop
    for service in DatabaseService::hosted_by(conn, peer)? {
        for guest in link::peers_linked_to_service(conn, &service)? {
            nft::revoke_service(guest.address, peer.address, service.port, service.protocol)?;
            link::remove_peer_service(conn, guest.address, &service)?;
        }
        for subnet in link::subnets_linked_to_service(conn, &service)? {
            nft::revoke_subnet_service(&subnet.subnet, peer.address, service.port, service.protocol)?;
            link::remove_subnet_service(conn, &subnet.subnet, &service)?;
        }
        DatabaseService::delete(conn, &service)?;
    }

    // 2) services the peer consumes
    for service in link::services_linked_to_peer(conn, peer.address)? {
        if let Some(host) = DatabaseService::host(conn, &service)? {
            nft::revoke_service(peer.address, host.address, service.port, service.protocol)?;
        }
        link::remove_peer_service(conn, peer.address, &service)?;
    }

    // 3) subnet membership, explicit links first, then address containment
    for subnet in link::subnets_linked_to_peer(conn, peer.address)? {
        nft::revoke_public(&subnet.subnet, peer.address);
        nft::del_member(&subnet.subnet, peer.address);
        link::remove_peer_subnet(conn, peer.address, &subnet.subnet)?;
    }
    for subnet in DatabaseSubnet::containing(conn, peer.address)? {
        nft::revoke_public(&subnet.subnet, peer.address);
        nft::del_member(&subnet.subnet, peer.address);
    }

    // 4) p2p edges in both directions
    for (source, targets) in link::peer_peer_map(conn)? {
        for target in targets {
            if source == peer.address || target.address == peer.address {
                nft::remove_p2p(source, target.address);
                link::remove_peer_peer(conn, source, target.address)?;
            }
        }
    }

    // 5) admin edges where the peer is either side
    for (admin, targets) in link::admin_peer_peer_map(conn)? {
        for target in targets {
            if admin == peer.address || target.address == peer.address {
                nft::revoke_admin_peer_to_peer(admin, target.address);
                link::remove_admin_peer_peer(conn, admin, target.address)?;
            }
        }
    }
    for subnet in link::admin_subnets_for_peer(conn, peer.address)? {
        nft::revoke_admin_peer_to_subnet(peer.address, &subnet.subnet);
        link::remove_admin_peer_subnet(conn, peer.address, &subnet.subnet)?;
    }

    // 6) the interface entry and the catalog row
    wg::remove_peer(settings, peer)?;
    DatabasePeer::delete(conn, peer)?;

    // 7) residual tuples in the pair sets
    nft::purge_pair_sets_for_ip(peer.address)
}

mod handlers {
    use super::*;

    pub async fn create(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let username = required_param(&params, "username")?.to_string();
        let subnet_param = required_param(&params, "subnet")?.to_string();
        let requested = params
            .get("address")
            .map(|address| util::parse_address(address))
            .transpose()?;

        if !DatabasePeer::is_valid_username(&username) {
            return Err(ServerError::BadRequest(
                "Username must be between 1 and 15 characters long".to_string(),
            ));
        }
        let cidr = util::parse_cidr(&subnet_param)?;
        let keys = wg::generate_keys();

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        if DatabasePeer::get_by_username(&conn, &username)?.is_some() {
            return Err(ServerError::BadRequest(
                "Peer with this username already exists".to_string(),
            ));
        }
        let subnet = DatabaseSubnet::get(&conn, &cidr)?
            .ok_or_else(|| ServerError::NotFound("Subnet not found".to_string()))?;

        let address = match requested {
            Some(address) => {
                if DatabasePeer::is_address_assigned(&conn, address)? {
                    return Err(ServerError::BadRequest(
                        "IP address is already assigned".to_string(),
                    ));
                }
                if !subnet.contains(address) {
                    return Err(ServerError::BadRequest(
                        "IP address is not in the subnet".to_string(),
                    ));
                }
                address
            },
            None => DatabasePeer::next_available_ip(&conn, &subnet)?
                .ok_or(ServerError::AddressPoolExhausted)?,
        };

        let peer = Peer {
            username,
            public_key: keys.public_key.clone(),
            preshared_key: keys.preshared_key.clone(),
            address,
            services: Default::default(),
            x: subnet.x,
            y: subnet.y,
            tx: 0,
            rx: 0,
            last_handshake: 0,
        };

        let peer = state::with_saved_state(&conn, &context.settings, || {
            let created = DatabasePeer::create(&conn, peer)?;
            wg::apply_peer(&context.settings, &created)?;
            for subnet in DatabaseSubnet::containing(&conn, created.address)? {
                nft::add_member(&subnet.subnet, created.address);
            }
            Ok(created)
        })?;

        let configuration = wg::generate_config_text(&context.settings, &peer, &keys.private_key);
        json_response(serde_json::json!({ "configuration": configuration }))
    }

    /// Rotate the peer's keys and hand back a fresh client configuration.
    pub async fn config(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let username = required_param(&params, "username")?.to_string();
        let keys = wg::generate_keys();

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let mut peer = DatabasePeer::get_by_username(&conn, &username)?
            .ok_or_else(|| ServerError::NotFound("Peer not found".to_string()))?;

        state::with_saved_state(&conn, &context.settings, || {
            wg::remove_peer(&context.settings, &peer)?;
            peer.update_keys(&conn, &keys.public_key, &keys.preshared_key)?;
            wg::apply_peer(&context.settings, &peer)?;
            Ok(())
        })?;

        log::info!("rotated keys for peer {}", *peer);
        let configuration = wg::generate_config_text(&context.settings, &peer, &keys.private_key);
        json_response(serde_json::json!({ "configuration": configuration }))
    }

    pub async fn info(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let username = required_param(&params, "username")?.to_string();

        let _read_guard = context.lock.read();
        let conn = context.db.lock();

        let mut peer = DatabasePeer::get_by_username(&conn, &username)?
            .ok_or_else(|| ServerError::NotFound("Peer not found".to_string()))?;
        wg::peer_stats(&context.settings, &mut peer)?;
        json_response(&peer.inner)
    }

    pub async fn all(_req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let _read_guard = context.lock.read();
        let conn = context.db.lock();
        let peers: Vec<Peer> = DatabasePeer::list(&conn)?
            .into_iter()
            .map(|peer| peer.inner)
            .collect();
        json_response(serde_json::json!({ "peers": peers }))
    }

    pub async fn delete(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let username = required_param(&params, "username")?.to_string();

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let peer = DatabasePeer::get_by_username(&conn, &username)?
            .ok_or_else(|| ServerError::NotFound("Peer not found".to_string()))?;

        state::with_saved_state(&conn, &context.settings, || {
            remove_peer_cascade(&conn, &context.settings, &peer)
        })?;

        message_response("Peer removed")
    }

    /// The peer's primary (tightest containing) subnet plus its explicit
    /// public links.
    pub async fn subnets(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let username = required_param(&params, "username")?.to_string();

        let _read_guard = context.lock.read();
        let conn = context.db.lock();

        let peer = DatabasePeer::get_by_username(&conn, &username)?
            .ok_or_else(|| ServerError::NotFound("Peer not found".to_string()))?;
        let primary = DatabaseSubnet::primary_for(&conn, &peer)?
            .ok_or_else(|| ServerError::NotFound("Peer is not in any subnet".to_string()))?;
        let links = link::subnets_linked_to_peer(&conn, peer.address)?;
        json_response(serde_json::json!({ "subnet": primary.inner, "links": links }))
    }

    pub async fn connect(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let peer1_username = required_param(&params, "peer1_username")?.to_string();
        let peer2_username = required_param(&params, "peer2_username")?.to_string();

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let peer1 = DatabasePeer::get_by_username(&conn, &peer1_username)?;
        let peer2 = DatabasePeer::get_by_username(&conn, &peer2_username)?;
        let (peer1, peer2) = match (peer1, peer2) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(ServerError::NotFound("One or both peers not found".to_string())),
        };

        state::with_saved_state(&conn, &context.settings, || {
            nft::add_p2p(peer1.address, peer2.address);
            link::add_peer_peer(&conn, peer1.address, peer2.address)
        })?;

        message_response(&format!(
            "Peers {peer1_username} and {peer2_username} connected"
        ))
    }

    pub async fn disconnect(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let peer1_username = required_param(&params, "peer1_username")?.to_string();
        let peer2_username = required_param(&params, "peer2_username")?.to_string();

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let peer1 = DatabasePeer::get_by_username(&conn, &peer1_username)?;
        let peer2 = DatabasePeer::get_by_username(&conn, &peer2_username)?;
        let (peer1, peer2) = match (peer1, peer2) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(ServerError::NotFound("One or both peers not found".to_string())),
        };

        state::with_saved_state(&conn, &context.settings, || {
            nft::remove_p2p(peer1.address, peer2.address);
            link::remove_peer_peer(&conn, peer1.address, peer2.address)
        })?;

        message_response(&format!(
            "Peers {peer1_username} and {peer2_username} disconnected"
        ))
    }

    pub async fn admin_connect(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let admin_username = required_param(&params, "admin_username")?.to_string();
        let peer_username = required_param(&params, "peer_username")?.to_string();

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let admin = DatabasePeer::get_by_username(&conn, &admin_username)?;
        let peer = DatabasePeer::get_by_username(&conn, &peer_username)?;
        let (admin, peer) = match (admin, peer) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(ServerError::NotFound("One or both peers not found".to_string())),
        };

        state::with_saved_state(&conn, &context.settings, || {
            nft::grant_admin_peer_to_peer(admin.address, peer.address);
            link::add_admin_peer_peer(&conn, admin.address, peer.address)
        })?;

        message_response(&format!(
            "Admin peer {admin_username} and peer {peer_username} connected"
        ))
    }

    pub async fn admin_disconnect(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let admin_username = required_param(&params, "admin_username")?.to_string();
        let peer_username = required_param(&params, "peer_username")?.to_string();

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let admin = DatabasePeer::get_by_username(&conn, &admin_username)?;
        let peer = DatabasePeer::get_by_username(&conn, &peer_username)?;
        let (admin, peer) = match (admin, peer) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(ServerError::NotFound("One or both peers not found".to_string())),
        };

        state::with_saved_state(&conn, &context.settings, || {
            nft::revoke_admin_peer_to_peer(admin.address, peer.address);
            link::remove_admin_peer_peer(&conn, admin.address, peer.address)
        })?;

        message_response(&format!(
            "Admin peer {admin_username} and peer {peer_username} disconnected"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;
    use anyhow::Result;
    use hyper::StatusCode;

    #[tokio::test]
    async fn test_create_peer_gets_first_free_address() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/24", "net").await;

        let res = server
            .request("POST", "/peer/create?username=alice&subnet=10.42.0.0/24")
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = test::body_json(res).await;
        let configuration = body["configuration"].as_str().unwrap();
        assert!(configuration.contains("Address = 10.42.0.1\n"));

        let conn = server.context.db.lock();
        let alice = DatabasePeer::get_by_username(&conn, "alice")?.unwrap();
        assert_eq!(alice.address.to_string(), "10.42.0.1");
        Ok(())
    }

    #[tokio::test]
    async fn test_create_peer_with_explicit_address() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/24", "net").await;

        let res = server
            .request(
                "POST",
                "/peer/create?username=bob&subnet=10.42.0.0/24&address=10.42.0.7",
            )
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let conn = server.context.db.lock();
        let bob = DatabasePeer::get_by_username(&conn, "bob")?.unwrap();
        assert_eq!(bob.address.to_string(), "10.42.0.7");
        Ok(())
    }

    #[tokio::test]
    async fn test_create_peer_validation() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/24", "net").await;
        server
            .request("POST", "/peer/create?username=alice&subnet=10.42.0.0/24")
            .await;

        // duplicate username
        let res = server
            .request("POST", "/peer/create?username=alice&subnet=10.42.0.0/24")
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        // empty and overlong usernames
        let res = server
            .request("POST", "/peer/create?username=&subnet=10.42.0.0/24")
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let res = server
            .request(
                "POST",
                "/peer/create?username=sixteen-chars-xx&subnet=10.42.0.0/24",
            )
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        // unknown subnet
        let res = server
            .request("POST", "/peer/create?username=carol&subnet=10.99.0.0/24")
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        // address outside the subnet
        let res = server
            .request(
                "POST",
                "/peer/create?username=carol&subnet=10.42.0.0/24&address=10.43.0.7",
            )
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        // address already taken
        let res = server
            .request(
                "POST",
                "/peer/create?username=carol&subnet=10.42.0.0/24&address=10.42.0.1",
            )
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        // nothing but alice was created along the way
        let conn = server.context.db.lock();
        assert_eq!(DatabasePeer::list(&conn)?.len(), 2); // master + alice
        Ok(())
    }

    #[tokio::test]
    async fn test_create_peer_pool_exhausted() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.50.0.8/32", "single").await;

        let res = server
            .request("POST", "/peer/create?username=alice&subnet=10.50.0.8/32")
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let body = test::body_json(res).await;
        assert_eq!(body["detail"], "No available IPs in subnet");
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_peer_frees_the_address() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/24", "net").await;
        server
            .request("POST", "/peer/create?username=alice&subnet=10.42.0.0/24")
            .await;
        server
            .request("POST", "/peer/create?username=bob&subnet=10.42.0.0/24")
            .await;

        let res = server.request("DELETE", "/peer/?username=alice").await;
        assert_eq!(res.status(), StatusCode::OK);

        {
            let conn = server.context.db.lock();
            assert!(DatabasePeer::get_by_username(&conn, "alice")?.is_none());
            assert!(DatabasePeer::get_by_username(&conn, "bob")?.is_some());
        }

        // deleting again is a 404, nothing changed
        let res = server.request("DELETE", "/peer/?username=alice").await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        // 10.42.0.1 is available again
        let res = server
            .request("POST", "/peer/create?username=carol&subnet=10.42.0.0/24")
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let conn = server.context.db.lock();
        let carol = DatabasePeer::get_by_username(&conn, "carol")?.unwrap();
        assert_eq!(carol.address.to_string(), "10.42.0.1");
        Ok(())
    }

    #[tokio::test]
    async fn test_p2p_connect_and_disconnect() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/24", "net").await;
        server
            .request("POST", "/peer/create?username=alice&subnet=10.42.0.0/24")
            .await;
        server
            .request(
                "POST",
                "/peer/create?username=bob&subnet=10.42.0.0/24&address=10.42.0.7",
            )
            .await;

        let res = server
            .request(
                "POST",
                "/peer/connect?peer1_username=alice&peer2_username=bob",
            )
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        {
            let conn = server.context.db.lock();
            let map = link::peer_peer_map(&conn)?;
            assert_eq!(map.get(&"10.42.0.1".parse()?).map(Vec::len), Some(1));
        }

        let res = server
            .request(
                "DELETE",
                "/peer/disconnect?peer1_username=alice&peer2_username=bob",
            )
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        {
            let conn = server.context.db.lock();
            assert!(link::peer_peer_map(&conn)?.is_empty());
        }

        // unknown peer is a 404
        let res = server
            .request(
                "POST",
                "/peer/connect?peer1_username=alice&peer2_username=ghost",
            )
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_peer_cascades_links() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/24", "net").await;
        server
            .request("POST", "/peer/create?username=alice&subnet=10.42.0.0/24")
            .await;
        server
            .request("POST", "/peer/create?username=bob&subnet=10.42.0.0/24")
            .await;
        server
            .request(
                "POST",
                "/peer/connect?peer1_username=alice&peer2_username=bob",
            )
            .await;
        server
            .request(
                "POST",
                "/subnet/connect?username=alice&subnet=10.42.0.0/24",
            )
            .await;
        server
            .request(
                "POST",
                "/peer/admin/peer/connect?admin_username=bob&peer_username=alice",
            )
            .await;

        let res = server.request("DELETE", "/peer/?username=alice").await;
        assert_eq!(res.status(), StatusCode::OK);

        let conn = server.context.db.lock();
        assert!(link::peer_peer_map(&conn)?.is_empty());
        assert!(link::admin_peer_peer_map(&conn)?.is_empty());
        assert!(link::peers_linked_to_subnet(&conn, &"10.42.0.0/24".parse()?)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_peer_drops_hosted_service() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/24", "net").await;
        server
            .request("POST", "/peer/create?username=alice&subnet=10.42.0.0/24")
            .await;
        server
            .request("POST", "/peer/create?username=bob&subnet=10.42.0.0/24")
            .await;
        server
            .request(
                "POST",
                "/service/create?service_name=wiki&department=eng&username=alice&port=8080",
            )
            .await;
        server
            .request("POST", "/service/connect?username=bob&service_name=wiki")
            .await;

        let res = server.request("DELETE", "/peer/?username=alice").await;
        assert_eq!(res.status(), StatusCode::OK);

        let conn = server.context.db.lock();
        assert!(DatabaseService::get_by_name(&conn, "wiki")?.is_none());
        assert!(link::peer_service_map(&conn)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_rotate_config_changes_keys() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/24", "net").await;
        server
            .request("POST", "/peer/create?username=alice&subnet=10.42.0.0/24")
            .await;

        let before = {
            let conn = server.context.db.lock();
            DatabasePeer::get_by_username(&conn, "alice")?.unwrap().public_key.clone()
        };

        let res = server.request("GET", "/peer/config?username=alice").await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = test::body_json(res).await;
        assert!(body["configuration"].as_str().unwrap().contains("[Peer]"));

        let conn = server.context.db.lock();
        let after = DatabasePeer::get_by_username(&conn, "alice")?.unwrap();
        assert_ne!(after.public_key, before);
        Ok(())
    }

    #[tokio::test]
    async fn test_peer_subnets_primary_is_tightest() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/16", "wide").await;
        server.create_subnet("10.42.7.0/24", "tight").await;
        server
            .request(
                "POST",
                "/peer/create?username=alice&subnet=10.42.0.0/16&address=10.42.7.9",
            )
            .await;

        let res = server.request("GET", "/peer/subnets?username=alice").await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = test::body_json(res).await;
        assert_eq!(body["subnet"]["name"], "tight");
        Ok(())
    }

    #[tokio::test]
    async fn test_peer_info_and_all() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/24", "net").await;
        server
            .request("POST", "/peer/create?username=alice&subnet=10.42.0.0/24")
            .await;

        let res = server.request("GET", "/peer/info?username=alice").await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = test::body_json(res).await;
        assert_eq!(body["username"], "alice");
        assert_eq!(body["address"], "10.42.0.1");

        let res = server.request("GET", "/peer/info?username=ghost").await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = server.request("GET", "/peer/all").await;
        let body = test::body_json(res).await;
        let names: Vec<&str> = body["peers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|peer| peer["username"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"master"));
        assert!(names.contains(&"alice"));
        Ok(())
    }
}
