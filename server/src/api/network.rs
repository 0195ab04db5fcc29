use crate::{
    db::{self, link, DatabasePeer, DatabaseService, DatabaseSubnet},
    nft, reconcile, state,
    util::{self, form_body, json_response, message_response, query_params, required_param},
    wg, Context, ServerError,
};
use driftcove_shared::{Peer, Subnet, Topology};
use hyper::{Body, Method, Request, Response};
use std::collections::{HashMap, VecDeque};

pub async fn routes(
    req: Request<Body>,
    mut components: VecDeque<String>,
    context: Context,
) -> Result<Response<Body>, ServerError> {
    let method = req.method().clone();
    match (method, components.pop_front().as_deref()) {
        (Method::GET, Some("subnets")) if components.is_empty() => {
            handlers::subnets(req, context).await
        },
        (Method::GET, Some("topology")) => handlers::topology(req, context).await,
        (Method::POST, Some("topology")) => handlers::upload_topology(req, context).await,
        (Method::GET, Some("nft_rules")) => handlers::nft_rules(req, context).await,
        (Method::POST, Some("subnets")) if components.front().map(String::as_str) == Some("connect") => {
            handlers::connect_subnets(req, context).await
        },
        (Method::DELETE, Some("subnets"))
            if components.front().map(String::as_str) == Some("disconnect") =>
        {
            handlers::disconnect_subnets(req, context).await
        },
        (method, Some("admin")) => match (method, components.pop_front().as_deref()) {
            (Method::POST, Some("connect_subnets")) => {
                handlers::admin_connect_subnets(req, context).await
            },
            (Method::DELETE, Some("disconnect_subnets")) => {
                handlers::admin_disconnect_subnets(req, context).await
            },
            _ => Err(ServerError::NotFound("no such endpoint".to_string())),
        },
        (Method::POST, Some("update_coordinates")) => {
            handlers::update_coordinates(req, context).await
        },
        (Method::GET, Some("status")) => status(),
        _ => Err(ServerError::NotFound("no such endpoint".to_string())),
    }
}

/// Liveness probe; the only unauthenticated endpoint.
pub fn status() -> Result<Response<Body>, ServerError> {
    json_response(serde_json::json!({ "status": "running" }))
}

mod handlers {
    use super::*;

    pub async fn subnets(_req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let _read_guard = context.lock.read();
        let conn = context.db.lock();
        let subnets: Vec<Subnet> = DatabaseSubnet::list(&conn)?
            .into_iter()
            .map(|subnet| subnet.inner)
            .collect();
        json_response(serde_json::json!({ "subnets": subnets }))
    }

    /// The full graph, with live peer counters folded in.
    pub async fn topology(_req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let _read_guard = context.lock.read();
        let conn = context.db.lock();

        let mut subnets = HashMap::new();
        let mut network = HashMap::new();
        for subnet in DatabaseSubnet::list(&conn)? {
            let members: Vec<Peer> = DatabasePeer::list_in_subnet(&conn, &subnet)?
                .into_iter()
                .map(|peer| peer.inner)
                .collect();
            network.insert(subnet.subnet.to_string(), members);
            subnets.insert(subnet.subnet.to_string(), subnet.inner);
        }

        let mut peers = HashMap::new();
        for mut peer in DatabasePeer::list(&conn)? {
            if let Err(err) = wg::peer_stats(&context.settings, &mut peer) {
                log::warn!("fetching live counters for {} failed: {err}", *peer);
            }
            peers.insert(peer.address.to_string(), peer.inner);
        }

        let mut services = HashMap::new();
        for service in DatabaseService::list(&conn)? {
            services.insert(service.name.clone(), service.inner);
        }

        let topology = Topology {
            subnets,
            peers,
            services,
            network,
            service_links: link::peer_service_map(&conn)?,
            p2p_links: stringify_keys(link::peer_peer_map(&conn)?),
            subnet_links: stringify_keys(link::peer_subnet_map(&conn)?),
            subnet_to_subnet_links: stringify_keys(link::subnet_subnet_map(&conn)?),
            subnet_to_service_links: stringify_keys(link::subnet_service_map(&conn)?),
            admin_peer_to_peer_links: stringify_keys(link::admin_peer_peer_map(&conn)?),
            admin_peer_to_subnet_links: stringify_keys(link::admin_peer_subnet_map(&conn)?),
            admin_subnet_to_subnet_links: stringify_keys(link::admin_subnet_subnet_map(&conn)?),
        };
        json_response(serde_json::json!({ "topology": topology }))
    }

    fn stringify_keys<K: ToString, V>(map: HashMap<K, Vec<V>>) -> HashMap<String, Vec<V>> {
        map.into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect()
    }

    /// Replace the whole catalog with the uploaded graph, then replay it
    /// into WireGuard and the filter.
    pub async fn upload_topology(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let topology: Topology = form_body(req).await?;

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        state::with_saved_state(&conn, &context.settings, || {
            db::clear(&conn)?;

            for subnet in topology.subnets.values() {
                DatabaseSubnet::create(&conn, subnet.clone())?;
            }

            for peer in topology.peers.values() {
                if DatabaseSubnet::containing(&conn, peer.address)?.is_empty() {
                    return Err(ServerError::NotFound(format!(
                        "Peer {} is not in any subnet",
                        peer.username
                    )));
                }
                let created = DatabasePeer::create(&conn, peer.clone())?;
                for service in peer.services.values() {
                    DatabaseService::create(&conn, &created, service.clone())?;
                }
            }

            for service in topology.services.values() {
                let known = DatabaseService::get_by_name(&conn, &service.name)?.ok_or_else(|| {
                    ServerError::NotFound(format!(
                        "Service host for service {} does not exist",
                        service.name
                    ))
                })?;
                if DatabaseService::host(&conn, &known)?.is_none() {
                    return Err(ServerError::NotFound(format!(
                        "Service host for service {} does not exist",
                        service.name
                    )));
                }
            }

            for (source, linked) in &topology.p2p_links {
                let source = resolve_peer(&conn, source)?;
                for peer in linked {
                    let target = resolve_peer(&conn, &peer.address.to_string())?;
                    link::add_peer_peer(&conn, source.address, target.address)?;
                }
            }

            for (service_name, guests) in &topology.service_links {
                let service = DatabaseService::get_by_name(&conn, service_name)?.ok_or_else(|| {
                    ServerError::NotFound(format!("Service with name {service_name} does not exist"))
                })?;
                for guest in guests {
                    let guest = resolve_peer(&conn, &guest.address.to_string())?;
                    link::add_peer_service(&conn, guest.address, &service)?;
                }
            }

            for (cidr, publics) in &topology.subnet_links {
                let subnet = resolve_subnet(&conn, cidr)?;
                for peer in publics {
                    let peer = resolve_peer(&conn, &peer.address.to_string())?;
                    link::add_peer_subnet(&conn, peer.address, &subnet.subnet)?;
                }
            }

            // order-insensitive dedup of the undirected pairs
            let mut seen = std::collections::HashSet::new();
            for (cidr, linked) in &topology.subnet_to_subnet_links {
                for other in linked {
                    let mut pair = [cidr.clone(), other.subnet.to_string()];
                    pair.sort();
                    if !seen.insert(pair.clone()) {
                        continue;
                    }
                    let a = resolve_subnet(&conn, &pair[0])?;
                    let b = resolve_subnet(&conn, &pair[1])?;
                    link::add_subnet_subnet(&conn, &a.subnet, &b.subnet)?;
                }
            }

            for (cidr, services) in &topology.subnet_to_service_links {
                let subnet = resolve_subnet(&conn, cidr)?;
                for service in services {
                    let service = DatabaseService::get_by_name(&conn, &service.name)?.ok_or_else(|| {
                        ServerError::NotFound(format!(
                            "Service with name {} does not exist",
                            service.name
                        ))
                    })?;
                    link::add_subnet_service(&conn, &subnet.subnet, &service)?;
                }
            }

            for (source, targets) in &topology.admin_peer_to_peer_links {
                let admin = resolve_peer(&conn, source)?;
                for target in targets {
                    let target = resolve_peer(&conn, &target.address.to_string())?;
                    link::add_admin_peer_peer(&conn, admin.address, target.address)?;
                }
            }

            for (source, subnets) in &topology.admin_peer_to_subnet_links {
                let admin = resolve_peer(&conn, source)?;
                for subnet in subnets {
                    let subnet = resolve_subnet(&conn, &subnet.subnet.to_string())?;
                    link::add_admin_peer_subnet(&conn, admin.address, &subnet.subnet)?;
                }
            }

            for (source, subnets) in &topology.admin_subnet_to_subnet_links {
                let admin = resolve_subnet(&conn, source)?;
                for subnet in subnets {
                    let subnet = resolve_subnet(&conn, &subnet.subnet.to_string())?;
                    link::add_admin_subnet_subnet(&conn, &admin.subnet, &subnet.subnet)?;
                }
            }

            // replay the rebuilt catalog into WireGuard and the filter
            reconcile::apply_config_from_database(&conn, &context.settings)
        })?;

        message_response("Topology uploaded successfully")
    }

    fn resolve_peer(conn: &rusqlite::Connection, address: &str) -> Result<DatabasePeer, ServerError> {
        let address = util::parse_address(address)?;
        DatabasePeer::get_by_address(conn, address)?.ok_or_else(|| {
            ServerError::NotFound(format!("Peer with address {address} does not exist"))
        })
    }

    fn resolve_subnet(conn: &rusqlite::Connection, cidr: &str) -> Result<DatabaseSubnet, ServerError> {
        let cidr = util::parse_cidr(cidr)?;
        DatabaseSubnet::get(conn, &cidr)?
            .ok_or_else(|| ServerError::NotFound(format!("Subnet {cidr} does not exist")))
    }

    pub async fn nft_rules(_req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let _read_guard = context.lock.read();
        let rules = nft::snapshot()?;
        json_response(serde_json::json!({ "nft_rules": rules }))
    }

    /// Link two subnets publicly: members of each side may initiate to the
    /// public peers of the other.
    pub async fn connect_subnets(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let cidr_a = util::parse_cidr(required_param(&params, "subnet_a")?)?;
        let cidr_b = util::parse_cidr(required_param(&params, "subnet_b")?)?;

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let a = DatabaseSubnet::get(&conn, &cidr_a)?
            .ok_or_else(|| ServerError::NotFound(format!("Subnet {cidr_a} does not exist")))?;
        let b = DatabaseSubnet::get(&conn, &cidr_b)?
            .ok_or_else(|| ServerError::NotFound(format!("Subnet {cidr_b} does not exist")))?;

        state::with_saved_state(&conn, &context.settings, || {
            link::add_subnet_subnet(&conn, &a.subnet, &b.subnet)?;
            nft::connect_subnets_public(&a.subnet, &b.subnet)
        })?;

        message_response(&format!("Link between {cidr_a} and {cidr_b} created successfully"))
    }

    pub async fn disconnect_subnets(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let cidr_a = util::parse_cidr(required_param(&params, "subnet_a")?)?;
        let cidr_b = util::parse_cidr(required_param(&params, "subnet_b")?)?;

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let a = DatabaseSubnet::get(&conn, &cidr_a)?
            .ok_or_else(|| ServerError::NotFound(format!("Subnet {cidr_a} does not exist")))?;
        let b = DatabaseSubnet::get(&conn, &cidr_b)?
            .ok_or_else(|| ServerError::NotFound(format!("Subnet {cidr_b} does not exist")))?;

        state::with_saved_state(&conn, &context.settings, || {
            link::remove_subnet_subnet(&conn, &a.subnet, &b.subnet)?;
            nft::disconnect_subnets_public(&a.subnet, &b.subnet)
        })?;

        message_response(&format!("Link between {cidr_a} and {cidr_b} deleted successfully"))
    }

    /// Admin cross-link: every member of the admin subnet may initiate to
    /// every member of the target subnet.
    pub async fn admin_connect_subnets(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let admin_cidr = util::parse_cidr(required_param(&params, "admin_subnet")?)?;
        let cidr = util::parse_cidr(required_param(&params, "subnet")?)?;

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let admin = DatabaseSubnet::get(&conn, &admin_cidr)?
            .ok_or_else(|| ServerError::NotFound(format!("Admin Subnet {admin_cidr} does not exist")))?;
        let subnet = DatabaseSubnet::get(&conn, &cidr)?
            .ok_or_else(|| ServerError::NotFound(format!("Subnet {cidr} does not exist")))?;

        state::with_saved_state(&conn, &context.settings, || {
            link::add_admin_subnet_subnet(&conn, &admin.subnet, &subnet.subnet)?;
            log::info!("granting admin subnet {} access to {}", *admin, *subnet);
            nft::grant_admin_subnet_to_subnet(&admin.subnet, &subnet.subnet)
        })?;

        message_response(&format!("Admin Subnet {admin_cidr} connected to subnet {cidr}"))
    }

    pub async fn admin_disconnect_subnets(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let admin_cidr = util::parse_cidr(required_param(&params, "admin_subnet")?)?;
        let cidr = util::parse_cidr(required_param(&params, "subnet")?)?;

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let admin = DatabaseSubnet::get(&conn, &admin_cidr)?
            .ok_or_else(|| ServerError::NotFound(format!("Admin Subnet {admin_cidr} does not exist")))?;
        let subnet = DatabaseSubnet::get(&conn, &cidr)?
            .ok_or_else(|| ServerError::NotFound(format!("Subnet {cidr} does not exist")))?;

        state::with_saved_state(&conn, &context.settings, || {
            link::remove_admin_subnet_subnet(&conn, &admin.subnet, &subnet.subnet)?;
            nft::revoke_admin_subnet_to_subnet(&admin.subnet, &subnet.subnet)
        })?;

        message_response(&format!("Admin Subnet {admin_cidr} disconnected from subnet {cidr}"))
    }

    /// Geometry only: subnet frames and peer positions.
    pub async fn update_coordinates(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let topology: Topology = form_body(req).await?;

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        state::with_saved_state(&conn, &context.settings, || {
            for subnet in topology.subnets.values() {
                let mut known = DatabaseSubnet::get(&conn, &subnet.subnet)?.ok_or_else(|| {
                    ServerError::NotFound(format!("Subnet {} does not exist", subnet.subnet))
                })?;
                known.update_geometry(&conn, subnet)?;
            }
            for peer in topology.peers.values() {
                let mut known = DatabasePeer::get_by_address(&conn, peer.address)?.ok_or_else(
                    || ServerError::NotFound(format!("Peer {} does not exist", peer.username)),
                )?;
                known.update_position(&conn, peer.x, peer.y)?;
            }
            Ok(())
        })?;

        message_response("Coordinates updated")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;
    use anyhow::Result;
    use hyper::StatusCode;

    #[tokio::test]
    async fn test_status_without_auth() -> Result<()> {
        let server = test::Server::new()?;
        let req = Request::builder()
            .method("GET")
            .uri("/network/status")
            .body(Body::empty())
            .unwrap();
        let res = server.raw_request(req).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = test::body_json(res).await;
        assert_eq!(body["status"], "running");
        Ok(())
    }

    #[tokio::test]
    async fn test_list_subnets() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/24", "net").await;
        let res = server.request("GET", "/network/subnets").await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = test::body_json(res).await;
        let names: Vec<&str> = body["subnets"]
            .as_array()
            .unwrap()
            .iter()
            .map(|subnet| subnet["name"].as_str().unwrap())
            .collect();
        // the default subnet is seeded at bootstrap
        assert!(names.contains(&"Wireguard Subnet"));
        assert!(names.contains(&"net"));
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_subnets() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/24", "a").await;
        server.create_subnet("10.43.0.0/24", "b").await;

        let res = server
            .request(
                "POST",
                "/network/subnets/connect?subnet_a=10.42.0.0/24&subnet_b=10.43.0.0/24",
            )
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        {
            let conn = server.context.db.lock();
            assert_eq!(
                link::subnets_linked_to_subnet(&conn, &"10.42.0.0/24".parse()?)?.len(),
                1
            );
        }

        let res = server
            .request(
                "DELETE",
                "/network/subnets/disconnect?subnet_a=10.43.0.0/24&subnet_b=10.42.0.0/24",
            )
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        {
            let conn = server.context.db.lock();
            assert!(link::subnets_linked_to_subnet(&conn, &"10.42.0.0/24".parse()?)?.is_empty());
        }

        let res = server
            .request(
                "POST",
                "/network/subnets/connect?subnet_a=10.42.0.0/24&subnet_b=10.99.0.0/24",
            )
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn test_admin_subnet_links() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/24", "a").await;
        server.create_subnet("10.43.0.0/24", "b").await;

        let res = server
            .request(
                "POST",
                "/network/admin/connect_subnets?admin_subnet=10.42.0.0/24&subnet=10.43.0.0/24",
            )
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        {
            let conn = server.context.db.lock();
            let map = link::admin_subnet_subnet_map(&conn)?;
            assert_eq!(map.get(&"10.42.0.0/24".parse()?).map(Vec::len), Some(1));
        }

        let res = server
            .request(
                "DELETE",
                "/network/admin/disconnect_subnets?admin_subnet=10.42.0.0/24&subnet=10.43.0.0/24",
            )
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let conn = server.context.db.lock();
        assert!(link::admin_subnet_subnet_map(&conn)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_topology_roundtrip() -> Result<()> {
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

        let res = server.request("GET", "/network/topology").await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = test::body_json(res).await;
        let topology: Topology = serde_json::from_value(body["topology"].clone())?;
        assert!(topology.subnets.contains_key("10.42.0.0/24"));
        assert!(topology.peers.contains_key("10.42.0.1"));
        assert_eq!(topology.p2p_links.len(), 1);

        // upload the same graph back
        let res = server.form_request("POST", "/network/topology", &topology).await;
        assert_eq!(res.status(), StatusCode::OK);

        let conn = server.context.db.lock();
        assert!(DatabasePeer::get_by_username(&conn, "alice")?.is_some());
        assert!(DatabasePeer::get_by_username(&conn, "bob")?.is_some());
        assert_eq!(link::peer_peer_map(&conn)?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_topology_upload_rejects_orphan_peer() -> Result<()> {
        let server = test::Server::new()?;
        let mut topology = Topology::default();
        topology
            .peers
            .insert("192.168.0.1".to_string(), test::peer("lost", "192.168.0.1"));

        let res = server.form_request("POST", "/network/topology", &topology).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        // the catalog was restored, the seeded master is still there
        let conn = server.context.db.lock();
        assert!(DatabasePeer::get_by_username(&conn, "master")?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_coordinates() -> Result<()> {
        let server = test::Server::new()?;
        server.create_subnet("10.42.0.0/24", "net").await;
        server
            .request("POST", "/peer/create?username=alice&subnet=10.42.0.0/24")
            .await;

        let mut topology = Topology::default();
        let mut subnet = test::subnet("10.42.0.0/24", "net");
        subnet.x = 50.0;
        subnet.y = 60.0;
        subnet.width = 700.0;
        subnet.height = 800.0;
        topology.subnets.insert("10.42.0.0/24".to_string(), subnet);
        let mut alice = test::peer("alice", "10.42.0.1");
        alice.x = 123.0;
        alice.y = 456.0;
        topology.peers.insert("10.42.0.1".to_string(), alice);

        let res = server
            .form_request("POST", "/network/update_coordinates", &topology)
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let conn = server.context.db.lock();
        let subnet = DatabaseSubnet::get(&conn, &"10.42.0.0/24".parse()?)?.unwrap();
        assert_eq!(subnet.width, 700.0);
        let alice = DatabasePeer::get_by_username(&conn, "alice")?.unwrap();
        assert_eq!((alice.x, alice.y), (123.0, 456.0));
        Ok(())
    }

    #[tokio::test]
    async fn test_nft_rules_endpoint() -> Result<()> {
        let server = test::Server::new()?;
        let res = server.request("GET", "/network/nft_rules").await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = test::body_json(res).await;
        assert!(body["nft_rules"].is_string());
        Ok(())
    }
}
