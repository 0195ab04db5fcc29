use crate::{
    api::peer::remove_peer_cascade,
    config::Settings,
    db::{link, DatabasePeer, DatabaseService, DatabaseSubnet},
    nft, state,
    util::{self, form_body, message_response, query_params, required_param},
    Context, ServerError,
};
use driftcove_shared::Subnet;
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
        (Method::POST, Some("connect")) => handlers::connect(req, context).await,
        (Method::DELETE, Some("disconnect")) => handlers::disconnect(req, context).await,
        (Method::DELETE, Some("") | None) => handlers::delete(req, context).await,
        (Method::DELETE, Some("with_peers")) => handlers::delete_with_peers(req, context).await,
        (method, Some("admin")) => match (method, components.pop_front().as_deref()) {
            (Method::POST, Some("connect")) => handlers::admin_connect(req, context).await,
            (Method::DELETE, Some("disconnect")) => handlers::admin_disconnect(req, context).await,
            _ => Err(ServerError::NotFound("no such endpoint".to_string())),
        },
        _ => Err(ServerError::NotFound("no such endpoint".to_string())),
    }
}

/// Cascade removal of a subnet: every link kind touching it is revoked,
/// then the filter artifacts and the catalog row go. Peers themselves are
/// left alone; `delete_with_peers` handles those separately.
pub(crate) fn remove_subnet_cascade(
    conn: &Connection,
    _settings: &Settings,
    subnet: &Subnet,
    purge_addr_space: bool,
) -> Result<(), ServerError> {
    log::info!("removing subnet {subnet} and every link touching it");

    // 1) public flags and explicit memberships
    for peer in link::peers_linked_to_subnet(conn, &subnet.subnet)? {
        nft::revoke_public(&subnet.subnet, peer.address);
        nft::del_member(&subnet.subnet, peer.address);
        link::remove_peer_subnet(conn, peer.address, &subnet.subnet)?;
    }

    // 2) subnet -> service grants
    for service in link::services_linked_to_subnet(conn, &subnet.subnet)? {
        if let Some(host) = DatabaseService::host(conn, &service)? {
            nft::revoke_subnet_service(&subnet.subnet, host.address, service.port, service.protocol)?;
        }
        link::remove_subnet_service(conn, &subnet.subnet, &service)?;
    }

    // 3) public cross-links, both directions
    for other in link::subnets_linked_to_subnet(conn, &subnet.subnet)? {
        nft::disconnect_subnets_public(&subnet.subnet, &other.subnet)?;
        link::remove_subnet_subnet(conn, &subnet.subnet, &other.subnet)?;
    }

    // 4) admin edges with this subnet as source or target
    for target in link::admin_subnets_for_subnet(conn, &subnet.subnet)? {
        nft::revoke_admin_subnet_to_subnet(&subnet.subnet, &target.subnet)?;
        link::remove_admin_subnet_subnet(conn, &subnet.subnet, &target.subnet)?;
    }
    for (admin, targets) in link::admin_subnet_subnet_map(conn)? {
        for target in targets {
            if target.subnet == subnet.subnet {
                nft::revoke_admin_subnet_to_subnet(&admin, &subnet.subnet)?;
                link::remove_admin_subnet_subnet(conn, &admin, &subnet.subnet)?;
            }
        }
    }
    for (admin, targets) in link::admin_peer_subnet_map(conn)? {
        for target in targets {
            if target.subnet == subnet.subnet {
                nft::revoke_admin_peer_to_subnet(admin, &subnet.subnet);
                link::remove_admin_peer_subnet(conn, admin, &subnet.subnet)?;
            }
        }
    }

    // 5) filter artifacts, then the catalog row
    nft::destroy_subnet(&subnet.subnet, purge_addr_space)?;
    DatabaseSubnet::delete(conn, subnet)
}

mod handlers {
    use super::*;

    pub async fn create(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let subnet: Subnet = form_body(req).await?;

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        if DatabaseSubnet::get(&conn, &subnet.subnet)?.is_some() {
            return Err(ServerError::BadRequest("Subnet already exists".to_string()));
        }

        state::with_saved_state(&conn, &context.settings, || {
            let created = DatabaseSubnet::create(&conn, subnet)?;
            nft::ensure_subnet(&created.subnet)?;
            // auto-snap: peers already living inside the new CIDR become
            // members right away (public stays an explicit choice)
            for peer in DatabasePeer::list_in_subnet(&conn, &created)? {
                nft::add_member(&created.subnet, peer.address);
            }
            Ok(())
        })?;

        message_response("Subnet created")
    }

    /// Mark a peer public inside a subnet: other members (and members of
    /// publicly linked subnets) may initiate connections to it.
    pub async fn connect(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let username = required_param(&params, "username")?.to_string();
        let cidr = util::parse_cidr(required_param(&params, "subnet")?)?;

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let peer = DatabasePeer::get_by_username(&conn, &username)?
            .ok_or_else(|| ServerError::NotFound("Peer not found".to_string()))?;
        let subnet = DatabaseSubnet::get(&conn, &cidr)?
            .ok_or_else(|| ServerError::NotFound("Subnet not found".to_string()))?;

        state::with_saved_state(&conn, &context.settings, || {
            link::add_peer_subnet(&conn, peer.address, &subnet.subnet)?;
            log::info!("marking peer {} public in {}", *peer, *subnet);
            nft::ensure_subnet(&subnet.subnet)?;
            nft::add_member(&subnet.subnet, peer.address);
            nft::make_public(&subnet.subnet, peer.address);
            Ok(())
        })?;

        message_response("Peer connected to subnet")
    }

    /// Clear the public flag. Membership stays as long as the peer's
    /// address is contained in the CIDR; containment implies membership.
    pub async fn disconnect(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let username = required_param(&params, "username")?.to_string();
        let cidr = util::parse_cidr(required_param(&params, "subnet")?)?;

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let peer = DatabasePeer::get_by_username(&conn, &username)?
            .ok_or_else(|| ServerError::NotFound("Peer not found".to_string()))?;
        let subnet = DatabaseSubnet::get(&conn, &cidr)?
            .ok_or_else(|| ServerError::NotFound("Subnet not found".to_string()))?;

        state::with_saved_state(&conn, &context.settings, || {
            link::remove_peer_subnet(&conn, peer.address, &subnet.subnet)?;
            nft::revoke_public(&subnet.subnet, peer.address);
            if !subnet.contains(peer.address) {
                nft::del_member(&subnet.subnet, peer.address);
            }
            Ok(())
        })?;

        message_response("Peer disconnected from subnet")
    }

    pub async fn delete(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let cidr = util::parse_cidr(required_param(&params, "subnet")?)?;

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let subnet = DatabaseSubnet::get(&conn, &cidr)?
            .ok_or_else(|| ServerError::NotFound("Subnet not found".to_string()))?;

        state::with_saved_state(&conn, &context.settings, || {
            remove_subnet_cascade(&conn, &context.settings, &subnet, false)
        })?;

        message_response("Subnet deleted")
    }

    /// Delete the subnet together with every peer inside it and every
    /// subnet wholly contained in it.
    pub async fn delete_with_peers(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let cidr = util::parse_cidr(required_param(&params, "subnet")?)?;

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let subnet = DatabaseSubnet::get(&conn, &cidr)?
            .ok_or_else(|| ServerError::NotFound("Subnet not found".to_string()))?;

        state::with_saved_state(&conn, &context.settings, || {
            for nested in DatabaseSubnet::list(&conn)? {
                if nested.subnet != subnet.subnet && subnet.subnet.contains(&nested.subnet) {
                    log::info!("also deleting nested subnet {} inside {}", *nested, *subnet);
                    remove_subnet_cascade(&conn, &context.settings, &nested, false)?;
                }
            }
            for peer in DatabasePeer::list_in_subnet(&conn, &subnet)? {
                log::info!("also deleting peer {} inside {}", *peer, *subnet);
                remove_peer_cascade(&conn, &context.settings, &peer)?;
            }
            remove_subnet_cascade(&conn, &context.settings, &subnet, true)
        })?;

        message_response("Subnet and linked peers deleted")
    }

    /// Blanket allow: the admin peer may initiate to any address of the
    /// subnet, public flags notwithstanding.
    pub async fn admin_connect(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let admin_username = required_param(&params, "admin_username")?.to_string();
        let cidr = util::parse_cidr(required_param(&params, "subnet")?)?;

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let admin = DatabasePeer::get_by_username(&conn, &admin_username)?
            .ok_or_else(|| ServerError::NotFound("Peer not found".to_string()))?;
        let subnet = DatabaseSubnet::get(&conn, &cidr)?
            .ok_or_else(|| ServerError::NotFound("Subnet not found".to_string()))?;

        state::with_saved_state(&conn, &context.settings, || {
            link::add_admin_peer_subnet(&conn, admin.address, &subnet.subnet)?;
            log::info!("granting admin peer {} access to {}", *admin, *subnet);
            nft::grant_admin_peer_to_subnet(admin.address, &subnet.subnet);
            Ok(())
        })?;

        message_response("Admin peer connected to subnet")
    }

    pub async fn admin_disconnect(req: Request<Body>, context: Context) -> Result<Response<Body>, ServerError> {
        let params = query_params(&req);
        let admin_username = required_param(&params, "admin_username")?.to_string();
        let cidr = util::parse_cidr(required_param(&params, "subnet")?)?;

        let _write_guard = context.lock.write();
        let conn = context.db.lock();

        let admin = DatabasePeer::get_by_username(&conn, &admin_username)?
            .ok_or_else(|| ServerError::NotFound("Peer not found".to_string()))?;
        let subnet = DatabaseSubnet::get(&conn, &cidr)?
            .ok_or_else(|| ServerError::NotFound("Subnet not found".to_string()))?;

        state::with_saved_state(&conn, &context.settings, || {
            link::remove_admin_peer_subnet(&conn, admin.address, &subnet.subnet)?;
            nft::revoke_admin_peer_to_subnet(admin.address, &subnet.subnet);
            Ok(())
        })?;

        message_response("Admin peer disconnected from subnet")
    }
}
