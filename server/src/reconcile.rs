//! Boot reconciliation: the catalog is the source of truth, the WireGuard
//! interface and the filter table are derived projections. At startup (and
//! after a topology upload) both projections are torn down and replayed
//! from the catalog. Running this twice without intervening changes yields
//! identical external state.

use crate::{
    config::Settings,
    db::{link, DatabasePeer, DatabaseService, DatabaseSubnet},
    nft, wg, ServerError,
};
use rusqlite::Connection;

pub fn apply_config_from_database(conn: &Connection, settings: &Settings) -> Result<(), ServerError> {
    log::info!("rebuilding WireGuard and filter state from the catalog");
    nft::flush(settings)?;
    wg::flush(settings)?;

    let peers = DatabasePeer::list(conn)?;
    let p2p = link::peer_peer_map(conn)?;
    for peer in &peers {
        wg::apply_peer(settings, peer)?;
        for other in p2p.get(&peer.address).into_iter().flatten() {
            nft::add_p2p(peer.address, other.address);
        }
    }
    log::info!("{} peers applied to the interface", peers.len());

    for service in DatabaseService::list(conn)? {
        let host = DatabaseService::host(conn, &service)?.ok_or_else(|| {
            ServerError::NotFound(format!("host for service {} not found", service.name))
        })?;
        for guest in link::peers_linked_to_service(conn, &service)? {
            nft::grant_service(guest.address, host.address, service.port, service.protocol);
        }
    }

    let subnet_links = link::subnet_subnet_map(conn)?;
    let subnet_services = link::subnet_service_map(conn)?;
    for subnet in DatabaseSubnet::list(conn)? {
        nft::ensure_subnet(&subnet.subnet)?;

        // explicit links carry the public flag (and membership, for peers
        // living outside the CIDR); containment alone makes a member
        for peer in link::peers_linked_to_subnet(conn, &subnet.subnet)? {
            nft::add_member(&subnet.subnet, peer.address);
            nft::make_public(&subnet.subnet, peer.address);
        }
        for peer in DatabasePeer::list_in_subnet(conn, &subnet)? {
            nft::add_member(&subnet.subnet, peer.address);
        }

        for other in subnet_links.get(&subnet.subnet).into_iter().flatten() {
            log::debug!("subnet {subnet} is publicly linked with {other}", subnet = *subnet);
            nft::connect_subnets_public(&subnet.subnet, &other.subnet)?;
        }

        for service in subnet_services.get(&subnet.subnet).into_iter().flatten() {
            let host = DatabaseService::host(conn, service)?.ok_or_else(|| {
                ServerError::NotFound(format!("host for service {} not found", service.name))
            })?;
            nft::grant_subnet_service(&subnet.subnet, host.address, service.port, service.protocol)?;
        }
    }

    for (admin, targets) in link::admin_peer_peer_map(conn)? {
        for target in targets {
            nft::grant_admin_peer_to_peer(admin, target.address);
        }
    }
    for (admin, subnets) in link::admin_peer_subnet_map(conn)? {
        for subnet in subnets {
            nft::grant_admin_peer_to_subnet(admin, &subnet.subnet);
        }
    }
    for (admin, subnets) in link::admin_subnet_subnet_map(conn)? {
        for subnet in subnets {
            nft::grant_admin_subnet_to_subnet(&admin, &subnet.subnet)?;
        }
    }

    wg::apply_ip_route(settings)?;
    log::info!("catalog replay complete");
    Ok(())
}
