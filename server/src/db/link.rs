//! The nine link tables of the policy graph. Inserts are idempotent
//! (conflict is a no-op) and deletes of absent rows succeed silently, so
//! every caller can re-apply links without bookkeeping.

use super::{DatabasePeer, DatabaseService, DatabaseSubnet};
use crate::ServerError;
use driftcove_shared::{Peer, Service, Subnet};
use ipnet::Ipv4Net;
use rusqlite::{params, Connection};
use std::{collections::HashMap, net::Ipv4Addr};

pub static CREATE_TABLE_SQL: &str = "
CREATE TABLE IF NOT EXISTS peers_subnets (
  peer_id INTEGER NOT NULL,
  subnet  TEXT NOT NULL,
  UNIQUE(peer_id, subnet),
  FOREIGN KEY (peer_id) REFERENCES peers (id),
  FOREIGN KEY (subnet) REFERENCES subnets (subnet)
);
CREATE TABLE IF NOT EXISTS peers_peers (
  peer_one_id INTEGER NOT NULL,
  peer_two_id INTEGER NOT NULL,
  UNIQUE(peer_one_id, peer_two_id),
  FOREIGN KEY (peer_one_id) REFERENCES peers (id),
  FOREIGN KEY (peer_two_id) REFERENCES peers (id)
);
CREATE TABLE IF NOT EXISTS peers_services (
  peer_id      INTEGER NOT NULL,
  service_id   INTEGER NOT NULL,
  service_port INTEGER NOT NULL,
  UNIQUE(peer_id, service_id, service_port),
  FOREIGN KEY (peer_id) REFERENCES peers (id),
  FOREIGN KEY (service_id) REFERENCES services (id)
);
CREATE TABLE IF NOT EXISTS subnets_subnets (
  subnet_one TEXT NOT NULL,
  subnet_two TEXT NOT NULL,
  UNIQUE(subnet_one, subnet_two),
  FOREIGN KEY (subnet_one) REFERENCES subnets (subnet),
  FOREIGN KEY (subnet_two) REFERENCES subnets (subnet)
);
CREATE TABLE IF NOT EXISTS subnets_services (
  subnet       TEXT NOT NULL,
  service_id   INTEGER NOT NULL,
  service_port INTEGER NOT NULL,
  UNIQUE(subnet, service_id, service_port),
  FOREIGN KEY (subnet) REFERENCES subnets (subnet),
  FOREIGN KEY (service_id) REFERENCES services (id)
);
CREATE TABLE IF NOT EXISTS admin_peers_peers (
  admin_id INTEGER NOT NULL,
  peer_id  INTEGER NOT NULL,
  UNIQUE(admin_id, peer_id),
  FOREIGN KEY (admin_id) REFERENCES peers (id),
  FOREIGN KEY (peer_id) REFERENCES peers (id)
);
CREATE TABLE IF NOT EXISTS admin_peers_subnets (
  peer_id INTEGER NOT NULL,
  subnet  TEXT NOT NULL,
  UNIQUE(peer_id, subnet),
  FOREIGN KEY (peer_id) REFERENCES peers (id),
  FOREIGN KEY (subnet) REFERENCES subnets (subnet)
);
CREATE TABLE IF NOT EXISTS admin_subnets_subnets (
  subnet_one TEXT NOT NULL,
  subnet_two TEXT NOT NULL,
  UNIQUE(subnet_one, subnet_two),
  FOREIGN KEY (subnet_one) REFERENCES subnets (subnet),
  FOREIGN KEY (subnet_two) REFERENCES subnets (subnet)
);
";

const PEER_COLUMNS: &str = "p.username, p.address, p.public_key, p.preshared_key, p.x, p.y";
const SUBNET_COLUMNS: &str = "s.subnet, s.name, s.description, s.x, s.y, s.width, s.height, s.rgba";

// ---------- peer <-> subnet (the explicit public-flag edge) ----------

pub fn add_peer_subnet(conn: &Connection, address: Ipv4Addr, subnet: &Ipv4Net) -> Result<(), ServerError> {
    conn.execute(
        "INSERT INTO peers_subnets (peer_id, subnet)
         VALUES ((SELECT id FROM peers WHERE address = ?1), ?2)
         ON CONFLICT (peer_id, subnet) DO NOTHING",
        params![address.to_string(), subnet.to_string()],
    )?;
    Ok(())
}

pub fn remove_peer_subnet(conn: &Connection, address: Ipv4Addr, subnet: &Ipv4Net) -> Result<(), ServerError> {
    conn.execute(
        "DELETE FROM peers_subnets
         WHERE peer_id = (SELECT id FROM peers WHERE address = ?1) AND subnet = ?2",
        params![address.to_string(), subnet.to_string()],
    )?;
    Ok(())
}

pub fn subnets_linked_to_peer(conn: &Connection, address: Ipv4Addr) -> Result<Vec<Subnet>, ServerError> {
    let mut stmt = conn.prepare_cached(
        "SELECT s.subnet, s.name, s.description, s.x, s.y, s.width, s.height, s.rgba
         FROM subnets s
         JOIN peers_subnets ps ON s.subnet = ps.subnet
         JOIN peers p ON ps.peer_id = p.id
         WHERE p.address = ?1",
    )?;
    let subnets = stmt
        .query_map(params![address.to_string()], DatabaseSubnet::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(subnets)
}

pub fn peers_linked_to_subnet(conn: &Connection, subnet: &Ipv4Net) -> Result<Vec<Peer>, ServerError> {
    let mut stmt = conn.prepare_cached(
        "SELECT p.username, p.address, p.public_key, p.preshared_key, p.x, p.y
         FROM peers p
         JOIN peers_subnets ps ON p.id = ps.peer_id
         WHERE ps.subnet = ?1",
    )?;
    let peers = stmt
        .query_map(params![subnet.to_string()], DatabasePeer::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(peers)
}

pub fn peer_subnet_map(conn: &Connection) -> Result<HashMap<Ipv4Net, Vec<Peer>>, ServerError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT ps.subnet, {PEER_COLUMNS}
         FROM peers_subnets ps JOIN peers p ON ps.peer_id = p.id"
    ))?;
    let rows = stmt.query_map(params![], |row| {
        let subnet: String = row.get(0)?;
        let mut shifted = ShiftedRow::new(row, 1);
        Ok((subnet, shifted.peer()?))
    })?;
    let mut map: HashMap<Ipv4Net, Vec<Peer>> = HashMap::new();
    for row in rows {
        let (subnet, peer) = row?;
        let subnet = subnet
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        map.entry(subnet).or_default().push(peer);
    }
    Ok(map)
}

// ---------- peer <-> peer (symmetric p2p allow) ----------

pub fn add_peer_peer(conn: &Connection, a: Ipv4Addr, b: Ipv4Addr) -> Result<(), ServerError> {
    conn.execute(
        "INSERT INTO peers_peers (peer_one_id, peer_two_id)
         VALUES ((SELECT id FROM peers WHERE address = ?1),
                 (SELECT id FROM peers WHERE address = ?2))
         ON CONFLICT (peer_one_id, peer_two_id) DO NOTHING",
        params![a.to_string(), b.to_string()],
    )?;
    Ok(())
}

/// Removes the edge regardless of which side it was inserted from.
pub fn remove_peer_peer(conn: &Connection, a: Ipv4Addr, b: Ipv4Addr) -> Result<(), ServerError> {
    conn.execute(
        "DELETE FROM peers_peers
         WHERE (peer_one_id = (SELECT id FROM peers WHERE address = ?1)
                AND peer_two_id = (SELECT id FROM peers WHERE address = ?2))
            OR (peer_one_id = (SELECT id FROM peers WHERE address = ?2)
                AND peer_two_id = (SELECT id FROM peers WHERE address = ?1))",
        params![a.to_string(), b.to_string()],
    )?;
    Ok(())
}

pub fn peer_peer_map(conn: &Connection) -> Result<HashMap<Ipv4Addr, Vec<Peer>>, ServerError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT p1.address, {PEER_COLUMNS}
         FROM peers_peers pp
         JOIN peers p1 ON pp.peer_one_id = p1.id
         JOIN peers p ON pp.peer_two_id = p.id"
    ))?;
    let rows = stmt.query_map(params![], |row| {
        let source: String = row.get(0)?;
        let mut shifted = ShiftedRow::new(row, 1);
        Ok((source, shifted.peer()?))
    })?;
    let mut map: HashMap<Ipv4Addr, Vec<Peer>> = HashMap::new();
    for row in rows {
        let (source, peer) = row?;
        let source = source
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        map.entry(source).or_default().push(peer);
    }
    Ok(map)
}

// ---------- peer -> service (consume grant) ----------

pub fn add_peer_service(conn: &Connection, address: Ipv4Addr, service: &Service) -> Result<(), ServerError> {
    conn.execute(
        "INSERT INTO peers_services (peer_id, service_id, service_port)
         VALUES ((SELECT id FROM peers WHERE address = ?1),
                 (SELECT id FROM services WHERE name = ?2), ?3)
         ON CONFLICT (peer_id, service_id, service_port) DO NOTHING",
        params![address.to_string(), service.name, service.port],
    )?;
    Ok(())
}

pub fn remove_peer_service(conn: &Connection, address: Ipv4Addr, service: &Service) -> Result<(), ServerError> {
    conn.execute(
        "DELETE FROM peers_services
         WHERE peer_id = (SELECT id FROM peers WHERE address = ?1)
           AND service_id = (SELECT id FROM services WHERE name = ?2)
           AND service_port = ?3",
        params![address.to_string(), service.name, service.port],
    )?;
    Ok(())
}

pub fn peers_linked_to_service(conn: &Connection, service: &Service) -> Result<Vec<Peer>, ServerError> {
    let mut stmt = conn.prepare_cached(
        "SELECT p.username, p.address, p.public_key, p.preshared_key, p.x, p.y
         FROM peers p
         JOIN peers_services ps ON p.id = ps.peer_id
         JOIN services s ON ps.service_id = s.id
         WHERE s.name = ?1",
    )?;
    let peers = stmt
        .query_map(params![service.name], DatabasePeer::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(peers)
}

pub fn services_linked_to_peer(conn: &Connection, address: Ipv4Addr) -> Result<Vec<Service>, ServerError> {
    let mut stmt = conn.prepare_cached(
        "SELECT s.name, s.department, s.port, s.description, s.protocol
         FROM services s
         JOIN peers_services ps ON s.id = ps.service_id
         JOIN peers p ON ps.peer_id = p.id
         WHERE p.address = ?1",
    )?;
    let services = stmt
        .query_map(params![address.to_string()], DatabaseService::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(services)
}

pub fn peer_service_map(conn: &Connection) -> Result<HashMap<String, Vec<Peer>>, ServerError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT s.name, {PEER_COLUMNS}
         FROM peers_services ps
         JOIN peers p ON ps.peer_id = p.id
         JOIN services s ON ps.service_id = s.id"
    ))?;
    let rows = stmt.query_map(params![], |row| {
        let service: String = row.get(0)?;
        let mut shifted = ShiftedRow::new(row, 1);
        Ok((service, shifted.peer()?))
    })?;
    let mut map: HashMap<String, Vec<Peer>> = HashMap::new();
    for row in rows {
        let (service, peer) = row?;
        map.entry(service).or_default().push(peer);
    }
    Ok(map)
}

// ---------- subnet <-> subnet (public cross-link) ----------

pub fn add_subnet_subnet(conn: &Connection, a: &Ipv4Net, b: &Ipv4Net) -> Result<(), ServerError> {
    conn.execute(
        "INSERT INTO subnets_subnets (subnet_one, subnet_two) VALUES (?1, ?2)
         ON CONFLICT (subnet_one, subnet_two) DO NOTHING",
        params![a.to_string(), b.to_string()],
    )?;
    Ok(())
}

pub fn remove_subnet_subnet(conn: &Connection, a: &Ipv4Net, b: &Ipv4Net) -> Result<(), ServerError> {
    conn.execute(
        "DELETE FROM subnets_subnets
         WHERE (subnet_one = ?1 AND subnet_two = ?2)
            OR (subnet_one = ?2 AND subnet_two = ?1)",
        params![a.to_string(), b.to_string()],
    )?;
    Ok(())
}

pub fn subnets_linked_to_subnet(conn: &Connection, subnet: &Ipv4Net) -> Result<Vec<Subnet>, ServerError> {
    let mut stmt = conn.prepare_cached(
        "SELECT s.subnet, s.name, s.description, s.x, s.y, s.width, s.height, s.rgba
         FROM subnets s JOIN subnets_subnets ss ON s.subnet = ss.subnet_two
         WHERE ss.subnet_one = ?1
         UNION
         SELECT s.subnet, s.name, s.description, s.x, s.y, s.width, s.height, s.rgba
         FROM subnets s JOIN subnets_subnets ss ON s.subnet = ss.subnet_one
         WHERE ss.subnet_two = ?1",
    )?;
    let subnets = stmt
        .query_map(params![subnet.to_string()], DatabaseSubnet::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(subnets)
}

/// Both directions of every edge appear in the map, so a lookup by either
/// endpoint sees the link.
pub fn subnet_subnet_map(conn: &Connection) -> Result<HashMap<Ipv4Net, Vec<Subnet>>, ServerError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT ss.subnet_one, {SUBNET_COLUMNS}
         FROM subnets_subnets ss JOIN subnets s ON ss.subnet_two = s.subnet
         UNION ALL
         SELECT ss.subnet_two, {SUBNET_COLUMNS}
         FROM subnets_subnets ss JOIN subnets s ON ss.subnet_one = s.subnet"
    ))?;
    let rows = stmt.query_map(params![], |row| {
        let source: String = row.get(0)?;
        let mut shifted = ShiftedRow::new(row, 1);
        Ok((source, shifted.subnet()?))
    })?;
    let mut map: HashMap<Ipv4Net, Vec<Subnet>> = HashMap::new();
    for row in rows {
        let (source, subnet) = row?;
        let source = source
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        map.entry(source).or_default().push(subnet);
    }
    Ok(map)
}

// ---------- subnet -> service ----------

pub fn add_subnet_service(conn: &Connection, subnet: &Ipv4Net, service: &Service) -> Result<(), ServerError> {
    conn.execute(
        "INSERT INTO subnets_services (subnet, service_id, service_port)
         VALUES (?1, (SELECT id FROM services WHERE name = ?2), ?3)
         ON CONFLICT (subnet, service_id, service_port) DO NOTHING",
        params![subnet.to_string(), service.name, service.port],
    )?;
    Ok(())
}

pub fn remove_subnet_service(conn: &Connection, subnet: &Ipv4Net, service: &Service) -> Result<(), ServerError> {
    conn.execute(
        "DELETE FROM subnets_services
         WHERE subnet = ?1
           AND service_id = (SELECT id FROM services WHERE name = ?2)
           AND service_port = ?3",
        params![subnet.to_string(), service.name, service.port],
    )?;
    Ok(())
}

pub fn services_linked_to_subnet(conn: &Connection, subnet: &Ipv4Net) -> Result<Vec<Service>, ServerError> {
    let mut stmt = conn.prepare_cached(
        "SELECT s.name, s.department, s.port, s.description, s.protocol
         FROM services s
         JOIN subnets_services ss ON s.id = ss.service_id
         WHERE ss.subnet = ?1",
    )?;
    let services = stmt
        .query_map(params![subnet.to_string()], DatabaseService::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(services)
}

pub fn subnets_linked_to_service(conn: &Connection, service: &Service) -> Result<Vec<Subnet>, ServerError> {
    let mut stmt = conn.prepare_cached(
        "SELECT sn.subnet, sn.name, sn.description, sn.x, sn.y, sn.width, sn.height, sn.rgba
         FROM subnets sn
         JOIN subnets_services ss ON sn.subnet = ss.subnet
         JOIN services s ON ss.service_id = s.id
         WHERE s.name = ?1",
    )?;
    let subnets = stmt
        .query_map(params![service.name], DatabaseSubnet::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(subnets)
}

pub fn subnet_service_map(conn: &Connection) -> Result<HashMap<Ipv4Net, Vec<Service>>, ServerError> {
    let mut stmt = conn.prepare_cached(
        "SELECT ss.subnet, s.name, s.department, s.port, s.description, s.protocol
         FROM subnets_services ss JOIN services s ON ss.service_id = s.id",
    )?;
    let rows = stmt.query_map(params![], |row| {
        let source: String = row.get(0)?;
        let mut shifted = ShiftedRow::new(row, 1);
        Ok((source, shifted.service()?))
    })?;
    let mut map: HashMap<Ipv4Net, Vec<Service>> = HashMap::new();
    for row in rows {
        let (source, service) = row?;
        let source = source
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        map.entry(source).or_default().push(service);
    }
    Ok(map)
}

// ---------- admin grants (all directed) ----------

pub fn add_admin_peer_peer(conn: &Connection, admin: Ipv4Addr, peer: Ipv4Addr) -> Result<(), ServerError> {
    conn.execute(
        "INSERT INTO admin_peers_peers (admin_id, peer_id)
         VALUES ((SELECT id FROM peers WHERE address = ?1),
                 (SELECT id FROM peers WHERE address = ?2))
         ON CONFLICT (admin_id, peer_id) DO NOTHING",
        params![admin.to_string(), peer.to_string()],
    )?;
    Ok(())
}

pub fn remove_admin_peer_peer(conn: &Connection, admin: Ipv4Addr, peer: Ipv4Addr) -> Result<(), ServerError> {
    conn.execute(
        "DELETE FROM admin_peers_peers
         WHERE admin_id = (SELECT id FROM peers WHERE address = ?1)
           AND peer_id = (SELECT id FROM peers WHERE address = ?2)",
        params![admin.to_string(), peer.to_string()],
    )?;
    Ok(())
}

pub fn admin_peer_peer_map(conn: &Connection) -> Result<HashMap<Ipv4Addr, Vec<Peer>>, ServerError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT a.address, {PEER_COLUMNS}
         FROM admin_peers_peers app
         JOIN peers a ON app.admin_id = a.id
         JOIN peers p ON app.peer_id = p.id"
    ))?;
    let rows = stmt.query_map(params![], |row| {
        let source: String = row.get(0)?;
        let mut shifted = ShiftedRow::new(row, 1);
        Ok((source, shifted.peer()?))
    })?;
    let mut map: HashMap<Ipv4Addr, Vec<Peer>> = HashMap::new();
    for row in rows {
        let (source, peer) = row?;
        let source = source
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        map.entry(source).or_default().push(peer);
    }
    Ok(map)
}

pub fn add_admin_peer_subnet(conn: &Connection, address: Ipv4Addr, subnet: &Ipv4Net) -> Result<(), ServerError> {
    conn.execute(
        "INSERT INTO admin_peers_subnets (peer_id, subnet)
         VALUES ((SELECT id FROM peers WHERE address = ?1), ?2)
         ON CONFLICT (peer_id, subnet) DO NOTHING",
        params![address.to_string(), subnet.to_string()],
    )?;
    Ok(())
}

pub fn remove_admin_peer_subnet(conn: &Connection, address: Ipv4Addr, subnet: &Ipv4Net) -> Result<(), ServerError> {
    conn.execute(
        "DELETE FROM admin_peers_subnets
         WHERE peer_id = (SELECT id FROM peers WHERE address = ?1) AND subnet = ?2",
        params![address.to_string(), subnet.to_string()],
    )?;
    Ok(())
}

pub fn admin_subnets_for_peer(conn: &Connection, address: Ipv4Addr) -> Result<Vec<Subnet>, ServerError> {
    let mut stmt = conn.prepare_cached(
        "SELECT s.subnet, s.name, s.description, s.x, s.y, s.width, s.height, s.rgba
         FROM subnets s
         JOIN admin_peers_subnets aps ON s.subnet = aps.subnet
         JOIN peers p ON aps.peer_id = p.id
         WHERE p.address = ?1",
    )?;
    let subnets = stmt
        .query_map(params![address.to_string()], DatabaseSubnet::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(subnets)
}

pub fn admin_peer_subnet_map(conn: &Connection) -> Result<HashMap<Ipv4Addr, Vec<Subnet>>, ServerError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT p.address, {SUBNET_COLUMNS}
         FROM admin_peers_subnets aps
         JOIN peers p ON aps.peer_id = p.id
         JOIN subnets s ON aps.subnet = s.subnet"
    ))?;
    let rows = stmt.query_map(params![], |row| {
        let source: String = row.get(0)?;
        let mut shifted = ShiftedRow::new(row, 1);
        Ok((source, shifted.subnet()?))
    })?;
    let mut map: HashMap<Ipv4Addr, Vec<Subnet>> = HashMap::new();
    for row in rows {
        let (source, subnet) = row?;
        let source = source
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        map.entry(source).or_default().push(subnet);
    }
    Ok(map)
}

pub fn add_admin_subnet_subnet(conn: &Connection, admin: &Ipv4Net, subnet: &Ipv4Net) -> Result<(), ServerError> {
    conn.execute(
        "INSERT INTO admin_subnets_subnets (subnet_one, subnet_two) VALUES (?1, ?2)
         ON CONFLICT (subnet_one, subnet_two) DO NOTHING",
        params![admin.to_string(), subnet.to_string()],
    )?;
    Ok(())
}

pub fn remove_admin_subnet_subnet(conn: &Connection, admin: &Ipv4Net, subnet: &Ipv4Net) -> Result<(), ServerError> {
    conn.execute(
        "DELETE FROM admin_subnets_subnets WHERE subnet_one = ?1 AND subnet_two = ?2",
        params![admin.to_string(), subnet.to_string()],
    )?;
    Ok(())
}

pub fn admin_subnets_for_subnet(conn: &Connection, admin: &Ipv4Net) -> Result<Vec<Subnet>, ServerError> {
    let mut stmt = conn.prepare_cached(
        "SELECT s.subnet, s.name, s.description, s.x, s.y, s.width, s.height, s.rgba
         FROM subnets s
         JOIN admin_subnets_subnets ass ON s.subnet = ass.subnet_two
         WHERE ass.subnet_one = ?1",
    )?;
    let subnets = stmt
        .query_map(params![admin.to_string()], DatabaseSubnet::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(subnets)
}

pub fn admin_subnet_subnet_map(conn: &Connection) -> Result<HashMap<Ipv4Net, Vec<Subnet>>, ServerError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT ass.subnet_one, {SUBNET_COLUMNS}
         FROM admin_subnets_subnets ass JOIN subnets s ON ass.subnet_two = s.subnet"
    ))?;
    let rows = stmt.query_map(params![], |row| {
        let source: String = row.get(0)?;
        let mut shifted = ShiftedRow::new(row, 1);
        Ok((source, shifted.subnet()?))
    })?;
    let mut map: HashMap<Ipv4Net, Vec<Subnet>> = HashMap::new();
    for row in rows {
        let (source, subnet) = row?;
        let source = source
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        map.entry(source).or_default().push(subnet);
    }
    Ok(map)
}

/// Reads entity columns starting at an offset, for queries that prefix the
/// row with the link's source key.
struct ShiftedRow<'a, 'b> {
    row: &'a rusqlite::Row<'b>,
    offset: usize,
}

impl<'a, 'b> ShiftedRow<'a, 'b> {
    fn new(row: &'a rusqlite::Row<'b>, offset: usize) -> Self {
        Self { row, offset }
    }

    fn get<T: rusqlite::types::FromSql>(&mut self, index: usize) -> Result<T, rusqlite::Error> {
        self.row.get(self.offset + index)
    }

    fn peer(&mut self) -> Result<Peer, rusqlite::Error> {
        let address: Ipv4Addr = self
            .get::<String>(1)?
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        Ok(Peer {
            username: self.get(0)?,
            address,
            public_key: self.get(2)?,
            preshared_key: self.get(3)?,
            x: self.get(4)?,
            y: self.get(5)?,
            services: Default::default(),
            tx: 0,
            rx: 0,
            last_handshake: 0,
        })
    }

    fn subnet(&mut self) -> Result<Subnet, rusqlite::Error> {
        let subnet: Ipv4Net = self
            .get::<String>(0)?
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        Ok(Subnet {
            subnet,
            name: self.get(1)?,
            description: self.get(2)?,
            x: self.get(3)?,
            y: self.get(4)?,
            width: self.get(5)?,
            height: self.get(6)?,
            rgba: self.get(7)?,
        })
    }

    fn service(&mut self) -> Result<Service, rusqlite::Error> {
        let protocol = self
            .get::<String>(4)?
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        Ok(Service {
            name: self.get(0)?,
            department: self.get(1)?,
            port: self.get(2)?,
            description: self.get(3)?,
            protocol,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::DatabasePeer, test};
    use anyhow::Result;

    #[test]
    fn p2p_links_are_idempotent_and_symmetric() -> Result<()> {
        let (conn, _dir) = test::open_catalog()?;
        let a = DatabasePeer::create(&conn, test::peer("alice", "10.42.0.1"))?;
        let b = DatabasePeer::create(&conn, test::peer("bob", "10.42.0.7"))?;

        add_peer_peer(&conn, a.address, b.address)?;
        add_peer_peer(&conn, a.address, b.address)?;
        let map = peer_peer_map(&conn)?;
        assert_eq!(map.get(&a.address).map(Vec::len), Some(1));

        // removal works from the opposite side too
        remove_peer_peer(&conn, b.address, a.address)?;
        assert!(peer_peer_map(&conn)?.is_empty());
        Ok(())
    }

    #[test]
    fn subnet_links_visible_from_both_sides() -> Result<()> {
        let (conn, _dir) = test::open_catalog()?;
        let a = crate::db::DatabaseSubnet::create(&conn, test::subnet("10.42.0.0/24", "a"))?;
        let b = crate::db::DatabaseSubnet::create(&conn, test::subnet("10.43.0.0/24", "b"))?;
        add_subnet_subnet(&conn, &a.subnet, &b.subnet)?;

        assert_eq!(subnets_linked_to_subnet(&conn, &a.subnet)?.len(), 1);
        assert_eq!(subnets_linked_to_subnet(&conn, &b.subnet)?.len(), 1);
        let map = subnet_subnet_map(&conn)?;
        assert!(map.contains_key(&a.subnet));
        assert!(map.contains_key(&b.subnet));

        remove_subnet_subnet(&conn, &b.subnet, &a.subnet)?;
        assert!(subnets_linked_to_subnet(&conn, &a.subnet)?.is_empty());
        Ok(())
    }

    #[test]
    fn public_flag_edges() -> Result<()> {
        let (conn, _dir) = test::open_catalog()?;
        let subnet = crate::db::DatabaseSubnet::create(&conn, test::subnet("10.42.0.0/24", "net"))?;
        let peer = DatabasePeer::create(&conn, test::peer("alice", "10.42.0.1"))?;

        add_peer_subnet(&conn, peer.address, &subnet.subnet)?;
        add_peer_subnet(&conn, peer.address, &subnet.subnet)?;
        assert_eq!(peers_linked_to_subnet(&conn, &subnet.subnet)?.len(), 1);
        assert_eq!(subnets_linked_to_peer(&conn, peer.address)?.len(), 1);

        remove_peer_subnet(&conn, peer.address, &subnet.subnet)?;
        remove_peer_subnet(&conn, peer.address, &subnet.subnet)?;
        assert!(peers_linked_to_subnet(&conn, &subnet.subnet)?.is_empty());
        Ok(())
    }

    #[test]
    fn admin_links_are_directed() -> Result<()> {
        let (conn, _dir) = test::open_catalog()?;
        let admin = DatabasePeer::create(&conn, test::peer("admin", "10.42.0.1"))?;
        let target = DatabasePeer::create(&conn, test::peer("target", "10.42.0.2"))?;
        add_admin_peer_peer(&conn, admin.address, target.address)?;

        let map = admin_peer_peer_map(&conn)?;
        assert_eq!(map.get(&admin.address).map(Vec::len), Some(1));
        assert!(map.get(&target.address).is_none());
        Ok(())
    }
}
