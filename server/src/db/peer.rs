use super::DatabaseService;
use crate::ServerError;
use driftcove_shared::{Peer, Subnet};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use std::{
    collections::HashSet,
    net::Ipv4Addr,
    ops::{Deref, DerefMut},
};

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS peers (
      id            INTEGER PRIMARY KEY,
      username      TEXT NOT NULL UNIQUE,    /* Short interface-friendly handle.        */
      address       TEXT NOT NULL UNIQUE,    /* The overlay IPv4 assigned to the peer.  */
      public_key    TEXT NOT NULL UNIQUE,    /* The WireGuard public key of the peer.   */
      preshared_key TEXT NOT NULL,           /* The WireGuard preshared key (base64).   */
      x             REAL DEFAULT 0 NOT NULL, /* Canvas position.                        */
      y             REAL DEFAULT 0 NOT NULL
    )";

/// Usernames end up in client config file names, so keep them short and
/// shell/interface friendly.
static USERNAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,15}$").unwrap());

#[derive(Debug)]
pub struct DatabasePeer {
    pub inner: Peer,
}

impl From<Peer> for DatabasePeer {
    fn from(inner: Peer) -> Self {
        Self { inner }
    }
}

impl Deref for DatabasePeer {
    type Target = Peer;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for DatabasePeer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl DatabasePeer {
    pub fn is_valid_username(name: &str) -> bool {
        USERNAME_REGEX.is_match(name)
    }

    pub fn create(conn: &Connection, peer: Peer) -> Result<Self, ServerError> {
        if !Self::is_valid_username(&peer.username) {
            return Err(ServerError::BadRequest(
                "Username must be between 1 and 15 characters long".to_string(),
            ));
        }
        log::info!("creating peer {peer}");
        conn.execute(
            "INSERT INTO peers (username, address, public_key, preshared_key, x, y)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                peer.username,
                peer.address.to_string(),
                peer.public_key,
                peer.preshared_key,
                peer.x,
                peer.y,
            ],
        )?;
        Ok(peer.into())
    }

    pub fn delete(conn: &Connection, peer: &Peer) -> Result<(), ServerError> {
        match conn.execute(
            "DELETE FROM peers WHERE public_key = ?1",
            params![peer.public_key],
        )? {
            0 => Err(ServerError::NotFound("Peer not found".to_string())),
            _ => Ok(()),
        }
    }

    pub fn update_keys(
        &mut self,
        conn: &Connection,
        public_key: &str,
        preshared_key: &str,
    ) -> Result<(), ServerError> {
        conn.execute(
            "UPDATE peers SET public_key = ?1, preshared_key = ?2 WHERE username = ?3",
            params![public_key, preshared_key, self.username],
        )?;
        self.inner.public_key = public_key.to_string();
        self.inner.preshared_key = preshared_key.to_string();
        Ok(())
    }

    pub fn update_position(&mut self, conn: &Connection, x: f64, y: f64) -> Result<(), ServerError> {
        conn.execute(
            "UPDATE peers SET x = ?1, y = ?2 WHERE username = ?3",
            params![x, y, self.username],
        )?;
        self.inner.x = x;
        self.inner.y = y;
        Ok(())
    }

    pub(crate) fn from_row(row: &rusqlite::Row) -> Result<Peer, rusqlite::Error> {
        let address: Ipv4Addr = row
            .get::<_, String>(1)?
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        Ok(Peer {
            username: row.get(0)?,
            address,
            public_key: row.get(2)?,
            preshared_key: row.get(3)?,
            x: row.get(4)?,
            y: row.get(5)?,
            services: Default::default(),
            tx: 0,
            rx: 0,
            last_handshake: 0,
        })
    }

    fn attach_services(conn: &Connection, peer: &mut Peer) -> Result<(), ServerError> {
        for service in DatabaseService::hosted_by(conn, peer)? {
            peer.services.insert(service.name.clone(), service);
        }
        Ok(())
    }

    pub fn get_by_username(conn: &Connection, username: &str) -> Result<Option<Self>, ServerError> {
        let peer = conn
            .query_row(
                "SELECT username, address, public_key, preshared_key, x, y
                 FROM peers WHERE username = ?1",
                params![username],
                Self::from_row,
            )
            .optional()?;
        match peer {
            Some(mut peer) => {
                Self::attach_services(conn, &mut peer)?;
                Ok(Some(peer.into()))
            },
            None => Ok(None),
        }
    }

    pub fn get_by_address(conn: &Connection, address: Ipv4Addr) -> Result<Option<Self>, ServerError> {
        let peer = conn
            .query_row(
                "SELECT username, address, public_key, preshared_key, x, y
                 FROM peers WHERE address = ?1",
                params![address.to_string()],
                Self::from_row,
            )
            .optional()?;
        match peer {
            Some(mut peer) => {
                Self::attach_services(conn, &mut peer)?;
                Ok(Some(peer.into()))
            },
            None => Ok(None),
        }
    }

    pub fn get_by_public_key(conn: &Connection, public_key: &str) -> Result<Option<Self>, ServerError> {
        let peer = conn
            .query_row(
                "SELECT username, address, public_key, preshared_key, x, y
                 FROM peers WHERE public_key = ?1",
                params![public_key],
                Self::from_row,
            )
            .optional()?;
        match peer {
            Some(mut peer) => {
                Self::attach_services(conn, &mut peer)?;
                Ok(Some(peer.into()))
            },
            None => Ok(None),
        }
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT username, address, public_key, preshared_key, x, y FROM peers",
        )?;
        let peers = stmt
            .query_map(params![], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let mut result = Vec::with_capacity(peers.len());
        for mut peer in peers {
            Self::attach_services(conn, &mut peer)?;
            result.push(peer.into());
        }
        Ok(result)
    }

    /// Peers whose address falls inside the subnet's CIDR (implicit members).
    pub fn list_in_subnet(conn: &Connection, subnet: &Subnet) -> Result<Vec<Self>, ServerError> {
        Ok(Self::list(conn)?
            .into_iter()
            .filter(|peer| subnet.contains(peer.address))
            .collect())
    }

    pub fn is_address_assigned(conn: &Connection, address: Ipv4Addr) -> Result<bool, ServerError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM peers WHERE address = ?1",
            params![address.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// The first unassigned host address of the subnet, in numeric order.
    /// Prefixes of /31 and /32 carry no assignable host addresses.
    pub fn next_available_ip(
        conn: &Connection,
        subnet: &Subnet,
    ) -> Result<Option<Ipv4Addr>, ServerError> {
        if subnet.subnet.prefix_len() >= 31 {
            return Ok(None);
        }
        let mut stmt = conn.prepare_cached("SELECT address FROM peers")?;
        let addresses = stmt
            .query_map(params![], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let used: HashSet<Ipv4Addr> = addresses
            .iter()
            .filter_map(|address| address.parse().ok())
            .collect();
        for candidate in subnet.subnet.hosts() {
            if !used.contains(&candidate) {
                return Ok(Some(candidate));
            }
        }
        log::warn!("no available IPs left in {}", subnet.subnet);
        Ok(None)
    }

    pub(crate) fn id(conn: &Connection, address: Ipv4Addr) -> Result<i64, ServerError> {
        Ok(conn.query_row(
            "SELECT id FROM peers WHERE address = ?1",
            params![address.to_string()],
            |row| row.get(0),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;
    use anyhow::Result;

    #[test]
    fn username_pattern() {
        assert!(DatabasePeer::is_valid_username("alice"));
        assert!(DatabasePeer::is_valid_username("a"));
        assert!(DatabasePeer::is_valid_username("Dev_Box-01"));
        assert!(!DatabasePeer::is_valid_username(""));
        assert!(!DatabasePeer::is_valid_username("sixteen-chars-xx"));
        assert!(!DatabasePeer::is_valid_username("has space"));
        assert!(!DatabasePeer::is_valid_username("dot.dot"));
    }

    #[test]
    fn create_rejects_duplicate_address() -> Result<()> {
        let (conn, _dir) = test::open_catalog()?;
        DatabasePeer::create(&conn, test::peer("alice", "10.42.0.1"))?;
        let duplicate = DatabasePeer::create(&conn, test::peer("bob", "10.42.0.1"));
        assert!(duplicate.is_err());
        Ok(())
    }

    #[test]
    fn next_available_ip_skips_used_addresses() -> Result<()> {
        let (conn, _dir) = test::open_catalog()?;
        let subnet = test::subnet("10.42.0.0/24", "net");
        DatabasePeer::create(&conn, test::peer("alice", "10.42.0.1"))?;
        DatabasePeer::create(&conn, test::peer("bob", "10.42.0.2"))?;
        DatabasePeer::create(&conn, test::peer("carol", "10.42.0.4"))?;
        assert_eq!(
            DatabasePeer::next_available_ip(&conn, &subnet)?,
            Some("10.42.0.3".parse()?)
        );
        Ok(())
    }

    #[test]
    fn next_available_ip_exhausted_prefixes() -> Result<()> {
        let (conn, _dir) = test::open_catalog()?;
        assert_eq!(
            DatabasePeer::next_available_ip(&conn, &test::subnet("10.50.0.1/32", "single"))?,
            None
        );
        assert_eq!(
            DatabasePeer::next_available_ip(&conn, &test::subnet("10.50.0.0/31", "pair"))?,
            None
        );
        // A /30 has exactly two hosts.
        let tiny = test::subnet("10.50.0.0/30", "tiny");
        DatabasePeer::create(&conn, test::peer("a", "10.50.0.1"))?;
        DatabasePeer::create(&conn, test::peer("b", "10.50.0.2"))?;
        assert_eq!(DatabasePeer::next_available_ip(&conn, &tiny)?, None);
        Ok(())
    }

    #[test]
    fn lookups_by_every_key() -> Result<()> {
        let (conn, _dir) = test::open_catalog()?;
        let created = DatabasePeer::create(&conn, test::peer("alice", "10.42.0.1"))?;
        assert!(DatabasePeer::get_by_username(&conn, "alice")?.is_some());
        assert!(DatabasePeer::get_by_address(&conn, "10.42.0.1".parse()?)?.is_some());
        assert!(DatabasePeer::get_by_public_key(&conn, &created.public_key)?.is_some());
        assert!(DatabasePeer::get_by_username(&conn, "nobody")?.is_none());
        Ok(())
    }

    #[test]
    fn containment_filter() -> Result<()> {
        let (conn, _dir) = test::open_catalog()?;
        DatabasePeer::create(&conn, test::peer("inside", "10.42.0.5"))?;
        DatabasePeer::create(&conn, test::peer("outside", "10.43.0.5"))?;
        let subnet = test::subnet("10.42.0.0/24", "net");
        let members = DatabasePeer::list_in_subnet(&conn, &subnet)?;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].username, "inside");
        Ok(())
    }
}
