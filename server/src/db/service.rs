use super::DatabasePeer;
use crate::ServerError;
use driftcove_shared::{Peer, Protocol, Service};
use rusqlite::{params, Connection, OptionalExtension};
use std::ops::{Deref, DerefMut};

/* A service row shares its primary key with the hosting peer, so a peer
   hosts at most one service and the host lookup is a plain join. */
pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS services (
      id          INTEGER PRIMARY KEY,          /* peers.id of the host.  */
      name        TEXT NOT NULL UNIQUE,
      department  TEXT NOT NULL,
      port        INTEGER NOT NULL,
      description TEXT DEFAULT '' NOT NULL,
      protocol    TEXT DEFAULT 'both' NOT NULL,
      FOREIGN KEY (id)
         REFERENCES peers (id)
            ON UPDATE RESTRICT
            ON DELETE RESTRICT
    )";

#[derive(Debug)]
pub struct DatabaseService {
    pub inner: Service,
}

impl From<Service> for DatabaseService {
    fn from(inner: Service) -> Self {
        Self { inner }
    }
}

impl Deref for DatabaseService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for DatabaseService {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl DatabaseService {
    pub fn create(conn: &Connection, host: &Peer, service: Service) -> Result<Self, ServerError> {
        let host_id = DatabasePeer::id(conn, host.address).map_err(|_| {
            ServerError::NotFound(format!("Peer {} does not exist", host.username))
        })?;
        log::info!("creating service {service} hosted by {host}");
        conn.execute(
            "INSERT INTO services (id, name, department, port, description, protocol)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                host_id,
                service.name,
                service.department,
                service.port,
                service.description,
                service.protocol.to_string(),
            ],
        )?;
        Ok(service.into())
    }

    pub fn delete(conn: &Connection, service: &Service) -> Result<(), ServerError> {
        match conn.execute(
            "DELETE FROM services WHERE name = ?1 AND port = ?2",
            params![service.name, service.port],
        )? {
            0 => Err(ServerError::NotFound("Service not found".to_string())),
            _ => Ok(()),
        }
    }

    pub(crate) fn from_row(row: &rusqlite::Row) -> Result<Service, rusqlite::Error> {
        let protocol: Protocol = row
            .get::<_, String>(4)?
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        Ok(Service {
            name: row.get(0)?,
            department: row.get(1)?,
            port: row.get(2)?,
            description: row.get(3)?,
            protocol,
        })
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> Result<Option<Self>, ServerError> {
        Ok(conn
            .query_row(
                "SELECT name, department, port, description, protocol
                 FROM services WHERE name = ?1",
                params![name],
                Self::from_row,
            )
            .optional()?
            .map(Into::into))
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, ServerError> {
        let mut stmt = conn
            .prepare_cached("SELECT name, department, port, description, protocol FROM services")?;
        let services = stmt
            .query_map(params![], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(services.into_iter().map(Into::into).collect())
    }

    /// The peer hosting the service.
    pub fn host(conn: &Connection, service: &Service) -> Result<Option<DatabasePeer>, ServerError> {
        let address: Option<String> = conn
            .query_row(
                "SELECT p.address FROM peers p JOIN services s ON p.id = s.id
                 WHERE s.name = ?1",
                params![service.name],
                |row| row.get(0),
            )
            .optional()?;
        match address {
            Some(address) => {
                let address = address
                    .parse()
                    .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
                DatabasePeer::get_by_address(conn, address)
            },
            None => Ok(None),
        }
    }

    /// Services hosted by the given peer (at most one under the current
    /// schema, kept plural for the topology shape).
    pub fn hosted_by(conn: &Connection, peer: &Peer) -> Result<Vec<Service>, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT s.name, s.department, s.port, s.description, s.protocol
             FROM services s JOIN peers p ON s.id = p.id
             WHERE p.public_key = ?1",
        )?;
        let services = stmt
            .query_map(params![peer.public_key], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;
    use anyhow::Result;

    #[test]
    fn create_and_resolve_host() -> Result<()> {
        let (conn, _dir) = test::open_catalog()?;
        let host = DatabasePeer::create(&conn, test::peer("host", "10.42.0.1"))?;
        DatabaseService::create(&conn, &host, test::service("wiki", 8080))?;

        let service = DatabaseService::get_by_name(&conn, "wiki")?.unwrap();
        assert_eq!(service.port, 8080);
        let resolved = DatabaseService::host(&conn, &service)?.unwrap();
        assert_eq!(resolved.username, "host");

        let hosted = DatabaseService::hosted_by(&conn, &host)?;
        assert_eq!(hosted.len(), 1);
        assert_eq!(hosted[0].name, "wiki");
        Ok(())
    }

    #[test]
    fn create_for_unknown_host_fails() -> Result<()> {
        let (conn, _dir) = test::open_catalog()?;
        let ghost = test::peer("ghost", "10.99.0.1");
        assert!(DatabaseService::create(&conn, &ghost, test::service("wiki", 8080)).is_err());
        Ok(())
    }

    #[test]
    fn duplicate_name_rejected() -> Result<()> {
        let (conn, _dir) = test::open_catalog()?;
        let host = DatabasePeer::create(&conn, test::peer("host", "10.42.0.1"))?;
        let other = DatabasePeer::create(&conn, test::peer("other", "10.42.0.2"))?;
        DatabaseService::create(&conn, &host, test::service("wiki", 8080))?;
        assert!(DatabaseService::create(&conn, &other, test::service("wiki", 9090)).is_err());
        Ok(())
    }
}
