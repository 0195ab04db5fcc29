use crate::ServerError;
use driftcove_shared::{Peer, Subnet};
use ipnet::Ipv4Net;
use rusqlite::{params, Connection, OptionalExtension};
use std::{
    net::Ipv4Addr,
    ops::{Deref, DerefMut},
};

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS subnets (
      subnet      TEXT PRIMARY KEY,           /* Canonical CIDR notation.           */
      name        TEXT NOT NULL UNIQUE,
      description TEXT DEFAULT '' NOT NULL,
      x           REAL DEFAULT 0 NOT NULL,    /* Canvas geometry for the frontend.  */
      y           REAL DEFAULT 0 NOT NULL,
      width       REAL DEFAULT 100 NOT NULL,
      height      REAL DEFAULT 100 NOT NULL,
      rgba        INTEGER DEFAULT 16711717 NOT NULL
    )";

#[derive(Debug)]
pub struct DatabaseSubnet {
    pub inner: Subnet,
}

impl From<Subnet> for DatabaseSubnet {
    fn from(inner: Subnet) -> Self {
        Self { inner }
    }
}

impl Deref for DatabaseSubnet {
    type Target = Subnet;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for DatabaseSubnet {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl DatabaseSubnet {
    pub fn create(conn: &Connection, subnet: Subnet) -> Result<Self, ServerError> {
        log::info!("creating subnet {subnet}");
        conn.execute(
            "INSERT INTO subnets (subnet, name, description, x, y, width, height, rgba)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                subnet.subnet.to_string(),
                subnet.name,
                subnet.description,
                subnet.x,
                subnet.y,
                subnet.width,
                subnet.height,
                subnet.rgba,
            ],
        )?;
        Ok(subnet.into())
    }

    pub fn delete(conn: &Connection, subnet: &Subnet) -> Result<(), ServerError> {
        match conn.execute(
            "DELETE FROM subnets WHERE subnet = ?1",
            params![subnet.subnet.to_string()],
        )? {
            0 => Err(ServerError::NotFound("Subnet not found".to_string())),
            _ => Ok(()),
        }
    }

    pub fn update_geometry(&mut self, conn: &Connection, like: &Subnet) -> Result<(), ServerError> {
        conn.execute(
            "UPDATE subnets SET x = ?1, y = ?2, width = ?3, height = ?4, rgba = ?5
             WHERE subnet = ?6",
            params![
                like.x,
                like.y,
                like.width,
                like.height,
                like.rgba,
                self.subnet.to_string(),
            ],
        )?;
        self.inner.x = like.x;
        self.inner.y = like.y;
        self.inner.width = like.width;
        self.inner.height = like.height;
        self.inner.rgba = like.rgba;
        Ok(())
    }

    pub(crate) fn from_row(row: &rusqlite::Row) -> Result<Subnet, rusqlite::Error> {
        let subnet: Ipv4Net = row
            .get::<_, String>(0)?
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        Ok(Subnet {
            subnet,
            name: row.get(1)?,
            description: row.get(2)?,
            x: row.get(3)?,
            y: row.get(4)?,
            width: row.get(5)?,
            height: row.get(6)?,
            rgba: row.get(7)?,
        })
    }

    pub fn get(conn: &Connection, cidr: &Ipv4Net) -> Result<Option<Self>, ServerError> {
        Ok(conn
            .query_row(
                "SELECT subnet, name, description, x, y, width, height, rgba
                 FROM subnets WHERE subnet = ?1",
                params![cidr.to_string()],
                Self::from_row,
            )
            .optional()?
            .map(Into::into))
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT subnet, name, description, x, y, width, height, rgba FROM subnets",
        )?;
        let subnets = stmt
            .query_map(params![], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(subnets.into_iter().map(Into::into).collect())
    }

    /// Every subnet whose CIDR contains the address.
    pub fn containing(conn: &Connection, address: Ipv4Addr) -> Result<Vec<Self>, ServerError> {
        Ok(Self::list(conn)?
            .into_iter()
            .filter(|subnet| subnet.contains(address))
            .collect())
    }

    /// The tightest subnet containing the peer's address: longest prefix
    /// wins, stable among equals.
    pub fn primary_for(conn: &Connection, peer: &Peer) -> Result<Option<Self>, ServerError> {
        Ok(Self::containing(conn, peer.address)?
            .into_iter()
            .max_by_key(|subnet| subnet.subnet.prefix_len()))
    }
}
