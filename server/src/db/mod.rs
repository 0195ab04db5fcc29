pub mod link;
pub mod peer;
pub mod service;
pub mod subnet;

pub use peer::DatabasePeer;
pub use service::DatabaseService;
pub use subnet::DatabaseSubnet;

use crate::{config::Settings, ServerError};
use rusqlite::{params, Connection};

pub fn open(settings: &Settings) -> Result<Connection, ServerError> {
    let conn = Connection::open(&settings.db_path)?;
    init(&conn, settings)?;
    Ok(conn)
}

pub fn init(conn: &Connection, settings: &Settings) -> Result<(), ServerError> {
    // Foreign key constraints aren't on in SQLite by default. Enable.
    conn.pragma_update(None, "foreign_keys", 1)?;
    // journal_mode answers with the resulting mode as a row.
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;

    conn.execute_batch(peer::CREATE_TABLE_SQL)?;
    conn.execute_batch(subnet::CREATE_TABLE_SQL)?;
    conn.execute_batch(service::CREATE_TABLE_SQL)?;
    conn.execute_batch(link::CREATE_TABLE_SQL)?;

    seed(conn, settings)
}

/// Seed the default subnet and the master peer: the server itself, living on
/// the first host address of the default subnet with the interface's own
/// public key, public inside the default subnet.
fn seed(conn: &Connection, settings: &Settings) -> Result<(), ServerError> {
    conn.execute(
        "INSERT OR IGNORE INTO subnets (subnet, name, description) VALUES (?1, ?2, ?3)",
        params![
            settings.default_subnet.to_string(),
            "Wireguard Subnet",
            "Default subnet of the overlay network.",
        ],
    )?;

    let master_exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM peers WHERE username = 'master'",
        [],
        |row| row.get(0),
    )?;
    if master_exists == 0 {
        conn.execute(
            "INSERT INTO peers (username, address, public_key, preshared_key)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                "master",
                settings.server_address().to_string(),
                settings.public_key,
                settings.preshared_key_seed,
            ],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO peers_subnets (peer_id, subnet)
                SELECT id, ?1 FROM peers WHERE username = 'master'",
            params![settings.default_subnet.to_string()],
        )?;
    }
    Ok(())
}

/// Wipe every entity and link; used by topology uploads before a rebuild.
pub fn clear(conn: &Connection) -> Result<(), ServerError> {
    for table in [
        "peers_subnets",
        "peers_peers",
        "peers_services",
        "subnets_subnets",
        "subnets_services",
        "admin_peers_peers",
        "admin_peers_subnets",
        "admin_subnets_subnets",
        "services",
        "peers",
        "subnets",
    ] {
        conn.execute(&format!("DELETE FROM {table}"), [])?;
    }
    Ok(())
}
