use anyhow::{Context, Error};
use ipnet::Ipv4Net;
use std::{env, fs, net::Ipv4Addr, path::PathBuf, str::FromStr};

/// The server's WireGuard public key is provisioned by wg-quick alongside the
/// interface; without it no client configuration can be rendered.
pub const SERVER_PUBKEY_PATH: &str = "/etc/wireguard/publickey";

/// Process-wide configuration, loaded once from the environment at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Path of the SQLite catalog.
    pub db_path: PathBuf,
    /// Name of the managed WireGuard interface.
    pub wg_interface: String,
    /// UDP port advertised in client configurations.
    pub wg_udp_port: u16,
    /// TCP port the HTTP API listens on.
    pub listen_port: u16,
    /// Bearer token expected in the Authorization header.
    pub api_token: String,
    /// `host:port` clients dial, rendered into the `Endpoint=` line.
    pub endpoint: String,
    /// The server's WireGuard public key (base64).
    pub public_key: String,
    /// The overlay network; also the client `AllowedIPs=` value.
    pub default_subnet: Ipv4Net,
    /// Client-side MTU.
    pub mtu: u16,
    /// Preshared key of the master peer.
    pub preshared_key_seed: String,
}

impl Settings {
    pub fn from_env() -> Result<Self, Error> {
        let public_key = fs::read_to_string(SERVER_PUBKEY_PATH)
            .with_context(|| format!("failed to read server public key from {SERVER_PUBKEY_PATH}"))?
            .trim()
            .to_string();

        let wg_udp_port: u16 = parsed_var("WG_UDP_PORT", 1194)?;
        let endpoint_host = string_var("ENDPOINT", "127.0.0.1");

        Ok(Settings {
            db_path: PathBuf::from(string_var("DB_PATH", "/home/db/driftcove.db")),
            wg_interface: string_var("WG_INTERFACE", "wg0"),
            wg_udp_port,
            listen_port: parsed_var("WG_BACKEND_TCP_PORT", 8000)?,
            api_token: string_var("API_TOKEN", "supersecuretoken"),
            endpoint: format!("{endpoint_host}:{wg_udp_port}"),
            public_key,
            default_subnet: parsed_var("WG_DEFAULT_SUBNET", "10.128.0.0/9".parse()?)?,
            mtu: parsed_var("MTU", 1420)?,
            preshared_key_seed: env::var("PRESHARED_KEY")
                .unwrap_or_else(|_| crate::wg::generate_preshared_key()),
        })
    }

    /// The server's own overlay address: the first host of the default
    /// subnet, which is also the master peer's address.
    pub fn server_address(&self) -> Ipv4Addr {
        self.default_subnet
            .hosts()
            .next()
            .unwrap_or_else(|| self.default_subnet.addr())
    }
}

fn string_var(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed_var<T>(name: &str, default: T) -> Result<T, Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("invalid value for {name}: {value:?}")),
        Err(_) => Ok(default),
    }
}
