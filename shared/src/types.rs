use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, net::Ipv4Addr, str::FromStr};

/// A WireGuard client: a keypair plus an overlay IPv4 address, with the
/// services it hosts and its position on the operator's canvas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub username: String,
    pub public_key: String,
    pub preshared_key: String,
    pub address: Ipv4Addr,
    /// Hosted services, keyed by service name.
    #[serde(default)]
    pub services: HashMap<String, Service>,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    /// Live interface counters; zero until populated from the interface.
    #[serde(default)]
    pub tx: u64,
    #[serde(default)]
    pub rx: u64,
    /// UNIX time of the latest handshake, -1 when the peer never handshaked.
    #[serde(default)]
    pub last_handshake: i64,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.username, self.address)
    }
}

/// A named CIDR grouping peers, also a policy scope. Geometry fields are
/// display-only state for the operator frontend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub subnet: Ipv4Net,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default = "default_dimension")]
    pub width: f64,
    #[serde(default = "default_dimension")]
    pub height: f64,
    #[serde(default = "default_rgba")]
    pub rgba: u32,
}

fn default_dimension() -> f64 {
    100.0
}

fn default_rgba() -> u32 {
    0x00FF0025
}

impl Subnet {
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.subnet.contains(&address)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.subnet)
    }
}

/// Transport protocols a service accepts connections over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    #[default]
    Both,
}

impl Protocol {
    /// The l4proto names this protocol expands to in filter rules.
    pub fn l4_names(&self) -> &'static [&'static str] {
        match self {
            Protocol::Tcp => &["tcp"],
            Protocol::Udp => &["udp"],
            Protocol::Both => &["tcp", "udp"],
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "both" => Ok(Protocol::Both),
            _ => Err(format!("unknown protocol {s:?}, expected tcp, udp or both")),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Both => "both",
        })
    }
}

/// A host:port bound to a peer, the target of consume-grants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub department: String,
    pub port: u16,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub protocol: Protocol,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

/// The full declarative graph: every entity plus one named map per link
/// kind. Maps are keyed by the natural key of the source entity (peer
/// address, subnet CIDR or service name).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub subnets: HashMap<String, Subnet>,
    #[serde(default)]
    pub peers: HashMap<String, Peer>,
    #[serde(default)]
    pub services: HashMap<String, Service>,
    /// Subnet CIDR -> peers whose address falls inside it.
    #[serde(default)]
    pub network: HashMap<String, Vec<Peer>>,
    /// Service name -> peers allowed to consume it.
    #[serde(default)]
    pub service_links: HashMap<String, Vec<Peer>>,
    /// Peer address -> peers it holds a symmetric p2p link with.
    #[serde(default)]
    pub p2p_links: HashMap<String, Vec<Peer>>,
    /// Subnet CIDR -> peers holding the public flag inside it.
    #[serde(default)]
    pub subnet_links: HashMap<String, Vec<Peer>>,
    /// Subnet CIDR -> subnets it is publicly linked with.
    #[serde(default)]
    pub subnet_to_subnet_links: HashMap<String, Vec<Subnet>>,
    /// Subnet CIDR -> services every member may consume.
    #[serde(default)]
    pub subnet_to_service_links: HashMap<String, Vec<Service>>,
    /// Admin peer address -> peers it may reach regardless of public flags.
    #[serde(default)]
    pub admin_peer_to_peer_links: HashMap<String, Vec<Peer>>,
    /// Admin peer address -> subnets it may reach wholesale.
    #[serde(default)]
    pub admin_peer_to_subnet_links: HashMap<String, Vec<Subnet>>,
    /// Admin subnet CIDR -> subnets its members may reach wholesale.
    #[serde(default)]
    pub admin_subnet_to_subnet_links: HashMap<String, Vec<Subnet>>,
}
