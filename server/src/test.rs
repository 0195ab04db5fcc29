#![allow(dead_code)]
use crate::{config::Settings, db, wg, Context};
use anyhow::Result;
use driftcove_shared::{Peer, Protocol, Service, Subnet};
use hyper::{header, Body, Request, Response};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::{path::Path, sync::Arc};
use tempfile::TempDir;

pub const API_TOKEN: &str = "test-token";
pub const DEFAULT_SUBNET: &str = "10.128.0.0/9";

/// Settings as a production deployment would load them from the
/// environment, pointed at a throwaway catalog.
pub fn test_settings(dir: &Path) -> Settings {
    Settings {
        db_path: dir.join("driftcove.db"),
        wg_interface: "wgtest".to_string(),
        wg_udp_port: 1194,
        listen_port: 8000,
        api_token: API_TOKEN.to_string(),
        endpoint: "155.155.155.155:1194".to_string(),
        public_key: "dGVzdC1zZXJ2ZXItcHVibGljLWtleS0zMi1ieXRlcyE=".to_string(),
        default_subnet: DEFAULT_SUBNET.parse().unwrap(),
        mtu: 1420,
        preshared_key_seed: wg::generate_preshared_key(),
    }
}

/// A bootstrapped catalog in a temp directory, for db-level tests.
pub fn open_catalog() -> Result<(rusqlite::Connection, TempDir)> {
    let dir = tempfile::tempdir()?;
    let settings = test_settings(dir.path());
    let conn = db::open(&settings)?;
    Ok((conn, dir))
}

pub fn peer(username: &str, address: &str) -> Peer {
    let keys = wg::generate_keys();
    Peer {
        username: username.to_string(),
        public_key: keys.public_key,
        preshared_key: keys.preshared_key,
        address: address.parse().unwrap(),
        services: Default::default(),
        x: 0.0,
        y: 0.0,
        tx: 0,
        rx: 0,
        last_handshake: 0,
    }
}

pub fn subnet(cidr: &str, name: &str) -> Subnet {
    Subnet {
        subnet: cidr.parse().unwrap(),
        name: name.to_string(),
        description: String::new(),
        x: 0.0,
        y: 0.0,
        width: 100.0,
        height: 100.0,
        rgba: 0x00FF0025,
    }
}

pub fn service(name: &str, port: u16) -> Service {
    Service {
        name: name.to_string(),
        department: "eng".to_string(),
        port,
        description: String::new(),
        protocol: Protocol::Both,
    }
}

/// An in-process server: a bootstrapped catalog plus the request plumbing,
/// driven straight through the real router.
pub struct Server {
    pub context: Context,
    // The directory is removed on drop.
    _test_dir: TempDir,
}

impl Server {
    pub fn new() -> Result<Self> {
        let test_dir = tempfile::tempdir()?;
        let settings = test_settings(test_dir.path());
        let conn = db::open(&settings)?;
        let context = Context {
            db: Arc::new(Mutex::new(conn)),
            lock: Arc::new(RwLock::new(())),
            settings: Arc::new(settings),
        };
        Ok(Self {
            context,
            _test_dir: test_dir,
        })
    }

    pub fn context(&self) -> Context {
        self.context.clone()
    }

    pub fn db(&self) -> crate::Db {
        self.context.db.clone()
    }

    /// An authenticated request with no body.
    pub async fn request(&self, method: &str, path: &str) -> Response<Body> {
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {API_TOKEN}"))
            .body(Body::empty())
            .unwrap();
        self.raw_request(req).await
    }

    /// An authenticated request with a JSON body.
    pub async fn form_request<F: Serialize>(
        &self,
        method: &str,
        path: &str,
        form: &F,
    ) -> Response<Body> {
        let body = serde_json::to_string(form).unwrap();
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {API_TOKEN}"))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap();
        self.raw_request(req).await
    }

    pub async fn raw_request(&self, req: Request<Body>) -> Response<Body> {
        crate::http_service(req, self.context()).await.unwrap()
    }

    pub async fn create_subnet(&self, cidr: &str, name: &str) {
        let res = self
            .form_request("POST", "/subnet/create", &subnet(cidr, name))
            .await;
        assert!(res.status().is_success(), "subnet creation failed");
    }
}

pub async fn body_json(res: Response<Body>) -> serde_json::Value {
    let bytes = hyper::body::to_bytes(res.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
