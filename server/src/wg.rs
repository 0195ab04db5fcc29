//! Driver for the live WireGuard interface. All mutations go through the
//! `wg`/`wg-quick` binaries; key material is generated in-process and
//! secrets are handed over via throwaway files, never on argv.

use crate::{config::Settings, ServerError};
use base64::prelude::*;
use driftcove_shared::Peer;
use std::{io::Write, process::Command};
use tempfile::NamedTempFile;
use x25519_dalek::{PublicKey, StaticSecret};

pub struct Keys {
    pub private_key: String,
    pub public_key: String,
    pub preshared_key: String,
}

/// A fresh keypair plus preshared key, base64-encoded the way the
/// WireGuard tools print them.
pub fn generate_keys() -> Keys {
    let secret = StaticSecret::random();
    let public = PublicKey::from(&secret);
    Keys {
        private_key: BASE64_STANDARD.encode(secret.to_bytes()),
        public_key: BASE64_STANDARD.encode(public.as_bytes()),
        preshared_key: generate_preshared_key(),
    }
}

pub fn generate_preshared_key() -> String {
    BASE64_STANDARD.encode(rand::random::<[u8; 32]>())
}

fn run(bin: &str, args: &[&str]) -> Result<String, ServerError> {
    // Tests exercise the orchestration above this choke point; the real
    // binaries only run outside the test build.
    if cfg!(test) {
        return Ok(String::new());
    }
    log::debug!("cmd: {} {}", bin, args.join(" "));
    let output = Command::new(bin).args(args).output()?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(ServerError::WireGuard(format!(
            "{} {}: {}",
            bin,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Install or refresh the interface entry for a peer: keyed by public key,
/// preshared key via file, allowed-ips pinned to the peer's /32.
pub fn apply_peer(settings: &Settings, peer: &Peer) -> Result<(), ServerError> {
    let mut psk_file = NamedTempFile::new()?;
    psk_file.write_all(peer.preshared_key.as_bytes())?;
    psk_file.flush()?;
    let psk_path = psk_file.path().display().to_string();
    let allowed_ips = format!("{}/32", peer.address);
    run(
        "wg",
        &[
            "set",
            &settings.wg_interface,
            "peer",
            &peer.public_key,
            "preshared-key",
            &psk_path,
            "allowed-ips",
            &allowed_ips,
        ],
    )?;
    Ok(())
}

pub fn remove_peer(settings: &Settings, peer: &Peer) -> Result<(), ServerError> {
    run(
        "wg",
        &["set", &settings.wg_interface, "peer", &peer.public_key, "remove"],
    )?;
    Ok(())
}

/// Remove every peer currently present on the interface.
pub fn flush(settings: &Settings) -> Result<(), ServerError> {
    let listed = run("wg", &["show", &settings.wg_interface, "peers"])?;
    for public_key in listed.split_whitespace() {
        run(
            "wg",
            &["set", &settings.wg_interface, "peer", public_key, "remove"],
        )?;
    }
    Ok(())
}

/// Opaque text of the running configuration, suitable for [`restore_config`].
pub fn snapshot_config(settings: &Settings) -> Result<String, ServerError> {
    run("wg", &["showconf", &settings.wg_interface])
}

/// Replace the running configuration with a previous snapshot and cycle the
/// interface to shed any half-applied state.
pub fn restore_config(settings: &Settings, config: &str) -> Result<(), ServerError> {
    let mut config_file = NamedTempFile::new()?;
    config_file.write_all(config.as_bytes())?;
    config_file.flush()?;
    let path = config_file.path().display().to_string();
    run("wg", &["setconf", &settings.wg_interface, &path])?;
    cycle_interface(settings)
}

/// Bounce the interface: down is best-effort, up must succeed.
pub fn cycle_interface(settings: &Settings) -> Result<(), ServerError> {
    run("wg-quick", &["down", &settings.wg_interface]).ok();
    run("wg-quick", &["up", &settings.wg_interface])?;
    Ok(())
}

/// Route the default subnet over the managed interface.
pub fn apply_ip_route(settings: &Settings) -> Result<(), ServerError> {
    let subnet = settings.default_subnet.to_string();
    run(
        "ip",
        &["route", "replace", &subnet, "dev", &settings.wg_interface],
    )?;
    Ok(())
}

/// Client-side configuration text for a peer, rendered around a private key
/// that is never persisted server-side.
pub fn generate_config_text(settings: &Settings, peer: &Peer, private_key: &str) -> String {
    format!(
        "[Interface]\n\
         PrivateKey = {private_key}\n\
         Address = {address}\n\
         MTU = {mtu}\n\
         \n\
         [Peer]\n\
         PublicKey = {public_key}\n\
         PresharedKey = {preshared_key}\n\
         Endpoint = {endpoint}\n\
         AllowedIPs = {allowed_ips}\n\
         PersistentKeepalive = 15\n",
        address = peer.address,
        mtu = settings.mtu,
        public_key = settings.public_key,
        preshared_key = peer.preshared_key,
        endpoint = settings.endpoint,
        allowed_ips = settings.default_subnet,
    )
}

/// Populate live transfer counters and the latest-handshake stamp; a peer
/// that never handshaked reports -1.
pub fn peer_stats(settings: &Settings, peer: &mut Peer) -> Result<(), ServerError> {
    let transfer = run("wg", &["show", &settings.wg_interface, "transfer"])?;
    for line in transfer.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if let [public_key, rx, tx] = fields.as_slice() {
            if *public_key == peer.public_key {
                peer.rx = rx.parse().unwrap_or(0);
                peer.tx = tx.parse().unwrap_or(0);
            }
        }
    }

    let handshakes = run("wg", &["show", &settings.wg_interface, "latest-handshakes"])?;
    for line in handshakes.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if let [public_key, stamp] = fields.as_slice() {
            if *public_key == peer.public_key {
                peer.last_handshake = stamp.parse().unwrap_or(0);
                if peer.last_handshake == 0 {
                    peer.last_handshake = -1;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn generated_keys_are_wireguard_shaped() {
        let keys = generate_keys();
        for key in [&keys.private_key, &keys.public_key, &keys.preshared_key] {
            let decoded = BASE64_STANDARD.decode(key).unwrap();
            assert_eq!(decoded.len(), 32);
        }
        // the public key is a pure function of the private key
        let secret_bytes: [u8; 32] = BASE64_STANDARD
            .decode(&keys.private_key)
            .unwrap()
            .try_into()
            .unwrap();
        let rederived = PublicKey::from(&StaticSecret::from(secret_bytes));
        assert_eq!(keys.public_key, BASE64_STANDARD.encode(rederived.as_bytes()));
    }

    #[test]
    fn distinct_keys_every_time() {
        let a = generate_keys();
        let b = generate_keys();
        assert_ne!(a.private_key, b.private_key);
        assert_ne!(a.preshared_key, b.preshared_key);
    }

    #[test]
    fn config_text_contains_the_contract() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test::test_settings(dir.path());
        let peer = test::peer("alice", "10.128.0.7");
        let text = generate_config_text(&settings, &peer, "PRIVATE");

        assert!(text.starts_with("[Interface]\n"));
        assert!(text.contains("PrivateKey = PRIVATE\n"));
        assert!(text.contains("Address = 10.128.0.7\n"));
        assert!(text.contains(&format!("MTU = {}\n", settings.mtu)));
        assert!(text.contains(&format!("PublicKey = {}\n", settings.public_key)));
        assert!(text.contains(&format!("Endpoint = {}\n", settings.endpoint)));
        assert!(text.contains(&format!("AllowedIPs = {}\n", settings.default_subnet)));
        assert!(text.contains("PersistentKeepalive = 15\n"));
    }
}
