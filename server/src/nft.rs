//! Compiler from the policy graph to the `inet dcv` nftables table. This is
//! the only table the service touches.
//!
//! The table carries a fixed skeleton (chains, named sets, static rules)
//! plus dynamic per-subnet sets and rules. NEW-state acceptance happens in
//! `wg_base` (set lookups) and `wg_allow` (per-subnet rules); reply traffic
//! is accepted in `fwd_est` only when the *original* tuple of the flow is
//! covered by one of the permission sets or rules, so revokes bite without
//! a blanket ESTABLISHED accept.
//!
//! nftables deletes rules by handle, not by their text, so every dynamic
//! rule is re-resolved against a listing of its chain before insertion and
//! deletion (`delete_rule_by_match`).

use crate::{config::Settings, ServerError};
use driftcove_shared::Protocol;
use ipnet::Ipv4Net;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::{
    io::Write,
    net::Ipv4Addr,
    process::{Command, Stdio},
};

const NFT_BIN: &str = "nft";
const CONNTRACK_BIN: &str = "conntrack";

static HANDLE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"handle\s+(\d+)").unwrap());

/// The pair sets swept when a peer disappears.
const PAIR_SETS: &[&str] = &["p2p_links", "admin_links", "admin_peer2cidr"];

fn slug(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

pub fn members_set(subnet: &Ipv4Net) -> String {
    format!("subnet_{}_members", slug(&subnet.to_string()))
}

pub fn public_set(subnet: &Ipv4Net) -> String {
    format!("subnet_{}_public", slug(&subnet.to_string()))
}

// ---------- process plumbing ----------

fn nft(args: &[&str]) -> Result<String, ServerError> {
    // Tests exercise everything above this choke point.
    if cfg!(test) {
        return Ok(String::new());
    }
    log::debug!("nft {}", args.join(" "));
    let output = Command::new(NFT_BIN).args(args).output()?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(ServerError::Filter(format!(
            "nft {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Run a single nft command, tolerating failure. Used for adds of objects
/// that may exist and deletes of elements that may be gone.
fn nft_try(cmd: &str) {
    if cfg!(test) {
        return;
    }
    let args: Vec<&str> = cmd.split_whitespace().collect();
    match Command::new(NFT_BIN).args(&args).output() {
        Ok(output) if !output.status.success() => {
            log::debug!(
                "nft (ignored): {cmd} -> {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        },
        Err(err) => log::debug!("nft (ignored): {cmd} -> {err}"),
        _ => {},
    }
}

fn nft_batch(script: &str) -> Result<(), ServerError> {
    if cfg!(test) {
        return Ok(());
    }
    let mut child = Command::new(NFT_BIN)
        .args(["-f", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;
    child
        .stdin
        .take()
        .expect("stdin was piped")
        .write_all(script.as_bytes())?;
    let output = child.wait_with_output()?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        log::error!("nft batch failed: {}\n--- batch ---\n{script}", stderr.trim());
        Err(ServerError::Filter(stderr.trim().to_string()))
    }
}

fn conntrack_try(args: &[&str]) {
    if cfg!(test) {
        return;
    }
    // conntrack exits non-zero when nothing matched; that is not a failure.
    match Command::new(CONNTRACK_BIN).args(args).output() {
        Ok(output) if !output.status.success() => {
            log::debug!(
                "conntrack (ignored): {} -> {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        },
        Err(err) => log::debug!("conntrack (ignored): {} -> {err}", args.join(" ")),
        _ => {},
    }
}

// ---------- conntrack hygiene ----------

/// Drop tracked flows touching the address in either direction, so revoked
/// permissions do not survive as established connections.
pub fn flush_conntrack_ip(address: Ipv4Addr) {
    let address = address.to_string();
    conntrack_try(&["-D", "-s", &address]);
    conntrack_try(&["-D", "-d", &address]);
}

/// CIDR-wide variant. Prefixes wider than /24 are refused unless the
/// caller explicitly forces the flush (cascade subnet deletion does).
pub fn flush_conntrack_net(subnet: &Ipv4Net, force: bool) {
    if !force && subnet.prefix_len() < 24 {
        log::debug!("skipping conntrack flush for wide prefix {subnet}");
        return;
    }
    let subnet = subnet.to_string();
    conntrack_try(&["-D", "-s", &subnet]);
    conntrack_try(&["-D", "-d", &subnet]);
}

// ---------- rule bookkeeping ----------

/// Delete every rule in the chain whose listing matches the pattern. The
/// listing carries handles (`nft -a`); rules can only be deleted by handle.
fn delete_rule_by_match(chain: &str, pattern: &str) -> Result<(), ServerError> {
    let listing = match nft(&["-a", "list", "chain", "inet", "dcv", chain]) {
        Ok(listing) => listing,
        // chain not there yet; nothing to delete
        Err(_) => return Ok(()),
    };
    let re = Regex::new(pattern).map_err(|e| ServerError::Filter(format!("bad rule pattern: {e}")))?;
    for line in listing.lines() {
        if re.is_match(line) {
            if let Some(captures) = HANDLE_REGEX.captures(line) {
                nft_try(&format!("delete rule inet dcv {chain} handle {}", &captures[1]));
            }
        }
    }
    Ok(())
}

/// Insert a dynamic rule at most once: delete any prior occurrence by
/// match, then add.
fn replace_rule(chain: &str, rule: &str) -> Result<(), ServerError> {
    delete_rule_by_match(chain, &regex::escape(rule))?;
    nft_try(&format!("add rule inet dcv {chain} {rule}"));
    Ok(())
}

// ---------- snapshot / restore ----------

pub fn snapshot() -> Result<String, ServerError> {
    match nft(&["list", "table", "inet", "dcv"]) {
        Ok(text) => Ok(text),
        Err(_) => Ok("add table inet dcv\n".to_string()),
    }
}

/// Atomically replace the table with a previous snapshot.
pub fn restore(snapshot: &str) -> Result<(), ServerError> {
    nft_try("delete table inet dcv");
    nft_batch(snapshot)
}

// ---------- static skeleton ----------

/// Tear the table down and rebuild the static skeleton. Dynamic state is
/// gone afterwards; the boot reconciler replays it from the catalog.
pub fn flush(settings: &Settings) -> Result<(), ServerError> {
    nft_try("delete table inet dcv");
    ensure_skeleton(settings)
}

/// Idempotently (re)create the table, named sets, chains and static rules.
pub fn ensure_skeleton(settings: &Settings) -> Result<(), ServerError> {
    let wg_if = &settings.wg_interface;
    let server_ip = settings.server_address();

    nft_try("add table inet dcv");

    // Named sets
    nft_try("add set inet dcv p2p_links { type ipv4_addr . ipv4_addr; flags interval; }");
    nft_try("add set inet dcv admin_links { type ipv4_addr . ipv4_addr; flags interval; }");
    nft_try("add set inet dcv admin_peer2cidr { type ipv4_addr . ipv4_addr; flags interval; }");
    nft_try("add set inet dcv svc_guest_tcp { type ipv4_addr . ipv4_addr . inet_service; flags interval; }");
    nft_try("add set inet dcv svc_guest_udp { type ipv4_addr . ipv4_addr . inet_service; flags interval; }");
    nft_try("add set inet dcv svc_pairs_tcp { type ipv4_addr . ipv4_addr; flags interval; }");
    nft_try("add set inet dcv svc_pairs_udp { type ipv4_addr . ipv4_addr; flags interval; }");
    nft_try("add set inet dcv blocked_pairs { type ipv4_addr . ipv4_addr; flags interval; }");

    // Chains
    nft_try("add chain inet dcv input { type filter hook input priority 0; policy accept; }");
    nft_try("add chain inet dcv forward { type filter hook forward priority 0; policy accept; }");
    nft_try("add chain inet dcv fwd_est");
    nft_try("add chain inet dcv wg");
    nft_try("add chain inet dcv wg_base");
    nft_try("add chain inet dcv wg_allow");

    // INPUT: established replies plus ping of the server itself
    nft_try("flush chain inet dcv input");
    nft_try("add rule inet dcv input ct state established,related accept");
    nft_try(&format!(
        "add rule inet dcv input iifname \"{wg_if}\" ip daddr {server_ip} icmp type echo-request accept"
    ));

    // FORWARD: panic drop, then constrained EST acceptance, then steer
    // overlay traffic into the wg pipeline
    nft_try("flush chain inet dcv forward");
    nft_try("add rule inet dcv forward ip saddr . ip daddr @blocked_pairs drop");
    nft_try("add rule inet dcv forward jump fwd_est");
    nft_try(&format!("add rule inet dcv forward iifname \"{wg_if}\" goto wg"));
    nft_try(&format!("add rule inet dcv forward oifname \"{wg_if}\" goto wg"));

    // EST acceptance keyed on the original tuple of the flow
    nft_try("flush chain inet dcv fwd_est");
    nft_try("add rule inet dcv fwd_est ct state established,related ct original ip saddr . ct original ip daddr @admin_peer2cidr accept");
    nft_try("add rule inet dcv fwd_est ct state established,related ct original ip saddr . ct original ip daddr @admin_links accept");
    nft_try("add rule inet dcv fwd_est ct state established,related ct original ip saddr . ct original ip daddr @p2p_links accept");
    nft_try("add rule inet dcv fwd_est ct state established,related meta l4proto tcp ct original ip saddr . ct original ip daddr @svc_pairs_tcp accept");
    nft_try("add rule inet dcv fwd_est ct state established,related meta l4proto udp ct original ip saddr . ct original ip daddr @svc_pairs_udp accept");

    // WG pipeline
    nft_try("flush chain inet dcv wg");
    nft_try("add rule inet dcv wg jump wg_base");
    nft_try("add rule inet dcv wg jump wg_allow");
    nft_try("add rule inet dcv wg counter reject with icmpx type admin-prohibited");

    // NEW acceptance, set-based
    nft_try("flush chain inet dcv wg_base");
    nft_try("add rule inet dcv wg_base ip saddr . ip daddr @admin_peer2cidr ct state new accept");
    nft_try("add rule inet dcv wg_base ip saddr . ip daddr @admin_links ct state new accept");
    nft_try("add rule inet dcv wg_base ip saddr . ip daddr @p2p_links ct state new accept");
    nft_try("add rule inet dcv wg_base meta l4proto tcp ip saddr . ip daddr . th dport @svc_guest_tcp ct state new accept");
    nft_try("add rule inet dcv wg_base meta l4proto udp ip saddr . ip daddr . th dport @svc_guest_udp ct state new accept");

    // NEW acceptance, rule-based; repopulated dynamically
    nft_try("flush chain inet dcv wg_allow");

    Ok(())
}

// ---------- per-subnet sets and rules ----------

/// Create the subnet's member/public sets and the members -> public rule
/// pair (NEW in `wg_allow`, EST twin in `fwd_est`).
pub fn ensure_subnet(subnet: &Ipv4Net) -> Result<(), ServerError> {
    let members = members_set(subnet);
    let public = public_set(subnet);

    nft_try(&format!("add set inet dcv {members} {{ type ipv4_addr; flags interval; }}"));
    nft_try(&format!("add set inet dcv {public} {{ type ipv4_addr; flags interval; }}"));

    replace_rule(
        "wg_allow",
        &format!("ip saddr @{members} ip daddr @{public} ct state new accept"),
    )?;
    replace_rule(
        "fwd_est",
        &format!(
            "ct state established,related ct original ip saddr @{members} ct original ip daddr @{public} accept"
        ),
    )
}

/// Remove every rule referencing the subnet's sets, then the sets
/// themselves. `purge_addr_space` forces a CIDR-wide conntrack flush.
pub fn destroy_subnet(subnet: &Ipv4Net, purge_addr_space: bool) -> Result<(), ServerError> {
    let members = members_set(subnet);
    let public = public_set(subnet);
    let pattern = format!(r"@{members}\b|@{public}\b");

    delete_rule_by_match("wg_allow", &pattern)?;
    delete_rule_by_match("fwd_est", &pattern)?;
    nft_try(&format!("delete set inet dcv {members}"));
    nft_try(&format!("delete set inet dcv {public}"));

    flush_conntrack_net(subnet, purge_addr_space);
    Ok(())
}

pub fn add_member(subnet: &Ipv4Net, address: Ipv4Addr) {
    nft_try(&format!(
        "add element inet dcv {} {{ {address} }}",
        members_set(subnet)
    ));
}

pub fn del_member(subnet: &Ipv4Net, address: Ipv4Addr) {
    nft_try(&format!(
        "delete element inet dcv {} {{ {address} }}",
        members_set(subnet)
    ));
    flush_conntrack_ip(address);
}

pub fn make_public(subnet: &Ipv4Net, address: Ipv4Addr) {
    nft_try(&format!(
        "add element inet dcv {} {{ {address} }}",
        public_set(subnet)
    ));
}

pub fn revoke_public(subnet: &Ipv4Net, address: Ipv4Addr) {
    nft_try(&format!(
        "delete element inet dcv {} {{ {address} }}",
        public_set(subnet)
    ));
    flush_conntrack_ip(address);
}

// ---------- peer <-> peer ----------

/// Both ordered tuples go in, so either side may initiate.
pub fn add_p2p(a: Ipv4Addr, b: Ipv4Addr) {
    nft_try(&format!("add element inet dcv p2p_links {{ {a} . {b} }}"));
    nft_try(&format!("add element inet dcv p2p_links {{ {b} . {a} }}"));
}

pub fn remove_p2p(a: Ipv4Addr, b: Ipv4Addr) {
    nft_try(&format!("delete element inet dcv p2p_links {{ {a} . {b} }}"));
    nft_try(&format!("delete element inet dcv p2p_links {{ {b} . {a} }}"));
    flush_conntrack_ip(a);
}

// ---------- peer -> service ----------

fn service_sets(protocol: Protocol) -> &'static [(&'static str, &'static str)] {
    match protocol {
        Protocol::Tcp => &[("svc_guest_tcp", "svc_pairs_tcp")],
        Protocol::Udp => &[("svc_guest_udp", "svc_pairs_udp")],
        Protocol::Both => &[
            ("svc_guest_tcp", "svc_pairs_tcp"),
            ("svc_guest_udp", "svc_pairs_udp"),
        ],
    }
}

pub fn grant_service(src: Ipv4Addr, dst: Ipv4Addr, port: u16, protocol: Protocol) {
    for (guest, pairs) in service_sets(protocol) {
        nft_try(&format!("add element inet dcv {guest} {{ {src} . {dst} . {port} }}"));
        // port-agnostic EST acceptance for replies of that pair
        nft_try(&format!("add element inet dcv {pairs} {{ {src} . {dst} }}"));
    }
}

pub fn revoke_service(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    port: u16,
    protocol: Protocol,
) -> Result<(), ServerError> {
    for (guest, pairs) in service_sets(protocol) {
        nft_try(&format!("delete element inet dcv {guest} {{ {src} . {dst} . {port} }}"));
        // the EST pair entry stays while any other port is still granted
        if !pair_has_other_ports(guest, src, dst)? {
            nft_try(&format!("delete element inet dcv {pairs} {{ {src} . {dst} }}"));
        }
    }
    flush_conntrack_ip(src);
    Ok(())
}

fn pair_has_other_ports(guest_set: &str, src: Ipv4Addr, dst: Ipv4Addr) -> Result<bool, ServerError> {
    let listing = match nft(&["-j", "list", "set", "inet", "dcv", guest_set]) {
        Ok(listing) if !listing.is_empty() => listing,
        _ => return Ok(false),
    };
    let doc: Value = serde_json::from_str(&listing)?;
    let src = src.to_string();
    let dst = dst.to_string();
    for object in doc.get("nftables").and_then(Value::as_array).into_iter().flatten() {
        let elements = object
            .get("set")
            .and_then(|set| set.get("elem"))
            .and_then(Value::as_array);
        for element in elements.into_iter().flatten() {
            if let Some(tuple) = concat_tuple(element) {
                if tuple.len() == 3 && tuple[0] == src && tuple[1] == dst {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

// ---------- subnet -> service (rule-based: the source is a set) ----------

pub fn grant_subnet_service(
    subnet: &Ipv4Net,
    dst: Ipv4Addr,
    port: u16,
    protocol: Protocol,
) -> Result<(), ServerError> {
    let members = members_set(subnet);
    for l4 in protocol.l4_names() {
        replace_rule(
            "wg_allow",
            &format!("ip saddr @{members} ip daddr {dst} {l4} dport {port} ct state new accept"),
        )?;
    }
    replace_rule(
        "fwd_est",
        &format!(
            "ct state established,related ct original ip saddr @{members} ct original ip daddr {dst} accept"
        ),
    )
}

pub fn revoke_subnet_service(
    subnet: &Ipv4Net,
    dst: Ipv4Addr,
    port: u16,
    protocol: Protocol,
) -> Result<(), ServerError> {
    let members = members_set(subnet);
    for l4 in protocol.l4_names() {
        delete_rule_by_match(
            "wg_allow",
            &regex::escape(&format!(
                "ip saddr @{members} ip daddr {dst} {l4} dport {port} ct state new accept"
            )),
        )?;
    }
    delete_rule_by_match(
        "fwd_est",
        &regex::escape(&format!(
            "ct original ip saddr @{members} ct original ip daddr {dst} accept"
        )),
    )?;
    flush_conntrack_net(subnet, false);
    Ok(())
}

// ---------- subnet <-> subnet (public cross-link) ----------

fn connect_subnet_to_subnet_public(src: &Ipv4Net, dst: &Ipv4Net) -> Result<(), ServerError> {
    let src_members = members_set(src);
    let dst_public = public_set(dst);
    replace_rule(
        "wg_allow",
        &format!("ip saddr @{src_members} ip daddr @{dst_public} ct state new accept"),
    )?;
    replace_rule(
        "fwd_est",
        &format!(
            "ct state established,related ct original ip saddr @{src_members} ct original ip daddr @{dst_public} accept"
        ),
    )
}

fn disconnect_subnet_from_subnet_public(src: &Ipv4Net, dst: &Ipv4Net) -> Result<(), ServerError> {
    let src_members = members_set(src);
    let dst_public = public_set(dst);
    delete_rule_by_match(
        "wg_allow",
        &regex::escape(&format!(
            "ip saddr @{src_members} ip daddr @{dst_public} ct state new accept"
        )),
    )?;
    delete_rule_by_match(
        "fwd_est",
        &regex::escape(&format!(
            "ct original ip saddr @{src_members} ct original ip daddr @{dst_public} accept"
        )),
    )
}

/// Members of each side may initiate to the public peers of the other.
pub fn connect_subnets_public(a: &Ipv4Net, b: &Ipv4Net) -> Result<(), ServerError> {
    connect_subnet_to_subnet_public(a, b)?;
    connect_subnet_to_subnet_public(b, a)
}

pub fn disconnect_subnets_public(a: &Ipv4Net, b: &Ipv4Net) -> Result<(), ServerError> {
    disconnect_subnet_from_subnet_public(a, b)?;
    disconnect_subnet_from_subnet_public(b, a)?;
    flush_conntrack_net(a, false);
    flush_conntrack_net(b, false);
    Ok(())
}

// ---------- admin grants ----------

pub fn grant_admin_peer_to_peer(src: Ipv4Addr, dst: Ipv4Addr) {
    nft_try(&format!("add element inet dcv admin_links {{ {src} . {dst} }}"));
}

pub fn revoke_admin_peer_to_peer(src: Ipv4Addr, dst: Ipv4Addr) {
    nft_try(&format!("delete element inet dcv admin_links {{ {src} . {dst} }}"));
    flush_conntrack_ip(src);
}

pub fn grant_admin_peer_to_subnet(src: Ipv4Addr, dst: &Ipv4Net) {
    nft_try(&format!("add element inet dcv admin_peer2cidr {{ {src} . {dst} }}"));
}

pub fn revoke_admin_peer_to_subnet(src: Ipv4Addr, dst: &Ipv4Net) {
    nft_try(&format!("delete element inet dcv admin_peer2cidr {{ {src} . {dst} }}"));
    flush_conntrack_ip(src);
}

/// Every member of the admin subnet may initiate to every member of the
/// target, public flags notwithstanding.
pub fn grant_admin_subnet_to_subnet(src: &Ipv4Net, dst: &Ipv4Net) -> Result<(), ServerError> {
    let src_members = members_set(src);
    let dst_members = members_set(dst);
    replace_rule(
        "wg_allow",
        &format!("ip saddr @{src_members} ip daddr @{dst_members} ct state new accept"),
    )?;
    replace_rule(
        "fwd_est",
        &format!(
            "ct state established,related ct original ip saddr @{src_members} ct original ip daddr @{dst_members} accept"
        ),
    )
}

pub fn revoke_admin_subnet_to_subnet(src: &Ipv4Net, dst: &Ipv4Net) -> Result<(), ServerError> {
    let src_members = members_set(src);
    let dst_members = members_set(dst);
    delete_rule_by_match(
        "wg_allow",
        &regex::escape(&format!(
            "ip saddr @{src_members} ip daddr @{dst_members} ct state new accept"
        )),
    )?;
    delete_rule_by_match(
        "fwd_est",
        &regex::escape(&format!(
            "ct original ip saddr @{src_members} ct original ip daddr @{dst_members} accept"
        )),
    )?;
    flush_conntrack_net(src, false);
    Ok(())
}

// ---------- residual sweep ----------

/// Remove every tuple mentioning the address from the pair sets. Used as
/// the final sweep of peer deletion, after the per-link revokes.
pub fn purge_pair_sets_for_ip(address: Ipv4Addr) -> Result<(), ServerError> {
    for set in PAIR_SETS {
        purge_set_for_ip(set, address)?;
    }
    Ok(())
}

fn purge_set_for_ip(set: &str, address: Ipv4Addr) -> Result<(), ServerError> {
    let listing = match nft(&["-j", "list", "set", "inet", "dcv", set]) {
        Ok(listing) if !listing.is_empty() => listing,
        _ => return Ok(()),
    };
    let doc: Value = serde_json::from_str(&listing)?;
    let needle = address.to_string();
    for object in doc.get("nftables").and_then(Value::as_array).into_iter().flatten() {
        let elements = object
            .get("set")
            .and_then(|set| set.get("elem"))
            .and_then(Value::as_array);
        for element in elements.into_iter().flatten() {
            let Some(tuple) = concat_tuple(element) else {
                continue;
            };
            if tuple.iter().any(|part| part == &needle) {
                nft_try(&format!(
                    "delete element inet dcv {set} {{ {} }}",
                    tuple.join(" . ")
                ));
            }
        }
    }
    Ok(())
}

/// Flatten a set element from `nft -j` into printable tuple parts.
/// Elements may be wrapped in an `elem` object when they carry metadata.
fn concat_tuple(element: &Value) -> Option<Vec<String>> {
    let concat = element
        .get("concat")
        .or_else(|| element.get("elem").and_then(|e| e.get("concat")))?
        .as_array()?;
    concat.iter().map(elem_text).collect()
}

fn elem_text(value: &Value) -> Option<String> {
    if let Some(text) = value.as_str() {
        return Some(text.to_string());
    }
    if let Some(number) = value.as_u64() {
        return Some(number.to_string());
    }
    // CIDR elements print as { "prefix": { "addr": ..., "len": ... } }
    let prefix = value.get("prefix")?;
    let addr = prefix.get("addr")?.as_str()?;
    let len = prefix.get("len")?.as_u64()?;
    Some(format!("{addr}/{len}"))
}
