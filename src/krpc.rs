//! KRPC (BEP 5) messages: just the queries the crawler sends, the minimal
//! reply that keeps remote nodes talking to us, and borrowed-slice decoding
//! of whatever arrives on the socket.

use crate::bencode;
use crate::infohash::InfoHash;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// A node learned from a compact `nodes`/`nodes6` payload.
#[derive(Debug, Clone, Copy)]
pub struct Node {
    pub id: [u8; 20],
    pub addr: SocketAddr,
}

pub fn make_find_node(tx: &[u8], id: &[u8; 20], target: &[u8; 20]) -> Vec<u8> {
    make_query(tx, b"find_node", &[(b"id", id), (b"target", target)])
}

pub fn make_get_peers(tx: &[u8], id: &[u8; 20], info_hash: &[u8; 20]) -> Vec<u8> {
    make_query(tx, b"get_peers", &[(b"id", id), (b"info_hash", info_hash)])
}

/// `d1:rd2:id20:<id>e1:t<tx>1:y1:re`: enough for remote nodes to count us
/// as responsive.
pub fn make_reply(tx: &[u8], id: &[u8; 20]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.push(b'd');
    bencode::push_bytes(&mut out, b"r");
    out.push(b'd');
    bencode::push_bytes(&mut out, b"id");
    bencode::push_bytes(&mut out, id);
    out.push(b'e');
    bencode::push_bytes(&mut out, b"t");
    bencode::push_bytes(&mut out, tx);
    bencode::push_bytes(&mut out, b"y");
    bencode::push_bytes(&mut out, b"r");
    out.push(b'e');
    out
}

fn make_query(tx: &[u8], name: &[u8], args: &[(&[u8], &[u8; 20])]) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.push(b'd');
    bencode::push_bytes(&mut out, b"a");
    out.push(b'd');
    for (k, v) in args {
        bencode::push_bytes(&mut out, k);
        bencode::push_bytes(&mut out, *v);
    }
    out.push(b'e');
    bencode::push_bytes(&mut out, b"q");
    bencode::push_bytes(&mut out, name);
    bencode::push_bytes(&mut out, b"t");
    bencode::push_bytes(&mut out, tx);
    bencode::push_bytes(&mut out, b"y");
    bencode::push_bytes(&mut out, b"q");
    out.push(b'e');
    out
}

pub enum Message<'a> {
    Query(Query<'a>),
    Response(Response<'a>),
}

pub struct Query<'a> {
    raw: &'a [u8],
    pub name: &'a [u8],
    pub tx: &'a [u8],
}

pub struct Response<'a> {
    pub tx: &'a [u8],
    body: &'a [u8],
}

pub fn decode(raw: &[u8]) -> Option<Message<'_>> {
    if raw.first() != Some(&b'd') {
        return None;
    }
    let tx = bencode::dict_get_bytes(raw, b"t")?;
    match bencode::dict_get_bytes(raw, b"y")? {
        b"q" => {
            let name = bencode::dict_get_bytes(raw, b"q")?;
            Some(Message::Query(Query { raw, name, tx }))
        }
        b"r" => {
            let body = bencode::dict_get_dict(raw, b"r")?;
            Some(Message::Response(Response { tx, body }))
        }
        _ => None,
    }
}

impl<'a> Query<'a> {
    /// Harvest an announce from `get_peers` / `announce_peer` queries.
    /// Only `announce_peer` carries a usable peer endpoint: the source
    /// address with the announced port (or the source port when
    /// `implied_port` is set).
    pub fn announce(&self, from: SocketAddr) -> Option<(InfoHash, Option<SocketAddr>)> {
        if self.name != b"get_peers" && self.name != b"announce_peer" {
            return None;
        }
        let args = bencode::dict_get_dict(self.raw, b"a")?;
        let hash = InfoHash::from_slice(bencode::dict_get_bytes(args, b"info_hash")?)?;
        if self.name != b"announce_peer" {
            return Some((hash, None));
        }
        let port = if bencode::dict_get_int(args, b"implied_port").unwrap_or(0) != 0 {
            from.port()
        } else {
            u16::try_from(bencode::dict_get_int(args, b"port")?).ok()?
        };
        Some((hash, Some(SocketAddr::new(from.ip(), port))))
    }
}

impl<'a> Response<'a> {
    pub fn tx_pair(&self) -> Option<[u8; 2]> {
        if self.tx.len() != 2 {
            return None;
        }
        Some([self.tx[0], self.tx[1]])
    }

    pub fn nodes(&self) -> Vec<Node> {
        let mut out = Vec::new();
        if let Some(raw) = bencode::dict_get_bytes(self.body, b"nodes") {
            parse_compact_nodes_v4(raw, &mut out);
        }
        if let Some(raw) = bencode::dict_get_bytes(self.body, b"nodes6") {
            parse_compact_nodes_v6(raw, &mut out);
        }
        out
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        let mut out = Vec::new();
        for key in [b"values".as_slice(), b"values6".as_slice()] {
            let Some(items) = bencode::dict_get_list(self.body, key) else {
                continue;
            };
            for item in items {
                if let Some(peer) = bencode::as_bytes(item).and_then(parse_compact_peer) {
                    out.push(peer);
                }
            }
        }
        out
    }
}

/// Compact peer info: 4-byte IPv4 + 2-byte port, or 16-byte IPv6 + 2-byte port.
pub fn parse_compact_peer(bytes: &[u8]) -> Option<SocketAddr> {
    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

// Compact node info: 20-byte node id, then the compact peer form.
fn parse_compact_nodes_v4(raw: &[u8], out: &mut Vec<Node>) {
    for chunk in raw.chunks_exact(26) {
        let mut id = [0u8; 20];
        id.copy_from_slice(&chunk[..20]);
        if let Some(addr) = parse_compact_peer(&chunk[20..]) {
            out.push(Node { id, addr });
        }
    }
}

fn parse_compact_nodes_v6(raw: &[u8], out: &mut Vec<Node>) {
    for chunk in raw.chunks_exact(38) {
        let mut id = [0u8; 20];
        id.copy_from_slice(&chunk[..20]);
        if let Some(addr) = parse_compact_peer(&chunk[20..]) {
            out.push(Node { id, addr });
        }
    }
}
