//! DNS responder for the mesh namespace.
//!
//! This module implements a small authoritative DNS server using the
//! [hickory-dns](https://crates.io/crates/hickory-server) library.  It
//! answers `A`/`AAAA` queries for `<hostname>.<namespace>` straight from
//! the record store:
//!
//! * **Names inside the namespace** resolve to the winning record's
//!   address, or `NXDOMAIN` if no node publishes the hostname.
//! * **Anything else** is `REFUSED`; this server does not recurse.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::{Header, ResponseCode};
use hickory_server::proto::rr::rdata::{A, AAAA};
use hickory_server::proto::rr::{Name, RData, Record, RecordType};
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo, ServerFuture};
use log::{error, info};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::time::Duration;

use crate::node::Node;
use crate::store::RecordStore;

/// Timeout for idle TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Records change whenever gossip says so; keep caches short.
const TTL: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found(IpAddr),
    NxDomain,
    Refused,
}

/// Resolve `qname` (with or without the trailing dot) against `store`.
pub fn lookup(store: &RecordStore, qname: &str) -> Lookup {
    let qname = qname.trim_end_matches('.').to_ascii_lowercase();
    let suffix = format!(".{}", store.namespace().to_ascii_lowercase());
    let Some(label) = qname.strip_suffix(&suffix) else {
        return Lookup::Refused;
    };
    if label.contains('.') {
        return Lookup::NxDomain;
    }
    match store.get(label).and_then(|r| r.address.parse().ok()) {
        Some(ip) => Lookup::Found(ip),
        None => Lookup::NxDomain,
    }
}

/// Serve DNS on `bind_addr` until `shutdown` fires.
pub async fn run_dns_server(
    bind_addr: SocketAddr,
    node: Arc<Node>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!("DNS server starting on {}", bind_addr);

    let mut server = ServerFuture::new(MeshDns { node });

    let udp = UdpSocket::bind(bind_addr).await?;
    server.register_socket(udp);

    let tcp = TcpListener::bind(bind_addr).await?;
    server.register_listener(tcp, TCP_TIMEOUT);

    tokio::select! {
        res = server.block_until_done() => res?,
        _ = shutdown.changed() => info!("DNS server shutting down"),
    }
    Ok(())
}

/// Fill in the response code for `result` and build the answer section.
fn answer(header: &mut Header, result: Lookup, name: Name, qtype: RecordType) -> Vec<Record> {
    let mut records = Vec::new();
    match result {
        Lookup::Found(ip) => {
            let rdata = match (ip, qtype) {
                (IpAddr::V4(v4), RecordType::A | RecordType::ANY) => Some(RData::A(A(v4))),
                (IpAddr::V6(v6), RecordType::AAAA | RecordType::ANY) => {
                    Some(RData::AAAA(AAAA(v6)))
                }
                _ => None,
            };
            if let Some(rdata) = rdata {
                records.push(Record::from_rdata(name, TTL, rdata));
            }
            header.set_response_code(ResponseCode::NoError);
        }
        Lookup::NxDomain => {
            header.set_response_code(ResponseCode::NXDomain);
        }
        Lookup::Refused => {
            header.set_authoritative(false);
            header.set_response_code(ResponseCode::Refused);
        }
    }
    records
}

struct MeshDns {
    node: Arc<Node>,
}

impl MeshDns {
    async fn respond<R: ResponseHandler>(
        request: &Request,
        header: Header,
        records: &[Record],
        mut response_handle: R,
    ) -> ResponseInfo {
        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(
            header,
            records.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!("Failed to send DNS response: {}", e);
                let mut header = Header::response_from_request(request.header());
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

#[async_trait]
impl RequestHandler for MeshDns {
    async fn handle_request<R>(&self, request: &Request, response_handle: R) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        let query = request.query();
        let qtype = query.query_type();

        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);

        let result = {
            let store = self.node.store().read().await;
            lookup(&store, &query.name().to_string())
        };

        let records = answer(&mut header, result, query.name().clone().into(), qtype);
        Self::respond(request, header, &records, response_handle).await
    }
}
