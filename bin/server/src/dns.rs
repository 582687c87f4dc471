use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use anyhow::anyhow;
use hickory_proto::{
    op::{Message, MessageType, ResponseCode},
    rr::{
        rdata::{A, AAAA},
        RData, Record, RecordType,
    },
};
use metrics::counter;
use tokio::net::UdpSocket;

use crate::metrics::{METRICS_DNS_LOOKUP_ERROR_COUNT, METRICS_DNS_QUERY_COUNT};

const ANSWER_TTL: u32 = 300;
const MAX_DATAGRAM: usize = 4096;

/// Answers A and AAAA questions over UDP with the host's own resolver.
pub struct DnsRelay {
    socket: Arc<UdpSocket>,
}

impl DnsRelay {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        log::info!("[DnsRelay] listening on {}", socket.local_addr()?);
        Ok(Self { socket: Arc::new(socket) })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until the socket fails. Each query is answered on its own task.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            counter!(METRICS_DNS_QUERY_COUNT).increment(1);
            let query = buf[..len].to_vec();
            let socket = self.socket.clone();
            tokio::spawn(async move {
                match answer(&query).await {
                    Ok(reply) => {
                        if let Err(e) = socket.send_to(&reply, peer).await {
                            log::warn!("[DnsRelay] reply to {peer} error {e}");
                        }
                    }
                    Err(e) => log::debug!("[DnsRelay] drop query from {peer}: {e}"),
                }
            });
        }
    }
}

/// Build the reply for one raw query. Failed lookups and other record types leave the answer section empty.
pub async fn answer(query: &[u8]) -> anyhow::Result<Vec<u8>> {
    let req = Message::from_vec(query).map_err(|e| anyhow!("malformed query: {e}"))?;
    let mut resp = Message::new();
    resp.set_id(req.id())
        .set_message_type(MessageType::Response)
        .set_op_code(req.op_code())
        .set_recursion_desired(req.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);
    resp.add_queries(req.queries().to_vec());

    for question in req.queries() {
        let record_type = question.query_type();
        if record_type != RecordType::A && record_type != RecordType::AAAA {
            log::debug!("[DnsRelay] unsupported query type {record_type} for {}", question.name());
            continue;
        }
        let host = question.name().to_ascii();
        let ips = match lookup(host.trim_end_matches('.')).await {
            Ok(ips) => ips,
            Err(e) => {
                counter!(METRICS_DNS_LOOKUP_ERROR_COUNT).increment(1);
                log::warn!("[DnsRelay] lookup {host} failed {e}");
                continue;
            }
        };
        for ip in ips {
            let rdata = match (record_type, ip) {
                (RecordType::A, IpAddr::V4(v4)) => RData::A(A::from(v4)),
                (RecordType::AAAA, IpAddr::V6(v6)) => RData::AAAA(AAAA::from(v6)),
                _ => continue,
            };
            resp.add_answer(Record::from_rdata(question.name().clone(), ANSWER_TTL, rdata));
        }
    }

    Ok(resp.to_vec()?)
}

async fn lookup(host: &str) -> io::Result<Vec<IpAddr>> {
    let mut ips: Vec<IpAddr> = tokio::net::lookup_host((host, 0)).await?.map(|addr| addr.ip()).collect();
    ips.sort();
    ips.dedup();
    Ok(ips)
}
