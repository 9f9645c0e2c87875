//! Round-robin upstream DNS client.
//!
//! A plain atomic counter picks the next endpoint; health checks feed the
//! readiness probe, not per-request selection, and a failed exchange is
//! surfaced rather than retried elsewhere.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{anyhow, ensure, Context as _, Result};
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::server::MAX_DNS_PACKET_SIZE;

/// Hard deadline for one upstream exchange.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(3);

/// Deadline for a health-probe exchange.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

struct Upstream {
    addr: SocketAddr,
    label: String,
}

/// Multi-resolver DNS client with round-robin endpoint selection.
pub struct RoundRobinClient {
    upstreams: Vec<Upstream>,
    counter: AtomicU32,
}

impl RoundRobinClient {
    /// Build a client over an ordered, non-empty list of `host:port`
    /// endpoints.
    pub fn new(upstreams: &[String]) -> Result<Self> {
        ensure!(!upstreams.is_empty(), "at least one upstream resolver is required");

        let upstreams = upstreams
            .iter()
            .map(|endpoint| {
                let addr = endpoint
                    .parse::<SocketAddr>()
                    .with_context(|| format!("invalid upstream address {endpoint:?}"))?;
                Ok(Upstream { addr, label: endpoint.clone() })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { upstreams, counter: AtomicU32::new(0) })
    }

    fn next_upstream(&self) -> &Upstream {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) as usize;
        &self.upstreams[n % self.upstreams.len()]
    }

    /// Send one query to the next upstream and wait for its reply.
    /// Returns the reply together with the endpoint that served it.
    pub async fn exchange(&self, query: &Message) -> Result<(Message, String)> {
        let upstream = self.next_upstream();
        let reply = timeout(EXCHANGE_TIMEOUT, exchange_once(upstream.addr, query))
            .await
            .map_err(|_| anyhow!("upstream {} timed out", upstream.label))??;
        Ok((reply, upstream.label.clone()))
    }

    /// One readiness probe per configured upstream.
    pub fn healthchecks(&self) -> Vec<HealthCheck> {
        self.upstreams
            .iter()
            .map(|u| HealthCheck { addr: u.addr, label: u.label.clone() })
            .collect()
    }
}

/// Readiness probe for a single upstream endpoint.
#[derive(Clone)]
pub struct HealthCheck {
    addr: SocketAddr,
    label: String,
}

impl HealthCheck {
    pub fn name(&self) -> String {
        format!("DNS server {}", self.label)
    }

    /// Issue a cheap `A` query for `google.com.` against this upstream.
    pub async fn pass(&self) -> bool {
        let Ok(name) = Name::from_ascii("google.com.") else {
            return false;
        };
        let mut probe = Message::new();
        probe.set_id(rand::random());
        probe.set_recursion_desired(true);
        probe.add_query(Query::query(name, RecordType::A));

        matches!(
            timeout(PROBE_TIMEOUT, exchange_once(self.addr, &probe)).await,
            Ok(Ok(_))
        )
    }
}

/// UDP exchange with a TCP retry when the reply comes back truncated.
async fn exchange_once(addr: SocketAddr, query: &Message) -> Result<Message> {
    let payload = query.to_vec().context("failed to encode upstream query")?;

    let reply = exchange_udp(addr, query.id(), &payload).await?;
    if reply.truncated() {
        return exchange_tcp(addr, query.id(), &payload).await;
    }
    Ok(reply)
}

async fn exchange_udp(addr: SocketAddr, id: u16, payload: &[u8]) -> Result<Message> {
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;
    socket.send(payload).await?;

    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
    let len = socket.recv(&mut buf).await?;
    let reply = Message::from_vec(&buf[..len]).context("failed to decode upstream reply")?;
    ensure!(reply.id() == id, "upstream reply id {} does not match query id {id}", reply.id());
    Ok(reply)
}

async fn exchange_tcp(addr: SocketAddr, id: u16, payload: &[u8]) -> Result<Message> {
    let mut stream = TcpStream::connect(addr).await?;

    stream.write_u16(payload.len() as u16).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;

    let len = stream.read_u16().await? as usize;
    let mut reply_buf = vec![0u8; len];
    stream.read_exact(&mut reply_buf).await?;

    let reply = Message::from_vec(&reply_buf).context("failed to decode upstream reply")?;
    ensure!(reply.id() == id, "upstream reply id {} does not match query id {id}", reply.id());
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, ResponseCode};
    use rustc_hash::FxHashMap;

    fn client(endpoints: &[&str]) -> RoundRobinClient {
        let endpoints: Vec<String> = endpoints.iter().map(|s| (*s).to_owned()).collect();
        RoundRobinClient::new(&endpoints).unwrap()
    }

    #[test]
    fn rejects_an_empty_upstream_list() {
        assert!(RoundRobinClient::new(&[]).is_err());
    }

    #[test]
    fn rejects_unparseable_endpoints() {
        assert!(RoundRobinClient::new(&["not-an-address".to_owned()]).is_err());
    }

    #[test]
    fn selection_is_fair_without_concurrency() {
        let client = client(&["127.0.0.1:1053", "127.0.0.1:1054", "127.0.0.1:1055"]);
        let calls = 10;

        let mut counts: FxHashMap<String, usize> = FxHashMap::default();
        for _ in 0..calls {
            *counts.entry(client.next_upstream().label.clone()).or_default() += 1;
        }

        // Over m calls against n upstreams each endpoint is chosen
        // floor(m/n) or ceil(m/n) times.
        for count in counts.values() {
            assert!((3..=4).contains(count), "unfair selection: {counts:?}");
        }
        assert_eq!(counts.values().sum::<usize>(), calls);
    }

    #[test]
    fn healthchecks_cover_every_upstream_in_order() {
        let client = client(&["127.0.0.1:1053", "127.0.0.1:1054"]);
        let checks = client.healthchecks();
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].name(), "DNS server 127.0.0.1:1053");
        assert_eq!(checks[1].name(), "DNS server 127.0.0.1:1054");
    }

    #[tokio::test]
    async fn exchange_round_trips_over_udp() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..len]).unwrap();
            let mut reply = Message::new();
            reply
                .set_id(request.id())
                .set_message_type(MessageType::Response)
                .set_response_code(ResponseCode::NoError)
                .add_queries(request.queries().iter().cloned());
            server.send_to(&reply.to_vec().unwrap(), peer).await.unwrap();
        });

        let addr_str = addr.to_string();
        let client = client(&[addr_str.as_str()]);
        let mut query = Message::new();
        query.set_id(4242);
        query.add_query(Query::query(Name::from_ascii("example.com.").unwrap(), RecordType::A));

        let (reply, upstream) = client.exchange(&query).await.unwrap();
        assert_eq!(reply.id(), 4242);
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(upstream, addr.to_string());
    }

    #[tokio::test]
    async fn probe_passes_against_a_responsive_upstream() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..len]).unwrap();
            let mut reply = Message::new();
            reply
                .set_id(request.id())
                .set_message_type(MessageType::Response)
                .add_queries(request.queries().iter().cloned());
            server.send_to(&reply.to_vec().unwrap(), peer).await.unwrap();
        });

        let addr_str = addr.to_string();
        let client = client(&[addr_str.as_str()]);
        let checks = client.healthchecks();
        assert!(checks[0].pass().await);
    }
}
