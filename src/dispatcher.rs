//! DNS request dispatcher.
//!
//! Runs the per-question pipeline shared by every listener: blocklist
//! filtering, cache lookup, one bundled upstream exchange for whatever is
//! left, cache fill, reply. Each inbound message is handled to completion
//! independently; the dispatcher itself holds only shared collaborators.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::SOA;
use hickory_proto::rr::{Name, RData, Record};
use rustc_hash::FxHashMap;
use tracing::{error, info, warn};

use crate::cache::{CacheKey, TtlCache};
use crate::filter::Blocklist;
use crate::metrics::DnsMetrics;
use crate::upstream::RoundRobinClient;

/// TTL (and SOA minimum) for synthesised block responses, in seconds.
const BLOCKED_TTL: u32 = 300;
const BLOCKED_MNAME: &str = "ns.blocked.local.";
const BLOCKED_RNAME: &str = "hostmaster.blocked.local.";

/// Transport-side sink for one DNS reply.
#[async_trait]
pub trait ResponseWriter: Send {
    /// Address of the client this reply goes to, when known.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Write a single DNS message back to the client.
    async fn write_msg(&mut self, msg: &Message) -> io::Result<()>;
}

/// Callback receiving every reported error, for an external crash reporter.
pub type ErrorSink = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Per-request pipeline over shared collaborators.
pub struct Dispatcher {
    client: RoundRobinClient,
    cache: Arc<TtlCache>,
    blocklist: Arc<Blocklist>,
    metrics: Arc<DnsMetrics>,
    error_sink: Option<ErrorSink>,
    log_queries: bool,
}

impl Dispatcher {
    pub fn new(
        client: RoundRobinClient,
        cache: Arc<TtlCache>,
        blocklist: Arc<Blocklist>,
        metrics: Arc<DnsMetrics>,
        log_queries: bool,
    ) -> Self {
        Self {
            client,
            cache,
            blocklist,
            metrics,
            error_sink: None,
            log_queries,
        }
    }

    /// Forward reported errors to an external sink as well.
    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Handle one DNS request, writing exactly one reply to `writer`
    /// (unless the write itself fails, which is reported but not retried).
    pub async fn handle<W: ResponseWriter>(&self, writer: &mut W, request: &Message) {
        let start = Instant::now();
        self.handle_inner(writer, request).await;
        self.metrics
            .request_latency
            .observe(start.elapsed().as_secs_f64());
        self.metrics.request_counts.with_label_values(&["total"]).inc();
    }

    async fn handle_inner<W: ResponseWriter>(&self, writer: &mut W, request: &Message) {
        let client_ip = writer
            .remote_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_owned());
        let request_id = request.id();

        self.update_client_metrics(&client_ip);

        let mut reply = reply_to(request);

        let mut unresolved: Vec<Query> = Vec::with_capacity(request.queries().len());
        for question in request.queries() {
            match self.process_question(&client_ip, request_id, question) {
                Ok(Some(answers)) => {
                    reply.add_answers(answers);
                }
                Ok(None) => unresolved.push(question.clone()),
                Err(err) => {
                    reply.set_response_code(ResponseCode::ServFail);
                    self.report_error(&client_ip, request_id, "blocklist", &err);
                    self.send_response(&client_ip, request_id, writer, &reply).await;
                    return;
                }
            }
        }

        if !unresolved.is_empty() {
            match self.resolve_upstream(&unresolved, request).await {
                Ok((ResponseCode::NoError, answers)) => {
                    reply.add_answers(answers);
                }
                Ok((rcode, _)) => {
                    // A non-success upstream rcode passes through verbatim;
                    // nothing is cached.
                    warn!(
                        client_ip,
                        request_id,
                        rcode = rcode_label(rcode),
                        "upstream returned a non-success rcode"
                    );
                    reply.set_response_code(rcode);
                    self.send_response(&client_ip, request_id, writer, &reply).await;
                    return;
                }
                Err(err) => {
                    reply.set_response_code(ResponseCode::ServFail);
                    self.report_error(&client_ip, request_id, "upstream", &err);
                    self.send_response(&client_ip, request_id, writer, &reply).await;
                    return;
                }
            }
        }

        if reply.answers().is_empty() && !reply.name_servers().is_empty() {
            reply.set_response_code(ResponseCode::NXDomain);
        }

        self.send_response(&client_ip, request_id, writer, &reply).await;
    }

    /// Answer one question locally. `Ok(Some(..))` holds synthesised or
    /// cached records, `Ok(None)` defers the question to upstream.
    fn process_question(
        &self,
        client_ip: &str,
        request_id: u16,
        question: &Query,
    ) -> Result<Option<Vec<Record>>> {
        let name = fqdn(question.name());
        let record_type = question.query_type().to_string();
        if self.log_queries {
            info!(client_ip, request_id, name = %name, record_type = %record_type, "query received");
        }
        self.metrics.top_domains.add(&name);

        if self.blocklist.is_blocked(&name)? {
            if self.log_queries {
                info!(client_ip, request_id, name = %name, "domain blocked");
            }
            self.metrics
                .query_counts
                .with_label_values(&[&record_type, "true"])
                .inc();
            return Ok(Some(vec![blocked_soa(question.name())?]));
        }

        self.metrics
            .query_counts
            .with_label_values(&[&record_type, "false"])
            .inc();

        let key = CacheKey::new(name, question.query_type());
        Ok(self.cache.get(&key))
    }

    /// Bundle the unresolved questions into one upstream query, cache the
    /// answers per question, and return the upstream's Answer section.
    async fn resolve_upstream(
        &self,
        questions: &[Query],
        request: &Message,
    ) -> Result<(ResponseCode, Vec<Record>)> {
        let mut upstream_req = Message::new();
        upstream_req.set_id(rand::random());
        upstream_req.set_recursion_desired(request.recursion_desired());
        upstream_req.add_queries(questions.iter().cloned());

        let upstream_reply = self.forward_query(&upstream_req).await?;

        if upstream_reply.response_code() != ResponseCode::NoError {
            return Ok((upstream_reply.response_code(), Vec::new()));
        }

        // Demultiplex answers back to their questions for the cache fill.
        let mut buckets: FxHashMap<CacheKey, Vec<Record>> = FxHashMap::default();
        for answer in upstream_reply.answers() {
            let key = CacheKey::new(fqdn(answer.name()), answer.record_type());
            buckets.entry(key).or_default().push(answer.clone());
        }

        for question in questions {
            let key = CacheKey::new(fqdn(question.name()), question.query_type());
            let Some(records) = buckets.get(&key) else {
                continue;
            };
            let Some(first) = records.first() else {
                continue;
            };
            let ttl = first.ttl();
            self.cache
                .set(key, records.clone(), Duration::from_secs(u64::from(ttl)));
            self.metrics
                .upstream_ttls
                .with_label_values(&[&question.query_type().to_string()])
                .observe(f64::from(ttl));
        }

        Ok((ResponseCode::NoError, upstream_reply.answers().to_vec()))
    }

    async fn forward_query(&self, upstream_req: &Message) -> Result<Message> {
        let start = Instant::now();
        self.metrics
            .request_counts
            .with_label_values(&["forwarded"])
            .inc();

        let (reply, upstream) = self.client.exchange(upstream_req).await?;
        self.metrics
            .upstream_latency
            .with_label_values(&[&upstream])
            .observe(start.elapsed().as_secs_f64());
        Ok(reply)
    }

    async fn send_response<W: ResponseWriter>(
        &self,
        client_ip: &str,
        request_id: u16,
        writer: &mut W,
        reply: &Message,
    ) {
        self.metrics
            .reply_counts
            .with_label_values(&[rcode_label(reply.response_code())])
            .inc();
        if let Err(err) = writer.write_msg(reply).await {
            self.report_error(client_ip, request_id, "response", &anyhow!(err));
        }
    }

    fn update_client_metrics(&self, client_ip: &str) {
        self.metrics.top_clients.add(client_ip);
        let mut sketch = self
            .metrics
            .unique_clients
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        sketch.insert(client_ip.as_bytes());
    }

    fn report_error(&self, client_ip: &str, request_id: u16, category: &str, err: &anyhow::Error) {
        error!(client_ip, request_id, category, error = %err, "dns request failed");
        self.metrics.error_counts.with_label_values(&[category]).inc();
        self.metrics.request_counts.with_label_values(&["errored"]).inc();
        if let Some(sink) = &self.error_sink {
            sink(err);
        }
    }
}

/// Standard reply skeleton: same id and opcode, question section copied
/// verbatim.
fn reply_to(request: &Message) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError)
        .add_queries(request.queries().iter().cloned());
    reply
}

/// Canonical lowercased FQDN form of a name, with exactly one trailing dot.
fn fqdn(name: &Name) -> String {
    let mut name = name.to_lowercase();
    name.set_fqdn(true);
    name.to_string()
}

/// The synthesised answer for a blocked name: a dead SOA in the Answer
/// section, rcode untouched.
fn blocked_soa(name: &Name) -> Result<Record> {
    let mname = Name::from_ascii(BLOCKED_MNAME)?;
    let rname = Name::from_ascii(BLOCKED_RNAME)?;
    let soa = SOA::new(mname, rname, 1, 3600, 900, 604_800, BLOCKED_TTL);
    Ok(Record::from_rdata(name.clone(), BLOCKED_TTL, RData::SOA(soa)))
}

/// Canonical rcode name for metric labels.
fn rcode_label(rcode: ResponseCode) -> &'static str {
    match rcode {
        ResponseCode::NoError => "NOERROR",
        ResponseCode::FormErr => "FORMERR",
        ResponseCode::ServFail => "SERVFAIL",
        ResponseCode::NXDomain => "NXDOMAIN",
        ResponseCode::NotImp => "NOTIMP",
        ResponseCode::Refused => "REFUSED",
        _ => "OTHER",
    }
}
