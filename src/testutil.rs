//! shared helpers for the test suites: a loopback DoH stub server, wire
//! message builders, and recording implementations of the capability
//! traits.

use crate::*;

use core::str::FromStr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Mutex as StdMutex;

use http_types::{Mime, Response, StatusCode};

/// maps a request body to (status, response body, extra headers).
pub type StubHandler = Arc<dyn Fn(Vec<u8>) -> (u16, Vec<u8>, Vec<(String, String)>) + Send + Sync>;

pub struct Stub {
    pub url: String,
    pub port: u16,
    pub hits: Arc<AtomicUsize>,
    pub requests: Arc<StdMutex<Vec<Vec<u8>>>>,
    pub agents: Arc<StdMutex<Vec<String>>>,
}

/// serves `handler` on a loopback port over plaintext HTTP/1.1, recording
/// every request body it sees.
pub async fn spawn_stub(handler: StubHandler) -> Stub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(StdMutex::new(Vec::new()));
    let agents = Arc::new(StdMutex::new(Vec::new()));

    let stub = Stub {
        url: format!("http://{addr}/dns-query"),
        port: addr.port(),
        hits: hits.clone(),
        requests: requests.clone(),
        agents: agents.clone(),
    };

    smolscale2::spawn(async move {
        loop {
            let (conn, _peer) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => break,
            };

            let handler = handler.clone();
            let hits = hits.clone();
            let requests = requests.clone();
            let agents = agents.clone();
            smolscale2::spawn(async move {
                let _ = async_h1::accept(conn, move |mut req| {
                    let handler = handler.clone();
                    let hits = hits.clone();
                    let requests = requests.clone();
                    let agents = agents.clone();
                    async move {
                        hits.fetch_add(1, Relaxed);

                        if let Some(agent) = req.header("User-Agent") {
                            agents.lock().unwrap().push(agent.last().as_str().to_string());
                        }

                        let body = req.body_bytes().await.unwrap_or_default();
                        requests.lock().unwrap().push(body.clone());

                        let (status, response_body, headers) = (handler)(body);

                        let mut res = Response::new(StatusCode::try_from(status).unwrap());
                        for (key, value) in headers {
                            res.insert_header(key.as_str(), value.as_str());
                        }
                        res.set_content_type(
                            Mime::from_str("application/dns-message").unwrap(),
                        );
                        res.set_body(response_body);
                        Ok(res)
                    }
                })
                .await;
            })
            .detach();
        }
    })
    .detach();

    stub
}

/// a wire-format A query for example.com with the given transaction ID.
pub fn sample_query(id: u16) -> Vec<u8> {
    let mut msg = dns::Message::new();
    msg.set_id(id);
    msg.set_message_type(dns::MessageType::Query);
    msg.set_op_code(dns::OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(dns::Query::query(
        dns::Name::from_ascii("example.com.").unwrap(),
        dns::RdType::A,
    ));
    msg.to_vec().unwrap()
}

/// turns a received (zero-ID) query body into a plausible upstream answer.
pub fn stub_answer(query_body: &[u8]) -> Vec<u8> {
    let mut msg = dns::Message::from_vec(query_body).unwrap();
    msg.set_message_type(dns::MessageType::Response);
    msg.set_recursion_available(true);
    msg.additionals_mut().clear();
    msg.extensions_mut().take();

    let query = msg.queries()[0].clone();
    msg.add_answer(dns::Record::from_rdata(
        query.name().clone(),
        60,
        dns::RData::A(dns::rdata::A::from(Ipv4Addr::new(93, 184, 216, 34))),
    ));
    msg.to_vec().unwrap()
}

#[derive(Default)]
pub struct RecordingListener {
    pub summaries: StdMutex<Vec<Summary>>,
}

impl Listener for RecordingListener {
    fn on_query(&self, _url: &str) -> Token {
        Box::new(Instant::now())
    }

    fn on_response(&self, token: Token, summary: Summary) {
        assert!(token.downcast::<Instant>().is_ok());
        self.summaries.lock().unwrap().push(summary);
    }
}

pub struct StubOracle {
    pub device_block: bool,
    pub request_names: String,
    pub response_names: String,
    pub stamp_names: String,
}

impl BlocklistOracle for StubOracle {
    fn on_device_block(&self) -> bool {
        self.device_block
    }

    fn block_request(&self, _query: &[u8]) -> anyhow::Result<String> {
        Ok(self.request_names.clone())
    }

    fn block_response(&self, _answer: &[u8]) -> anyhow::Result<String> {
        Ok(self.response_names.clone())
    }

    fn stamp_header_key(&self) -> String {
        "x-blocklist-stamp".to_string()
    }

    fn stamp_to_names(&self, stamp: &str) -> anyhow::Result<String> {
        if stamp.is_empty() {
            anyhow::bail!("empty blocklist stamp");
        }
        Ok(self.stamp_names.clone())
    }
}
