use crate::*;

use async_compat::Compat;

/// wait this long for the TCP handshake to complete.
const TCP_TIMEOUT: Duration = Duration::from_secs(3);

/// wait this long for response headers once the request is on the wire.
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(20);

/// after the server sends an invalid reply, all queries are rejected for
/// this long. this rate-limits queries to misconfigured servers (e.g. a
/// wrong URL).
const HANGOVER_DURATION: Duration = Duration::from_secs(10);

const CONTENT_TYPE: &str = "application/dns-message";
const USER_AGENT: &str = "Intra";

/// a POST-only DoH query transport. queries leave the device padded and
/// zero-ID; responses come back with the caller's ID restored. one
/// transport is safely shared by any number of concurrent callers.
pub struct DoHTransport {
    url: reqwest::Url,
    hostname: String,
    port: u16,
    ips: IPMap,
    client: reqwest::Client,
    listener: Option<Arc<dyn Listener>>,
    oracle: RwLock<Option<Arc<dyn BlocklistOracle>>>,
    hangover: RwLock<Option<Instant>>,
}

impl Debug for DoHTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("DoHTransport")
            .field("url", &self.url.as_str())
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("ips", &self.ips)
            .finish()
    }
}

impl DoHTransport {
    /// builds a transport for the DoH template `rawurl` (HTTPS required).
    /// `bootstrap` lists fallback addresses for the DoH hostname, used when
    /// its lookup fails or returns non-working addresses. `auth` supplies a
    /// TLS client identity if the server demands one. `listener` receives
    /// the outcome of every query.
    pub async fn new(
        rawurl: impl ToString,
        bootstrap: &[String],
        auth: Option<Arc<dyn ClientAuth>>,
        listener: Option<Arc<dyn Listener>>,
    ) -> anyhow::Result<Self> {
        Self::build(rawurl.to_string(), bootstrap, auth, listener, true, system_resolver()).await
    }

    #[cfg(test)]
    pub(crate) async fn plaintext(
        rawurl: impl ToString,
        listener: Option<Arc<dyn Listener>>,
    ) -> anyhow::Result<Self> {
        Self::build(rawurl.to_string(), &[], None, listener, false, system_resolver()).await
    }

    #[cfg(test)]
    pub(crate) async fn plaintext_with_ips(
        rawurl: impl ToString,
        bootstrap: &[String],
        resolver: Resolver,
    ) -> anyhow::Result<Self> {
        Self::build(rawurl.to_string(), bootstrap, None, None, false, resolver).await
    }

    async fn build(
        rawurl: String,
        bootstrap: &[String],
        auth: Option<Arc<dyn ClientAuth>>,
        listener: Option<Arc<dyn Listener>>,
        https_only: bool,
        resolver: Resolver,
    ) -> anyhow::Result<Self> {
        let url = reqwest::Url::parse(&rawurl).log_warn()?;
        if https_only && url.scheme() != "https" {
            anyhow::bail!("DoH server URL scheme invalid: {:?}", url.scheme());
        }

        let hostname = match url.host_str() {
            Some(v) => normalize_host(v),
            None => anyhow::bail!("DoH server URL has no hostname: {rawurl:?}"),
        };
        let port = url.port().unwrap_or(443);

        let ips = IPMap::new(resolver);
        let set = ips.seed(&hostname, bootstrap).await;
        if set.is_empty().await {
            // addresses get resolved just-in-time on first dial instead
            log::warn!("zero bootstrap ips for {hostname:?}");
        }

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .https_only(https_only)
            .redirect(reqwest::redirect::Policy::limited(10))
            .referer(false)
            .tcp_nodelay(true)
            .connect_timeout(TCP_TIMEOUT)
            .pool_idle_timeout(None)
            .pool_max_idle_per_host(5)
            .user_agent(USER_AGENT)
            .dns_resolver(Arc::new(ips.clone()));

        if let Some(ref auth) = auth {
            let identity = reqwest::Identity::from_pem(&auth.client_pem()?)?;
            builder = builder.identity(identity);
        }

        let client = builder.build().log_warn()?;

        Ok(Self {
            url,
            hostname,
            port,
            ips,
            client,
            listener,
            oracle: RwLock::new(None),
            hangover: RwLock::new(None),
        })
    }

    /// the server URL this transport was initialized with.
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// installs, replaces or clears the blocklist oracle. in-flight queries
    /// keep whichever snapshot they already took.
    pub async fn set_blocklist_oracle(&self, oracle: Option<Arc<dyn BlocklistOracle>>) {
        *self.oracle.write().await = oracle;
    }

    async fn oracle_snapshot(&self) -> Option<Arc<dyn BlocklistOracle>> {
        self.oracle.read().await.clone()
    }

    async fn in_hangover(&self) -> bool {
        match *self.hangover.read().await {
            Some(expiration) => Instant::now() < expiration,
            None => false,
        }
    }

    async fn arm_hangover(&self) {
        *self.hangover.write().await = Some(Instant::now() + HANGOVER_DURATION);
    }

    /// forwards the raw DNS query `q` (ID included) to the DoH server and
    /// returns a response with matching ID. on failure the error carries a
    /// synthesized SERVFAIL where one could be built, so the caller always
    /// has bytes to write back to the stub. a Summary goes to the Listener
    /// on every path.
    pub async fn query(&self, q: &[u8]) -> Result<Vec<u8>, QueryError> {
        let token = self.listener.as_ref().map(|l| l.on_query(self.url.as_str()));

        let out = self.do_query(q).await;

        let (status, http_status) = match &out.err {
            None => (QueryStatus::Complete, 200),
            Some((status, http_status, _)) => (*status, *http_status),
        };

        if let (Some(listener), Some(token)) = (self.listener.as_ref(), token) {
            let server = match out.server {
                Some(addr) => addr.ip().to_string(),
                None => String::new(),
            };
            listener.on_response(
                token,
                Summary {
                    latency: out.elapsed.as_secs_f64(),
                    query: q.to_vec(),
                    response: out.response.clone().unwrap_or_default(),
                    server,
                    status,
                    http_status,
                    blocklists: out.blocklists.clone(),
                },
            );
        }

        match out.err {
            None => match out.response {
                Some(response) => Ok(response),
                // a success outcome always carries a response
                None => Err(QueryError {
                    status: QueryStatus::InternalError,
                    http_status: 0,
                    response: None,
                    server: out.server,
                    source: anyhow::anyhow!("success outcome without response"),
                }),
            },
            Some((status, http_status, source)) => Err(QueryError {
                status,
                http_status,
                response: out.response,
                server: out.server,
                source,
            }),
        }
    }

    async fn do_query(&self, q: &[u8]) -> QueryOutcome {
        let mut out = QueryOutcome::default();

        if q.len() < 2 {
            out.err = Some((
                QueryStatus::BadQuery,
                0,
                anyhow::anyhow!("query length is {}", q.len()),
            ));
            return out;
        }

        let start = Instant::now();

        // local interception before anything touches the network.
        if let Some(oracle) = self.oracle_snapshot().await {
            if oracle.on_device_block() {
                match apply_blocklists(oracle.as_ref(), q) {
                    Ok((response, blocklists)) => {
                        out.response = Some(response);
                        out.blocklists = blocklists;
                        out.elapsed = start.elapsed();
                        return out;
                    },
                    Err(err) => {
                        log::debug!("skipping local block: {err:?}");
                    },
                }
            }
        }

        if self.in_hangover().await {
            out.response = message::try_servfail(q);
            out.err = Some((
                QueryStatus::HttpError,
                0,
                anyhow::anyhow!("Forwarder is in servfail hangover"),
            ));
            out.elapsed = start.elapsed();
            return out;
        }

        // pad an owned copy of the query, then zero its ID; the upstream
        // copy always carries ID 0. the caller's bytes stay untouched.
        let mut padded = match message::add_edns_padding(q) {
            Ok(v) => v,
            Err(err) => {
                out.err = Some((QueryStatus::InternalError, 0, err));
                out.elapsed = start.elapsed();
                return out;
            },
        };
        let id = u16::from_be_bytes([q[0], q[1]]);
        padded[0] = 0;
        padded[1] = 0;

        let sent = self.send_request(id, padded, q).await;
        out.server = sent.server;
        out.blocklists = sent.blocklists;
        out.elapsed = start.elapsed();

        match sent.err {
            None => {
                out.response = sent.response;
                // record a working address for this server
                if let Some(server) = out.server {
                    self.ips.get(&sent.hostname).await.confirm(server.ip()).await;
                }
            },
            Some((status, http_status, source)) => {
                log::info!("{id:04x} query failed: {source:?}");

                // transient send failures are not the server's fault and
                // must not start a hangover.
                if status != QueryStatus::SendFailed {
                    self.arm_hangover().await;
                }

                if let Some(server) = out.server {
                    log::debug!("{id:04x} disconfirming {}", server.ip());
                    self.ips.get(&sent.hostname).await.disconfirm(server.ip()).await;
                } else if status == QueryStatus::SendFailed {
                    // nothing was reached at all; stop preferring the
                    // last-known-good address.
                    let set = self.ips.get(&self.hostname).await;
                    if let Some(confirmed) = set.confirmed().await {
                        set.disconfirm(confirmed).await;
                    }
                }

                out.response = message::try_servfail(q);
                out.err = Some((status, http_status, source));
            },
        }

        out
    }

    async fn send_request(&self, id: u16, body: Vec<u8>, q: &[u8]) -> SendOutcome {
        let mut out = SendOutcome {
            response: None,
            hostname: self.hostname.clone(),
            server: None,
            blocklists: String::new(),
            err: None,
        };

        log::debug!("{id:04x} sending query");
        let request = self
            .client
            .post(self.url.clone())
            .header("Content-Type", CONTENT_TYPE)
            .header("Accept", CONTENT_TYPE)
            .body(body);

        let http_response = match Compat::new(request.send())
            .timeout(RESPONSE_HEADER_TIMEOUT)
            .await
        {
            Some(Ok(v)) => v,
            Some(Err(err)) => {
                out.err = Some((QueryStatus::SendFailed, 0, err.into()));
                return out;
            },
            None => {
                out.err = Some((
                    QueryStatus::SendFailed,
                    0,
                    anyhow::anyhow!("no response headers within {RESPONSE_HEADER_TIMEOUT:?}"),
                ));
                return out;
            },
        };
        log::debug!("{id:04x} got response");

        // the exchange already happened, so the remote address is fixed and
        // readable here without any synchronization.
        out.server = http_response.remote_addr();

        // the URL may have changed due to a redirect; address confirmation
        // must follow it.
        if let Some(host) = http_response.url().host_str() {
            out.hostname = normalize_host(host);
        }

        let http_status = http_response.status().as_u16();
        let headers = http_response.headers().clone();

        let response: Bytes = match Compat::new(http_response.bytes()).await {
            Ok(v) => v,
            Err(err) => {
                out.err = Some((QueryStatus::BadResponse, 0, err.into()));
                return out;
            },
        };
        let mut response: Vec<u8> = response.to_vec();
        log::debug!("{id:04x} response done: {} bytes", response.len());

        if http_status != 200 {
            out.err = Some((
                QueryStatus::HttpError,
                http_status,
                anyhow::anyhow!("HTTP request failed: {http_status}"),
            ));
            return out;
        }

        if response.len() < 2 {
            out.err = Some((
                QueryStatus::BadResponse,
                0,
                anyhow::anyhow!("response length is {}", response.len()),
            ));
            return out;
        }
        if response[..2] != [0, 0] {
            out.err = Some((
                QueryStatus::BadResponse,
                0,
                anyhow::anyhow!("nonzero response ID"),
            ));
            return out;
        }

        // hand the caller's ID back before anyone else sees the bytes.
        response[..2].copy_from_slice(&id.to_be_bytes());

        let (blocklists, replacement) = self.resolve_block(q, &headers, &response).await;
        if !blocklists.is_empty() {
            if let Some(replacement) = replacement {
                response = replacement;
            }
        }
        out.blocklists = blocklists;
        out.response = Some(response);

        out
    }

    /// decides whether an upstream answer stands: a block stamp header
    /// means the server already blocked (the answer stays as-is, names are
    /// reported); otherwise local policy may overrule the answer with a
    /// synthetic block response.
    async fn resolve_block(
        &self,
        q: &[u8],
        headers: &reqwest::header::HeaderMap,
        answer: &[u8],
    ) -> (String, Option<Vec<u8>>) {
        let oracle = match self.oracle_snapshot().await {
            Some(v) => v,
            None => return (String::new(), None),
        };

        let blocklists = blocklists_from_header(oracle.as_ref(), headers);
        if !blocklists.is_empty() || !oracle.on_device_block() {
            return (blocklists, None);
        }

        let blocklists = match oracle.block_response(answer) {
            Ok(v) => v,
            Err(err) => {
                log::debug!("response not blocked: {err:?}");
                return (String::new(), None);
            },
        };
        if blocklists.is_empty() {
            return (String::new(), None);
        }

        match message::block_response(q) {
            Ok(response) => (blocklists, Some(response)),
            Err(err) => {
                log::warn!("could not pack blocked response: {err:?}");
                (blocklists, None)
            },
        }
    }
}

#[derive(Default)]
struct QueryOutcome {
    response: Option<Vec<u8>>,
    blocklists: String,
    server: Option<SocketAddr>,
    elapsed: Duration,
    err: Option<(QueryStatus, u16, anyhow::Error)>,
}

struct SendOutcome {
    response: Option<Vec<u8>>,
    hostname: String,
    server: Option<SocketAddr>,
    blocklists: String,
    err: Option<(QueryStatus, u16, anyhow::Error)>,
}

/// asks the oracle about the raw query; a nonempty verdict becomes a
/// synthetic block response. an Err here means "forward to the network".
fn apply_blocklists(
    oracle: &dyn BlocklistOracle,
    q: &[u8],
) -> anyhow::Result<(Vec<u8>, String)> {
    let blocklists = oracle.block_request(q)?;
    if blocklists.is_empty() {
        anyhow::bail!("no blocklist applies");
    }
    let response = message::block_response(q)?;
    Ok((response, blocklists))
}

fn blocklists_from_header(
    oracle: &dyn BlocklistOracle,
    headers: &reqwest::header::HeaderMap,
) -> String {
    let key = oracle.stamp_header_key();
    if key.is_empty() {
        return String::new();
    }

    let stamp = headers
        .get(key.as_str())
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if stamp.is_empty() {
        return String::new();
    }

    match oracle.stamp_to_names(stamp) {
        Ok(names) => names,
        Err(err) => {
            log::error!("could not resolve blocklist stamp: {err:?}");
            String::new()
        },
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_matches(|c| c == '[' || c == ']').to_ascii_lowercase()
}
