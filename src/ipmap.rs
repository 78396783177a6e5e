//! hostname -> candidate/confirmed IP bookkeeping for the DoH endpoint.
//!
//! the HTTP client resolves every hostname through [`IPMap`], so the set's
//! preference order (last-known-good address first) decides which address
//! gets dialed. candidates come from user-supplied bootstrap entries and
//! from the resolver callback; the confirmed slot is fed back by the
//! transport after each exchange.

use crate::*;

/// name-resolution callback used to populate sets from non-literal
/// bootstrap entries and on first access to an unknown hostname.
pub type Resolver =
    Arc<dyn Fn(String) -> PinFut<'static, anyhow::Result<Vec<IpAddr>>> + Send + Sync>;

/// resolver backed by the platform resolver.
pub fn system_resolver() -> Resolver {
    Arc::new(|host: String| {
        Box::pin(async move {
            let addrs = smol::net::resolve((host.as_str(), 0u16)).await?;

            let mut ips: Vec<IpAddr> = Vec::new();
            for addr in addrs {
                if !ips.contains(&addr.ip()) {
                    ips.push(addr.ip());
                }
            }
            Ok(ips)
        })
    })
}

#[derive(Clone)]
pub struct IPMap {
    map: Arc<scc::HashMap<String, IPSet>>,
    resolver: Resolver,
}

impl Debug for IPMap {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("IPMap").field("hosts", &self.map.len()).finish()
    }
}

impl IPMap {
    pub fn new(resolver: Resolver) -> Self {
        Self {
            map: Arc::new(scc::HashMap::new()),
            resolver,
        }
    }

    /// returns the set for `host`, creating it if missing. a newly created
    /// (or still empty) set is populated through the resolver callback;
    /// resolution failures leave it empty rather than erroring.
    pub async fn get(&self, host: &str) -> IPSet {
        let host = normalize(host);

        let set = self
            .map
            .entry_async(host.clone())
            .await
            .or_insert_with(IPSet::default)
            .get()
            .clone();

        if set.is_empty().await {
            match (self.resolver)(host.clone()).await {
                Ok(ips) => {
                    for ip in ips {
                        set.add(ip).await;
                    }
                },
                Err(err) => {
                    log::debug!("no addresses resolved for {host:?}: {err:?}");
                },
            }
        }

        set
    }

    /// seeds the set for `host`. each entry is taken as a literal IP, or
    /// else as a name for the resolver callback; entries that resolve to
    /// nothing are dropped silently. an empty outcome is not an error.
    pub async fn seed(&self, host: &str, seeds: &[String]) -> IPSet {
        let host = normalize(host);

        let set = self
            .map
            .entry_async(host)
            .await
            .or_insert_with(IPSet::default)
            .get()
            .clone();

        for entry in seeds {
            if let Ok(ip) = entry.parse::<IpAddr>() {
                set.add(ip).await;
                continue;
            }
            match (self.resolver)(normalize(entry)).await {
                Ok(ips) => {
                    for ip in ips {
                        set.add(ip).await;
                    }
                },
                Err(err) => {
                    log::debug!("dropping unresolvable bootstrap entry {entry:?}: {err:?}");
                },
            }
        }

        set
    }
}

impl reqwest::dns::Resolve for IPMap {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let this = self.clone();
        Box::pin(async move {
            let set = this.get(name.as_str()).await;
            let ips = set.ordered().await;

            if ips.is_empty() {
                let msg = format!("no usable addresses for {:?}", name.as_str());
                log::warn!("{}", &msg);
                let err: Box<dyn std::error::Error + Send + Sync> = Box::new(
                    std::io::Error::new(std::io::ErrorKind::Unsupported, msg),
                );
                return Err(err);
            }

            // ports given here are ignored; the HTTP client substitutes the
            // port of the URL being fetched.
            let addrs: Vec<SocketAddr> =
                ips.into_iter().map(|ip| SocketAddr::new(ip, 0)).collect();

            let ok: Box<dyn Iterator<Item = SocketAddr> + Send> =
                Box::new(addrs.into_iter());
            Ok(ok)
        })
    }
}

fn normalize(host: &str) -> String {
    host.trim_matches(|c| c == '[' || c == ']').to_ascii_lowercase()
}

/* ========== IP Set ========== */

/// ordered candidate addresses for one hostname, plus the most recent
/// address observed to complete a successful exchange.
#[derive(Debug, Clone, Default)]
pub struct IPSet {
    inner: Arc<Mutex<IPSetInner>>,
}

#[derive(Debug, Default)]
struct IPSetInner {
    ips: Vec<IpAddr>,
    confirmed: Option<IpAddr>,
}

impl IPSet {
    /// adds a candidate. duplicates are kept out; insertion order is
    /// preserved otherwise.
    pub async fn add(&self, ip: IpAddr) {
        let mut inner = self.inner.lock().await;
        if !inner.ips.contains(&ip) {
            inner.ips.push(ip);
        }
    }

    pub async fn get_all(&self) -> Vec<IpAddr> {
        self.inner.lock().await.ips.clone()
    }

    pub async fn confirmed(&self) -> Option<IpAddr> {
        self.inner.lock().await.confirmed
    }

    /// records a working address: it joins the candidates if new, and
    /// becomes the preferred one.
    pub async fn confirm(&self, ip: IpAddr) {
        let mut inner = self.inner.lock().await;
        if !inner.ips.contains(&ip) {
            inner.ips.push(ip);
        }
        inner.confirmed = Some(ip);
    }

    /// forgets a confirmed address, but only if `ip` is still the
    /// confirmed one (compare-and-clear).
    pub async fn disconfirm(&self, ip: IpAddr) {
        let mut inner = self.inner.lock().await;
        if inner.confirmed == Some(ip) {
            inner.confirmed = None;
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.ips.is_empty()
    }

    /// candidates in dial preference order: the confirmed address first,
    /// then the remaining ones in insertion order.
    pub async fn ordered(&self) -> Vec<IpAddr> {
        let inner = self.inner.lock().await;
        let mut out = Vec::with_capacity(inner.ips.len());
        if let Some(confirmed) = inner.confirmed {
            out.push(confirmed);
        }
        for ip in inner.ips.iter() {
            if Some(*ip) != inner.confirmed {
                out.push(*ip);
            }
        }
        out
    }
}
