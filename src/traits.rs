use crate::*;

pub type PinFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// opaque per-query handle minted by a Listener on query entry,
/// handed back unchanged together with the Summary.
pub type Token = Box<dyn Any + Send>;

/// receives the outcome of every query passed through a transport.
pub trait Listener: Send + Sync + 'static {
    /// called once when a query enters the transport.
    fn on_query(&self, url: &str) -> Token;

    /// called once per query regardless of outcome.
    fn on_response(&self, token: Token, summary: Summary);
}

/// blocklist policy engine consulted before and after the network call.
/// implementations may hold state; the transport takes one snapshot per
/// pipeline step, so a replacement during an in-flight query does not tear.
pub trait BlocklistOracle: Send + Sync + 'static {
    /// whether local (on-device) blocking is enabled at all.
    fn on_device_block(&self) -> bool;

    /// names of the blocklists matching this wire-format query, as CSV.
    /// empty means "not blocked".
    fn block_request(&self, query: &[u8]) -> anyhow::Result<String>;

    /// names of the blocklists matching this wire-format answer, as CSV.
    fn block_response(&self, answer: &[u8]) -> anyhow::Result<String>;

    /// name of the response header carrying the upstream block stamp.
    fn stamp_header_key(&self) -> String;

    /// translate an upstream block stamp into blocklist names (CSV).
    fn stamp_to_names(&self, stamp: &str) -> anyhow::Result<String>;
}

/// supplies a TLS client identity when the DoH server demands one.
pub trait ClientAuth: Send + Sync + 'static {
    /// PEM bundle holding the client certificate chain and its private key.
    fn client_pem(&self) -> anyhow::Result<Vec<u8>>;
}

pub trait LogResult: Debug + Sized {
    fn log_generic(self, level: log::Level) -> Self;

    fn log_error(self) -> Self {
        self.log_generic(log::Level::Error)
    }

    fn log_warn(self) -> Self {
        self.log_generic(log::Level::Warn)
    }

    fn log_info(self) -> Self {
        self.log_generic(log::Level::Info)
    }

    fn log_debug(self) -> Self {
        self.log_generic(log::Level::Debug)
    }
    fn log_trace(self) -> Self {
        self.log_generic(log::Level::Trace)
    }
}

impl<T: Debug, E: Debug> LogResult for Result<T, E> {
    fn log_generic(self, level: log::Level) -> Self {
        if let Err(_) = self {
            log::log!(level, "{:?}", self);
        }
        self
    }
}
impl<T: Debug, E: Debug> LogResult for &Result<T, E> {
    fn log_generic(self, level: log::Level) -> Self {
        if let Err(_) = self {
            log::log!(level, "{:?}", self);
        }
        self
    }
}
