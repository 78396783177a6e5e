use crate::*;

/* ========== Query Status ========== */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// transaction completed successfully
    Complete,
    /// failed to send query
    SendFailed,
    /// got a non-200 HTTP status
    HttpError,
    /// malformed input
    BadQuery,
    /// response was invalid
    BadResponse,
    /// this should never happen
    InternalError,
}

/* ========== Summary ========== */

/// summary of one DNS transaction, reported to the Listener when it is
/// complete.
#[derive(Debug, Clone)]
pub struct Summary {
    /// response (or failure) latency in seconds
    pub latency: f64,
    pub query: Vec<u8>,
    pub response: Vec<u8>,
    /// IP address of the replying server ("" if unknown)
    pub server: String,
    pub status: QueryStatus,
    /// zero unless status is Complete or HttpError
    pub http_status: u16,
    /// comma separated list of blocklist names, if any
    pub blocklists: String,
}

/* ========== Query Error ========== */

/// error returned alongside a failed query. where one could be built, a
/// synthesized SERVFAIL rides along so the caller always has bytes to
/// hand to the stub resolver.
pub struct QueryError {
    pub(crate) status: QueryStatus,
    pub(crate) http_status: u16,
    pub(crate) response: Option<Vec<u8>>,
    pub(crate) server: Option<SocketAddr>,
    pub(crate) source: anyhow::Error,
}

impl QueryError {
    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// the upstream HTTP status. nonzero only for HttpError classifications
    /// that saw an actual HTTP response.
    pub fn http_status(&self) -> u16 {
        self.http_status
    }

    /// the SERVFAIL response synthesized for this failure, if any.
    pub fn response(&self) -> Option<&[u8]> {
        self.response.as_deref()
    }

    pub fn into_response(self) -> Option<Vec<u8>> {
        self.response
    }

    /// address of the server that was reached before the failure, if one
    /// was observed at all.
    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }
}

impl core::fmt::Display for QueryError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "query failed with {:?}: {}", self.status, self.source)
    }
}

impl core::fmt::Debug for QueryError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("QueryError")
            .field("status", &self.status)
            .field("http_status", &self.http_status)
            .field("response_len", &self.response.as_ref().map(|r| r.len()))
            .field("server", &self.server)
            .field("source", &self.source)
            .finish()
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source: &(dyn std::error::Error + 'static) = self.source.as_ref();
        Some(source)
    }
}
