// traits.rs
pub mod traits;
pub use traits::*;

// types.rs
pub mod types;
pub use types::*;

// ipmap.rs
pub mod ipmap;
pub use ipmap::*;

// message.rs
pub mod message;

// protocol/*.rs
pub mod protocol;
pub use protocol::*;

// testutil.rs
#[cfg(test)]
pub mod testutil;

/* ==================== */

pub use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
pub use std::path::PathBuf;
pub use std::time::Instant;

pub use core::any::Any;
pub use core::fmt::Debug;
pub use core::pin::Pin;
pub use core::time::Duration;

extern crate alloc;
pub use alloc::sync::Arc;

pub mod dns {
    pub use hickory_proto::op::*;
    pub use hickory_proto::rr::{
        domain::Name,
        dns_class::DNSClass,
        record_data::RData,
        record_type::RecordType,
        rdata,
        Record,
    };
    pub use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};

    pub use DNSClass as RdClass;
    pub use RecordType as RdType;
}

pub use smol::lock::{Mutex, RwLock};

pub use smol::net::{TcpListener, TcpStream};

pub use smol::io::{AsyncReadExt, AsyncWriteExt};

pub use smol::future::Future;

pub use bytes::Bytes;

pub use anyhow::Context;

// command line argument parser
pub use clap::Parser;

pub use smol_timeout::TimeoutExt;

/* ==================== */

/// a Listener that writes one log line per completed query.
pub struct LogListener;

impl Listener for LogListener {
    fn on_query(&self, _url: &str) -> Token {
        Box::new(Instant::now())
    }

    fn on_response(&self, _token: Token, summary: Summary) {
        log::info!(
            "query done: status={:?} http={} server={:?} latency={:.3}s blocklists={:?} ({} -> {} bytes)",
            summary.status,
            summary.http_status,
            summary.server,
            summary.latency,
            summary.blocklists,
            summary.query.len(),
            summary.response.len(),
        );
    }
}

/// reads length-framed DNS queries from a stub resolver stream and runs
/// each one through the transport concurrently. responses go back in the
/// same framing. returns once the peer shuts down or the stream misbehaves;
/// queries still in flight keep running and notice the closed stream when
/// their write fails.
pub async fn serve_stub(transport: Arc<DoHTransport>, conn: TcpStream) {
    let mut reader = conn.clone();
    let writer = Arc::new(Mutex::new(conn));

    let mut len_buf = [0u8; 2];
    loop {
        match reader.read(&mut len_buf).await {
            Ok(0) => {
                log::debug!("TCP query socket clean shutdown");
                break;
            },
            Ok(1) => {
                if let Err(_) = reader
                    .read_exact(&mut len_buf[1..])
                    .await
                    .context("incomplete query length")
                    .log_warn()
                {
                    break;
                }
            },
            Ok(_) => {},
            Err(err) => {
                log::warn!("error reading from TCP query socket: {err:?}");
                break;
            },
        }

        let qlen = u16::from_be_bytes(len_buf) as usize;
        let mut q = vec![0u8; qlen];
        if let Err(_) = reader
            .read_exact(&mut q)
            .await
            .context("incomplete query")
            .log_warn()
        {
            break;
        }

        let transport = transport.clone();
        let writer = writer.clone();
        smolscale2::spawn(async move {
            if let Err(err) = forward_query(&transport, q, &writer).await {
                log::warn!("query forwarding failed: {err:?}");
                let _ = writer.lock().await.shutdown(Shutdown::Both);
            }
        })
        .detach();
    }

    let _ = writer.lock().await.shutdown(Shutdown::Both);
}

/// sends one query through the transport and writes the framed response.
/// length prefix and body go out as a single write, so responses from
/// concurrent queries cannot interleave on the stream.
async fn forward_query(
    transport: &DoHTransport,
    q: Vec<u8>,
    writer: &Mutex<TcpStream>,
) -> anyhow::Result<()> {
    let response = match transport.query(&q).await {
        Ok(response) => response,
        Err(err) => {
            let status = err.status();
            match err.into_response() {
                Some(response) => response,
                None => anyhow::bail!("query failed without a response: {status:?}"),
            }
        },
    };

    let rlen = response.len();
    if rlen > u16::MAX as usize {
        anyhow::bail!("oversize response: {rlen}");
    }

    let mut framed = Vec::with_capacity(rlen + 2);
    framed.extend_from_slice(&(rlen as u16).to_be_bytes());
    framed.extend_from_slice(&response);

    let mut conn = writer.lock().await;
    conn.write_all(&framed)
        .await
        .context("cannot send DNS response to tcp")?;
    Ok(())
}

/* ==================== */

#[derive(Debug, Clone, clap::Parser)]
#[command(author, version, about, long_about)]
pub struct DohfwdOpt {
    /// Listen address of the local DNS-over-TCP server that the stub
    /// resolver connects to.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// URL of the upstream DoH resolver. POST-only, HTTPS required.
    #[arg(long)]
    pub doh_upstream: Option<String>,

    /// Bootstrap addresses for the DoH hostname: literal IPs, or names the
    /// platform resolver can handle. Used when the hostname lookup fails or
    /// returns non-working addresses.
    #[arg(long)]
    pub bootstrap: Vec<String>,

    /// PEM file holding a TLS client certificate chain and private key,
    /// offered to the DoH server during the handshake.
    #[arg(long)]
    pub client_cert: Option<PathBuf>,

    /// debug mode.
    #[arg(long)]
    pub debug: bool,
}

/// client identity loaded once from a PEM file on disk.
pub struct PemFileAuth {
    pem: Vec<u8>,
}

impl PemFileAuth {
    pub fn load(path: &PathBuf) -> anyhow::Result<Self> {
        let pem = std::fs::read(path)
            .context("cannot read client certificate file")?;
        Ok(Self { pem })
    }
}

impl ClientAuth for PemFileAuth {
    fn client_pem(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.pem.clone())
    }
}

#[derive(Debug)]
pub struct DNSDaemon {
    listener: TcpListener,
    transport: Arc<DoHTransport>,
}

impl DNSDaemon {
    pub async fn new(opt: DohfwdOpt) -> anyhow::Result<Self> {
        let listen = match opt.listen {
            Some(v) => v,
            None => {
                anyhow::bail!("no listen address specified!");
            },
        };
        let upstream = match opt.doh_upstream {
            Some(ref v) => v.clone(),
            None => {
                anyhow::bail!("no DoH upstream specified!");
            },
        };

        let listener = TcpListener::bind(&listen).await.log_error()?;

        let auth: Option<Arc<dyn ClientAuth>> = match opt.client_cert {
            Some(ref path) => Some(Arc::new(PemFileAuth::load(path)?)),
            None => None,
        };

        let transport = Arc::new(
            DoHTransport::new(&upstream, &opt.bootstrap, auth, Some(Arc::new(LogListener)))
                .await?,
        );

        Ok(Self { listener, transport })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        log::info!(
            "forwarding stub queries to {:?} (host {:?} port {})",
            self.transport.url(),
            self.transport.hostname(),
            self.transport.port(),
        );

        loop {
            let (conn, peer) = self.listener.accept().await.log_error()?;
            log::debug!("accepted new TCP connection from {peer:?}");

            let transport = self.transport.clone();
            smolscale2::spawn(serve_stub(transport, conn)).detach();
        }
    }
}

async fn main_async() -> anyhow::Result<()> {
    let opt = DohfwdOpt::parse();

    if opt.debug {
        log::info!("options: {opt:?}");
    }

    let daemon = DNSDaemon::new(opt).await?;
    daemon.run().await
}

fn main() -> anyhow::Result<()> {
    let ret = env_logger::builder().try_init();
    eprintln!("env_logger: try init = {ret:?}");

    smolscale2::block_on(main_async())
}
