//! DNS wire message helpers: SERVFAIL synthesis, EDNS(0) padding, and the
//! synthetic responses handed out for blocked queries.

use crate::*;

/// queries grow to a multiple of this before leaving the device, so a
/// passive observer cannot size-correlate them.
pub const PADDING_BLOCK_SIZE: usize = 128;

// OPTION-CODE + OPTION-LENGTH of the padding option itself.
const OPT_PADDING_HEADER_LEN: usize = 4;

const EDNS_MAX_PAYLOAD: u16 = 4096;

/// ttl of the synthetic answers returned for blocked queries.
const BLOCK_TTL: u32 = 10800;

/// builds a SERVFAIL response to the query `q`.
pub fn servfail(q: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut msg = dns::Message::from_vec(q)?;

    msg.set_message_type(dns::MessageType::Response);
    msg.set_recursion_available(true);
    msg.set_response_code(dns::ResponseCode::ServFail);

    // strip EDNS
    msg.additionals_mut().clear();
    msg.extensions_mut().take();

    Ok(msg.to_vec()?)
}

/// servfail() for callers that can live without a response.
pub fn try_servfail(q: &[u8]) -> Option<Vec<u8>> {
    match servfail(q) {
        Ok(v) => Some(v),
        Err(err) => {
            log::warn!("cannot construct servfail: {err:?}");
            None
        },
    }
}

/// builds the response handed to the stub when a query is blocked:
/// unspecified-address answers for A and AAAA, NXDOMAIN for everything
/// else.
pub fn block_response(q: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut msg = dns::Message::from_vec(q)?;

    msg.set_message_type(dns::MessageType::Response);
    msg.set_recursion_available(true);
    msg.additionals_mut().clear();
    msg.extensions_mut().take();

    let query = match msg.queries().first() {
        Some(v) => v.clone(),
        None => anyhow::bail!("blocked query has no question section"),
    };

    match query.query_type() {
        dns::RdType::A => {
            let rdata = dns::RData::A(dns::rdata::A::from(Ipv4Addr::UNSPECIFIED));
            msg.add_answer(dns::Record::from_rdata(query.name().clone(), BLOCK_TTL, rdata));
        },
        dns::RdType::AAAA => {
            let rdata = dns::RData::AAAA(dns::rdata::AAAA::from(Ipv6Addr::UNSPECIFIED));
            msg.add_answer(dns::Record::from_rdata(query.name().clone(), BLOCK_TTL, rdata));
        },
        _ => {
            msg.set_response_code(dns::ResponseCode::NXDomain);
        },
    }

    Ok(msg.to_vec()?)
}

/// pads `q` with an EDNS(0) padding option so its wire length becomes a
/// multiple of [`PADDING_BLOCK_SIZE`]. queries that already carry a padding
/// option are passed through unchanged. the returned buffer is always an
/// owned copy; `q` itself is never touched.
pub fn add_edns_padding(q: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut msg = dns::Message::from_vec(q)?;

    if let Some(edns) = msg.extensions() {
        if edns.options().get(dns::EdnsCode::Padding).is_some() {
            return Ok(q.to_vec());
        }
    }

    if msg.extensions().is_none() {
        let mut edns = dns::Edns::new();
        edns.set_max_payload(EDNS_MAX_PAYLOAD);
        edns.set_version(0);
        *msg.extensions_mut() = Some(edns);
    }

    // length with the OPT record present but before the padding option; the
    // option header itself takes OPT_PADDING_HEADER_LEN bytes on the wire.
    let unpadded_len = msg.to_vec()?.len();
    let pad_len = (PADDING_BLOCK_SIZE
        - (unpadded_len + OPT_PADDING_HEADER_LEN) % PADDING_BLOCK_SIZE)
        % PADDING_BLOCK_SIZE;

    if let Some(edns) = msg.extensions_mut() {
        edns.options_mut().insert(dns::EdnsOption::Unknown(
            dns::EdnsCode::Padding.into(),
            vec![0u8; pad_len],
        ));
    }

    Ok(msg.to_vec()?)
}
