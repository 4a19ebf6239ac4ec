//! DNS message helpers
//!
//! Builders and extractors shared by the engine and the wildcard detector:
//! [`query_msg`] builds a recursion-desired query with a randomised id,
//! [`extract_answers`] flattens a response's answer section into
//! [`ExtractedAnswer`] triples with canonically rendered data, and the name
//! helpers keep every stored name lowercase without a trailing dot.

use std::str::FromStr;

use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RData, RecordType};

use crate::error::ResolveResult;

/// One answer record reduced to comparable parts
///
/// `data` is rendered canonically per record type: dotted-quad for A,
/// colon-hex for AAAA, and trailing-dot-stripped names for CNAME and other
/// name-valued types, so equal records always compare equal as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtractedAnswer {
    /// Owner name, lowercase without trailing dot
    pub name: String,
    /// Record type
    pub rtype: RecordType,
    /// Canonically rendered record data
    pub data: String,
}

/// Extract the answer section of `msg` as [`ExtractedAnswer`] triples
pub fn extract_answers(msg: &Message) -> Vec<ExtractedAnswer> {
    msg.answers()
        .iter()
        .filter_map(|record| {
            let data = record.data().map(render_rdata)?;
            Some(ExtractedAnswer {
                name: normalize_name(&record.name().to_string()),
                rtype: record.record_type(),
                data,
            })
        })
        .collect()
}

fn render_rdata(rdata: &RData) -> String {
    match rdata {
        RData::A(a) => a.0.to_string(),
        RData::AAAA(aaaa) => aaaa.0.to_string(),
        RData::CNAME(cname) => remove_last_dot(&cname.0.to_string()).to_string(),
        RData::NS(ns) => remove_last_dot(&ns.0.to_string()).to_string(),
        RData::PTR(ptr) => remove_last_dot(&ptr.0.to_string()).to_string(),
        RData::MX(mx) => remove_last_dot(&mx.exchange().to_string()).to_string(),
        RData::SRV(srv) => remove_last_dot(&srv.target().to_string()).to_string(),
        RData::TXT(txt) => txt
            .iter()
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

/// Build a standard recursion-desired query with a randomised id
///
/// # Errors
///
/// Returns a protocol error when `name` is not a valid DNS name.
///
/// # Example
///
/// ```
/// use hickory_proto::rr::RecordType;
/// use recon_resolve::query_msg;
///
/// let msg = query_msg("example.com", RecordType::A).unwrap();
/// assert!(msg.recursion_desired());
/// assert_eq!(msg.queries().len(), 1);
/// ```
pub fn query_msg(name: &str, qtype: RecordType) -> ResolveResult<Message> {
    let name = Name::from_str(name)?;
    let mut msg = Message::new();
    msg.set_id(rand::random());
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name, qtype));
    Ok(msg)
}

/// Strip a single trailing dot
///
/// # Example
///
/// ```
/// use recon_resolve::remove_last_dot;
///
/// assert_eq!(remove_last_dot("example.com."), "example.com");
/// assert_eq!(remove_last_dot("example.com"), "example.com");
/// ```
#[must_use]
pub fn remove_last_dot(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// Canonicalise a name: lowercase, single trailing dot stripped
#[must_use]
pub fn normalize_name(name: &str) -> String {
    remove_last_dot(name).to_lowercase()
}
