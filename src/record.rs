// Publishable record schema and the conversion from a finished transaction.
//
// Field names are stable: downstream consumers index on them. Resource
// records convert per kind — address records render the address, MX/SRV/SOA
// and the DNSSEC kinds carry their RFC fields, anything else falls back to
// the parser's text form.

use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use hickory_proto::dnssec::rdata::DNSSECRData;
use hickory_proto::dnssec::{PublicKey, Verifier};
use hickory_proto::op::{Edns, Message, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::EdnsCode;
use hickory_proto::rr::{DNSClass, RData, Record as WireRecord, RecordType};
use serde::{Deserialize, Serialize};

use crate::config::ObserverConfig;
use crate::correlator::Transaction;

pub const OK_STATUS: &str = "OK";
pub const ERROR_STATUS: &str = "Error";

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub ip: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub process: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagsBody {
    pub authoritative: bool,
    pub truncated_response: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub authentic_data: bool,
    pub checking_disabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestionBody {
    pub name: String,
    #[serde(rename = "type")]
    pub qtype: String,
    pub class: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub etld_plus_one: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptBody {
    /// DO bit: DNSSEC answers acceptable.
    #[serde(rename = "do")]
    pub dnssec_ok: bool,
    pub version: String,
    pub udp_size: u16,
    pub ext_rcode: String,
    /// Present EDNS0 options by short name.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub options: Vec<String>,
}

/// One converted resource record. Kind-specific fields stay `None` for kinds
/// that do not carry them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RrBody {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: String,
    pub class: String,
    pub ttl: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub data: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub preference: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub priority: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub weight: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub port: Option<u16>,

    // SOA
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub serial: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub refresh: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retry: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expire: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub minimum: Option<u32>,

    // DNSKEY / DS / RRSIG / NSEC3 (RFC 4034/5155)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub flags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub algorithm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub digest_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub type_bits: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub iterations: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub salt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub type_covered: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub labels: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original_ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expiration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub inception: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signer_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsBody {
    pub id: u16,
    pub op_code: String,
    pub flags: FlagsBody,
    pub response_code: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub question: Option<QuestionBody>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub opt: Option<OptBody>,
    pub answers_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub answers: Vec<RrBody>,
    pub authorities_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub authorities: Vec<RrBody>,
    pub additionals_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub additionals: Vec<RrBody>,
}

/// One emitted per-transaction record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "type")]
    pub kind: String,
    /// RFC 3339, from the transaction start.
    pub timestamp: String,
    pub transport: String,
    pub src: EndpointRecord,
    pub dst: EndpointRecord,
    pub status: String,
    /// Space-joined note codes.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub notes: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub method: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub query: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub resource: String,
    /// Milliseconds; present only when both sides were captured.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response_time: Option<f64>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response: Option<String>,
    pub dns: DnsBody,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Populate a record from a finished transaction. Which fields are present
/// depends on which sides of the exchange were captured.
pub fn build_record(trans: &Transaction, cfg: &ObserverConfig) -> Record {
    let mut record = Record {
        kind: "dns".to_string(),
        timestamp: timestamp_rfc3339(trans.ts),
        transport: trans.transport.to_string(),
        src: EndpointRecord {
            ip: trans.tuple.src_ip.to_string(),
            port: trans.tuple.src_port,
            process: None,
        },
        dst: EndpointRecord {
            ip: trans.tuple.dst_ip.to_string(),
            port: trans.tuple.dst_port,
            process: None,
        },
        status: ERROR_STATUS.to_string(),
        notes: trans
            .notes
            .iter()
            .map(|n| n.code())
            .collect::<Vec<_>>()
            .join(" "),
        ..Default::default()
    };

    match (&trans.request, &trans.response) {
        (Some(request), Some(response)) => {
            record.bytes_in = request.length as u64;
            record.bytes_out = response.length as u64;
            record.response_time = Some(
                response
                    .ts
                    .duration_since(trans.ts)
                    .unwrap_or_default()
                    .as_secs_f64()
                    * 1e3,
            );
            record.method = opcode_name(request.data.op_code());
            if let Some(q) = request.data.queries().first() {
                record.query = question_string(q);
                record.resource = q.name().to_utf8();
            }
            record.dns = message_body(&response.data, cfg);
            if response.data.response_code() == ResponseCode::NoError {
                record.status = OK_STATUS.to_string();
            }
            if cfg.send_request {
                record.request = Some(message_string(&request.data));
            }
            if cfg.send_response {
                record.response = Some(message_string(&response.data));
            }
        }
        (Some(request), None) => {
            record.bytes_in = request.length as u64;
            record.method = opcode_name(request.data.op_code());
            if let Some(q) = request.data.queries().first() {
                record.query = question_string(q);
                record.resource = q.name().to_utf8();
            }
            record.dns = message_body(&request.data, cfg);
            if cfg.send_request {
                record.request = Some(message_string(&request.data));
            }
        }
        (None, Some(response)) => {
            record.bytes_out = response.length as u64;
            record.method = opcode_name(response.data.op_code());
            if let Some(q) = response.data.queries().first() {
                record.query = question_string(q);
                record.resource = q.name().to_utf8();
            }
            record.dns = message_body(&response.data, cfg);
            if cfg.send_response {
                record.response = Some(message_string(&response.data));
            }
        }
        (None, None) => {}
    }

    record
}

/// Convert one parsed message into the record's `dns` object.
fn message_body(msg: &Message, cfg: &ObserverConfig) -> DnsBody {
    let mut body = DnsBody {
        id: msg.id(),
        op_code: opcode_name(msg.op_code()),
        flags: FlagsBody {
            authoritative: msg.authoritative(),
            truncated_response: msg.truncated(),
            recursion_desired: msg.recursion_desired(),
            recursion_available: msg.recursion_available(),
            authentic_data: msg.authentic_data(),
            checking_disabled: msg.checking_disabled(),
        },
        response_code: rcode_name(msg.response_code()),
        ..Default::default()
    };

    if let Some(q) = msg.queries().first() {
        let name = q.name().to_utf8();
        body.question = Some(QuestionBody {
            etld_plus_one: etld_plus_one(&name),
            name,
            qtype: type_name(q.query_type()),
            class: class_name(q.query_class()),
        });
    }

    if let Some(edns) = msg.extensions() {
        body.opt = Some(opt_body(edns, msg.response_code()));
    }

    body.answers_count = msg.answers().len();
    body.answers = rrs_to_bodies(msg.answers());

    body.authorities_count = msg.name_servers().len();
    if cfg.include_authorities {
        body.authorities = rrs_to_bodies(msg.name_servers());
    }

    // The parser lifts the OPT pseudo-RR out of the additional section, so
    // the remaining records are the countable ones.
    body.additionals_count = msg.additionals().len();
    if cfg.include_additionals {
        body.additionals = rrs_to_bodies(msg.additionals());
    }

    body
}

fn opt_body(edns: &Edns, rcode: ResponseCode) -> OptBody {
    let mut options: Vec<String> = edns
        .options()
        .as_ref()
        .iter()
        .map(|(code, _)| edns_code_name(*code))
        .collect();
    options.sort();

    let ext = ((edns.rcode_high() as u16) << 4) | (u16::from(rcode) & 0x0F);
    OptBody {
        dnssec_ok: edns.flags().dnssec_ok,
        version: edns.version().to_string(),
        udp_size: edns.max_payload(),
        ext_rcode: rcode_value_name(ext),
        options,
    }
}

fn rrs_to_bodies(records: &[WireRecord]) -> Vec<RrBody> {
    records.iter().filter_map(rr_to_body).collect()
}

/// Convert one resource record. The OPT pseudo-RR yields `None`.
fn rr_to_body(rr: &WireRecord) -> Option<RrBody> {
    let mut body = RrBody {
        name: rr.name().to_utf8(),
        rtype: type_name(rr.record_type()),
        class: class_name(rr.dns_class()),
        ttl: rr.ttl().to_string(),
        ..Default::default()
    };

    match rr.data() {
        RData::A(a) => body.data = a.0.to_string(),
        RData::AAAA(aaaa) => body.data = aaaa.0.to_string(),
        RData::CNAME(cname) => body.data = cname.0.to_utf8(),
        RData::MX(mx) => {
            body.preference = Some(mx.preference());
            body.data = mx.exchange().to_utf8();
        }
        RData::NS(ns) => body.data = ns.0.to_utf8(),
        RData::PTR(ptr) => body.data = ptr.0.to_utf8(),
        RData::SOA(soa) => {
            body.rname = Some(soa.rname().to_utf8());
            body.serial = Some(soa.serial());
            body.refresh = Some(soa.refresh());
            body.retry = Some(soa.retry());
            body.expire = Some(soa.expire());
            body.minimum = Some(soa.minimum());
            body.data = soa.mname().to_utf8();
        }
        RData::SRV(srv) => {
            body.priority = Some(srv.priority());
            body.weight = Some(srv.weight());
            body.port = Some(srv.port());
            body.data = srv.target().to_utf8();
        }
        RData::TXT(txt) => {
            body.data = txt
                .txt_data()
                .iter()
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
        }
        RData::OPT(_) => return None,
        RData::DNSSEC(DNSSECRData::DNSKEY(dnskey)) => {
            body.flags = Some(dnskey.flags().to_string());
            body.protocol = Some("3".to_string());
            body.algorithm = Some(format!("{:?}", dnskey.algorithm()));
            body.data = STANDARD.encode(dnskey.public_key().public_bytes());
        }
        RData::DNSSEC(DNSSECRData::DS(ds)) => {
            body.key_tag = Some(ds.key_tag().to_string());
            body.algorithm = Some(format!("{:?}", ds.algorithm()));
            body.digest_type = Some(format!("{:?}", ds.digest_type()));
            body.data = hex_upper(ds.digest());
        }
        RData::DNSSEC(DNSSECRData::RRSIG(rrsig)) => {
            body.type_covered = Some(type_name(rrsig.type_covered()));
            body.algorithm = Some(format!("{:?}", rrsig.algorithm()));
            body.labels = Some(rrsig.num_labels().to_string());
            body.original_ttl = Some(rrsig.original_ttl().to_string());
            body.expiration = Some(rrsig.sig_expiration().get().to_string());
            body.inception = Some(rrsig.sig_inception().get().to_string());
            body.key_tag = Some(rrsig.key_tag().to_string());
            body.signer_name = Some(rrsig.signer_name().to_utf8());
            body.data = STANDARD.encode(rrsig.sig());
        }
        RData::DNSSEC(DNSSECRData::NSEC(nsec)) => {
            body.type_bits = Some(type_bits_string(nsec.type_bit_maps()));
            body.data = nsec.next_domain_name().to_utf8();
        }
        RData::DNSSEC(DNSSECRData::NSEC3(nsec3)) => {
            body.hash = Some(format!("{:?}", nsec3.hash_algorithm()));
            body.flags = Some(u8::from(nsec3.opt_out()).to_string());
            body.iterations = Some(nsec3.iterations().to_string());
            body.salt = Some(salt_string(nsec3.salt()));
            body.type_bits = Some(type_bits_string(nsec3.type_bit_maps()));
            body.data = hex_upper(nsec3.next_hashed_owner_name());
        }
        RData::DNSSEC(DNSSECRData::NSEC3PARAM(param)) => {
            body.hash = Some(format!("{:?}", param.hash_algorithm()));
            body.flags = Some(u8::from(param.opt_out()).to_string());
            body.iterations = Some(param.iterations().to_string());
            body.data = salt_string(param.salt());
        }
        other => body.data = other.to_string(),
    }

    Some(body)
}

/// `class <C>, type <T>, <NAME>` — the record's `query` field format.
fn question_string(q: &Query) -> String {
    format!(
        "class {}, type {}, {}",
        class_name(q.query_class()),
        type_name(q.query_type()),
        q.name().to_utf8()
    )
}

/// Compact single-line rendering of a message for the optional raw
/// request/response fields.
fn message_string(msg: &Message) -> String {
    let qr = if msg.message_type() == hickory_proto::op::MessageType::Response {
        "response"
    } else {
        "query"
    };

    let mut flags = Vec::new();
    if msg.authoritative() {
        flags.push("aa");
    }
    if msg.truncated() {
        flags.push("tc");
    }
    if msg.recursion_desired() {
        flags.push("rd");
    }
    if msg.recursion_available() {
        flags.push("ra");
    }
    if msg.authentic_data() {
        flags.push("ad");
    }
    if msg.checking_disabled() {
        flags.push("cd");
    }

    let mut parts = vec![format!(
        "ID {}; QR {}; OPCODE {}; FLAGS {}; RCODE {}",
        msg.id(),
        qr,
        opcode_name(msg.op_code()),
        flags.join(" "),
        rcode_name(msg.response_code())
    )];

    if !msg.queries().is_empty() {
        let questions: Vec<String> = msg.queries().iter().map(question_string).collect();
        parts.push(format!("QUESTION {}", questions.join("; ")));
    }
    for (label, records) in [
        ("ANSWER", msg.answers()),
        ("AUTHORITY", msg.name_servers()),
        ("ADDITIONAL", msg.additionals()),
    ] {
        if records.is_empty() {
            continue;
        }
        let datas: Vec<String> = rrs_to_bodies(records).into_iter().map(|b| b.data).collect();
        parts.push(format!("{} {}", label, datas.join("; ")));
    }
    parts.join("; ")
}

// ---------------------------------------------------------------------------
// Name tables
// ---------------------------------------------------------------------------

pub fn opcode_name(op: OpCode) -> String {
    match op {
        OpCode::Query => "QUERY".to_string(),
        OpCode::Status => "STATUS".to_string(),
        OpCode::Notify => "NOTIFY".to_string(),
        OpCode::Update => "UPDATE".to_string(),
        other => format!("OPCODE{}", u8::from(other)),
    }
}

pub fn rcode_name(code: ResponseCode) -> String {
    rcode_value_name(u16::from(code))
}

fn rcode_value_name(value: u16) -> String {
    match value {
        0 => "NOERROR".to_string(),
        1 => "FORMERR".to_string(),
        2 => "SERVFAIL".to_string(),
        3 => "NXDOMAIN".to_string(),
        4 => "NOTIMP".to_string(),
        5 => "REFUSED".to_string(),
        6 => "YXDOMAIN".to_string(),
        7 => "YXRRSET".to_string(),
        8 => "NXRRSET".to_string(),
        9 => "NOTAUTH".to_string(),
        10 => "NOTZONE".to_string(),
        16 => "BADVERS".to_string(),
        17 => "BADKEY".to_string(),
        18 => "BADTIME".to_string(),
        19 => "BADMODE".to_string(),
        20 => "BADNAME".to_string(),
        21 => "BADALG".to_string(),
        22 => "BADTRUNC".to_string(),
        23 => "BADCOOKIE".to_string(),
        n => format!("RCODE{n}"),
    }
}

fn class_name(class: DNSClass) -> String {
    match class {
        DNSClass::IN => "IN".to_string(),
        DNSClass::CH => "CH".to_string(),
        DNSClass::HS => "HS".to_string(),
        DNSClass::NONE => "NONE".to_string(),
        DNSClass::ANY => "ANY".to_string(),
        other => format!("CLASS{}", u16::from(other)),
    }
}

fn type_name(rtype: RecordType) -> String {
    match rtype {
        RecordType::Unknown(code) => format!("TYPE{code}"),
        other => other.to_string(),
    }
}

fn edns_code_name(code: EdnsCode) -> String {
    match code {
        EdnsCode::LLQ => "llq".to_string(),
        EdnsCode::UL => "ul".to_string(),
        EdnsCode::NSID => "nsid".to_string(),
        EdnsCode::DAU => "dau".to_string(),
        EdnsCode::DHU => "dhu".to_string(),
        EdnsCode::N3U => "n3u".to_string(),
        EdnsCode::Subnet => "subnet".to_string(),
        EdnsCode::Cookie => "cookie".to_string(),
        EdnsCode::Keepalive => "keepalive".to_string(),
        EdnsCode::Padding => "padding".to_string(),
        other => format!("{other:?}").to_lowercase(),
    }
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

fn timestamp_rfc3339(ts: SystemTime) -> String {
    DateTime::<Utc>::from(ts).to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn etld_plus_one(name: &str) -> Option<String> {
    psl::domain_str(name.trim_end_matches('.')).map(|domain| format!("{domain}."))
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// NSEC3 salt rendering: uppercase hex, `-` when empty.
fn salt_string(salt: &[u8]) -> String {
    if salt.is_empty() {
        "-".to_string()
    } else {
        hex_upper(salt)
    }
}

fn type_bits_string<I>(bits: I) -> String
where
    I: IntoIterator,
    I::Item: std::fmt::Display,
{
    let parts: Vec<String> = bits.into_iter().map(|t| t.to_string()).collect();
    parts.join(" ")
}
