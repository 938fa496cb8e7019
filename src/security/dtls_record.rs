//! Inspection of raw DTLS records, used to sanity check datagrams before handing them to the
//!  DTLS state machine, and for trace logging.
//!
//! Record header, all numbers in network byte order:
//! ```ascii
//!  0: content type (u8)
//!  1: version (u16) - 0xFEFF for DTLS 1.0, 0xFEFD for DTLS 1.2
//!  3: epoch (u16)
//!  5: sequence number (u48)
//! 11: length (u16) - of the fragment after the header
//! ```

use std::fmt::Write;

pub const RECORD_HEADER_LEN: usize = 13;
pub const MAX_FRAGMENT_LEN: usize = 16384;

const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_HELLO_VERIFY_REQUEST: u8 = 3;

fn content_type_name(content_type: u8) -> &'static str {
    match content_type {
        20 => "change_cipher_spec",
        21 => "alert",
        22 => "handshake",
        23 => "application_data",
        _ => "DTLS_unknown_type",
    }
}

fn version_name(version: u16) -> &'static str {
    match version {
        0xfeff => "DTLS1.0",
        0xfefd => "DTLS1.2",
        _ => "DTLS_unknown_version",
    }
}

fn handshake_type_name(handshake_type: u8) -> &'static str {
    match handshake_type {
        0 => "hello_request",
        1 => "client_hello",
        2 => "server_hello",
        3 => "hello_verify_request",
        4 => "new_session_ticket",
        11 => "certificate",
        12 => "server_key_exchange",
        13 => "certificate_request",
        14 => "server_hello_done",
        15 => "certificate_verify",
        16 => "client_key_exchange",
        20 => "finished",
        22 => "certificate_status",
        23 => "supplemental_data",
        67 => "next_proto",
        203 => "encrypted_extensions",
        _ => "DTLS_unknown_handshake_type",
    }
}

pub fn to_hex(data: &[u8]) -> String {
    let mut result = String::with_capacity(2 * data.len());
    for b in data {
        let _ = write!(result, "{:02X}", b);
    }
    result
}

fn u24(data: &[u8]) -> u32 {
    (data[0] as u32) << 16 | (data[1] as u32) << 8 | data[2] as u32
}

/// Returns the total length (including the header) of the DTLS record at the start of `buf`,
///  or 0 if there is no complete, plausible record.
pub fn record_length(buf: &[u8]) -> usize {
    if buf.len() < RECORD_HEADER_LEN {
        return 0;
    }
    if buf[1] != 0xfe || (buf[2] != 0xff && buf[2] != 0xfd) {
        return 0;
    }

    let fragment_len = u16::from_be_bytes([buf[11], buf[12]]) as usize;
    if fragment_len > MAX_FRAGMENT_LEN {
        return 0;
    }

    let result = fragment_len + RECORD_HEADER_LEN;
    if result > buf.len() {
        0
    }
    else {
        result
    }
}

/// Iterates over the records in a datagram, stopping at the first invalid record
pub fn records(mut datagram: &[u8]) -> impl Iterator<Item = &[u8]> {
    std::iter::from_fn(move || {
        let len = record_length(datagram);
        if len == 0 {
            return None;
        }
        let (record, rest) = datagram.split_at(len);
        datagram = rest;
        Some(record)
    })
}

/// Checks if a datagram starts with an unencrypted handshake record, which is the only thing
///  a client may legitimately send to open a DTLS session.
pub fn is_handshake_start(datagram: &[u8]) -> bool {
    record_length(datagram) > 0
        && datagram[0] == CONTENT_TYPE_HANDSHAKE
        && u16::from_be_bytes([datagram[3], datagram[4]]) == 0
}

/// A human readable, one-line description of the DTLS record at the start of `buf`.
///
/// Fragments are encrypted for epochs > 0, so details beyond the record header are available
///  only for unencrypted handshake records. For those, the handshake message header is decoded,
///  and cookies are shown for `hello_verify_request` and `client_hello`.
pub fn describe_record(buf: &[u8]) -> String {
    let record_len = record_length(buf);
    if record_len == 0 {
        return format!("Invalid DTLS message: {}", to_hex(buf));
    }

    let content_type = buf[0];
    let version = u16::from_be_bytes([buf[1], buf[2]]);
    let epoch = u16::from_be_bytes([buf[3], buf[4]]);
    let sequence_number = buf[5..11].iter()
        .fold(0u64, |acc, &b| acc << 8 | b as u64);

    let mut result = format!("{} {}({}) len={} epoch={} seq={}",
        version_name(version),
        content_type_name(content_type),
        content_type,
        record_len,
        epoch,
        sequence_number,
    );

    if epoch > 0 {
        result.push_str(" [encrypted]");
    }
    else if content_type == CONTENT_TYPE_HANDSHAKE {
        if record_len >= 25 {
            describe_handshake(&buf[..record_len], &mut result);
        }
        else {
            result.push_str(" [truncated]");
        }
    }

    result
}

/// Handshake message header after the record header:
/// ```ascii
/// 13: message type (u8)
/// 14: message length (u24)
/// 17: message sequence (u16)
/// 19: fragment offset (u24)
/// 22: fragment length (u24)
/// 25: fragment
/// ```
fn describe_handshake(record: &[u8], result: &mut String) {
    let record_len = record.len();
    let handshake_type = record[13];

    let _ = write!(result, " {}({}) msgLen={} msgSeq={} fragmentOffset={} ({} bytes)",
        handshake_type_name(handshake_type),
        handshake_type,
        u24(&record[14..17]),
        u16::from_be_bytes([record[17], record[18]]),
        u24(&record[19..22]),
        u24(&record[22..25]),
    );

    // hello_verify_request: server version (2 bytes), then the length-prefixed cookie
    if handshake_type == HANDSHAKE_HELLO_VERIFY_REQUEST && record_len >= 28 {
        let cookie_len = record[27] as usize;
        if cookie_len != record_len - 28 {
            result.push_str(" [malformed]");
        }
        else if cookie_len > 0 {
            let _ = write!(result, " cookie={}", to_hex(&record[28..28 + cookie_len]));
        }
    }
    // client_hello: client version (2 bytes), random (32 bytes), empty session id (1 byte),
    //  then the length-prefixed cookie
    else if handshake_type == HANDSHAKE_CLIENT_HELLO && record_len >= 61 {
        let cookie_len = record[60] as usize;
        if cookie_len > record_len - 61 {
            result.push_str(" [malformed]");
        }
        else if cookie_len > 0 {
            let _ = write!(result, " cookie={}", to_hex(&record[61..61 + cookie_len]));
        }
    }
}
