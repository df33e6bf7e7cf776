// Parser for the server's first flight (ServerHello .. ServerHelloDone).
//
// Only plaintext handshake messages are understood; that is enough to learn
// the negotiated version and suite, the certificate chain and whether the
// server asked for a client certificate.

use crate::errors::{HandshakeFailure, HandshakeFailureKind};

use super::{CipherSuite, TlsVersion};

pub const CONTENT_ALERT: u8 = 0x15;
pub const CONTENT_HANDSHAKE: u8 = 0x16;

const HS_SERVER_HELLO: u8 = 2;
const HS_CERTIFICATE: u8 = 11;
const HS_SERVER_KEY_EXCHANGE: u8 = 12;
const HS_CERTIFICATE_REQUEST: u8 = 13;
const HS_SERVER_HELLO_DONE: u8 = 14;
const HS_CERTIFICATE_STATUS: u8 = 22;

const ALERT_HANDSHAKE_FAILURE: u8 = 40;
const ALERT_ILLEGAL_PARAMETER: u8 = 47;
const ALERT_PROTOCOL_VERSION: u8 = 70;
const ALERT_INSUFFICIENT_SECURITY: u8 = 71;
const ALERT_INAPPROPRIATE_FALLBACK: u8 = 86;
const ALERT_CERTIFICATE_REQUIRED: u8 = 116;

/// Refuse to buffer more than this while waiting for ServerHelloDone.
pub const MAX_FLIGHT_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFlight {
    pub version: Option<TlsVersion>,
    pub cipher_suite: Option<CipherSuite>,
    pub certificates: Vec<Vec<u8>>,
    pub certificate_requested: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FlightParse {
    /// More bytes are needed.
    Incomplete,
    Complete(ServerFlight),
    Alert { level: u8, description: u8 },
}

/// Maps a TLS alert description to a handshake failure.
pub fn classify_alert(description: u8) -> HandshakeFailure {
    let kind = match description {
        ALERT_INAPPROPRIATE_FALLBACK => HandshakeFailureKind::DowngradeDetected,
        ALERT_CERTIFICATE_REQUIRED => HandshakeFailureKind::ClientCertificateRequested,
        ALERT_HANDSHAKE_FAILURE
        | ALERT_ILLEGAL_PARAMETER
        | ALERT_PROTOCOL_VERSION
        | ALERT_INSUFFICIENT_SECURITY => HandshakeFailureKind::ProtocolUnsupported,
        _ => HandshakeFailureKind::Other,
    };
    HandshakeFailure::new(kind, format!("server sent alert {description}"))
}

/// Parses everything received so far. Call again with the grown buffer
/// while the result is [`FlightParse::Incomplete`].
pub fn parse_server_flight(data: &[u8]) -> Result<FlightParse, HandshakeFailure> {
    let mut handshake = Vec::new();
    let mut offset = 0;

    while data.len() >= offset + 5 {
        let content_type = data[offset];
        let length = u16::from_be_bytes([data[offset + 3], data[offset + 4]]) as usize;
        if data.len() < offset + 5 + length {
            break;
        }
        let fragment = &data[offset + 5..offset + 5 + length];
        offset += 5 + length;

        match content_type {
            CONTENT_ALERT if fragment.len() >= 2 => {
                return Ok(FlightParse::Alert {
                    level: fragment[0],
                    description: fragment[1],
                });
            }
            CONTENT_ALERT => {
                return Err(malformed(format!(
                    "truncated alert record ({} byte fragment)",
                    fragment.len()
                )));
            }
            CONTENT_HANDSHAKE => handshake.extend_from_slice(fragment),
            other => {
                return Err(malformed(format!("unexpected record type 0x{other:02x}")));
            }
        }
    }

    if data.len() > MAX_FLIGHT_SIZE {
        return Err(malformed("server flight too large".to_string()));
    }

    parse_handshake_messages(&handshake)
}

fn parse_handshake_messages(data: &[u8]) -> Result<FlightParse, HandshakeFailure> {
    let mut flight = ServerFlight::default();
    let mut offset = 0;

    while data.len() >= offset + 4 {
        let msg_type = data[offset];
        let length = ((data[offset + 1] as usize) << 16)
            | ((data[offset + 2] as usize) << 8)
            | data[offset + 3] as usize;
        if data.len() < offset + 4 + length {
            break;
        }
        let body = &data[offset + 4..offset + 4 + length];
        offset += 4 + length;

        match msg_type {
            HS_SERVER_HELLO => parse_server_hello(body, &mut flight)?,
            HS_CERTIFICATE => flight.certificates = parse_certificates(body)?,
            HS_CERTIFICATE_REQUEST => flight.certificate_requested = true,
            HS_SERVER_HELLO_DONE => {
                if flight.version.is_none() {
                    return Err(malformed("ServerHelloDone before ServerHello".to_string()));
                }
                return Ok(FlightParse::Complete(flight));
            }
            HS_SERVER_KEY_EXCHANGE | HS_CERTIFICATE_STATUS => {}
            other => {
                return Err(malformed(format!("unexpected handshake message {other}")));
            }
        }
    }

    Ok(FlightParse::Incomplete)
}

fn parse_server_hello(body: &[u8], flight: &mut ServerFlight) -> Result<(), HandshakeFailure> {
    // version(2) random(32) session_id_len(1)
    if body.len() < 35 {
        return Err(malformed("short ServerHello".to_string()));
    }
    let raw_version = u16::from_be_bytes([body[0], body[1]]);
    flight.version = Some(TlsVersion::from_hex(raw_version).ok_or_else(|| {
        malformed(format!("unknown server version 0x{raw_version:04x}"))
    })?);

    let session_len = body[34] as usize;
    let suite_at = 35 + session_len;
    if body.len() < suite_at + 2 {
        return Err(malformed("short ServerHello".to_string()));
    }
    flight.cipher_suite = Some(CipherSuite(u16::from_be_bytes([
        body[suite_at],
        body[suite_at + 1],
    ])));
    Ok(())
}

fn parse_certificates(body: &[u8]) -> Result<Vec<Vec<u8>>, HandshakeFailure> {
    if body.len() < 3 {
        return Err(malformed("short Certificate message".to_string()));
    }
    let total = ((body[0] as usize) << 16) | ((body[1] as usize) << 8) | body[2] as usize;
    let list = body
        .get(3..3 + total)
        .ok_or_else(|| malformed("truncated certificate list".to_string()))?;

    let mut certs = Vec::new();
    let mut offset = 0;
    while offset + 3 <= list.len() {
        let len = ((list[offset] as usize) << 16)
            | ((list[offset + 1] as usize) << 8)
            | list[offset + 2] as usize;
        let cert = list
            .get(offset + 3..offset + 3 + len)
            .ok_or_else(|| malformed("truncated certificate".to_string()))?;
        certs.push(cert.to_vec());
        offset += 3 + len;
    }
    Ok(certs)
}

fn malformed(message: String) -> HandshakeFailure {
    HandshakeFailure::new(HandshakeFailureKind::Other, message)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn record(content_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![content_type, 0x03, 0x03];
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    pub(crate) fn handshake_message(msg_type: u8, body: &[u8]) -> Vec<u8> {
        let len = body.len();
        let mut out = vec![msg_type, (len >> 16) as u8, (len >> 8) as u8, len as u8];
        out.extend_from_slice(body);
        out
    }

    pub(crate) fn server_hello(version: u16, suite: u16) -> Vec<u8> {
        let mut body = version.to_be_bytes().to_vec();
        body.extend_from_slice(&[7u8; 32]);
        body.push(0);
        body.extend_from_slice(&suite.to_be_bytes());
        body.push(0);
        handshake_message(HS_SERVER_HELLO, &body)
    }

    fn certificate(ders: &[&[u8]]) -> Vec<u8> {
        let mut list = Vec::new();
        for der in ders {
            let len = der.len();
            list.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
            list.extend_from_slice(der);
        }
        let len = list.len();
        let mut body = vec![(len >> 16) as u8, (len >> 8) as u8, len as u8];
        body.extend_from_slice(&list);
        handshake_message(HS_CERTIFICATE, &body)
    }

    #[test]
    fn complete_flight_is_parsed() {
        let mut messages = server_hello(0x0303, 0xc02f);
        messages.extend(certificate(&[b"leaf", b"intermediate"]));
        messages.extend(handshake_message(HS_SERVER_HELLO_DONE, &[]));
        let data = record(CONTENT_HANDSHAKE, &messages);

        let parsed = parse_server_flight(&data).unwrap();
        assert_eq!(
            parsed,
            FlightParse::Complete(ServerFlight {
                version: Some(TlsVersion::Tls12),
                cipher_suite: Some(CipherSuite(0xc02f)),
                certificates: vec![b"leaf".to_vec(), b"intermediate".to_vec()],
                certificate_requested: false,
            })
        );
    }

    #[test]
    fn messages_split_across_records_are_reassembled() {
        let mut messages = server_hello(0x0302, 0x002f);
        messages.extend(handshake_message(HS_CERTIFICATE_REQUEST, &[1, 1, 0, 0]));
        messages.extend(handshake_message(HS_SERVER_HELLO_DONE, &[]));
        let (first, second) = messages.split_at(20);

        let mut data = record(CONTENT_HANDSHAKE, first);
        assert_eq!(parse_server_flight(&data).unwrap(), FlightParse::Incomplete);

        data.extend(record(CONTENT_HANDSHAKE, second));
        match parse_server_flight(&data).unwrap() {
            FlightParse::Complete(flight) => {
                assert_eq!(flight.version, Some(TlsVersion::Tls11));
                assert!(flight.certificate_requested);
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn partial_record_is_incomplete() {
        let data = record(CONTENT_HANDSHAKE, &server_hello(0x0303, 0xc02f));
        assert_eq!(
            parse_server_flight(&data[..data.len() - 3]).unwrap(),
            FlightParse::Incomplete
        );
    }

    #[test]
    fn alert_is_reported() {
        let data = record(CONTENT_ALERT, &[2, 86]);
        assert_eq!(
            parse_server_flight(&data).unwrap(),
            FlightParse::Alert {
                level: 2,
                description: 86
            }
        );
    }

    #[test]
    fn alerts_are_classified() {
        assert_eq!(classify_alert(86).kind, HandshakeFailureKind::DowngradeDetected);
        assert_eq!(classify_alert(40).kind, HandshakeFailureKind::ProtocolUnsupported);
        assert_eq!(classify_alert(70).kind, HandshakeFailureKind::ProtocolUnsupported);
        assert_eq!(classify_alert(71).kind, HandshakeFailureKind::ProtocolUnsupported);
        assert_eq!(
            classify_alert(116).kind,
            HandshakeFailureKind::ClientCertificateRequested
        );
        assert_eq!(classify_alert(80).kind, HandshakeFailureKind::Other);
    }

    #[test]
    fn unexpected_record_type_is_malformed() {
        let data = record(0x17, b"application data");
        let err = parse_server_flight(&data).unwrap_err();
        assert!(err.message.contains("unexpected record type 0x17"));
    }

    #[test]
    fn short_alert_is_reported_as_truncated() {
        for fragment in [&[][..], &[2u8][..]] {
            let err = parse_server_flight(&record(CONTENT_ALERT, fragment)).unwrap_err();
            assert_eq!(err.kind, HandshakeFailureKind::Other);
            assert!(err.message.contains("truncated alert"), "{}", err.message);
            assert!(!err.message.contains("unexpected record type"));
        }
    }
}
