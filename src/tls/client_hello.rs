// Hand-built ClientHello for SSL 3.0 through TLS 1.2.
//
// rustls refuses to speak anything below TLS 1.2 and has no way to send
// TLS_FALLBACK_SCSV, so those handshakes start from raw bytes.

use bytes::{BufMut, BytesMut};
use rand::RngCore;

use super::{CipherSuite, TlsVersion, TLS_FALLBACK_SCSV};

const CONTENT_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
const EXT_EC_POINT_FORMATS: u16 = 0x000b;
const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;
const EXT_RENEGOTIATION_INFO: u16 = 0xff01;

// x25519, secp256r1, secp384r1, secp521r1
const SUPPORTED_GROUPS: &[u16] = &[0x001d, 0x0017, 0x0018, 0x0019];

const SIGNATURE_ALGORITHMS: &[u16] = &[
    0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601, 0x0201, 0x0203,
];

pub struct ClientHello {
    version: TlsVersion,
    cipher_suites: Vec<CipherSuite>,
    server_name: Option<String>,
    fallback_scsv: bool,
    random: [u8; 32],
}

impl ClientHello {
    pub fn new(version: TlsVersion, cipher_suites: &[CipherSuite]) -> Self {
        let mut random = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut random);

        Self {
            version,
            cipher_suites: cipher_suites.to_vec(),
            server_name: None,
            fallback_scsv: false,
            random,
        }
    }

    pub fn with_server_name(mut self, server_name: Option<&str>) -> Self {
        self.server_name = server_name.map(str::to_string);
        self
    }

    pub fn with_fallback_scsv(mut self, enabled: bool) -> Self {
        self.fallback_scsv = enabled;
        self
    }

    /// One handshake record carrying the ClientHello.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.encode_body();

        let mut handshake = BytesMut::with_capacity(body.len() + 4);
        handshake.put_u8(HANDSHAKE_CLIENT_HELLO);
        put_u24(&mut handshake, body.len());
        handshake.put_slice(&body);

        let record_version = match self.version {
            TlsVersion::Ssl30 => 0x0300,
            _ => 0x0301,
        };

        let mut record = BytesMut::with_capacity(handshake.len() + 5);
        record.put_u8(CONTENT_HANDSHAKE);
        record.put_u16(record_version);
        record.put_u16(handshake.len() as u16);
        record.put_slice(&handshake);
        record.to_vec()
    }

    fn encode_body(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u16(self.version.as_hex());
        body.put_slice(&self.random);

        // empty session id
        body.put_u8(0);

        let mut suites: Vec<CipherSuite> = self.cipher_suites.clone();
        if self.fallback_scsv {
            suites.push(TLS_FALLBACK_SCSV);
        }
        body.put_u16((suites.len() * 2) as u16);
        for suite in &suites {
            body.put_u16(suite.0);
        }

        // null compression only
        body.put_u8(1);
        body.put_u8(0);

        // SSL 3.0 servers are not required to tolerate extensions
        if self.version > TlsVersion::Ssl30 {
            let extensions = self.encode_extensions();
            body.put_u16(extensions.len() as u16);
            body.put_slice(&extensions);
        }

        body
    }

    fn encode_extensions(&self) -> BytesMut {
        let mut ext = BytesMut::new();

        if let Some(name) = self.server_name.as_deref() {
            let mut data = BytesMut::new();
            data.put_u16((name.len() + 3) as u16);
            data.put_u8(0);
            data.put_u16(name.len() as u16);
            data.put_slice(name.as_bytes());
            put_extension(&mut ext, EXT_SERVER_NAME, &data);
        }

        let mut groups = BytesMut::new();
        groups.put_u16((SUPPORTED_GROUPS.len() * 2) as u16);
        for group in SUPPORTED_GROUPS {
            groups.put_u16(*group);
        }
        put_extension(&mut ext, EXT_SUPPORTED_GROUPS, &groups);

        // uncompressed points
        put_extension(&mut ext, EXT_EC_POINT_FORMATS, &[1, 0]);

        if self.version == TlsVersion::Tls12 {
            let mut algs = BytesMut::new();
            algs.put_u16((SIGNATURE_ALGORITHMS.len() * 2) as u16);
            for alg in SIGNATURE_ALGORITHMS {
                algs.put_u16(*alg);
            }
            put_extension(&mut ext, EXT_SIGNATURE_ALGORITHMS, &algs);
        }

        // initial handshake: empty renegotiated_connection
        put_extension(&mut ext, EXT_RENEGOTIATION_INFO, &[0]);

        ext
    }
}

fn put_extension(buf: &mut BytesMut, ext_type: u16, data: &[u8]) {
    buf.put_u16(ext_type);
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

fn put_u24(buf: &mut BytesMut, value: usize) {
    buf.put_u8(((value >> 16) & 0xff) as u8);
    buf.put_u16((value & 0xffff) as u16);
}
