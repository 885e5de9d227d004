use super::ListenerError;
use crate::config::PROGRAM;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose,
};
use rustls::sign::CertifiedKey;
use rustls::{Certificate as RustlsCertificate, PrivateKey};
use rustls_pemfile::{certs, ec_private_keys, pkcs8_private_keys, rsa_private_keys};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{GeneralName, ParsedExtension, SubjectAlternativeName};
use x509_parser::prelude::FromDer;

const CERT_VALIDITY_DAYS: i64 = 365;
const CLOCK_SKEW_HOURS: i64 = 1;

/// Serving certificate as cached in every storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertRecord {
    /// Leaf followed by the issuing CA.
    pub cert_pem: String,
    pub key_pem: String,
    pub sans: Vec<String>,
    pub not_after: DateTime<Utc>,
    /// SHA-256 of the leaf DER, hex encoded.
    pub fingerprint: String,
}

impl CertRecord {
    /// Builds a record from PEM material, deriving metadata from the leaf.
    pub fn from_pem(cert_pem: String, key_pem: String) -> Result<Self, ListenerError> {
        let chain = parse_chain(&cert_pem)?;
        let leaf = chain
            .first()
            .ok_or_else(|| ListenerError::InvalidCertificate("empty chain".into()))?;
        let (_, cert) = X509Certificate::from_der(&leaf.0)
            .map_err(|err| ListenerError::InvalidCertificate(err.to_string()))?;
        let not_after = as_utc(&cert.validity().not_after)?;
        let sans = subject_alt_names(&cert);
        parse_private_key(&key_pem)?;
        Ok(Self {
            fingerprint: hex::encode(Sha256::digest(&leaf.0)),
            cert_pem,
            key_pem,
            sans,
            not_after,
        })
    }

    pub fn expires_within(&self, window: ChronoDuration, now: DateTime<Utc>) -> bool {
        self.not_after - now <= window
    }

    pub fn covers(&self, required: &BTreeSet<String>) -> bool {
        let present: BTreeSet<String> = self.sans.iter().map(|san| canonical_san(san)).collect();
        required.iter().all(|san| present.contains(san))
    }

    pub fn certified_key(&self) -> Result<CertifiedKey, ListenerError> {
        let chain = parse_chain(&self.cert_pem)?;
        let key = parse_private_key(&self.key_pem)?;
        let signer = rustls::sign::any_supported_type(&key)
            .map_err(|err| ListenerError::InvalidKey(err.to_string()))?;
        Ok(CertifiedKey::new(chain, signer))
    }
}

/// Why a cached certificate must be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegenerateReason {
    Missing,
    Requested,
    Expiring,
    MissingSans,
}

impl std::fmt::Display for RegenerateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RegenerateReason::Missing => "missing",
            RegenerateReason::Requested => "requested",
            RegenerateReason::Expiring => "expiring",
            RegenerateReason::MissingSans => "missing_sans",
        })
    }
}

pub fn regeneration_reason(
    record: Option<&CertRecord>,
    required_sans: &BTreeSet<String>,
    renew_days: u32,
    requested: bool,
    now: DateTime<Utc>,
) -> Option<RegenerateReason> {
    let Some(record) = record else {
        return Some(RegenerateReason::Missing);
    };
    if requested {
        return Some(RegenerateReason::Requested);
    }
    if record.expires_within(ChronoDuration::days(i64::from(renew_days)), now) {
        return Some(RegenerateReason::Expiring);
    }
    if !record.covers(required_sans) {
        return Some(RegenerateReason::MissingSans);
    }
    None
}

/// Issues serving certificates signed by the cluster server CA.
pub struct CertIssuer {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_pem: String,
}

impl CertIssuer {
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, ListenerError> {
        let cert_pem = fs::read_to_string(cert_path).map_err(|source| ListenerError::CaRead {
            path: cert_path.to_path_buf(),
            source,
        })?;
        let key_pem = fs::read_to_string(key_path).map_err(|source| ListenerError::CaRead {
            path: key_path.to_path_buf(),
            source,
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, ListenerError> {
        let ca_key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        let ca_cert = params.self_signed(&ca_key)?;
        Ok(Self {
            ca_cert,
            ca_key,
            ca_pem: cert_pem.to_string(),
        })
    }

    pub fn issue(&self, sans: &BTreeSet<String>) -> Result<CertRecord, ListenerError> {
        let mut params = CertificateParams::new(sans.iter().cloned().collect::<Vec<_>>())?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, PROGRAM);
        name.push(DnType::OrganizationName, PROGRAM);
        params.distinguished_name = name;
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::hours(CLOCK_SKEW_HOURS);
        params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key = KeyPair::generate()?;
        let leaf = params.signed_by(&key, &self.ca_cert, &self.ca_key)?;
        let mut chain = leaf.pem();
        chain.push_str(&self.ca_pem);
        CertRecord::from_pem(chain, key.serialize_pem())
    }
}

/// SANs are compared in canonical form so `::1` and `0:0::1` match.
pub fn canonical_san(san: &str) -> String {
    match san.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => san.to_ascii_lowercase(),
    }
}

fn parse_chain(pem: &str) -> Result<Vec<RustlsCertificate>, ListenerError> {
    let mut reader = Cursor::new(pem.as_bytes());
    let chain = certs(&mut reader)
        .map_err(|_| ListenerError::InvalidCertificate("unreadable PEM chain".into()))?;
    if chain.is_empty() {
        return Err(ListenerError::InvalidCertificate("empty chain".into()));
    }
    Ok(chain.into_iter().map(RustlsCertificate).collect())
}

fn parse_private_key(pem: &str) -> Result<PrivateKey, ListenerError> {
    let bytes = pem.as_bytes();

    let mut reader = Cursor::new(bytes);
    let keys = pkcs8_private_keys(&mut reader)
        .map_err(|_| ListenerError::InvalidKey("invalid PKCS#8 key".into()))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    let mut reader = Cursor::new(bytes);
    let keys = rsa_private_keys(&mut reader)
        .map_err(|_| ListenerError::InvalidKey("invalid RSA key".into()))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    let mut reader = Cursor::new(bytes);
    let keys = ec_private_keys(&mut reader)
        .map_err(|_| ListenerError::InvalidKey("invalid EC key".into()))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    Err(ListenerError::InvalidKey("no private key found".into()))
}

fn subject_alt_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut sans = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(SubjectAlternativeName { general_names }) =
            ext.parsed_extension()
        {
            for name in general_names {
                match name {
                    GeneralName::DNSName(dns) => sans.push((*dns).to_string()),
                    GeneralName::IPAddress(raw) => {
                        if let Some(ip) = ip_from_octets(raw) {
                            sans.push(ip.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    sans
}

fn ip_from_octets(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn as_utc(time: &x509_parser::time::ASN1Time) -> Result<DateTime<Utc>, ListenerError> {
    let secs = time.to_datetime().unix_timestamp();
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| ListenerError::InvalidCertificate(format!("timestamp {secs} out of range")))
}
