//! Certificate generation, parsing, and verification
//!
//! This module owns every cryptographic operation the rotators need: minting
//! the self-signed signing CA, issuing serving and client leaf certificates,
//! splitting and re-encoding PEM bundles, and verifying that a leaf was
//! signed by a given CA. Nothing outside this module touches rcgen or
//! x509-parser directly.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
    SerialNumber,
};
use x509_parser::prelude::*;

use crate::error::Error;
use crate::Result;

/// Organization name embedded in every generated certificate subject
const ORGANIZATION: &str = "Trellis";

/// Clock-skew allowance: certificates become valid one second in the past so
/// freshly minted certs validate on peers with slightly trailing clocks.
const NOT_BEFORE_SKEW: Duration = Duration::from_secs(1);

/// Parsed, read-only view of one X.509 certificate.
///
/// Keeps the DER alongside the fields the rotation policies consult, so the
/// expensive parse happens once per read.
#[derive(Debug, Clone)]
pub struct CaCertificate {
    der: Vec<u8>,
    subject: String,
    issuer: String,
    serial: String,
    common_name: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    dns_names: Vec<String>,
    ip_addresses: Vec<String>,
    is_ca: bool,
    spki: Vec<u8>,
}

impl CaCertificate {
    /// Parse a certificate from DER bytes
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::parse(format!("failed to parse certificate: {e}")))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();

        let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
            .ok_or_else(|| Error::parse("certificate NotBefore out of range"))?;
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| Error::parse("certificate NotAfter out of range"))?;

        let is_ca = cert
            .basic_constraints()
            .ok()
            .flatten()
            .map(|bc| bc.value.ca)
            .unwrap_or(false);

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            ip_addresses.push(ip.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.raw_serial_as_string(),
            spki: cert.public_key().raw.to_vec(),
            common_name,
            not_before,
            not_after,
            dns_names,
            ip_addresses,
            is_ca,
            der: der.to_vec(),
        })
    }

    /// Parse a single certificate from a PEM block
    pub fn from_pem(pem_data: &[u8]) -> Result<Self> {
        let block = ::pem::parse(pem_data)
            .map_err(|e| Error::parse(format!("failed to parse PEM: {e}")))?;
        Self::from_der(block.contents())
    }

    /// PEM-encode this certificate.
    ///
    /// Line endings are pinned to LF to match rcgen's own PEM output, so a
    /// bundle holding exactly one CA is byte-identical to that CA's
    /// `tls.crt` payload.
    pub fn to_pem(&self) -> String {
        ::pem::encode_config(
            &::pem::Pem::new("CERTIFICATE", self.der.clone()),
            ::pem::EncodeConfig::new().set_line_ending(::pem::LineEnding::LF),
        )
    }

    /// The subject distinguished name
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The issuer distinguished name
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// The subject CommonName, empty if the certificate has none
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Start of the validity window
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// End of the validity window
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Whether the certificate may sign other certificates
    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    /// Whether the validity window has ended at the given instant
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.not_after <= now
    }

    /// Identity used for bundle deduplication: (issuer DN, serial)
    pub fn fingerprint(&self) -> (String, String) {
        (self.issuer.clone(), self.serial.clone())
    }

    /// All subject-alternative-name entries (DNS names and IP addresses)
    pub fn san_entries(&self) -> BTreeSet<String> {
        self.dns_names
            .iter()
            .chain(self.ip_addresses.iter())
            .cloned()
            .collect()
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Parse a PEM concatenation into its certificates, in order
pub fn parse_certs_pem(pem_data: &[u8]) -> Result<Vec<CaCertificate>> {
    let blocks = ::pem::parse_many(pem_data)
        .map_err(|e| Error::parse(format!("failed to parse PEM bundle: {e}")))?;
    let mut certs = Vec::with_capacity(blocks.len());
    for block in blocks {
        if block.tag() != "CERTIFICATE" {
            continue;
        }
        certs.push(CaCertificate::from_der(block.contents())?);
    }
    if certs.is_empty() {
        return Err(Error::parse("no certificates found in PEM data"));
    }
    Ok(certs)
}

/// PEM-encode certificates in order into one concatenated payload
pub fn encode_certs_pem(certs: &[CaCertificate]) -> String {
    certs.iter().map(CaCertificate::to_pem).collect()
}

/// Verify that `cert` carries a valid signature from `issuer`'s key.
///
/// This is a cryptographic check, not a name comparison: two CA generations
/// sharing the same subject are still told apart.
pub fn verify_signed_by(cert: &CaCertificate, issuer: &CaCertificate) -> bool {
    let Ok((_, parsed)) = X509Certificate::from_der(&cert.der) else {
        return false;
    };
    let Ok((_, ca)) = X509Certificate::from_der(&issuer.der) else {
        return false;
    };
    parsed.verify_signature(Some(ca.public_key())).is_ok()
}

/// Whether the PEM private key is the counterpart of the certificate's
/// public key, compared by SubjectPublicKeyInfo
pub fn key_matches_certificate(cert: &CaCertificate, key_pem: &str) -> bool {
    match KeyPair::from_pem(key_pem) {
        Ok(key_pair) => key_pair.subject_public_key_info() == cert.spki,
        Err(_) => false,
    }
}

/// A certificate/key pair issued for a leaf
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    cert_pem: String,
    key_pem: String,
    cert: CaCertificate,
}

impl CertKeyPair {
    /// Reconstruct from PEM material, validating that the key matches
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let cert = CaCertificate::from_pem(cert_pem.as_bytes())?;
        if !key_matches_certificate(&cert, key_pem) {
            return Err(Error::crypto("private key does not match certificate"));
        }
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            cert,
        })
    }

    /// The PEM-encoded certificate
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// The PEM-encoded private key
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Parsed view of the certificate
    pub fn cert(&self) -> &CaCertificate {
        &self.cert
    }
}

/// Self-signed signing CA.
///
/// The key pair is held as PEM and re-parsed for each signing operation
/// (rcgen's `KeyPair` isn't `Clone`), which also keeps this type cheap to
/// clone into bundle and leaf rotators.
#[derive(Debug, Clone)]
pub struct SigningCa {
    cert_pem: String,
    key_pem: String,
    cert: CaCertificate,
}

impl SigningCa {
    /// Generate a new self-signed signing CA.
    ///
    /// The serial is a random 64-bit value and the subject CN is the given
    /// name; the validity window is `[now - 1s, now + validity]`.
    pub fn new(common_name: &str, validity: Duration, now: DateTime<Utc>) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(ORGANIZATION.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(SerialNumber::from(rand::thread_rng().gen::<u64>()));
        set_validity(&mut params, validity, now)?;

        let key_pair = KeyPair::generate()
            .map_err(|e| Error::crypto(format!("failed to generate CA key: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::crypto(format!("failed to create CA certificate: {e}")))?;

        Self::from_pem(&cert.pem(), &key_pair.serialize_pem())
    }

    /// Load a signing CA from PEM material, validating that the key matches
    /// and the certificate can act as a CA
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let cert = CaCertificate::from_pem(cert_pem.as_bytes())?;
        if !cert.is_ca() {
            return Err(Error::crypto("certificate is not a CA"));
        }
        if !key_matches_certificate(&cert, key_pem) {
            return Err(Error::crypto("private key does not match CA certificate"));
        }
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            cert,
        })
    }

    /// The PEM-encoded CA certificate
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// The PEM-encoded CA private key
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Parsed view of the CA certificate
    pub fn cert(&self) -> &CaCertificate {
        &self.cert
    }

    /// The CA's subject CommonName
    pub fn common_name(&self) -> &str {
        self.cert.common_name()
    }

    /// Issue a serving (TLS server) certificate for the given hostnames.
    ///
    /// The subject CN is the first hostname; every hostname lands in the SAN
    /// set, as a DNS name or an IP address depending on how it parses.
    pub fn issue_serving_cert(
        &self,
        hostnames: &[String],
        validity: Duration,
        now: DateTime<Utc>,
    ) -> Result<CertKeyPair> {
        let first = hostnames
            .first()
            .ok_or_else(|| Error::config("serving certificate requires at least one hostname"))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(first.clone()));
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(ORGANIZATION.to_string()),
        );
        params.distinguished_name = dn;

        let mut sans = Vec::with_capacity(hostnames.len());
        for hostname in hostnames {
            if let Ok(ip) = hostname.parse::<IpAddr>() {
                sans.push(SanType::IpAddress(ip));
            } else {
                let name = Ia5String::try_from(hostname.clone())
                    .map_err(|e| Error::config(format!("invalid hostname {hostname:?}: {e}")))?;
                sans.push(SanType::DnsName(name));
            }
        }
        params.subject_alt_names = sans;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        self.issue(params, validity, now)
    }

    /// Issue a client (mTLS) certificate for the given user and groups.
    ///
    /// The subject CN is the user; each group becomes an Organization entry.
    pub fn issue_client_cert(
        &self,
        user: &str,
        groups: &[String],
        validity: Duration,
        now: DateTime<Utc>,
    ) -> Result<CertKeyPair> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(user.to_string()));
        for group in groups {
            dn.push(
                DnType::OrganizationName,
                DnValue::Utf8String(group.clone()),
            );
        }
        params.distinguished_name = dn;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        self.issue(params, validity, now)
    }

    fn issue(
        &self,
        mut params: CertificateParams,
        validity: Duration,
        now: DateTime<Utc>,
    ) -> Result<CertKeyPair> {
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.serial_number = Some(SerialNumber::from(rand::thread_rng().gen::<u64>()));
        set_validity(&mut params, validity, now)?;

        let key_pair = KeyPair::generate()
            .map_err(|e| Error::crypto(format!("failed to generate leaf key: {e}")))?;

        let ca_key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| Error::crypto(format!("failed to load CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| Error::crypto(format!("failed to create issuer: {e}")))?;

        let cert = params
            .signed_by(&key_pair, &issuer)
            .map_err(|e| Error::crypto(format!("failed to sign certificate: {e}")))?;

        CertKeyPair::from_pem(&cert.pem(), &key_pair.serialize_pem())
    }
}

fn set_validity(
    params: &mut CertificateParams,
    validity: Duration,
    now: DateTime<Utc>,
) -> Result<()> {
    let not_before = now - chrono::Duration::from_std(NOT_BEFORE_SKEW).unwrap_or(chrono::Duration::zero());
    let not_after = now
        + chrono::Duration::from_std(validity)
            .map_err(|e| Error::config(format!("validity out of range: {e}")))?;

    params.not_before = ::time::OffsetDateTime::from_unix_timestamp(not_before.timestamp())
        .map_err(|e| Error::crypto(format!("NotBefore out of range: {e}")))?;
    params.not_after = ::time::OffsetDateTime::from_unix_timestamp(not_after.timestamp())
        .map_err(|e| Error::crypto(format!("NotAfter out of range: {e}")))?;
    Ok(())
}
