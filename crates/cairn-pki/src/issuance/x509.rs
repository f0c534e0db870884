//! X.509 building blocks: certificate parameters from a policy, subject
//! keys from DER, and PEM chain handling.

use std::collections::BTreeSet;
use std::net::IpAddr;

use cairn_core::models::{CertificateUsage, KeyType, SanTemplate, SubjectTemplate};
use cairn_core::{CairnError, CairnResult};
use chrono::{DateTime, Utc};
use rand::Rng;
use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyUsagePurpose, PublicKeyData, SanType, SerialNumber, SignatureAlgorithm,
};
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

/// Everything that goes into a certificate besides the keys.
#[derive(Debug, Clone)]
pub struct CertificateProfile {
    pub subject: SubjectTemplate,
    pub sans: SanTemplate,
    pub usages: BTreeSet<CertificateUsage>,
    pub key_type: KeyType,
    pub serial: Vec<u8>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// 16 random bytes with the sign bit cleared.
pub fn random_serial() -> Vec<u8> {
    let mut serial = [0u8; 16];
    rand::rng().fill(&mut serial);
    serial[0] &= 0x7f;
    serial.to_vec()
}

fn to_offset(at: DateTime<Utc>) -> CairnResult<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| CairnError::Internal(format!("timestamp {at} out of range: {e}")))
}

fn ia5(kind: &str, value: &str) -> CairnResult<Ia5String> {
    Ia5String::try_from(value.to_string())
        .map_err(|e| CairnError::capability(format!("invalid {kind} {value:?}: {e}")))
}

pub fn certificate_params(profile: &CertificateProfile) -> CairnResult<CertificateParams> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, profile.subject.common_name.as_str());
    if let Some(o) = &profile.subject.organization {
        dn.push(DnType::OrganizationName, o.as_str());
    }
    if let Some(ou) = &profile.subject.organizational_unit {
        dn.push(DnType::OrganizationalUnitName, ou.as_str());
    }
    if let Some(c) = &profile.subject.country {
        dn.push(DnType::CountryName, c.as_str());
    }
    params.distinguished_name = dn;

    let sans = &profile.sans;
    for dns in &sans.dns_names {
        params.subject_alt_names.push(SanType::DnsName(ia5("DNS name", dns)?));
    }
    for email in &sans.emails {
        params.subject_alt_names.push(SanType::Rfc822Name(ia5("email", email)?));
    }
    for uri in &sans.uris {
        params.subject_alt_names.push(SanType::URI(ia5("URI", uri)?));
    }
    for ip in &sans.ip_addresses {
        let addr: IpAddr = ip
            .parse()
            .map_err(|e| CairnError::capability(format!("invalid IP address {ip:?}: {e}")))?;
        params.subject_alt_names.push(SanType::IpAddress(addr));
    }

    let is_ca = profile.usages.contains(&CertificateUsage::Ca);
    if is_ca {
        params.is_ca = if profile.usages.contains(&CertificateUsage::CaRoot) {
            IsCa::Ca(BasicConstraints::Unconstrained)
        } else {
            IsCa::Ca(BasicConstraints::Constrained(0))
        };
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
    } else {
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        if profile.key_type == KeyType::Rsa {
            params.key_usages.push(KeyUsagePurpose::KeyEncipherment);
        }
    }
    if profile.usages.contains(&CertificateUsage::ClientAuth) {
        params.extended_key_usages.push(ExtendedKeyUsagePurpose::ClientAuth);
    }
    if profile.usages.contains(&CertificateUsage::ServerAuth) {
        params.extended_key_usages.push(ExtendedKeyUsagePurpose::ServerAuth);
    }

    params.serial_number = Some(SerialNumber::from_slice(&profile.serial));
    params.not_before = to_offset(profile.not_before)?;
    params.not_after = to_offset(profile.not_after)?;
    params.use_authority_key_identifier_extension = true;
    Ok(params)
}

/// The subset of `params` a certificate signing request may carry. The
/// serial, CA constraints and authority key identifier are set by the
/// issuer when it signs.
pub fn csr_params(params: &CertificateParams) -> CertificateParams {
    let mut request = params.clone();
    request.serial_number = None;
    request.is_ca = IsCa::NoCa;
    request.use_authority_key_identifier_extension = false;
    request
}

// ---------------------------------------------------------------------------
// Subject keys
// ---------------------------------------------------------------------------

/// A public key to certify, held outside the vault.
#[derive(Debug, Clone)]
pub struct SubjectKey {
    raw: Vec<u8>,
    key_type: KeyType,
    /// Bits for RSA, field size for EC.
    size: usize,
    algorithm: &'static SignatureAlgorithm,
}

impl SubjectKey {
    /// Parse a DER `SubjectPublicKeyInfo`.
    pub fn from_spki_der(der: &[u8]) -> CairnResult<Self> {
        let invalid = |reason: String| CairnError::capability(format!("public key: {reason}"));
        let (_, spki) =
            SubjectPublicKeyInfo::from_der(der).map_err(|e| invalid(e.to_string()))?;
        let raw = spki.subject_public_key.data.to_vec();
        match spki.parsed().map_err(|e| invalid(e.to_string()))? {
            PublicKey::EC(point) => {
                let (size, algorithm) = match point.data().len() {
                    65 => (256, &rcgen::PKCS_ECDSA_P256_SHA256),
                    97 => (384, &rcgen::PKCS_ECDSA_P384_SHA384),
                    n => return Err(invalid(format!("unsupported EC point length {n}"))),
                };
                Ok(Self {
                    raw,
                    key_type: KeyType::Ec,
                    size,
                    algorithm,
                })
            }
            PublicKey::RSA(rsa) => Ok(Self {
                raw,
                key_type: KeyType::Rsa,
                size: rsa.key_size(),
                algorithm: &rcgen::PKCS_RSA_SHA256,
            }),
            _ => Err(invalid("only EC and RSA keys are supported".into())),
        }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl PublicKeyData for SubjectKey {
    fn der_bytes(&self) -> &[u8] {
        &self.raw
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        self.algorithm
    }
}

// ---------------------------------------------------------------------------
// PEM
// ---------------------------------------------------------------------------

/// DER of each `CERTIFICATE` block, in order.
pub fn parse_pem_chain(chain_pem: &str) -> CairnResult<Vec<Vec<u8>>> {
    let blocks = pem::parse_many(chain_pem)
        .map_err(|e| CairnError::Internal(format!("certificate chain PEM: {e}")))?;
    let certs: Vec<Vec<u8>> = blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| block.into_contents())
        .collect();
    if certs.is_empty() {
        return Err(CairnError::Internal("certificate chain PEM is empty".into()));
    }
    Ok(certs)
}

pub fn certificate_pem(der: &[u8]) -> String {
    pem::encode(&pem::Pem::new("CERTIFICATE", der.to_vec()))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn profile(usages: &[CertificateUsage]) -> CertificateProfile {
        let now = Utc::now();
        CertificateProfile {
            subject: SubjectTemplate {
                common_name: "svc.example".into(),
                organization: Some("Cairn".into()),
                organizational_unit: None,
                country: Some("US".into()),
            },
            sans: SanTemplate {
                dns_names: vec!["svc.example".into()],
                ip_addresses: vec!["10.0.0.1".into()],
                ..Default::default()
            },
            usages: usages.iter().copied().collect(),
            key_type: KeyType::Ec,
            serial: random_serial(),
            not_before: now - Duration::minutes(5),
            not_after: now + Duration::days(30),
        }
    }

    #[test]
    fn leaf_params_carry_ekus_and_sans() {
        let params = certificate_params(&profile(&[
            CertificateUsage::ClientAuth,
            CertificateUsage::ServerAuth,
        ]))
        .unwrap();
        assert!(matches!(params.is_ca, IsCa::NoCa));
        assert_eq!(params.extended_key_usages.len(), 2);
        assert_eq!(params.subject_alt_names.len(), 2);
        assert_eq!(params.key_usages, vec![KeyUsagePurpose::DigitalSignature]);
    }

    #[test]
    fn intermediate_is_path_constrained() {
        let params = certificate_params(&profile(&[CertificateUsage::Ca])).unwrap();
        assert!(matches!(params.is_ca, IsCa::Ca(BasicConstraints::Constrained(0))));
        let params =
            certificate_params(&profile(&[CertificateUsage::Ca, CertificateUsage::CaRoot]))
                .unwrap();
        assert!(matches!(params.is_ca, IsCa::Ca(BasicConstraints::Unconstrained)));
    }

    #[test]
    fn bad_ip_san_is_a_violation() {
        let mut p = profile(&[CertificateUsage::ServerAuth]);
        p.sans.ip_addresses = vec!["not-an-ip".into()];
        let err = certificate_params(&p).unwrap_err();
        assert_eq!(err.kind(), cairn_core::ErrorKind::CapabilityViolation);
    }

    #[test]
    fn ca_params_serialize_as_csr_once_stripped() {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = certificate_params(&profile(&[CertificateUsage::Ca])).unwrap();
        assert!(params.clone().serialize_request(&key).is_err());

        let request = csr_params(&params);
        assert!(request.serialize_request(&key).is_ok());
        // The signer still sees everything.
        assert!(params.serial_number.is_some());
        assert!(matches!(params.is_ca, IsCa::Ca(_)));
        assert_eq!(request.key_usages, params.key_usages);
    }

    #[test]
    fn serial_is_positive() {
        for _ in 0..32 {
            assert!(random_serial()[0] < 0x80);
        }
    }

    #[test]
    fn subject_key_from_p256_spki() {
        use p256::pkcs8::EncodePublicKey;
        let secret = p256::ecdsa::SigningKey::from_slice(&[7u8; 32]).unwrap();
        let der = secret.verifying_key().to_public_key_der().unwrap();
        let key = SubjectKey::from_spki_der(der.as_bytes()).unwrap();
        assert_eq!(key.key_type(), KeyType::Ec);
        assert_eq!(key.size(), 256);
        assert_eq!(key.der_bytes().len(), 65);
    }

    #[test]
    fn garbage_spki_rejected() {
        assert!(SubjectKey::from_spki_der(b"nope").is_err());
    }

    #[test]
    fn pem_chain_round_trip() {
        let chain = format!("{}{}", certificate_pem(b"leaf"), certificate_pem(b"root"));
        let certs = parse_pem_chain(&chain).unwrap();
        assert_eq!(certs, vec![b"leaf".to_vec(), b"root".to_vec()]);
        assert!(parse_pem_chain("").is_err());
    }
}
