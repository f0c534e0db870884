//! Template request validation and normalization.
//!
//! [`validate_and_normalize`] applies a namespace's capabilities to an
//! inbound request. Violations are returned before anything is written;
//! out-of-range numbers are clamped rather than rejected.

use std::collections::BTreeSet;
use std::net::IpAddr;

use cairn_core::digest::VersionDigest;
use cairn_core::models::{
    CertificateUsage, Curve, JwsAlgorithm, KeySpec, KeyType, LifetimeTrigger, SanTemplate,
    SubjectTemplate,
};
use cairn_core::{CairnError, CairnResult, NamespaceIdentifier, ResourceKind, ResourceLocator};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::capabilities::{
    CapabilityRegistry, Exportability, NamespaceCertificateTemplateCapabilities,
};
use crate::template;

pub const MIN_VALIDITY_MONTHS: u32 = 1;
pub const MAX_VALIDITY_MONTHS: u32 = 120;
pub const DEFAULT_VALIDITY_MONTHS: u32 = 12;
pub const MIN_LIFETIME_PERCENTAGE: u8 = 50;
pub const MAX_LIFETIME_PERCENTAGE: u8 = 99;
pub const MAX_DAYS_PER_VALIDITY_MONTH: u32 = 15;

/// Partial key spec; unset fields come from the namespace default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySpecRequest {
    #[serde(default)]
    pub kty: Option<KeyType>,
    #[serde(default)]
    pub key_size: Option<u32>,
    #[serde(default)]
    pub crv: Option<Curve>,
    #[serde(default)]
    pub alg: Option<JwsAlgorithm>,
    #[serde(default)]
    pub exportable: Option<bool>,
}

impl KeySpecRequest {
    pub fn ec(crv: Curve) -> Self {
        Self {
            kty: Some(KeyType::Ec),
            crv: Some(crv),
            ..Default::default()
        }
    }

    pub fn rsa(key_size: u32) -> Self {
        Self {
            kty: Some(KeyType::Rsa),
            key_size: Some(key_size),
            ..Default::default()
        }
    }
}

/// Inbound certificate template request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub issuer_namespace: Option<NamespaceIdentifier>,
    #[serde(default)]
    pub key_spec: KeySpecRequest,
    pub subject: SubjectTemplate,
    #[serde(default)]
    pub sans: SanTemplate,
    /// `None` takes every usage the namespace allows.
    #[serde(default)]
    pub usages: Option<BTreeSet<CertificateUsage>>,
    #[serde(default)]
    pub validity_months: Option<u32>,
    #[serde(default)]
    pub lifetime_trigger: Option<LifetimeTrigger>,
}

/// A request with every default applied and every bound enforced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTemplate {
    pub display_name: String,
    pub issuer_namespace: NamespaceIdentifier,
    pub key_spec: KeySpec,
    pub subject: SubjectTemplate,
    pub sans: SanTemplate,
    pub usages: BTreeSet<CertificateUsage>,
    pub validity_months: u32,
    pub lifetime_trigger: LifetimeTrigger,
    pub allow_variables: bool,
    /// Change-detection digest over issuer, subject, and key spec.
    pub digest: String,
}

/// Digest over the fields whose change requires a new certificate.
pub fn template_digest(
    issuer: &NamespaceIdentifier,
    subject: &SubjectTemplate,
    key_spec: &KeySpec,
) -> String {
    VersionDigest::new()
        .field(issuer.to_string())
        .field(subject.to_string())
        .field(key_spec.canonical())
        .finish()
}

/// Validate `request` for the template at `locator`.
#[instrument(skip_all, fields(locator = %locator))]
pub fn validate_and_normalize(
    registry: &CapabilityRegistry,
    locator: &ResourceLocator,
    request: &TemplateRequest,
) -> CairnResult<NormalizedTemplate> {
    if locator.resource_kind() != ResourceKind::CertPolicy {
        return Err(CairnError::InvalidLocator {
            value: locator.to_string(),
            reason: "certificate templates live under certPolicy resources".into(),
        });
    }
    let caps = registry.capabilities(locator)?;
    let id = locator.resource().id();

    // 1. Reserved names
    if id.has_reserved_prefix() {
        let allowed = id
            .as_name()
            .is_some_and(|name| caps.allowed_reserved_names.contains(name));
        if !allowed {
            return Err(CairnError::capability(format!(
                "reserved template name {id} is not allowed in {}",
                locator.namespace()
            )));
        }
    }

    // 2. Issuer
    let issuer_namespace = match &request.issuer_namespace {
        Some(issuer) if caps.allowed_issuers.contains(issuer) => issuer.clone(),
        Some(issuer) => {
            return Err(CairnError::capability(format!(
                "{issuer} may not issue certificates for {locator}"
            )));
        }
        None => caps.default_issuer.clone().ok_or_else(|| {
            CairnError::capability(format!(
                "an issuer must be chosen for {locator}; allowed: {}",
                join(&caps.allowed_issuers)
            ))
        })?,
    };

    // 3. Usages
    let usages: BTreeSet<CertificateUsage> = match &request.usages {
        None => caps.allowed_usages.clone(),
        Some(requested) => requested.intersection(&caps.allowed_usages).copied().collect(),
    };
    if usages.is_empty() {
        return Err(CairnError::capability(format!(
            "none of the requested usages are allowed; allowed: {}",
            join(&caps.allowed_usages)
        )));
    }

    // 4. Key spec
    let key_spec = normalize_key_spec(&caps, &request.key_spec)?;

    // 5. Subject and SANs
    if request.subject.common_name.trim().is_empty() {
        return Err(CairnError::capability("subject common name is required"));
    }
    let values = request.subject.values().chain(request.sans.values());
    for value in values {
        if caps.allow_variables {
            template::validate(value)?;
        } else if template::has_variables(value) {
            return Err(CairnError::capability(format!(
                "{} does not allow template variables",
                locator.namespace()
            )));
        }
    }
    validate_sans(&request.sans)?;

    // 6. Validity and renewal trigger
    let validity_months = request
        .validity_months
        .unwrap_or(DEFAULT_VALIDITY_MONTHS)
        .clamp(MIN_VALIDITY_MONTHS, MAX_VALIDITY_MONTHS);
    let lifetime_trigger = match request.lifetime_trigger.unwrap_or_default() {
        LifetimeTrigger::PercentageOfLifetime(p) => LifetimeTrigger::PercentageOfLifetime(
            p.clamp(MIN_LIFETIME_PERCENTAGE, MAX_LIFETIME_PERCENTAGE),
        ),
        LifetimeTrigger::DaysBeforeExpiry(days) => LifetimeTrigger::DaysBeforeExpiry(
            days.min(MAX_DAYS_PER_VALIDITY_MONTH * validity_months),
        ),
    };

    let digest = template_digest(&issuer_namespace, &request.subject, &key_spec);
    debug!(issuer = %issuer_namespace, validity_months, digest = %digest, "Template normalized");

    Ok(NormalizedTemplate {
        display_name: request
            .display_name
            .clone()
            .unwrap_or_else(|| id.to_string()),
        issuer_namespace,
        key_spec,
        subject: request.subject.clone(),
        sans: request.sans.clone(),
        usages,
        validity_months,
        lifetime_trigger,
        allow_variables: caps.allow_variables,
        digest,
    })
}

fn normalize_key_spec(
    caps: &NamespaceCertificateTemplateCapabilities,
    request: &KeySpecRequest,
) -> CairnResult<KeySpec> {
    let default = &caps.default_key_spec;

    let mut spec = if caps.key_spec_locked {
        let conflicts = request.kty.is_some_and(|v| v != default.kty)
            || request.key_size.is_some_and(|v| Some(v) != default.key_size)
            || request.crv.is_some_and(|v| Some(v) != default.crv)
            || request.alg.is_some_and(|v| v != default.alg);
        if conflicts {
            return Err(CairnError::capability(format!(
                "this template requires a {} key ({})",
                default.kty,
                default.canonical()
            )));
        }
        default.clone()
    } else {
        let kty = request.kty.unwrap_or(default.kty);
        if kty == KeyType::Rsa && caps.disallow_rsa {
            return Err(CairnError::capability("RSA keys are not allowed here"));
        }
        let same_type = kty == default.kty;
        match kty {
            KeyType::Rsa => {
                let key_size = request
                    .key_size
                    .or(default.key_size.filter(|_| same_type))
                    .unwrap_or(2048);
                let alg = request
                    .alg
                    .or(Some(default.alg).filter(|_| same_type))
                    .unwrap_or(JwsAlgorithm::RS256);
                KeySpec::rsa(key_size, alg)
            }
            KeyType::Ec => {
                let crv = request
                    .crv
                    .or_else(|| request.alg.and_then(JwsAlgorithm::curve))
                    .or(default.crv.filter(|_| same_type))
                    .unwrap_or(Curve::P256);
                let mut spec = KeySpec::ec(crv);
                if let Some(alg) = request.alg {
                    spec.alg = alg;
                }
                if request.key_size.is_some() {
                    spec.key_size = request.key_size;
                }
                spec
            }
        }
    };
    spec.validate()?;

    spec.exportable = match (caps.exportability, request.exportable) {
        (Exportability::Required, Some(false)) => {
            return Err(CairnError::capability("keys must be exportable here"));
        }
        (Exportability::Forbidden, Some(true)) => {
            return Err(CairnError::capability("keys may not be exportable here"));
        }
        (Exportability::Required, _) => true,
        (Exportability::Forbidden, _) => false,
        (Exportability::Optional, requested) => requested.unwrap_or(false),
    };
    Ok(spec)
}

/// Check literal SAN values. Values with placeholders are checked once
/// rendered, at issuance.
fn validate_sans(sans: &SanTemplate) -> CairnResult<()> {
    let literal = |values: &[String]| {
        values
            .iter()
            .filter(|v| !template::has_variables(v))
            .cloned()
            .collect::<Vec<_>>()
    };
    let invalid = |kind: &str, value: &str| {
        CairnError::capability(format!("invalid {kind} subject alternative name {value:?}"))
    };

    for ip in literal(&sans.ip_addresses) {
        ip.parse::<IpAddr>().map_err(|_| invalid("IP address", &ip))?;
    }
    for dns in literal(&sans.dns_names) {
        if !is_dns_name(&dns) {
            return Err(invalid("DNS", &dns));
        }
    }
    for (kind, values) in [("email", &sans.emails), ("URI", &sans.uris)] {
        for value in literal(values) {
            if value.is_empty() || !value.chars().all(|c| c.is_ascii_graphic()) {
                return Err(invalid(kind, &value));
            }
        }
    }
    Ok(())
}

/// Hostname syntax, allowing a leading `*.` wildcard label.
fn is_dns_name(name: &str) -> bool {
    let name = name.strip_prefix("*.").unwrap_or(name);
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

fn join<T: std::fmt::Display>(items: &BTreeSet<T>) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use cairn_core::{ErrorKind, NamespaceKind, ResourceIdentifier};
    use proptest::prelude::*;
    use uuid::Uuid;

    use super::*;
    use crate::capabilities::MS_ENTRA_CLIENT_CREDS;

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::builtin().unwrap()
    }

    fn locator(ns: &str, name: &str) -> ResourceLocator {
        let ns: NamespaceIdentifier = ns.parse().unwrap();
        ns.locate(ResourceIdentifier::named(ResourceKind::CertPolicy, name).unwrap())
    }

    fn request(cn: &str) -> TemplateRequest {
        TemplateRequest {
            subject: SubjectTemplate::common_name(cn),
            ..Default::default()
        }
    }

    fn service_principal() -> String {
        format!("servicePrincipal:{}", Uuid::new_v4())
    }

    #[test]
    fn entra_creds_reject_ec_keys() {
        let loc = locator(&format!("group:{}", Uuid::new_v4()), MS_ENTRA_CLIENT_CREDS);
        let mut req = request("client creds");
        req.key_spec = KeySpecRequest {
            kty: Some(KeyType::Ec),
            ..Default::default()
        };
        let err = validate_and_normalize(&registry(), &loc, &req).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapabilityViolation);
    }

    #[test]
    fn entra_creds_default_to_locked_rsa() {
        let loc = locator(&format!("group:{}", Uuid::new_v4()), MS_ENTRA_CLIENT_CREDS);
        let normalized = validate_and_normalize(&registry(), &loc, &request("creds")).unwrap();
        assert_eq!(normalized.key_spec, KeySpec::rsa(2048, JwsAlgorithm::RS256));
        assert_eq!(
            normalized.issuer_namespace.to_string(),
            "caInt:ms-entra-client-secret"
        );
    }

    #[test]
    fn root_validity_is_clamped_to_ten_years() {
        let mut req = request("Cairn Root CA");
        req.validity_months = Some(121);
        let normalized =
            validate_and_normalize(&registry(), &locator("caRoot:default", "default"), &req)
                .unwrap();
        assert_eq!(normalized.validity_months, 120);
        assert_eq!(
            normalized.issuer_namespace,
            NamespaceIdentifier::named(NamespaceKind::CaRoot, "default").unwrap()
        );

        req.validity_months = Some(0);
        let normalized =
            validate_and_normalize(&registry(), &locator("caRoot:default", "default"), &req)
                .unwrap();
        assert_eq!(normalized.validity_months, 1);
    }

    #[test]
    fn lifetime_trigger_is_clamped() {
        let mut req = request("svc");
        req.issuer_namespace = Some("caInt:services".parse().unwrap());
        req.validity_months = Some(2);

        req.lifetime_trigger = Some(LifetimeTrigger::PercentageOfLifetime(100));
        let n = validate_and_normalize(&registry(), &locator(&service_principal(), "web"), &req)
            .unwrap();
        assert_eq!(n.lifetime_trigger, LifetimeTrigger::PercentageOfLifetime(99));

        req.lifetime_trigger = Some(LifetimeTrigger::PercentageOfLifetime(10));
        let n = validate_and_normalize(&registry(), &locator(&service_principal(), "web"), &req)
            .unwrap();
        assert_eq!(n.lifetime_trigger, LifetimeTrigger::PercentageOfLifetime(50));

        req.lifetime_trigger = Some(LifetimeTrigger::DaysBeforeExpiry(90));
        let n = validate_and_normalize(&registry(), &locator(&service_principal(), "web"), &req)
            .unwrap();
        assert_eq!(n.lifetime_trigger, LifetimeTrigger::DaysBeforeExpiry(30));
    }

    #[test]
    fn issuer_must_be_allowed_and_chosen_when_ambiguous() {
        let loc = locator(&service_principal(), "web");
        let err = validate_and_normalize(&registry(), &loc, &request("svc")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapabilityViolation);

        let mut req = request("svc");
        req.issuer_namespace = Some("caInt:default".parse().unwrap());
        assert!(validate_and_normalize(&registry(), &loc, &req).is_err());

        req.issuer_namespace = Some("caInt:intranet".parse().unwrap());
        assert!(validate_and_normalize(&registry(), &loc, &req).is_ok());
    }

    #[test]
    fn usages_are_intersected() {
        let loc = locator(&format!("user:{}", Uuid::new_v4()), "laptop");
        let mut req = request("me");
        req.usages = Some([CertificateUsage::ClientAuth, CertificateUsage::Ca].into());
        let n = validate_and_normalize(&registry(), &loc, &req).unwrap();
        assert_eq!(n.usages, [CertificateUsage::ClientAuth].into());

        req.usages = Some([CertificateUsage::ServerAuth].into());
        assert!(validate_and_normalize(&registry(), &loc, &req).is_err());
    }

    #[test]
    fn variables_follow_namespace_rules() {
        let mut req = request("{{ns.id}}");
        let err =
            validate_and_normalize(&registry(), &locator("caRoot:default", "default"), &req)
                .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapabilityViolation);

        let user = locator(&format!("user:{}", Uuid::new_v4()), "laptop");
        assert!(validate_and_normalize(&registry(), &user, &req).is_ok());

        req.subject.common_name = "{{ns.password}}".into();
        let err = validate_and_normalize(&registry(), &user, &req).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTemplateSyntax);
    }

    #[test]
    fn literal_sans_are_checked_when_the_policy_is_put() {
        let loc = locator(&format!("user:{}", Uuid::new_v4()), "laptop");
        let with_sans = |sans: SanTemplate| TemplateRequest {
            sans,
            ..request("me")
        };

        let good = with_sans(SanTemplate {
            dns_names: vec!["*.svc.example".into(), "host-1.example".into()],
            ip_addresses: vec!["10.0.0.1".into(), "::1".into()],
            emails: vec!["me@example.com".into()],
            ..Default::default()
        });
        assert!(validate_and_normalize(&registry(), &loc, &good).is_ok());

        for bad in [
            SanTemplate {
                ip_addresses: vec!["not-an-ip".into()],
                ..Default::default()
            },
            SanTemplate {
                dns_names: vec!["bad host".into()],
                ..Default::default()
            },
            SanTemplate {
                dns_names: vec!["-lead.example".into()],
                ..Default::default()
            },
            SanTemplate {
                emails: vec!["caf\u{e9}@example.com".into()],
                ..Default::default()
            },
        ] {
            let err = validate_and_normalize(&registry(), &loc, &with_sans(bad)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::CapabilityViolation);
        }

        // Placeholders wait for issuance.
        let templated = with_sans(SanTemplate {
            dns_names: vec!["{{ns.id}}.devices.example".into()],
            ..Default::default()
        });
        assert!(validate_and_normalize(&registry(), &loc, &templated).is_ok());
    }

    #[test]
    fn devices_cannot_use_rsa() {
        let loc = locator(&format!("device:{}", Uuid::new_v4()), "wifi");
        let mut req = request("device");
        req.key_spec = KeySpecRequest::rsa(2048);
        assert!(validate_and_normalize(&registry(), &loc, &req).is_err());
    }

    #[test]
    fn exportability_is_enforced() {
        let mut req = request("root");
        req.key_spec.exportable = Some(true);
        let err = validate_and_normalize(&registry(), &locator("caRoot:default", "default"), &req)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapabilityViolation);
    }

    #[test]
    fn digest_tracks_issuer_subject_and_key_spec() {
        let loc = locator("caRoot:default", "default");
        let a = validate_and_normalize(&registry(), &loc, &request("Root")).unwrap();
        let mut other = request("Root");
        other.validity_months = Some(60);
        let b = validate_and_normalize(&registry(), &loc, &other).unwrap();
        assert_eq!(a.digest, b.digest);

        other.key_spec = KeySpecRequest::ec(Curve::P256);
        let c = validate_and_normalize(&registry(), &loc, &other).unwrap();
        assert_ne!(a.digest, c.digest);
    }

    fn usage() -> impl Strategy<Value = CertificateUsage> {
        prop_oneof![
            Just(CertificateUsage::Ca),
            Just(CertificateUsage::CaRoot),
            Just(CertificateUsage::ClientAuth),
            Just(CertificateUsage::ServerAuth),
        ]
    }

    proptest! {
        #[test]
        fn usages_stay_within_allowed_set(
            requested in proptest::option::of(proptest::collection::btree_set(usage(), 0..4)),
            months in proptest::option::of(0u32..400),
        ) {
            let loc = locator(&format!("group:{}", Uuid::new_v4()), "web");
            let caps = registry().capabilities(&loc).unwrap();
            let mut req = request("web");
            req.usages = requested;
            req.validity_months = months;
            if let Ok(n) = validate_and_normalize(&registry(), &loc, &req) {
                prop_assert!(!n.usages.is_empty());
                prop_assert!(n.usages.is_subset(&caps.allowed_usages));
                prop_assert!((1..=120).contains(&n.validity_months));
            }
        }

        #[test]
        fn unlisted_reserved_names_always_rejected(
            suffix in "[a-z]{1,8}",
            months in proptest::option::of(0u32..400),
        ) {
            let loc = locator(&format!("group:{}", Uuid::new_v4()), &format!("default-{suffix}"));
            let mut req = request("x");
            req.validity_months = months;
            let result = validate_and_normalize(&registry(), &loc, &req);
            if format!("default-{suffix}") != MS_ENTRA_CLIENT_CREDS {
                prop_assert!(result.is_err());
            }
        }
    }
}
