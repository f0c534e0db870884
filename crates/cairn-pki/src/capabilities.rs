//! Namespace capability table.
//!
//! What a certificate template may look like depends on where it lives:
//! the kind of namespace and, for reserved template names, the name
//! itself. The table is an explicit [`CapabilityRegistry`] value built at
//! startup and passed to the validator.

use std::collections::{BTreeSet, HashMap};

use cairn_core::models::{CertificateUsage, Curve, JwsAlgorithm, KeySpec};
use cairn_core::{CairnError, CairnResult, NamespaceIdentifier, NamespaceKind, ResourceLocator};

/// Reserved template name for directory federation credentials.
pub const MS_ENTRA_CLIENT_CREDS: &str = "default-ms-entra-client-creds";

/// Reserved template name for a CA namespace's own certificate.
pub const DEFAULT_TEMPLATE: &str = "default";

/// Whether keys issued under a template may leave the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exportability {
    Required,
    Forbidden,
    Optional,
}

/// Which namespaces may sign certificates for a table entry.
#[derive(Debug, Clone)]
enum IssuerRule {
    /// Only the namespace itself, i.e. self-signed.
    SelfSigned,
    /// `caRoot:test` for the `test` namespace, `caRoot:default` otherwise.
    MatchingRoot,
    /// A fixed set of CA namespaces.
    Fixed(Vec<NamespaceIdentifier>),
}

#[derive(Debug, Clone)]
struct CapabilityEntry {
    issuers: IssuerRule,
    usages: BTreeSet<CertificateUsage>,
    default_key_spec: KeySpec,
    key_spec_locked: bool,
    allow_variables: bool,
    has_key_store: bool,
    exportability: Exportability,
    disallow_rsa: bool,
}

/// Capabilities of one template location, fully resolved against the
/// concrete namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceCertificateTemplateCapabilities {
    pub allowed_reserved_names: BTreeSet<String>,
    pub allowed_issuers: BTreeSet<NamespaceIdentifier>,
    /// Set when exactly one issuer is allowed.
    pub default_issuer: Option<NamespaceIdentifier>,
    pub allowed_usages: BTreeSet<CertificateUsage>,
    pub default_key_spec: KeySpec,
    /// The key spec must equal `default_key_spec` exactly.
    pub key_spec_locked: bool,
    pub allow_variables: bool,
    pub has_key_store: bool,
    pub exportability: Exportability,
    pub disallow_rsa: bool,
}

/// Lookup table keyed by `(NamespaceKind, reserved template name)`.
///
/// A template with a reserved name first looks for its own entry, then
/// falls back to the kind's unnamed entry. Unnamed entries allow no
/// reserved names, so a reserved name without an entry of its own is
/// always rejected.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    entries: HashMap<(NamespaceKind, Option<String>), CapabilityEntry>,
}

fn usages(list: &[CertificateUsage]) -> BTreeSet<CertificateUsage> {
    list.iter().copied().collect()
}

fn ca_int(name: &str) -> CairnResult<NamespaceIdentifier> {
    NamespaceIdentifier::named(NamespaceKind::CaInt, name)
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in table.
    pub fn builtin() -> CairnResult<Self> {
        use CertificateUsage::{Ca, CaRoot, ClientAuth, ServerAuth};

        let mut registry = Self::new();

        registry.insert(
            NamespaceKind::CaRoot,
            Some(DEFAULT_TEMPLATE),
            CapabilityEntry {
                issuers: IssuerRule::SelfSigned,
                usages: usages(&[Ca, CaRoot]),
                default_key_spec: KeySpec::ec(Curve::P384),
                key_spec_locked: false,
                allow_variables: false,
                has_key_store: true,
                exportability: Exportability::Forbidden,
                disallow_rsa: false,
            },
        );
        registry.insert(
            NamespaceKind::CaInt,
            Some(DEFAULT_TEMPLATE),
            CapabilityEntry {
                issuers: IssuerRule::MatchingRoot,
                usages: usages(&[Ca]),
                default_key_spec: KeySpec::ec(Curve::P384),
                key_spec_locked: false,
                allow_variables: false,
                has_key_store: true,
                exportability: Exportability::Forbidden,
                disallow_rsa: false,
            },
        );

        let entra = CapabilityEntry {
            issuers: IssuerRule::Fixed(vec![ca_int("ms-entra-client-secret")?]),
            usages: usages(&[ClientAuth]),
            default_key_spec: KeySpec::rsa(2048, JwsAlgorithm::RS256),
            key_spec_locked: true,
            allow_variables: false,
            has_key_store: true,
            exportability: Exportability::Forbidden,
            disallow_rsa: false,
        };
        registry.insert(NamespaceKind::Group, Some(MS_ENTRA_CLIENT_CREDS), entra.clone());
        registry.insert(
            NamespaceKind::ServicePrincipal,
            Some(MS_ENTRA_CLIENT_CREDS),
            entra,
        );

        let workload = |issuers: Vec<NamespaceIdentifier>, allowed: &[CertificateUsage]| {
            CapabilityEntry {
                issuers: IssuerRule::Fixed(issuers),
                usages: usages(allowed),
                default_key_spec: KeySpec::ec(Curve::P256),
                key_spec_locked: false,
                allow_variables: true,
                has_key_store: true,
                exportability: Exportability::Optional,
                disallow_rsa: false,
            }
        };
        registry.insert(
            NamespaceKind::ServicePrincipal,
            None,
            workload(
                vec![ca_int("services")?, ca_int("intranet")?],
                &[ClientAuth, ServerAuth],
            ),
        );
        registry.insert(
            NamespaceKind::Application,
            None,
            workload(vec![ca_int("services")?], &[ClientAuth, ServerAuth]),
        );
        registry.insert(
            NamespaceKind::Group,
            None,
            workload(vec![ca_int("intranet")?], &[ClientAuth, ServerAuth]),
        );
        registry.insert(
            NamespaceKind::User,
            None,
            workload(vec![ca_int("intranet")?], &[ClientAuth]),
        );
        registry.insert(
            NamespaceKind::Device,
            None,
            CapabilityEntry {
                exportability: Exportability::Forbidden,
                disallow_rsa: true,
                ..workload(vec![ca_int("intranet")?], &[ClientAuth])
            },
        );

        Ok(registry)
    }

    fn insert(&mut self, kind: NamespaceKind, name: Option<&str>, entry: CapabilityEntry) {
        self.entries.insert((kind, name.map(str::to_string)), entry);
    }

    /// Capabilities for a template at `locator`.
    pub fn capabilities(
        &self,
        locator: &ResourceLocator,
    ) -> CairnResult<NamespaceCertificateTemplateCapabilities> {
        let namespace = locator.namespace();
        let kind = namespace.kind();
        let id = locator.resource().id();

        let named = id
            .as_name()
            .filter(|_| id.has_reserved_prefix())
            .and_then(|name| self.entries.get(&(kind, Some(name.to_string()))).map(|e| (name, e)));

        let (allowed_reserved_names, entry) = match named {
            Some((name, entry)) => (BTreeSet::from([name.to_string()]), entry),
            None => {
                let entry = self.entries.get(&(kind, None)).ok_or_else(|| {
                    CairnError::capability(format!(
                        "{kind} namespaces do not accept certificate template {id}"
                    ))
                })?;
                (BTreeSet::new(), entry)
            }
        };

        let allowed_issuers: BTreeSet<NamespaceIdentifier> = match &entry.issuers {
            IssuerRule::SelfSigned => BTreeSet::from([namespace.clone()]),
            IssuerRule::MatchingRoot => {
                let root = if id_is(namespace, "test") { "test" } else { "default" };
                BTreeSet::from([NamespaceIdentifier::named(NamespaceKind::CaRoot, root)?])
            }
            IssuerRule::Fixed(list) => list.iter().cloned().collect(),
        };
        let default_issuer = if allowed_issuers.len() == 1 {
            allowed_issuers.first().cloned()
        } else {
            None
        };

        Ok(NamespaceCertificateTemplateCapabilities {
            allowed_reserved_names,
            allowed_issuers,
            default_issuer,
            allowed_usages: entry.usages.clone(),
            default_key_spec: entry.default_key_spec.clone(),
            key_spec_locked: entry.key_spec_locked,
            allow_variables: entry.allow_variables,
            has_key_store: entry.has_key_store,
            exportability: entry.exportability,
            disallow_rsa: entry.disallow_rsa,
        })
    }
}

fn id_is(namespace: &NamespaceIdentifier, name: &str) -> bool {
    namespace.id().as_name() == Some(name)
}

#[cfg(test)]
mod tests {
    use cairn_core::models::KeyType;
    use cairn_core::{ResourceIdentifier, ResourceKind};
    use uuid::Uuid;

    use super::*;

    fn policy(ns: NamespaceIdentifier, name: &str) -> ResourceLocator {
        ns.locate(ResourceIdentifier::named(ResourceKind::CertPolicy, name).unwrap())
    }

    fn group() -> NamespaceIdentifier {
        format!("group:{}", Uuid::new_v4()).parse().unwrap()
    }

    #[test]
    fn entra_creds_are_locked_to_rsa_and_one_issuer() {
        let registry = CapabilityRegistry::builtin().unwrap();
        let caps = registry
            .capabilities(&policy(group(), MS_ENTRA_CLIENT_CREDS))
            .unwrap();

        assert!(caps.key_spec_locked);
        assert_eq!(caps.default_key_spec.kty, KeyType::Rsa);
        assert_eq!(caps.default_key_spec.key_size, Some(2048));
        assert_eq!(caps.exportability, Exportability::Forbidden);
        assert_eq!(
            caps.default_issuer.unwrap().to_string(),
            "caInt:ms-entra-client-secret"
        );
        assert!(caps.allowed_reserved_names.contains(MS_ENTRA_CLIENT_CREDS));
    }

    #[test]
    fn root_is_self_signed() {
        let registry = CapabilityRegistry::builtin().unwrap();
        let ns = NamespaceIdentifier::named(NamespaceKind::CaRoot, "default").unwrap();
        let caps = registry.capabilities(&policy(ns.clone(), "default")).unwrap();
        assert_eq!(caps.default_issuer, Some(ns));
        assert!(caps.allowed_usages.contains(&CertificateUsage::CaRoot));
    }

    #[test]
    fn test_intermediate_chains_to_test_root() {
        let registry = CapabilityRegistry::builtin().unwrap();
        let ns = NamespaceIdentifier::named(NamespaceKind::CaInt, "test").unwrap();
        let caps = registry.capabilities(&policy(ns, "default")).unwrap();
        assert_eq!(caps.default_issuer.unwrap().to_string(), "caRoot:test");
    }

    #[test]
    fn unregistered_reserved_name_falls_back_without_allowance() {
        let registry = CapabilityRegistry::builtin().unwrap();
        let caps = registry
            .capabilities(&policy(group(), "default-web"))
            .unwrap();
        assert!(caps.allowed_reserved_names.is_empty());
    }

    #[test]
    fn unsupported_namespace_kind_is_a_violation() {
        let registry = CapabilityRegistry::builtin().unwrap();
        let ns = NamespaceIdentifier::named(NamespaceKind::System, "cairn").unwrap();
        let err = registry.capabilities(&policy(ns, "web")).unwrap_err();
        assert_eq!(err.kind(), cairn_core::ErrorKind::CapabilityViolation);

        let root = NamespaceIdentifier::named(NamespaceKind::CaRoot, "default").unwrap();
        assert!(registry.capabilities(&policy(root, "web")).is_err());
    }

    #[test]
    fn service_principals_choose_between_two_issuers() {
        let registry = CapabilityRegistry::builtin().unwrap();
        let ns: NamespaceIdentifier = format!("servicePrincipal:{}", Uuid::new_v4())
            .parse()
            .unwrap();
        let caps = registry.capabilities(&policy(ns, "web")).unwrap();
        assert_eq!(caps.allowed_issuers.len(), 2);
        assert!(caps.default_issuer.is_none());
    }
}
