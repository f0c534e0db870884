//! Typed, self-describing addresses for namespaces and resources.
//!
//! Text forms are strict: `kind:identifier` for namespace and resource
//! identifiers, and `nsKind:nsId/resKind:resId` for locators. `:` and `/`
//! are the only separators and never appear inside an identifier, so
//! parsing either yields a complete value or fails with a typed error.
//!
//! UUID and string identifiers are never interchanged. A UUID identifier
//! addresses a principal-owned namespace (user, group, service principal,
//! ...); a string identifier addresses a well-known or reserved resource.
//! Text that parses as a UUID is always a UUID identifier.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::{Uuid, Version};

use crate::error::{CairnError, CairnResult};

/// Identifiers must be strictly shorter than this.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// String identifiers equal to one of these words, or starting with the
/// word and a `-`, are reserved for system-defined resources.
pub const RESERVED_PREFIXES: &[&str] = &[
    "default", "system", "reserved", "latest", "template", "self", "global",
];

/// Well-known root CA namespace names.
pub const CA_ROOT_NAMES: &[&str] = &["default", "test"];

/// Well-known intermediate CA namespace names.
pub const CA_INT_NAMES: &[&str] = &[
    "default",
    "services",
    "intranet",
    "ms-entra-client-secret",
    "test",
];

/// Well-known rule document names.
pub const CERT_RULE_NAMES: &[&str] = &["issuer", "ms-entra-client-credential"];

fn invalid_identifier(value: &str, reason: impl Into<String>) -> CairnError {
    CairnError::InvalidIdentifier {
        value: value.to_string(),
        reason: reason.into(),
    }
}

// -----------------------------------------------------------------------
// Identifier
// -----------------------------------------------------------------------

/// Either a version-4 UUID or a validated name matching `[A-Za-z0-9_-]+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identifier {
    Uuid(Uuid),
    Name(String),
}

impl Identifier {
    /// Parse identifier text, classifying UUID-shaped text as a UUID.
    ///
    /// Only the lowercase hyphenated UUID form is accepted, so accepted
    /// text always prints back unchanged. Other encodings that the UUID
    /// parser understands (uppercase, simple hex, braced, URN) are
    /// rejected rather than being treated as names.
    pub fn parse(value: &str) -> CairnResult<Self> {
        if let Ok(uuid) = Uuid::try_parse(value) {
            if value != uuid.hyphenated().to_string() {
                return Err(invalid_identifier(
                    value,
                    "UUID identifiers must use the lowercase hyphenated form",
                ));
            }
            return Self::uuid(uuid);
        }
        Self::check_name(value)?;
        Ok(Self::Name(value.to_string()))
    }

    /// Construct a name identifier. Fails if the text is a UUID.
    pub fn name(value: impl Into<String>) -> CairnResult<Self> {
        let value = value.into();
        if Uuid::try_parse(&value).is_ok() {
            return Err(invalid_identifier(
                &value,
                "UUID-shaped text cannot be used as a name identifier",
            ));
        }
        Self::check_name(&value)?;
        Ok(Self::Name(value))
    }

    /// Construct a UUID identifier. Only version-4 UUIDs are accepted.
    pub fn uuid(value: Uuid) -> CairnResult<Self> {
        if value.get_version() != Some(Version::Random) {
            return Err(invalid_identifier(
                &value.to_string(),
                "UUID identifiers must be version 4",
            ));
        }
        Ok(Self::Uuid(value))
    }

    /// A fresh random UUID identifier.
    pub fn new_uuid() -> Self {
        Self::Uuid(Uuid::new_v4())
    }

    fn check_name(value: &str) -> CairnResult<()> {
        if value.is_empty() {
            return Err(invalid_identifier(value, "identifier is empty"));
        }
        if value.len() >= MAX_IDENTIFIER_LEN {
            return Err(invalid_identifier(
                value,
                format!("identifier must be shorter than {MAX_IDENTIFIER_LEN} characters"),
            ));
        }
        if let Some(c) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(invalid_identifier(
                value,
                format!("character {c:?} is not allowed"),
            ));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Self::Uuid(uuid) => uuid.get_version() == Some(Version::Random),
            Self::Name(name) => Self::check_name(name).is_ok() && Uuid::try_parse(name).is_err(),
        }
    }

    pub fn is_uuid(&self) -> bool {
        matches!(self, Self::Uuid(_))
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(uuid) => Some(*uuid),
            Self::Name(_) => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Uuid(_) => None,
            Self::Name(name) => Some(name),
        }
    }

    /// True for name identifiers that are a reserved word, or a reserved
    /// word followed by `-`. Case is ignored.
    pub fn has_reserved_prefix(&self) -> bool {
        match self {
            Self::Uuid(_) => false,
            Self::Name(name) => {
                let lower = name.to_ascii_lowercase();
                RESERVED_PREFIXES.iter().any(|word| {
                    lower
                        .strip_prefix(word)
                        .is_some_and(|rest| rest.is_empty() || rest.starts_with('-'))
                })
            }
        }
    }

    fn is_name_in(&self, allowed: &[&str]) -> bool {
        self.as_name().is_some_and(|name| allowed.contains(&name))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uuid(uuid) => write!(f, "{}", uuid.hyphenated()),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl FromStr for Identifier {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// -----------------------------------------------------------------------
// Kinds
// -----------------------------------------------------------------------

/// The closed set of namespace kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NamespaceKind {
    System,
    CaRoot,
    CaInt,
    Group,
    ServicePrincipal,
    User,
    Application,
    Device,
    Profile,
}

impl NamespaceKind {
    pub const ALL: [NamespaceKind; 9] = [
        Self::System,
        Self::CaRoot,
        Self::CaInt,
        Self::Group,
        Self::ServicePrincipal,
        Self::User,
        Self::Application,
        Self::Device,
        Self::Profile,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::CaRoot => "caRoot",
            Self::CaInt => "caInt",
            Self::Group => "group",
            Self::ServicePrincipal => "servicePrincipal",
            Self::User => "user",
            Self::Application => "application",
            Self::Device => "device",
            Self::Profile => "profile",
        }
    }

    /// Whether namespaces of this kind are addressed by directory object
    /// UUIDs rather than well-known names.
    pub fn requires_uuid(self) -> bool {
        matches!(
            self,
            Self::Group | Self::ServicePrincipal | Self::User | Self::Application | Self::Device
        )
    }

    pub fn is_certificate_authority(self) -> bool {
        matches!(self, Self::CaRoot | Self::CaInt)
    }

    /// Check that `id` is a legal identifier for a namespace of this kind.
    pub fn validate(self, id: &Identifier) -> CairnResult<()> {
        let text = id.to_string();
        let ok = match self {
            Self::CaRoot => id.is_name_in(CA_ROOT_NAMES),
            Self::CaInt => id.is_name_in(CA_INT_NAMES),
            Self::System | Self::Profile => !id.is_uuid(),
            kind if kind.requires_uuid() => id.is_uuid(),
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(invalid_identifier(
                &text,
                format!("not a valid {} namespace identifier", self.as_str()),
            ))
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NamespaceKind {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| invalid_identifier(s, "unknown namespace kind"))
    }
}

/// The kinds of documents addressable inside a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    CertPolicy,
    CertTemplate,
    Cert,
    LatestCertForTemplate,
    KeyPolicy,
    Key,
    NamespaceConfig,
    CertRule,
    AgentConfig,
    AgentInstance,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 10] = [
        Self::CertPolicy,
        Self::CertTemplate,
        Self::Cert,
        Self::LatestCertForTemplate,
        Self::KeyPolicy,
        Self::Key,
        Self::NamespaceConfig,
        Self::CertRule,
        Self::AgentConfig,
        Self::AgentInstance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CertPolicy => "certPolicy",
            Self::CertTemplate => "certTemplate",
            Self::Cert => "cert",
            Self::LatestCertForTemplate => "latestCertForTemplate",
            Self::KeyPolicy => "keyPolicy",
            Self::Key => "key",
            Self::NamespaceConfig => "namespaceConfig",
            Self::CertRule => "certRule",
            Self::AgentConfig => "agentConfig",
            Self::AgentInstance => "agentInstance",
        }
    }

    pub fn validate(self, id: &Identifier) -> CairnResult<()> {
        let ok = match self {
            Self::Cert => id.is_uuid(),
            Self::CertRule => id.is_name_in(CERT_RULE_NAMES),
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(invalid_identifier(
                &id.to_string(),
                format!("not a valid {} resource identifier", self.as_str()),
            ))
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| invalid_identifier(s, "unknown resource kind"))
    }
}

// -----------------------------------------------------------------------
// Composite identifiers
// -----------------------------------------------------------------------

/// Split `kind:value` at the single `:` separator.
fn split_kind(text: &str) -> CairnResult<(&str, &str)> {
    match text.split_once(':') {
        Some((kind, value)) if !kind.is_empty() && !value.is_empty() => Ok((kind, value)),
        _ => Err(invalid_identifier(text, "expected `kind:identifier`")),
    }
}

/// Address of a namespace: `(NamespaceKind, Identifier)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceIdentifier {
    kind: NamespaceKind,
    id: Identifier,
}

impl NamespaceIdentifier {
    pub fn new(kind: NamespaceKind, id: Identifier) -> CairnResult<Self> {
        kind.validate(&id)?;
        Ok(Self { kind, id })
    }

    /// Convenience for well-known namespaces addressed by name.
    pub fn named(kind: NamespaceKind, name: &str) -> CairnResult<Self> {
        Self::new(kind, Identifier::name(name)?)
    }

    pub fn kind(&self) -> NamespaceKind {
        self.kind
    }

    pub fn id(&self) -> &Identifier {
        &self.id
    }

    /// Locator of a resource inside this namespace.
    pub fn locate(&self, resource: ResourceIdentifier) -> ResourceLocator {
        ResourceLocator::new(self.clone(), resource)
    }
}

impl fmt::Display for NamespaceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for NamespaceIdentifier {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = split_kind(s)?;
        Self::new(kind.parse()?, id.parse()?)
    }
}

/// Address of a resource within a namespace: `(ResourceKind, Identifier)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIdentifier {
    kind: ResourceKind,
    id: Identifier,
}

impl ResourceIdentifier {
    pub fn new(kind: ResourceKind, id: Identifier) -> CairnResult<Self> {
        kind.validate(&id)?;
        Ok(Self { kind, id })
    }

    pub fn named(kind: ResourceKind, name: &str) -> CairnResult<Self> {
        Self::new(kind, Identifier::name(name)?)
    }

    /// Caller guarantees `id` satisfies the rules of `kind`.
    pub(crate) fn new_unchecked(kind: ResourceKind, id: &str) -> Self {
        Self {
            kind,
            id: Identifier::Name(id.to_string()),
        }
    }

    /// A new certificate resource with a fresh UUID.
    pub fn new_cert() -> Self {
        Self {
            kind: ResourceKind::Cert,
            id: Identifier::new_uuid(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn id(&self) -> &Identifier {
        &self.id
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for ResourceIdentifier {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = split_kind(s)?;
        Self::new(kind.parse()?, id.parse()?)
    }
}

/// The universal document address: namespace plus resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceLocator {
    namespace: NamespaceIdentifier,
    resource: ResourceIdentifier,
}

impl ResourceLocator {
    pub fn new(namespace: NamespaceIdentifier, resource: ResourceIdentifier) -> Self {
        Self {
            namespace,
            resource,
        }
    }

    pub fn namespace(&self) -> &NamespaceIdentifier {
        &self.namespace
    }

    pub fn resource(&self) -> &ResourceIdentifier {
        &self.resource
    }

    pub fn resource_kind(&self) -> ResourceKind {
        self.resource.kind
    }

    /// Same namespace, different resource.
    pub fn sibling(&self, resource: ResourceIdentifier) -> Self {
        Self::new(self.namespace.clone(), resource)
    }
}

impl fmt::Display for ResourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.resource)
    }
}

impl FromStr for ResourceLocator {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| CairnError::InvalidLocator {
            value: s.to_string(),
            reason,
        };
        let (namespace, resource) = s
            .split_once('/')
            .ok_or_else(|| invalid("expected `nsKind:nsId/resKind:resId`".into()))?;
        let namespace = namespace.parse().map_err(|e: CairnError| invalid(e.to_string()))?;
        let resource = resource.parse().map_err(|e: CairnError| invalid(e.to_string()))?;
        Ok(Self::new(namespace, resource))
    }
}

// -----------------------------------------------------------------------
// Serde: every address serializes as its text form
// -----------------------------------------------------------------------

macro_rules! serde_via_text {
    ($($ty:ty),* $(,)?) => {$(
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                text.parse().map_err(serde::de::Error::custom)
            }
        }
    )*};
}

serde_via_text!(
    Identifier,
    NamespaceKind,
    ResourceKind,
    NamespaceIdentifier,
    ResourceIdentifier,
    ResourceLocator,
);
