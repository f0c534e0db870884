//! Request context: who is calling, whether the call has been explicitly
//! elevated to the system principal, and the caller's cancellation signal.

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CairnError, CairnResult};
use crate::identifier::{Identifier, NamespaceIdentifier, NamespaceKind};

/// Identity recorded in `updated_by` for writes made under elevation.
pub const SYSTEM_PRINCIPAL_ID: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalKind {
    User,
    ServicePrincipal,
    System,
}

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub kind: PrincipalKind,
    /// Administrators may act on every namespace.
    pub is_admin: bool,
    /// Namespaces the principal manages besides its own, e.g. groups it
    /// owns.
    pub memberships: Vec<NamespaceIdentifier>,
}

impl Principal {
    pub fn user(id: Uuid) -> Self {
        Self {
            id: id.to_string(),
            kind: PrincipalKind::User,
            is_admin: false,
            memberships: Vec::new(),
        }
    }

    pub fn service_principal(id: Uuid) -> Self {
        Self {
            id: id.to_string(),
            kind: PrincipalKind::ServicePrincipal,
            is_admin: false,
            memberships: Vec::new(),
        }
    }

    pub fn system() -> Self {
        Self {
            id: SYSTEM_PRINCIPAL_ID.to_string(),
            kind: PrincipalKind::System,
            is_admin: true,
            memberships: Vec::new(),
        }
    }

    pub fn with_admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    pub fn with_membership(mut self, namespace: NamespaceIdentifier) -> Self {
        self.memberships.push(namespace);
        self
    }

    /// The namespace owned by this principal, if it has one.
    pub fn own_namespace(&self) -> Option<NamespaceIdentifier> {
        let kind = match self.kind {
            PrincipalKind::User => NamespaceKind::User,
            PrincipalKind::ServicePrincipal => NamespaceKind::ServicePrincipal,
            PrincipalKind::System => return None,
        };
        let id = Identifier::parse(&self.id).ok()?;
        NamespaceIdentifier::new(kind, id).ok()
    }
}

/// Why and for whom a context was elevated.
#[derive(Debug, Clone)]
pub struct Elevation {
    pub reason: &'static str,
    pub on_behalf_of: String,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    principal: Principal,
    elevation: Option<Elevation>,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            elevation: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A context acting as the system principal from the start, for
    /// bootstrap tasks that have no external caller.
    pub fn system() -> Self {
        Self::new(Principal::system())
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The effective principal. Under elevation this is the system
    /// principal, not the original caller.
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Identity of the original caller, even under elevation.
    pub fn caller_id(&self) -> &str {
        match &self.elevation {
            Some(elevation) => &elevation.on_behalf_of,
            None => &self.principal.id,
        }
    }

    /// Derive a context that acts as the system principal.
    ///
    /// The returned context shares the caller's cancellation token. The
    /// original context is left untouched, so the elevation only lasts
    /// as long as the returned value is used.
    pub fn elevate(&self, reason: &'static str) -> RequestContext {
        debug!(caller = %self.caller_id(), reason, "Elevating request context");
        RequestContext {
            principal: Principal::system(),
            elevation: Some(Elevation {
                reason,
                on_behalf_of: self.caller_id().to_string(),
            }),
            cancel: self.cancel.clone(),
        }
    }

    pub fn elevation(&self) -> Option<&Elevation> {
        self.elevation.as_ref()
    }

    pub fn is_elevated(&self) -> bool {
        self.elevation.is_some()
    }

    /// Value written to `updated_by` on documents touched by this context.
    pub fn updated_by(&self) -> &str {
        &self.principal.id
    }

    /// Check that the effective principal may act on `namespace`.
    pub fn authorize(&self, namespace: &NamespaceIdentifier) -> CairnResult<()> {
        let principal = &self.principal;
        let allowed = self.is_elevated()
            || principal.is_admin
            || principal.own_namespace().as_ref() == Some(namespace)
            || principal.memberships.contains(namespace);
        if allowed {
            Ok(())
        } else {
            Err(CairnError::Forbidden {
                reason: format!("principal {} may not access {namespace}", principal.id),
            })
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail with [`CairnError::Cancelled`] once the caller has cancelled.
    pub fn ensure_active(&self, operation: &str) -> CairnResult<()> {
        if self.cancel.is_cancelled() {
            Err(CairnError::Cancelled {
                operation: operation.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn user_may_access_own_namespace_only() {
        let id = Uuid::new_v4();
        let ctx = RequestContext::new(Principal::user(id));
        let own = NamespaceIdentifier::new(NamespaceKind::User, Identifier::Uuid(id)).unwrap();
        let other =
            NamespaceIdentifier::new(NamespaceKind::User, Identifier::new_uuid()).unwrap();

        assert!(ctx.authorize(&own).is_ok());
        assert_eq!(
            ctx.authorize(&other).unwrap_err().kind(),
            ErrorKind::Forbidden
        );
    }

    #[test]
    fn elevation_is_scoped_to_the_derived_context() {
        let caller = Uuid::new_v4();
        let ctx = RequestContext::new(Principal::user(caller));
        let ca = NamespaceIdentifier::named(NamespaceKind::CaInt, "default").unwrap();

        let elevated = ctx.elevate("test");
        assert!(elevated.authorize(&ca).is_ok());
        assert_eq!(elevated.updated_by(), SYSTEM_PRINCIPAL_ID);
        assert_eq!(elevated.caller_id(), caller.to_string());

        assert!(!ctx.is_elevated());
        assert!(ctx.authorize(&ca).is_err());
    }

    #[test]
    fn cancellation_is_shared_with_elevated_context() {
        let ctx = RequestContext::system();
        let elevated = ctx.elevate("test");
        ctx.cancellation().cancel();
        assert_eq!(
            elevated.ensure_active("op").unwrap_err().kind(),
            ErrorKind::Cancelled
        );
    }
}
