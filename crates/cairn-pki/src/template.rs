//! `{{variable}}` substitution in certificate subjects and SANs.
//!
//! Only the variables in [`TEMPLATE_VARIABLES`] exist. Anything between
//! `{{` and `}}` that is not one of them, and any `{{` or `}}` without
//! its partner, is an [`CairnError::InvalidTemplateSyntax`]. Text outside
//! the delimiters is copied through byte for byte.

use std::collections::BTreeMap;

use cairn_core::{CairnError, CairnResult, NamespaceIdentifier};

pub const TEMPLATE_VARIABLES: &[&str] = &[
    "ns.id",
    "ns.kind",
    "ns.displayName",
    "ns.upn",
    "ns.appId",
    "ns.mail",
];

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Literal(&'a str),
    Variable(&'a str),
}

fn syntax_error(template: &str, reason: impl Into<String>) -> CairnError {
    CairnError::InvalidTemplateSyntax {
        template: template.to_string(),
        reason: reason.into(),
    }
}

/// Whether `value` contains any template delimiter.
pub fn has_variables(value: &str) -> bool {
    value.contains(OPEN) || value.contains(CLOSE)
}

pub fn parse(template: &str) -> CairnResult<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut rest = template;

    while !rest.is_empty() {
        let open = rest.find(OPEN);
        let close = rest.find(CLOSE);
        match (open, close) {
            (None, None) => {
                segments.push(Segment::Literal(rest));
                break;
            }
            (None, Some(_)) => return Err(syntax_error(template, "`}}` without `{{`")),
            (Some(o), Some(c)) if c < o => {
                return Err(syntax_error(template, "`}}` without `{{`"));
            }
            (Some(o), _) => {
                if o > 0 {
                    segments.push(Segment::Literal(&rest[..o]));
                }
                let after = &rest[o + OPEN.len()..];
                let end = after
                    .find(CLOSE)
                    .ok_or_else(|| syntax_error(template, "`{{` is never closed"))?;
                let inner = &after[..end];
                if inner.contains(OPEN) {
                    return Err(syntax_error(template, "nested `{{`"));
                }
                let name = inner.trim();
                if !TEMPLATE_VARIABLES.contains(&name) {
                    return Err(syntax_error(
                        template,
                        format!("unknown variable {name:?}"),
                    ));
                }
                segments.push(Segment::Variable(name));
                rest = &after[end + CLOSE.len()..];
            }
        }
    }
    Ok(segments)
}

pub fn validate(template: &str) -> CairnResult<()> {
    parse(template).map(|_| ())
}

/// Values available to templates for one issuance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    values: BTreeMap<String, String>,
}

impl TemplateContext {
    /// `ns.id` and `ns.kind` of `namespace`. Directory attributes are
    /// added by the caller with [`with`](Self::with).
    pub fn for_namespace(namespace: &NamespaceIdentifier) -> Self {
        Self::default()
            .with("ns.id", namespace.id().to_string())
            .with("ns.kind", namespace.kind().to_string())
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Substitute every variable in `template`.
pub fn render(template: &str, context: &TemplateContext) -> CairnResult<String> {
    let mut out = String::with_capacity(template.len());
    for segment in parse(template)? {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Variable(name) => {
                let value = context
                    .get(name)
                    .ok_or_else(|| syntax_error(template, format!("no value for {name}")))?;
                out.push_str(value);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use cairn_core::ErrorKind;
    use proptest::prelude::*;

    use super::*;

    fn ctx() -> TemplateContext {
        TemplateContext::default()
            .with("ns.id", "1234")
            .with("ns.displayName", "Build Agents")
    }

    #[test]
    fn substitutes_known_variables() {
        assert_eq!(
            render("{{ns.displayName}} ({{ ns.id }})", &ctx()).unwrap(),
            "Build Agents (1234)"
        );
    }

    #[test]
    fn single_braces_are_literal() {
        assert_eq!(render("a{b}c", &ctx()).unwrap(), "a{b}c");
    }

    #[test]
    fn rejects_unknown_and_unbalanced() {
        for bad in ["{{ns.secret}}", "{{ns.id", "ns.id}}", "}}{{ns.id}}", "{{ {{ns.id}} }}"] {
            let err = render(bad, &ctx()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidTemplateSyntax, "{bad}");
        }
    }

    #[test]
    fn missing_value_fails_closed() {
        let err = render("{{ns.upn}}", &ctx()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTemplateSyntax);
    }

    #[test]
    fn namespace_context_fills_id_and_kind() {
        let ns = NamespaceIdentifier::named(cairn_core::NamespaceKind::CaInt, "services").unwrap();
        let rendered = render("{{ns.kind}}/{{ns.id}}", &TemplateContext::for_namespace(&ns));
        assert_eq!(rendered.unwrap(), "caInt/services");
    }

    proptest! {
        #[test]
        fn text_without_delimiters_is_copied_exactly(s in "[^{}]*") {
            prop_assert_eq!(render(&s, &ctx()).unwrap(), s);
        }
    }
}
