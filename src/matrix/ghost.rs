//! Ghost user namespace
//!
//! Ghosts are bridge-managed Matrix users generated from
//! `bridge.username_template` (e.g. `courier_{userid}` gives
//! `@courier_1234:example.com`). They live in the appservice's exclusive
//! namespace and are never real bridge users.

use super::traits::UserId;

/// Placeholder that marks the external ID inside the username template.
pub const USERID_PLACEHOLDER: &str = "{userid}";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("username_template must contain {{userid}} exactly once: {0}")]
    MissingPlaceholder(String),

    #[error("homeserver domain must not be empty")]
    EmptyDomain,
}

/// Reserved user ID range for ghost users
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostNamespace {
    prefix: String,
    suffix: String,
}

impl GhostNamespace {
    pub fn new(username_template: &str, domain: &str) -> Result<Self, TemplateError> {
        if domain.is_empty() {
            return Err(TemplateError::EmptyDomain);
        }
        if username_template.matches(USERID_PLACEHOLDER).count() != 1 {
            return Err(TemplateError::MissingPlaceholder(
                username_template.to_string(),
            ));
        }
        let (prefix, suffix) = username_template
            .split_once(USERID_PLACEHOLDER)
            .ok_or_else(|| TemplateError::MissingPlaceholder(username_template.to_string()))?;

        Ok(Self {
            prefix: format!("@{prefix}"),
            suffix: format!("{suffix}:{domain}"),
        })
    }

    /// External ID embedded in a ghost user ID, or `None` for anything else.
    pub fn ghost_id<'a>(&self, mxid: &'a UserId) -> Option<&'a str> {
        let id = mxid
            .as_str()
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?;
        (!id.is_empty()).then_some(id)
    }

    pub fn contains(&self, mxid: &UserId) -> bool {
        self.ghost_id(mxid).is_some()
    }

    /// Ghost user ID for an external ID.
    pub fn user_id(&self, id: &str) -> UserId {
        UserId(format!("{}{}{}", self.prefix, id, self.suffix))
    }

    /// Regex for the exclusive `users` namespace of the registration file.
    /// The ID part must be non-empty, as in [`Self::ghost_id`].
    pub fn regex(&self) -> String {
        format!(
            "{}.+{}",
            regex::escape(&self.prefix),
            regex::escape(&self.suffix)
        )
    }
}
