//! Authorization seam.
//!
//! The core never decides who may do what on its own: every mutating entry
//! point asks an [`Authorizer`]. [`ConfiguredAuthorizer`] answers from the
//! `[access]` section of the config file.

use std::collections::HashSet;

use crate::config::AccessConfig;
use crate::models::ChangeRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Edit metadata, close or reopen.
    Update,
    Merge,
    CancelMerge,
    ResolveConflicts,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Update => "update",
            Self::Merge => "merge",
            Self::CancelMerge => "cancel_merge",
            Self::ResolveConflicts => "resolve_conflicts",
        };
        write!(f, "{}", s)
    }
}

pub trait Authorizer: Send + Sync {
    fn can_perform(&self, actor: &str, action: Action, change_request: &ChangeRequest) -> bool;
}

/// Role lists from configuration.
///
/// Maintainers may do anything. Developers may update and resolve
/// conflicts, and merge or cancel merges when `developers_can_merge` is
/// set. With both lists empty every actor is allowed everything.
pub struct ConfiguredAuthorizer {
    maintainers: HashSet<String>,
    developers: HashSet<String>,
    developers_can_merge: bool,
}

impl ConfiguredAuthorizer {
    pub fn from_config(config: &AccessConfig) -> Self {
        Self {
            maintainers: config.maintainers.iter().cloned().collect(),
            developers: config.developers.iter().cloned().collect(),
            developers_can_merge: config.developers_can_merge,
        }
    }

    fn is_open_access(&self) -> bool {
        self.maintainers.is_empty() && self.developers.is_empty()
    }
}

impl Authorizer for ConfiguredAuthorizer {
    fn can_perform(&self, actor: &str, action: Action, _change_request: &ChangeRequest) -> bool {
        if self.is_open_access() || self.maintainers.contains(actor) {
            return true;
        }
        if !self.developers.contains(actor) {
            return false;
        }
        match action {
            Action::Update | Action::ResolveConflicts => true,
            Action::Merge | Action::CancelMerge => self.developers_can_merge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{open_change_request, test_db};

    fn authorizer(developers_can_merge: bool) -> ConfiguredAuthorizer {
        ConfiguredAuthorizer::from_config(&AccessConfig {
            maintainers: vec!["maya".into()],
            developers: vec!["dev".into()],
            developers_can_merge,
        })
    }

    #[test]
    fn test_roles() {
        let cr = open_change_request(&test_db(), "feature", "main");
        let authz = authorizer(false);

        for action in [
            Action::Update,
            Action::Merge,
            Action::CancelMerge,
            Action::ResolveConflicts,
        ] {
            assert!(authz.can_perform("maya", action, &cr));
            assert!(!authz.can_perform("stranger", action, &cr));
        }
        assert!(authz.can_perform("dev", Action::Update, &cr));
        assert!(authz.can_perform("dev", Action::ResolveConflicts, &cr));
        assert!(!authz.can_perform("dev", Action::Merge, &cr));
        assert!(!authz.can_perform("dev", Action::CancelMerge, &cr));

        let authz = authorizer(true);
        assert!(authz.can_perform("dev", Action::Merge, &cr));
        assert!(authz.can_perform("dev", Action::CancelMerge, &cr));
    }

    #[test]
    fn test_empty_lists_allow_everyone() {
        let cr = open_change_request(&test_db(), "feature", "main");
        let authz = ConfiguredAuthorizer::from_config(&AccessConfig::default());
        assert!(authz.can_perform("anyone", Action::Merge, &cr));
        assert_eq!(Action::CancelMerge.to_string(), "cancel_merge");
    }
}
