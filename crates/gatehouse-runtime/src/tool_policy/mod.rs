//! Per-service tool access policy: wildcard, allow-list or block-list.

pub mod config;

use std::collections::BTreeSet;

/// Result of evaluating a tool name against a service policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Blocked,
}

impl AccessDecision {
    pub fn is_allowed(self) -> bool {
        self == AccessDecision::Allowed
    }
}

/// Access policy attached to one upstream service. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolAccessPolicy {
    /// Every tool is allowed
    #[default]
    Wildcard,
    /// Only the listed tools are allowed
    AllowList(BTreeSet<String>),
    /// Every tool except the listed ones is allowed
    BlockList(BTreeSet<String>),
}

impl ToolAccessPolicy {
    pub fn allow<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ToolAccessPolicy::AllowList(names.into_iter().map(Into::into).collect())
    }

    pub fn block<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ToolAccessPolicy::BlockList(names.into_iter().map(Into::into).collect())
    }

    /// Evaluate a single tool name. Pure, no I/O.
    pub fn evaluate(&self, tool_name: &str) -> AccessDecision {
        let allowed = match self {
            ToolAccessPolicy::Wildcard => true,
            ToolAccessPolicy::AllowList(names) => names.contains(tool_name),
            ToolAccessPolicy::BlockList(names) => !names.contains(tool_name),
        };
        if allowed {
            AccessDecision::Allowed
        } else {
            AccessDecision::Blocked
        }
    }

    /// Keep only the allowed names, preserving input order
    pub fn filter_allowed<'a, I>(&self, tool_names: I) -> Vec<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        tool_names
            .into_iter()
            .filter(|name| self.evaluate(name).is_allowed())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_allows_everything() {
        let policy = ToolAccessPolicy::Wildcard;
        for name in ["", "anything", "github__delete_repo", "*"] {
            assert_eq!(policy.evaluate(name), AccessDecision::Allowed);
        }
    }

    #[test]
    fn test_allow_list() {
        let policy = ToolAccessPolicy::allow(["a", "b"]);
        assert!(policy.evaluate("a").is_allowed());
        assert!(policy.evaluate("b").is_allowed());
        assert_eq!(policy.evaluate("c"), AccessDecision::Blocked);
        assert_eq!(policy.evaluate(""), AccessDecision::Blocked);
    }

    #[test]
    fn test_block_list() {
        let policy = ToolAccessPolicy::block(["x"]);
        assert_eq!(policy.evaluate("x"), AccessDecision::Blocked);
        assert!(policy.evaluate("y").is_allowed());
        assert!(policy.evaluate("").is_allowed());
    }

    #[test]
    fn test_filter_allowed_preserves_order() {
        let policy = ToolAccessPolicy::block(["delete_repo", "delete_branch"]);
        let names = ["list_repos", "delete_repo", "create_issue", "delete_branch"];
        assert_eq!(
            policy.filter_allowed(names),
            vec!["list_repos", "create_issue"]
        );
    }

    #[test]
    fn test_empty_allow_list_blocks_all() {
        let policy = ToolAccessPolicy::allow(Vec::<String>::new());
        assert!(policy.filter_allowed(["a", "b"]).is_empty());
    }
}
