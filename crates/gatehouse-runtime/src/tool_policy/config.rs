//! Config representation of a tool access policy.
//!
//! Accepted shapes: `tools = "*"`, `tools = { allow = [..] }`,
//! `tools = { block = [..] }`.

use serde::{Deserialize, Serialize};

use super::ToolAccessPolicy;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub(crate) enum PolicyRepr {
    Wildcard(String),
    Allow(AllowRepr),
    Block(BlockRepr),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct AllowRepr {
    allow: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct BlockRepr {
    block: Vec<String>,
}

impl TryFrom<PolicyRepr> for ToolAccessPolicy {
    type Error = String;

    fn try_from(repr: PolicyRepr) -> Result<Self, Self::Error> {
        match repr {
            PolicyRepr::Wildcard(s) if s == "*" => Ok(ToolAccessPolicy::Wildcard),
            PolicyRepr::Wildcard(s) => Err(format!(
                "invalid tools policy {:?}: expected \"*\", {{ allow = [..] }} or {{ block = [..] }}",
                s
            )),
            PolicyRepr::Allow(a) => {
                reject_empty_names(&a.allow)?;
                Ok(ToolAccessPolicy::allow(a.allow))
            }
            PolicyRepr::Block(b) => {
                reject_empty_names(&b.block)?;
                Ok(ToolAccessPolicy::block(b.block))
            }
        }
    }
}

impl From<ToolAccessPolicy> for PolicyRepr {
    fn from(policy: ToolAccessPolicy) -> Self {
        match policy {
            ToolAccessPolicy::Wildcard => PolicyRepr::Wildcard("*".to_string()),
            ToolAccessPolicy::AllowList(names) => PolicyRepr::Allow(AllowRepr {
                allow: names.into_iter().collect(),
            }),
            ToolAccessPolicy::BlockList(names) => PolicyRepr::Block(BlockRepr {
                block: names.into_iter().collect(),
            }),
        }
    }
}

fn reject_empty_names(names: &[String]) -> Result<(), String> {
    if names.iter().any(|n| n.is_empty()) {
        return Err("tool names in allow/block lists must not be empty".to_string());
    }
    Ok(())
}

impl<'de> Deserialize<'de> for ToolAccessPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let repr = PolicyRepr::deserialize(deserializer)?;
        ToolAccessPolicy::try_from(repr).map_err(serde::de::Error::custom)
    }
}

impl Serialize for ToolAccessPolicy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        PolicyRepr::from(self.clone()).serialize(serializer)
    }
}
