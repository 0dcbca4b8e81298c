//! Composite tool names: `<service><SEPARATOR><tool>`.
//!
//! Service ids are validated at config load to never contain the separator
//! and never end with `_`, so splitting on the first occurrence always
//! recovers the original pair even when the tool name itself contains `__`.

/// Reserved separator between service id and tool name
pub const SEPARATOR: &str = "__";

/// Build the externally visible name for a service's tool
pub fn compose(service_id: &str, tool_name: &str) -> String {
    format!("{}{}{}", service_id, SEPARATOR, tool_name)
}

/// Split a composite name on the first separator.
/// Returns `None` when no separator is present.
pub fn decompose(composite: &str) -> Option<(&str, &str)> {
    let idx = composite.find(SEPARATOR)?;
    Some((&composite[..idx], &composite[idx + SEPARATOR.len()..]))
}

/// Whether `service_id` can take part in a composite name.
/// A trailing `_` would merge with the separator (`my_` + `__` = `my___`).
pub fn is_valid_service_id(service_id: &str) -> bool {
    !service_id.is_empty() && !service_id.contains(SEPARATOR) && !service_id.ends_with('_')
}
