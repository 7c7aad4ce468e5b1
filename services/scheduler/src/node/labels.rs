//! Node labels derived from agent attributes.

use std::collections::BTreeMap;

use tracing::debug;

use crate::model::{Attribute, AttributeValue, Node};

/// Prefix of every attribute-derived label key.
pub const LABEL_PREFIX: &str = "quarry.dev/attribute-";

/// Well-known label carrying the node's hostname.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

const NAME_MAX_LEN: usize = 63;
const PREFIX_MAX_LEN: usize = 253;

/// Convert agent attributes into `quarry.dev/attribute-<name>` labels.
///
/// Attributes whose key or value would not be a valid label are dropped.
pub fn attributes_to_labels(attributes: &[Attribute]) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for attr in attributes {
        let key = format!("{LABEL_PREFIX}{}", attr.name);
        let value = match &attr.value {
            AttributeValue::Text(text) => text.clone(),
            AttributeValue::Scalar(v) => v.to_string(),
        };

        if !is_qualified_name(&key) {
            debug!(key = %key, "Ignoring invalid node label name");
            continue;
        }
        if !is_valid_label_value(&value) {
            debug!(key = %key, value = %value, "Ignoring invalid node label value");
            continue;
        }
        labels.insert(key, value);
    }
    labels
}

pub fn is_attribute_label(key: &str) -> bool {
    key.starts_with(LABEL_PREFIX)
}

/// True iff the node's attribute-derived labels are exactly `labels`.
pub fn is_up_to_date(node: &Node, labels: &BTreeMap<String, String>) -> bool {
    let current: BTreeMap<_, _> = node
        .labels
        .iter()
        .filter(|(k, _)| is_attribute_label(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    &current == labels
}

/// `[prefix/]name`, prefix a DNS subdomain.
pub fn is_qualified_name(value: &str) -> bool {
    let (prefix, name) = match value.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, value),
    };
    if let Some(prefix) = prefix {
        if !is_dns_subdomain(prefix) {
            return false;
        }
    }
    is_label_name(name)
}

/// Empty, or a label name.
pub fn is_valid_label_value(value: &str) -> bool {
    value.is_empty() || is_label_name(value)
}

fn is_label_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            name.len() <= NAME_MAX_LEN
                && first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        }
        _ => false,
    }
}

fn is_dns_subdomain(prefix: &str) -> bool {
    !prefix.is_empty()
        && prefix.len() <= PREFIX_MAX_LEN
        && prefix.split('.').all(|part| {
            let bytes = part.as_bytes();
            match (bytes.first(), bytes.last()) {
                (Some(first), Some(last)) => {
                    is_lower_alnum(*first)
                        && is_lower_alnum(*last)
                        && bytes.iter().all(|&b| is_lower_alnum(b) || b == b'-')
                }
                _ => false,
            }
        })
}

fn is_lower_alnum(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}
