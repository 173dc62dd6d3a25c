//! Spec equality that ignores how quantities are spelled and the order of storage nodes.
use std::collections::BTreeMap;

use k8s_openapi::{api::core::v1::ResourceRequirements, apimachinery::pkg::api::resource::Quantity};

use crate::cluster::CephClusterSpec;

const NANOS: i128 = 1_000_000_000;

/// Parse a Kubernetes quantity into billionths of its unit.
///
/// Returns None for text that is not a quantity.
pub fn parse_quantity(text: &str) -> Option<i128> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(text.len());
    let (number, suffix) = text.split_at(split);
    let nanos = parse_decimal(number)?;

    let (num, den): (i128, i128) = match suffix {
        "" => (1, 1),
        "n" => (1, NANOS),
        "u" => (1, 1_000_000),
        "m" => (1, 1_000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        exp if exp.starts_with(['e', 'E']) => {
            let exp: i32 = exp[1..].parse().ok()?;
            if exp >= 0 {
                (10i128.checked_pow(exp.unsigned_abs())?, 1)
            } else {
                (1, 10i128.checked_pow(exp.unsigned_abs())?)
            }
        }
        _ => return None,
    };
    Some(nanos.checked_mul(num)? / den)
}

fn parse_decimal(number: &str) -> Option<i128> {
    let (negative, digits) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    let whole: i128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut frac_nanos: i128 = 0;
    let mut scale = NANOS / 10;
    for c in fraction.chars() {
        let digit = c.to_digit(10)? as i128;
        frac_nanos += digit * scale;
        scale /= 10;
    }
    let value = whole.checked_mul(NANOS)? + frac_nanos;
    Some(if negative { -value } else { value })
}

fn normalize_quantities(quantities: &mut Option<BTreeMap<String, Quantity>>) {
    if let Some(quantities) = quantities {
        for quantity in quantities.values_mut() {
            if let Some(nanos) = parse_quantity(&quantity.0) {
                quantity.0 = nanos.to_string();
            }
        }
    }
}

fn normalize_resources(resources: &mut ResourceRequirements) {
    normalize_quantities(&mut resources.limits);
    normalize_quantities(&mut resources.requests);
}

fn normalized(spec: &CephClusterSpec) -> CephClusterSpec {
    let mut spec = spec.clone();
    if let Some(resources) = &mut spec.resources {
        resources.values_mut().for_each(normalize_resources);
    }
    spec.storage.nodes.sort_by(|a, b| a.name.cmp(&b.name));
    for node in &mut spec.storage.nodes {
        if let Some(resources) = &mut node.resources {
            normalize_resources(resources);
        }
    }
    spec
}

/// Whether two specs request the same cluster.
pub fn specs_equal(a: &CephClusterSpec, b: &CephClusterSpec) -> bool {
    normalized(a) == normalized(b)
}
