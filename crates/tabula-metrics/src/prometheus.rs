//! Prometheus text exposition format.
//!
//! Renders a collection tree into the Prometheus text exposition format
//! for scraping by a Prometheus server or compatible agent.

use std::collections::BTreeMap;

use crate::collection::MetricsCollection;

/// Render every counter under `root` in Prometheus text format.
///
/// Counters sharing a name become one metric family `tabula_<name>`, with
/// the owning collection's path as the `collection` label.
pub fn render_prometheus(root: &MetricsCollection) -> String {
    let mut families: BTreeMap<String, Vec<(String, u64)>> = BTreeMap::new();
    for (path, name, value) in root.snapshot() {
        families
            .entry(sanitize(&name))
            .or_default()
            .push((path, value));
    }

    let mut out = String::new();
    for (name, samples) in families {
        out.push_str(&format!("# TYPE tabula_{name} counter\n"));
        for (path, value) in samples {
            out.push_str(&format!(
                "tabula_{name}{{collection=\"{}\"}} {value}\n",
                path.replace('\\', "\\\\").replace('"', "\\\"")
            ));
        }
    }
    out
}

/// Metric names may only contain `[a-zA-Z0-9_]`.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
