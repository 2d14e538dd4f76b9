//! OsmChange document rendering.
//!
//! Produces the `osmChange` XML the API's upload endpoint consumes, and that
//! offline runs hand back to the caller for use with other editors. Output
//! is deterministic for a given action order: same actions in, same bytes
//! out.

use crate::models::{ActionOp, Geometry, RevertAction};

const OSM_API_VERSION: &str = "0.6";

/// Render ordered actions as an OsmChange document.
///
/// `changeset_id` is stamped onto every element when present; offline
/// exports pass `None` and leave the attribute off for the uploading editor
/// to fill in. Contiguous runs of the same operation share one block, which
/// preserves the assembled order exactly.
pub fn build_document(
    actions: &[RevertAction],
    changeset_id: Option<i64>,
    generator: &str,
) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&format!(
        "<osmChange version=\"{}\" generator=\"{}\">\n",
        OSM_API_VERSION,
        escape(generator)
    ));

    let mut open_block: Option<ActionOp> = None;
    for action in actions {
        if open_block != Some(action.op) {
            if let Some(op) = open_block {
                out.push_str(&format!("</{op}>\n"));
            }
            out.push_str(&format!("<{}>\n", action.op));
            open_block = Some(action.op);
        }
        write_element(&mut out, action, changeset_id);
    }
    if let Some(op) = open_block {
        out.push_str(&format!("</{op}>\n"));
    }

    out.push_str("</osmChange>\n");
    out
}

fn write_element(out: &mut String, action: &RevertAction, changeset_id: Option<i64>) {
    let name = action.element.kind.as_str();
    // Creates go out under their negative placeholder id.
    let id = action.placeholder.unwrap_or(action.element.id);

    out.push_str(&format!("  <{name} id=\"{id}\""));
    if let Some(version) = action.based_on {
        out.push_str(&format!(" version=\"{version}\""));
    }
    if let Some(cs) = changeset_id {
        out.push_str(&format!(" changeset=\"{cs}\""));
    }

    // The server ignores payloads on deletes; keep them bare.
    if action.op == ActionOp::Delete {
        out.push_str("/>\n");
        return;
    }

    if let Some(Geometry::Node { lat, lon }) = &action.geometry {
        out.push_str(&format!(" lat=\"{lat}\" lon=\"{lon}\""));
    }

    let has_children = !action.tags.is_empty()
        || matches!(
            &action.geometry,
            Some(Geometry::Way { .. }) | Some(Geometry::Relation { .. })
        );
    if !has_children {
        out.push_str("/>\n");
        return;
    }
    out.push_str(">\n");

    match &action.geometry {
        Some(Geometry::Way { nodes }) => {
            for node in nodes {
                out.push_str(&format!("    <nd ref=\"{node}\"/>\n"));
            }
        }
        Some(Geometry::Relation { members }) => {
            for m in members {
                out.push_str(&format!(
                    "    <member type=\"{}\" ref=\"{}\" role=\"{}\"/>\n",
                    m.member_type,
                    m.member_ref,
                    escape(&m.role)
                ));
            }
        }
        _ => {}
    }
    for (k, v) in &action.tags {
        out.push_str(&format!(
            "    <tag k=\"{}\" v=\"{}\"/>\n",
            escape(k),
            escape(v)
        ));
    }

    out.push_str(&format!("  </{name}>\n"));
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
