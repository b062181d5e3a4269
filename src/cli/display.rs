//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use std::collections::BTreeMap;

use crate::cluster::{Node, NodeRole};
use crate::provision::Unit;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    // Calculate column widths
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();

    for (i, header) in headers.iter().enumerate() {
        if i > 0 {
            output.push_str("   ");
        }
        output.push_str(&format!(
            "{:width$}",
            header.to_uppercase(),
            width = widths[i]
        ));
    }
    push_line_end(&mut output);

    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                output.push_str("   ");
            }
            if i < widths.len() {
                output.push_str(&format!("{:width$}", cell, width = widths[i]));
            } else {
                output.push_str(cell);
            }
        }
        push_line_end(&mut output);
    }

    output
}

// Padding of the last column is not worth keeping
fn push_line_end(output: &mut String) {
    let trimmed = output.trim_end_matches(' ').len();
    output.truncate(trimmed);
    output.push('\n');
}

fn role_str(role: NodeRole) -> &'static str {
    match role {
        NodeRole::Manager => "manager",
        NodeRole::Worker => "worker",
    }
}

fn format_metadata(node: &Node) -> String {
    let sorted: BTreeMap<String, String> = node.metadata().into_iter().collect();
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// Node display
// ============================================================================

/// Format node list for display
pub fn format_node_list(nodes: &[Node]) -> String {
    let headers = &["ID", "ADDRESS", "ROLE", "STATUS", "AVAILABILITY", "METADATA"];
    let rows: Vec<Vec<String>> = nodes
        .iter()
        .map(|node| {
            vec![
                node.id.clone(),
                node.address().to_string(),
                role_str(node.spec.role).to_string(),
                node.status.state.clone(),
                node.spec.availability.to_string(),
                format_metadata(node),
            ]
        })
        .collect();

    format_table(headers, rows)
}

/// Format a single node for detailed display
pub fn format_node_detail(node: &Node) -> String {
    let mut output = String::new();

    output.push_str(&format!("ID:           {}\n", node.id));
    output.push_str(&format!("Address:      {}\n", node.address()));
    if let Some(name) = &node.spec.name {
        output.push_str(&format!("Name:         {}\n", name));
    }
    if let Some(ts) = &node.created_at {
        output.push_str(&format!("Created:      {}\n", ts));
    }
    output.push_str(&format!("Role:         {}\n", role_str(node.spec.role)));
    output.push_str(&format!("Availability: {}\n", node.spec.availability));
    output.push_str(&format!("Status:       {}\n", node.status.state));
    if let Some(manager) = &node.manager_status {
        output.push_str(&format!(
            "Manager:      {}{}\n",
            manager.addr,
            if manager.leader { " (leader)" } else { "" }
        ));
    }

    let metadata: BTreeMap<String, String> = node.metadata().into_iter().collect();
    if !metadata.is_empty() {
        output.push_str("Metadata:\n");
        for (k, v) in &metadata {
            output.push_str(&format!("  {}={}\n", k, v));
        }
    }

    output
}

// ============================================================================
// Unit display
// ============================================================================

/// Format unit list for display
pub fn format_unit_list(units: &[Unit]) -> String {
    let headers = &["UNIT", "PROCESS", "STATUS", "ADDRESS"];
    let rows: Vec<Vec<String>> = units
        .iter()
        .map(|unit| {
            vec![
                short_id(&unit.id),
                unit.process_name.clone(),
                unit.status.to_string(),
                unit.address
                    .as_ref()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();

    format_table(headers, rows)
}

/// Container ids are shown the way `docker ps` shows them
fn short_id(id: &str) -> String {
    if id.is_empty() {
        return "<pending>".to_string();
    }
    id.chars().take(12).collect()
}
