use crate::script::Outcome;
use anyhow::{Context, Result};
use collection_sync_core::CollectionItemWithChildren;
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Indented outline of the tree with collapse markers and item counts.
pub fn outline(outcome: &Outcome, out: &mut impl Write) -> std::fmt::Result {
    if outcome.tree.is_empty() {
        writeln!(out, "{}", "(no collections)".dimmed())?;
    }
    for item in outcome.tree.iter() {
        write_item(outcome, item, 0, out)?;
    }

    writeln!(
        out,
        "{}",
        format!("{} notifications, {} orphaned", outcome.notifications, outcome.orphans).dimmed()
    )?;
    for fault in &outcome.resyncs {
        writeln!(out, "{} {}", "resynced:".yellow(), fault)?;
    }
    Ok(())
}

fn write_item(
    outcome: &Outcome,
    item: &CollectionItemWithChildren,
    depth: usize,
    out: &mut impl Write,
) -> std::fmt::Result {
    let collection = &item.collection;
    let marker = match (item.children.is_empty(), outcome.is_collapsed(&collection.identifier)) {
        (true, _) => "-",
        (false, true) => "+",
        (false, false) => "v",
    };
    write!(out, "{}{} {}", "  ".repeat(depth), marker, collection.name.bold())?;
    if let Some(count) = collection.item_count {
        write!(out, " ({})", count.to_string().cyan())?;
    }
    writeln!(out, " {}", collection.identifier.key().unwrap_or_default().dimmed())?;

    for child in &item.children {
        write_item(outcome, child, depth + 1, out)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct JsonOutcome<'a> {
    tree: &'a [CollectionItemWithChildren],
    collapsed: BTreeMap<String, bool>,
    notifications: usize,
    orphans: usize,
    resyncs: &'a [String],
}

pub fn json(outcome: &Outcome) -> Result<String> {
    let view = JsonOutcome {
        tree: &outcome.tree,
        collapsed: outcome
            .collapsed
            .iter()
            .map(|(id, collapsed)| (id.to_string(), *collapsed))
            .collect(),
        notifications: outcome.notifications,
        orphans: outcome.orphans,
        resyncs: &outcome.resyncs,
    };
    serde_json::to_string_pretty(&view).context("failed to serialize tree")
}
