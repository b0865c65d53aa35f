//! `loomflow trace`: print a workflow's include graph.

use std::path::Path;

use anyhow::Result;
use console::style;

use loomflow_core::library::CallTrace;

use super::{LibraryArgs, load_definition};

pub async fn handle_trace(file: &Path, library: &LibraryArgs, max_depth: usize, json: bool) -> Result<()> {
    let mut library = library.load()?;
    let definition = load_definition(file).await?;
    let entry = definition.name.clone();
    library.insert(definition);

    let trace = library.get_call_trace(&entry, max_depth)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&trace)?);
    } else {
        print_trace(&trace);
    }
    Ok(())
}

fn print_trace(trace: &CallTrace) {
    for call in &trace.calls {
        let indent = "  ".repeat(call.depth + 1);
        match &call.via_step {
            Some(step) => println!("{indent}{} {}", style(&call.workflow).cyan(), style(format!("(via {step})")).dim()),
            None => println!("{indent}{}", style(&call.workflow).cyan().bold()),
        }
    }

    for missing in &trace.missing {
        let hint = missing
            .suggestion
            .as_ref()
            .map(|s| format!(" (did you mean '{s}'?)"))
            .unwrap_or_default();
        println!(
            "  {} '{}' includes unknown workflow '{}' at step '{}'{hint}",
            style("!").red().bold(),
            missing.caller,
            missing.workflow,
            missing.via_step
        );
    }
    for cycle in &trace.cycles {
        println!("  {} include cycle: {}", style("!").yellow().bold(), cycle.join(" -> "));
    }
    if trace.truncated {
        println!(
            "  {} includes deeper than {} were not followed",
            style("!").yellow().bold(),
            trace.max_depth
        );
    }
    println!(
        "  {} workflow(s), max depth {}",
        trace.calls.len(),
        trace.max_depth_reached
    );
}
