//! `loomflow validate`: report structural issues in a workflow file.

use std::path::Path;

use anyhow::{Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::json;

use loomflow_core::definition::{
    DefinitionError, IssueSeverity, ValidationIssue, load_workflow_file_async, validate_definition,
};

use super::LibraryArgs;

pub async fn handle_validate(file: &Path, library: &LibraryArgs, json: bool, quiet: bool) -> Result<()> {
    let library = library.load()?;
    let (name, issues) = match load_workflow_file_async(file).await {
        Ok(def) => {
            let issues = validate_definition(&def, Some(&library));
            (def.name, issues)
        }
        // Structural errors are what this command reports, not a failure to run it.
        Err(DefinitionError::Invalid { name, issues }) => (name, issues),
        Err(err) => return Err(err.into()),
    };
    let errors = issues
        .iter()
        .filter(|i| i.severity == IssueSeverity::Error)
        .count();

    if json {
        let report = json!({
            "workflow": name,
            "file": file.display().to_string(),
            "valid": errors == 0,
            "issues": issues,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !quiet {
        print_issues(&name, &issues, errors);
    }

    if errors > 0 {
        bail!("Workflow '{name}' has {errors} error(s)");
    }
    Ok(())
}

fn print_issues(name: &str, issues: &[ValidationIssue], errors: usize) {
    if issues.is_empty() {
        println!("  {} Workflow '{}' is valid", style("*").green().bold(), style(name).cyan());
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Severity", "Code", "Step", "Message"]);
    for issue in issues {
        let severity = match issue.severity {
            IssueSeverity::Error => Cell::new("error").fg(Color::Red),
            IssueSeverity::Warning => Cell::new("warning").fg(Color::Yellow),
        };
        let mut message = issue.message.clone();
        if let Some(suggestion) = &issue.suggestion {
            message.push_str(&format!(" (did you mean '{suggestion}'?)"));
        }
        table.add_row(vec![
            severity,
            Cell::new(issue.code),
            Cell::new(issue.step_id.as_deref().unwrap_or("-")),
            Cell::new(message),
        ]);
    }
    println!("{table}");

    let verdict = if errors == 0 {
        style("valid with warnings").yellow()
    } else {
        style("invalid").red()
    };
    println!("  Workflow '{}' is {}", style(name).cyan(), verdict);
}
