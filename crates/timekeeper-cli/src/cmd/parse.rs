use crate::output::{emit_json, Table};
use std::path::Path;
use std::sync::Arc;
use timekeeper_core::control::recognize_control;
use timekeeper_core::duration::format_clock;
use timekeeper_core::parser::CommandParser;
use timekeeper_core::phrase::NoTopology;

pub fn run(config_path: &Path, text: &str, room: Option<&str>, json: bool) -> anyhow::Result<()> {
    if let Some(command) = recognize_control(text) {
        if json {
            return emit_json(&serde_json::json!({ "control": format!("{command:?}") }));
        }
        println!("control phrase: {command:?}");
        return Ok(());
    }

    let config = super::load_config(config_path)?;
    let parser = CommandParser::new(Arc::new(NoTopology)).with_domains(config.domains);
    let Some(sequence) = parser.parse(text, None, room) else {
        anyhow::bail!("no timer phrase found in '{text}'");
    };

    if json {
        return emit_json(&sequence);
    }

    let label = sequence
        .label
        .as_deref()
        .map(|l| format!(" ({l})"))
        .unwrap_or_default();
    println!("{:?}{label}: {} steps", sequence.shape, sequence.len());
    let mut table = Table::new(&["STEP", "DELAY", "ACTION"]);
    for (i, step) in sequence.actions.iter().enumerate() {
        table.row([
            (i + 1).to_string(),
            format!("+{}", format_clock(step.delay)),
            step.action.describe(),
        ]);
    }
    table.print();
    Ok(())
}
