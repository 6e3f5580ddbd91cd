use crate::output::{emit_json, Table};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use timekeeper_core::config::Config;
use timekeeper_runtime::{format_status, TimerService};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

const HELP: &str = "\
Type a timer phrase, for example:
  set a pizza timer for 15 minutes
  turn on the porch light for 10 minutes
  wait 5 minutes, notify me, then 3 minutes later turn off the light
  cancel the pizza timer | how much time is left | stop
Console commands: list, pool, help, exit";

pub fn run(
    config_path: &Path,
    room: Option<String>,
    speaker: Option<String>,
    events: bool,
    json: bool,
) -> anyhow::Result<()> {
    let config = super::load_validated(config_path)?;
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(console(config, room, speaker, events, json));
    // A pending stdin read would otherwise hold up shutdown.
    rt.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn console(
    config: Config,
    room: Option<String>,
    speaker: Option<String>,
    events: bool,
    json: bool,
) -> anyhow::Result<()> {
    let service = Arc::new(TimerService::builder(config).build());
    let report = service.start().await;
    if !report.missing.is_empty() {
        tracing::warn!(missing = ?report.missing, "running with reduced capacity");
    }

    if events {
        let mut rx = service.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => match serde_json::to_string(&ev) {
                        Ok(data) => println!("[{}] {data}", ev.name()),
                        Err(e) => tracing::warn!(error = %e, "unprintable event"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event printer fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    if !json {
        println!(
            "timekeeper console: {} countdown slots. Type 'help' for examples.",
            service.pool_snapshot().capacity()
        );
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "exit" | "quit" => break,
            "help" => println!("{HELP}"),
            "list" => list(&service, json)?,
            "pool" => pool(&service, json)?,
            text => {
                let response = service
                    .process_command(text, speaker.as_deref(), room.as_deref())
                    .await;
                if json {
                    emit_json(&response)?;
                } else {
                    println!("{}", response.response_text);
                }
            }
        }
    }

    let left = service.list_active();
    if !left.is_empty() && !json {
        println!(
            "Exiting with {} timer(s) and {} sequence(s) still pending.",
            left.timers.len(),
            left.sequences.len()
        );
    }
    Ok(())
}

fn list(service: &TimerService, json: bool) -> anyhow::Result<()> {
    let overview = service.list_active();
    if json {
        return emit_json(&overview);
    }
    if overview.is_empty() {
        println!("Nothing running.");
        return Ok(());
    }
    let mut table = Table::new(&["ID", "HANDLE", "KIND", "STATUS"]);
    for t in &overview.timers {
        table.row([
            t.id.clone(),
            t.handle.clone(),
            t.kind.as_str().to_string(),
            format_status(t),
        ]);
    }
    if !table.is_empty() {
        table.print();
    }
    for seq in &overview.sequences {
        println!("sequence {}: step {}/{}", seq.id, seq.step + 1, seq.steps);
    }
    for esc in &overview.escalations {
        println!(
            "alarm {} ringing: {}",
            esc.state.timer_id,
            esc.state.stage.as_str()
        );
    }
    Ok(())
}

fn pool(service: &TimerService, json: bool) -> anyhow::Result<()> {
    let pool = service.pool_snapshot();
    if json {
        return emit_json(&pool);
    }
    let mut table = Table::new(&["HANDLE", "OWNER"]);
    for handle in pool.available() {
        table.row([handle, "free"]);
    }
    for (handle, id) in pool.in_use() {
        table.row([handle.as_str(), id.as_str()]);
    }
    table.print();
    Ok(())
}
