use std::time::Duration;

use clap::Args;
use comfy_table::Table;
use usm::{ServiceInstance, ServiceManager, UsmResult};

use super::new_table;

#[derive(Args, Debug)]
pub struct UpArgs {
    /// Instances to start (default: every instance marked auto_start)
    pub instances: Vec<String>,

    /// Stop everything and exit after this many seconds
    #[arg(long, value_name = "SECS")]
    pub exit_after: Option<u64>,
}

pub async fn execute(args: UpArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let manager = global.create_manager()?;

    let results: Vec<(String, UsmResult<ServiceInstance>)> = if args.instances.is_empty() {
        manager.start_auto().await
    } else {
        let mut results = Vec::with_capacity(args.instances.len());
        for id in args.instances {
            let result = manager.start(&id).await;
            results.push((id, result));
        }
        results
    };

    if results.is_empty() {
        println!("No instances to start (none are marked auto_start)");
        return Ok(());
    }

    let mut errors = Vec::new();
    for (id, result) in &results {
        match result {
            Ok(instance) => println!("{} started on port {}", id, instance.port),
            Err(e) => {
                eprintln!("Error starting '{}': {}", id, e);
                errors.push(format!("{}: {}", id, e));
            }
        }
    }
    if errors.len() == results.len() {
        manager.shutdown().await;
        anyhow::bail!(
            "Failed to start all {} instance(s)\nErrors:\n  {}",
            errors.len(),
            errors.join("\n  ")
        );
    }

    manager.start_sampler();
    watch(&manager, args.exit_after.map(Duration::from_secs)).await;

    let failures = manager.shutdown().await;
    for (id, e) in &failures {
        eprintln!("Error stopping '{}': {}", id, e);
    }
    println!("{}", status_table(&manager.list()));

    if !failures.is_empty() {
        anyhow::bail!("Failed to stop {} instance(s)", failures.len());
    }
    Ok(())
}

/// Print the status table every sampling interval until Ctrl-C or `exit_after`.
async fn watch(manager: &ServiceManager, exit_after: Option<Duration>) {
    let mut ticker = tokio::time::interval(manager.settings().sample_interval());
    let ctrl_c = tokio::signal::ctrl_c();
    let deadline = async {
        match exit_after {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(ctrl_c, deadline);

    loop {
        tokio::select! {
            _ = ticker.tick() => println!("{}", status_table(&manager.list())),
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, stopping instances");
                break;
            }
            _ = &mut deadline => break,
        }
    }
}

fn status_table(instances: &[ServiceInstance]) -> Table {
    let mut table = new_table(&[
        "INSTANCE", "TEMPLATE", "STATUS", "PORT", "PID", "CPU %", "MEMORY", "UPTIME", "ERROR",
    ]);
    for instance in instances {
        table.add_row(vec![
            instance.instance_id.clone(),
            instance.template_id.clone(),
            instance.status.to_string(),
            instance.port.to_string(),
            instance
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            format!("{:.1}", instance.cpu_percent),
            format!("{} MB", instance.memory_mb),
            instance
                .uptime()
                .map(|d| format_uptime(d.num_seconds()))
                .unwrap_or_else(|| "-".to_string()),
            instance
                .last_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default(),
        ]);
    }
    table
}

fn format_uptime(secs: i64) -> String {
    let secs = secs.max(0);
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m{:02}s", s / 60, s % 60),
        s => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
    }
}
