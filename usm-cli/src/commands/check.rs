use clap::Args;
use serde::Serialize;
use usm::UsmConfig;

use super::new_table;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct CheckSummary<'a> {
    config: String,
    grace_timeout_ms: u64,
    sample_interval_ms: u64,
    templates: usize,
    instances: Vec<InstanceSummary<'a>>,
}

#[derive(Debug, Serialize)]
struct InstanceSummary<'a> {
    id: &'a str,
    template: &'a str,
    port: u16,
    auto_start: bool,
    tags: &'a [String],
}

fn summarize(config: &UsmConfig, label: String) -> CheckSummary<'_> {
    let instances = config
        .instances
        .iter()
        .map(|instance| {
            // Validation guarantees the template exists.
            let default_port = config
                .templates
                .iter()
                .find(|t| t.id == instance.template)
                .map(|t| t.default_port)
                .unwrap_or_default();
            InstanceSummary {
                id: &instance.id,
                template: &instance.template,
                port: instance.port.unwrap_or(default_port),
                auto_start: instance.auto_start,
                tags: &instance.tags,
            }
        })
        .collect();

    CheckSummary {
        config: label,
        grace_timeout_ms: config.manager.grace_timeout_ms,
        sample_interval_ms: config.manager.sample_interval_ms,
        templates: config.templates.len(),
        instances,
    }
}

pub fn execute(args: CheckArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let config = global.load_config()?;
    let summary = summarize(&config, global.config_label());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Configuration OK: {}", summary.config);
    println!(
        "{} template(s), {} instance(s)",
        summary.templates,
        summary.instances.len()
    );
    if summary.instances.is_empty() {
        return Ok(());
    }

    let mut table = new_table(&["INSTANCE", "TEMPLATE", "PORT", "AUTO START", "TAGS"]);
    for instance in &summary.instances {
        table.add_row(vec![
            instance.id.to_string(),
            instance.template.to_string(),
            instance.port.to_string(),
            if instance.auto_start { "yes" } else { "no" }.to_string(),
            instance.tags.join(","),
        ]);
    }
    println!("{table}");
    Ok(())
}
