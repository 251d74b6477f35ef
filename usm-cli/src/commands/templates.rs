use clap::Args;

use super::new_table;

#[derive(Args, Debug)]
pub struct TemplatesArgs {
    /// Print templates as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: TemplatesArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let config = global.load_config()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&config.templates)?);
        return Ok(());
    }

    let mut table = new_table(&[
        "ID",
        "NAME",
        "CATEGORY",
        "COMMAND",
        "PORT",
        "PORT RANGE",
        "MULTI",
    ]);
    for template in &config.templates {
        let range = match template.port_range {
            Some((min, max)) => format!("{}-{}", min, max),
            None => "-".to_string(),
        };
        let command = std::iter::once(template.command.as_str())
            .chain(template.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        table.add_row(vec![
            template.id.clone(),
            template.display_name.clone(),
            template.category.to_string(),
            command,
            template.default_port.to_string(),
            range,
            if template.supports_multiple { "yes" } else { "no" }.to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}
