//! List the services registered with the name service.

use super::name_service;
use crate::config::Config;
use anyhow::{Context, Result};
use colored::Colorize;

pub fn run(config: &Config, ns: Option<&str>, name: Option<&str>) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let names = name_service(config, ns)?;
        let mut records = match name {
            Some(name) => names.info(name).await,
            None => names.all_info().await,
        }
        .context("Name service query failed")?;
        records.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));

        if records.is_empty() {
            println!("{}", "No services registered.".dimmed());
            return Ok(());
        }

        println!(
            "{:<24} {:<28} {:>6} {:>7} {:>8}",
            "NAME".bold(),
            "HOST".bold(),
            "PORT".bold(),
            "SECURE".bold(),
            "AGE".bold()
        );
        for record in &records {
            let age = record.age();
            let age_text = format!("{:.1}s", age);
            let age_text = if age > 30.0 {
                age_text.yellow()
            } else {
                age_text.normal()
            };
            println!(
                "{:<24} {:<28} {:>6} {:>7} {:>8}",
                record.name.cyan(),
                record.host,
                record.port,
                if record.secure { "yes" } else { "no" },
                age_text
            );
        }
        println!();
        println!("{} service instance(s)", records.len().to_string().green());
        Ok(())
    })
}
