//! Round-trip probe of a remote object.

use super::Target;
use crate::config::Config;
use anyhow::{bail, Result};
use colored::Colorize;
use remora_core::Value;
use std::time::Instant;

pub fn run(config: &Config, target: &str, count: u32, ns: Option<&str>, secure: bool) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let handle = Target::open(config, target, ns, secure)?;
        let mut failures = 0;
        for seq in 0..count.max(1) {
            let started = Instant::now();
            match handle.call("ro_echo", vec![Value::from(seq)]).await {
                Ok(_) => println!(
                    "{} {} seq={} time={:.2}ms",
                    "reply".green().bold(),
                    target,
                    seq,
                    started.elapsed().as_secs_f64() * 1000.0
                ),
                Err(e) => {
                    failures += 1;
                    println!("{} {} seq={}: {}", "failed".red().bold(), target, seq, e);
                }
            }
        }
        if failures > 0 {
            bail!("{} of {} probe(s) failed", failures, count.max(1));
        }
        Ok(())
    })
}
