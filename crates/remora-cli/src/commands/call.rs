//! Call a method on a remote object.

use super::{parse_arg, Target};
use crate::config::Config;
use anyhow::{Context, Result};

pub fn run(
    config: &Config,
    target: &str,
    method: &str,
    args: &[String],
    ns: Option<&str>,
    secure: bool,
) -> Result<()> {
    let args = args.iter().map(|a| parse_arg(a)).collect();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let target_handle = Target::open(config, target, ns, secure)?;
        let result = target_handle
            .call(method, args)
            .await
            .with_context(|| format!("{}.{} failed", target, method))?;
        let text = serde_json::to_string_pretty(&result.to_json())?;
        println!("{}", text);
        Ok(())
    })
}
