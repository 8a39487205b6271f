use anyhow::Result;

use crate::cli::ConfigArgs;
use crate::config::generate_config;

pub fn cmd_config(args: ConfigArgs) -> Result<()> {
    let path = generate_config(args.force)?;
    println!("{}", path.display());
    Ok(())
}
