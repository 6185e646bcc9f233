//! Configuration commands

use anyhow::{Result, bail};
use docsync::config::Config;

/// Show the effective configuration and where it came from
pub async fn cmd_config_show() -> Result<()> {
  let cwd = std::env::current_dir()?;
  let config = Config::load(&cwd);

  let local_config = Config::local_config_path(&cwd);
  let user_config = Config::user_config_path();

  println!("Effective configuration for: {}", cwd.display());
  println!();

  if local_config.exists() {
    println!("Using directory config: {}", local_config.display());
  } else if user_config.exists() {
    println!("Using user config: {}", user_config.display());
  } else {
    println!("Using default configuration (no config file found)");
  }
  println!();

  let toml_str = toml::to_string_pretty(&config)?;
  println!("{}", toml_str);

  Ok(())
}

/// Write a commented default config, in the working directory or for the user
pub async fn cmd_config_init(user: bool) -> Result<()> {
  let config_path = if user {
    Config::user_config_path()
  } else {
    Config::local_config_path(&std::env::current_dir()?)
  };

  if config_path.exists() {
    bail!(
      "Config file already exists: {}\nDelete it first if you want to regenerate",
      config_path.display()
    );
  }

  if let Some(parent) = config_path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  std::fs::write(&config_path, Config::generate_template())?;

  println!("Created config: {}", config_path.display());
  println!("Edit the file to customize settings.");
  Ok(())
}
