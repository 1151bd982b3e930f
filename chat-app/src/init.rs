//! Configuration scaffolding for `chat-agent init`.
//!
//! Writes the config template without overwriting an existing local file.

use anyhow::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

const CONFIG_TEMPLATE: &str = include_str!("../../config-templates/config.toml");

pub async fn initialize(config_path: Option<PathBuf>) -> Result<InitReport> {
    let config_path = config_path.unwrap_or_else(crate::config::default_config_path);
    initialize_at(&config_path).await
}

pub async fn initialize_at(config_path: &Path) -> Result<InitReport> {
    let root = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    tokio::fs::create_dir_all(&root)
        .await
        .map_err(|e| anyhow::anyhow!("create config root {}: {e}", root.display()))?;

    let mut report = InitReport {
        root,
        created: Vec::new(),
        skipped: Vec::new(),
    };

    match tokio::fs::metadata(config_path).await {
        Ok(_) => {
            report.skipped.push(config_path.to_path_buf());
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::write(config_path, CONFIG_TEMPLATE)
                .await
                .map_err(|e| {
                    anyhow::anyhow!("write config template {}: {e}", config_path.display())
                })?;
            report.created.push(config_path.to_path_buf());
        }
        Err(err) => {
            return Err(anyhow::anyhow!(
                "inspect config path {}: {err}",
                config_path.display()
            ));
        }
    }

    Ok(report)
}
