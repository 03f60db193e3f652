use super::Command;
use async_trait::async_trait;
use eyre::Result;
use flinkbook_core::config::Settings;
use std::io::Write;
use std::path::PathBuf;

pub struct ConfigCommand {
    pub path: Option<PathBuf>,
    pub action: ConfigAction,
}

pub enum ConfigAction {
    Show,
    Path,
    Init,
}

#[async_trait]
impl Command for ConfigCommand {
    async fn execute(&self) -> Result<()> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => Settings::config_path()?,
        };
        let mut stdout = std::io::stdout();

        match self.action {
            ConfigAction::Show => {
                let settings = Settings::load_from(&path)?;
                writeln!(stdout, "Settings file: {}", path.display())?;
                writeln!(stdout, "\n{}", settings.to_toml()?)?;
            }
            ConfigAction::Path => writeln!(stdout, "{}", path.display())?,
            ConfigAction::Init => {
                if path.exists() {
                    writeln!(stdout, "Settings file already exists: {}", path.display())?;
                } else {
                    Settings::default().save_to(&path)?;
                    writeln!(stdout, "Wrote default settings to {}", path.display())?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_writes_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let init = ConfigCommand {
            path: Some(path.clone()),
            action: ConfigAction::Init,
        };
        init.execute().await.unwrap();
        assert_eq!(Settings::load_from(&path).unwrap(), Settings::default());

        std::fs::write(&path, "[runtime]\nparallelism = 8\n").unwrap();
        init.execute().await.unwrap();
        assert_eq!(Settings::load_from(&path).unwrap().runtime.parallelism, 8);
    }
}
