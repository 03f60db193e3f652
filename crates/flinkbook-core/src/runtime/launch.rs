use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::RuntimeSettings;

use super::RuntimeError;
use super::process::LaunchSpec;

/// Resolve the java executable: explicit setting, then `$JAVA_HOME`, then `PATH`.
pub fn resolve_java(settings: &RuntimeSettings) -> Result<PathBuf, RuntimeError> {
    if let Some(java) = &settings.java {
        if java.is_file() {
            return Ok(java.clone());
        }
        return Err(RuntimeError::Configuration {
            message: format!(
                "Configured java executable {} does not exist. Fix `runtime.java` in your settings.",
                java.display()
            ),
        });
    }

    if let Some(java_home) = std::env::var_os("JAVA_HOME") {
        let candidate = Path::new(&java_home).join("bin").join(java_binary_name());
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    which::which("java").map_err(|_| RuntimeError::Configuration {
        message: "Could not find a java executable. Install a JDK (11 or newer), set JAVA_HOME, or set `runtime.java`."
            .to_string(),
    })
}

fn java_binary_name() -> &'static str {
    if cfg!(windows) { "java.exe" } else { "java" }
}

/// Check that the runner jar and the Flink configuration directory exist.
pub fn validate(settings: &RuntimeSettings) -> Result<(), RuntimeError> {
    if !settings.artifact.is_file() {
        return Err(RuntimeError::Configuration {
            message: format!(
                "Flink runner jar not found at {}. Build the runner or point `runtime.artifact` at it.",
                settings.artifact.display()
            ),
        });
    }

    if !settings.config_dir.is_dir() {
        return Err(RuntimeError::Configuration {
            message: format!(
                "Flink configuration directory not found at {}. Create it (with a flink-conf.yaml) or set `runtime.config_dir`.",
                settings.config_dir.display()
            ),
        });
    }

    Ok(())
}

/// Build the argument vector and environment for the runner.
pub fn launch_spec(settings: &RuntimeSettings, java: PathBuf) -> LaunchSpec {
    let mut args = vec![format!("-Xmx{}m", settings.memory_mb)];
    args.extend(settings.jvm_options.iter().cloned());
    args.extend([
        "-jar".to_string(),
        settings.artifact.display().to_string(),
        "--parallelism".to_string(),
        settings.parallelism.to_string(),
        "--taskslots".to_string(),
        settings.task_slots.to_string(),
        "--gateway-port".to_string(),
        settings.gateway_port.to_string(),
    ]);

    let mut env = BTreeMap::new();
    env.insert(
        "FLINK_CONF_DIR".to_string(),
        settings.config_dir.display().to_string(),
    );
    for (key, value) in &settings.env {
        env.insert(key.clone(), value.clone());
    }

    LaunchSpec {
        program: java,
        args,
        env,
        working_dir: settings.artifact.parent().map(Path::to_path_buf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings_in(dir: &TempDir) -> RuntimeSettings {
        RuntimeSettings {
            artifact: dir.path().join("runner.jar"),
            config_dir: dir.path().join("conf"),
            ..RuntimeSettings::default()
        }
    }

    #[test]
    fn test_missing_artifact_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        std::fs::create_dir_all(&settings.config_dir).unwrap();

        let err = validate(&settings).unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration { .. }));
        assert!(err.to_string().contains("runner.jar"));
    }

    #[test]
    fn test_missing_config_dir_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        std::fs::write(&settings.artifact, b"jar").unwrap();

        let err = validate(&settings).unwrap_err();
        assert!(err.to_string().contains("conf"));
    }

    #[test]
    fn test_launch_spec_layout() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings_in(&dir);
        settings.memory_mb = 1024;
        settings.parallelism = 3;
        settings.task_slots = 4;
        settings.gateway_port = 9000;
        settings.jvm_options = vec!["--add-opens=java.base/java.util=ALL-UNNAMED".to_string()];
        settings
            .env
            .insert("FLINK_ENV_JAVA_OPTS".to_string(), "-Dfoo=bar".to_string());

        let spec = launch_spec(&settings, PathBuf::from("/usr/bin/java"));

        assert_eq!(spec.program, PathBuf::from("/usr/bin/java"));
        assert_eq!(spec.args[0], "-Xmx1024m");
        assert_eq!(spec.args[1], "--add-opens=java.base/java.util=ALL-UNNAMED");
        assert_eq!(spec.args[2], "-jar");
        assert_eq!(
            &spec.args[4..],
            &["--parallelism", "3", "--taskslots", "4", "--gateway-port", "9000"]
        );
        assert_eq!(
            spec.env.get("FLINK_CONF_DIR"),
            Some(&settings.config_dir.display().to_string())
        );
        assert_eq!(
            spec.env.get("FLINK_ENV_JAVA_OPTS"),
            Some(&"-Dfoo=bar".to_string())
        );
        assert_eq!(spec.working_dir.as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_explicit_missing_java_is_rejected() {
        let settings = RuntimeSettings {
            java: Some(PathBuf::from("/no/such/java")),
            ..RuntimeSettings::default()
        };
        assert!(matches!(
            resolve_java(&settings),
            Err(RuntimeError::Configuration { .. })
        ));
    }
}
