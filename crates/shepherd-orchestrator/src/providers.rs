use shepherd_core::{ShepherdConfig, ShepherdError, ShepherdResult};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Locate `program` the way a shell would: as given when it contains a
/// path separator, otherwise on `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Fail unless every named provider's CLI can be found.
pub fn check_providers<'a>(
    config: &ShepherdConfig,
    providers: impl IntoIterator<Item = &'a str>,
) -> ShepherdResult<()> {
    let mut missing = Vec::new();
    for name in providers {
        let provider = config.provider(name);
        match find_program(&provider.command) {
            Some(path) => debug!(provider = name, path = %path.display(), "Provider found"),
            None => missing.push(format!("{name} ({})", provider.command)),
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ShepherdError::Config(format!(
            "provider CLI not found on PATH: {}",
            missing.join(", ")
        )))
    }
}
