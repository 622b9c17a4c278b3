//! Device control through an external device-configuration utility
//!
//! The default setup drives `devcon` with a wildcard hardware-ID match such
//! as `*VID_046D&PID_C52B*`, which toggles every attached unit of that model.
//! Argument templates make other utilities usable as well.

use crate::config::ControlSettings;
use crate::usb::process::run_captured;
use async_trait::async_trait;
use common::{ControlFailure, DeviceControl};
use protocol::{ControlAction, DeviceKey};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// [`DeviceControl`] implementation that shells out to a utility
#[derive(Debug, Clone)]
pub struct CommandControl {
    program: PathBuf,
    enable_args: Vec<String>,
    disable_args: Vec<String>,
    timeout: Duration,
}

impl CommandControl {
    pub fn new(
        program: impl Into<PathBuf>,
        enable_args: Vec<String>,
        disable_args: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            enable_args,
            disable_args,
            timeout,
        }
    }

    /// Build from configuration, resolving the program location
    pub fn from_settings(settings: &ControlSettings) -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        let program = locate_program(&settings.program, exe_dir.as_deref(), &settings.search_paths);
        info!("Device control utility: {}", program.display());

        Self::new(
            program,
            settings.enable_args.clone(),
            settings.disable_args.clone(),
            settings.timeout,
        )
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments for `action` on `key`, placeholders substituted
    pub fn render_args(&self, action: ControlAction, key: &DeviceKey) -> Vec<String> {
        let template = match action {
            ControlAction::Enable => &self.enable_args,
            ControlAction::Disable => &self.disable_args,
        };

        template
            .iter()
            .map(|arg| {
                arg.replace("{pattern}", &key.match_pattern())
                    .replace("{vid}", key.vid())
                    .replace("{pid}", key.pid())
            })
            .collect()
    }

    async fn invoke(&self, action: ControlAction, key: &DeviceKey) -> Result<(), ControlFailure> {
        let args = self.render_args(action, key);
        debug!("{} {} via {}", action, key, self.program.display());

        let output = run_captured(&self.program, &args, self.timeout)
            .await?
            .into_result()?;
        debug!("{} {} succeeded: {}", action, key, output.stdout.trim());
        Ok(())
    }
}

#[async_trait]
impl DeviceControl for CommandControl {
    async fn enable(&self, key: &DeviceKey) -> Result<(), ControlFailure> {
        self.invoke(ControlAction::Enable, key).await
    }

    async fn disable(&self, key: &DeviceKey) -> Result<(), ControlFailure> {
        self.invoke(ControlAction::Disable, key).await
    }
}

/// Resolve the control utility
///
/// A program given as a path is used as-is (with `~` expanded). A bare name
/// is looked up next to the running executable, then in `search_paths`, and
/// finally left to `PATH` resolution.
pub fn locate_program(program: &str, exe_dir: Option<&Path>, search_paths: &[PathBuf]) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(program).as_ref());
    if expanded.components().count() > 1 || expanded.is_absolute() {
        return expanded;
    }

    let file_name = if expanded.extension().is_some() {
        program.to_string()
    } else {
        format!("{}{}", program, std::env::consts::EXE_SUFFIX)
    };

    exe_dir
        .into_iter()
        .chain(search_paths.iter().map(PathBuf::as_path))
        .map(|dir| dir.join(&file_name))
        .find(|candidate| candidate.is_file())
        .unwrap_or(expanded)
}
