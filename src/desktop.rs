use log::debug;
use thiserror::Error;

use crate::command::{CommandError, CommandRunner};
use crate::config::DesktopConfig;

const SCHEMA: &str = "org.gnome.desktop.notifications";
const KEY: &str = "show-banners";

#[derive(Debug, Error)]
#[error("failed to set GNOME Shell DND status: {0}")]
pub struct DesktopError(#[from] CommandError);

pub trait DndToggle {
    /// Turns do-not-disturb on while a meeting is found, off otherwise.
    async fn set_dnd(&self, meeting_found: bool) -> Result<(), DesktopError>;
}

/// Flips GNOME's notification banners through `gsettings`.
pub struct GnomeDnd<R> {
    runner: R,
    binary: String,
    enabled: bool,
}

impl<R: CommandRunner> GnomeDnd<R> {
    pub fn new(runner: R, config: &DesktopConfig) -> Self {
        GnomeDnd {
            runner,
            binary: config.binary.clone(),
            enabled: config.enabled,
        }
    }
}

impl<R: CommandRunner> DndToggle for GnomeDnd<R> {
    async fn set_dnd(&self, meeting_found: bool) -> Result<(), DesktopError> {
        if !self.enabled {
            debug!("Desktop DND disabled, ignoring meeting state {}", meeting_found);
            return Ok(());
        }

        // Banners are hidden exactly while a meeting is going on.
        let show_banners = if meeting_found { "false" } else { "true" };
        debug!(
            "Setting GNOME Shell DND status: {} set {} {} {}",
            self.binary, SCHEMA, KEY, show_banners
        );
        self.runner
            .run(&self.binary, &["set", SCHEMA, KEY, show_banners])
            .await?;
        Ok(())
    }
}
