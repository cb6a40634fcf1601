//! Point-in-time check of whether the monitored application is running.

use sysinfo::{ProcessesToUpdate, System};

/// Snapshot probe for the monitored application's running state.
///
/// The engine only ever compares consecutive poll results; the probe itself
/// holds no edge state.
pub trait ProcessProbe {
    fn poll(&mut self) -> bool;
}

/// sysinfo-backed probe matching the configured application name against
/// process names and executable paths, case-insensitively.
pub struct ProcessWatcher {
    needle: String,
    system: System,
}

impl ProcessWatcher {
    pub fn new(app_name: &str) -> Self {
        Self {
            needle: app_name.to_lowercase(),
            system: System::new(),
        }
    }
}

impl ProcessProbe for ProcessWatcher {
    fn poll(&mut self) -> bool {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        // Processes that vanish mid-enumeration or expose no name/path are
        // simply absent from the snapshot; a poll can never fail.
        self.system.processes().values().any(|process| {
            if process
                .name()
                .to_string_lossy()
                .to_lowercase()
                .contains(&self.needle)
            {
                return true;
            }
            process
                .exe()
                .map(|exe| exe.to_string_lossy().to_lowercase().contains(&self.needle))
                .unwrap_or(false)
        })
    }
}
