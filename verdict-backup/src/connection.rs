//! Destination connection detection.
//!
//! A target is connected when its destination carries the control directory,
//! an `id` file holding the target's identity token, and the manifest file
//! for the target's source. The detector reports transitions so callers can
//! notify exactly once per connect/disconnect.

use crate::registry::target::{ManifestSlot, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    /// True only when `connected` differs from the previous check.
    pub changed: bool,
}

/// Whether the destination currently matches the target, without touching the target.
pub fn probe(target: &Target, dir_name: &str) -> bool {
    let area = target.control_area(dir_name);
    if !area.dir().is_dir() {
        return false;
    }
    match area.read_token() {
        Ok(token) if token == target.identity_token => area.manifest_file().is_file(),
        _ => false,
    }
}

/// Re-evaluate the target's connection and update its derived state.
pub fn check(target: &mut Target, dir_name: &str) -> ConnectionState {
    let connected = probe(target, dir_name);
    let changed = connected != target.connected;

    if changed {
        if connected {
            tracing::info!("Target {} connected ({})", target.name, target.dest_path.display());
        } else {
            tracing::info!("Target {} disconnected ({})", target.name, target.dest_path.display());
        }
        target.connected = connected;
        // a running operation still owns its manifest and hands it back on completion
        if !target.is_busy() {
            target.manifest = ManifestSlot::Unloaded;
        }
    }

    ConnectionState { connected, changed }
}
