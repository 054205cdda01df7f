use std::path::{Component, Path, Prefix};

/// Drive letters stand in for device ids on Windows.
pub fn drive_device_id(path: &Path) -> Option<u64> {
    for component in path.components() {
        if let Component::Prefix(prefix_comp) = component {
            match prefix_comp.kind() {
                Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) => {
                    return Some(letter.to_ascii_uppercase() as u64);
                }
                _ => (),
            }
        }
    }
    None
}
