extern crate core;

mod lffs_lib;

use lazy_static::lazy_static;
use std::sync::Mutex;
pub use lffs_lib::*;

lazy_static! {
    // Device locator: names of currently mounted devices. The core itself
    // carries no statics; mount/unmount register here so a caller layer can
    // refuse double mounts by name.
    pub static ref MOUNTED_DEVICES: Mutex<Vec<String>> = Mutex::new(Vec::new());
}

/// Register a device name at mount time. Err means the name is already taken.
pub fn register_device(name: &str) -> Result<(), ()> {
    let mut devices = MOUNTED_DEVICES.lock().unwrap();
    if devices.iter().any(|d| d == name) {
        return Err(());
    }
    devices.push(name.to_string());
    Ok(())
}

/// Remove a device name at unmount time; Err when it was never registered.
pub fn deregister_device(name: &str) -> Result<(), ()> {
    let mut devices = MOUNTED_DEVICES.lock().unwrap();
    match devices.iter().position(|d| d == name) {
        Some(i) => {
            devices.remove(i);
            Ok(())
        }
        None => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_round_trip() {
        assert!(register_device("test-registry-dev").is_ok());
        assert!(register_device("test-registry-dev").is_err());
        assert!(deregister_device("test-registry-dev").is_ok());
        assert!(deregister_device("test-registry-dev").is_err());
    }
}
