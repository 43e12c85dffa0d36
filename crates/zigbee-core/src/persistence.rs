//! Device persistence using JSON file storage

use crate::device::ZigbeeDevice;
use crate::store::DeviceStore;
use std::path::Path;
use tokio::fs;

/// Load devices from a JSON file into a fresh store
pub async fn load_store(path: &Path) -> DeviceStore {
    let store = DeviceStore::new();
    for device in load_devices(path).await {
        store.insert(device);
    }
    store
}

/// Load devices from a JSON file
pub async fn load_devices(path: &Path) -> Vec<ZigbeeDevice> {
    match fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str::<Vec<ZigbeeDevice>>(&contents) {
            Ok(devices) => {
                tracing::info!("Loaded {} devices from {:?}", devices.len(), path);
                devices
            }
            Err(e) => {
                tracing::warn!("Failed to parse devices file {:?}: {}", path, e);
                Vec::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No devices file found at {:?}, starting fresh", path);
            Vec::new()
        }
        Err(e) => {
            tracing::warn!("Failed to read devices file {:?}: {}", path, e);
            Vec::new()
        }
    }
}

/// Save devices to a JSON file atomically
#[allow(clippy::missing_errors_doc)]
pub async fn save_devices(path: &Path, devices: &[ZigbeeDevice]) -> Result<(), std::io::Error> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    // Serialize to pretty JSON
    let json = serde_json::to_string_pretty(devices)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    // Write atomically: write to temp file, then rename
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &json).await?;
    fs::rename(&tmp_path, path).await?;

    tracing::debug!("Saved {} devices to {:?}", devices.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let path = std::env::temp_dir().join("zigate-devices-missing.json");
        let _ = fs::remove_file(&path).await;
        assert!(load_devices(&path).await.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let path = std::env::temp_dir().join("zigate-devices-roundtrip.json");

        let mut device = ZigbeeDevice::new(0x1234);
        device.model = Some("TS0121".to_string());
        save_devices(&path, &[device]).await.expect("save");

        let loaded = load_devices(&path).await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].nwk_address, 0x1234);
        assert_eq!(loaded[0].model.as_deref(), Some("TS0121"));

        let store = load_store(&path).await;
        assert!(store.get(0x1234).is_some());

        let _ = fs::remove_file(&path).await;
    }
}
