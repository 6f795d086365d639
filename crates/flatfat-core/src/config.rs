use flatfat_error::{FatError, Result};
use flatfat_ondisk::VolumeLayout;
use flatfat_types::{BlockSize, DEFAULT_BLOCK_SIZE, DEFAULT_DISK_CAPACITY};
use serde::{Deserialize, Serialize};

/// Volume geometry chosen at format time.
///
/// A mounted image carries no self-describing header, so the same config
/// must be supplied to mount it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Bytes in the data region; a whole number of blocks.
    pub disk_capacity: u64,
    pub block_size: u32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            disk_capacity: DEFAULT_DISK_CAPACITY,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl VolumeConfig {
    #[must_use]
    pub fn new(disk_capacity: u64, block_size: u32) -> Self {
        Self {
            disk_capacity,
            block_size,
        }
    }

    /// Validate and derive the on-disk layout.
    pub fn layout(&self) -> Result<VolumeLayout> {
        let block_size = BlockSize::new(self.block_size)
            .map_err(|err| FatError::InvalidGeometry(err.to_string()))?;
        VolumeLayout::new(self.disk_capacity, block_size)
            .map_err(|err| FatError::InvalidGeometry(err.to_string()))
    }

    /// Recover the config of an image of `image_len` bytes that was
    /// formatted with `block_size`.
    ///
    /// The image is `table_size * (5 + block_size) + block_size` bytes, so
    /// the block size alone fixes the capacity.
    pub fn for_image_len(image_len: u64, block_size: u32) -> Result<Self> {
        let bs = u64::from(block_size);
        let per_block = bs + 5;
        let table_size = image_len
            .checked_sub(bs)
            .filter(|rest| *rest > 0 && rest % per_block == 0)
            .map(|rest| rest / per_block)
            .ok_or_else(|| {
                FatError::InvalidGeometry(format!(
                    "image of {image_len} bytes does not match block size {block_size}"
                ))
            })?;
        let config = Self::new(table_size * bs, block_size);
        config.layout()?;
        Ok(config)
    }

    /// Parse a JSON config; absent fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| FatError::InvalidGeometry(format!("config: {err}")))?;
        config.layout()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| FatError::InvalidGeometry(format!("config: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_reference_geometry() {
        let layout = VolumeConfig::default().layout().unwrap();
        assert_eq!(layout.table_size(), 262_144);
        assert_eq!(layout.block_size().get(), 4096);
    }

    #[test]
    fn json_round_trip_and_defaults() {
        let config = VolumeConfig::new(64 * 1024, 1024);
        let json = config.to_json_string().unwrap();
        assert_eq!(VolumeConfig::from_json_str(&json).unwrap(), config);

        let partial = VolumeConfig::from_json_str(r#"{"block_size": 512}"#).unwrap();
        assert_eq!(partial.block_size, 512);
        assert_eq!(partial.disk_capacity, DEFAULT_DISK_CAPACITY);
    }

    #[test]
    fn config_is_recovered_from_image_len() {
        let config = VolumeConfig::new(64 * 4096, 4096);
        let len = config.layout().unwrap().image_len();
        assert_eq!(VolumeConfig::for_image_len(len, 4096).unwrap(), config);
        assert!(VolumeConfig::for_image_len(len + 1, 4096).is_err());
        assert!(VolumeConfig::for_image_len(len, 512).is_err());
        assert!(VolumeConfig::for_image_len(100, 4096).is_err());
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        assert!(matches!(
            VolumeConfig::new(4096, 3000).layout(),
            Err(FatError::InvalidGeometry(_))
        ));
        assert!(VolumeConfig::new(4097, 4096).layout().is_err());
        assert!(VolumeConfig::from_json_str(r#"{"block_size": 100}"#).is_err());
        assert!(VolumeConfig::from_json_str("not json").is_err());
    }
}
