//! Kernel device path to drive-letter path translation.
//!
//! The kernel names files by volume device (`\Device\HarddiskVolume3\...`),
//! users name them by drive letter (`C:\...`). The mapping between the two
//! changes whenever a volume is mounted or unmounted, so a [`DeviceMap`] is
//! built fresh for every pass and never updated in place.

use log::debug;

use crate::error::ScanError;

/// Currently mounted drives and their kernel device names.
pub trait VolumeSource {
    /// `(drive, device)` pairs such as `("C:", "\Device\HarddiskVolume3")`.
    ///
    /// Fails only when the drive list itself cannot be read; a drive whose
    /// device cannot be queried is left out.
    fn mounted_drives(&self) -> Result<Vec<(String, String)>, ScanError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Mapping {
    device: String,
    drive: String,
}

/// Device prefix to drive letter mapping for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMap {
    // Sorted longest device first so the first hit is the longest prefix
    mappings: Vec<Mapping>,
}

impl DeviceMap {
    pub fn build(source: &impl VolumeSource) -> Result<Self, ScanError> {
        let map = Self::from_pairs(source.mounted_drives()?);
        debug!("device map has {} mounted drives", map.len());
        Ok(map)
    }

    /// Build from `(drive, device)` pairs. A drive listed twice keeps its
    /// first device, pairs with an empty side are ignored.
    pub fn from_pairs<D, V>(pairs: impl IntoIterator<Item = (D, V)>) -> Self
    where
        D: Into<String>,
        V: Into<String>,
    {
        let mut mappings: Vec<Mapping> = Vec::new();
        for (drive, device) in pairs {
            let drive = drive.into().trim_end_matches('\\').to_ascii_uppercase();
            let device = device.into().trim_end_matches('\\').to_string();
            if drive.is_empty() || device.is_empty() {
                continue;
            }
            if mappings.iter().any(|m| m.drive == drive) {
                continue;
            }
            mappings.push(Mapping { device, drive });
        }
        mappings.sort_by(|a, b| b.device.len().cmp(&a.device.len()));
        Self { mappings }
    }

    /// Rewrite a kernel path to a drive-letter path.
    ///
    /// Returns `None` when no mounted drive's device prefixes the path, which
    /// covers network redirectors, named pipes and other pseudo devices.
    pub fn translate(&self, nt_path: &str) -> Option<String> {
        // \??\C:\... is already in drive-letter form
        if let Some(dos) = nt_path.strip_prefix("\\??\\") {
            let drive = dos.get(..2)?;
            let rest = dos.get(2..)?;
            let mounted = self.mappings.iter().any(|m| m.drive.eq_ignore_ascii_case(drive));
            return (mounted && is_boundary(rest)).then(|| format!("{}{}", drive.to_ascii_uppercase(), rest));
        }

        self.mappings.iter().find_map(|m| {
            let head = nt_path.get(..m.device.len())?;
            let rest = nt_path.get(m.device.len()..)?;
            (head.eq_ignore_ascii_case(&m.device) && is_boundary(rest))
                .then(|| format!("{}{}", m.drive, rest))
        })
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

// `\Device\HarddiskVolume1` must not claim `\Device\HarddiskVolume10\...`
fn is_boundary(rest: &str) -> bool {
    rest.is_empty() || rest.starts_with('\\')
}
