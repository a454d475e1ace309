use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

/// Width of one region in meters.
pub const REGION_WIDTH: u32 = 256;

/// Packs global grid coordinates (meters) into a region handle.
pub fn region_handle(global_x: u32, global_y: u32) -> u64 {
    ((global_x as u64) << 32) | global_y as u64
}

/// Region handle for the region at grid cell (`x`, `y`). Global coordinates
/// past `u32::MAX` meters wrap, as each half of a handle is 32 bits.
pub fn region_handle_for_cell(x: u32, y: u32) -> u64 {
    let width = u64::from(REGION_WIDTH);
    region_handle((u64::from(x) * width) as u32, (u64::from(y) * width) as u32)
}

/// Region-name lookups for teleport-by-name.
///
/// `lookup` answers from whatever is already known. `request` asks for the
/// name to be fetched; a later `lookup` may then succeed.
pub trait RegionResolver: Send + Sync {
    fn lookup(&self, name: &str) -> Option<u64>;
    fn request(&self, name: &str);
}

/// In-memory region table keyed by lowercased name.
#[derive(Debug, Default)]
pub struct RegionDirectory {
    regions: RwLock<HashMap<String, u64>>,
    requests: AtomicUsize,
}

impl RegionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, handle: u64) {
        self.regions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_lowercase(), handle);
    }

    pub fn remove(&self, name: &str) -> Option<u64> {
        self.regions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.regions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `request` calls so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl RegionResolver for RegionDirectory {
    fn lookup(&self, name: &str) -> Option<u64> {
        self.regions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name.to_lowercase())
            .copied()
    }

    fn request(&self, name: &str) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        log::debug!("Region {:?} not in directory", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_handle_packing() {
        let handle = region_handle_for_cell(1000, 1001);
        assert_eq!(handle, (256_000u64 << 32) | 256_256);
        assert_eq!(handle >> 32, 256_000);
        assert_eq!(handle as u32, 256_256);
    }

    #[test]
    fn test_region_handle_for_far_cells() {
        // 16_777_216 * 256 is 2^32
        assert_eq!(region_handle_for_cell(16_777_216, 0), 0);
        assert_eq!(
            region_handle_for_cell(u32::MAX, 16_777_217),
            region_handle(0xFFFF_FF00, 256)
        );
        assert_eq!(
            region_handle_for_cell(16_777_215, 16_777_215),
            (0xFFFF_FF00u64 << 32) | 0xFFFF_FF00
        );
    }

    #[test]
    fn test_directory_is_case_insensitive() {
        let directory = RegionDirectory::new();
        directory.insert("Ahern", 7);
        assert_eq!(directory.lookup("ahern"), Some(7));
        assert_eq!(directory.lookup("AHERN"), Some(7));
        assert_eq!(directory.lookup("Morris"), None);

        directory.request("Morris");
        assert_eq!(directory.requests(), 1);
        assert_eq!(directory.remove("AHERN"), Some(7));
        assert!(directory.is_empty());
    }
}
