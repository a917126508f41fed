//! The two-tier image/placement cache: id maps, RAM/disk accounting, and
//! the budgeted eviction policy.
//!
//! All raster and disk-size mutations go through the store so the running
//! totals stay exact. Eviction is age-based: every touch bumps a
//! process-monotonic stamp, and cleanup walks snapshots sorted by it.

use log::{debug, info};
use std::collections::HashMap;

use crate::config::GraphicsConfig;
use crate::disk::CacheDir;
use crate::image::{Image, Placement, Raster};

const IMAGE_ID_TOP_BYTE: u32 = 0xFF00_0000;
const IMAGE_ID_MID_BYTES: u32 = 0x00FF_FF00;
const PLACEMENT_ID_MASK: u32 = 0x00FF_FFFF;

/// Maps image ids to images (which own their placements) and tracks the
/// store-wide RAM and disk totals.
#[derive(Debug, Default)]
pub struct ImageStore {
    images: HashMap<u32, Image>,
    ram_bytes: u64,
    disk_bytes: u64,
    clock: u64,
}

impl ImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next value of the monotonic access stamp.
    pub fn next_atime(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn ram_bytes(&self) -> u64 {
        self.ram_bytes
    }

    pub fn disk_bytes(&self) -> u64 {
        self.disk_bytes
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn placement_count(&self) -> usize {
        self.images.values().map(|i| i.placements.len()).sum()
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.images.values()
    }

    pub fn find_image(&self, image_id: u32) -> Option<&Image> {
        self.images.get(&image_id)
    }

    pub fn find_image_mut(&mut self, image_id: u32) -> Option<&mut Image> {
        self.images.get_mut(&image_id)
    }

    /// Finds the newest image carrying the given number; the newest is
    /// the one with the highest creation index.
    pub fn find_image_by_number(&self, number: u32) -> Option<&Image> {
        if number == 0 {
            return None;
        }
        self.images
            .values()
            .filter(|i| i.image_number == number)
            .max_by_key(|i| i.global_command_index)
    }

    /// Looks up a placement. Id `0` falls back to the image's default
    /// placement.
    pub fn find_placement(&self, image_id: u32, placement_id: u32) -> Option<&Placement> {
        let image = self.images.get(&image_id)?;
        let placement_id = if placement_id == 0 {
            image.default_placement
        } else {
            placement_id
        };
        image.placements.get(&placement_id)
    }

    pub fn find_placement_mut(&mut self, image_id: u32, placement_id: u32) -> Option<&mut Placement> {
        let image = self.images.get_mut(&image_id)?;
        let placement_id = if placement_id == 0 {
            image.default_placement
        } else {
            placement_id
        };
        image.placements.get_mut(&placement_id)
    }

    /// Generates a random 32-bit image id. The top byte and the middle
    /// two bytes are kept nonzero so the id always needs a full 32-bit
    /// foreground color to encode, and the id is unique in the store.
    pub fn generate_image_id(&self) -> u32 {
        loop {
            let id: u32 = rand::random();
            if id & IMAGE_ID_TOP_BYTE == 0 || id & IMAGE_ID_MID_BYTES == 0 {
                continue;
            }
            if self.images.contains_key(&id) {
                continue;
            }
            return id;
        }
    }

    /// Generates a random 24-bit placement id with nonzero middle bytes,
    /// unique within the image.
    pub fn generate_placement_id(image: &Image) -> u32 {
        loop {
            let id = rand::random::<u32>() & PLACEMENT_ID_MASK;
            if id & IMAGE_ID_MID_BYTES == 0 {
                continue;
            }
            if image.placements.contains_key(&id) {
                continue;
            }
            return id;
        }
    }

    /// Inserts a freshly created image, folding its sizes into the totals.
    /// Replaces (and fully deletes) any previous image with the same id.
    pub fn insert_image(&mut self, image: Image, cache: &CacheDir) {
        let id = image.image_id;
        if self.images.contains_key(&id) {
            self.delete_image(id, cache);
        }
        self.ram_bytes += image.total_ram_size();
        self.disk_bytes += image.disk_size;
        self.images.insert(id, image);
    }

    /// Inserts or replaces a placement, keeping the RAM total exact.
    /// The first placement of an image becomes its default.
    pub fn insert_placement(&mut self, image_id: u32, placement: Placement) {
        let Some(image) = self.images.get_mut(&image_id) else {
            return;
        };
        let pid = placement.placement_id;
        if let Some(old) = image.placements.remove(&pid) {
            self.ram_bytes -= old.scaled_ram_size();
        }
        self.ram_bytes += placement.scaled_ram_size();
        if image.default_placement == 0 {
            image.default_placement = pid;
        }
        image.placements.insert(pid, placement);
    }

    /// Replaces an image's original raster, adjusting the RAM total.
    pub fn set_original(&mut self, image_id: u32, raster: Option<Raster>) {
        if let Some(image) = self.images.get_mut(&image_id) {
            self.ram_bytes -= image.original_ram_size();
            image.original = raster;
            self.ram_bytes += image.original_ram_size();
        }
    }

    /// Replaces a placement's scaled raster and records the cell size it
    /// was built for.
    pub fn set_scaled(
        &mut self,
        image_id: u32,
        placement_id: u32,
        raster: Option<Raster>,
        cell_w: u16,
        cell_h: u16,
    ) {
        let Some(image) = self.images.get_mut(&image_id) else {
            return;
        };
        if let Some(placement) = image.placements.get_mut(&placement_id) {
            self.ram_bytes -= placement.scaled_ram_size();
            placement.scaled = raster;
            placement.scaled_cw = cell_w;
            placement.scaled_ch = cell_h;
            self.ram_bytes += placement.scaled_ram_size();
        }
    }

    /// Records a new on-disk size for the image.
    pub fn set_disk_size(&mut self, image_id: u32, size: u64) {
        if let Some(image) = self.images.get_mut(&image_id) {
            self.disk_bytes -= image.disk_size;
            image.disk_size = size;
            self.disk_bytes += size;
        }
    }

    pub fn touch_image(&mut self, image_id: u32) {
        let atime = self.next_atime();
        if let Some(image) = self.images.get_mut(&image_id) {
            image.atime = atime;
        }
    }

    pub fn touch_placement(&mut self, image_id: u32, placement_id: u32) {
        let atime = self.next_atime();
        if let Some(image) = self.images.get_mut(&image_id) {
            image.atime = atime;
            if let Some(placement) = image.placements.get_mut(&placement_id) {
                placement.atime = atime;
            }
        }
    }

    /// Fully deletes an image: its open upload file, its disk file, its
    /// placements, and the object itself.
    pub fn delete_image(&mut self, image_id: u32, cache: &CacheDir) -> bool {
        let Some(mut image) = self.images.remove(&image_id) else {
            return false;
        };
        // Close the upload handle before unlinking the file under it.
        image.open_file = None;
        cache.remove(image_id);
        self.ram_bytes -= image.total_ram_size();
        self.disk_bytes -= image.disk_size;
        debug!("deleted image {image_id}");
        true
    }

    /// Deletes one placement. Clears `default_placement` if it pointed at
    /// the removed id.
    pub fn delete_placement(&mut self, image_id: u32, placement_id: u32) -> bool {
        let Some(image) = self.images.get_mut(&image_id) else {
            return false;
        };
        let Some(placement) = image.placements.remove(&placement_id) else {
            return false;
        };
        self.ram_bytes -= placement.scaled_ram_size();
        if image.default_placement == placement_id {
            image.default_placement = image.placements.keys().copied().next().unwrap_or(0);
        }
        true
    }

    /// Deletes the image's disk file but keeps the object and any loaded
    /// raster.
    pub fn drop_disk_file(&mut self, image_id: u32, cache: &CacheDir) {
        cache.remove(image_id);
        self.set_disk_size(image_id, 0);
    }

    /// Runs the multi-stage cleanup: image count, placement count, disk
    /// bytes, then RAM (originals first, scaled rasters second). Each
    /// budget triggers only past its tolerated limit and reduces back to
    /// the soft limit.
    pub fn check_limits(&mut self, config: &GraphicsConfig, cache: &CacheDir) {
        // 1. Image count.
        if self.images.len() > config.tolerated_count(config.max_placements) {
            for (_, id) in self.images_by_age() {
                if self.images.len() <= config.max_placements {
                    break;
                }
                self.delete_image(id, cache);
            }
        }

        // 2. Placement count. Protected placements are skipped, even when
        // they are the oldest.
        if self.placement_count() > config.tolerated_count(config.max_placements) {
            for (_, image_id, placement_id) in self.placements_by_age() {
                if self.placement_count() <= config.max_placements {
                    break;
                }
                if self.is_protected(image_id, placement_id) {
                    continue;
                }
                self.delete_placement(image_id, placement_id);
            }
        }

        // 3. Disk bytes: drop files oldest first, keep the objects.
        if self.disk_bytes > config.tolerated(config.total_file_cache_size) {
            for (_, id) in self.images_by_age() {
                if self.disk_bytes <= config.total_file_cache_size {
                    break;
                }
                if self.images.get(&id).is_some_and(|i| i.disk_size > 0) {
                    debug!("disk budget: dropping file of image {id}");
                    self.drop_disk_file(id, cache);
                }
            }
        }

        // 4. RAM: unload original rasters oldest first.
        if self.ram_bytes > config.tolerated(config.total_ram_size) {
            for (_, id) in self.images_by_age() {
                if self.ram_bytes <= config.total_ram_size {
                    break;
                }
                if self.images.get(&id).is_some_and(|i| i.original.is_some()) {
                    debug!("ram budget: unloading original of image {id}");
                    self.set_original(id, None);
                }
            }

            // 5. Same budget: unload scaled rasters, skipping protected
            // placements.
            for (_, image_id, placement_id) in self.placements_by_age() {
                if self.ram_bytes <= config.total_ram_size {
                    break;
                }
                if self.is_protected(image_id, placement_id) {
                    continue;
                }
                let loaded = self
                    .images
                    .get(&image_id)
                    .and_then(|i| i.placements.get(&placement_id))
                    .is_some_and(|p| p.scaled.is_some());
                if loaded {
                    debug!("ram budget: unloading scaled raster of placement {image_id}/{placement_id}");
                    self.set_scaled(image_id, placement_id, None, 0, 0);
                }
            }
        }
    }

    /// Logs the full store contents for interactive debugging.
    pub fn dump_state(&self) {
        info!(
            "image store: {} images, {} placements, {} RAM bytes, {} disk bytes",
            self.images.len(),
            self.placement_count(),
            self.ram_bytes,
            self.disk_bytes
        );
        let mut ids: Vec<u32> = self.images.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let image = &self.images[&id];
            info!(
                "  image {id}: status={:?} number={} atime={} disk={} ram={} {}x{}",
                image.status,
                image.image_number,
                image.atime,
                image.disk_size,
                image.original_ram_size(),
                image.pix_width,
                image.pix_height
            );
            for (pid, placement) in &image.placements {
                info!(
                    "    placement {pid}: {}x{} cells atime={} virt={} scaled={}",
                    placement.cols,
                    placement.rows,
                    placement.atime,
                    placement.virt,
                    placement.scaled_ram_size()
                );
            }
        }
    }

    /// Deletes everything and resets the totals. Disk files are removed
    /// one by one so the directory itself survives.
    pub fn clear(&mut self, cache: &CacheDir) {
        let ids: Vec<u32> = self.images.keys().copied().collect();
        for id in ids {
            self.delete_image(id, cache);
        }
        debug_assert_eq!(self.ram_bytes, 0);
        debug_assert_eq!(self.disk_bytes, 0);
    }

    fn is_protected(&self, image_id: u32, placement_id: u32) -> bool {
        self.images
            .get(&image_id)
            .and_then(|i| i.placements.get(&placement_id))
            .is_some_and(|p| p.protected)
    }

    /// Snapshot of image ids sorted ascending by atime (id as tiebreak).
    fn images_by_age(&self) -> Vec<(u64, u32)> {
        let mut snapshot: Vec<(u64, u32)> = self
            .images
            .values()
            .map(|i| (i.atime, i.image_id))
            .collect();
        snapshot.sort_unstable();
        snapshot
    }

    /// Snapshot of all placements sorted ascending by atime.
    fn placements_by_age(&self) -> Vec<(u64, u32, u32)> {
        let mut snapshot: Vec<(u64, u32, u32)> = self
            .images
            .values()
            .flat_map(|i| {
                i.placements
                    .values()
                    .map(|p| (p.atime, p.image_id, p.placement_id))
            })
            .collect();
        snapshot.sort_unstable();
        snapshot
    }
}
