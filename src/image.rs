//! Data model: images, placements, and their in-memory rasters.
//!
//! An [`Image`] is the original raster as received from the client, kept
//! on disk and optionally decoded into RAM. A [`Placement`] is a sized,
//! cropped, scaled view of an image; one image may have many. Placements
//! refer to their owner by id only, never by pointer.

use std::collections::HashMap;
use std::fs::File;

/// Pixel format of an uploaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Autodetect via the decoder (protocol value 0).
    #[default]
    Auto,
    /// Raw RGB, 3 bytes per pixel (protocol value 24).
    Rgb,
    /// Raw RGBA, 4 bytes per pixel (protocol value 32).
    Rgba,
    /// An image-file format handled by the decoder (protocol value 100).
    File,
}

impl Format {
    /// Parses the protocol `f=` value. Any other value is rejected.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Format::Auto),
            24 => Some(Format::Rgb),
            32 => Some(Format::Rgba),
            100 => Some(Format::File),
            _ => None,
        }
    }

    /// Bytes per pixel for raw formats; `None` for decoder formats.
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            Format::Rgb => Some(3),
            Format::Rgba => Some(4),
            Format::Auto | Format::File => None,
        }
    }
}

/// Upload / load status of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Uninit,
    Uploading,
    UploadErr,
    UploadOk,
    RamLoadErr,
    RamLoadOk,
}

/// What went wrong during an upload, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadFailure {
    #[default]
    None,
    /// The transmission exceeded the per-image file size limit.
    OverSizeLimit,
    /// The cache file could not be opened for writing.
    CannotOpenCachedFile,
    /// The final size did not match the `S=` header.
    UnexpectedSize,
    /// A file/temp-file source could not be copied into the cache.
    CannotCopyFile,
}

/// How a placement maps its source rectangle onto its cell box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleMode {
    /// Copy the source rect 1:1 at the top-left of the target.
    #[default]
    None,
    /// Stretch the source rect to cover the whole target.
    Fill,
    /// Fit within the target preserving aspect ratio, centered.
    Contain,
    /// 1:1 if the source fits, otherwise contain.
    NoneOrContain,
}

/// A decoded RGBA raster held in RAM.
#[derive(Clone, PartialEq, Eq)]
pub struct Raster {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Raster {
    /// Wraps an RGBA byte buffer. The buffer length must be
    /// `width * height * 4`.
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() as u64 != width as u64 * height as u64 * 4 {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    /// An all-transparent raster of the given size.
    pub fn transparent(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; (width as usize) * (height as usize) * 4],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// RAM footprint in bytes (always `width * height * 4`).
    pub fn ram_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// RGBA pixel at the given coordinates.
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y as usize * self.width as usize) + x as usize) * 4;
        Some([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    /// Copies a rectangle of `src` into this raster at `(dst_x, dst_y)`.
    /// Out-of-range parts are skipped.
    pub fn copy_from(&mut self, src: &Raster, src_x: u32, src_y: u32, w: u32, h: u32, dst_x: u32, dst_y: u32) {
        let w = w
            .min(src.width.saturating_sub(src_x))
            .min(self.width.saturating_sub(dst_x));
        let h = h
            .min(src.height.saturating_sub(src_y))
            .min(self.height.saturating_sub(dst_y));
        for row in 0..h {
            let src_off = (((src_y + row) as usize * src.width as usize) + src_x as usize) * 4;
            let dst_off = (((dst_y + row) as usize * self.width as usize) + dst_x as usize) * 4;
            let len = w as usize * 4;
            self.data[dst_off..dst_off + len].copy_from_slice(&src.data[src_off..src_off + len]);
        }
    }
}

impl std::fmt::Debug for Raster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Raster")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// A sized, cropped, scaled view of an image, owned by that image.
#[derive(Debug)]
pub struct Placement {
    /// 24-bit nonzero id, unique within the owning image.
    pub placement_id: u32,
    /// Id of the owning image (borrow by id, never by pointer).
    pub image_id: u32,
    /// Monotonic access stamp; bumped on every touch.
    pub atime: u64,
    /// Transient: forbids eviction of this placement during the current
    /// operation.
    pub protected: bool,
    /// True if this placement only annotates Unicode placeholder cells
    /// and is never drawn directly.
    pub virt: bool,
    pub scale_mode: ScaleMode,
    pub do_not_move_cursor: bool,

    /// Cell dimensions on the grid (0 = infer at load time).
    pub cols: u16,
    pub rows: u16,

    /// Source rectangle in the image's pixel space. Zero or out-of-range
    /// extents are clamped at load time.
    pub src_pix_x: u32,
    pub src_pix_y: u32,
    pub src_pix_width: u32,
    pub src_pix_height: u32,

    /// Cached scaled raster and the cell size it was scaled for. A cell
    /// size change invalidates it.
    pub scaled: Option<Raster>,
    pub scaled_cw: u16,
    pub scaled_ch: u16,
}

impl Placement {
    pub fn scaled_ram_size(&self) -> u64 {
        self.scaled.as_ref().map_or(0, Raster::ram_size)
    }

    /// True if the cached scaled raster matches the given cell size.
    pub fn scaled_fits_cell(&self, cell_w: u16, cell_h: u16) -> bool {
        self.scaled.is_some() && self.scaled_cw == cell_w && self.scaled_ch == cell_h
    }
}

/// The original raster plus upload metadata, as received from the client.
#[derive(Debug, Default)]
pub struct Image {
    /// 32-bit nonzero id.
    pub image_id: u32,
    /// Original id of a query command; set only for ephemeral images.
    pub query_id: u32,
    /// Optional secondary handle shared between images; the newest one
    /// (by `global_command_index`) is authoritative.
    pub image_number: u32,
    /// Value of the global command counter when this image was created.
    pub global_command_index: u64,
    /// Monotonic access stamp; bumped on every touch.
    pub atime: u64,

    /// Bytes currently on disk.
    pub disk_size: u64,
    /// Bytes promised by the `S=` transmission header (0 = unchecked).
    pub expected_size: u64,

    pub format: Format,
    /// True if the payload is zlib-compressed (`o=z`), raw formats only.
    pub compression: bool,
    /// Decoded pixel dimensions, once known.
    pub pix_width: u32,
    pub pix_height: u32,

    pub status: Status,
    pub upload_failure: UploadFailure,
    /// Response suppression: 0 all, 1 suppress OK, 2 suppress all.
    pub quiet: u8,

    /// Open cache file; non-`None` exactly while a chunked upload is in
    /// progress.
    pub open_file: Option<File>,

    /// The decoded original raster, if loaded.
    pub original: Option<Raster>,

    pub placements: HashMap<u32, Placement>,
    /// First placement created; used when a put omits the placement id.
    pub default_placement: u32,
    /// Placement id supplied with a transmit-and-put command, for
    /// response addressing.
    pub initial_placement_id: u32,
}

impl Image {
    pub fn original_ram_size(&self) -> u64 {
        self.original.as_ref().map_or(0, Raster::ram_size)
    }

    /// RAM held by this image and all of its placements.
    pub fn total_ram_size(&self) -> u64 {
        self.original_ram_size()
            + self
                .placements
                .values()
                .map(Placement::scaled_ram_size)
                .sum::<u64>()
    }
}
