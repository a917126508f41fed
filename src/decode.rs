//! Decoder adapter: loads an image's on-disk file into an RGBA raster.
//!
//! Decoder-handled formats go through the `image` crate with format
//! autodetection. Raw RGB/RGBA files are streamed straight from disk,
//! optionally through a zlib inflater, and widened to RGBA explicitly:
//! the wire format is RGB(A) byte order regardless of host endianness.

use flate2::bufread::ZlibDecoder;
use log::debug;
use std::fs::File;
use std::io::{BufReader, Read};

use crate::disk::CacheDir;
use crate::error::CommandError;
use crate::image::{Format, Image, Raster};

/// Decodes the image's cache file into an RGBA raster.
pub fn load_original(cache: &CacheDir, image: &Image) -> Result<Raster, CommandError> {
    match image.format {
        Format::Auto | Format::File => load_via_decoder(cache, image),
        Format::Rgb | Format::Rgba => load_raw(cache, image),
    }
}

/// Probes pixel dimensions without a full decode: header values for raw
/// formats, a cheap header sniff for decoder formats.
pub fn probe_dimensions(cache: &CacheDir, image: &Image) -> Option<(u32, u32)> {
    match image.format {
        Format::Rgb | Format::Rgba => {
            if image.pix_width == 0 || image.pix_height == 0 {
                None
            } else {
                Some((image.pix_width, image.pix_height))
            }
        }
        Format::Auto | Format::File => {
            let size = imagesize::size(cache.image_path(image.image_id)).ok()?;
            Some((size.width as u32, size.height as u32))
        }
    }
}

fn load_via_decoder(cache: &CacheDir, image: &Image) -> Result<Raster, CommandError> {
    let path = cache.image_path(image.image_id);
    let bytes = std::fs::read(&path).map_err(|e| {
        CommandError::ebadf(format!("could not open file for image {}: {e}", image.image_id))
    })?;
    let decoded = image::load_from_memory(&bytes).map_err(|e| {
        CommandError::ebadf(format!("could not decode image {}: {e}", image.image_id))
    })?;
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    debug!("decoded image {} as {width}x{height}", image.image_id);
    Raster::from_rgba(width, height, rgba.into_raw())
        .ok_or_else(|| CommandError::ebadf(format!("decoder produced a short buffer for image {}", image.image_id)))
}

fn load_raw(cache: &CacheDir, image: &Image) -> Result<Raster, CommandError> {
    let (width, height) = (image.pix_width, image.pix_height);
    if width == 0 || height == 0 {
        return Err(CommandError::ebadf(format!(
            "zero dimensions {width}x{height} for raw image {}",
            image.image_id
        )));
    }
    let bpp = image
        .format
        .bytes_per_pixel()
        .expect("raw formats always have a pixel size");
    let expected = width as u64 * height as u64 * bpp as u64;

    let path = cache.image_path(image.image_id);
    let file = File::open(&path).map_err(|e| {
        CommandError::ebadf(format!("could not open file for image {}: {e}", image.image_id))
    })?;
    let reader = BufReader::new(file);

    let mut bytes = Vec::with_capacity(expected as usize);
    let read = if image.compression {
        ZlibDecoder::new(reader).read_to_end(&mut bytes)
    } else {
        let mut reader = reader;
        reader.read_to_end(&mut bytes)
    };
    read.map_err(|e| {
        CommandError::ebadf(format!("could not read pixel data of image {}: {e}", image.image_id))
    })?;

    if bytes.len() as u64 != expected {
        return Err(CommandError::ebadf(format!(
            "raw pixel data of image {} is {} bytes, expected {expected}",
            image.image_id,
            bytes.len()
        )));
    }

    let raster = match image.format {
        Format::Rgba => Raster::from_rgba(width, height, bytes),
        Format::Rgb => {
            // Widen RGB to RGBA with an opaque alpha channel.
            let mut rgba = Vec::with_capacity((expected / 3 * 4) as usize);
            for px in bytes.chunks_exact(3) {
                rgba.extend_from_slice(px);
                rgba.push(0xFF);
            }
            Raster::from_rgba(width, height, rgba)
        }
        _ => unreachable!(),
    };
    raster.ok_or_else(|| {
        CommandError::ebadf(format!("raw buffer shape mismatch for image {}", image.image_id))
    })
}
