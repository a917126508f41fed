//! Upload state machine: chunked direct transmission and file/temp-file
//! transmission, with size-limit and integrity checks.
//!
//! A direct upload holds the cache file open across commands; the handle
//! is closed on the final chunk, on any upload error, and on image
//! deletion. Error responses for a chunked stream are emitted only on
//! the final chunk so a broken client cannot flood the TTY.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, warn};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::config::GraphicsConfig;
use crate::decode;
use crate::disk::CacheDir;
use crate::error::CommandError;
use crate::image::{Image, Status, UploadFailure};
use crate::parse::{GraphicsCommand, Medium};
use crate::store::ImageStore;

/// Marker that a deletable temp-file source must carry in its name.
const TEMP_FILE_MARKER: &str = "tty-graphics-protocol";

/// What a transmit command did, for response building and `a=T` routing.
#[derive(Debug)]
pub struct TransmitOutcome {
    /// The affected image, 0 if none could be created.
    pub image_id: u32,
    /// False for intermediate chunks: no response at all.
    pub respond: bool,
    /// True if this command continued an earlier chunked upload.
    pub continuation: bool,
    pub result: Result<(), CommandError>,
}

/// Entry point for `a=t`, `a=q`, `a=T` and bare continuation chunks.
pub fn handle_transmit(
    store: &mut ImageStore,
    cache: &CacheDir,
    config: &GraphicsConfig,
    current_upload: &mut u32,
    command_index: u64,
    cmd: &GraphicsCommand,
    ephemeral: bool,
) -> TransmitOutcome {
    // A command with no id and no number binds to the upload in progress.
    let continuation =
        cmd.image_id == 0 && cmd.image_number == 0 && *current_upload != 0;

    if continuation {
        let image_id = *current_upload;
        let outcome = append_direct_chunk(store, cache, config, current_upload, image_id, cmd);
        return TransmitOutcome {
            continuation: true,
            ..outcome
        };
    }

    if cmd.compression && cmd.format.bytes_per_pixel().is_none() {
        return TransmitOutcome {
            image_id: 0,
            respond: true,
            continuation: false,
            result: Err(CommandError::einval(
                "compression is only valid for raw pixel formats",
            )),
        };
    }

    let image_id = create_image(store, cache, command_index, cmd, ephemeral);
    match cmd.medium {
        Medium::Direct => {
            append_direct_chunk(store, cache, config, current_upload, image_id, cmd)
        }
        Medium::File => transmit_from_file(store, cache, config, image_id, cmd, false),
        Medium::TempFile => transmit_from_file(store, cache, config, image_id, cmd, true),
    }
}

/// Creates the image object for a fresh transmission. An existing image
/// with the same id is replaced outright.
fn create_image(
    store: &mut ImageStore,
    cache: &CacheDir,
    command_index: u64,
    cmd: &GraphicsCommand,
    ephemeral: bool,
) -> u32 {
    let (image_id, query_id) = if ephemeral {
        // Queries never clobber a real image: fresh random id, original
        // id kept for response addressing.
        (store.generate_image_id(), cmd.image_id)
    } else if cmd.image_id == 0 {
        (store.generate_image_id(), 0)
    } else {
        (cmd.image_id, 0)
    };

    let atime = store.next_atime();
    let image = Image {
        image_id,
        query_id,
        image_number: cmd.image_number,
        global_command_index: command_index,
        atime,
        expected_size: cmd.expected_size,
        format: cmd.format,
        compression: cmd.compression,
        pix_width: cmd.pix_width,
        pix_height: cmd.pix_height,
        status: Status::Uploading,
        quiet: cmd.quiet,
        ..Default::default()
    };
    store.insert_image(image, cache);
    debug!("transmission started for image {image_id} (command {command_index})");
    image_id
}

/// Appends one direct chunk, finalizing the upload when `m=0`.
fn append_direct_chunk(
    store: &mut ImageStore,
    cache: &CacheDir,
    config: &GraphicsConfig,
    current_upload: &mut u32,
    image_id: u32,
    cmd: &GraphicsCommand,
) -> TransmitOutcome {
    let is_final = !cmd.more;
    let mut outcome = TransmitOutcome {
        image_id,
        respond: is_final,
        continuation: false,
        result: Ok(()),
    };

    if store.find_image(image_id).is_none() {
        *current_upload = 0;
        outcome.result = Err(CommandError::enoent(format!(
            "image with id={image_id} disappeared during upload"
        )));
        return outcome;
    }
    store.touch_image(image_id);

    // Keep the stream bound to this image until its final chunk, even
    // when an earlier chunk already failed: later chunks must stay
    // silent instead of spawning fresh images.
    *current_upload = if is_final { 0 } else { image_id };

    // A stream already in error swallows its remaining chunks; the final
    // chunk reports the recorded failure.
    if store.find_image(image_id).is_some_and(|i| i.status == Status::UploadErr) {
        if is_final {
            outcome.result = Err(failure_error(store, image_id));
        }
        return outcome;
    }

    match BASE64.decode(cmd.payload) {
        Ok(bytes) => {
            if let Err(err) = write_chunk(store, cache, config, image_id, &bytes) {
                if is_final {
                    outcome.result = Err(err);
                }
                return outcome;
            }
        }
        Err(e) => {
            mark_failed(store, image_id, UploadFailure::None);
            if is_final {
                outcome.result = Err(CommandError::einval(format!("invalid base64 payload: {e}")));
            }
            return outcome;
        }
    }

    if is_final {
        outcome.result = finalize_upload(store, cache, image_id);
    }
    outcome
}

/// Writes decoded bytes to the image's cache file, enforcing the
/// per-image file budget.
fn write_chunk(
    store: &mut ImageStore,
    cache: &CacheDir,
    config: &GraphicsConfig,
    image_id: u32,
    bytes: &[u8],
) -> Result<(), CommandError> {
    let (disk_size, expected_size) = {
        let image = store
            .find_image(image_id)
            .expect("caller checked existence");
        (image.disk_size, image.expected_size)
    };

    let new_size = disk_size + bytes.len() as u64;
    if new_size > config.max_image_file_size || expected_size > config.max_image_file_size {
        cache.remove(image_id);
        store.set_disk_size(image_id, 0);
        mark_failed(store, image_id, UploadFailure::OverSizeLimit);
        return Err(CommandError::efbig(format!(
            "image {image_id} exceeds the {} byte file limit",
            config.max_image_file_size
        )));
    }

    let image = store
        .find_image_mut(image_id)
        .expect("caller checked existence");
    if image.open_file.is_none() {
        match cache.open_for_append(image_id) {
            Ok(file) => image.open_file = Some(file),
            Err(e) => {
                mark_failed(store, image_id, UploadFailure::CannotOpenCachedFile);
                return Err(CommandError::ebadf(format!(
                    "could not open cache file for image {image_id}: {e}"
                )));
            }
        }
    }
    if let Err(e) = image
        .open_file
        .as_mut()
        .expect("opened above")
        .write_all(bytes)
    {
        mark_failed(store, image_id, UploadFailure::CannotOpenCachedFile);
        return Err(CommandError::eio(format!(
            "could not write cache file for image {image_id}: {e}"
        )));
    }
    store.set_disk_size(image_id, new_size);
    Ok(())
}

/// Closes the upload, verifies the promised size, and loads the raster.
fn finalize_upload(
    store: &mut ImageStore,
    cache: &CacheDir,
    image_id: u32,
) -> Result<(), CommandError> {
    let (disk_size, expected_size) = {
        let image = store
            .find_image_mut(image_id)
            .expect("caller checked existence");
        image.open_file = None;
        (image.disk_size, image.expected_size)
    };

    if expected_size != 0 && expected_size != disk_size {
        mark_failed(store, image_id, UploadFailure::UnexpectedSize);
        return Err(CommandError::einval(format!(
            "the size of the uploaded image {disk_size} doesn't match the expected size {expected_size}"
        )));
    }

    if let Some(image) = store.find_image_mut(image_id) {
        image.status = Status::UploadOk;
    }
    debug!("upload of image {image_id} complete ({disk_size} bytes)");
    load_into_ram(store, cache, image_id)
}

/// Decodes the cache file into RAM, recording the load status.
pub fn load_into_ram(
    store: &mut ImageStore,
    cache: &CacheDir,
    image_id: u32,
) -> Result<(), CommandError> {
    let Some(image) = store.find_image(image_id) else {
        return Err(CommandError::enoent(format!("image with id={image_id} not found")));
    };

    // A cheap header probe first: geometry inference keeps working even
    // if the raster is later dropped or the full decode fails.
    if image.pix_width == 0 || image.pix_height == 0 {
        let probed = decode::probe_dimensions(cache, image);
        if let Some((w, h)) = probed {
            if let Some(image) = store.find_image_mut(image_id) {
                image.pix_width = w;
                image.pix_height = h;
            }
        }
    }

    let image = store
        .find_image(image_id)
        .expect("checked above");
    match decode::load_original(cache, image) {
        Ok(raster) => {
            let (w, h) = (raster.width(), raster.height());
            store.set_original(image_id, Some(raster));
            if let Some(image) = store.find_image_mut(image_id) {
                image.pix_width = w;
                image.pix_height = h;
                image.status = Status::RamLoadOk;
            }
            Ok(())
        }
        Err(err) => {
            if let Some(image) = store.find_image_mut(image_id) {
                image.status = Status::RamLoadErr;
            }
            Err(err)
        }
    }
}

/// `t=f` / `t=t`: the payload is a base64-encoded absolute path on the
/// terminal host. The file is copied into the cache; a temp-file source
/// is deleted afterwards, but only from a temp dir and only if its name
/// carries the protocol marker.
fn transmit_from_file(
    store: &mut ImageStore,
    cache: &CacheDir,
    config: &GraphicsConfig,
    image_id: u32,
    cmd: &GraphicsCommand,
    delete_source: bool,
) -> TransmitOutcome {
    let mut outcome = TransmitOutcome {
        image_id,
        respond: true,
        continuation: false,
        result: Ok(()),
    };
    outcome.result = copy_and_load(store, cache, config, image_id, cmd.payload, delete_source);
    outcome
}

fn copy_and_load(
    store: &mut ImageStore,
    cache: &CacheDir,
    config: &GraphicsConfig,
    image_id: u32,
    payload: &[u8],
    delete_source: bool,
) -> Result<(), CommandError> {
    let decoded = BASE64
        .decode(payload)
        .map_err(|e| CommandError::einval(format!("invalid base64 file path: {e}")))?;
    let path_str = String::from_utf8(decoded)
        .map_err(|_| CommandError::einval("file path is not valid UTF-8"))?;
    let source = PathBuf::from(&path_str);

    let metadata = std::fs::metadata(&source).map_err(|e| {
        mark_failed(store, image_id, UploadFailure::CannotCopyFile);
        CommandError::ebadf(format!("could not stat source file {path_str}: {e}"))
    })?;
    if !metadata.is_file() {
        mark_failed(store, image_id, UploadFailure::CannotCopyFile);
        return Err(CommandError::ebadf(format!("{path_str} is not a regular file")));
    }
    if metadata.len() > config.max_image_file_size {
        mark_failed(store, image_id, UploadFailure::OverSizeLimit);
        return Err(CommandError::efbig(format!(
            "source file {path_str} exceeds the {} byte file limit",
            config.max_image_file_size
        )));
    }

    let expected_size = store
        .find_image(image_id)
        .map(|i| i.expected_size)
        .unwrap_or(0);
    if expected_size != 0 && expected_size != metadata.len() {
        mark_failed(store, image_id, UploadFailure::UnexpectedSize);
        return Err(CommandError::einval(format!(
            "the size of the uploaded image {} doesn't match the expected size {expected_size}",
            metadata.len()
        )));
    }

    let copied = cache.copy_into(&source, image_id).map_err(|e| {
        mark_failed(store, image_id, UploadFailure::CannotCopyFile);
        CommandError::eio(format!("could not copy {path_str} into the cache: {e}"))
    })?;
    store.set_disk_size(image_id, copied);
    if let Some(image) = store.find_image_mut(image_id) {
        image.status = Status::UploadOk;
    }

    if delete_source && is_deletable_temp_file(&source) {
        match std::fs::remove_file(&source) {
            Ok(()) => debug!("deleted temp-file source {path_str}"),
            Err(e) => warn!("could not delete temp-file source {path_str}: {e}"),
        }
    }

    load_into_ram(store, cache, image_id)
}

/// Both conditions must hold: the path is under a temp dir and the file
/// name carries the protocol marker. Never deletes arbitrary user files.
fn is_deletable_temp_file(path: &Path) -> bool {
    let in_tmp = path.starts_with("/tmp/")
        || std::env::var_os("TMPDIR")
            .map(PathBuf::from)
            .is_some_and(|tmpdir| path.starts_with(&tmpdir));
    let has_marker = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains(TEMP_FILE_MARKER));
    in_tmp && has_marker
}

fn mark_failed(store: &mut ImageStore, image_id: u32, failure: UploadFailure) {
    if let Some(image) = store.find_image_mut(image_id) {
        image.open_file = None;
        image.status = Status::UploadErr;
        image.upload_failure = failure;
    }
}

fn failure_error(store: &ImageStore, image_id: u32) -> CommandError {
    let failure = store
        .find_image(image_id)
        .map(|i| i.upload_failure)
        .unwrap_or_default();
    match failure {
        UploadFailure::OverSizeLimit => {
            CommandError::efbig(format!("image {image_id} exceeds the file size limit"))
        }
        UploadFailure::CannotOpenCachedFile => {
            CommandError::ebadf(format!("could not open cache file for image {image_id}"))
        }
        UploadFailure::UnexpectedSize => {
            CommandError::einval(format!("upload of image {image_id} has the wrong size"))
        }
        UploadFailure::CannotCopyFile => {
            CommandError::eio(format!("could not copy the source of image {image_id}"))
        }
        UploadFailure::None => {
            CommandError::einval(format!("upload of image {image_id} failed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_command;

    fn setup() -> (ImageStore, CacheDir, GraphicsConfig) {
        (
            ImageStore::new(),
            CacheDir::new("kittygfx-upload-test").unwrap(),
            GraphicsConfig::default(),
        )
    }

    fn b64(data: &[u8]) -> String {
        BASE64.encode(data)
    }

    fn transmit(
        store: &mut ImageStore,
        cache: &CacheDir,
        config: &GraphicsConfig,
        current: &mut u32,
        index: u64,
        body: &str,
    ) -> TransmitOutcome {
        let cmd = parse_command(body.as_bytes()).unwrap();
        handle_transmit(store, cache, config, current, index, &cmd, false)
    }

    #[test]
    fn chunked_direct_upload_accumulates_and_loads() {
        let (mut store, cache, config) = setup();
        let mut current = 0u32;

        // A real 1x1 png so the final decode succeeds.
        let mut png = Vec::new();
        let buf = image::RgbaImage::from_pixel(1, 1, image::Rgba([1, 2, 3, 255]));
        image::DynamicImage::ImageRgba8(buf)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let encoded = b64(&png);
        let (head, tail) = encoded.split_at(encoded.len() / 2 / 4 * 4);

        let first = transmit(
            &mut store,
            &cache,
            &config,
            &mut current,
            1,
            &format!("Gi=7,a=t,f=100,t=d,m=1,S={};{head}", png.len()),
        );
        assert_eq!(first.image_id, 7);
        assert!(!first.respond, "intermediate chunk must stay silent");
        assert!(first.result.is_ok());
        assert_eq!(current, 7);
        assert_eq!(store.find_image(7).unwrap().status, Status::Uploading);
        assert!(store.find_image(7).unwrap().open_file.is_some());

        let last = transmit(
            &mut store,
            &cache,
            &config,
            &mut current,
            2,
            &format!("Gm=0;{tail}"),
        );
        assert!(last.continuation);
        assert!(last.respond);
        assert!(last.result.is_ok(), "{:?}", last.result);
        assert_eq!(current, 0);

        let image = store.find_image(7).unwrap();
        assert_eq!(image.status, Status::RamLoadOk);
        assert_eq!(image.disk_size, png.len() as u64);
        assert!(image.open_file.is_none());
        assert_eq!((image.pix_width, image.pix_height), (1, 1));
    }

    #[test]
    fn size_mismatch_reports_einval_detail() {
        let (mut store, cache, config) = setup();
        let mut current = 0u32;

        transmit(
            &mut store,
            &cache,
            &config,
            &mut current,
            1,
            &format!("Gi=7,a=t,f=100,t=d,m=1,S=12;{}", b64(b"abc")),
        );
        transmit(
            &mut store,
            &cache,
            &config,
            &mut current,
            2,
            &format!("Gm=1;{}", b64(b"def")),
        );
        let last = transmit(
            &mut store,
            &cache,
            &config,
            &mut current,
            3,
            &format!("Gm=0;{}", b64(b"ghi")),
        );

        let err = last.result.unwrap_err();
        assert_eq!(
            err.to_string(),
            "EINVAL: the size of the uploaded image 9 doesn't match the expected size 12"
        );
        let image = store.find_image(7).unwrap();
        assert_eq!(image.status, Status::UploadErr);
        assert_eq!(image.upload_failure, UploadFailure::UnexpectedSize);
    }

    #[test]
    fn raw_rgba_upload_yields_exact_ram_size() {
        let (mut store, cache, config) = setup();
        let mut current = 0u32;

        let pixels = vec![5u8; 2 * 3 * 4];
        let outcome = transmit(
            &mut store,
            &cache,
            &config,
            &mut current,
            1,
            &format!("Gi=9,a=t,f=32,t=d,s=2,v=3;{}", b64(&pixels)),
        );
        assert!(outcome.result.is_ok(), "{:?}", outcome.result);

        let image = store.find_image(9).unwrap();
        assert_eq!(image.status, Status::RamLoadOk);
        assert_eq!(image.original_ram_size(), 2 * 3 * 4);
    }

    #[test]
    fn zero_dimension_raw_upload_is_ebadf() {
        let (mut store, cache, config) = setup();
        let mut current = 0u32;

        let outcome = transmit(
            &mut store,
            &cache,
            &config,
            &mut current,
            1,
            &format!("Gi=9,a=t,f=32,t=d,s=0,v=3;{}", b64(b"")),
        );
        let err = outcome.result.unwrap_err();
        assert!(err.to_string().starts_with("EBADF"));
        assert_eq!(store.find_image(9).unwrap().status, Status::RamLoadErr);
    }

    #[test]
    fn oversize_chunk_deletes_file_and_reports_efbig() {
        let (mut store, cache, mut config) = setup();
        config.max_image_file_size = 4;
        let mut current = 0u32;

        let outcome = transmit(
            &mut store,
            &cache,
            &config,
            &mut current,
            1,
            &format!("Gi=3,a=t,f=100,t=d;{}", b64(b"abcde")),
        );
        let err = outcome.result.unwrap_err();
        assert!(err.to_string().starts_with("EFBIG"));

        let image = store.find_image(3).unwrap();
        assert_eq!(image.status, Status::UploadErr);
        assert_eq!(image.upload_failure, UploadFailure::OverSizeLimit);
        assert_eq!(image.disk_size, 0);
        assert_eq!(cache.file_size(3), 0, "cache file must be deleted");
    }

    #[test]
    fn oversize_midstream_stays_silent_until_final_chunk() {
        let (mut store, cache, mut config) = setup();
        config.max_image_file_size = 4;
        let mut current = 0u32;

        let first = transmit(
            &mut store,
            &cache,
            &config,
            &mut current,
            1,
            &format!("Gi=3,a=t,f=100,t=d,m=1;{}", b64(b"abcdef")),
        );
        assert!(!first.respond);

        let last = transmit(
            &mut store,
            &cache,
            &config,
            &mut current,
            2,
            &format!("Gm=0;{}", b64(b"gh")),
        );
        assert!(last.respond);
        let err = last.result.unwrap_err();
        assert!(err.to_string().starts_with("EFBIG"));
    }

    #[test]
    fn file_transmission_copies_and_checks_size() {
        let (mut store, cache, config) = setup();
        let mut current = 0u32;

        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("img.rgba");
        std::fs::write(&source, vec![9u8; 2 * 2 * 4]).unwrap();
        let payload = b64(source.to_str().unwrap().as_bytes());

        let outcome = transmit(
            &mut store,
            &cache,
            &config,
            &mut current,
            1,
            &format!("Gi=1,a=t,t=f,f=32,s=2,v=2;{payload}"),
        );
        assert!(outcome.result.is_ok(), "{:?}", outcome.result);

        let image = store.find_image(1).unwrap();
        assert_eq!(image.status, Status::RamLoadOk);
        assert_eq!(image.disk_size, 16);
        assert_eq!(store.disk_bytes(), 16);
        assert!(source.exists(), "t=f must not delete the source");
    }

    #[test]
    fn temp_file_transmission_deletes_marked_sources_only() {
        let (mut store, cache, config) = setup();
        let mut current = 0u32;

        let unmarked = std::env::temp_dir().join("kittygfx-upload-plain.rgba");
        std::fs::write(&unmarked, vec![1u8; 4]).unwrap();
        let payload = b64(unmarked.to_str().unwrap().as_bytes());
        transmit(
            &mut store,
            &cache,
            &config,
            &mut current,
            1,
            &format!("Gi=1,a=t,t=t,f=32,s=1,v=1;{payload}"),
        );
        assert!(unmarked.exists(), "unmarked file must never be deleted");
        std::fs::remove_file(&unmarked).ok();

        assert!(is_deletable_temp_file(Path::new(
            "/tmp/tty-graphics-protocol-xyz.png"
        )));
        assert!(!is_deletable_temp_file(Path::new(
            "/home/user/tty-graphics-protocol-xyz.png"
        )));
        assert!(!is_deletable_temp_file(Path::new("/tmp/family-photo.png")));
    }

    #[test]
    fn missing_source_file_is_ebadf() {
        let (mut store, cache, config) = setup();
        let mut current = 0u32;

        let payload = b64(b"/nonexistent/kittygfx-test.png");
        let outcome = transmit(
            &mut store,
            &cache,
            &config,
            &mut current,
            1,
            &format!("Gi=1,a=t,t=f,f=100;{payload}"),
        );
        let err = outcome.result.unwrap_err();
        assert!(err.to_string().starts_with("EBADF"));
        assert_eq!(
            store.find_image(1).unwrap().upload_failure,
            UploadFailure::CannotCopyFile
        );
    }

    #[test]
    fn compression_with_png_format_is_rejected() {
        let (mut store, cache, config) = setup();
        let mut current = 0u32;

        let outcome = transmit(
            &mut store,
            &cache,
            &config,
            &mut current,
            1,
            &format!("Gi=1,a=t,f=100,o=z,t=d;{}", b64(b"x")),
        );
        assert!(outcome.result.unwrap_err().to_string().starts_with("EINVAL"));
    }

    #[test]
    fn query_uses_fresh_id_and_remembers_query_id() {
        let (mut store, cache, config) = setup();
        let mut current = 0u32;

        let pixels = vec![0u8; 4];
        let body = format!("Gi=31,a=q,f=32,t=d,s=1,v=1;{}", b64(&pixels));
        let cmd = parse_command(body.as_bytes()).unwrap();
        let outcome =
            handle_transmit(&mut store, &cache, &config, &mut current, 1, &cmd, true);

        assert!(outcome.result.is_ok());
        assert_ne!(outcome.image_id, 31, "query must not claim the client id");
        let image = store.find_image(outcome.image_id).unwrap();
        assert_eq!(image.query_id, 31);
    }
}
