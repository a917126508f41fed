//! The graphics-command engine: dispatches parsed commands, owns the
//! store and the cache directory, and drives per-frame drawing through
//! the rect bank.
//!
//! One command in, one structured [`CommandResult`] out. All state
//! changes a command makes are fully visible to the next one; nothing
//! here yields or blocks.

use log::{debug, info, warn};
use std::io;

use crate::config::GraphicsConfig;
use crate::disk::CacheDir;
use crate::draw::{BlitSurface, ImageRect, RectBank};
use crate::error::CommandError;
use crate::image::{Placement, ScaleMode, Status};
use crate::parse::{self, Action, GraphicsCommand};
use crate::scale::{self, CellSize};
use crate::store::ImageStore;
use crate::upload::{self, TransmitOutcome};

/// Cell-grid services the emulator provides to the engine.
pub trait CellGrid {
    /// Grid size in (columns, rows).
    fn grid_extent(&self) -> (u16, u16);

    /// Clears the cell at `(col, row)` if it references a matching
    /// classic placeholder; an `image_id`/`placement_id` of 0 matches
    /// anything. Returns true if the cell was cleared.
    fn clear_cell(
        &mut self,
        image_id: u32,
        placement_id: u32,
        col: u16,
        row: u16,
        classic: bool,
    ) -> bool;
}

/// Instruction for the emulator to synthesize placeholder glyphs after a
/// successful non-virtual put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderSpec {
    pub image_id: u32,
    pub placement_id: u32,
    pub columns: u16,
    pub rows: u16,
    pub do_not_move_cursor: bool,
}

/// Structured result of one command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Complete response escape sequence, or empty when nothing should
    /// be written back (intermediate chunks, suppressed by quiet).
    pub response: String,
    /// True if the command failed.
    pub error: bool,
    /// Set when the emulator should create placeholder cells.
    pub placeholder: Option<PlaceholderSpec>,
}

/// Correlation headers echoed in a response.
#[derive(Debug, Default, Clone, Copy)]
struct ResponseHeaders {
    image_id: u32,
    image_number: u32,
    placement_id: u32,
}

impl ResponseHeaders {
    fn from_command(cmd: &GraphicsCommand) -> Self {
        Self {
            image_id: cmd.image_id,
            image_number: cmd.image_number,
            placement_id: cmd.placement_id,
        }
    }

    fn render(&self) -> String {
        let mut parts = Vec::new();
        if self.image_id != 0 {
            parts.push(format!("i={}", self.image_id));
        }
        if self.image_number != 0 {
            parts.push(format!("I={}", self.image_number));
        }
        if self.placement_id != 0 {
            parts.push(format!("p={}", self.placement_id));
        }
        parts.join(",")
    }
}

/// The terminal-side graphics subsystem.
#[derive(Debug)]
pub struct GraphicsEngine {
    config: GraphicsConfig,
    cache: CacheDir,
    store: ImageStore,
    bank: RectBank,
    cell_size: Option<CellSize>,
    /// Image id of the direct upload in progress, or 0.
    current_upload: u32,
    /// Monotonic counter of processed commands.
    command_index: u64,
}

impl GraphicsEngine {
    /// Creates the engine and its private cache directory.
    pub fn new(config: GraphicsConfig) -> io::Result<Self> {
        let cache = CacheDir::new(&config.cache_dir_prefix)?;
        Ok(Self {
            config,
            cache,
            store: ImageStore::new(),
            bank: RectBank::new(),
            cell_size: None,
            current_upload: 0,
            command_index: 0,
        })
    }

    /// Records the pixel size of one character cell. Stale scaled
    /// rasters are rebuilt lazily on the next draw.
    pub fn set_cell_size(&mut self, width: u16, height: u16) {
        if width > 0 && height > 0 {
            self.cell_size = Some(CellSize { width, height });
        }
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub fn config(&self) -> &GraphicsConfig {
        &self.config
    }

    pub fn cache_path(&self) -> &std::path::Path {
        self.cache.path()
    }

    /// Processes one escape-sequence body (starting at the `G` sentinel)
    /// and returns the structured result.
    pub fn handle_command(&mut self, body: &[u8], grid: &mut dyn CellGrid) -> CommandResult {
        self.command_index += 1;

        let cmd = match parse::parse_command(body) {
            Ok(cmd) => cmd,
            Err(err) => {
                return self.build_result(ResponseHeaders::default(), Err(err), 0, None);
            }
        };

        let result = self.dispatch(&cmd, grid);
        self.store.check_limits(&self.config, &self.cache);
        result
    }

    fn dispatch(&mut self, cmd: &GraphicsCommand, grid: &mut dyn CellGrid) -> CommandResult {
        match cmd.action {
            Some(Action::Transmit) => self.run_transmit(cmd, false),
            Some(Action::Query) => self.run_transmit(cmd, true),
            Some(Action::TransmitAndPut) => self.run_transmit_and_put(cmd),
            Some(Action::Put) => self.run_put(cmd),
            Some(Action::Delete) => self.run_delete(cmd, grid),
            None if cmd.is_data_transmission => self.run_transmit(cmd, false),
            None => self.build_result(
                ResponseHeaders::from_command(cmd),
                Err(CommandError::einval("no action and no data to append")),
                cmd.quiet,
                None,
            ),
        }
    }

    fn run_transmit(&mut self, cmd: &GraphicsCommand, ephemeral: bool) -> CommandResult {
        let outcome = upload::handle_transmit(
            &mut self.store,
            &self.cache,
            &self.config,
            &mut self.current_upload,
            self.command_index,
            cmd,
            ephemeral,
        );
        let result = self.transmit_result(cmd, &outcome);

        // Queries are answered and forgotten. A chunked query ends on a
        // bare continuation chunk, so the image's own query mark decides,
        // not this command's action.
        let is_query_image = ephemeral
            || self
                .store
                .find_image(outcome.image_id)
                .is_some_and(|i| i.query_id != 0);
        if is_query_image && outcome.respond && outcome.image_id != 0 {
            self.store.delete_image(outcome.image_id, &self.cache);
            self.forget_upload(outcome.image_id);
        }
        result
    }

    fn run_transmit_and_put(&mut self, cmd: &GraphicsCommand) -> CommandResult {
        let outcome = upload::handle_transmit(
            &mut self.store,
            &self.cache,
            &self.config,
            &mut self.current_upload,
            self.command_index,
            cmd,
            false,
        );

        // The put half runs on the command that started the transmission,
        // never on continuation chunks.
        if outcome.continuation {
            return self.transmit_result(cmd, &outcome);
        }
        if let Some(image) = self.store.find_image_mut(outcome.image_id) {
            image.initial_placement_id = cmd.placement_id;
        }
        if outcome.result.is_err() {
            return self.transmit_result(cmd, &outcome);
        }

        let placeholder = match self.create_placement(cmd, outcome.image_id) {
            Ok(placeholder) => placeholder,
            Err(err) => {
                let headers = self.transmit_headers(cmd, &outcome);
                let quiet = self.effective_quiet(cmd, outcome.image_id);
                return self.build_result(headers, Err(err), quiet, None);
            }
        };

        let headers = self.transmit_headers(cmd, &outcome);
        let quiet = self.effective_quiet(cmd, outcome.image_id);
        if outcome.respond {
            self.build_result(headers, Ok(()), quiet, placeholder)
        } else {
            CommandResult {
                placeholder,
                ..Default::default()
            }
        }
    }

    fn run_put(&mut self, cmd: &GraphicsCommand) -> CommandResult {
        let image_id = match self.resolve_image(cmd) {
            Ok(id) => id,
            Err(err) => {
                return self.build_result(
                    ResponseHeaders::from_command(cmd),
                    Err(err),
                    cmd.quiet,
                    None,
                );
            }
        };

        let quiet = self.effective_quiet(cmd, image_id);
        match self.create_placement(cmd, image_id) {
            Ok(placeholder) => {
                self.build_result(ResponseHeaders::from_command(cmd), Ok(()), quiet, placeholder)
            }
            Err(err) => {
                self.build_result(ResponseHeaders::from_command(cmd), Err(err), quiet, None)
            }
        }
    }

    /// Creates or replaces a placement on the image and returns the
    /// placeholder record if one should be synthesized.
    fn create_placement(
        &mut self,
        cmd: &GraphicsCommand,
        image_id: u32,
    ) -> Result<Option<PlaceholderSpec>, CommandError> {
        let Some(image) = self.store.find_image(image_id) else {
            return Err(CommandError::enoent(format!(
                "image with id={image_id} not found"
            )));
        };

        let scale_mode = if cmd.virt {
            ScaleMode::Contain
        } else if cmd.columns != 0 || cmd.rows != 0 {
            ScaleMode::Fill
        } else {
            ScaleMode::None
        };

        let placement_id = if cmd.placement_id == 0 {
            ImageStore::generate_placement_id(image)
        } else {
            cmd.placement_id
        };

        let src_x = cmd.rect_x.clamp(0, u32::MAX as i64) as u32;
        let src_y = cmd.rect_y.clamp(0, u32::MAX as i64) as u32;
        let src_w = cmd.rect_w.clamp(0, u32::MAX as i64) as u32;
        let src_h = cmd.rect_h.clamp(0, u32::MAX as i64) as u32;

        // Fill in missing cell dimensions now if the image and cell
        // geometry are already known, so the placeholder record and
        // later draws agree.
        let (mut cols, mut rows) = (cmd.columns, cmd.rows);
        if (cols == 0 || rows == 0) && image.pix_width != 0 && image.pix_height != 0 {
            if let Some(cell) = self.cell_size {
                let src = scale::clamp_source_rect(
                    src_x,
                    src_y,
                    src_w,
                    src_h,
                    image.pix_width,
                    image.pix_height,
                );
                (cols, rows) = scale::infer_cols_rows(cols, rows, src, cell, scale_mode);
            }
        }

        let loaded = image.status == Status::RamLoadOk;
        let atime = self.store.next_atime();
        let placement = Placement {
            placement_id,
            image_id,
            atime,
            protected: false,
            virt: cmd.virt,
            scale_mode,
            do_not_move_cursor: cmd.do_not_move_cursor,
            cols,
            rows,
            src_pix_x: src_x,
            src_pix_y: src_y,
            src_pix_width: src_w,
            src_pix_height: src_h,
            scaled: None,
            scaled_cw: 0,
            scaled_ch: 0,
        };
        self.store.insert_placement(image_id, placement);
        self.store.touch_placement(image_id, placement_id);
        debug!("placement {image_id}/{placement_id}: {cols}x{rows} cells, {scale_mode:?}");

        if !cmd.virt && loaded {
            Ok(Some(PlaceholderSpec {
                image_id,
                placement_id,
                columns: cols,
                rows,
                do_not_move_cursor: cmd.do_not_move_cursor,
            }))
        } else {
            Ok(None)
        }
    }

    /// Finds the put/delete target by id, falling back to the newest
    /// image with the given number.
    fn resolve_image(&self, cmd: &GraphicsCommand) -> Result<u32, CommandError> {
        if cmd.image_id != 0 {
            if self.store.find_image(cmd.image_id).is_some() {
                return Ok(cmd.image_id);
            }
            return Err(CommandError::enoent(format!(
                "image with id={} not found",
                cmd.image_id
            )));
        }
        if cmd.image_number != 0 {
            return self
                .store
                .find_image_by_number(cmd.image_number)
                .map(|i| i.image_id)
                .ok_or_else(|| {
                    CommandError::enoent(format!(
                        "image with number={} not found",
                        cmd.image_number
                    ))
                });
        }
        Err(CommandError::enoent("no image id or number given"))
    }

    fn run_delete(&mut self, cmd: &GraphicsCommand, grid: &mut dyn CellGrid) -> CommandResult {
        let spec = cmd.delete_spec.unwrap_or('a');
        let delete_image = spec.is_ascii_uppercase();
        let result = match spec.to_ascii_lowercase() {
            'a' => {
                self.delete_all_visible(grid, delete_image);
                Ok(())
            }
            'i' | 'n' => {
                let target = if spec.to_ascii_lowercase() == 'n' {
                    self.store
                        .find_image_by_number(cmd.image_number)
                        .map(|i| i.image_id)
                        .ok_or_else(|| {
                            CommandError::enoent(format!(
                                "image with number={} not found",
                                cmd.image_number
                            ))
                        })
                } else if self.store.find_image(cmd.image_id).is_some() {
                    Ok(cmd.image_id)
                } else {
                    Err(CommandError::enoent(format!(
                        "image with id={} not found",
                        cmd.image_id
                    )))
                };
                target.map(|id| {
                    self.delete_image_placements(grid, id, cmd.placement_id, delete_image);
                })
            }
            other => {
                warn!("ignoring unknown delete specifier '{other}'");
                Ok(())
            }
        };

        let quiet = self.effective_quiet(cmd, cmd.image_id);
        self.build_result(ResponseHeaders::from_command(cmd), result, quiet, None)
    }

    /// `d=a`: clear every classic placeholder cell, then drop all
    /// non-virtual placements; the uppercase form also drops images left
    /// without placements.
    fn delete_all_visible(&mut self, grid: &mut dyn CellGrid, delete_images: bool) {
        let (cols, rows) = grid.grid_extent();
        for row in 0..rows {
            for col in 0..cols {
                grid.clear_cell(0, 0, col, row, true);
            }
        }

        let victims: Vec<(u32, u32)> = self
            .store
            .images()
            .flat_map(|i| {
                i.placements
                    .values()
                    .filter(|p| !p.virt)
                    .map(|p| (p.image_id, p.placement_id))
            })
            .collect();
        for (image_id, placement_id) in victims {
            self.store.delete_placement(image_id, placement_id);
        }

        if delete_images {
            let empty: Vec<u32> = self
                .store
                .images()
                .filter(|i| i.placements.is_empty())
                .map(|i| i.image_id)
                .collect();
            for image_id in empty {
                self.store.delete_image(image_id, &self.cache);
                self.forget_upload(image_id);
            }
        }
    }

    /// `d=i` / `d=n` (and uppercase): unlink placements of one image.
    fn delete_image_placements(
        &mut self,
        grid: &mut dyn CellGrid,
        image_id: u32,
        placement_id: u32,
        delete_image: bool,
    ) {
        let (cols, rows) = grid.grid_extent();
        for row in 0..rows {
            for col in 0..cols {
                grid.clear_cell(image_id, placement_id, col, row, true);
            }
        }

        if placement_id != 0 {
            self.store.delete_placement(image_id, placement_id);
            let now_empty = self
                .store
                .find_image(image_id)
                .is_some_and(|i| i.placements.is_empty());
            if delete_image && now_empty {
                self.store.delete_image(image_id, &self.cache);
                self.forget_upload(image_id);
            }
            return;
        }

        if delete_image {
            // The uppercase form without a placement removes the image
            // outright, virtual placements included.
            self.store.delete_image(image_id, &self.cache);
            self.forget_upload(image_id);
            return;
        }

        // Lowercase deletion unlinks classic placements only; virtual
        // ones stay until the uppercase form removes the whole image.
        let victims: Vec<u32> = self
            .store
            .find_image(image_id)
            .map(|i| {
                i.placements
                    .values()
                    .filter(|p| !p.virt)
                    .map(|p| p.placement_id)
                    .collect()
            })
            .unwrap_or_default();
        for pid in victims {
            self.store.delete_placement(image_id, pid);
        }
    }

    fn forget_upload(&mut self, image_id: u32) {
        if self.current_upload == image_id {
            self.current_upload = 0;
        }
    }

    // --- frame drawing ---

    /// Appends a rectangle of placeholder cells for this frame. A rect
    /// evicted under bank pressure is drawn immediately.
    pub fn append_rect(&mut self, rect: ImageRect, surface: &mut dyn BlitSurface) {
        if let Some(evicted) = self.bank.append(rect) {
            self.draw_rect(&evicted, surface);
        }
    }

    /// Draws and clears every pending rectangle. Call at end of frame.
    pub fn finish_frame(&mut self, surface: &mut dyn BlitSurface) {
        for rect in self.bank.drain() {
            self.draw_rect(&rect, surface);
        }
    }

    fn draw_rect(&mut self, rect: &ImageRect, surface: &mut dyn BlitSurface) {
        let cell = CellSize {
            width: rect.cell_w,
            height: rect.cell_h,
        };
        // Resolve a zero placement id to the image's default once, so
        // every later lookup names the same placement.
        let (placement_id, ready) = match self
            .store
            .find_placement(rect.image_id, rect.placement_id)
        {
            Some(p) => (p.placement_id, p.scaled_fits_cell(cell.width, cell.height)),
            None => {
                debug!(
                    "draw: placement {}/{} is gone",
                    rect.image_id, rect.placement_id
                );
                return;
            }
        };
        self.store.touch_placement(rect.image_id, placement_id);
        if !ready && !self.load_placement(rect.image_id, placement_id, cell) {
            return;
        }

        let Some(placement) = self.store.find_placement(rect.image_id, placement_id) else {
            return;
        };
        let Some(raster) = placement.scaled.as_ref() else {
            return;
        };
        surface.blit(
            raster,
            rect.start_col as u32 * cell.width as u32,
            rect.start_row as u32 * cell.height as u32,
            (rect.end_col - rect.start_col) as u32 * cell.width as u32,
            (rect.end_row - rect.start_row) as u32 * cell.height as u32,
            rect.x_pix,
            rect.y_pix,
            rect.reverse,
        );
    }

    /// Builds (or rebuilds) the scaled raster of a placement for the
    /// given cell size. Returns false if the placement cannot be drawn.
    fn load_placement(&mut self, image_id: u32, placement_id: u32, cell: CellSize) -> bool {
        // The original raster must be in RAM first.
        let needs_original = self
            .store
            .find_image(image_id)
            .is_some_and(|i| i.original.is_none());
        if needs_original {
            if let Err(err) = upload::load_into_ram(&mut self.store, &self.cache, image_id) {
                debug!("draw: cannot load image {image_id}: {err}");
                return false;
            }
        }

        let Some(image) = self.store.find_image(image_id) else {
            return false;
        };
        let (pix_w, pix_h) = (image.pix_width, image.pix_height);
        let Some(original) = image.original.as_ref() else {
            return false;
        };
        let Some(placement) = image.placements.get(&placement_id) else {
            return false;
        };

        let src = scale::clamp_source_rect(
            placement.src_pix_x,
            placement.src_pix_y,
            placement.src_pix_width,
            placement.src_pix_height,
            pix_w,
            pix_h,
        );
        let (cols, rows) = scale::infer_cols_rows(
            placement.cols,
            placement.rows,
            src,
            cell,
            placement.scale_mode,
        );
        let scale_mode = placement.scale_mode;

        let scaled = match scale::compose_scaled(
            original,
            src,
            cols,
            rows,
            cell,
            scale_mode,
            self.config.max_image_ram_size,
        ) {
            Ok(raster) => raster,
            Err(err) => {
                debug!("draw: cannot scale placement {image_id}/{placement_id}: {err}");
                if let Some(image) = self.store.find_image_mut(image_id) {
                    image.status = Status::RamLoadErr;
                }
                return false;
            }
        };

        if let Some(placement) = self.store.find_placement_mut(image_id, placement_id) {
            placement.cols = cols;
            placement.rows = rows;
            placement.protected = true;
        }
        self.store
            .set_scaled(image_id, placement_id, Some(scaled), cell.width, cell.height);
        // The fresh raster may push RAM over budget; the protected flag
        // keeps it from being chosen by this very cleanup.
        self.store.check_limits(&self.config, &self.cache);
        if let Some(placement) = self.store.find_placement_mut(image_id, placement_id) {
            placement.protected = false;
        }
        true
    }

    // --- responses ---

    fn transmit_headers(&self, cmd: &GraphicsCommand, outcome: &TransmitOutcome) -> ResponseHeaders {
        let image_id = match self.store.find_image(outcome.image_id) {
            Some(image) if image.query_id != 0 => image.query_id,
            Some(image) => image.image_id,
            None if outcome.image_id != 0 => outcome.image_id,
            None => cmd.image_id,
        };
        ResponseHeaders {
            image_id,
            image_number: cmd.image_number,
            placement_id: cmd.placement_id,
        }
    }

    fn transmit_result(&mut self, cmd: &GraphicsCommand, outcome: &TransmitOutcome) -> CommandResult {
        if !outcome.respond {
            return CommandResult::default();
        }
        let headers = self.transmit_headers(cmd, outcome);
        let quiet = self.effective_quiet(cmd, outcome.image_id);
        self.build_result(headers, outcome.result.clone(), quiet, None)
    }

    fn effective_quiet(&self, cmd: &GraphicsCommand, image_id: u32) -> u8 {
        let image_quiet = self
            .store
            .find_image(image_id)
            .map(|i| i.quiet)
            .unwrap_or(0);
        cmd.quiet.max(image_quiet)
    }

    fn build_result(
        &self,
        headers: ResponseHeaders,
        result: Result<(), CommandError>,
        quiet: u8,
        placeholder: Option<PlaceholderSpec>,
    ) -> CommandResult {
        let (message, error) = match &result {
            Ok(()) => ("OK".to_string(), false),
            Err(err) => (err.to_string(), true),
        };

        let suppressed = (quiet >= 1 && !error) || (quiet >= 2 && error);
        if suppressed && error {
            // The client asked for silence; the emulator's log still sees it.
            info!("suppressed graphics error: {message}");
        }

        let response = if suppressed {
            String::new()
        } else {
            format!("\x1b_G{};{message}\x1b\\", headers.render())
        };
        CommandResult {
            response,
            error,
            placeholder,
        }
    }

    /// Deletes every image and placement and re-creates the cache
    /// directory. Used on terminal hard reset.
    pub fn reset(&mut self) -> io::Result<()> {
        self.store.clear(&self.cache);
        self.bank = RectBank::new();
        self.current_upload = 0;
        self.cache.ensure()
    }

    /// Logs the full engine state for interactive debugging.
    pub fn dump_state(&self) {
        info!(
            "graphics engine: command_index={} current_upload={} cell={:?} pending_rects={}",
            self.command_index,
            self.current_upload,
            self.cell_size,
            self.bank.len()
        );
        self.store.dump_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Raster;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;

    /// Grid stub: grid extent plus a log of cleared cells.
    struct TestGrid {
        cols: u16,
        rows: u16,
        cleared: Vec<(u32, u32, u16, u16)>,
    }

    impl TestGrid {
        fn new() -> Self {
            Self {
                cols: 10,
                rows: 5,
                cleared: Vec::new(),
            }
        }
    }

    impl CellGrid for TestGrid {
        fn grid_extent(&self) -> (u16, u16) {
            (self.cols, self.rows)
        }

        fn clear_cell(
            &mut self,
            image_id: u32,
            placement_id: u32,
            col: u16,
            row: u16,
            _classic: bool,
        ) -> bool {
            self.cleared.push((image_id, placement_id, col, row));
            false
        }
    }

    /// Blit stub recording every call.
    #[derive(Default)]
    struct TestSurface {
        blits: Vec<(u32, u32, u32, u32, i32, i32, bool)>,
    }

    impl BlitSurface for TestSurface {
        fn blit(
            &mut self,
            _raster: &Raster,
            src_x: u32,
            src_y: u32,
            width: u32,
            height: u32,
            dst_x: i32,
            dst_y: i32,
            reverse: bool,
        ) {
            self.blits.push((src_x, src_y, width, height, dst_x, dst_y, reverse));
        }
    }

    fn engine() -> GraphicsEngine {
        let config = GraphicsConfig {
            cache_dir_prefix: "kittygfx-engine-test".to_string(),
            ..Default::default()
        };
        let mut engine = GraphicsEngine::new(config).unwrap();
        engine.set_cell_size(10, 20);
        engine
    }

    fn rgba_upload_body(id: u32, action: char, w: u32, h: u32, extra: &str) -> String {
        let pixels = vec![128u8; (w * h * 4) as usize];
        format!(
            "Gi={id},a={action},f=32,t=d,s={w},v={h}{extra};{}",
            BASE64.encode(&pixels)
        )
    }

    #[test]
    fn transmit_then_put_produces_placeholder() {
        let mut engine = engine();
        let mut grid = TestGrid::new();

        let result = engine.handle_command(rgba_upload_body(5, 't', 20, 40, "").as_bytes(), &mut grid);
        assert_eq!(result.response, "\x1b_Gi=5;OK\x1b\\");
        assert!(!result.error);

        let result = engine.handle_command(b"Ga=p,i=5,p=3,c=4,r=2", &mut grid);
        assert_eq!(result.response, "\x1b_Gi=5,p=3;OK\x1b\\");
        let placeholder = result.placeholder.unwrap();
        assert_eq!(placeholder.image_id, 5);
        assert_eq!(placeholder.placement_id, 3);
        assert_eq!((placeholder.columns, placeholder.rows), (4, 2));
    }

    #[test]
    fn put_infers_cols_rows_from_pixels() {
        let mut engine = engine();
        let mut grid = TestGrid::new();

        // 20x40 pixels at 10x20 cells: 2 cols, 2 rows.
        engine.handle_command(rgba_upload_body(5, 't', 20, 40, "").as_bytes(), &mut grid);
        let result = engine.handle_command(b"Ga=p,i=5,p=3", &mut grid);
        let placeholder = result.placeholder.unwrap();
        assert_eq!((placeholder.columns, placeholder.rows), (2, 2));

        let placement = engine.store().find_placement(5, 3).unwrap();
        assert_eq!(placement.scale_mode, ScaleMode::None);
        assert_eq!((placement.cols, placement.rows), (2, 2));
    }

    #[test]
    fn put_on_missing_image_is_enoent() {
        let mut engine = engine();
        let mut grid = TestGrid::new();
        let result = engine.handle_command(b"Ga=p,i=404", &mut grid);
        assert!(result.error);
        assert_eq!(
            result.response,
            "\x1b_Gi=404;ENOENT: image with id=404 not found\x1b\\"
        );
    }

    #[test]
    fn virtual_put_uses_contain_and_no_placeholder() {
        let mut engine = engine();
        let mut grid = TestGrid::new();

        engine.handle_command(rgba_upload_body(5, 't', 20, 40, "").as_bytes(), &mut grid);
        let result = engine.handle_command(b"Ga=p,i=5,p=3,c=4,r=2,U=1", &mut grid);
        assert!(!result.error);
        assert!(result.placeholder.is_none());

        let placement = engine.store().find_placement(5, 3).unwrap();
        assert!(placement.virt);
        assert_eq!(placement.scale_mode, ScaleMode::Contain);
    }

    #[test]
    fn transmit_and_put_in_one_command() {
        let mut engine = engine();
        let mut grid = TestGrid::new();

        let result = engine.handle_command(
            rgba_upload_body(6, 'T', 20, 20, ",c=4,r=2,p=9").as_bytes(),
            &mut grid,
        );
        assert_eq!(result.response, "\x1b_Gi=6,p=9;OK\x1b\\");
        let placeholder = result.placeholder.unwrap();
        assert_eq!((placeholder.columns, placeholder.rows), (4, 2));

        let image = engine.store().find_image(6).unwrap();
        assert_eq!(image.initial_placement_id, 9);
        assert_eq!(image.status, Status::RamLoadOk);
    }

    #[test]
    fn chunked_transmit_and_put_skips_put_on_continuation() {
        let mut engine = engine();
        let mut grid = TestGrid::new();

        let pixels = vec![1u8; 16];
        let encoded = BASE64.encode(&pixels);
        let (head, tail) = encoded.split_at(8);

        let first = engine.handle_command(
            format!("Gi=6,a=T,f=32,t=d,s=2,v=2,c=1,r=1,m=1;{head}").as_bytes(),
            &mut grid,
        );
        assert!(first.response.is_empty());
        assert!(first.placeholder.is_none(), "image not loaded yet");
        assert_eq!(engine.store().placement_count(), 1, "placement exists early");

        let last = engine.handle_command(format!("Gm=0;{tail}").as_bytes(), &mut grid);
        assert_eq!(last.response, "\x1b_Gi=6;OK\x1b\\");
        assert!(last.placeholder.is_none(), "continuation never re-puts");
        assert_eq!(engine.store().placement_count(), 1);
    }

    #[test]
    fn query_discards_the_image() {
        let mut engine = engine();
        let mut grid = TestGrid::new();

        let result = engine.handle_command(rgba_upload_body(31, 'q', 1, 1, "").as_bytes(), &mut grid);
        assert_eq!(result.response, "\x1b_Gi=31;OK\x1b\\");
        assert_eq!(engine.store().image_count(), 0, "query image is ephemeral");
    }

    #[test]
    fn quiet_suppresses_responses() {
        let mut engine = engine();
        let mut grid = TestGrid::new();

        let result = engine.handle_command(rgba_upload_body(5, 't', 2, 2, ",q=1").as_bytes(), &mut grid);
        assert!(result.response.is_empty(), "q=1 hides OK");

        let result = engine.handle_command(b"Ga=p,i=404,q=1", &mut grid);
        assert!(result.error);
        assert!(!result.response.is_empty(), "q=1 keeps errors");

        let result = engine.handle_command(b"Ga=p,i=404,q=2", &mut grid);
        assert!(result.error);
        assert!(result.response.is_empty(), "q=2 hides errors too");
    }

    #[test]
    fn delete_uppercase_removes_image_and_file() {
        let mut engine = engine();
        let mut grid = TestGrid::new();

        engine.handle_command(rgba_upload_body(5, 't', 2, 2, "").as_bytes(), &mut grid);
        engine.handle_command(b"Ga=p,i=5,p=3", &mut grid);
        assert!(engine.store().disk_bytes() > 0);

        let result = engine.handle_command(b"Ga=d,d=I,i=5", &mut grid);
        assert!(!result.error);
        assert_eq!(engine.store().image_count(), 0);
        assert_eq!(engine.store().placement_count(), 0);
        assert_eq!(engine.store().disk_bytes(), 0);
        assert!(!grid.cleared.is_empty(), "cells were visited");
    }

    #[test]
    fn delete_lowercase_keeps_the_image() {
        let mut engine = engine();
        let mut grid = TestGrid::new();

        engine.handle_command(rgba_upload_body(5, 't', 2, 2, "").as_bytes(), &mut grid);
        engine.handle_command(b"Ga=p,i=5,p=3", &mut grid);

        let result = engine.handle_command(b"Ga=d,d=i,i=5", &mut grid);
        assert!(!result.error);
        assert_eq!(engine.store().image_count(), 1);
        assert_eq!(engine.store().placement_count(), 0);
    }

    #[test]
    fn delete_lowercase_by_id_spares_virtual_placements() {
        let mut engine = engine();
        let mut grid = TestGrid::new();

        engine.handle_command(rgba_upload_body(5, 't', 2, 2, "").as_bytes(), &mut grid);
        engine.handle_command(b"Ga=p,i=5,p=3", &mut grid);
        engine.handle_command(b"Ga=p,i=5,p=4,U=1,c=1,r=1", &mut grid);

        let result = engine.handle_command(b"Ga=d,d=i,i=5", &mut grid);
        assert!(!result.error);
        assert!(engine.store().find_placement(5, 3).is_none());
        assert!(
            engine.store().find_placement(5, 4).is_some(),
            "virtual survives lowercase d=i"
        );
        assert!(engine.store().find_image(5).is_some());

        // The uppercase form is the one way to remove an image whose
        // remaining placements are all virtual.
        let result = engine.handle_command(b"Ga=d,d=I,i=5", &mut grid);
        assert!(!result.error);
        assert!(engine.store().find_image(5).is_none());
        assert_eq!(engine.store().placement_count(), 0);
    }

    #[test]
    fn delete_all_spares_virtual_placements() {
        let mut engine = engine();
        let mut grid = TestGrid::new();

        engine.handle_command(rgba_upload_body(5, 't', 2, 2, "").as_bytes(), &mut grid);
        engine.handle_command(b"Ga=p,i=5,p=3", &mut grid);
        engine.handle_command(b"Ga=p,i=5,p=4,U=1,c=1,r=1", &mut grid);

        engine.handle_command(b"Ga=d,d=a", &mut grid);
        assert!(engine.store().find_placement(5, 3).is_none());
        assert!(engine.store().find_placement(5, 4).is_some(), "virtual survives d=a");
    }

    #[test]
    fn delete_by_number_targets_newest() {
        let mut engine = engine();
        let mut grid = TestGrid::new();

        engine.handle_command(rgba_upload_body(5, 't', 2, 2, ",I=9").as_bytes(), &mut grid);
        engine.handle_command(rgba_upload_body(6, 't', 2, 2, ",I=9").as_bytes(), &mut grid);

        let result = engine.handle_command(b"Ga=d,d=N,I=9", &mut grid);
        assert!(!result.error);
        assert!(engine.store().find_image(6).is_none(), "newest deleted");
        assert!(engine.store().find_image(5).is_some());
    }

    #[test]
    fn unknown_delete_specifier_is_ignored() {
        let mut engine = engine();
        let mut grid = TestGrid::new();
        let result = engine.handle_command(b"Ga=d,d=x", &mut grid);
        assert!(!result.error);
    }

    #[test]
    fn draw_composes_and_blits() {
        let mut engine = engine();
        let mut grid = TestGrid::new();
        let mut surface = TestSurface::default();

        engine.handle_command(rgba_upload_body(5, 't', 20, 40, "").as_bytes(), &mut grid);
        engine.handle_command(b"Ga=p,i=5,p=3,c=2,r=2", &mut grid);

        engine.append_rect(
            ImageRect {
                image_id: 5,
                placement_id: 3,
                start_col: 0,
                end_col: 2,
                start_row: 0,
                end_row: 1,
                x_pix: 100,
                y_pix: 200,
                cell_w: 10,
                cell_h: 20,
                reverse: false,
            },
            &mut surface,
        );
        assert!(surface.blits.is_empty(), "nothing drawn before flush");

        engine.finish_frame(&mut surface);
        assert_eq!(surface.blits.len(), 1);
        assert_eq!(surface.blits[0], (0, 0, 20, 20, 100, 200, false));

        let placement = engine.store().find_placement(5, 3).unwrap();
        let raster = placement.scaled.as_ref().unwrap();
        assert_eq!((raster.width(), raster.height()), (20, 40));
        assert!(!placement.protected, "protection is transient");
    }

    #[test]
    fn cell_size_change_rebuilds_scaled_raster() {
        let mut engine = engine();
        let mut grid = TestGrid::new();
        let mut surface = TestSurface::default();

        engine.handle_command(rgba_upload_body(5, 't', 20, 40, "").as_bytes(), &mut grid);
        engine.handle_command(b"Ga=p,i=5,p=3,c=2,r=2", &mut grid);

        let rect = ImageRect {
            image_id: 5,
            placement_id: 3,
            start_col: 0,
            end_col: 2,
            start_row: 0,
            end_row: 2,
            x_pix: 0,
            y_pix: 0,
            cell_w: 10,
            cell_h: 20,
            reverse: false,
        };
        engine.append_rect(rect, &mut surface);
        engine.finish_frame(&mut surface);
        assert_eq!(
            engine
                .store()
                .find_placement(5, 3)
                .unwrap()
                .scaled
                .as_ref()
                .map(|r| (r.width(), r.height())),
            Some((20, 40))
        );

        // Font change: same placement, bigger cells.
        let rect = ImageRect {
            cell_w: 12,
            cell_h: 24,
            ..rect
        };
        engine.append_rect(rect, &mut surface);
        engine.finish_frame(&mut surface);
        assert_eq!(
            engine
                .store()
                .find_placement(5, 3)
                .unwrap()
                .scaled
                .as_ref()
                .map(|r| (r.width(), r.height())),
            Some((24, 48))
        );
    }

    #[test]
    fn parse_error_is_reported_unsuppressed() {
        let mut engine = engine();
        let mut grid = TestGrid::new();
        let result = engine.handle_command(b"Ga=t,f=7;", &mut grid);
        assert!(result.error);
        assert!(result.response.contains("EINVAL"));
    }

    #[test]
    fn reset_clears_everything() {
        let mut engine = engine();
        let mut grid = TestGrid::new();

        engine.handle_command(rgba_upload_body(5, 't', 2, 2, "").as_bytes(), &mut grid);
        engine.reset().unwrap();
        assert_eq!(engine.store().image_count(), 0);
        assert_eq!(engine.store().disk_bytes(), 0);
        assert!(engine.cache_path().is_dir());
    }
}
