//! Terminal-side implementation of the Kitty graphics protocol with the
//! Unicode-placeholder extension.
//!
//! The embedding emulator feeds escape-sequence bodies to
//! [`GraphicsEngine::handle_command`], pushes cell geometry via
//! [`GraphicsEngine::set_cell_size`], appends placeholder rectangles
//! while scanning each frame, and flushes them with
//! [`GraphicsEngine::finish_frame`]. Upload chunking, the disk/RAM
//! cache with budgeted eviction, and scaled placement composition all
//! happen behind that surface.

pub mod config;
pub mod decode;
pub mod disk;
pub mod draw;
pub mod engine;
pub mod error;
pub mod image;
pub mod parse;
pub mod scale;
pub mod store;
pub mod upload;

pub use config::GraphicsConfig;
pub use draw::{BlitSurface, ImageRect, RECT_BANK_SIZE};
pub use engine::{CellGrid, CommandResult, GraphicsEngine, PlaceholderSpec};
pub use error::{CommandError, ErrorCode};
pub use image::{Format, Raster, ScaleMode, Status, UploadFailure};
pub use scale::CellSize;
