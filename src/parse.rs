//! Parser for graphics command payloads.
//!
//! A command arrives as the body of an APC escape sequence: a `G` sentinel,
//! `key=value` pairs separated by `,`, then an optional `;` followed by a
//! base64 payload that extends to the end of the buffer.

use log::warn;

use crate::error::CommandError;
use crate::image::Format;

/// Action requested by the `a=` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// `a=t`: transmit image data.
    Transmit,
    /// `a=T`: transmit, then put.
    TransmitAndPut,
    /// `a=p`: create a placement for an existing image.
    Put,
    /// `a=q`: transmit an ephemeral image and report its state.
    Query,
    /// `a=d`: delete placements and/or images.
    Delete,
}

/// Transmission medium requested by the `t=` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Medium {
    /// `t=d`: payload chunks carry the image bytes inline.
    #[default]
    Direct,
    /// `t=f`: payload is a base64-encoded absolute file path.
    File,
    /// `t=t`: as `File`, but the source is deleted afterwards.
    TempFile,
}

/// A parsed graphics command. Field defaults are the protocol defaults;
/// the payload is the raw (still base64) byte slice after the `;`.
#[derive(Debug, Default)]
pub struct GraphicsCommand<'a> {
    pub action: Option<Action>,
    pub quiet: u8,
    pub format: Format,
    /// Raw format code as sent (for error reporting and raw-size math).
    pub format_code: u32,
    pub compression: bool,
    pub medium: Medium,
    pub delete_spec: Option<char>,

    /// Pixel dimensions for raw formats (`s=`, `v=`).
    pub pix_width: u32,
    pub pix_height: u32,

    /// Source rectangle in pixels (`x=`, `y=`, `w=`, `h=`); negatives are
    /// clamped downstream.
    pub rect_x: i64,
    pub rect_y: i64,
    pub rect_w: i64,
    pub rect_h: i64,

    pub image_id: u32,
    pub image_number: u32,
    pub placement_id: u32,

    pub columns: u16,
    pub rows: u16,

    /// True if the `m=` key was present at all.
    pub is_data_transmission: bool,
    /// Value of `m=`: more chunks follow.
    pub more: bool,

    /// Expected total size from `S=`.
    pub expected_size: u64,
    /// `U=` nonzero: the placement is virtual (Unicode placeholders).
    pub virt: bool,
    /// `C=` nonzero: don't move the cursor after a put.
    pub do_not_move_cursor: bool,

    pub payload: &'a [u8],
}

/// Parses a command body. The leading `G` sentinel must be present.
pub fn parse_command(body: &[u8]) -> Result<GraphicsCommand<'_>, CommandError> {
    let Some((&b'G', rest)) = body.split_first() else {
        return Err(CommandError::einval("missing graphics sentinel"));
    };

    let (header, payload) = match rest.iter().position(|&b| b == b';') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (rest, &[][..]),
    };

    let mut cmd = GraphicsCommand {
        payload,
        ..Default::default()
    };

    let header = std::str::from_utf8(header)
        .map_err(|_| CommandError::einval("command header is not valid UTF-8"))?;

    for pair in header.split(',') {
        if pair.is_empty() {
            // A bare trailing comma is tolerated; anything else is not.
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            return Err(CommandError::einval(format!("malformed pair '{pair}'")));
        };
        if value.is_empty() {
            return Err(CommandError::einval(format!("empty value for key '{key}'")));
        }
        apply_pair(&mut cmd, key, value)?;
    }

    Ok(cmd)
}

fn apply_pair(cmd: &mut GraphicsCommand, key: &str, value: &str) -> Result<(), CommandError> {
    match key {
        "a" => {
            cmd.action = Some(match char_value(key, value)? {
                't' => Action::Transmit,
                'T' => Action::TransmitAndPut,
                'p' => Action::Put,
                'q' => Action::Query,
                'd' => Action::Delete,
                other => {
                    return Err(CommandError::einval(format!("unknown action '{other}'")));
                }
            });
        }
        "q" => cmd.quiet = int_value(key, value)?.clamp(0, 2) as u8,
        "f" => {
            let code = u32_value(key, value)?;
            cmd.format = Format::from_code(code)
                .ok_or_else(|| CommandError::einval(format!("unsupported format f={code}")))?;
            cmd.format_code = code;
        }
        "o" => match char_value(key, value)? {
            'z' => cmd.compression = true,
            other => {
                return Err(CommandError::einval(format!(
                    "unsupported compression '{other}'"
                )));
            }
        },
        "t" => {
            cmd.medium = match char_value(key, value)? {
                'd' => Medium::Direct,
                'f' => Medium::File,
                't' => Medium::TempFile,
                other => {
                    return Err(CommandError::einval(format!(
                        "unsupported transmission medium '{other}'"
                    )));
                }
            };
        }
        "d" => cmd.delete_spec = Some(char_value(key, value)?),
        "s" => cmd.pix_width = int_value(key, value)?.max(0) as u32,
        "v" => cmd.pix_height = int_value(key, value)?.max(0) as u32,
        "x" => cmd.rect_x = int_value(key, value)?,
        "y" => cmd.rect_y = int_value(key, value)?,
        "w" => cmd.rect_w = int_value(key, value)?,
        "h" => cmd.rect_h = int_value(key, value)?,
        "i" => cmd.image_id = u32_value(key, value)?,
        "I" => cmd.image_number = u32_value(key, value)?,
        "p" => cmd.placement_id = u32_value(key, value)?,
        "c" => cmd.columns = int_value(key, value)?.clamp(0, u16::MAX as i64) as u16,
        "r" => cmd.rows = int_value(key, value)?.clamp(0, u16::MAX as i64) as u16,
        "m" => {
            cmd.is_data_transmission = true;
            cmd.more = match int_value(key, value)? {
                0 => false,
                1 => true,
                other => {
                    return Err(CommandError::einval(format!("invalid value m={other}")));
                }
            };
        }
        "S" => cmd.expected_size = int_value(key, value)?.max(0) as u64,
        "U" => cmd.virt = int_value(key, value)? != 0,
        "C" => cmd.do_not_move_cursor = int_value(key, value)? != 0,
        "X" | "Y" | "z" => {
            warn!("ignoring unsupported key '{key}={value}'");
        }
        other => {
            return Err(CommandError::einval(format!("unsupported key '{other}'")));
        }
    }
    Ok(())
}

fn char_value(key: &str, value: &str) -> Result<char, CommandError> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(CommandError::einval(format!(
            "value of '{key}' must be a single character, got '{value}'"
        ))),
    }
}

fn int_value(key: &str, value: &str) -> Result<i64, CommandError> {
    value
        .parse::<i64>()
        .map_err(|_| CommandError::einval(format!("cannot parse '{key}={value}' as an integer")))
}

fn u32_value(key: &str, value: &str) -> Result<u32, CommandError> {
    value
        .parse::<u32>()
        .map_err(|_| CommandError::einval(format!("cannot parse '{key}={value}' as an unsigned integer")))
}
