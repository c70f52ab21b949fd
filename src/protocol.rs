//! Line protocol parsing and reply formatting.
//!
//! One command per newline-terminated ASCII line:
//!
//! ```text
//! PX x y            -> PX x y RRGGBBAA
//! PX x y RRGGBB     opaque write, no reply
//! PX x y RRGGBBAA   alpha-blended write, no reply
//! SIZE              -> SIZE width height
//! QUIT              closes the connection
//! GODMODE on|off    switches this connection's rate budget
//! HELP              -> free-text help (via the COMMAND-HELP hook)
//! <VERB> args...    dispatched to the COMMAND-<VERB> hook
//! ```
//!
//! The parser only tokenizes and validates the arguments of built-in verbs.
//! Whether an unknown verb means anything is decided by the hook table.

use crate::framebuffer::Rgba;

/// Help text sent by the default `COMMAND-HELP` hook.
pub const HELP_TEXT: &str = "\
PX x y: Get color at position (x,y)
PX x y rrggbb(aa): Draw a pixel (with optional alpha channel)
SIZE: Get canvas size
GODMODE on|off: Raise or restore your rate limit
QUIT: Close the connection
HELP: Show this text";

/// A parsed protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Query a pixel.
    PxGet {
        /// X coordinate.
        x: i64,
        /// Y coordinate.
        y: i64,
    },
    /// Write a pixel.
    PxSet {
        /// X coordinate.
        x: i64,
        /// Y coordinate.
        y: i64,
        /// Color; alpha is 255 for 6-digit input.
        color: Rgba,
    },
    /// Ask for the canvas dimensions.
    Size,
    /// Close the connection.
    Quit,
    /// Toggle the elevated rate budget.
    GodMode(bool),
    /// Any other verb, forwarded to `COMMAND-<verb>`.
    Other {
        /// Upper-cased verb.
        verb: String,
        /// Raw argument tokens.
        args: Vec<String>,
    },
}

/// Why a line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Line was empty or whitespace only.
    Empty,
    /// A required argument is absent.
    MissingArgument(&'static str),
    /// A coordinate is not a decimal integer.
    InvalidCoordinate(String),
    /// Color is not 6 or 8 hex digits.
    InvalidColor(String),
    /// Argument of `GODMODE` is neither `on` nor `off`.
    InvalidToggle(String),
    /// More arguments than the verb accepts.
    TooManyArguments(&'static str),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty line"),
            Self::MissingArgument(what) => write!(f, "missing argument: {what}"),
            Self::InvalidCoordinate(tok) => write!(f, "invalid coordinate (should be decimal): {tok}"),
            Self::InvalidColor(tok) => write!(f, "invalid color (should be RRGGBB or RRGGBBAA): {tok}"),
            Self::InvalidToggle(tok) => write!(f, "expected 'on' or 'off', got: {tok}"),
            Self::TooManyArguments(verb) => write!(f, "too many arguments for {verb}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse one protocol line (without the trailing newline).
pub fn parse_line(line: &str) -> Result<Command, ParseError> {
    let mut tokens = line.split_whitespace();
    let verb = tokens.next().ok_or(ParseError::Empty)?.to_ascii_uppercase();
    let args: Vec<&str> = tokens.collect();

    match verb.as_str() {
        "PX" => parse_px(&args),
        "SIZE" => Ok(Command::Size),
        "QUIT" => Ok(Command::Quit),
        "GODMODE" => match args.as_slice() {
            [] => Err(ParseError::MissingArgument("on|off")),
            [toggle] if toggle.eq_ignore_ascii_case("on") => Ok(Command::GodMode(true)),
            [toggle] if toggle.eq_ignore_ascii_case("off") => Ok(Command::GodMode(false)),
            [toggle] => Err(ParseError::InvalidToggle((*toggle).to_string())),
            _ => Err(ParseError::TooManyArguments("GODMODE")),
        },
        _ => Ok(Command::Other {
            verb,
            args: args.into_iter().map(str::to_string).collect(),
        }),
    }
}

fn parse_px(args: &[&str]) -> Result<Command, ParseError> {
    let x = parse_coordinate(args.first().copied(), "x")?;
    let y = parse_coordinate(args.get(1).copied(), "y")?;
    match args.get(2..).unwrap_or_default() {
        [] => Ok(Command::PxGet { x, y }),
        [color] => Ok(Command::PxSet {
            x,
            y,
            color: parse_color(color)?,
        }),
        _ => Err(ParseError::TooManyArguments("PX")),
    }
}

fn parse_coordinate(token: Option<&str>, name: &'static str) -> Result<i64, ParseError> {
    let token = token.ok_or(ParseError::MissingArgument(name))?;
    token
        .parse::<i64>()
        .map_err(|_| ParseError::InvalidCoordinate(token.to_string()))
}

/// Parse `RRGGBB` (alpha 255) or `RRGGBBAA`.
pub fn parse_color(token: &str) -> Result<Rgba, ParseError> {
    let invalid = || ParseError::InvalidColor(token.to_string());
    if !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let value = u32::from_str_radix(token, 16).map_err(|_| invalid())?;
    let [b0, b1, b2, b3] = value.to_be_bytes();
    match token.len() {
        6 => Ok(Rgba::opaque(b1, b2, b3)),
        8 => Ok(Rgba::new(b0, b1, b2, b3)),
        _ => Err(invalid()),
    }
}

/// Reply to a pixel query.
pub fn format_pixel(x: i64, y: i64, color: Rgba) -> String {
    format!("PX {x} {y} {color}")
}

/// Reply to `SIZE`.
pub fn format_size(width: u32, height: u32) -> String {
    format!("SIZE {width} {height}")
}

/// Error reply line.
pub fn format_error(msg: impl std::fmt::Display) -> String {
    format!("ERROR: {msg}")
}
