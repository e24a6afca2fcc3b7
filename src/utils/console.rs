//! Line protocol for the operator console.
//!
//! ```text
//! %ack%
//! %success: Boot%
//! %error: Invalid PIN%
//! %debug: First boot, setting flash%
//! %info: F>0x11111124%
//! ```

use std::fmt;
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Success,
    Error,
    Debug,
    Info,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Success => "success",
            Level::Error => "error",
            Level::Debug => "debug",
            Level::Info => "info",
        }
    }
}

/// One parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleLine {
    Ack,
    Message(Level, String),
}

impl ConsoleLine {
    /// Parse a line written by [`Console`]; `None` for anything else.
    pub fn parse(line: &str) -> Option<Self> {
        let body = line.trim_end_matches(['\r', '\n']).strip_prefix('%')?.strip_suffix('%')?;
        if body == "ack" {
            return Some(ConsoleLine::Ack);
        }
        let (tag, text) = body.split_once(": ")?;
        let level = match tag {
            "success" => Level::Success,
            "error" => Level::Error,
            "debug" => Level::Debug,
            "info" => Level::Info,
            _ => return None,
        };
        Some(ConsoleLine::Message(level, text.to_string()))
    }
}

impl fmt::Display for ConsoleLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleLine::Ack => f.write_str("%ack%"),
            ConsoleLine::Message(level, text) => write!(f, "%{}: {}%", level.tag(), text),
        }
    }
}

/// Writes console lines to any sink; the AP's only human-visible channel.
pub struct Console<W: Write> {
    out: W,
}

impl<W: Write> Console<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    fn line(&mut self, line: ConsoleLine) -> io::Result<()> {
        writeln!(self.out, "{line}")?;
        self.out.flush()
    }

    fn message(&mut self, level: Level, text: &str) -> io::Result<()> {
        // A stray '%' or newline would end the line early for the host.
        let text = text.replace(['%', '\n', '\r'], " ");
        self.line(ConsoleLine::Message(level, text))
    }

    pub fn ack(&mut self) -> io::Result<()> {
        self.line(ConsoleLine::Ack)
    }

    pub fn success(&mut self, text: &str) -> io::Result<()> {
        self.message(Level::Success, text)
    }

    pub fn error(&mut self, text: &str) -> io::Result<()> {
        self.message(Level::Error, text)
    }

    pub fn debug(&mut self, text: &str) -> io::Result<()> {
        self.message(Level::Debug, text)
    }

    pub fn info(&mut self, text: &str) -> io::Result<()> {
        self.message(Level::Info, text)
    }
}
