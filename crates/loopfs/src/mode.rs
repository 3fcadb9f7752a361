//! Open modes and seek origins.

use std::fmt;
use std::fs::OpenOptions;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How a file is opened.
///
/// | Mode | String | Readable | Writable | Creates | Truncates | Starts at |
/// |------|--------|----------|----------|---------|-----------|-----------|
/// | `Read` | `r` | yes | no | no | no | 0 |
/// | `ReadWrite` | `r+` | yes | yes | no | no | 0 |
/// | `Write` | `w` | no | yes | yes | yes | 0 |
/// | `WriteRead` | `w+` | yes | yes | yes | yes | 0 |
/// | `Append` | `a` | no | yes | yes | no | end |
/// | `AppendRead` | `a+` | yes | yes | yes | no | end |
/// | `Exclusive` | `x` | no | yes | must not exist | - | 0 |
/// | `ExclusiveRead` | `x+` | yes | yes | must not exist | - | 0 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenMode {
    Read,
    ReadWrite,
    Write,
    WriteRead,
    Append,
    AppendRead,
    Exclusive,
    ExclusiveRead,
}

impl OpenMode {
    /// The canonical mode string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::ReadWrite => "r+",
            Self::Write => "w",
            Self::WriteRead => "w+",
            Self::Append => "a",
            Self::AppendRead => "a+",
            Self::Exclusive => "x",
            Self::ExclusiveRead => "x+",
        }
    }

    pub fn is_readable(&self) -> bool {
        !matches!(self, Self::Write | Self::Append | Self::Exclusive)
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self, Self::Read)
    }

    /// Writes always land at the end of the file.
    pub fn is_append(&self) -> bool {
        matches!(self, Self::Append | Self::AppendRead)
    }

    /// Translate into `std` open options.
    ///
    /// Append modes are opened without `O_APPEND`: writes are positional and
    /// the handle targets the end of file itself.
    pub(crate) fn to_open_options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options.read(self.is_readable()).write(self.is_writable());
        match self {
            Self::Read | Self::ReadWrite => {}
            Self::Write | Self::WriteRead => {
                options.create(true).truncate(true);
            }
            Self::Append | Self::AppendRead => {
                options.create(true);
            }
            Self::Exclusive | Self::ExclusiveRead => {
                options.create_new(true);
            }
        }
        options
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpenMode {
    type Err = Error;

    /// Parse a mode string. Binary/text/close-on-exec flags (`b`, `t`, `e`)
    /// carry no meaning here and are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s.chars().filter(|c| !matches!(c, 'b' | 't' | 'e')).collect();
        match normalized.as_str() {
            "r" => Ok(Self::Read),
            "r+" => Ok(Self::ReadWrite),
            "w" => Ok(Self::Write),
            "w+" => Ok(Self::WriteRead),
            "a" => Ok(Self::Append),
            "a+" => Ok(Self::AppendRead),
            "x" => Ok(Self::Exclusive),
            "x+" => Ok(Self::ExclusiveRead),
            _ => Err(Error::InvalidMode(s.to_string())),
        }
    }
}

/// Origin for [`FileHandle::seek`](crate::FileHandle::seek).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// Absolute offset.
    Start,
    /// Relative to the current position.
    Current,
    /// Relative to the best-known size.
    End,
}
