use std::io;
use std::path::Path;

use thiserror::Error;

/// Recoverable failures surfaced by the observation core.
///
/// These are tick-local: the aggregator logs them and moves on to the
/// next tick. Fatal startup problems (bad configuration, a netlink
/// socket that cannot be opened) are reported through `anyhow` on the
/// startup path instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("netlink transport: {0}")]
    NetlinkTransport(String),

    #[error("reading {path}: {source}")]
    ProcIo {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("parsing {path}: {reason}")]
    ProcParse { path: String, reason: String },

    #[error("requesting {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected status {status} from {url}")]
    HttpStatus { url: String, status: u16 },
}

impl Error {
    pub(crate) fn netlink(err: impl std::fmt::Display) -> Self {
        Self::NetlinkTransport(err.to_string())
    }

    pub(crate) fn proc_io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::ProcIo {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub(crate) fn proc_parse(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProcParse {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
