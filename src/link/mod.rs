//! Command/response links to instruments.
//!
//! Every instrument in this system speaks an ASCII request/response protocol
//! over an exclusive channel: commands are sent one at a time and responses
//! are correlated with requests purely by send/receive order. A link
//! therefore has no reentrancy; callers must serialize access, which the
//! drivers do by keeping their link behind a mutex.
//!
//! Some instruments do not buffer commands and need a fixed pause between a
//! write and the matching read (and between consecutive commands). Those
//! pacing knobs live on the concrete link so drivers stay protocol-only.

use crate::error::AppResult;
use async_trait::async_trait;

pub mod mock;
pub mod serial;

pub use mock::{MockLink, SimulatedLockinLink};
pub use serial::SerialLink;

/// An exclusive ASCII command channel to one instrument.
#[async_trait]
pub trait CommandLink: Send + Sync {
    /// Send a command without reading a response.
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Send a command and read one delimited response.
    ///
    /// The returned string is trimmed of the line delimiter but otherwise
    /// untouched; model quirks (stray NUL bytes and the like) are the
    /// driver's business.
    async fn query(&mut self, command: &str) -> AppResult<String>;
}
