mod cdp;
mod chrome;
mod error;
mod poll;
mod pool;
mod session;

pub use cdp::{CdpClient, ScreenshotFormat};
pub use chrome::{ChromeLauncher, ChromeProcess};
pub use error::{BrowserError, BrowserResult};
pub use poll::{poll_until, PollOptions};
pub use pool::ResourcePool;
pub use session::{BrowserBackend, BrowserManager, BrowserSession};
