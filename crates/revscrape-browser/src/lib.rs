mod chromium;
mod http;

pub use chromium::{ChromiumConfig, ChromiumRenderer};
pub use http::{HttpRenderer, HttpSession};
