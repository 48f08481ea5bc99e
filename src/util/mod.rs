//! Small helpers shared by the binary and the config layer.
//!
//! - **URL validation**: the API base must be https (http only for loopback)
//! - **Text**: making server text safe to print on a terminal line

mod text;
mod url_validator;

pub use text::{display_width, terminal_line, truncate_to_width};
pub use url_validator::{validate_base_url, UrlValidationError};
