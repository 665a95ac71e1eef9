//! Shared helpers: feed URL validation and text cleanup.

mod text;
mod url_validator;

pub use text::{single_line, strip_control_chars};
pub use url_validator::{validate_feed_url, UrlValidationError};
