//! Request pipeline stages wrapped around the virtual host router.
//!
//! The root chain runs, outer to inner: [`cookie_handler`], [`form_handler`],
//! [`error_page_handler`]. HTTP listeners add [`transfer_encoding_handler`]
//! in front of the chain.

pub mod cookies;
pub mod error_page;
pub mod form;
pub mod transfer_encoding;

pub use cookies::{cookie_handler, Cookie, RequestCookies, ResponseCookies};
pub use error_page::{error_page, error_page_handler, error_response};
pub use form::{form_handler, FormData, MAX_FORM_SIZE};
pub use transfer_encoding::transfer_encoding_handler;
