//! HTTP surface: the admission middleware and the server hosting it.

mod admission;
mod server;

pub use admission::{admission, AdmissionState, API_KEY_HEADER, REJECTION_BODY};
pub use server::{gate, router, HttpServer};
