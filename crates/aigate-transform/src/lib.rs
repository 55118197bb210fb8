//! IO-free request/response transformations.
//!
//! Everything here operates on owned values or byte slices so directors can
//! call it from request filters and response filters alike.

pub mod body;
pub mod claude2openai;
pub mod error;
pub mod image;
pub mod openai2claude;
pub mod template;

pub use error::ConvertError;
