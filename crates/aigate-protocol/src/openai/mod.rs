pub mod chat;
pub mod images;
pub mod models;

pub use chat::*;
pub use images::*;
pub use models::*;
