pub mod message;
pub mod timestamp;

pub use message::Model as Message;
