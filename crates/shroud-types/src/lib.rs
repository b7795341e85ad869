pub mod error;

pub use error::{ErrorKind, Result, ShroudError};
