//! Various utility functions and types

mod geometry;
pub(crate) mod ids;

pub use self::geometry::{Point, Rectangle, Size};
