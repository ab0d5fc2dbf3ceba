pub mod error;
pub mod field;
pub mod ids;
pub mod value;

pub use error::*;
pub use field::*;
pub use ids::*;
pub use value::*;
