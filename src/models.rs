pub mod enums;
pub mod structs;

pub use enums::{FieldType, OutputFormat};
pub use structs::{FieldMapping, ResultPage, Row};
