pub mod lopdf_parser;
pub mod parser;

#[cfg(windows)]
pub mod windows_ocr;

pub use lopdf_parser::LoPdfParser;
pub use parser::{DocumentParser, ParsedDocument};
