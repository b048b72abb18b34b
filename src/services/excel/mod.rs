pub mod reader;
pub mod types;
pub mod utils;

pub use reader::{read_sheet, sheet_names};
pub use types::SheetSelection;
