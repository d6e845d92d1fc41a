pub mod checker;
pub mod fetcher;

pub use checker::*;
pub use fetcher::*;
