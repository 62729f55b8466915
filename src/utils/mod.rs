//! Shared helpers.

pub mod json_extraction;

pub use json_extraction::{
    analyze_balance, extract_json_object, fenced_block, find_object_end, JsonBalance,
    JsonExtractionError,
};
