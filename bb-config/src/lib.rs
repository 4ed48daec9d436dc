//! # Introduction
//!
//! Applications flashing prebuilt firmware keep the list of offered images in a `firmware.json`
//! catalog next to the binaries.
//!
//! This crate provides abstractions to parse and generate firmware.json files.
//!
//! # Usage
//!
//! ```no_run
//! let catalog = bb_config::Catalog::load("firmware.json").unwrap();
//!
//! for img in &catalog.images {
//!     println!("{}: {} @ 0x{:x}", img.name, catalog.locator(img), img.offset);
//! }
//!
//! // Convert back to JSON
//! let json = serde_json::to_string_pretty(&catalog).unwrap();
//! ```

pub mod catalog;

/// File name of the catalog in the application configuration directory
pub const CATALOG_FILE: &str = "firmware.json";

pub use catalog::{Catalog, Error, Image};

#[cfg(test)]
mod tests {
    #[test]
    fn basic() {
        let data = include_bytes!("../firmware.json");
        let catalog = serde_json::from_slice::<super::Catalog>(data).unwrap();

        assert_eq!(catalog.images.len(), 3);
    }
}
