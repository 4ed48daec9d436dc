//! Firmware catalog format.

use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use url::Url;

/// Flash offset of the application partition
pub const DEFAULT_OFFSET: u32 = 0x10000;
/// Location of the binaries when the catalog does not name one
pub const DEFAULT_BASE: &str = "./firmware/";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
/// Errors for this crate
pub enum Error {
    #[error("Failed to read {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid catalog: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    /// URL or directory the image files are relative to
    #[serde(default = "default_base")]
    pub base: String,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Image {
    pub name: String,
    /// File name relative to [`Catalog::base`], or an absolute URL
    pub file: String,
    #[serde(
        default = "default_offset",
        deserialize_with = "offset_de",
        serialize_with = "offset_ser"
    )]
    pub offset: u32,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            base: default_base(),
            images: Vec::new(),
        }
    }
}

impl Catalog {
    /// Read a catalog from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| Error::IoError {
            path: path.to_path_buf(),
            source,
        })?;

        let mut catalog: Self = serde_json::from_slice(&data)?;

        // Relative directories are relative to the catalog itself
        if Url::parse(&catalog.base).is_err() && Path::new(&catalog.base).is_relative() {
            if let Some(dir) = path.parent() {
                catalog.base = dir.join(&catalog.base).to_string_lossy().into_owned();
            }
        }

        Ok(catalog)
    }

    pub fn find(&self, name: &str) -> Option<&Image> {
        self.images
            .iter()
            .find(|x| x.name.eq_ignore_ascii_case(name) || x.file == name)
    }

    /// Where the bytes of `img` can be fetched from.
    pub fn locator(&self, img: &Image) -> String {
        if Url::parse(&img.file).is_ok_and(|x| x.scheme().len() > 1) {
            return img.file.clone();
        }

        match Url::parse(&self.base) {
            Ok(mut base) if base.scheme().len() > 1 => {
                if !base.path().ends_with('/') {
                    let path = format!("{}/", base.path());
                    base.set_path(&path);
                }

                base.join(&img.file)
                    .map(String::from)
                    .unwrap_or_else(|_| format!("{}{}", self.base, img.file))
            }
            _ => Path::new(&self.base)
                .join(&img.file)
                .to_string_lossy()
                .into_owned(),
        }
    }
}

impl Display for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} @ 0x{:x})", self.name, self.file, self.offset)
    }
}

fn default_base() -> String {
    DEFAULT_BASE.to_string()
}

const fn default_offset() -> u32 {
    DEFAULT_OFFSET
}

/// Parse an offset written as decimal or `0x` prefixed hex.
pub fn parse_offset(s: &str) -> Option<u32> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn offset_de<'de, D>(d: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Offset {
        Number(u32),
        Text(String),
    }

    match Offset::deserialize(d)? {
        Offset::Number(x) => Ok(x),
        Offset::Text(x) => parse_offset(&x)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid offset: {x}"))),
    }
}

fn offset_ser<S>(offset: &u32, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&format!("0x{offset:x}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets() {
        let catalog: Catalog = serde_json::from_str(
            r#"{ "images": [
                { "name": "a", "file": "a.bin" },
                { "name": "b", "file": "b.bin", "offset": "0x20000" },
                { "name": "c", "file": "c.bin", "offset": 4096 }
            ] }"#,
        )
        .unwrap();

        let offsets: Vec<u32> = catalog.images.iter().map(|x| x.offset).collect();
        assert_eq!(offsets, [0x10000, 0x20000, 4096]);
        assert_eq!(catalog.base, DEFAULT_BASE);
    }

    #[test]
    fn invalid_offset() {
        let res = serde_json::from_str::<Image>(r#"{ "name": "a", "file": "a.bin", "offset": "zz" }"#);
        assert!(res.is_err());
    }

    #[test]
    fn parse_offsets() {
        assert_eq!(parse_offset("0x10000"), Some(0x10000));
        assert_eq!(parse_offset("0XFF"), Some(255));
        assert_eq!(parse_offset("65536"), Some(65536));
        assert_eq!(parse_offset("0xZZ"), None);
    }

    #[test]
    fn locators() {
        let img = Image {
            name: "Blink".to_string(),
            file: "blink.bin".to_string(),
            offset: DEFAULT_OFFSET,
        };

        let catalog = Catalog::default();
        assert_eq!(
            catalog.locator(&img),
            Path::new("./firmware/").join("blink.bin").to_string_lossy()
        );

        let catalog = Catalog {
            base: "https://example.com/fw".to_string(),
            images: Vec::new(),
        };
        assert_eq!(catalog.locator(&img), "https://example.com/fw/blink.bin");

        let remote = Image {
            file: "https://cdn.example.com/x.bin".to_string(),
            ..img
        };
        assert_eq!(catalog.locator(&remote), "https://cdn.example.com/x.bin");
    }

    #[test]
    fn find_by_name_or_file() {
        let data = include_bytes!("../firmware.json");
        let catalog: Catalog = serde_json::from_slice(data).unwrap();

        assert_eq!(catalog.find("serial echo").map(|x| x.offset), Some(0x10000));
        assert_eq!(catalog.find("blink.bin").map(|x| x.name.as_str()), Some("Blink"));
        assert!(catalog.find("missing").is_none());
    }

    #[test]
    fn serialize_hex_offset() {
        let img = Image {
            name: "a".to_string(),
            file: "a.bin".to_string(),
            offset: 0x8000,
        };

        let json = serde_json::to_string(&img).unwrap();
        assert!(json.contains(r#""offset":"0x8000""#));
    }
}
