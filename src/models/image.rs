use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// The fixed set of crops taken from every source image.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VariantName {
    Full,
    TopHalf,
    BottomHalf,
    LeftHalf,
    RightHalf,
}

/// Pixel rectangle inside a source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl VariantName {
    /// Region of this variant for a `width` x `height` source. Complementary
    /// halves split at `floor(dim / 2)` so they cover the source exactly.
    pub fn region(self, width: u32, height: u32) -> Region {
        let mid_w = width / 2;
        let mid_h = height / 2;
        match self {
            VariantName::Full => Region { left: 0, top: 0, width, height },
            VariantName::TopHalf => Region { left: 0, top: 0, width, height: mid_h },
            VariantName::BottomHalf => Region {
                left: 0,
                top: mid_h,
                width,
                height: height - mid_h,
            },
            VariantName::LeftHalf => Region { left: 0, top: 0, width: mid_w, height },
            VariantName::RightHalf => Region {
                left: mid_w,
                top: 0,
                width: width - mid_w,
                height,
            },
        }
    }
}

/// One derived crop written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageVariant {
    pub name: VariantName,
    pub region: Region,
    pub output_path: PathBuf,
}
