//! Media vocabulary shared by the camera server and its clients.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File extension of raw H.264 recordings written by the client.
pub const RECORDING_EXTENSION: &str = "h264";

/// Lowest and highest accepted manual lens positions (dioptres).
pub const FOCUS_RANGE: (f64, f64) = (0.0, 10.0);

/// Errors raised while validating media arguments.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MediaError {
    /// A resolution component is negative or not representable.
    #[error(
        "Unsupported resolution argument '{0}'. Expected non-negative integer pair [width, height]."
    )]
    MalformedResolution(String),

    /// A resolution component exceeds the sensor mode's bounds.
    #[error("Invalid {axis} resolution value '{value}'. Expected INTEGER: 0<={axis}<={max}.")]
    ResolutionOutOfBounds {
        axis: &'static str,
        value: u32,
        max: u32,
    },

    /// The requested still format is not supported by the encoder.
    #[error("Unsupported file format '{0}'. Only 'jpeg', 'png', 'bmp', and 'gif' are available.")]
    UnsupportedFormat(String),

    /// The manual lens position is outside the lens range.
    #[error("Invalid focus_length '{0}'. Expected FLOAT: 0.0<=FOCUS_LENGTH<=10.0.")]
    FocusOutOfRange(f64),
}

/// Sensor output size in pixels. Serialized as `[width, height]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "[i64; 2]", into = "[u32; 2]")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Creates a resolution.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in one frame.
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl TryFrom<[i64; 2]> for Resolution {
    type Error = MediaError;

    fn try_from([width, height]: [i64; 2]) -> Result<Self, Self::Error> {
        let malformed = || MediaError::MalformedResolution(format!("[{width}, {height}]"));
        let width = u32::try_from(width).map_err(|_| malformed())?;
        let height = u32::try_from(height).map_err(|_| malformed())?;
        Ok(Self { width, height })
    }
}

impl From<Resolution> for [u32; 2] {
    fn from(value: Resolution) -> Self {
        [value.width, value.height]
    }
}

/// Upper bounds of a sensor mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionBounds {
    pub max_width: u32,
    pub max_height: u32,
}

impl ResolutionBounds {
    /// Full-sensor still mode.
    pub const STILL: Self = Self {
        max_width: 4608,
        max_height: 2592,
    };

    /// H.264 video mode (recording and UDP streaming).
    pub const VIDEO: Self = Self {
        max_width: 1920,
        max_height: 1080,
    };

    /// Checks that `resolution` fits inside these bounds.
    pub fn check(&self, resolution: Resolution) -> Result<Resolution, MediaError> {
        if resolution.width > self.max_width {
            return Err(MediaError::ResolutionOutOfBounds {
                axis: "WIDTH",
                value: resolution.width,
                max: self.max_width,
            });
        }
        if resolution.height > self.max_height {
            return Err(MediaError::ResolutionOutOfBounds {
                axis: "HEIGHT",
                value: resolution.height,
                max: self.max_height,
            });
        }
        Ok(resolution)
    }
}

/// Still image encodings the camera can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Bmp,
    Gif,
}

impl ImageFormat {
    /// All supported formats.
    pub const ALL: [ImageFormat; 4] = [Self::Jpeg, Self::Png, Self::Bmp, Self::Gif];

    /// Wire name, also used as the file extension.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Bmp => "bmp",
            Self::Gif => "gif",
        }
    }

    /// File extension for persisted stills.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == lower)
            .ok_or_else(|| MediaError::UnsupportedFormat(s.to_string()))
    }
}

impl TryFrom<String> for ImageFormat {
    type Error = MediaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageFormat> for String {
    fn from(value: ImageFormat) -> Self {
        value.as_str().to_string()
    }
}

/// Validates a manual lens position.
pub fn check_focus_length(focus_length: f64) -> Result<f64, MediaError> {
    let (min, max) = FOCUS_RANGE;
    if focus_length.is_finite() && (min..=max).contains(&focus_length) {
        Ok(focus_length)
    } else {
        Err(MediaError::FocusOutOfRange(focus_length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_serializes_as_pair() {
        let json = serde_json::to_string(&Resolution::new(1280, 720)).unwrap();
        assert_eq!(json, "[1280,720]");

        let parsed: Resolution = serde_json::from_str("[4608, 2592]").unwrap();
        assert_eq!(parsed, Resolution::new(4608, 2592));
    }

    #[test]
    fn negative_resolution_is_malformed() {
        let err = serde_json::from_str::<Resolution>("[-1, 720]").unwrap_err();
        assert!(err.to_string().contains("Unsupported resolution argument"));
    }

    #[test]
    fn resolution_rejects_wrong_arity() {
        assert!(serde_json::from_str::<Resolution>("[1280]").is_err());
        assert!(serde_json::from_str::<Resolution>("[1280, 720, 3]").is_err());
        assert!(serde_json::from_str::<Resolution>("\"1280x720\"").is_err());
    }

    #[test]
    fn still_bounds() {
        let bounds = ResolutionBounds::STILL;
        assert!(bounds.check(Resolution::new(4608, 2592)).is_ok());
        assert!(bounds.check(Resolution::new(0, 0)).is_ok());

        let err = bounds.check(Resolution::new(5000, 720)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid WIDTH resolution value '5000'. Expected INTEGER: 0<=WIDTH<=4608."
        );
    }

    #[test]
    fn video_bounds() {
        let err = ResolutionBounds::VIDEO
            .check(Resolution::new(1280, 2000))
            .unwrap_err();
        assert_eq!(
            err,
            MediaError::ResolutionOutOfBounds {
                axis: "HEIGHT",
                value: 2000,
                max: 1080
            }
        );
    }

    #[test]
    fn image_format_is_case_insensitive() {
        assert_eq!("JPEG".parse::<ImageFormat>().unwrap(), ImageFormat::Jpeg);
        assert_eq!("Png".parse::<ImageFormat>().unwrap(), ImageFormat::Png);

        let parsed: ImageFormat = serde_json::from_str("\"GIF\"").unwrap();
        assert_eq!(parsed, ImageFormat::Gif);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"gif\"");
    }

    #[test]
    fn unsupported_format() {
        let err = "tiff".parse::<ImageFormat>().unwrap_err();
        assert_eq!(err, MediaError::UnsupportedFormat("tiff".into()));
    }

    #[test]
    fn focus_length_range() {
        assert_eq!(check_focus_length(0.0), Ok(0.0));
        assert_eq!(check_focus_length(10.0), Ok(10.0));
        assert!(check_focus_length(10.5).is_err());
        assert!(check_focus_length(-0.1).is_err());
        assert!(check_focus_length(f64::NAN).is_err());
    }
}
