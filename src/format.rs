//! Pixel formats, sizes and the static format table.
//!
//! The emulated device speaks V4L2 fourcc codes ([`FourCC`]) while camera
//! backends speak their own pixel format identifiers ([`PixelFormat`], DRM
//! fourcc codes). The table below maps between the two and carries the
//! per-plane layout used to derive stride and frame size.

use std::fmt;

use crate::abi::{
    COLORSPACE_SRGB, FIELD_NONE, PIX_FMT_PRIV_MAGIC, QUANTIZATION_DEFAULT, XFER_FUNC_DEFAULT,
    YCBCR_ENC_DEFAULT,
};

/// V4L2 pixel format code (e.g., YUYV, MJPG, BGR3).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// Decode the little-endian `u32` representation used by the kernel ABI.
    #[must_use]
    pub const fn from_u32(code: u32) -> Self {
        Self(code.to_le_bytes())
    }

    /// Little-endian `u32` representation used by the kernel ABI.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// YVYU pixel format (4:2:2 packed).
    pub const YVYU: Self = Self::new(b"YVYU");
    /// UYVY pixel format (4:2:2 packed).
    pub const UYVY: Self = Self::new(b"UYVY");
    /// VYUY pixel format (4:2:2 packed).
    pub const VYUY: Self = Self::new(b"VYUY");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// BGR3 pixel format (24-bit BGR).
    pub const BGR3: Self = Self::new(b"BGR3");
    /// 32-bit ARGB.
    pub const ARGB32: Self = Self::new(b"BA24");
    /// NV12 semi-planar 4:2:0.
    pub const NV12: Self = Self::new(b"NV12");
    /// NV21 semi-planar 4:2:0.
    pub const NV21: Self = Self::new(b"NV21");
    /// NV16 semi-planar 4:2:2.
    pub const NV16: Self = Self::new(b"NV16");
    /// NV61 semi-planar 4:2:2.
    pub const NV61: Self = Self::new(b"NV61");
    /// NV24 semi-planar 4:4:4.
    pub const NV24: Self = Self::new(b"NV24");
    /// NV42 semi-planar 4:4:4.
    pub const NV42: Self = Self::new(b"NV42");
    /// YUV 4:2:0 planar.
    pub const YU12: Self = Self::new(b"YU12");
    /// YUV 4:2:2 planar.
    pub const YUV422P: Self = Self::new(b"422P");
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            let c = if byte.is_ascii_graphic() || byte == b' ' {
                char::from(byte)
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Backend pixel format identifier (DRM fourcc code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PixelFormat(pub FourCC);

impl PixelFormat {
    /// The invalid (all-zero) pixel format.
    pub const INVALID: Self = Self(FourCC([0; 4]));

    /// Create a backend pixel format from its fourcc bytes.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(FourCC::new(code))
    }

    /// Whether this is a real format rather than [`Self::INVALID`].
    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// 24-bit RGB, B in the lowest byte.
    pub const RGB888: Self = Self::new(b"RG24");
    /// 24-bit BGR, R in the lowest byte.
    pub const BGR888: Self = Self::new(b"BG24");
    /// 32-bit BGRA.
    pub const BGRA8888: Self = Self::new(b"BA24");
    /// UYVY packed 4:2:2.
    pub const UYVY: Self = Self::new(b"UYVY");
    /// VYUY packed 4:2:2.
    pub const VYUY: Self = Self::new(b"VYUY");
    /// YUYV packed 4:2:2.
    pub const YUYV: Self = Self::new(b"YUYV");
    /// YVYU packed 4:2:2.
    pub const YVYU: Self = Self::new(b"YVYU");
    /// NV12 semi-planar 4:2:0.
    pub const NV12: Self = Self::new(b"NV12");
    /// NV21 semi-planar 4:2:0.
    pub const NV21: Self = Self::new(b"NV21");
    /// NV16 semi-planar 4:2:2.
    pub const NV16: Self = Self::new(b"NV16");
    /// NV61 semi-planar 4:2:2.
    pub const NV61: Self = Self::new(b"NV61");
    /// NV24 semi-planar 4:4:4.
    pub const NV24: Self = Self::new(b"NV24");
    /// NV42 semi-planar 4:4:4.
    pub const NV42: Self = Self::new(b"NV42");
    /// YUV 4:2:0 planar.
    pub const YUV420: Self = Self::new(b"YU12");
    /// YUV 4:2:2 planar.
    pub const YUV422: Self = Self::new(b"YU16");
    /// Motion JPEG.
    pub const MJPEG: Self = Self::new(b"MJPG");
}

/// Frame size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Size {
    /// Create a new size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel encodings a backend advertises, each with its supported sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFormats {
    entries: Vec<(PixelFormat, Vec<Size>)>,
}

impl StreamFormats {
    /// Build a format table from `(format, sizes)` pairs, in advertised order.
    #[must_use]
    pub fn new(entries: Vec<(PixelFormat, Vec<Size>)>) -> Self {
        Self { entries }
    }

    /// Advertised pixel formats in order.
    pub fn pixel_formats(&self) -> impl Iterator<Item = PixelFormat> + '_ {
        self.entries.iter().map(|(format, _)| *format)
    }

    /// Number of advertised pixel formats.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no pixel format is advertised.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pixel format at `index` in advertised order.
    #[must_use]
    pub fn pixel_format(&self, index: usize) -> Option<PixelFormat> {
        self.entries.get(index).map(|(format, _)| *format)
    }

    /// Sizes advertised for `format`, empty if the format is not advertised.
    #[must_use]
    pub fn sizes(&self, format: PixelFormat) -> &[Size] {
        self.entries
            .iter()
            .find(|(candidate, _)| *candidate == format)
            .map(|(_, sizes)| sizes.as_slice())
            .unwrap_or(&[])
    }

    /// Whether `format` is advertised.
    #[must_use]
    pub fn contains(&self, format: PixelFormat) -> bool {
        self.entries.iter().any(|(candidate, _)| *candidate == format)
    }
}

/// `struct v4l2_pix_format`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PixFormat {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// V4L2 pixel format.
    pub pixelformat: FourCC,
    /// Field order.
    pub field: u32,
    /// Bytes per line of the first plane.
    pub bytesperline: u32,
    /// Total frame size in bytes.
    pub sizeimage: u32,
    /// Colour space.
    pub colorspace: u32,
    /// Private field, [`PIX_FMT_PRIV_MAGIC`] when the extended fields are valid.
    pub priv_: u32,
    /// Format flags.
    pub flags: u32,
    /// Y'CbCr encoding.
    pub ycbcr_enc: u32,
    /// Quantization range.
    pub quantization: u32,
    /// Transfer function.
    pub xfer_func: u32,
}

impl PixFormat {
    /// Full descriptor for `fourcc` at `size`, with every layout field
    /// derived from the format table.
    #[must_use]
    pub fn from_layout(fourcc: FourCC, size: Size) -> Self {
        Self {
            width: size.width,
            height: size.height,
            pixelformat: fourcc,
            field: FIELD_NONE,
            bytesperline: bytes_per_line(fourcc, size.width),
            sizeimage: image_size(fourcc, size.width, size.height),
            colorspace: COLORSPACE_SRGB,
            priv_: PIX_FMT_PRIV_MAGIC,
            flags: 0,
            ycbcr_enc: YCBCR_ENC_DEFAULT,
            quantization: QUANTIZATION_DEFAULT,
            xfer_func: XFER_FUNC_DEFAULT,
        }
    }

    /// Frame size in pixels.
    #[must_use]
    pub const fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

struct PlaneInfo {
    bits_per_pixel: u32,
    h_subsampling: u32,
    v_subsampling: u32,
}

struct PixelFormatInfo {
    format: PixelFormat,
    v4l2: FourCC,
    description: &'static str,
    compressed: bool,
    planes: &'static [PlaneInfo],
}

const fn plane(bits_per_pixel: u32, h_subsampling: u32, v_subsampling: u32) -> PlaneInfo {
    PlaneInfo {
        bits_per_pixel,
        h_subsampling,
        v_subsampling,
    }
}

static PIXEL_FORMAT_INFO: [PixelFormatInfo; 16] = [
    // RGB formats
    PixelFormatInfo {
        format: PixelFormat::RGB888,
        v4l2: FourCC::BGR3,
        description: "24-bit BGR 8-8-8",
        compressed: false,
        planes: &[plane(24, 1, 1)],
    },
    PixelFormatInfo {
        format: PixelFormat::BGR888,
        v4l2: FourCC::RGB3,
        description: "24-bit RGB 8-8-8",
        compressed: false,
        planes: &[plane(24, 1, 1)],
    },
    PixelFormatInfo {
        format: PixelFormat::BGRA8888,
        v4l2: FourCC::ARGB32,
        description: "32-bit ARGB 8-8-8-8",
        compressed: false,
        planes: &[plane(32, 1, 1)],
    },
    // YUV packed formats
    PixelFormatInfo {
        format: PixelFormat::UYVY,
        v4l2: FourCC::UYVY,
        description: "UYVY 4:2:2",
        compressed: false,
        planes: &[plane(16, 1, 1)],
    },
    PixelFormatInfo {
        format: PixelFormat::VYUY,
        v4l2: FourCC::VYUY,
        description: "VYUY 4:2:2",
        compressed: false,
        planes: &[plane(16, 1, 1)],
    },
    PixelFormatInfo {
        format: PixelFormat::YUYV,
        v4l2: FourCC::YUYV,
        description: "YUYV 4:2:2",
        compressed: false,
        planes: &[plane(16, 1, 1)],
    },
    PixelFormatInfo {
        format: PixelFormat::YVYU,
        v4l2: FourCC::YVYU,
        description: "YVYU 4:2:2",
        compressed: false,
        planes: &[plane(16, 1, 1)],
    },
    // YUV semi-planar formats
    PixelFormatInfo {
        format: PixelFormat::NV12,
        v4l2: FourCC::NV12,
        description: "Y/CbCr 4:2:0",
        compressed: false,
        planes: &[plane(8, 1, 1), plane(16, 2, 2)],
    },
    PixelFormatInfo {
        format: PixelFormat::NV21,
        v4l2: FourCC::NV21,
        description: "Y/CrCb 4:2:0",
        compressed: false,
        planes: &[plane(8, 1, 1), plane(16, 2, 2)],
    },
    PixelFormatInfo {
        format: PixelFormat::NV16,
        v4l2: FourCC::NV16,
        description: "Y/CbCr 4:2:2",
        compressed: false,
        planes: &[plane(8, 1, 1), plane(16, 2, 1)],
    },
    PixelFormatInfo {
        format: PixelFormat::NV61,
        v4l2: FourCC::NV61,
        description: "Y/CrCb 4:2:2",
        compressed: false,
        planes: &[plane(8, 1, 1), plane(16, 2, 1)],
    },
    PixelFormatInfo {
        format: PixelFormat::NV24,
        v4l2: FourCC::NV24,
        description: "Y/CbCr 4:4:4",
        compressed: false,
        planes: &[plane(8, 1, 1), plane(16, 1, 1)],
    },
    PixelFormatInfo {
        format: PixelFormat::NV42,
        v4l2: FourCC::NV42,
        description: "Y/CrCb 4:4:4",
        compressed: false,
        planes: &[plane(8, 1, 1), plane(16, 1, 1)],
    },
    // YUV planar formats
    PixelFormatInfo {
        format: PixelFormat::YUV420,
        v4l2: FourCC::YU12,
        description: "Planar YUV 4:2:0",
        compressed: false,
        planes: &[plane(8, 1, 1), plane(8, 2, 2), plane(8, 2, 2)],
    },
    PixelFormatInfo {
        format: PixelFormat::YUV422,
        v4l2: FourCC::YUV422P,
        description: "Planar YUV 4:2:2",
        compressed: false,
        planes: &[plane(8, 1, 1), plane(8, 2, 1), plane(8, 2, 1)],
    },
    // Compressed formats use the worst-case uncompressed 16 bpp estimate.
    PixelFormatInfo {
        format: PixelFormat::MJPEG,
        v4l2: FourCC::MJPG,
        description: "Motion-JPEG",
        compressed: true,
        planes: &[plane(16, 1, 1)],
    },
];

fn info_by_v4l2(fourcc: FourCC) -> Option<&'static PixelFormatInfo> {
    PIXEL_FORMAT_INFO.iter().find(|info| info.v4l2 == fourcc)
}

fn info_by_backend(format: PixelFormat) -> Option<&'static PixelFormatInfo> {
    PIXEL_FORMAT_INFO.iter().find(|info| info.format == format)
}

/// Backend pixel format for a V4L2 code, [`PixelFormat::INVALID`] if unknown.
#[must_use]
pub fn v4l2_to_backend(fourcc: FourCC) -> PixelFormat {
    info_by_v4l2(fourcc).map_or(PixelFormat::INVALID, |info| info.format)
}

/// V4L2 code for a backend pixel format; unknown formats pass through as-is.
#[must_use]
pub fn backend_to_v4l2(format: PixelFormat) -> FourCC {
    info_by_backend(format).map_or(format.0, |info| info.v4l2)
}

/// Bytes per line of the first plane, 0 for unknown formats.
#[must_use]
pub fn bytes_per_line(fourcc: FourCC, width: u32) -> u32 {
    info_by_v4l2(fourcc)
        .and_then(|info| info.planes.first())
        .map_or(0, |plane| (plane.bits_per_pixel / 8).saturating_mul(width))
}

/// Total frame size in bytes over all planes, 0 for unknown formats or
/// sizes that do not fit the ABI's 32-bit field.
#[must_use]
pub fn image_size(fourcc: FourCC, width: u32, height: u32) -> u32 {
    let Some(info) = info_by_v4l2(fourcc) else {
        return 0;
    };

    let multiplier: u64 = info
        .planes
        .iter()
        .map(|plane| {
            u64::from(plane.bits_per_pixel / plane.h_subsampling / plane.v_subsampling)
        })
        .sum();

    let size = u64::from(width)
        .saturating_mul(u64::from(height))
        .saturating_mul(multiplier)
        / 8;
    u32::try_from(size).unwrap_or(0)
}

/// Human readable description of a V4L2 code.
#[must_use]
pub fn description(fourcc: FourCC) -> &'static str {
    info_by_v4l2(fourcc).map_or("Video Format Description", |info| info.description)
}

/// Whether the V4L2 code is a compressed format.
#[must_use]
pub fn is_compressed(fourcc: FourCC) -> bool {
    info_by_v4l2(fourcc).is_some_and(|info| info.compressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_u32_round_trip_matches_kernel_encoding() {
        // v4l2_fourcc('Y', 'U', 'Y', 'V')
        assert_eq!(FourCC::YUYV.to_u32(), 0x5659_5559);
        assert_eq!(FourCC::from_u32(0x5659_5559), FourCC::YUYV);
        assert_eq!(FourCC::YUYV.to_string(), "YUYV");
    }

    #[test]
    fn test_yuyv_layout() {
        assert_eq!(bytes_per_line(FourCC::YUYV, 640), 1280);
        assert_eq!(image_size(FourCC::YUYV, 640, 480), 614_400);
    }

    #[test]
    fn test_planar_layout() {
        assert_eq!(image_size(FourCC::NV12, 640, 480), 460_800);
        assert_eq!(image_size(FourCC::YU12, 640, 480), 460_800);
        assert_eq!(image_size(FourCC::YUV422P, 640, 480), 614_400);
        assert_eq!(bytes_per_line(FourCC::NV12, 640), 640);
    }

    #[test]
    fn test_unknown_format_has_zero_size() {
        let unknown = FourCC::new(b"ZZZZ");
        assert_eq!(image_size(unknown, 640, 480), 0);
        assert_eq!(bytes_per_line(unknown, 640), 0);
        assert_eq!(v4l2_to_backend(unknown), PixelFormat::INVALID);
        assert_eq!(backend_to_v4l2(PixelFormat(unknown)), unknown);
    }

    #[test]
    fn test_rgb_codes_are_swapped_between_v4l2_and_backend() {
        assert_eq!(v4l2_to_backend(FourCC::BGR3), PixelFormat::RGB888);
        assert_eq!(backend_to_v4l2(PixelFormat::BGR888), FourCC::RGB3);
        assert_eq!(backend_to_v4l2(PixelFormat::YUV422), FourCC::YUV422P);
    }

    #[test]
    fn test_pix_format_layout_is_derived() {
        let pix = PixFormat::from_layout(FourCC::YUYV, Size::new(320, 240));
        assert_eq!(pix.bytesperline, 640);
        assert_eq!(pix.sizeimage, 153_600);
        assert_eq!(pix.field, FIELD_NONE);
        assert_eq!(pix.colorspace, COLORSPACE_SRGB);
        assert_eq!(pix.priv_, PIX_FMT_PRIV_MAGIC);
    }

    #[test]
    fn test_stream_formats_lookup() {
        let formats = StreamFormats::new(vec![
            (PixelFormat::YUYV, vec![Size::new(640, 480), Size::new(320, 240)]),
            (PixelFormat::MJPEG, vec![Size::new(1280, 720)]),
        ]);
        assert_eq!(formats.len(), 2);
        assert_eq!(formats.pixel_format(1), Some(PixelFormat::MJPEG));
        assert_eq!(formats.sizes(PixelFormat::YUYV).len(), 2);
        assert!(formats.sizes(PixelFormat::NV12).is_empty());
        assert!(is_compressed(FourCC::MJPG));
        assert!(!is_compressed(FourCC::YUYV));
    }
}
