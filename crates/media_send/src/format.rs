//! Image-encoding capability negotiation.

use once_cell::sync::OnceCell;
use shared::domain::ImageFormat;
use tracing::debug;

/// Candidate encodings, best first. `Png` is the guaranteed fallback and is
/// assumed decodable everywhere.
pub const FORMAT_PREFERENCE: [ImageFormat; 3] =
    [ImageFormat::Webp, ImageFormat::Jpeg, ImageFormat::Png];

pub trait FormatProber: Send + Sync {
    fn supports(&self, format: ImageFormat) -> bool;
}

/// Probes the decoders compiled into this build of the `image` crate,
/// which is what the client uses to display previews.
pub struct RuntimeFormatProber;

impl FormatProber for RuntimeFormatProber {
    fn supports(&self, format: ImageFormat) -> bool {
        decoder_format(format).reading_enabled()
    }
}

fn decoder_format(format: ImageFormat) -> image::ImageFormat {
    match format {
        ImageFormat::Webp => image::ImageFormat::WebP,
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        ImageFormat::Png => image::ImageFormat::Png,
    }
}

/// Returns the first candidate in [`FORMAT_PREFERENCE`] the prober reports
/// as supported. There is no error path: if every probe comes back
/// negative, `Png` is returned anyway.
pub fn negotiate(prober: &dyn FormatProber) -> ImageFormat {
    FORMAT_PREFERENCE
        .iter()
        .copied()
        .find(|format| prober.supports(*format))
        .unwrap_or(ImageFormat::Png)
}

static NEGOTIATED_FORMAT: OnceCell<ImageFormat> = OnceCell::new();

/// Process-wide negotiated format. Computed lazily on first call against
/// the runtime prober and never invalidated for the session.
pub fn resolve_format() -> ImageFormat {
    *NEGOTIATED_FORMAT.get_or_init(|| {
        let format = negotiate(&RuntimeFormatProber);
        debug!(format = ?format, "negotiated outbound image format");
        format
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProber {
        supported: Vec<ImageFormat>,
    }

    impl FormatProber for FixedProber {
        fn supports(&self, format: ImageFormat) -> bool {
            self.supported.contains(&format)
        }
    }

    #[test]
    fn negotiate_prefers_webp_when_supported() {
        let prober = FixedProber {
            supported: vec![ImageFormat::Webp, ImageFormat::Jpeg, ImageFormat::Png],
        };
        assert_eq!(negotiate(&prober), ImageFormat::Webp);
    }

    #[test]
    fn negotiate_falls_through_preference_order() {
        let prober = FixedProber {
            supported: vec![ImageFormat::Jpeg, ImageFormat::Png],
        };
        assert_eq!(negotiate(&prober), ImageFormat::Jpeg);

        let prober = FixedProber {
            supported: vec![ImageFormat::Png],
        };
        assert_eq!(negotiate(&prober), ImageFormat::Png);
    }

    #[test]
    fn negotiate_defaults_to_png_when_no_probe_succeeds() {
        let prober = FixedProber {
            supported: Vec::new(),
        };
        assert_eq!(negotiate(&prober), ImageFormat::Png);
    }

    #[test]
    fn resolve_format_is_stable_across_calls() {
        let first = resolve_format();
        let second = resolve_format();
        assert_eq!(first, second);
        assert_eq!(first, negotiate(&RuntimeFormatProber));
    }

    #[test]
    fn runtime_prober_reads_png() {
        assert!(RuntimeFormatProber.supports(ImageFormat::Png));
    }
}
