use crate::Error;
use std::path::Path;

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

/// Loads an image as RGB, dropping any alpha, and resizes it to a square of
/// `resolution` pixels, ignoring the original aspect ratio
pub(crate) fn load_image(src: ImageSource<'_>, resolution: u32) -> Result<image::RgbImage, Error> {
    let img = load_dynamic_image(src)?.to_rgb8();

    let img = if img.width() != resolution || img.height() != resolution {
        image::imageops::resize(
            &img,
            resolution,
            resolution,
            image::imageops::FilterType::Triangle,
        )
    } else {
        img
    };

    Ok(img)
}

/// Converts an image into channel major [0,1] pixels, ie. the layout of a
/// (1, 3, height, width) tensor
pub(crate) fn image_to_pixels(img: &image::RgbImage) -> Vec<f32> {
    let plane = (img.width() * img.height()) as usize;
    let mut pixels = vec![0.0; plane * 3];

    for (i, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            pixels[c * plane + i] = f32::from(pixel[c]) / 255.0;
        }
    }

    pixels
}

/// The inverse of `image_to_pixels`, values outside [0,1] are clamped
pub(crate) fn pixels_to_image(pixels: &[f32], width: u32, height: u32) -> image::RgbImage {
    let plane = (width * height) as usize;
    debug_assert_eq!(pixels.len(), plane * 3);

    let mut img = image::RgbImage::new(width, height);
    for (i, pixel) in img.pixels_mut().enumerate() {
        for c in 0..3 {
            let v = pixels[c * plane + i].max(0.0).min(1.0);
            pixel[c] = (v * 255.0).round() as u8;
        }
    }

    img
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pixels_are_channel_major() {
        let mut img = image::RgbImage::new(2, 1);
        img.put_pixel(0, 0, image::Rgb([255, 0, 51]));
        img.put_pixel(1, 0, image::Rgb([0, 255, 102]));

        let pixels = image_to_pixels(&img);
        assert_eq!(pixels, vec![1.0, 0.0, 0.0, 1.0, 0.2, 0.4]);

        assert_eq!(pixels_to_image(&pixels, 2, 1), img);
    }

    #[test]
    fn out_of_range_pixels_are_clamped() {
        let img = pixels_to_image(&[-0.5, 1.5, 0.5], 1, 1);
        assert_eq!(img.get_pixel(0, 0), &image::Rgb([0, 255, 128]));
    }

    #[test]
    fn images_are_resized_to_a_square() {
        let img = image::DynamicImage::ImageRgba8(image::RgbaImage::new(7, 3));
        let loaded = load_image(ImageSource::Image(img), 4).unwrap();

        assert_eq!(loaded.dimensions(), (4, 4));
    }
}
