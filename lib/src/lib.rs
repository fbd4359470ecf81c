// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `neural-style` is a small API for neural style transfer: the pixels of an
//! image are optimized so that its deep features match those of a content
//! image while the correlations between its feature channels match those of
//! a style image.
//!
//! A frozen convolutional feature extractor (usually VGG-19) is instrumented
//! with content and style loss taps at configurable depths, and the pixels of
//! a working image are then optimized with L-BFGS.
//!
//! First, you build a `Session` via a `SessionBuilder`, which follows the builder pattern. Calling
//! `build` on the `SessionBuilder` loads both input images and checks the parameters.
//!
//! `Session` has a `run()` method that takes a `FeatureExtractor` resident on a
//! compute device and returns the stylized image as a `StylizedImage`, which
//! you can save, stream or inspect.
//!
//! ## Usage
//! ```no_run
//! use burn::backend::{Autodiff, NdArray};
//!
//! // Create a new session with default parameters
//! let session = neural_style::Session::builder()
//!     // Set some parameters
//!     .steps(200)
//!     .style_weight(1e5)
//!     // Specify the input images
//!     .content(&"imgs/content.jpg")
//!     .style(&"imgs/style.jpg")
//!     // Build the session
//!     .build().expect("failed to build session");
//!
//! // The weights are loaded once per process
//! let weights = neural_style::pretrained_vgg19("vgg19.safetensors").expect("failed to load weights");
//! let extractor = neural_style::FeatureExtractor::<Autodiff<NdArray>>::new(weights, &Default::default());
//!
//! // Optimize the image
//! let stylized = session.run(&extractor, None).expect("style transfer failed");
//!
//! // Save the stylized image to disk
//! stylized.save("stylized.png").expect("failed to save stylized image");
//! ```
mod errors;
mod extractor;
mod layers;
mod lbfgs;
mod losses;
mod model;
mod normalization;
pub mod session;
mod transfer;
mod utils;
mod weights;

pub use image;
use std::path::Path;

pub use errors::Error;
pub use extractor::{FeatureExtractor, Layer};
pub use layers::{parse_layout, vgg19_layout, LayerKind, LayerSpec};
pub use lbfgs::{Evaluation, Lbfgs, LbfgsConfig, LineSearch, StepStatus};
pub use losses::{gram_matrix, ContentLoss, StyleLoss};
pub use model::{StyleModel, Taps};
pub use normalization::{normalize, Normalization, IMAGENET_MEAN, IMAGENET_STD};
pub use session::{ProgressUpdate, Session, SessionBuilder, TransferProgress};
pub use transfer::{
    run_style_transfer, InitialImage, LossScores, Transfer, TransferReport, TransferState,
};
pub use utils::{load_dynamic_image, ImageSource};
pub use weights::{pretrained_vgg19, FrozenWeights, LayerParams};

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::Autodiff<burn::backend::NdArray<f32>>;

/// Everything that controls a single style transfer run
#[derive(Clone, Debug)]
pub struct Parameters {
    pub style_weight: f64,
    pub content_weight: f64,
    /// The evaluation budget of the optimization loop
    pub max_steps: usize,
    /// Scores are logged every this many steps
    pub report_every: usize,
    pub taps: Taps,
    /// The side length of the square content, style and output images
    pub resolution: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub initial_image: InitialImage,
    pub lbfgs: LbfgsConfig,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            style_weight: 10000.0,
            content_weight: 0.001,
            max_steps: 100,
            report_every: 50,
            taps: Taps::default(),
            resolution: 256,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            initial_image: InitialImage::Content,
            lbfgs: LbfgsConfig::default(),
        }
    }
}

impl Parameters {
    /// Checks that every parameter is within its valid range
    pub fn check_validity(&self) -> Result<(), Error> {
        fn check(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), Error> {
            // NaN fails both comparisons
            if value >= min && value <= max {
                Ok(())
            } else {
                Err(Error::InvalidRange(errors::InvalidRange {
                    min,
                    max,
                    value,
                    name: name.to_string(),
                }))
            }
        }

        check("style-weight", self.style_weight, 0.0, f64::MAX)?;
        check("content-weight", self.content_weight, 0.0, f64::MAX)?;
        check("resolution", f64::from(self.resolution), 1.0, 8192.0)?;
        check("report-every", self.report_every as f64, 1.0, f64::MAX)?;
        check("history-size", self.lbfgs.history_size as f64, 1.0, f64::MAX)?;
        check("max-iter", self.lbfgs.max_iter as f64, 1.0, f64::MAX)?;
        check("max-eval", self.lbfgs.max_eval as f64, 1.0, f64::MAX)?;
        check("learning-rate", self.lbfgs.lr, f64::MIN_POSITIVE, f64::MAX)?;

        for std in self.std.iter() {
            check("std", f64::from(*std), f64::from(f32::MIN_POSITIVE), f64::MAX)?;
        }

        Ok(())
    }
}

/// An image produced by a `Session::run()`
pub struct StylizedImage {
    image: image::RgbImage,
    report: TransferReport,
}

impl StylizedImage {
    /// Saves the stylized image to the specified path
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent_path) = path.parent() {
            std::fs::create_dir_all(&parent_path)?;
        }

        self.image.save(&path)?;
        Ok(())
    }

    /// Writes the stylized image to the specified stream
    pub fn write<W: std::io::Write>(
        self,
        writer: &mut W,
        fmt: image::ImageOutputFormat,
    ) -> Result<(), Error> {
        let dyn_img = self.into_image();
        Ok(dyn_img.write_to(writer, fmt)?)
    }

    /// How the optimization went
    pub fn report(&self) -> &TransferReport {
        &self.report
    }

    /// Returns the stylized output image
    pub fn into_image(self) -> image::DynamicImage {
        image::DynamicImage::ImageRgb8(self.image)
    }
}

impl AsRef<image::RgbImage> for StylizedImage {
    fn as_ref(&self) -> &image::RgbImage {
        &self.image
    }
}
