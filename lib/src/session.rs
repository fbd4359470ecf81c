use crate::*;
use burn::tensor::{backend::AutodiffBackend, Tensor, TensorData};

/// Style transfer session.
///
/// Calling `run()` will optimize a new image and return it, consuming the
/// session in the process. You can provide a `TransferProgress` implementation
/// to get an update with the current loss scores after every evaluation of
/// the model.
///
/// # Example
/// ```no_run
/// use burn::backend::{Autodiff, NdArray};
/// use neural_style::{pretrained_vgg19, FeatureExtractor, Session};
///
/// let session = Session::builder()
///     .content(&"imgs/content.jpg")
///     .style(&"imgs/style.jpg")
///     .steps(300)
///     .build().expect("failed to build session");
///
/// let weights = pretrained_vgg19("vgg19.safetensors").expect("failed to load weights");
/// let extractor = FeatureExtractor::<Autodiff<NdArray>>::new(weights, &Default::default());
///
/// let stylized = session.run(&extractor, None).expect("style transfer failed");
/// stylized.save("stylized.png").expect("failed to save image");
/// ```
pub struct Session {
    content: image::RgbImage,
    style: image::RgbImage,
    params: Parameters,
}

impl Session {
    /// Creates a new session with default parameters.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    /// Runs the optimization on the device of `extractor`
    pub fn run<B: AutodiffBackend>(
        self,
        extractor: &FeatureExtractor<B>,
        progress: Option<Box<dyn TransferProgress>>,
    ) -> Result<StylizedImage, Error> {
        let device = extractor.device();
        let res = self.params.resolution as usize;

        let to_tensor = |img: &image::RgbImage| {
            Tensor::<B, 4>::from_data(
                TensorData::new(utils::image_to_pixels(img), [1, 3, res, res]),
                device,
            )
        };

        let transfer = run_style_transfer(
            extractor,
            to_tensor(&self.content),
            to_tensor(&self.style),
            &self.params,
            progress,
        )?;

        let pixels = transfer::tensor_to_vec(transfer.image)?;

        Ok(StylizedImage {
            image: utils::pixels_to_image(
                &pixels,
                self.params.resolution,
                self.params.resolution,
            ),
            report: transfer.report,
        })
    }
}

/// Builds a session by setting parameters and adding input images, calling
/// `build` will check all of the provided inputs to verify that style
/// transfer can run on them
#[derive(Default)]
pub struct SessionBuilder<'a> {
    content: Option<ImageSource<'a>>,
    style: Option<ImageSource<'a>>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// The image whose structure is preserved. It is also the starting point
    /// of the optimization, unless `initial_image` says otherwise.
    pub fn content<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.content = Some(img.into());
        self
    }

    /// The image whose textures are transferred onto the content
    pub fn style<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.style = Some(img.into());
        self
    }

    /// How strongly the style statistics are matched.
    ///
    /// Default: 10000
    pub fn style_weight(mut self, weight: f64) -> Self {
        self.params.style_weight = weight;
        self
    }

    /// How strongly the content features are matched.
    ///
    /// Default: 0.001
    pub fn content_weight(mut self, weight: f64) -> Self {
        self.params.content_weight = weight;
        self
    }

    /// The number of model evaluations after which the optimization stops.
    /// The optimizer finishes its current iteration first, so a run may do
    /// a few more evaluations than this.
    ///
    /// Default: 100
    pub fn steps(mut self, steps: usize) -> Self {
        self.params.max_steps = steps;
        self
    }

    /// The layers after which a content loss is measured, eg. `conv_4`.
    ///
    /// Default: `conv_3`
    pub fn content_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.taps.content = layers.into_iter().map(Into::into).collect();
        self
    }

    /// The layers after which a style loss is measured.
    ///
    /// Default: `conv_1` through `conv_5`
    pub fn style_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.taps.style = layers.into_iter().map(Into::into).collect();
        self
    }

    /// Both inputs are resized to a square of this many pixels, which is
    /// also the size of the output.
    ///
    /// Default: 256
    pub fn resolution(mut self, size: u32) -> Self {
        self.params.resolution = size;
        self
    }

    /// The per channel mean and standard deviation the feature extractor was
    /// trained with.
    ///
    /// Default: ImageNet statistics
    pub fn normalization(mut self, mean: [f32; 3], std: [f32; 3]) -> Self {
        self.params.mean = mean;
        self.params.std = std;
        self
    }

    /// Default: `InitialImage::Content`
    pub fn initial_image(mut self, init: InitialImage) -> Self {
        self.params.initial_image = init;
        self
    }

    /// Default: `LineSearch::None`
    pub fn line_search(mut self, line_search: LineSearch) -> Self {
        self.params.lbfgs.line_search = line_search;
        self
    }

    /// The number of past updates used to approximate the curvature of the
    /// loss.
    ///
    /// Default: 100
    pub fn history_size(mut self, size: usize) -> Self {
        self.params.lbfgs.history_size = size;
        self
    }

    /// The maximum number of optimizer iterations per outer step.
    ///
    /// Default: 20
    pub fn max_iter(mut self, iterations: usize) -> Self {
        self.params.lbfgs.max_iter = iterations;
        self.params.lbfgs.max_eval = iterations + iterations / 4;
        self
    }

    /// How often, in steps, the current scores are logged.
    ///
    /// Default: 50
    pub fn report_every(mut self, steps: usize) -> Self {
        self.params.report_every = steps;
        self
    }

    /// Creates a `Session`, or returns an error if invalid parameters or input
    /// images were specified.
    pub fn build(self) -> Result<Session, Error> {
        self.params.check_validity()?;

        let content = self.content.ok_or(Error::MissingImage("content"))?;
        let style = self.style.ok_or(Error::MissingImage("style"))?;

        let res = self.params.resolution;

        Ok(Session {
            content: utils::load_image(content, res)?,
            style: utils::load_image(style, res)?,
            params: self.params,
        })
    }
}

/// The current state of the optimization
#[derive(Copy, Clone, Debug)]
pub struct ProgressUpdate {
    /// The number of evaluations so far
    pub step: usize,
    /// The step budget, the final step count may slightly exceed it
    pub max_steps: usize,
    /// The scores of the latest evaluation
    pub scores: LossScores,
}

/// Allows the optimization loop to update external callers with the current
/// progress of the style transfer
pub trait TransferProgress {
    fn update(&mut self, info: ProgressUpdate);
}

impl<G> TransferProgress for G
where
    G: FnMut(ProgressUpdate) + Send,
{
    fn update(&mut self, info: ProgressUpdate) {
        self(info)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn solid(rgb: [u8; 3]) -> image::DynamicImage {
        image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(6, 6, image::Rgb(rgb)))
    }

    #[test]
    fn missing_images_are_rejected() {
        let result = Session::builder().content(solid([255, 0, 0])).build();
        assert!(matches!(result, Err(Error::MissingImage("style"))));
    }

    #[test]
    fn parameter_ranges_are_checked() {
        let result = Session::builder()
            .content(solid([255, 0, 0]))
            .style(solid([0, 0, 255]))
            .style_weight(-1.0)
            .build();

        match result {
            Err(Error::InvalidRange(ir)) => assert_eq!(ir.name, "style-weight"),
            _ => panic!("expected an invalid range"),
        }

        let result = Session::builder()
            .content(solid([255, 0, 0]))
            .style(solid([0, 0, 255]))
            .resolution(0)
            .build();
        assert!(matches!(result, Err(Error::InvalidRange(_))));
    }

    #[test]
    fn inputs_are_resized() {
        let session = Session::builder()
            .content(solid([255, 0, 0]))
            .style(solid([0, 0, 255]))
            .resolution(4)
            .build()
            .unwrap();

        assert_eq!(session.content.dimensions(), (4, 4));
        assert_eq!(session.style.dimensions(), (4, 4));
        assert_eq!(session.parameters().resolution, 4);
    }
}
