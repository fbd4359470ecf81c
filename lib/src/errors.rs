use std::fmt;

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f64,
    pub(crate) max: f64,
    pub(crate) value: f64,
    pub(crate) name: String,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub struct ShapeMismatch {
    pub(crate) name: String,
    pub(crate) expected: [usize; 4],
    pub(crate) actual: [usize; 4],
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the {} has shape {:?}, but the model expects {:?}",
            self.name, self.actual, self.expected
        )
    }
}

#[derive(Debug)]
pub struct NumericInstability {
    pub step: usize,
    pub style_score: f64,
    pub content_score: f64,
}

impl fmt::Display for NumericInstability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loss became non-finite at step {} (style: {}, content: {})",
            self.step, self.style_score, self.content_score
        )
    }
}

#[derive(Debug)]
pub struct WeightShape {
    pub(crate) key: String,
    pub(crate) expected: Vec<usize>,
    pub(crate) actual: Vec<usize>,
}

impl fmt::Display for WeightShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "weight '{}' has shape {:?}, but the layer layout requires {:?}",
            self.key, self.actual, self.expected
        )
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// A feature extractor layer was not one of the four supported kinds. The
    /// index is the position of the layer in the layout.
    UnrecognizedLayer { index: usize, kind: String },
    /// A layer descriptor had a recognized kind but malformed parameters
    MalformedLayer { index: usize, descriptor: String },
    /// The content or style image doesn't have the shape the model expects
    ShapeMismatch(ShapeMismatch),
    /// The loss became NaN or infinite during optimization
    NumericInstability(NumericInstability),
    /// Neither a content tap nor a style tap ended up in the model, so there
    /// is nothing to optimize
    NoLossTaps,
    /// A configured tap names a layer the feature extractor doesn't have
    UnknownTap(String),
    /// The weights file doesn't contain a tensor the layout requires
    MissingWeight(String),
    /// A tensor in the weights file has the wrong shape for its layer
    WeightShape(WeightShape),
    /// The weights file has a tensor with a dtype other than f32
    UnsupportedWeightType { key: String, dtype: String },
    /// The weights file could not be parsed
    SafeTensors(safetensors::SafeTensorError),
    /// Tensor data could not be read back from the compute device
    TensorData(String),
    /// The user specified an image format we don't support as the output
    UnsupportedOutputFormat(String),
    /// The session was built without the named input image
    MissingImage(&'static str),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::SafeTensors(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::Io(io) => write!(f, "{}", io),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::UnrecognizedLayer { index, kind } => {
                write!(f, "unrecognized layer '{}' at position {}", kind, index)
            }
            Self::MalformedLayer { index, descriptor } => write!(
                f,
                "layer descriptor '{}' at position {} has invalid parameters",
                descriptor, index
            ),
            Self::ShapeMismatch(sm) => write!(f, "{}", sm),
            Self::NumericInstability(ni) => write!(f, "{}", ni),
            Self::NoLossTaps => write!(
                f,
                "no loss taps were inserted, at least 1 content or style layer is required"
            ),
            Self::UnknownTap(name) => write!(
                f,
                "the loss tap '{}' does not name a layer of the feature extractor",
                name
            ),
            Self::MissingWeight(key) => write!(f, "the weights file has no tensor '{}'", key),
            Self::WeightShape(ws) => write!(f, "{}", ws),
            Self::UnsupportedWeightType { key, dtype } => write!(
                f,
                "weight '{}' is stored as {}, only F32 is supported",
                key, dtype
            ),
            Self::SafeTensors(st) => write!(f, "{}", st),
            Self::TensorData(msg) => write!(f, "failed to read tensor data: {}", msg),
            Self::UnsupportedOutputFormat(fmt) => {
                write!(f, "the output format '{}' is not supported", fmt)
            }
            Self::MissingImage(which) => write!(f, "no {} image was provided", which),
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(st: safetensors::SafeTensorError) -> Self {
        Self::SafeTensors(st)
    }
}
