use crate::{
    layers::{parse_layout, LayerKind, LayerSpec},
    weights::{FrozenWeights, LayerParams},
    Error,
};
use burn::tensor::{
    activation::relu,
    backend::Backend,
    module::{conv2d, max_pool2d},
    ops::ConvOptions,
    Tensor, TensorData,
};

/// A convolution whose weights are constants rather than trainable
/// parameters, so they never take part in gradient computation
#[derive(Clone, Debug)]
pub struct FrozenConv<B: Backend> {
    weight: Tensor<B, 4>,
    bias: Tensor<B, 1>,
    padding: usize,
}

impl<B: Backend> FrozenConv<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        conv2d(
            x,
            self.weight.clone(),
            Some(self.bias.clone()),
            ConvOptions::new([1, 1], [self.padding, self.padding], [1, 1], 1),
        )
    }
}

/// Inference mode batch normalization, the running statistics are folded into
/// a per channel scale and shift when the layer is created
#[derive(Clone, Debug)]
pub struct FrozenBatchNorm<B: Backend> {
    scale: Tensor<B, 4>,
    shift: Tensor<B, 4>,
}

impl<B: Backend> FrozenBatchNorm<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        x * self.scale.clone() + self.shift.clone()
    }
}

/// A single layer of the feature extractor. Every variant produces a new
/// output tensor and leaves its input untouched.
#[derive(Clone, Debug)]
pub enum Layer<B: Backend> {
    Conv(FrozenConv<B>),
    Relu,
    MaxPool { kernel: usize, stride: usize },
    BatchNorm(FrozenBatchNorm<B>),
}

impl<B: Backend> Layer<B> {
    pub fn kind(&self) -> LayerKind {
        match self {
            Self::Conv(_) => LayerKind::Conv,
            Self::Relu => LayerKind::Relu,
            Self::MaxPool { .. } => LayerKind::Pool,
            Self::BatchNorm(_) => LayerKind::BatchNorm,
        }
    }

    /// The smallest height and width of an input this layer can produce an
    /// output for
    pub fn min_input_size(&self) -> usize {
        match self {
            Self::Conv(conv) => {
                let [_, _, kernel, _] = conv.weight.dims();
                kernel.saturating_sub(2 * conv.padding).max(1)
            }
            Self::MaxPool { kernel, .. } => *kernel,
            Self::Relu | Self::BatchNorm(_) => 1,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Conv(conv) => conv.forward(x),
            Self::Relu => relu(x),
            Self::MaxPool { kernel, stride } => max_pool2d(
                x,
                [*kernel, *kernel],
                [*stride, *stride],
                [0, 0],
                [1, 1],
                false,
            ),
            Self::BatchNorm(bn) => bn.forward(x),
        }
    }
}

/// A fixed sequence of layers with frozen weights, resident on one device.
///
/// The extractor is only ever borrowed by the models assembled from it, so a
/// single extractor can serve any number of style transfer runs.
#[derive(Clone, Debug)]
pub struct FeatureExtractor<B: Backend> {
    layers: Vec<Layer<B>>,
    device: B::Device,
}

impl<B: Backend> FeatureExtractor<B> {
    /// Uploads the frozen weights to `device`
    pub fn new(weights: &FrozenWeights, device: &B::Device) -> Self {
        let layers = weights
            .layers()
            .map(|(spec, params)| build_layer(spec, params, device))
            .collect();

        Self {
            layers,
            device: device.clone(),
        }
    }

    /// Builds an extractor with deterministic random weights from textual
    /// layer descriptors, see the `layers` module for the format
    pub fn from_layout<I, S>(descriptors: I, seed: u64, device: &B::Device) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let layout = parse_layout(descriptors)?;
        Ok(Self::new(&FrozenWeights::random(layout, seed), device))
    }

    pub fn layers(&self) -> &[Layer<B>] {
        &self.layers
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Runs `x` through every layer
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers.iter().fold(x, |x, layer| layer.forward(x))
    }
}

fn build_layer<B: Backend>(spec: &LayerSpec, params: &LayerParams, device: &B::Device) -> Layer<B> {
    match (*spec, params) {
        (
            LayerSpec::Conv {
                in_channels,
                out_channels,
                kernel,
                padding,
            },
            LayerParams::Conv { weight, bias },
        ) => Layer::Conv(FrozenConv {
            weight: Tensor::from_data(
                TensorData::new(weight.clone(), [out_channels, in_channels, kernel, kernel]),
                device,
            ),
            bias: Tensor::from_data(TensorData::new(bias.clone(), [out_channels]), device),
            padding,
        }),
        (
            LayerSpec::BatchNorm { channels, epsilon },
            LayerParams::BatchNorm {
                gamma,
                beta,
                running_mean,
                running_var,
            },
        ) => {
            let scale: Vec<f32> = gamma
                .iter()
                .zip(running_var.iter())
                .map(|(g, v)| g / (v + epsilon).sqrt())
                .collect();
            let shift: Vec<f32> = beta
                .iter()
                .zip(running_mean.iter())
                .zip(scale.iter())
                .map(|((b, m), s)| b - m * s)
                .collect();

            Layer::BatchNorm(FrozenBatchNorm {
                scale: Tensor::from_data(TensorData::new(scale, [1, channels, 1, 1]), device),
                shift: Tensor::from_data(TensorData::new(shift, [1, channels, 1, 1]), device),
            })
        }
        (LayerSpec::MaxPool { kernel, stride }, LayerParams::None) => {
            Layer::MaxPool { kernel, stride }
        }
        (LayerSpec::Relu, LayerParams::None) => Layer::Relu,
        // FrozenWeights always pairs a spec with params of the same kind
        (spec, _) => unreachable!("{:?} was paired with params of another kind", spec),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::TestBackend;

    #[test]
    fn shapes_follow_the_layout() {
        let device = Default::default();
        let extractor = FeatureExtractor::<TestBackend>::from_layout(
            &["conv:3:8", "relu", "pool", "conv:8:16", "bn:16", "relu"],
            3,
            &device,
        )
        .unwrap();

        let kinds: Vec<_> = extractor.layers().iter().map(|l| l.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                LayerKind::Conv,
                LayerKind::Relu,
                LayerKind::Pool,
                LayerKind::Conv,
                LayerKind::BatchNorm,
                LayerKind::Relu
            ]
        );

        let out = extractor.forward(Tensor::ones([1, 3, 8, 8], &device));
        assert_eq!(out.dims(), [1, 16, 4, 4]);

        let min_sizes: Vec<_> = extractor.layers().iter().map(|l| l.min_input_size()).collect();
        assert_eq!(min_sizes, vec![1, 1, 2, 1, 1, 1]);
    }

    #[test]
    fn relu_leaves_input_untouched() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![-1.0f32, 2.0, -3.0, 4.0], [1, 1, 2, 2]),
            &device,
        );

        let out = Layer::<TestBackend>::Relu.forward(input.clone());

        let out: Vec<f32> = out.into_data().to_vec().unwrap();
        let input: Vec<f32> = input.into_data().to_vec().unwrap();
        assert_eq!(out, vec![0.0, 2.0, 0.0, 4.0]);
        assert_eq!(input, vec![-1.0, 2.0, -3.0, 4.0]);
    }

    #[test]
    fn unrecognized_layer_builds_nothing() {
        let device = Default::default();
        let result =
            FeatureExtractor::<TestBackend>::from_layout(&["conv:3:8", "linear:8:8"], 0, &device);

        assert!(matches!(
            result,
            Err(Error::UnrecognizedLayer { index: 1, .. })
        ));
    }
}
