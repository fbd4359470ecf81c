use crate::{
    errors::ShapeMismatch,
    extractor::{FeatureExtractor, Layer},
    layers::LayerKind,
    losses::{ContentLoss, StyleLoss},
    normalization::Normalization,
    Error,
};
use burn::tensor::{backend::Backend, Tensor};
use std::collections::HashSet;

/// The layers after which content and style loss taps are inserted, layers
/// are named `{kind}_{n}` where `n` is the number of convolutions up to and
/// including that layer, eg. `conv_1`, `relu_1`, `pool_2`, `bn_4`.
#[derive(Clone, Debug, PartialEq)]
pub struct Taps {
    pub content: Vec<String>,
    pub style: Vec<String>,
}

impl Default for Taps {
    fn default() -> Self {
        Self {
            content: vec!["conv_3".to_owned()],
            style: (1..=5).map(|i| format!("conv_{}", i)).collect(),
        }
    }
}

impl Taps {
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.style.is_empty()
    }
}

enum Stage<'a, B: Backend> {
    Normalize,
    Layer(&'a Layer<B>),
    Content(usize),
    Style(usize),
}

/// A normalization stage followed by the frozen layers of a feature extractor,
/// instrumented with loss taps and truncated after the deepest tap.
///
/// The layers are borrowed from the extractor, only the normalization and the
/// taps (and their captured targets) belong to the model.
pub struct StyleModel<'a, B: Backend> {
    normalization: Normalization<B>,
    stages: Vec<(String, Stage<'a, B>)>,
    content_losses: Vec<ContentLoss<B>>,
    style_losses: Vec<StyleLoss<B>>,
}

impl<'a, B: Backend> StyleModel<'a, B> {
    /// Walks the layers of `extractor`, capturing content targets from
    /// `content` and style targets from `style` at every configured tap.
    pub fn assemble(
        extractor: &'a FeatureExtractor<B>,
        normalization: Normalization<B>,
        taps: &Taps,
        content: Tensor<B, 4>,
        style: Tensor<B, 4>,
    ) -> Result<Self, Error> {
        if taps.is_empty() {
            return Err(Error::NoLossTaps);
        }

        if content.dims() != style.dims() {
            return Err(Error::ShapeMismatch(ShapeMismatch {
                name: "style image".to_owned(),
                expected: content.dims(),
                actual: style.dims(),
            }));
        }

        let content_taps: HashSet<&str> = taps.content.iter().map(String::as_str).collect();
        let style_taps: HashSet<&str> = taps.style.iter().map(String::as_str).collect();
        let mut pending = content_taps.len() + style_taps.len();

        let mut model = Self {
            stages: vec![("normalization".to_owned(), Stage::Normalize)],
            content_losses: Vec::with_capacity(content_taps.len()),
            style_losses: Vec::with_capacity(style_taps.len()),
            normalization,
        };

        // Taps are pass-through, so running both images alongside the walk
        // gives the same features as re-evaluating the partial model at
        // every tap
        let mut content_features = model.normalization.forward(content.detach());
        let mut style_features = model.normalization.forward(style.detach());

        // Consecutive layers without a convolution in between share a name,
        // a tap belongs to the first of them
        let mut visited = HashSet::new();

        let mut convs = 0;
        for layer in extractor.layers() {
            if layer.kind() == LayerKind::Conv {
                convs += 1;
            }

            let name = format!("{}_{}", layer.kind().prefix(), convs);
            model.stages.push((name.clone(), Stage::Layer(layer)));

            // Nothing past the deepest tap survives truncation
            if pending == 0 {
                continue;
            }

            let [n, c, h, w] = content_features.dims();
            let min = layer.min_input_size();
            if h < min || w < min {
                return Err(Error::ShapeMismatch(ShapeMismatch {
                    name: format!("input of {}", name),
                    expected: [n, c, min, min],
                    actual: [n, c, h, w],
                }));
            }

            content_features = layer.forward(content_features);
            style_features = layer.forward(style_features);

            if !visited.insert(name.clone()) {
                continue;
            }

            if content_taps.contains(name.as_str()) {
                tracing::debug!(layer = %name, "inserting content loss");

                model
                    .content_losses
                    .push(ContentLoss::new(content_features.clone()));
                model.stages.push((
                    format!("content_loss_{}", convs),
                    Stage::Content(model.content_losses.len() - 1),
                ));
                pending -= 1;
            }

            if style_taps.contains(name.as_str()) {
                tracing::debug!(layer = %name, "inserting style loss");

                model
                    .style_losses
                    .push(StyleLoss::new(style_features.clone()));
                model.stages.push((
                    format!("style_loss_{}", convs),
                    Stage::Style(model.style_losses.len() - 1),
                ));
                pending -= 1;
            }
        }

        if pending != 0 {
            let reached: HashSet<&str> = model.stages.iter().map(|(n, _)| n.as_str()).collect();
            let missing = taps
                .content
                .iter()
                .chain(taps.style.iter())
                .find(|t| !reached.contains(t.as_str()))
                .cloned()
                .unwrap_or_default();

            return Err(Error::UnknownTap(missing));
        }

        let last_tap = model
            .stages
            .iter()
            .rposition(|(_, stage)| matches!(stage, Stage::Content(_) | Stage::Style(_)))
            .ok_or(Error::NoLossTaps)?;
        model.stages.truncate(last_tap + 1);

        tracing::debug!(
            stages = model.stages.len(),
            content_taps = model.content_losses.len(),
            style_taps = model.style_losses.len(),
            "assembled style model"
        );

        Ok(model)
    }

    /// Evaluates the model on `image`, refreshing the loss of every tap
    pub fn forward(&mut self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = image;

        for (_, stage) in &self.stages {
            x = match stage {
                Stage::Normalize => self.normalization.forward(x),
                Stage::Layer(layer) => layer.forward(x),
                Stage::Content(i) => self.content_losses[*i].forward(x),
                Stage::Style(i) => self.style_losses[*i].forward(x),
            };
        }

        x
    }

    /// The names of every stage, in evaluation order
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|(name, _)| name.as_str())
    }

    pub fn content_losses(&self) -> &[ContentLoss<B>] {
        &self.content_losses
    }

    pub fn style_losses(&self) -> &[StyleLoss<B>] {
        &self.style_losses
    }

    /// The weighted sums of the style and the content losses of the most
    /// recent evaluation
    pub fn weighted_losses(
        &self,
        style_weight: f64,
        content_weight: f64,
    ) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let device = self.normalization.device();

        let style = self
            .style_losses
            .iter()
            .filter_map(StyleLoss::loss)
            .fold(Tensor::zeros([1], &device), |acc, l| acc + l);
        let content = self
            .content_losses
            .iter()
            .filter_map(ContentLoss::loss)
            .fold(Tensor::zeros([1], &device), |acc, l| acc + l);

        (style.mul_scalar(style_weight), content.mul_scalar(content_weight))
    }
}
