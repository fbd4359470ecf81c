//! The pixel optimization loop.
//!
//! The working image is the only tensor that requires gradients. Every
//! evaluation rebuilds it from the optimizer's flat pixel buffer, runs it
//! through the assembled model and hands the gradient of the weighted loss
//! back to the optimizer.

use crate::{
    errors::{NumericInstability, ShapeMismatch},
    extractor::FeatureExtractor,
    lbfgs::{Evaluation, Lbfgs, StepStatus},
    model::StyleModel,
    normalization::Normalization,
    session::{ProgressUpdate, TransferProgress},
    Error, Parameters,
};
use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    Tensor, TensorData,
};
use rand::{Rng, SeedableRng};

/// How the working image is initialized
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InitialImage {
    /// Start from a copy of the content image
    Content,
    /// Start from uniform noise in [0,1], generated from the seed
    Noise { seed: u64 },
}

impl Default for InitialImage {
    fn default() -> Self {
        Self::Content
    }
}

/// The weighted style and content losses of a single evaluation
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct LossScores {
    pub style: f64,
    pub content: f64,
}

impl LossScores {
    pub fn total(&self) -> f64 {
        self.style + self.content
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferState {
    /// The gradient vanished before the step budget ran out
    Converged,
    MaxStepsReached,
}

/// Summary of a finished run
#[derive(Clone, Debug)]
pub struct TransferReport {
    /// The number of times the model was evaluated
    pub steps: usize,
    pub state: TransferState,
    /// The scores of the very first evaluation
    pub initial: LossScores,
    /// The scores of the returned image
    pub last: LossScores,
}

/// The result of `run_style_transfer`
pub struct Transfer<B: Backend> {
    /// The stylized image, (1, 3, R, R) with every value in [0,1]
    pub image: Tensor<B, 4>,
    pub report: TransferReport,
}

pub(crate) fn tensor_to_vec<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
) -> Result<Vec<f32>, Error> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| Error::TensorData(format!("{:?}", err)))
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> Result<f64, Error> {
    let values = tensor_to_vec(tensor)?;
    values
        .first()
        .map(|v| f64::from(*v))
        .ok_or_else(|| Error::TensorData("expected a scalar".to_owned()))
}

fn clamp(pixels: &mut [f32]) {
    for p in pixels.iter_mut() {
        *p = p.max(0.0).min(1.0);
    }
}

struct Evaluator<'m, 'a, B: AutodiffBackend> {
    model: &'m mut StyleModel<'a, B>,
    device: B::Device,
    shape: [usize; 4],
    style_weight: f64,
    content_weight: f64,
    max_steps: usize,
    report_every: usize,
    progress: Option<Box<dyn TransferProgress>>,
    step: usize,
    initial: Option<LossScores>,
}

impl<'m, 'a, B: AutodiffBackend> Evaluator<'m, 'a, B> {
    fn image(&self, pixels: &[f32]) -> Tensor<B, 4> {
        Tensor::from_data(TensorData::new(pixels.to_vec(), self.shape), &self.device)
    }

    fn scores(&self) -> Result<(LossScores, Tensor<B, 1>), Error> {
        let (style, content) = self
            .model
            .weighted_losses(self.style_weight, self.content_weight);

        let scores = LossScores {
            style: scalar(style.clone())?,
            content: scalar(content.clone())?,
        };

        Ok((scores, style + content))
    }

    fn evaluate(&mut self, pixels: &mut [f32]) -> Result<Evaluation, Error> {
        clamp(pixels);

        let image = self.image(pixels).require_grad();
        self.model.forward(image.clone());
        let (scores, total) = self.scores()?;

        self.step += 1;

        if !scores.total().is_finite() {
            return Err(Error::NumericInstability(NumericInstability {
                step: self.step,
                style_score: scores.style,
                content_score: scores.content,
            }));
        }

        if self.initial.is_none() {
            self.initial = Some(scores);
        }

        let grads = total.backward();
        let gradient = match image.grad(&grads) {
            Some(grad) => tensor_to_vec(grad)?,
            None => vec![0.0; pixels.len()],
        };

        if self.step % self.report_every == 0 {
            tracing::info!(
                step = self.step,
                style = scores.style,
                content = scores.content,
                "run {}: style loss {:.4} content loss {:.4}",
                self.step,
                scores.style,
                scores.content
            );
        }

        if let Some(progress) = &mut self.progress {
            progress.update(ProgressUpdate {
                step: self.step,
                max_steps: self.max_steps,
                scores,
            });
        }

        Ok(Evaluation {
            loss: scores.total(),
            gradient,
        })
    }
}

/// Optimizes a copy of `content` until its features match the content
/// features of `content` and the style statistics of `style`.
///
/// Both images must be (1, 3, R, R) tensors in [0,1] on the extractor's
/// device, where R is the configured resolution.
pub fn run_style_transfer<B: AutodiffBackend>(
    extractor: &FeatureExtractor<B>,
    content: Tensor<B, 4>,
    style: Tensor<B, 4>,
    params: &Parameters,
    progress: Option<Box<dyn TransferProgress>>,
) -> Result<Transfer<B>, Error> {
    let res = params.resolution as usize;
    let shape = [1, 3, res, res];

    if content.dims() != shape {
        return Err(Error::ShapeMismatch(ShapeMismatch {
            name: "content image".to_owned(),
            expected: shape,
            actual: content.dims(),
        }));
    }

    if style.dims() != shape {
        return Err(Error::ShapeMismatch(ShapeMismatch {
            name: "style image".to_owned(),
            expected: shape,
            actual: style.dims(),
        }));
    }

    let device = extractor.device().clone();

    let mut pixels = match params.initial_image {
        InitialImage::Content => tensor_to_vec(content.clone())?,
        InitialImage::Noise { seed } => {
            let mut rng = rand_pcg::Pcg32::seed_from_u64(seed);
            (0..3 * res * res).map(|_| rng.gen::<f32>()).collect()
        }
    };

    let mut model = StyleModel::assemble(
        extractor,
        Normalization::new(params.mean, params.std, &device),
        &params.taps,
        content,
        style,
    )?;

    tracing::debug!(
        max_steps = params.max_steps,
        style_weight = params.style_weight,
        content_weight = params.content_weight,
        "optimizing"
    );

    let mut lbfgs = Lbfgs::new(params.lbfgs.clone());
    let mut evaluator = Evaluator {
        model: &mut model,
        device,
        shape,
        style_weight: params.style_weight,
        content_weight: params.content_weight,
        max_steps: params.max_steps,
        report_every: params.report_every.max(1),
        progress,
        step: 0,
        initial: None,
    };

    let mut state = TransferState::MaxStepsReached;
    while evaluator.step <= params.max_steps {
        let status = lbfgs.step(&mut pixels, |x| evaluator.evaluate(x))?;

        if status == StepStatus::Converged {
            tracing::debug!(step = evaluator.step, "gradient vanished");
            state = TransferState::Converged;
            break;
        }
    }

    clamp(&mut pixels);

    // The optimizer may have moved the pixels after their last evaluation
    let image = evaluator.image(&pixels);
    evaluator.model.forward(image.clone().detach());
    let (last, _) = evaluator.scores()?;

    let report = TransferReport {
        steps: evaluator.step,
        state,
        initial: evaluator.initial.unwrap_or(last),
        last,
    };

    tracing::info!(
        steps = report.steps,
        style = last.style,
        content = last.content,
        "style transfer finished"
    );

    Ok(Transfer {
        image: image.detach(),
        report,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{lbfgs::LineSearch, model::Taps, TestBackend};

    const LAYOUT: &[&str] = &["conv:3:4", "relu", "conv:4:8", "relu", "conv:8:8", "relu"];

    fn solid(rgb: [f32; 3], res: usize) -> Tensor<TestBackend, 4> {
        let values = rgb
            .iter()
            .flat_map(|c| std::iter::repeat(*c).take(res * res))
            .collect::<Vec<_>>();
        Tensor::from_data(TensorData::new(values, [1, 3, res, res]), &Default::default())
    }

    fn params(res: u32) -> Parameters {
        let mut params = Parameters {
            resolution: res,
            max_steps: 5,
            taps: Taps {
                content: vec!["conv_2".to_owned()],
                style: vec!["conv_1".to_owned(), "conv_2".to_owned(), "conv_3".to_owned()],
            },
            ..Parameters::default()
        };
        params.lbfgs.line_search = LineSearch::Backtracking;
        params
    }

    #[test]
    fn wrong_resolution_is_rejected() {
        let extractor =
            FeatureExtractor::<TestBackend>::from_layout(LAYOUT, 1, &Default::default()).unwrap();

        let result = run_style_transfer(
            &extractor,
            solid([1.0, 0.0, 0.0], 4),
            solid([0.0, 0.0, 1.0], 8),
            &params(4),
            None,
        );

        match result {
            Err(Error::ShapeMismatch(sm)) => assert_eq!(sm.name, "style image"),
            _ => panic!("expected a shape mismatch"),
        }
    }

    #[test]
    fn output_is_clamped_and_loss_decreases() {
        let extractor =
            FeatureExtractor::<TestBackend>::from_layout(LAYOUT, 1, &Default::default()).unwrap();

        let transfer = run_style_transfer(
            &extractor,
            solid([1.0, 0.0, 0.0], 4),
            solid([0.0, 0.0, 1.0], 4),
            &params(4),
            None,
        )
        .unwrap();

        let pixels = tensor_to_vec(transfer.image).unwrap();
        assert!(pixels.iter().all(|p| (0.0..=1.0).contains(p)));

        let report = transfer.report;
        assert!(report.steps > 5 || report.state == TransferState::Converged);
        assert!(report.last.total() < report.initial.total());
    }

    #[test]
    fn progress_sees_every_evaluation() {
        use std::sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        };

        let extractor =
            FeatureExtractor::<TestBackend>::from_layout(LAYOUT, 1, &Default::default()).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);

        let transfer = run_style_transfer(
            &extractor,
            solid([1.0, 0.0, 0.0], 4),
            solid([0.0, 0.0, 1.0], 4),
            &params(4),
            Some(Box::new(move |update: ProgressUpdate| {
                assert_eq!(update.max_steps, 5);
                counter.store(update.step, Ordering::SeqCst);
            })),
        )
        .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), transfer.report.steps);
    }

    #[test]
    fn noise_init_is_seeded() {
        let extractor =
            FeatureExtractor::<TestBackend>::from_layout(LAYOUT, 1, &Default::default()).unwrap();

        let run = |seed| {
            let mut params = params(4);
            params.initial_image = InitialImage::Noise { seed };
            params.max_steps = 0;
            params.lbfgs.max_iter = 1;

            let transfer = run_style_transfer(
                &extractor,
                solid([0.5, 0.5, 0.5], 4),
                solid([0.0, 0.0, 1.0], 4),
                &params,
                None,
            )
            .unwrap();
            tensor_to_vec(transfer.image).unwrap()
        };

        assert_eq!(run(3), run(3));
        assert_ne!(run(3), run(4));
    }
}
