//! Host side storage of the frozen feature extractor weights.
//!
//! Weights are plain `f32` buffers so they can be loaded once per process and
//! shared by reference between any number of requests, each of which uploads
//! them to its own compute device when it builds a `FeatureExtractor`.

use crate::{layers::LayerSpec, Error};
use once_cell::sync::OnceCell;
use rand::{Rng, SeedableRng};
use safetensors::{tensor::Dtype, SafeTensors};
use std::path::{Path, PathBuf};

/// The tensors of a single layer, stored in row major order with the shapes
/// given by `LayerSpec::weight_shapes`
#[derive(Clone, Debug)]
pub enum LayerParams {
    None,
    Conv {
        weight: Vec<f32>,
        bias: Vec<f32>,
    },
    BatchNorm {
        gamma: Vec<f32>,
        beta: Vec<f32>,
        running_mean: Vec<f32>,
        running_var: Vec<f32>,
    },
}

/// A layer layout together with the frozen parameters of every layer
#[derive(Clone, Debug)]
pub struct FrozenWeights {
    layout: Vec<LayerSpec>,
    params: Vec<LayerParams>,
}

static PRETRAINED_VGG19: OnceCell<(PathBuf, FrozenWeights)> = OnceCell::new();

/// Loads the VGG-19 weights at `path` the first time it is called, every
/// subsequent call returns the same weights regardless of the path passed.
pub fn pretrained_vgg19<P: AsRef<Path>>(path: P) -> Result<&'static FrozenWeights, Error> {
    load_once(&PRETRAINED_VGG19, crate::layers::vgg19_layout, path.as_ref())
}

fn load_once<'c>(
    cell: &'c OnceCell<(PathBuf, FrozenWeights)>,
    layout: impl FnOnce() -> Vec<LayerSpec>,
    path: &Path,
) -> Result<&'c FrozenWeights, Error> {
    let (loaded_from, weights) = cell.get_or_try_init(|| {
        tracing::info!(path = %path.display(), "loading VGG-19 weights");
        FrozenWeights::load(layout(), path).map(|weights| (path.to_owned(), weights))
    })?;

    if loaded_from.as_path() != path {
        tracing::warn!(
            requested = %path.display(),
            loaded = %loaded_from.display(),
            "VGG-19 weights were already loaded from a different path, reusing them"
        );
    }

    Ok(weights)
}

impl FrozenWeights {
    /// Generates He-uniform initialized weights, the same seed always yields
    /// the same weights. Batch norms are initialized to the identity.
    pub fn random(layout: Vec<LayerSpec>, seed: u64) -> Self {
        let mut rng = rand_pcg::Pcg32::seed_from_u64(seed);

        let params = layout
            .iter()
            .map(|spec| match *spec {
                LayerSpec::Conv {
                    in_channels,
                    out_channels,
                    kernel,
                    ..
                } => {
                    let fan_in = (in_channels * kernel * kernel) as f32;
                    let bound = (6.0 / fan_in).sqrt();

                    let weight = (0..out_channels * in_channels * kernel * kernel)
                        .map(|_| rng.gen_range(-bound..bound))
                        .collect();
                    let bias = (0..out_channels)
                        .map(|_| rng.gen_range(-0.01..0.01))
                        .collect();

                    LayerParams::Conv { weight, bias }
                }
                LayerSpec::BatchNorm { channels, .. } => LayerParams::BatchNorm {
                    gamma: vec![1.0; channels],
                    beta: vec![0.0; channels],
                    running_mean: vec![0.0; channels],
                    running_var: vec![1.0; channels],
                },
                LayerSpec::Relu | LayerSpec::MaxPool { .. } => LayerParams::None,
            })
            .collect();

        Self { layout, params }
    }

    /// Loads weights from a safetensors file with torchvision naming, ie. the
    /// parameters of layer `i` are `features.{i}.weight`, `features.{i}.bias`
    /// and so on.
    pub fn load(layout: Vec<LayerSpec>, path: &Path) -> Result<Self, Error> {
        let bytes = std::fs::read(path)?;
        Self::from_safetensors(layout, &bytes)
    }

    /// Same as `load`, from an in-memory safetensors buffer
    pub fn from_safetensors(layout: Vec<LayerSpec>, bytes: &[u8]) -> Result<Self, Error> {
        let tensors = SafeTensors::deserialize(bytes)?;

        let mut params = Vec::with_capacity(layout.len());
        for (index, spec) in layout.iter().enumerate() {
            let mut buffers = spec
                .weight_shapes()
                .into_iter()
                .map(|(suffix, shape)| read_tensor(&tensors, index, suffix, &shape))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter();

            let mut next = || buffers.next().unwrap_or_default();

            params.push(match spec {
                LayerSpec::Conv { .. } => LayerParams::Conv {
                    weight: next(),
                    bias: next(),
                },
                LayerSpec::BatchNorm { .. } => LayerParams::BatchNorm {
                    gamma: next(),
                    beta: next(),
                    running_mean: next(),
                    running_var: next(),
                },
                LayerSpec::Relu | LayerSpec::MaxPool { .. } => LayerParams::None,
            });
        }

        Ok(Self { layout, params })
    }

    pub fn layout(&self) -> &[LayerSpec] {
        &self.layout
    }

    /// Iterates over every layer along with its parameters
    pub fn layers(&self) -> impl Iterator<Item = (&LayerSpec, &LayerParams)> {
        self.layout.iter().zip(self.params.iter())
    }
}

fn read_tensor(
    tensors: &SafeTensors<'_>,
    index: usize,
    suffix: &str,
    shape: &[usize],
) -> Result<Vec<f32>, Error> {
    let key = format!("features.{}.{}", index, suffix);

    let view = tensors
        .tensor(&key)
        .map_err(|_| Error::MissingWeight(key.clone()))?;

    if view.dtype() != Dtype::F32 {
        return Err(Error::UnsupportedWeightType {
            key,
            dtype: format!("{:?}", view.dtype()),
        });
    }

    if view.shape() != shape {
        return Err(Error::WeightShape(crate::errors::WeightShape {
            key,
            expected: shape.to_vec(),
            actual: view.shape().to_vec(),
        }));
    }

    Ok(view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layers::parse_layout;
    use safetensors::tensor::TensorView;
    use std::collections::HashMap;

    fn to_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn later_paths_reuse_the_first_weights() {
        let layout = || parse_layout(&["conv:3:2:1"]).unwrap();

        let weight = to_bytes(&[1.0; 6]);
        let bias = to_bytes(&[0.0; 2]);

        let mut tensors = HashMap::new();
        tensors.insert(
            "features.0.weight".to_owned(),
            TensorView::new(Dtype::F32, vec![2, 3, 1, 1], &weight).unwrap(),
        );
        tensors.insert(
            "features.0.bias".to_owned(),
            TensorView::new(Dtype::F32, vec![2], &bias).unwrap(),
        );

        let path = std::env::temp_dir()
            .join(format!("neural-style-{}.safetensors", std::process::id()));
        std::fs::write(&path, safetensors::serialize(&tensors, None).unwrap()).unwrap();

        let cell = OnceCell::new();
        let first = load_once(&cell, layout, &path).unwrap();
        // the second path doesn't exist, it's never read
        let second = load_once(&cell, layout, Path::new("does/not/exist.safetensors")).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(std::ptr::eq(first, second));
        assert_eq!(cell.get().map(|(p, _)| p.as_path()), Some(path.as_path()));
    }

    #[test]
    fn random_is_deterministic() {
        let layout = parse_layout(&["conv:3:4", "relu", "bn:4"]).unwrap();

        let a = FrozenWeights::random(layout.clone(), 7);
        let b = FrozenWeights::random(layout, 7);

        match (&a.params[0], &b.params[0]) {
            (LayerParams::Conv { weight: wa, .. }, LayerParams::Conv { weight: wb, .. }) => {
                assert_eq!(wa.len(), 4 * 3 * 3 * 3);
                assert_eq!(wa, wb);
            }
            _ => panic!("expected conv params"),
        }

        assert!(matches!(a.params[1], LayerParams::None));
        assert!(matches!(a.params[2], LayerParams::BatchNorm { .. }));
    }

    #[test]
    fn loads_torchvision_names() {
        let layout = parse_layout(&["conv:3:2:1", "relu"]).unwrap();

        let weight = to_bytes(&[0.5, -1.0, 2.0, 0.25, 1.0, 1.5]);
        let bias = to_bytes(&[0.1, 0.2]);

        let mut tensors = HashMap::new();
        tensors.insert(
            "features.0.weight".to_owned(),
            TensorView::new(Dtype::F32, vec![2, 3, 1, 1], &weight).unwrap(),
        );
        tensors.insert(
            "features.0.bias".to_owned(),
            TensorView::new(Dtype::F32, vec![2], &bias).unwrap(),
        );
        let bytes = safetensors::serialize(&tensors, None).unwrap();

        let frozen = FrozenWeights::from_safetensors(layout, &bytes).unwrap();
        match &frozen.params[0] {
            LayerParams::Conv { weight, bias } => {
                assert_eq!(weight, &[0.5, -1.0, 2.0, 0.25, 1.0, 1.5]);
                assert_eq!(bias, &[0.1, 0.2]);
            }
            _ => panic!("expected conv params"),
        }
    }

    #[test]
    fn missing_and_misshaped_weights() {
        let layout = parse_layout(&["conv:3:2:1"]).unwrap();

        let weight = to_bytes(&[0.0; 6]);
        let bias = to_bytes(&[0.0; 3]);

        let mut tensors = HashMap::new();
        tensors.insert(
            "features.0.weight".to_owned(),
            TensorView::new(Dtype::F32, vec![2, 3, 1, 1], &weight).unwrap(),
        );
        let bytes = safetensors::serialize(&tensors, None).unwrap();
        match FrozenWeights::from_safetensors(layout.clone(), &bytes) {
            Err(Error::MissingWeight(key)) => assert_eq!(key, "features.0.bias"),
            other => panic!("expected a missing weight, got {:?}", other),
        }

        tensors.insert(
            "features.0.bias".to_owned(),
            TensorView::new(Dtype::F32, vec![3], &bias).unwrap(),
        );
        let bytes = safetensors::serialize(&tensors, None).unwrap();
        assert!(matches!(
            FrozenWeights::from_safetensors(layout, &bytes),
            Err(Error::WeightShape(_))
        ));
    }
}
