//! The loss taps inserted into an assembled model.
//!
//! A tap is a pass-through stage, it measures the distance between whatever
//! flows through it and a target captured when the model was assembled, keeps
//! that loss around until the next evaluation, and hands its input on
//! unchanged.

use burn::tensor::{backend::Backend, Tensor};

/// The channel correlation matrix of a (batch, channels, height, width)
/// feature map, normalized by the number of elements in the map.
///
/// The spatial layout is summed away, so only texture statistics remain.
pub fn gram_matrix<B: Backend>(features: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch, channels, height, width] = features.dims();

    let features = features.reshape([batch * channels, height * width]);
    let gram = features.clone().matmul(features.transpose());

    gram.div_scalar((batch * channels * height * width) as f32)
}

fn mse<B: Backend, const D: usize>(input: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, 1> {
    let diff = input - target;
    (diff.clone() * diff).mean()
}

/// Compares feature maps directly
#[derive(Clone, Debug)]
pub struct ContentLoss<B: Backend> {
    target: Tensor<B, 4>,
    loss: Option<Tensor<B, 1>>,
}

impl<B: Backend> ContentLoss<B> {
    pub fn new(target: Tensor<B, 4>) -> Self {
        Self {
            target: target.detach(),
            loss: None,
        }
    }

    pub fn forward(&mut self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.loss = Some(mse(input.clone(), self.target.clone()));
        input
    }

    /// The loss of the most recent evaluation, `None` before the first one
    pub fn loss(&self) -> Option<Tensor<B, 1>> {
        self.loss.clone()
    }
}

/// Compares the gram matrices of feature maps
#[derive(Clone, Debug)]
pub struct StyleLoss<B: Backend> {
    target: Tensor<B, 2>,
    loss: Option<Tensor<B, 1>>,
}

impl<B: Backend> StyleLoss<B> {
    /// Captures the gram matrix of `target_features`
    pub fn new(target_features: Tensor<B, 4>) -> Self {
        Self {
            target: gram_matrix(target_features).detach(),
            loss: None,
        }
    }

    pub fn forward(&mut self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.loss = Some(mse(gram_matrix(input.clone()), self.target.clone()));
        input
    }

    /// The loss of the most recent evaluation, `None` before the first one
    pub fn loss(&self) -> Option<Tensor<B, 1>> {
        self.loss.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::{Distribution, TensorData};

    fn values<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.into_data().to_vec().unwrap()
    }

    #[test]
    fn gram_is_symmetric() {
        let device = Default::default();
        let features =
            Tensor::<TestBackend, 4>::random([2, 5, 3, 4], Distribution::Uniform(-1.0, 1.0), &device);

        let gram = gram_matrix(features);
        assert_eq!(gram.dims(), [10, 10]);

        let g = values(gram.clone());
        let gt = values(gram.transpose());
        for (a, b) in g.iter().zip(gt.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn gram_ignores_spatial_order() {
        let device = Default::default();

        // 2 channels of 4 pixels each
        let a = vec![0.1f32, 0.7, -0.3, 0.9, 0.5, -0.2, 0.4, 0.0];
        // the same pixels visited in a different order, for both channels
        let perm = [2, 0, 3, 1];
        let mut b = Vec::with_capacity(a.len());
        for c in 0..2 {
            for p in perm.iter() {
                b.push(a[c * 4 + p]);
            }
        }

        let ga = gram_matrix(Tensor::<TestBackend, 4>::from_data(
            TensorData::new(a, [1, 2, 2, 2]),
            &device,
        ));
        let gb = gram_matrix(Tensor::<TestBackend, 4>::from_data(
            TensorData::new(b, [1, 2, 2, 2]),
            &device,
        ));

        for (x, y) in values(ga).iter().zip(values(gb).iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn gram_is_normalized() {
        let device = Default::default();
        let gram = gram_matrix(Tensor::<TestBackend, 4>::ones([1, 2, 3, 3], &device));

        // every entry is the sum of 9 ones divided by 1*2*3*3
        for v in values(gram) {
            assert!((v - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn taps_pass_input_through() {
        let device = Default::default();
        let target = Tensor::<TestBackend, 4>::zeros([1, 2, 2, 2], &device);
        let input = Tensor::<TestBackend, 4>::ones([1, 2, 2, 2], &device);

        let mut content = ContentLoss::new(target.clone());
        assert!(content.loss().is_none());

        let out = content.forward(input.clone());
        assert_eq!(values(out), values(input.clone()));
        assert_eq!(values(content.loss().unwrap()), vec![1.0]);

        let mut style = StyleLoss::new(input.clone());
        let out = style.forward(input.clone());
        assert_eq!(values(out), values(input));
        assert_eq!(values(style.loss().unwrap()), vec![0.0]);

        // each evaluation overwrites the previous loss
        style.forward(target);
        assert!(values(style.loss().unwrap())[0] > 0.0);
    }
}
