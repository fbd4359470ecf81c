use burn::tensor::{backend::Backend, Tensor, TensorData};

/// Per channel mean of the images the VGG weights were trained on
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per channel standard deviation of the images the VGG weights were trained on
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// `(image - mean) / std`, broadcast over each of the 3 color channels
pub fn normalize<B: Backend>(image: Tensor<B, 4>, mean: [f32; 3], std: [f32; 3]) -> Tensor<B, 4> {
    let device = image.device();
    Normalization::new(mean, std, &device).forward(image)
}

/// The first stage of every assembled model, it maps [0,1] RGB images into
/// the input distribution the feature extractor expects
#[derive(Clone, Debug)]
pub struct Normalization<B: Backend> {
    mean: Tensor<B, 4>,
    std: Tensor<B, 4>,
}

impl<B: Backend> Normalization<B> {
    pub fn new(mean: [f32; 3], std: [f32; 3], device: &B::Device) -> Self {
        Self {
            mean: Tensor::from_data(TensorData::new(mean.to_vec(), [1, 3, 1, 1]), device),
            std: Tensor::from_data(TensorData::new(std.to_vec(), [1, 3, 1, 1]), device),
        }
    }

    pub fn imagenet(device: &B::Device) -> Self {
        Self::new(IMAGENET_MEAN, IMAGENET_STD, device)
    }

    pub fn device(&self) -> B::Device {
        self.mean.device()
    }

    pub fn forward(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        (image - self.mean.clone()) / self.std.clone()
    }
}
