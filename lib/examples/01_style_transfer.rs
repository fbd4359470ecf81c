use burn::backend::{Autodiff, NdArray};
use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    let session = ns::Session::builder()
        // the image whose structure we keep
        .content(&"imgs/content.jpg")
        // the image whose textures we borrow
        .style(&"imgs/style.jpg")
        .steps(300)
        .build()?;

    // torchvision's VGG-19 `features`, converted to safetensors
    let weights = ns::pretrained_vgg19("vgg19.safetensors")?;
    let extractor = ns::FeatureExtractor::<Autodiff<NdArray>>::new(weights, &Default::default());

    let stylized = session.run(&extractor, None)?;

    println!("{:?}", stylized.report());

    //save the image to the disk
    stylized.save("out/01.png")
}
