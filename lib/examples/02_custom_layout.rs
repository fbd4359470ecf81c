use burn::backend::{Autodiff, NdArray};
use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    // A small VGG-like network with random weights, which still captures
    // enough texture to be a useful style descriptor
    let extractor = ns::FeatureExtractor::<Autodiff<NdArray>>::from_layout(
        &[
            "conv:3:32", "relu", "conv:32:32", "bn:32", "relu", "pool", "conv:32:64", "relu",
            "conv:64:64", "relu",
        ],
        42,
        &Default::default(),
    )?;

    let session = ns::Session::builder()
        .content(&"imgs/content.jpg")
        .style(&"imgs/style.jpg")
        .resolution(128)
        // names follow the number of convolutions seen so far
        .content_layers(vec!["relu_3"])
        .style_layers(vec!["conv_1", "bn_2", "conv_3", "conv_4"])
        .initial_image(ns::InitialImage::Noise { seed: 7 })
        .line_search(ns::LineSearch::Backtracking)
        .steps(200)
        .build()?;

    let stylized = session.run(
        &extractor,
        Some(Box::new(|update: ns::ProgressUpdate| {
            if update.step % 20 == 0 {
                println!(
                    "{}/{} style: {:.4} content: {:.4}",
                    update.step, update.max_steps, update.scores.style, update.scores.content
                );
            }
        })),
    )?;

    stylized.save("out/02.png")
}
